use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub type ClusterId = u32;
pub type NodeId = u32;

/// Cluster-level state. The names are what operator tooling sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Offline,
    Normal,
    Repairing,
    Failover,
    Checking,
    Failed,
}

impl ClusterState {
    pub const ALL: [ClusterState; 6] = [
        ClusterState::Offline,
        ClusterState::Normal,
        ClusterState::Repairing,
        ClusterState::Failover,
        ClusterState::Checking,
        ClusterState::Failed,
    ];

    /// Integer code stored by existing metadata databases
    pub fn code(self) -> i32 {
        match self {
            ClusterState::Offline => 0,
            ClusterState::Normal => 1,
            ClusterState::Repairing => 2,
            ClusterState::Failover => 3,
            ClusterState::Checking => 4,
            ClusterState::Failed => -1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::Offline => "OFFLINE",
            ClusterState::Normal => "NORMAL",
            ClusterState::Repairing => "REPAIRING",
            ClusterState::Failover => "FAILOVER",
            ClusterState::Checking => "CHECKING",
            ClusterState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Transition table. Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: ClusterState) -> bool {
        use ClusterState::*;
        if self == next {
            return true;
        }
        match self {
            Offline => matches!(next, Normal | Repairing),
            Normal => matches!(next, Checking | Repairing | Offline | Failed),
            Checking => matches!(next, Normal | Failover | Failed),
            Failover => matches!(next, Normal | Failed),
            Repairing => matches!(next, Normal | Offline | Failed),
            Failed => matches!(next, Normal | Offline | Repairing),
        }
    }

    /// A structural operation currently owns the cluster
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ClusterState::Repairing | ClusterState::Failover | ClusterState::Checking
        )
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    #[default]
    Unknown,
    Normal,
    Fault,
    Failover,
    Switching,
    Repairing,
}

impl NodeState {
    pub fn code(self) -> i32 {
        match self {
            NodeState::Unknown => 0,
            NodeState::Normal => 1,
            NodeState::Fault => 2,
            NodeState::Failover => 3,
            NodeState::Switching => 4,
            NodeState::Repairing => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Unknown => "UNKNOWN",
            NodeState::Normal => "NORMAL",
            NodeState::Fault => "FAULT",
            NodeState::Failover => "FAILOVER",
            NodeState::Switching => "SWITCHING",
            NodeState::Repairing => "REPAIRING",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DbState {
    #[default]
    Running,
    Stop,
    Fault,
    Creating,
    Repairing,
}

impl DbState {
    pub fn code(self) -> i32 {
        match self {
            DbState::Running => 0,
            DbState::Stop => 1,
            DbState::Fault => -1,
            DbState::Creating => 2,
            DbState::Repairing => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbState::Running => "RUNNING",
            DbState::Stop => "STOP",
            DbState::Fault => "FAULT",
            DbState::Creating => "CREATING",
            DbState::Repairing => "REPAIRING",
        }
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    /// Streaming replication
    #[default]
    Replication,
    /// Shared storage (PolarDB)
    SharedStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolarRole {
    Master,
    Reader,
    Standby,
}

/// Shared-storage metadata of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolarInfo {
    pub role: PolarRole,
    /// Fencing command run before another node takes over the shared volume
    #[serde(default)]
    pub reset_cmd: Option<String>,
}

/// Failure domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Room {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vip: Option<String>,
    #[serde(default)]
    pub read_vip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_db")]
    pub db_name: String,
    #[serde(default = "default_probe_sql")]
    pub primary_sql: String,
    #[serde(default = "default_probe_sql")]
    pub standby_sql: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_retry_cnt")]
    pub retry_cnt: u32,
    #[serde(default = "default_probe_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
}

fn default_probe_db() -> String {
    "template1".to_string()
}

fn default_probe_sql() -> String {
    "/* cs_ha_check */ SELECT 1".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_probe_retry_cnt() -> u32 {
    2
}

fn default_probe_retry_interval_ms() -> u64 {
    4_000
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            db_name: default_probe_db(),
            primary_sql: default_probe_sql(),
            standby_sql: default_probe_sql(),
            timeout_ms: default_probe_timeout_ms(),
            retry_cnt: default_probe_retry_cnt(),
            retry_interval_ms: default_probe_retry_interval_ms(),
            interval_ms: default_probe_interval_ms(),
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// User database function called around topology changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub db_name: String,
    pub function: String,
}

/// Cluster record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ClusterKind,
    #[serde(default)]
    pub vip: Option<String>,
    #[serde(default)]
    pub read_vip: Option<String>,
    #[serde(default)]
    pub read_vip_host: Option<String>,
    /// Load balancer addresses (`host:port`)
    #[serde(default)]
    pub lb_list: Vec<String>,
    #[serde(default)]
    pub rooms: BTreeMap<String, Room>,
    #[serde(default = "default_room_id")]
    pub current_room: String,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub trigger: Option<TriggerSettings>,
    #[serde(default)]
    pub db_user: String,
    #[serde(default)]
    pub db_pass: String,
    #[serde(default = "default_cluster_state")]
    pub state: ClusterState,
    /// Allow failover into another room
    #[serde(default)]
    pub auto_failover: bool,
    #[serde(default)]
    pub auto_failback: bool,
    #[serde(default)]
    pub failover_keep_cascaded: bool,
    #[serde(default)]
    pub ignore_reset_cmd_return_code: bool,
}

pub fn default_room_id() -> String {
    "0".to_string()
}

fn default_cluster_state() -> ClusterState {
    ClusterState::Offline
}

impl Cluster {
    pub fn new(id: ClusterId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ClusterKind::Replication,
            vip: None,
            read_vip: None,
            read_vip_host: None,
            lb_list: Vec::new(),
            rooms: BTreeMap::new(),
            current_room: default_room_id(),
            probe: ProbeSettings::default(),
            trigger: None,
            db_user: String::new(),
            db_pass: String::new(),
            state: ClusterState::Offline,
            auto_failover: false,
            auto_failback: false,
            failover_keep_cascaded: false,
            ignore_reset_cmd_return_code: false,
        }
    }

    /// Write VIP for a room, falling back to the cluster-wide one.
    pub fn write_vip_for(&self, room_id: &str) -> Option<&str> {
        self.rooms
            .get(room_id)
            .and_then(|r| r.vip.as_deref())
            .or(self.vip.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn write_vip(&self) -> Option<&str> {
        self.write_vip_for(&self.current_room)
    }

    pub fn read_vip_for(&self, room_id: &str) -> Option<&str> {
        self.rooms
            .get(room_id)
            .and_then(|r| r.read_vip.as_deref())
            .or(self.read_vip.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn read_vip(&self) -> Option<&str> {
        self.read_vip_for(&self.current_room)
    }
}

/// Repair options used by failback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FailbackOptions {
    #[serde(default)]
    pub is_rewind: bool,
    #[serde(default)]
    pub is_rebuild: bool,
    /// Delete the stale data directory instead of renaming it
    #[serde(default)]
    pub rm_pgdata: bool,
}

/// Database instance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub pgdata: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub up_db_id: Option<NodeId>,
    #[serde(default = "default_node_state")]
    pub state: NodeState,
    #[serde(default)]
    pub db_state: DbState,
    #[serde(default)]
    pub repl_app_name: String,
    #[serde(default)]
    pub repl_user: String,
    #[serde(default)]
    pub repl_pass: String,
    /// Lower is preferred for promotion
    #[serde(default)]
    pub score: i32,
    #[serde(default = "default_room_id")]
    pub room_id: String,
    #[serde(default)]
    pub polar: Option<PolarInfo>,
    #[serde(default)]
    pub failback_count: u32,
    #[serde(default)]
    pub failback: FailbackOptions,
}

fn default_port() -> u16 {
    5432
}

fn default_node_state() -> NodeState {
    NodeState::Normal
}

impl Node {
    pub fn new(
        id: NodeId,
        cluster_id: ClusterId,
        host: impl Into<String>,
        pgdata: impl Into<String>,
    ) -> Self {
        let host = host.into();
        Self {
            id,
            cluster_id,
            repl_app_name: format!("stb{}", id),
            host,
            port: default_port(),
            pgdata: pgdata.into(),
            is_primary: false,
            up_db_id: None,
            state: NodeState::Normal,
            db_state: DbState::Running,
            repl_user: String::new(),
            repl_pass: String::new(),
            score: 0,
            room_id: default_room_id(),
            polar: None,
            failback_count: 0,
            failback: FailbackOptions::default(),
        }
    }

    /// `host:port`, also the load balancer backend address
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_normal(&self) -> bool {
        self.state == NodeState::Normal
    }

    pub fn polar_role(&self) -> Option<PolarRole> {
        self.polar.as_ref().map(|p| p.role)
    }
}

/// Everything the engines need about one cluster at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub cluster: Cluster,
    pub nodes: Vec<Node>,
}

impl Topology {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The primary in NORMAL state, if any
    pub fn normal_primary(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_primary && n.is_normal())
    }

    pub fn primary(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_primary)
    }

    /// Direct downstream nodes of `id`
    pub fn children_of(&self, id: NodeId) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.up_db_id == Some(id))
            .collect()
    }

    pub fn normal_standbys(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_primary && n.is_normal())
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.nodes.iter().map(|n| n.host.clone()).collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_state_names_are_verbatim() {
        let json = serde_json::to_string(&ClusterState::Checking).unwrap();
        assert_eq!(json, "\"CHECKING\"");
        let back: ClusterState = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(back, ClusterState::Failed);
        assert_eq!(serde_json::to_string(&NodeState::Fault).unwrap(), "\"FAULT\"");
        assert_eq!(serde_json::to_string(&DbState::Running).unwrap(), "\"RUNNING\"");
    }

    #[test]
    fn test_cluster_state_codes() {
        for state in ClusterState::ALL {
            assert_eq!(ClusterState::from_code(state.code()), Some(state));
            assert_eq!(ClusterState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ClusterState::Failed.code(), -1);
        assert_eq!(ClusterState::from_code(42), None);
    }

    #[test]
    fn test_transition_table() {
        use ClusterState::*;
        assert!(Normal.can_transition_to(Checking));
        assert!(Checking.can_transition_to(Failover));
        assert!(Failover.can_transition_to(Failed));
        assert!(Offline.can_transition_to(Repairing));
        assert!(!Offline.can_transition_to(Checking));
        assert!(!Checking.can_transition_to(Repairing));
        assert!(!Failover.can_transition_to(Checking));
    }

    #[test]
    fn test_room_vip_override() {
        let mut cluster = Cluster::new(1, "c1");
        cluster.vip = Some("10.0.0.100".into());
        cluster.rooms.insert(
            "2".into(),
            Room {
                name: "dc2".into(),
                vip: Some("10.1.0.100".into()),
                read_vip: None,
            },
        );
        assert_eq!(cluster.write_vip(), Some("10.0.0.100"));
        assert_eq!(cluster.write_vip_for("2"), Some("10.1.0.100"));
        assert_eq!(cluster.read_vip_for("2"), None);
    }

    #[test]
    fn test_topology_queries() {
        let mut p = Node::new(1, 1, "h1", "/pg");
        p.is_primary = true;
        let mut s1 = Node::new(2, 1, "h2", "/pg");
        s1.up_db_id = Some(1);
        let mut s2 = Node::new(3, 1, "h3", "/pg");
        s2.up_db_id = Some(2);
        s2.state = NodeState::Fault;
        let topo = Topology {
            cluster: Cluster::new(1, "c1"),
            nodes: vec![p, s1, s2],
        };
        assert_eq!(topo.normal_primary().map(|n| n.id), Some(1));
        assert_eq!(topo.children_of(2).len(), 1);
        assert_eq!(topo.normal_standbys().count(), 1);
        assert_eq!(topo.hosts(), vec!["h1", "h2", "h3"]);
    }
}
