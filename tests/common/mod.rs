//! In-process fakes of agents, probes and load balancers for engine tests.
#![allow(dead_code)]

use async_trait::async_trait;
use pgha::agent::{
    AgentConnector, BuildStandbyParams, DbEndpoint, DbProbe, Fencer, LoadBalancer, Lsn,
    NodeControl, Pinger, Reply, TriggerCall, UpstreamConfig,
};
use pgha::error::{PghaError, Result};
use pgha::ha::{HaContext, HaSettings};
use pgha::meta::{Cluster, ClusterState, MemoryMetaStore, MetaStore, Node, NodeId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const VIP: &str = "10.0.0.100";
pub const LB: &str = "lb1:8080";

fn refused(host: &str) -> PghaError {
    PghaError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        format!("agent on {} refused connection", host),
    ))
}

#[derive(Default)]
struct AgentState {
    unreachable: HashSet<String>,
    /// `(host, op)` pairs that reply with a negative status
    failing: HashSet<(String, String)>,
    ops: Vec<(String, String)>,
    vips: HashSet<(String, String)>,
    missing_paths: HashSet<String>,
    not_ready: HashSet<String>,
    upstreams: HashMap<String, String>,
}

/// Records every operation sent to any host
#[derive(Clone, Default)]
pub struct FakeAgents {
    state: Arc<Mutex<AgentState>>,
}

impl FakeAgents {
    fn with<T>(&self, f: impl FnOnce(&mut AgentState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.with(|s| {
            if unreachable {
                s.unreachable.insert(host.to_string());
            } else {
                s.unreachable.remove(host);
            }
        });
    }

    pub fn fail_op(&self, host: &str, op: &str) {
        self.with(|s| s.failing.insert((host.to_string(), op.to_string())));
    }

    pub fn set_missing_path(&self, path: &str) {
        self.with(|s| s.missing_paths.insert(path.to_string()));
    }

    pub fn set_not_ready(&self, host: &str) {
        self.with(|s| s.not_ready.insert(host.to_string()));
    }

    pub fn put_vip(&self, host: &str, vip: &str) {
        self.with(|s| s.vips.insert((host.to_string(), vip.to_string())));
    }

    pub fn has_vip(&self, host: &str, vip: &str) -> bool {
        self.with(|s| s.vips.contains(&(host.to_string(), vip.to_string())))
    }

    /// Operations sent to `host`, in order
    pub fn ops_on(&self, host: &str) -> Vec<String> {
        self.with(|s| {
            s.ops
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, op)| op.clone())
                .collect()
        })
    }

    pub fn did(&self, host: &str, op: &str) -> bool {
        self.ops_on(host).iter().any(|o| o == op)
    }

    /// Every `(host, op)` in order
    pub fn all_ops(&self) -> Vec<(String, String)> {
        self.with(|s| s.ops.clone())
    }

    /// Host the standby on `host` was last repointed to
    pub fn upstream_of(&self, host: &str) -> Option<String> {
        self.with(|s| s.upstreams.get(host).cloned())
    }
}

#[async_trait]
impl AgentConnector for FakeAgents {
    async fn connect(&self, host: &str) -> Result<Arc<dyn NodeControl>> {
        if self.with(|s| s.unreachable.contains(host)) {
            return Err(refused(host));
        }
        Ok(Arc::new(FakeNode {
            host: host.to_string(),
            agents: self.clone(),
        }))
    }
}

pub struct FakeNode {
    host: String,
    agents: FakeAgents,
}

impl FakeNode {
    fn record(&self, op: &str) -> Reply {
        self.agents.with(|s| {
            s.ops.push((self.host.clone(), op.to_string()));
            if s.failing.contains(&(self.host.clone(), op.to_string())) {
                Reply::error(-1, format!("{} failed on {}", op, self.host))
            } else {
                Reply::ok()
            }
        })
    }
}

#[async_trait]
impl NodeControl for FakeNode {
    async fn is_running(&self, _pgdata: &str) -> Result<bool> {
        Ok(self.record("is_running").is_ok())
    }

    async fn start(&self, _pgdata: &str) -> Result<Reply> {
        Ok(self.record("start"))
    }

    async fn stop(&self, _pgdata: &str, _wait_time: u64) -> Result<Reply> {
        Ok(self.record("stop"))
    }

    async fn restart(&self, _pgdata: &str) -> Result<Reply> {
        Ok(self.record("restart"))
    }

    async fn reload(&self, _pgdata: &str) -> Result<Reply> {
        Ok(self.record("reload"))
    }

    async fn promote(&self, _pgdata: &str) -> Result<Reply> {
        Ok(self.record("promote"))
    }

    async fn is_ready(&self, _pgdata: &str, _port: u16) -> Result<bool> {
        self.record("is_ready");
        Ok(!self.agents.with(|s| s.not_ready.contains(&self.host)))
    }

    async fn pgdata_version(&self, _pgdata: &str) -> Result<u32> {
        self.record("pgdata_version");
        Ok(14)
    }

    async fn rewind(&self, _pgdata: &str, _source: &UpstreamConfig) -> Result<Reply> {
        Ok(self.record("rewind"))
    }

    async fn pause_replica_receive(&self, _pgdata: &str, _port: u16) -> Result<Reply> {
        Ok(self.record("pause_replica_receive"))
    }

    async fn change_upstream(&self, _pgdata: &str, upstream: &UpstreamConfig) -> Result<Reply> {
        let reply = self.record("change_upstream");
        if reply.is_ok() {
            let host = upstream.host.clone();
            self.agents
                .with(|s| s.upstreams.insert(self.host.clone(), host));
        }
        Ok(reply)
    }

    async fn build_standby(&self, params: &BuildStandbyParams) -> Result<Reply> {
        let reply = self.record("build_standby");
        if reply.is_ok() {
            let host = params.upstream.host.clone();
            self.agents
                .with(|s| s.upstreams.insert(self.host.clone(), host));
        }
        Ok(reply)
    }

    async fn vip_exists(&self, vip: &str) -> Result<bool> {
        self.record("vip_exists");
        Ok(self.agents.has_vip(&self.host, vip))
    }

    async fn add_vip(&self, vip: &str) -> Result<Reply> {
        let reply = self.record("add_vip");
        if reply.is_ok() {
            self.agents.put_vip(&self.host, vip);
        }
        Ok(reply)
    }

    async fn del_vip(&self, vip: &str) -> Result<Reply> {
        let reply = self.record("del_vip");
        if reply.is_ok() {
            self.agents
                .with(|s| s.vips.remove(&(self.host.clone(), vip.to_string())));
        }
        Ok(reply)
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        self.record("path_exists");
        Ok(!self.agents.with(|s| s.missing_paths.contains(path)))
    }

    async fn cp_delay_wal_from(
        &self,
        src_host: &str,
        _src_pgdata: &str,
        _pgdata: &str,
    ) -> Result<Reply> {
        Ok(self.record(&format!("cp_delay_wal_from:{}", src_host)))
    }

    async fn set_sync_mode(&self, _pgdata: &str, sync: bool) -> Result<Reply> {
        Ok(self.record(if sync { "set_sync" } else { "set_async" }))
    }

    async fn remove_pgdata(&self, _pgdata: &str, rename_to: Option<&str>) -> Result<Reply> {
        Ok(self.record(if rename_to.is_some() {
            "rename_pgdata"
        } else {
            "remove_pgdata"
        }))
    }
}

#[derive(Default)]
struct ProbeState {
    failing: HashSet<String>,
    /// Health probes of a host that fail before it answers again
    fail_next: HashMap<String, usize>,
    lsn: HashMap<String, u64>,
    wal_file: Option<String>,
    streaming: HashSet<String>,
    triggers: Vec<(String, TriggerCall)>,
    trigger_fails: bool,
    probes: usize,
    /// `(host, sql)` of every health probe
    probe_sql: Vec<(String, String)>,
}

/// Database probe answering from per-host settings
#[derive(Default)]
pub struct FakeProbe {
    state: Mutex<ProbeState>,
}

impl FakeProbe {
    fn with<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_failing(&self, host: &str, failing: bool) {
        self.with(|s| {
            if failing {
                s.failing.insert(host.to_string());
            } else {
                s.failing.remove(host);
            }
        });
    }

    pub fn fail_next(&self, host: &str, times: usize) {
        self.with(|s| s.fail_next.insert(host.to_string(), times));
    }

    pub fn set_lsn(&self, host: &str, lsn: u64) {
        self.with(|s| s.lsn.insert(host.to_string(), lsn));
    }

    pub fn set_wal_file(&self, name: &str) {
        self.with(|s| s.wal_file = Some(name.to_string()));
    }

    /// Whether the standby `app_name` shows up in `pg_stat_replication`
    pub fn set_streaming(&self, app_name: &str, streaming: bool) {
        self.with(|s| {
            if streaming {
                s.streaming.insert(app_name.to_string());
            } else {
                s.streaming.remove(app_name);
            }
        });
    }

    pub fn fail_triggers(&self) {
        self.with(|s| s.trigger_fails = true);
    }

    /// `(host, call)` of every trigger invocation
    pub fn triggers(&self) -> Vec<(String, TriggerCall)> {
        self.with(|s| s.triggers.clone())
    }

    pub fn probe_count(&self) -> usize {
        self.with(|s| s.probes)
    }

    /// Health probe statements sent to `host`, in order
    pub fn sql_sent_to(&self, host: &str) -> Vec<String> {
        self.with(|s| {
            s.probe_sql
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, sql)| sql.clone())
                .collect()
        })
    }
}

#[async_trait]
impl DbProbe for FakeProbe {
    async fn probe(&self, endpoint: &DbEndpoint, sql: &str, _timeout: Duration) -> Result<()> {
        self.with(|s| {
            s.probes += 1;
            s.probe_sql.push((endpoint.host.clone(), sql.to_string()));
            if let Some(left) = s.fail_next.get_mut(&endpoint.host) {
                if *left > 0 {
                    *left -= 1;
                    return Err(PghaError::Probe(format!("connect to {} failed", endpoint)));
                }
            }
            if s.failing.contains(&endpoint.host) {
                Err(PghaError::Probe(format!("connect to {} failed", endpoint)))
            } else {
                Ok(())
            }
        })
    }

    async fn last_lsn(&self, endpoint: &DbEndpoint, _timeout: Duration) -> Result<(Lsn, u32)> {
        self.with(|s| {
            if s.failing.contains(&endpoint.host) {
                return Err(PghaError::Probe(format!("connect to {} failed", endpoint)));
            }
            s.lsn
                .get(&endpoint.host)
                .map(|l| (Lsn(*l), 1))
                .ok_or_else(|| PghaError::Probe(format!("no lsn for {}", endpoint)))
        })
    }

    async fn last_wal_file(&self, endpoint: &DbEndpoint, _timeout: Duration) -> Result<String> {
        self.with(|s| {
            s.wal_file
                .clone()
                .ok_or_else(|| PghaError::Probe(format!("no wal file on {}", endpoint)))
        })
    }

    async fn replication_streaming(
        &self,
        _primary: &DbEndpoint,
        app_name: &str,
        _timeout: Duration,
    ) -> Result<bool> {
        Ok(self.with(|s| s.streaming.contains(app_name)))
    }

    async fn call_trigger(
        &self,
        endpoint: &DbEndpoint,
        call: &TriggerCall,
        _timeout: Duration,
    ) -> Result<()> {
        self.with(|s| {
            if s.trigger_fails {
                return Err(PghaError::Probe("function does not exist".to_string()));
            }
            s.triggers.push((endpoint.host.clone(), call.clone()));
            Ok(())
        })
    }
}

/// Load balancer keeping backends in memory
#[derive(Default)]
pub struct FakeLb {
    backends: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl FakeLb {
    pub fn backends(&self, lb_addr: &str) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .get(lb_addr)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn seed(&self, lb_addr: &str, backend: &str) {
        self.backends
            .lock()
            .unwrap()
            .entry(lb_addr.to_string())
            .or_default()
            .insert(backend.to_string());
    }
}

#[async_trait]
impl LoadBalancer for FakeLb {
    async fn list_backends(&self, lb_addr: &str) -> Result<Vec<String>> {
        Ok(self.backends(lb_addr))
    }

    async fn add_backend(&self, lb_addr: &str, backend: &str) -> Result<()> {
        self.seed(lb_addr, backend);
        Ok(())
    }

    async fn delete_backend(&self, lb_addr: &str, backend: &str) -> Result<()> {
        if let Some(set) = self.backends.lock().unwrap().get_mut(lb_addr) {
            set.remove(backend);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePinger {
    down: Mutex<HashSet<String>>,
}

impl FakePinger {
    pub fn set_down(&self, host: &str) {
        self.down.lock().unwrap().insert(host.to_string());
    }
}

#[async_trait]
impl Pinger for FakePinger {
    async fn reachable(&self, host: &str) -> bool {
        !self.down.lock().unwrap().contains(host)
    }
}

#[derive(Default)]
pub struct FakeFencer {
    code: AtomicI32,
    commands: Mutex<Vec<String>>,
}

impl FakeFencer {
    pub fn set_exit_code(&self, code: i32) {
        self.code.store(code, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fencer for FakeFencer {
    async fn fence(&self, command: &str) -> Result<i32> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self.code.load(Ordering::SeqCst))
    }
}

/// A context wired to fakes, plus handles on each fake
pub struct Harness {
    pub ctx: Arc<HaContext>,
    pub agents: FakeAgents,
    pub probe: Arc<FakeProbe>,
    pub lb: Arc<FakeLb>,
    pub pinger: Arc<FakePinger>,
    pub fencer: Arc<FakeFencer>,
}

impl Harness {
    pub fn new(clusters: Vec<Cluster>, nodes: Vec<Node>) -> Self {
        Self::with_settings(clusters, nodes, HaSettings::immediate())
    }

    pub fn with_settings(clusters: Vec<Cluster>, nodes: Vec<Node>, settings: HaSettings) -> Self {
        let store = MemoryMetaStore::with_records(clusters, nodes).unwrap();
        let agents = FakeAgents::default();
        let probe = Arc::new(FakeProbe::default());
        let lb = Arc::new(FakeLb::default());
        let pinger = Arc::new(FakePinger::default());
        let fencer = Arc::new(FakeFencer::default());
        let ctx = HaContext::new(
            Arc::new(store),
            Arc::new(agents.clone()),
            probe.clone(),
            lb.clone(),
            pinger.clone(),
            fencer.clone(),
        )
        .with_settings(settings);
        Self {
            ctx: Arc::new(ctx),
            agents,
            probe,
            lb,
            pinger,
            fencer,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.ctx.store
    }

    pub async fn cluster(&self, id: u32) -> Cluster {
        self.ctx.store.require_cluster(id).await.unwrap()
    }

    pub async fn node(&self, id: NodeId) -> Node {
        self.ctx.store.require_node(id).await.unwrap()
    }

    /// Wait until no task runs and cluster `id` is no longer held by one
    pub async fn settle(&self, id: u32) {
        for _ in 0..1000 {
            let idle = self.ctx.tasks.running().is_empty();
            let state = self.cluster(id).await.state;
            let repairing = self
                .ctx
                .store
                .nodes_of(id)
                .await
                .unwrap()
                .iter()
                .any(|n| self.ctx.in_failback(n.id));
            if idle && !state.is_busy() && !repairing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cluster {} did not settle: {:?}", id, self.ctx.tasks.running());
    }
}

/// Cluster 1 in NORMAL with a write VIP and one load balancer
pub fn cluster() -> Cluster {
    let mut cluster = Cluster::new(1, "orders");
    cluster.state = ClusterState::Normal;
    cluster.vip = Some(VIP.to_string());
    cluster.lb_list = vec![LB.to_string()];
    cluster.probe.retry_cnt = 1;
    cluster.probe.retry_interval_ms = 0;
    cluster.probe.interval_ms = 10;
    cluster
}

pub fn primary(id: NodeId, host: &str) -> Node {
    let mut node = Node::new(id, 1, host, "/data/pg");
    node.is_primary = true;
    node
}

pub fn standby(id: NodeId, host: &str, up: NodeId, score: i32) -> Node {
    let mut node = Node::new(id, 1, host, "/data/pg");
    node.up_db_id = Some(up);
    node.score = score;
    node
}
