//! High-availability engines.
//!
//! Every structural operation on a cluster (health-check cycle, failover,
//! failback, switchover) first wins the cluster state CAS through
//! [`lock::ClusterLock`] and hands it back on every exit path.

pub mod discovery;
pub mod failback;
pub mod failover;
pub mod lifecycle;
pub mod lock;
pub mod monitor;
pub mod reconcile;
pub mod switchover;

pub use lock::ClusterLock;

use crate::agent::{
    AgentConnector, DbEndpoint, DbProbe, Fencer, LoadBalancer, NodeControl, Pinger, TriggerCall,
    UpstreamConfig,
};
use crate::error::{PghaError, Result};
use crate::meta::{
    Cluster, ClusterId, ClusterState, MetaStore, Node, NodeId, Topology,
};
use crate::observability::HaMetrics;
use crate::shutdown::ShutdownSignal;
use crate::task::{TaskId, TaskManager};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Timing and retry knobs of the engines
#[derive(Debug, Clone)]
pub struct HaSettings {
    pub discovery_interval: Duration,
    /// Local restart attempts before a failover
    pub restart_retries: u32,
    pub restart_delay: Duration,
    pub failback_settle: Duration,
    pub fence_settle: Duration,
    pub max_failback_count: u32,
    /// Seconds handed to `stop` when a primary is shut down for switchover
    pub stop_wait_secs: u64,
    pub ready_retries: u32,
    pub ready_interval: Duration,
    /// Timeout of control-plane side SQL calls (LSN, WAL file, trigger)
    pub sql_timeout: Duration,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(10),
            restart_retries: 3,
            restart_delay: Duration::from_secs(5),
            failback_settle: Duration::from_secs(5),
            fence_settle: Duration::from_secs(2),
            max_failback_count: 3,
            stop_wait_secs: 30,
            ready_retries: 60,
            ready_interval: Duration::from_secs(1),
            sql_timeout: Duration::from_secs(10),
        }
    }
}

impl HaSettings {
    /// No waits anywhere, for tests
    pub fn immediate() -> Self {
        Self {
            discovery_interval: Duration::from_millis(10),
            restart_delay: Duration::ZERO,
            failback_settle: Duration::ZERO,
            fence_settle: Duration::ZERO,
            ready_interval: Duration::ZERO,
            ready_retries: 3,
            ..Self::default()
        }
    }
}

/// Process-wide state shared by monitors and tasks
pub struct HaContext {
    pub store: Arc<dyn MetaStore>,
    pub agents: Arc<dyn AgentConnector>,
    pub probe: Arc<dyn DbProbe>,
    pub lb: Arc<dyn LoadBalancer>,
    pub pinger: Arc<dyn Pinger>,
    pub fencer: Arc<dyn Fencer>,
    pub tasks: Arc<TaskManager>,
    pub settings: HaSettings,
    pub metrics: Arc<HaMetrics>,
    pub shutdown: ShutdownSignal,
    async_clusters: Mutex<HashSet<ClusterId>>,
    failback_nodes: Mutex<HashSet<NodeId>>,
    monitors: Mutex<HashSet<ClusterId>>,
}

impl HaContext {
    pub fn new(
        store: Arc<dyn MetaStore>,
        agents: Arc<dyn AgentConnector>,
        probe: Arc<dyn DbProbe>,
        lb: Arc<dyn LoadBalancer>,
        pinger: Arc<dyn Pinger>,
        fencer: Arc<dyn Fencer>,
    ) -> Self {
        Self {
            store,
            agents,
            probe,
            lb,
            pinger,
            fencer,
            tasks: Arc::new(TaskManager::default()),
            settings: HaSettings::default(),
            metrics: Arc::new(HaMetrics::new()),
            shutdown: ShutdownSignal::never(),
            async_clusters: Mutex::new(HashSet::new()),
            failback_nodes: Mutex::new(HashSet::new()),
            monitors: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_settings(mut self, settings: HaSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<TaskManager>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HaMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn control(&self, host: &str) -> Result<Arc<dyn NodeControl>> {
        self.agents.connect(host).await
    }

    pub async fn topology(&self, cluster_id: ClusterId) -> Result<Topology> {
        self.store
            .topology(cluster_id)
            .await?
            .ok_or(PghaError::ClusterNotFound(cluster_id))
    }

    /// Clusters whose primary was switched to asynchronous replication
    pub fn is_async(&self, cluster_id: ClusterId) -> bool {
        lock_set(&self.async_clusters).contains(&cluster_id)
    }

    pub(crate) fn set_async(&self, cluster_id: ClusterId, on: bool) {
        let mut set = lock_set(&self.async_clusters);
        if on {
            set.insert(cluster_id);
        } else {
            set.remove(&cluster_id);
        }
    }

    pub fn in_failback(&self, node_id: NodeId) -> bool {
        lock_set(&self.failback_nodes).contains(&node_id)
    }

    /// Mark a node as being failed back. False if it already was.
    pub(crate) fn begin_failback(&self, node_id: NodeId) -> bool {
        lock_set(&self.failback_nodes).insert(node_id)
    }

    pub(crate) fn end_failback(&self, node_id: NodeId) {
        lock_set(&self.failback_nodes).remove(&node_id);
    }

    pub(crate) fn register_monitor(&self, cluster_id: ClusterId) -> bool {
        lock_set(&self.monitors).insert(cluster_id)
    }

    pub(crate) fn unregister_monitor(&self, cluster_id: ClusterId) {
        lock_set(&self.monitors).remove(&cluster_id);
    }

    pub fn monitored_clusters(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = lock_set(&self.monitors).iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run the cluster's trigger function on `target`, if one is configured.
    /// Failures are written to the task log only.
    pub(crate) async fn fire_trigger(
        &self,
        task_id: TaskId,
        before: &Topology,
        after: &Topology,
        target: &Node,
        code: i32,
        message: &str,
        host: &str,
    ) {
        let trigger = match &after.cluster.trigger {
            Some(t) if !t.db_name.is_empty() && !t.function.is_empty() => t.clone(),
            _ => return,
        };
        self.tasks.info(
            task_id,
            format!(
                "{}: trigger db({}) function({}) in primary ...",
                message, trigger.db_name, trigger.function
            ),
        );
        let (before_json, after_json) = match (
            serde_json::to_string(before),
            serde_json::to_string(after),
        ) {
            (Ok(b), Ok(a)) => (b, a),
            (Err(e), _) | (_, Err(e)) => {
                self.tasks
                    .error(task_id, format!("{}: encode trigger payload: {}", message, e));
                return;
            }
        };
        let call = TriggerCall {
            function: trigger.function.clone(),
            code,
            message: message.to_string(),
            host: host.to_string(),
            before: before_json,
            after: after_json,
        };
        let endpoint = db_endpoint(&after.cluster, target, Some(&trigger.db_name));
        if let Err(e) = self
            .probe
            .call_trigger(&endpoint, &call, self.settings.sql_timeout)
            .await
        {
            self.tasks.error(
                task_id,
                format!(
                    "{}: trigger db({}) function({}) in primary error: {}",
                    message, trigger.db_name, trigger.function, e
                ),
            );
        }
    }

    /// Add or remove `vip` on `host`
    pub(crate) async fn vip_on(&self, host: &str, vip: &str, add: bool) -> Result<()> {
        let control = self.control(host).await?;
        if add {
            control.add_vip(vip).await?.check("add_vip")?;
        } else {
            control.del_vip(vip).await?.check("del_vip")?;
        }
        Ok(())
    }

    /// Best-effort: add or remove `backend` on every load balancer of the cluster
    pub(crate) async fn lb_apply(
        &self,
        task_id: Option<TaskId>,
        cluster: &Cluster,
        backend: &str,
        add: bool,
    ) {
        for lb_addr in &cluster.lb_list {
            let result = if add {
                self.lb.add_backend(lb_addr, backend).await
            } else {
                self.lb.delete_backend(lb_addr, backend).await
            };
            if let Err(e) = result {
                let msg = format!(
                    "Can not {} host({}) {} load balancer({}): {}",
                    if add { "add" } else { "remove" },
                    backend,
                    if add { "to" } else { "from" },
                    lb_addr,
                    e
                );
                match task_id {
                    Some(id) => self.tasks.error(id, msg),
                    None => warn!(cluster_id = cluster.id, "{}", msg),
                }
            }
        }
    }
}

fn lock_set<T>(m: &Mutex<HashSet<T>>) -> std::sync::MutexGuard<'_, HashSet<T>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleep unless the delay is zero
pub(crate) async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Poll `is_ready` until the database accepts connections
pub(crate) async fn wait_ready(
    ctx: &HaContext,
    control: &dyn NodeControl,
    node: &Node,
) -> Result<()> {
    for _ in 0..ctx.settings.ready_retries.max(1) {
        if control.is_ready(&node.pgdata, node.port).await? {
            return Ok(());
        }
        pause(ctx.settings.ready_interval).await;
    }
    Err(PghaError::NodeControl {
        op: "is_ready".to_string(),
        code: -1,
        message: format!("database({}) is not ready", node.endpoint()),
    })
}

/// Connection parameters for a node, on the probe database unless `db_name` is given
pub fn db_endpoint(cluster: &Cluster, node: &Node, db_name: Option<&str>) -> DbEndpoint {
    DbEndpoint {
        host: node.host.clone(),
        port: node.port,
        db_name: db_name.unwrap_or(&cluster.probe.db_name).to_string(),
        user: cluster.db_user.clone(),
        password: cluster.db_pass.clone(),
    }
}

/// Replication endpoint for LSN queries, using the standby's replication user
pub fn repl_endpoint(node: &Node) -> DbEndpoint {
    DbEndpoint {
        host: node.host.clone(),
        port: node.port,
        db_name: "template1".to_string(),
        user: node.repl_user.clone(),
        password: node.repl_pass.clone(),
    }
}

/// Upstream settings for `standby` streaming from `upstream`
pub fn upstream_config(upstream: &Node, standby: &Node) -> UpstreamConfig {
    UpstreamConfig {
        host: upstream.host.clone(),
        port: upstream.port,
        repl_user: standby.repl_user.clone(),
        repl_pass: standby.repl_pass.clone(),
        repl_app_name: standby.repl_app_name.clone(),
    }
}

/// States a structural operation may start from
pub const OPERABLE: [ClusterState; 2] = [ClusterState::Normal, ClusterState::Offline];
