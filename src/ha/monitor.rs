//! Per-cluster health-check loop.

use super::failback::check_auto_failback;
use super::failover::failover;
use super::reconcile::reconcile;
use super::{pause, db_endpoint, ClusterLock, HaContext};
use crate::error::Result;
use crate::meta::{Cluster, ClusterId, ClusterState, Node, NodeId, NodeState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one health-check cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Checked; the cluster was left in this state
    Checked(ClusterState),
    /// Another operation holds the cluster, or it is not NORMAL
    Busy,
    /// The cluster or all of its nodes were deleted
    Gone,
}

/// Unregisters the monitor however its loop ends
struct MonitorGuard {
    ctx: Arc<HaContext>,
    cluster_id: ClusterId,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.ctx.unregister_monitor(self.cluster_id);
        self.ctx.metrics.monitors_active.dec();
        info!(cluster_id = self.cluster_id, "cluster monitor stopped");
    }
}

/// Start a monitor for `cluster_id` unless one is already running
pub fn spawn_monitor(ctx: &Arc<HaContext>, cluster_id: ClusterId) -> Option<JoinHandle<()>> {
    if !ctx.register_monitor(cluster_id) {
        return None;
    }
    ctx.metrics.monitors_active.inc();
    let guard = MonitorGuard {
        ctx: Arc::clone(ctx),
        cluster_id,
    };
    Some(tokio::spawn(monitor_loop(guard)))
}

async fn monitor_loop(guard: MonitorGuard) {
    let ctx = Arc::clone(&guard.ctx);
    let cluster_id = guard.cluster_id;
    let mut shutdown = ctx.shutdown.clone();
    info!(cluster_id, "cluster monitor started");

    loop {
        if shutdown.is_shutdown() {
            break;
        }
        match check_once(&ctx, cluster_id).await {
            Ok(Cycle::Gone) => {
                info!(cluster_id, "cluster was deleted");
                break;
            }
            Ok(Cycle::Busy) => debug!(cluster_id, "cluster busy or not online, skip check"),
            Ok(Cycle::Checked(state)) => debug!(cluster_id, "check finished in state {}", state),
            Err(e) => error!(cluster_id, "health check failed: {}", e),
        }

        let interval = match ctx.store.get_cluster(cluster_id).await {
            Ok(Some(c)) => c.probe.interval(),
            Ok(None) => break,
            Err(e) => {
                warn!(cluster_id, "load cluster: {}", e);
                ctx.settings.discovery_interval
            }
        };
        if shutdown.sleep(interval).await {
            break;
        }
    }
    drop(guard);
}

/// One health-check cycle: probe, fail over, reconcile, then try one
/// automatic failback.
pub async fn check_once(ctx: &Arc<HaContext>, cluster_id: ClusterId) -> Result<Cycle> {
    if ctx.store.get_cluster(cluster_id).await?.is_none() {
        return Ok(Cycle::Gone);
    }
    let lock = match ClusterLock::acquire(
        Arc::clone(&ctx.store),
        cluster_id,
        &[ClusterState::Normal],
        ClusterState::Checking,
    )
    .await?
    {
        Some(l) => l,
        None => return Ok(Cycle::Busy),
    };

    let state = match check_cluster(ctx, cluster_id).await {
        Ok(Some(state)) => state,
        Ok(None) => {
            lock.forget();
            return Ok(Cycle::Gone);
        }
        Err(e) => {
            error!(cluster_id, "health check aborted: {}", e);
            ClusterState::Failed
        }
    };
    lock.release(state).await?;

    if state == ClusterState::Normal {
        auto_failback(ctx, cluster_id).await?;
    }
    Ok(Cycle::Checked(state))
}

/// Probe and repair while the cluster is held in CHECKING. `None` when the
/// cluster disappeared.
async fn check_cluster(ctx: &HaContext, cluster_id: ClusterId) -> Result<Option<ClusterState>> {
    let mut topo = match ctx.store.topology(cluster_id).await? {
        Some(t) if !t.nodes.is_empty() => t,
        _ => return Ok(None),
    };
    ctx.metrics.check_cycles.inc();

    let mut state = ClusterState::Normal;
    let mut checked: HashSet<NodeId> = HashSet::new();
    loop {
        let node = match topo
            .nodes
            .iter()
            .find(|n| n.is_normal() && !checked.contains(&n.id))
        {
            Some(n) => n.clone(),
            None => break,
        };
        checked.insert(node.id);
        let messages = match probe_node(ctx, &topo.cluster, &node).await {
            Ok(()) => {
                ctx.metrics.probes_ok.inc();
                continue;
            }
            Err(messages) => messages,
        };
        ctx.metrics.probes_failed.inc();
        warn!(
            cluster_id,
            node_id = node.id,
            "database({}) failed its health probe, starting failover",
            node.endpoint()
        );
        match failover(ctx, cluster_id, node.id, &messages).await {
            Ok(()) if node.is_primary => {
                // roles moved, check the rest against the new layout
                topo = match ctx.store.topology(cluster_id).await? {
                    Some(t) => t,
                    None => return Ok(None),
                };
            }
            Ok(()) => {}
            Err(e) => {
                error!(cluster_id, node_id = node.id, "failover failed: {}", e);
                state = ClusterState::Failed;
            }
        }
    }

    match ctx.store.topology(cluster_id).await? {
        Some(current) => reconcile(ctx, &current).await,
        None => return Ok(None),
    }
    Ok(Some(state))
}

/// Probe with retries. On failure returns one message per attempt.
async fn probe_node(
    ctx: &HaContext,
    cluster: &Cluster,
    node: &Node,
) -> std::result::Result<(), Vec<String>> {
    let settings = &cluster.probe;
    let sql = if node.is_primary {
        &settings.primary_sql
    } else {
        &settings.standby_sql
    };
    let endpoint = db_endpoint(cluster, node, None);
    let attempts = settings.retry_cnt + 1;
    let mut messages = Vec::new();
    for attempt in 1..=attempts {
        match ctx.probe.probe(&endpoint, sql, settings.timeout()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                messages.push(format!(
                    "{} ProbeDB[cluster_id={}, db={}:{}]: {} time error: {}",
                    time, cluster.id, node.host, node.port, attempt, e
                ));
                if attempt < attempts {
                    pause(settings.retry_interval()).await;
                }
            }
        }
    }
    Err(messages)
}

/// Start at most one automatic failback of a reachable FAULT node
async fn auto_failback(ctx: &Arc<HaContext>, cluster_id: ClusterId) -> Result<()> {
    let topo = match ctx.store.topology(cluster_id).await? {
        Some(t) => t,
        None => return Ok(()),
    };
    if !topo.cluster.auto_failback {
        return Ok(());
    }
    let primary_id = topo.normal_primary().map(|p| p.id);

    for node in topo
        .nodes
        .iter()
        .filter(|n| n.state == NodeState::Fault && !ctx.in_failback(n.id))
    {
        if let Err(e) = ctx.control(&node.host).await {
            debug!(cluster_id, node_id = node.id, "host still unreachable: {}", e);
            continue;
        }
        let lock = match ClusterLock::acquire(
            Arc::clone(&ctx.store),
            cluster_id,
            &[ClusterState::Normal],
            ClusterState::Repairing,
        )
        .await?
        {
            Some(l) => l,
            None => break,
        };
        let up_db_id = node.up_db_id.or(primary_id);
        if let Some(task_id) = check_auto_failback(ctx, lock, node.id, up_db_id).await? {
            info!(cluster_id, node_id = node.id, task_id, "automatic failback started");
            break;
        }
    }
    Ok(())
}
