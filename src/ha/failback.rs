//! Repair of a FAULT node back into a streaming standby.

use super::{db_endpoint, pause, upstream_config, wait_ready, ClusterLock, HaContext};
use crate::agent::{BuildStandbyParams, NodeControl, UpstreamConfig};
use crate::error::{PghaError, Result};
use crate::meta::{ClusterState, DbState, FailbackOptions, Node, NodeId, NodeState, Topology};
use crate::task::{TaskId, TaskKind, TaskState};
use std::sync::Arc;
use tracing::info;

/// States an operator failback may start from
const FAILBACK_FROM: [ClusterState; 3] = [
    ClusterState::Normal,
    ClusterState::Offline,
    ClusterState::Failed,
];

/// Whether `node_id` can be repaired right now
pub fn can_be_failback(topo: &Topology, node_id: NodeId) -> Result<()> {
    let state = topo.cluster.state;
    if state.is_busy() {
        return Err(PghaError::Precondition(format!(
            "Cluster is being operated on(state={}). Please try repairing the node later!",
            state
        )));
    }
    if topo.normal_primary().is_none() {
        return Err(PghaError::Precondition(
            "can not find normal primary database".to_string(),
        ));
    }
    let node = topo.node(node_id).ok_or(PghaError::NodeNotFound(node_id))?;
    if node.state != NodeState::Fault {
        return Err(PghaError::Precondition(format!(
            "This database({}) state is not Fault, not need failback.",
            node.host
        )));
    }
    Ok(())
}

/// Repair `node_id` while `lock` holds the cluster, then release it into
/// its previous state.
pub async fn failback(
    ctx: Arc<HaContext>,
    lock: ClusterLock,
    node_id: NodeId,
    up_db_id: Option<NodeId>,
    task_id: TaskId,
) -> Result<()> {
    let cluster_id = lock.cluster_id();
    let body = async {
        let before = ctx.topology(cluster_id).await?;
        let result = repair(&ctx, task_id, &before, node_id, up_db_id).await;
        finish(&ctx, task_id, &before, node_id, &result).await;
        result.map(|_| ())
    };
    let result = lock.run(body, |_, previous| previous).await;
    ctx.end_failback(node_id);
    if let Err(e) = &result {
        // Failures before `finish` ran, such as a vanished cluster
        if ctx.tasks.state(task_id) == Some(TaskState::Running) {
            ctx.tasks
                .complete(task_id, TaskState::Failed, format!("Failback failed: {}", e));
        }
    }
    result
}

/// Returns the upstream the node now streams from
async fn repair(
    ctx: &HaContext,
    task_id: TaskId,
    topo: &Topology,
    node_id: NodeId,
    up_db_id: Option<NodeId>,
) -> Result<Node> {
    let prefix = format!("Failback(cluster={}, db_id={})", topo.cluster.id, node_id);
    ctx.tasks.info(task_id, format!("{}: begin...", prefix));

    let node = topo
        .node(node_id)
        .cloned()
        .ok_or(PghaError::NodeNotFound(node_id))?;
    if node.state != NodeState::Fault {
        return Err(PghaError::Precondition(format!(
            "This database({}) state is not Fault, not need failback.",
            node.host
        )));
    }
    let primary = topo
        .normal_primary()
        .cloned()
        .ok_or_else(|| {
            PghaError::Precondition("can not find normal primary database".to_string())
        })?;
    let upstream = up_db_id
        .and_then(|id| topo.node(id))
        .filter(|n| n.is_normal() && n.id != node.id)
        .cloned()
        .unwrap_or(primary);
    ctx.tasks.info(
        task_id,
        format!("{}: upstream database: {}", prefix, upstream.endpoint()),
    );

    ctx.store.set_node_state(node.id, NodeState::Repairing).await?;
    let control = ctx.control(&node.host).await?;
    let source = upstream_config(&upstream, &node);

    match control
        .change_upstream(&node.pgdata, &source)
        .await
        .and_then(|r| r.check("change_upstream"))
    {
        Ok(_) => ctx.tasks.info(
            task_id,
            format!("{}: change db({}) sr to db({}) success.", prefix, node.id, upstream.id),
        ),
        // The data directory may be gone; a rebuild below can still fix it.
        Err(e) => ctx.tasks.info(
            task_id,
            format!(
                "{}: change db({}) sr to db({}) failed: {}",
                prefix, node.id, upstream.id, e
            ),
        ),
    }

    pause(ctx.settings.failback_settle).await;
    ctx.tasks.info(
        task_id,
        format!("{}: checking failback database replication streaming is ok...", prefix),
    );
    if is_streaming(ctx, topo, &upstream, &node).await? {
        reset_count(ctx, node.id).await?;
        ctx.tasks.info(task_id, format!("{}: Repair succeeded.", prefix));
        return Ok(upstream);
    }

    let options = node.failback;
    if !options.is_rewind && !options.is_rebuild {
        return Err(PghaError::Precondition(
            "The streaming replication status is abnormal. Please choose 'rewind' or rebuild the standby node to repair it."
                .to_string(),
        ));
    }

    if options.is_rewind {
        ctx.tasks
            .info(task_id, format!("{}: Start trying pg_rewind recovery", prefix));
        match rewind(ctx, control.as_ref(), &node, &source).await {
            Ok(()) => {
                reset_count(ctx, node.id).await?;
                return Ok(upstream);
            }
            Err(e) if options.is_rebuild => {
                ctx.tasks
                    .warn(task_id, format!("{}: pg_rewind failed: {}", prefix, e));
            }
            Err(e) => return Err(e),
        }
    }

    rebuild(ctx, task_id, &prefix, control.as_ref(), &node, source, options).await?;
    reset_count(ctx, node.id).await?;
    Ok(upstream)
}

async fn is_streaming(
    ctx: &HaContext,
    topo: &Topology,
    upstream: &Node,
    node: &Node,
) -> Result<bool> {
    ctx.probe
        .replication_streaming(
            &db_endpoint(&topo.cluster, upstream, None),
            &node.repl_app_name,
            ctx.settings.sql_timeout,
        )
        .await
        .map_err(|e| {
            PghaError::Probe(format!(
                "failed to checking failback database replication streaming: {}",
                e
            ))
        })
}

async fn rewind(
    ctx: &HaContext,
    control: &dyn NodeControl,
    node: &Node,
    source: &UpstreamConfig,
) -> Result<()> {
    control
        .stop(&node.pgdata, ctx.settings.stop_wait_secs)
        .await?
        .check("stop")?;
    control.rewind(&node.pgdata, source).await?.check("rewind")?;
    control.start(&node.pgdata).await?.check("start")?;
    wait_ready(ctx, control, node).await
}

async fn rebuild(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    control: &dyn NodeControl,
    node: &Node,
    source: UpstreamConfig,
    options: FailbackOptions,
) -> Result<()> {
    ctx.tasks
        .info(task_id, format!("{}: begin stop this database ...", prefix));
    if let Err(e) = control.stop(&node.pgdata, ctx.settings.stop_wait_secs).await {
        ctx.tasks
            .warn(task_id, format!("{}: stop database: {}", prefix, e));
    }

    if control.path_exists(&node.pgdata).await? {
        let rename_to = if options.rm_pgdata {
            ctx.tasks
                .info(task_id, format!("{}: delete directory: {}/*", prefix, node.pgdata));
            None
        } else {
            let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
            let target = format!("{}_{}", node.pgdata, stamp);
            ctx.tasks
                .info(task_id, format!("{}: rename {} to {}", prefix, node.pgdata, target));
            Some(target)
        };
        control
            .remove_pgdata(&node.pgdata, rename_to.as_deref())
            .await?
            .check("remove_pgdata")?;
    }

    ctx.tasks
        .info(task_id, format!("{}: begin build standby ...", prefix));
    let params = BuildStandbyParams {
        pgdata: node.pgdata.clone(),
        port: node.port,
        upstream: source,
    };
    control
        .build_standby(&params)
        .await?
        .check("build_standby")
        .map_err(|e| PghaError::Internal(format!("Build standby database failed: {}", e)))?;
    wait_ready(ctx, control, node).await
}

async fn reset_count(ctx: &HaContext, node_id: NodeId) -> Result<()> {
    ctx.store
        .update_node(node_id, Box::new(|n: &mut Node| n.failback_count = 0))
        .await
        .map(|_| ())
}

/// Final bookkeeping of a failback, on every outcome
async fn finish(
    ctx: &HaContext,
    task_id: TaskId,
    before: &Topology,
    node_id: NodeId,
    result: &Result<Node>,
) {
    let (db_state, node_state) = match result {
        Ok(_) => (DbState::Running, NodeState::Normal),
        Err(_) => (DbState::Fault, NodeState::Fault),
    };
    if let Err(e) = ctx.store.set_db_state(node_id, db_state).await {
        ctx.tasks.error(task_id, format!("set db state failed: {}", e));
    }
    if let Err(e) = ctx.store.set_node_state(node_id, node_state).await {
        ctx.tasks.error(task_id, format!("set node state failed: {}", e));
    }

    match result {
        Ok(upstream) => {
            ctx.metrics.failbacks_ok.inc();
            let node = before.node(node_id);
            if let Ok(after) = ctx.topology(before.cluster.id).await {
                if let (Some(node), Some(primary)) = (node, after.normal_primary()) {
                    let message = format!(
                        "Failback(cluster={}, host={})",
                        before.cluster.id, node.host
                    );
                    ctx.fire_trigger(task_id, before, &after, primary, 2, &message, &node.host)
                        .await;
                }
            }
            if let Some(node) = node {
                ctx.lb_apply(Some(task_id), &before.cluster, &node.endpoint(), true)
                    .await;
            }
            info!(
                cluster_id = before.cluster.id,
                node_id, "failback done, streaming from {}", upstream.endpoint()
            );
            ctx.tasks.complete(task_id, TaskState::Success, "Success");
        }
        Err(e) => {
            ctx.metrics.failbacks_failed.inc();
            ctx.tasks.complete(task_id, TaskState::Failed, e.to_string());
        }
    }
}

fn task_name(cluster_id: u32, node_id: NodeId) -> String {
    format!("failback {}(db={})", cluster_id, node_id)
}

/// Automatic failback entry used by the monitor, which already moved the
/// cluster into REPAIRING through `lock`.
///
/// Refuses once the node has been failed back `max_failback_count` times
/// without success; the operator clears that with [`reset_failback_count`].
pub async fn check_auto_failback(
    ctx: &Arc<HaContext>,
    lock: ClusterLock,
    node_id: NodeId,
    up_db_id: Option<NodeId>,
) -> Result<Option<TaskId>> {
    let cluster_id = lock.cluster_id();
    let previous = lock.previous();
    let node = match ctx.store.get_node(node_id).await? {
        Some(n) => n,
        None => {
            lock.release(previous).await?;
            return Ok(None);
        }
    };

    if node.failback_count >= ctx.settings.max_failback_count {
        info!(
            cluster_id,
            node_id,
            "failback attempted {} times already, leave it to the operator",
            node.failback_count
        );
        lock.release(previous).await?;
        ctx.store.set_db_state(node_id, DbState::Fault).await?;
        ctx.store.set_node_state(node_id, NodeState::Fault).await?;
        return Ok(None);
    }

    if !ctx.begin_failback(node_id) {
        lock.release(previous).await?;
        return Ok(None);
    }

    info!(cluster_id, node_id, "starting automatic failback");
    let count = node.failback_count + 1;
    if let Err(e) = ctx
        .store
        .update_node(node_id, Box::new(move |n: &mut Node| n.failback_count = count))
        .await
    {
        ctx.end_failback(node_id);
        lock.release(previous).await?;
        return Err(e);
    }
    let task_id = ctx
        .tasks
        .create(TaskKind::Failback, task_name(cluster_id, node_id), Some(cluster_id));
    let runner = Arc::clone(ctx);
    ctx.tasks.spawn(task_id, async move {
        // The outcome is recorded in the task.
        let _ = failback(runner, lock, node_id, up_db_id, task_id).await;
    });
    Ok(Some(task_id))
}

/// Operator-requested failback. `options`, when given, replace the node's
/// stored repair options first.
pub async fn manual_failback(
    ctx: &Arc<HaContext>,
    node_id: NodeId,
    up_db_id: Option<NodeId>,
    options: Option<FailbackOptions>,
) -> Result<TaskId> {
    let node = ctx.store.require_node(node_id).await?;
    let cluster_id = node.cluster_id;
    let topo = ctx.topology(cluster_id).await?;
    can_be_failback(&topo, node_id)?;
    if let Some(options) = options {
        ctx.store
            .update_node(node_id, Box::new(move |n: &mut Node| n.failback = options))
            .await?;
    }

    let lock = ClusterLock::acquire(
        Arc::clone(&ctx.store),
        cluster_id,
        &FAILBACK_FROM,
        ClusterState::Repairing,
    )
    .await?
    .ok_or_else(|| {
        PghaError::Precondition(
            "Cluster is being operated on. Please try repairing the node later!".to_string(),
        )
    })?;
    if !ctx.begin_failback(node_id) {
        let previous = lock.previous();
        let _ = lock.release(previous).await;
        return Err(PghaError::Precondition(format!(
            "database({}) is already being failed back",
            node_id
        )));
    }

    let task_id = ctx
        .tasks
        .create(TaskKind::Failback, task_name(cluster_id, node_id), Some(cluster_id));
    let runner = Arc::clone(ctx);
    ctx.tasks.spawn(task_id, async move {
        let _ = failback(runner, lock, node_id, up_db_id, task_id).await;
    });
    Ok(task_id)
}

/// Clear the automatic failback counter of a node
pub async fn reset_failback_count(ctx: &HaContext, node_id: NodeId) -> Result<()> {
    ctx.store.require_node(node_id).await?;
    reset_count(ctx, node_id).await
}
