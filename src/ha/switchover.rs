//! Planned primary switch to a direct standby of the current primary.
//!
//! Streaming replication clusters hand over the last WAL segment before
//! promoting. Shared-storage clusters stop the old master first so that a
//! single node writes the volume.

use super::{repl_endpoint, upstream_config, wait_ready, ClusterLock, HaContext, OPERABLE};
use crate::error::{PghaError, Result};
use crate::meta::{
    Cluster, ClusterId, ClusterKind, ClusterState, DbState, Node, NodeId, PolarRole, Topology,
};
use crate::task::{TaskId, TaskKind, TaskState};
use std::sync::Arc;

/// Seconds a standby gets to stop before it is repointed
const STANDBY_STOP_WAIT: u64 = 5;

/// What a switchover will do, as checked by [`test_can_switch`]
#[derive(Debug, Clone)]
pub struct SwitchPlan {
    pub old_primary: Node,
    pub target: Node,
    /// Path on the old primary of the target's current WAL segment.
    /// Shared-storage clusters have none.
    pub wal_path: Option<String>,
}

fn check_operable(topo: &Topology) -> Result<()> {
    let state = topo.cluster.state;
    if state != ClusterState::Normal && state != ClusterState::Offline {
        return Err(PghaError::Precondition(
            "The cluster is not in Online or Offline status, so it cannot be switched!".to_string(),
        ));
    }
    Ok(())
}

fn switch_pair(topo: &Topology, target_id: NodeId) -> Result<(Node, Node)> {
    let old = topo.normal_primary().cloned().ok_or_else(|| {
        PghaError::Precondition(
            "can not find current primary database or current primary database is not ok!"
                .to_string(),
        )
    })?;
    if old.id == target_id {
        return Err(PghaError::Precondition(format!(
            "database(db_id={}) already is primary, no need switch!",
            target_id
        )));
    }
    let target = topo
        .node(target_id)
        .cloned()
        .ok_or(PghaError::NodeNotFound(target_id))?;
    if target.up_db_id != Some(old.id) {
        return Err(PghaError::Precondition(format!(
            "To switch the standby to the primary, the standby({}) must be a direct subordinate of the original primary({}). \
             If it is not, the cascade relationship should be adjusted first before proceeding with the switch.",
            target_id, old.id
        )));
    }
    Ok((old, target))
}

/// Whether the old primary still holds the WAL segment the target is
/// replaying. Returns the checked path.
async fn check_wal(ctx: &HaContext, old: &Node, target: &Node) -> Result<String> {
    let wal_file = ctx
        .probe
        .last_wal_file(&repl_endpoint(target), ctx.settings.sql_timeout)
        .await
        .map_err(|e| {
            PghaError::Probe(format!(
                "get new primary({}) last wal file failed: {}",
                target.host, e
            ))
        })?;
    let control = ctx.control(&old.host).await?;
    let version = control.pgdata_version(&old.pgdata).await?;
    let wal_dir = if version >= 10 { "pg_wal" } else { "pg_xlog" };
    let wal_path = format!("{}/{}/{}", old.pgdata, wal_dir, wal_file);
    if !control.path_exists(&wal_path).await? {
        return Err(PghaError::Precondition(format!(
            "The new node({}) that wants to become the primary does not have the necessary WAL logs({}) \
             from the current primary({}) (the WAL logs are too outdated), so the switch cannot be made.",
            target.host, wal_path, old.host
        )));
    }
    Ok(wal_path)
}

/// Pre-flight check of a streaming replication switch to `target_id`
pub async fn test_sr_can_switch(
    ctx: &HaContext,
    topo: &Topology,
    target_id: NodeId,
) -> Result<SwitchPlan> {
    check_operable(topo)?;
    let (old_primary, target) = switch_pair(topo, target_id)?;
    let wal_path = check_wal(ctx, &old_primary, &target).await?;
    Ok(SwitchPlan {
        old_primary,
        target,
        wal_path: Some(wal_path),
    })
}

/// Old master and target of a shared-storage switch. Only a NORMAL reader
/// of the shared volume can take it over.
fn shared_storage_pair(topo: &Topology, target_id: NodeId) -> Result<(Node, Node)> {
    let (old, target) = switch_pair(topo, target_id)?;
    if !target.is_normal() {
        return Err(PghaError::Precondition(format!(
            "database(db_id={}) is not in NORMAL state, so it cannot become primary!",
            target_id
        )));
    }
    if target.polar_role() == Some(PolarRole::Standby) {
        return Err(PghaError::Precondition(format!(
            "database(db_id={}) is a polar standby with its own storage, \
             only a reader can take over the shared volume!",
            target_id
        )));
    }
    Ok((old, target))
}

/// Pre-flight check of a shared-storage switch to `target_id`
pub fn test_shared_storage_can_switch(topo: &Topology, target_id: NodeId) -> Result<SwitchPlan> {
    check_operable(topo)?;
    let (old_primary, target) = shared_storage_pair(topo, target_id)?;
    Ok(SwitchPlan {
        old_primary,
        target,
        wal_path: None,
    })
}

/// Pre-flight check matching the cluster's kind
pub async fn test_can_switch(
    ctx: &HaContext,
    topo: &Topology,
    target_id: NodeId,
) -> Result<SwitchPlan> {
    match topo.cluster.kind {
        ClusterKind::Replication => test_sr_can_switch(ctx, topo, target_id).await,
        ClusterKind::SharedStorage => test_shared_storage_can_switch(topo, target_id),
    }
}

/// Check, then run the switch on the task pool
pub async fn start_switchover(
    ctx: &Arc<HaContext>,
    cluster_id: ClusterId,
    target_id: NodeId,
) -> Result<TaskId> {
    let topo = ctx.topology(cluster_id).await?;
    test_can_switch(ctx, &topo, target_id).await?;
    let task_id = ctx.tasks.create(
        TaskKind::Switch,
        format!("switch {}(dbid={})", cluster_id, target_id),
        Some(cluster_id),
    );
    let runner = Arc::clone(ctx);
    ctx.tasks.spawn(task_id, async move {
        let _ = switchover(&runner, cluster_id, target_id, task_id).await;
    });
    Ok(task_id)
}

/// Make `target_id` the primary of `cluster_id`, logging into `task_id`.
/// The cluster state is restored on every exit path.
pub async fn switchover(
    ctx: &HaContext,
    cluster_id: ClusterId,
    target_id: NodeId,
    task_id: TaskId,
) -> Result<()> {
    let prefix = format!("Switch to primary(cluster={}, db_id={})", cluster_id, target_id);
    ctx.tasks.info(task_id, format!("{}: begin ...", prefix));

    let result = match ClusterLock::acquire(
        Arc::clone(&ctx.store),
        cluster_id,
        &OPERABLE,
        ClusterState::Repairing,
    )
    .await
    {
        Ok(Some(lock)) => {
            lock.run(execute(ctx, task_id, &prefix, cluster_id, target_id), |_, previous| {
                previous
            })
            .await
        }
        Ok(None) => Err(PghaError::Precondition(
            "The cluster is not in Online or Offline status, so it cannot be switched!".to_string(),
        )),
        Err(e) => Err(e),
    };

    match &result {
        Ok(()) => {
            ctx.metrics.switchovers_ok.inc();
            ctx.tasks.info(task_id, format!("{}: success.", prefix));
            ctx.tasks.complete(task_id, TaskState::Success, "Success");
        }
        Err(e) => {
            ctx.metrics.switchovers_failed.inc();
            ctx.tasks
                .complete(task_id, TaskState::Failed, format!("{}: {}", prefix, e));
        }
    }
    result
}

/// Side effects applied so far, undone when the switch fails before the
/// new primary is promoted
#[derive(Default)]
struct Undo {
    old_stopped: bool,
    target_stopped: bool,
    target_off_lb: bool,
}

async fn execute(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    cluster_id: ClusterId,
    target_id: NodeId,
) -> Result<()> {
    let before = ctx.topology(cluster_id).await?;
    match before.cluster.kind {
        ClusterKind::Replication => {
            replication_switch(ctx, task_id, prefix, &before, target_id).await
        }
        ClusterKind::SharedStorage => {
            shared_storage_switch(ctx, task_id, prefix, &before, target_id).await
        }
    }
}

async fn replication_switch(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    before: &Topology,
    target_id: NodeId,
) -> Result<()> {
    let cluster = &before.cluster;
    let (old, target) = switch_pair(before, target_id)?;
    let mut undo = Undo::default();

    let prepared = match prepare(ctx, task_id, prefix, cluster, &old, &target, &mut undo).await {
        Ok(()) => promote(ctx, task_id, prefix, &target).await,
        Err(e) => Err(e),
    };
    if let Err(e) = prepared {
        ctx.tasks.error(task_id, format!("{}: {}", prefix, e));
        rollback(ctx, task_id, prefix, cluster, &old, &target, &undo).await;
        return Err(e);
    }

    ctx.tasks.info(
        task_id,
        format!("{}: begin add old primary database({}) to load balancer...", prefix, old.host),
    );
    ctx.lb_apply(Some(task_id), cluster, &old.endpoint(), true).await;

    if let Some(vip) = cluster.write_vip_for(&target.room_id) {
        ctx.tasks.info(
            task_id,
            format!("{}: add primary vip({}) to new primary({}) ...", prefix, vip, target.host),
        );
        if let Err(e) = ctx.vip_on(&target.host, vip, true).await {
            ctx.tasks.error(
                task_id,
                format!("{}: add vip({}) to new primary({}): {}", prefix, vip, target.host, e),
            );
        }
    }

    ctx.store
        .update_node(old.id, Box::new(|n: &mut Node| n.is_primary = false))
        .await?;
    ctx.store
        .update_node(
            target.id,
            Box::new(|n: &mut Node| {
                n.is_primary = true;
                n.up_db_id = None;
            }),
        )
        .await?;

    ctx.tasks.info(
        task_id,
        format!(
            "{}: change all standby database upper level primary database to new primary...",
            prefix
        ),
    );
    let mut to_repoint: Vec<&Node> = vec![&old];
    if !cluster.failover_keep_cascaded {
        to_repoint.extend(
            before
                .normal_standbys()
                .filter(|n| n.id != target.id && n.id != old.id),
        );
    }
    for standby in to_repoint {
        let repointed = async {
            let control = ctx.control(&standby.host).await?;
            control
                .change_upstream(&standby.pgdata, &upstream_config(&target, standby))
                .await?
                .check("change_upstream")?;
            if standby.id == old.id {
                control.start(&standby.pgdata).await?.check("start")?;
            }
            Ok::<(), PghaError>(())
        }
        .await;
        match repointed {
            Ok(()) if standby.id == old.id => {
                ctx.store.set_db_state(old.id, DbState::Running).await?;
            }
            Ok(()) => {}
            Err(e) => ctx.tasks.warn(
                task_id,
                format!("{}: change host-{} updb failed: {}", prefix, standby.host, e),
            ),
        }
        ctx.store.set_up_db(standby.id, Some(target.id)).await?;
    }

    finish(ctx, task_id, prefix, before, &old, &target).await
}

/// Fire the trigger on the new primary and record its room
async fn finish(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    before: &Topology,
    old: &Node,
    target: &Node,
) -> Result<()> {
    let cluster_id = before.cluster.id;
    let after = ctx.topology(cluster_id).await?;
    if let Some(new_primary) = after.node(target.id) {
        ctx.fire_trigger(task_id, before, &after, new_primary, 2, prefix, &old.host)
            .await;
    }

    ctx.tasks.info(
        task_id,
        format!("Update cluster(cluster_id: {}) computer room information", cluster_id),
    );
    let room = target.room_id.clone();
    ctx.store
        .update_cluster(
            cluster_id,
            Box::new(move |c: &mut Cluster| c.current_room = room),
        )
        .await?;
    Ok(())
}

async fn shared_storage_switch(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    before: &Topology,
    target_id: NodeId,
) -> Result<()> {
    let cluster = &before.cluster;
    let (old, target) = shared_storage_pair(before, target_id)?;
    let mut undo = Undo::default();

    if let Err(e) = hand_over(ctx, task_id, prefix, cluster, &old, &target, &mut undo).await {
        ctx.tasks.error(task_id, format!("{}: {}", prefix, e));
        rollback(ctx, task_id, prefix, cluster, &old, &target, &undo).await;
        return Err(e);
    }

    ctx.lb_apply(Some(task_id), cluster, &old.endpoint(), true).await;
    if let Some(vip) = cluster.write_vip_for(&target.room_id) {
        ctx.tasks.info(
            task_id,
            format!("{}: add primary vip({}) to new primary({}) ...", prefix, vip, target.host),
        );
        if let Err(e) = ctx.vip_on(&target.host, vip, true).await {
            ctx.tasks.error(
                task_id,
                format!("{}: add vip({}) to new primary({}): {}", prefix, vip, target.host, e),
            );
        }
    }

    let new_id = target.id;
    ctx.store
        .update_node(
            target.id,
            Box::new(|n: &mut Node| {
                n.is_primary = true;
                n.up_db_id = None;
                if let Some(p) = n.polar.as_mut() {
                    p.role = PolarRole::Master;
                }
            }),
        )
        .await?;
    ctx.store
        .update_node(
            old.id,
            Box::new(move |n: &mut Node| {
                n.is_primary = false;
                n.up_db_id = Some(new_id);
                if let Some(p) = n.polar.as_mut() {
                    p.role = PolarRole::Reader;
                }
            }),
        )
        .await?;

    ctx.tasks.info(
        task_id,
        format!("{}: Redirect all the standby databases to the new primary...", prefix),
    );
    let mut to_repoint: Vec<&Node> = if cluster.failover_keep_cascaded {
        before.children_of(old.id)
    } else {
        before.normal_standbys().collect()
    };
    to_repoint.retain(|n| n.id != target.id && n.id != old.id && n.is_normal());
    to_repoint.push(&old);
    for standby in to_repoint {
        let repointed = async {
            let control = ctx.control(&standby.host).await?;
            if standby.id != old.id {
                control
                    .stop(&standby.pgdata, STANDBY_STOP_WAIT)
                    .await?
                    .check("stop")?;
            }
            control
                .change_upstream(&standby.pgdata, &upstream_config(&target, standby))
                .await?
                .check("change_upstream")?;
            control.start(&standby.pgdata).await?.check("start")?;
            Ok::<(), PghaError>(())
        }
        .await;
        match repointed {
            Ok(()) => ctx.store.set_db_state(standby.id, DbState::Running).await?,
            Err(e) => ctx.tasks.warn(
                task_id,
                format!("{}: change host-{} updb failed: {}", prefix, standby.host, e),
            ),
        }
        ctx.store.set_up_db(standby.id, Some(target.id)).await?;
    }

    finish(ctx, task_id, prefix, before, &old, &target).await
}

/// Stop the old master and promote the target on the shared volume
async fn hand_over(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    cluster: &Cluster,
    old: &Node,
    target: &Node,
    undo: &mut Undo,
) -> Result<()> {
    let old_ctl = ctx.control(&old.host).await?;
    if let Some(vip) = cluster.write_vip() {
        ctx.tasks.info(
            task_id,
            format!("{}: drop vip from current primary database({})", prefix, old.host),
        );
        if let Err(e) = ctx.vip_on(&old.host, vip, false).await {
            ctx.tasks.warn(
                task_id,
                format!("{}: delete vip({}) from host({}): {}", prefix, vip, old.host, e),
            );
        }
    }

    ctx.tasks.info(
        task_id,
        format!("{}: begin stopping current primary database({})...", prefix, old.host),
    );
    undo.old_stopped = true;
    old_ctl
        .stop(&old.pgdata, ctx.settings.stop_wait_secs)
        .await?
        .check("stop")
        .map_err(|e| {
            PghaError::Internal(format!(
                "current primary database({}) can not be stopped. ({})",
                old.host, e
            ))
        })?;

    undo.target_off_lb = true;
    ctx.lb_apply(Some(task_id), cluster, &target.endpoint(), false).await;
    promote(ctx, task_id, prefix, target).await
}

/// Everything up to a caught-up target that is ready to be promoted
async fn prepare(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    cluster: &Cluster,
    old: &Node,
    target: &Node,
    undo: &mut Undo,
) -> Result<()> {
    let old_ctl = ctx.control(&old.host).await?;
    if let Some(vip) = cluster.write_vip() {
        ctx.tasks.info(
            task_id,
            format!("{}: drop vip from current primary database({})", prefix, old.host),
        );
        if let Err(e) = ctx.vip_on(&old.host, vip, false).await {
            ctx.tasks.warn(
                task_id,
                format!("{}: delete vip({}) from host({}): {}", prefix, vip, old.host, e),
            );
        }
    }

    ctx.tasks.info(
        task_id,
        format!("{}: begin stopping current primary database({})...", prefix, old.host),
    );
    undo.old_stopped = true;
    old_ctl
        .stop(&old.pgdata, ctx.settings.stop_wait_secs)
        .await?
        .check("stop")
        .map_err(|e| {
            PghaError::Internal(format!(
                "current primary database({}) can not be stopped. ({})",
                old.host, e
            ))
        })?;
    ctx.tasks.info(
        task_id,
        format!("{}: current primary database({}) stopped.", prefix, old.host),
    );

    check_wal(ctx, old, target).await?;

    ctx.tasks.info(
        task_id,
        format!(
            "{}: begin remove new primary database({}) from load balancer ...",
            prefix, target.host
        ),
    );
    undo.target_off_lb = true;
    ctx.lb_apply(Some(task_id), cluster, &target.endpoint(), false).await;

    ctx.tasks.info(
        task_id,
        format!("{}: stop new primary database then sync wal from old primary ...", prefix),
    );
    let target_ctl = ctx.control(&target.host).await?;
    undo.target_stopped = true;
    target_ctl
        .stop(&target.pgdata, ctx.settings.stop_wait_secs)
        .await?
        .check("stop")?;
    target_ctl
        .cp_delay_wal_from(&old.host, &old.pgdata, &target.pgdata)
        .await?
        .check("cp_delay_wal_from")?;

    ctx.tasks.info(
        task_id,
        format!("{}: restart new primary database and wait it is ready ...", prefix),
    );
    target_ctl.start(&target.pgdata).await?.check("start")?;
    undo.target_stopped = false;
    wait_ready(ctx, target_ctl.as_ref(), target).await?;
    ctx.tasks.info(
        task_id,
        format!("{}: new primary database started and it is ready.", prefix),
    );
    Ok(())
}

async fn promote(ctx: &HaContext, task_id: TaskId, prefix: &str, target: &Node) -> Result<()> {
    ctx.tasks
        .info(task_id, format!("{}: promote new primary ...", prefix));
    let target_ctl = ctx.control(&target.host).await?;
    target_ctl
        .promote(&target.pgdata)
        .await?
        .check("promote")
        .map_err(|e| {
            PghaError::Internal(format!(
                "new primary database({}) can not be promoted. ({})",
                target.host, e
            ))
        })
        .map(|_| ())
}

async fn rollback(
    ctx: &HaContext,
    task_id: TaskId,
    prefix: &str,
    cluster: &Cluster,
    old: &Node,
    target: &Node,
    undo: &Undo,
) {
    if undo.old_stopped {
        ctx.tasks.info(
            task_id,
            format!(
                "{}: switch failed, start the original primary database({}).",
                prefix, old.host
            ),
        );
        let started = match ctx.control(&old.host).await {
            Ok(c) => c.start(&old.pgdata).await.and_then(|r| r.check("start")),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            ctx.tasks
                .error(task_id, format!("{}: start original primary: {}", prefix, e));
        }
    }
    if let Some(vip) = cluster.write_vip() {
        ctx.tasks.info(
            task_id,
            format!(
                "{}: add vip({}) to the original primary database({})...",
                prefix, vip, old.host
            ),
        );
        if let Err(e) = ctx.vip_on(&old.host, vip, true).await {
            ctx.tasks.error(
                task_id,
                format!(
                    "{}: add vip({}) to original primary database({}): {}",
                    prefix, vip, old.host, e
                ),
            );
        }
    }
    if undo.target_stopped {
        let started = match ctx.control(&target.host).await {
            Ok(c) => c.start(&target.pgdata).await.and_then(|r| r.check("start")),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            ctx.tasks
                .error(task_id, format!("{}: restart standby({}): {}", prefix, target.host, e));
        }
    }
    if undo.target_off_lb {
        ctx.lb_apply(Some(task_id), cluster, &target.endpoint(), true).await;
    }
}
