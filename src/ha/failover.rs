//! Failover of a database that failed its health probe.
//!
//! Called by the cluster monitor while it holds the cluster in CHECKING.
//! The monitor decides the final cluster state from the returned result.

use super::reconcile::relocate_read_vip;
use super::{db_endpoint, pause, repl_endpoint, upstream_config, HaContext};
use crate::agent::Lsn;
use crate::error::{PghaError, Result};
use crate::meta::{
    Cluster, ClusterKind, ClusterState, DbState, Node, NodeId, NodeState, PolarRole, Topology,
};
use crate::task::{TaskId, TaskKind, TaskState};
use futures::future::join_all;

const LIVENESS_SQL: &str = "SELECT 1";
/// Seconds a standby gets to stop before it is repointed
const REPOINT_STOP_WAIT: u64 = 5;

/// Fail over `node_id` of `cluster_id`. `probe_errors` are the messages of
/// the failed health probe and open the task log.
pub async fn failover(
    ctx: &HaContext,
    cluster_id: u32,
    node_id: NodeId,
    probe_errors: &[String],
) -> Result<()> {
    let topo = ctx.topology(cluster_id).await?;
    let node = topo
        .node(node_id)
        .cloned()
        .ok_or(PghaError::NodeNotFound(node_id))?;

    let role = if node.is_primary { "primary" } else { "standby" };
    let task_id = ctx.tasks.create(
        TaskKind::Failover,
        format!("failover {}({} dbid={})", cluster_id, role, node_id),
        Some(cluster_id),
    );
    for msg in probe_errors {
        ctx.tasks.error(task_id, msg.clone());
    }

    let result = match ctx
        .store
        .set_cluster_state(cluster_id, ClusterState::Failover)
        .await
    {
        Ok(()) => run(ctx, task_id, &topo, &node).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(msg) => {
            ctx.metrics.failovers_ok.inc();
            ctx.tasks.complete(task_id, TaskState::Success, msg.clone());
        }
        Err(e) => {
            ctx.metrics.failovers_failed.inc();
            ctx.tasks
                .complete(task_id, TaskState::Failed, format!("Failover failed: {}", e));
        }
    }
    result.map(|_| ())
}

async fn run(ctx: &HaContext, task_id: TaskId, topo: &Topology, node: &Node) -> Result<String> {
    if try_restart(ctx, task_id, topo, node).await {
        return Ok(format!(
            "database({}) restarted in place, no failover needed",
            node.endpoint()
        ));
    }

    check_isolation(ctx, task_id, topo, node).await?;

    if !node.is_primary {
        standby_failover(ctx, task_id, topo, node).await?;
        return Ok(format!("standby({}) failover completed", node.endpoint()));
    }

    ctx.store.set_node_state(node.id, NodeState::Failover).await?;
    let result = match topo.cluster.kind {
        ClusterKind::Replication => primary_failover(ctx, task_id, topo, node).await,
        ClusterKind::SharedStorage => shared_storage_failover(ctx, task_id, topo, node).await,
    };
    if let Err(e) = ctx.store.set_node_state(node.id, NodeState::Fault).await {
        ctx.tasks.error(
            task_id,
            format!("set database({}) state to FAULT failed: {}", node.id, e),
        );
    }
    let elected = result?;
    Ok(format!(
        "primary failover completed, database({}) is the new primary",
        elected
    ))
}

/// Restart a database whose host is still reachable.
/// True when the database came back and answers queries.
async fn try_restart(ctx: &HaContext, task_id: TaskId, topo: &Topology, node: &Node) -> bool {
    let control = match ctx.control(&node.host).await {
        Ok(c) => c,
        Err(e) => {
            ctx.tasks.info(
                task_id,
                format!("host({}) is unreachable ({}), skip restart", node.host, e),
            );
            return false;
        }
    };
    let endpoint = db_endpoint(&topo.cluster, node, None);
    let retries = ctx.settings.restart_retries;
    for attempt in 1..=retries {
        ctx.tasks.info(
            task_id,
            format!(
                "host({}) is reachable, try to start database ({}/{}) ...",
                node.host, attempt, retries
            ),
        );
        match control.start(&node.pgdata).await.and_then(|r| r.check("start")) {
            Ok(_) => {}
            Err(e) => {
                ctx.tasks
                    .warn(task_id, format!("start database({}) failed: {}", node.endpoint(), e));
                pause(ctx.settings.restart_delay).await;
                continue;
            }
        }
        pause(ctx.settings.restart_delay).await;
        match ctx
            .probe
            .probe(&endpoint, LIVENESS_SQL, topo.cluster.probe.timeout())
            .await
        {
            Ok(()) => {
                ctx.tasks
                    .info(task_id, format!("database({}) is alive again", node.endpoint()));
                return true;
            }
            Err(e) => {
                ctx.tasks.warn(
                    task_id,
                    format!("database({}) started but does not answer: {}", node.endpoint(), e),
                );
                if let Err(e) = control.stop(&node.pgdata, 0).await {
                    ctx.tasks
                        .warn(task_id, format!("stop database({}) failed: {}", node.endpoint(), e));
                }
            }
        }
    }
    false
}

/// Refuse to act when no other host of the cluster answers a ping: the
/// fault is more likely on this side of the network.
async fn check_isolation(
    ctx: &HaContext,
    task_id: TaskId,
    topo: &Topology,
    node: &Node,
) -> Result<()> {
    let hosts: Vec<String> = topo
        .hosts()
        .into_iter()
        .filter(|h| *h != node.host)
        .collect();
    if hosts.is_empty() {
        return Ok(());
    }
    let replies = join_all(hosts.iter().map(|h| ctx.pinger.reachable(h))).await;
    if replies.iter().any(|ok| *ok) {
        return Ok(());
    }
    let msg = "Clup became Isolated network, so can not failover.".to_string();
    ctx.tasks.fatal(task_id, msg.clone());
    Err(PghaError::Isolated(msg))
}

async fn standby_failover(
    ctx: &HaContext,
    task_id: TaskId,
    topo: &Topology,
    node: &Node,
) -> Result<()> {
    let cluster = &topo.cluster;

    if let Some(vip) = cluster.read_vip() {
        if cluster.read_vip_host.as_deref() == Some(node.host.as_str()) {
            if let Err(e) = ctx.vip_on(&node.host, vip, false).await {
                ctx.tasks
                    .warn(task_id, format!("remove read vip({}) from {}: {}", vip, node.host, e));
            }
            match relocate_read_vip(ctx, topo, vip, Some(&node.host)).await {
                Ok(Some(host)) => ctx
                    .tasks
                    .info(task_id, format!("read vip({}) moved to {}", vip, host)),
                Ok(None) => ctx.tasks.warn(
                    task_id,
                    format!("no other standby can carry read vip({}), leave it down", vip),
                ),
                Err(e) => ctx
                    .tasks
                    .error(task_id, format!("move read vip({}) failed: {}", vip, e)),
            }
        }
    }

    ctx.lb_apply(Some(task_id), cluster, &node.endpoint(), false).await;
    ctx.store.set_node_state(node.id, NodeState::Fault).await?;
    ctx.tasks
        .info(task_id, format!("database({}) marked FAULT", node.endpoint()));

    let after = ctx.topology(cluster.id).await?;
    if let Some(primary) = after.normal_primary() {
        ctx.fire_trigger(task_id, topo, &after, primary, 1, "failover", &node.host)
            .await;
    }

    for child in topo.children_of(node.id) {
        ctx.tasks.info(
            task_id,
            format!("database({}) now streams from {:?}", child.id, node.up_db_id),
        );
        if let Some(up) = node.up_db_id.and_then(|id| topo.node(id)) {
            if let Err(e) = change_upstream(ctx, up, child).await {
                ctx.tasks.warn(
                    task_id,
                    format!("repoint database({}) to {} failed: {}", child.id, up.endpoint(), e),
                );
            }
        }
        ctx.store.set_up_db(child.id, node.up_db_id).await?;
    }
    Ok(())
}

async fn change_upstream(ctx: &HaContext, upstream: &Node, standby: &Node) -> Result<()> {
    let control = ctx.control(&standby.host).await?;
    control
        .change_upstream(&standby.pgdata, &upstream_config(upstream, standby))
        .await?
        .check("change_upstream")?;
    Ok(())
}

/// NORMAL standbys that may replace `old`
fn failover_candidates<'a>(topo: &'a Topology, old: &Node) -> Vec<&'a Node> {
    let mut list: Vec<&Node> = topo
        .normal_standbys()
        .filter(|n| n.id != old.id)
        .filter(|n| topo.cluster.auto_failover || n.room_id == old.room_id)
        .filter(|n| n.polar_role() != Some(PolarRole::Standby))
        .collect();
    list.sort_by_key(|n| n.score);
    list
}

/// Result of the LSN election
#[derive(Debug, Clone)]
pub struct Election {
    pub elected: Node,
    pub elected_lsn: Lsn,
    /// Holder of the most advanced WAL among the probed candidates
    pub max_holder: Node,
    pub max_lsn: Lsn,
}

/// Elect among `candidates`: lowest score wins, highest LSN breaks ties.
/// Candidates whose LSN cannot be read are skipped.
pub async fn elect(ctx: &HaContext, task_id: TaskId, candidates: &[&Node]) -> Result<Election> {
    let mut sorted: Vec<&Node> = candidates.to_vec();
    sorted.sort_by_key(|n| n.score);

    let mut probed: Vec<(&Node, Lsn)> = Vec::with_capacity(sorted.len());
    for node in sorted {
        match ctx
            .probe
            .last_lsn(&repl_endpoint(node), ctx.settings.sql_timeout)
            .await
        {
            Ok((lsn, _timeline)) => {
                ctx.tasks
                    .info(task_id, format!("database({}) lsn is {}", node.endpoint(), lsn));
                probed.push((node, lsn));
            }
            Err(e) => ctx.tasks.warn(
                task_id,
                format!("get lsn of database({}) failed, skip it: {}", node.endpoint(), e),
            ),
        }
    }

    let best_score = probed
        .iter()
        .map(|(n, _)| n.score)
        .min()
        .ok_or_else(|| PghaError::Election("no candidate answered the lsn query".to_string()))?;
    let mut elected: Option<(&Node, Lsn)> = None;
    let mut max: Option<(&Node, Lsn)> = None;
    for &(node, lsn) in &probed {
        if node.score == best_score && elected.map_or(true, |(_, l)| lsn > l) {
            elected = Some((node, lsn));
        }
        if max.map_or(true, |(_, l)| lsn > l) {
            max = Some((node, lsn));
        }
    }
    match (elected, max) {
        (Some((e, el)), Some((m, ml))) => Ok(Election {
            elected: e.clone(),
            elected_lsn: el,
            max_holder: m.clone(),
            max_lsn: ml,
        }),
        _ => Err(PghaError::Election("no candidate answered the lsn query".to_string())),
    }
}

/// Streaming replication primary failover. Returns the new primary's id.
async fn primary_failover(
    ctx: &HaContext,
    task_id: TaskId,
    topo: &Topology,
    old: &Node,
) -> Result<NodeId> {
    let cluster = &topo.cluster;

    if let Some(vip) = cluster.write_vip() {
        if let Err(e) = ctx.vip_on(&old.host, vip, false).await {
            ctx.tasks
                .warn(task_id, format!("remove vip({}) from old primary: {}", vip, e));
        }
    }

    let candidates = failover_candidates(topo, old);
    if candidates.is_empty() {
        return Err(PghaError::Election(format!(
            "no standby of cluster({}) can take over",
            cluster.id
        )));
    }

    for child in topo.children_of(old.id).into_iter().filter(|n| n.is_normal()) {
        let paused = match ctx.control(&child.host).await {
            Ok(c) => c
                .pause_replica_receive(&child.pgdata, child.port)
                .await
                .and_then(|r| r.check("pause_replica_receive"))
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = paused {
            ctx.tasks.warn(
                task_id,
                format!("pause wal receiver of database({}) failed: {}", child.endpoint(), e),
            );
        }
    }

    let election = elect(ctx, task_id, &candidates).await?;
    let new = election.elected.clone();
    ctx.tasks.info(
        task_id,
        format!("database({}) elected as new primary", new.endpoint()),
    );
    let control = ctx.control(&new.host).await?;

    if election.max_lsn > election.elected_lsn {
        let src = &election.max_holder;
        ctx.tasks.info(
            task_id,
            format!(
                "database({}) is behind {} ({} < {}), copy missing wal ...",
                new.endpoint(),
                src.endpoint(),
                election.elected_lsn,
                election.max_lsn
            ),
        );
        control
            .stop(&new.pgdata, REPOINT_STOP_WAIT)
            .await?
            .check("stop")?;
        let caught_up = async {
            control
                .cp_delay_wal_from(&src.host, &src.pgdata, &new.pgdata)
                .await?
                .check("cp_delay_wal_from")?;
            control.start(&new.pgdata).await?.check("start")?;
            Ok::<(), PghaError>(())
        }
        .await;
        if let Err(e) = caught_up {
            ctx.tasks.error(
                task_id,
                format!("catch up database({}) failed: {}", new.endpoint(), e),
            );
            match control.start(&new.pgdata).await.and_then(|r| r.check("start")) {
                Ok(_) => ctx
                    .tasks
                    .info(task_id, format!("database({}) started again", new.endpoint())),
                Err(start_err) => ctx.tasks.error(
                    task_id,
                    format!("start database({}) failed: {}", new.endpoint(), start_err),
                ),
            }
            return Err(e);
        }
    }

    let view = ctx.topology(cluster.id).await?;
    if let Some(vip) = cluster.read_vip() {
        if cluster.read_vip_host.as_deref() == Some(new.host.as_str()) {
            if let Err(e) = ctx.vip_on(&new.host, vip, false).await {
                ctx.tasks
                    .warn(task_id, format!("remove read vip from new primary: {}", e));
            }
            match relocate_read_vip(ctx, &view, vip, Some(&new.host)).await {
                Ok(Some(host)) => ctx
                    .tasks
                    .info(task_id, format!("read vip({}) moved to {}", vip, host)),
                Ok(None) => ctx
                    .tasks
                    .warn(task_id, format!("read vip({}) left down", vip)),
                Err(e) => ctx.tasks.warn(task_id, format!("move read vip: {}", e)),
            }
        }
    }

    ctx.tasks
        .info(task_id, format!("promote database({}) ...", new.endpoint()));
    control.promote(&new.pgdata).await?.check("promote")?;
    ctx.store
        .update_node(
            new.id,
            Box::new(|n: &mut Node| {
                n.is_primary = true;
                n.up_db_id = None;
            }),
        )
        .await?;
    ctx.store
        .update_node(old.id, Box::new(|n: &mut Node| n.is_primary = false))
        .await?;

    ctx.lb_apply(Some(task_id), cluster, &new.endpoint(), false).await;

    let to_repoint: Vec<&Node> = if cluster.failover_keep_cascaded {
        let mut list = topo.children_of(old.id);
        list.push(old);
        list
    } else {
        let mut list: Vec<&Node> = topo.normal_standbys().collect();
        list.push(old);
        list
    };
    for standby in to_repoint.into_iter().filter(|n| n.id != new.id) {
        if standby.id != old.id && standby.is_normal() {
            ctx.tasks.info(
                task_id,
                format!("repoint database({}) to {}", standby.endpoint(), new.endpoint()),
            );
            if let Err(e) = change_upstream(ctx, &new, standby).await {
                ctx.tasks.error(
                    task_id,
                    format!("repoint database({}) failed: {}", standby.endpoint(), e),
                );
            }
        }
        ctx.store.set_up_db(standby.id, Some(new.id)).await?;
    }

    if let Some(vip) = cluster.write_vip_for(&new.room_id) {
        match ctx.vip_on(&new.host, vip, true).await {
            Ok(()) => ctx
                .tasks
                .info(task_id, format!("vip({}) added to {}", vip, new.host)),
            Err(e) => ctx
                .tasks
                .error(task_id, format!("add vip({}) to new primary: {}", vip, e)),
        }
    }

    let room = new.room_id.clone();
    ctx.store
        .update_cluster(
            cluster.id,
            Box::new(move |c: &mut Cluster| c.current_room = room),
        )
        .await?;

    let after = ctx.topology(cluster.id).await?;
    if let Some(target) = after.node(new.id) {
        ctx.fire_trigger(task_id, topo, &after, target, 2, "failover", &old.host)
            .await;
    }
    Ok(new.id)
}

/// Shared-storage failover: fence the old master off the volume, then
/// promote a reader. Returns the new primary's id.
async fn shared_storage_failover(
    ctx: &HaContext,
    task_id: TaskId,
    topo: &Topology,
    old: &Node,
) -> Result<NodeId> {
    let cluster = &topo.cluster;
    let new = failover_candidates(topo, old)
        .first()
        .map(|n| (*n).clone())
        .ok_or_else(|| {
            PghaError::Election(format!("no reader of cluster({}) can take over", cluster.id))
        })?;

    let reset_cmd = old
        .polar
        .as_ref()
        .and_then(|p| p.reset_cmd.clone())
        .filter(|c| !c.trim().is_empty())
        .ok_or(PghaError::FencingNotConfigured(old.id))?;
    ctx.tasks
        .info(task_id, format!("fence database({}): {}", old.endpoint(), reset_cmd));
    let code = ctx.fencer.fence(&reset_cmd).await?;
    if code != 0 {
        if !cluster.ignore_reset_cmd_return_code {
            return Err(PghaError::NodeControl {
                op: "fence".to_string(),
                code,
                message: format!("reset command of database({}) failed", old.id),
            });
        }
        ctx.tasks.warn(
            task_id,
            format!("reset command exited with {}, ignored by configuration", code),
        );
    }
    pause(ctx.settings.fence_settle).await;

    if let Some(vip) = cluster.write_vip() {
        if let Err(e) = ctx.vip_on(&old.host, vip, false).await {
            ctx.tasks
                .warn(task_id, format!("remove vip({}) from old master: {}", vip, e));
        }
    }

    let new_id = new.id;
    ctx.store
        .update_node(
            new.id,
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

    let need_restart: Vec<&Node> = if cluster.failover_keep_cascaded {
        topo.children_of(old.id)
    } else {
        topo.normal_standbys().collect()
    }
    .into_iter()
    .filter(|n| n.id != new.id && n.id != old.id)
    .collect();

    for standby in &need_restart {
        let result = async {
            let control = ctx.control(&standby.host).await?;
            control.stop(&standby.pgdata, REPOINT_STOP_WAIT).await?.check("stop")?;
            control
                .change_upstream(&standby.pgdata, &upstream_config(&new, standby))
                .await?
                .check("change_upstream")?;
            Ok::<(), PghaError>(())
        }
        .await;
        if let Err(e) = result {
            ctx.tasks.error(
                task_id,
                format!("repoint database({}) failed: {}", standby.endpoint(), e),
            );
        }
        ctx.store.set_up_db(standby.id, Some(new.id)).await?;
    }

    ctx.tasks
        .info(task_id, format!("promote database({}) ...", new.endpoint()));
    let control = ctx.control(&new.host).await?;
    control.promote(&new.pgdata).await?.check("promote")?;

    for standby in &need_restart {
        let started = match ctx.control(&standby.host).await {
            Ok(c) => c.start(&standby.pgdata).await.and_then(|r| r.check("start")),
            Err(e) => Err(e),
        };
        match started {
            Ok(_) => ctx.store.set_db_state(standby.id, DbState::Running).await?,
            Err(e) => ctx.tasks.error(
                task_id,
                format!("start database({}) failed: {}", standby.endpoint(), e),
            ),
        }
    }

    if let Some(vip) = cluster.write_vip_for(&new.room_id) {
        if let Err(e) = ctx.vip_on(&new.host, vip, true).await {
            ctx.tasks
                .error(task_id, format!("add vip({}) to new master: {}", vip, e));
        }
    }

    let room = new.room_id.clone();
    ctx.store
        .update_cluster(
            cluster.id,
            Box::new(move |c: &mut Cluster| c.current_room = room),
        )
        .await?;

    let after = ctx.topology(cluster.id).await?;
    if let Some(target) = after.node(new.id) {
        ctx.fire_trigger(task_id, topo, &after, target, 2, "failover", &old.host)
            .await;
    }
    Ok(new.id)
}
