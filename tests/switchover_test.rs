//! Planned switchover and its rollback

mod common;

use common::{cluster, primary, standby, Harness, LB, VIP};
use pgha::error::PghaError;
use pgha::ha::switchover::{start_switchover, test_can_switch, test_sr_can_switch};
use pgha::meta::{ClusterKind, ClusterState, DbState, Node, PolarInfo, PolarRole};
use pgha::task::TaskState;

const WAL_FILE: &str = "000000010000000000000003";
const WAL_PATH: &str = "/data/pg/pg_wal/000000010000000000000003";

fn harness() -> Harness {
    let h = Harness::new(
        vec![cluster()],
        vec![primary(1, "p"), standby(2, "s", 1, 1), standby(3, "c", 1, 1)],
    );
    h.probe.set_wal_file(WAL_FILE);
    h.agents.put_vip("p", VIP);
    h.lb.seed(LB, "s:5432");
    h.lb.seed(LB, "c:5432");
    h
}

#[tokio::test]
async fn test_preflight_reports_wal_path() {
    let h = harness();
    let topo = h.ctx.topology(1).await.unwrap();
    let plan = test_sr_can_switch(&h.ctx, &topo, 2).await.unwrap();
    assert_eq!(plan.old_primary.id, 1);
    assert_eq!(plan.target.id, 2);
    assert_eq!(plan.wal_path.as_deref(), Some(WAL_PATH));
    assert!(!h.agents.did("p", "stop"));
}

#[tokio::test]
async fn test_preflight_rejections() {
    let h = Harness::new(
        vec![cluster()],
        vec![primary(1, "p"), standby(2, "s", 1, 1), standby(3, "t", 2, 1)],
    );
    h.probe.set_wal_file(WAL_FILE);
    let topo = h.ctx.topology(1).await.unwrap();

    let err = test_sr_can_switch(&h.ctx, &topo, 1).await.unwrap_err();
    assert!(err.to_string().contains("already is primary"));
    let err = test_sr_can_switch(&h.ctx, &topo, 3).await.unwrap_err();
    assert!(err.to_string().contains("direct subordinate"));
    let err = test_sr_can_switch(&h.ctx, &topo, 8).await.unwrap_err();
    assert!(matches!(err, PghaError::NodeNotFound(8)));

    h.agents.set_missing_path(WAL_PATH);
    let err = test_sr_can_switch(&h.ctx, &topo, 2).await.unwrap_err();
    assert!(matches!(err, PghaError::Precondition(_)));
    assert!(err.to_string().contains(WAL_PATH));
}

#[tokio::test]
async fn test_switch_refused_while_cluster_busy() {
    let mut c = cluster();
    c.state = ClusterState::Failover;
    let h = Harness::new(vec![c], vec![primary(1, "p"), standby(2, "s", 1, 1)]);
    h.probe.set_wal_file(WAL_FILE);

    let err = start_switchover(&h.ctx, 1, 2).await.unwrap_err();
    assert!(matches!(err, PghaError::Precondition(_)));
    assert!(h.ctx.tasks.tasks_of(1).is_empty());
}

#[tokio::test]
async fn test_switchover_swaps_roles() {
    let h = harness();

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;
    assert_eq!(h.ctx.tasks.state(task_id), Some(TaskState::Success));

    // the target is stopped while it copies the last WAL of the old primary
    let ops = h.agents.ops_on("s");
    let stop = ops.iter().position(|o| o == "stop").unwrap();
    let copy = ops.iter().position(|o| o == "cp_delay_wal_from:p").unwrap();
    let start = ops.iter().position(|o| o == "start").unwrap();
    let promote = ops.iter().position(|o| o == "promote").unwrap();
    assert!(stop < copy && copy < start && start < promote);

    let new = h.node(2).await;
    assert!(new.is_primary);
    assert_eq!(new.up_db_id, None);
    let old = h.node(1).await;
    assert!(!old.is_primary);
    assert_eq!(old.up_db_id, Some(2));
    assert_eq!(old.db_state, DbState::Running);
    assert_eq!(h.agents.upstream_of("p").as_deref(), Some("s"));
    assert_eq!(h.agents.upstream_of("c").as_deref(), Some("s"));
    assert_eq!(h.node(3).await.up_db_id, Some(2));

    assert!(h.agents.has_vip("s", VIP));
    assert!(!h.agents.has_vip("p", VIP));
    assert_eq!(h.lb.backends(LB), vec!["c:5432", "p:5432"]);
    assert_eq!(h.cluster(1).await.state, ClusterState::Normal);
    assert_eq!(h.ctx.metrics.switchovers_ok.get(), 1);
}

#[tokio::test]
async fn test_switchover_keeps_offline_state() {
    let mut c = cluster();
    c.state = ClusterState::Offline;
    let h = Harness::new(vec![c], vec![primary(1, "p"), standby(2, "s", 1, 1)]);
    h.probe.set_wal_file(WAL_FILE);

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;
    assert_eq!(h.ctx.tasks.state(task_id), Some(TaskState::Success));
    assert_eq!(h.cluster(1).await.state, ClusterState::Offline);
}

#[tokio::test]
async fn test_failed_wal_copy_rolls_back() {
    let h = harness();
    h.agents.fail_op("s", "cp_delay_wal_from:p");

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;

    let task = h.ctx.tasks.get(task_id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task
        .log
        .iter()
        .any(|e| e.message.contains("start the original primary")));

    assert!(h.node(1).await.is_primary);
    assert!(!h.node(2).await.is_primary);
    assert!(h.agents.did("p", "start"));
    assert!(h.agents.did("s", "start"));
    assert!(!h.agents.did("s", "promote"));
    assert!(h.agents.has_vip("p", VIP));
    assert_eq!(h.lb.backends(LB), vec!["c:5432", "s:5432"]);
    assert_eq!(h.cluster(1).await.state, ClusterState::Normal);
    assert_eq!(h.ctx.metrics.switchovers_failed.get(), 1);
}

#[tokio::test]
async fn test_failed_promote_rolls_back() {
    let h = harness();
    h.agents.fail_op("s", "promote");

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;

    let task = h.ctx.tasks.get(task_id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.last_message.contains("can not be promoted"));

    let old = h.node(1).await;
    assert!(old.is_primary);
    assert_eq!(old.up_db_id, None);
    let target = h.node(2).await;
    assert!(!target.is_primary);
    assert_eq!(target.up_db_id, Some(1));

    assert!(h.agents.did("p", "start"));
    assert!(h.agents.has_vip("p", VIP));
    assert!(!h.agents.has_vip("s", VIP));
    assert_eq!(h.agents.upstream_of("p"), None);
    assert_eq!(h.agents.upstream_of("c"), None);
    assert_eq!(h.lb.backends(LB), vec!["c:5432", "s:5432"]);
    assert_eq!(h.cluster(1).await.state, ClusterState::Normal);
    assert_eq!(h.ctx.metrics.switchovers_failed.get(), 1);
}

#[tokio::test]
async fn test_old_primary_that_cannot_stop_keeps_its_role() {
    let h = harness();
    h.agents.fail_op("p", "stop");

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;

    assert_eq!(h.ctx.tasks.state(task_id), Some(TaskState::Failed));
    assert!(!h.agents.did("s", "stop"));
    assert!(h.agents.has_vip("p", VIP));
    assert!(h.node(1).await.is_primary);
    assert_eq!(h.lb.backends(LB), vec!["c:5432", "s:5432"]);
}

fn polar(mut node: Node, role: PolarRole) -> Node {
    node.polar = Some(PolarInfo {
        role,
        reset_cmd: None,
    });
    node
}

fn shared_storage() -> Harness {
    let mut c = cluster();
    c.kind = ClusterKind::SharedStorage;
    let h = Harness::new(
        vec![c],
        vec![
            polar(primary(1, "p"), PolarRole::Master),
            polar(standby(2, "r", 1, 1), PolarRole::Reader),
            polar(standby(3, "t", 1, 2), PolarRole::Reader),
            polar(standby(4, "d", 1, 3), PolarRole::Standby),
        ],
    );
    h.agents.put_vip("p", VIP);
    h.lb.seed(LB, "r:5432");
    h.lb.seed(LB, "t:5432");
    h
}

#[tokio::test]
async fn test_shared_storage_preflight_skips_wal_check() {
    let h = shared_storage();
    let topo = h.ctx.topology(1).await.unwrap();

    let plan = test_can_switch(&h.ctx, &topo, 2).await.unwrap();
    assert_eq!(plan.target.id, 2);
    assert_eq!(plan.wal_path, None);
    assert!(!h.agents.did("p", "path_exists"));

    let err = test_can_switch(&h.ctx, &topo, 4).await.unwrap_err();
    assert!(matches!(err, PghaError::Precondition(_)));
    assert!(err.to_string().contains("polar standby"));
}

#[tokio::test]
async fn test_shared_storage_switch_hands_over_volume() {
    let h = shared_storage();

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;
    assert_eq!(h.ctx.tasks.state(task_id), Some(TaskState::Success));

    // the old master leaves the volume before the reader is promoted
    let ops = h.agents.all_ops();
    let stop = ops.iter().position(|(host, op)| host == "p" && op == "stop").unwrap();
    let promote = ops.iter().position(|(host, op)| host == "r" && op == "promote").unwrap();
    assert!(stop < promote);
    assert!(!h.agents.did("r", "stop"));
    assert!(h
        .agents
        .all_ops()
        .iter()
        .all(|(_, o)| !o.starts_with("cp_delay_wal_from")));

    let new = h.node(2).await;
    assert!(new.is_primary);
    assert_eq!(new.up_db_id, None);
    assert_eq!(new.polar_role(), Some(PolarRole::Master));
    let old = h.node(1).await;
    assert!(!old.is_primary);
    assert_eq!(old.up_db_id, Some(2));
    assert_eq!(old.polar_role(), Some(PolarRole::Reader));

    assert_eq!(h.agents.upstream_of("p").as_deref(), Some("r"));
    assert_eq!(h.agents.upstream_of("t").as_deref(), Some("r"));
    assert_eq!(h.agents.ops_on("t"), vec!["stop", "change_upstream", "start"]);
    assert_eq!(h.node(3).await.up_db_id, Some(2));

    assert!(h.agents.has_vip("r", VIP));
    assert!(!h.agents.has_vip("p", VIP));
    assert_eq!(h.lb.backends(LB), vec!["p:5432", "t:5432"]);
    assert_eq!(h.cluster(1).await.state, ClusterState::Normal);
}

#[tokio::test]
async fn test_shared_storage_failed_promote_restarts_old_master() {
    let h = shared_storage();
    h.agents.fail_op("r", "promote");

    let task_id = start_switchover(&h.ctx, 1, 2).await.unwrap();
    h.settle(1).await;
    assert_eq!(h.ctx.tasks.state(task_id), Some(TaskState::Failed));

    let old = h.node(1).await;
    assert!(old.is_primary);
    assert_eq!(old.polar_role(), Some(PolarRole::Master));
    assert!(!h.node(2).await.is_primary);
    assert!(h.agents.did("p", "start"));
    assert!(h.agents.has_vip("p", VIP));
    assert!(!h.agents.did("t", "stop"));
    assert_eq!(h.lb.backends(LB), vec!["r:5432", "t:5432"]);
    assert_eq!(h.cluster(1).await.state, ClusterState::Normal);
}
