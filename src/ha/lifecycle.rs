//! Taking clusters in and out of monitoring.

use super::{db_endpoint, HaContext};
use crate::agent::TriggerCall;
use crate::error::{PghaError, Result};
use crate::meta::{ClusterId, ClusterState, Topology};
use tracing::info;

/// Put an OFFLINE or FAILED cluster back under monitoring.
///
/// A configured trigger function must be callable on the primary first.
pub async fn online(ctx: &HaContext, cluster_id: ClusterId) -> Result<()> {
    let topo = ctx.topology(cluster_id).await?;
    if !matches!(topo.cluster.state, ClusterState::Offline | ClusterState::Failed) {
        return Err(PghaError::Precondition(
            "The cluster is not in an offline or failed state, so it cannot be put online!"
                .to_string(),
        ));
    }
    check_trigger(ctx, &topo).await?;

    match ctx
        .store
        .test_and_set_cluster_state(
            cluster_id,
            &[ClusterState::Offline, ClusterState::Failed],
            ClusterState::Normal,
        )
        .await?
    {
        Some(previous) => {
            info!(cluster_id, "cluster online (was {})", previous);
            Ok(())
        }
        None => Err(PghaError::Precondition(
            "The cluster is not in an offline or failed state, so it cannot be put online!"
                .to_string(),
        )),
    }
}

/// Stop monitoring a NORMAL or FAILED cluster
pub async fn offline(ctx: &HaContext, cluster_id: ClusterId) -> Result<()> {
    match ctx
        .store
        .test_and_set_cluster_state(
            cluster_id,
            &[ClusterState::Normal, ClusterState::Failed],
            ClusterState::Offline,
        )
        .await?
    {
        Some(previous) => {
            info!(cluster_id, "cluster offline (was {})", previous);
            Ok(())
        }
        None => {
            let state = ctx.store.require_cluster(cluster_id).await?.state;
            Err(PghaError::Precondition(format!(
                "Cluster is being operated on(state={}), so it cannot be put offline!",
                state
            )))
        }
    }
}

async fn check_trigger(ctx: &HaContext, topo: &Topology) -> Result<()> {
    let trigger = match &topo.cluster.trigger {
        Some(t) if !t.db_name.is_empty() && !t.function.is_empty() => t,
        _ => return Ok(()),
    };
    let primary = match topo.normal_primary() {
        Some(p) => p,
        None => return Ok(()),
    };
    let snapshot = serde_json::to_string(topo)?;
    let call = TriggerCall {
        function: trigger.function.clone(),
        code: 0,
        message: "online".to_string(),
        host: primary.host.clone(),
        before: snapshot.clone(),
        after: snapshot,
    };
    let endpoint = db_endpoint(&topo.cluster, primary, Some(&trigger.db_name));
    ctx.probe
        .call_trigger(&endpoint, &call, ctx.settings.sql_timeout)
        .await
        .map_err(|e| {
            PghaError::Precondition(format!(
                "Please check if the functions({}) in the database({}) exist and can be executed correctly: {}",
                trigger.function, trigger.db_name, e
            ))
        })
}
