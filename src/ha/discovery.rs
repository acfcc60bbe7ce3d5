//! Starts a monitor for every cluster in the metadata store.

use super::monitor::spawn_monitor;
use super::HaContext;
use crate::error::Result;
use crate::meta::ClusterId;
use std::sync::Arc;
use tracing::{info, warn};

/// Spawn monitors for clusters that have none. Returns the new ids.
///
/// A monitor unregisters itself when its cluster is deleted, so a cluster
/// re-created under the same id is picked up by a later pass.
pub async fn discover_once(ctx: &Arc<HaContext>) -> Result<Vec<ClusterId>> {
    let mut started = Vec::new();
    for cluster_id in ctx.store.cluster_ids().await? {
        if spawn_monitor(ctx, cluster_id).is_some() {
            info!(cluster_id, "found new cluster, monitor spawned");
            started.push(cluster_id);
        }
    }
    Ok(started)
}

/// Discovery loop, until shutdown
pub async fn run_discovery(ctx: Arc<HaContext>) {
    let mut shutdown = ctx.shutdown.clone();
    info!("cluster discovery started");
    loop {
        if shutdown.is_shutdown() {
            break;
        }
        if let Err(e) = discover_once(&ctx).await {
            warn!("cluster discovery failed: {}", e);
        }
        if shutdown.sleep(ctx.settings.discovery_interval).await {
            break;
        }
    }
    info!("cluster discovery stopped");
}
