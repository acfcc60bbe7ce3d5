//! Idempotent convergence of VIPs, replication mode and load balancer
//! backends towards the recorded topology.
//!
//! Each step logs its own failures and never aborts the others.

use super::HaContext;
use crate::agent::backend_diff;
use crate::error::Result;
use crate::meta::{Cluster, DbState, Topology};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Run every reconcile step against a fresh topology snapshot
pub async fn reconcile(ctx: &HaContext, topo: &Topology) {
    let cluster_id = topo.cluster.id;
    let steps: [(&str, Result<()>); 4] = [
        ("write vip", ensure_write_vip(ctx, topo).await),
        ("read vip", ensure_read_vip(ctx, topo).await),
        ("replication mode", adjust_sync_mode(ctx, topo).await),
        ("load balancer", sync_load_balancers(ctx, topo).await),
    ];
    for (step, result) in steps {
        if let Err(e) = result {
            ctx.metrics.reconcile_errors.inc();
            warn!(cluster_id, "reconcile {} failed: {}", step, e);
        }
    }
}

/// Bind the write VIP on the live primary and drop it from the other hosts
/// of the current room.
pub async fn ensure_write_vip(ctx: &HaContext, topo: &Topology) -> Result<()> {
    let cluster = &topo.cluster;
    let vip = match cluster.write_vip() {
        Some(v) => v.to_string(),
        None => return Ok(()),
    };
    let primary = match topo.normal_primary() {
        Some(p) => p,
        None => return Ok(()),
    };
    match bind_vip(ctx, &primary.host, &vip).await {
        Ok(true) => info!(
            cluster_id = cluster.id,
            "vip({}) was missing on primary({}), added", vip, primary.host
        ),
        Ok(false) => {}
        Err(e) => warn!(
            cluster_id = cluster.id,
            "bind vip({}) on primary({}): {}", vip, primary.host, e
        ),
    }

    let stray: BTreeSet<&str> = topo
        .nodes
        .iter()
        .filter(|n| !n.is_primary && n.room_id == cluster.current_room && n.host != primary.host)
        .map(|n| n.host.as_str())
        .collect();
    for host in stray {
        remove_vip(ctx, cluster.id, host, &vip).await;
    }
    Ok(())
}

/// Keep the read VIP on exactly one host, relocating it when its holder is
/// gone.
pub async fn ensure_read_vip(ctx: &HaContext, topo: &Topology) -> Result<()> {
    let cluster = &topo.cluster;
    let vip = match cluster.read_vip() {
        Some(v) => v.to_string(),
        None => return Ok(()),
    };

    let current = cluster
        .read_vip_host
        .clone()
        .filter(|host| topo.nodes.iter().any(|n| &n.host == host && n.is_normal()));

    // An unreachable holder agent counts as a dead holder.
    let (kept, exclude) = match current {
        Some(host) => match bind_vip(ctx, &host, &vip).await {
            Ok(added) => {
                if added {
                    info!(
                        cluster_id = cluster.id,
                        "read vip({}) was missing on {}, added", vip, host
                    );
                }
                (Some(host), None)
            }
            Err(e) => {
                warn!(cluster_id = cluster.id, "read vip holder {} unreachable: {}", host, e);
                (None, Some(host))
            }
        },
        None => (None, None),
    };

    let holder = match kept {
        Some(host) => host,
        None => match relocate_read_vip(ctx, topo, &vip, exclude.as_deref()).await? {
            Some(host) => host,
            None => {
                warn!(cluster_id = cluster.id, "no host can carry read vip({})", vip);
                return Ok(());
            }
        },
    };

    for host in topo.hosts() {
        if host != holder {
            remove_vip(ctx, cluster.id, &host, &vip).await;
        }
    }
    Ok(())
}

/// Add the read VIP on the first NORMAL host willing to take it: standbys
/// first, primary last, `exclude` never. Records the new holder.
pub async fn relocate_read_vip(
    ctx: &HaContext,
    topo: &Topology,
    vip: &str,
    exclude: Option<&str>,
) -> Result<Option<String>> {
    let cluster_id = topo.cluster.id;
    let mut hosts: Vec<&str> = topo
        .normal_standbys()
        .map(|n| n.host.as_str())
        .filter(|h| Some(*h) != exclude)
        .collect();
    if let Some(p) = topo.normal_primary() {
        if Some(p.host.as_str()) != exclude {
            hosts.push(p.host.as_str());
        }
    }
    hosts.dedup();

    for host in hosts {
        let control = match ctx.control(host).await {
            Ok(c) => c,
            Err(e) => {
                debug!(cluster_id, "skip {} for read vip: {}", host, e);
                continue;
            }
        };
        match control.add_vip(vip).await {
            Ok(reply) if reply.is_ok() => {
                let holder = host.to_string();
                let recorded = holder.clone();
                ctx.store
                    .update_cluster(
                        cluster_id,
                        Box::new(move |c: &mut Cluster| c.read_vip_host = Some(recorded)),
                    )
                    .await?;
                info!(cluster_id, "read vip({}) moved to {}", vip, holder);
                return Ok(Some(holder));
            }
            Ok(reply) => debug!(cluster_id, "add read vip on {}: {}", host, reply.message),
            Err(e) => debug!(cluster_id, "add read vip on {}: {}", host, e),
        }
    }
    Ok(None)
}

/// Add `vip` on `host` unless it is already bound. True when it was added.
async fn bind_vip(ctx: &HaContext, host: &str, vip: &str) -> Result<bool> {
    let control = ctx.control(host).await?;
    if control.vip_exists(vip).await? {
        return Ok(false);
    }
    control.add_vip(vip).await?.check("add_vip")?;
    Ok(true)
}

async fn remove_vip(ctx: &HaContext, cluster_id: u32, host: &str, vip: &str) {
    let control = match ctx.control(host).await {
        Ok(c) => c,
        Err(e) => {
            debug!(cluster_id, "cannot reach {} to check vip({}): {}", host, vip, e);
            return;
        }
    };
    match control.vip_exists(vip).await {
        Ok(true) => {
            info!(cluster_id, "removing stray vip({}) from {}", vip, host);
            if let Err(e) = control.del_vip(vip).await.and_then(|r| r.check("del_vip")) {
                warn!(cluster_id, "remove vip({}) from {}: {}", vip, host, e);
            }
        }
        Ok(false) => {}
        Err(e) => debug!(cluster_id, "check vip({}) on {}: {}", vip, host, e),
    }
}

/// With a single healthy node left a synchronous primary would block every
/// commit, so fall back to async until a second node is healthy again.
pub async fn adjust_sync_mode(ctx: &HaContext, topo: &Topology) -> Result<()> {
    let cluster_id = topo.cluster.id;
    let primary = match topo.normal_primary() {
        Some(p) => p,
        None => return Ok(()),
    };

    let mut healthy = 0;
    for node in topo.nodes.iter().filter(|n| n.is_normal()) {
        if node.db_state == DbState::Running {
            healthy += 1;
            continue;
        }
        if let Ok(control) = ctx.control(&node.host).await {
            if control.is_running(&node.pgdata).await.unwrap_or(false) {
                healthy += 1;
            }
        }
    }

    let is_async = ctx.is_async(cluster_id);
    if healthy == 1 && !is_async {
        info!(cluster_id, "only the primary is healthy, switching to async replication");
        let control = ctx.control(&primary.host).await?;
        control
            .set_sync_mode(&primary.pgdata, false)
            .await?
            .check("set_sync_mode")?;
        ctx.set_async(cluster_id, true);
    } else if healthy > 1 && is_async {
        info!(cluster_id, "{} healthy nodes, restoring sync replication", healthy);
        let control = ctx.control(&primary.host).await?;
        control
            .set_sync_mode(&primary.pgdata, true)
            .await?
            .check("set_sync_mode")?;
        ctx.set_async(cluster_id, false);
    }
    Ok(())
}

/// Make every load balancer list exactly the NORMAL standbys
pub async fn sync_load_balancers(ctx: &HaContext, topo: &Topology) -> Result<()> {
    let cluster_id = topo.cluster.id;
    let desired: Vec<String> = topo.normal_standbys().map(|n| n.endpoint()).collect();
    for lb_addr in &topo.cluster.lb_list {
        let registered = match ctx.lb.list_backends(lb_addr).await {
            Ok(list) => list,
            Err(e) => {
                warn!(cluster_id, "list backends of {}: {}", lb_addr, e);
                continue;
            }
        };
        let (to_add, to_delete) = backend_diff(&desired, &registered);
        for backend in to_add {
            info!(cluster_id, "load balancer {}: add {}", lb_addr, backend);
            if let Err(e) = ctx.lb.add_backend(lb_addr, &backend).await {
                warn!(cluster_id, "load balancer {}: add {}: {}", lb_addr, backend, e);
            }
        }
        for backend in to_delete {
            info!(cluster_id, "load balancer {}: delete {}", lb_addr, backend);
            if let Err(e) = ctx.lb.delete_backend(lb_addr, &backend).await {
                warn!(cluster_id, "load balancer {}: delete {}: {}", lb_addr, backend, e);
            }
        }
    }
    Ok(())
}
