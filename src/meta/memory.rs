use super::types::{Cluster, ClusterId, ClusterState, Node, NodeId};
use super::{ClusterUpdate, MetaStore, NodeUpdate};
use crate::error::{PghaError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Default)]
struct Records {
    clusters: BTreeMap<ClusterId, Cluster>,
    nodes: BTreeMap<NodeId, Node>,
}

/// In-process metadata store.
///
/// All records sit behind one lock, so the cluster state CAS and any
/// node write are serialized against each other.
#[derive(Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Records>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from seed records. Nodes are validated like `put_node`.
    pub fn with_records(clusters: Vec<Cluster>, nodes: Vec<Node>) -> Result<Self> {
        let store = Self::new();
        {
            let mut records = store.write()?;
            for cluster in clusters {
                records.clusters.insert(cluster.id, cluster);
            }
            for node in nodes {
                validate_node(&records, &node)?;
                records.nodes.insert(node.id, node);
            }
        }
        Ok(store)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Records>> {
        self.inner
            .read()
            .map_err(|e| PghaError::Internal(format!("Lock error: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Records>> {
        self.inner
            .write()
            .map_err(|e| PghaError::Internal(format!("Lock error: {}", e)))
    }
}

fn validate_node(records: &Records, node: &Node) -> Result<()> {
    if !records.clusters.contains_key(&node.cluster_id) {
        return Err(PghaError::ClusterNotFound(node.cluster_id));
    }
    if let Some(up) = node.up_db_id {
        if up == node.id {
            return Err(PghaError::InvalidState(format!(
                "database({}) can not be its own upstream",
                node.id
            )));
        }
        // Upstream may be inserted later in the same seed batch, so only a
        // known node in another cluster is rejected.
        if let Some(upstream) = records.nodes.get(&up) {
            if upstream.cluster_id != node.cluster_id {
                return Err(PghaError::InvalidState(format!(
                    "upstream database({}) of database({}) belongs to cluster({})",
                    up, node.id, upstream.cluster_id
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn cluster_ids(&self) -> Result<Vec<ClusterId>> {
        Ok(self.read()?.clusters.keys().copied().collect())
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        Ok(self.read()?.clusters.get(&id).cloned())
    }

    async fn put_cluster(&self, cluster: Cluster) -> Result<()> {
        self.write()?.clusters.insert(cluster.id, cluster);
        Ok(())
    }

    async fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        let mut records = self.write()?;
        records.clusters.remove(&id);
        records.nodes.retain(|_, n| n.cluster_id != id);
        Ok(())
    }

    async fn update_cluster(&self, id: ClusterId, update: ClusterUpdate) -> Result<Cluster> {
        let mut records = self.write()?;
        let cluster = records
            .clusters
            .get_mut(&id)
            .ok_or(PghaError::ClusterNotFound(id))?;
        let state = cluster.state;
        update(cluster);
        cluster.state = state;
        Ok(cluster.clone())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.read()?.nodes.get(&id).cloned())
    }

    async fn nodes_of(&self, cluster_id: ClusterId) -> Result<Vec<Node>> {
        Ok(self
            .read()?
            .nodes
            .values()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn put_node(&self, node: Node) -> Result<()> {
        let mut records = self.write()?;
        validate_node(&records, &node)?;
        records.nodes.insert(node.id, node);
        Ok(())
    }

    async fn update_node(&self, id: NodeId, update: NodeUpdate) -> Result<Node> {
        let mut records = self.write()?;
        let mut node = records
            .nodes
            .get(&id)
            .cloned()
            .ok_or(PghaError::NodeNotFound(id))?;
        update(&mut node);
        node.id = id;
        validate_node(&records, &node)?;
        records.nodes.insert(id, node.clone());
        Ok(node)
    }

    async fn test_and_set_cluster_state(
        &self,
        id: ClusterId,
        allowed: &[ClusterState],
        new: ClusterState,
    ) -> Result<Option<ClusterState>> {
        let mut records = self.write()?;
        let cluster = records
            .clusters
            .get_mut(&id)
            .ok_or(PghaError::ClusterNotFound(id))?;
        let previous = cluster.state;
        if !allowed.contains(&previous) {
            debug!(
                cluster_id = id,
                "state CAS refused: {} not in {:?}", previous, allowed
            );
            return Ok(None);
        }
        cluster.state = new;
        Ok(Some(previous))
    }

    async fn set_cluster_state(&self, id: ClusterId, state: ClusterState) -> Result<()> {
        let mut records = self.write()?;
        let cluster = records
            .clusters
            .get_mut(&id)
            .ok_or(PghaError::ClusterNotFound(id))?;
        if !cluster.state.can_transition_to(state) {
            return Err(PghaError::InvalidState(format!(
                "cluster({}) can not go from {} to {}",
                id, cluster.state, state
            )));
        }
        cluster.state = state;
        Ok(())
    }
}
