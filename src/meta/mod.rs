//! Cluster and node records plus the compare-and-set primitive on the
//! cluster state, which is the only lock structural operations use.

pub mod memory;
pub mod types;

pub use memory::MemoryMetaStore;
pub use types::{
    Cluster, ClusterId, ClusterKind, ClusterState, DbState, FailbackOptions, Node, NodeId,
    NodeState, PolarInfo, PolarRole, ProbeSettings, Room, Topology, TriggerSettings,
};

use crate::error::{PghaError, Result};
use async_trait::async_trait;

pub type ClusterUpdate = Box<dyn FnOnce(&mut Cluster) + Send>;
pub type NodeUpdate = Box<dyn FnOnce(&mut Node) + Send>;

/// Durable store of cluster and node records
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn cluster_ids(&self) -> Result<Vec<ClusterId>>;

    async fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>>;

    async fn put_cluster(&self, cluster: Cluster) -> Result<()>;

    async fn delete_cluster(&self, id: ClusterId) -> Result<()>;

    /// Apply `update` to the stored cluster and return the new record.
    /// The state field is not writable this way.
    async fn update_cluster(&self, id: ClusterId, update: ClusterUpdate) -> Result<Cluster>;

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>>;

    async fn nodes_of(&self, cluster_id: ClusterId) -> Result<Vec<Node>>;

    async fn put_node(&self, node: Node) -> Result<()>;

    async fn update_node(&self, id: NodeId, update: NodeUpdate) -> Result<Node>;

    /// Atomically set the state to `new` if the current state is in
    /// `allowed`. Returns the previous state, or `None` when refused.
    async fn test_and_set_cluster_state(
        &self,
        id: ClusterId,
        allowed: &[ClusterState],
        new: ClusterState,
    ) -> Result<Option<ClusterState>>;

    /// Unconditional state write, checked against the transition table.
    async fn set_cluster_state(&self, id: ClusterId, state: ClusterState) -> Result<()>;

    async fn require_cluster(&self, id: ClusterId) -> Result<Cluster> {
        self.get_cluster(id)
            .await?
            .ok_or(PghaError::ClusterNotFound(id))
    }

    async fn require_node(&self, id: NodeId) -> Result<Node> {
        self.get_node(id).await?.ok_or(PghaError::NodeNotFound(id))
    }

    /// Cluster plus its nodes, `None` if the cluster is gone
    async fn topology(&self, id: ClusterId) -> Result<Option<Topology>> {
        let cluster = match self.get_cluster(id).await? {
            Some(c) => c,
            None => return Ok(None),
        };
        let nodes = self.nodes_of(id).await?;
        Ok(Some(Topology { cluster, nodes }))
    }

    async fn set_node_state(&self, id: NodeId, state: NodeState) -> Result<()> {
        self.update_node(id, Box::new(move |n: &mut Node| n.state = state))
            .await
            .map(|_| ())
    }

    async fn set_db_state(&self, id: NodeId, state: DbState) -> Result<()> {
        self.update_node(id, Box::new(move |n: &mut Node| n.db_state = state))
            .await
            .map(|_| ())
    }

    async fn set_up_db(&self, id: NodeId, up_db_id: Option<NodeId>) -> Result<()> {
        self.update_node(id, Box::new(move |n: &mut Node| n.up_db_id = up_db_id))
            .await
            .map(|_| ())
    }
}
