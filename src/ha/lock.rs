use crate::error::{PghaError, Result};
use crate::meta::{ClusterId, ClusterState, MetaStore};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Ownership of a cluster won through the state CAS.
///
/// Released exactly once: explicitly through [`ClusterLock::release`], or
/// on drop by restoring the state that was current at acquire time.
pub struct ClusterLock {
    store: Arc<dyn MetaStore>,
    cluster_id: ClusterId,
    previous: ClusterState,
    released: bool,
}

impl ClusterLock {
    /// CAS the cluster into `new` if its state is in `allowed`.
    /// `Ok(None)` when another operation holds the cluster.
    pub async fn acquire(
        store: Arc<dyn MetaStore>,
        cluster_id: ClusterId,
        allowed: &[ClusterState],
        new: ClusterState,
    ) -> Result<Option<Self>> {
        match store
            .test_and_set_cluster_state(cluster_id, allowed, new)
            .await?
        {
            Some(previous) => {
                debug!(cluster_id, "cluster locked {} -> {}", previous, new);
                Ok(Some(Self {
                    store,
                    cluster_id,
                    previous,
                    released: false,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// State the cluster was in before it was locked
    pub fn previous(&self) -> ClusterState {
        self.previous
    }

    /// Write the final state and give up the cluster
    pub async fn release(mut self, state: ClusterState) -> Result<()> {
        self.released = true;
        let result = self.store.set_cluster_state(self.cluster_id, state).await;
        if let Err(e) = &result {
            error!(
                cluster_id = self.cluster_id,
                "failed to release cluster into {}: {}", state, e
            );
        }
        result
    }

    /// Give up the lock without writing, for a cluster that no longer exists
    pub fn forget(mut self) {
        self.released = true;
    }

    /// Run `body` while holding the lock, then release into the state chosen
    /// by `restore(ok, previous)`. A panicking body counts as a failure and
    /// surfaces as [`PghaError::Internal`].
    pub async fn run<T, Fut, R>(self, body: Fut, restore: R) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        R: FnOnce(bool, ClusterState) -> ClusterState,
    {
        let cluster_id = self.cluster_id;
        let outcome = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(cluster_id, "operation panicked while holding the cluster");
                Err(PghaError::Internal(format!(
                    "operation on cluster({}) panicked",
                    cluster_id
                )))
            }
        };
        let state = restore(outcome.is_ok(), self.previous);
        // A failed release is already logged; the body's outcome wins.
        let _ = self.release(state).await;
        outcome
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let cluster_id = self.cluster_id;
        let previous = self.previous;
        warn!(cluster_id, "cluster lock dropped unreleased, restoring {}", previous);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.set_cluster_state(cluster_id, previous).await {
                    error!(cluster_id, "failed to restore cluster state: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Cluster, MemoryMetaStore};

    fn store(state: ClusterState) -> Arc<dyn MetaStore> {
        let mut cluster = Cluster::new(7, "c7");
        cluster.state = state;
        Arc::new(MemoryMetaStore::with_records(vec![cluster], vec![]).unwrap())
    }

    #[tokio::test]
    async fn test_second_acquire_refused() {
        let store = store(ClusterState::Normal);
        let lock = ClusterLock::acquire(
            Arc::clone(&store),
            7,
            &[ClusterState::Normal],
            ClusterState::Repairing,
        )
        .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.previous(), ClusterState::Normal);
        let second = ClusterLock::acquire(
            Arc::clone(&store),
            7,
            &[ClusterState::Normal],
            ClusterState::Checking,
        )
        .await
            .unwrap();
        assert!(second.is_none());
        lock.release(ClusterState::Normal).await.unwrap();
        assert_eq!(store.require_cluster(7).await.unwrap().state, ClusterState::Normal);
    }

    #[tokio::test]
    async fn test_run_restores_after_panic() {
        let store = store(ClusterState::Offline);
        let lock = ClusterLock::acquire(
            Arc::clone(&store),
            7,
            &[ClusterState::Offline],
            ClusterState::Repairing,
        )
        .await
            .unwrap()
            .unwrap();
        let result: Result<()> = lock
            .run(async { panic!("boom") }, |ok, previous| {
                assert!(!ok);
                previous
            })
            .await;
        assert!(matches!(result, Err(PghaError::Internal(_))));
        assert_eq!(store.require_cluster(7).await.unwrap().state, ClusterState::Offline);
    }

    #[tokio::test]
    async fn test_run_failure_state() {
        let store = store(ClusterState::Normal);
        let lock = ClusterLock::acquire(
            Arc::clone(&store),
            7,
            &[ClusterState::Normal],
            ClusterState::Checking,
        )
        .await
            .unwrap()
            .unwrap();
        let result: Result<()> = lock
            .run(async { Err(PghaError::Election("no candidate".into())) }, |ok, prev| {
                if ok {
                    prev
                } else {
                    ClusterState::Failed
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.require_cluster(7).await.unwrap().state, ClusterState::Failed);
    }
}
