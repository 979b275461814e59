//! Replica Manager contract (§6), outbound from the control plane.
//! Mission: realize scale-up/scale-down decisions against the provisioning
//! layer. Provisioning itself (starting/stopping VMs or TPU slices) is out
//! of scope — this module only defines the boundary and an in-memory fake.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
#[error("replica manager request failed: {0}")]
pub struct ReplicaManagerError(pub String);

/// One unit of a scale-up bundle: either a primary or a fallback owned by
/// `owner_replica_id` once known.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub accelerator: String,
    pub is_primary: bool,
}

#[async_trait]
pub trait ReplicaManager: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<u64, ReplicaManagerError>;

    /// Atomic all-or-nothing multi-launch: a partial provisioning failure
    /// must not leave orphan fallbacks without their primary (I1).
    async fn launch_bundle(&self, specs: Vec<LaunchSpec>) -> Result<Vec<u64>, ReplicaManagerError>;

    /// Scaling down an already-TERMINATED replica must be a no-op (§5).
    async fn scale_down(&self, replica_id: u64) -> Result<(), ReplicaManagerError>;
}

/// In-memory fake: launches always succeed and hand out monotonically
/// increasing ids, matching `replica_id: stable integer, unique within a
/// service, monotonically assigned` (§3). Follows the idiom of an
/// `AtomicU64` counter paired with a `parking_lot::Mutex`-guarded set for
/// lock-free id assignment next to a small synchronized bookkeeping set.
#[derive(Clone)]
pub struct InMemoryReplicaManager {
    next_id: Arc<AtomicU64>,
    terminated: Arc<Mutex<HashSet<u64>>>,
}

impl InMemoryReplicaManager {
    pub fn new(starting_id: u64) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(starting_id)),
            terminated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn mark_terminated(&self, replica_id: u64) {
        self.terminated.lock().insert(replica_id);
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaManager for InMemoryReplicaManager {
    async fn launch(&self, _spec: LaunchSpec) -> Result<u64, ReplicaManagerError> {
        Ok(self.allocate_id())
    }

    async fn launch_bundle(&self, specs: Vec<LaunchSpec>) -> Result<Vec<u64>, ReplicaManagerError> {
        Ok(specs.iter().map(|_| self.allocate_id()).collect())
    }

    async fn scale_down(&self, replica_id: u64) -> Result<(), ReplicaManagerError> {
        if self.terminated.lock().contains(&replica_id) {
            return Ok(()); // idempotent: already gone (§5)
        }
        self.mark_terminated(replica_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonically_assigned() {
        let manager = InMemoryReplicaManager::new(1);
        let a = manager
            .launch(LaunchSpec {
                accelerator: "A10".to_string(),
                is_primary: true,
            })
            .await
            .unwrap();
        let b = manager
            .launch(LaunchSpec {
                accelerator: "A10".to_string(),
                is_primary: true,
            })
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn bundle_allocates_one_id_per_spec_in_order() {
        let manager = InMemoryReplicaManager::new(100);
        let ids = manager
            .launch_bundle(vec![
                LaunchSpec {
                    accelerator: "A10".to_string(),
                    is_primary: false,
                },
                LaunchSpec {
                    accelerator: "A100".to_string(),
                    is_primary: true,
                },
            ])
            .await
            .unwrap();
        assert_eq!(ids, vec![100, 101]);
    }

    #[tokio::test]
    async fn scale_down_is_idempotent() {
        let manager = InMemoryReplicaManager::new(1);
        manager.scale_down(5).await.unwrap();
        manager.scale_down(5).await.unwrap();
    }
}
