//! Replica State Store contract (§6).
//! Mission: the external source of truth for replica lifecycle state. The
//! control plane caches a snapshot per-tick and treats it as read-only.

use super::types::ReplicaInfo;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors crossing the State Store boundary are transient by construction
/// (§7, `TransientExternal`): a timed-out or failed call is retried next tick.
#[derive(Debug, thiserror::Error)]
#[error("state store request failed: {0}")]
pub struct StateStoreError(pub String);

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn list_replicas(&self, service: &str) -> Result<Vec<ReplicaInfo>, StateStoreError>;
    async fn upsert_replica(&self, service: &str, info: ReplicaInfo) -> Result<(), StateStoreError>;
}

/// In-memory fake used by tests and local runs. Follows the idiom of an
/// `Arc<parking_lot::Mutex<_>>`-backed in-process cache rather than a real
/// database client, since persistence itself is out of scope for the
/// control plane.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    services: Arc<Mutex<HashMap<String, HashMap<u64, ReplicaInfo>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, service: &str, replicas: Vec<ReplicaInfo>) {
        let mut services = self.services.lock();
        let entry = services.entry(service.to_string()).or_default();
        for r in replicas {
            entry.insert(r.replica_id, r);
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn list_replicas(&self, service: &str) -> Result<Vec<ReplicaInfo>, StateStoreError> {
        let services = self.services.lock();
        let mut replicas: Vec<ReplicaInfo> = services
            .get(service)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        replicas.sort_by_key(|r| r.replica_id);
        Ok(replicas)
    }

    async fn upsert_replica(&self, service: &str, info: ReplicaInfo) -> Result<(), StateStoreError> {
        let mut services = self.services.lock();
        services
            .entry(service.to_string())
            .or_default()
            .insert(info.replica_id, info);
        Ok(())
    }
}

/// JSON-file-backed state store for local runs: best-effort recovery across
/// control-plane restarts is all the Non-goals require (no strong
/// consistency guarantee), so a whole-file read-modify-write is sufficient
/// — no WAL, no partial writes. Follows the idiom of a
/// `parking_lot::Mutex`-guarded handle doing full-snapshot serialization
/// rather than a real database client.
#[derive(Clone)]
pub struct FileStateStore {
    path: Arc<std::path::PathBuf>,
    services: Arc<Mutex<HashMap<String, HashMap<u64, ReplicaInfo>>>>,
}

impl FileStateStore {
    /// Loads existing state from `path` if present; starts empty otherwise.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StateStoreError> {
        let path = path.as_ref().to_path_buf();
        let services = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| StateStoreError(format!("reading {}: {e}", path.display())))?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&contents)
                    .map_err(|e| StateStoreError(format!("parsing {}: {e}", path.display())))?
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Arc::new(path),
            services: Arc::new(Mutex::new(services)),
        })
    }

    fn flush(&self, services: &HashMap<String, HashMap<u64, ReplicaInfo>>) -> Result<(), StateStoreError> {
        let contents = serde_json::to_string_pretty(services)
            .map_err(|e| StateStoreError(format!("serializing state: {e}")))?;
        std::fs::write(self.path.as_ref(), contents)
            .map_err(|e| StateStoreError(format!("writing {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn list_replicas(&self, service: &str) -> Result<Vec<ReplicaInfo>, StateStoreError> {
        let services = self.services.lock();
        let mut replicas: Vec<ReplicaInfo> = services
            .get(service)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        replicas.sort_by_key(|r| r.replica_id);
        Ok(replicas)
    }

    async fn upsert_replica(&self, service: &str, info: ReplicaInfo) -> Result<(), StateStoreError> {
        let mut services = self.services.lock();
        services
            .entry(service.to_string())
            .or_default()
            .insert(info.replica_id, info);
        self.flush(&services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::types::ReplicaStatus;
    use chrono::Utc;

    fn replica(id: u64) -> ReplicaInfo {
        ReplicaInfo {
            replica_id: id,
            accelerator: "A10".to_string(),
            status: ReplicaStatus::Ready,
            is_primary: true,
            fallback_replica_ids: vec![],
            owner_replica_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn seed_and_list_round_trips() {
        let store = InMemoryStateStore::new();
        store.seed("svc", vec![replica(2), replica(1)]);
        let replicas = store.list_replicas("svc").await.unwrap();
        assert_eq!(
            replicas.iter().map(|r| r.replica_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_entry() {
        let store = InMemoryStateStore::new();
        store.seed("svc", vec![replica(1)]);
        let mut updated = replica(1);
        updated.status = ReplicaStatus::Failed;
        store.upsert_replica("svc", updated).await.unwrap();
        let replicas = store.list_replicas("svc").await.unwrap();
        assert_eq!(replicas[0].status, ReplicaStatus::Failed);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicas.json");

        let store = FileStateStore::open(&path).unwrap();
        store.upsert_replica("svc", replica(1)).await.unwrap();
        store.upsert_replica("svc", replica(2)).await.unwrap();
        drop(store);

        let reopened = FileStateStore::open(&path).unwrap();
        let replicas = reopened.list_replicas("svc").await.unwrap();
        assert_eq!(
            replicas.iter().map(|r| r.replica_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn file_store_starts_empty_when_path_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let store = FileStateStore::open(&path).unwrap();
        assert!(store.list_replicas("svc").await.unwrap().is_empty());
    }
}
