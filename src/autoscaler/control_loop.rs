//! Control Loop (§4.6).
//! Mission: periodic driver that snapshots replica state, invokes the
//! Decision Engine, and hands decisions to the Replica Manager.

use super::engine::Autoscaler;
use super::replica_manager::{LaunchSpec, ReplicaManager};
use super::state_store::StateStore;
use super::types::{
    find_invariant_violations, AutoscalerDecision, DecisionBatch, DecisionItem, ReplicaInfo,
    ReplicaStatus,
};
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Per-tick timeout for an individual Replica Manager call. A timed-out call
/// is logged and retried next tick — the decision is derived from state, so
/// retrying is safe (§5).
const REPLICA_MANAGER_CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlLoopConfig {
    pub service_name: String,
    pub frequency: Duration,
    pub aggregator_sync_interval: Duration,
}

/// Shared, atomically-swapped cache of the last known replica snapshot.
/// Refreshed independently by a `ReplicaStateFetcher` task (§4.6
/// supplement), read by the Control Loop and by Telemetry API handlers.
pub type ReplicaSnapshot = Arc<ArcSwap<Vec<ReplicaInfo>>>;

pub fn new_replica_snapshot() -> ReplicaSnapshot {
    Arc::new(ArcSwap::from_pointee(Vec::new()))
}

/// Drives one autoscaling policy on a fixed period.
pub struct ControlLoop {
    config: ControlLoopConfig,
    engine: Arc<Mutex<Box<dyn Autoscaler>>>,
    snapshot: ReplicaSnapshot,
    state_store: Arc<dyn StateStore>,
    replica_manager: Arc<dyn ReplicaManager>,
    last_scale_time: f64,
}

impl ControlLoop {
    pub fn new(
        config: ControlLoopConfig,
        engine: Arc<Mutex<Box<dyn Autoscaler>>>,
        snapshot: ReplicaSnapshot,
        state_store: Arc<dyn StateStore>,
        replica_manager: Arc<dyn ReplicaManager>,
    ) -> Self {
        if config.frequency < config.aggregator_sync_interval {
            warn!(
                frequency_secs = config.frequency.as_secs(),
                aggregator_sync_interval_secs = config.aggregator_sync_interval.as_secs(),
                "control loop frequency is less than the aggregator sync interval; \
                 the request window may be stale on some ticks"
            );
        }
        Self {
            config,
            engine,
            snapshot,
            state_store,
            replica_manager,
            last_scale_time: 0.0,
        }
    }

    /// Runs forever until `shutdown` is signalled. Each fired tick snapshots
    /// state, evaluates, and dispatches decisions; a cancellation observed
    /// mid-tick still lets the current tick finish but stops further
    /// provisioning (§5).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.frequency);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        info!("shutdown already signalled, skipping tick");
                        continue;
                    }
                    self.tick(&mut shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("control loop stopping: shutdown signalled");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let replicas = match self.state_store.list_replicas(&self.config.service_name).await {
            Ok(replicas) => replicas,
            Err(err) => {
                error!(error = %err, "state store refresh failed, abandoning this tick");
                return;
            }
        };

        let quarantined = find_invariant_violations(&replicas);
        if !quarantined.is_empty() {
            error!(?quarantined, "quarantining replicas with invariant violations until next refresh");
        }
        let usable: Vec<ReplicaInfo> = replicas
            .into_iter()
            .filter(|r| !quarantined.contains(&r.replica_id))
            .collect();
        self.snapshot.store(Arc::new(usable.clone()));

        if *shutdown.borrow() {
            info!("shutdown signalled mid-tick, finishing without new provisioning");
            return;
        }

        // Fallback reaping (I6) runs every tick independently of the main
        // evaluation and never touches `last_scale_time` — it isn't a
        // cooldown-gated scaling decision, just cleanup of fallbacks whose
        // primary already came up (§4.4).
        let sync_batch = {
            let engine = self.engine.lock();
            engine.fallback_scale_down_sync(&usable)
        };
        if !sync_batch.is_empty() {
            self.dispatch(sync_batch, &usable).await;
        }

        let now = now_secs();
        let batch = {
            let mut engine = self.engine.lock();
            engine.evaluate(now, self.last_scale_time, &usable)
        };

        if batch.is_empty() {
            return;
        }
        self.last_scale_time = now;
        self.dispatch(batch, &usable).await;
    }

    async fn dispatch(&self, batch: DecisionBatch, replicas: &[ReplicaInfo]) {
        for item in batch {
            match item {
                DecisionItem::Single(decision) => self.apply(decision, replicas).await,
                DecisionItem::Bundle(decisions) => self.apply_bundle(decisions).await,
            }
        }
    }

    async fn apply(&self, decision: AutoscalerDecision, replicas: &[ReplicaInfo]) {
        match decision {
            AutoscalerDecision::ScaleUp {
                accelerator,
                is_primary,
                ..
            } => {
                let spec = LaunchSpec {
                    accelerator: accelerator.clone(),
                    is_primary,
                };
                match timeout(self.replica_manager.launch(spec)).await {
                    Ok(replica_id) => self.record_provisioning(replica_id, accelerator, is_primary, None).await,
                    Err(err) => error!(error = %err, "launch call failed or timed out, retrying next tick"),
                }
            }
            AutoscalerDecision::ScaleDown { replica_id } => {
                if matches!(
                    replicas.iter().find(|r| r.replica_id == replica_id).map(|r| r.status),
                    Some(ReplicaStatus::Terminated)
                ) {
                    return; // P1: never target an already-TERMINATED replica
                }
                match timeout(self.replica_manager.scale_down(replica_id)).await {
                    Ok(()) => self.record_shutdown(replica_id, replicas).await,
                    Err(err) => error!(error = %err, replica_id, "scale_down call failed or timed out, retrying next tick"),
                }
            }
        }
    }

    async fn apply_bundle(&self, decisions: Vec<AutoscalerDecision>) {
        let specs: Vec<LaunchSpec> = decisions
            .iter()
            .map(|d| match d {
                AutoscalerDecision::ScaleUp {
                    accelerator,
                    is_primary,
                    ..
                } => LaunchSpec {
                    accelerator: accelerator.clone(),
                    is_primary: *is_primary,
                },
                AutoscalerDecision::ScaleDown { .. } => {
                    unreachable!("bundles only ever contain scale-up decisions (P3)")
                }
            })
            .collect();

        match timeout(self.replica_manager.launch_bundle(specs)).await {
            Ok(ids) => {
                // Primary is always last in the bundle (engine_hetero invariant).
                let primary_id = *ids.last().expect("bundle is non-empty");
                let fallback_ids = &ids[..ids.len() - 1];
                for (decision, &fb_id) in decisions.iter().zip(fallback_ids) {
                    let AutoscalerDecision::ScaleUp { accelerator, .. } = decision else {
                        continue;
                    };
                    self.record_provisioning(fb_id, accelerator.clone(), false, Some(primary_id))
                        .await;
                }
                let primary_accelerator = match decisions.last() {
                    Some(AutoscalerDecision::ScaleUp { accelerator, .. }) => accelerator.clone(),
                    _ => unreachable!("bundle's last decision is the primary"),
                };
                // Single upsert carrying both the primary's real accelerator
                // class and its fallback linkage — a second upsert keyed on
                // the same `replica_id` would replace this entry wholesale
                // and silently clobber whichever field it omitted.
                if let Err(err) = self
                    .state_store
                    .upsert_replica(
                        &self.config.service_name,
                        ReplicaInfo {
                            replica_id: primary_id,
                            accelerator: primary_accelerator,
                            status: ReplicaStatus::Provisioning,
                            is_primary: true,
                            fallback_replica_ids: fallback_ids.to_vec(),
                            owner_replica_id: None,
                            created_at: Utc::now(),
                        },
                    )
                    .await
                {
                    error!(error = %err, "failed to record newly launched primary and its fallback linkage");
                }
            }
            Err(err) => error!(error = %err, "launch_bundle call failed or timed out, retrying next tick"),
        }
    }

    async fn record_provisioning(
        &self,
        replica_id: u64,
        accelerator: String,
        is_primary: bool,
        owner_replica_id: Option<u64>,
    ) {
        let info = ReplicaInfo {
            replica_id,
            accelerator,
            status: ReplicaStatus::Provisioning,
            is_primary,
            fallback_replica_ids: vec![],
            owner_replica_id,
            created_at: Utc::now(),
        };
        if let Err(err) = self.state_store.upsert_replica(&self.config.service_name, info).await {
            error!(error = %err, replica_id, "failed to record newly launched replica");
        }
    }

    /// The fetcher will overwrite this replica's own status with the
    /// authoritative value on its next refresh. But if this was a fallback
    /// (§4.4 "Fallback synchronization", I6), its owning primary's
    /// `fallback_replica_ids` must be cleared here and now — nothing else
    /// ever revisits that list, so leaving the reaped id in it would make
    /// every subsequent tick's `fallback_scale_down_sync` re-emit the same
    /// already-terminated SCALE_DOWN forever.
    async fn record_shutdown(&self, replica_id: u64, replicas: &[ReplicaInfo]) {
        info!(replica_id, "replica marked for shutdown");

        let Some(owner_id) = replicas
            .iter()
            .find(|r| r.replica_id == replica_id)
            .and_then(|r| r.owner_replica_id)
        else {
            return;
        };

        // Re-read the owner's current record from the state store instead
        // of reusing the tick's captured `replicas` snapshot: a primary can
        // own several fallbacks reaped within the same batch, and `dispatch`
        // awaits them one at a time, so the second removal must see the
        // first one's result or its upsert clobbers it back to stale data.
        let current = match self.state_store.list_replicas(&self.config.service_name).await {
            Ok(current) => current,
            Err(err) => {
                error!(error = %err, owner_id, replica_id, "failed to re-read owner before clearing reaped fallback");
                return;
            }
        };
        let Some(owner) = current.iter().find(|r| r.replica_id == owner_id) else {
            return;
        };
        let mut updated = owner.clone();
        updated.fallback_replica_ids.retain(|&id| id != replica_id);
        if let Err(err) = self
            .state_store
            .upsert_replica(&self.config.service_name, updated)
            .await
        {
            error!(
                error = %err,
                owner_id,
                replica_id,
                "failed to clear reaped fallback from its primary's linkage"
            );
        }
    }
}

async fn timeout<T>(fut: impl std::future::Future<Output = Result<T, impl std::fmt::Display>>) -> Result<T, String> {
    match tokio::time::timeout(REPLICA_MANAGER_CALL_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("timed out".to_string()),
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Background task refreshing the shared replica snapshot on its own
/// interval, independent of the autoscaling tick (§4.6 supplement) so the
/// Control Loop never blocks inline on State Store I/O.
pub async fn run_replica_state_fetcher(
    service_name: String,
    state_store: Arc<dyn StateStore>,
    snapshot: ReplicaSnapshot,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state_store.list_replicas(&service_name).await {
                    Ok(replicas) => snapshot.store(Arc::new(replicas)),
                    Err(err) => error!(error = %err, "replica state fetcher refresh failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("replica state fetcher stopping: shutdown signalled");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::engine_hetero::{HeteroConfig, HeteroEngine};
    use crate::autoscaler::engine_rate::{RateThresholdConfig, RateThresholdEngine};
    use crate::autoscaler::replica_manager::InMemoryReplicaManager;
    use crate::autoscaler::state_store::InMemoryStateStore;
    use crate::autoscaler::types::{AcceleratorCatalogue, AcceleratorSpec, FallbackSpec, RequestBatch};

    #[tokio::test]
    async fn tick_scales_up_from_empty_state_and_records_new_replicas() {
        let engine: Box<dyn Autoscaler> = Box::new(RateThresholdEngine::new(RateThresholdConfig {
            min_replicas: 2,
            max_replicas: 5,
            upper_threshold: Some(10.0),
            lower_threshold: Some(2.0),
            cooldown: 60.0,
            window_size: 60.0,
            accelerator: "A10".to_string(),
        }));
        let state_store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let replica_manager: Arc<dyn ReplicaManager> = Arc::new(InMemoryReplicaManager::new(1));
        let snapshot = new_replica_snapshot();

        let mut loop_ = ControlLoop::new(
            ControlLoopConfig {
                service_name: "svc".to_string(),
                frequency: Duration::from_secs(20),
                aggregator_sync_interval: Duration::from_secs(60),
            },
            Arc::new(Mutex::new(engine)),
            snapshot,
            state_store.clone(),
            replica_manager,
        );

        let (_tx, mut rx) = watch::channel(false);
        loop_.tick(&mut rx).await;

        let replicas = state_store.list_replicas("svc").await.unwrap();
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|r| r.status == ReplicaStatus::Provisioning));
    }

    fn hetero_catalogue() -> AcceleratorCatalogue {
        AcceleratorCatalogue::new(vec![
            AcceleratorSpec {
                name: "A10".to_string(),
                throughput_rps: 5.0,
                cost_per_hour: 1.0,
                fallback: None,
            },
            AcceleratorSpec {
                name: "A100".to_string(),
                throughput_rps: 20.0,
                cost_per_hour: 8.0,
                fallback: Some(FallbackSpec {
                    class: "A10".to_string(),
                    count: 2,
                }),
            },
        ])
    }

    #[tokio::test]
    async fn bundle_tick_records_primary_accelerator_without_clobbering_it() {
        let engine: Box<dyn Autoscaler> = Box::new(HeteroEngine::new(
            HeteroConfig {
                min_replicas: 0,
                max_replicas: 50,
                cooldown: 0.0,
                window_size: 300.0,
            },
            hetero_catalogue(),
        ));
        let engine = Arc::new(Mutex::new(engine));
        engine
            .lock()
            .ingest(RequestBatch::Heterogeneous(vec![
                vec![],
                (0..260).map(|i| i as f64).collect(),
            ]));

        let state_store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let replica_manager: Arc<dyn ReplicaManager> = Arc::new(InMemoryReplicaManager::new(1));
        let snapshot = new_replica_snapshot();

        let mut loop_ = ControlLoop::new(
            ControlLoopConfig {
                service_name: "svc".to_string(),
                frequency: Duration::from_secs(20),
                aggregator_sync_interval: Duration::from_secs(60),
            },
            engine,
            snapshot,
            state_store.clone(),
            replica_manager,
        );

        let (_tx, mut rx) = watch::channel(false);
        loop_.tick(&mut rx).await;

        let replicas = state_store.list_replicas("svc").await.unwrap();
        let primary = replicas
            .iter()
            .find(|r| r.is_primary)
            .expect("bundle should have launched one primary");
        assert_eq!(primary.accelerator, "A100");
        assert_eq!(primary.fallback_replica_ids.len(), 2);
        assert!(replicas
            .iter()
            .filter(|r| !r.is_primary)
            .all(|r| r.accelerator == "A10"));
    }

    #[tokio::test]
    async fn fallback_reaping_clears_owning_primarys_linkage_in_state_store() {
        let engine: Box<dyn Autoscaler> = Box::new(HeteroEngine::new(
            HeteroConfig {
                min_replicas: 0,
                max_replicas: 50,
                cooldown: 0.0,
                window_size: 300.0,
            },
            hetero_catalogue(),
        ));
        let state_store = InMemoryStateStore::new();
        let now = Utc::now();
        state_store.seed(
            "svc",
            vec![
                ReplicaInfo {
                    replica_id: 1,
                    accelerator: "A100".to_string(),
                    status: ReplicaStatus::Ready,
                    is_primary: true,
                    fallback_replica_ids: vec![2, 3],
                    owner_replica_id: None,
                    created_at: now,
                },
                ReplicaInfo {
                    replica_id: 2,
                    accelerator: "A10".to_string(),
                    status: ReplicaStatus::Ready,
                    is_primary: false,
                    fallback_replica_ids: vec![],
                    owner_replica_id: Some(1),
                    created_at: now,
                },
                ReplicaInfo {
                    replica_id: 3,
                    accelerator: "A10".to_string(),
                    status: ReplicaStatus::Ready,
                    is_primary: false,
                    fallback_replica_ids: vec![],
                    owner_replica_id: Some(1),
                    created_at: now,
                },
            ],
        );
        let state_store: Arc<dyn StateStore> = Arc::new(state_store);
        let replica_manager: Arc<dyn ReplicaManager> = Arc::new(InMemoryReplicaManager::new(100));
        let snapshot = new_replica_snapshot();

        // Steady traffic matching A100's one primary so the main evaluation
        // is a NO_OP and only the independent reaping pass acts (§4.4).
        let engine = Arc::new(Mutex::new(engine));
        engine
            .lock()
            .ingest(RequestBatch::Heterogeneous(vec![vec![], vec![1.0, 2.0]]));

        let mut loop_ = ControlLoop::new(
            ControlLoopConfig {
                service_name: "svc".to_string(),
                frequency: Duration::from_secs(20),
                aggregator_sync_interval: Duration::from_secs(60),
            },
            engine,
            snapshot,
            state_store.clone(),
            replica_manager,
        );

        let (_tx, mut rx) = watch::channel(false);
        loop_.tick(&mut rx).await;

        let replicas = state_store.list_replicas("svc").await.unwrap();
        let primary = replicas.iter().find(|r| r.replica_id == 1).unwrap();
        assert!(
            primary.fallback_replica_ids.is_empty(),
            "reaping must clear the primary's fallback linkage in the state store, not just log it"
        );
    }
}
