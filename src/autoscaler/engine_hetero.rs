//! Decision Engine — Heterogeneous-Accelerator Policy (§4.4).
//! Mission: solver-driven allocation across accelerator classes, pairing
//! primaries with fallbacks to absorb load during cold start.

use super::engine::Autoscaler;
use super::selection::select_for_scale_down;
use super::solver::AllocationSolver;
use super::types::{
    AcceleratorCatalogue, AutoscalerDecision, DecisionBatch, DecisionItem, ReplicaInfo,
    ReplicaStatus, RequestBatch,
};
use super::window::RequestWindow;
use tracing::info;

#[derive(Debug, Clone)]
pub struct HeteroConfig {
    pub min_replicas: u64,
    pub max_replicas: u64,
    pub cooldown: f64,
    pub window_size: f64,
}

/// `HeteroGPUAutoscaler` equivalent.
pub struct HeteroEngine {
    config: HeteroConfig,
    catalogue: AcceleratorCatalogue,
    window: RequestWindow,
}

impl HeteroEngine {
    pub fn new(config: HeteroConfig, catalogue: AcceleratorCatalogue) -> Self {
        let window_size = config.window_size;
        let num_classes = catalogue.len();
        Self {
            config,
            catalogue,
            window: RequestWindow::new(num_classes, window_size),
        }
    }

    fn bundle_for_scale_up(&self, class: &str) -> DecisionItem {
        let (k, fallback_class) = self.catalogue.fallback_of(class);
        if k == 0 {
            return DecisionItem::Single(AutoscalerDecision::scale_up_primary(class));
        }
        let fallback_class = fallback_class.expect("k > 0 implies a fallback class");
        let mut bundle: Vec<AutoscalerDecision> = (0..k)
            .map(|_| AutoscalerDecision::scale_up_fallback(fallback_class))
            .collect();
        bundle.push(AutoscalerDecision::scale_up_primary(class));
        DecisionItem::Bundle(bundle)
    }
}

impl Autoscaler for HeteroEngine {
    fn ingest(&mut self, batch: RequestBatch) {
        self.window.ingest(batch);
    }

    /// Runs independently of the main evaluation: reaps fallbacks of every
    /// READY primary that still owns any (I6). Mutating the snapshot's
    /// `fallback_replica_ids` is the caller's (Control Loop's) job once the
    /// Replica Manager acknowledges these scale-downs.
    fn fallback_scale_down_sync(&self, replicas: &[ReplicaInfo]) -> DecisionBatch {
        replicas
            .iter()
            .filter(|r| r.is_primary && r.status == ReplicaStatus::Ready && !r.fallback_replica_ids.is_empty())
            .flat_map(|r| r.fallback_replica_ids.iter().copied())
            .map(|id| DecisionItem::Single(AutoscalerDecision::scale_down(id)))
            .collect()
    }

    fn evaluate(&mut self, now: f64, _last_scale_time: f64, replicas: &[ReplicaInfo]) -> DecisionBatch {
        // The heterogeneous policy's per-class diff is already idempotent
        // against the live snapshot (P8) and cooldown is not part of its
        // published algorithm (§4.4) — `cooldown`, `min_replicas`, and
        // `max_replicas` are retained on the config only so callers can
        // share one config shape with the rate-threshold policy; none of
        // the three is consulted here, and `last_scale_time` goes unused
        // too. The per-class target is exactly `solver.solve(rate_vector)`,
        // with no fleet-wide floor/ceiling distorting it (§4.4 steps 1-3).
        let rate_vector = self.window.rates(now);
        let solver = AllocationSolver::new(&self.catalogue);
        let target = solver.solve(&rate_vector);

        let alive: Vec<&ReplicaInfo> = replicas.iter().filter(|r| r.is_alive()).collect();

        let mut batch: DecisionBatch = Vec::new();
        let mut queued_primary_ids: Vec<u64> = Vec::new();

        for spec in self.catalogue.iter() {
            let class = spec.name.as_str();
            let alive_in_class = alive.iter().filter(|r| r.accelerator == class).count() as u64;
            let desired = *target.get(class).unwrap_or(&0);
            let diff = alive_in_class as i64 - desired as i64;

            if diff < 0 {
                let to_launch = (-diff) as u64;
                for _ in 0..to_launch {
                    batch.push(self.bundle_for_scale_up(class));
                }
            } else if diff > 0 {
                let to_remove = diff as usize;
                let selected = select_for_scale_down(
                    replicas,
                    |r| r.is_primary && r.accelerator == class,
                    to_remove,
                );
                queued_primary_ids.extend(selected.iter().map(|r| r.replica_id));
            }
        }

        let by_id: std::collections::HashMap<u64, &ReplicaInfo> =
            replicas.iter().map(|r| (r.replica_id, r)).collect();
        for primary_id in queued_primary_ids {
            batch.push(DecisionItem::Single(AutoscalerDecision::scale_down(primary_id)));
            if let Some(primary) = by_id.get(&primary_id) {
                for &fb_id in &primary.fallback_replica_ids {
                    batch.push(DecisionItem::Single(AutoscalerDecision::scale_down(fb_id)));
                }
            }
        }

        if batch.is_empty() {
            info!("no scaling needed");
        }

        batch
    }

    fn on_shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::types::{AcceleratorSpec, FallbackSpec};
    use chrono::Utc;

    fn catalogue() -> AcceleratorCatalogue {
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
                    count: 4,
                }),
            },
        ])
    }

    fn config() -> HeteroConfig {
        HeteroConfig {
            min_replicas: 0,
            max_replicas: 50,
            cooldown: 0.0,
            window_size: 300.0,
        }
    }

    fn replica(
        id: u64,
        class: &str,
        primary: bool,
        status: ReplicaStatus,
        fallbacks: Vec<u64>,
        owner: Option<u64>,
    ) -> ReplicaInfo {
        ReplicaInfo {
            replica_id: id,
            accelerator: class.to_string(),
            status,
            is_primary: primary,
            fallback_replica_ids: fallbacks,
            owner_replica_id: owner,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scenario_5_heterogeneous_cold_start() {
        let mut engine = HeteroEngine::new(config(), catalogue());
        engine.ingest(RequestBatch::Heterogeneous(vec![
            vec![],
            (0..260).map(|i| i as f64).collect(),
        ]));
        let batch = engine.evaluate(300.0, 0.0, &[]);
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            DecisionItem::Bundle(decisions) => {
                assert_eq!(decisions.len(), 5);
                assert!(decisions[..4]
                    .iter()
                    .all(|d| matches!(d, AutoscalerDecision::ScaleUp { is_primary: false, accelerator, .. } if accelerator == "A10")));
                assert!(matches!(
                    decisions[4],
                    AutoscalerDecision::ScaleUp { is_primary: true, ref accelerator, .. } if accelerator == "A100"
                ));
            }
            other => panic!("expected a bundle, got {other:?}"),
        }
    }

    #[test]
    fn scenario_6_fallback_reaping() {
        let engine = HeteroEngine::new(config(), catalogue());
        let replicas = vec![
            replica(
                1,
                "A100",
                true,
                ReplicaStatus::Ready,
                vec![2, 3, 4, 5],
                None,
            ),
            replica(2, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
            replica(3, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
            replica(4, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
            replica(5, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
        ];
        let batch = engine.fallback_scale_down_sync(&replicas);
        assert_eq!(batch.len(), 4);
        let ids: Vec<u64> = batch
            .iter()
            .map(|d| match d {
                DecisionItem::Single(AutoscalerDecision::ScaleDown { replica_id }) => *replica_id,
                _ => panic!("expected scale downs"),
            })
            .collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
    }

    #[test]
    fn fallback_not_reaped_while_primary_still_provisioning() {
        let engine = HeteroEngine::new(config(), catalogue());
        let replicas = vec![
            replica(
                1,
                "A100",
                true,
                ReplicaStatus::Provisioning,
                vec![2],
                None,
            ),
            replica(2, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
        ];
        assert!(engine.fallback_scale_down_sync(&replicas).is_empty());
    }

    #[test]
    fn scale_down_of_primary_drags_its_fallbacks() {
        let mut engine = HeteroEngine::new(config(), catalogue());
        // No traffic at all -> solver wants zero of everything, so the one
        // alive A100 primary (with two fallbacks) must come down too.
        let replicas = vec![
            replica(1, "A100", true, ReplicaStatus::Ready, vec![2, 3], None),
            replica(2, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
            replica(3, "A10", false, ReplicaStatus::Ready, vec![], Some(1)),
        ];
        let batch = engine.evaluate(300.0, 0.0, &replicas);
        let ids: Vec<u64> = batch
            .iter()
            .map(|d| match d {
                DecisionItem::Single(AutoscalerDecision::ScaleDown { replica_id }) => *replica_id,
                other => panic!("expected scale down, got {other:?}"),
            })
            .collect();
        // Primary first, then its fallbacks (P2).
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn no_terminated_replica_is_ever_targeted() {
        let mut engine = HeteroEngine::new(config(), catalogue());
        let replicas = vec![replica(
            1,
            "A10",
            true,
            ReplicaStatus::Terminated,
            vec![],
            None,
        )];
        let batch = engine.evaluate(300.0, 0.0, &replicas);
        for item in &batch {
            if let DecisionItem::Single(AutoscalerDecision::ScaleDown { replica_id }) = item {
                assert_ne!(*replica_id, 1);
            }
        }
    }
}
