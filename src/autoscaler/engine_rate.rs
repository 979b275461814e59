//! Decision Engine — Rate-Threshold Policy (§4.3).
//! Mission: proportional scaling on a single accelerator class, stable
//! within a deadband, bootstrapping forward progress below `min_replicas`.

use super::engine::Autoscaler;
use super::types::{
    AutoscalerDecision, DecisionBatch, DecisionItem, ReplicaInfo, ReplicaStatus, RequestBatch,
};
use super::window::RequestWindow;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RateThresholdConfig {
    pub min_replicas: u64,
    pub max_replicas: u64,
    pub upper_threshold: Option<f64>,
    pub lower_threshold: Option<f64>,
    pub cooldown: f64,
    pub window_size: f64,
    /// The single accelerator class this policy scales (homogeneous fleet).
    pub accelerator: String,
}

/// `RequestRateAutoscaler` equivalent: a single sliding window, a single
/// proportional controller. `last_scale_time` is owned and threaded in by
/// the Control Loop (§5), not stored here.
pub struct RateThresholdEngine {
    config: RateThresholdConfig,
    window: RequestWindow,
}

impl RateThresholdEngine {
    pub fn new(config: RateThresholdConfig) -> Self {
        let window_size = config.window_size;
        Self {
            config,
            window: RequestWindow::new(1, window_size),
        }
    }
}

impl Autoscaler for RateThresholdEngine {
    fn ingest(&mut self, batch: RequestBatch) {
        self.window.ingest(batch);
    }

    fn evaluate(&mut self, now: f64, last_scale_time: f64, replicas: &[ReplicaInfo]) -> DecisionBatch {
        let n = replicas.len() as u64;
        let cfg = &self.config;

        // Bootstrap gate: below the floor, scale up unconditionally and skip
        // cooldown so the fleet always makes forward progress on cold start.
        let bootstrapping = n < cfg.min_replicas;

        if !bootstrapping && now - last_scale_time < cfg.cooldown {
            debug!(
                now,
                last_scale_time, cooldown = cfg.cooldown, "cooldown active, skipping scaling evaluation"
            );
            return vec![];
        }

        let rate = self.window.rate(now);
        let per_replica = if n > 0 { rate / n as f64 } else { rate };

        let target: u64 = if bootstrapping {
            cfg.min_replicas
        } else if let Some(upper) = cfg.upper_threshold {
            if per_replica > upper {
                ((per_replica / upper) * n as f64).floor() as u64
            } else {
                self.below_lower_or_hold(per_replica, n)
            }
        } else {
            self.below_lower_or_hold(per_replica, n)
        };

        let target = target.clamp(cfg.min_replicas, cfg.max_replicas);

        if target == n {
            return vec![];
        }

        if target > n {
            let delta = target - n;
            info!(delta, target, n, "scaling up");
            (0..delta)
                .map(|_| {
                    DecisionItem::Single(AutoscalerDecision::scale_up_primary(
                        cfg.accelerator.clone(),
                    ))
                })
                .collect()
        } else {
            let to_remove = (n - target) as usize;
            let selected = select_for_scale_down_rate_threshold(replicas, to_remove);
            info!(removed = selected.len(), target, n, "scaling down");
            selected
                .into_iter()
                .map(|replica_id| DecisionItem::Single(AutoscalerDecision::scale_down(replica_id)))
                .collect()
        }
    }
}

impl RateThresholdEngine {
    fn below_lower_or_hold(&self, per_replica: f64, n: u64) -> u64 {
        match self.config.lower_threshold {
            Some(lower) if per_replica < lower => ((per_replica / lower) * n as f64).floor() as u64,
            _ => n,
        }
    }
}

/// §4.3 step 9's scale-down order: "all FAILED first (in id order), then
/// remaining replicas in id order". Deliberately simpler than
/// `selection::select_for_scale_down`'s four-tier status rank — the
/// heterogeneous policy's richer ordering (§4.5) doesn't apply here, only
/// FAILED gets priority and everything else is a flat id-ordered list.
fn select_for_scale_down_rate_threshold(replicas: &[ReplicaInfo], count: usize) -> Vec<u64> {
    let mut failed: Vec<u64> = replicas
        .iter()
        .filter(|r| r.status == ReplicaStatus::Failed)
        .map(|r| r.replica_id)
        .collect();
    failed.sort_unstable();

    let mut rest: Vec<u64> = replicas
        .iter()
        .filter(|r| r.status != ReplicaStatus::Failed)
        .map(|r| r.replica_id)
        .collect();
    rest.sort_unstable();

    failed.into_iter().chain(rest).take(count).collect()
}
