//! Core data model for the autoscaler.
//! Mission: typed replicas, decisions, and the accelerator catalogue they scale over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Lifecycle state of one replica, owned authoritatively by the State Store.
///
/// Transitions only flow forward: `PROVISIONING -> READY|FAILED`,
/// `READY -> NOT_READY -> READY|FAILED`, `* -> SHUTTING_DOWN -> TERMINATED`.
/// `TERMINATED` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaStatus {
    Provisioning,
    Ready,
    NotReady,
    Failed,
    ShuttingDown,
    Terminated,
}

impl ReplicaStatus {
    /// Status order used for scale-down selection: least-useful first.
    pub fn scale_down_order() -> [ReplicaStatus; 4] {
        [
            ReplicaStatus::Failed,
            ReplicaStatus::NotReady,
            ReplicaStatus::Provisioning,
            ReplicaStatus::Ready,
        ]
    }

    pub fn is_alive(&self) -> bool {
        !matches!(
            self,
            ReplicaStatus::Failed | ReplicaStatus::ShuttingDown | ReplicaStatus::Terminated
        )
    }
}

/// One replica as reported by the Replica State Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub replica_id: u64,
    pub accelerator: String,
    pub status: ReplicaStatus,
    pub is_primary: bool,
    /// Ordered; only populated on primaries, empty for fallbacks and for
    /// classes with no fallback partner.
    #[serde(default)]
    pub fallback_replica_ids: Vec<u64>,
    /// Set on fallbacks, pointing back at the primary that owns them. Mirrors
    /// `fallback_replica_ids` from the other side so invariant checks don't
    /// need a full scan.
    #[serde(default)]
    pub owner_replica_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ReplicaInfo {
    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    pub fn is_fallback(&self) -> bool {
        !self.is_primary
    }
}

/// Checks I1-I3 over a replica snapshot. Returns the ids of replicas that
/// violate an invariant; callers quarantine these rather than crash (§7,
/// InvariantViolation).
pub fn find_invariant_violations(replicas: &[ReplicaInfo]) -> Vec<u64> {
    let mut bad = HashSet::new();
    let by_id: std::collections::HashMap<u64, &ReplicaInfo> =
        replicas.iter().map(|r| (r.replica_id, r)).collect();

    for r in replicas {
        if r.is_primary && r.owner_replica_id.is_some() {
            bad.insert(r.replica_id); // I3: primary can't also be owned
        }
        if !r.is_primary && !r.fallback_replica_ids.is_empty() {
            bad.insert(r.replica_id); // I3: fallback can't own fallbacks
        }
        for &fb_id in &r.fallback_replica_ids {
            match by_id.get(&fb_id) {
                // I1: every referenced fallback must exist and point back.
                Some(fb) if fb.owner_replica_id == Some(r.replica_id) => {}
                Some(_) => {
                    bad.insert(r.replica_id);
                }
                None => {
                    bad.insert(r.replica_id);
                }
            }
        }
    }
    let mut out: Vec<u64> = bad.into_iter().collect();
    out.sort_unstable();
    out
}

/// A fallback relationship: `count` cheaper `class` replicas are launched
/// alongside one primary of the owning class to absorb load while it
/// provisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSpec {
    pub class: String,
    pub count: usize,
}

/// One entry in the accelerator catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorSpec {
    pub name: String,
    /// Requests/sec one replica of this class can sustain.
    pub throughput_rps: f64,
    /// Cost/hour, consulted by the solver's cost-awareness tie-break.
    pub cost_per_hour: f64,
    /// `None` for the cheapest, root class.
    pub fallback: Option<FallbackSpec>,
}

/// The fixed, config-driven DAG of accelerator classes, ordered cheap-to-expensive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorCatalogue {
    classes: Vec<AcceleratorSpec>,
}

impl AcceleratorCatalogue {
    pub fn new(classes: Vec<AcceleratorSpec>) -> Self {
        Self { classes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AcceleratorSpec> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&AcceleratorSpec> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// `(k, fallback_class)` for `class`: launch `k` fallback replicas of
    /// `fallback_class` alongside every new primary. `k == 0` when `class`
    /// has no fallback partner.
    pub fn fallback_of(&self, class: &str) -> (usize, Option<&str>) {
        match self.get(class).and_then(|c| c.fallback.as_ref()) {
            Some(fb) => (fb.count, Some(fb.class.as_str())),
            None => (0, None),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }
}

/// One scale-up or scale-down action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AutoscalerDecision {
    ScaleUp {
        accelerator: String,
        /// Required boolean, never inferred from truthiness (see design notes).
        is_primary: bool,
        is_fallback: bool,
        /// Set on fallback decisions once their sibling primary id is known
        /// post-launch; `None` while the bundle is still being assembled.
        owner_replica_id: Option<u64>,
    },
    ScaleDown {
        replica_id: u64,
    },
}

impl AutoscalerDecision {
    pub fn scale_up_primary(accelerator: impl Into<String>) -> Self {
        AutoscalerDecision::ScaleUp {
            accelerator: accelerator.into(),
            is_primary: true,
            is_fallback: false,
            owner_replica_id: None,
        }
    }

    pub fn scale_up_fallback(accelerator: impl Into<String>) -> Self {
        AutoscalerDecision::ScaleUp {
            accelerator: accelerator.into(),
            is_primary: false,
            is_fallback: true,
            owner_replica_id: None,
        }
    }

    pub fn scale_down(replica_id: u64) -> Self {
        AutoscalerDecision::ScaleDown { replica_id }
    }
}

/// One element of a decision batch: either a standalone decision, or a
/// bundle of decisions that must be submitted to the Replica Manager as one
/// atomic multi-launch request (fallbacks plus their primary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionItem {
    Single(AutoscalerDecision),
    Bundle(Vec<AutoscalerDecision>),
}

/// An ordered sequence of decisions/bundles produced by one Decision Engine
/// invocation. An empty batch means NO_OP.
pub type DecisionBatch = Vec<DecisionItem>;

/// Inbound telemetry from the Request Aggregator.
#[derive(Debug, Clone)]
pub enum RequestBatch {
    Homogeneous(Vec<f64>),
    /// Index-aligned with the accelerator catalogue order.
    Heterogeneous(Vec<Vec<f64>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: u64, primary: bool, owner: Option<u64>, fallbacks: Vec<u64>) -> ReplicaInfo {
        ReplicaInfo {
            replica_id: id,
            accelerator: "A10".to_string(),
            status: ReplicaStatus::Ready,
            is_primary: primary,
            fallback_replica_ids: fallbacks,
            owner_replica_id: owner,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn clean_snapshot_has_no_violations() {
        let replicas = vec![
            replica(1, true, None, vec![2, 3]),
            replica(2, false, Some(1), vec![]),
            replica(3, false, Some(1), vec![]),
        ];
        assert!(find_invariant_violations(&replicas).is_empty());
    }

    #[test]
    fn dangling_fallback_reference_is_flagged() {
        let replicas = vec![replica(1, true, None, vec![99])];
        assert_eq!(find_invariant_violations(&replicas), vec![1]);
    }

    #[test]
    fn fallback_claiming_primary_role_is_flagged() {
        let replicas = vec![
            replica(1, true, None, vec![2]),
            replica(2, true, Some(1), vec![]),
        ];
        let mut bad = find_invariant_violations(&replicas);
        bad.sort_unstable();
        assert_eq!(bad, vec![1, 2]);
    }

    #[test]
    fn catalogue_fallback_lookup() {
        let cat = AcceleratorCatalogue::new(vec![
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
        ]);
        assert_eq!(cat.fallback_of("A10"), (0, None));
        assert_eq!(cat.fallback_of("A100"), (4, Some("A10")));
    }
}
