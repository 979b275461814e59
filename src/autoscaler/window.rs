//! Request Window
//! Mission: sliding-window request-rate accounting for the Decision Engine.
//!
//! Backed by per-class deques of seconds-since-epoch timestamps. Pruning is
//! value-based (drop `ts < now - window_size`), never order-based across
//! ingest batches, so concurrent ingest/read is benign (see concurrency
//! notes on the control plane's shared state).

use super::types::RequestBatch;
use std::collections::VecDeque;

/// Sliding window over request arrival timestamps for a single accelerator
/// class, or the only class in the homogeneous policy.
#[derive(Debug, Clone, Default)]
struct ClassWindow {
    timestamps: VecDeque<f64>,
}

impl ClassWindow {
    fn ingest(&mut self, batch: &[f64]) {
        self.timestamps.extend(batch.iter().copied());
    }

    /// Drops stale entries and returns the retained count. `timestamps` is
    /// kept close to sorted (batches append in arrival order) so a full sort
    /// before pruning keeps `partition_point` correct even when a batch
    /// arrives slightly out of order.
    fn prune(&mut self, now: f64, window_size: f64) -> usize {
        if !self
            .timestamps
            .iter()
            .zip(self.timestamps.iter().skip(1))
            .all(|(a, b)| a <= b)
        {
            let mut sorted: Vec<f64> = self.timestamps.drain(..).collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            self.timestamps = sorted.into();
        }
        let cutoff = now - window_size;
        let drop_count = self.timestamps.partition_point(|&ts| ts < cutoff);
        self.timestamps.drain(..drop_count);
        self.timestamps.len()
    }
}

/// Per-class sliding windows of request arrival timestamps. One instance
/// serves either the homogeneous policy (a single implicit class) or the
/// heterogeneous policy (one deque per accelerator class).
#[derive(Debug, Clone)]
pub struct RequestWindow {
    classes: Vec<ClassWindow>,
    window_size: f64,
}

impl RequestWindow {
    /// `num_classes == 1` for the homogeneous policy.
    pub fn new(num_classes: usize, window_size: f64) -> Self {
        Self {
            classes: (0..num_classes.max(1)).map(|_| ClassWindow::default()).collect(),
            window_size,
        }
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Appends timestamps to the corresponding deque(s). Timestamps within a
    /// batch need not be sorted.
    pub fn ingest(&mut self, batch: RequestBatch) {
        match batch {
            RequestBatch::Homogeneous(ts) => {
                if let Some(class) = self.classes.first_mut() {
                    class.ingest(&ts);
                }
            }
            RequestBatch::Heterogeneous(per_class) => {
                for (idx, ts) in per_class.into_iter().enumerate() {
                    if let Some(class) = self.classes.get_mut(idx) {
                        class.ingest(&ts);
                    }
                }
            }
        }
    }

    /// Prunes every class window and returns requests/sec per class.
    pub fn rates(&mut self, now: f64) -> Vec<f64> {
        let window_size = self.window_size;
        self.classes
            .iter_mut()
            .map(|c| c.prune(now, window_size) as f64 / window_size)
            .collect()
    }

    /// Like [`Self::rates`], scalar form for the homogeneous policy.
    pub fn rate(&mut self, now: f64) -> f64 {
        self.rates(now).into_iter().next().unwrap_or(0.0)
    }

    /// Per-class share of total requests in the window, summing to 1 (all
    /// zero if the window is empty). Prunes as a side effect.
    pub fn distribution(&mut self, now: f64) -> Vec<f64> {
        let rates = self.rates(now);
        let total: f64 = rates.iter().sum();
        if total <= 0.0 {
            return vec![0.0; rates.len()];
        }
        rates.iter().map(|r| r / total).collect()
    }
}
