//! Decision Engine capability interface.
//! Mission: one trait shared by both autoscaling policies, a tagged `Box<dyn
//! Autoscaler>` standing in for a class hierarchy.

use super::types::{DecisionBatch, ReplicaInfo, RequestBatch};

/// One autoscaling policy. Purely CPU-bound: `evaluate` never suspends and
/// is total for any input snapshot (§7 — the Decision Engine never fails).
pub trait Autoscaler: Send {
    /// Appends freshly pushed request timestamps to this engine's window.
    fn ingest(&mut self, batch: RequestBatch);

    /// Produces a (possibly empty) decision batch from a replica snapshot.
    /// `now` and `last_scale_time` are seconds-since-epoch, threaded through
    /// explicitly so the engine stays deterministic and testable without a
    /// wall clock. `last_scale_time` is owned by the Control Loop (§5); the
    /// engine only reads it. A non-empty batch means the Control Loop
    /// should advance its own `last_scale_time` to `now`.
    fn evaluate(&mut self, now: f64, last_scale_time: f64, replicas: &[ReplicaInfo]) -> DecisionBatch;

    /// Runs independently of `evaluate`, on every tick: reaps fallbacks of
    /// any primary that no longer needs them (I6). The rate-threshold
    /// policy has no fallbacks and leaves this at its default no-op; the
    /// heterogeneous policy overrides it (§4.4).
    fn fallback_scale_down_sync(&self, _replicas: &[ReplicaInfo]) -> DecisionBatch {
        vec![]
    }

    /// Called once when the control plane begins shutdown so an engine can
    /// flush in-flight bookkeeping; most policies have nothing to do here.
    fn on_shutdown(&mut self) {}
}
