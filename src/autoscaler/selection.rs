//! Replica selection for scale-down (§4.5).
//! Mission: a deterministic total order on alive replicas, least-useful first.

use super::types::{ReplicaInfo, ReplicaStatus};

/// Selects up to `count` replica ids to remove, filtered by `eligible`
/// (e.g. "primary of class A10"), ordered by status (FAILED, NOT_READY,
/// PROVISIONING, READY), then ascending `created_at`, then ascending
/// `replica_id`.
pub fn select_for_scale_down<'a>(
    replicas: &'a [ReplicaInfo],
    eligible: impl Fn(&ReplicaInfo) -> bool,
    count: usize,
) -> Vec<&'a ReplicaInfo> {
    let mut candidates: Vec<&ReplicaInfo> = replicas.iter().filter(|r| eligible(r)).collect();
    candidates.sort_by(|a, b| {
        status_rank(a.status)
            .cmp(&status_rank(b.status))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.replica_id.cmp(&b.replica_id))
    });
    candidates.truncate(count);
    candidates
}

fn status_rank(status: ReplicaStatus) -> u8 {
    ReplicaStatus::scale_down_order()
        .iter()
        .position(|&s| s == status)
        .unwrap_or(ReplicaStatus::scale_down_order().len()) as u8
}
