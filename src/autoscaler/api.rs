//! Telemetry API (§4.7, §6).
//! Mission: the only writer into the Request Window, and the only reader for
//! external operators. All handlers are non-blocking with respect to the
//! Control Loop — the window lock is held only for the duration of a prune
//! or append (§5).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::ControlPlaneError;
use crate::middleware::{rate_limit_middleware, request_logging, RateLimitConfig, RateLimitLayer};

use super::control_loop::ReplicaSnapshot;
use super::engine::Autoscaler;
use super::types::{ReplicaStatus, RequestBatch};

/// Shared handler state. `Clone` is cheap: every field is an `Arc` (or
/// `watch::Sender`, itself `Arc`-backed). `engine` is the same handle the
/// Control Loop holds, so a pushed timestamp is visible to the engine's
/// window on the next tick that begins after the push returns (§5) without
/// the API needing its own copy of the window.
#[derive(Clone)]
pub struct ApiState {
    engine: Arc<Mutex<Box<dyn Autoscaler>>>,
    /// `1` for the homogeneous (rate-threshold) policy; catalogue length for
    /// the heterogeneous policy. Used to validate inbound payload shape.
    num_classes: usize,
    snapshot: ReplicaSnapshot,
    query_interval_secs: Option<u64>,
    shutdown_tx: watch::Sender<bool>,
}

impl ApiState {
    pub fn new(
        engine: Arc<Mutex<Box<dyn Autoscaler>>>,
        num_classes: usize,
        snapshot: ReplicaSnapshot,
        query_interval_secs: Option<u64>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            engine,
            num_classes,
            snapshot,
            query_interval_secs,
            shutdown_tx,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Builds the full HTTP surface: the Telemetry API, a health check (ambient,
/// carried for orchestration liveness probes), request logging, a
/// sliding-window rate limiter, and CORS — the middleware stack wired
/// around every handler.
pub fn router(state: ApiState) -> Router {
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    let control_plane = Router::new()
        .route("/control_plane/ingest_requests", post(ingest_requests))
        .route("/control_plane/query_interval", get(query_interval))
        .route("/control_plane/ready_replicas", get(ready_replicas))
        .route("/control_plane/replica_info", get(replica_info))
        .route("/control_plane/replica_counts", get(replica_counts))
        .route("/control_plane/terminate", post(terminate))
        .route_layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(control_plane)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimestampsPayload {
    Heterogeneous(Vec<Vec<f64>>),
    Homogeneous(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    timestamps: TimestampsPayload,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

/// `POST /control_plane/ingest_requests` — §6. Malformed shape (wrong
/// arity for the heterogeneous policy) is a `ClientError`: 400, no mutation.
async fn ingest_requests(
    State(state): State<ApiState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<MessageResponse>, ControlPlaneError> {
    if state.shutting_down() {
        return Err(ControlPlaneError::TransientExternal(
            "control plane is shutting down, rejecting new telemetry".to_string(),
        ));
    }

    let batch = match req.timestamps {
        TimestampsPayload::Homogeneous(ts) => {
            if state.num_classes != 1 {
                return Err(ControlPlaneError::ClientError(format!(
                    "expected a nested timestamp array of length {} (heterogeneous policy), got a flat array",
                    state.num_classes
                )));
            }
            RequestBatch::Homogeneous(ts)
        }
        TimestampsPayload::Heterogeneous(per_class) => {
            if per_class.len() != state.num_classes {
                return Err(ControlPlaneError::ClientError(format!(
                    "expected {} per-class timestamp lists, got {}",
                    state.num_classes,
                    per_class.len()
                )));
            }
            RequestBatch::Heterogeneous(per_class)
        }
    };

    state.engine.lock().ingest(batch);

    Ok(Json(MessageResponse {
        message: "ok".to_string(),
    }))
}

#[derive(Debug, Serialize)]
struct QueryIntervalResponse {
    query_interval: Option<u64>,
}

/// `GET /control_plane/query_interval` — advisory push cadence for the
/// Request Aggregator (§6).
async fn query_interval(State(state): State<ApiState>) -> Json<QueryIntervalResponse> {
    Json(QueryIntervalResponse {
        query_interval: state.query_interval_secs,
    })
}

#[derive(Debug, Serialize)]
struct ReadyReplicasResponse {
    ready_replicas: Vec<u64>,
}

async fn ready_replicas(State(state): State<ApiState>) -> Json<ReadyReplicasResponse> {
    let snapshot = state.snapshot.load();
    let ready_replicas = snapshot
        .iter()
        .filter(|r| r.status == ReplicaStatus::Ready)
        .map(|r| r.replica_id)
        .collect();
    Json(ReadyReplicasResponse { ready_replicas })
}

#[derive(Debug, Serialize)]
struct ReplicaInfoResponse {
    replicas: Vec<super::types::ReplicaInfo>,
}

async fn replica_info(State(state): State<ApiState>) -> Json<ReplicaInfoResponse> {
    let snapshot = state.snapshot.load();
    Json(ReplicaInfoResponse {
        replicas: snapshot.as_ref().clone(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplicaCountsResponse {
    ready: usize,
    unhealthy: usize,
    failed: usize,
}

async fn replica_counts(State(state): State<ApiState>) -> Json<ReplicaCountsResponse> {
    let snapshot = state.snapshot.load();
    let ready = snapshot.iter().filter(|r| r.status == ReplicaStatus::Ready).count();
    let unhealthy = snapshot
        .iter()
        .filter(|r| r.status == ReplicaStatus::NotReady)
        .count();
    let failed = snapshot.iter().filter(|r| r.status == ReplicaStatus::Failed).count();
    Json(ReplicaCountsResponse {
        ready,
        unhealthy,
        failed,
    })
}

/// `POST /control_plane/terminate` — §5, §6. Signals the shutdown
/// watch channel; callers of `run` (Control Loop, Replica State Fetcher, the
/// HTTP server's graceful shutdown future) all observe it independently.
/// Idempotent: a second call while already shutting down just confirms.
async fn terminate(State(state): State<ApiState>) -> Json<MessageResponse> {
    if state.shutting_down() {
        return Json(MessageResponse {
            message: "already shutting down".to_string(),
        });
    }
    info!("termination requested via telemetry API");
    let _ = state.shutdown_tx.send(true);
    Json(MessageResponse {
        message: "shutdown initiated".to_string(),
    })
}

/// Awaits the shutdown signal for use as `axum::serve`'s graceful-shutdown
/// future, then gives in-flight Replica Manager calls up to `deadline` to
/// finish before the caller proceeds to process exit (§5).
pub async fn await_shutdown(mut rx: watch::Receiver<bool>, deadline: Duration) {
    loop {
        if *rx.borrow() {
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
    warn!(deadline_secs = deadline.as_secs(), "draining in-flight requests before exit");
    tokio::time::sleep(deadline).await;
}
