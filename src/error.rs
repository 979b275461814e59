//! Control-plane error taxonomy (§7).
//!
//! Four kinds, each with a distinct handling policy: `TransientExternal`
//! failures are logged and retried next tick; `InvariantViolation`s
//! quarantine the offending replica; `ConfigurationError`s are fatal at
//! startup; `ClientError`s map to an HTTP 400 with no state mutation. The
//! Decision Engine itself never returns an error (it is total over any
//! snapshot) — everything here lives at a boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// State-store or provisioning RPC failure, timeout. Caller abandons the
    /// current tick and retries on the next one.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// E.g. a fallback replica with no owning primary, a negative replica
    /// count. The offending replica is quarantined until the next state
    /// refresh rather than crashing the process.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Unknown accelerator class, threshold inversion, `min > max`. Fatal at
    /// startup (exit code 2).
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Malformed telemetry payload. Maps to HTTP 400, no state mutation.
    #[error("client error: {0}")]
    ClientError(String),
}

/// Maps `ClientError` to 400 for Telemetry API handlers (§7). Any other
/// variant reaching an HTTP boundary is a bug, not a client mistake, so it
/// surfaces as 500 rather than silently degrading into a 4xx.
impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlPlaneError::ClientError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}
