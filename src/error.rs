//! Error taxonomy for the inference gateway
//!
//! Distinguishes caller mistakes (never retried), transient node failures
//! (retried against another candidate), and terminal conditions. The Retry
//! Coordinator consults `is_retryable` and `is_connection_error` to decide
//! failure accounting per attempt.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the gateway core
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request: missing model/messages, out-of-range parameters
    #[error("invalid request: {0}")]
    Validation(String),

    /// Bad or missing client credential
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller's tier does not permit the request
    #[error("tier limit: {0}")]
    TierLimit(String),

    /// The candidate pool came up empty
    #[error("no inference nodes available")]
    NoCandidates,

    /// Transient failure on one node: 5xx, aborted stream, node-reported error
    #[error("node failure: {0}")]
    NodeFailure(String),

    /// Connection could not be established; the node is treated as down
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// 404 on the OpenAI path against an unprobed node
    #[error("protocol mismatch at {0}")]
    ProtocolMismatch(String),

    /// Back-channel worker went away while a request was pending
    #[error("worker disconnected: {0}")]
    WorkerDisconnect(String),

    /// Per-attempt deadline or stream inactivity deadline expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The client dropped the response stream; no further attempts are made
    #[error("client disconnected")]
    ClientDisconnected,

    /// Gateway is shutting down; every pending entity fails with this
    #[error("gateway shutting down")]
    Shutdown,

    /// Every candidate was attempted and all of them failed
    #[error("all inference nodes failed")]
    AllNodesFailed,
}

impl GatewayError {
    /// Whether the Retry Coordinator may try another candidate after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::NodeFailure(_)
                | GatewayError::ConnectionFailed(_)
                | GatewayError::ProtocolMismatch(_)
                | GatewayError::WorkerDisconnect(_)
                | GatewayError::Timeout(_)
        )
    }

    /// Connection-level failures force the node offline immediately
    pub fn is_connection_error(&self) -> bool {
        matches!(self, GatewayError::ConnectionFailed(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::TierLimit(_) => StatusCode::FORBIDDEN,
            GatewayError::NoCandidates | GatewayError::AllNodesFailed | GatewayError::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::Unauthorized(_) => "authentication_error",
            GatewayError::TierLimit(_) => "permission_error",
            GatewayError::NoCandidates | GatewayError::AllNodesFailed => "service_unavailable",
            GatewayError::Timeout(_) => "timeout_error",
            _ => "upstream_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        }));
        (self.status(), body).into_response()
    }
}
