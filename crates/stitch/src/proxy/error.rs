//! Error handling for relayed requests
//!
//! Errors raised before the client stream opens become ordinary HTTP
//! responses. Upstream rejections are passed through with their own status
//! and body; everything the gateway itself failed at is reported as JSON.
//! Once the stream has started, the same errors abort the body instead.

use axum::{
    body::Body,
    http::{Response, StatusCode, header},
    response::IntoResponse,
};
use thiserror::Error;
use tracing::{error, warn};

/// Client-facing message for any transport failure
const NETWORK_ERROR_MESSAGE: &str = "Failed to reach upstream";

/// Errors that can occur while relaying a conversation
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Client request could not be parsed or is missing required fields
    #[error("Request error: {0}")]
    Request(String),

    /// Caller sent no usable credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Network-level failure talking to the upstream (connect, timeout, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream answered with a non-success status
    #[error("Upstream error: {status}")]
    Upstream { status: StatusCode, body: String },

    /// A challenge token was required but could not be obtained
    #[error("Challenge error: {0}")]
    Challenge(String),

    /// The upstream kept truncating past the continuation limit
    #[error("Continuation limit of {depth} reached")]
    ChainLimitExceeded { depth: usize },
}

impl ProxyError {
    /// Build an upstream rejection from the raw error body.
    ///
    /// JSON bodies are kept verbatim; anything else is wrapped so the client
    /// always receives JSON.
    pub fn upstream(status: StatusCode, body: &[u8]) -> Self {
        let body = if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
            String::from_utf8_lossy(body).into_owned()
        } else {
            error_body(
                "upstream_error",
                &format!("Upstream returned {status}"),
            )
        };
        ProxyError::Upstream { status, body }
    }

    /// Convert to an HTTP response for the client
    pub fn into_response(self) -> Response<Body> {
        let (status, body) = match &self {
            ProxyError::Upstream { status, body } => (*status, body.clone()),
            ProxyError::Request(message) => (
                StatusCode::BAD_REQUEST,
                error_body("invalid_request_error", message),
            ),
            ProxyError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                error_body("invalid_request_error", message),
            ),
            ProxyError::Challenge(message) => {
                (StatusCode::BAD_GATEWAY, error_body("challenge_error", message))
            }
            // Transport detail stays in the logs
            ProxyError::Network(_) => (
                StatusCode::BAD_GATEWAY,
                error_body("proxy_error", NETWORK_ERROR_MESSAGE),
            ),
            ProxyError::ChainLimitExceeded { .. } => (
                StatusCode::BAD_GATEWAY,
                error_body("proxy_error", &self.to_string()),
            ),
        };

        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Request(_) => "request",
            ProxyError::Unauthorized(_) => "auth",
            ProxyError::Network(_) => "network",
            ProxyError::Upstream { .. } => "upstream",
            ProxyError::Challenge(_) => "challenge",
            ProxyError::ChainLimitExceeded { .. } => "chain_limit",
        }
    }

    /// Log the error at a level matching who is at fault
    pub fn log(&self) {
        match self {
            ProxyError::Request(_) | ProxyError::Unauthorized(_) => warn!(
                error_type = self.category(),
                error_message = %self,
                "Rejected client request"
            ),
            ProxyError::Upstream { status, body } => error!(
                error_type = self.category(),
                status = %status,
                body_length = body.len(),
                "Upstream returned error, passing through to client"
            ),
            _ => error!(
                error_type = self.category(),
                error_message = %self,
                "Relay failed before streaming"
            ),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        self.into_response()
    }
}

/// Render the `{"error": {...}}` body used for gateway-generated errors
pub fn error_body(error_type: &str, message: &str) -> String {
    serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    })
    .to_string()
}
