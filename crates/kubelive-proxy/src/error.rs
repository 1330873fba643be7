//! Error types for the emulation proxy
//!
//! Errors are isolated to the request that produced them and rendered as a
//! Kubernetes `Status` object so that kubectl prints them the way it prints
//! API server errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed client input for a synthesized route
    #[error("{0}")]
    BadRequest(String),

    /// The bundle holds no data for the request
    #[error("{0}")]
    NotFound(String),

    /// The upstream API server could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is served with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable `reason` of the Status object
    fn reason(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BadRequest",
            Error::NotFound(_) => "NotFound",
            Error::UpstreamUnavailable(_) => "ServiceUnavailable",
            Error::Config(_) | Error::Internal(_) => "InternalError",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Return K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}
