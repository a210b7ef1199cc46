use http::StatusCode;
use http_body_util::Full;
use hyper::Response;
use hyper::body::Bytes;
use shared::http::make_text_response;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Hot-path error taxonomy. Only a handful of these ever reach the caller;
/// everything else is absorbed by degradation or the DLQ.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing, malformed, or rejected credential.
    #[error("missing or invalid credential")]
    AuthFailure,

    /// The identity service timed out or was unreachable. Still a 401; a
    /// default tenant is never synthesized.
    #[error("credential could not be verified: identity unavailable")]
    AuthUnavailable,

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("no destination resolvable")]
    NoDestination,

    /// In-memory queue and DLQ both refused the event. The only hot-path
    /// condition that surfaces a 5xx.
    #[error("event queue and dead-letter queue are both unavailable")]
    TotalSaturation,

    #[error("cross-tenant access attempt")]
    IsolationViolation,

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dedup store error: {0}")]
    Dedup(#[from] crate::dedup::DedupError),

    #[error("DLQ error: {0}")]
    Dlq(#[from] crate::dlq::DlqError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthFailure | GatewayError::AuthUnavailable => StatusCode::UNAUTHORIZED,
            GatewayError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoDestination => StatusCode::NOT_FOUND,
            GatewayError::TotalSaturation => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::IsolationViolation => StatusCode::FORBIDDEN,
            GatewayError::Invariant(_)
            | GatewayError::Io(_)
            | GatewayError::Dedup(_)
            | GatewayError::Dlq(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The response surfaced to the caller for this error.
    pub fn response(&self) -> Response<Full<Bytes>> {
        make_text_response(self.status(), self.to_string())
    }
}
