//! Uniform error surface shared by the HTTP and WebSocket adapters.
//!
//! `TransitError` is the one error type the transfer coordinator raises.
//! Each adapter renders it through its own surface (HTTP status code or
//! WebSocket close code) rather than duplicating the taxonomy — mirroring
//! the single-factory-function design of the original `raise_http_exception`
//! / `send_error_and_close` callbacks, just expressed as a typed enum plus
//! per-adapter rendering instead of two bespoke closures.

use axum::http::StatusCode;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The full error taxonomy a transfer can surface (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("File too large. 1GiB maximum for HTTP.")]
    TooLarge,

    #[error("{0}")]
    Timeout(String),

    /// The other side gave up: DEAD sentinel from the sender, or a receiver
    /// that disconnected mid-download.
    #[error("{0}")]
    PeerGone(String),

    #[error("Transfer was truncated: fewer bytes were received than declared.")]
    Truncated,

    #[error("{0}")]
    Internal(String),
}

impl TransitError {
    /// HTTP status this error maps to when the response has not started yet.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransitError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TransitError::Conflict(_) => StatusCode::CONFLICT,
            TransitError::NotFound(_) => StatusCode::NOT_FOUND,
            TransitError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            TransitError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            TransitError::PeerGone(_) => StatusCode::BAD_REQUEST,
            TransitError::Truncated => StatusCode::INTERNAL_SERVER_ERROR,
            TransitError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// WebSocket close code + reason for `send_error_and_close`-style callbacks.
    /// Every propagating error closes with 1011 (internal error) per spec §4.4 —
    /// the close code doesn't distinguish taxonomy, only the text message does.
    pub fn close_code(&self) -> u16 {
        1011
    }
}

impl axum::response::IntoResponse for TransitError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Callback invoked when `collect_upload`/`supply_download` hit a recoverable
/// error, matching spec §4.4's `async function(error) -> void` contract.
pub type OnError = Arc<dyn Fn(TransitError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap a plain async closure as an `OnError` callback.
pub fn on_error<F, Fut>(f: F) -> OnError
where
    F: Fn(TransitError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |e| Box::pin(f(e)))
}
