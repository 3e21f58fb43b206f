//! Request execution engine for the `api.php` protocol.

use serde_json::Value;

pub mod cache;
pub mod params;
pub mod query;
pub mod request;

pub use cache::{CacheError, CachedRequest};
pub use params::{ParamError, ParamSet};
pub use query::QueryCursor;
pub use request::Request;

/// Errors raised by the request engine: the server's structured `error`
/// object plus client-side failure modes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Structured error returned by the server's `error` object.
    /// `extra` carries any additional fields verbatim; a `*` field is
    /// renamed to `help` before surfacing.
    #[error("{code}: {info}")]
    Api {
        /// Machine-readable error code.
        code: String,
        /// Human-readable description.
        info: String,
        /// Remaining fields of the error object.
        extra: serde_json::Map<String, Value>,
    },

    /// Retry budget exhausted. Never conflated with a server error.
    #[error("maximum retries attempted without success")]
    Timeout,

    /// Unrecoverable transport fault (bad TLS, malformed request).
    #[error("fatal transport error: {0}")]
    FatalTransport(String),

    /// The response body was not the expected wire shape.
    #[error("invalid API response: {0}")]
    InvalidResponse(String),

    /// Session recovery gave up after the replay cap.
    #[error("session expired and re-login replay failed after {attempts} attempts")]
    SessionExpired {
        /// Number of re-login replays attempted.
        attempts: u32,
    },

    /// The server throttled the login; retry after the wait elapses.
    #[error("login throttled, retry in {wait_seconds}s")]
    LoginThrottled {
        /// Seconds remaining until another attempt is allowed.
        wait_seconds: i64,
    },

    /// Credential exchange failed.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Query module selection or discovery failed (unknown module, or
    /// a cursor built over a non-query action).
    #[error("invalid query module: {0}")]
    InvalidModule(String),

    /// The operation was aborted by a shutdown request.
    #[error("operation cancelled by shutdown request")]
    Cancelled,

    /// Parameter construction or serialization error.
    #[error("parameter error: {0}")]
    Params(#[from] params::ParamError),

    /// Family or site resolution error.
    #[error("family error: {0}")]
    Family(#[from] crate::site::family::FamilyError),

    /// Response cache error.
    #[error("cache error: {0}")]
    Cache(#[from] cache::CacheError),
}

impl ApiError {
    /// The server-side error code, if this is a structured API error.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type ApiResult<T> = Result<T, ApiError>;
