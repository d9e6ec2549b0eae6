//! Closed error kind for request handling.
//!
//! Every failure inside a single action becomes the `{status, data}` response
//! for that request id; nothing is thrown across the dispatch loop. The kind
//! is translated to JSON exactly once, at the frame-emitting boundary.

use serde_json::{json, Value};
use thiserror::Error;

use crate::store::StoreError;

/// Milliseconds a client should wait after a 429 before retrying.
pub const RETRY_DELAY_MS: u64 = 1000;

/// HTTP-conventional status codes used on the wire.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const INTERNAL: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

/// Failure of a single dispatched action.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// Malformed params or a forbidden state transition.
    #[error("{0}")]
    BadRequest(String),
    /// Invalid session, missing app id, or failed key validation.
    #[error("{0}")]
    Unauthorized(String),
    /// Authenticated but not allowed to touch the resource.
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Rate bucket drained; nothing was attempted.
    #[error("too many requests")]
    TooManyRequests,
    #[error("internal error: {0}")]
    Internal(String),
    /// Storage conflict retries exhausted, or the store is down.
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("storage timeout")]
    GatewayTimeout,
}

pub type RequestResult<T> = Result<T, RequestError>;

impl RequestError {
    /// Wire status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            RequestError::BadRequest(_) => status::BAD_REQUEST,
            RequestError::Unauthorized(_) => status::UNAUTHORIZED,
            RequestError::Forbidden(_) => status::FORBIDDEN,
            RequestError::NotFound(_) => status::NOT_FOUND,
            RequestError::TooManyRequests => status::TOO_MANY_REQUESTS,
            RequestError::Internal(_) => status::INTERNAL,
            RequestError::ServiceUnavailable => status::SERVICE_UNAVAILABLE,
            RequestError::GatewayTimeout => status::GATEWAY_TIMEOUT,
        }
    }

    /// Wire `data` payload for this error.
    ///
    /// 429 carries the retry hint; everything else carries a message.
    pub fn data(&self) -> Value {
        match self {
            RequestError::TooManyRequests => json!({ "retryDelay": RETRY_DELAY_MS }),
            other => json!({ "message": other.to_string() }),
        }
    }
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => RequestError::ServiceUnavailable,
            StoreError::Timeout => RequestError::GatewayTimeout,
            other => RequestError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        RequestError::Internal(format!("serialization: {e}"))
    }
}

impl From<crate::crypto::CryptoError> for RequestError {
    fn from(e: crate::crypto::CryptoError) -> Self {
        RequestError::Internal(format!("crypto: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RequestError::BadRequest("x".into()).status(), 400);
        assert_eq!(RequestError::Unauthorized("x".into()).status(), 401);
        assert_eq!(RequestError::NotFound("database").status(), 404);
        assert_eq!(RequestError::TooManyRequests.status(), 429);
        assert_eq!(RequestError::ServiceUnavailable.status(), 503);
        assert_eq!(RequestError::GatewayTimeout.status(), 504);
    }

    #[test]
    fn test_rate_limit_carries_retry_delay() {
        let data = RequestError::TooManyRequests.data();
        assert_eq!(data["retryDelay"], RETRY_DELAY_MS);
    }

    #[test]
    fn test_message_data() {
        let data = RequestError::BadRequest("Item already exists".into()).data();
        assert_eq!(data["message"], "Item already exists");
    }

    #[test]
    fn test_store_error_mapping() {
        let e: RequestError = StoreError::Unavailable("down".into()).into();
        assert_eq!(e.status(), 503);
        let e: RequestError = StoreError::Timeout.into();
        assert_eq!(e.status(), 504);
        let e: RequestError = StoreError::TxConflict.into();
        assert_eq!(e.status(), 500);
    }
}
