use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub type LimiterResult<T> = Result<T, LimiterError>;

/// Failures inside a limiter. None of these reach an HTTP caller directly; they
/// degrade to a denial or to the local fallback.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("invalid token cost {0}: cost must not be negative")]
    InvalidCost(i64),
    #[error("failed to read bucket state: {0}")]
    StoreRead(String),
    #[error("failed to write bucket state: {0}")]
    StoreWrite(String),
    #[error("remote store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("remote script evaluation failed: {0}")]
    ScriptEval(String),
    #[error("limiter misconfigured: {0}")]
    Misconfiguration(String),
}

impl LimiterError {
    /// True for errors raised by the remote store round-trip, which a hybrid
    /// limiter may recover from by consulting its local fallback.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ScriptEval(_))
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.kind() == redis::ErrorKind::IoError
        {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::ScriptEval(err.to_string())
        }
    }
}

#[derive(Debug)]
pub enum GatewayError {
    RateLimited,
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::RateLimited => "Rate limit exceeded".to_string(),
            Self::Internal(msg) => msg.clone(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorBody {
                error: self.code(),
                message: self.message(),
            }),
        )
            .into_response();

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<LimiterError> for GatewayError {
    fn from(err: LimiterError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn connection_failures_are_store_unavailable() {
        let err = redis::RedisError::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let err = LimiterError::from(err);
        assert!(matches!(err, LimiterError::StoreUnavailable(_)));
        assert!(err.is_remote_failure());
    }

    #[test]
    fn response_errors_are_script_failures() {
        let err = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "ERR Error running script",
        ));
        let err = LimiterError::from(err);
        assert!(matches!(err, LimiterError::ScriptEval(_)));
        assert!(err.is_remote_failure());
    }

    #[test]
    fn local_errors_are_not_remote_failures() {
        assert!(!LimiterError::InvalidCost(-1).is_remote_failure());
        assert!(!LimiterError::StoreRead("boom".into()).is_remote_failure());
        assert!(!LimiterError::Misconfiguration("boom".into()).is_remote_failure());
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let response = GatewayError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
