use std::error::Error;
use std::fmt;

use http::StatusCode;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone)]
pub enum DispatchError {
    /// 401 from the refresh grant or the upstream call.
    AuthInvalid(String),
    /// 429 with a short, parseable cooldown.
    RateLimited { reset_ms: u64 },
    /// 429 whose cooldown exceeds the wait ceiling, or a wholly limited pool.
    QuotaExhausted { reset_ms: u64 },
    EmptyResponse,
    UpstreamServerError { status: u16 },
    NetworkError(String),
    NoAccountsAvailable,
    MaxRetriesExceeded,
    /// 4xx other than 401/429: surfaced to the client unchanged.
    BadRequest { status: u16, body: String },
    UpstreamDisconnect,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::AuthInvalid(msg) => write!(f, "upstream auth invalid: {msg}"),
            DispatchError::RateLimited { reset_ms } => {
                write!(f, "rate limited, retry in {reset_ms}ms")
            }
            DispatchError::QuotaExhausted { reset_ms } => {
                write!(f, "RESOURCE_EXHAUSTED: all accounts cooling down for {reset_ms}ms")
            }
            DispatchError::EmptyResponse => write!(f, "upstream returned an empty response"),
            DispatchError::UpstreamServerError { status } => {
                write!(f, "upstream server error: {status}")
            }
            DispatchError::NetworkError(msg) => write!(f, "network error: {msg}"),
            DispatchError::NoAccountsAvailable => write!(f, "no accounts available"),
            DispatchError::MaxRetriesExceeded => write!(f, "max retries exceeded"),
            DispatchError::BadRequest { status, .. } => {
                write!(f, "upstream rejected the request: {status}")
            }
            DispatchError::UpstreamDisconnect => write!(f, "upstream disconnected mid-stream"),
        }
    }
}

impl Error for DispatchError {}

impl DispatchError {
    /// HTTP status presented to the client when the error escapes dispatch.
    pub fn client_status(&self) -> StatusCode {
        match self {
            DispatchError::QuotaExhausted { .. }
            | DispatchError::RateLimited { .. }
            | DispatchError::NoAccountsAvailable
            | DispatchError::MaxRetriesExceeded => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::BadRequest { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            DispatchError::AuthInvalid(_) => StatusCode::BAD_GATEWAY,
            DispatchError::UpstreamServerError { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::NetworkError(_) | DispatchError::UpstreamDisconnect => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::EmptyResponse => StatusCode::BAD_GATEWAY,
        }
    }

    /// `Retry-After` seconds, where a reset instant is known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DispatchError::RateLimited { reset_ms } | DispatchError::QuotaExhausted { reset_ms } => {
                Some(reset_ms.div_ceil(1000))
            }
            _ => None,
        }
    }

    /// Error kind in the Anthropic error envelope vocabulary.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::RateLimited { .. }
            | DispatchError::QuotaExhausted { .. }
            | DispatchError::NoAccountsAvailable
            | DispatchError::MaxRetriesExceeded => "rate_limit_error",
            DispatchError::BadRequest { .. } => "invalid_request_error",
            DispatchError::AuthInvalid(_) => "authentication_error",
            DispatchError::EmptyResponse
            | DispatchError::UpstreamServerError { .. }
            | DispatchError::NetworkError(_)
            | DispatchError::UpstreamDisconnect => "api_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_surface_as_429_with_retry_after() {
        let err = DispatchError::QuotaExhausted { reset_ms: 150_500 };
        assert_eq!(err.client_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_secs(), Some(151));
        assert!(err.to_string().contains("RESOURCE_EXHAUSTED"));
    }

    #[test]
    fn bad_request_passes_status_through() {
        let err = DispatchError::BadRequest {
            status: 422,
            body: "{}".to_string(),
        };
        assert_eq!(err.client_status().as_u16(), 422);
        assert_eq!(err.retry_after_secs(), None);
    }
}
