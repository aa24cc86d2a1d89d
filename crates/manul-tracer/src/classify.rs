//! Error classification for failed calls

use std::fmt;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::{TransportError, TransportErrorKind};

/// Category recorded on error traces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// HTTP 429
    RateLimitError,
    /// HTTP 401
    AuthenticationError,
    /// HTTP 404
    NotFoundError,
    /// HTTP 5xx
    ServerError,
    /// 4xx whose body mentions `context_length_exceeded`
    ContextLengthExceededError,
    /// 4xx whose body mentions `invalid_request`
    InvalidRequestError,
    /// Any other 4xx
    ClientError,
    /// Anything that is not an HTTP error
    UnknownError,
    /// Request did not finish in time
    TimeoutError,
    /// Connection could not be established
    ConnectError,
    /// Request could not be built or sent
    RequestError,
    /// Response body could not be read
    BodyError,
    /// Response body could not be decoded
    DecodeError,
    /// Any other transport failure
    TransportError,
}

impl ErrorCategory {
    /// Name stored on the trace
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimitError => "RateLimitError",
            Self::AuthenticationError => "AuthenticationError",
            Self::NotFoundError => "NotFoundError",
            Self::ServerError => "ServerError",
            Self::ContextLengthExceededError => "ContextLengthExceededError",
            Self::InvalidRequestError => "InvalidRequestError",
            Self::ClientError => "ClientError",
            Self::UnknownError => "UnknownError",
            Self::TimeoutError => "TimeoutError",
            Self::ConnectError => "ConnectError",
            Self::RequestError => "RequestError",
            Self::BodyError => "BodyError",
            Self::DecodeError => "DecodeError",
            Self::TransportError => "TransportError",
        }
    }

    /// Whether the failure happened below HTTP
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::TimeoutError
                | Self::ConnectError
                | Self::RequestError
                | Self::BodyError
                | Self::DecodeError
                | Self::TransportError
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TransportErrorKind> for ErrorCategory {
    fn from(kind: TransportErrorKind) -> Self {
        match kind {
            TransportErrorKind::Timeout => Self::TimeoutError,
            TransportErrorKind::Connect => Self::ConnectError,
            TransportErrorKind::Request => Self::RequestError,
            TransportErrorKind::Body => Self::BodyError,
            TransportErrorKind::Decode => Self::DecodeError,
            TransportErrorKind::Other => Self::TransportError,
        }
    }
}

/// Classify an HTTP failure from its status and body
pub fn classify_status(status: StatusCode, body: &str) -> ErrorCategory {
    match status.as_u16() {
        429 => ErrorCategory::RateLimitError,
        401 => ErrorCategory::AuthenticationError,
        404 => ErrorCategory::NotFoundError,
        500..=u16::MAX => ErrorCategory::ServerError,
        400..=499 => {
            let body = body.to_ascii_lowercase();
            if body.contains("context_length_exceeded") {
                ErrorCategory::ContextLengthExceededError
            } else if body.contains("invalid_request") {
                ErrorCategory::InvalidRequestError
            } else {
                ErrorCategory::ClientError
            }
        }
        _ => ErrorCategory::UnknownError,
    }
}

/// Classify a failure that produced no HTTP response
pub fn classify_transport_error(err: &TransportError) -> ErrorCategory {
    err.kind().into()
}

/// Error code of an HTTP failure: the body's `error.code` when present,
/// otherwise the numeric status.
pub fn http_error_code(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| match value.get("error")?.get("code")? {
            Value::String(code) if !code.is_empty() => Some(code.clone()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| status.as_u16().to_string())
}
