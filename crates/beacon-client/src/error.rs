// Client error taxonomy. Every completion resolves with a specific kind;
// ErrorInfo carries the wire-level code alongside.
use std::sync::Arc;

use beacon_wire::ErrorInfo;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes used when the library originates an `ErrorInfo`.
pub mod code {
    pub const BAD_REQUEST: i32 = 40_000;
    pub const PAYLOAD_UNSUPPORTED: i32 = 40_013;
    pub const AUTH_FAILURE: i32 = 40_100;
    pub const TOKEN_EXPIRED: i32 = 40_142;
    pub const TIMEOUT: i32 = 50_003;
    pub const CONNECT_REFUSED: i32 = 80_000;
    pub const SUSPENDED: i32 = 80_002;
    pub const DISCONNECTED: i32 = 80_003;
    pub const PROTOCOL_VIOLATION: i32 = 80_013;
    pub const CHANNEL_FAILED: i32 = 90_000;
    pub const QUEUE_OVERFLOW: i32 = 90_010;
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("codec: {0}")]
    Codec(Arc<beacon_codec::Error>),
    #[error("transport: {0}")]
    Transport(ErrorInfo),
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    ConnectRefused(ErrorInfo),
    #[error("authentication failed: {0}")]
    AuthFailure(ErrorInfo),
    #[error("channel failed: {0}")]
    ChannelFailed(ErrorInfo),
    #[error("channel is suspended")]
    ChannelSuspended,
    #[error("send queue overflow")]
    QueueOverflow,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("disconnected: {0}")]
    Disconnected(ErrorInfo),
    #[error("connection is closed")]
    Closed,
}

impl From<beacon_codec::Error> for Error {
    fn from(err: beacon_codec::Error) -> Self {
        Error::Codec(Arc::new(err))
    }
}

impl Error {
    pub(crate) fn disconnected() -> Self {
        Error::Disconnected(ErrorInfo::new(
            code::DISCONNECTED,
            503,
            "connection disconnected",
        ))
    }

    /// Classify a wire-level `ErrorInfo` into the matching error kind.
    pub fn from_error_info(info: ErrorInfo) -> Self {
        match info.code {
            code::TIMEOUT => Error::Timeout,
            c if (40_100..40_200).contains(&c) => Error::AuthFailure(info),
            code::SUSPENDED => Error::ChannelSuspended,
            code::DISCONNECTED => Error::Disconnected(info),
            code::PROTOCOL_VIOLATION => Error::ProtocolViolation(info.message),
            c if (90_000..91_000).contains(&c) => Error::ChannelFailed(info),
            _ => Error::Transport(info),
        }
    }

    /// The `ErrorInfo` surfaced in state-change events for this error.
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Error::Codec(err) => {
                ErrorInfo::new(code::PAYLOAD_UNSUPPORTED, 400, err.to_string())
            }
            Error::Transport(info)
            | Error::ConnectRefused(info)
            | Error::AuthFailure(info)
            | Error::ChannelFailed(info)
            | Error::Disconnected(info) => info.clone(),
            Error::Timeout => ErrorInfo::new(code::TIMEOUT, 504, "operation timed out"),
            Error::ChannelSuspended => {
                ErrorInfo::new(code::SUSPENDED, 503, "channel is suspended")
            }
            Error::QueueOverflow => {
                ErrorInfo::new(code::QUEUE_OVERFLOW, 503, "send queue overflow")
            }
            Error::ProtocolViolation(message) => {
                ErrorInfo::new(code::PROTOCOL_VIOLATION, 400, message.clone())
            }
            Error::Closed => ErrorInfo::new(code::DISCONNECTED, 400, "connection is closed"),
        }
    }
}

/// Token-scoped errors are renewable: the client fetches a fresh token and
/// reconnects instead of failing the connection.
pub(crate) fn is_token_error(info: &ErrorInfo) -> bool {
    (40_140..40_150).contains(&info.code)
}

/// Client-scoped (4xxxx) errors other than token expiry cannot be retried
/// away and fail the connection.
pub(crate) fn is_fatal(info: &ErrorInfo) -> bool {
    (40_000..50_000).contains(&info.code) && !is_token_error(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_are_renewable_not_fatal() {
        let expired = ErrorInfo::new(code::TOKEN_EXPIRED, 401, "token expired");
        assert!(is_token_error(&expired));
        assert!(!is_fatal(&expired));
    }

    #[test]
    fn client_errors_are_fatal() {
        let invalid = ErrorInfo::new(40_005, 400, "invalid credential");
        assert!(is_fatal(&invalid));
        let server_side = ErrorInfo::new(50_000, 500, "internal");
        assert!(!is_fatal(&server_side));
    }

    #[test]
    fn error_info_keeps_specific_codes() {
        assert_eq!(Error::Timeout.error_info().code, code::TIMEOUT);
        assert_eq!(Error::QueueOverflow.error_info().code, code::QUEUE_OVERFLOW);
        assert_eq!(
            Error::disconnected().error_info().code,
            code::DISCONNECTED
        );
    }
}
