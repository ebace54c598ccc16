use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    DimensionMismatch,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    SessionNotFound,
    SessionExpired,
    SessionRequired,
    RateLimited,
    FrameTooLarge,
    ProtocolError,
    Internal,
    Timeout,
    Canceled,
    Exhausted,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::DimensionMismatch => "DIMENSION_MISMATCH",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::SessionRequired => "SESSION_REQUIRED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Exhausted => "EXHAUSTED",
        };
        write!(f, "{}", s)
    }
}

/// Implemented by every crate-level error so handlers can translate domain
/// failures into stable wire codes without matching on concrete types.
pub trait RhizomeError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}
