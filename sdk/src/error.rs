use rhizome_core::error::{ErrorCode, RhizomeError};
use rhizome_core::protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server error [{code}]: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("request deadline exceeded")]
    Timeout,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl RhizomeError for ClientError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ClientError::Io(_) | ClientError::Tls(_) => ErrorCode::Internal,
            ClientError::Protocol(err) => err.error_code(),
            ClientError::Server { code, .. } => *code,
            ClientError::AuthFailed(_) => ErrorCode::Unauthorized,
            ClientError::Exhausted => ErrorCode::Exhausted,
            ClientError::Timeout => ErrorCode::Timeout,
            ClientError::Unexpected(_) => ErrorCode::ProtocolError,
        }
    }
}

impl ClientError {
    /// Transport-level failures are worth a fresh connection; server-side
    /// rejections are not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::Tls(_)
        )
    }
}
