use rhizome_core::error::{ErrorCode, RhizomeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: u64 },
    #[error("{kind} not found: {key}")]
    KeyNotFound { kind: &'static str, key: String },
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("session quota exceeded: {dimension}")]
    QuotaExceeded { dimension: &'static str },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("snapshot codec error: {0}")]
    Codec(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: u64) -> Self {
        StoreError::NotFound { kind, id }
    }

    pub fn already_exists(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::AlreadyExists {
            kind,
            key: key.into(),
        }
    }
}

impl RhizomeError for StoreError {
    fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound { .. } | StoreError::KeyNotFound { .. } => ErrorCode::NotFound,
            StoreError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            StoreError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            StoreError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            StoreError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            StoreError::Codec(_) | StoreError::Io(_) => ErrorCode::Internal,
        }
    }
}
