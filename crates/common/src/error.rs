//! Error types for elvisp

use crate::protocol::ErrorCode;
use std::net::IpAddr;
use thiserror::Error;

/// Result type alias using the elvisp Error
pub type Result<T> = std::result::Result<T, Error>;

/// elvisp error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Address pool exhausted")]
    PoolExhausted,

    #[error("Address {address} is already bound to {owner}")]
    AddressConflict { address: IpAddr, owner: String },

    #[error("Address {0} is not inside any configured range")]
    NotInPool(IpAddr),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Mesh daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("Corrupt store record {key}: {reason}")]
    StoreCorruption { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// Whether a failed daemon call is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout { .. } | Error::DaemonUnreachable(_)
        )
    }

    /// Wire code reported to clients
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Unauthorized => ErrorCode::Unauthorized,
            Error::PoolExhausted => ErrorCode::PoolExhausted,
            Error::AddressConflict { .. } | Error::AllocationFailed(_) => {
                ErrorCode::AllocationFailed
            }
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::NotInPool(_) | Error::InvalidKey(_) | Error::Protocol(_) => {
                ErrorCode::BadRequest
            }
            _ => ErrorCode::Internal,
        }
    }
}
