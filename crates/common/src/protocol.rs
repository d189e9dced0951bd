//! Wire protocol between clients and the registration server
//!
//! Newline-delimited JSON over TCP: one [`Request`] per line, answered by one
//! [`Response`] line.

use crate::key::PublicKey;
use crate::types::Allocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Default TCP port of the registration server
pub const DEFAULT_PORT: u16 = 4132;

/// Default maximum length of one protocol line
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024;

/// Client request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Obtain (or renew) an address for `public_key`
    Register {
        password: String,
        public_key: PublicKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred: Option<IpAddr>,
    },
    /// Look up the caller's current allocation
    Lease {
        password: String,
        public_key: PublicKey,
    },
    /// Give up the caller's allocation
    Release {
        password: String,
        public_key: PublicKey,
    },
    /// Administrative removal of a client's allocation
    Revoke {
        admin_password: String,
        public_key: PublicKey,
    },
    /// List all allocations
    List { admin_password: String },
    /// Schedule a full reconciliation with the mesh daemon
    Reload { admin_password: String },
    Ping,
}

impl Request {
    /// Operation name, for logging
    pub fn op(&self) -> &'static str {
        match self {
            Request::Register { .. } => "register",
            Request::Lease { .. } => "lease",
            Request::Release { .. } => "release",
            Request::Revoke { .. } => "revoke",
            Request::List { .. } => "list",
            Request::Reload { .. } => "reload",
            Request::Ping => "ping",
        }
    }
}

// Keep secrets out of logs
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Register {
                public_key,
                preferred,
                ..
            } => f
                .debug_struct("Register")
                .field("public_key", public_key)
                .field("preferred", preferred)
                .finish_non_exhaustive(),
            Request::Lease { public_key, .. }
            | Request::Release { public_key, .. }
            | Request::Revoke { public_key, .. } => f
                .debug_struct(self.op())
                .field("public_key", public_key)
                .finish_non_exhaustive(),
            _ => f.write_str(self.op()),
        }
    }
}

/// Server response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// New or renewed allocation; `server_key` is the key to tunnel to
    Allocated {
        allocation: Allocation,
        server_key: String,
    },
    Lease {
        allocation: Allocation,
        server_key: String,
    },
    Released { allocation: Allocation },
    Allocations { allocations: Vec<Allocation> },
    ReloadScheduled { coalesced: bool },
    Pong { version: String },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<crate::Error> for Response {
    fn from(e: crate::Error) -> Self {
        Response::Error {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Error classes reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    PoolExhausted,
    AllocationFailed,
    NotFound,
    BadRequest,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unauthorized => write!(f, "unauthorized"),
            ErrorCode::PoolExhausted => write!(f, "pool_exhausted"),
            ErrorCode::AllocationFailed => write!(f, "allocation_failed"),
            ErrorCode::NotFound => write!(f, "not_found"),
            ErrorCode::BadRequest => write!(f, "bad_request"),
            ErrorCode::Internal => write!(f, "internal"),
        }
    }
}
