//! elvisp Common Library
//!
//! Shared types, the address pool, the allocation store and the wire
//! protocol used by the elvisp daemon and CLI.

pub mod db;
pub mod error;
pub mod key;
pub mod pool;
pub mod protocol;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use key::PublicKey;
pub use pool::AddressPool;
pub use protocol::{ErrorCode, Request, Response};
pub use store::AllocationStore;
pub use types::*;

use sha2::{Digest, Sha256};

/// elvisp version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".elvisp")
}

/// Default location of the cjdns admin credential file
pub fn default_cjdnsadmin_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".cjdnsadmin")
}

/// Hex SHA-256 of a shared secret, used for password comparison and storage
pub fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Check a secret against a stored digest without an early exit
pub fn secret_matches(secret: &str, digest: &str) -> bool {
    constant_time_eq(&secret_digest(secret), digest)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        v |= x ^ y;
    }
    v == 0
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
