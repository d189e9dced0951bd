//! elvisp CLI
//!
//! Command-line interface for requesting tunnel addresses from an elvisp
//! server and administering its allocations.

pub mod client;
pub mod commands;
pub mod output;
