//! elvisp daemon
//!
//! Registration service, mesh daemon reconciliation and the client listener.

pub mod bencode;
pub mod cjdns;
pub mod config;
pub mod control;
pub mod credentials;
pub mod reconciler;
pub mod registry;
pub mod server;

pub use config::DaemonConfig;
pub use control::{MemoryControl, TunnelControl};
pub use reconciler::{reload_channel, ReconcileReport, Reconciler, ReloadHandle, TunnelOp};
pub use registry::Registry;
pub use server::{serve, Dispatcher};
