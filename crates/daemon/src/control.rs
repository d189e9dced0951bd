//! Mesh daemon control interface
//!
//! The reconciler only talks to the daemon through [`TunnelControl`]. The
//! cjdns admin adapter lives in [`crate::cjdns`]; [`MemoryControl`] keeps the
//! tunnel table in process for dry runs and tests.

use async_trait::async_trait;
use elvisp_common::{Error, LiveTunnel, Result, TunnelBinding};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Control channel of the mesh-routing daemon
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Tunnels currently configured in the daemon
    async fn list(&self) -> Result<Vec<LiveTunnel>>;

    /// Authorize a tunnel for `binding`
    async fn allow(&self, binding: &TunnelBinding) -> Result<()>;

    /// Tear down a live tunnel
    async fn remove(&self, tunnel: &LiveTunnel) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// In-process tunnel table
#[derive(Default)]
pub struct MemoryControl {
    tunnels: Mutex<BTreeMap<u64, TunnelBinding>>,
    next_handle: AtomicU64,
    failing_pushes: AtomicU32,
    unreachable: AtomicBool,
    pushes: AtomicU64,
    push_delay_ms: AtomicU64,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` allow/remove calls
    pub fn fail_next_pushes(&self, n: u32) {
        self.failing_pushes.store(n, Ordering::SeqCst);
    }

    /// Delay every allow/remove call, like a slow daemon
    pub fn set_push_delay(&self, delay: Duration) {
        self.push_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every call fail until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Add a tunnel behind the reconciler's back
    pub fn insert(&self, binding: TunnelBinding) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.tunnels.lock().insert(handle, binding);
        handle
    }

    /// Current bindings, in handle order
    pub fn bindings(&self) -> Vec<TunnelBinding> {
        self.tunnels.lock().values().copied().collect()
    }

    /// Number of allow/remove calls received, failed ones included
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::DaemonUnreachable("daemon is down".to_string()));
        }
        Ok(())
    }

    async fn check_push(&self) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let delay = self.push_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_reachable()?;
        let failed = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::DaemonUnreachable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelControl for MemoryControl {
    async fn list(&self) -> Result<Vec<LiveTunnel>> {
        self.check_reachable()?;
        Ok(self
            .tunnels
            .lock()
            .iter()
            .map(|(handle, binding)| LiveTunnel {
                handle: *handle,
                binding: *binding,
            })
            .collect())
    }

    async fn allow(&self, binding: &TunnelBinding) -> Result<()> {
        self.check_push().await?;
        let handle = self.insert(*binding);
        info!("[dry-run] allowed tunnel #{} {}", handle, binding);
        Ok(())
    }

    async fn remove(&self, tunnel: &LiveTunnel) -> Result<()> {
        self.check_push().await?;
        if self.tunnels.lock().remove(&tunnel.handle).is_some() {
            info!("[dry-run] removed tunnel #{} {}", tunnel.handle, tunnel.binding);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elvisp_common::PublicKey;

    fn binding(n: u8) -> TunnelBinding {
        TunnelBinding {
            public_key: PublicKey::from_bytes([n; 32]),
            address: format!("::{}", n).parse().unwrap(),
            prefix: 0,
        }
    }

    #[tokio::test]
    async fn test_allow_list_remove() {
        let control = MemoryControl::new();
        control.allow(&binding(1)).await.unwrap();
        control.allow(&binding(2)).await.unwrap();

        let live = control.list().await.unwrap();
        assert_eq!(live.len(), 2);

        control.remove(&live[0]).await.unwrap();
        assert_eq!(control.bindings(), vec![binding(2)]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let control = MemoryControl::new();
        control.fail_next_pushes(2);
        assert!(control.allow(&binding(1)).await.is_err());
        assert!(control.allow(&binding(1)).await.is_err());
        control.allow(&binding(1)).await.unwrap();
        assert_eq!(control.push_count(), 3);

        control.set_unreachable(true);
        assert!(control.list().await.is_err());
        control.set_unreachable(false);
        assert_eq!(control.list().await.unwrap().len(), 1);
    }
}
