//! Registration service
//!
//! Authenticates clients and hands out addresses. The pool and the store are
//! only ever changed together under the allocation lock; daemon pushes happen
//! after the lock is released.

use crate::config::DaemonConfig;
use crate::reconciler::{Reconciler, TunnelOp};
use elvisp_common::{
    secret_digest, secret_matches, AddressPool, Allocation, AllocationStore, ClientId, Credential,
    Error, Result,
};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registration service
pub struct Registry {
    password_digest: String,
    pool: Mutex<AddressPool>,
    store: Arc<AllocationStore>,
    reconciler: Arc<Reconciler>,
    ttl: Option<u64>,
    sync_push: bool,
}

impl Registry {
    /// Build the pool from configuration and replay the store into it.
    ///
    /// Stored allocations outside every configured range are dropped.
    pub fn open(
        config: &DaemonConfig,
        store: Arc<AllocationStore>,
        reconciler: Arc<Reconciler>,
    ) -> Result<Self> {
        let mut pool = AddressPool::new(config.address_ranges()?)?;

        for mut allocation in store.all() {
            match pool.claim(allocation.address) {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "Dropping allocation {} -> {}: {}",
                        allocation.client_id, allocation.address, e
                    );
                    store.remove(&allocation.client_id)?;
                    continue;
                }
            }

            // Range prefix changed since the allocation was made
            let prefix = pool.prefix_for(&allocation.address).unwrap_or(allocation.prefix);
            if prefix != allocation.prefix {
                debug!(
                    "Updating prefix of {} from /{} to /{}",
                    allocation.address, allocation.prefix, prefix
                );
                allocation.prefix = prefix;
                store.put(&allocation)?;
            }
        }

        if let Some(admin_password) = &config.admin_password {
            store.set_admin_hash(&secret_digest(admin_password))?;
        }

        info!(
            "Address pool ready: {} addresses, {} allocated",
            pool.capacity(),
            pool.allocated_count()
        );

        Ok(Self {
            password_digest: secret_digest(&config.password),
            pool: Mutex::new(pool),
            store,
            reconciler,
            ttl: config.allocation.ttl(),
            sync_push: config.daemon.sync_push,
        })
    }

    /// Allocate an address for the client, or renew the one it has
    pub async fn register(
        &self,
        credential: &Credential,
        preferred: Option<IpAddr>,
    ) -> Result<Allocation> {
        self.authenticate(credential)?;
        let allocation = self.allocate(credential.public_key, preferred)?;
        self.push(TunnelOp::Ensure(allocation.client_id)).await;
        Ok(allocation)
    }

    fn allocate(&self, client: ClientId, preferred: Option<IpAddr>) -> Result<Allocation> {
        let mut pool = self.pool.lock();

        if let Some(mut existing) = self.store.get(&client) {
            existing.renew();
            self.store.put(&existing)?;
            debug!("Renewed {} -> {}", client, existing.address);
            return Ok(existing);
        }

        let mut preferred = preferred;
        for _ in 0..2 {
            let address = pool.reserve(preferred.take())?;
            let prefix = match pool.prefix_for(&address) {
                Some(prefix) => prefix,
                None => {
                    pool.release(address);
                    return Err(Error::Internal(format!("reserved {} outside the pool", address)));
                }
            };

            let allocation = Allocation::new(client, address, prefix);
            match self.store.put(&allocation) {
                Ok(()) => {
                    info!("Allocated {}/{} to {}", address, prefix, client);
                    return Ok(allocation);
                }
                // The store owns the address; it stays marked in the pool
                Err(Error::AddressConflict { address, owner }) => {
                    warn!("Address {} already stored for {}, retrying", address, owner);
                }
                Err(e) => {
                    pool.release(address);
                    return Err(e);
                }
            }
        }

        Err(Error::AllocationFailed(format!(
            "repeated address conflicts for {}",
            client
        )))
    }

    /// The client's current allocation
    pub fn lookup(&self, credential: &Credential) -> Result<Allocation> {
        self.authenticate(credential)?;
        self.store
            .get(&credential.public_key)
            .ok_or_else(|| Error::not_found("allocation", credential.public_key.to_string()))
    }

    /// Give up the client's own allocation
    pub async fn release(&self, credential: &Credential) -> Result<Allocation> {
        self.authenticate(credential)?;
        self.remove_client(credential.public_key).await
    }

    /// Administrative removal of a client's allocation
    pub async fn revoke(&self, client: ClientId) -> Result<Allocation> {
        self.remove_client(client).await
    }

    async fn remove_client(&self, client: ClientId) -> Result<Allocation> {
        let removed = {
            let mut pool = self.pool.lock();
            let removed = self
                .store
                .remove(&client)?
                .ok_or_else(|| Error::not_found("allocation", client.to_string()))?;
            pool.release(removed.address);
            removed
        };

        info!("Released {} from {}", removed.address, client);
        self.push(TunnelOp::Remove(client)).await;
        Ok(removed)
    }

    /// All allocations, ordered by address
    pub fn list(&self) -> Vec<Allocation> {
        self.store.all().collect()
    }

    /// Check an operator password against the stored hash
    pub fn verify_admin(&self, password: &str) -> Result<()> {
        match self.store.admin_hash()? {
            Some(hash) if secret_matches(password, &hash) => Ok(()),
            _ => Err(Error::Unauthorized),
        }
    }

    /// Remove allocations not renewed within the TTL
    pub async fn expire_stale(&self, now: i64) -> Result<Vec<Allocation>> {
        let Some(ttl) = self.ttl else {
            return Ok(Vec::new());
        };

        let expired = {
            let mut pool = self.pool.lock();
            let mut expired = Vec::new();
            for allocation in self.store.all().filter(|a| a.is_expired(now, ttl)) {
                if let Some(removed) = self.store.remove(&allocation.client_id)? {
                    pool.release(removed.address);
                    expired.push(removed);
                }
            }
            expired
        };

        for allocation in &expired {
            info!(
                "Expired {} held by {}",
                allocation.address, allocation.client_id
            );
            self.push(TunnelOp::Remove(allocation.client_id)).await;
        }
        Ok(expired)
    }

    /// Periodically expire stale allocations until `shutdown` fires
    pub async fn run_expiry(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        if self.ttl.is_none() {
            return;
        }

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.expire_stale(chrono::Utc::now().timestamp()).await {
                        warn!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// Addresses currently marked in the pool
    pub fn allocated_count(&self) -> usize {
        self.pool.lock().allocated_count()
    }

    fn authenticate(&self, credential: &Credential) -> Result<()> {
        if !secret_matches(&credential.password, &self.password_digest) {
            debug!("Rejected credential for {}", credential.public_key);
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    async fn push(&self, op: TunnelOp) {
        if self.sync_push {
            // Failures are queued by the reconciler
            let _ = self.reconciler.reconcile_one(op).await;
        } else {
            let reconciler = self.reconciler.clone();
            tokio::spawn(async move {
                let _ = reconciler.reconcile_one(op).await;
            });
        }
    }
}
