//! Reconciliation loop
//!
//! Keeps the mesh daemon's tunnel table equal to the allocation store: stored
//! bindings missing from the daemon are allowed, live tunnels the store does
//! not back are removed.

use crate::config::RetryPolicy;
use crate::control::TunnelControl;
use elvisp_common::{AllocationStore, ClientId, Error, LiveTunnel, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Incremental change for a single client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOp {
    /// The client was allocated or renewed
    Ensure(ClientId),
    /// The client's allocation was removed
    Remove(ClientId),
}

impl TunnelOp {
    pub fn client(&self) -> ClientId {
        match self {
            TunnelOp::Ensure(client) | TunnelOp::Remove(client) => *client,
        }
    }
}

/// Outcome of a full pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Bindings pushed to the daemon
    pub allowed: usize,
    /// Orphaned tunnels torn down
    pub removed: usize,
    /// Bindings the daemon already had
    pub unchanged: usize,
    /// Clients left in the pending queue
    pub failed: Vec<ClientId>,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sender side of the reload channel
#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<()>,
}

impl ReloadHandle {
    /// Ask for a full pass.
    ///
    /// Returns `false` when a pass was already queued and this request was
    /// folded into it.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Closed(())) => {
                warn!("Reload requested but the reconciler has stopped");
                false
            }
        }
    }
}

/// Reload channel holding at most one queued pass
pub fn reload_channel() -> (ReloadHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadHandle { tx }, rx)
}

/// Per-client async locks; an entry lives only while someone holds or
/// waits for it
#[derive(Default)]
struct ClientLocks {
    locks: Mutex<HashMap<ClientId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClientLocks {
    async fn lock(&self, client: ClientId) -> ClientGuard<'_> {
        let cell = self.locks.lock().entry(client).or_default().clone();
        let guard = cell.lock_owned().await;
        ClientGuard {
            locks: self,
            client,
            guard: Some(guard),
        }
    }
}

struct ClientGuard<'a> {
    locks: &'a ClientLocks,
    client: ClientId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if locks
            .get(&self.client)
            .is_some_and(|cell| Arc::strong_count(cell) == 1)
        {
            locks.remove(&self.client);
        }
    }
}

/// What converging one client did
#[derive(Debug, Default)]
struct Converged {
    allowed: usize,
    removed: usize,
    unchanged: usize,
}

/// Reconciler between the allocation store and the mesh daemon
pub struct Reconciler {
    store: Arc<AllocationStore>,
    control: Arc<dyn TunnelControl>,
    policy: RetryPolicy,
    pending: Mutex<HashSet<ClientId>>,
    /// Serializes full passes with each other
    pass_lock: tokio::sync::Mutex<()>,
    /// Serializes daemon changes for a single client
    clients: ClientLocks,
    /// Clients pushed individually since the running pass listed the daemon
    touched: Mutex<HashSet<ClientId>>,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        store: Arc<AllocationStore>,
        control: Arc<dyn TunnelControl>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            control,
            policy,
            pending: Mutex::new(HashSet::new()),
            pass_lock: tokio::sync::Mutex::new(()),
            clients: ClientLocks::default(),
            touched: Mutex::new(HashSet::new()),
        }
    }

    /// Clients waiting for a retry
    pub fn pending(&self) -> Vec<ClientId> {
        let mut pending: Vec<ClientId> = self.pending.lock().iter().copied().collect();
        pending.sort_by_key(|c| c.to_string());
        pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Run the reconciliation loop until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        mut reloads: mpsc::Receiver<()>,
        retry_interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Reconciler started ({} backend)", self.control.name());
        self.pass("startup").await;

        let mut tick = tokio::time::interval(retry_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = reloads.recv() => match event {
                    Some(()) => self.pass("reload").await,
                    None => break,
                },
                _ = tick.tick() => {
                    if self.has_pending() {
                        self.pass("retry").await;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    async fn pass(&self, reason: &str) {
        match self.reconcile_all().await {
            Ok(report) if report.is_converged() => info!(
                "Reconciled ({}): {} allowed, {} removed, {} unchanged",
                reason, report.allowed, report.removed, report.unchanged
            ),
            Ok(report) => warn!(
                "Partially reconciled ({}): {} allowed, {} removed, {} still pending",
                reason,
                report.allowed,
                report.removed,
                report.failed.len()
            ),
            Err(e) => error!("Reconciliation ({}) failed: {}", reason, e),
        }
    }

    /// Bring the daemon in line with every stored allocation.
    ///
    /// Each client is handled under its own lock against the store's state at
    /// that moment, so individual pushes are never queued behind the pass.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let _pass = self.pass_lock.lock().await;
        self.touched.lock().clear();

        let mut clients: HashSet<ClientId> = self.pending.lock().clone();
        let stored: Vec<ClientId> = self.store.all().map(|a| a.client_id).collect();
        clients.extend(stored.iter().copied());

        let live = match self.with_retry("list tunnels", || self.control.list()).await {
            Ok(live) => live,
            Err(e) => {
                self.pending.lock().extend(stored);
                return Err(e);
            }
        };

        let mut by_client: HashMap<ClientId, Vec<&LiveTunnel>> = HashMap::new();
        for tunnel in &live {
            by_client
                .entry(tunnel.binding.public_key)
                .or_default()
                .push(tunnel);
            clients.insert(tunnel.binding.public_key);
        }

        let mut report = ReconcileReport::default();
        let mut failed = Vec::new();
        for client in clients {
            let _client = self.clients.lock(client).await;
            // Pushed after our listing; that push already converged it
            if self.touched.lock().contains(&client) {
                continue;
            }

            let tunnels = by_client.get(&client).map(Vec::as_slice).unwrap_or_default();
            match self.converge(client, tunnels).await {
                Ok(done) => {
                    report.allowed += done.allowed;
                    report.removed += done.removed;
                    report.unchanged += done.unchanged;
                    self.pending.lock().remove(&client);
                }
                Err(e) => {
                    warn!("Failed to reconcile {}: {}", client, e);
                    self.pending.lock().insert(client);
                    failed.push(client);
                }
            }
        }

        failed.sort_by_key(|c| c.to_string());
        report.failed = failed;
        Ok(report)
    }

    /// Push a single client's state.
    ///
    /// `op` records why the push happened; the store decides the outcome, so
    /// an `Ensure` overtaken by a revocation removes the tunnel instead. On
    /// failure the client is queued for the next full pass.
    pub async fn reconcile_one(&self, op: TunnelOp) -> Result<()> {
        let client = op.client();
        let _client = self.clients.lock(client).await;

        let result = match self.with_retry("list tunnels", || self.control.list()).await {
            Ok(live) => {
                let tunnels: Vec<&LiveTunnel> = live
                    .iter()
                    .filter(|t| t.binding.public_key == client)
                    .collect();
                self.converge(client, &tunnels).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.pending.lock().remove(&client);
            }
            Err(e) => {
                warn!("Push {:?} failed, queued for retry: {}", op, e);
                self.pending.lock().insert(client);
            }
        }
        self.touched.lock().insert(client);
        result
    }

    /// Make the client's live tunnels match its stored binding. Caller holds
    /// the client's lock.
    async fn converge(&self, client: ClientId, tunnels: &[&LiveTunnel]) -> Result<Converged> {
        let desired = self.store.get(&client).map(|a| a.binding());
        let mut done = Converged::default();

        let mut satisfied = false;
        for tunnel in tunnels {
            if Some(tunnel.binding) == desired && !satisfied {
                satisfied = true;
                done.unchanged += 1;
                continue;
            }
            debug!("Removing tunnel #{} {}", tunnel.handle, tunnel.binding);
            self.remove_tunnel(tunnel).await?;
            done.removed += 1;
        }

        if let (Some(binding), false) = (desired, satisfied) {
            self.with_retry("allow tunnel", || self.control.allow(&binding))
                .await?;
            debug!("Pushed {}", binding);
            done.allowed += 1;
        }
        Ok(done)
    }

    async fn remove_tunnel(&self, tunnel: &LiveTunnel) -> Result<()> {
        self.with_retry("remove tunnel", || self.control.remove(tunnel))
            .await?;
        debug!("Removed tunnel #{} {}", tunnel.handle, tunnel.binding);
        Ok(())
    }

    /// Run a daemon call under the per-call timeout, retrying transient
    /// failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match tokio::time::timeout(self.policy.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => Error::Timeout {
                    millis: self.policy.timeout.as_millis() as u64,
                },
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.policy.attempts {
                return Err(Error::DaemonUnreachable(format!(
                    "{} failed after {} attempts: {}",
                    what, attempt, err
                )));
            }

            let delay = self.policy.backoff(attempt);
            debug!("{} failed ({}), retrying in {:?}", what, err, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
