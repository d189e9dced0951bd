//! elvisp daemon
//!
//! Hands out tunnel addresses to cjdns clients and keeps the local cjdroute
//! IpTunnel table in sync with the allocation store.

use anyhow::Context;
use clap::Parser;
use elvisp_common::{AllocationStore, Database};
use elvisp_daemon::cjdns::CjdnsAdmin;
use elvisp_daemon::{
    credentials, reload_channel, serve, DaemonConfig, Dispatcher, MemoryControl, Reconciler,
    Registry, ReloadHandle, TunnelControl,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "elvispd")]
#[command(about = "elvisp daemon - cjdns IPTunnel address registration")]
#[command(version)]
struct Cli {
    /// Configuration file path [default: ~/.elvisp/config.toml]
    #[arg(short, long, env = "ELVISP_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Client listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Shared client password
    #[arg(long, env = "ELVISP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// cjdns admin credential file
    #[arg(long)]
    cjdnsadmin: Option<PathBuf>,

    /// Keep tunnels in memory instead of configuring cjdns
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(fmt::layer))
        .with(filter)
        .init();

    info!("elvisp daemon v{}", elvisp_common::VERSION);

    // Load configuration, flags win over the file
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| elvisp_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if let Some(cjdnsadmin) = cli.cjdnsadmin {
        config.cjdnsadmin_path = cjdnsadmin;
    }
    config.daemon.dry_run |= cli.dry_run;
    config.validate().context("invalid configuration")?;

    let identity = credentials::load(&config.cjdnsadmin_path)
        .with_context(|| format!("loading {}", config.cjdnsadmin_path.display()))?;
    info!("Serving tunnels to {}", identity.public_key);

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = Database::open(&config.db_path())
        .with_context(|| format!("opening {}", config.db_path().display()))?;
    let store = Arc::new(AllocationStore::open(db)?);

    let control: Arc<dyn TunnelControl> = if config.daemon.dry_run {
        warn!("Dry run: tunnels are kept in memory, cjdns is not configured");
        Arc::new(MemoryControl::new())
    } else {
        Arc::new(CjdnsAdmin::new(
            &identity.admin,
            Duration::from_millis(config.daemon.push_timeout_ms),
        ))
    };

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        control,
        config.daemon.retry_policy(),
    ));
    let registry = Arc::new(Registry::open(&config, store, reconciler.clone())?);
    let (reload, reload_rx) = reload_channel();
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    // Start reconciler
    let reconciler_handle = tokio::spawn(reconciler.run(
        reload_rx,
        config.daemon.retry_interval(),
        shutdown.clone(),
    ));

    // Start expiry sweep
    let expiry_handle = tokio::spawn(registry.clone().run_expiry(
        Duration::from_secs(config.allocation.sweep_interval_secs.max(1)),
        shutdown.clone(),
    ));

    // Start listener
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        reload.clone(),
        identity.public_key,
        config.server.verify_peer_address,
    ));
    let server_token = shutdown.clone();
    let server_config = config.server.clone();
    let server_handle = tokio::spawn(async move {
        let result = serve(listener, dispatcher, server_config, server_token.clone()).await;
        if result.is_err() {
            server_token.cancel();
        }
        result
    });

    info!("Daemon started on {}", config.listen);

    if let Err(e) = wait_for_signals(&reload, &shutdown).await {
        error!("Signal handling failed: {}", e);
    }
    shutdown.cancel();

    match server_handle.await {
        Ok(Err(e)) => error!("Listener error: {}", e),
        Err(e) => error!("Listener task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = reconciler_handle.await {
        error!("Reconciler task failed: {}", e);
    }
    if let Err(e) = expiry_handle.await {
        error!("Expiry task failed: {}", e);
    }

    info!("Daemon shutdown complete");
    Ok(())
}

/// SIGHUP schedules a full reconciliation; SIGINT and SIGTERM stop the
/// daemon. Returns once shutdown is requested.
#[cfg(unix)]
async fn wait_for_signals(reload: &ReloadHandle, shutdown: &CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                let scheduled = reload.trigger();
                info!("SIGHUP received, reloading (coalesced: {})", !scheduled);
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_reload: &ReloadHandle, shutdown: &CancellationToken) -> anyhow::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}
