//! Daemon configuration

use elvisp_common::{protocol, AddressRange};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP listen address for client requests
    pub listen: String,

    /// Shared secret clients must present
    pub password: String,

    /// Operator password; its hash replaces the stored one on startup
    pub admin_password: Option<String>,

    /// Store directory path
    pub store_path: PathBuf,

    /// Path to the cjdns admin credential file
    pub cjdnsadmin_path: PathBuf,

    /// Address ranges handed out to clients, scanned in order
    pub ranges: Vec<RangeConfig>,

    /// Allocation lifetime
    pub allocation: AllocationConfig,

    /// Mesh daemon link
    pub daemon: DaemonLinkConfig,

    /// Listener settings
    pub server: ServerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: format!("[::]:{}", protocol::DEFAULT_PORT),
            password: String::new(),
            admin_password: None,
            store_path: elvisp_common::default_store_path(),
            cjdnsadmin_path: elvisp_common::default_cjdnsadmin_path(),
            ranges: Vec::new(),
            allocation: AllocationConfig::default(),
            daemon: DaemonLinkConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// One configured range, either as explicit bounds or as a CIDR network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeConfig {
    Bounds {
        start: IpAddr,
        end: IpAddr,
        #[serde(default)]
        prefix: u8,
    },
    Cidr {
        cidr: String,
        prefix: Option<u8>,
    },
}

impl RangeConfig {
    pub fn to_range(&self) -> elvisp_common::Result<AddressRange> {
        match self {
            RangeConfig::Bounds { start, end, prefix } => AddressRange::new(*start, *end, *prefix),
            RangeConfig::Cidr { cidr, prefix } => AddressRange::from_cidr(cidr, *prefix),
        }
    }
}

/// Allocation lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Expire allocations not renewed for this long; 0 or absent never expires
    pub ttl_secs: Option<u64>,

    /// How often the expiry sweep runs when a TTL is set
    pub sweep_interval_secs: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: None,
            sweep_interval_secs: 60,
        }
    }
}

impl AllocationConfig {
    pub fn ttl(&self) -> Option<u64> {
        self.ttl_secs.filter(|ttl| *ttl > 0)
    }
}

/// Settings for pushing state into the mesh daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonLinkConfig {
    /// Timeout for a single admin call
    pub push_timeout_ms: u64,

    /// Attempts per push before the client is queued for the next pass
    pub retry_attempts: u32,

    /// First backoff delay
    pub retry_base_ms: u64,

    /// Backoff ceiling
    pub retry_max_ms: u64,

    /// How often queued clients trigger a full pass
    pub retry_interval_secs: u64,

    /// Wait for the daemon push before answering a registration
    pub sync_push: bool,

    /// Keep tunnels in memory instead of talking to cjdns
    pub dry_run: bool,
}

impl Default for DaemonLinkConfig {
    fn default() -> Self {
        Self {
            push_timeout_ms: 2_000,
            retry_attempts: 4,
            retry_base_ms: 200,
            retry_max_ms: 5_000,
            retry_interval_secs: 30,
            sync_push: true,
            dry_run: false,
        }
    }
}

impl DaemonLinkConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            base: Duration::from_millis(self.retry_base_ms),
            max: Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
            timeout: Duration::from_millis(self.push_timeout_ms),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        std::cmp::min(self.base.saturating_mul(factor), self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        DaemonLinkConfig::default().retry_policy()
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Require the TCP peer address to match the cjdns address of the key
    pub verify_peer_address: bool,

    /// Close connections idle for this long
    pub idle_timeout_secs: u64,

    /// Maximum length of one request line
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            verify_peer_address: false,
            idle_timeout_secs: 60,
            max_line_bytes: protocol::DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Check everything the service needs before it starts
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.password.is_empty() {
            anyhow::bail!("password must be set");
        }
        if self.admin_password.as_deref() == Some("") {
            anyhow::bail!("admin_password must not be empty when set");
        }
        self.listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", self.listen, e))?;
        elvisp_common::AddressPool::new(self.address_ranges()?)?;
        Ok(())
    }

    /// Parsed address ranges in configuration order
    pub fn address_ranges(&self) -> elvisp_common::Result<Vec<AddressRange>> {
        self.ranges.iter().map(RangeConfig::to_range).collect()
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("allocations.db")
    }
}
