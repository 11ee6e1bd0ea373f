//! Configuration management for the connection manager
//!
//! Handles configuration loading (JSON or TOML) and the full firewall
//! tunable set. The RPC layer reads and writes the same structures at
//! runtime through [`crate::firewall::Firewall::settings`].

use crate::firewall::lists::SlotList;
use crate::network::protocol::ChainNetwork;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Sockets, caps and timeouts
    #[serde(default)]
    pub network: NetworkConfig,

    /// Detection and mitigation tunables
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Ban/address table persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl NodeConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, picking the format from the file extension
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            _ => Self::from_json_file(path),
        }
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the socket plumbing values.
    ///
    /// Firewall tunables are not range-checked; the detectors act on them
    /// as given.
    pub fn validate(&self) -> anyhow::Result<()> {
        let net = &self.network;
        if net.max_inbound > net.max_connections {
            return Err(anyhow::anyhow!(
                "max_inbound ({}) exceeds max_connections ({})",
                net.max_inbound,
                net.max_connections
            ));
        }
        if net.poll_timeout_ms == 0 {
            return Err(anyhow::anyhow!("poll_timeout_ms must be non-zero"));
        }
        if net.read_chunk_size == 0 {
            return Err(anyhow::anyhow!("read_chunk_size must be non-zero"));
        }
        Ok(())
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Chain whose magic prefixes frames and data files
    #[serde(default)]
    pub network: ChainNetwork,

    /// Listening address (None = outbound only)
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Peers dialled at startup
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_inbound")]
    pub max_inbound: usize,

    /// Never-sent-or-received window after connect (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Send/receive progress window (seconds)
    #[serde(default = "default_data_timeout")]
    pub data_timeout_secs: u64,

    /// Buffered receive bytes above which a peer is not read this tick
    #[serde(default = "default_receive_flood_size")]
    pub receive_flood_size: usize,

    /// Readiness wait bound for the reactor (milliseconds)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Size of the reactor's read buffer
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Longest the dispatcher sleeps with no work (milliseconds)
    #[serde(default = "default_dispatcher_wait_ms")]
    pub dispatcher_wait_ms: u64,
}

fn default_max_connections() -> usize {
    125
}

fn default_max_inbound() -> usize {
    117
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_data_timeout() -> u64 {
    20 * 60
}

fn default_receive_flood_size() -> usize {
    5_000_000
}

fn default_poll_timeout_ms() -> u64 {
    50
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_chunk_size() -> usize {
    0x10000
}

fn default_dispatcher_wait_ms() -> u64 {
    100
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: ChainNetwork::default(),
            listen_addr: None,
            connect: Vec::new(),
            max_connections: default_max_connections(),
            max_inbound: default_max_inbound(),
            idle_timeout_secs: default_idle_timeout(),
            data_timeout_secs: default_data_timeout(),
            receive_flood_size: default_receive_flood_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_chunk_size: default_read_chunk_size(),
            dispatcher_wait_ms: default_dispatcher_wait_ms(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Ban/address flush interval (seconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Expired-ban sweep interval (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Address entries older than this are dropped on load (seconds)
    #[serde(default = "default_address_expiry")]
    pub address_expiry_secs: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_flush_interval() -> u64 {
    15 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_address_expiry() -> u64 {
    30 * 24 * 60 * 60
}

impl StorageConfig {
    pub fn ban_file(&self) -> PathBuf {
        Path::new(&self.data_dir).join("banlist.dat")
    }

    pub fn address_file(&self) -> PathBuf {
        Path::new(&self.data_dir).join("peers.dat")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flush_interval_secs: default_flush_interval(),
            sweep_interval_secs: default_sweep_interval(),
            address_expiry_secs: default_address_expiry(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "bllvm_connman=debug,firewall=trace")
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Firewall configuration
///
/// Every field here is a live tunable: the RPC layer can read or replace any
/// of them at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Master switch; when off no peer is examined
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Keep the first filter's verdict instead of the last one that fired
    #[serde(default = "default_false")]
    pub first_detection_wins: bool,

    /// Clear the session blacklist when few peers remain
    #[serde(default = "default_true")]
    pub clear_blacklist: bool,

    /// Also clear the ban table under the same condition
    #[serde(default = "default_false")]
    pub clear_bans: bool,

    /// Peer count at or below which the clear_* switches apply
    #[serde(default = "default_clear_min_peers")]
    pub clear_min_peers: usize,

    /// Subtracted from the average height after each fold
    #[serde(default = "default_average_tolerance")]
    pub average_tolerance: i32,

    /// Half-width of the height band
    #[serde(default = "default_average_range")]
    pub average_range: i32,

    /// Subtracted from the traffic average after each fold
    #[serde(default = "default_traffic_tolerance")]
    pub traffic_tolerance: f64,

    /// Half-width of the traffic band
    #[serde(default = "default_traffic_zone")]
    pub traffic_zone: f64,

    /// Addresses never examined
    #[serde(default)]
    pub whitelist: SlotList,

    /// Addresses rejected on sight (seeds the session blacklist)
    #[serde(default)]
    pub blacklist: SlotList,

    #[serde(default)]
    pub live_debug: LiveDebugConfig,

    #[serde(default)]
    pub bandwidth_abuse: BandwidthAbuseConfig,

    #[serde(default)]
    pub invalid_wallet: InvalidWalletConfig,

    #[serde(default)]
    pub forked_wallet: ForkedWalletConfig,

    #[serde(default)]
    pub flooding_wallet: FloodingWalletConfig,
}

fn default_clear_min_peers() -> usize {
    10
}

fn default_average_tolerance() -> i32 {
    2
}

fn default_average_range() -> i32 {
    100
}

fn default_traffic_tolerance() -> f64 {
    0.0001
}

fn default_traffic_zone() -> f64 {
    4.0
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            first_detection_wins: false,
            clear_blacklist: true,
            clear_bans: false,
            clear_min_peers: default_clear_min_peers(),
            average_tolerance: default_average_tolerance(),
            average_range: default_average_range(),
            traffic_tolerance: default_traffic_tolerance(),
            traffic_zone: default_traffic_zone(),
            whitelist: SlotList::new(),
            blacklist: SlotList::new(),
            live_debug: LiveDebugConfig::default(),
            bandwidth_abuse: BandwidthAbuseConfig::default(),
            invalid_wallet: InvalidWalletConfig::default(),
            forked_wallet: ForkedWalletConfig::default(),
            flooding_wallet: FloodingWalletConfig::default(),
        }
    }
}

/// Topics whose firewall events are promoted from `debug` to `info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveDebugConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_false")]
    pub exam: bool,
    #[serde(default = "default_true")]
    pub bans: bool,
    #[serde(default = "default_true")]
    pub blacklist: bool,
    #[serde(default = "default_true")]
    pub disconnect: bool,
    #[serde(default = "default_true")]
    pub bandwidth_abuse: bool,
    #[serde(default = "default_false")]
    pub no_false_positive: bool,
    #[serde(default = "default_true")]
    pub invalid_wallet: bool,
    #[serde(default = "default_true")]
    pub forked_wallet: bool,
    #[serde(default = "default_true")]
    pub flooding_wallet: bool,
}

impl Default for LiveDebugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exam: false,
            bans: true,
            blacklist: true,
            disconnect: true,
            bandwidth_abuse: true,
            no_false_positive: false,
            invalid_wallet: true,
            forked_wallet: true,
            flooding_wallet: true,
        }
    }
}

/// Bandwidth abuse detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthAbuseConfig {
    #[serde(default = "default_true")]
    pub detect: bool,
    #[serde(default = "default_true")]
    pub blacklist: bool,
    #[serde(default = "default_true")]
    pub ban: bool,
    /// Treat catch-up sync shapes as legitimate
    #[serde(default = "default_true")]
    pub no_false_positive: bool,
    /// Ban duration in seconds (0 = default ban time)
    #[serde(default)]
    pub ban_time: u64,
    /// Connection age before the filter applies (seconds)
    #[serde(default = "default_bandwidth_max_check")]
    pub max_check: u64,
    /// Lower edge of the double-spend traffic ratio band
    #[serde(default = "default_min_attack")]
    pub min_attack: f64,
    /// Upper edge of the double-spend traffic ratio band
    #[serde(default = "default_max_attack")]
    pub max_attack: f64,
    /// Ban duration for suspected double-spend (0 = default ban time)
    #[serde(default)]
    pub double_spend_ban_time: u64,
}

fn default_bandwidth_max_check() -> u64 {
    10
}

fn default_min_attack() -> f64 {
    17.1
}

fn default_max_attack() -> f64 {
    17.2
}

impl Default for BandwidthAbuseConfig {
    fn default() -> Self {
        Self {
            detect: true,
            blacklist: true,
            ban: true,
            no_false_positive: true,
            ban_time: 0,
            max_check: default_bandwidth_max_check(),
            min_attack: default_min_attack(),
            max_attack: default_max_attack(),
            double_spend_ban_time: 0,
        }
    }
}

/// Invalid wallet detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidWalletConfig {
    #[serde(default = "default_true")]
    pub detect: bool,
    #[serde(default = "default_true")]
    pub blacklist: bool,
    #[serde(default = "default_true")]
    pub ban: bool,
    #[serde(default = "default_long_ban_time")]
    pub ban_time: u64,
    #[serde(default = "default_invalid_max_check")]
    pub max_check: u64,
    /// Versions above 209 but below this are outdated
    #[serde(default = "default_min_protocol_version")]
    pub min_protocol_version: i32,
}

fn default_long_ban_time() -> u64 {
    2_600_000
}

fn default_invalid_max_check() -> u64 {
    60
}

fn default_min_protocol_version() -> i32 {
    209
}

impl Default for InvalidWalletConfig {
    fn default() -> Self {
        Self {
            detect: true,
            blacklist: true,
            ban: true,
            ban_time: default_long_ban_time(),
            max_check: default_invalid_max_check(),
            min_protocol_version: default_min_protocol_version(),
        }
    }
}

/// Forked wallet detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkedWalletConfig {
    #[serde(default = "default_true")]
    pub detect: bool,
    #[serde(default = "default_true")]
    pub blacklist: bool,
    #[serde(default = "default_true")]
    pub ban: bool,
    #[serde(default = "default_long_ban_time")]
    pub ban_time: u64,
    /// Heights peers get stuck at on known forks
    #[serde(default = "default_fork_heights")]
    pub node_heights: SlotList,
}

fn default_fork_heights() -> SlotList {
    SlotList::from_entries(["10000", "39486", "48405"])
}

impl Default for ForkedWalletConfig {
    fn default() -> Self {
        Self {
            detect: true,
            blacklist: true,
            ban: true,
            ban_time: default_long_ban_time(),
            node_heights: default_fork_heights(),
        }
    }
}

/// Flooding wallet detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodingWalletConfig {
    #[serde(default = "default_true")]
    pub detect: bool,
    #[serde(default = "default_true")]
    pub blacklist: bool,
    #[serde(default = "default_true")]
    pub ban: bool,
    #[serde(default = "default_long_ban_time")]
    pub ban_time: u64,
    #[serde(default = "default_flood_bytes")]
    pub min_bytes: u64,
    #[serde(default = "default_flood_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_flood_traffic")]
    pub min_traffic_average: f64,
    #[serde(default = "default_flood_traffic")]
    pub max_traffic_average: f64,
    /// Seconds (connection age)
    #[serde(default = "default_flood_min_check")]
    pub min_check: u64,
    /// Seconds (connection age)
    #[serde(default = "default_flood_max_check")]
    pub max_check: u64,
    /// Warning signatures that flag an attack
    #[serde(default = "default_attack_patterns")]
    pub attack_patterns: SlotList,
    /// Warning signatures that clear any attack
    #[serde(default)]
    pub ignore_patterns: SlotList,
}

fn default_flood_bytes() -> u64 {
    1_000_000
}

fn default_flood_traffic() -> f64 {
    2000.0
}

fn default_flood_min_check() -> u64 {
    30
}

fn default_flood_max_check() -> u64 {
    90
}

fn default_attack_patterns() -> SlotList {
    // Sent and received both past the byte thresholds inside the check
    // window while the peer claims a height inside the baseline band.
    SlotList::from_entries(["35681012141617202223", "35681012151617202223"])
}

impl Default for FloodingWalletConfig {
    fn default() -> Self {
        Self {
            detect: true,
            blacklist: true,
            ban: true,
            ban_time: default_long_ban_time(),
            min_bytes: default_flood_bytes(),
            max_bytes: default_flood_bytes(),
            min_traffic_average: default_flood_traffic(),
            max_traffic_average: default_flood_traffic(),
            min_check: default_flood_min_check(),
            max_check: default_flood_max_check(),
            attack_patterns: default_attack_patterns(),
            ignore_patterns: SlotList::new(),
        }
    }
}
