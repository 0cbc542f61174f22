//! Configuration system for the `SynqX` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/synqx/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientOptions;
use crate::connection::MonitorConfig;
use crate::delivery::DeliveryConfig;
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::queue::QueueConfig;
use crate::storage::cache::DEFAULT_CACHE_CAP;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A required setting has no value in any layer.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    client: ClientFileConfig,
    queue: QueueFileConfig,
    delivery: DeliveryFileConfig,
    connection: ConnectionFileConfig,
    history: HistoryFileConfig,
}

/// `[client]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ClientFileConfig {
    mailbox_url: Option<String>,
    user_id: Option<String>,
    peer_id: Option<String>,
    data_dir: Option<PathBuf>,
    chat_backup: Option<bool>,
    event_buffer: Option<usize>,
    timestamp_format: Option<String>,
}

/// `[queue]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct QueueFileConfig {
    max_retries: Option<u32>,
    retry_delays_ms: Option<Vec<u64>>,
    send_timeout_secs: Option<u64>,
    slow_send_timeout_secs: Option<u64>,
    restore_window_secs: Option<u64>,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    settle_delay_ms: Option<u64>,
    watch_timeout_secs: Option<u64>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    probe_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    good_latency_ms: Option<u64>,
}

/// `[history]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HistoryFileConfig {
    default_limit: Option<usize>,
    local_cache_cap: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Identity and endpoints --
    /// Mailbox service WebSocket URL. `None` runs against an in-process
    /// mailbox.
    pub mailbox_url: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
    /// Peer to open a conversation with.
    pub peer_id: Option<String>,
    /// Directory for the local cache and the persisted queue.
    pub data_dir: Option<PathBuf>,
    /// Whether the local user keeps a permanent backup.
    pub chat_backup: bool,

    // -- Pipeline --
    /// Retry budget, backoff, and send timeouts.
    pub queue: QueueConfig,
    /// Delivery handshake timing.
    pub delivery: DeliveryConfig,
    /// Connection probe cadence and thresholds.
    pub connection: MonitorConfig,
    /// Messages returned by a history query.
    pub history_limit: usize,
    /// Messages kept per conversation in the local cache.
    pub local_cache_cap: usize,
    /// Capacity of the UI event channel.
    pub event_buffer: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mailbox_url: None,
            user_id: None,
            peer_id: None,
            data_dir: dirs::data_dir().map(|d| d.join("synqx")),
            chat_backup: false,
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            connection: MonitorConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            local_cache_cap: DEFAULT_CACHE_CAP,
            event_buffer: 256,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let queue = &file.queue;
        let delivery = &file.delivery;
        let connection = &file.connection;

        Self {
            mailbox_url: cli
                .mailbox_url
                .clone()
                .or_else(|| file.client.mailbox_url.clone()),
            user_id: cli.user.clone().or_else(|| file.client.user_id.clone()),
            peer_id: cli.peer.clone().or_else(|| file.client.peer_id.clone()),
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.client.data_dir.clone())
                .or(defaults.data_dir),
            chat_backup: cli
                .chat_backup
                .or(file.client.chat_backup)
                .unwrap_or(defaults.chat_backup),
            queue: QueueConfig {
                max_retries: queue.max_retries.unwrap_or(defaults.queue.max_retries),
                retry_delays: queue
                    .retry_delays_ms
                    .as_ref()
                    .filter(|delays| !delays.is_empty())
                    .map_or(defaults.queue.retry_delays, |delays| {
                        delays.iter().copied().map(Duration::from_millis).collect()
                    }),
                send_timeout: queue
                    .send_timeout_secs
                    .map_or(defaults.queue.send_timeout, Duration::from_secs),
                slow_send_timeout: queue
                    .slow_send_timeout_secs
                    .map_or(defaults.queue.slow_send_timeout, Duration::from_secs),
                restore_window: queue
                    .restore_window_secs
                    .map_or(defaults.queue.restore_window, Duration::from_secs),
            },
            delivery: DeliveryConfig {
                settle_delay: delivery
                    .settle_delay_ms
                    .map_or(defaults.delivery.settle_delay, Duration::from_millis),
                watch_timeout: delivery
                    .watch_timeout_secs
                    .map_or(defaults.delivery.watch_timeout, Duration::from_secs),
            },
            connection: MonitorConfig {
                probe_interval: connection
                    .probe_interval_secs
                    .map_or(defaults.connection.probe_interval, Duration::from_secs),
                probe_timeout: connection
                    .probe_timeout_secs
                    .map_or(defaults.connection.probe_timeout, Duration::from_secs),
                good_latency: connection
                    .good_latency_ms
                    .map_or(defaults.connection.good_latency, Duration::from_millis),
            },
            history_limit: file
                .history
                .default_limit
                .unwrap_or(defaults.history_limit),
            local_cache_cap: file
                .history
                .local_cache_cap
                .unwrap_or(defaults.local_cache_cap),
            event_buffer: file
                .client
                .event_buffer
                .unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.client.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The local user id.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no layer sets it.
    pub fn require_user(&self) -> Result<&str, ConfigError> {
        self.user_id
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing("user_id"))
    }

    /// Pipeline settings for [`crate::client::SynqxClient::start`].
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            queue: self.queue.clone(),
            delivery: self.delivery,
            connection: self.connection,
            history_limit: self.history_limit,
            local_cache_cap: self.local_cache_cap,
            event_buffer: self.event_buffer,
            chat_backup: self.chat_backup,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-tolerant chat client")]
pub struct CliArgs {
    /// WebSocket URL of the mailbox service.
    #[arg(long, env = "SYNQX_MAILBOX_URL")]
    pub mailbox_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "SYNQX_USER")]
    pub user: Option<String>,

    /// User id of the peer to chat with.
    #[arg(long, env = "SYNQX_PEER")]
    pub peer: Option<String>,

    /// Directory for local history and the persisted send queue.
    #[arg(long, env = "SYNQX_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Keep a permanent backup of conversations (`true` or `false`).
    #[arg(long)]
    pub chat_backup: Option<bool>,

    /// Path to config file (default: `~/.config/synqx/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SYNQX_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/synqx.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("synqx").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
