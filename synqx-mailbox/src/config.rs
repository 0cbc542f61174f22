//! Mailbox service settings.
//!
//! Each setting resolves from the CLI (or its environment variable) first,
//! then `~/.config/synqx-mailbox/config.toml`, then the compiled default:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9400"
//! max_frame_size = 1048576
//!
//! [store]
//! max_inbox_size = 1000
//! event_capacity = 1024
//!
//! [watch]
//! lag_policy = "skip"      # or "disconnect"
//! ```

use std::path::{Path, PathBuf};

use synqx_proto::codec::MAX_FRAME_SIZE;

use crate::server::LagPolicy;
use crate::store::StoreLimits;

/// Errors that can occur when loading mailbox configuration.
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

    /// A setting is out of range.
    #[error("invalid setting `{name}`: {reason}")]
    Invalid {
        /// Setting name as written in the config file.
        name: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerSection,
    store: StoreSection,
    watch: WatchSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreSection {
    max_inbox_size: Option<usize>,
    event_capacity: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct WatchSection {
    lag_policy: Option<LagPolicy>,
}

/// CLI arguments for the mailbox service.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "SynqX mailbox service")]
pub struct MailboxCliArgs {
    /// Address to bind the service to.
    #[arg(short, long, env = "SYNQX_MAILBOX_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/synqx-mailbox/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum accepted frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Entries kept per pending inbox before the oldest is evicted.
    #[arg(long)]
    pub max_inbox_size: Option<usize>,

    /// Changes buffered per watcher before it lags.
    #[arg(long)]
    pub event_capacity: Option<usize>,

    /// What to do with a watcher that falls behind.
    #[arg(long, value_enum)]
    pub lag_policy: Option<LagPolicy>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SYNQX_MAILBOX_LOG")]
    pub log_level: String,
}

/// Fully resolved mailbox service configuration.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9400`).
    pub bind_addr: String,
    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,
    /// Inbox cap and watcher buffer size.
    pub store: StoreLimits,
    /// Handling of watchers that fall behind.
    pub lag_policy: LagPolicy,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9400".to_string(),
            max_frame_size: MAX_FRAME_SIZE,
            store: StoreLimits::default(),
            lag_policy: LagPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl MailboxConfig {
    /// Resolves the configuration from `cli` and the config file.
    ///
    /// An explicit `--config` file must exist; the default path may be
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a size setting is zero.
    pub fn load(cli: &MailboxCliArgs) -> Result<Self, ConfigError> {
        let file = read_config_file(cli.config.as_deref())?;
        Self::resolve(cli, file)
    }

    fn resolve(cli: &MailboxCliArgs, file: ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            store: StoreLimits {
                max_inbox_size: cli
                    .max_inbox_size
                    .or(file.store.max_inbox_size)
                    .unwrap_or(defaults.store.max_inbox_size),
                event_capacity: cli
                    .event_capacity
                    .or(file.store.event_capacity)
                    .unwrap_or(defaults.store.event_capacity),
            },
            lag_policy: cli
                .lag_policy
                .or(file.watch.lag_policy)
                .unwrap_or(defaults.lag_policy),
            log_level: cli.log_level.clone(),
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_frame_size", self.max_frame_size),
            ("max_inbox_size", self.store.max_inbox_size),
            ("event_capacity", self.store.event_capacity),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }
}

fn read_config_file(explicit: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("synqx-mailbox").join("config.toml"), false),
            None => return Ok(ConfigFile::default()),
        },
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(ConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
