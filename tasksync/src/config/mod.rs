//! Configuration for the `tasksync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tasksync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::BackoffPolicy;
use crate::coordinator::SyncOptions;
use crate::transport::websocket::DEFAULT_CONNECT_TIMEOUT;

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

    /// A value parsed but makes no sense.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted key, e.g. `reconnect.max_attempts`.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    push: PushFileConfig,
    reconnect: ReconnectFileConfig,
    snapshot: SnapshotFileConfig,
    events: EventsFileConfig,
}

/// `[push]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PushFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[snapshot]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SnapshotFileConfig {
    seed_file: Option<PathBuf>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
    retry_attempts: Option<u32>,
    resync_on_reconnect: Option<bool>,
}

/// `[events]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EventsFileConfig {
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Push --
    /// WebSocket URL of the push channel.
    pub push_url: String,
    /// Timeout for opening the push channel.
    pub connect_timeout: Duration,

    // -- Reconnect --
    /// Push-channel reconnect schedule.
    pub reconnect: BackoffPolicy,

    // -- Snapshot --
    /// JSON file to seed the in-memory backend from.
    pub seed_file: Option<PathBuf>,
    /// Snapshot fetch retry schedule.
    pub snapshot_retry: BackoffPolicy,
    /// Refetch the snapshot after the push channel recovers.
    pub resync_on_reconnect: bool,

    // -- Events --
    /// Capacity of the consumer event channel.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let options = SyncOptions::default();
        Self {
            push_url: "ws://127.0.0.1:9100/ws".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: options.reconnect,
            seed_file: None,
            snapshot_retry: options.snapshot_retry,
            resync_on_reconnect: options.resync_on_reconnect,
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/tasksync/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a resolved value is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let reconnect = BackoffPolicy::new(
            file.reconnect
                .base_delay_ms
                .map_or(defaults.reconnect.base, Duration::from_millis),
            file.reconnect
                .max_delay_ms
                .map_or(defaults.reconnect.cap, Duration::from_millis),
            file.reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
        );
        let snapshot_retry = BackoffPolicy::new(
            file.snapshot
                .retry_base_ms
                .map_or(defaults.snapshot_retry.base, Duration::from_millis),
            file.snapshot
                .retry_max_ms
                .map_or(defaults.snapshot_retry.cap, Duration::from_millis),
            file.snapshot
                .retry_attempts
                .unwrap_or(defaults.snapshot_retry.max_attempts),
        );

        let config = Self {
            push_url: cli
                .url
                .clone()
                .or_else(|| file.push.url.clone())
                .unwrap_or(defaults.push_url),
            connect_timeout: file
                .push
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect,
            seed_file: cli
                .snapshot
                .clone()
                .or_else(|| file.snapshot.seed_file.clone()),
            snapshot_retry,
            resync_on_reconnect: file
                .snapshot
                .resync_on_reconnect
                .unwrap_or(defaults.resync_on_reconnect),
            channel_capacity: file
                .events
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.push_url).map_err(|e| ConfigError::Invalid {
            field: "push.url",
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid {
                field: "push.url",
                reason: format!("expected ws:// or wss://, got {}://", url.scheme()),
            });
        }
        if self.reconnect.base > self.reconnect.cap {
            return Err(ConfigError::Invalid {
                field: "reconnect.base_delay_ms",
                reason: "must not exceed reconnect.max_delay_ms".to_string(),
            });
        }
        if self.snapshot_retry.base > self.snapshot_retry.cap {
            return Err(ConfigError::Invalid {
                field: "snapshot.retry_base_ms",
                reason: "must not exceed snapshot.retry_max_ms".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "events.channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Coordinator options derived from this configuration.
    #[must_use]
    pub const fn to_sync_options(&self) -> SyncOptions {
        SyncOptions {
            reconnect: self.reconnect,
            snapshot_retry: self.snapshot_retry,
            resync_on_reconnect: self.resync_on_reconnect,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Keeps a task list in sync with a push channel")]
pub struct CliArgs {
    /// WebSocket URL of the push channel.
    #[arg(long, env = "TASKSYNC_URL")]
    pub url: Option<String>,

    /// Path to config file (default: `~/.config/tasksync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON array of tasks to seed the local backend with (demo data if unset).
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (logs go to stderr if unset).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
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
    let path = config_dir.join("tasksync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
