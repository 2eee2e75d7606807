//! Relay settings: a `[server]` table in TOML, overridable from the command
//! line.
//!
//! CLI flags (and their env vars) win over the file, the file wins over the
//! built-in defaults. The file defaults to
//! `<config dir>/tasksync-relay/config.toml`; a missing default file means
//! "use defaults", a missing `--config` file is an error.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9100"
//! max_frame_size = 65536
//! broadcast_capacity = 1024
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::relay::{
    DEFAULT_BROADCAST_CAPACITY, DEFAULT_MAX_FRAME_SIZE, FRAME_SIZE_CEILING, RelayLimits,
};

/// Port the relay listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 9100;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting parsed but cannot be used.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Setting name as written in the `[server]` table.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RelayConfigFile {
    server: ServerSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
    broadcast_capacity: Option<usize>,
}

/// Command line for `tasksync-relay`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Push relay for tasksync clients")]
pub struct RelayCliArgs {
    /// Socket address to listen on, e.g. `127.0.0.1:9100`.
    #[arg(short, long, env = "TASKSYNC_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Config file (default: `~/.config/tasksync-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted push frame in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Frames buffered per client before a slow client starts skipping.
    #[arg(long)]
    pub broadcast_capacity: Option<usize>,

    /// Log filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKSYNC_RELAY_LOG")]
    pub log_level: String,
}

/// Validated relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Frame size and fan-out buffer limits.
    pub limits: RelayLimits,
    /// Log filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            limits: RelayLimits::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Reads the config file and layers the CLI on top.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file is missing, if the
    /// file cannot be parsed, or if a resolved setting is invalid.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file.server)
    }

    fn resolve(cli: &RelayCliArgs, server: &ServerSection) -> Result<Self, ConfigError> {
        let bind_addr = match cli.bind.as_deref().or(server.bind_addr.as_deref()) {
            Some(text) => parse_bind_addr(text)?,
            None => Self::default().bind_addr,
        };

        let max_frame_size = cli
            .max_frame_size
            .or(server.max_frame_size)
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);
        if max_frame_size == 0 || max_frame_size > FRAME_SIZE_CEILING {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: format!(
                    "must be between 1 and {FRAME_SIZE_CEILING} bytes, got {max_frame_size}"
                ),
            });
        }

        let capacity = cli
            .broadcast_capacity
            .or(server.broadcast_capacity)
            .unwrap_or(DEFAULT_BROADCAST_CAPACITY);
        let broadcast_capacity = NonZeroUsize::new(capacity).ok_or_else(|| ConfigError::Invalid {
            field: "broadcast_capacity",
            reason: "must be at least 1".to_string(),
        })?;

        Ok(Self {
            bind_addr,
            limits: RelayLimits {
                max_frame_size,
                broadcast_capacity,
            },
            log_level: cli.log_level.clone(),
        })
    }
}

/// Listen addresses must be literal `ip:port`; host names are not resolved.
fn parse_bind_addr(text: &str) -> Result<SocketAddr, ConfigError> {
    text.trim()
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            field: "bind_addr",
            reason: format!("{text:?} is not an ip:port address ({e})"),
        })
}

fn load_config_file(explicit: Option<&Path>) -> Result<RelayConfigFile, ConfigError> {
    let (path, required) = match explicit {
        Some(p) => (p.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("tasksync-relay").join("config.toml"), false),
            None => return Ok(RelayConfigFile::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(RelayConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(toml_str: &str, cli: &RelayCliArgs) -> Result<RelayConfig, ConfigError> {
        let file: RelayConfigFile = toml::from_str(toml_str).unwrap();
        RelayConfig::resolve(cli, &file.server)
    }

    fn cli() -> RelayCliArgs {
        RelayCliArgs {
            log_level: "info".to_string(),
            ..RelayCliArgs::default()
        }
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = resolve("", &cli()).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9100");
        assert_eq!(config.limits.max_frame_size, 64 * 1024);
        assert_eq!(config.limits.broadcast_capacity.get(), 1024);
    }

    #[test]
    fn server_section_sets_limits() {
        let toml_str = r#"
[server]
bind_addr = "127.0.0.1:8080"
max_frame_size = 32768
broadcast_capacity = 64
"#;
        let config = resolve(toml_str, &cli()).unwrap();

        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.limits.max_frame_size, 32768);
        assert_eq!(config.limits.broadcast_capacity.get(), 64);
    }

    #[test]
    fn cli_wins_over_file() {
        let toml_str = "[server]\nbind_addr = \"127.0.0.1:8080\"\nbroadcast_capacity = 64\n";
        let args = RelayCliArgs {
            bind: Some("[::1]:3000".to_string()),
            broadcast_capacity: Some(8),
            ..cli()
        };
        let config = resolve(toml_str, &args).unwrap();

        assert_eq!(config.bind_addr.to_string(), "[::1]:3000");
        assert_eq!(config.limits.broadcast_capacity.get(), 8);
    }

    #[test]
    fn host_name_bind_addr_is_rejected() {
        let err = resolve("[server]\nbind_addr = \"localhost:9100\"\n", &cli()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bind_addr", .. }));

        let args = RelayCliArgs {
            bind: Some("9100".to_string()),
            ..cli()
        };
        assert!(matches!(
            resolve("", &args),
            Err(ConfigError::Invalid { field: "bind_addr", .. })
        ));
    }

    #[test]
    fn zero_broadcast_capacity_is_rejected() {
        let err = resolve("[server]\nbroadcast_capacity = 0\n", &cli()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "broadcast_capacity", .. }));
    }

    #[test]
    fn frame_size_must_be_within_bounds() {
        for size in [0, FRAME_SIZE_CEILING + 1] {
            let err = resolve(&format!("[server]\nmax_frame_size = {size}\n"), &cli()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { field: "max_frame_size", .. }));
        }
        let ok = resolve(&format!("[server]\nmax_frame_size = {FRAME_SIZE_CEILING}\n"), &cli());
        assert_eq!(ok.unwrap().limits.max_frame_size, FRAME_SIZE_CEILING);
    }

    #[test]
    fn unknown_keys_are_refused() {
        let parsed = toml::from_str::<RelayConfigFile>("[server]\nmax_payload_size = 10\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
