//! Configuration system for the `MarketChat` console client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/marketchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use marketchat_proto::ids::UserId;
use marketchat_proto::rest::Role;

use crate::chat::ChatConfig;
use crate::connection::{ConnectionConfig, ReconnectConfig};

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

    /// Could not determine the user's config directory.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoConfigDir,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    chat: ChatFileConfig,
    connection: ConnectionFileConfig,
    typing: TypingFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    socket_url: Option<String>,
    user_id: Option<String>,
    role: Option<String>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    rest_timeout_secs: Option<u64>,
    failure_grace_ms: Option<u64>,
    search_debounce_ms: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    handshake_timeout_secs: Option<u64>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_secs: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    degraded_after: Option<u32>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    idle_stop_ms: Option<u64>,
    remote_expiry_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Everything needed to reach a live server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Base URL of the REST API.
    pub api_url: String,
    /// URL of the persistent push connection.
    pub socket_url: String,
    /// Signed-in user.
    pub user_id: UserId,
    /// Bearer token.
    pub token: String,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Base URL of the REST API.
    pub api_url: Option<String>,
    /// URL of the persistent push connection.
    pub socket_url: Option<String>,
    /// Signed-in user id.
    pub user_id: Option<String>,
    /// Bearer token (CLI or env only, never read from the file).
    pub token: Option<String>,
    /// Which side of the marketplace the conversation list shows.
    pub role: Role,

    // -- Chat --
    /// Per-request REST timeout.
    pub rest_timeout: Duration,
    /// Sync engine tunables (grace delay, debounce, typing timers).
    pub chat: ChatConfig,

    // -- Connection --
    /// Handshake timeout and reconnect backoff.
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            socket_url: None,
            user_id: None,
            token: None,
            role: Role::Buyer,
            rest_timeout: Duration::from_secs(10),
            chat: ChatConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/marketchat/config.toml`) is tried
    /// and silently ignored if missing.
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
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let chat = &file.chat;
        let conn = &file.connection;
        let typing = &file.typing;
        let reconnect = defaults.connection.reconnect.clone();

        let role = cli
            .role
            .or_else(|| {
                file.server.role.as_deref().and_then(|raw| {
                    raw.parse()
                        .inspect_err(|e| tracing::warn!(error = %e, "ignoring [server] role"))
                        .ok()
                })
            })
            .unwrap_or(defaults.role);

        Self {
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            socket_url: cli
                .socket_url
                .clone()
                .or_else(|| file.server.socket_url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.server.user_id.clone()),
            token: cli.token.clone(),
            role,
            rest_timeout: chat
                .rest_timeout_secs
                .map_or(defaults.rest_timeout, Duration::from_secs),
            chat: ChatConfig {
                failure_grace: chat
                    .failure_grace_ms
                    .map_or(defaults.chat.failure_grace, Duration::from_millis),
                search_debounce: chat
                    .search_debounce_ms
                    .map_or(defaults.chat.search_debounce, Duration::from_millis),
                event_buffer: chat.event_buffer.unwrap_or(defaults.chat.event_buffer),
                typing_idle: typing
                    .idle_stop_ms
                    .map_or(defaults.chat.typing_idle, Duration::from_millis),
                typing_expiry: typing
                    .remote_expiry_secs
                    .map_or(defaults.chat.typing_expiry, Duration::from_secs),
            },
            connection: ConnectionConfig {
                handshake_timeout: conn
                    .handshake_timeout_secs
                    .map_or(defaults.connection.handshake_timeout, Duration::from_secs),
                reconnect: ReconnectConfig {
                    initial_delay: conn
                        .reconnect_initial_delay_ms
                        .map_or(reconnect.initial_delay, Duration::from_millis),
                    max_delay: conn
                        .reconnect_max_delay_secs
                        .map_or(reconnect.max_delay, Duration::from_secs),
                    max_attempts: conn
                        .reconnect_max_attempts
                        .unwrap_or(reconnect.max_attempts),
                    degraded_after: conn.degraded_after.unwrap_or(reconnect.degraded_after),
                },
            },
        }
    }

    /// Server endpoints and credential, if all of them are configured.
    ///
    /// Returns `None` if any is missing or blank.
    #[must_use]
    pub fn endpoints(&self) -> Option<Endpoints> {
        fn present(value: Option<&String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Some(Endpoints {
            api_url: present(self.api_url.as_ref())?,
            socket_url: present(self.socket_url.as_ref())?,
            user_id: UserId::new(present(self.user_id.as_ref())?),
            token: present(self.token.as_ref())?,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Marketplace chat console client")]
pub struct CliArgs {
    /// Base URL of the REST API.
    #[arg(long, env = "MARKETCHAT_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket URL of the push connection.
    #[arg(long, env = "MARKETCHAT_SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "MARKETCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token.
    #[arg(long, env = "MARKETCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Conversation list to show (buyer or seller).
    #[arg(long)]
    pub role: Option<Role>,

    /// Start a chat with this user (opens a provisional conversation).
    #[arg(long, conflicts_with = "conversation")]
    pub with: Option<String>,

    /// Open an existing conversation by key.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Run against an in-process fake server instead of a live one.
    #[arg(long)]
    pub demo: bool,

    /// Path to config file (default: `~/.config/marketchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MARKETCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/marketchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Path of the config file used when `--config` is not given.
///
/// # Errors
///
/// Returns [`ConfigError::NoConfigDir`] if the platform has no config dir.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("marketchat").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

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

    let path = match default_config_path() {
        Ok(path) => path,
        Err(ConfigError::NoConfigDir) => return Ok(ConfigFile::default()),
        Err(e) => return Err(e),
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
