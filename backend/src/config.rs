//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    bridge: BridgeFile,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_addr")]
    addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BridgeFile {
    #[serde(default = "default_target")]
    target: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_model")]
    default_model: String,
    #[serde(default = "default_model_cache_ttl_secs")]
    model_cache_ttl_secs: u64,
    #[serde(default)]
    max_sessions: Option<usize>,
}

impl Default for BridgeFile {
    fn default() -> Self {
        Self {
            target: default_target(),
            timeout_secs: default_timeout_secs(),
            default_model: default_model(),
            model_cache_ttl_secs: default_model_cache_ttl_secs(),
            max_sessions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoggingConfig {
    /// Path to log file (if set, logs are written there in addition to the console)
    log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    log_level: Option<String>,
}

fn default_addr() -> String {
    opencode_mcp_types::DEFAULT_ADDR.to_string()
}

fn default_target() -> String {
    opencode_mcp_types::DEFAULT_TARGET.to_string()
}

fn default_timeout_secs() -> u64 {
    opencode_mcp_types::DEFAULT_TIMEOUT_SECS
}

fn default_model() -> String {
    opencode_mcp_types::DEFAULT_MODEL.to_string()
}

fn default_model_cache_ttl_secs() -> u64 {
    300
}

/// Errors while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {0:?}")]
    InvalidAddr(String),

    #[error("timeout must be at least one second")]
    ZeroTimeout,

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub addr: Option<String>,
    pub target: Option<String>,
    pub timeout_secs: Option<u64>,
    pub default_model: Option<String>,
    pub log_level: Option<String>,
    /// Extra config file merged above the discovered ones.
    pub config_file: Option<PathBuf>,
}

/// Settings used by the bridge for every invocation.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Executable launched for every tool call.
    pub target: String,
    /// Deadline for one invocation.
    pub timeout: Duration,
    /// Model used when none is requested and none can be discovered.
    pub default_model: String,
    pub model_cache_ttl: Duration,
    pub max_sessions: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let file = BridgeFile::default();
        Self {
            target: file.target,
            timeout: Duration::from_secs(file.timeout_secs),
            default_model: file.default_model,
            model_cache_ttl: Duration::from_secs(file.model_cache_ttl_secs),
            max_sessions: file.max_sessions,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on
    pub addr: SocketAddr,
    pub bridge: BridgeConfig,
    /// Path to log file
    pub log_file: Option<PathBuf>,
    /// Log level (if set, overrides RUST_LOG environment variable)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars > config files > defaults.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in user config directory (~/.config/opencode-mcp/ on Linux)
    /// 2. `.opencode-mcp.toml` in current directory
    pub fn from_figment(overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(".opencode-mcp.toml"));
        let user_config = directories::ProjectDirs::from("", "", "opencode-mcp")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // Priority: defaults < user config < local config < explicit file < env vars < CLI args
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile {
            server: ServerConfig::default(),
            bridge: BridgeFile::default(),
            logging: LoggingConfig::default(),
        }));

        for path in [user_config, local_config, overrides.config_file.clone()]
            .into_iter()
            .flatten()
        {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // OPENCODE_MCP_BRIDGE__TIMEOUT_SECS -> bridge.timeout_secs
        figment = figment.merge(
            Env::prefixed("OPENCODE_MCP_").map(|key| key.as_str().replace("__", ".").into()),
        );

        if let Some(ref addr) = overrides.addr {
            figment = figment.merge(Serialized::default("server.addr", addr));
        }
        if let Some(ref target) = overrides.target {
            figment = figment.merge(Serialized::default("bridge.target", target));
        }
        if let Some(secs) = overrides.timeout_secs {
            figment = figment.merge(Serialized::default("bridge.timeout_secs", secs));
        }
        if let Some(ref model) = overrides.default_model {
            figment = figment.merge(Serialized::default("bridge.default_model", model));
        }
        if let Some(ref level) = overrides.log_level {
            figment = figment.merge(Serialized::default("logging.log_level", level));
        }

        let file: ConfigFile = figment.extract().map_err(|e| ConfigError::Figment(Box::new(e)))?;
        Self::from_file(file).map_err(Into::into)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        if file.bridge.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(Self {
            addr: parse_listen_addr(&file.server.addr)?,
            bridge: BridgeConfig {
                target: file.bridge.target,
                timeout: Duration::from_secs(file.bridge.timeout_secs),
                default_model: file.bridge.default_model,
                model_cache_ttl: Duration::from_secs(file.bridge.model_cache_ttl_secs),
                max_sessions: file.bridge.max_sessions,
            },
            log_file: file.logging.log_file,
            log_level: file.logging.log_level,
        })
    }
}

/// Parse a listen address. A bare `:port` binds all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        return port
            .parse::<u16>()
            .map(|p| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), p))
            .map_err(|_| ConfigError::InvalidAddr(addr.to_string()));
    }
    addr.parse()
        .map_err(|_| ConfigError::InvalidAddr(addr.to_string()))
}
