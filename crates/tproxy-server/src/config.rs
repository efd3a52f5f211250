//! Server configuration: TOML file + CLI overrides.

use crate::gateway::{AdmissionLimits, RelayStrategy, RelayTimeouts};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tproxy_core::{ProxyError, ProxyResult};

/// Upper bound for any configured timeout (30 days).
const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub logger: LoggerSection,
}

/// `[server]` section: the control listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// `scheme://host:port`; only `tcp` is supported.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Idle deadline for the control connection and the client relay leg, seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// `[stream]` section: destination connections.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    /// Idle deadline for the destination relay leg, seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Dial timeout, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
    #[serde(default)]
    pub relay_mode: RelayStrategy,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
            max_connections: default_max_connections(),
            max_connections_per_host: default_max_connections_per_host(),
            relay_mode: RelayStrategy::default(),
        }
    }
}

/// `[logger]` section: console output.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub color: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            color: true,
            level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "tcp://0.0.0.0:2323".to_string()
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_max_connections() -> usize {
    100
}
fn default_max_connections_per_host() -> usize {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// A parsed `scheme://host:port` bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddr {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl BindAddr {
    /// `host:port`, suitable for `TcpListener::bind`.
    pub fn socket_str(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.socket_str())
    }
}

/// Parse `scheme://host:port`. The port is split at the last `:`.
pub fn parse_bind(bind: &str) -> ProxyResult<BindAddr> {
    let invalid = || {
        ProxyError::Config(format!(
            "bind address {bind:?} is incorrect, expected scheme://host:port"
        ))
    };

    let (scheme, rest) = bind.split_once("://").ok_or_else(invalid)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if scheme.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| ProxyError::Config(format!("bind port {port:?}: {e}")))?;
    if scheme != "tcp" {
        return Err(ProxyError::Config(format!(
            "unsupported bind scheme {scheme:?}, only tcp is supported"
        )));
    }

    Ok(BindAddr {
        scheme: scheme.to_string(),
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
    })
}

/// Resolved server configuration (bind parsed, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: BindAddr,
    /// Control connection and client relay leg.
    pub client_idle_timeout: Duration,
    /// Destination relay leg.
    pub destination_idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub relay_mode: RelayStrategy,
    pub log_enabled: bool,
    pub log_color: bool,
    pub log_level: String,
    /// File the settings were read from; `None` when only defaults applied.
    pub source: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_max_connections: Option<usize>,
        cli_max_connections_per_host: Option<usize>,
        cli_log_level: Option<&str>,
    ) -> ProxyResult<Self> {
        // Load base config from file
        let mut source = None;
        let mut file_config = match config_path.map(expand_tilde) {
            Some(expanded) if expanded.exists() => {
                let content = std::fs::read_to_string(&expanded)?;
                let parsed = toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| ProxyError::Config(format!("config parse error: {e}")))?;
                source = Some(expanded);
                parsed
            }
            _ => ConfigFile::default(),
        };

        // Merge CLI overrides
        if let Some(bind) = cli_bind {
            file_config.server.bind = bind.to_string();
        }
        if let Some(max) = cli_max_connections {
            file_config.stream.max_connections = max;
        }
        if let Some(max) = cli_max_connections_per_host {
            file_config.stream.max_connections_per_host = max;
        }
        if let Some(level) = cli_log_level {
            file_config.logger.level = level.to_string();
        }

        let mut config = Self::from_file(file_config)?;
        config.source = source;
        Ok(config)
    }

    /// Validate and resolve a parsed config file.
    pub fn from_file(file: ConfigFile) -> ProxyResult<Self> {
        let bind = parse_bind(&file.server.bind)?;

        for (name, secs) in [
            ("server.idle_timeout", file.server.idle_timeout),
            ("stream.idle_timeout", file.stream.idle_timeout),
            ("stream.connect_timeout", file.stream.connect_timeout),
        ] {
            if secs == 0 {
                return Err(ProxyError::Config(format!("{name} must be greater than 0")));
            }
            if secs > MAX_TIMEOUT_SECS {
                return Err(ProxyError::Config(format!(
                    "{name} must be at most {MAX_TIMEOUT_SECS} seconds"
                )));
            }
        }

        Ok(Self {
            bind,
            client_idle_timeout: Duration::from_secs(file.server.idle_timeout),
            destination_idle_timeout: Duration::from_secs(file.stream.idle_timeout),
            connect_timeout: Duration::from_secs(file.stream.connect_timeout),
            max_connections: file.stream.max_connections,
            max_connections_per_host: file.stream.max_connections_per_host,
            relay_mode: file.stream.relay_mode,
            log_enabled: file.logger.enabled,
            log_color: file.logger.color,
            log_level: file.logger.level,
            source: None,
        })
    }

    pub fn limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_sessions: self.max_connections,
            max_sessions_per_host: self.max_connections_per_host,
        }
    }

    pub fn relay_timeouts(&self) -> RelayTimeouts {
        RelayTimeouts {
            client: self.client_idle_timeout,
            destination: self.destination_idle_timeout,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
