use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::AttachCommand;
use crate::reaper::ReaperStrategy;
use crate::session::SessionOptions;

/// Top-level service config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub sessions: SessionsSection,
    pub attach: AttachCommand,
    pub reaper: ReaperSection,
    pub lxc: LxcSection,
    pub tls: TlsSection,
}

/// Control-plane listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
        }
    }
}

/// Per-session listeners and ptys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub port_start: u16,
    pub port_end: u16,
    pub listen_host: IpAddr,
    pub rows: u16,
    pub cols: u16,
    pub max_viewers: usize,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            port_start: 8001,
            port_end: 8999,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rows: 24,
            cols: 80,
            max_viewers: 64,
            idle_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSection {
    pub strategy: ReaperStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LxcSection {
    /// Directory holding the `lxc-*` tools. Looked up on `PATH` when unset.
    pub bin_dir: Option<PathBuf>,
}

/// TLS is enabled when both `cert` and `key` are set; client certificates
/// are required when `client_ca` is set as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Default location: `$XDG_CONFIG_HOME/lxcterm/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("lxcterm").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sessions;
        if s.port_start == 0 || s.port_start > s.port_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty or starts at 0",
                s.port_start, s.port_end
            )));
        }
        if s.rows == 0 || s.cols == 0 {
            return Err(ConfigError::Invalid("rows and cols must be non-zero".into()));
        }
        if s.max_viewers == 0 {
            return Err(ConfigError::Invalid("max_viewers must be non-zero".into()));
        }
        if self.attach.program.is_empty() {
            return Err(ConfigError::Invalid("attach.program must not be empty".into()));
        }
        if self.tls.cert.is_some() != self.tls.key.is_some() {
            return Err(ConfigError::Invalid(
                "tls.cert and tls.key must be set together".into(),
            ));
        }
        if self.tls.client_ca.is_some() && self.tls.cert.is_none() {
            return Err(ConfigError::Invalid(
                "tls.client_ca requires tls.cert and tls.key".into(),
            ));
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.sessions.port_start..=self.sessions.port_end
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            command: self.attach.clone(),
            listen_host: self.sessions.listen_host,
            rows: self.sessions.rows,
            cols: self.sessions.cols,
            max_viewers: self.sessions.max_viewers,
            idle_timeout: self.sessions.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Parse `START-END` into an inclusive range.
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{s}'"))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start port '{start}': {e}"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end port '{end}': {e}"))?;
    if start == 0 || start > end {
        return Err(format!("port range {start}-{end} is empty or starts at 0"));
    }
    Ok(start..=end)
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
