//! TOML-based configuration persistence.
//!
//! Reads and writes [`AppConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\LanPair\config.toml`
//! - Linux:    `~/.config/lanpair/config.toml` (or `$XDG_CONFIG_HOME/lanpair`)
//! - macOS:    `~/Library/Application Support/LanPair/config.toml`
//!
//! ```toml
//! [network]
//! discovery_port = 24812
//! transport_port = 24813
//! bind_address = "0.0.0.0"
//! broadcast_address = "255.255.255.255"
//!
//! [pairing]
//! service_name = "_lanpair._ws"
//! handshake_timeout_ms = 10000
//! discovery_timeout_ms = 15000
//! probe_timeout_ms = 1500
//! query_interval_ms = 1000
//! enable_subnet_probe = true
//! enable_broadcast = true
//!
//! [logging]
//! level = "info"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]` and every section is
//! `#[serde(default)]`, so an empty file, a partial file, or a file written by
//! an older build all load with the missing values filled in.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanpair_core::domain::service::DEFAULT_SERVICE_NAME;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is not usable.
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ports and addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP port for discovery queries and announcements.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP port the receiver's WebSocket listener binds.
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// IPv4 address to bind all sockets to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Destination of discovery queries.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
}

/// Pairing behaviour and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Per-host connect budget of the subnet prober.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Delay between repeated broadcast queries.
    #[serde(default = "default_query_interval_ms")]
    pub query_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enable_subnet_probe: bool,
    #[serde(default = "default_true")]
    pub enable_broadcast: bool,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_discovery_port() -> u16 {
    24812
}
fn default_transport_port() -> u16 {
    24813
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_timeout_ms() -> u64 {
    15_000
}
fn default_probe_timeout_ms() -> u64 {
    1_500
}
fn default_query_interval_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            query_interval_ms: default_query_interval_ms(),
            enable_subnet_probe: default_true(),
            enable_broadcast: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NetworkConfig {
    /// Parsed `bind_address`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] if it is not an IPv4 address.
    pub fn bind_ipv4(&self) -> Result<Ipv4Addr, ConfigError> {
        parse_ipv4("network.bind_address", &self.bind_address)
    }

    /// Parsed `broadcast_address`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] if it is not an IPv4 address.
    pub fn broadcast_ipv4(&self) -> Result<Ipv4Addr, ConfigError> {
        parse_ipv4("network.broadcast_address", &self.broadcast_address)
    }
}

impl PairingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms)
    }
}

fn parse_ipv4(field: &'static str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file, returning
/// `AppConfig::default()` if the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from an explicit path; a missing file yields defaults.
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Same as [`save_config`].
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the `LanPair` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LanPair"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("LanPair")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lanpair"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("lanpair-config-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_app_config_default_has_expected_ports() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.network.discovery_port, 24812);
        assert_eq!(cfg.network.transport_port, 24813);
    }

    #[test]
    fn test_pairing_defaults() {
        let cfg = PairingConfig::default();
        assert_eq!(cfg.service_name, "_lanpair._ws");
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.discovery_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.probe_timeout(), Duration::from_millis(1500));
        assert!(cfg.enable_subnet_probe);
        assert!(cfg.enable_broadcast);
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        // Act
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");

        // Assert
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_deserialize_partial_section_overrides_defaults() {
        // Arrange
        let toml_str = r#"
[pairing]
handshake_timeout_ms = 2500
enable_broadcast = false
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.pairing.handshake_timeout(), Duration::from_millis(2500));
        assert!(!cfg.pairing.enable_broadcast);
        assert_eq!(cfg.pairing.discovery_timeout_ms, 15_000);
        assert_eq!(cfg.network, NetworkConfig::default());
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let result: Result<AppConfig, toml::de::Error> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_network_addresses_parse() {
        let mut cfg = NetworkConfig::default();
        assert_eq!(cfg.bind_ipv4().unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(cfg.broadcast_ipv4().unwrap(), Ipv4Addr::BROADCAST);

        cfg.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            cfg.bind_ipv4(),
            Err(ConfigError::InvalidValue { field: "network.bind_address", .. })
        ));
    }

    #[test]
    fn test_load_config_from_missing_file_returns_defaults() {
        let path = scratch_path("config.toml");
        let cfg = load_config_from(&path).expect("missing file is not an error");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_changes() {
        // Arrange
        let path = scratch_path("nested/config.toml");
        let mut cfg = AppConfig::default();
        cfg.network.transport_port = 9000;
        cfg.logging.level = "debug".to_string();

        // Act
        save_config_to(&cfg, &path).expect("save");
        let restored = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(restored, cfg);
        if let Some(dir) = path.parent().and_then(Path::parent) {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
