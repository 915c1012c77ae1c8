//! TOML-based configuration for the driver.
//!
//! Read from the path given on the command line, or from the platform config
//! directory:
//! - Linux:    `~/.config/nortek-driver/config.toml`
//! - macOS:    `~/Library/Application Support/NortekDriver/config.toml`
//! - Windows:  `%APPDATA%\NortekDriver\config.toml`
//!
//! ```toml
//! [driver]
//! family = "vector"
//! log_level = "info"
//!
//! [transport]
//! kind = "tcp"
//! address = "10.180.80.6:2101"
//!
//! [timing]
//! command_timeout_ms = 10000
//!
//! [parameters]
//! AvgInterval = 64
//! ClockSyncInterval = "12:00:00"
//! DeploymentName = "NEMO"
//! ```
//!
//! # Initial parameter values
//!
//! Entries under `[parameters]` are converted to the parameter's declared
//! kind when the registry is seeded.  Integers map to `Int`, strings to
//! `Str`, base64 strings to `Blob`, arrays of booleans to `Bits`, and arrays
//! of six integers to `DateTime`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use nortek_core::params::ValueKind;
use nortek_core::protocol::codec::DATETIME_LEN;
use nortek_core::{InstrumentFamily, ParameterRegistry, RegistryError, Value};

use crate::application::Timing;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown instrument family {0:?}")]
    UnknownFamily(String),

    #[error("invalid value for parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level driver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Initial values keyed by parameter name.
    #[serde(default)]
    pub parameters: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverSection {
    /// `"vector"` or `"aquadopp"`.
    #[serde(default = "default_family")]
    pub family: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Base64 user configuration block to load before first contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_config: Option<String>,
    /// Write changed startup parameters once the instrument is in command mode.
    #[serde(default = "default_true")]
    pub apply_startup_params: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Serial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,
    /// `host:port` of a serial-to-Ethernet bridge.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Upper bound on any single command exchange.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How often a waiting exchange re-checks its buffer.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause between what-mode probes.
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    /// Pause between the two halves of the soft break.
    #[serde(default = "default_soft_break_delay_ms")]
    pub soft_break_delay_ms: u64,
    /// Upper bound on buffered unframed bytes.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_family() -> String {
    "vector".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_transport_kind() -> TransportKind {
    TransportKind::Tcp
}
fn default_address() -> String {
    "127.0.0.1:4001".to_string()
}
fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    19_200
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_command_timeout_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_probe_delay_ms() -> u64 {
    1_000
}
fn default_soft_break_delay_ms() -> u64 {
    100
}
fn default_max_buffer_bytes() -> usize {
    64 * 1024
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            family: default_family(),
            log_level: default_log_level(),
            raw_config: None,
            apply_startup_params: default_true(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            address: default_address(),
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_delay_ms: default_probe_delay_ms(),
            soft_break_delay_ms: default_soft_break_delay_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl DriverConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownFamily`] for an unrecognised family name.
    pub fn family(&self) -> Result<&'static InstrumentFamily, ConfigError> {
        InstrumentFamily::by_name(&self.driver.family)
            .ok_or_else(|| ConfigError::UnknownFamily(self.driver.family.clone()))
    }

    pub fn timing(&self) -> Timing {
        Timing {
            command_timeout: Duration::from_millis(self.timing.command_timeout_ms),
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            probe_delay: Duration::from_millis(self.timing.probe_delay_ms),
            soft_break_delay: Duration::from_millis(self.timing.soft_break_delay_ms),
            max_buffer: self.timing.max_buffer_bytes,
        }
    }

    /// Seeds `registry` with the `[parameters]` table and `raw_config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParameter`] for a value that does not
    /// convert to the parameter's kind, or [`ConfigError::Registry`] for an
    /// unknown name, a rejected value, or an invalid raw block.
    pub fn seed_registry(&self, registry: &mut ParameterRegistry) -> Result<(), ConfigError> {
        if let Some(blob) = &self.driver.raw_config {
            registry.import_raw_config(blob)?;
            info!("loaded raw user configuration from config file");
        }
        for (name, raw) in &self.parameters {
            let kind = registry.parameter(name)?.expected_kind();
            let value = value_from_toml(kind, raw).map_err(|reason| {
                ConfigError::InvalidParameter {
                    name: name.clone(),
                    reason,
                }
            })?;
            registry.set_init_value(name, value)?;
        }
        Ok(())
    }
}

/// Converts a TOML value to a parameter [`Value`] of `kind`.
///
/// # Errors
///
/// Returns a description of the mismatch when `raw` cannot represent `kind`.
pub fn value_from_toml(kind: ValueKind, raw: &toml::Value) -> Result<Value, String> {
    match (kind, raw) {
        (ValueKind::Int, toml::Value::Integer(i)) => Ok(Value::Int(*i)),
        (ValueKind::Str, toml::Value::String(s)) => Ok(Value::Str(s.clone())),
        (ValueKind::Blob, toml::Value::String(s)) => STANDARD
            .decode(s)
            .map(Value::Blob)
            .map_err(|e| format!("invalid base64: {e}")),
        (ValueKind::Bits, toml::Value::Array(items)) => items
            .iter()
            .map(|item| item.as_bool().ok_or("bit arrays hold only booleans"))
            .collect::<Result<Vec<bool>, _>>()
            .map(Value::Bits)
            .map_err(str::to_string),
        (ValueKind::DateTime, toml::Value::Array(items)) => {
            if items.len() != DATETIME_LEN {
                return Err(format!("expected {DATETIME_LEN} integers, got {}", items.len()));
            }
            let mut fields = [0u8; DATETIME_LEN];
            for (slot, item) in fields.iter_mut().zip(items) {
                *slot = item
                    .as_integer()
                    .and_then(|i| u8::try_from(i).ok())
                    .filter(|v| *v <= 99)
                    .ok_or("date fields must be integers 0..=99")?;
            }
            Ok(Value::DateTime(fields))
        }
        (kind, raw) => Err(format!("expected {kind}, got {}", raw.type_str())),
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the configuration at `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<DriverConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no config at {}, using defaults", path.display());
            Ok(DriverConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &DriverConfig) -> Result<(), ConfigError> {
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

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("NortekDriver"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("nortek-driver"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("NortekDriver")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nortek_core::params::user_config::{
        nortek_registry, AVG_INTERVAL, CLOCK_DEPLOY, CLOCK_SYNC_INTERVAL, DEPLOYMENT_NAME, MODE,
    };
    use nortek_core::VECTOR;

    #[test]
    fn test_default_config_uses_documented_timing() {
        let cfg = DriverConfig::default();
        let timing = cfg.timing();
        assert_eq!(timing.command_timeout, Duration::from_secs(10));
        assert_eq!(timing.probe_delay, Duration::from_secs(1));
        assert_eq!(timing.soft_break_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        // Arrange
        let text = r#"
            [driver]
            family = "aquadopp"

            [transport]
            kind = "serial"
            serial_port = "/dev/ttyS1"
        "#;

        // Act
        let cfg: DriverConfig = toml::from_str(text).unwrap();

        // Assert
        assert_eq!(cfg.family().unwrap().name, "aquadopp");
        assert_eq!(cfg.transport.kind, TransportKind::Serial);
        assert_eq!(cfg.transport.baud_rate, 19_200);
        assert_eq!(cfg.timing.command_timeout_ms, 10_000);
        assert!(cfg.parameters.is_empty());
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        let mut cfg = DriverConfig::default();
        cfg.driver.family = "signature".into();
        assert!(matches!(cfg.family(), Err(ConfigError::UnknownFamily(_))));
    }

    #[test]
    fn test_seed_registry_converts_each_kind() {
        // Arrange
        let cfg: DriverConfig = toml::from_str(
            r#"
            [parameters]
            AvgInterval = 64
            DeploymentName = "NEMO"
            ClockSyncInterval = "12:00:00"
            ClockDeploy = [0, 0, 1, 0, 24, 1]
            Mode = [false, true, true, false, false, false, false, false,
                    false, false, false, false, false, false, false, false]
            "#,
        )
        .unwrap();
        let mut registry = nortek_registry(&VECTOR).unwrap();

        // Act
        cfg.seed_registry(&mut registry).unwrap();

        // Assert
        assert_eq!(
            registry.parameter(AVG_INTERVAL).unwrap().init_value,
            Some(Value::Int(64))
        );
        assert_eq!(
            registry.parameter(DEPLOYMENT_NAME).unwrap().init_value,
            Some(Value::Str("NEMO".into()))
        );
        assert_eq!(
            registry.value(CLOCK_SYNC_INTERVAL).unwrap(),
            Some(&Value::Str("12:00:00".into()))
        );
        assert!(matches!(
            registry.parameter(CLOCK_DEPLOY).unwrap().init_value,
            Some(Value::DateTime([0, 0, 1, 0, 24, 1]))
        ));
        assert!(matches!(
            &registry.parameter(MODE).unwrap().init_value,
            Some(Value::Bits(bits)) if bits.len() == 16
        ));
    }

    #[test]
    fn test_seed_registry_rejects_wrong_kind() {
        let cfg: DriverConfig = toml::from_str("[parameters]\nAvgInterval = \"often\"").unwrap();
        let mut registry = nortek_registry(&VECTOR).unwrap();

        let result = cfg.seed_registry(&mut registry);

        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { name, .. }) if name == AVG_INTERVAL
        ));
    }

    #[test]
    fn test_seed_registry_rejects_unknown_name() {
        let cfg: DriverConfig = toml::from_str("[parameters]\nBogus = 1").unwrap();
        let mut registry = nortek_registry(&VECTOR).unwrap();

        assert!(matches!(
            cfg.seed_registry(&mut registry),
            Err(ConfigError::Registry(RegistryError::UnknownParameter(_)))
        ));
    }

    #[test]
    fn test_value_from_toml_decodes_base64_blob() {
        let raw = toml::Value::String(STANDARD.encode([1u8, 2, 3]));
        assert_eq!(
            value_from_toml(ValueKind::Blob, &raw).unwrap(),
            Value::Blob(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_value_from_toml_rejects_out_of_range_date_field() {
        let raw = toml::Value::Array(vec![toml::Value::Integer(100); 6]);
        assert!(value_from_toml(ValueKind::DateTime, &raw).is_err());
    }

    #[test]
    fn test_save_then_load_preserves_config() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("nortek-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");
        let mut cfg = DriverConfig::default();
        cfg.transport.address = "10.0.0.5:2101".into();
        cfg.parameters
            .insert(AVG_INTERVAL.into(), toml::Value::Integer(16));

        // Act
        save_config(&path, &cfg).unwrap();
        let restored = load_config(&path).unwrap();

        // Assert
        assert_eq!(restored, cfg);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("absent-{}.toml", uuid::Uuid::new_v4()));
        assert_eq!(load_config(&path).unwrap(), DriverConfig::default());
    }
}
