//! Configuration for the SerialHub agent
//!
//! Configuration is organized into logical sections:
//! - Serial connection defaults (queue depth, read sizes)
//! - Flow-control tuning per firmware (GRBL, TinyG, timed batching)
//! - Port discovery (external process, restart policy, filters)
//! - Broadcast fan-out and logging
//!
//! Every section defaults independently, so a partial file is valid.
//! Files are TOML unless the extension is `.json`.

use crate::error::{SettingsError, SettingsResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names accepted for `serial.default_algorithm`.
pub const BUFFER_ALGORITHM_NAMES: &[&str] = &["default", "timed", "timedraw", "grbl", "tinyg"];

/// Serial connection defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Maximum commands waiting in a connection's buffered queue
    pub buffered_queue_capacity: usize,
    /// Bytes requested per read from the OS handle
    pub read_buffer_size: usize,
    /// Read timeout on the OS handle; a timeout is not an error
    pub read_timeout_ms: u64,
    /// Flow-control algorithm used when an open command names none
    pub default_algorithm: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            buffered_queue_capacity: 256_000,
            read_buffer_size: 1024,
            read_timeout_ms: 100,
            default_algorithm: "default".to_string(),
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// GRBL flow-control tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrblSettings {
    /// Size of the device's serial receive buffer in bytes
    pub buffer_max: usize,
    /// Interval between `?` status queries
    pub status_poll_interval_ms: u64,
}

impl Default for GrblSettings {
    fn default() -> Self {
        Self {
            buffer_max: 127,
            status_poll_interval_ms: 250,
        }
    }
}

impl GrblSettings {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

/// TinyG flow-control tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinygSettings {
    /// Pause when the reported queue slots fall to this value or below
    pub stop_sending: u32,
    /// Resume when the reported queue slots reach this value or above
    pub start_sending: u32,
    /// Minimum spacing between consecutive commands
    pub pacing_delay_ms: u64,
}

impl Default for TinygSettings {
    fn default() -> Self {
        Self {
            stop_sending: 14,
            start_sending: 16,
            pacing_delay_ms: 15,
        }
    }
}

impl TinygSettings {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}

/// Timed batching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimedSettings {
    pub flush_interval_ms: u64,
}

impl Default for TimedSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 16,
        }
    }
}

impl TimedSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// External port discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Discovery executable, resolved through `PATH` when not absolute
    pub program: String,
    pub args: Vec<String>,
    /// How many times an exited discovery process is restarted
    pub max_restarts: u32,
    pub restart_backoff_secs: u64,
    /// Ports whose address matches this regex are hidden
    pub exclude_pattern: Option<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            program: "serial-discovery".to_string(),
            args: Vec::new(),
            max_restarts: 10,
            restart_backoff_secs: 10,
            exclude_pattern: None,
        }
    }
}

impl DiscoverySettings {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    /// Compile the exclude pattern, if one is configured.
    pub fn exclude_regex(&self) -> SettingsResult<Option<Regex>> {
        match &self.exclude_pattern {
            Some(p) if !p.is_empty() => Regex::new(p)
                .map(Some)
                .map_err(|e| SettingsError::invalid("discovery.exclude_pattern", e.to_string())),
            _ => Ok(None),
        }
    }
}

/// Broadcast fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Messages retained for a slow subscriber before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1000,
        }
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub serial: SerialSettings,
    pub grbl: GrblSettings,
    pub tinyg: TinygSettings,
    pub timed: TimedSettings,
    pub discovery: DiscoverySettings,
    pub hub: HubSettings,
    pub logging: LoggingSettings,
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform config location, e.g. `~/.config/serialhub/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("serialhub").join("config.toml"))
    }

    /// Load config from file (JSON or TOML)
    pub fn load(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Load(format!("{}: {}", path.display(), e)))?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(
                "No configuration at {}, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)
            .map_err(|e| SettingsError::Save(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }

    pub fn validate(&self) -> SettingsResult<()> {
        if self.serial.buffered_queue_capacity == 0 {
            return Err(SettingsError::invalid(
                "serial.buffered_queue_capacity",
                "must be > 0",
            ));
        }
        if self.serial.read_buffer_size == 0 {
            return Err(SettingsError::invalid("serial.read_buffer_size", "must be > 0"));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(SettingsError::invalid("serial.read_timeout_ms", "must be > 0"));
        }
        let algorithm = self.serial.default_algorithm.to_ascii_lowercase();
        if !BUFFER_ALGORITHM_NAMES.contains(&algorithm.as_str()) {
            return Err(SettingsError::invalid(
                "serial.default_algorithm",
                format!(
                    "unknown algorithm '{}', expected one of {}",
                    self.serial.default_algorithm,
                    BUFFER_ALGORITHM_NAMES.join(", ")
                ),
            ));
        }

        if self.grbl.buffer_max == 0 {
            return Err(SettingsError::invalid("grbl.buffer_max", "must be > 0"));
        }
        if self.grbl.status_poll_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "grbl.status_poll_interval_ms",
                "must be > 0",
            ));
        }

        if self.tinyg.start_sending <= self.tinyg.stop_sending {
            return Err(SettingsError::invalid(
                "tinyg.start_sending",
                "must be greater than tinyg.stop_sending",
            ));
        }

        if self.timed.flush_interval_ms == 0 {
            return Err(SettingsError::invalid("timed.flush_interval_ms", "must be > 0"));
        }

        if self.discovery.program.trim().is_empty() {
            return Err(SettingsError::invalid("discovery.program", "must not be empty"));
        }
        self.discovery.exclude_regex()?;

        if self.hub.broadcast_capacity == 0 {
            return Err(SettingsError::invalid("hub.broadcast_capacity", "must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.serial.buffered_queue_capacity, 256_000);
        assert_eq!(config.grbl.buffer_max, 127);
        assert_eq!(config.grbl.status_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.tinyg.stop_sending, 14);
        assert_eq!(config.tinyg.start_sending, 16);
        assert_eq!(config.tinyg.pacing_delay(), Duration::from_millis(15));
        assert_eq!(config.timed.flush_interval(), Duration::from_millis(16));
        assert_eq!(config.discovery.max_restarts, 10);
        assert_eq!(config.discovery.restart_backoff(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str("[grbl]\nbuffer_max = 255\n").unwrap();
        assert_eq!(config.grbl.buffer_max, 255);
        assert_eq!(config.grbl.status_poll_interval_ms, 250);
        assert_eq!(config.tinyg, TinygSettings::default());
    }

    #[test]
    fn test_validate_rejects_inverted_hysteresis() {
        let mut config = AgentConfig::default();
        config.tinyg.start_sending = 14;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tinyg.start_sending"));
    }

    #[test]
    fn test_validate_rejects_bad_exclude_pattern() {
        let mut config = AgentConfig::default();
        config.discovery.exclude_pattern = Some("(".to_string());
        assert!(config.validate().is_err());

        config.discovery.exclude_pattern = Some("^/dev/ttyS".to_string());
        assert!(config.validate().is_ok());
        let re = config.discovery.exclude_regex().unwrap().unwrap();
        assert!(re.is_match("/dev/ttyS0"));
    }

    #[test]
    fn test_validate_rejects_unknown_algorithm() {
        let mut config = AgentConfig::default();
        config.serial.default_algorithm = "GRBL".to_string();
        assert!(config.validate().is_ok());
        config.serial.default_algorithm = "xon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_path_file_name() {
        if let Some(path) = AgentConfig::default_path() {
            assert!(path.ends_with("serialhub/config.toml"));
        }
    }
}
