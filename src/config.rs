//! Configuration loading and validation.
//!
//! Strongly-typed configuration for the monitor backend, loaded with
//! `figment` from:
//! 1. a TOML file (default `config/monitor.toml`)
//! 2. environment variables prefixed with `DED_MONITOR_`, with `__`
//!    separating the section from the key
//!
//! Timing knobs that earlier iterations of the system hard-coded (rotation
//! interval, snapshot power gate, aux snapshot rate, capture TTL) are all
//! configuration here, with the backend defaults.
//!
//! # Example
//! ```no_run
//! use ded_monitor::config::Config;
//!
//! let config = Config::load()?;
//! println!("tick period: {:?}", config.acquisition.tick_period);
//! # Ok::<(), ded_monitor::error::MonitorError>(())
//! ```

use crate::error::{AppResult, MonitorError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Aggregator tick loop settings.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Persistence policy settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Fan-out server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Cross-process bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Per-instrument sampling settings.
    #[serde(default)]
    pub instruments: InstrumentsConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in the connection acknowledgement.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "ded-monitor".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Fixed tick period of the merge loop.
    #[serde(with = "humantime_serde")]
    pub tick_period: Duration,
    /// Bounded in-memory history capacity (drop-oldest).
    pub history_capacity: usize,
    /// Capacity of the record hand-off queues into persistence and
    /// broadcast. The tick loop never blocks on these; overflow drops.
    pub handoff_queue: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(20),
            history_capacity: 5000,
            handoff_queue: 256,
        }
    }
}

/// Persistence policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory under which session folders are created.
    pub base_dir: PathBuf,
    /// Rotating-log rotation interval.
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    /// Laser output power gate for melt-pool frame snapshots, in watts.
    pub power_threshold_w: f64,
    /// Minimum interval between aux combined-frame snapshots.
    #[serde(with = "humantime_serde")]
    pub aux_snapshot_interval: Duration,
    /// Default time-to-live for provisional capture sessions.
    #[serde(with = "humantime_serde")]
    pub capture_ttl: Duration,
    /// Upper bound on records retained by a capture session (drop-oldest).
    pub capture_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("DB"),
            rotation_interval: Duration::from_secs(3600),
            power_threshold_w: 10.0,
            aux_snapshot_interval: Duration::from_secs(1),
            capture_ttl: Duration::from_secs(30 * 60),
            capture_capacity: 10_000,
        }
    }
}

/// Fan-out server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP bind address for live subscribers.
    pub bind: String,
    /// Liveness ping interval.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Per-subscriber outbound queue capacity.
    pub subscriber_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9100".to_string(),
            ping_interval: Duration::from_secs(5),
            subscriber_queue: 128,
        }
    }
}

/// Cross-process bridge settings.
///
/// The CNC driver requires a 32-bit host and cannot share this process, so
/// it runs as a child emitting one JSON message per stdout line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Whether the CNC channel is served by the bridge.
    pub enabled: bool,
    /// Driver host executable.
    pub program: String,
    /// Arguments passed to the driver host.
    #[serde(default)]
    pub args: Vec<String>,
    /// Bounded wait after a graceful terminate before force-killing.
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: String::new(),
            args: Vec::new(),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

/// Sampling settings for a single instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether the channel is sampled at all.
    pub enabled: bool,
    /// Target sampling rate in hertz.
    pub rate_hz: f64,
    /// Channel store backlog capacity.
    pub store_capacity: usize,
}

impl ChannelConfig {
    fn new(rate_hz: f64) -> Self {
        Self {
            enabled: true,
            rate_hz,
            store_capacity: 100,
        }
    }
}

/// Per-instrument sampling settings, one field per known channel kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// Melt-pool camera channel.
    pub camera: ChannelConfig,
    /// CNC channel (ignored when the bridge is enabled).
    pub cnc: ChannelConfig,
    /// Laser channel.
    pub laser: ChannelConfig,
    /// Pyrometer channel.
    pub pyrometer: ChannelConfig,
    /// Auxiliary camera channel.
    pub aux_camera: ChannelConfig,
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        // Rates follow the deployed sensor loops: fast laser polling,
        // pyrometer derated for serial stability, ~1 Hz aux imaging.
        Self {
            camera: ChannelConfig::new(50.0),
            cnc: ChannelConfig::new(50.0),
            laser: ChannelConfig::new(100.0),
            pyrometer: ChannelConfig::new(20.0),
            aux_camera: ChannelConfig::new(1.0),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            bridge: BridgeConfig::default(),
            instruments: InstrumentsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `config/monitor.toml` and the environment.
    ///
    /// Environment variables override file values with the `DED_MONITOR_`
    /// prefix and `__` between nesting levels, so field names containing
    /// underscores stay intact: `DED_MONITOR_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/monitor.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Config = Figment::from(figment::providers::Serialized::defaults(
            Config::default(),
        ))
        .merge(Toml::file(path.as_ref()))
        .merge(Env::prefixed("DED_MONITOR_").split("__"))
        .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic constraints after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.acquisition.tick_period.is_zero() {
            return Err(MonitorError::Configuration(
                "acquisition.tick_period must be non-zero".to_string(),
            ));
        }
        if self.acquisition.history_capacity == 0 {
            return Err(MonitorError::Configuration(
                "acquisition.history_capacity must be at least 1".to_string(),
            ));
        }

        if self.storage.rotation_interval.is_zero() {
            return Err(MonitorError::Configuration(
                "storage.rotation_interval must be non-zero".to_string(),
            ));
        }
        if self.storage.power_threshold_w < 0.0 {
            return Err(MonitorError::Configuration(
                "storage.power_threshold_w must not be negative".to_string(),
            ));
        }

        for (name, channel) in [
            ("camera", &self.instruments.camera),
            ("cnc", &self.instruments.cnc),
            ("laser", &self.instruments.laser),
            ("pyrometer", &self.instruments.pyrometer),
            ("aux_camera", &self.instruments.aux_camera),
        ] {
            if channel.enabled && channel.rate_hz <= 0.0 {
                return Err(MonitorError::Configuration(format!(
                    "instruments.{name}.rate_hz must be positive"
                )));
            }
        }

        if self.bridge.enabled && self.bridge.program.is_empty() {
            return Err(MonitorError::Configuration(
                "bridge.program must be set when bridge.enabled = true".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.tick_period, Duration::from_millis(20));
        assert_eq!(config.acquisition.history_capacity, 5000);
        assert_eq!(config.storage.power_threshold_w, 10.0);
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut config = Config::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(MonitorError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_zero_tick_period() {
        let mut config = Config::default();
        config.acquisition.tick_period = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bridge_without_program() {
        let mut config = Config::default();
        config.bridge.enabled = true;
        assert!(config.validate().is_err());
        config.bridge.program = "cnc-host32".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_overrides_from_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("monitor.toml");
        std::fs::write(
            &path,
            r#"
            [acquisition]
            tick_period = "10ms"
            history_capacity = 100

            [storage]
            rotation_interval = "30m"
            power_threshold_w = 25.0

            [instruments.pyrometer]
            enabled = true
            rate_hz = 20.0
            store_capacity = 64
            "#,
        )
        .expect("write config");

        let config = Config::load_from(&path).expect("config loads");
        assert_eq!(config.acquisition.tick_period, Duration::from_millis(10));
        assert_eq!(config.acquisition.history_capacity, 100);
        assert_eq!(config.storage.rotation_interval, Duration::from_secs(1800));
        assert_eq!(config.storage.power_threshold_w, 25.0);
        assert_eq!(config.instruments.pyrometer.store_capacity, 64);
        // Untouched sections keep their defaults.
        assert_eq!(config.instruments.laser.rate_hz, 100.0);
    }

    #[test]
    fn env_overrides_reach_multi_word_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("monitor.toml");
        std::fs::write(&path, "").expect("write config");

        std::env::set_var("DED_MONITOR_APPLICATION__LOG_LEVEL", "debug");
        std::env::set_var("DED_MONITOR_SERVER__BIND", "0.0.0.0:9100");
        std::env::set_var("DED_MONITOR_ACQUISITION__HISTORY_CAPACITY", "42");
        let result = Config::load_from(&path);
        std::env::remove_var("DED_MONITOR_APPLICATION__LOG_LEVEL");
        std::env::remove_var("DED_MONITOR_SERVER__BIND");
        std::env::remove_var("DED_MONITOR_ACQUISITION__HISTORY_CAPACITY");

        let config = result.expect("config loads");
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.server.bind, "0.0.0.0:9100");
        assert_eq!(config.acquisition.history_capacity, 42);
    }
}
