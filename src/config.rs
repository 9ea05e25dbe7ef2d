// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Cooling thresholds, fan models, fan controllers and the sensor simulator
//! are read from TOML. Default path: `/etc/coolingd/config.toml`

use crate::cooling::Thresholds;
use crate::error::{CoolingError, Result};
use crate::model::{self, FanModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/coolingd/config.toml";

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/coolingd.sock";

/// Default cooling and bank tick interval in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_TOO_LOUD_MINUTES: u32 = 5;

pub const DEFAULT_MAX_FAN_CONTROLLERS: usize = 8;

/// One year.
pub const MAX_RETENTION_MINUTES: u64 = 525_600;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub cooling: CoolingConfig,

    #[serde(default)]
    pub fan_bank: FanBankConfig,

    /// Known fan models, referenced by name from `fan_controllers`.
    #[serde(default = "default_fan_models")]
    pub fan_models: Vec<FanModel>,

    /// One entry per physical fan.
    #[serde(default = "default_fan_controllers")]
    pub fan_controllers: Vec<FanControllerConfig>,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path for the Unix domain socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Default log filter; `RUST_LOG` still wins.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Buffer depth of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            log_level: default_log_level(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Cooling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoolingConfig {
    #[serde(default = "default_temp_low")]
    pub temp_low: f64,

    #[serde(default = "default_temp_high")]
    pub temp_high: f64,

    #[serde(default = "default_fan_speed_min")]
    pub fan_speed_min: u8,

    #[serde(default = "default_fan_speed_max")]
    pub fan_speed_max: u8,

    #[serde(default = "default_interval")]
    pub update_interval_ms: u64,

    /// Readings older than this are discarded.
    #[serde(default = "default_retention_minutes")]
    pub history_retention_minutes: u64,

    /// Population standard deviation (C) above which a controller is skipped.
    #[serde(default = "default_std_dev_threshold")]
    pub std_dev_threshold: f64,
}

impl CoolingConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            temp_low: self.temp_low,
            temp_high: self.temp_high,
            fan_speed_min: self.fan_speed_min,
            fan_speed_max: self.fan_speed_max,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        let minutes = self.history_retention_minutes.min(MAX_RETENTION_MINUTES);
        chrono::Duration::minutes(minutes as i64)
    }
}

impl Default for CoolingConfig {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            temp_low: thresholds.temp_low,
            temp_high: thresholds.temp_high,
            fan_speed_min: thresholds.fan_speed_min,
            fan_speed_max: thresholds.fan_speed_max,
            update_interval_ms: DEFAULT_INTERVAL_MS,
            history_retention_minutes: crate::history::DEFAULT_RETENTION_MINUTES,
            std_dev_threshold: crate::history::DEFAULT_STD_DEV_THRESHOLD,
        }
    }
}

/// Fan bank settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanBankConfig {
    /// Sustained-noise check interval.
    #[serde(default = "default_interval")]
    pub poll_interval_ms: u64,

    /// Per-device register poll interval.
    #[serde(default = "default_interval")]
    pub device_poll_interval_ms: u64,

    /// How long the fleet may stay loud before the alarm fires.
    #[serde(default = "default_too_loud_minutes")]
    pub too_loud_minutes: u32,

    /// Controllers past this count are ignored.
    #[serde(default = "default_max_fan_controllers")]
    pub max_fan_controllers: usize,
}

impl Default for FanBankConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_INTERVAL_MS,
            device_poll_interval_ms: DEFAULT_INTERVAL_MS,
            too_loud_minutes: DEFAULT_TOO_LOUD_MINUTES,
            max_fan_controllers: DEFAULT_MAX_FAN_CONTROLLERS,
        }
    }
}

/// One physical fan and the model it is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanControllerConfig {
    pub name: String,
    pub model: String,
    pub i2c_address: u8,
}

/// Synthetic temperature source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_start_temp")]
    pub start_temp: f64,

    #[serde(default = "default_end_temp")]
    pub end_temp: f64,

    /// Degrees added or removed per interval.
    #[serde(default = "default_step")]
    pub step: f64,

    /// Half-width of the uniform noise added to noisy sensors.
    #[serde(default = "default_noise_amplitude")]
    pub noise_amplitude: f64,

    #[serde(default = "default_simulated_controllers")]
    pub controllers: Vec<SimulatedControllerConfig>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_INTERVAL_MS,
            start_temp: default_start_temp(),
            end_temp: default_end_temp(),
            step: default_step(),
            noise_amplitude: default_noise_amplitude(),
            controllers: default_simulated_controllers(),
        }
    }
}

/// A simulated controller with sensors numbered `1..=sensors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedControllerConfig {
    pub name: String,
    pub sensors: u32,
    #[serde(default)]
    pub bad_sensors: Vec<u32>,
    #[serde(default)]
    pub noisy_sensors: Vec<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            cooling: CoolingConfig::default(),
            fan_bank: FanBankConfig::default(),
            fan_models: default_fan_models(),
            fan_controllers: default_fan_controllers(),
            simulator: SimulatorConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Reject configurations the components would refuse or misbehave on.
    pub fn validate(&self) -> Result<()> {
        self.cooling.thresholds().validate()?;
        if self.cooling.std_dev_threshold.is_nan() || self.cooling.std_dev_threshold <= 0.0 {
            return Err(invalid(format!(
                "std_dev_threshold must be positive, got {}",
                self.cooling.std_dev_threshold
            )));
        }
        if self.cooling.history_retention_minutes == 0
            || self.cooling.history_retention_minutes > MAX_RETENTION_MINUTES
        {
            return Err(invalid(format!(
                "history_retention_minutes must be within 1-{MAX_RETENTION_MINUTES}"
            )));
        }
        if self.cooling.update_interval_ms == 0
            || self.fan_bank.poll_interval_ms == 0
            || self.fan_bank.device_poll_interval_ms == 0
        {
            return Err(invalid("intervals must be non-zero".to_string()));
        }

        let mut models = BTreeSet::new();
        for model in &self.fan_models {
            model
                .validate()
                .map_err(|e| invalid(format!("fan model {}: {e}", model.name)))?;
            if !models.insert(model.name.as_str()) {
                return Err(invalid(format!("duplicate fan model {}", model.name)));
            }
        }

        let mut fans = BTreeSet::new();
        for fan in &self.fan_controllers {
            if !models.contains(fan.model.as_str()) {
                return Err(invalid(format!(
                    "fan {} uses unknown model {}",
                    fan.name, fan.model
                )));
            }
            if !fans.insert(fan.name.as_str()) {
                return Err(invalid(format!("duplicate fan controller {}", fan.name)));
            }
        }

        let sim = &self.simulator;
        if sim.enabled {
            let finite = [sim.start_temp, sim.end_temp, sim.step, sim.noise_amplitude]
                .iter()
                .all(|v| v.is_finite());
            if !finite {
                return Err(invalid(
                    "simulator temperatures, step and noise amplitude must be finite".to_string(),
                ));
            }
            if sim.interval_ms == 0 || sim.step <= 0.0 || sim.start_temp > sim.end_temp {
                return Err(invalid(
                    "simulator needs step > 0, interval_ms > 0 and start_temp <= end_temp"
                        .to_string(),
                ));
            }
            if sim.noise_amplitude < 0.0 {
                return Err(invalid(format!(
                    "simulator noise amplitude {} must not be negative",
                    sim.noise_amplitude
                )));
            }
            for controller in &sim.controllers {
                let out_of_range = controller
                    .bad_sensors
                    .iter()
                    .chain(&controller.noisy_sensors)
                    .find(|id| **id == 0 || **id > controller.sensors);
                if let Some(id) = out_of_range {
                    return Err(invalid(format!(
                        "simulated controller {} has no sensor {id}",
                        controller.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> CoolingError {
    CoolingError::InvalidInput(message)
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> io::Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse config: {e}"),
        )
    })?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to a TOML file, creating parent directories if needed.
pub fn save_config(path: &Path, config: &Config) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize config: {e}"),
        )
    })?;

    fs::write(path, contents)?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    crate::bus::DEFAULT_EVENT_CAPACITY
}

fn default_temp_low() -> f64 {
    Thresholds::default().temp_low
}

fn default_temp_high() -> f64 {
    Thresholds::default().temp_high
}

fn default_fan_speed_min() -> u8 {
    Thresholds::default().fan_speed_min
}

fn default_fan_speed_max() -> u8 {
    Thresholds::default().fan_speed_max
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_retention_minutes() -> u64 {
    crate::history::DEFAULT_RETENTION_MINUTES
}

fn default_std_dev_threshold() -> f64 {
    crate::history::DEFAULT_STD_DEV_THRESHOLD
}

fn default_too_loud_minutes() -> u32 {
    DEFAULT_TOO_LOUD_MINUTES
}

fn default_max_fan_controllers() -> usize {
    DEFAULT_MAX_FAN_CONTROLLERS
}

fn default_true() -> bool {
    true
}

fn default_start_temp() -> f64 {
    25.0
}

fn default_end_temp() -> f64 {
    85.0
}

fn default_step() -> f64 {
    0.5
}

fn default_noise_amplitude() -> f64 {
    50.0
}

fn default_fan_models() -> Vec<FanModel> {
    vec![model::default_blower_model(), model::default_axial_model()]
}

fn default_fan_controllers() -> Vec<FanControllerConfig> {
    [
        ("Fan1", "Blower-A", 0x2c),
        ("Fan2", "Blower-A", 0x2d),
        ("Fan3", "Axial-B", 0x2e),
        ("Fan4", "Axial-B", 0x2f),
    ]
    .into_iter()
    .map(|(name, model, i2c_address)| FanControllerConfig {
        name: name.to_string(),
        model: model.to_string(),
        i2c_address,
    })
    .collect()
}

fn default_simulated_controllers() -> Vec<SimulatedControllerConfig> {
    ["MCU1", "MCU2"]
        .into_iter()
        .map(|name| SimulatedControllerConfig {
            name: name.to_string(),
            sensors: 3,
            bad_sensors: Vec::new(),
            noisy_sensors: Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fan_models.len(), 2);
        assert_eq!(config.fan_controllers.len(), 4);
        assert_eq!(config.daemon.socket_path, DEFAULT_SOCKET_PATH);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cooling.temp_low, 25.0);
        assert_eq!(config.fan_bank.too_loud_minutes, 5);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.cooling.temp_high = 80.0;
        config.fan_controllers.truncate(1);
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.cooling.temp_high, 80.0);
        assert_eq!(loaded.fan_controllers, config.fan_controllers);
        assert_eq!(loaded.fan_models[1].noise_profile, config.fan_models[1].noise_profile);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[cooling]
temp_low = 30.0

[fan_bank]
too_loud_minutes = 2
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.cooling.temp_low, 30.0);
        assert_eq!(config.cooling.temp_high, 75.0);
        assert_eq!(config.fan_bank.too_loud_minutes, 2);
        assert_eq!(config.fan_controllers.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cooling\ntemp_low = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.cooling.temp_low = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_model() {
        let mut config = Config::default();
        config.fan_controllers[0].model = "Nope".to_string();
        assert!(matches!(config.validate(), Err(CoolingError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_fan() {
        let mut config = Config::default();
        config.fan_controllers[1].name = "Fan1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_simulated_sensor() {
        let mut config = Config::default();
        config.simulator.controllers[0].bad_sensors = vec![4];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_simulator_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        for line in [
            "noise_amplitude = inf",
            "start_temp = nan",
            "end_temp = nan",
            "step = inf",
        ] {
            fs::write(&path, format!("[simulator]\n{line}\n")).unwrap();
            let config = load_config(&path).unwrap();
            assert!(
                matches!(config.validate(), Err(CoolingError::InvalidInput(_))),
                "{line} accepted"
            );
        }
    }

    #[test]
    fn test_validate_rejects_negative_noise_amplitude() {
        let mut config = Config::default();
        config.simulator.noise_amplitude = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_config_path() {
        assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(
            resolve_config_path(Some("/tmp/x.toml")),
            PathBuf::from("/tmp/x.toml")
        );
    }
}
