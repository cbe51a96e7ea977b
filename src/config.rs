//! Runtime configuration.
//!
//! Settings come from defaults, then an optional YAML file, then `CLOSET_*`
//! environment variables. Everything the rig-specific wiring depends on
//! (actuator mapping, thresholds, timings, serial port) lives here so a new
//! build of the closet only needs a new file.

use crate::accessory::Accessory;
use crate::actuator::{ActuatorMap, CoordinatorConfig};
use crate::presence::PresenceConfig;
use crate::weather::{WeatherMetrics, WeatherThresholds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const ENV_PREFIX: &str = "CLOSET_";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path, or `tcp://host:port` for a network serial bridge.
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSettings {
    pub settle_ms: u64,
    pub startup_settle_ms: u64,
    pub mapping: ActuatorMap,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            settle_ms: 5000,
            startup_settle_ms: 2000,
            mapping: ActuatorMap::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub poll_interval_s: u64,
    pub thresholds: WeatherThresholds,
    /// External fetcher printing a JSON metrics object. When empty,
    /// `static_metrics` is used instead.
    pub source_command: Vec<String>,
    pub static_metrics: WeatherMetrics,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            poll_interval_s: 3600,
            thresholds: WeatherThresholds::default(),
            source_command: Vec::new(),
            static_metrics: WeatherMetrics {
                current_temp: Some("25".to_string()),
                precipitation: Some("20".to_string()),
                uv_index: Some("5".to_string()),
                dust: Some("보통".to_string()),
                humidity: Some("50".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub poll_interval_ms: u64,
    pub detection_distance_cm: f32,
    pub stable_count: u32,
    pub absence_timeout_s: u64,
    /// IIO distance attribute; no sensor when unset.
    pub sensor_path: Option<PathBuf>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            detection_distance_cm: 120.0,
            stable_count: 3,
            absence_timeout_s: 10,
            sensor_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub enabled: bool,
    pub command: Vec<String>,
    pub output_dir: PathBuf,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command: ["libcamera-still", "-n", "-t", "1", "-o", "{path}"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            output_dir: PathBuf::from("captures"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: SerialSettings,
    pub actuator: ActuatorSettings,
    pub weather: WeatherSettings,
    pub presence: PresenceSettings,
    pub camera: CameraSettings,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            actuator: ActuatorSettings::default(),
            weather: WeatherSettings::default(),
            presence: PresenceSettings::default(),
            camera: CameraSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `path` (if given), then process environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        debug!("Loading configuration file: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&content, path)
    }

    pub fn from_yaml_str(content: &str, source_path: &Path) -> ConfigResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })
    }

    /// Apply `CLOSET_*` overrides. Unknown `CLOSET_*` keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "SERIAL_PORT" => self.serial.port = value,
                "SERIAL_BAUDRATE" => self.serial.baud_rate = parse_env(&key, &value)?,
                "SERIAL_TIMEOUT_MS" => self.serial.timeout_ms = parse_env(&key, &value)?,
                "ACTUATOR_SETTLE_MS" => self.actuator.settle_ms = parse_env(&key, &value)?,
                "ACTUATOR_MAP" => self.actuator.mapping = parse_mapping(&key, &value)?,
                "WEATHER_INTERVAL_S" => self.weather.poll_interval_s = parse_env(&key, &value)?,
                "THRESHOLD_PRECIPITATION" => {
                    self.weather.thresholds.precipitation = parse_env(&key, &value)?;
                }
                "THRESHOLD_UV" => self.weather.thresholds.uv_index = parse_env(&key, &value)?,
                "THRESHOLD_COLD_TEMP" => {
                    self.weather.thresholds.cold_temp = parse_env(&key, &value)?;
                }
                "THRESHOLD_DUST_BAD" => {
                    self.weather.thresholds.bad_dust = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect();
                }
                "PRESENCE_DISTANCE_CM" => {
                    self.presence.detection_distance_cm = parse_env(&key, &value)?;
                }
                "PRESENCE_TIMEOUT_S" => self.presence.absence_timeout_s = parse_env(&key, &value)?,
                "SENSOR_PATH" => self.presence.sensor_path = Some(PathBuf::from(value)),
                "CAMERA_ENABLED" => self.camera.enabled = parse_env(&key, &value)?,
                "LOG_LEVEL" => self.log_level = value,
                _ => debug!(key = %key, "ignoring unknown environment override"),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let fail = |message: &str| {
            Err(ConfigError::ValidationFailed {
                message: message.to_string(),
            })
        };

        if self.serial.port.trim().is_empty() {
            return fail("serial.port must not be empty");
        }
        if self.serial.baud_rate == 0 {
            return fail("serial.baud_rate must be positive");
        }
        if self.actuator.mapping.is_empty() {
            return fail("actuator.mapping must map at least one accessory");
        }
        if self.weather.poll_interval_s == 0 {
            return fail("weather.poll_interval_s must be positive");
        }
        if self.presence.poll_interval_ms == 0 {
            return fail("presence.poll_interval_ms must be positive");
        }
        if self.presence.stable_count == 0 {
            return fail("presence.stable_count must be at least 1");
        }
        if self.camera.enabled && self.camera.command.is_empty() {
            return fail("camera.command must not be empty when the camera is enabled");
        }
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            mapping: self.actuator.mapping.clone(),
            settle: Duration::from_millis(self.actuator.settle_ms),
            startup_settle: Duration::from_millis(self.actuator.startup_settle_ms),
            response_timeout: Duration::from_millis(self.serial.timeout_ms),
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            detection_distance_cm: self.presence.detection_distance_cm,
            stable_count: self.presence.stable_count,
            absence_timeout: Duration::from_secs(self.presence.absence_timeout_s),
            poll_interval: Duration::from_millis(self.presence.poll_interval_ms),
        }
    }

    pub fn weather_interval(&self) -> Duration {
        Duration::from_secs(self.weather.poll_interval_s)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `umbrella=1,mask=3` into an actuator table.
fn parse_mapping(key: &str, value: &str) -> ConfigResult<ActuatorMap> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        reason,
    };

    let mut table = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, index) = pair
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected accessory=index, got '{}'", pair)))?;
        let accessory: Accessory = name.parse().map_err(|e| invalid(format!("{}", e)))?;
        let index: u8 = index
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad actuator index in '{}'", pair)))?;
        table.insert(accessory, index);
    }
    ActuatorMap::new(table).map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_from_env_string() {
        let map = parse_mapping("CLOSET_ACTUATOR_MAP", "umbrella=1, sunscreen=3,mask=4").unwrap();
        assert_eq!(map.index_of(Accessory::Umbrella), Some(1));
        assert_eq!(map.index_of(Accessory::SunProtection), Some(3));
        assert_eq!(map.index_of(Accessory::Mask), Some(4));
        assert_eq!(map.index_of(Accessory::Warmth), None);
    }

    #[test]
    fn mapping_rejects_garbage() {
        assert!(parse_mapping("K", "umbrella").is_err());
        assert!(parse_mapping("K", "scarf=2").is_err());
        assert!(parse_mapping("K", "mask=x").is_err());
        assert!(parse_mapping("K", "mask=0").is_err());
    }
}
