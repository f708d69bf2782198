//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `station.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - PollingConfig: How often the sensors are sampled.
//!     - I2cConfig: Which /dev/i2c-N the sensors hang off.
//!     - SensorsConfig: Addresses, toggles and retry budgets per sensor.
//!     - HttpConfig / WeatherConfig / StorageConfig / LoggingConfig.
//!
//! every field has a default, so a partial file is enough.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::drivers::aht20::RetryPolicy;
use crate::drivers::{aht20, bh1750, bmp280};

pub const CONFIG_ENV: &str = "WEATHER_STATION_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StationConfig {
    pub polling: PollingConfig,
    pub i2c: I2cConfig,
    pub sensors: SensorsConfig,
    pub http: HttpConfig,
    pub weather: WeatherConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub sensor_interval_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { sensor_interval_seconds: 60 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct I2cConfig {
    /// N in /dev/i2c-N
    pub bus: u8,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self { bus: 1 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SensorsConfig {
    pub aht20: Aht20Config,
    pub bmp280: Bmp280Config,
    pub bh1750: Bh1750Config,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Aht20Config {
    pub enabled: bool,
    #[serde(deserialize_with = "address")]
    pub address: u8,
    /// whole-operation attempts
    #[serde(deserialize_with = "at_least_one")]
    pub attempts: u8,
    /// frame polls per trigger
    #[serde(deserialize_with = "at_least_one")]
    pub poll_attempts: u8,
}

impl Aht20Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            poll_attempts: self.poll_attempts,
        }
    }
}

impl Default for Aht20Config {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            enabled: true,
            address: aht20::ADDRESS,
            attempts: policy.attempts,
            poll_attempts: policy.poll_attempts,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Bmp280Config {
    pub enabled: bool,
    #[serde(deserialize_with = "address")]
    pub address: u8,
    /// reference pressure for the altitude, in Pa
    pub sea_level_pa: f32,
}

impl Default for Bmp280Config {
    fn default() -> Self {
        Self {
            enabled: true,
            address: bmp280::ADDRESS,
            sea_level_pa: bmp280::SEA_LEVEL_PA,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Bh1750Config {
    pub enabled: bool,
    #[serde(deserialize_with = "address")]
    pub address: u8,
}

impl Default for Bh1750Config {
    fn default() -> Self {
        Self {
            enabled: true,
            address: bh1750::ADDRESS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WeatherConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub token: String,
    pub longitude: f64,
    pub latitude: f64,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.caiyunapp.com/v2.5".to_string(),
            token: String::new(),
            longitude: 0.0,
            latitude: 0.0,
            interval_seconds: 15 * 60,
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("sensor.db") }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

/// Accepts `0x38`, `"0x38"` and `"56"`.
fn address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addr {
        Int(u8),
        Text(String),
    }

    let parsed = match Addr::deserialize(deserializer)? {
        Addr::Int(n) => n,
        Addr::Text(s) => {
            let res = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => s.parse(),
            };
            res.map_err(|e| serde::de::Error::custom(format!("bad i2c address {s:?}: {e}")))?
        }
    };

    if parsed > 0x7F {
        return Err(serde::de::Error::custom(format!(
            "i2c address 0x{parsed:02X} is not a 7-bit address"
        )));
    }
    Ok(parsed)
}

/// A zero retry budget would fail without ever talking to the sensor.
fn at_least_one<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let n = u8::deserialize(deserializer)?;
    if n == 0 {
        return Err(serde::de::Error::custom("attempt budget must be at least 1"));
    }
    Ok(n)
}

impl StationConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load with default fallback
    ///
    /// an explicitly named file (`WEATHER_STATION_CONFIG`) must load, the
    /// well-known locations are only tried.
    pub fn load_or_default() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let config = Self::load(&path)?;
            tracing::info!("[CONFIG] Loaded from {}", path);
            return Ok(config);
        }

        let paths = [
            PathBuf::from("config").join("station.toml"),
            PathBuf::from("..").join("config").join("station.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!("[CONFIG] Loaded from {}", path.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("[CONFIG] Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        tracing::warn!("[CONFIG] No config file found - using defaults");
        Ok(Self::default())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        let on = |enabled: bool| if enabled { "on" } else { "off" };
        tracing::info!(
            "i2c bus {} | aht20 {} @0x{:02X} ({}x{} attempts) | bmp280 {} @0x{:02X} | bh1750 {} @0x{:02X}",
            self.i2c.bus,
            on(self.sensors.aht20.enabled),
            self.sensors.aht20.address,
            self.sensors.aht20.attempts,
            self.sensors.aht20.poll_attempts,
            on(self.sensors.bmp280.enabled),
            self.sensors.bmp280.address,
            on(self.sensors.bh1750.enabled),
            self.sensors.bh1750.address,
        );
        tracing::info!(
            "sample every {}s | weather {} (every {}s) | http {} | db {}",
            self.polling.sensor_interval_seconds,
            on(self.weather.enabled),
            self.weather.interval_seconds,
            self.http.bind,
            self.storage.path.display(),
        );
    }
}
