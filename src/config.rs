//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/default.toml` (base configuration)
//! 2. Environment variables prefixed with `SAWMILL_DAQ_`, nested keys separated by `__`
//!    (e.g. `SAWMILL_DAQ_DEVICES__POWER_METER__PORT=/dev/ttyUSB1`)
//!
//! # Example
//! ```no_run
//! use sawmill_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Sampling every {} ms", settings.acquisition.sample_period_ms);
//! # Ok::<(), sawmill_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sampling and timeout settings shared by readers and synchronizer
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Where session files are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Tariff table used by report collaborators
    #[serde(default)]
    pub tariffs: TariffConfig,
    /// Per-device serial settings
    #[serde(default)]
    pub devices: DevicesConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Sawmill DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Acquisition timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Poll period of every device loop and tick period of the synchronizer
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,
    /// Bound on every blocking device I/O call
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: default_sample_period_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl AcquisitionConfig {
    /// Period of the poll loops and the synchronizer.
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    /// Bound on every single device I/O call.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Upper bound between clearing the running flag and a reader loop exiting.
    ///
    /// A loop is either waiting for its next poll (at most one period) or inside a device
    /// read. The slowest read is the power meter's, see
    /// [`MAX_TIMEOUTS_PER_READ`](crate::devices::power_meter::MAX_TIMEOUTS_PER_READ).
    pub fn shutdown_latency(&self) -> Duration {
        self.sample_period()
            + self.io_timeout() * crate::devices::power_meter::MAX_TIMEOUTS_PER_READ
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for session CSV files
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Tariff table (currency per kWh)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    /// Tariff applied when none is requested explicitly
    pub default: String,
    /// Tariff name -> rate
    pub rates: BTreeMap<String, f64>,
}

impl Default for TariffConfig {
    fn default() -> Self {
        let rates = [
            ("BT2", 170.88),
            ("BT3", 170.88),
            ("BT4.1", 170.64),
            ("BT4.2", 170.64),
            ("BT4.3", 170.64),
            ("AT2", 166.44),
            ("AT3", 166.44),
            ("AT4.1/2/3", 166.44),
        ]
        .into_iter()
        .map(|(name, rate)| (name.to_string(), rate))
        .collect();

        Self {
            default: "BT2".to_string(),
            rates,
        }
    }
}

impl TariffConfig {
    /// Rate for `name`, or for the default tariff when `name` is `None`.
    pub fn rate(&self, name: Option<&str>) -> Option<f64> {
        self.rates.get(name.unwrap_or(&self.default)).copied()
    }
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Line settings shared by all three devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Line speed in bits per second
    pub baud_rate: u32,
    /// Parity bit
    #[serde(default = "default_parity")]
    pub parity: Parity,
    /// 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// 5 to 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
}

impl SerialConfig {
    fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            data_bits: default_data_bits(),
        }
    }
}

/// Modbus RTU power meter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerMeterConfig {
    /// Port settings
    #[serde(flatten)]
    pub serial: SerialConfig,
    /// Modbus slave/unit address
    pub unit_address: u8,
}

/// ASCII command/response analog input module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogModuleConfig {
    /// Port settings
    #[serde(flatten)]
    pub serial: SerialConfig,
    /// Query sent every poll, without the trailing CR
    #[serde(default = "default_analog_command")]
    pub command: String,
}

/// Line-streaming distance sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceSensorConfig {
    /// Port settings
    #[serde(flatten)]
    pub serial: SerialConfig,
}

/// The three acquisition devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Modbus RTU power meter
    pub power_meter: PowerMeterConfig,
    /// Temperature input module
    pub analog_module: AnalogModuleConfig,
    /// Distance sensor
    pub distance_sensor: DistanceSensorConfig,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        let mut power_meter = SerialConfig::new("COM1", 38400);
        power_meter.parity = Parity::Even;

        Self {
            power_meter: PowerMeterConfig {
                serial: power_meter,
                unit_address: 1,
            },
            analog_module: AnalogModuleConfig {
                serial: SerialConfig::new("COM6", 9600),
                command: default_analog_command(),
            },
            distance_sensor: DistanceSensorConfig {
                serial: SerialConfig::new("COM2", 115200),
            },
        }
    }
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_sample_period_ms() -> u64 {
    200
}

fn default_io_timeout_ms() -> u64 {
    100
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

fn default_analog_command() -> String {
    "#02".to_string()
}

impl Settings {
    /// Load configuration from `config/default.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// Missing keys fall back to the built-in defaults; a missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SAWMILL_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.acquisition.sample_period_ms == 0 {
            return Err(DaqError::Configuration(
                "sample_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.acquisition.io_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "io_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for (device, serial) in [
            ("power_meter", &self.devices.power_meter.serial),
            ("analog_module", &self.devices.analog_module.serial),
            ("distance_sensor", &self.devices.distance_sensor.serial),
        ] {
            validate_serial(device, serial)?;
        }

        if self.devices.power_meter.unit_address == 0 || self.devices.power_meter.unit_address > 247
        {
            return Err(DaqError::Configuration(format!(
                "Invalid Modbus unit address {}. Must be 1-247",
                self.devices.power_meter.unit_address
            )));
        }

        if self.devices.analog_module.command.trim().is_empty() {
            return Err(DaqError::Configuration(
                "analog_module.command must not be empty".to_string(),
            ));
        }

        if !self.tariffs.rates.contains_key(&self.tariffs.default) {
            return Err(DaqError::Configuration(format!(
                "Default tariff '{}' is not in the tariff table",
                self.tariffs.default
            )));
        }
        if let Some((name, rate)) = self.tariffs.rates.iter().find(|(_, rate)| **rate < 0.0) {
            return Err(DaqError::Configuration(format!(
                "Tariff '{}' has a negative rate {}",
                name, rate
            )));
        }

        Ok(())
    }
}

fn validate_serial(device: &str, serial: &SerialConfig) -> AppResult<()> {
    if serial.port.trim().is_empty() {
        return Err(DaqError::Configuration(format!(
            "{device}: port must not be empty"
        )));
    }
    if serial.baud_rate == 0 {
        return Err(DaqError::Configuration(format!(
            "{device}: baud_rate must be greater than 0"
        )));
    }
    if !(5..=8).contains(&serial.data_bits) {
        return Err(DaqError::Configuration(format!(
            "{device}: data_bits must be 5-8, got {}",
            serial.data_bits
        )));
    }
    if !(1..=2).contains(&serial.stop_bits) {
        return Err(DaqError::Configuration(format!(
            "{device}: stop_bits must be 1 or 2, got {}",
            serial.stop_bits
        )));
    }
    Ok(())
}
