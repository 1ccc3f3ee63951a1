//! Device readers
//!
//! Each acquisition channel is served by one [`DeviceReader`]:
//!
//! - [`power_meter::PowerMeterReader`]: Modbus RTU power meter, twelve quantities per read.
//!   A read either yields all twelve values or fails as a unit.
//! - [`analog::AnalogReader`]: ASCII command/response analog module (1-5 V temperature
//!   transmitter). Failed reads yield a fixed fallback temperature.
//! - [`distance::DistanceReader`]: line-streaming distance sensor. Failed reads keep the
//!   last valid distance.
//!
//! Readers are created by a [`DeviceConnector`]. Connecting is the fallible step that
//! decides whether a session can start; after that, reads are transient and each reader
//! applies its own failure policy.

use crate::config::{AnalogModuleConfig, DistanceSensorConfig, PowerMeterConfig};
use crate::error::ReadError;
use crate::measurement::PowerMeterReading;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub mod analog;
pub mod distance;
pub mod mock;
pub mod mock_serial;
pub mod modbus;
pub mod power_meter;

pub use analog::AnalogReader;
pub use distance::DistanceReader;
pub use power_meter::PowerMeterReader;

/// The three acquisition channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Modbus RTU power meter
    PowerMeter,
    /// Analog module (temperature)
    AnalogModule,
    /// Distance sensor
    DistanceSensor,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceKind::PowerMeter => "power meter",
            DeviceKind::AnalogModule => "analog module",
            DeviceKind::DistanceSensor => "distance sensor",
        };
        write!(f, "{}", label)
    }
}

/// Capability: produce one reading per poll.
///
/// # Contract
/// - `read_one` is bounded by the reader's I/O timeout; it never blocks indefinitely.
/// - An `Err` means "no reading this poll". Readers whose channel has a fallback policy
///   never return `Err`.
/// - `close` releases the device handle. It is called exactly once, after the poll loop
///   has exited.
#[async_trait]
pub trait DeviceReader: Send {
    /// What one poll yields.
    type Value: Clone + Send + Sync + 'static;

    /// Channel this reader serves.
    fn kind(&self) -> DeviceKind;

    /// Poll the device once.
    async fn read_one(&mut self) -> Result<Self::Value, ReadError>;

    /// Release the port.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Boxed reader for one channel.
pub type BoxedReader<T> = Box<dyn DeviceReader<Value = T>>;

/// Opens the three devices.
///
/// The session manager calls these in order (power meter, analog module, distance
/// sensor) and closes the readers already opened if a later one fails.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Open the power meter.
    async fn connect_power_meter(
        &self,
        config: &PowerMeterConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<PowerMeterReading>>;

    /// Open the analog module.
    async fn connect_analog_module(
        &self,
        config: &AnalogModuleConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>>;

    /// Open the distance sensor.
    async fn connect_distance_sensor(
        &self,
        config: &DistanceSensorConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>>;
}

/// Connector for real hardware on serial ports.
#[cfg(feature = "instrument_serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl DeviceConnector for SerialConnector {
    async fn connect_power_meter(
        &self,
        config: &PowerMeterConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<PowerMeterReading>> {
        let reader = PowerMeterReader::open(config, io_timeout).await?;
        Ok(Box::new(reader))
    }

    async fn connect_analog_module(
        &self,
        config: &AnalogModuleConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>> {
        let reader = AnalogReader::open(config, io_timeout).await?;
        Ok(Box::new(reader))
    }

    async fn connect_distance_sensor(
        &self,
        config: &DistanceSensorConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>> {
        let reader = DistanceReader::open(config, io_timeout).await?;
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_labels() {
        assert_eq!(DeviceKind::PowerMeter.to_string(), "power meter");
        assert_eq!(DeviceKind::AnalogModule.to_string(), "analog module");
        assert_eq!(DeviceKind::DistanceSensor.to_string(), "distance sensor");
    }
}
