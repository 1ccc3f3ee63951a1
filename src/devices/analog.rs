//! ASCII analog input module reader
//!
//! Protocol Overview:
//! - Format: ASCII command/response, CR terminated both ways
//! - Default line: 9600 baud, 8N1
//! - Query: `#02\r` (read channel 2); reply `>+01.2345\r`
//!
//! The channel carries a 1-5 V temperature transmitter spanning 0-100 °C. An empty reply
//! reads as 1.0 V (0 °C). Any failed exchange yields [`FALLBACK_TEMPERATURE_C`]; this
//! reader never reports a read error to its poll loop.

use super::{DeviceKind, DeviceReader};
use crate::error::ReadError;
use crate::serial::{drain_serial_buffer, DynSerial};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

/// Temperature reported when the module cannot be read.
pub const FALLBACK_TEMPERATURE_C: f64 = 0.0;

/// Voltage assumed for an empty reply.
const EMPTY_REPLY_VOLTAGE: f64 = 1.0;

/// Reader for the analog input module.
pub struct AnalogReader {
    port: BufReader<DynSerial>,
    /// Query without its terminator
    command: String,
    timeout: Duration,
    needs_resync: bool,
}

impl AnalogReader {
    /// Open the configured serial port.
    ///
    /// # Errors
    /// Returns an error if the port cannot be opened.
    #[cfg(feature = "instrument_serial")]
    pub async fn open(
        config: &crate::config::AnalogModuleConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let port = crate::serial::open_serial_async(&config.serial, "analog module").await?;
        tracing::info!(port = %config.serial.port, "Analog module port opened");
        Ok(Self::with_port(Box::new(port), &config.command, io_timeout))
    }

    /// Build a reader over an already open port; `command` is sent without its CR.
    pub fn with_port(port: DynSerial, command: &str, timeout: Duration) -> Self {
        Self {
            port: BufReader::new(port),
            command: command.trim_end_matches('\r').to_string(),
            timeout,
            needs_resync: false,
        }
    }

    /// Send the query and parse the voltage from the reply.
    #[instrument(skip(self), fields(command = %self.command), err(level = "debug"))]
    pub async fn query_voltage(&mut self) -> Result<f64, ReadError> {
        // Replies left over from an earlier query must not answer this one
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);
        if self.needs_resync {
            drain_serial_buffer(self.port.get_mut(), self.timeout).await;
            self.needs_resync = false;
        }

        let result = self.exchange().await;
        if result.is_err() {
            self.needs_resync = true;
        }
        parse_voltage(&result?)
    }

    async fn exchange(&mut self) -> Result<String, ReadError> {
        let request = format!("{}\r", self.command);
        tokio::time::timeout(self.timeout, self.port.get_mut().write_all(request.as_bytes()))
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))??;

        let mut reply = Vec::new();
        let n = tokio::time::timeout(self.timeout, self.port.read_until(b'\r', &mut reply))
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))??;
        if n == 0 {
            return Err(ReadError::UnexpectedEof);
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

/// Parse the reply voltage: the signed decimal starting at the last sign character.
///
/// `>+02.5000` parses as 2.5, `>-00.1000` as -0.1. An empty reply is 1.0 V.
pub fn parse_voltage(reply: &str) -> Result<f64, ReadError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Ok(EMPTY_REPLY_VOLTAGE);
    }

    let field = match trimmed.rfind(|c: char| c == '+' || c == '-') {
        Some(idx) => &trimmed[idx..],
        None => trimmed.trim_start_matches('>'),
    };
    field
        .trim()
        .parse::<f64>()
        .map_err(|_| ReadError::Parse(trimmed.to_string()))
}

/// 1-5 V maps linearly onto 0-100 °C.
pub fn voltage_to_temperature(voltage: f64) -> f64 {
    (voltage - 1.0) / 4.0 * 100.0
}

#[async_trait]
impl DeviceReader for AnalogReader {
    type Value = f64;

    fn kind(&self) -> DeviceKind {
        DeviceKind::AnalogModule
    }

    async fn read_one(&mut self) -> Result<f64, ReadError> {
        match self.query_voltage().await {
            Ok(voltage) => Ok(voltage_to_temperature(voltage)),
            Err(e) => {
                debug!(error = %e, "Analog module read failed, using fallback temperature");
                Ok(FALLBACK_TEMPERATURE_C)
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        use anyhow::Context;
        self.port
            .get_mut()
            .shutdown()
            .await
            .context("Failed to close analog module port")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock_serial;

    fn reader(port: mock_serial::MockSerialPort) -> AnalogReader {
        AnalogReader::with_port(Box::new(port), "#02", Duration::from_millis(100))
    }

    #[test]
    fn parses_signed_fields() {
        assert_eq!(parse_voltage(">+02.5000\r").unwrap(), 2.5);
        assert_eq!(parse_voltage(">-00.1000").unwrap(), -0.1);
        assert_eq!(parse_voltage("+05.0000").unwrap(), 5.0);
        assert_eq!(parse_voltage(">3.0").unwrap(), 3.0);
        assert_eq!(parse_voltage("\r").unwrap(), 1.0);
        assert!(matches!(parse_voltage(">+abc"), Err(ReadError::Parse(_))));
    }

    #[test]
    fn converts_voltage_span() {
        assert_eq!(voltage_to_temperature(1.0), 0.0);
        assert_eq!(voltage_to_temperature(3.0), 50.0);
        assert_eq!(voltage_to_temperature(5.0), 100.0);
    }

    #[tokio::test]
    async fn reads_temperature() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            harness.expect_and_respond(b"#02\r", b">+03.0000\r").await;
            harness
        });

        assert_eq!(reader.read_one().await.unwrap(), 50.0);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn empty_reply_is_zero_degrees() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            harness.expect_and_respond(b"#02\r", b"\r").await;
            harness
        });

        assert_eq!(reader.read_one().await.unwrap(), 0.0);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn silent_module_falls_back() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            harness.expect_write(b"#02\r").await;
            harness
        });

        assert_eq!(reader.read_one().await.unwrap(), FALLBACK_TEMPERATURE_C);
        assert!(reader.needs_resync);
        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn garbage_reply_falls_back() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            harness.expect_and_respond(b"#02\r", b"?02\r").await;
            harness
        });

        assert_eq!(reader.read_one().await.unwrap(), FALLBACK_TEMPERATURE_C);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn late_reply_is_discarded_before_next_query() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            harness.expect_write(b"#02\r").await;
            harness
        });
        assert_eq!(reader.read_one().await.unwrap(), FALLBACK_TEMPERATURE_C);
        let mut harness = device.await.unwrap();

        // The reply to the timed-out query arrives late
        harness.send_response(b">+05.0000\r").unwrap();
        let device = tokio::spawn(async move {
            harness.expect_and_respond(b"#02\r", b">+02.0000\r").await;
            harness
        });

        assert_eq!(reader.read_one().await.unwrap(), 25.0);
        device.await.unwrap();
    }
}
