//! Modbus RTU power meter reader
//!
//! Protocol Overview:
//! - Format: Modbus RTU over RS-485, function 0x03 (read holding registers)
//! - Default line: 38400 baud, 8E1
//! - Each quantity is a 32-bit float spread over two registers, high word first
//! - Twelve requests per sample, one per quantity (see [`QUANTITIES`])
//!
//! A sample is all-or-nothing: if any of the twelve requests fails, the whole reading
//! fails and the synchronizer skips the tick. After a failure, late bytes from the
//! aborted exchange may still arrive, so the next read starts by draining the port.

use super::{modbus, DeviceKind, DeviceReader};
use crate::error::ReadError;
use crate::measurement::{PowerMeterReading, QUANTITIES, QUANTITY_COUNT};
use crate::serial::{drain_serial_buffer, DynSerial};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Registers per quantity (one f32)
const REGISTERS_PER_QUANTITY: u16 = 2;

/// I/O timeouts a single read can spend: the resync drain, then the request write, the
/// response header and the response body for each quantity.
pub const MAX_TIMEOUTS_PER_READ: u32 = 1 + 3 * QUANTITY_COUNT as u32;

/// Reader for the three-phase power meter.
pub struct PowerMeterReader {
    port: DynSerial,
    unit: u8,
    timeout: Duration,
    /// Set after a failed exchange; the next read drains stale bytes first
    needs_resync: bool,
}

impl PowerMeterReader {
    /// Open the configured serial port.
    ///
    /// # Errors
    /// Returns an error if the port cannot be opened.
    #[cfg(feature = "instrument_serial")]
    pub async fn open(
        config: &crate::config::PowerMeterConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let port = crate::serial::open_serial_async(&config.serial, "power meter").await?;
        tracing::info!(
            port = %config.serial.port,
            unit = config.unit_address,
            "Power meter port opened"
        );
        Ok(Self::with_port(Box::new(port), config.unit_address, io_timeout))
    }

    /// Build a reader over an already open port.
    pub fn with_port(port: DynSerial, unit: u8, timeout: Duration) -> Self {
        Self {
            port,
            unit,
            timeout,
            needs_resync: false,
        }
    }

    /// Read all twelve quantities in table order.
    #[instrument(skip(self), fields(unit = self.unit), err(level = "debug"))]
    pub async fn read_all(&mut self) -> Result<PowerMeterReading, ReadError> {
        if self.needs_resync {
            let discarded = drain_serial_buffer(&mut self.port, self.timeout).await;
            if discarded > 0 {
                debug!(discarded, "Discarded stale power meter bytes");
            }
            self.needs_resync = false;
        }

        let mut values = [0.0; QUANTITY_COUNT];
        for (slot, spec) in values.iter_mut().zip(QUANTITIES.iter()) {
            let registers = match modbus::read_holding_registers(
                &mut self.port,
                self.unit,
                spec.register,
                REGISTERS_PER_QUANTITY,
                self.timeout,
            )
            .await
            {
                Ok(registers) => registers,
                Err(e) => {
                    self.needs_resync = true;
                    return Err(e);
                }
            };
            *slot = f64::from(modbus::registers_to_f32(registers[0], registers[1]));
        }

        Ok(PowerMeterReading::from_values(values))
    }
}

#[async_trait]
impl DeviceReader for PowerMeterReader {
    type Value = PowerMeterReading;

    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerMeter
    }

    async fn read_one(&mut self) -> Result<PowerMeterReading, ReadError> {
        self.read_all().await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        use anyhow::Context;
        self.port
            .shutdown()
            .await
            .context("Failed to close power meter port")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock_serial::{self, MockDeviceHarness};
    use crate::measurement::Quantity;

    const UNIT: u8 = 1;

    fn reader(port: mock_serial::MockSerialPort) -> PowerMeterReader {
        PowerMeterReader::with_port(Box::new(port), UNIT, Duration::from_millis(100))
    }

    /// Answer one request per quantity with `value_of(index)`.
    async fn serve(harness: &mut MockDeviceHarness, count: usize, value_of: impl Fn(usize) -> f32) {
        for (i, spec) in QUANTITIES.iter().take(count).enumerate() {
            let request = modbus::read_holding_registers_request(UNIT, spec.register, 2);
            let response =
                modbus::encode_read_response(UNIT, &modbus::f32_to_registers(value_of(i)));
            harness.expect_and_respond(&request, &response).await;
        }
    }

    #[tokio::test]
    async fn reads_all_quantities_in_table_order() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            serve(&mut harness, QUANTITY_COUNT, |i| i as f32 + 0.5).await;
            harness
        });

        let reading = reader.read_one().await.unwrap();
        device.await.unwrap();

        assert_eq!(reading.get(Quantity::VoltageL1L2), 0.5);
        assert_eq!(reading.active_power_kw(), 6.5);
        assert_eq!(reading.get(Quantity::CurrentI3), 11.5);
    }

    #[tokio::test]
    async fn failure_mid_sample_fails_the_whole_reading() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let device = tokio::spawn(async move {
            // Answer the first five quantities, then go silent
            serve(&mut harness, 5, |_| 230.0).await;
            let sixth = modbus::read_holding_registers_request(UNIT, QUANTITIES[5].register, 2);
            harness.expect_write(&sixth).await;
            harness
        });

        let err = reader.read_one().await.unwrap_err();
        assert!(matches!(err, ReadError::Timeout(_)));
        assert!(reader.needs_resync);
        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn crc_error_fails_and_next_read_resyncs() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let first = modbus::read_holding_registers_request(UNIT, QUANTITIES[0].register, 2);
        let mut corrupted = modbus::encode_read_response(UNIT, &modbus::f32_to_registers(1.0));
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x55;

        let device = tokio::spawn(async move {
            harness.expect_and_respond(&first, &corrupted).await;
            harness
        });
        let err = reader.read_one().await.unwrap_err();
        assert!(matches!(err, ReadError::CrcMismatch { .. }));
        let mut harness = device.await.unwrap();

        // Stale garbage from the aborted exchange is drained before the next sample
        harness.send_response(&[0xDE, 0xAD]).unwrap();
        let device = tokio::spawn(async move {
            serve(&mut harness, QUANTITY_COUNT, |_| 2.0).await;
            harness
        });
        let reading = reader.read_one().await.unwrap();
        assert_eq!(reading.active_power_kw(), 2.0);
        assert!(!reader.needs_resync);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn exception_response_fails_the_reading() {
        let (port, mut harness) = mock_serial::new();
        let mut reader = reader(port);

        let first = modbus::read_holding_registers_request(UNIT, QUANTITIES[0].register, 2);
        let device = tokio::spawn(async move {
            harness
                .expect_and_respond(&first, &modbus::encode_exception(UNIT, 0x02))
                .await;
            harness
        });

        let err = reader.read_one().await.unwrap_err();
        assert!(matches!(err, ReadError::Exception { code: 0x02, .. }));
        device.await.unwrap();
    }
}
