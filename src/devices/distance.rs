//! Line-streaming distance sensor reader
//!
//! Protocol Overview:
//! - Format: the sensor streams one reading per line, unsolicited
//! - Default line: 115200 baud, 8N1
//! - Line: integer millimetres, optionally padded with whitespace (`" 1532\r\n"`)
//!
//! Each poll drains whatever arrived since the previous poll, bounded by the I/O timeout,
//! and returns once the input goes quiet after a valid line. The last valid line wins. A partial trailing line is kept for the next poll. When a
//! poll yields no valid line, the previous distance is reported again (initially 0.0).

use super::{DeviceKind, DeviceReader};
use crate::error::ReadError;
use crate::serial::DynSerial;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

/// Pending bytes without a newline beyond this are dropped.
const MAX_PENDING: usize = 4096;

/// Silence after a valid line that ends a poll.
pub const IDLE_GAP: Duration = Duration::from_millis(5);

/// One reading per line: integer millimetres
#[allow(clippy::expect_used)]
static READING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*$").expect("Invalid distance line regex"));

/// Parse one line into millimetres, if it is a valid reading.
pub fn parse_line(line: &str) -> Option<f64> {
    READING_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Reader for the distance sensor.
pub struct DistanceReader {
    port: DynSerial,
    window: Duration,
    /// Bytes received after the last newline
    pending: Vec<u8>,
    last_mm: f64,
}

impl DistanceReader {
    /// Open the configured serial port.
    ///
    /// # Errors
    /// Returns an error if the port cannot be opened.
    #[cfg(feature = "instrument_serial")]
    pub async fn open(
        config: &crate::config::DistanceSensorConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut port =
            crate::serial::open_serial_async(&config.serial, "distance sensor").await?;
        // Lines buffered before the session started are not part of it
        crate::serial::drain_serial_buffer(&mut port, io_timeout).await;
        tracing::info!(port = %config.serial.port, "Distance sensor port opened");
        Ok(Self::with_port(Box::new(port), io_timeout))
    }

    /// Build a reader over an already open port; `window` bounds each poll.
    pub fn with_port(port: DynSerial, window: Duration) -> Self {
        Self {
            port,
            window,
            pending: Vec::new(),
            last_mm: 0.0,
        }
    }

    /// The distance reported when no new valid line arrives.
    pub fn last_mm(&self) -> f64 {
        self.last_mm
    }

    /// Read what the sensor has sent and return the last valid reading among the
    /// completed lines.
    ///
    /// Waits up to the window for a first valid line. After one arrives, reading stops
    /// as soon as the line has been quiet for [`IDLE_GAP`].
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn drain_lines(&mut self) -> Result<Option<f64>, ReadError> {
        let deadline = tokio::time::Instant::now() + self.window;
        let mut chunk = [0u8; 256];
        let mut latest = None;

        loop {
            let mut wait = deadline.saturating_duration_since(tokio::time::Instant::now());
            if latest.is_some() {
                wait = wait.min(IDLE_GAP);
            }
            if wait.is_zero() {
                break;
            }
            let error = match tokio::time::timeout(wait, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) => ReadError::UnexpectedEof,
                Ok(Ok(n)) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if let Some(value) = self.take_complete_lines() {
                        latest = Some(value);
                    }
                    continue;
                }
                Ok(Err(e)) => ReadError::Io(e),
                Err(_) => break,
            };
            // Lines completed before the port failed still count
            if latest.is_some() {
                debug!(error = %error, "Distance port failed after a valid line");
                break;
            }
            return Err(error);
        }

        Ok(latest)
    }

    /// Consume complete lines from `pending`; returns the last valid reading among them.
    fn take_complete_lines(&mut self) -> Option<f64> {
        let mut latest = None;
        let Some(end) = self.pending.iter().rposition(|&b| b == b'\n') else {
            if self.pending.len() > MAX_PENDING {
                debug!(bytes = self.pending.len(), "Dropping unterminated distance input");
                self.pending.clear();
            }
            return None;
        };

        for line in self.pending[..end].split(|&b| b == b'\n') {
            if let Some(value) = parse_line(&String::from_utf8_lossy(line)) {
                latest = Some(value);
            }
        }
        self.pending.drain(..=end);
        latest
    }
}

#[async_trait]
impl DeviceReader for DistanceReader {
    type Value = f64;

    fn kind(&self) -> DeviceKind {
        DeviceKind::DistanceSensor
    }

    async fn read_one(&mut self) -> Result<f64, ReadError> {
        match self.drain_lines().await {
            Ok(Some(mm)) => self.last_mm = mm,
            Ok(None) => {}
            Err(e) => debug!(
                error = %e,
                last_mm = self.last_mm,
                "Distance read failed, keeping last value"
            ),
        }
        Ok(self.last_mm)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        use anyhow::Context;
        self.port
            .shutdown()
            .await
            .context("Failed to close distance sensor port")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock_serial;

    fn reader(port: mock_serial::MockSerialPort) -> DistanceReader {
        DistanceReader::with_port(Box::new(port), Duration::from_millis(30))
    }

    #[test]
    fn line_pattern() {
        assert_eq!(parse_line("1532"), Some(1532.0));
        assert_eq!(parse_line("  0815 \r"), Some(815.0));
        assert_eq!(parse_line("15.3"), None);
        assert_eq!(parse_line("-12"), None);
        assert_eq!(parse_line("E01"), None);
        assert_eq!(parse_line(""), None);
    }

    #[tokio::test]
    async fn last_complete_line_wins() {
        let (port, harness) = mock_serial::new();
        let mut reader = reader(port);

        harness.send_response(b"1000\r\n1010\r\n1020\r\n").unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 1020.0);
    }

    #[tokio::test]
    async fn partial_line_completes_on_next_poll() {
        let (port, harness) = mock_serial::new();
        let mut reader = reader(port);

        harness.send_response(b"1200\r\n13").unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 1200.0);

        harness.send_response(b"45\r\n").unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 1345.0);
    }

    #[tokio::test]
    async fn unparsable_line_then_silence_keeps_last_value() {
        let (port, harness) = mock_serial::new();
        let mut reader = reader(port);

        harness.send_line("1500").unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 1500.0);

        harness.send_line("ERR:overrange").unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 1500.0);

        // Sensor went silent
        assert_eq!(reader.read_one().await.unwrap(), 1500.0);
        assert_eq!(reader.last_mm(), 1500.0);
        drop(harness);
    }

    #[tokio::test]
    async fn starts_at_zero_and_survives_disconnect() {
        let (port, harness) = mock_serial::new();
        let mut reader = reader(port);

        assert_eq!(reader.read_one().await.unwrap(), 0.0);

        harness.send_line("700").unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 700.0);

        drop(harness);
        assert_eq!(reader.read_one().await.unwrap(), 700.0);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_line_returns_without_waiting_out_the_window() {
        let (port, harness) = mock_serial::new();
        let mut reader = DistanceReader::with_port(Box::new(port), Duration::from_millis(100));

        harness.send_line("1500").unwrap();
        let started = tokio::time::Instant::now();
        assert_eq!(reader.read_one().await.unwrap(), 1500.0);
        assert!(started.elapsed() < IDLE_GAP * 2);
        drop(harness);
    }

    #[tokio::test(start_paused = true)]
    async fn lines_streaming_in_are_collected_until_quiet() {
        let (port, harness) = mock_serial::new();
        let mut reader = DistanceReader::with_port(Box::new(port), Duration::from_millis(100));

        let sensor = tokio::spawn(async move {
            for mm in ["1100", "1110", "1120"] {
                harness.send_line(mm).unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            harness
        });
        assert_eq!(reader.read_one().await.unwrap(), 1120.0);
        drop(sensor.await.unwrap());
    }

    #[tokio::test]
    async fn line_before_disconnect_is_kept() {
        let (port, harness) = mock_serial::new();
        let mut reader = reader(port);

        harness.send_line("850").unwrap();
        drop(harness);
        assert_eq!(reader.read_one().await.unwrap(), 850.0);
        assert_eq!(reader.last_mm(), 850.0);
    }

    #[tokio::test]
    async fn unterminated_flood_is_bounded() {
        let (port, harness) = mock_serial::new();
        let mut reader = reader(port);

        harness.send_response(&[b'7'; MAX_PENDING + 10]).unwrap();
        assert_eq!(reader.read_one().await.unwrap(), 0.0);
        assert!(reader.pending.is_empty());
    }
}
