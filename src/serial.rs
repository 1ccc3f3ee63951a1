//! Serial Port Abstractions
//!
//! Shared types for async serial communication used by all three device readers.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking, applying the
//!   configured line settings
//! - [`read_exact_timeout`]: Read a fixed number of bytes with a deadline
//! - [`drain_serial_buffer`]: Drain stale data from a serial port

use crate::error::ReadError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::devices::mock_serial::MockSerialPort`] (scripted testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Opening a port can block on some platforms, so it is moved off the runtime.
///
/// # Errors
///
/// Returns an error naming `device_name` and the port if the port cannot be opened.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    config: &crate::config::SerialConfig,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use crate::config::Parity;
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let config = config.clone();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, config.port
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Fill `buf` completely or fail once `timeout` elapses.
pub async fn read_exact_timeout<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), ReadError> {
    match tokio::time::timeout(timeout, port.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ReadError::UnexpectedEof)
        }
        Ok(Err(e)) => Err(ReadError::Io(e)),
        Err(_) => Err(ReadError::Timeout(timeout)),
    }
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards data until nothing arrives for the remainder of `timeout`.
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    timeout: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // Timeout, no more immediate data
        }
    }

    total_discarded
}
