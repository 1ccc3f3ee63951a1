//! Modbus RTU framing for the power meter.
//!
//! Only function 0x03 (read holding registers) is needed. Frames are
//! `address | function | payload | CRC-16/MODBUS (low byte first)`.
//!
//! # Example: read two registers at 3059 from unit 1
//!
//! ```text
//! request:  01 03 0B F3 00 02 <crc lo> <crc hi>
//! response: 01 03 04 <r0 hi> <r0 lo> <r1 hi> <r1 lo> <crc lo> <crc hi>
//! exception: 01 83 <code> <crc lo> <crc hi>
//! ```

use crate::error::ReadError;
use crate::serial::read_exact_timeout;
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function code: read holding registers
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Build a read-holding-registers request frame.
pub fn read_holding_registers_request(unit: u8, start: u16, count: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = unit;
    frame[1] = READ_HOLDING_REGISTERS;
    frame[2..4].copy_from_slice(&start.to_be_bytes());
    frame[4..6].copy_from_slice(&count.to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(frame: &[u8]) -> Result<(), ReadError> {
    if frame.len() < 4 {
        return Err(ReadError::Malformed(format!(
            "frame too short for CRC: {} bytes",
            frame.len()
        )));
    }
    let (data, trailer) = frame.split_at(frame.len() - 2);
    let expected = crc16(data);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if expected != received {
        return Err(ReadError::CrcMismatch { expected, received });
    }
    Ok(())
}

/// Parse a complete read-holding-registers response frame into register values.
pub fn parse_read_response(frame: &[u8], unit: u8, count: u16) -> Result<Vec<u16>, ReadError> {
    check_crc(frame)?;

    if frame[0] != unit {
        return Err(ReadError::Malformed(format!(
            "response from unit {} while polling unit {}",
            frame[0], unit
        )));
    }

    let function = frame[1];
    if function == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        return Err(ReadError::Exception {
            function: READ_HOLDING_REGISTERS,
            code: frame[2],
        });
    }
    if function != READ_HOLDING_REGISTERS {
        return Err(ReadError::Malformed(format!(
            "unexpected function code {function:#04x}"
        )));
    }

    if frame.len() < 5 {
        return Err(ReadError::Malformed(format!(
            "response too short: {} bytes",
            frame.len()
        )));
    }
    let byte_count = frame[2] as usize;
    let payload = &frame[3..frame.len() - 2];
    if byte_count != payload.len() || byte_count != count as usize * 2 {
        return Err(ReadError::Malformed(format!(
            "byte count {} does not match {} registers ({} payload bytes)",
            byte_count,
            count,
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a register pair (high word first) as a big-endian IEEE-754 float.
pub fn registers_to_f32(high: u16, low: u16) -> f32 {
    let [a, b] = high.to_be_bytes();
    let [c, d] = low.to_be_bytes();
    f32::from_be_bytes([a, b, c, d])
}

/// Send one read-holding-registers request and wait for its response.
///
/// The response header is read first to tell a normal reply from an exception reply;
/// every read is bounded by `timeout`.
#[instrument(skip(port), err(level = "debug"))]
pub async fn read_holding_registers<P>(
    port: &mut P,
    unit: u8,
    start: u16,
    count: u16,
    timeout: Duration,
) -> Result<Vec<u16>, ReadError>
where
    P: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = read_holding_registers_request(unit, start, count);
    tokio::time::timeout(timeout, port.write_all(&request))
        .await
        .map_err(|_| ReadError::Timeout(timeout))??;

    let mut header = [0u8; 3];
    read_exact_timeout(port, &mut header, timeout).await?;

    let remaining = if header[1] & EXCEPTION_FLAG != 0 {
        2
    } else {
        header[2] as usize + 2
    };

    let mut frame = Vec::with_capacity(header.len() + remaining);
    frame.extend_from_slice(&header);
    frame.resize(header.len() + remaining, 0);
    read_exact_timeout(port, &mut frame[header.len()..], timeout).await?;

    parse_read_response(&frame, unit, count)
}

/// Build a response frame; used by simulated devices and tests.
pub fn encode_read_response(unit: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + registers.len() * 2);
    frame.push(unit);
    frame.push(READ_HOLDING_REGISTERS);
    frame.push((registers.len() * 2) as u8);
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Build an exception response frame; used by tests.
pub fn encode_exception(unit: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![unit, READ_HOLDING_REGISTERS | EXCEPTION_FLAG, code];
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Split a float into the register pair a meter would report.
pub fn f32_to_registers(value: f32) -> [u16; 2] {
    let [a, b, c, d] = value.to_be_bytes();
    [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])]
}
