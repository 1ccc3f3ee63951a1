//! Measurement data types shared by the device readers, the synchronizer and storage.
//!
//! - [`Reading`]: one timestamped value pushed by a device loop into its mailbox.
//! - [`PowerMeterReading`]: the twelve electrical quantities read from the power meter
//!   in one poll. The quantity table [`QUANTITIES`] fixes their order, register
//!   addresses and column names; that order is the column contract of the session CSV.
//! - [`SynchronizedSample`]: one time-aligned record built from the latest reading of
//!   every channel.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Number of power meter quantities in one sample.
pub const QUANTITY_COUNT: usize = 12;

/// A single value captured by a device loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading<T> {
    /// Wall-clock time at which the device loop produced the value
    pub timestamp: DateTime<Local>,
    /// The device value
    pub value: T,
}

impl<T> Reading<T> {
    /// Wrap `value` captured at `timestamp`.
    pub fn new(timestamp: DateTime<Local>, value: T) -> Self {
        Self { timestamp, value }
    }

    /// Stamp `value` with the current wall-clock time.
    pub fn now(value: T) -> Self {
        Self::new(Local::now(), value)
    }
}

/// Identifies one power meter quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    /// L1-L2 voltage (V)
    VoltageL1L2,
    /// L2-L3 voltage (V)
    VoltageL2L3,
    /// L3-L1 voltage (V)
    VoltageL3L1,
    /// L1-N voltage (V)
    VoltageL1N,
    /// L2-N voltage (V)
    VoltageL2N,
    /// L3-N voltage (V)
    VoltageL3N,
    /// Active power (kW)
    ActivePower,
    /// Reactive power (kVAR)
    ReactivePower,
    /// Power factor
    PowerFactor,
    /// Phase 1 current (A)
    CurrentI1,
    /// Phase 2 current (A)
    CurrentI2,
    /// Phase 3 current (A)
    CurrentI3,
}

/// Static description of a quantity: where it lives and how it is labelled.
#[derive(Debug, Clone, Copy)]
pub struct QuantitySpec {
    /// Which quantity
    pub quantity: Quantity,
    /// First of the two holding registers (protocol address, zero based)
    pub register: u16,
    /// CSV column name
    pub column: &'static str,
}

/// Read order, register map and column order of the power meter quantities.
pub const QUANTITIES: [QuantitySpec; QUANTITY_COUNT] = [
    QuantitySpec { quantity: Quantity::VoltageL1L2, register: 3019, column: "L1-L2 (V)" },
    QuantitySpec { quantity: Quantity::VoltageL2L3, register: 3021, column: "L2-L3 (V)" },
    QuantitySpec { quantity: Quantity::VoltageL3L1, register: 3023, column: "L3-L1 (V)" },
    QuantitySpec { quantity: Quantity::VoltageL1N, register: 3027, column: "L1-N (V)" },
    QuantitySpec { quantity: Quantity::VoltageL2N, register: 3029, column: "L2-N (V)" },
    QuantitySpec { quantity: Quantity::VoltageL3N, register: 3031, column: "L3-N (V)" },
    QuantitySpec { quantity: Quantity::ActivePower, register: 3059, column: "Power (kW)" },
    QuantitySpec { quantity: Quantity::ReactivePower, register: 3067, column: "Reactive power (kVAR)" },
    QuantitySpec { quantity: Quantity::PowerFactor, register: 3191, column: "PF" },
    QuantitySpec { quantity: Quantity::CurrentI1, register: 2999, column: "I1 (A)" },
    QuantitySpec { quantity: Quantity::CurrentI2, register: 3001, column: "I2 (A)" },
    QuantitySpec { quantity: Quantity::CurrentI3, register: 3003, column: "I3 (A)" },
];

/// Column name of the timestamp in session CSV files.
pub const TIMESTAMP_COLUMN: &str = "timestamp_iso";
/// Column name of the temperature channel.
pub const TEMPERATURE_COLUMN: &str = "Temp (°C)";
/// Column name of the distance channel.
pub const DISTANCE_COLUMN: &str = "Dist (mm)";

/// All twelve power meter quantities from one poll.
///
/// Values are stored in [`QUANTITIES`] order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerMeterReading {
    values: [f64; QUANTITY_COUNT],
}

impl PowerMeterReading {
    /// Build from values in [`QUANTITIES`] order.
    pub fn from_values(values: [f64; QUANTITY_COUNT]) -> Self {
        Self { values }
    }

    /// Value of `quantity`.
    pub fn get(&self, quantity: Quantity) -> f64 {
        self.values[Self::index_of(quantity)]
    }

    /// Overwrite the value of `quantity`.
    pub fn set(&mut self, quantity: Quantity, value: f64) {
        self.values[Self::index_of(quantity)] = value;
    }

    /// Active power in kW, the input of energy integration.
    pub fn active_power_kw(&self) -> f64 {
        self.get(Quantity::ActivePower)
    }

    /// Values in [`QUANTITIES`] order.
    pub fn values(&self) -> &[f64; QUANTITY_COUNT] {
        &self.values
    }

    fn index_of(quantity: Quantity) -> usize {
        QUANTITIES
            .iter()
            .position(|spec| spec.quantity == quantity)
            .unwrap_or_default()
    }
}

/// One time-aligned record: every channel's most recent value at a synchronizer tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SynchronizedSample {
    /// Seconds since the session epoch
    pub t_rel: f64,
    /// Wall-clock time of emission
    pub timestamp: DateTime<Local>,
    /// All twelve power meter quantities
    pub power: PowerMeterReading,
    /// Analog module temperature (°C)
    pub temperature_c: f64,
    /// Distance sensor reading (mm)
    pub distance_mm: f64,
}

impl SynchronizedSample {
    /// Timestamp formatted with second precision, as persisted.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// The persisted CSV row: timestamp, 12 quantities (3 decimals), temperature and
    /// distance (2 decimals).
    pub fn to_record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(QUANTITY_COUNT + 3);
        record.push(self.timestamp_iso());
        record.extend(self.power.values().iter().map(|v| format!("{v:.3}")));
        record.push(format!("{:.2}", self.temperature_c));
        record.push(format!("{:.2}", self.distance_mm));
        record
    }
}

/// Header matching [`SynchronizedSample::to_record`].
pub fn csv_header() -> Vec<&'static str> {
    let mut header = Vec::with_capacity(QUANTITY_COUNT + 3);
    header.push(TIMESTAMP_COLUMN);
    header.extend(QUANTITIES.iter().map(|spec| spec.column));
    header.push(TEMPERATURE_COLUMN);
    header.push(DISTANCE_COLUMN);
    header
}
