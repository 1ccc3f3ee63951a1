//! Import of recorded session CSV files.
//!
//! Reading is lenient about rows and strict about the header: a file without a
//! `timestamp_iso` column is rejected, while bad rows are skipped and bad cells read as
//! 0.0. Time is rebuilt as seconds since the first valid timestamp; rows stamped within
//! the same whole second are pulled apart by 0.1 ms each so the series stays strictly
//! ordered. Energy is recomputed with the replay rule ([`replay_energy`]).

use crate::energy::replay_energy;
use crate::error::{AppResult, DaqError};
use crate::measurement::TIMESTAMP_COLUMN;
use chrono::{DateTime, NaiveDateTime};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Column holding the active power.
pub const POWER_COLUMN: &str = "Power (kW)";
/// Active power column in files written by the Spanish-labelled acquisition station.
pub const LEGACY_POWER_COLUMN: &str = "Potencia (kW)";

/// Offset added per repeated timestamp within one whole second.
const DUPLICATE_SECOND_STEP: f64 = 1e-4;

/// A recorded series, column-major.
#[derive(Debug, Clone, Default)]
pub struct ImportedSeries {
    /// Timestamp of the first valid row
    pub started: Option<NaiveDateTime>,
    /// Seconds since `started`
    pub t: Vec<f64>,
    /// Value columns in file order, timestamp excluded
    pub columns: Vec<(String, Vec<f64>)>,
    /// Active power column (zeros if none)
    pub power_kw: Vec<f64>,
    /// First column whose name contains "temp" (zeros if none)
    pub temperature_c: Vec<f64>,
    /// First column whose name contains "dist" (zeros if none)
    pub distance_mm: Vec<f64>,
    /// Replay-rule energy of the whole series (kWh)
    pub energy_kwh: f64,
}

impl ImportedSeries {
    /// Number of valid rows.
    pub fn len(&self) -> usize {
        self.t.len()
    }

    /// Whether no valid row was found.
    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Seconds between the first and last row.
    pub fn duration_s(&self) -> f64 {
        self.t.last().copied().unwrap_or(0.0)
    }

    /// Values of the column named exactly `name`.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values.as_slice())
    }

    fn first_column_containing(&self, needle: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(column, _)| column.to_lowercase().contains(needle))
            .map(|(_, values)| values.as_slice())
    }
}

/// Parse a timestamp as written by the acquisition (`2025-06-12 08:30:05`), with or
/// without fractional seconds, `T` separator or UTC offset.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.naive_local()))
}

/// Parse a cell; commas are accepted as decimal separators, anything else reads as 0.0.
pub fn parse_value(text: &str) -> f64 {
    let normalized = text.trim().replace(',', ".");
    if normalized.is_empty() {
        return 0.0;
    }
    normalized.parse().unwrap_or(0.0)
}

/// Read a session CSV from `path`.
pub fn import_csv<P: AsRef<Path>>(path: P) -> AppResult<ImportedSeries> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let series = import_from_reader(reader)?;
    info!(
        rows = series.len(),
        energy_kwh = series.energy_kwh,
        "Imported '{}'",
        path.display()
    );
    Ok(series)
}

/// Read a session CSV from any reader.
pub fn import_from_reader<R: std::io::Read>(
    mut reader: csv::Reader<R>,
) -> AppResult<ImportedSeries> {
    let header: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let ts_index = header
        .iter()
        .position(|h| h == TIMESTAMP_COLUMN)
        .ok_or_else(|| {
            DaqError::Import(format!("Missing '{}' column in header", TIMESTAMP_COLUMN))
        })?;

    let mut series = ImportedSeries {
        columns: header
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != ts_index)
            .map(|(_, name)| (name.clone(), Vec::new()))
            .collect(),
        ..ImportedSeries::default()
    };
    let mut duplicates: HashMap<i64, u32> = HashMap::new();

    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                debug!(line = line + 2, error = %e, "Skipping unreadable row");
                continue;
            }
        };
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        let Some(timestamp) = record.get(ts_index).map(str::trim).and_then(parse_timestamp)
        else {
            debug!(line = line + 2, "Skipping row without a valid timestamp");
            continue;
        };
        let started = *series.started.get_or_insert(timestamp);

        let mut seconds = (timestamp - started).num_milliseconds() as f64 / 1000.0;
        let whole = seconds.trunc() as i64;
        let seen = duplicates.entry(whole).or_insert(0);
        seconds += f64::from(*seen) * DUPLICATE_SECOND_STEP;
        *seen += 1;
        series.t.push(seconds);

        // Short rows are padded with empty cells
        let mut column = 0;
        for index in 0..header.len() {
            if index == ts_index {
                continue;
            }
            let value = parse_value(record.get(index).unwrap_or(""));
            series.columns[column].1.push(value);
            column += 1;
        }
    }

    let rows = series.len();
    let zeros = || vec![0.0; rows];
    series.power_kw = series
        .column(POWER_COLUMN)
        .or_else(|| series.column(LEGACY_POWER_COLUMN))
        .map_or_else(zeros, <[f64]>::to_vec);
    series.temperature_c = series
        .first_column_containing("temp")
        .map_or_else(zeros, <[f64]>::to_vec);
    series.distance_mm = series
        .first_column_containing("dist")
        .map_or_else(zeros, <[f64]>::to_vec);
    series.energy_kwh = replay_energy(&series.t, &series.power_kw);

    Ok(series)
}
