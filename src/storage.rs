//! Session persistence.
//!
//! [`SampleSink`] receives every emitted sample; [`CsvSampleWriter`] is the sink used by
//! acquisition sessions. One file per session, named `adq_YYYYMMDD_HHMMSS.csv` after the
//! session start, with the header from [`csv_header`]. Rows are flushed as they are
//! written so a crash loses at most the sample in flight.

use crate::error::{AppResult, DaqError};
use crate::measurement::{csv_header, SynchronizedSample};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

/// Destination of synchronized samples.
#[async_trait]
pub trait SampleSink: Send {
    /// Append one sample.
    async fn write(&mut self, sample: &SynchronizedSample) -> AppResult<()>;

    /// Flush and release the destination. Further writes fail.
    async fn close(&mut self) -> AppResult<()>;

    /// File backing this sink, if any.
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// File name for a session started at `started`.
pub fn session_file_name(started: &DateTime<Local>) -> String {
    format!("adq_{}.csv", started.format("%Y%m%d_%H%M%S"))
}

/// A writer for session CSV files.
pub struct CsvSampleWriter {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: u64,
}

impl CsvSampleWriter {
    /// Create the session file in `output_dir` and write the header.
    ///
    /// The directory is created if needed. If a file with the same name already exists
    /// (two sessions within one second), a numeric suffix is appended.
    pub fn create(output_dir: &Path, started: &DateTime<Local>) -> AppResult<Self> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            DaqError::Storage(format!(
                "Failed to create output directory '{}': {}",
                output_dir.display(),
                e
            ))
        })?;

        let base = session_file_name(started);
        let (path, file) = create_unique(output_dir, &base)?;

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(csv_header())
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|e| DaqError::Storage(format!("Failed to write CSV header: {}", e)))?;

        info!("CSV writer initialized at '{}'", path.display());
        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
        })
    }
}

fn create_unique(dir: &Path, base: &str) -> AppResult<(PathBuf, File)> {
    let stem = base.trim_end_matches(".csv");
    for attempt in 0..100 {
        let name = if attempt == 0 {
            base.to_string()
        } else {
            format!("{stem}_{attempt}.csv")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(DaqError::Storage(format!(
                    "Failed to create CSV file '{}': {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Err(DaqError::Storage(format!(
        "No free file name for '{}' in '{}'",
        base,
        dir.display()
    )))
}

#[async_trait]
impl SampleSink for CsvSampleWriter {
    async fn write(&mut self, sample: &SynchronizedSample) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage("CSV writer is closed".to_string()))?;
        writer
            .write_record(sample.to_record())
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        self.rows += 1;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| DaqError::Storage(e.to_string()))?;
            info!(rows = self.rows, "CSV writer closed: '{}'", self.path.display());
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
