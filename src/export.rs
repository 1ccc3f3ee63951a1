//! Session summary and the export collaborator that receives it at stop.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Wall-clock start
    pub started: DateTime<Local>,
    /// Wall-clock stop
    pub stopped: DateTime<Local>,
    /// Monotonic session length in seconds
    pub duration_s: f64,
    /// Samples emitted
    pub rows: u64,
    /// Ticks skipped for a missing reading
    pub skipped_ticks: u64,
    /// Live energy (kWh)
    pub energy_kwh: f64,
    /// Session CSV, after export
    pub csv_path: Option<PathBuf>,
}

impl SessionSummary {
    /// Cost of the session's energy at `rate` (currency per kWh).
    pub fn estimated_cost(&self, rate: f64) -> f64 {
        self.energy_kwh * rate
    }
}

/// Receives the summary once a session has been finalized.
///
/// The exporter may relocate the session file; the summary it returns is the one handed
/// back to the caller of stop.
pub trait SessionExporter: Send + Sync {
    /// Take the summary of a finished session; return it, possibly with a new file path.
    fn export(&self, summary: SessionSummary) -> AppResult<SessionSummary>;
}

/// Leaves the session file where acquisition wrote it.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepInPlace;

impl SessionExporter for KeepInPlace {
    fn export(&self, summary: SessionSummary) -> AppResult<SessionSummary> {
        Ok(summary)
    }
}

/// Moves the session file into a destination directory.
#[derive(Debug, Clone)]
pub struct MoveToDirectory {
    destination: PathBuf,
}

impl MoveToDirectory {
    /// Move session files into `destination`, created on first use.
    pub fn new<P: Into<PathBuf>>(destination: P) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    fn relocate(&self, source: &Path) -> AppResult<PathBuf> {
        std::fs::create_dir_all(&self.destination).map_err(|e| {
            DaqError::Storage(format!(
                "Failed to create export directory '{}': {}",
                self.destination.display(),
                e
            ))
        })?;
        let file_name = source.file_name().ok_or_else(|| {
            DaqError::Storage(format!("'{}' has no file name", source.display()))
        })?;
        let target = self.destination.join(file_name);

        // rename fails across filesystems; fall back to copy and delete
        if std::fs::rename(source, &target).is_err() {
            std::fs::copy(source, &target)
                .and_then(|_| std::fs::remove_file(source))
                .map_err(|e| {
                    DaqError::Storage(format!(
                        "Failed to move '{}' to '{}': {}",
                        source.display(),
                        target.display(),
                        e
                    ))
                })?;
        }
        Ok(target)
    }
}

impl SessionExporter for MoveToDirectory {
    fn export(&self, mut summary: SessionSummary) -> AppResult<SessionSummary> {
        if let Some(source) = summary.csv_path.take() {
            let target = self.relocate(&source)?;
            info!("Session file moved to '{}'", target.display());
            summary.csv_path = Some(target);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(csv_path: Option<PathBuf>) -> SessionSummary {
        let now = Local::now();
        SessionSummary {
            started: now,
            stopped: now,
            duration_s: 10.0,
            rows: 50,
            skipped_ticks: 0,
            energy_kwh: 2.5,
            csv_path,
        }
    }

    #[test]
    fn cost_is_energy_times_rate() {
        let s = summary(None);
        assert!((s.estimated_cost(170.88) - 427.2).abs() < 1e-9);
    }

    #[test]
    fn keep_in_place_is_identity() {
        let s = summary(Some(PathBuf::from("data/adq_x.csv")));
        assert_eq!(KeepInPlace.export(s.clone()).unwrap(), s);
    }

    #[test]
    fn move_to_directory_relocates_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("adq_20250612_080000.csv");
        std::fs::write(&source, "timestamp_iso\n").unwrap();

        let exporter = MoveToDirectory::new(dir.path().join("exported"));
        let exported = exporter.export(summary(Some(source.clone()))).unwrap();

        let target = exported.csv_path.unwrap();
        assert!(target.ends_with("exported/adq_20250612_080000.csv"));
        assert!(target.exists());
        assert!(!source.exists());
    }

    #[test]
    fn move_without_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = MoveToDirectory::new(dir.path());
        assert_eq!(exporter.export(summary(None)).unwrap().csv_path, None);
    }
}
