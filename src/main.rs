//! CLI entry point for sawmill_daq
//!
//! - `acquire`: run an acquisition session until Ctrl+C or a fixed duration
//! - `replay`: import a recorded session CSV and report its energy
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! sawmill_daq acquire --duration 60
//! sawmill_daq acquire --simulate
//! sawmill_daq replay data/adq_20250612_083005.csv --tariff BT3
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sawmill_daq::config::Settings;
use sawmill_daq::devices::mock::SimulatedConnector;
use sawmill_daq::devices::DeviceConnector;
use sawmill_daq::export::SessionSummary;
use sawmill_daq::logging;
use sawmill_daq::replay::import_csv;
use sawmill_daq::synchronizer::AcquisitionEvent;
use sawmill_daq::SessionManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "sawmill_daq")]
#[command(about = "Synchronized power, temperature and distance acquisition", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire until Ctrl+C (or for a fixed duration)
    Acquire {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Use simulated devices instead of serial ports
        #[arg(long)]
        simulate: bool,
    },

    /// Import a recorded session CSV and report its energy
    Replay {
        /// Session CSV file
        csv: PathBuf,

        /// Tariff used for the cost estimate (defaults to the configured one)
        #[arg(long)]
        tariff: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    logging::init_from_settings(&settings).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Acquire { duration, simulate } => acquire(settings, duration, simulate).await,
        Commands::Replay { csv, tariff } => replay(&settings, &csv, tariff.as_deref()),
        Commands::Config => {
            let text = toml::to_string_pretty(&settings).context("Failed to render settings")?;
            println!("{}", text);
            Ok(())
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load configuration from '{}'", path.display()))?,
        None => Settings::load().context("Failed to load configuration")?,
    };
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

#[cfg(feature = "instrument_serial")]
fn serial_connector() -> Result<Arc<dyn DeviceConnector>> {
    Ok(Arc::new(sawmill_daq::devices::SerialConnector))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_connector() -> Result<Arc<dyn DeviceConnector>> {
    bail!(
        "Serial support not compiled in; rebuild with --features instrument_serial or use --simulate"
    )
}

async fn acquire(settings: Settings, duration: Option<f64>, simulate: bool) -> Result<()> {
    let duration = duration.map(session_duration).transpose()?;

    let connector: Arc<dyn DeviceConnector> = if simulate {
        info!("Using simulated devices");
        Arc::new(SimulatedConnector::default())
    } else {
        serial_connector()?
    };

    let mut manager = SessionManager::new(settings, connector);
    let mut events = manager.subscribe();
    manager.start().await.context("Failed to start acquisition")?;
    if let Some(path) = manager.csv_path() {
        println!("Recording to {}", path.display());
    }

    let monitor = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AcquisitionEvent::Sample { sample, energy_kwh }) => {
                    debug!(
                        t_rel = sample.t_rel,
                        power_kw = sample.power.active_power_kw(),
                        temperature_c = sample.temperature_c,
                        distance_mm = sample.distance_mm,
                        energy_kwh,
                        "Sample"
                    );
                }
                Err(RecvError::Lagged(missed)) => debug!(missed, "Sample monitor lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl+C")?,
            }
        }
        None => {
            println!("Acquiring, press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
        }
    }

    let summary = manager.stop().await;
    monitor.abort();

    match summary {
        Some(summary) => print_summary(&summary, manager.settings().tariffs.rate(None)),
        None => println!("No session was running"),
    }
    Ok(())
}

/// `--duration` in seconds; must be positive and representable.
fn session_duration(secs: f64) -> Result<Duration> {
    if secs <= 0.0 {
        bail!("Invalid duration {}", secs);
    }
    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid duration {}", secs))
}

fn print_summary(summary: &SessionSummary, rate: Option<f64>) {
    println!(
        "Session {} -> {}",
        summary.started.format("%Y-%m-%d %H:%M:%S"),
        summary.stopped.format("%H:%M:%S")
    );
    println!("  Duration:      {:.1} s", summary.duration_s);
    println!("  Samples:       {}", summary.rows);
    println!("  Skipped ticks: {}", summary.skipped_ticks);
    println!("  Energy:        {:.4} kWh", summary.energy_kwh);
    if let Some(rate) = rate {
        println!("  Cost:          {:.2}", summary.estimated_cost(rate));
    }
    if let Some(path) = &summary.csv_path {
        println!("  File:          {}", path.display());
    }
}

fn replay(settings: &Settings, csv: &Path, tariff: Option<&str>) -> Result<()> {
    let tariff_name = tariff.unwrap_or(&settings.tariffs.default);
    let rate = settings
        .tariffs
        .rate(Some(tariff_name))
        .with_context(|| format!("Unknown tariff '{}'", tariff_name))?;

    let series =
        import_csv(csv).with_context(|| format!("Failed to import '{}'", csv.display()))?;

    println!("{}", csv.display());
    println!("  Rows:     {}", series.len());
    println!("  Duration: {:.1} s", series.duration_s());
    println!("  Energy:   {:.4} kWh", series.energy_kwh);
    println!("  Cost:     {:.2} ({})", series.energy_kwh * rate, tariff_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_must_be_positive_and_finite() {
        assert_eq!(session_duration(1.5).unwrap(), Duration::from_millis(1500));
        assert!(session_duration(0.0).is_err());
        assert!(session_duration(-3.0).is_err());
        assert!(session_duration(f64::NAN).is_err());
        assert!(session_duration(f64::INFINITY).is_err());
        assert!(session_duration(1e30).is_err());
    }
}
