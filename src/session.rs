//! Acquisition session lifecycle.
//!
//! [`SessionManager`] owns the `Idle → Acquiring → Finalizing → Idle` state machine.
//!
//! ## Start
//!
//! Devices are connected in a fixed order (power meter, analog module, distance sensor).
//! If one fails, the readers already opened are closed and the manager stays `Idle`; the
//! error names the device. The session CSV is opened next, with the same rollback on
//! failure. Only then are the buffer and energy reset, the epoch recorded and the four
//! tasks spawned: one poll loop per device and the synchronizer.
//!
//! ## Stop
//!
//! The running flag is cleared and each poll loop exits at its next poll, after finishing
//! the read in progress, which bounds the wait by [`AcquisitionConfig::shutdown_latency`]. Each reader is then
//! closed on its own; close errors are logged and never abort the stop. The synchronizer
//! is stopped, the sink closed, and the [`SessionSummary`] handed to the
//! [`SessionExporter`] before returning to `Idle`.
//!
//! [`AcquisitionConfig::shutdown_latency`]: crate::config::AcquisitionConfig::shutdown_latency

use crate::config::Settings;
use crate::devices::{BoxedReader, DeviceConnector, DeviceKind};
use crate::error::{AppResult, DaqError};
use crate::export::{KeepInPlace, SessionExporter, SessionSummary};
use crate::mailbox::{self, MailboxSender};
use crate::measurement::{PowerMeterReading, Reading, SynchronizedSample};
use crate::replay::{self, ImportedSeries};
use crate::storage::{CsvSampleWriter, SampleSink};
use crate::synchronizer::{
    AcquisitionEvent, SampleOutputs, SyncReport, Synchronizer, EVENT_CHANNEL_CAPACITY,
};
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; devices closed
    Idle,
    /// Devices polled, samples being emitted
    Acquiring,
    /// Stop in progress
    Finalizing,
}

/// Per-run resources, created by start and consumed by stop.
struct Session {
    started: DateTime<Local>,
    epoch: Instant,
    running: Arc<AtomicBool>,
    power_meter: JoinHandle<BoxedReader<PowerMeterReading>>,
    analog_module: JoinHandle<BoxedReader<f64>>,
    distance_sensor: JoinHandle<BoxedReader<f64>>,
    synchronizer: JoinHandle<(SyncReport, Box<dyn SampleSink>)>,
    stop_synchronizer: oneshot::Sender<()>,
    csv_path: Option<PathBuf>,
}

/// Runs acquisition sessions and publishes their data.
pub struct SessionManager {
    settings: Settings,
    connector: Arc<dyn DeviceConnector>,
    exporter: Arc<dyn SessionExporter>,
    state: watch::Sender<SessionState>,
    session: Option<Session>,
    buffer: Arc<RwLock<Vec<SynchronizedSample>>>,
    energy: watch::Sender<f64>,
    events: broadcast::Sender<AcquisitionEvent>,
}

impl SessionManager {
    /// Idle manager; nothing is opened until [`start`](Self::start).
    pub fn new(settings: Settings, connector: Arc<dyn DeviceConnector>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (energy, _) = watch::channel(0.0);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            connector,
            exporter: Arc::new(KeepInPlace),
            state,
            session: None,
            buffer: Arc::new(RwLock::new(Vec::new())),
            energy,
            events,
        }
    }

    /// Replace the collaborator that receives the summary at stop.
    pub fn with_exporter(mut self, exporter: Arc<dyn SessionExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// Settings the manager was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Receive every emitted sample with the cumulative energy.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }

    /// Cumulative energy of the current (or last) session, in kWh.
    pub fn energy(&self) -> watch::Receiver<f64> {
        self.energy.subscribe()
    }

    /// Copy of every sample emitted by the current (or last) session.
    pub fn snapshot(&self) -> Vec<SynchronizedSample> {
        self.buffer.read().clone()
    }

    /// File the current session writes to.
    pub fn csv_path(&self) -> Option<&Path> {
        self.session.as_ref().and_then(|s| s.csv_path.as_deref())
    }

    /// Connect the devices, open the session file and start acquiring.
    ///
    /// # Errors
    /// - [`DaqError::AlreadyAcquiring`] / [`DaqError::Finalizing`] outside `Idle`; nothing
    ///   is touched.
    /// - [`DaqError::DeviceConnect`] naming the first device that failed to open.
    /// - [`DaqError::Storage`] if the session file cannot be created.
    pub async fn start(&mut self) -> AppResult<()> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Acquiring => return Err(DaqError::AlreadyAcquiring),
            SessionState::Finalizing => return Err(DaqError::Finalizing),
        }

        let acquisition = &self.settings.acquisition;
        let io_timeout = acquisition.io_timeout();
        let period = acquisition.sample_period();
        let devices = &self.settings.devices;

        let mut power_meter = self
            .connector
            .connect_power_meter(&devices.power_meter, io_timeout)
            .await
            .map_err(|source| connect_error(DeviceKind::PowerMeter, source))?;

        let mut analog_module = match self
            .connector
            .connect_analog_module(&devices.analog_module, io_timeout)
            .await
        {
            Ok(reader) => reader,
            Err(source) => {
                close_reader(&mut power_meter).await;
                return Err(connect_error(DeviceKind::AnalogModule, source));
            }
        };

        let mut distance_sensor = match self
            .connector
            .connect_distance_sensor(&devices.distance_sensor, io_timeout)
            .await
        {
            Ok(reader) => reader,
            Err(source) => {
                close_reader(&mut power_meter).await;
                close_reader(&mut analog_module).await;
                return Err(connect_error(DeviceKind::DistanceSensor, source));
            }
        };

        let started = Local::now();
        let sink = match CsvSampleWriter::create(&self.settings.storage.output_dir, &started) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(error = %e, "Failed to open session file, closing devices");
                close_reader(&mut power_meter).await;
                close_reader(&mut analog_module).await;
                close_reader(&mut distance_sensor).await;
                return Err(e);
            }
        };
        let csv_path = sink.path().map(Path::to_path_buf);

        self.buffer.write().clear();
        self.energy.send_replace(0.0);

        let epoch = Instant::now();
        let running = Arc::new(AtomicBool::new(true));
        let (power_tx, power_rx) = mailbox::channel();
        let (temperature_tx, temperature_rx) = mailbox::channel();
        let (distance_tx, distance_rx) = mailbox::channel();

        let power_meter = spawn_poll_loop(power_meter, power_tx, running.clone(), period);
        let analog_module =
            spawn_poll_loop(analog_module, temperature_tx, running.clone(), period);
        let distance_sensor =
            spawn_poll_loop(distance_sensor, distance_tx, running.clone(), period);

        let (stop_synchronizer, stop_rx) = oneshot::channel();
        let outputs = SampleOutputs {
            buffer: self.buffer.clone(),
            energy: self.energy.clone(),
            events: self.events.clone(),
        };
        let synchronizer = Synchronizer::new(power_rx, temperature_rx, distance_rx, epoch);
        let synchronizer = tokio::spawn(
            synchronizer
                .run(period, Box::new(sink), outputs, stop_rx)
                .instrument(info_span!("synchronizer")),
        );

        self.session = Some(Session {
            started,
            epoch,
            running,
            power_meter,
            analog_module,
            distance_sensor,
            synchronizer,
            stop_synchronizer,
            csv_path,
        });
        self.state.send_replace(SessionState::Acquiring);
        info!(
            period_ms = period.as_millis() as u64,
            io_timeout_ms = io_timeout.as_millis() as u64,
            "Acquisition started"
        );
        Ok(())
    }

    /// Stop acquiring and finalize the session.
    ///
    /// Returns `None` without touching devices or files when no session is running.
    pub async fn stop(&mut self) -> Option<SessionSummary> {
        if self.state() != SessionState::Acquiring {
            return None;
        }
        let session = self.session.take()?;
        self.state.send_replace(SessionState::Finalizing);
        info!("Stopping acquisition");

        session.running.store(false, Ordering::SeqCst);
        let acquisition = &self.settings.acquisition;
        let bound = acquisition.shutdown_latency() + acquisition.io_timeout();

        let power_meter = join_reader(session.power_meter, DeviceKind::PowerMeter, bound).await;
        let analog_module =
            join_reader(session.analog_module, DeviceKind::AnalogModule, bound).await;
        let distance_sensor =
            join_reader(session.distance_sensor, DeviceKind::DistanceSensor, bound).await;

        if let Some(mut reader) = power_meter {
            close_reader(&mut reader).await;
        }
        for mut reader in analog_module.into_iter().chain(distance_sensor) {
            close_reader(&mut reader).await;
        }

        // A dropped receiver means the synchronizer already ended
        let _ = session.stop_synchronizer.send(());
        let report = match session.synchronizer.await {
            Ok((report, mut sink)) => {
                if let Err(e) = sink.close().await {
                    warn!(error = %e, "Failed to close session file");
                }
                report
            }
            Err(e) => {
                warn!(error = %e, "Synchronizer task failed");
                SyncReport {
                    emitted: self.buffer.read().len() as u64,
                    energy_kwh: *self.energy.borrow(),
                    ..SyncReport::default()
                }
            }
        };

        let summary = SessionSummary {
            started: session.started,
            stopped: Local::now(),
            duration_s: session.epoch.elapsed().as_secs_f64(),
            rows: report.emitted,
            skipped_ticks: report.skipped,
            energy_kwh: report.energy_kwh,
            csv_path: session.csv_path,
        };
        let summary = match self.exporter.export(summary.clone()) {
            Ok(exported) => exported,
            Err(e) => {
                warn!(error = %e, "Session export failed, file left in place");
                summary
            }
        };

        self.state.send_replace(SessionState::Idle);
        info!(
            rows = summary.rows,
            skipped_ticks = summary.skipped_ticks,
            energy_kwh = summary.energy_kwh,
            sink_errors = report.sink_errors,
            overwritten_readings = report.overwritten,
            "Acquisition stopped"
        );
        Some(summary)
    }

    /// Import a recorded session; only allowed while `Idle`.
    pub fn import_csv<P: AsRef<Path>>(&self, path: P) -> AppResult<ImportedSeries> {
        match self.state() {
            SessionState::Idle => replay::import_csv(path),
            SessionState::Acquiring => Err(DaqError::AlreadyAcquiring),
            SessionState::Finalizing => Err(DaqError::Finalizing),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Tasks end on their own; dropped readers release their ports
        if let Some(session) = &self.session {
            session.running.store(false, Ordering::SeqCst);
        }
    }
}

fn connect_error(device: DeviceKind, source: anyhow::Error) -> DaqError {
    warn!(%device, error = %source, "Device connection failed");
    DaqError::DeviceConnect { device, source }
}

async fn close_reader<T: Clone + Send + Sync + 'static>(reader: &mut BoxedReader<T>) {
    let device = reader.kind();
    match reader.close().await {
        Ok(()) => debug!(%device, "Device closed"),
        Err(e) => warn!(%device, error = %e, "Failed to close device"),
    }
}

fn spawn_poll_loop<T: Clone + Send + Sync + 'static>(
    reader: BoxedReader<T>,
    mailbox: MailboxSender<T>,
    running: Arc<AtomicBool>,
    period: Duration,
) -> JoinHandle<BoxedReader<T>> {
    let span = info_span!("poll", device = %reader.kind());
    tokio::spawn(poll_loop(reader, mailbox, running, period).instrument(span))
}

/// Read and push once per period until the running flag is cleared. Returns the reader
/// for closing.
///
/// Polls start on a fixed grid; a read that overruns the period delays the next poll
/// instead of triggering a burst.
async fn poll_loop<T: Clone + Send + Sync + 'static>(
    mut reader: BoxedReader<T>,
    mailbox: MailboxSender<T>,
    running: Arc<AtomicBool>,
    period: Duration,
) -> BoxedReader<T> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u64 = 0;
    loop {
        ticker.tick().await;
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match reader.read_one().await {
            Ok(value) => mailbox.push(Reading::now(value)),
            Err(e) => {
                failures += 1;
                debug!(error = %e, failures, "No reading this poll");
            }
        }
    }
    debug!(failures, "Poll loop exited");
    reader
}

async fn join_reader<T: Clone + Send + Sync + 'static>(
    mut handle: JoinHandle<BoxedReader<T>>,
    device: DeviceKind,
    bound: Duration,
) -> Option<BoxedReader<T>> {
    match tokio::time::timeout(bound, &mut handle).await {
        Ok(Ok(reader)) => Some(reader),
        Ok(Err(e)) => {
            warn!(%device, error = %e, "Poll loop failed");
            None
        }
        Err(_) => {
            warn!(
                %device,
                bound_ms = bound.as_millis() as u64,
                "Poll loop did not stop in time, aborting"
            );
            handle.abort();
            None
        }
    }
}
