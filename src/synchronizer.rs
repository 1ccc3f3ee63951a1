//! Fixed-tick merge of the three channels.
//!
//! Every tick drains all three mailboxes. When each one held a fresh reading, one
//! [`SynchronizedSample`] is emitted: energy advances by the sample's active power over
//! the real time since the previous emission, then the sample is appended to the session
//! buffer, written to the sink and published. When any mailbox was empty the tick is
//! skipped and the readings drained from the other mailboxes are dropped.
//!
//! `t_rel` and `Δt` come from the monotonic clock; only the persisted timestamp uses
//! wall-clock time.

use crate::energy::EnergyAccumulator;
use crate::mailbox::MailboxReceiver;
use crate::measurement::{PowerMeterReading, SynchronizedSample};
use crate::storage::SampleSink;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the sample broadcast; slow consumers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Published to external consumers for every emitted sample.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// A tick emitted `sample`.
    Sample {
        /// The merged sample
        sample: SynchronizedSample,
        /// Cumulative energy including this sample (kWh)
        energy_kwh: f64,
    },
}

/// Where emitted samples go besides the sink.
#[derive(Debug, Clone)]
pub struct SampleOutputs {
    /// Append-only session buffer
    pub buffer: Arc<RwLock<Vec<SynchronizedSample>>>,
    /// Cumulative energy (kWh)
    pub energy: watch::Sender<f64>,
    /// Sample events for external consumers
    pub events: broadcast::Sender<AcquisitionEvent>,
}

/// Counters reported when the synchronizer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncReport {
    /// Ticks that produced a sample
    pub emitted: u64,
    /// Ticks with at least one empty mailbox
    pub skipped: u64,
    /// Cumulative energy after the last emission (kWh)
    pub energy_kwh: f64,
    /// Samples the sink failed to persist
    pub sink_errors: u64,
    /// Readings replaced in a mailbox before any tick drained them, over all channels
    pub overwritten: u64,
}

/// Merge state of one session.
pub struct Synchronizer {
    power_meter: MailboxReceiver<PowerMeterReading>,
    temperature: MailboxReceiver<f64>,
    distance: MailboxReceiver<f64>,
    epoch: Instant,
    last_emission: Instant,
    energy: EnergyAccumulator,
    report: SyncReport,
}

impl Synchronizer {
    /// `epoch` is the session start; the first emission integrates from there.
    pub fn new(
        power_meter: MailboxReceiver<PowerMeterReading>,
        temperature: MailboxReceiver<f64>,
        distance: MailboxReceiver<f64>,
        epoch: Instant,
    ) -> Self {
        Self {
            power_meter,
            temperature,
            distance,
            epoch,
            last_emission: epoch,
            energy: EnergyAccumulator::new(),
            report: SyncReport::default(),
        }
    }

    /// Process one tick at monotonic time `now`, stamping an emitted sample with `wall`.
    ///
    /// Returns the sample and the cumulative energy, or `None` if the tick was skipped.
    pub fn tick(
        &mut self,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Option<(SynchronizedSample, f64)> {
        // All three are drained even when one is empty
        let power = self.power_meter.drain_latest();
        let temperature = self.temperature.drain_latest();
        let distance = self.distance.drain_latest();

        let (Some(power), Some(temperature), Some(distance)) = (power, temperature, distance)
        else {
            self.report.skipped += 1;
            return None;
        };

        let elapsed = now.saturating_duration_since(self.last_emission);
        let energy_kwh = self
            .energy
            .advance(power.value.active_power_kw(), elapsed.as_secs_f64());
        self.last_emission = now;
        self.report.emitted += 1;
        self.report.energy_kwh = energy_kwh;

        let sample = SynchronizedSample {
            t_rel: now.saturating_duration_since(self.epoch).as_secs_f64(),
            timestamp: wall,
            power: power.value,
            temperature_c: temperature.value,
            distance_mm: distance.value,
        };
        Some((sample, energy_kwh))
    }

    /// Counters so far.
    pub fn report(&self) -> SyncReport {
        SyncReport {
            overwritten: self.power_meter.overwritten()
                + self.temperature.overwritten()
                + self.distance.overwritten(),
            ..self.report
        }
    }

    /// Tick every `period` from the epoch until `shutdown` fires or its sender is dropped.
    ///
    /// Returns the final counters and the sink, still open, for the caller to close.
    pub async fn run(
        mut self,
        period: Duration,
        mut sink: Box<dyn SampleSink>,
        outputs: SampleOutputs,
        mut shutdown: oneshot::Receiver<()>,
    ) -> (SyncReport, Box<dyn SampleSink>) {
        let mut ticker = tokio::time::interval_at(self.epoch, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "Synchronizer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let Some((sample, energy_kwh)) = self.tick(Instant::now(), Local::now()) else {
                        continue;
                    };
                    self.emit(sample, energy_kwh, sink.as_mut(), &outputs).await;
                }
            }
        }

        let report = self.report();
        info!(
            emitted = report.emitted,
            skipped = report.skipped,
            overwritten = report.overwritten,
            energy_kwh = report.energy_kwh,
            "Synchronizer stopped"
        );
        (report, sink)
    }

    async fn emit(
        &mut self,
        sample: SynchronizedSample,
        energy_kwh: f64,
        sink: &mut dyn SampleSink,
        outputs: &SampleOutputs,
    ) {
        outputs.buffer.write().push(sample.clone());

        if let Err(e) = sink.write(&sample).await {
            self.report.sink_errors += 1;
            if self.report.sink_errors == 1 {
                warn!(error = %e, "Failed to persist sample, acquisition continues");
            } else {
                debug!(error = %e, failures = self.report.sink_errors, "Failed to persist sample");
            }
        }

        outputs.energy.send_replace(energy_kwh);
        // No subscribers is fine
        let _ = outputs.events.send(AcquisitionEvent::Sample { sample, energy_kwh });
    }
}
