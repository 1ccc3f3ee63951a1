//! Mock Hardware Implementations
//!
//! Simulated and scripted readers for running without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - [`SimulatedConnector`]: plausible, jittered values for all three channels. Used by
//!   `sawmill_daq acquire --simulate`.
//! - [`ScriptedConnector`] / [`ScriptedReader`]: readers that replay a fixed sequence of
//!   results, with trackers that record reads and closes. Used by lifecycle tests.

use super::{BoxedReader, DeviceConnector, DeviceKind, DeviceReader};
use crate::config::{AnalogModuleConfig, DistanceSensorConfig, PowerMeterConfig};
use crate::error::ReadError;
use crate::measurement::{PowerMeterReading, Quantity};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Simulated devices
// =============================================================================

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Sleep for a random share of the I/O timeout, like a device answering.
async fn simulate_latency(rng: &mut StdRng, io_timeout: Duration) {
    let max_ms = (io_timeout.as_millis() as u64 / 4).max(1);
    let ms = rng.gen_range(0..=max_ms);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Three-phase load drawing roughly `base_kw`.
pub struct SimulatedPowerMeter {
    rng: StdRng,
    base_kw: f64,
    io_timeout: Duration,
}

impl SimulatedPowerMeter {
    /// `seed` makes the values reproducible.
    pub fn new(base_kw: f64, io_timeout: Duration, seed: Option<u64>) -> Self {
        Self {
            rng: rng_from(seed),
            base_kw,
            io_timeout,
        }
    }

    fn sample(&mut self) -> PowerMeterReading {
        let mut reading = PowerMeterReading::default();
        let line_line = 380.0 + self.rng.gen_range(-4.0_f64..4.0);
        for quantity in [Quantity::VoltageL1L2, Quantity::VoltageL2L3, Quantity::VoltageL3L1] {
            reading.set(quantity, line_line + self.rng.gen_range(-1.0_f64..1.0));
        }
        for quantity in [Quantity::VoltageL1N, Quantity::VoltageL2N, Quantity::VoltageL3N] {
            reading.set(quantity, line_line / 3f64.sqrt() + self.rng.gen_range(-0.5_f64..0.5));
        }

        let power_kw = self.base_kw * self.rng.gen_range(0.85_f64..1.15);
        let pf: f64 = self.rng.gen_range(0.86_f64..0.95);
        let reactive_kvar = power_kw * (1.0 - pf * pf).sqrt() / pf;
        reading.set(Quantity::ActivePower, power_kw);
        reading.set(Quantity::ReactivePower, reactive_kvar);
        reading.set(Quantity::PowerFactor, pf);

        let phase_current = power_kw * 1000.0 / (3f64.sqrt() * line_line * pf);
        for quantity in [Quantity::CurrentI1, Quantity::CurrentI2, Quantity::CurrentI3] {
            reading.set(quantity, phase_current * self.rng.gen_range(0.97_f64..1.03));
        }
        reading
    }
}

#[async_trait]
impl DeviceReader for SimulatedPowerMeter {
    type Value = PowerMeterReading;

    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerMeter
    }

    async fn read_one(&mut self) -> Result<PowerMeterReading, ReadError> {
        simulate_latency(&mut self.rng, self.io_timeout).await;
        Ok(self.sample())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Temperature drifting slowly around `center_c`.
pub struct SimulatedAnalogModule {
    rng: StdRng,
    temperature_c: f64,
    center_c: f64,
    io_timeout: Duration,
}

impl SimulatedAnalogModule {
    /// Start at `center_c` and drift around it.
    pub fn new(center_c: f64, io_timeout: Duration, seed: Option<u64>) -> Self {
        Self {
            rng: rng_from(seed),
            temperature_c: center_c,
            center_c,
            io_timeout,
        }
    }
}

#[async_trait]
impl DeviceReader for SimulatedAnalogModule {
    type Value = f64;

    fn kind(&self) -> DeviceKind {
        DeviceKind::AnalogModule
    }

    async fn read_one(&mut self) -> Result<f64, ReadError> {
        simulate_latency(&mut self.rng, self.io_timeout).await;
        let pull = (self.center_c - self.temperature_c) * 0.05;
        self.temperature_c = (self.temperature_c + pull + self.rng.gen_range(-0.3_f64..0.3))
            .clamp(0.0, 100.0);
        Ok(self.temperature_c)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A log moving past the sensor: distance sweeps between two bounds.
pub struct SimulatedDistanceSensor {
    rng: StdRng,
    distance_mm: f64,
    step_mm: f64,
    range_mm: (f64, f64),
    io_timeout: Duration,
}

impl SimulatedDistanceSensor {
    /// Start at 500 mm and sweep up to 3000 mm and back.
    pub fn new(io_timeout: Duration, seed: Option<u64>) -> Self {
        Self {
            rng: rng_from(seed),
            distance_mm: 500.0,
            step_mm: 25.0,
            range_mm: (500.0, 3000.0),
            io_timeout,
        }
    }
}

#[async_trait]
impl DeviceReader for SimulatedDistanceSensor {
    type Value = f64;

    fn kind(&self) -> DeviceKind {
        DeviceKind::DistanceSensor
    }

    async fn read_one(&mut self) -> Result<f64, ReadError> {
        simulate_latency(&mut self.rng, self.io_timeout).await;
        let next = self.distance_mm + self.step_mm;
        if next < self.range_mm.0 || next > self.range_mm.1 {
            self.step_mm = -self.step_mm;
        }
        self.distance_mm = (self.distance_mm + self.step_mm).clamp(self.range_mm.0, self.range_mm.1);
        // The sensor reports whole millimetres
        Ok((self.distance_mm + self.rng.gen_range(-2.0_f64..2.0)).round())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Connector producing simulated devices; the configured ports are ignored.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    /// Seed for reproducible runs
    pub seed: Option<u64>,
}

impl SimulatedConnector {
    /// Reproducible simulation.
    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    fn seed_for(&self, kind: DeviceKind) -> Option<u64> {
        let offset = match kind {
            DeviceKind::PowerMeter => 0,
            DeviceKind::AnalogModule => 1,
            DeviceKind::DistanceSensor => 2,
        };
        self.seed.map(|s| s.wrapping_add(offset))
    }
}

#[async_trait]
impl DeviceConnector for SimulatedConnector {
    async fn connect_power_meter(
        &self,
        _config: &PowerMeterConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<PowerMeterReading>> {
        Ok(Box::new(SimulatedPowerMeter::new(
            45.0,
            io_timeout,
            self.seed_for(DeviceKind::PowerMeter),
        )))
    }

    async fn connect_analog_module(
        &self,
        _config: &AnalogModuleConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>> {
        Ok(Box::new(SimulatedAnalogModule::new(
            42.0,
            io_timeout,
            self.seed_for(DeviceKind::AnalogModule),
        )))
    }

    async fn connect_distance_sensor(
        &self,
        _config: &DistanceSensorConfig,
        io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>> {
        Ok(Box::new(SimulatedDistanceSensor::new(
            io_timeout,
            self.seed_for(DeviceKind::DistanceSensor),
        )))
    }
}

// =============================================================================
// Scripted devices
// =============================================================================

/// Observes a scripted reader from the outside.
#[derive(Debug, Clone, Default)]
pub struct ReaderTracker {
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

impl ReaderTracker {
    /// Completed `read_one` calls
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// `close` calls
    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether `close` was called at least once.
    pub fn is_closed(&self) -> bool {
        self.closes() > 0
    }

    /// Whether the connector handed out a reader for this device.
    pub fn was_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Reader that replays a script of results, then repeats `idle` forever.
///
/// With `idle = None`, an exhausted script keeps failing with a timeout.
pub struct ScriptedReader<T> {
    kind: DeviceKind,
    script: VecDeque<Result<T, ReadError>>,
    idle: Option<T>,
    tracker: ReaderTracker,
    close_error: Option<String>,
    latency: Duration,
}

impl<T: Clone + Send + Sync + 'static> ScriptedReader<T> {
    /// Reader for `kind` that answers from `script`, then with `idle`.
    pub fn new(kind: DeviceKind, script: Vec<Result<T, ReadError>>, idle: Option<T>) -> Self {
        Self {
            kind,
            script: script.into(),
            idle,
            tracker: ReaderTracker::default(),
            close_error: None,
            latency: Duration::ZERO,
        }
    }

    /// Reader that always returns `value`.
    pub fn constant(kind: DeviceKind, value: T) -> Self {
        Self::new(kind, Vec::new(), Some(value))
    }

    /// Make `close` fail with `message`.
    pub fn failing_close(mut self, message: &str) -> Self {
        self.close_error = Some(message.to_string());
        self
    }

    /// Spend `latency` in every `read_one`, like a device answering over a slow line.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Counters shared with this reader.
    pub fn tracker(&self) -> ReaderTracker {
        self.tracker.clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DeviceReader for ScriptedReader<T> {
    type Value = T;

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn read_one(&mut self) -> Result<T, ReadError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = match self.script.pop_front() {
            Some(step) => step,
            None => self
                .idle
                .clone()
                .ok_or(ReadError::Timeout(Duration::ZERO)),
        };
        self.tracker.reads.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.tracker.closed.fetch_add(1, Ordering::SeqCst);
        match &self.close_error {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

/// Connector handing out prepared [`ScriptedReader`]s, optionally failing one device.
pub struct ScriptedConnector {
    power_meter: Mutex<Option<ScriptedReader<PowerMeterReading>>>,
    analog_module: Mutex<Option<ScriptedReader<f64>>>,
    distance_sensor: Mutex<Option<ScriptedReader<f64>>>,
    trackers: [ReaderTracker; 3],
    fail: Option<DeviceKind>,
}

impl ScriptedConnector {
    /// Connector handing out the given readers, once each.
    pub fn new(
        power_meter: ScriptedReader<PowerMeterReading>,
        analog_module: ScriptedReader<f64>,
        distance_sensor: ScriptedReader<f64>,
    ) -> Self {
        let trackers = [
            power_meter.tracker(),
            analog_module.tracker(),
            distance_sensor.tracker(),
        ];
        Self {
            power_meter: Mutex::new(Some(power_meter)),
            analog_module: Mutex::new(Some(analog_module)),
            distance_sensor: Mutex::new(Some(distance_sensor)),
            trackers,
            fail: None,
        }
    }

    /// Every device answers with a constant value; active power is `power_kw`.
    pub fn constant(power_kw: f64, temperature_c: f64, distance_mm: f64) -> Self {
        let mut reading = PowerMeterReading::default();
        reading.set(Quantity::ActivePower, power_kw);
        Self::new(
            ScriptedReader::constant(DeviceKind::PowerMeter, reading),
            ScriptedReader::constant(DeviceKind::AnalogModule, temperature_c),
            ScriptedReader::constant(DeviceKind::DistanceSensor, distance_mm),
        )
    }

    /// Fail to connect `device`, as if its port could not be opened.
    pub fn fail_on(mut self, device: DeviceKind) -> Self {
        self.fail = Some(device);
        self
    }

    /// Counters of the reader prepared for `device`.
    pub fn tracker(&self, device: DeviceKind) -> ReaderTracker {
        let index = match device {
            DeviceKind::PowerMeter => 0,
            DeviceKind::AnalogModule => 1,
            DeviceKind::DistanceSensor => 2,
        };
        self.trackers[index].clone()
    }

    fn take<T>(
        &self,
        slot: &Mutex<Option<ScriptedReader<T>>>,
        device: DeviceKind,
    ) -> anyhow::Result<ScriptedReader<T>> {
        if self.fail == Some(device) {
            anyhow::bail!("Failed to open {device} serial port: No such file or directory");
        }
        let reader = slot
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("{device} already connected"))?;
        reader.tracker.connected.store(true, Ordering::SeqCst);
        Ok(reader)
    }
}

#[async_trait]
impl DeviceConnector for ScriptedConnector {
    async fn connect_power_meter(
        &self,
        _config: &PowerMeterConfig,
        _io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<PowerMeterReading>> {
        Ok(Box::new(self.take(&self.power_meter, DeviceKind::PowerMeter)?))
    }

    async fn connect_analog_module(
        &self,
        _config: &AnalogModuleConfig,
        _io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>> {
        Ok(Box::new(self.take(&self.analog_module, DeviceKind::AnalogModule)?))
    }

    async fn connect_distance_sensor(
        &self,
        _config: &DistanceSensorConfig,
        _io_timeout: Duration,
    ) -> anyhow::Result<BoxedReader<f64>> {
        Ok(Box::new(self.take(&self.distance_sensor, DeviceKind::DistanceSensor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_values_are_plausible() {
        let timeout = Duration::from_millis(4);
        let mut meter = SimulatedPowerMeter::new(45.0, timeout, Some(7));
        let mut analog = SimulatedAnalogModule::new(42.0, timeout, Some(8));
        let mut distance = SimulatedDistanceSensor::new(timeout, Some(9));

        for _ in 0..20 {
            let reading = meter.read_one().await.unwrap();
            assert!((38.0..52.0).contains(&reading.active_power_kw()));
            assert!((0.86..0.95).contains(&reading.get(Quantity::PowerFactor)));

            let t = analog.read_one().await.unwrap();
            assert!((0.0..=100.0).contains(&t));

            let d = distance.read_one().await.unwrap();
            assert!((490.0..=3010.0).contains(&d));
            assert_eq!(d, d.round());
        }
    }

    #[tokio::test]
    async fn seeded_simulation_is_reproducible() {
        let timeout = Duration::from_millis(1);
        let mut a = SimulatedPowerMeter::new(10.0, timeout, Some(42));
        let mut b = SimulatedPowerMeter::new(10.0, timeout, Some(42));
        assert_eq!(a.read_one().await.unwrap(), b.read_one().await.unwrap());
    }

    #[tokio::test]
    async fn scripted_reader_replays_then_idles() {
        let mut reader = ScriptedReader::new(
            DeviceKind::AnalogModule,
            vec![Ok(1.0), Err(ReadError::Malformed("x".into())), Ok(2.0)],
            Some(9.0),
        );
        let tracker = reader.tracker();

        assert_eq!(reader.read_one().await.unwrap(), 1.0);
        assert!(reader.read_one().await.is_err());
        assert_eq!(reader.read_one().await.unwrap(), 2.0);
        assert_eq!(reader.read_one().await.unwrap(), 9.0);
        assert_eq!(tracker.reads(), 4);

        reader.close().await.unwrap();
        assert!(tracker.is_closed());
    }

    #[tokio::test]
    async fn scripted_connector_fails_requested_device() {
        let connector =
            ScriptedConnector::constant(1.0, 20.0, 100.0).fail_on(DeviceKind::AnalogModule);
        let devices = crate::config::DevicesConfig::default();
        let timeout = Duration::from_millis(10);

        assert!(connector
            .connect_power_meter(&devices.power_meter, timeout)
            .await
            .is_ok());
        let err = connector
            .connect_analog_module(&devices.analog_module, timeout)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("analog module"));
        assert!(connector.tracker(DeviceKind::PowerMeter).was_connected());
        assert!(!connector.tracker(DeviceKind::AnalogModule).was_connected());
    }
}
