//! Integration tests for the acquisition session lifecycle.

use sawmill_daq::config::Settings;
use sawmill_daq::devices::mock::{ScriptedConnector, ScriptedReader, SimulatedConnector};
use sawmill_daq::devices::DeviceKind;
use sawmill_daq::export::MoveToDirectory;
use sawmill_daq::measurement::{PowerMeterReading, Quantity};
use sawmill_daq::synchronizer::AcquisitionEvent;
use sawmill_daq::{DaqError, SessionManager, SessionState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn test_settings(output_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.storage.output_dir = output_dir.to_path_buf();
    settings.acquisition.sample_period_ms = 20;
    settings.acquisition.io_timeout_ms = 10;
    settings
}

fn csv_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "csv"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_distance_sensor_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let output_dir = dir.path().join("sessions");
    let connector = Arc::new(
        ScriptedConnector::constant(10.0, 25.0, 1200.0).fail_on(DeviceKind::DistanceSensor),
    );
    let mut manager = SessionManager::new(test_settings(&output_dir), connector.clone());

    let err = manager.start().await.unwrap_err();

    assert_eq!(err.failed_device(), Some(DeviceKind::DistanceSensor));
    assert!(err.to_string().contains("serial port"));
    assert_eq!(manager.state(), SessionState::Idle);

    let power_meter = connector.tracker(DeviceKind::PowerMeter);
    let analog_module = connector.tracker(DeviceKind::AnalogModule);
    assert!(power_meter.is_closed());
    assert!(analog_module.is_closed());
    assert_eq!(power_meter.reads(), 0);
    assert!(!connector.tracker(DeviceKind::DistanceSensor).was_connected());

    // No session file was created
    assert_eq!(csv_files(&output_dir), 0);
    assert!(manager.csv_path().is_none());
}

#[tokio::test]
async fn test_power_meter_failure_opens_nothing_else() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(
        ScriptedConnector::constant(10.0, 25.0, 1200.0).fail_on(DeviceKind::PowerMeter),
    );
    let mut manager = SessionManager::new(test_settings(dir.path()), connector.clone());

    let err = manager.start().await.unwrap_err();

    assert_eq!(err.failed_device(), Some(DeviceKind::PowerMeter));
    assert!(!connector.tracker(DeviceKind::AnalogModule).was_connected());
    assert!(!connector.tracker(DeviceKind::DistanceSensor).was_connected());
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_sink_failure_closes_all_devices() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the output directory should be
    let blocked = dir.path().join("not_a_dir");
    std::fs::write(&blocked, "x").unwrap();

    let connector = Arc::new(ScriptedConnector::constant(10.0, 25.0, 1200.0));
    let mut manager = SessionManager::new(test_settings(&blocked), connector.clone());

    let err = manager.start().await.unwrap_err();

    assert!(matches!(err, DaqError::Storage(_)));
    assert_eq!(err.failed_device(), None);
    for device in [
        DeviceKind::PowerMeter,
        DeviceKind::AnalogModule,
        DeviceKind::DistanceSensor,
    ] {
        assert!(connector.tracker(device).is_closed(), "{device} left open");
    }
    assert_eq!(manager.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_start_while_acquiring_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(ScriptedConnector::constant(10.0, 25.0, 1200.0));
    let mut manager = SessionManager::new(test_settings(dir.path()), connector.clone());

    manager.start().await.unwrap();
    let second = manager.start().await;

    assert!(matches!(second, Err(DaqError::AlreadyAcquiring)));
    assert_eq!(manager.state(), SessionState::Acquiring);
    assert_eq!(csv_files(dir.path()), 1);

    manager.stop().await.unwrap();
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(connector.tracker(DeviceKind::PowerMeter).closes(), 1);
}

#[tokio::test]
async fn test_session_records_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(ScriptedConnector::constant(36.0, 41.5, 1350.0));
    let mut manager = SessionManager::new(test_settings(dir.path()), connector);
    let mut events = manager.subscribe();
    let energy = manager.energy();

    manager.start().await.unwrap();
    let csv_path = manager.csv_path().unwrap().to_path_buf();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let summary = manager.stop().await.unwrap();

    assert_eq!(manager.state(), SessionState::Idle);
    assert!(summary.rows > 0);
    assert_eq!(summary.csv_path.as_deref(), Some(csv_path.as_path()));

    let samples = manager.snapshot();
    assert_eq!(samples.len() as u64, summary.rows);
    for pair in samples.windows(2) {
        assert!(pair[1].t_rel > pair[0].t_rel);
    }
    let last = samples.last().unwrap();
    assert_eq!(last.power.active_power_kw(), 36.0);
    assert_eq!(last.temperature_c, 41.5);
    assert_eq!(last.distance_mm, 1350.0);

    // Constant power: live energy is P * t_last / 3600
    assert!((summary.energy_kwh - 36.0 * last.t_rel / 3600.0).abs() < 1e-9);
    assert_eq!(*energy.borrow(), summary.energy_kwh);

    let mut received = 0;
    while let Ok(AcquisitionEvent::Sample { energy_kwh, .. }) = events.try_recv() {
        received += 1;
        assert!(energy_kwh <= summary.energy_kwh + 1e-12);
    }
    assert_eq!(received as u64, summary.rows);

    let series = manager.import_csv(&csv_path).unwrap();
    assert_eq!(series.len() as u64, summary.rows);
    assert!(series.power_kw.iter().all(|p| *p == 36.0));
    assert!(series.temperature_c.iter().all(|t| *t == 41.5));
    assert!(series.distance_mm.iter().all(|d| *d == 1350.0));
}

#[tokio::test]
async fn test_close_errors_do_not_block_stop() {
    let dir = tempfile::tempdir().unwrap();
    let mut reading = PowerMeterReading::default();
    reading.set(Quantity::ActivePower, 5.0);
    let connector = Arc::new(ScriptedConnector::new(
        ScriptedReader::constant(DeviceKind::PowerMeter, reading).failing_close("port vanished"),
        ScriptedReader::constant(DeviceKind::AnalogModule, 30.0)
            .failing_close("port vanished"),
        ScriptedReader::constant(DeviceKind::DistanceSensor, 900.0),
    ));
    let mut manager = SessionManager::new(test_settings(dir.path()), connector.clone());

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = manager.stop().await;

    assert!(summary.is_some());
    assert_eq!(manager.state(), SessionState::Idle);
    assert!(connector.tracker(DeviceKind::PowerMeter).is_closed());
    assert!(connector.tracker(DeviceKind::AnalogModule).is_closed());
    assert!(connector.tracker(DeviceKind::DistanceSensor).is_closed());
}

#[tokio::test]
async fn test_missing_channel_skips_every_tick() {
    let dir = tempfile::tempdir().unwrap();
    // Power meter never answers
    let connector = Arc::new(ScriptedConnector::new(
        ScriptedReader::new(DeviceKind::PowerMeter, Vec::new(), None),
        ScriptedReader::constant(DeviceKind::AnalogModule, 30.0),
        ScriptedReader::constant(DeviceKind::DistanceSensor, 900.0),
    ));
    let mut manager = SessionManager::new(test_settings(dir.path()), connector);

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let summary = manager.stop().await.unwrap();

    assert_eq!(summary.rows, 0);
    assert!(summary.skipped_ticks > 0);
    assert_eq!(summary.energy_kwh, 0.0);
    assert!(manager.snapshot().is_empty());

    // Header only
    let text = std::fs::read_to_string(summary.csv_path.unwrap()).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.starts_with("timestamp_iso,"));
}

#[tokio::test]
async fn test_exporter_moves_the_session_file() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive");
    let connector = Arc::new(ScriptedConnector::constant(10.0, 25.0, 1200.0));
    let mut manager = SessionManager::new(test_settings(&dir.path().join("live")), connector)
        .with_exporter(Arc::new(MoveToDirectory::new(&archive)));

    manager.start().await.unwrap();
    let original = manager.csv_path().unwrap().to_path_buf();
    tokio::time::sleep(Duration::from_millis(80)).await;
    let summary = manager.stop().await.unwrap();

    let exported = summary.csv_path.unwrap();
    assert!(exported.starts_with(&archive));
    assert!(exported.exists());
    assert!(!original.exists());
    assert_eq!(exported.file_name(), original.file_name());
}

#[tokio::test]
async fn test_simulated_sessions_can_be_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.acquisition.sample_period_ms = 50;
    settings.acquisition.io_timeout_ms = 20;
    let mut manager = SessionManager::new(settings, Arc::new(SimulatedConnector::seeded(7)));

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let first = manager.stop().await.unwrap();

    manager.start().await.unwrap();
    assert_eq!(*manager.energy().borrow(), 0.0);
    assert!(manager.snapshot().is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = manager.stop().await.unwrap();

    assert!(first.rows > 0);
    assert!(second.rows > 0);
    assert!(first.energy_kwh > 0.0);
    assert_ne!(first.csv_path, second.csv_path);
    assert_eq!(csv_files(dir.path()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_healthy_devices_fill_every_tick() {
    let dir = tempfile::tempdir().unwrap();
    // Shipped timing: 200 ms period, 100 ms I/O timeout
    let mut settings = Settings::default();
    settings.storage.output_dir = dir.path().to_path_buf();
    let mut reading = PowerMeterReading::default();
    reading.set(Quantity::ActivePower, 7.2);
    // Each device spends part of the period answering; the distance sensor a full timeout
    let connector = Arc::new(ScriptedConnector::new(
        ScriptedReader::constant(DeviceKind::PowerMeter, reading)
            .with_latency(Duration::from_millis(60)),
        ScriptedReader::constant(DeviceKind::AnalogModule, 30.0)
            .with_latency(Duration::from_millis(30)),
        ScriptedReader::constant(DeviceKind::DistanceSensor, 1500.0)
            .with_latency(Duration::from_millis(100)),
    ));
    let mut manager = SessionManager::new(settings, connector);

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(6050)).await;
    let summary = manager.stop().await.unwrap();

    let samples = manager.snapshot();
    assert!(samples.len() >= 30, "only {} samples", samples.len());
    // Nothing has been read yet at the epoch tick; every tick after it emits
    assert!((samples[0].t_rel - 0.2).abs() < 0.01);
    for pair in samples.windows(2) {
        let gap = pair[1].t_rel - pair[0].t_rel;
        assert!((gap - 0.2).abs() < 0.01, "gap of {gap} s after t_rel {}", pair[0].t_rel);
    }
    assert!(summary.skipped_ticks <= 2, "{} ticks skipped", summary.skipped_ticks);
}

#[tokio::test(start_paused = true)]
async fn test_slow_power_meter_read_is_closed_at_stop() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    // Slower than twelve timeouts, within the worst case of a full read
    let latency = settings.acquisition.io_timeout() * 30;
    let mut reading = PowerMeterReading::default();
    reading.set(Quantity::ActivePower, 5.0);
    let connector = Arc::new(ScriptedConnector::new(
        ScriptedReader::constant(DeviceKind::PowerMeter, reading).with_latency(latency),
        ScriptedReader::constant(DeviceKind::AnalogModule, 30.0),
        ScriptedReader::constant(DeviceKind::DistanceSensor, 900.0),
    ));
    let mut manager = SessionManager::new(settings, connector.clone());

    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.stop().await.unwrap();

    let power_meter = connector.tracker(DeviceKind::PowerMeter);
    assert_eq!(power_meter.reads(), 1);
    assert!(power_meter.is_closed());
    assert_eq!(manager.state(), SessionState::Idle);
}
