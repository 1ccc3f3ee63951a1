//! Integration tests for layered configuration loading.

use sawmill_daq::config::{Parity, Settings};
use sawmill_daq::DaqError;
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/default.toml")
}

#[test]
#[serial]
fn test_shipped_config_matches_defaults() {
    let settings = Settings::load_from(shipped_config()).unwrap();
    settings.validate().unwrap();

    let defaults = Settings::default();
    assert_eq!(settings.acquisition.sample_period_ms, defaults.acquisition.sample_period_ms);
    assert_eq!(settings.acquisition.io_timeout_ms, defaults.acquisition.io_timeout_ms);
    assert_eq!(settings.devices.power_meter.serial, defaults.devices.power_meter.serial);
    assert_eq!(settings.devices.analog_module.command, "#02");
    assert_eq!(settings.tariffs.rates, defaults.tariffs.rates);
    assert_eq!(settings.tariffs.rate(Some("BT4.2")), Some(170.64));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    std::env::set_var("SAWMILL_DAQ_ACQUISITION__SAMPLE_PERIOD_MS", "500");
    std::env::set_var("SAWMILL_DAQ_DEVICES__POWER_METER__PORT", "/dev/ttyUSB9");

    let result = Settings::load_from(shipped_config());

    std::env::remove_var("SAWMILL_DAQ_ACQUISITION__SAMPLE_PERIOD_MS");
    std::env::remove_var("SAWMILL_DAQ_DEVICES__POWER_METER__PORT");

    let settings = result.unwrap();
    assert_eq!(settings.acquisition.sample_period_ms, 500);
    assert_eq!(settings.devices.power_meter.serial.port, "/dev/ttyUSB9");
    // Untouched keys keep the file's values
    assert_eq!(settings.devices.power_meter.serial.parity, Parity::Even);
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings.storage.output_dir, PathBuf::from("data"));
    assert!(settings.validate().is_ok());
}

#[test]
#[serial]
fn test_unknown_parity_is_a_load_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [devices.distance_sensor]
        port = "COM2"
        baud_rate = 115200
        parity = "mark"
        "#
    )
    .unwrap();

    let result = Settings::load_from(file.path());
    assert!(matches!(result, Err(DaqError::Config(_))));
}

#[test]
fn test_negative_tariff_rejected() {
    let mut settings = Settings::default();
    settings.tariffs.rates.insert("BT2".to_string(), -1.0);
    let err = settings.validate().unwrap_err();
    assert!(err.to_string().contains("negative rate"));
}

#[test]
fn test_data_bits_out_of_range_rejected() {
    let mut settings = Settings::default();
    settings.devices.analog_module.serial.data_bits = 9;
    let err = settings.validate().unwrap_err();
    assert!(err.to_string().contains("data_bits"));
}
