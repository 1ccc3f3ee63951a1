//! # Sawmill DAQ Core Library
//!
//! Acquisition engine for a sawmill workstation. Three serial devices are polled
//! concurrently: a power meter (Modbus RTU holding registers), an analog module
//! (ASCII query/reply, converted to a temperature) and a distance sensor (streamed text
//! lines). A fixed-period synchronizer merges their latest readings into one sample per
//! tick, integrates energy and appends each sample to a CSV file.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered settings (TOML file plus `SAWMILL_DAQ_` environment
//!   variables) and their validation. See `config::Settings`.
//! - **`devices`**: The `DeviceReader` trait, the three serial readers, the Modbus RTU
//!   codec and simulated/scripted devices for tests and dry runs.
//! - **`mailbox`**: Single-slot, overwrite-on-push handoff between a poll loop and the
//!   synchronizer.
//! - **`synchronizer`**: The fixed-period tick that merges, integrates and emits.
//! - **`energy`**: Live and replay energy integration.
//! - **`session`**: `SessionManager`, the Idle / Acquiring / Finalizing state machine
//!   that owns device connections and tasks.
//! - **`storage`**: Session CSV sink.
//! - **`replay`**: Import of recorded session CSV files.
//! - **`export`**: Session summary and the exporters that receive it.
//! - **`error`**: `DaqError` and `ReadError`.
//! - **`logging`**: Tracing subscriber setup.

pub mod config;
pub mod devices;
pub mod energy;
pub mod error;
pub mod export;
pub mod logging;
pub mod mailbox;
pub mod measurement;
pub mod replay;
pub mod serial;
pub mod session;
pub mod storage;
pub mod synchronizer;

pub use error::{AppResult, DaqError, ReadError};
pub use session::{SessionManager, SessionState};
