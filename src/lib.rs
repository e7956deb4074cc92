//! Core library for the MFC bank control application.
//!
//! This library contains the device registry, the calibration pipeline, the
//! bus transport seam and the device manager for a bank of mass-flow
//! controllers sharing one serial bus. It is used by the CLI binary and by
//! any UI layer sitting on top of the manager's read-only views.

pub mod bundle;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod error;
pub mod manager;
pub mod params;
pub mod snapshot;

pub use config::Registry;
pub use error::{AppResult, FlowError};
pub use manager::{ConnectionState, DeviceManager, ReconciliationResult};
pub use snapshot::{DeviceReading, MeasurementSnapshot};
