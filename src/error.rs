//! Custom error types for the application.
//!
//! This module defines the primary error type, `FlowError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from registry parsing problems to bus I/O faults.
//!
//! ## Error Hierarchy
//!
//! `FlowError` consolidates the failure taxonomy of the device manager:
//!
//! - **`Registry`** / **`Io`**: wrap `serde_yaml` and `std::io` errors raised
//!   while loading the device registry file.
//! - **`Configuration`**: semantic configuration faults that pass parsing but
//!   are logically invalid — a malformed port descriptor, a non-positive
//!   full-scale capacity. Raised eagerly at load or before any bus I/O.
//! - **`Connection`**: transport-level faults (bus open, read, write). A
//!   discovery that enumerates *zero* nodes is the distinct
//!   **`NoDevicesFound`** variant, not a transport error.
//! - **`DeviceNotConnected`** / **`UnknownDevice`** / **`UnknownBundle`**:
//!   an operation targeted a serial or bundle the current reconciliation or
//!   registry does not know about.
//! - **`SetpointOutOfRange`**: the post-calibration percentage left
//!   `[0, 100]`; the write is rejected before touching the bus.
//! - **`Timeout`**: a bounded bus exchange did not complete in time.
//!
//! Expected empty outcomes (no qualifying device in a bundle) are modelled as
//! `Option::None` by the callers, never as an error variant. Nothing in the
//! library panics on a failure path; every fallible operation returns
//! [`AppResult`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, FlowError>;

/// Application-wide error type for the MFC control core.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Registry file could not be parsed.
    #[error("Registry parse error: {0}")]
    Registry(#[from] serde_yaml::Error),

    /// I/O failure while reading the registry file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Semantic configuration fault (bad port descriptor, invalid entry).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level bus failure (open, enumerate, read or write).
    #[error("Bus connection error: {0}")]
    Connection(String),

    /// Bus enumeration succeeded but returned zero nodes.
    #[error("No devices found on the bus. Check connections and try again.")]
    NoDevicesFound,

    /// `connect` was called while a bus handle is already open.
    #[error("Already connected; disconnect before reconnecting")]
    AlreadyConnected,

    /// Operation requires an open bus handle but the manager is disconnected.
    #[error("Not connected to the bus")]
    NotConnected,

    /// Operation targeted a serial that is not in the matched device set.
    #[error("Device '{0}' is not connected")]
    DeviceNotConnected(String),

    /// Serial is not present in the device registry.
    #[error("Device '{0}' is not in the registry")]
    UnknownDevice(String),

    /// Bundle tag is not declared in the registry.
    #[error("Unknown bundle: '{0}'")]
    UnknownBundle(String),

    /// Post-calibration setpoint percentage left the writable range.
    #[error("Setpoint for '{serial}' out of range: {percent:.3}% (must be within 0-100%)")]
    SetpointOutOfRange {
        /// Target device serial.
        serial: String,
        /// Offending percentage after calibration.
        percent: f64,
    },

    /// A bounded bus exchange exceeded its deadline.
    #[error("Bus exchange timed out: {0}")]
    Timeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowError::DeviceNotConnected("M23208425A".to_string());
        assert_eq!(err.to_string(), "Device 'M23208425A' is not connected");
    }

    #[test]
    fn test_setpoint_error_display() {
        let err = FlowError::SetpointOutOfRange {
            serial: "M23208425A".into(),
            percent: 104.2,
        };
        assert!(err.to_string().contains("104.200%"));
    }
}
