//! Transport seam for the shared instrument bus.
//!
//! The underlying field bus (RS-232 multidrop) offers exactly three
//! capabilities the core relies on: enumerate the nodes currently visible,
//! batch-read numbered parameters at an addressed node, and write a numbered
//! parameter at an addressed node. [`FlowBus`] models that capability as an
//! object-safe async trait; the wire codec behind it is protocol-library
//! territory and stays out of the core.
//!
//! [`BusOpener`] is the factory seam the device manager is constructed with,
//! so tests and offline runs inject [`mock::MockBusOpener`] while production
//! wiring supplies a real protocol driver.
//!
//! The transport has no multiplexing: the manager serializes all access
//! through a single mutex, and only one logical exchange is in flight at a
//! time.

pub mod mock;

use crate::error::{AppResult, FlowError};
use crate::params::{ParamRequest, ParamValue};
use async_trait::async_trait;

/// A node visible on the bus during enumeration.
///
/// Addresses are bus-local and transient; they are not stable across
/// re-enumeration, so the serial is the only durable identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Bus-local node address.
    pub address: u8,
    /// Device serial number.
    pub serial: String,
}

/// Addressed parameter I/O over the shared bus.
///
/// All methods are cancel-safe from the caller's perspective; callers apply
/// their own deadline (the manager wraps every exchange in
/// `tokio::time::timeout`). Implementations must not retry implicitly.
#[async_trait]
pub trait FlowBus: Send + Sync {
    /// Enumerates all nodes currently visible on the bus.
    async fn enumerate_nodes(&mut self) -> AppResult<Vec<NodeDescriptor>>;

    /// Reads a batch of parameters from the node at `address`, returning
    /// values in request order.
    async fn read_parameters(
        &mut self,
        address: u8,
        params: &[ParamRequest],
    ) -> AppResult<Vec<ParamValue>>;

    /// Writes a single parameter at the addressed node.
    async fn write_parameter(
        &mut self,
        address: u8,
        parm_nr: u8,
        value: ParamValue,
    ) -> AppResult<()>;

    /// Blinks the addressed device's indicator LED for physical
    /// identification.
    async fn wink(&mut self, address: u8) -> AppResult<()>;

    /// Releases the bus handle. Further I/O on this instance is an error.
    async fn close(&mut self) -> AppResult<()>;
}

/// Factory for opening a bus handle on a validated port descriptor.
#[async_trait]
pub trait BusOpener: Send + Sync {
    /// Opens the bus on `port` at `baudrate`.
    async fn open(&self, port: &str, baudrate: u32) -> AppResult<Box<dyn FlowBus>>;
}

/// Validates a platform-specific port descriptor before any I/O is attempted.
///
/// Windows ports look like `COMx`; macOS callout devices start with
/// `/dev/cu.`; other unixes get the `/dev/` prefix. An invalid descriptor is
/// a configuration fault, not a connection fault.
pub fn validate_port_descriptor(port: &str) -> AppResult<()> {
    let ok = if cfg!(target_os = "windows") {
        port.starts_with("COM")
    } else if cfg!(target_os = "macos") {
        port.starts_with("/dev/cu.")
    } else {
        port.starts_with("/dev/")
    };

    if ok {
        Ok(())
    } else {
        Err(FlowError::Configuration(format!(
            "Invalid port descriptor '{port}' for this platform"
        )))
    }
}

/// Lists serial ports present on this machine.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> AppResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| FlowError::Connection(format!("Failed to enumerate serial ports: {e}")))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_descriptor_validation() {
        if cfg!(target_os = "windows") {
            assert!(validate_port_descriptor("COM3").is_ok());
            assert!(validate_port_descriptor("/dev/ttyUSB0").is_err());
        } else if cfg!(target_os = "macos") {
            assert!(validate_port_descriptor("/dev/cu.usbserial-A4008T").is_ok());
            assert!(validate_port_descriptor("COM3").is_err());
        } else {
            assert!(validate_port_descriptor("/dev/ttyUSB0").is_ok());
            assert!(validate_port_descriptor("COM3").is_err());
        }
    }
}
