//! Device registry loading and validation.
//!
//! The registry is a YAML file describing the installed MFC bank: connection
//! settings for the shared bus, the recognized fluid categories, the named
//! device bundles, and one entry per device keyed by serial number. It is
//! loaded once at startup, validated eagerly, and read-only thereafter.
//!
//! Validation is strict where a fault would corrupt control decisions
//! (polynomial arity, non-positive capacities fail the load) and lenient
//! where it would not (a device referencing a fluid outside the declared
//! categories only logs a warning, matching upstream behavior).

use crate::error::{AppResult, FlowError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Metadata block identifying the registry file itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigurationInfo {
    /// Person or group responsible for the configuration.
    pub owner: String,
    /// Configuration name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Last-updated date, free-form.
    pub date: String,
}

/// Bus connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Platform-specific port descriptor (`COM3`, `/dev/cu.usbserial-A4008T`).
    pub port: String,
    /// Serial baud rate.
    pub baudrate: u32,
}

/// Recognized fluid categories for the installation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FluidCategories {
    /// Fuel gases (zeroed by a soft abort).
    pub fuel: Vec<String>,
    /// Oxidizer gases.
    pub oxidizer: Vec<String>,
    /// Inert gases.
    pub inert_gases: Vec<String>,
    /// Anything else (calibration gases, mixtures).
    pub misc: Vec<String>,
}

impl FluidCategories {
    /// Returns true if `fluid` appears in any declared category.
    pub fn contains(&self, fluid: &str) -> bool {
        self.fuel.iter().any(|f| f == fluid)
            || self.oxidizer.iter().any(|f| f == fluid)
            || self.inert_gases.iter().any(|f| f == fluid)
            || self.misc.iter().any(|f| f == fluid)
    }

    /// Returns true if `fluid` is declared as a fuel.
    pub fn is_fuel(&self, fluid: &str) -> bool {
        self.fuel.iter().any(|f| f == fluid)
    }
}

/// Polling and I/O pacing settings.
///
/// Durations use humantime notation in the file (`"500ms"`, `"1s"`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollSettings {
    /// Cadence of the measurement polling loop.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub interval: Duration,
    /// Deadline applied to every individual bus exchange.
    #[serde(with = "humantime_serde", default = "default_io_timeout")]
    pub io_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            io_timeout: default_io_timeout(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Immutable per-device registry entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device serial number (registry key, repeated here).
    pub serial: String,
    /// Bundle tag grouping devices that serve the same physical role.
    pub bundle: String,
    /// Fluid the device meters in this installation.
    pub user_fluid: String,
    /// Fluid the device was calibrated with at the factory.
    pub factory_fluid: String,
    /// Conversion polynomial coefficients, lowest order first.
    pub conv_poly: [f64; 4],
    /// Calibration polynomial coefficients, lowest order first.
    pub calib_poly: [f64; 4],
    /// Factory flow unit (e.g. `ln/min`).
    pub factory_unit: String,
    /// Full-scale capacity in the factory unit.
    pub factory_capacity: f64,
    /// Normalized full-scale capacity in m³n/h.
    pub m3n_h_capacity: f64,
    /// Date of the last calibration.
    pub last_calibration: NaiveDate,
}

/// A named bundle and the registry serials assigned to it.
#[derive(Clone, Debug)]
pub struct Bundle {
    /// Bundle name as declared in the registry.
    pub name: String,
    /// Serials of member devices, in registry declaration order.
    pub serials: Vec<String>,
}

/// Raw file schema prior to validation.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    configuration_info: ConfigurationInfo,
    connection: ConnectionSettings,
    setup: FluidCategories,
    mfc_bundles: Vec<String>,
    #[serde(default)]
    polling: PollSettings,
    devices: BTreeMap<String, DeviceRecord>,
}

/// Validated, read-only device registry.
///
/// Outlives the device manager; callers share it behind an `Arc`.
#[derive(Clone, Debug)]
pub struct Registry {
    /// File metadata.
    pub info: ConfigurationInfo,
    /// Bus connection settings.
    pub connection: ConnectionSettings,
    /// Declared fluid categories.
    pub fluids: FluidCategories,
    /// Polling cadence and I/O deadlines.
    pub polling: PollSettings,
    /// Bundles in declaration order, each with its member serials.
    pub bundles: Vec<Bundle>,
    /// Device entries keyed by serial.
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl Registry {
    /// Loads and validates a registry from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Parses and validates a registry from YAML text.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        let file: RegistryFile = serde_yaml::from_str(text)?;
        Self::validate(file)
    }

    fn validate(file: RegistryFile) -> AppResult<Self> {
        let mut bundles: Vec<Bundle> = file
            .mfc_bundles
            .iter()
            .map(|name| Bundle {
                name: name.clone(),
                serials: Vec::new(),
            })
            .collect();

        for (serial, record) in &file.devices {
            if record.serial != *serial {
                return Err(FlowError::Configuration(format!(
                    "Device key '{serial}' does not match its serial field '{}'",
                    record.serial
                )));
            }
            if !(record.m3n_h_capacity > 0.0) || !(record.factory_capacity > 0.0) {
                return Err(FlowError::Configuration(format!(
                    "Device '{serial}' has a non-positive full-scale capacity"
                )));
            }
            if !file.setup.contains(&record.user_fluid) {
                warn!(
                    serial = %serial,
                    fluid = %record.user_fluid,
                    "device uses a fluid not declared in the setup categories"
                );
            }

            // A device belongs to the first declared bundle whose name occurs
            // in its tag ("jet_h2_a" joins "jet_h2").
            if let Some(bundle) = bundles.iter_mut().find(|b| record.bundle.contains(&b.name)) {
                bundle.serials.push(serial.clone());
            }
        }

        Ok(Self {
            info: file.configuration_info,
            connection: file.connection,
            fluids: file.setup,
            polling: file.polling,
            bundles,
            devices: file.devices,
        })
    }

    /// Looks up a device record by serial.
    pub fn device(&self, serial: &str) -> AppResult<&DeviceRecord> {
        self.devices
            .get(serial)
            .ok_or_else(|| FlowError::UnknownDevice(serial.to_string()))
    }

    /// Looks up a bundle by name.
    pub fn bundle(&self, name: &str) -> AppResult<&Bundle> {
        self.bundles
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| FlowError::UnknownBundle(name.to_string()))
    }
}
