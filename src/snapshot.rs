//! Published measurement state.
//!
//! Each successful poll cycle produces a brand-new [`MeasurementSnapshot`]
//! that replaces the previous one wholesale through a `tokio::sync::watch`
//! channel of `Arc<MeasurementSnapshot>`. Readers clone the `Arc` and see an
//! internally consistent snapshot; a cycle that fails publishes nothing, so
//! the previous snapshot stays visible until the next success.

use crate::error::{AppResult, FlowError};
use crate::params::{ParamValue, SETPOINT_FULL_SCALE, VALVE_FULL_SCALE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Live readings for one device, in engineering units.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceReading {
    /// Measured flow in m³n/h (raw counts scaled by full-scale capacity).
    pub flow: f64,
    /// Active setpoint as a fraction of full scale (0-1).
    pub setpoint_fraction: f64,
    /// Device temperature in °C, rounded to 2 decimals.
    pub temperature_c: f64,
    /// Valve output as a fraction of full travel (0-1).
    pub valve_fraction: f64,
    /// Round-trip latency of the batch read in milliseconds.
    pub latency_ms: f64,
}

impl DeviceReading {
    /// Converts one raw batch read (measure, setpoint, temperature, valve
    /// output — the [`crate::params::POLL_PARAMETERS`] order) to engineering
    /// units for a device with the given full-scale capacity.
    pub fn from_raw(values: &[ParamValue], capacity: f64, latency_ms: f64) -> AppResult<Self> {
        let [measure, setpoint, temperature, valve] = values else {
            return Err(FlowError::Connection(format!(
                "Batch read returned {} values, expected 4",
                values.len()
            )));
        };
        let full_scale = f64::from(SETPOINT_FULL_SCALE);
        Ok(Self {
            flow: measure.as_f64() / full_scale * capacity,
            setpoint_fraction: setpoint.as_f64() / full_scale,
            temperature_c: (temperature.as_f64() * 100.0).round() / 100.0,
            valve_fraction: valve.as_f64() / f64::from(VALVE_FULL_SCALE),
            latency_ms,
        })
    }
}

/// One complete poll cycle over all matched devices.
///
/// Immutable after construction; the manager only ever publishes a new
/// instance, never edits a published one.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MeasurementSnapshot {
    /// Monotonic poll-cycle counter (0 for the initial empty snapshot).
    pub cycle: u64,
    /// Capture time of the cycle.
    pub captured_at: Option<DateTime<Utc>>,
    /// Readings keyed by device serial.
    pub readings: BTreeMap<String, DeviceReading>,
}
