//! Wire-level parameter addressing for the instrument bus.
//!
//! Each device exposes numbered parameters addressed by a (process number,
//! parameter number) pair with a fixed data type. The polling loop issues one
//! batch read of [`POLL_PARAMETERS`] per device; the setpoint writer targets
//! the single writable parameter [`SETPOINT_PARAM`].

use serde::{Deserialize, Serialize};

/// Data type carried by a device parameter on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 32-bit IEEE float.
    Float,
}

/// Address of a readable device parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamRequest {
    /// Process number on the device.
    pub proc_nr: u8,
    /// Parameter number within the process.
    pub parm_nr: u8,
    /// Expected wire data type.
    pub parm_type: ParamType,
}

/// A parameter value as read from (or written to) a device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamValue {
    /// 16-bit signed integer payload.
    Int16(i16),
    /// 32-bit signed integer payload.
    Int32(i32),
    /// 32-bit float payload.
    Float(f32),
}

impl ParamValue {
    /// Returns the payload widened to `f64` for unit conversion.
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int16(v) => f64::from(*v),
            ParamValue::Int32(v) => f64::from(*v),
            ParamValue::Float(v) => f64::from(*v),
        }
    }
}

/// Batch-read parameter set polled from every matched device, in order:
/// measured value, active setpoint, temperature, valve output.
pub const POLL_PARAMETERS: [ParamRequest; 4] = [
    // Measure
    ParamRequest {
        proc_nr: 1,
        parm_nr: 0,
        parm_type: ParamType::Int16,
    },
    // Setpoint
    ParamRequest {
        proc_nr: 1,
        parm_nr: 1,
        parm_type: ParamType::Int16,
    },
    // Temperature
    ParamRequest {
        proc_nr: 33,
        parm_nr: 7,
        parm_type: ParamType::Float,
    },
    // Valve output
    ParamRequest {
        proc_nr: 114,
        parm_nr: 1,
        parm_type: ParamType::Int32,
    },
];

/// Number of the single writable setpoint parameter.
pub const SETPOINT_PARAM: u8 = 9;

/// Native setpoint full scale: 0-32000 maps to 0-100%.
///
/// Setpoint resolution is 1 part in 32000; percentage changes smaller than
/// ~0.003125% of full scale are unrepresentable and round away.
pub const SETPOINT_FULL_SCALE: i32 = 32_000;

/// Valve-output full scale (24-bit): raw counts map to a 0-1 fraction.
pub const VALVE_FULL_SCALE: i32 = 16_777_215;
