//! Two-stage calibration pipeline.
//!
//! Setpoints are requested as a percentage of full scale. Before a value is
//! sent to a device it passes through two per-device cubic polynomials from
//! the registry: the calibration polynomial corrects the device's measured
//! response curve, and the conversion polynomial maps between the factory
//! fluid and the fluid actually metered. Coefficients are stored lowest
//! order first.
//!
//! The polynomials are not guaranteed to pass exactly through (0,0) and
//! (100,100), but the device contract requires they behave as if they do at
//! the extremes, so the pipeline forces those endpoints exactly. No other
//! clamping happens here; range enforcement is the setpoint writer's job.

use crate::config::DeviceRecord;

/// Evaluates a cubic polynomial with coefficients ordered lowest first.
pub fn polyval(coeffs: &[f64; 4], x: f64) -> f64 {
    // Horner form over the reversed coefficient order.
    coeffs
        .iter()
        .rev()
        .fold(0.0, |acc, &c| acc.mul_add(x, c))
}

/// Runs `raw_percentage` through the device's calibration and conversion
/// polynomials, forcing exact passthrough at 0% and 100%.
pub fn calibrate(record: &DeviceRecord, raw_percentage: f64) -> f64 {
    if raw_percentage == 0.0 {
        return 0.0;
    }
    if raw_percentage == 100.0 {
        return 100.0;
    }
    let calibrated = polyval(&record.calib_poly, raw_percentage);
    polyval(&record.conv_poly, calibrated)
}

/// Converts a physical flow to a percentage of the device's full scale.
pub fn flow_to_percentage(record: &DeviceRecord, flow: f64) -> f64 {
    (flow / record.m3n_h_capacity) * 100.0
}

/// Converts a percentage of full scale back to a physical flow.
pub fn percentage_to_flow(record: &DeviceRecord, percentage: f64) -> f64 {
    (percentage / 100.0) * record.m3n_h_capacity
}

/// Quantizes a percentage to the device's native setpoint integer.
///
/// 0-100% maps to 0-32000; the device cannot resolve steps smaller than
/// 1/32000 of full scale.
pub fn quantize(percentage: f64) -> i16 {
    ((percentage / 100.0) * f64::from(crate::params::SETPOINT_FULL_SCALE)).round() as i16
}
