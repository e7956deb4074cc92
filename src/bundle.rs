//! Bundle device selection.
//!
//! A bundle is a named group of MFCs serving the same physical role but with
//! staggered full-scale capacities. For a requested flow the resolver picks
//! the single device to actuate: every candidate must be able to deliver the
//! flow (`flow <= capacity`) without dropping below its low-end cutoff
//! (`flow >= cutoff_fraction * capacity`, default 10%), and among candidates
//! the smallest capacity wins so the most granular instrument is used.
//!
//! No qualifying candidate is a normal empty outcome, not an error. When two
//! candidates share the minimal capacity the lexicographically smallest
//! serial wins, which keeps selection deterministic across runs.

use crate::config::DeviceRecord;

/// Default low-end cutoff as a fraction of full scale (10%).
pub const DEFAULT_CUTOFF_FRACTION: f64 = 0.10;

/// Selects the device to actuate for `requested_flow` among `candidates`.
///
/// Returns `None` when the request is below every candidate's cutoff floor
/// or above every candidate's capacity.
pub fn select_device<'a, I>(
    candidates: I,
    requested_flow: f64,
    cutoff_fraction: f64,
) -> Option<&'a DeviceRecord>
where
    I: IntoIterator<Item = &'a DeviceRecord>,
{
    candidates
        .into_iter()
        .filter(|d| {
            let capacity = d.m3n_h_capacity;
            cutoff_fraction * capacity <= requested_flow && requested_flow <= capacity
        })
        .min_by(|a, b| {
            a.m3n_h_capacity
                .total_cmp(&b.m3n_h_capacity)
                .then_with(|| a.serial.cmp(&b.serial))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn device(serial: &str, capacity: f64) -> DeviceRecord {
        DeviceRecord {
            serial: serial.into(),
            bundle: "jet_h2".into(),
            user_fluid: "h2".into(),
            factory_fluid: "n2".into(),
            conv_poly: [0.0, 1.0, 0.0, 0.0],
            calib_poly: [0.0, 1.0, 0.0, 0.0],
            factory_unit: "ln/min".into(),
            factory_capacity: capacity,
            m3n_h_capacity: capacity,
            last_calibration: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        }
    }

    #[test]
    fn picks_smallest_capable_device() {
        let bank = [device("A", 10.0), device("B", 50.0), device("C", 200.0)];
        // 10-capacity device tops out below 40; both others qualify, the
        // 50-capacity one is minimal.
        let picked = select_device(bank.iter(), 40.0, DEFAULT_CUTOFF_FRACTION).unwrap();
        assert_eq!(picked.serial, "B");
    }

    #[test]
    fn none_when_below_every_cutoff() {
        let bank = [device("A", 50.0), device("B", 200.0)];
        assert!(select_device(bank.iter(), 3.0, DEFAULT_CUTOFF_FRACTION).is_none());
    }

    #[test]
    fn none_when_above_every_capacity() {
        let bank = [device("A", 10.0), device("B", 50.0)];
        assert!(select_device(bank.iter(), 75.0, DEFAULT_CUTOFF_FRACTION).is_none());
    }

    #[test]
    fn boundary_flows_qualify() {
        let bank = [device("A", 50.0)];
        // Exactly at the cutoff floor and exactly at capacity both qualify.
        assert!(select_device(bank.iter(), 5.0, DEFAULT_CUTOFF_FRACTION).is_some());
        assert!(select_device(bank.iter(), 50.0, DEFAULT_CUTOFF_FRACTION).is_some());
    }

    #[test]
    fn equal_capacity_ties_break_by_serial() {
        let bank = [device("B2", 50.0), device("A1", 50.0)];
        let picked = select_device(bank.iter(), 40.0, DEFAULT_CUTOFF_FRACTION).unwrap();
        assert_eq!(picked.serial, "A1");
    }
}
