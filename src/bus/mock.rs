//! Simulated instrument bank for tests and offline runs.
//!
//! `MockBank` stands in for a physical MFC bank: a set of addressable nodes
//! with per-device setpoint state, synthetic measurements, and scriptable
//! failure injection (enumeration, reads, writes, open, stalls). All bus
//! handles opened from one bank share its state, so a test can observe
//! writes made through the manager and flip failure modes mid-run.

use crate::bus::{BusOpener, FlowBus, NodeDescriptor};
use crate::error::{AppResult, FlowError};
use crate::params::{ParamRequest, ParamValue, SETPOINT_PARAM, VALVE_FULL_SCALE};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One simulated node on the mock bus.
#[derive(Clone, Debug)]
pub struct MockDevice {
    /// Bus-local node address.
    pub address: u8,
    /// Device serial number.
    pub serial: String,
}

/// State shared between a bank and every handle opened from it.
#[derive(Debug, Default)]
struct SharedState {
    setpoints: Mutex<HashMap<u8, i16>>,
    writes: Mutex<Vec<(u8, u8, ParamValue)>>,
    winks: Mutex<Vec<u8>>,
    fail_open: AtomicBool,
    fail_enumeration: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    stall_reads: AtomicBool,
    stall_writes: AtomicBool,
    batch_reads: AtomicU64,
    opens: AtomicU64,
}

/// Longer than any sane I/O deadline; a stalled exchange is expected to be
/// cancelled by the caller's timeout, never to run to completion.
const STALL: std::time::Duration = std::time::Duration::from_secs(30);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simulated MFC bank.
#[derive(Clone, Default)]
pub struct MockBank {
    devices: Vec<MockDevice>,
    state: Arc<SharedState>,
    jitter: bool,
}

impl MockBank {
    /// Creates an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the bank.
    pub fn with_device(mut self, address: u8, serial: &str) -> Self {
        self.devices.push(MockDevice {
            address,
            serial: serial.to_string(),
        });
        self
    }

    /// Enables measurement jitter (a few counts of noise on each read).
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Returns an opener that hands out bus handles sharing this bank's
    /// state.
    pub fn opener(&self) -> MockBusOpener {
        MockBusOpener {
            devices: self.devices.clone(),
            state: Arc::clone(&self.state),
            jitter: self.jitter,
        }
    }

    /// Makes the next `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Makes node enumeration fail.
    pub fn set_fail_enumeration(&self, fail: bool) {
        self.state.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Makes batch reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes parameter writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes batch reads hang until cancelled.
    pub fn set_stall_reads(&self, stall: bool) {
        self.state.stall_reads.store(stall, Ordering::SeqCst);
    }

    /// Makes parameter writes hang until cancelled.
    pub fn set_stall_writes(&self, stall: bool) {
        self.state.stall_writes.store(stall, Ordering::SeqCst);
    }

    /// Last setpoint written to the node at `address`, if any.
    pub fn setpoint(&self, address: u8) -> Option<i16> {
        lock(&self.state.setpoints).get(&address).copied()
    }

    /// All parameter writes seen so far, as (address, parameter, value).
    pub fn writes(&self) -> Vec<(u8, u8, ParamValue)> {
        lock(&self.state.writes).clone()
    }

    /// Addresses that received a wink command.
    pub fn winks(&self) -> Vec<u8> {
        lock(&self.state.winks).clone()
    }

    /// Number of batch reads served.
    pub fn batch_reads(&self) -> u64 {
        self.state.batch_reads.load(Ordering::SeqCst)
    }

    /// Number of handles successfully opened.
    pub fn opens(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }
}

/// [`BusOpener`] producing handles onto a [`MockBank`].
#[derive(Clone)]
pub struct MockBusOpener {
    devices: Vec<MockDevice>,
    state: Arc<SharedState>,
    jitter: bool,
}

#[async_trait]
impl BusOpener for MockBusOpener {
    async fn open(&self, port: &str, _baudrate: u32) -> AppResult<Box<dyn FlowBus>> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(FlowError::Connection(format!(
                "Simulated failure opening '{port}'"
            )));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBus {
            devices: self.devices.clone(),
            state: Arc::clone(&self.state),
            jitter: self.jitter,
            closed: false,
        }))
    }
}

/// One open handle onto the simulated bank.
pub struct MockBus {
    devices: Vec<MockDevice>,
    state: Arc<SharedState>,
    jitter: bool,
    closed: bool,
}

impl MockBus {
    fn check_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(FlowError::Connection("Bus handle is closed".into()));
        }
        Ok(())
    }

    fn node(&self, address: u8) -> AppResult<&MockDevice> {
        self.devices
            .iter()
            .find(|d| d.address == address)
            .ok_or_else(|| FlowError::Connection(format!("No node at address {address}")))
    }
}

#[async_trait]
impl FlowBus for MockBus {
    async fn enumerate_nodes(&mut self) -> AppResult<Vec<NodeDescriptor>> {
        self.check_open()?;
        if self.state.fail_enumeration.load(Ordering::SeqCst) {
            return Err(FlowError::Connection("Simulated enumeration failure".into()));
        }
        Ok(self
            .devices
            .iter()
            .map(|d| NodeDescriptor {
                address: d.address,
                serial: d.serial.clone(),
            })
            .collect())
    }

    async fn read_parameters(
        &mut self,
        address: u8,
        params: &[ParamRequest],
    ) -> AppResult<Vec<ParamValue>> {
        self.check_open()?;
        if self.state.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(FlowError::Connection("Simulated read failure".into()));
        }
        self.node(address)?;
        self.state.batch_reads.fetch_add(1, Ordering::SeqCst);

        let setpoint = lock(&self.state.setpoints)
            .get(&address)
            .copied()
            .unwrap_or(0);
        let noise: i16 = if self.jitter {
            rand::thread_rng().gen_range(-3..=3)
        } else {
            0
        };

        Ok(params
            .iter()
            .map(|p| match (p.proc_nr, p.parm_nr) {
                // Measure tracks the commanded setpoint.
                (1, 0) => ParamValue::Int16(setpoint.saturating_add(noise)),
                (1, 1) => ParamValue::Int16(setpoint),
                (33, 7) => ParamValue::Float(23.5),
                (114, 1) => ParamValue::Int32(
                    (i64::from(setpoint) * i64::from(VALVE_FULL_SCALE) / 32_000) as i32,
                ),
                _ => ParamValue::Int16(0),
            })
            .collect())
    }

    async fn write_parameter(
        &mut self,
        address: u8,
        parm_nr: u8,
        value: ParamValue,
    ) -> AppResult<()> {
        self.check_open()?;
        if self.state.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(FlowError::Connection("Simulated write failure".into()));
        }
        self.node(address)?;
        lock(&self.state.writes).push((address, parm_nr, value));
        if parm_nr == SETPOINT_PARAM {
            if let ParamValue::Int16(v) = value {
                lock(&self.state.setpoints).insert(address, v);
            }
        }
        Ok(())
    }

    async fn wink(&mut self, address: u8) -> AppResult<()> {
        self.check_open()?;
        self.node(address)?;
        lock(&self.state.winks).push(address);
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::POLL_PARAMETERS;

    #[tokio::test]
    async fn setpoint_write_is_observable() {
        let bank = MockBank::new().with_device(3, "M2320001A");
        let mut bus = bank.opener().open("/dev/cu.mock", 38400).await.unwrap();
        bus.write_parameter(3, SETPOINT_PARAM, ParamValue::Int16(16_000))
            .await
            .unwrap();
        assert_eq!(bank.setpoint(3), Some(16_000));

        let values = bus.read_parameters(3, &POLL_PARAMETERS).await.unwrap();
        assert_eq!(values[0], ParamValue::Int16(16_000));
        assert_eq!(values[1], ParamValue::Int16(16_000));
    }

    #[tokio::test]
    async fn closed_handle_rejects_io() {
        let bank = MockBank::new().with_device(3, "M2320001A");
        let mut bus = bank.opener().open("/dev/cu.mock", 38400).await.unwrap();
        bus.close().await.unwrap();
        assert!(bus.enumerate_nodes().await.is_err());
    }
}
