//! The device manager.
//!
//! Owns the single bus handle, the connection state machine, the
//! device-to-registry reconciliation, the setpoint path (validate →
//! calibrate → quantize → write) and the background polling task. One
//! manager is constructed per process and passed by handle; the type is
//! cheaply cloneable and all clones share the same state.
//!
//! # Concurrency
//!
//! The transport has no multiplexing, so every bus exchange — discovery, a
//! setpoint write, one device's batch read — runs under a single
//! `tokio::sync::Mutex`. The polling task and user-initiated writes
//! interleave between exchanges but never overlap within one. Every exchange
//! carries the registry's `io_timeout` deadline; nothing blocks
//! indefinitely.
//!
//! Measurements are published through a `watch` channel as
//! `Arc<MeasurementSnapshot>`: each successful cycle replaces the snapshot
//! wholesale, so concurrent readers are lock-free and never observe a
//! half-updated cycle.

use crate::bundle;
use crate::bus::{validate_port_descriptor, BusOpener, FlowBus};
use crate::calibration;
use crate::config::Registry;
use crate::error::{AppResult, FlowError};
use crate::params::{ParamValue, POLL_PARAMETERS, SETPOINT_PARAM};
use crate::snapshot::{DeviceReading, MeasurementSnapshot};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of the manager's single bus handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No bus handle open.
    Disconnected,
    /// Port validated, handle being opened / discovery running.
    Connecting,
    /// Handle open, discovery succeeded.
    Connected,
    /// A transport fault dropped the handle; explicit reconnect required.
    Error,
}

/// Outcome of one discovery cycle: the live bus partitioned against the
/// registry. Rebuilt wholesale every cycle, never patched incrementally
/// (addresses are not stable across re-enumeration).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Serial → bus address for devices present on both bus and registry.
    pub matched: BTreeMap<String, u8>,
    /// Registry serials absent from the bus (no address).
    pub missing: BTreeSet<String>,
    /// Serial → bus address for devices on the bus but not in the registry.
    pub unexpected: BTreeMap<String, u8>,
}

struct PollTask {
    handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

struct Inner {
    registry: Arc<Registry>,
    opener: Box<dyn BusOpener>,
    /// The single bus handle; the mutex serializes every exchange.
    bus: Mutex<Option<Box<dyn FlowBus>>>,
    /// Serializes connection-state transitions (connect, discover,
    /// teardown) so check-and-set on `state` is atomic. Never held while
    /// awaiting the bus mutex with the poll task alive, which keeps
    /// teardown free of lock cycles.
    transitions: Mutex<()>,
    state: RwLock<ConnectionState>,
    reconciliation: RwLock<ReconciliationResult>,
    snapshot_tx: watch::Sender<Arc<MeasurementSnapshot>>,
    poll_task: StdMutex<Option<PollTask>>,
    cycle: AtomicU64,
}

/// Handle to the device manager. Clones share all state.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

impl DeviceManager {
    /// Creates a manager over a loaded registry and an injected bus opener.
    ///
    /// The caller enforces "one manager per process"; nothing here is a
    /// process-wide singleton.
    pub fn new(registry: Arc<Registry>, opener: Box<dyn BusOpener>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(MeasurementSnapshot::default()));
        Self {
            inner: Arc::new(Inner {
                registry,
                opener,
                bus: Mutex::new(None),
                transitions: Mutex::new(()),
                state: RwLock::new(ConnectionState::Disconnected),
                reconciliation: RwLock::new(ReconciliationResult::default()),
                snapshot_tx,
                poll_task: StdMutex::new(None),
                cycle: AtomicU64::new(0),
            }),
        }
    }

    /// The registry this manager was constructed with.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the latest reconciliation result.
    pub fn reconciliation(&self) -> ReconciliationResult {
        self.inner
            .reconciliation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The currently published measurement snapshot.
    pub fn snapshot(&self) -> Arc<MeasurementSnapshot> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Subscribes to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MeasurementSnapshot>> {
        self.inner.snapshot_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        *self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn matched_address(&self, serial: &str) -> AppResult<u8> {
        self.inner
            .reconciliation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matched
            .get(serial)
            .copied()
            .ok_or_else(|| FlowError::DeviceNotConnected(serial.to_string()))
    }

    /// Applies the registry's I/O deadline to one bus exchange.
    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        match tokio::time::timeout(self.inner.registry.polling.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::Timeout(what.to_string())),
        }
    }

    /// Validates the configured port, opens the bus and runs discovery.
    ///
    /// Fails fast with a configuration error on a malformed port descriptor,
    /// before any bus I/O. Calling while already connected is an error. Any
    /// failure after the handle opened tears it down and leaves the manager
    /// in the `Error` state.
    pub async fn connect(&self) -> AppResult<ReconciliationResult> {
        // Hold the transition lock for the whole sequence: concurrent
        // connects serialize here, so at most one ever opens a handle.
        let _transition = self.inner.transitions.lock().await;
        match self.connection_state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                return Err(FlowError::AlreadyConnected)
            }
            ConnectionState::Disconnected | ConnectionState::Error => {}
        }

        let settings = &self.inner.registry.connection;
        validate_port_descriptor(&settings.port)?;
        self.set_state(ConnectionState::Connecting);

        let handle = match self.inner.opener.open(&settings.port, settings.baudrate).await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(ConnectionState::Error);
                return Err(e);
            }
        };
        *self.inner.bus.lock().await = Some(handle);
        info!(port = %settings.port, baudrate = settings.baudrate, "bus opened");

        match self.run_discovery().await {
            Ok(result) => {
                *self
                    .inner
                    .reconciliation
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = result.clone();
                self.set_state(ConnectionState::Connected);
                info!(
                    matched = result.matched.len(),
                    missing = result.missing.len(),
                    unexpected = result.unexpected.len(),
                    "discovery complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.teardown_locked(ConnectionState::Error).await;
                Err(e)
            }
        }
    }

    /// Enumerates the bus and reconciles it against the registry.
    ///
    /// Replaces the previous reconciliation entirely. A transport failure
    /// (or an empty bus) drops the handle and leaves the `Error` state; the
    /// caller must reconnect explicitly.
    pub async fn discover(&self) -> AppResult<ReconciliationResult> {
        let _transition = self.inner.transitions.lock().await;
        match self.run_discovery().await {
            Ok(result) => {
                *self
                    .inner
                    .reconciliation
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = result.clone();
                Ok(result)
            }
            Err(e) => {
                self.teardown_locked(ConnectionState::Error).await;
                Err(e)
            }
        }
    }

    async fn run_discovery(&self) -> AppResult<ReconciliationResult> {
        let mut guard = self.inner.bus.lock().await;
        let bus = guard.as_mut().ok_or(FlowError::NotConnected)?;

        let nodes = self
            .bounded("node enumeration", bus.enumerate_nodes())
            .await?;
        if nodes.is_empty() {
            return Err(FlowError::NoDevicesFound);
        }

        let mut result = ReconciliationResult::default();
        for node in nodes {
            if node.serial.is_empty() {
                continue;
            }
            if self.inner.registry.devices.contains_key(&node.serial) {
                result.matched.insert(node.serial, node.address);
            } else {
                result.unexpected.insert(node.serial, node.address);
            }
        }
        for serial in self.inner.registry.devices.keys() {
            if !result.matched.contains_key(serial) {
                result.missing.insert(serial.clone());
            }
        }
        Ok(result)
    }

    /// Writes a setpoint to a single device.
    ///
    /// `value` is a percentage of full scale when `is_percentage` is set,
    /// otherwise a physical flow in m³n/h converted through the device's
    /// capacity. Unless `bypass` is set the value passes through the
    /// calibration pipeline. A post-calibration percentage outside
    /// `[0, 100]` is rejected before any bus traffic.
    pub async fn write_setpoint(
        &self,
        serial: &str,
        value: f64,
        is_percentage: bool,
        bypass: bool,
    ) -> AppResult<()> {
        let record = self.inner.registry.device(serial)?;

        let percentage = if is_percentage {
            value
        } else {
            calibration::flow_to_percentage(record, value)
        };
        let target = if bypass {
            percentage
        } else {
            calibration::calibrate(record, percentage)
        };

        if !(0.0..=100.0).contains(&target) {
            return Err(FlowError::SetpointOutOfRange {
                serial: serial.to_string(),
                percent: target,
            });
        }

        let address = self.matched_address(serial)?;
        let native = calibration::quantize(target);
        self.write_native_setpoint(address, native).await?;
        debug!(serial, address, native, percent = target, "setpoint written");
        Ok(())
    }

    /// Resolves the best device in `bundle` for `flow` (m³n/h) and writes
    /// the setpoint to it.
    ///
    /// Returns the serial actually actuated, or `Ok(None)` when no bundle
    /// member qualifies — a normal outcome, not an error. Candidate window
    /// and selection order are documented on
    /// [`bundle::select_device`].
    pub async fn write_setpoint_bundle(
        &self,
        bundle_name: &str,
        flow: f64,
        cutoff_fraction: f64,
        bypass: bool,
    ) -> AppResult<Option<String>> {
        let members = self.inner.registry.bundle(bundle_name)?;
        let records = members
            .serials
            .iter()
            .filter_map(|s| self.inner.registry.devices.get(s));

        let Some(record) = bundle::select_device(records, flow, cutoff_fraction) else {
            debug!(bundle = bundle_name, flow, "no qualifying device in bundle");
            return Ok(None);
        };
        let serial = record.serial.clone();
        self.write_setpoint(&serial, flow, false, bypass).await?;
        Ok(Some(serial))
    }

    async fn write_native_setpoint(&self, address: u8, native: i16) -> AppResult<()> {
        let mut guard = self.inner.bus.lock().await;
        let bus = guard.as_mut().ok_or(FlowError::NotConnected)?;
        self.bounded(
            "setpoint write",
            bus.write_parameter(address, SETPOINT_PARAM, ParamValue::Int16(native)),
        )
        .await
    }

    /// Blinks a matched device's indicator for physical identification.
    pub async fn wink(&self, serial: &str) -> AppResult<()> {
        let address = self.matched_address(serial)?;
        let mut guard = self.inner.bus.lock().await;
        let bus = guard.as_mut().ok_or(FlowError::NotConnected)?;
        self.bounded("wink", bus.wink(address)).await
    }

    /// Writes setpoint 0 to every matched device, best effort.
    ///
    /// Individual write failures are logged and do not stop the sweep; a
    /// failed device's state is unaffected by the others.
    pub async fn abort_all(&self) -> AppResult<()> {
        let matched = self.reconciliation().matched;
        for (serial, address) in matched {
            if let Err(e) = self.write_native_setpoint(address, 0).await {
                warn!(serial = %serial, error = %e, "abort write failed");
            }
        }
        Ok(())
    }

    /// Zeroes every matched device metering a fuel.
    ///
    /// The upstream installation purges with N₂ first; no purge relay is
    /// fitted here, so the purge step only logs.
    pub async fn soft_abort(&self) -> AppResult<()> {
        warn!("no purge relay fitted; skipping N2 purge before fuel shutdown");
        let matched = self.reconciliation().matched;
        for (serial, address) in matched {
            let record = self.inner.registry.device(&serial)?;
            if self.inner.registry.fluids.is_fuel(&record.user_fluid) {
                if let Err(e) = self.write_native_setpoint(address, 0).await {
                    warn!(serial = %serial, error = %e, "fuel abort write failed");
                }
            }
        }
        Ok(())
    }

    /// Starts the background polling task.
    ///
    /// No-op when a task is already running. The task batch-reads every
    /// matched device each interval and publishes a new snapshot; a failed
    /// tick is logged and swallowed, leaving the previous snapshot visible.
    pub fn start_polling(&self) -> AppResult<()> {
        // Take the task slot before checking state: teardown flips the state
        // before draining this slot, so either the check fails here or the
        // teardown's drain finds (and stops) the task installed below. A
        // task can never outlive its bus handle.
        let mut slot = self
            .inner
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.connection_state() != ConnectionState::Connected {
            return Err(FlowError::NotConnected);
        }
        if slot.is_some() {
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let manager = self.clone();
        let interval = self.inner.registry.polling.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(?interval, "polling started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("polling stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.poll_once().await {
                            warn!(error = %e, "poll tick failed; keeping previous snapshot");
                        }
                    }
                }
            }
        });

        *slot = Some(PollTask {
            handle,
            shutdown_tx,
        });
        Ok(())
    }

    /// Stops the polling task deterministically, waiting for it to exit.
    pub async fn stop_polling(&self) {
        let task = self
            .inner
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(());
            let _ = task.handle.await;
        }
    }

    /// Runs one poll cycle: batch-reads every matched device and publishes a
    /// brand-new snapshot on success. Exposed for callers that poll on their
    /// own cadence.
    pub async fn poll_once(&self) -> AppResult<()> {
        let matched = self.reconciliation().matched;

        let mut readings = BTreeMap::new();
        {
            let mut guard = self.inner.bus.lock().await;
            let bus = guard.as_mut().ok_or(FlowError::NotConnected)?;
            for (serial, address) in matched {
                let record = self.inner.registry.device(&serial)?;
                let started = Instant::now();
                let values = self
                    .bounded("batch read", bus.read_parameters(address, &POLL_PARAMETERS))
                    .await?;
                let latency_ms =
                    (started.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0;
                readings.insert(
                    serial,
                    DeviceReading::from_raw(&values, record.m3n_h_capacity, latency_ms)?,
                );
            }
        }

        let cycle = self.inner.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.snapshot_tx.send_replace(Arc::new(MeasurementSnapshot {
            cycle,
            captured_at: Some(Utc::now()),
            readings,
        }));
        Ok(())
    }

    /// Stops polling, closes the bus handle and resets to `Disconnected`.
    pub async fn disconnect(&self) {
        self.teardown(ConnectionState::Disconnected).await;
        info!("disconnected");
    }

    async fn teardown(&self, state: ConnectionState) {
        let _transition = self.inner.transitions.lock().await;
        self.teardown_locked(state).await;
    }

    /// Teardown body; the caller holds the transition lock.
    ///
    /// The state flips before the task slot is drained so that a racing
    /// `start_polling` either sees the new state or installs a task this
    /// drain stops.
    async fn teardown_locked(&self, state: ConnectionState) {
        self.set_state(state);
        self.stop_polling().await;
        {
            let mut guard = self.inner.bus.lock().await;
            if let Some(mut bus) = guard.take() {
                if let Err(e) = bus.close().await {
                    warn!(error = %e, "error closing bus handle");
                }
            }
        }
        *self
            .inner
            .reconciliation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ReconciliationResult::default();
    }
}
