//! Integration tests for the device manager over a simulated bank.

use mfc_daq::bundle::DEFAULT_CUTOFF_FRACTION;
use mfc_daq::bus::mock::MockBank;
use mfc_daq::{ConnectionState, DeviceManager, FlowError, Registry};
use std::sync::Arc;
use std::time::Duration;

fn test_port() -> &'static str {
    if cfg!(target_os = "windows") {
        "COM3"
    } else if cfg!(target_os = "macos") {
        "/dev/cu.mockbank"
    } else {
        "/dev/ttyUSB0"
    }
}

fn registry_yaml(port: &str) -> String {
    format!(
        r#"
configuration_info:
  owner: lab
  name: test-bank
  description: integration test bank
  date: "2025-06-01"
connection:
  port: {port}
  baudrate: 38400
setup:
  fuel: [h2, ch4]
  oxidizer: [o2, air]
  inert_gases: [n2]
  misc: []
mfc_bundles: [jet_h2, purge_n2]
polling:
  interval: 20ms
  io_timeout: 200ms
devices:
  MFC010:
    serial: MFC010
    bundle: jet_h2_small
    user_fluid: h2
    factory_fluid: n2
    conv_poly: [0.0, 1.0, 0.0, 0.0]
    calib_poly: [0.0, 1.0, 0.0, 0.0]
    factory_unit: ln/min
    factory_capacity: 10.0
    m3n_h_capacity: 10.0
    last_calibration: 2024-11-20
  MFC050:
    serial: MFC050
    bundle: jet_h2_mid
    user_fluid: h2
    factory_fluid: n2
    conv_poly: [0.0, 1.0, 0.0, 0.0]
    calib_poly: [0.0, 1.0, 0.0, 0.0]
    factory_unit: ln/min
    factory_capacity: 50.0
    m3n_h_capacity: 50.0
    last_calibration: 2024-11-20
  MFC200:
    serial: MFC200
    bundle: jet_h2_large
    user_fluid: h2
    factory_fluid: n2
    conv_poly: [0.0, 1.0, 0.0, 0.0]
    calib_poly: [0.0, 1.0, 0.0, 0.0]
    factory_unit: ln/min
    factory_capacity: 200.0
    m3n_h_capacity: 200.0
    last_calibration: 2024-11-20
  MFCHOT:
    serial: MFCHOT
    bundle: misc_cal
    user_fluid: ch4
    factory_fluid: ch4
    conv_poly: [0.0, 1.0, 0.0, 0.0]
    calib_poly: [0.0, 1.2, 0.0, 0.0]
    factory_unit: ln/min
    factory_capacity: 1.0
    m3n_h_capacity: 1.0
    last_calibration: 2024-11-20
  MFCN2:
    serial: MFCN2
    bundle: purge_n2
    user_fluid: n2
    factory_fluid: n2
    conv_poly: [0.0, 1.0, 0.0, 0.0]
    calib_poly: [0.0, 1.0, 0.0, 0.0]
    factory_unit: ln/min
    factory_capacity: 50.0
    m3n_h_capacity: 50.0
    last_calibration: 2024-11-20
"#
    )
}

fn test_registry() -> Arc<Registry> {
    Arc::new(Registry::from_yaml(&registry_yaml(test_port())).expect("valid test registry"))
}

/// Full bank: every registry device present on the bus.
fn full_bank() -> MockBank {
    MockBank::new()
        .with_device(3, "MFC010")
        .with_device(4, "MFC050")
        .with_device(5, "MFC200")
        .with_device(6, "MFCHOT")
        .with_device(7, "MFCN2")
}

fn manager_over(bank: &MockBank) -> DeviceManager {
    DeviceManager::new(test_registry(), Box::new(bank.opener()))
}

async fn connected_manager(bank: &MockBank) -> DeviceManager {
    let manager = manager_over(bank);
    manager.connect().await.expect("connect");
    manager
}

#[tokio::test]
async fn connect_reconciles_bus_against_registry() {
    // Registry has 5 devices; bus carries 3 of them plus an unknown node.
    let bank = MockBank::new()
        .with_device(4, "MFC050")
        .with_device(5, "MFC200")
        .with_device(6, "MFCHOT")
        .with_device(9, "GHOST01");
    let manager = manager_over(&bank);

    let result = manager.connect().await.expect("connect");
    assert_eq!(manager.connection_state(), ConnectionState::Connected);

    let matched: Vec<_> = result.matched.keys().cloned().collect();
    assert_eq!(matched, vec!["MFC050", "MFC200", "MFCHOT"]);
    assert_eq!(result.matched["MFC050"], 4);

    let missing: Vec<_> = result.missing.iter().cloned().collect();
    assert_eq!(missing, vec!["MFC010", "MFCN2"]);

    let unexpected: Vec<_> = result.unexpected.keys().cloned().collect();
    assert_eq!(unexpected, vec!["GHOST01"]);
}

#[tokio::test]
async fn invalid_port_descriptor_fails_before_any_io() {
    let bank = full_bank();
    let yaml = registry_yaml("bogus-port");
    let registry = Arc::new(Registry::from_yaml(&yaml).expect("valid yaml"));
    let manager = DeviceManager::new(registry, Box::new(bank.opener()));

    let err = manager.connect().await.expect_err("must fail");
    assert!(matches!(err, FlowError::Configuration(_)));
    // The opener was never reached and no bus traffic happened.
    assert_eq!(bank.batch_reads(), 0);
    assert!(bank.writes().is_empty());
}

#[tokio::test]
async fn connecting_twice_is_an_error() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;
    assert!(matches!(
        manager.connect().await.expect_err("second connect"),
        FlowError::AlreadyConnected
    ));
}

#[tokio::test]
async fn empty_bus_is_no_devices_found() {
    let bank = MockBank::new();
    let manager = manager_over(&bank);
    assert!(matches!(
        manager.connect().await.expect_err("empty bus"),
        FlowError::NoDevicesFound
    ));
    assert_eq!(manager.connection_state(), ConnectionState::Error);
}

#[tokio::test]
async fn enumeration_failure_requires_explicit_reconnect() {
    let bank = full_bank();
    bank.set_fail_enumeration(true);
    let manager = manager_over(&bank);

    assert!(matches!(
        manager.connect().await.expect_err("enumeration fails"),
        FlowError::Connection(_)
    ));
    assert_eq!(manager.connection_state(), ConnectionState::Error);

    // Recovery is an explicit reconnect, not an implicit retry.
    bank.set_fail_enumeration(false);
    manager.connect().await.expect("reconnect");
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn percentage_setpoint_quantizes_to_native_range() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    manager
        .write_setpoint("MFC050", 50.0, true, true)
        .await
        .expect("write");
    assert_eq!(bank.setpoint(4), Some(16_000));
}

#[tokio::test]
async fn flow_setpoint_converts_through_capacity() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    // 25 m3n/h on a 50 m3n/h device is 50% of full scale.
    manager
        .write_setpoint("MFC050", 25.0, false, true)
        .await
        .expect("write");
    assert_eq!(bank.setpoint(4), Some(16_000));
}

#[tokio::test]
async fn calibration_pipeline_shapes_the_written_value() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    // MFCHOT's calibration slope is 1.2: 50% in, 60% on the wire.
    manager
        .write_setpoint("MFCHOT", 50.0, true, false)
        .await
        .expect("write");
    assert_eq!(bank.setpoint(6), Some(19_200));
}

#[tokio::test]
async fn out_of_range_setpoint_is_rejected_without_bus_write() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    // 95% through the 1.2 slope lands at 114%.
    let err = manager
        .write_setpoint("MFCHOT", 95.0, true, false)
        .await
        .expect_err("must reject");
    assert!(matches!(err, FlowError::SetpointOutOfRange { .. }));
    assert!(bank.writes().is_empty());
}

#[tokio::test]
async fn setpoint_to_unmatched_device_fails() {
    // MFCN2 is registered but not on the bus.
    let bank = MockBank::new().with_device(4, "MFC050");
    let manager = connected_manager(&bank).await;

    let err = manager
        .write_setpoint("MFCN2", 10.0, true, true)
        .await
        .expect_err("not on bus");
    assert!(matches!(err, FlowError::DeviceNotConnected(_)));
    assert!(bank.writes().is_empty());
}

#[tokio::test]
async fn bundle_write_picks_smallest_capable_device() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    // 40 m3n/h: the 10-capacity device tops out, 50 and 200 qualify,
    // 50 is minimal.
    let selected = manager
        .write_setpoint_bundle("jet_h2", 40.0, DEFAULT_CUTOFF_FRACTION, false)
        .await
        .expect("bundle write");
    assert_eq!(selected.as_deref(), Some("MFC050"));
    // 40/50 = 80% of full scale.
    assert_eq!(bank.setpoint(4), Some(25_600));
}

#[tokio::test]
async fn bundle_write_below_every_cutoff_is_a_normal_miss() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    let selected = manager
        .write_setpoint_bundle("jet_h2", 0.5, DEFAULT_CUTOFF_FRACTION, false)
        .await
        .expect("bundle write");
    assert_eq!(selected, None);
    assert!(bank.writes().is_empty());
}

#[tokio::test]
async fn unknown_bundle_is_a_typed_error() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;
    assert!(matches!(
        manager
            .write_setpoint_bundle("nope", 1.0, DEFAULT_CUTOFF_FRACTION, false)
            .await
            .expect_err("unknown bundle"),
        FlowError::UnknownBundle(_)
    ));
}

#[tokio::test]
async fn polling_publishes_complete_immutable_snapshots() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;
    let mut rx = manager.subscribe();

    manager.start_polling().expect("start polling");

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("first cycle in time")
        .expect("sender alive");

    let first = manager.snapshot();
    let first_copy = (*first).clone();
    assert_eq!(first.readings.len(), 5, "snapshot covers all matched devices");
    assert!(first.cycle >= 1);
    assert!(first.captured_at.is_some());

    // Let several more cycles publish.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The snapshot we hold was replaced, never mutated: its contents are
    // exactly what we copied, so no reader can see mixed cycles.
    assert_eq!(first.cycle, first_copy.cycle);
    assert_eq!(first.readings, first_copy.readings);

    let later = manager.snapshot();
    assert!(later.cycle > first.cycle);
    assert_eq!(later.readings.len(), 5);

    manager.disconnect().await;
}

#[tokio::test]
async fn failed_tick_keeps_previous_snapshot_and_task_alive() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;
    let mut rx = manager.subscribe();
    manager.start_polling().expect("start polling");

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("first cycle")
        .expect("sender alive");

    bank.set_fail_reads(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    let frozen = manager.snapshot();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // No publication while every tick fails.
    assert_eq!(manager.snapshot().cycle, frozen.cycle);

    // The task survived and resumes publishing once reads recover.
    bank.set_fail_reads(false);
    let _ = rx.borrow_and_update();
    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("recovered cycle")
        .expect("sender alive");
    assert!(manager.snapshot().cycle > frozen.cycle);

    manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_stops_polling_deterministically() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;
    manager.start_polling().expect("start polling");
    tokio::time::sleep(Duration::from_millis(60)).await;

    manager.disconnect().await;
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(manager.reconciliation().matched.is_empty());

    let reads_after_stop = bank.batch_reads();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Nothing polls a closed handle.
    assert_eq!(bank.batch_reads(), reads_after_stop);
}

#[tokio::test]
async fn abort_all_zeroes_every_matched_device() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    manager.write_setpoint("MFC050", 80.0, true, true).await.expect("write");
    manager.write_setpoint("MFCN2", 40.0, true, true).await.expect("write");

    manager.abort_all().await.expect("abort");
    for address in [3, 4, 5, 6, 7] {
        assert_eq!(bank.setpoint(address), Some(0), "address {address}");
    }
}

#[tokio::test]
async fn soft_abort_zeroes_only_fuel_devices() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    manager.write_setpoint("MFC050", 80.0, true, true).await.expect("write");
    manager.write_setpoint("MFCN2", 40.0, true, true).await.expect("write");

    manager.soft_abort().await.expect("soft abort");
    // h2 device zeroed, inert n2 device untouched.
    assert_eq!(bank.setpoint(4), Some(0));
    assert_eq!(bank.setpoint(7), Some(12_800));
}

#[tokio::test]
async fn wink_addresses_the_matched_node() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    manager.wink("MFC200").await.expect("wink");
    assert_eq!(bank.winks(), vec![5]);

    assert!(matches!(
        manager.wink("GHOST01").await.expect_err("unknown serial"),
        FlowError::DeviceNotConnected(_)
    ));
}

#[tokio::test]
async fn concurrent_connects_open_exactly_one_handle() {
    let bank = full_bank();
    let manager = manager_over(&bank);

    let m1 = manager.clone();
    let m2 = manager.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { m1.connect().await }),
        tokio::spawn(async move { m2.connect().await }),
    );
    let results = [a.expect("join"), b.expect("join")];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(FlowError::AlreadyConnected))));
    // The loser was turned away before reaching the opener.
    assert_eq!(bank.opens(), 1);
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn stalled_exchange_surfaces_a_timeout() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;

    bank.set_stall_reads(true);
    let err = manager.poll_once().await.expect_err("read must time out");
    assert!(matches!(err, FlowError::Timeout(_)));

    bank.set_stall_writes(true);
    let err = manager
        .write_setpoint("MFC050", 50.0, true, true)
        .await
        .expect_err("write must time out");
    assert!(matches!(err, FlowError::Timeout(_)));
}

#[tokio::test]
async fn polling_survives_stalled_reads() {
    let bank = full_bank();
    let manager = connected_manager(&bank).await;
    let mut rx = manager.subscribe();
    manager.start_polling().expect("start polling");

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("first cycle")
        .expect("sender alive");

    // Every tick now hangs until the 200ms I/O deadline cuts it off; the
    // failure is swallowed and the previous snapshot stays visible.
    bank.set_stall_reads(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frozen = manager.snapshot().cycle;

    bank.set_stall_reads(false);
    let _ = rx.borrow_and_update();
    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("cycle after the timeouts")
        .expect("sender alive");
    assert!(manager.snapshot().cycle > frozen);

    manager.disconnect().await;
}

#[tokio::test]
async fn operations_require_a_connection() {
    let bank = full_bank();
    let manager = manager_over(&bank);

    assert!(matches!(
        manager
            .write_setpoint("MFC050", 10.0, true, true)
            .await
            .expect_err("disconnected"),
        FlowError::DeviceNotConnected(_)
    ));
    assert!(matches!(
        manager.start_polling().expect_err("disconnected"),
        FlowError::NotConnected
    ));
    assert!(matches!(
        manager.discover().await.expect_err("disconnected"),
        FlowError::NotConnected
    ));
}
