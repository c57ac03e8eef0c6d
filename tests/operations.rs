mod common;

use bytes::Bytes;
use chrono::NaiveDate;
use common::{within, Call, FakeBackend, Harness};
use dispenser_ble::ble::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use dispenser_ble::{
    Attribute, Dispenser, DispenserTelemetry, Error, ErrorScope, EventSource, GattStatus,
    HardwareEvent, Operation, WriteMode,
};
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn is_write(call: &Call) -> bool {
    matches!(call, Call::Write(..))
}

#[tokio::test]
async fn test_operations_require_a_ready_link() {
    let harness = Harness::new(FakeBackend::new());

    let result = harness.manager.read(Attribute::GetDeviceTime.uuid()).await;
    assert_eq!(result, Err(Error::NotConnected));

    let dispenser = Dispenser::new(harness.manager.clone());
    assert_eq!(
        dispenser.trigger_manual_dispense().await,
        Err(Error::NotConnected)
    );
    assert!(harness.backend.calls().is_empty());
}

#[tokio::test]
async fn test_unsupported_write_mode_issues_no_hardware_call() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;
    harness.settle().await;

    let uuid = Attribute::SetDispenseSchedule.uuid();
    let result = harness
        .manager
        .write(uuid, &b"08:00"[..], WriteMode::WithoutResponse)
        .await;

    assert_eq!(
        result,
        Err(Error::UnsupportedMode {
            uuid,
            operation: Operation::WriteWithoutResponse
        })
    );
    assert_eq!(harness.backend.count(is_write), 0);
}

#[tokio::test]
async fn test_unknown_attribute_is_rejected() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;

    let uuid = Uuid::from_u128(0xdead_beef);
    assert_eq!(
        harness.manager.read(uuid).await,
        Err(Error::UnknownAttribute { uuid })
    );
}

#[tokio::test]
async fn test_notifications_are_enabled_after_discovery() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;
    harness.settle().await;

    let enabled: Vec<_> = harness
        .backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Descriptor(characteristic, descriptor, value) => {
                assert_eq!(descriptor, CLIENT_CHARACTERISTIC_CONFIG_UUID);
                assert_eq!(value, Bytes::from_static(&[0x01, 0x00]));
                Attribute::from_uuid(&characteristic)
            }
            _ => None,
        })
        .collect();

    assert_eq!(enabled, Attribute::AUTO_NOTIFY.to_vec());
}

#[tokio::test]
async fn test_disabling_notifications_writes_the_descriptor() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;
    harness.settle().await;

    let uuid = Attribute::GetDispenseLog.uuid();
    tokio_test::assert_ok!(harness.manager.set_notify(uuid, false).await);
    harness.settle().await;

    let calls = harness.backend.calls();
    assert!(calls.contains(&Call::LocalNotify(uuid, false)));
    assert!(calls.contains(&Call::Descriptor(
        uuid,
        CLIENT_CHARACTERISTIC_CONFIG_UUID,
        Bytes::from_static(&[0x00, 0x00])
    )));
}

#[tokio::test]
async fn test_read_value_arrives_as_raw_bytes() {
    let backend = FakeBackend::new();
    backend.set_read_value(Attribute::GetDeviceTime, b"\xff\x002024");
    let harness = Harness::new(backend);
    harness.connect_ready().await;

    let mut inbound = harness.manager.subscribe_inbound();
    harness
        .manager
        .read(Attribute::GetDeviceTime.uuid())
        .await
        .expect("read accepted");

    let event = within(inbound.recv()).await.expect("value published");
    assert_eq!(event.attribute, Attribute::GetDeviceTime.uuid());
    assert_eq!(event.source, EventSource::Read);
    assert_eq!(event.payload, Bytes::from_static(b"\xff\x002024"));
}

#[tokio::test]
async fn test_notifications_from_unknown_characteristics_are_dropped() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;

    let mut inbound = harness.manager.subscribe_inbound();
    harness.backend.emit(HardwareEvent::CharacteristicChanged {
        uuid: Uuid::from_u128(0x1234),
        value: Bytes::from_static(b"noise"),
    });
    harness.backend.notify(Attribute::GetDispenseLog, b"08:00 ok");

    let event = within(inbound.recv()).await.expect("value published");
    assert_eq!(event.attribute_kind(), Some(Attribute::GetDispenseLog));
    assert_eq!(event.source, EventSource::Notification);
    assert_eq!(event.text(), "08:00 ok");
}

#[tokio::test]
async fn test_rejected_write_is_reported() {
    let backend = FakeBackend::new();
    backend.set_write_status(GattStatus::GATT_ERROR);
    let harness = Harness::new(backend);
    harness.connect_ready().await;

    let mut errors = harness.manager.subscribe_errors();
    let dispenser = Dispenser::new(harness.manager.clone());
    tokio_test::assert_ok!(dispenser.set_dispense_schedule("08:00").await);

    let reported = within(errors.recv()).await.expect("error published");
    assert_eq!(reported.scope, ErrorScope::Write);
    assert_eq!(reported.attribute, Some(Attribute::SetDispenseSchedule.uuid()));
    assert_eq!(reported.error.code(), "hardware_rejected");
}

#[tokio::test]
async fn test_dispenser_commands_reach_the_hardware() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;
    let dispenser = Dispenser::new(harness.manager.clone());

    let time = NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(8, 5, 0))
        .expect("valid time");

    dispenser.trigger_manual_dispense().await.expect("dispense");
    dispenser.set_device_time(time).await.expect("set time");
    dispenser.request_dispense_log().await.expect("request log");
    harness.settle().await;

    let calls = harness.backend.calls();
    assert!(calls.contains(&Call::Write(
        Attribute::TriggerManualDispense.uuid(),
        Bytes::from_static(&[0x01]),
        WriteMode::WithResponse
    )));
    assert!(calls.contains(&Call::Write(
        Attribute::SetDeviceTime.uuid(),
        Bytes::from_static(b"2024-03-01 08:05:00"),
        WriteMode::WithResponse
    )));
    assert!(calls.contains(&Call::Read(Attribute::GetDispenseLog.uuid())));
}

#[tokio::test]
async fn test_telemetry_tracks_values_and_clears_on_disconnect() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;

    let dispenser = Dispenser::new(harness.manager.clone());
    let mut updates = dispenser.subscribe_telemetry();

    harness
        .backend
        .notify(Attribute::GetDispenseSchedule, b"08:00,20:00");
    let snapshot = within(updates.recv()).await.expect("telemetry published");
    assert_eq!(snapshot.dispense_schedule.as_deref(), Some("08:00,20:00"));
    assert_eq!(dispenser.telemetry(), snapshot);

    harness.backend.drop_link(GattStatus::PEER_USER_TERMINATED);
    let cleared = within(updates.recv()).await.expect("telemetry published");
    assert_eq!(cleared, DispenserTelemetry::default());
    assert!(dispenser.telemetry().is_empty());
}
