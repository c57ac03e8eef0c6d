mod common;

use common::{
    dispenser_service, states_until, within, Call, FakeBackend, Harness, DISPENSER_ADDRESS,
};
use dispenser_ble::ble::DISPENSER_SERVICE_UUID;
use dispenser_ble::{
    Attribute, ConnectionState, Error, GattService, GattStatus, HardwareEvent, LinkState,
    ManagerConfig, UnexpectedDisconnectPolicy,
};
use pretty_assertions::assert_eq;

fn is_disconnected(state: &ConnectionState) -> bool {
    *state == ConnectionState::Disconnected
}

#[tokio::test]
async fn test_malformed_address_is_rejected() {
    let harness = Harness::new(FakeBackend::new());
    let mut errors = harness.manager.subscribe_errors();

    let result = harness.manager.connect_to_device("not-a-valid-address").await;
    assert_eq!(
        result,
        Err(Error::InvalidAddress {
            address: "not-a-valid-address".into()
        })
    );
    assert_eq!(harness.manager.connection_state(), ConnectionState::Disconnected);
    assert!(harness.backend.calls().is_empty());

    let reported = within(errors.recv()).await.expect("error published");
    assert_eq!(reported.error.code(), result.unwrap_err().code());
}

#[tokio::test]
async fn test_connect_reaches_ready_through_discovery() {
    let harness = Harness::new(FakeBackend::with_services(vec![dispenser_service(&[
        Attribute::TriggerManualDispense,
        Attribute::GetLastDispenseInfo,
    ])]));
    let mut events = harness.manager.subscribe_connection_events();

    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");

    let states = states_until(&mut events, ConnectionState::is_ready).await;
    assert_eq!(states.len(), 3);
    assert_eq!(states[0], ConnectionState::Connecting);
    assert_eq!(states[1], ConnectionState::DiscoveringServices);
    assert!(states[2].is_ready());

    let attributes: Vec<_> = harness
        .manager
        .attributes()
        .into_iter()
        .filter_map(|handle| handle.attribute)
        .collect();
    assert_eq!(
        attributes,
        vec![Attribute::TriggerManualDispense, Attribute::GetLastDispenseInfo]
    );
}

#[tokio::test]
async fn test_ready_never_follows_connecting() {
    let harness = Harness::new(FakeBackend::new());
    let mut events = harness.manager.subscribe_connection_events();

    harness.connect_ready().await;
    harness.manager.disconnect().await.expect("disconnect");
    let _ = states_until(&mut events, is_disconnected).await;

    harness.connect_ready().await;
    harness.manager.shutdown().await.expect("shutdown");

    while let Ok(event) = events.try_recv() {
        if event.state.is_ready() {
            assert_eq!(event.previous, ConnectionState::DiscoveringServices);
        }
    }
}

#[tokio::test]
async fn test_missing_critical_attributes_tear_down() {
    let harness = Harness::new(FakeBackend::with_services(vec![dispenser_service(&[
        Attribute::SetDeviceTime,
        Attribute::GetDeviceTime,
    ])]));
    let mut events = harness.manager.subscribe_connection_events();

    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");

    let states = states_until(&mut events, is_disconnected).await;
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::DiscoveringServices,
            ConnectionState::Error(Error::MissingRequiredAttributes),
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
    assert!(harness.manager.attributes().is_empty());
    assert_eq!(harness.backend.count(|c| *c == Call::Disconnect), 1);
}

#[tokio::test]
async fn test_missing_service_tears_down() {
    let harness = Harness::new(FakeBackend::with_services(vec![GattService {
        uuid: uuid::Uuid::from_u128(0x1800),
        characteristics: Vec::new(),
    }]));
    let mut events = harness.manager.subscribe_connection_events();

    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");

    let states = states_until(&mut events, is_disconnected).await;
    assert!(states.contains(&ConnectionState::Error(Error::ServiceNotFound {
        uuid: DISPENSER_SERVICE_UUID
    })));
}

#[tokio::test]
async fn test_peer_disconnect_resolves_to_disconnected() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;
    assert!(!harness.manager.attributes().is_empty());

    let mut events = harness.manager.subscribe_connection_events();
    harness.backend.drop_link(GattStatus::PEER_USER_TERMINATED);

    let states = states_until(&mut events, |s| !s.is_transitioning()).await;
    assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
    assert!(harness.manager.attributes().is_empty());
}

#[tokio::test]
async fn test_link_loss_follows_configured_policy() {
    let config =
        ManagerConfig::default().with_disconnect_policy(UnexpectedDisconnectPolicy::Error);
    let harness = Harness::with_config(FakeBackend::new(), config);
    harness.connect_ready().await;

    let mut events = harness.manager.subscribe_connection_events();
    harness.backend.drop_link(GattStatus::LINK_LOST);

    let states = states_until(&mut events, |s| !s.is_transitioning()).await;
    assert_eq!(
        states.last(),
        Some(&ConnectionState::Error(Error::ConnectionLost {
            status: GattStatus::LINK_LOST
        }))
    );

    // The manager stays usable after an error.
    harness.connect_ready().await;
}

#[tokio::test]
async fn test_rejected_link_reports_connect_failure() {
    let backend = FakeBackend::new();
    backend.set_connect_status(Some(GattStatus::GATT_ERROR));
    let harness = Harness::new(backend);

    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");

    let state = within(harness.manager.wait_for_state(|s| s.error().is_some()))
        .await
        .expect("manager alive");
    assert_eq!(
        state,
        ConnectionState::Error(Error::ConnectFailed {
            status: GattStatus::GATT_ERROR
        })
    );
}

#[tokio::test]
async fn test_disconnect_when_idle_is_a_noop() {
    let harness = Harness::new(FakeBackend::new());
    let mut events = harness.manager.subscribe_connection_events();

    harness.manager.disconnect().await.expect("first disconnect");
    harness.manager.disconnect().await.expect("second disconnect");

    assert_eq!(harness.manager.connection_state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());
    assert!(harness.backend.calls().is_empty());
}

#[tokio::test]
async fn test_requested_disconnect_walks_the_teardown() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;

    let mut events = harness.manager.subscribe_connection_events();
    harness.manager.disconnect().await.expect("disconnect");

    let states = states_until(&mut events, is_disconnected).await;
    assert_eq!(
        states,
        vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
    );

    let mut events = harness.manager.subscribe_connection_events();
    harness.manager.disconnect().await.expect("repeat disconnect");
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_requires_permission() {
    let harness = Harness::new(FakeBackend::new());
    harness.flags.set_connect(false);

    let error = tokio_test::assert_err!(harness.manager.connect_to_device(DISPENSER_ADDRESS).await);
    assert_eq!(error.code(), "capability_denied");
    assert_eq!(harness.manager.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_discovery_failure_tears_down() {
    let backend = FakeBackend::new();
    backend.set_discovery_status(GattStatus::GATT_ERROR);
    let harness = Harness::new(backend);
    let mut events = harness.manager.subscribe_connection_events();

    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");

    let states = states_until(&mut events, is_disconnected).await;
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::DiscoveringServices,
            ConnectionState::Error(Error::DiscoveryFailed {
                status: GattStatus::GATT_ERROR
            }),
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
    assert_eq!(harness.backend.count(|c| *c == Call::Disconnect), 1);
    assert!(harness.manager.attributes().is_empty());
}

#[tokio::test]
async fn test_connect_call_error_clears_the_link() {
    let revoked = Error::PermissionRevokedMidOperation {
        operation: "connect".to_string(),
    };
    let backend = FakeBackend::new();
    backend.set_connect_error(Some(revoked.clone()));
    let harness = Harness::new(backend);

    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");

    let state = within(harness.manager.wait_for_state(|s| s.error().is_some()))
        .await
        .expect("manager alive");
    assert_eq!(state, ConnectionState::Error(revoked));
    assert_eq!(state.device(), None);
    assert!(harness.manager.attributes().is_empty());
    assert_eq!(harness.backend.count(|c| *c == Call::Close), 1);

    harness.backend.set_connect_error(None);
    harness.connect_ready().await;
}

#[tokio::test]
async fn test_reconnect_to_same_address_ignores_stale_link_down() {
    let harness = Harness::new(FakeBackend::new());
    harness.connect_ready().await;
    let first = harness.backend.last_link().expect("first link");

    harness.manager.disconnect().await.expect("disconnect");
    within(harness.manager.wait_for_state(is_disconnected))
        .await
        .expect("manager alive");

    // The second link stays pending until the test brings it up.
    harness.backend.set_connect_status(None);
    harness
        .manager
        .connect_to_device(DISPENSER_ADDRESS)
        .await
        .expect("connect accepted");
    let second = within(async {
        loop {
            match harness.backend.last_link() {
                Some(link) if link != first => return link,
                _ => tokio::task::yield_now().await,
            }
        }
    })
    .await;

    harness.backend.emit(HardwareEvent::LinkStateChanged {
        link: first,
        address: DISPENSER_ADDRESS.to_string(),
        state: LinkState::Disconnected,
        status: GattStatus::LOCAL_HOST_TERMINATED,
    });
    harness.manager.flush().await.expect("manager alive");
    assert_eq!(harness.manager.connection_state(), ConnectionState::Connecting);

    harness.backend.emit(HardwareEvent::LinkStateChanged {
        link: second,
        address: DISPENSER_ADDRESS.to_string(),
        state: LinkState::Connected,
        status: GattStatus::SUCCESS,
    });
    within(harness.manager.wait_for_state(ConnectionState::is_ready))
        .await
        .expect("manager alive");
}
