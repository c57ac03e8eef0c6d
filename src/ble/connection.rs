//! BLE connection management.
//!
//! Owns the lifecycle of the single active link: connect, service discovery,
//! readiness gating and teardown. Every transition is driven by a command or
//! by a hardware callback delivered through the device manager's worker.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::DiscoveredDevice;
use crate::ble::backend::{BleBackend, GattService, GattStatus, LinkId, LinkState, WriteMode};
use crate::ble::capability::{Capability, CapabilityGate};
use crate::ble::catalog::Attribute;
use crate::ble::characteristics::CharacteristicRegistry;
use crate::ble::dispatcher::Dispatcher;
use crate::ble::events::{ErrorScope, EventFanout};
use crate::ble::uuids::{is_dispenser_service, DISPENSER_SERVICE_UUID};
use crate::config::UnexpectedDisconnectPolicy;
use crate::error::{Error, Result};
use crate::worker::{Input, TaskEvent};

/// Connection state of the manager.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The link is up and services are being discovered.
    DiscoveringServices,
    /// The dispenser is ready for GATT operations.
    Ready(DiscoveredDevice),
    /// The last connection attempt failed.
    Error(Error),
    /// The link is being torn down.
    Disconnecting,
}

impl ConnectionState {
    /// Check if GATT operations are allowed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Disconnecting
        )
    }

    /// The attached device, when ready.
    pub fn device(&self) -> Option<&DiscoveredDevice> {
        match self {
            Self::Ready(device) => Some(device),
            _ => None,
        }
    }

    /// The failure reason, in the error state.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::Ready(device) => write!(f, "Connected to {}", device.display_name()),
            Self::Error(error) => write!(f, "Error: {}", error),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// State before the change.
    pub previous: ConnectionState,
    /// The new connection state.
    pub state: ConnectionState,
    /// Address of the peripheral involved, if any.
    pub address: Option<String>,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

/// The peripheral currently owned by the machine.
#[derive(Debug, Clone)]
struct Link {
    /// Attempt that opened the link; hardware reports for older ones are stale.
    id: LinkId,
    address: String,
    device: DiscoveredDevice,
}

/// Connection state machine.
pub(crate) struct ConnectionMachine {
    backend: Arc<dyn BleBackend>,
    gate: Arc<dyn CapabilityGate>,
    fanout: EventFanout,
    tasks: mpsc::UnboundedSender<Input>,
    policy: UnexpectedDisconnectPolicy,
    dispatcher: Dispatcher,
    link: Option<Link>,
    last_address: Option<String>,
    attempt: u64,
    connect_task: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionMachine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn BleBackend>,
        gate: Arc<dyn CapabilityGate>,
        fanout: EventFanout,
        tasks: mpsc::UnboundedSender<Input>,
        policy: UnexpectedDisconnectPolicy,
        registry: CharacteristicRegistry,
        state_tx: watch::Sender<ConnectionState>,
        event_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let dispatcher = Dispatcher::new(backend.clone(), gate.clone(), registry, fanout.clone());

        Self {
            backend,
            gate,
            fanout,
            tasks,
            policy,
            dispatcher,
            link: None,
            last_address: None,
            attempt: 0,
            connect_task: None,
            state_tx,
            event_tx,
        }
    }

    /// Get the current connection state.
    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Address of the owned link, if any.
    pub(crate) fn address(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.address.as_str())
    }

    /// Start connecting to `address`.
    ///
    /// Pre-flight failures leave the state untouched. Any existing link is
    /// closed before the new attempt starts.
    pub(crate) async fn connect(
        &mut self,
        address: &str,
        known: Option<DiscoveredDevice>,
    ) -> Result<()> {
        let resolved = self.preflight_connect(address).map_err(|e| {
            error!("Connection to {} rejected: {}", address, e);
            self.fanout.report(ErrorScope::Connect, e.clone());
            e
        })?;

        if self.link.is_some() {
            debug!("Closing previous link before connecting");
            self.release_link().await;
        }

        info!("Connecting to {}", resolved);

        let device = known
            .filter(|d| d.address == resolved)
            .unwrap_or_else(|| DiscoveredDevice {
                address: resolved.clone(),
                name: None,
                is_dispenser: false,
            });
        self.attempt += 1;
        let attempt = self.attempt;
        self.link = Some(Link {
            id: attempt,
            address: resolved.clone(),
            device,
        });
        self.last_address = Some(resolved.clone());
        self.set_state(ConnectionState::Connecting);

        let backend = self.backend.clone();
        let tasks = self.tasks.clone();

        self.connect_task = Some(tokio::spawn(async move {
            if let Err(error) = backend.connect(&resolved, attempt).await {
                let _ = tasks.send(Input::Task(TaskEvent::ConnectCallFailed {
                    attempt,
                    error,
                }));
            }
        }));

        Ok(())
    }

    fn preflight_connect(&self, address: &str) -> Result<String> {
        if !self.gate.can_connect() {
            return Err(Error::CapabilityDenied {
                capability: Capability::Connect,
            });
        }

        if !self.gate.is_adapter_on() {
            return Err(Error::AdapterOff);
        }

        self.backend
            .resolve_address(address)
            .map_err(|_| Error::InvalidAddress {
                address: address.to_string(),
            })
    }

    /// Handle the connect call itself failing.
    pub(crate) async fn on_connect_call_failed(&mut self, attempt: u64, error: Error) {
        if attempt != self.attempt || self.state() != ConnectionState::Connecting {
            trace!("Ignoring failure of stale connection attempt {}", attempt);
            return;
        }

        error!("Connection attempt failed: {}", error);
        self.connect_task = None;
        self.release_link().await;
        self.set_state(ConnectionState::Error(error));
    }

    /// Handle a link state change reported by the hardware.
    ///
    /// Reports for an earlier link, even to the same address, are dropped.
    pub(crate) async fn on_link_state(
        &mut self,
        link: LinkId,
        address: &str,
        state: LinkState,
        status: GattStatus,
    ) {
        match &self.link {
            Some(current) if current.id == link && current.address == address => {}
            Some(current) if current.address == address => {
                trace!(
                    "Ignoring {:?} from stale link {} to {} (current link {})",
                    state,
                    link,
                    address,
                    current.id
                );
                return;
            }
            _ => {
                trace!("Ignoring link change for foreign peripheral {}", address);
                return;
            }
        }

        let current = self.state();
        match (state, &current) {
            (LinkState::Connected, ConnectionState::Connecting) if status.is_success() => {
                info!("Connected to GATT server, discovering services");
                self.connect_task = None;
                self.set_state(ConnectionState::DiscoveringServices);

                if let Err(e) = self.backend.discover_services().await {
                    self.fail_and_teardown(e).await;
                }
            }
            (_, ConnectionState::Connecting) => {
                error!("Connection failed with status: {}", status);
                self.release_link().await;
                self.set_state(ConnectionState::Error(Error::ConnectFailed { status }));
            }
            (LinkState::Connected, _) => {
                trace!("Ignoring duplicate link-up in state {}", current);
            }
            (LinkState::Disconnected, _) => self.finish_disconnect(status).await,
        }
    }

    /// Handle the outcome of service discovery.
    pub(crate) async fn on_services_discovered(&mut self, status: GattStatus, services: Vec<GattService>) {
        if self.state() != ConnectionState::DiscoveringServices {
            trace!("Ignoring service discovery result outside discovery");
            return;
        }

        if !status.is_success() {
            self.fail_and_teardown(Error::DiscoveryFailed { status })
                .await;
            return;
        }

        let Some(service) = services.iter().find(|s| is_dispenser_service(&s.uuid)) else {
            self.fail_and_teardown(Error::ServiceNotFound {
                uuid: DISPENSER_SERVICE_UUID,
            })
            .await;
            return;
        };

        let known = self.dispatcher.registry().bind(service);
        debug!("Service discovered with {} catalogued characteristics", known);

        if !self.dispatcher.registry().contains_any(&Attribute::CRITICAL) {
            self.fail_and_teardown(Error::MissingRequiredAttributes)
                .await;
            return;
        }

        self.dispatcher.enable_auto_notifications().await;

        let Some(device) = self.link.as_ref().map(|l| l.device.clone()) else {
            return;
        };
        info!("Dispenser ready: {}", device);
        self.set_state(ConnectionState::Ready(device));
    }

    /// Tear down the link. A no-op with no link or when already tearing down.
    pub(crate) async fn disconnect(&mut self) {
        if self.link.is_none() {
            trace!("Disconnect requested with no link");
            return;
        }

        if self.state() == ConnectionState::Disconnecting {
            trace!("Disconnect already in progress");
            return;
        }

        info!("Disconnecting");
        self.begin_teardown().await;
    }

    /// Drop the link immediately without waiting for the hardware.
    pub(crate) async fn shutdown(&mut self) {
        if self.link.is_some() {
            if let Err(e) = self.backend.disconnect().await {
                debug!("Disconnect during shutdown failed: {}", e);
            }
            self.release_link().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub(crate) async fn read(&mut self, uuid: Uuid) -> Result<()> {
        let ready = self.state().is_ready();
        self.dispatcher.read(ready, uuid).await
    }

    pub(crate) async fn write(&mut self, uuid: Uuid, data: Bytes, mode: WriteMode) -> Result<()> {
        let ready = self.state().is_ready();
        self.dispatcher.write(ready, uuid, data, mode).await
    }

    pub(crate) async fn set_notify(&mut self, uuid: Uuid, enable: bool) -> Result<()> {
        let ready = self.state().is_ready();
        self.dispatcher.set_notify(ready, uuid, enable).await
    }

    pub(crate) async fn on_read(&mut self, uuid: Uuid, status: GattStatus, value: Bytes) {
        self.dispatcher.on_read(uuid, status, value).await;
    }

    pub(crate) async fn on_written(&mut self, uuid: Uuid, status: GattStatus) {
        self.dispatcher.on_written(uuid, status).await;
    }

    pub(crate) async fn on_descriptor_written(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    ) {
        self.dispatcher
            .on_descriptor_written(characteristic, descriptor, status)
            .await;
    }

    pub(crate) fn on_changed(&self, uuid: Uuid, value: Bytes) {
        self.dispatcher.on_changed(uuid, value);
    }

    /// Record a failure, then disconnect instead of leaving a half-usable link.
    async fn fail_and_teardown(&mut self, error: Error) {
        error!("Connection setup failed: {}", error);
        self.set_state(ConnectionState::Error(error));
        self.begin_teardown().await;
    }

    async fn begin_teardown(&mut self) {
        if let Some(handle) = self.connect_task.take() {
            handle.abort();
        }
        self.set_state(ConnectionState::Disconnecting);

        if let Err(e) = self.backend.disconnect().await {
            warn!("Disconnect call failed, releasing link locally: {}", e);
            self.release_link().await;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Final step of any teardown, driven by the hardware's link-down signal.
    async fn finish_disconnect(&mut self, status: GattStatus) {
        let requested = self.state() == ConnectionState::Disconnecting;

        if !requested {
            if status.is_normal_disconnect() {
                info!("Peripheral disconnected, status: {}", status);
            } else {
                warn!("Unexpected disconnect, status: {}", status);
            }
            self.set_state(ConnectionState::Disconnecting);
        } else {
            debug!("Disconnected, status: {}", status);
        }

        self.release_link().await;

        let terminal = if requested || status.is_normal_disconnect() {
            ConnectionState::Disconnected
        } else {
            match self.policy {
                UnexpectedDisconnectPolicy::Disconnected => ConnectionState::Disconnected,
                UnexpectedDisconnectPolicy::Error => {
                    ConnectionState::Error(Error::ConnectionLost { status })
                }
            }
        };
        self.set_state(terminal);
    }

    /// Close the link handle and drop connection-scoped state.
    async fn release_link(&mut self) {
        if let Some(handle) = self.connect_task.take() {
            handle.abort();
        }
        if self.link.is_some() {
            self.backend.close().await;
        }
        self.dispatcher.reset();
        self.link = None;
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state_tx.send_replace(new_state.clone());

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(ConnectionEvent {
                previous: old_state,
                state: new_state,
                address: self.last_address.clone(),
                timestamp: Utc::now(),
            });
        }
    }
}

impl Drop for ConnectionMachine {
    fn drop(&mut self) {
        if let Some(handle) = self.connect_task.take() {
            handle.abort();
        }
    }
}
