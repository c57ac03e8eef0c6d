//! Device manager for discovering and connecting to pill dispensers.
//!
//! [`DeviceManager`] is a cheap handle onto a background worker that owns the
//! scan session and the single active link. Imperative entry points queue a
//! command for the worker and wait for its verdict; state is published through
//! watch channels (latest value) and broadcast channels (every event).

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::advertising::DiscoveredDevice;
use crate::ble::backend::{BleBackend, HardwareEventSink, WriteMode};
use crate::ble::capability::{CapabilityFlags, CapabilityGate};
use crate::ble::characteristics::{AttributeHandle, CharacteristicRegistry};
use crate::ble::connection::{ConnectionEvent, ConnectionMachine, ConnectionState};
use crate::ble::events::{EventFanout, InboundEvent, OperationError};
use crate::ble::platform::BtleplugBackend;
use crate::ble::scanner::ScanController;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::worker::{Command, Input, Worker};

/// Handle for a registered callback.
///
/// The callback is unregistered when the handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Central manager for scanning and the dispenser connection.
pub struct DeviceManager {
    /// Input queue of the worker.
    inputs: mpsc::UnboundedSender<Input>,
    /// Configuration the manager was built with.
    config: ManagerConfig,
    /// Shared view of the connection-scoped characteristic handles.
    registry: CharacteristicRegistry,
    /// Inbound values and operation errors.
    fanout: EventFanout,
    /// Scan-active flag.
    scanning_rx: watch::Receiver<bool>,
    /// Ranked list of discovered devices.
    devices_rx: watch::Receiver<Vec<DiscoveredDevice>>,
    /// Current connection state.
    state_rx: watch::Receiver<ConnectionState>,
    /// Connection transitions.
    connection_tx: broadcast::Sender<ConnectionEvent>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Worker task handle.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a DeviceManager on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default()).await
    }

    /// Create a DeviceManager on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_config(config: ManagerConfig) -> Result<Self> {
        let flags = Arc::new(CapabilityFlags::granted());
        let backend = BtleplugBackend::new(flags.clone()).await?;
        Ok(Self::with_backend(Arc::new(backend), flags, config))
    }

    /// Create a DeviceManager over a custom radio backend and capability gate.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_backend(
        backend: Arc<dyn BleBackend>,
        gate: Arc<dyn CapabilityGate>,
        config: ManagerConfig,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (scanning_tx, scanning_rx) = watch::channel(false);
        let (devices_tx, devices_rx) = watch::channel(Vec::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (connection_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let fanout = EventFanout::new(config.event_capacity);
        let registry = CharacteristicRegistry::new();

        backend.attach(HardwareEventSink::new(inputs_tx.clone()));

        let scan = ScanController::new(
            backend.clone(),
            gate.clone(),
            fanout.clone(),
            inputs_tx.clone(),
            config.name_prefix.clone(),
            config.scan_timeout,
            scanning_tx,
            devices_tx,
        );
        let connection = ConnectionMachine::new(
            backend,
            gate,
            fanout.clone(),
            inputs_tx.clone(),
            config.disconnect_policy,
            registry.clone(),
            state_tx,
            connection_tx.clone(),
        );

        let worker = Worker::new(scan, connection, inputs_rx);
        let handle = tokio::spawn(worker.run());

        info!("Device manager started");

        Self {
            inputs: inputs_tx,
            config,
            registry,
            fanout,
            scanning_rx,
            devices_rx,
            state_rx,
            connection_tx,
            callback_counter: AtomicU64::new(0),
            worker: Mutex::new(Some(handle)),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(command(tx)))
            .map_err(|_| Error::ManagerClosed)?;
        rx.await.map_err(|_| Error::ManagerClosed)
    }

    /// Start a scan session, replacing any running one.
    ///
    /// # Errors
    ///
    /// `CapabilityDenied` or `AdapterOff` without touching the hardware.
    pub async fn start_scan(&self) -> Result<()> {
        self.request(Command::StartScan).await?
    }

    /// Stop the running scan session. A no-op when none is running.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Command::StopScan).await
    }

    /// Connect to the device at `address`.
    ///
    /// Returns once the attempt has started; progress is reported through the
    /// connection state.
    ///
    /// # Errors
    ///
    /// `CapabilityDenied`, `AdapterOff` or `InvalidAddress`, with no state change.
    pub async fn connect_to_device(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.request(|reply| Command::Connect { address, reply })
            .await?
    }

    /// Tear down the link. A no-op when there is no link.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Read a characteristic; the value arrives as an [`InboundEvent`].
    pub async fn read(&self, attribute: Uuid) -> Result<()> {
        self.request(|reply| Command::Read {
            uuid: attribute,
            reply,
        })
        .await?
    }

    /// Write a characteristic.
    ///
    /// # Errors
    ///
    /// `NotConnected`, `UnknownAttribute` or `UnsupportedMode` before any
    /// hardware call. Hardware rejections arrive as [`OperationError`]s.
    pub async fn write(&self, attribute: Uuid, data: impl Into<Bytes>, mode: WriteMode) -> Result<()> {
        let data = data.into();
        self.request(|reply| Command::Write {
            uuid: attribute,
            data,
            mode,
            reply,
        })
        .await?
    }

    /// Turn notifications on or off for a characteristic.
    pub async fn set_notify(&self, attribute: Uuid, enable: bool) -> Result<()> {
        self.request(|reply| Command::SetNotify {
            uuid: attribute,
            enable,
            reply,
        })
        .await?
    }

    /// Check if a scan session is running.
    pub fn is_scanning(&self) -> bool {
        *self.scanning_rx.borrow()
    }

    /// Watch the scan-active flag.
    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.scanning_rx.clone()
    }

    /// Devices seen in the current scan session, dispensers first.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices_rx.borrow().clone()
    }

    /// Watch the discovered-device list.
    pub fn watch_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices_rx.clone()
    }

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch the connection state.
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection state satisfies `predicate`.
    ///
    /// Only latest values are observed; use
    /// [`subscribe_connection_events`](Self::subscribe_connection_events) to
    /// see every transition.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state_rx.clone();
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return Ok(state.clone());
                }
            }
            rx.changed().await.map_err(|_| Error::ManagerClosed)?;
        }
    }

    /// Characteristics discovered on the current connection.
    pub fn attributes(&self) -> Vec<AttributeHandle> {
        self.registry.snapshot()
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Subscribe to connection transitions.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    /// Subscribe to inbound values.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.fanout.subscribe_inbound()
    }

    /// Subscribe to operation errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<OperationError> {
        self.fanout.subscribe_errors()
    }

    /// Register a callback for connection transitions.
    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        self.spawn_callback(self.connection_tx.subscribe(), callback)
    }

    /// Register a callback for inbound values.
    pub fn on_inbound_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        self.spawn_callback(self.fanout.subscribe_inbound(), callback)
    }

    /// Register a callback for operation errors.
    pub fn on_operation_error<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(OperationError) + Send + Sync + 'static,
    {
        self.spawn_callback(self.fanout.subscribe_errors(), callback)
    }

    fn spawn_callback<T, F>(&self, mut rx: broadcast::Receiver<T>, callback: F) -> CallbackHandle
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => callback(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Callback {} lagged by {} events", callback_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Wait until every command, hardware callback and task completion queued
    /// so far has been handled.
    pub async fn flush(&self) -> Result<()> {
        self.request(Command::Flush).await
    }

    /// Clean shutdown: stops scanning, drops the link and stops the worker.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        let result = self.request(Command::Shutdown).await;

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        result
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        // The backend keeps a sender alive, so the worker has to be told.
        let _ = self.inputs.send(Input::Closed);
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .field("scanning", &self.is_scanning())
            .field("state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::backend::MockBleBackend;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[test]
    fn test_callback_handle_unregisters_once() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let handle = CallbackHandle::new(7, move || flag.store(true, Ordering::SeqCst));

        assert_eq!(handle.id(), 7);
        handle.unregister();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_callback_handle_drop() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        drop(CallbackHandle::new(1, move || flag.store(true, Ordering::SeqCst)));
        assert!(called.load(Ordering::SeqCst));
    }

    fn idle_backend() -> MockBleBackend {
        let mut backend = MockBleBackend::new();
        backend.expect_attach().times(1).return_const(());
        backend
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let manager = DeviceManager::with_backend(
            Arc::new(idle_backend()),
            Arc::new(CapabilityFlags::granted()),
            ManagerConfig::default(),
        );

        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(!manager.is_scanning());

        manager.shutdown().await.expect("clean shutdown");
        assert_eq!(manager.start_scan().await, Err(Error::ManagerClosed));
        assert_eq!(manager.disconnect().await, Err(Error::ManagerClosed));
        assert_eq!(manager.flush().await, Err(Error::ManagerClosed));
    }

    #[tokio::test]
    async fn test_dropping_the_handle_stops_the_worker() {
        let manager = DeviceManager::with_backend(
            Arc::new(idle_backend()),
            Arc::new(CapabilityFlags::granted()),
            ManagerConfig::default(),
        );
        assert_ok!(manager.flush().await);

        let handle = manager.worker.lock().take().expect("worker running");
        drop(manager);

        let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_gatt_operations_require_ready() {
        let manager = DeviceManager::with_backend(
            Arc::new(idle_backend()),
            Arc::new(CapabilityFlags::granted()),
            ManagerConfig::default(),
        );

        let uuid = crate::ble::uuids::TRIGGER_MANUAL_DISPENSE_UUID;
        assert_eq!(
            manager
                .write(uuid, vec![0x01], WriteMode::WithResponse)
                .await,
            Err(Error::NotConnected)
        );
        assert_eq!(manager.read(uuid).await, Err(Error::NotConnected));
        assert!(manager.attributes().is_empty());
    }
}
