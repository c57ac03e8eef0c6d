//! Shared fixtures for the integration tests.
//!
//! [`FakeBackend`] plays the part of the radio: every call is recorded and,
//! where a real stack would answer asynchronously, the matching completion is
//! pushed onto the hardware sink straight away. Link events carry the link
//! id the manager handed to `connect`.

#![allow(dead_code)]

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use dispenser_ble::{
    Advertisement, Attribute, BleBackend, CapabilityFlags, ConnectionEvent, ConnectionState,
    DeviceManager, Error, GattCharacteristic, GattService, GattStatus, HardwareEvent,
    HardwareEventSink, LinkId, LinkState, ManagerConfig, Result, WriteMode,
};
use dispenser_ble::ble::{CLIENT_CHARACTERISTIC_CONFIG_UUID, DISPENSER_SERVICE_UUID};

pub const DISPENSER_ADDRESS: &str = "24:0A:C4:12:34:56";

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A hardware call observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Close,
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Bytes, WriteMode),
    LocalNotify(Uuid, bool),
    Descriptor(Uuid, Uuid, Bytes),
}

pub struct FakeBackend {
    sink: Mutex<Option<HardwareEventSink>>,
    calls: Mutex<Vec<Call>>,
    services: Mutex<Vec<GattService>>,
    connect_status: Mutex<Option<GattStatus>>,
    connect_error: Mutex<Option<Error>>,
    discovery_status: Mutex<GattStatus>,
    write_status: Mutex<GattStatus>,
    read_values: Mutex<HashMap<Uuid, Bytes>>,
    linked: Mutex<Option<(String, LinkId)>>,
    last_link: Mutex<Option<LinkId>>,
}

impl FakeBackend {
    /// A radio whose peripheral exposes the full dispenser service.
    pub fn new() -> Self {
        Self::with_services(vec![dispenser_service(&Attribute::ALL)])
    }

    pub fn with_services(services: Vec<GattService>) -> Self {
        Self {
            sink: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            services: Mutex::new(services),
            connect_status: Mutex::new(Some(GattStatus::SUCCESS)),
            connect_error: Mutex::new(None),
            discovery_status: Mutex::new(GattStatus::SUCCESS),
            write_status: Mutex::new(GattStatus::SUCCESS),
            read_values: Mutex::new(HashMap::new()),
            linked: Mutex::new(None),
            last_link: Mutex::new(None),
        }
    }

    /// Status reported for the next link-up; `None` never answers.
    pub fn set_connect_status(&self, status: Option<GattStatus>) {
        *self.connect_status.lock() = status;
    }

    /// Error returned by the connect call itself; `None` accepts it.
    pub fn set_connect_error(&self, error: Option<Error>) {
        *self.connect_error.lock() = error;
    }

    pub fn set_discovery_status(&self, status: GattStatus) {
        *self.discovery_status.lock() = status;
    }

    /// Link id of the most recent connect call.
    pub fn last_link(&self) -> Option<LinkId> {
        *self.last_link.lock()
    }

    pub fn set_write_status(&self, status: GattStatus) {
        *self.write_status.lock() = status;
    }

    pub fn set_read_value(&self, attribute: Attribute, value: &'static [u8]) {
        self.read_values
            .lock()
            .insert(attribute.uuid(), Bytes::from_static(value));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn emit(&self, event: HardwareEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    pub fn advertise(&self, address: &str, name: Option<&str>) {
        self.emit(HardwareEvent::Advertisement(Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
        }));
    }

    /// The peripheral drops the link on its own.
    pub fn drop_link(&self, status: GattStatus) {
        let linked = self.linked.lock().take();
        if let Some((address, link)) = linked {
            self.emit(HardwareEvent::LinkStateChanged {
                link,
                address,
                state: LinkState::Disconnected,
                status,
            });
        }
    }

    pub fn notify(&self, attribute: Attribute, value: &'static [u8]) {
        self.emit(HardwareEvent::CharacteristicChanged {
            uuid: attribute.uuid(),
            value: Bytes::from_static(value),
        });
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BleBackend for FakeBackend {
    fn attach(&self, sink: HardwareEventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn resolve_address(&self, address: &str) -> Result<String> {
        let well_formed = address.split(':').count() == 6
            && address
                .split(':')
                .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));

        if well_formed {
            Ok(address.to_uppercase())
        } else {
            Err(dispenser_ble::Error::InvalidAddress {
                address: address.to_string(),
            })
        }
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, address: &str, link: LinkId) -> Result<()> {
        self.record(Call::Connect(address.to_string()));
        *self.last_link.lock() = Some(link);

        let error = self.connect_error.lock().clone();
        if let Some(error) = error {
            return Err(error);
        }

        let status = *self.connect_status.lock();
        if let Some(status) = status {
            let state = if status.is_success() {
                *self.linked.lock() = Some((address.to_string(), link));
                LinkState::Connected
            } else {
                LinkState::Disconnected
            };
            self.emit(HardwareEvent::LinkStateChanged {
                link,
                address: address.to_string(),
                state,
                status,
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(Call::Disconnect);
        self.drop_link(GattStatus::LOCAL_HOST_TERMINATED);
        Ok(())
    }

    async fn close(&self) {
        self.record(Call::Close);
        *self.linked.lock() = None;
    }

    async fn discover_services(&self) -> Result<()> {
        self.record(Call::DiscoverServices);
        let status = *self.discovery_status.lock();
        let services = if status.is_success() {
            self.services.lock().clone()
        } else {
            Vec::new()
        };
        self.emit(HardwareEvent::ServicesDiscovered { status, services });
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<()> {
        self.record(Call::Read(characteristic));
        let value = self
            .read_values
            .lock()
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();
        self.emit(HardwareEvent::CharacteristicRead {
            uuid: characteristic,
            status: GattStatus::SUCCESS,
            value,
        });
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: Bytes, mode: WriteMode) -> Result<()> {
        self.record(Call::Write(characteristic, data, mode));
        let status = *self.write_status.lock();
        self.emit(HardwareEvent::CharacteristicWritten {
            uuid: characteristic,
            status,
        });
        Ok(())
    }

    async fn set_local_notify(&self, characteristic: Uuid, enable: bool) -> Result<()> {
        self.record(Call::LocalNotify(characteristic, enable));
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()> {
        self.record(Call::Descriptor(characteristic, descriptor, value));
        self.emit(HardwareEvent::DescriptorWritten {
            characteristic,
            descriptor,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }
}

/// The dispenser service exposing `attributes` with their firmware properties.
pub fn dispenser_service(attributes: &[Attribute]) -> GattService {
    GattService {
        uuid: DISPENSER_SERVICE_UUID,
        characteristics: attributes
            .iter()
            .map(|attribute| {
                let properties = attribute.required_properties();
                let descriptors = if properties.contains(CharPropFlags::NOTIFY) {
                    vec![CLIENT_CHARACTERISTIC_CONFIG_UUID]
                } else {
                    Vec::new()
                };
                GattCharacteristic {
                    uuid: attribute.uuid(),
                    properties,
                    descriptors,
                }
            })
            .collect(),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dispenser_ble=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub manager: Arc<DeviceManager>,
    pub backend: Arc<FakeBackend>,
    pub flags: Arc<CapabilityFlags>,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        Self::with_config(backend, ManagerConfig::default())
    }

    pub fn with_config(backend: FakeBackend, config: ManagerConfig) -> Self {
        init_tracing();
        let backend = Arc::new(backend);
        let flags = Arc::new(CapabilityFlags::granted());
        let manager = Arc::new(DeviceManager::with_backend(
            backend.clone(),
            flags.clone(),
            config,
        ));
        Self {
            manager,
            backend,
            flags,
        }
    }

    /// Connect to the dispenser and wait until the link is ready.
    pub async fn connect_ready(&self) {
        self.manager
            .connect_to_device(DISPENSER_ADDRESS)
            .await
            .expect("connect accepted");
        within(self.manager.wait_for_state(ConnectionState::is_ready))
            .await
            .expect("manager alive");
    }

    /// Wait until every queued GATT operation has been answered.
    ///
    /// The fake answers inside each call, so the queue is quiet once a flush
    /// issues no further hardware calls.
    pub async fn settle(&self) {
        within(async {
            let mut issued = self.backend.calls().len();
            loop {
                self.manager.flush().await.expect("manager alive");
                let after = self.backend.calls().len();
                if issued == after {
                    break;
                }
                issued = after;
            }
        })
        .await;
    }
}

/// Await `future`, failing the test if it takes unreasonably long.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .expect("step timed out")
}

/// Collect connection states until one satisfies `last`.
pub async fn states_until(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
    last: impl Fn(&ConnectionState) -> bool,
) -> Vec<ConnectionState> {
    within(async {
        let mut states = Vec::new();
        loop {
            let event = rx.recv().await.expect("connection events open");
            let done = last(&event.state);
            states.push(event.state);
            if done {
                return states;
            }
        }
    })
    .await
}
