//! btleplug implementation of the hardware seam.
//!
//! btleplug exposes awaitable calls; each one is spawned and its outcome is
//! turned into the matching [`HardwareEvent`], so the worker sees the same
//! callback-style protocol a mobile stack would deliver.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::backend::{
    Advertisement, BleBackend, GattCharacteristic, GattService, GattStatus, HardwareEvent,
    HardwareEventSink, LinkId, LinkState, WriteMode,
};
use crate::ble::capability::CapabilityFlags;
use crate::ble::characteristics::NotificationConfig;
use crate::ble::uuids::is_cccd;
use crate::error::{Error, Result};

/// The peripheral currently connected or being connected.
struct ActiveLink {
    id: LinkId,
    address: String,
    peripheral: Peripheral,
    /// The stack confirmed the link; adapter disconnects before that belong
    /// to an earlier link.
    established: bool,
    disconnecting: bool,
}

/// A released link whose disconnect is still running.
struct Closing {
    address: String,
    task: JoinHandle<()>,
}

/// State shared with the spawned operation tasks.
#[derive(Default)]
struct Shared {
    sink: RwLock<Option<HardwareEventSink>>,
    scanning: AtomicBool,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    link: RwLock<Option<ActiveLink>>,
    closing: Mutex<Option<Closing>>,
    interest: RwLock<HashSet<Uuid>>,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: HardwareEvent) {
        if let Some(sink) = self.sink.read().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn link_peripheral(&self) -> Result<Peripheral> {
        self.link
            .read()
            .as_ref()
            .map(|l| l.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn is_current(&self, link: LinkId) -> bool {
        self.link
            .read()
            .as_ref()
            .map(|l| l.id == link)
            .unwrap_or(false)
    }

    fn stop_notifications(&self) {
        if let Some(handle) = self.notify_task.lock().take() {
            handle.abort();
        }
        self.interest.write().clear();
    }
}

/// [`BleBackend`] over the system Bluetooth stack.
pub struct BtleplugBackend {
    adapter: Adapter,
    flags: Arc<CapabilityFlags>,
    shared: Arc<Shared>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugBackend {
    /// Open the first Bluetooth adapter.
    ///
    /// `flags` is kept in sync with the adapter's power state.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(flags: Arc<CapabilityFlags>) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, flags))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter, flags: Arc<CapabilityFlags>) -> Self {
        Self {
            adapter,
            flags,
            shared: Arc::new(Shared::default()),
            event_pump: Mutex::new(None),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn run_event_pump(adapter: Adapter, flags: Arc<CapabilityFlags>, shared: Arc<Shared>) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(p) => p,
                        Err(e) => {
                            trace!("Failed to get peripheral: {}", e);
                            continue;
                        }
                    };

                    let address = id.to_string();
                    let properties = peripheral.properties().await.ok().flatten();
                    shared.peripherals.write().insert(address.clone(), peripheral);

                    if shared.scanning.load(Ordering::SeqCst) {
                        shared.emit(HardwareEvent::Advertisement(Advertisement {
                            address,
                            name: properties.as_ref().and_then(|p| p.local_name.clone()),
                            rssi: properties.as_ref().and_then(|p| p.rssi),
                        }));
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let address = id.to_string();
                    let unsolicited = shared
                        .link
                        .read()
                        .as_ref()
                        .filter(|l| {
                            l.address == address && l.established && !l.disconnecting
                        })
                        .map(|l| l.id);

                    if let Some(link) = unsolicited {
                        debug!("Link {} to {} lost", link, address);
                        shared.emit(HardwareEvent::LinkStateChanged {
                            link,
                            address,
                            state: LinkState::Disconnected,
                            status: GattStatus::LINK_LOST,
                        });
                    }
                }
                CentralEvent::StateUpdate(state) => {
                    debug!("Adapter state: {:?}", state);
                    match state {
                        CentralState::PoweredOn => flags.set_adapter_on(true),
                        CentralState::PoweredOff => flags.set_adapter_on(false),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        debug!("Adapter event stream ended");
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.shared.peripherals.read().get(address) {
            return Ok(peripheral.clone());
        }

        let peripherals = self.adapter.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| {
                p.id().to_string() == address
                    || p.address().to_string().eq_ignore_ascii_case(address)
            })
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.shared.link_peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::UnknownAttribute { uuid })?;
        Ok((peripheral, characteristic))
    }
}

/// Whether `address` is a MAC address or a platform UUID identifier.
fn is_well_formed_address(address: &str) -> bool {
    address.parse::<BDAddr>().is_ok() || Uuid::parse_str(address).is_ok()
}

fn gatt_service(service: &btleplug::api::Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                properties: c.properties,
                descriptors: c.descriptors.iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}

async fn forward_notifications(peripheral: Peripheral, shared: Arc<Shared>) {
    let mut notifications = match peripheral.notifications().await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to get notifications stream: {}", e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        if !shared.interest.read().contains(&notification.uuid) {
            trace!("Dropping notification from {}", notification.uuid);
            continue;
        }

        shared.emit(HardwareEvent::CharacteristicChanged {
            uuid: notification.uuid,
            value: Bytes::from(notification.value),
        });
    }

    debug!("Notification listener stopped");
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    fn attach(&self, sink: HardwareEventSink) {
        *self.shared.sink.write() = Some(sink);

        let mut pump = self.event_pump.lock();
        if pump.is_none() {
            *pump = Some(tokio::spawn(Self::run_event_pump(
                self.adapter.clone(),
                self.flags.clone(),
                self.shared.clone(),
            )));
        }
    }

    fn resolve_address(&self, address: &str) -> Result<String> {
        if self.shared.peripherals.read().contains_key(address) || is_well_formed_address(address)
        {
            Ok(address.to_string())
        } else {
            Err(Error::InvalidAddress {
                address: address.to_string(),
            })
        }
    }

    async fn start_scan(&self) -> Result<()> {
        self.shared.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
            self.shared.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str, link: LinkId) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;

        // Let a released link to the same peripheral finish going down first.
        let pending = {
            let mut closing = self.shared.closing.lock();
            match closing.take() {
                Some(c) if c.address == address => Some(c.task),
                other => {
                    *closing = other;
                    None
                }
            }
        };
        if let Some(task) = pending {
            let _ = task.await;
        }

        *self.shared.link.write() = Some(ActiveLink {
            id: link,
            address: address.to_string(),
            peripheral: peripheral.clone(),
            established: false,
            disconnecting: false,
        });

        match peripheral.connect().await {
            Ok(()) => {
                let current = {
                    let mut active = self.shared.link.write();
                    match active.as_mut().filter(|l| l.id == link) {
                        Some(active) => {
                            active.established = true;
                            true
                        }
                        None => false,
                    }
                };
                if current {
                    self.shared.emit(HardwareEvent::LinkStateChanged {
                        link,
                        address: address.to_string(),
                        state: LinkState::Connected,
                        status: GattStatus::SUCCESS,
                    });
                }
                Ok(())
            }
            Err(btleplug::Error::PermissionDenied) => Err(Error::PermissionRevokedMidOperation {
                operation: "connect".to_string(),
            }),
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                if self.shared.is_current(link) {
                    self.shared.emit(HardwareEvent::LinkStateChanged {
                        link,
                        address: address.to_string(),
                        state: LinkState::Disconnected,
                        status: GattStatus::from(&e),
                    });
                }
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let (id, address, peripheral) = {
            let mut link = self.shared.link.write();
            let link = link.as_mut().ok_or(Error::NotConnected)?;
            link.disconnecting = true;
            (link.id, link.address.clone(), link.peripheral.clone())
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect from {} reported: {}", address, e);
            }
            shared.emit(HardwareEvent::LinkStateChanged {
                link: id,
                address,
                state: LinkState::Disconnected,
                status: GattStatus::LOCAL_HOST_TERMINATED,
            });
        });

        Ok(())
    }

    async fn close(&self) {
        self.shared.stop_notifications();

        let link = self.shared.link.write().take();
        if let Some(link) = link {
            debug!("Releasing link {} to {}", link.id, link.address);
            let peripheral = link.peripheral;
            let task = tokio::spawn(async move {
                let _ = peripheral.disconnect().await;
            });
            *self.shared.closing.lock() = Some(Closing {
                address: link.address,
                task,
            });
        }
    }

    async fn discover_services(&self) -> Result<()> {
        let peripheral = self.shared.link_peripheral()?;
        let shared = self.shared.clone();

        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services: Vec<_> = peripheral.services().iter().map(gatt_service).collect();
                    debug!("Discovered {} services", services.len());

                    let listener = tokio::spawn(forward_notifications(
                        peripheral.clone(),
                        shared.clone(),
                    ));
                    if let Some(previous) = shared.notify_task.lock().replace(listener) {
                        previous.abort();
                    }

                    shared.emit(HardwareEvent::ServicesDiscovered {
                        status: GattStatus::SUCCESS,
                        services,
                    });
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    shared.emit(HardwareEvent::ServicesDiscovered {
                        status: GattStatus::from(&e),
                        services: Vec::new(),
                    });
                }
            }
        });

        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<()> {
        let (peripheral, target) = self.find_characteristic(characteristic)?;
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let event = match peripheral.read(&target).await {
                Ok(value) => HardwareEvent::CharacteristicRead {
                    uuid: characteristic,
                    status: GattStatus::SUCCESS,
                    value: Bytes::from(value),
                },
                Err(e) => {
                    debug!("Read of {} failed: {}", characteristic, e);
                    HardwareEvent::CharacteristicRead {
                        uuid: characteristic,
                        status: GattStatus::from(&e),
                        value: Bytes::new(),
                    }
                }
            };
            shared.emit(event);
        });

        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: Bytes, mode: WriteMode) -> Result<()> {
        let (peripheral, target) = self.find_characteristic(characteristic)?;
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let status = match peripheral.write(&target, &data, mode.into()).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    debug!("Write to {} failed: {}", characteristic, e);
                    GattStatus::from(&e)
                }
            };
            shared.emit(HardwareEvent::CharacteristicWritten {
                uuid: characteristic,
                status,
            });
        });

        Ok(())
    }

    async fn set_local_notify(&self, characteristic: Uuid, enable: bool) -> Result<()> {
        self.shared.link_peripheral()?;

        let mut interest = self.shared.interest.write();
        if enable {
            interest.insert(characteristic);
        } else {
            interest.remove(&characteristic);
        }
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    ) -> Result<()> {
        let (peripheral, target) = self.find_characteristic(characteristic)?;
        let shared = self.shared.clone();

        let target_descriptor = target
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or(Error::UnknownAttribute { uuid: descriptor })?;

        tokio::spawn(async move {
            // The stack owns the configuration descriptor; subscribing writes it.
            let result = if is_cccd(&descriptor) {
                if value[..] == NotificationConfig::Disable.value()[..] {
                    peripheral.unsubscribe(&target).await
                } else {
                    peripheral.subscribe(&target).await
                }
            } else {
                peripheral.write_descriptor(&target_descriptor, &value).await
            };

            let status = match result {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    debug!("Descriptor write on {} failed: {}", characteristic, e);
                    GattStatus::from(&e)
                }
            };
            shared.emit(HardwareEvent::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            });
        });

        Ok(())
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.event_pump.lock().take() {
            handle.abort();
        }
        self.shared.stop_notifications();
    }
}
