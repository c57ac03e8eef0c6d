//! BLE scanning functionality.
//!
//! Runs time-bounded discovery sessions and maintains the deduplicated,
//! ranked list of discovered devices.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::advertising::DiscoveredDevice;
use crate::ble::backend::{Advertisement, BleBackend};
use crate::ble::capability::{Capability, CapabilityGate};
use crate::ble::events::{ErrorScope, EventFanout};
use crate::error::{Error, Result};
use crate::worker::{Input, TaskEvent};

/// State of the scan controller's discovery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanSession {
    /// No scan is running.
    #[default]
    Idle,
    /// A scan is running.
    Active {
        /// Session identifier; superseded sessions have smaller ids.
        id: u64,
        /// When the session started.
        started_at: Instant,
        /// How long the session runs before stopping itself.
        timeout: Duration,
    },
}

impl ScanSession {
    /// Check if a session is running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Identifier of the running session.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Active { id, .. } => Some(*id),
            Self::Idle => None,
        }
    }

    /// Time left before the running session times out.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Active {
                started_at,
                timeout,
                ..
            } => Some(timeout.saturating_sub(started_at.elapsed())),
            Self::Idle => None,
        }
    }
}

/// Ranking used for the visible device list: dispensers first, then by
/// name ascending, unnamed devices last within their group.
pub fn device_ranking(a: &DiscoveredDevice, b: &DiscoveredDevice) -> Ordering {
    b.is_dispenser
        .cmp(&a.is_dispenser)
        .then_with(|| match (&a.name, &b.name) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Deduplicated, ranked list of discovered devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    devices: Vec<DiscoveredDevice>,
}

impl DeviceList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new device or update an existing one whose classification changed.
    ///
    /// Returns `true` if the list changed.
    pub fn upsert(&mut self, device: DiscoveredDevice) -> bool {
        match self
            .devices
            .iter_mut()
            .find(|d| d.address == device.address)
        {
            Some(existing) => {
                if existing.is_dispenser == device.is_dispenser {
                    return false;
                }
                *existing = device;
            }
            None => self.devices.push(device),
        }

        self.devices.sort_by(device_ranking);
        true
    }

    /// Remove all devices.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Look up a device by address.
    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// The devices in ranked order.
    pub fn as_slice(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no devices have been seen.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Owns the scan session and the discovered-device list.
pub(crate) struct ScanController {
    backend: Arc<dyn BleBackend>,
    gate: Arc<dyn CapabilityGate>,
    fanout: EventFanout,
    tasks: mpsc::UnboundedSender<Input>,
    name_prefix: String,
    timeout: Duration,
    session: ScanSession,
    next_session: u64,
    devices: DeviceList,
    scan_task: Option<JoinHandle<()>>,
    scanning_tx: watch::Sender<bool>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
}

impl ScanController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn BleBackend>,
        gate: Arc<dyn CapabilityGate>,
        fanout: EventFanout,
        tasks: mpsc::UnboundedSender<Input>,
        name_prefix: String,
        timeout: Duration,
        scanning_tx: watch::Sender<bool>,
        devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    ) -> Self {
        Self {
            backend,
            gate,
            fanout,
            tasks,
            name_prefix,
            timeout,
            session: ScanSession::Idle,
            next_session: 0,
            devices: DeviceList::new(),
            scan_task: None,
            scanning_tx,
            devices_tx,
        }
    }

    /// Current session.
    pub(crate) fn session(&self) -> ScanSession {
        self.session
    }

    /// Look up a device seen in the current session.
    pub(crate) fn device(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(address)
    }

    /// Open a new scan session.
    ///
    /// Fails without touching the hardware when scanning is not permitted or
    /// the adapter is off. A running session is cancelled and replaced.
    pub(crate) async fn start(&mut self) -> Result<()> {
        if !self.gate.can_scan() {
            error!("Scan initiation failed: missing scan permission");
            let err = Error::CapabilityDenied {
                capability: Capability::Scan,
            };
            self.fanout.report(ErrorScope::Scan, err.clone());
            return Err(err);
        }

        if !self.gate.is_adapter_on() {
            error!("Bluetooth adapter not enabled, cannot scan");
            self.fanout.report(ErrorScope::Scan, Error::AdapterOff);
            return Err(Error::AdapterOff);
        }

        if self.session.is_active() {
            debug!("Superseding running scan session");
            self.cancel_session().await;
        }

        info!("Starting BLE scan");

        self.devices.clear();
        self.publish_devices();

        self.next_session += 1;
        let id = self.next_session;
        self.session = ScanSession::Active {
            id,
            started_at: Instant::now(),
            timeout: self.timeout,
        };
        self.set_scanning(true);

        let backend = self.backend.clone();
        let tasks = self.tasks.clone();
        let timeout = self.timeout;

        self.scan_task = Some(tokio::spawn(async move {
            if let Err(error) = backend.start_scan().await {
                let _ = tasks.send(Input::Task(TaskEvent::ScanStartFailed {
                    session: id,
                    error,
                }));
                return;
            }

            tokio::time::sleep(timeout).await;
            let _ = tasks.send(Input::Task(TaskEvent::ScanTimedOut { session: id }));
        }));

        Ok(())
    }

    /// Stop the running session. A no-op when no session is running.
    pub(crate) async fn stop(&mut self) {
        if !self.session.is_active() {
            return;
        }

        info!("Stopping BLE scan");
        self.cancel_session().await;
    }

    /// Handle an advertisement sighting.
    pub(crate) fn on_advertisement(&mut self, advertisement: Advertisement) {
        if !self.session.is_active() {
            trace!(
                "Ignoring advertisement from {} outside a scan session",
                advertisement.address
            );
            return;
        }

        let device = DiscoveredDevice::from_advertisement(&advertisement, &self.name_prefix);
        let address = device.address.clone();
        let is_dispenser = device.is_dispenser;

        if self.devices.upsert(device) {
            debug!(
                "Found device: {} (name: {}, dispenser: {})",
                address,
                advertisement.name.as_deref().unwrap_or("N/A"),
                is_dispenser
            );
            self.publish_devices();
        }
    }

    /// Handle a scanner failure reported by the hardware.
    pub(crate) fn on_scan_failed(&mut self, code: i32) {
        error!("BLE scan failed with error code: {}", code);
        self.end_session();
        self.fanout.report(ErrorScope::Scan, Error::ScanFailed { code });
    }

    /// Handle the scan task failing to start the hardware scan.
    pub(crate) fn on_start_failed(&mut self, session: u64, error: Error) {
        if self.session.id() != Some(session) {
            return;
        }

        error!("Error starting scan: {}", error);
        self.end_session();
        self.fanout.report(ErrorScope::Scan, error);
    }

    /// Handle a session reaching its timeout.
    pub(crate) async fn on_timeout(&mut self, session: u64) {
        if self.session.id() != Some(session) {
            trace!("Ignoring timeout of superseded scan session {}", session);
            return;
        }

        debug!("Scan timeout reached, stopping scan");
        self.cancel_session().await;
    }

    async fn cancel_session(&mut self) {
        if let Err(e) = self.backend.stop_scan().await {
            warn!("Error stopping scan: {}", e);
        }
        self.end_session();
    }

    fn end_session(&mut self) {
        if let Some(handle) = self.scan_task.take() {
            handle.abort();
        }
        self.session = ScanSession::Idle;
        self.set_scanning(false);
    }

    fn set_scanning(&self, scanning: bool) {
        self.scanning_tx.send_if_modified(|current| {
            if *current == scanning {
                false
            } else {
                *current = scanning;
                true
            }
        });
    }

    fn publish_devices(&self) {
        self.devices_tx.send_replace(self.devices.as_slice().to_vec());
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_task.take() {
            handle.abort();
        }
    }
}
