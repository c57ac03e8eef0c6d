//! Typed client for a connected pill dispenser.
//!
//! Wraps a [`DeviceManager`] with one method per dispenser operation and keeps
//! a [`DispenserTelemetry`] snapshot current from the inbound event stream.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::ble::backend::WriteMode;
use crate::ble::catalog::Attribute;
use crate::ble::connection::ConnectionState;
use crate::ble::events::InboundEvent;
use crate::device_manager::{CallbackHandle, DeviceManager};
use crate::error::Result;
use crate::utils::{format_device_time, parse_device_time};

/// Payload that triggers a manual dispense.
pub const MANUAL_DISPENSE_PAYLOAD: [u8; 1] = [0x01];

/// Latest values reported by the dispenser, decoded as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DispenserTelemetry {
    /// Device wall-clock time.
    pub device_time: Option<String>,
    /// Dispense schedule.
    pub dispense_schedule: Option<String>,
    /// Last dispense information.
    pub last_dispense_info: Option<String>,
    /// Time until the next scheduled dispense.
    pub time_until_next_dispense: Option<String>,
    /// Dispense history.
    pub dispense_log: Option<String>,
    /// When any value last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

impl DispenserTelemetry {
    /// Apply an inbound value. Returns `true` if it belonged to a readable attribute.
    pub fn apply(&mut self, event: &InboundEvent) -> bool {
        let slot = match event.attribute_kind() {
            Some(Attribute::GetDeviceTime) => &mut self.device_time,
            Some(Attribute::GetDispenseSchedule) => &mut self.dispense_schedule,
            Some(Attribute::GetLastDispenseInfo) => &mut self.last_dispense_info,
            Some(Attribute::GetTimeUntilNextDispense) => &mut self.time_until_next_dispense,
            Some(Attribute::GetDispenseLog) => &mut self.dispense_log,
            _ => return false,
        };

        *slot = Some(event.text());
        self.updated_at = Some(event.timestamp);
        true
    }

    /// Latest text of a readable attribute.
    pub fn get(&self, attribute: Attribute) -> Option<&str> {
        match attribute {
            Attribute::GetDeviceTime => self.device_time.as_deref(),
            Attribute::GetDispenseSchedule => self.dispense_schedule.as_deref(),
            Attribute::GetLastDispenseInfo => self.last_dispense_info.as_deref(),
            Attribute::GetTimeUntilNextDispense => self.time_until_next_dispense.as_deref(),
            Attribute::GetDispenseLog => self.dispense_log.as_deref(),
            _ => None,
        }
    }

    /// Device time parsed from the device's text format.
    pub fn parsed_device_time(&self) -> Option<NaiveDateTime> {
        self.device_time.as_deref().and_then(parse_device_time)
    }

    /// Check if nothing has been received yet.
    pub fn is_empty(&self) -> bool {
        self.updated_at.is_none()
    }
}

/// A pill dispenser reached through a [`DeviceManager`].
pub struct Dispenser {
    manager: Arc<DeviceManager>,
    telemetry: Arc<RwLock<DispenserTelemetry>>,
    telemetry_tx: broadcast::Sender<DispenserTelemetry>,
    callback_counter: AtomicU64,
    listener: Option<JoinHandle<()>>,
}

impl Dispenser {
    /// Create a client over `manager`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(manager: Arc<DeviceManager>) -> Self {
        let telemetry = Arc::new(RwLock::new(DispenserTelemetry::default()));
        let (telemetry_tx, _) = broadcast::channel(manager.config().event_capacity.max(1));

        let listener = tokio::spawn(Self::track_telemetry(
            manager.subscribe_inbound(),
            manager.watch_connection_state(),
            telemetry.clone(),
            telemetry_tx.clone(),
        ));

        Self {
            manager,
            telemetry,
            telemetry_tx,
            callback_counter: AtomicU64::new(0),
            listener: Some(listener),
        }
    }

    /// The underlying manager.
    pub fn manager(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    async fn track_telemetry(
        mut inbound: broadcast::Receiver<InboundEvent>,
        mut state: watch::Receiver<ConnectionState>,
        telemetry: Arc<RwLock<DispenserTelemetry>>,
        telemetry_tx: broadcast::Sender<DispenserTelemetry>,
    ) {
        loop {
            tokio::select! {
                received = inbound.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Telemetry listener lagged by {} events", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    let snapshot = {
                        let mut current = telemetry.write();
                        if !current.apply(&event) {
                            trace!("Ignoring inbound value from {}", event.attribute);
                            continue;
                        }
                        current.clone()
                    };
                    let _ = telemetry_tx.send(snapshot);
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if state.borrow_and_update().is_ready() {
                        continue;
                    }

                    let cleared = {
                        let mut current = telemetry.write();
                        if current.is_empty() {
                            false
                        } else {
                            *current = DispenserTelemetry::default();
                            true
                        }
                    };
                    if cleared {
                        debug!("Connection lost, telemetry cleared");
                        let _ = telemetry_tx.send(DispenserTelemetry::default());
                    }
                }
            }
        }

        debug!("Telemetry listener stopped");
    }

    // === Commands ===

    /// Dispense one chamber now.
    pub async fn trigger_manual_dispense(&self) -> Result<()> {
        info!("Triggering manual dispense");
        self.manager
            .write(
                Attribute::TriggerManualDispense.uuid(),
                MANUAL_DISPENSE_PAYLOAD.to_vec(),
                WriteMode::WithResponse,
            )
            .await
    }

    /// Set the device's wall-clock time.
    pub async fn set_device_time(&self, time: NaiveDateTime) -> Result<()> {
        self.set_device_time_text(&format_device_time(&time)).await
    }

    /// Set the device's clock to the local time of this machine.
    pub async fn sync_device_time(&self) -> Result<()> {
        self.set_device_time(Local::now().naive_local()).await
    }

    /// Set the device time from preformatted text.
    pub async fn set_device_time_text(&self, text: &str) -> Result<()> {
        debug!("Setting device time to {}", text);
        self.manager
            .write(
                Attribute::SetDeviceTime.uuid(),
                text.as_bytes().to_vec(),
                WriteMode::WithResponse,
            )
            .await
    }

    /// Replace the dispense schedule.
    pub async fn set_dispense_schedule(&self, schedule: &str) -> Result<()> {
        debug!("Setting dispense schedule to {}", schedule);
        self.manager
            .write(
                Attribute::SetDispenseSchedule.uuid(),
                schedule.as_bytes().to_vec(),
                WriteMode::WithResponse,
            )
            .await
    }

    // === Reads ===

    /// Request a fresh value of a readable attribute.
    ///
    /// The value arrives through the telemetry snapshot.
    pub async fn request(&self, attribute: Attribute) -> Result<()> {
        self.manager.read(attribute.uuid()).await
    }

    /// Request the device time.
    pub async fn request_device_time(&self) -> Result<()> {
        self.request(Attribute::GetDeviceTime).await
    }

    /// Request the dispense schedule.
    pub async fn request_dispense_schedule(&self) -> Result<()> {
        self.request(Attribute::GetDispenseSchedule).await
    }

    /// Request the last dispense information.
    pub async fn request_last_dispense_info(&self) -> Result<()> {
        self.request(Attribute::GetLastDispenseInfo).await
    }

    /// Request the time until the next dispense.
    pub async fn request_time_until_next_dispense(&self) -> Result<()> {
        self.request(Attribute::GetTimeUntilNextDispense).await
    }

    /// Request the dispense log.
    pub async fn request_dispense_log(&self) -> Result<()> {
        self.request(Attribute::GetDispenseLog).await
    }

    // === Telemetry ===

    /// Latest telemetry snapshot.
    pub fn telemetry(&self) -> DispenserTelemetry {
        self.telemetry.read().clone()
    }

    /// Subscribe to telemetry snapshots.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<DispenserTelemetry> {
        self.telemetry_tx.subscribe()
    }

    /// Register a callback for telemetry updates.
    pub fn on_telemetry_updated<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&DispenserTelemetry) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.telemetry_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(telemetry) => callback(&telemetry),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl Drop for Dispenser {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}
