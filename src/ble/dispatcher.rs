//! Operation dispatcher.
//!
//! Validates read, write and notification requests against the connection
//! state and the characteristic registry before anything reaches the
//! hardware, then serializes them: the radio tolerates a single outstanding
//! GATT transaction, so requests wait in a FIFO queue until the previous one
//! completes.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::backend::{BleBackend, GattStatus, WriteMode};
use crate::ble::capability::{Capability, CapabilityGate};
use crate::ble::catalog::Attribute;
use crate::ble::characteristics::{
    AttributeHandle, CharacteristicRegistry, NotificationConfig, Operation,
};
use crate::ble::events::{ErrorScope, EventFanout, EventSource, InboundEvent};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result};

/// A queued GATT transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GattRequest {
    Read {
        uuid: Uuid,
    },
    Write {
        uuid: Uuid,
        data: Bytes,
        mode: WriteMode,
    },
    Descriptor {
        characteristic: Uuid,
        config: NotificationConfig,
    },
}

impl GattRequest {
    fn attribute(&self) -> Uuid {
        match self {
            Self::Read { uuid } | Self::Write { uuid, .. } => *uuid,
            Self::Descriptor { characteristic, .. } => *characteristic,
        }
    }

    fn scope(&self) -> ErrorScope {
        match self {
            Self::Read { .. } => ErrorScope::Read,
            Self::Write { .. } => ErrorScope::Write,
            Self::Descriptor { .. } => ErrorScope::Notify,
        }
    }
}

impl std::fmt::Display for GattRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { uuid } => write!(f, "read of {}", uuid),
            Self::Write { uuid, data, .. } => write!(f, "write of {} bytes to {}", data.len(), uuid),
            Self::Descriptor { characteristic, .. } => {
                write!(f, "descriptor write on {}", characteristic)
            }
        }
    }
}

/// Validates and serializes GATT operations for the current connection.
pub(crate) struct Dispatcher {
    backend: Arc<dyn BleBackend>,
    gate: Arc<dyn CapabilityGate>,
    registry: CharacteristicRegistry,
    fanout: EventFanout,
    queue: VecDeque<GattRequest>,
    in_flight: Option<GattRequest>,
}

impl Dispatcher {
    pub(crate) fn new(
        backend: Arc<dyn BleBackend>,
        gate: Arc<dyn CapabilityGate>,
        registry: CharacteristicRegistry,
        fanout: EventFanout,
    ) -> Self {
        Self {
            backend,
            gate,
            registry,
            fanout,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// The registry this dispatcher validates against.
    pub(crate) fn registry(&self) -> &CharacteristicRegistry {
        &self.registry
    }

    /// Number of requests queued or in flight.
    pub(crate) fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// Pre-flight checks shared by every operation.
    fn validate(&self, ready: bool, uuid: Uuid, operation: Operation) -> Result<AttributeHandle> {
        if !self.gate.can_connect() {
            return Err(Error::CapabilityDenied {
                capability: Capability::Connect,
            });
        }

        if !ready {
            return Err(Error::NotConnected);
        }

        let handle = self
            .registry
            .get(&uuid)
            .ok_or(Error::UnknownAttribute { uuid })?;

        if !handle.supports(operation) {
            return Err(Error::UnsupportedMode { uuid, operation });
        }

        Ok(handle)
    }

    /// Read a characteristic; the value arrives as an inbound event.
    pub(crate) async fn read(&mut self, ready: bool, uuid: Uuid) -> Result<()> {
        self.validate(ready, uuid, Operation::Read)
            .map_err(|e| {
                debug!("Read of {} rejected: {}", uuid, e);
                e
            })?;

        self.submit(GattRequest::Read { uuid }).await
    }

    /// Write a characteristic.
    pub(crate) async fn write(
        &mut self,
        ready: bool,
        uuid: Uuid,
        data: Bytes,
        mode: WriteMode,
    ) -> Result<()> {
        self.validate(ready, uuid, Operation::for_write(mode))
            .map_err(|e| {
                debug!("Write to {} rejected: {}", uuid, e);
                e
            })?;

        self.submit(GattRequest::Write { uuid, data, mode }).await
    }

    /// Turn notifications or indications on or off.
    ///
    /// Local interest is registered first, then the configuration descriptor
    /// is written. Without a descriptor the local registration stands alone.
    pub(crate) async fn set_notify(&mut self, ready: bool, uuid: Uuid, enable: bool) -> Result<()> {
        let handle = self
            .validate(ready, uuid, Operation::Notify)
            .map_err(|e| {
                debug!("Notify change on {} rejected: {}", uuid, e);
                e
            })?;

        self.backend.set_local_notify(uuid, enable).await?;

        if !handle.has_cccd {
            debug!(
                "No configuration descriptor on {}, local registration only",
                uuid
            );
            return Ok(());
        }

        let config = handle.notification_config(enable);
        let request = GattRequest::Descriptor {
            characteristic: uuid,
            config,
        };

        if let Err(e) = self.submit(request).await {
            if config.is_enable() {
                self.rollback_local_notify(uuid).await;
            }
            return Err(e);
        }

        Ok(())
    }

    /// Enable notifications on every discovered auto-notify attribute.
    ///
    /// Individual failures are logged and skipped.
    pub(crate) async fn enable_auto_notifications(&mut self) {
        for attribute in Attribute::AUTO_NOTIFY {
            let uuid = attribute.uuid();
            match self.registry.get(&uuid) {
                Some(handle) if handle.supports(Operation::Notify) => {}
                Some(_) => {
                    debug!("{} does not support notifications, skipping", attribute);
                    continue;
                }
                None => {
                    trace!("{} not present, skipping notifications", attribute);
                    continue;
                }
            }

            match self.set_notify(true, uuid, true).await {
                Ok(()) => debug!("Notifications requested for {}", attribute),
                Err(e) => warn!("Failed to enable notifications for {}: {}", attribute, e),
            }
        }
    }

    /// Handle a read completion.
    pub(crate) async fn on_read(&mut self, uuid: Uuid, status: GattStatus, value: Bytes) {
        if !self.take_in_flight(|r| matches!(r, GattRequest::Read { uuid: u } if *u == uuid)) {
            trace!("Ignoring unsolicited read completion for {}", uuid);
            return;
        }

        if status.is_success() {
            self.fanout
                .publish(InboundEvent::new(uuid, value, EventSource::Read));
        } else {
            warn!("Read of {} failed, status: {}", uuid, status);
            self.fanout.report_attribute(
                ErrorScope::Read,
                uuid,
                Error::rejected(status, "characteristic read failed"),
            );
        }

        self.pump().await;
    }

    /// Handle a write completion.
    pub(crate) async fn on_written(&mut self, uuid: Uuid, status: GattStatus) {
        if !self.take_in_flight(|r| matches!(r, GattRequest::Write { uuid: u, .. } if *u == uuid)) {
            trace!("Ignoring unsolicited write completion for {}", uuid);
            return;
        }

        if status.is_success() {
            trace!("Write to {} acknowledged", uuid);
        } else {
            warn!("Write to {} failed, status: {}", uuid, status);
            self.fanout.report_attribute(
                ErrorScope::Write,
                uuid,
                Error::rejected(status, "characteristic write failed"),
            );
        }

        self.pump().await;
    }

    /// Handle a descriptor write completion.
    pub(crate) async fn on_descriptor_written(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    ) {
        let config = match &self.in_flight {
            Some(GattRequest::Descriptor {
                characteristic: c,
                config,
            }) if *c == characteristic && descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID => {
                *config
            }
            _ => {
                trace!(
                    "Ignoring unsolicited descriptor completion for {}",
                    characteristic
                );
                return;
            }
        };
        self.in_flight = None;

        if status.is_success() {
            debug!("Descriptor on {} set to {:?}", characteristic, config);
        } else {
            warn!(
                "Descriptor write on {} failed, status: {}",
                characteristic, status
            );
            if config.is_enable() {
                self.rollback_local_notify(characteristic).await;
            }
            self.fanout.report_attribute(
                ErrorScope::Notify,
                characteristic,
                Error::rejected(status, "descriptor write failed"),
            );
        }

        self.pump().await;
    }

    /// Handle a notification or indication.
    pub(crate) fn on_changed(&self, uuid: Uuid, value: Bytes) {
        if !self.registry.contains(&uuid) {
            trace!("Dropping notification from unregistered {}", uuid);
            return;
        }

        self.fanout
            .publish(InboundEvent::new(uuid, value, EventSource::Notification));
    }

    /// Drop all connection-scoped state.
    pub(crate) fn reset(&mut self) {
        if self.pending() > 0 {
            debug!("Discarding {} pending GATT operations", self.pending());
        }
        self.queue.clear();
        self.in_flight = None;
        self.registry.clear();
    }

    fn take_in_flight(&mut self, matches: impl Fn(&GattRequest) -> bool) -> bool {
        match &self.in_flight {
            Some(request) if matches(request) => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Issue immediately when idle, otherwise queue.
    async fn submit(&mut self, request: GattRequest) -> Result<()> {
        if self.in_flight.is_some() {
            trace!("Queueing {}", request);
            self.queue.push_back(request);
            return Ok(());
        }

        self.issue(&request).await?;
        self.in_flight = Some(request);
        Ok(())
    }

    /// Issue queued requests until one is accepted by the hardware.
    async fn pump(&mut self) {
        while self.in_flight.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };

            match self.issue(&request).await {
                Ok(()) => self.in_flight = Some(request),
                Err(e) => {
                    warn!("Failed to issue {}: {}", request, e);
                    if let GattRequest::Descriptor {
                        characteristic,
                        config,
                    } = &request
                    {
                        if config.is_enable() {
                            self.rollback_local_notify(*characteristic).await;
                        }
                    }
                    self.fanout
                        .report_attribute(request.scope(), request.attribute(), e);
                }
            }
        }
    }

    async fn issue(&self, request: &GattRequest) -> Result<()> {
        if !self.gate.can_connect() {
            return Err(Error::PermissionRevokedMidOperation {
                operation: request.to_string(),
            });
        }

        trace!("Issuing {}", request);

        match request {
            GattRequest::Read { uuid } => self.backend.read(*uuid).await,
            GattRequest::Write { uuid, data, mode } => {
                self.backend.write(*uuid, data.clone(), *mode).await
            }
            GattRequest::Descriptor {
                characteristic,
                config,
            } => {
                self.backend
                    .write_descriptor(
                        *characteristic,
                        CLIENT_CHARACTERISTIC_CONFIG_UUID,
                        config.bytes(),
                    )
                    .await
            }
        }
    }

    async fn rollback_local_notify(&self, uuid: Uuid) {
        debug!("Rolling back local notification interest on {}", uuid);
        if let Err(e) = self.backend.set_local_notify(uuid, false).await {
            warn!("Failed to roll back notifications on {}: {}", uuid, e);
        }
    }
}
