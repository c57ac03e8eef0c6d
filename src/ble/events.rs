//! Inbound event fan-out.
//!
//! Read completions and notifications are normalized into [`InboundEvent`]s
//! and broadcast to any number of subscribers. Failed operations are reported
//! separately as [`OperationError`]s so they never disturb the connection state.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::ble::catalog::Attribute;
use crate::error::Error;
use crate::utils::payload_text;

/// How an inbound value reached the central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventSource {
    /// Completion of a read the central requested.
    Read,
    /// Notification or indication pushed by the peripheral.
    Notification,
}

/// A value received from the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InboundEvent {
    /// Characteristic the value belongs to.
    pub attribute: Uuid,
    /// Raw payload; never assumed to be decodable.
    pub payload: Bytes,
    /// When the value was received.
    pub timestamp: DateTime<Utc>,
    /// Read completion or notification.
    pub source: EventSource,
}

impl InboundEvent {
    /// Create an event stamped with the current time.
    pub fn new(attribute: Uuid, payload: Bytes, source: EventSource) -> Self {
        Self {
            attribute,
            payload,
            timestamp: Utc::now(),
            source,
        }
    }

    /// Catalog entry for the characteristic, if known.
    pub fn attribute_kind(&self) -> Option<Attribute> {
        Attribute::from_uuid(&self.attribute)
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> String {
        payload_text(&self.payload)
    }
}

/// Which kind of operation an [`OperationError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorScope {
    /// Scanning.
    Scan,
    /// Connection setup.
    Connect,
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Notification configuration.
    Notify,
}

impl std::fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Connect => write!(f, "connect"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Notify => write!(f, "notify"),
        }
    }
}

/// An operation failure, distinct from connection-level state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    /// Kind of operation that failed.
    pub scope: ErrorScope,
    /// Characteristic involved, for GATT operations.
    pub attribute: Option<Uuid>,
    /// The failure.
    pub error: Error,
    /// When the failure was reported.
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.attribute {
            Some(uuid) => write!(f, "{} {} failed: {}", self.scope, uuid, self.error),
            None => write!(f, "{} failed: {}", self.scope, self.error),
        }
    }
}

/// Broadcast channels for inbound values and operation errors.
#[derive(Debug, Clone)]
pub struct EventFanout {
    inbound_tx: broadcast::Sender<InboundEvent>,
    error_tx: broadcast::Sender<OperationError>,
}

impl EventFanout {
    /// Create a fan-out whose channels buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, _) = broadcast::channel(capacity.max(1));
        let (error_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inbound_tx,
            error_tx,
        }
    }

    /// Broadcast an inbound value.
    pub fn publish(&self, event: InboundEvent) {
        trace!(
            "Inbound {:?} from {}: {} bytes",
            event.source,
            event.attribute,
            event.payload.len()
        );
        let _ = self.inbound_tx.send(event);
    }

    /// Broadcast a failure that is not tied to a characteristic.
    pub fn report(&self, scope: ErrorScope, error: Error) {
        self.send_error(scope, None, error);
    }

    /// Broadcast a characteristic operation failure.
    pub fn report_attribute(&self, scope: ErrorScope, attribute: Uuid, error: Error) {
        self.send_error(scope, Some(attribute), error);
    }

    fn send_error(&self, scope: ErrorScope, attribute: Option<Uuid>, error: Error) {
        let _ = self.error_tx.send(OperationError {
            scope,
            attribute,
            error,
            timestamp: Utc::now(),
        });
    }

    /// Get a receiver for inbound values.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound_tx.subscribe()
    }

    /// Get a receiver for operation errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<OperationError> {
        self.error_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::GET_DEVICE_TIME_UUID;

    #[test]
    fn test_inbound_event_text_is_lossy() {
        let event = InboundEvent::new(
            GET_DEVICE_TIME_UUID,
            Bytes::from_static(b"12:00\xff"),
            EventSource::Notification,
        );
        assert_eq!(event.text(), "12:00\u{fffd}");
        assert_eq!(event.attribute_kind(), Some(Attribute::GetDeviceTime));
    }

    #[test]
    fn test_publish_preserves_order() {
        let fanout = EventFanout::new(8);
        let mut rx = fanout.subscribe_inbound();

        for i in 0..3u8 {
            fanout.publish(InboundEvent::new(
                GET_DEVICE_TIME_UUID,
                Bytes::copy_from_slice(&[i]),
                EventSource::Read,
            ));
        }

        for i in 0..3u8 {
            let event = rx.try_recv().expect("event");
            assert_eq!(event.payload.as_ref(), &[i]);
        }
    }

    #[test]
    fn test_report_without_subscribers() {
        let fanout = EventFanout::new(8);
        fanout.report(ErrorScope::Scan, Error::AdapterOff);

        let mut rx = fanout.subscribe_errors();
        fanout.report_attribute(ErrorScope::Write, GET_DEVICE_TIME_UUID, Error::NotConnected);
        let error = rx.try_recv().expect("error");
        assert_eq!(error.scope, ErrorScope::Write);
        assert_eq!(error.attribute, Some(GET_DEVICE_TIME_UUID));
        assert!(error.to_string().starts_with("write "));
    }
}
