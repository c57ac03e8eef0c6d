//! GATT characteristic handling.
//!
//! Binds the characteristics discovered on the current connection to the
//! attribute catalog. Handles are connection-scoped: the registry is cleared
//! on every disconnect.

use btleplug::api::CharPropFlags;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::backend::{GattService, WriteMode};
use crate::ble::catalog::Attribute;
use crate::ble::uuids::is_cccd;

/// A GATT operation, as checked against a characteristic's properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    /// Characteristic read.
    Read,
    /// Acknowledged write.
    Write,
    /// Unacknowledged write.
    WriteWithoutResponse,
    /// Notification or indication subscription.
    Notify,
}

impl Operation {
    /// The operation implied by a write mode.
    pub fn for_write(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => Self::Write,
            WriteMode::WithoutResponse => Self::WriteWithoutResponse,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::WriteWithoutResponse => write!(f, "write without response"),
            Self::Notify => write!(f, "notify"),
        }
    }
}

/// Value to write to a client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationConfig {
    /// Enable notifications.
    Notify,
    /// Enable indications.
    Indicate,
    /// Disable both.
    Disable,
}

impl NotificationConfig {
    /// Descriptor value, little-endian.
    pub fn value(self) -> [u8; 2] {
        match self {
            Self::Notify => [0x01, 0x00],
            Self::Indicate => [0x02, 0x00],
            Self::Disable => [0x00, 0x00],
        }
    }

    /// Descriptor value as bytes.
    pub fn bytes(self) -> Bytes {
        Bytes::copy_from_slice(&self.value())
    }

    /// Whether this configuration turns delivery on.
    pub fn is_enable(self) -> bool {
        !matches!(self, Self::Disable)
    }
}

/// A characteristic discovered on the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeHandle {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Catalog entry, if the characteristic is known.
    pub attribute: Option<Attribute>,
    /// Declared access properties.
    pub properties: CharPropFlags,
    /// Whether the characteristic carries a configuration descriptor.
    pub has_cccd: bool,
}

impl AttributeHandle {
    /// Check whether the properties permit an operation.
    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Read => self.properties.contains(CharPropFlags::READ),
            Operation::Write => self.properties.contains(CharPropFlags::WRITE),
            Operation::WriteWithoutResponse => self
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            Operation::Notify => self
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
        }
    }

    /// Descriptor configuration for turning delivery on or off.
    ///
    /// Notify is preferred when both notify and indicate are declared.
    pub fn notification_config(&self, enable: bool) -> NotificationConfig {
        if !enable {
            NotificationConfig::Disable
        } else if self.properties.contains(CharPropFlags::NOTIFY) {
            NotificationConfig::Notify
        } else {
            NotificationConfig::Indicate
        }
    }
}

/// Registry of connection-scoped characteristic handles.
///
/// Written only by the device manager's worker; clones share the same map so
/// readers can take snapshots.
#[derive(Debug, Clone, Default)]
pub struct CharacteristicRegistry {
    handles: Arc<RwLock<HashMap<Uuid, AttributeHandle>>>,
}

impl CharacteristicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every characteristic of a discovered service.
    ///
    /// Replaces whatever the registry held before. Returns the number of
    /// characteristics that matched the catalog.
    pub fn bind(&self, service: &GattService) -> usize {
        let mut handles = self.handles.write();
        handles.clear();

        let mut known = 0;
        for characteristic in &service.characteristics {
            let attribute = Attribute::from_uuid(&characteristic.uuid);
            match attribute {
                Some(attribute) => {
                    known += 1;
                    debug!(
                        "Bound characteristic {} ({}), properties: {:?}",
                        characteristic.uuid, attribute, characteristic.properties
                    );
                }
                None => trace!("Uncatalogued characteristic {}", characteristic.uuid),
            }

            handles.insert(
                characteristic.uuid,
                AttributeHandle {
                    uuid: characteristic.uuid,
                    attribute,
                    properties: characteristic.properties,
                    has_cccd: characteristic.descriptors.iter().any(is_cccd),
                },
            );
        }

        debug!("Registered {} characteristics", handles.len());
        known
    }

    /// Get a handle by UUID.
    pub fn get(&self, uuid: &Uuid) -> Option<AttributeHandle> {
        self.handles.read().get(uuid).cloned()
    }

    /// Check if a characteristic was discovered.
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.handles.read().contains_key(uuid)
    }

    /// Check if any of the given attributes was discovered.
    pub fn contains_any(&self, attributes: &[Attribute]) -> bool {
        let handles = self.handles.read();
        attributes.iter().any(|a| handles.contains_key(&a.uuid()))
    }

    /// Drop all handles.
    pub fn clear(&self) {
        self.handles.write().clear();
    }

    /// Copy of all handles, catalogued attributes first in catalog order.
    pub fn snapshot(&self) -> Vec<AttributeHandle> {
        let mut handles: Vec<_> = self.handles.read().values().cloned().collect();
        handles.sort_by_key(|h| (h.attribute.is_none(), h.attribute, h.uuid));
        handles
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}
