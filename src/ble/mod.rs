//! BLE communication module.
//!
//! This module provides the central-role building blocks for discovering
//! and talking to pill dispensers: the hardware seam, scanning, the
//! connection state machine and GATT dispatch.

pub mod advertising;
pub mod backend;
pub mod capability;
pub mod catalog;
pub mod characteristics;
pub mod connection;
pub(crate) mod dispatcher;
pub mod events;
pub mod platform;
pub mod scanner;
pub mod uuids;

pub use advertising::DiscoveredDevice;
pub use backend::{
    Advertisement, BleBackend, GattCharacteristic, GattService, GattStatus, HardwareEvent,
    HardwareEventSink, LinkId, LinkState, WriteMode,
};
pub use capability::{Capability, CapabilityFlags, CapabilityGate};
pub use catalog::Attribute;
pub use characteristics::{AttributeHandle, CharacteristicRegistry, NotificationConfig, Operation};
pub use connection::{ConnectionEvent, ConnectionState};
pub use events::{ErrorScope, EventFanout, EventSource, InboundEvent, OperationError};
pub use platform::BtleplugBackend;
pub use scanner::{DeviceList, ScanSession};
pub use uuids::*;
