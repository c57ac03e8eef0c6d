// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # dispenser-ble
//!
//! A cross-platform Rust library for driving an ESP32 pill dispenser over
//! Bluetooth Low Energy from the central role.
//!
//! Any BLE device can be discovered, but devices advertising a name that
//! starts with `PillDispenserESP32` (any case) are marked as dispensers and listed first.
//!
//! ## Features
//!
//! - **Device Discovery**: Time-limited scan sessions with a ranked device list
//! - **Connection Lifecycle**: One link at a time, observable as a state machine
//! - **GATT Dispatch**: Serialized reads, writes and notification toggles
//! - **Dispenser Client**: Manual dispense, device time and schedule control
//! - **Telemetry**: Latest device time, schedule, last dispense and log as text
//! - **Testable Seams**: Radio backend and permission gate are traits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dispenser_ble::{DeviceManager, Dispenser, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create device manager and start scanning
//!     let manager = Arc::new(DeviceManager::new().await?);
//!     manager.start_scan().await?;
//!
//!     // Wait for dispensers to advertise
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     let Some(device) = manager.discovered_devices().into_iter().find(|d| d.is_dispenser) else {
//!         println!("No dispenser found");
//!         return manager.shutdown().await;
//!     };
//!
//!     manager.connect_to_device(&device.address).await?;
//!     manager.wait_for_state(|state| state.is_ready()).await?;
//!
//!     let dispenser = Dispenser::new(manager.clone());
//!     dispenser.request_dispense_schedule().await?;
//!     dispenser.trigger_manual_dispense().await?;
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod dispenser;
pub mod error;
pub mod utils;

pub(crate) mod worker;

// Re-exports for convenience
pub use config::{ManagerConfig, UnexpectedDisconnectPolicy};
pub use device_manager::{CallbackHandle, DeviceManager};
pub use dispenser::{Dispenser, DispenserTelemetry};
pub use error::{Error, Result};
pub use utils::{format_device_time, parse_device_time, payload_text};

// Re-export commonly used types from submodules
pub use ble::advertising::DiscoveredDevice;
pub use ble::backend::{
    Advertisement, BleBackend, GattCharacteristic, GattService, GattStatus, HardwareEvent,
    HardwareEventSink, LinkId, LinkState, WriteMode,
};
pub use ble::capability::{Capability, CapabilityFlags, CapabilityGate};
pub use ble::catalog::Attribute;
pub use ble::characteristics::{AttributeHandle, Operation};
pub use ble::connection::{ConnectionEvent, ConnectionState};
pub use ble::events::{ErrorScope, EventSource, InboundEvent, OperationError};
