//! Hardware seam.
//!
//! The radio stack is modelled the way central-role platform APIs expose it:
//! calls only *issue* an operation, and the outcome is delivered later as a
//! [`HardwareEvent`] on the sink handed to [`BleBackend::attach`]. The sink
//! feeds the same queue as the manager's commands, so the worker sees every
//! input in arrival order.

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::worker::Input;

/// Identifier of one connection attempt and the link it produces.
pub type LinkId = u64;

/// Sink through which a backend delivers hardware callbacks.
#[derive(Clone)]
pub struct HardwareEventSink {
    inputs: mpsc::UnboundedSender<Input>,
}

impl HardwareEventSink {
    pub(crate) fn new(inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self { inputs }
    }

    /// Deliver a hardware callback. Returns `false` once the manager has stopped.
    pub fn send(&self, event: HardwareEvent) -> bool {
        self.inputs.send(Input::Hardware(event)).is_ok()
    }

    /// Check if the manager has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }
}

impl std::fmt::Debug for HardwareEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareEventSink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Status code attached to hardware completions.
///
/// Values follow the HCI / GATT status codes reported by mobile stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattStatus(pub u16);

impl GattStatus {
    /// Operation completed successfully.
    pub const SUCCESS: Self = Self(0);
    /// Supervision timeout; the link dropped without a disconnect exchange.
    pub const LINK_LOST: Self = Self(0x08);
    /// The remote side terminated the connection.
    pub const PEER_USER_TERMINATED: Self = Self(0x13);
    /// The local host terminated the connection.
    pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
    /// Generic stack error.
    pub const GATT_ERROR: Self = Self(0x85);
    /// Unspecified failure.
    pub const FAILURE: Self = Self(0x101);

    /// Check for success.
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Whether a disconnect with this status is an ordinary teardown.
    pub fn is_normal_disconnect(self) -> bool {
        self == Self::SUCCESS || self == Self::PEER_USER_TERMINATED
    }

    fn name(self) -> Option<&'static str> {
        match self {
            Self::SUCCESS => Some("success"),
            Self::LINK_LOST => Some("link lost"),
            Self::PEER_USER_TERMINATED => Some("terminated by peer"),
            Self::LOCAL_HOST_TERMINATED => Some("terminated locally"),
            Self::GATT_ERROR => Some("gatt error"),
            Self::FAILURE => Some("failure"),
            _ => None,
        }
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<&btleplug::Error> for GattStatus {
    fn from(e: &btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => Self::LINK_LOST,
            btleplug::Error::TimedOut(_) => Self::LINK_LOST,
            _ => Self::GATT_ERROR,
        }
    }
}

/// Requested write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// Acknowledged write; requires the write property.
    #[default]
    WithResponse,
    /// Unacknowledged write; requires the write-without-response property.
    WithoutResponse,
}

impl From<WriteMode> for btleplug::api::WriteType {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => Self::WithResponse,
            WriteMode::WithoutResponse => Self::WithoutResponse,
        }
    }
}

/// Link state reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// The link is up.
    Connected,
    /// The link is down.
    Disconnected,
}

/// A characteristic as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Declared access properties.
    pub properties: CharPropFlags,
    /// UUIDs of the characteristic's descriptors.
    pub descriptors: Vec<Uuid>,
}

/// A service as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// A single advertisement sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Opaque hardware identifier.
    pub address: String,
    /// Advertised name; `None` when the platform would not disclose it.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// An asynchronous hardware callback.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    /// An advertisement was received during a scan.
    Advertisement(Advertisement),
    /// The scanner failed with a platform error code.
    ScanFailed {
        /// Platform error code.
        code: i32,
    },
    /// The link to a peripheral changed state.
    LinkStateChanged {
        /// Link the change belongs to, as passed to [`BleBackend::connect`].
        link: LinkId,
        /// Address of the peripheral.
        address: String,
        /// New link state.
        state: LinkState,
        /// Status accompanying the change.
        status: GattStatus,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Discovery status.
        status: GattStatus,
        /// Discovered services; empty on failure.
        services: Vec<GattService>,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        /// Characteristic UUID.
        uuid: Uuid,
        /// Completion status.
        status: GattStatus,
        /// Value read; empty on failure.
        value: Bytes,
    },
    /// A characteristic write completed.
    CharacteristicWritten {
        /// Characteristic UUID.
        uuid: Uuid,
        /// Completion status.
        status: GattStatus,
    },
    /// A notification or indication arrived.
    CharacteristicChanged {
        /// Characteristic UUID.
        uuid: Uuid,
        /// New value.
        value: Bytes,
    },
    /// A descriptor write completed.
    DescriptorWritten {
        /// Owning characteristic UUID.
        characteristic: Uuid,
        /// Descriptor UUID.
        descriptor: Uuid,
        /// Completion status.
        status: GattStatus,
    },
}

/// Central-role radio stack.
///
/// `Err` from a call means the platform refused to issue the operation (for
/// example a permission exception); it never carries the operation's outcome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Register the sink for hardware callbacks.
    fn attach(&self, sink: HardwareEventSink);

    /// Resolve a textual address into the platform's hardware identifier.
    fn resolve_address(&self, address: &str) -> Result<String>;

    /// Start delivering advertisements.
    async fn start_scan(&self) -> Result<()>;

    /// Stop delivering advertisements.
    async fn stop_scan(&self) -> Result<()>;

    /// Begin establishing a link; reported via `LinkStateChanged` tagged with `link`.
    ///
    /// Every later `LinkStateChanged` for this link carries the same id.
    async fn connect(&self, address: &str, link: LinkId) -> Result<()>;

    /// Begin tearing down the link; reported via `LinkStateChanged`.
    async fn disconnect(&self) -> Result<()>;

    /// Release the link handle without waiting for further callbacks.
    async fn close(&self);

    /// Begin service discovery; reported via `ServicesDiscovered`.
    async fn discover_services(&self) -> Result<()>;

    /// Issue a characteristic read; reported via `CharacteristicRead`.
    async fn read(&self, characteristic: Uuid) -> Result<()>;

    /// Issue a characteristic write; reported via `CharacteristicWritten`.
    async fn write(&self, characteristic: Uuid, data: Bytes, mode: WriteMode) -> Result<()>;

    /// Register or drop local interest in a characteristic's notifications.
    async fn set_local_notify(&self, characteristic: Uuid, enable: bool) -> Result<()>;

    /// Issue a descriptor write; reported via `DescriptorWritten`.
    async fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: Bytes)
        -> Result<()>;
}
