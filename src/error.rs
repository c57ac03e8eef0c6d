//! Error types for the dispenser-ble crate.

use thiserror::Error;
use uuid::Uuid;

use crate::ble::backend::GattStatus;
use crate::ble::capability::Capability;
use crate::ble::characteristics::Operation;

/// The main error type for this crate.
///
/// Every variant doubles as a machine-checkable reason code (see [`Error::code`]);
/// the `Display` output is the human-readable detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required platform capability (permission) is not granted.
    #[error("{capability} permission not granted")]
    CapabilityDenied {
        /// The capability that was denied.
        capability: Capability,
    },

    /// The Bluetooth adapter is powered off.
    #[error("Bluetooth not enabled")]
    AdapterOff,

    /// Bluetooth is not available on this system (no adapter).
    #[error("Bluetooth not available")]
    BluetoothUnavailable,

    /// The supplied address does not resolve to a hardware identifier.
    #[error("Invalid device address: {address}")]
    InvalidAddress {
        /// The address that failed to resolve.
        address: String,
    },

    /// No peripheral with this address is known to the platform.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// The link could not be established.
    #[error("Connection failed, status: {status}")]
    ConnectFailed {
        /// Status reported by the hardware.
        status: GattStatus,
    },

    /// The dispenser service is absent from the peripheral.
    #[error("Required service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the missing service.
        uuid: Uuid,
    },

    /// Service discovery reported a failure.
    #[error("Service discovery failed, status: {status}")]
    DiscoveryFailed {
        /// Status reported by the hardware.
        status: GattStatus,
    },

    /// None of the critical characteristics were discovered.
    #[error("Device not supported (missing required characteristics)")]
    MissingRequiredAttributes,

    /// Operation requires a ready connection.
    #[error("Not connected")]
    NotConnected,

    /// The characteristic was not discovered on the current connection.
    #[error("Characteristic not found: {uuid}")]
    UnknownAttribute {
        /// The UUID of the characteristic.
        uuid: Uuid,
    },

    /// The characteristic's properties do not permit the requested operation.
    #[error("Characteristic {uuid} does not support {operation}")]
    UnsupportedMode {
        /// The UUID of the characteristic.
        uuid: Uuid,
        /// The rejected operation.
        operation: Operation,
    },

    /// The hardware refused or failed an operation.
    #[error("Operation rejected by hardware: {detail}")]
    HardwareRejected {
        /// Status reported by the hardware, when there is one.
        status: Option<GattStatus>,
        /// Description from the platform stack.
        detail: String,
    },

    /// A platform permission disappeared while an operation was being issued.
    #[error("Permission revoked during {operation}")]
    PermissionRevokedMidOperation {
        /// The operation that was being issued.
        operation: String,
    },

    /// The scanner reported a failure.
    #[error("Scan failed, code: {code}")]
    ScanFailed {
        /// Platform error code.
        code: i32,
    },

    /// The link dropped with an unexpected status.
    #[error("Connection lost, status: {status}")]
    ConnectionLost {
        /// Status reported by the hardware.
        status: GattStatus,
    },

    /// The device manager worker is no longer running.
    #[error("Device manager has shut down")]
    ManagerClosed,
}

impl Error {
    /// Stable reason code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapabilityDenied { .. } => "capability_denied",
            Self::AdapterOff => "adapter_off",
            Self::BluetoothUnavailable => "bluetooth_unavailable",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::DiscoveryFailed { .. } => "discovery_failed",
            Self::MissingRequiredAttributes => "missing_required_attributes",
            Self::NotConnected => "not_connected",
            Self::UnknownAttribute { .. } => "unknown_attribute",
            Self::UnsupportedMode { .. } => "unsupported_mode",
            Self::HardwareRejected { .. } => "hardware_rejected",
            Self::PermissionRevokedMidOperation { .. } => "permission_revoked",
            Self::ScanFailed { .. } => "scan_failed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::ManagerClosed => "manager_closed",
        }
    }

    /// Build a `HardwareRejected` error from a completion status.
    pub fn rejected(status: GattStatus, detail: impl Into<String>) -> Self {
        Self::HardwareRejected {
            status: Some(status),
            detail: detail.into(),
        }
    }
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => Self::PermissionRevokedMidOperation {
                operation: "bluetooth operation".to_string(),
            },
            btleplug::Error::NotConnected => Self::NotConnected,
            other => Self::HardwareRejected {
                status: None,
                detail: other.to_string(),
            },
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
