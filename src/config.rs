//! Configuration for the device manager.

use std::time::Duration;

use crate::ble::uuids::DISPENSER_NAME_PREFIX;

/// Default duration of a scan session.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-subscriber buffer of the broadcast channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What to publish when the link drops with an unexpected status.
///
/// A "success" or peer-terminated status always resolves to
/// [`ConnectionState::Disconnected`](crate::ConnectionState::Disconnected);
/// this policy only applies to the remaining codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnexpectedDisconnectPolicy {
    /// Log the anomaly and resolve to `Disconnected`.
    #[default]
    Disconnected,
    /// Resolve to `Error(ConnectionLost)`.
    Error,
}

/// Configuration for [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// How long a scan session runs before stopping itself.
    pub scan_timeout: Duration,
    /// Advertised-name prefix that identifies a dispenser (case-insensitive).
    pub name_prefix: String,
    /// Handling of unexpected disconnect statuses.
    pub disconnect_policy: UnexpectedDisconnectPolicy,
    /// Per-subscriber buffer of the broadcast channels.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            name_prefix: DISPENSER_NAME_PREFIX.to_string(),
            disconnect_policy: UnexpectedDisconnectPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Set the scan session duration.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the dispenser name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the unexpected disconnect policy.
    pub fn with_disconnect_policy(mut self, policy: UnexpectedDisconnectPolicy) -> Self {
        self.disconnect_policy = policy;
        self
    }

    /// Set the broadcast channel capacity (at least 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
