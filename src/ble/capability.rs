//! Capability gate.
//!
//! Answers, synchronously, whether the platform currently allows scanning and
//! connecting and whether the radio adapter is powered on. Consulted before
//! every hardware-touching operation.

use std::sync::atomic::{AtomicBool, Ordering};

/// A platform capability required by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Capability {
    /// Permission to scan for advertisements.
    Scan,
    /// Permission to connect and exchange GATT traffic.
    Connect,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => write!(f, "Scan"),
            Self::Connect => write!(f, "Connect"),
        }
    }
}

/// Source of truth for capability and adapter state.
#[cfg_attr(test, mockall::automock)]
pub trait CapabilityGate: Send + Sync {
    /// Whether scanning is currently authorized.
    fn can_scan(&self) -> bool;

    /// Whether connecting is currently authorized.
    fn can_connect(&self) -> bool;

    /// Whether the radio adapter is powered on.
    fn is_adapter_on(&self) -> bool;
}

/// Capability gate backed by atomic flags.
///
/// Desktop platforms prompt for Bluetooth access themselves, so the flags start
/// granted; the platform backend keeps `adapter_on` in sync with adapter state
/// updates. Embedders with their own permission model flip the flags directly.
#[derive(Debug)]
pub struct CapabilityFlags {
    scan: AtomicBool,
    connect: AtomicBool,
    adapter_on: AtomicBool,
}

impl CapabilityFlags {
    /// All capabilities granted and the adapter on.
    pub fn granted() -> Self {
        Self {
            scan: AtomicBool::new(true),
            connect: AtomicBool::new(true),
            adapter_on: AtomicBool::new(true),
        }
    }

    /// Grant or revoke scan permission.
    pub fn set_scan(&self, granted: bool) {
        self.scan.store(granted, Ordering::SeqCst);
    }

    /// Grant or revoke connect permission.
    pub fn set_connect(&self, granted: bool) {
        self.connect.store(granted, Ordering::SeqCst);
    }

    /// Record the adapter power state.
    pub fn set_adapter_on(&self, on: bool) {
        self.adapter_on.store(on, Ordering::SeqCst);
    }
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self::granted()
    }
}

impl CapabilityGate for CapabilityFlags {
    fn can_scan(&self) -> bool {
        self.scan.load(Ordering::SeqCst)
    }

    fn can_connect(&self) -> bool {
        self.connect.load(Ordering::SeqCst)
    }

    fn is_adapter_on(&self) -> bool {
        self.adapter_on.load(Ordering::SeqCst)
    }
}
