//! Advertising data handling.
//!
//! Turns raw advertisement sightings into [`DiscoveredDevice`] entries and
//! classifies them as dispensers by their advertised name.

use crate::ble::backend::Advertisement;

/// A device seen during a scan session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Opaque hardware identifier; unique key within a scan session.
    pub address: String,
    /// Advertised name, if the platform disclosed one.
    pub name: Option<String>,
    /// Whether the advertised name identifies a pill dispenser.
    pub is_dispenser: bool,
}

impl DiscoveredDevice {
    /// Create a device entry, classifying it against `prefix`.
    pub fn new(address: impl Into<String>, name: Option<String>, prefix: &str) -> Self {
        let is_dispenser = name
            .as_deref()
            .map(|n| has_prefix_ignore_case(n, prefix))
            .unwrap_or(false);

        Self {
            address: address.into(),
            name,
            is_dispenser,
        }
    }

    /// Create a device entry from an advertisement.
    pub fn from_advertisement(advertisement: &Advertisement, prefix: &str) -> Self {
        Self::new(
            advertisement.address.clone(),
            advertisement.name.clone(),
            prefix,
        )
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Case-insensitive prefix match.
fn has_prefix_ignore_case(name: &str, prefix: &str) -> bool {
    name.get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}
