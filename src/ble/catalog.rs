//! Attribute catalog.
//!
//! Static table mapping the dispenser's logical operations to their wire
//! identifiers and the access properties the firmware exposes for them.

use btleplug::api::CharPropFlags;
use uuid::Uuid;

use crate::ble::uuids::*;

/// A logical dispenser attribute (GATT characteristic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Attribute {
    /// Set the dispenser's wall-clock time.
    SetDeviceTime,
    /// Replace the dispense schedule.
    SetDispenseSchedule,
    /// Dispense one chamber now.
    TriggerManualDispense,
    /// Current device time.
    GetDeviceTime,
    /// Current dispense schedule.
    GetDispenseSchedule,
    /// Information about the last dispense.
    GetLastDispenseInfo,
    /// Time remaining until the next scheduled dispense.
    GetTimeUntilNextDispense,
    /// Dispense history.
    GetDispenseLog,
}

impl Attribute {
    /// Every attribute in the catalog.
    pub const ALL: [Attribute; 8] = [
        Self::SetDeviceTime,
        Self::SetDispenseSchedule,
        Self::TriggerManualDispense,
        Self::GetDeviceTime,
        Self::GetDispenseSchedule,
        Self::GetLastDispenseInfo,
        Self::GetTimeUntilNextDispense,
        Self::GetDispenseLog,
    ];

    /// Attributes the central writes to.
    pub const WRITABLE: [Attribute; 3] = [
        Self::SetDeviceTime,
        Self::SetDispenseSchedule,
        Self::TriggerManualDispense,
    ];

    /// Attributes the central reads or receives notifications from.
    pub const READABLE: [Attribute; 5] = [
        Self::GetDeviceTime,
        Self::GetDispenseSchedule,
        Self::GetLastDispenseInfo,
        Self::GetTimeUntilNextDispense,
        Self::GetDispenseLog,
    ];

    /// A peripheral must expose at least one of these to be considered a dispenser.
    pub const CRITICAL: [Attribute; 2] = [Self::TriggerManualDispense, Self::GetLastDispenseInfo];

    /// Attributes whose notifications are enabled automatically after discovery.
    pub const AUTO_NOTIFY: [Attribute; 5] = Self::READABLE;

    /// Wire identifier of this attribute.
    pub fn uuid(self) -> Uuid {
        match self {
            Self::SetDeviceTime => SET_DEVICE_TIME_UUID,
            Self::SetDispenseSchedule => SET_DISPENSE_SCHEDULE_UUID,
            Self::TriggerManualDispense => TRIGGER_MANUAL_DISPENSE_UUID,
            Self::GetDeviceTime => GET_DEVICE_TIME_UUID,
            Self::GetDispenseSchedule => GET_DISPENSE_SCHEDULE_UUID,
            Self::GetLastDispenseInfo => GET_LAST_DISPENSE_INFO_UUID,
            Self::GetTimeUntilNextDispense => GET_TIME_UNTIL_NEXT_DISPENSE_UUID,
            Self::GetDispenseLog => GET_DISPENSE_LOG_UUID,
        }
    }

    /// Look up the attribute for a wire identifier.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.uuid() == *uuid)
    }

    /// Access properties the firmware declares for this attribute.
    pub fn required_properties(self) -> CharPropFlags {
        match self {
            Self::SetDeviceTime => CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
            Self::SetDispenseSchedule | Self::TriggerManualDispense => CharPropFlags::WRITE,
            _ => CharPropFlags::READ | CharPropFlags::NOTIFY,
        }
    }

    /// Whether this attribute is written by the central.
    pub fn is_writable(self) -> bool {
        Self::WRITABLE.contains(&self)
    }

    /// Whether this attribute is read by the central.
    pub fn is_readable(self) -> bool {
        Self::READABLE.contains(&self)
    }

    /// Whether this attribute belongs to the critical set.
    pub fn is_critical(self) -> bool {
        Self::CRITICAL.contains(&self)
    }

    /// Short human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::SetDeviceTime => "Set Device Time",
            Self::SetDispenseSchedule => "Set Dispense Schedule",
            Self::TriggerManualDispense => "Trigger Manual Dispense",
            Self::GetDeviceTime => "Device Time",
            Self::GetDispenseSchedule => "Dispense Schedule",
            Self::GetLastDispenseInfo => "Last Dispense Info",
            Self::GetTimeUntilNextDispense => "Time Until Next Dispense",
            Self::GetDispenseLog => "Dispense Log",
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
