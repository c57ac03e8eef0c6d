//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains all UUID constants used for pill dispenser communication.

use uuid::Uuid;

// Dispenser Service (custom)
/// Pill dispenser primary service UUID.
pub const DISPENSER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0333_9647_3f4e_43df_abff_fac54287cf1a);

// Writable characteristics
/// Set Device Time characteristic UUID (Write, Write Without Response).
pub const SET_DEVICE_TIME_UUID: Uuid = Uuid::from_u128(0x6523_2f1d_618a_4268_9050_0548142a4536);
/// Set Dispense Schedule characteristic UUID (Write).
pub const SET_DISPENSE_SCHEDULE_UUID: Uuid =
    Uuid::from_u128(0x999c_584e_06c0_49a1_995a_66b7c802ac1b);
/// Trigger Manual Dispense characteristic UUID (Write).
pub const TRIGGER_MANUAL_DISPENSE_UUID: Uuid =
    Uuid::from_u128(0x36bb_95f2_e57e_4db9_b9aa_fb6541ee784e);

// Readable / notifiable characteristics
/// Get Device Time characteristic UUID (Read, Notify).
pub const GET_DEVICE_TIME_UUID: Uuid = Uuid::from_u128(0x272e_e276_e37e_4d78_8c5e_bb7225d35074);
/// Get Dispense Schedule characteristic UUID (Read, Notify).
pub const GET_DISPENSE_SCHEDULE_UUID: Uuid =
    Uuid::from_u128(0xb53c_2ed4_ae26_476d_8414_011a025dddfc);
/// Get Last Dispense Info characteristic UUID (Read, Notify).
pub const GET_LAST_DISPENSE_INFO_UUID: Uuid =
    Uuid::from_u128(0x40d3_b5d8_5480_4b7b_a115_5fe86bf17d7d);
/// Get Time Until Next Dispense characteristic UUID (Read, Notify).
pub const GET_TIME_UNTIL_NEXT_DISPENSE_UUID: Uuid =
    Uuid::from_u128(0x4b14_acc4_768a_43e1_9d6c_0d97307e2666);
/// Get Dispense Log characteristic UUID (Read, Notify).
pub const GET_DISPENSE_LOG_UUID: Uuid = Uuid::from_u128(0x6f18_2da7_c5a8_40ab_a637_f97ed6b5777b);

// Standard descriptors
/// Client Characteristic Configuration Descriptor (CCCD) UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Advertised name prefix of the dispenser firmware.
pub const DISPENSER_NAME_PREFIX: &str = "PillDispenserESP32";

/// Check if a service UUID is the dispenser service.
pub fn is_dispenser_service(uuid: &Uuid) -> bool {
    *uuid == DISPENSER_SERVICE_UUID
}

/// Check if a descriptor UUID is the client characteristic configuration descriptor.
pub fn is_cccd(uuid: &Uuid) -> bool {
    *uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            DISPENSER_SERVICE_UUID.to_string(),
            "03339647-3f4e-43df-abff-fac54287cf1a"
        );
        assert_eq!(
            TRIGGER_MANUAL_DISPENSE_UUID.to_string(),
            "36bb95f2-e57e-4db9-b9aa-fb6541ee784e"
        );
        assert_eq!(
            GET_DISPENSE_LOG_UUID.to_string(),
            "6f182da7-c5a8-40ab-a637-f97ed6b5777b"
        );

        let cccd = CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string();
        assert!(cccd.contains("2902"));
    }

    #[test]
    fn test_is_dispenser_service() {
        assert!(is_dispenser_service(&DISPENSER_SERVICE_UUID));
        assert!(!is_dispenser_service(&GET_DEVICE_TIME_UUID));
    }

    #[test]
    fn test_is_cccd() {
        assert!(is_cccd(&CLIENT_CHARACTERISTIC_CONFIG_UUID));
        assert!(!is_cccd(&DISPENSER_SERVICE_UUID));
    }
}
