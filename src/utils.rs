//! Utility functions for the dispenser-ble crate.

use chrono::NaiveDateTime;

/// Wire format of the dispenser's wall-clock time.
pub const DEVICE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Decode a payload as text, replacing invalid UTF-8 sequences.
///
/// # Example
///
/// ```
/// use dispenser_ble::payload_text;
///
/// assert_eq!(payload_text(b"08:00,20:00"), "08:00,20:00");
/// assert_eq!(payload_text(&[0x68, 0x69, 0xff]), "hi\u{fffd}");
/// ```
pub fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// Format a timestamp the way the dispenser expects it.
///
/// # Example
///
/// ```
/// use chrono::NaiveDate;
/// use dispenser_ble::format_device_time;
///
/// let time = NaiveDate::from_ymd_opt(2024, 3, 1)
///     .and_then(|d| d.and_hms_opt(8, 5, 0))
///     .unwrap();
/// assert_eq!(format_device_time(&time), "2024-03-01 08:05:00");
/// ```
pub fn format_device_time(time: &NaiveDateTime) -> String {
    time.format(DEVICE_TIME_FORMAT).to_string()
}

/// Parse a device time reported by the dispenser.
///
/// Returns `None` if the text is not in the device format.
pub fn parse_device_time(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), DEVICE_TIME_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_payload_text() {
        assert_eq!(payload_text(b""), "");
        assert_eq!(payload_text("Chamber 3".as_bytes()), "Chamber 3");
    }

    #[test]
    fn test_device_time_roundtrip() {
        let time = NaiveDate::from_ymd_opt(2025, 12, 31)
            .and_then(|d| d.and_hms_opt(23, 59, 58))
            .unwrap();
        let text = format_device_time(&time);
        assert_eq!(text, "2025-12-31 23:59:58");
        assert_eq!(parse_device_time(&text), Some(time));
    }

    #[test]
    fn test_parse_device_time_rejects_garbage() {
        assert_eq!(parse_device_time("not a time"), None);
        assert!(parse_device_time(" 2025-01-01 00:00:00\n").is_some());
    }
}
