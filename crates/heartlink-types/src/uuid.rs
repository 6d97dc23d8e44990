//! Bluetooth UUIDs used to talk to ECG sensors.
//!
//! Heart rate, battery and device information use the standard Bluetooth SIG
//! services. The ECG stream lives on a vendor service; the constants below
//! are the defaults for `heartlink_core::ble::GattProfile` and can be
//! overridden per device family.

use uuid::{Uuid, uuid};

// --- Vendor ECG service ---

/// Vendor service carrying the ECG stream.
pub const ECG_SERVICE: Uuid = uuid!("34802252-7185-4d5d-b431-630e7050e8f0");

/// ECG frame notifications (one `MEP` frame per notification).
pub const ECG_DATA: Uuid = uuid!("34800001-7185-4d5d-b431-630e7050e8f0");

/// ECG control point: start/stop commands are written here.
pub const ECG_CONTROL: Uuid = uuid!("34800002-7185-4d5d-b431-630e7050e8f0");

// --- Standard BLE Service UUIDs ---

/// Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Standard characteristics ---

/// Heart Rate Measurement characteristic.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

/// Model number string characteristic.
pub const MODEL_NUMBER: Uuid = uuid!("00002a24-0000-1000-8000-00805f9b34fb");

/// Serial number string characteristic.
pub const SERIAL_NUMBER: Uuid = uuid!("00002a25-0000-1000-8000-00805f9b34fb");

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = uuid!("00002a26-0000-1000-8000-00805f9b34fb");

/// Manufacturer name string characteristic.
pub const MANUFACTURER_NAME: Uuid = uuid!("00002a29-0000-1000-8000-00805f9b34fb");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_service_uuids() {
        assert_eq!(
            HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_SERVICE.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_ne!(DEVICE_INFO_SERVICE, BATTERY_SERVICE);
    }

    #[test]
    fn test_standard_ble_characteristic_prefix() {
        let standard_uuids = [
            HEART_RATE_MEASUREMENT,
            BATTERY_LEVEL,
            MODEL_NUMBER,
            SERIAL_NUMBER,
            FIRMWARE_REVISION,
            MANUFACTURER_NAME,
        ];

        for uuid in standard_uuids {
            assert!(
                uuid.to_string().starts_with("00002a"),
                "UUID {} should start with 00002a",
                uuid
            );
        }
    }

    #[test]
    fn test_ecg_uuids_are_distinct() {
        assert_ne!(ECG_DATA, ECG_CONTROL);
        assert_ne!(ECG_SERVICE, ECG_DATA);
    }
}
