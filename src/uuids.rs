//! Service and characteristic UUIDs exposed by the bridge.
//!
//! Everything here is in canonical (most-significant-byte-first) order.
//! The TNP wire format reverses UUID bytes; that conversion lives in
//! `tnp` and nowhere else.

use uuid::Uuid;

/// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128)
}

/// Zwift Ride base UUID: XXXXXXXX-19ca-4651-86e5-fa29dcdd09d1
pub const fn zwift_uuid(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_19ca_4651_86e5_fa29dcdd09d1_u128)
}

// Services advertised by a KICKR BIKE.
pub const CYCLING_POWER_SERVICE_UUID: Uuid = ble_uuid(0x1818);
pub const CSC_SERVICE_UUID: Uuid = ble_uuid(0x1816);
pub const HEART_RATE_SERVICE_UUID: Uuid = ble_uuid(0x180D);
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
pub const ZWIFT_RIDE_SERVICE_UUID: Uuid = ble_uuid(0xFC82);

// Device profile characteristics.
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A63);
pub const CYCLING_POWER_FEATURE_UUID: Uuid = ble_uuid(0x2A65);
pub const CSC_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A5B);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A37);

// FTMS characteristics.
pub const FTMS_FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);
pub const SIM_PARAMETERS_UUID: Uuid = ble_uuid(0x2AD5);
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

// Zwift Ride characteristics. Writes arrive on Sync RX; handshake,
// keep-alive and command replies go out on Sync TX; gear/button events
// go out on Async TX.
pub const ZWIFT_SYNC_RX_UUID: Uuid = zwift_uuid(0x0000_0003);
pub const ZWIFT_ASYNC_TX_UUID: Uuid = zwift_uuid(0x0000_0002);
pub const ZWIFT_SYNC_TX_UUID: Uuid = zwift_uuid(0x0000_0004);

/// 16-bit short form of a SIG-base UUID, if it has one.
/// Used for the mDNS `ble-service-uuids` TXT record.
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let bits = uuid.as_u128();
    let base = bits & !(0xFFFF_FFFF_u128 << 96);
    if base != ble_uuid(0).as_u128() {
        return None;
    }
    let short = bits >> 96;
    if short > u16::MAX as u128 {
        return None;
    }
    Some(short as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_base_format() {
        assert_eq!(
            FTMS_SERVICE_UUID.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            ZWIFT_RIDE_SERVICE_UUID.to_string(),
            "0000fc82-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_zwift_base_format() {
        assert_eq!(
            ZWIFT_SYNC_RX_UUID.to_string(),
            "00000003-19ca-4651-86e5-fa29dcdd09d1"
        );
        assert_eq!(
            ZWIFT_ASYNC_TX_UUID.to_string(),
            "00000002-19ca-4651-86e5-fa29dcdd09d1"
        );
        assert_eq!(
            ZWIFT_SYNC_TX_UUID.to_string(),
            "00000004-19ca-4651-86e5-fa29dcdd09d1"
        );
    }

    #[test]
    fn test_short_form() {
        assert_eq!(short_form(&ZWIFT_RIDE_SERVICE_UUID), Some(0xFC82));
        assert_eq!(short_form(&FTMS_SERVICE_UUID), Some(0x1826));
        assert_eq!(short_form(&ZWIFT_SYNC_RX_UUID), None, "custom base has no short form");
    }
}
