//! Bridge that presents an FTMS-only trainer to Zwift as a Wahoo KICKR
//! BIKE, so a Zwift Ride handlebar can drive virtual shifting and
//! incline control.
//!
//! Two transports expose the same synthetic GATT tree: a native BLE
//! peripheral and the Wahoo TNP BLE-over-TCP encapsulation, announced
//! over mDNS. Both converge on the `mirror::GattMirror`, which owns
//! characteristic values and fans notifications out to every
//! subscriber.

pub mod ble;
pub mod config;
pub mod ftms;
pub mod gears;
pub mod mdns;
pub mod mirror;
pub mod ride;
pub mod server;
pub mod session;
pub mod tnp;
pub mod trainer;
pub mod uuids;

use std::sync::Arc;

use mirror::{CharacteristicSpec, GattMirror, MirrorError};
use tnp::{PROP_NOTIFY, PROP_READ};

/// Register the device-profile services a KICKR BIKE exposes alongside
/// FTMS and Zwift Ride: Cycling Power, CSC and Heart Rate. Their
/// measurement characteristics are fed by external collaborators;
/// registration alone makes discovery match the real bike.
pub fn register_device_profile(mirror: &Arc<GattMirror>) -> Result<(), MirrorError> {
    mirror.register_service(
        uuids::CYCLING_POWER_SERVICE_UUID,
        vec![
            CharacteristicSpec::new(uuids::CYCLING_POWER_MEASUREMENT_UUID, PROP_NOTIFY),
            // Feature bits all zero: no optional power features claimed.
            CharacteristicSpec::new(uuids::CYCLING_POWER_FEATURE_UUID, PROP_READ)
                .with_value(vec![0x00, 0x00, 0x00, 0x00]),
        ],
    )?;
    mirror.register_service(
        uuids::CSC_SERVICE_UUID,
        vec![CharacteristicSpec::new(uuids::CSC_MEASUREMENT_UUID, PROP_NOTIFY)],
    )?;
    mirror.register_service(
        uuids::HEART_RATE_SERVICE_UUID,
        vec![CharacteristicSpec::new(uuids::HEART_RATE_MEASUREMENT_UUID, PROP_NOTIFY)],
    )?;
    Ok(())
}
