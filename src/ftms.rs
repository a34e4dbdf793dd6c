//! FTMS (Fitness Machine Service) face of the bridge.
//!
//! Registers the indoor-bike FTMS characteristics on the GATT mirror and
//! turns Control Point / Simulation Parameters writes into base-gradient
//! events for the gear controller. All multi-byte values are
//! little-endian per the Bluetooth GATT specification. Gradients use
//! 0.01% units internally; the FTMS inclination target is 0.1% units.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::gears::GearController;
use crate::mirror::{CharacteristicSpec, GattMirror, MirrorError};
use crate::tnp::{PROP_INDICATE, PROP_NOTIFY, PROP_READ, PROP_WRITE};
use crate::uuids;

// Control Point opcodes (FTMS spec Table 4.15).
pub const OP_REQUEST_CONTROL: u8 = 0x00;
pub const OP_RESET: u8 = 0x01;
pub const OP_SET_TARGET_INCLINATION: u8 = 0x03;
pub const OP_START_RESUME: u8 = 0x07;
pub const OP_STOP_PAUSE: u8 = 0x08;
pub const OP_SET_SIM_PARAMS: u8 = 0x11;

// Control Point result codes (FTMS spec Table 4.24).
pub const RESULT_SUCCESS: u8 = 0x01;
pub const RESULT_NOT_SUPPORTED: u8 = 0x02;
pub const RESULT_INVALID_PARAM: u8 = 0x03;
pub const RESPONSE_CODE: u8 = 0x80;

// Fitness Machine Status opcodes (FTMS spec Table 4.16).
pub const STATUS_RESET: u8 = 0x01;
pub const STATUS_STOPPED: u8 = 0x02;
pub const STATUS_STARTED: u8 = 0x04;
pub const STATUS_INCLINE_CHANGED: u8 = 0x06;
pub const STATUS_SIM_PARAMS_CHANGED: u8 = 0x12;

/// Indoor Bike Simulation Parameters payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimParameters {
    /// Wind speed, mm/s.
    pub wind_mmps: i16,
    /// Grade, 0.01% units.
    pub grade_bp: i16,
    /// Rolling resistance coefficient, 0.0001 units.
    pub crr: u8,
    /// Wind resistance coefficient, 0.01 kg/m units.
    pub cw: u8,
}

#[derive(Debug, PartialEq)]
pub enum ControlCommand {
    RequestControl,
    Reset,
    SetTargetInclination(i16), // percent * 10
    StartOrResume,
    StopOrPause(u8), // 1=stop, 2=pause
    SetSimulation(SimParameters),
}

/// Register the FTMS service on the mirror with the Control Point and
/// Simulation Parameters write handlers wired to the gear controller.
pub fn register(
    mirror: &Arc<GattMirror>,
    controller: &Arc<GearController>,
) -> Result<(), MirrorError> {
    let cp_handler = {
        let mirror = mirror.clone();
        let controller = controller.clone();
        Arc::new(move |bytes: &[u8]| handle_control_point(&mirror, &controller, bytes))
    };
    let sim_handler = {
        let mirror = mirror.clone();
        let controller = controller.clone();
        Arc::new(move |bytes: &[u8]| handle_sim_write(&mirror, &controller, bytes))
    };

    mirror.register_service(
        uuids::FTMS_SERVICE_UUID,
        vec![
            CharacteristicSpec::new(uuids::FTMS_FEATURE_UUID, PROP_READ)
                .with_value(encode_feature().to_vec()),
            CharacteristicSpec::new(uuids::INDOOR_BIKE_DATA_UUID, PROP_NOTIFY),
            CharacteristicSpec::new(uuids::SIM_PARAMETERS_UUID, PROP_WRITE)
                .with_handler(sim_handler),
            CharacteristicSpec::new(uuids::CONTROL_POINT_UUID, PROP_WRITE | PROP_INDICATE)
                .with_handler(cp_handler),
            CharacteristicSpec::new(uuids::MACHINE_STATUS_UUID, PROP_NOTIFY),
        ],
    )
}

/// Encode the Fitness Machine Feature characteristic (0x2ACC).
///
/// Fitness Machine Features (uint32 LE):
///   - Bit 1: Cadence Supported
///   - Bit 3: Inclination Supported
///   - Bit 14: Power Measurement Supported
///   = 0x0000_400A
///
/// Target Setting Features (uint32 LE):
///   - Bit 1: Inclination Target Supported
///   - Bit 3: Power Target Supported
///   - Bit 13: Indoor Bike Simulation Parameters Supported
///   = 0x0000_200A
pub fn encode_feature() -> [u8; 8] {
    let machine_features: u32 = 0x0000_400A;
    let target_features: u32 = 0x0000_200A;
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&machine_features.to_le_bytes());
    buf[4..8].copy_from_slice(&target_features.to_le_bytes());
    buf
}

/// Parse FTMS Control Point writes (0x2AD9).
///
/// Returns `None` for unsupported/unknown opcodes or malformed data.
pub fn parse_control_point(bytes: &[u8]) -> Option<ControlCommand> {
    let opcode = *bytes.first()?;
    match opcode {
        OP_REQUEST_CONTROL => Some(ControlCommand::RequestControl),
        OP_RESET => Some(ControlCommand::Reset),
        OP_SET_TARGET_INCLINATION => {
            // opcode(1) + sint16 LE, percent with 0.1 resolution
            if bytes.len() < 3 {
                return None;
            }
            let incline = i16::from_le_bytes([bytes[1], bytes[2]]);
            Some(ControlCommand::SetTargetInclination(incline))
        }
        OP_START_RESUME => Some(ControlCommand::StartOrResume),
        OP_STOP_PAUSE => {
            if bytes.len() < 2 {
                return None;
            }
            Some(ControlCommand::StopOrPause(bytes[1]))
        }
        OP_SET_SIM_PARAMS => decode_sim_parameters(&bytes[1..]).map(ControlCommand::SetSimulation),
        _ => None,
    }
}

/// Decode the 6-byte simulation payload: wind i16 mm/s, grade i16
/// 0.01%, CRR u8 0.0001, CW u8 0.01 (all LE). Trailing bytes are
/// ignored.
pub fn decode_sim_parameters(bytes: &[u8]) -> Option<SimParameters> {
    if bytes.len() < 6 {
        return None;
    }
    Some(SimParameters {
        wind_mmps: i16::from_le_bytes([bytes[0], bytes[1]]),
        grade_bp: i16::from_le_bytes([bytes[2], bytes[3]]),
        crr: bytes[4],
        cw: bytes[5],
    })
}

/// Encode a Control Point response indication: `[0x80, opcode, result]`.
pub fn encode_control_response(request_opcode: u8, result: u8) -> [u8; 3] {
    [RESPONSE_CODE, request_opcode, result]
}

fn handle_control_point(mirror: &GattMirror, controller: &GearController, bytes: &[u8]) {
    let Some(&opcode) = bytes.first() else {
        warn!("empty control point write");
        return;
    };

    let result = match parse_control_point(bytes) {
        Some(cmd) => {
            if let Some(status) = encode_status_notification(&cmd) {
                mirror.notify(&uuids::MACHINE_STATUS_UUID, &status);
            }
            execute(controller, &cmd)
        }
        None => {
            warn!("control point opcode 0x{:02x} rejected: {:02x?}", opcode, bytes);
            if bytes.len() == 1 {
                RESULT_NOT_SUPPORTED
            } else {
                RESULT_INVALID_PARAM
            }
        }
    };

    mirror.notify(
        &uuids::CONTROL_POINT_UUID,
        &encode_control_response(opcode, result),
    );
}

fn execute(controller: &GearController, cmd: &ControlCommand) -> u8 {
    match cmd {
        ControlCommand::RequestControl => {
            info!("FTMS: client requested control");
            RESULT_SUCCESS
        }
        ControlCommand::Reset => {
            info!("FTMS: reset");
            controller.reset();
            RESULT_SUCCESS
        }
        ControlCommand::SetTargetInclination(incline_tenths) => {
            debug!("FTMS: target inclination {:.1}%", *incline_tenths as f64 / 10.0);
            controller.set_base_gradient(*incline_tenths as i32 * 10);
            RESULT_SUCCESS
        }
        ControlCommand::StartOrResume => {
            info!("FTMS: start/resume");
            controller.enable();
            RESULT_SUCCESS
        }
        ControlCommand::StopOrPause(param) => {
            info!("FTMS: stop/pause (param={})", param);
            RESULT_SUCCESS
        }
        ControlCommand::SetSimulation(params) => {
            debug!(
                "FTMS: simulation grade {:.2}% wind {} mm/s crr {} cw {}",
                params.grade_bp as f64 / 100.0,
                params.wind_mmps,
                params.crr,
                params.cw
            );
            controller.set_base_gradient(params.grade_bp as i32);
            RESULT_SUCCESS
        }
    }
}

// Writes landing directly on the Simulation Parameters characteristic.
// Some clients send the bare 6-byte payload, others the CP-framed form
// with a leading 0x11.
fn handle_sim_write(mirror: &GattMirror, controller: &GearController, bytes: &[u8]) {
    let payload = match bytes.first() {
        Some(&OP_SET_SIM_PARAMS) if bytes.len() >= 7 => &bytes[1..],
        _ => bytes,
    };
    match decode_sim_parameters(payload) {
        Some(params) => {
            debug!("simulation parameters: grade {:.2}%", params.grade_bp as f64 / 100.0);
            controller.set_base_gradient(params.grade_bp as i32);
            let mut status = vec![STATUS_SIM_PARAMS_CHANGED];
            status.extend_from_slice(payload.get(..6).unwrap_or_default());
            mirror.notify(&uuids::MACHINE_STATUS_UUID, &status);
        }
        None => warn!("malformed simulation parameters write: {:02x?}", bytes),
    }
}

/// Fitness Machine Status notification for a state/target change.
fn encode_status_notification(cmd: &ControlCommand) -> Option<Vec<u8>> {
    match cmd {
        ControlCommand::Reset => Some(vec![STATUS_RESET]),
        ControlCommand::SetTargetInclination(incline_tenths) => {
            let mut buf = vec![STATUS_INCLINE_CHANGED];
            buf.extend_from_slice(&incline_tenths.to_le_bytes());
            Some(buf)
        }
        ControlCommand::StartOrResume => Some(vec![STATUS_STARTED]),
        ControlCommand::StopOrPause(param) => Some(vec![STATUS_STOPPED, *param]),
        _ => None,
    }
}
