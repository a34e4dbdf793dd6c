//! Zwift Ride handshake, command channel and keep-alive.
//!
//! Zwift talks to the bike over three characteristics: commands arrive
//! as writes on Sync RX, synchronous replies and the keep-alive stream
//! go out on Sync TX, and asynchronous gear/button events go out on
//! Async TX. The session starts with the ASCII `RideOn` handshake; once
//! answered, a 37-byte keep-alive is emitted every 5 seconds for as long
//! as someone is subscribed to Sync TX.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::interval;

use crate::gears::GearController;
use crate::mirror::{CharacteristicSpec, GattMirror, MirrorError};
use crate::tnp::{PROP_NOTIFY, PROP_WRITE};
use crate::uuids;

/// The 6-byte handshake initiator.
pub const RIDE_ON: &[u8; 6] = b"RideOn";

/// Handshake reply: `RideOn` plus the 2-byte signature.
pub const RIDE_ON_RESPONSE: [u8; 8] = [0x52, 0x69, 0x64, 0x65, 0x4F, 0x6E, 0x01, 0x03];

// Sync RX opcodes.
pub const OP_GET: u8 = 0x08;
pub const OP_RESET: u8 = 0x22;
pub const OP_VENDOR_MESSAGE: u8 = 0x32;
pub const OP_LOG_LEVEL_SET: u8 = 0x41;

// Sync TX reply identifiers.
pub const STATUS_RESPONSE: u8 = 0x12;
pub const GET_RESPONSE: u8 = 0x3C;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_MALFORMED: u8 = 0x01;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const DEBOUNCE_TICK: Duration = Duration::from_millis(100);

/// Opaque keep-alive blob a real KICKR BIKE emits every 5 s. Zwift has
/// only been seen accepting this exact payload, so it is reproduced
/// bit-for-bit.
pub const KEEP_ALIVE_PAYLOAD: [u8; 37] = [
    0x19, 0x10, 0x00, 0x20, 0x00, 0x28, 0x00, 0x30, 0x00, 0x38, 0x00, 0x40, 0x00, 0x48, 0x00,
    0x50, 0x00, 0x58, 0x00, 0x60, 0x00, 0x68, 0x00, 0x70, 0x00, 0x78, 0x00, 0x80, 0x01, 0x00,
    0x88, 0x01, 0x00, 0x90, 0x01, 0x00, 0x00,
];

/// Shared handshake state.
#[derive(Default)]
pub struct RideState {
    handshake_complete: AtomicBool,
    log_level: AtomicU8,
}

impl RideState {
    pub fn new() -> Self {
        RideState::default()
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Relaxed)
    }

    fn set_handshake(&self, complete: bool) {
        self.handshake_complete.store(complete, Ordering::Relaxed);
    }

    pub fn log_level(&self) -> u8 {
        self.log_level.load(Ordering::Relaxed)
    }
}

/// Register the Zwift Ride service on the mirror with the Sync RX write
/// handler installed.
pub fn register(
    mirror: &Arc<GattMirror>,
    controller: &Arc<GearController>,
    state: &Arc<RideState>,
) -> Result<(), MirrorError> {
    let handler = {
        let mirror = mirror.clone();
        let controller = controller.clone();
        let state = state.clone();
        Arc::new(move |bytes: &[u8]| handle_sync_rx(&mirror, &controller, &state, bytes))
    };

    mirror.register_service(
        uuids::ZWIFT_RIDE_SERVICE_UUID,
        vec![
            CharacteristicSpec::new(uuids::ZWIFT_SYNC_RX_UUID, PROP_WRITE).with_handler(handler),
            CharacteristicSpec::new(uuids::ZWIFT_ASYNC_TX_UUID, PROP_NOTIFY),
            CharacteristicSpec::new(uuids::ZWIFT_SYNC_TX_UUID, PROP_NOTIFY),
        ],
    )
}

fn handle_sync_rx(
    mirror: &GattMirror,
    controller: &GearController,
    state: &RideState,
    bytes: &[u8],
) {
    if bytes == RIDE_ON {
        info!("RideOn handshake received");
        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &RIDE_ON_RESPONSE);
        state.set_handshake(true);
        return;
    }

    let Some(&opcode) = bytes.first() else {
        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[STATUS_RESPONSE, STATUS_MALFORMED]);
        return;
    };

    match opcode {
        OP_GET => {
            // Object id is 1 or 2 bytes, little-endian when 2.
            let id = match bytes.len() {
                0 | 1 => {
                    mirror.notify(
                        &uuids::ZWIFT_SYNC_TX_UUID,
                        &[STATUS_RESPONSE, STATUS_MALFORMED],
                    );
                    return;
                }
                2 => bytes[1] as u16,
                _ => u16::from_le_bytes([bytes[1], bytes[2]]),
            };
            debug!("GET object 0x{:04x}", id);
            let [lo, hi] = id.to_le_bytes();
            mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[GET_RESPONSE, lo, hi]);
        }
        OP_RESET => {
            controller.reset();
            mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[STATUS_RESPONSE, STATUS_OK]);
        }
        OP_LOG_LEVEL_SET => {
            let level = bytes.get(1).copied().unwrap_or(0);
            state.log_level.store(level, Ordering::Relaxed);
            debug!("log level set to {}", level);
            mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[STATUS_RESPONSE, STATUS_OK]);
        }
        OP_VENDOR_MESSAGE => {
            debug!("vendor message: {:02x?}", bytes);
            mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[STATUS_RESPONSE, STATUS_OK]);
        }
        other => {
            // Unknown opcodes are acknowledged rather than refused so an
            // unfamiliar client build keeps its session.
            warn!("unknown Sync RX opcode 0x{:02x}: {:02x?}", other, bytes);
            mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[STATUS_RESPONSE, STATUS_OK]);
        }
    }
}

/// Periodic work: the 5 s keep-alive while a ride session is live, and
/// the 100 ms flush of debounced trainer applies. When the last Sync TX
/// subscriber disappears the handshake is considered over.
pub async fn run_timers(
    mirror: Arc<GattMirror>,
    state: Arc<RideState>,
    controller: Arc<GearController>,
) {
    let mut keepalive = interval(KEEP_ALIVE_INTERVAL);
    let mut debounce = interval(DEBOUNCE_TICK);
    let mut had_subscribers = false;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                let subscribers = mirror.subscriber_count(&uuids::ZWIFT_SYNC_TX_UUID);
                if state.handshake_complete() {
                    if subscribers > 0 {
                        debug!("keep-alive");
                        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &KEEP_ALIVE_PAYLOAD);
                    } else if had_subscribers {
                        info!("ride session ended");
                        state.set_handshake(false);
                    }
                }
                had_subscribers = subscribers > 0;
            }
            _ = debounce.tick() => {
                controller.tick();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gears::InclineSink;
    use crate::mirror::Notification;
    use tokio::sync::mpsc;

    struct NullSink;

    impl InclineSink for NullSink {
        fn set_target_incline(&self, _bp: i32) {}
    }

    struct Fixture {
        mirror: Arc<GattMirror>,
        controller: Arc<GearController>,
        state: Arc<RideState>,
        session: crate::mirror::SessionId,
        rx: mpsc::Receiver<Notification>,
    }

    fn setup() -> Fixture {
        let mirror = Arc::new(GattMirror::new());
        let controller = Arc::new(GearController::new(mirror.clone(), Arc::new(NullSink)));
        let state = Arc::new(RideState::new());
        register(&mirror, &controller, &state).unwrap();

        let session = mirror.allocate_session();
        let (tx, rx) = GattMirror::notification_channel();
        mirror.add_sink(session, tx);
        mirror.subscribe(session, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();
        Fixture { mirror, controller, state, session, rx }
    }

    #[test]
    fn test_rideon_handshake() {
        let mut fx = setup();
        assert!(!fx.state.handshake_complete());

        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, RIDE_ON).unwrap();

        assert!(fx.state.handshake_complete());
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.uuid, uuids::ZWIFT_SYNC_TX_UUID);
        assert_eq!(reply.value, RIDE_ON_RESPONSE.to_vec());
        // 52 69 64 65 4F 6E 01 03
        assert_eq!(&reply.value[..6], b"RideOn");
        assert_eq!(&reply.value[6..], &[0x01, 0x03]);
    }

    #[test]
    fn test_rideon_must_match_exactly() {
        let mut fx = setup();
        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, b"RideOn!").unwrap();
        assert!(!fx.state.handshake_complete());
        // Treated as an unknown opcode ('R'), acknowledged permissively.
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![STATUS_RESPONSE, STATUS_OK]);
    }

    #[test]
    fn test_get_single_byte_id() {
        let mut fx = setup();
        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[OP_GET, 0x42]).unwrap();
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![GET_RESPONSE, 0x42, 0x00]);
    }

    #[test]
    fn test_get_two_byte_id_little_endian() {
        let mut fx = setup();
        fx.mirror
            .write(&uuids::ZWIFT_SYNC_RX_UUID, &[OP_GET, 0x34, 0x12])
            .unwrap();
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![GET_RESPONSE, 0x34, 0x12]);
    }

    #[test]
    fn test_get_without_id_is_malformed() {
        let mut fx = setup();
        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[OP_GET]).unwrap();
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![STATUS_RESPONSE, STATUS_MALFORMED]);
    }

    #[test]
    fn test_reset_restores_gear_state() {
        let mut fx = setup();
        fx.controller.set_base_gradient(800);
        fx.controller.shift_up();

        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[OP_RESET]).unwrap();

        assert_eq!(fx.controller.gear(), crate::gears::DEFAULT_GEAR);
        assert_eq!(fx.controller.base_gradient_bp(), 0);
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![STATUS_RESPONSE, STATUS_OK]);
    }

    #[test]
    fn test_log_level_set() {
        let mut fx = setup();
        fx.mirror
            .write(&uuids::ZWIFT_SYNC_RX_UUID, &[OP_LOG_LEVEL_SET, 0x03])
            .unwrap();
        assert_eq!(fx.state.log_level(), 3);
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![STATUS_RESPONSE, STATUS_OK]);
    }

    #[test]
    fn test_vendor_and_unknown_opcodes_keep_session() {
        let mut fx = setup();
        fx.mirror
            .write(&uuids::ZWIFT_SYNC_RX_UUID, &[OP_VENDOR_MESSAGE, 1, 2, 3])
            .unwrap();
        assert_eq!(fx.rx.try_recv().unwrap().value, vec![STATUS_RESPONSE, STATUS_OK]);

        for opcode in [0x01u8, 0x09, 0x23, 0x40, 0xFE] {
            fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[opcode]).unwrap();
            assert_eq!(
                fx.rx.try_recv().unwrap().value,
                vec![STATUS_RESPONSE, STATUS_OK],
                "opcode 0x{:02x}",
                opcode
            );
        }
    }

    #[test]
    fn test_empty_write_is_malformed() {
        let mut fx = setup();
        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[]).unwrap();
        let reply = fx.rx.try_recv().unwrap();
        assert_eq!(reply.value, vec![STATUS_RESPONSE, STATUS_MALFORMED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_periodicity() {
        let mut fx = setup();
        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, RIDE_ON).unwrap();
        let _ = fx.rx.try_recv(); // consume handshake reply

        tokio::spawn(run_timers(
            fx.mirror.clone(),
            fx.state.clone(),
            fx.controller.clone(),
        ));

        // Any 11-second window after the handshake carries at least two
        // keep-alive frames.
        for _ in 0..11 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        let mut keepalives = 0;
        while let Ok(n) = fx.rx.try_recv() {
            if n.value == KEEP_ALIVE_PAYLOAD.to_vec() {
                keepalives += 1;
            }
        }
        assert!(keepalives >= 2, "expected >=2 keep-alives, saw {}", keepalives);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stops_when_subscriber_leaves() {
        let mut fx = setup();
        fx.mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, RIDE_ON).unwrap();
        let _ = fx.rx.try_recv();

        tokio::spawn(run_timers(
            fx.mirror.clone(),
            fx.state.clone(),
            fx.controller.clone(),
        ));

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(fx.rx.try_recv().is_ok(), "keep-alive while subscribed");

        // Session goes away: handshake state returns to idle.
        fx.mirror.drop_session(fx.session);
        for _ in 0..11 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(!fx.state.handshake_complete());
    }
}
