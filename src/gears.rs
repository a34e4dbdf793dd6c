//! Virtual shifting and the shift-to-incline control loop.
//!
//! The controller owns the gear state. Shifter position deltas move the
//! gear up or down; the effective gradient sent to the trainer is the
//! app-supplied base gradient scaled by the current gear ratio and
//! clamped to the trainer's +-20% envelope. Trainer applies are debounced
//! to 100 ms; a change landing inside the debounce window is carried
//! forward and flushed by the periodic `tick`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::mirror::GattMirror;
use crate::uuids;

pub const GEAR_COUNT: usize = 24;

/// Gear restored on startup and RESET: displayed gear 12, ratio 1.05.
pub const DEFAULT_GEAR: usize = 11;

/// Hard limit on the effective gradient, in 0.01% units.
pub const GRADIENT_LIMIT_BP: i32 = 2000;

const APPLY_DEBOUNCE: Duration = Duration::from_millis(100);

/// Gear ratios in fixed 4-decimal representation: 0.50 to 1.65 in 0.05
/// steps, non-decreasing.
const GEAR_RATIOS_X10000: [i64; GEAR_COUNT] = [
    5000, 5500, 6000, 6500, 7000, 7500, 8000, 8500, 9000, 9500, 10000, 10500, 11000, 11500,
    12000, 12500, 13000, 13500, 14000, 14500, 15000, 15500, 16000, 16500,
];

/// Trainer-side incline contract. `bp` is signed 0.01% units, already
/// clamped to [-2000, +2000] by the controller.
pub trait InclineSink: Send + Sync {
    fn set_target_incline(&self, bp: i32);
}

struct State {
    gear: usize,
    last_shifter: Option<i32>,
    base_bp: i32,
    enabled: bool,
    last_apply: Option<Instant>,
    pending_bp: Option<i32>,
}

pub struct GearController {
    state: Mutex<State>,
    sink: Arc<dyn InclineSink>,
    mirror: Arc<GattMirror>,
}

impl GearController {
    pub fn new(mirror: Arc<GattMirror>, sink: Arc<dyn InclineSink>) -> Self {
        GearController {
            state: Mutex::new(State {
                gear: DEFAULT_GEAR,
                last_shifter: None,
                base_bp: 0,
                enabled: true,
                last_apply: None,
                pending_bp: None,
            }),
            sink,
            mirror,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed the latest shifter position. The first observation only
    /// seeds the reference; afterwards the delta sign selects the shift
    /// direction.
    pub fn poll_shifter(&self, position: i32) {
        let mut state = self.lock();
        let Some(last) = state.last_shifter else {
            state.last_shifter = Some(position);
            return;
        };
        state.last_shifter = Some(position);

        let changed = if position > last {
            Self::shift_locked(&mut state, 1)
        } else if position < last {
            Self::shift_locked(&mut state, -1)
        } else {
            None
        };
        self.finish(state, changed);
    }

    pub fn shift_up(&self) {
        let mut state = self.lock();
        let changed = Self::shift_locked(&mut state, 1);
        self.finish(state, changed);
    }

    pub fn shift_down(&self) {
        let mut state = self.lock();
        let changed = Self::shift_locked(&mut state, -1);
        self.finish(state, changed);
    }

    /// New base gradient from the app, in 0.01% units. The base itself
    /// is not clamped; only the composed product is.
    pub fn set_base_gradient(&self, bp: i32) {
        let mut state = self.lock();
        state.base_bp = bp;
        debug!("base gradient {} bp, gear {}", bp, state.gear + 1);
        let apply = Self::schedule_apply_locked(&mut state);
        drop(state);
        if let Some(bp) = apply {
            self.sink.set_target_incline(bp);
        }
    }

    /// Whether the controller owns the trainer's incline setpoint.
    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    pub fn disable(&self) {
        let mut state = self.lock();
        state.enabled = false;
        state.pending_bp = None;
    }

    /// Back to the default gear with a level road. Applies immediately,
    /// bypassing the debounce.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.gear = DEFAULT_GEAR;
        state.base_bp = 0;
        state.pending_bp = None;
        let apply = if state.enabled {
            state.last_apply = Some(Instant::now());
            Some(0)
        } else {
            None
        };
        let status = (state.gear, ratio_x100(state.gear));
        drop(state);

        info!("gear state reset");
        if let Some(bp) = apply {
            self.sink.set_target_incline(bp);
        }
        self.notify_gear(status);
    }

    /// Flush a debounced apply whose window has elapsed. Driven by the
    /// periodic task.
    pub fn tick(&self) {
        let mut state = self.lock();
        if state.pending_bp.is_none() || !state.enabled {
            return;
        }
        let elapsed = state
            .last_apply
            .map_or(true, |t| t.elapsed() >= APPLY_DEBOUNCE);
        if !elapsed {
            return;
        }
        let bp = state.pending_bp.take().unwrap_or(0);
        state.last_apply = Some(Instant::now());
        drop(state);
        self.sink.set_target_incline(bp);
    }

    /// Current gear, 0-based.
    pub fn gear(&self) -> usize {
        self.lock().gear
    }

    pub fn base_gradient_bp(&self) -> i32 {
        self.lock().base_bp
    }

    /// Composed and clamped gradient for the current state.
    pub fn effective_gradient_bp(&self) -> i32 {
        let state = self.lock();
        effective_bp(state.base_bp, state.gear)
    }

    // Returns (new_gear, ratio_x100) when the gear actually moved.
    fn shift_locked(state: &mut State, direction: i32) -> Option<(usize, u8)> {
        let target = state.gear as i32 + direction;
        if !(0..GEAR_COUNT as i32).contains(&target) {
            return None; // at the boundary, silently ignored
        }
        state.gear = target as usize;
        Some((state.gear, ratio_x100(state.gear)))
    }

    // Decides whether an apply goes out now or is carried forward.
    fn schedule_apply_locked(state: &mut State) -> Option<i32> {
        if !state.enabled {
            return None;
        }
        let bp = effective_bp(state.base_bp, state.gear);
        let now = Instant::now();
        let due = state
            .last_apply
            .map_or(true, |t| now.duration_since(t) >= APPLY_DEBOUNCE);
        if due {
            state.last_apply = Some(now);
            state.pending_bp = None;
            Some(bp)
        } else {
            state.pending_bp = Some(bp);
            None
        }
    }

    fn finish(&self, mut state: MutexGuard<'_, State>, changed: Option<(usize, u8)>) {
        let Some(status) = changed else { return };
        debug!("gear {} (ratio x100 = {})", status.0 + 1, status.1);
        let apply = Self::schedule_apply_locked(&mut state);
        drop(state);

        if let Some(bp) = apply {
            self.sink.set_target_incline(bp);
        }
        self.notify_gear(status);
    }

    // Gear status on Async TX: [gear_1indexed, ratio_x100].
    fn notify_gear(&self, (gear, ratio): (usize, u8)) {
        self.mirror
            .notify(&uuids::ZWIFT_ASYNC_TX_UUID, &[(gear + 1) as u8, ratio]);
    }
}

fn ratio_x100(gear: usize) -> u8 {
    (GEAR_RATIOS_X10000[gear] / 100) as u8
}

/// base x ratio, rounded half away from zero, clamped to the trainer
/// envelope. Integer arithmetic throughout.
pub fn effective_bp(base_bp: i32, gear: usize) -> i32 {
    let product = base_bp as i64 * GEAR_RATIOS_X10000[gear];
    let rounded = if product >= 0 {
        (product + 5000) / 10000
    } else {
        (product - 5000) / 10000
    };
    rounded.clamp(-(GRADIENT_LIMIT_BP as i64), GRADIENT_LIMIT_BP as i64) as i32
}
