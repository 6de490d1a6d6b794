//! Motor mixer for a quad in + configuration.
//!
//! Motor order is front, right, back, left. Every mutation and the commit
//! share one lock, so an accumulate/commit sequence never interleaves with
//! another one.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::Result;
use crate::motor::Motor;

pub const NUM_MOTORS: usize = 4;

pub const FRONT: usize = 0;
pub const RIGHT: usize = 1;
pub const BACK: usize = 2;
pub const LEFT: usize = 3;

struct MotorSet {
    motors: [Box<dyn Motor>; NUM_MOTORS],
    base_throttle: f64,
    increments: [f64; NUM_MOTORS],
}

impl MotorSet {
    fn reset(&mut self) {
        self.base_throttle = 0.0;
        self.increments = [0.0; NUM_MOTORS];
    }

    /// Runs `op` on every motor even if some fail; returns the first failure.
    fn each(&mut self, what: &str, mut op: impl FnMut(&mut dyn Motor) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for (index, motor) in self.motors.iter_mut().enumerate() {
            if let Err(e) = op(motor.as_mut()) {
                warn!("driver: motor {} {} failed: {}", index, what, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub struct Driver {
    set: Mutex<MotorSet>,
}

impl Driver {
    pub fn new(motors: [Box<dyn Motor>; NUM_MOTORS]) -> Self {
        Self {
            set: Mutex::new(MotorSet { motors, base_throttle: 0.0, increments: [0.0; NUM_MOTORS] }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MotorSet> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<()> {
        let mut set = self.lock();
        set.reset();
        set.each("start", |m| m.start())
    }

    pub fn stand_by(&self) -> Result<()> {
        let mut set = self.lock();
        set.reset();
        set.each("stand-by", |m| m.stand_by())
    }

    pub fn idle(&self) -> Result<()> {
        let mut set = self.lock();
        set.reset();
        set.each("idle", |m| m.idle())
    }

    pub fn stop(&self) -> Result<()> {
        let mut set = self.lock();
        set.reset();
        set.each("stop", |m| m.stop())
    }

    /// Adds to the base throttle and returns it as (before, after), both read
    /// under the same lock as the update.
    pub fn add_throttle(&self, delta: f64) -> (f64, f64) {
        let mut set = self.lock();
        let before = set.base_throttle;
        set.base_throttle += delta;
        (before, set.base_throttle)
    }

    /// Pitch: front/back pair.
    pub fn shift_x(&self, increment: f64) {
        let mut set = self.lock();
        set.increments[FRONT] -= increment;
        set.increments[BACK] += increment;
    }

    /// Roll: left/right pair.
    pub fn shift_y(&self, increment: f64) {
        let mut set = self.lock();
        set.increments[LEFT] -= increment;
        set.increments[RIGHT] += increment;
    }

    /// Yaw torque, net thrust unchanged.
    pub fn spin(&self, increment: f64) {
        let mut set = self.lock();
        set.increments[FRONT] -= increment;
        set.increments[BACK] -= increment;
        set.increments[RIGHT] += increment;
        set.increments[LEFT] += increment;
    }

    /// Writes `base + increment` to every motor, then clears the increments.
    /// A failing motor is logged and does not keep the others from being
    /// written.
    pub fn commit_increments(&self) {
        let mut set = self.lock();
        let base = set.base_throttle;
        let increments = set.increments;
        for (index, motor) in set.motors.iter_mut().enumerate() {
            if let Err(e) = motor.set_throttle(base + increments[index]) {
                warn!("driver: commit on motor {} failed: {}", index, e);
            }
        }
        set.increments = [0.0; NUM_MOTORS];
    }

    pub fn throttles(&self) -> [f64; NUM_MOTORS] {
        let set = self.lock();
        std::array::from_fn(|i| set.motors[i].throttle())
    }

    pub fn base_throttle(&self) -> f64 {
        self.lock().base_throttle
    }

    /// Manual override: base and all motors to `throttle`, increments kept.
    pub fn set_throttle(&self, throttle: f64) -> Result<()> {
        let mut set = self.lock();
        set.base_throttle = throttle;
        debug!("driver: throttle pinned to {:.3}", throttle);
        set.each("set-throttle", |m| m.set_throttle(throttle))
    }
}
