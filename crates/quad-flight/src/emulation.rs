//! Minimal rigid-body quadcopter used as a stand-in for real hardware.
//!
//! The emulated motors write propeller throttles, the emulated IMU reads the
//! state back. State is integrated lazily up to "now" on every access.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::sensor::Axes;

const GRAVITY: f64 = 9.81;
const WEIGHT_KG: f64 = 1.6;
const ARM_LENGTH_M: f64 = 0.23;
// kg of thrust per throttle percent and propeller (0.75kg at 100%)
const THRUST_RATE: f64 = 0.0075;
// reaction torque per newton of thrust
const YAW_TORQUE_RATIO: f64 = 0.02;
const MAX_STEP_S: f64 = 0.005;

pub type SharedDrone = Arc<Mutex<EmulatedDrone>>;

pub fn lock(drone: &SharedDrone) -> MutexGuard<'_, EmulatedDrone> {
    drone.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DroneState {
    /// degrees
    pub angles: Axes,
    /// degrees/second
    pub angle_speeds: Axes,
    /// m/s², gravity excluded
    pub accels: Axes,
    pub altitude_m: f64,
    pub vertical_speed: f64,
}

#[derive(Debug)]
pub struct EmulatedDrone {
    throttles: [f64; 4],
    state: DroneState,
    last_update: Instant,
}

impl Default for EmulatedDrone {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDrone {
    pub fn new() -> Self {
        Self { throttles: [0.0; 4], state: DroneState::default(), last_update: Instant::now() }
    }

    pub fn shared() -> SharedDrone {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn throttles(&self) -> [f64; 4] {
        self.throttles
    }

    pub fn set_throttle(&mut self, index: usize, throttle: f64) {
        self.advance(Instant::now());
        self.throttles[index] = throttle;
    }

    /// Restarts the integration timebase without integrating the gap.
    pub fn reset_time(&mut self) {
        self.last_update = Instant::now();
    }

    /// State integrated up to now.
    pub fn state(&mut self) -> DroneState {
        self.advance(Instant::now());
        self.state.clone()
    }

    pub fn advance(&mut self, now: Instant) {
        let mut dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        while dt > 0.0 {
            let h = dt.min(MAX_STEP_S);
            self.integrate(h);
            dt -= h;
        }
    }

    fn integrate(&mut self, h: f64) {
        let thrust = self.throttles.map(|t| t * THRUST_RATE * GRAVITY);
        let [front, right, back, left] = thrust;
        let total: f64 = thrust.iter().sum();
        let st = &mut self.state;

        if st.altitude_m <= 0.0 && total <= WEIGHT_KG * GRAVITY {
            // resting on the ground
            st.angles[0] = 0.0;
            st.angles[1] = 0.0;
            st.angle_speeds = [0.0; 3];
            st.accels = [0.0; 3];
            st.altitude_m = 0.0;
            st.vertical_speed = 0.0;
            return;
        }

        let inertia = WEIGHT_KG * ARM_LENGTH_M.powi(2) / 2.0;
        let alpha = [
            ((left - right) * ARM_LENGTH_M / inertia).to_degrees(),
            ((back - front) * ARM_LENGTH_M / inertia).to_degrees(),
            ((right + left - front - back) * YAW_TORQUE_RATIO / (2.0 * inertia)).to_degrees(),
        ];
        for axis in 0..3 {
            st.angle_speeds[axis] += alpha[axis] * h;
            st.angles[axis] += st.angle_speeds[axis] * h;
        }

        let (ax, ay) = (st.angles[0].to_radians(), st.angles[1].to_radians());
        let thrust_acc = total / WEIGHT_KG;
        let vertical = thrust_acc * ax.cos() * ay.cos() - GRAVITY;
        st.accels = [thrust_acc * ay.sin(), -thrust_acc * ax.sin(), vertical];

        st.vertical_speed += vertical * h;
        st.altitude_m += st.vertical_speed * h;
        if st.altitude_m < 0.0 {
            st.altitude_m = 0.0;
            st.vertical_speed = 0.0;
        }
    }
}
