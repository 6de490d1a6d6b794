use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use quad_proto::telemetry::TelemetrySnapshot;
use tracing::{debug, info, warn};

use crate::config::{FlightConfig, FlightMode, PidConfig, PidGains};
use crate::driver::Driver;
use crate::error::{FlightError, Result};
use crate::pid::{LoopStats, Pid, PidHandle};
use crate::sensor::Sensor;

/// Channel layout of the stabilization PID.
pub const PID_CHANNELS: usize = 8;
pub const ANGLE_SPEED_OFFSET: usize = 0;
pub const ANGLES_OFFSET: usize = 3;
pub const ACCEL_OFFSET: usize = 5;

const ANGLE_SPEED_AXES: usize = 3;
const ANGLES_AXES: usize = 2;
const ACCEL_AXES: usize = 3;

/// Angle-speed PID constants are configured scaled by this factor.
pub const ANGLE_SPEED_FACTOR: f64 = 1000.0;

const PID_NAME: &str = "stabilization";

pub struct FlightController {
    cfg: FlightConfig,
    driver: Arc<Driver>,
    sensor: Arc<dyn Sensor>,
    pid: Pid,
    targets: PidHandle,
    mode: Arc<RwLock<FlightMode>>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
    throttle_threshold: Mutex<f64>,
}

impl FlightController {
    pub fn new(cfg: FlightConfig, gains: &PidConfig, sensor: Arc<dyn Sensor>, driver: Driver) -> Result<Self> {
        if cfg.flight_mode == FlightMode::Accel {
            return Err(FlightError::ModeNotImplemented(FlightMode::Accel));
        }
        let period = match Duration::try_from_secs_f64(cfg.pid_period_s) {
            Ok(period) if !period.is_zero() => period,
            _ => return Err(FlightError::InvalidPeriod(cfg.pid_period_s)),
        };

        check_block("angles-speed", &gains.angles_speed, ANGLE_SPEED_AXES)?;
        check_block("angles", &gains.angles, ANGLES_AXES)?;
        check_block("accel", &gains.accel, ACCEL_AXES)?;

        let layout = |speed: &[f64], angles: &[f64], accel: &[f64]| -> Vec<f64> {
            let mut v: Vec<f64> = speed.iter().map(|k| k / ANGLE_SPEED_FACTOR).collect();
            v.extend_from_slice(angles);
            v.extend_from_slice(accel);
            v
        };
        let (s, a, z) = (&gains.angles_speed, &gains.angles, &gains.accel);
        let targets = PidHandle::new(layout(&s.kp, &a.kp, &z.kp), layout(&s.ki, &a.ki, &z.ki), layout(&s.kd, &a.kd, &z.kd))?;

        let driver = Arc::new(driver);
        let mode = Arc::new(RwLock::new(cfg.flight_mode));

        let input_sensor = sensor.clone();
        let read_input = Box::new(move || -> Result<Vec<f64>> { read_pid_input(input_sensor.as_ref()) });

        let out_driver = driver.clone();
        let out_targets = targets.clone();
        let out_mode = mode.clone();
        let set_output = Box::new(move |output: &[f64]| {
            let mode = *out_mode.read().unwrap_or_else(PoisonError::into_inner);
            apply_pid_output(&out_driver, &out_targets, mode, output);
        });

        let pid = Pid::with_state(PID_NAME, period, targets.clone(), read_input, set_output);

        Ok(Self {
            throttle_threshold: Mutex::new(cfg.pid_throttle_threshold),
            cfg,
            driver,
            sensor,
            pid,
            targets,
            mode,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &FlightConfig {
        &self.cfg
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn pid_targets(&self) -> &PidHandle {
        &self.targets
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_pid_running(&self) -> bool {
        self.pid.is_running()
    }

    /// How many times the stabilization loop was actually started.
    pub fn pid_runs(&self) -> u64 {
        self.pid.runs()
    }

    pub fn loop_stats(&self) -> Option<LoopStats> {
        self.pid.last_stats()
    }

    pub fn flight_mode(&self) -> FlightMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid_throttle_threshold(&self) -> f64 {
        *self.throttle_threshold.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_pid_throttle_threshold(&self, throttle: f64) {
        *self.throttle_threshold.lock().unwrap_or_else(PoisonError::into_inner) = throttle;
    }

    pub fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            return Ok(());
        }
        self.sensor.start()?;
        self.driver.start()?;
        self.driver.idle()?;
        self.running.store(true, Ordering::Release);
        info!("controller: started (mode={:?})", self.flight_mode());
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_running() {
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        self.idle()?;
        self.driver.stop()?;
        self.sensor.stop()?;
        info!("controller: stopped");
        Ok(())
    }

    pub fn stand_by(&self) -> Result<()> {
        self.stop_pid();
        self.driver.stand_by()
    }

    pub fn idle(&self) -> Result<()> {
        self.stop_pid();
        self.driver.idle()
    }

    /// Starts the stabilization loop. Ignored until the controller itself has
    /// been started.
    pub fn start_pid(&self) -> Result<()> {
        if !self.is_running() {
            debug!("controller: not started, pid stays off");
            return Ok(());
        }
        if self.pid.is_running() {
            return Ok(());
        }
        info!("controller: starting pid");
        // keeps the first dt from spanning the whole idle time
        self.sensor.reset_gyro_read_time();
        thread::sleep(self.pid.period());
        self.sensor.refresh_state()?;
        self.pid.start()
    }

    pub fn stop_pid(&self) {
        if self.pid.stop().is_some() {
            info!("controller: pid finished");
        }
    }

    /// Moves the base throttle, engaging the stabilization loop when it
    /// crosses the threshold upwards and disengaging it (pinning the motors to
    /// the new throttle) when it crosses downwards.
    pub fn add_throttle(&self, delta: f64) -> Result<()> {
        let threshold = self.pid_throttle_threshold();
        let (before, after) = self.driver.add_throttle(delta);

        if after >= threshold && before < threshold {
            self.start_pid()?;
        } else if after < threshold && before >= threshold {
            self.stop_pid();
            self.driver.set_throttle(after)?;
        }

        if !self.pid.is_running() {
            self.driver.commit_increments();
        }
        Ok(())
    }

    /// Pilot roll, pitch and rudder, each in [-100, 100].
    pub fn set_inputs(&self, inputs: [f64; 3]) -> Result<()> {
        let [roll, pitch, rudder] = inputs;
        match self.flight_mode() {
            FlightMode::Angle => {
                self.targets.set_target(ANGLES_OFFSET, roll * self.cfg.max_angle_x / 100.0)?;
                self.targets.set_target(ANGLES_OFFSET + 1, pitch * self.cfg.max_angle_y / 100.0)?;
            }
            FlightMode::AngleSpeed => {
                self.targets.set_target(ANGLE_SPEED_OFFSET, roll * self.cfg.max_angle_speed_x / 100.0)?;
                self.targets.set_target(ANGLE_SPEED_OFFSET + 1, pitch * self.cfg.max_angle_speed_y / 100.0)?;
            }
            FlightMode::Accel => return Err(FlightError::ModeNotImplemented(FlightMode::Accel)),
        }
        self.targets.set_target(ANGLE_SPEED_OFFSET + 2, rudder * self.cfg.max_angle_speed_z / 100.0)
    }

    /// Sets raw targets: x and y (angles or angle speeds depending on the
    /// mode), z angle speed, z accel.
    #[deprecated(note = "bypasses pilot input scaling; use set_inputs")]
    pub fn set_targets(&self, targets: [f64; 4]) -> Result<()> {
        let [x, y, z_speed, z_accel] = targets;
        match self.flight_mode() {
            FlightMode::Angle => {
                self.targets.set_target(ANGLES_OFFSET, x)?;
                self.targets.set_target(ANGLES_OFFSET + 1, y)?;
            }
            FlightMode::AngleSpeed => {
                self.targets.set_target(ANGLE_SPEED_OFFSET, x)?;
                self.targets.set_target(ANGLE_SPEED_OFFSET + 1, y)?;
            }
            FlightMode::Accel => return Err(FlightError::ModeNotImplemented(FlightMode::Accel)),
        }
        self.targets.set_target(ANGLE_SPEED_OFFSET + 2, z_speed)?;
        self.targets.set_target(ACCEL_OFFSET + 2, z_accel)
    }

    /// Switches mode and clears every target.
    pub fn set_flight_mode(&self, mode: FlightMode) -> Result<()> {
        if mode == FlightMode::Accel {
            return Err(FlightError::ModeNotImplemented(mode));
        }
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
        self.targets.set_targets(&[0.0; PID_CHANNELS])?;
        info!("controller: flight mode {:?}", mode);
        Ok(())
    }

    pub fn alter_pid_angles_speed_constants(&self, axis: usize, p: f64, i: f64, d: f64) -> Result<()> {
        self.alter_constants("angles-speed", axis, ANGLE_SPEED_AXES, ANGLE_SPEED_OFFSET, |k| k / ANGLE_SPEED_FACTOR, [p, i, d])
    }

    pub fn alter_pid_angles_constants(&self, axis: usize, p: f64, i: f64, d: f64) -> Result<()> {
        self.alter_constants("angles", axis, ANGLES_AXES, ANGLES_OFFSET, |k| k, [p, i, d])
    }

    pub fn alter_pid_accel_constants(&self, axis: usize, p: f64, i: f64, d: f64) -> Result<()> {
        self.alter_constants("accel", axis, ACCEL_AXES, ACCEL_OFFSET, |k| k, [p, i, d])
    }

    fn alter_constants(
        &self,
        block: &'static str,
        axis: usize,
        axes: usize,
        offset: usize,
        scale: fn(f64) -> f64,
        [p, i, d]: [f64; 3],
    ) -> Result<()> {
        if axis >= axes {
            return Err(FlightError::AxisOutOfRange { block, axis, axes });
        }
        self.targets.set_gains(offset + axis, scale(p), scale(i), scale(d))?;
        info!("controller: {} pid axis {} constants p={} i={} d={}", block, axis, p, i, d);
        Ok(())
    }

    /// Motor throttles plus fresh sensor readings. `angles[2]` carries the
    /// yaw rate instead of the yaw angle.
    pub fn read_state(&self) -> Result<TelemetrySnapshot> {
        let mut angles = self.sensor.read_angles()?;
        angles[2] = self.sensor.read_angle_speeds()?[2];
        Ok(TelemetrySnapshot {
            throttles: self.driver.throttles(),
            angles,
            accels: self.sensor.read_accels()?,
            current_period: self.pid.current_period(),
        })
    }
}

impl Drop for FlightController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("controller: stop on drop failed: {}", e);
        }
    }
}

fn check_block(block: &'static str, gains: &PidGains, axes: usize) -> Result<()> {
    for got in [gains.kp.len(), gains.ki.len(), gains.kd.len()] {
        if got != axes {
            return Err(FlightError::GainLayout { block, expected: axes, got });
        }
    }
    Ok(())
}

fn read_pid_input(sensor: &dyn Sensor) -> Result<Vec<f64>> {
    sensor.refresh_state()?;
    let speeds = sensor.read_angle_speeds()?;
    let angles = sensor.read_angles()?;
    let accels = sensor.read_accels()?;

    let mut input = Vec::with_capacity(PID_CHANNELS);
    input.extend_from_slice(&speeds);
    input.extend_from_slice(&angles[..ANGLES_AXES]);
    input.extend_from_slice(&accels);
    Ok(input)
}

fn apply_pid_output(driver: &Driver, targets: &PidHandle, mode: FlightMode, output: &[f64]) {
    // positive X angle tilts backwards, hence the inverted roll shift
    driver.shift_y(-output[ANGLE_SPEED_OFFSET]);
    driver.shift_x(output[ANGLE_SPEED_OFFSET + 1]);
    driver.spin(output[ANGLE_SPEED_OFFSET + 2]);

    if mode == FlightMode::Angle {
        // angle loop drives the angle-speed loop
        for axis in 0..ANGLES_AXES {
            if let Err(e) = targets.set_target(ANGLE_SPEED_OFFSET + axis, output[ANGLES_OFFSET + axis]) {
                warn!("controller: cascade target {} rejected: {}", axis, e);
            }
        }
    }

    driver.add_throttle(output[ACCEL_OFFSET + 2]);
    driver.commit_increments();
}
