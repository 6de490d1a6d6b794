use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PwmConfig;
use crate::emulation::SharedDrone;
use crate::error::{FlightError, Result};

pub const MAX_THROTTLE: f64 = 100.0;

/// A single motor actuator. Throttle is expressed in percent.
pub trait Motor: Send {
    fn start(&mut self) -> Result<()>;
    fn stand_by(&mut self) -> Result<()>;
    fn idle(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn set_throttle(&mut self, throttle: f64) -> Result<()>;
    fn throttle(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorKind {
    /// Sysfs PWM output driving an ESC.
    Local,
    Emulated,
    #[default]
    Dummy,
    /// Never implemented; rejected at construction.
    Remote,
}

fn clamp_throttle(throttle: f64) -> f64 {
    if throttle.is_nan() {
        return 0.0;
    }
    throttle.clamp(0.0, MAX_THROTTLE)
}

/// Inert motor, only remembers its throttle.
#[derive(Debug, Default)]
pub struct DummyMotor {
    id: usize,
    throttle: f64,
}

impl DummyMotor {
    pub fn new(id: usize) -> Self {
        Self { id, throttle: 0.0 }
    }
}

impl Motor for DummyMotor {
    fn start(&mut self) -> Result<()> {
        debug!("motor {}: dummy start", self.id);
        self.throttle = 0.0;
        Ok(())
    }

    fn stand_by(&mut self) -> Result<()> {
        self.throttle = 0.0;
        Ok(())
    }

    fn idle(&mut self) -> Result<()> {
        self.throttle = 0.0;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.throttle = 0.0;
        Ok(())
    }

    fn set_throttle(&mut self, throttle: f64) -> Result<()> {
        self.throttle = clamp_throttle(throttle);
        Ok(())
    }

    fn throttle(&self) -> f64 {
        self.throttle
    }
}

/// Four inert motors, front/right/back/left.
pub fn dummy_set() -> [Box<dyn Motor>; 4] {
    [
        Box::new(DummyMotor::new(0)),
        Box::new(DummyMotor::new(1)),
        Box::new(DummyMotor::new(2)),
        Box::new(DummyMotor::new(3)),
    ]
}

/// Propeller of the emulated drone.
pub struct EmulatedMotor {
    id: usize,
    drone: SharedDrone,
    throttle: f64,
}

impl EmulatedMotor {
    pub fn new(id: usize, drone: SharedDrone) -> Self {
        Self { id, drone, throttle: 0.0 }
    }

    fn apply(&mut self, throttle: f64) {
        self.throttle = clamp_throttle(throttle);
        crate::emulation::lock(&self.drone).set_throttle(self.id, self.throttle);
    }
}

impl Motor for EmulatedMotor {
    fn start(&mut self) -> Result<()> {
        self.apply(0.0);
        Ok(())
    }

    fn stand_by(&mut self) -> Result<()> {
        self.apply(0.0);
        Ok(())
    }

    fn idle(&mut self) -> Result<()> {
        self.apply(0.0);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.apply(0.0);
        Ok(())
    }

    fn set_throttle(&mut self, throttle: f64) -> Result<()> {
        self.apply(throttle);
        Ok(())
    }

    fn throttle(&self) -> f64 {
        self.throttle
    }
}

/// ESC driven through the Linux sysfs PWM interface
/// (`<chip>/pwmN/{period,duty_cycle,enable}`).
pub struct PwmMotor {
    id: usize,
    chip: PathBuf,
    channel: u32,
    period_ns: u64,
    min_duty_ns: u64,
    max_duty_ns: u64,
    throttle: f64,
}

impl PwmMotor {
    pub fn new(id: usize, cfg: &PwmConfig) -> Self {
        Self {
            id,
            chip: PathBuf::from(&cfg.chip),
            channel: cfg.channels[id],
            period_ns: cfg.period_ns,
            min_duty_ns: cfg.min_duty_ns,
            max_duty_ns: cfg.max_duty_ns,
            throttle: 0.0,
        }
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip.join(format!("pwm{}", self.channel))
    }

    fn write(&self, path: &Path, value: impl ToString) -> Result<()> {
        fs::write(path, value.to_string()).map_err(|source| FlightError::Motor { index: self.id, source })
    }

    /// Duty cycle in ns for a throttle in percent.
    pub fn duty_ns(&self, throttle: f64) -> u64 {
        let span = self.max_duty_ns.saturating_sub(self.min_duty_ns) as f64;
        self.min_duty_ns + (span * clamp_throttle(throttle) / MAX_THROTTLE).round() as u64
    }

    fn apply(&mut self, throttle: f64) -> Result<()> {
        let duty = self.duty_ns(throttle);
        self.write(&self.channel_dir().join("duty_cycle"), duty)?;
        self.throttle = clamp_throttle(throttle);
        Ok(())
    }

    fn set_enabled(&self, on: bool) -> Result<()> {
        self.write(&self.channel_dir().join("enable"), if on { 1 } else { 0 })
    }
}

impl Motor for PwmMotor {
    fn start(&mut self) -> Result<()> {
        let dir = self.channel_dir();
        if !dir.exists() {
            self.write(&self.chip.join("export"), self.channel)?;
        }
        self.write(&dir.join("period"), self.period_ns)?;
        self.apply(0.0)?;
        self.set_enabled(true)?;
        info!("motor {}: pwm {} ready", self.id, dir.display());
        Ok(())
    }

    fn stand_by(&mut self) -> Result<()> {
        self.apply(0.0)
    }

    fn idle(&mut self) -> Result<()> {
        self.apply(0.0)
    }

    fn stop(&mut self) -> Result<()> {
        self.apply(0.0)?;
        self.set_enabled(false)
    }

    fn set_throttle(&mut self, throttle: f64) -> Result<()> {
        self.apply(throttle)
    }

    fn throttle(&self) -> f64 {
        self.throttle
    }
}

/// Builds the motor in slot `id` for the configured class.
pub fn create(id: usize, kind: MotorKind, pwm: Option<&PwmConfig>, drone: &SharedDrone) -> Result<Box<dyn Motor>> {
    let motor: Box<dyn Motor> = match kind {
        MotorKind::Local => Box::new(PwmMotor::new(id, &pwm.cloned().unwrap_or_default())),
        MotorKind::Emulated => Box::new(EmulatedMotor::new(id, drone.clone())),
        MotorKind::Dummy => Box::new(DummyMotor::new(id)),
        MotorKind::Remote => return Err(FlightError::Unsupported { kind: "motor", name: "remote" }),
    };
    Ok(motor)
}
