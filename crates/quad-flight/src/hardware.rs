use std::sync::Arc;

use tracing::info;

use crate::config::HardwareConfig;
use crate::driver::{Driver, NUM_MOTORS};
use crate::emulation::{EmulatedDrone, SharedDrone};
use crate::error::Result;
use crate::motor::{self, Motor};
use crate::sensor::{self, Sensor};

/// Sensor and motors selected from configuration. Emulated motors and the
/// emulated IMU share one drone.
pub struct Hardware {
    pub sensor: Arc<dyn Sensor>,
    pub motors: [Box<dyn Motor>; NUM_MOTORS],
    pub drone: SharedDrone,
}

impl Hardware {
    pub fn build(cfg: &HardwareConfig) -> Result<Self> {
        let drone = EmulatedDrone::shared();
        let sensor: Arc<dyn Sensor> = sensor::create(cfg.imu, &cfg.dummy, cfg.emulation_noise, &drone)?.into();

        let pwm = cfg.pwm.as_ref();
        let motors = [
            motor::create(0, cfg.motor, pwm, &drone)?,
            motor::create(1, cfg.motor, pwm, &drone)?,
            motor::create(2, cfg.motor, pwm, &drone)?,
            motor::create(3, cfg.motor, pwm, &drone)?,
        ];

        info!("hardware: motors={:?} imu={:?}", cfg.motor, cfg.imu);
        Ok(Self { sensor, motors, drone })
    }

    /// Splits into the parts a flight controller is built from.
    pub fn into_parts(self) -> (Arc<dyn Sensor>, Driver) {
        (self.sensor, Driver::new(self.motors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::MotorKind;
    use crate::sensor::SensorKind;

    #[test]
    fn emulated_parts_share_the_drone() {
        let cfg = HardwareConfig { motor: MotorKind::Emulated, imu: SensorKind::Emulated, ..HardwareConfig::default() };
        let mut hw = Hardware::build(&cfg).unwrap();
        hw.motors[1].set_throttle(12.0).unwrap();
        assert_eq!(crate::emulation::lock(&hw.drone).throttles(), [0.0, 12.0, 0.0, 0.0]);
    }

    #[test]
    fn remote_classes_are_rejected() {
        let cfg = HardwareConfig { imu: SensorKind::Remote, ..HardwareConfig::default() };
        assert!(Hardware::build(&cfg).is_err());
        let cfg = HardwareConfig { motor: MotorKind::Remote, ..HardwareConfig::default() };
        assert!(Hardware::build(&cfg).is_err());
    }

    #[test]
    fn dummy_imu_uses_configured_readings() {
        let mut cfg = HardwareConfig::default();
        cfg.dummy.accels = [0.0, 0.0, 9.8];
        let (sensor, driver) = Hardware::build(&cfg).unwrap().into_parts();
        assert_eq!(sensor.read_accels().unwrap(), [0.0, 0.0, 9.8]);
        assert_eq!(driver.throttles(), [0.0; 4]);
    }
}
