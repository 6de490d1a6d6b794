use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DummyReadings;
use crate::emulation::{self, SharedDrone};
use crate::error::{FlightError, Result};

/// X, Y, Z.
pub type Axes = [f64; 3];

/// IMU capability consumed by the flight controller. Implementations are
/// shared between the PID thread and command workers.
pub trait Sensor: Send + Sync {
    fn start(&self) -> Result<()>;
    fn calibrate(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;

    /// Pulls a fresh sample from the device, if it needs polling.
    fn refresh_state(&self) -> Result<()>;
    /// Restarts the gyro integration timebase.
    fn reset_gyro_read_time(&self);

    /// Degrees.
    fn read_angles(&self) -> Result<Axes>;
    /// Degrees/second. Positive Z is counter-clockwise.
    fn read_angle_speeds(&self) -> Result<Axes>;
    fn read_accels(&self) -> Result<Axes>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Emulated,
    #[default]
    Dummy,
    /// Never implemented; rejected at construction.
    Remote,
}

/// Sensor returning fixed readings.
#[derive(Debug, Default)]
pub struct DummySensor {
    readings: Mutex<DummyReadings>,
}

impl DummySensor {
    pub fn new(readings: DummyReadings) -> Self {
        Self { readings: Mutex::new(readings) }
    }

    pub fn fixed(angles: Axes, angle_speeds: Axes, accels: Axes) -> Self {
        Self::new(DummyReadings { angles, angle_speeds, accels })
    }

    pub fn set_readings(&self, readings: DummyReadings) {
        *self.readings.lock().unwrap_or_else(PoisonError::into_inner) = readings;
    }

    fn read(&self) -> DummyReadings {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sensor for DummySensor {
    fn start(&self) -> Result<()> {
        info!("sensor: using dummy IMU");
        Ok(())
    }

    fn calibrate(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn refresh_state(&self) -> Result<()> {
        Ok(())
    }

    fn reset_gyro_read_time(&self) {}

    fn read_angles(&self) -> Result<Axes> {
        Ok(self.read().angles)
    }

    fn read_angle_speeds(&self) -> Result<Axes> {
        Ok(self.read().angle_speeds)
    }

    fn read_accels(&self) -> Result<Axes> {
        Ok(self.read().accels)
    }
}

// Half-width of the uniform noise added per reading kind.
const NOISE_ANGLE_SPEED: f64 = 1.0;
const NOISE_ANGLE: f64 = 0.0;
const NOISE_ACCEL: f64 = 0.1;

/// IMU of the emulated drone.
pub struct EmulatedSensor {
    drone: SharedDrone,
    rng: Option<Mutex<StdRng>>,
}

impl EmulatedSensor {
    pub fn new(drone: SharedDrone, noise: bool) -> Self {
        let rng = noise.then(|| Mutex::new(StdRng::from_entropy()));
        Self { drone, rng }
    }

    fn noisify(&self, mut values: Axes, amplitude: f64) -> Axes {
        if let (Some(rng), true) = (&self.rng, amplitude > 0.0) {
            let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
            for v in values.iter_mut() {
                *v += rng.gen_range(-amplitude..=amplitude);
            }
        }
        values
    }
}

impl Sensor for EmulatedSensor {
    fn start(&self) -> Result<()> {
        info!("sensor: using emulated drone's IMU (noise={})", self.rng.is_some());
        Ok(())
    }

    fn calibrate(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn refresh_state(&self) -> Result<()> {
        emulation::lock(&self.drone).advance(std::time::Instant::now());
        Ok(())
    }

    fn reset_gyro_read_time(&self) {
        emulation::lock(&self.drone).reset_time();
    }

    fn read_angles(&self) -> Result<Axes> {
        let angles = emulation::lock(&self.drone).state().angles;
        Ok(self.noisify(angles, NOISE_ANGLE))
    }

    fn read_angle_speeds(&self) -> Result<Axes> {
        let speeds = emulation::lock(&self.drone).state().angle_speeds;
        Ok(self.noisify(speeds, NOISE_ANGLE_SPEED))
    }

    fn read_accels(&self) -> Result<Axes> {
        let accels = emulation::lock(&self.drone).state().accels;
        Ok(self.noisify(accels, NOISE_ACCEL))
    }
}

pub fn create(kind: SensorKind, readings: &DummyReadings, noise: bool, drone: &SharedDrone) -> Result<Box<dyn Sensor>> {
    let sensor: Box<dyn Sensor> = match kind {
        SensorKind::Emulated => Box::new(EmulatedSensor::new(drone.clone(), noise)),
        SensorKind::Dummy => Box::new(DummySensor::new(readings.clone())),
        SensorKind::Remote => return Err(FlightError::Unsupported { kind: "imu", name: "remote" }),
    };
    Ok(sensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::EmulatedDrone;

    #[test]
    fn dummy_returns_configured_readings() {
        let s = DummySensor::fixed([1.0, 2.0, 3.0], [7.0, 8.0, 9.0], [4.0, 5.0, 6.0]);
        assert_eq!(s.read_angles().unwrap(), [1.0, 2.0, 3.0]);
        assert_eq!(s.read_angle_speeds().unwrap(), [7.0, 8.0, 9.0]);
        assert_eq!(s.read_accels().unwrap(), [4.0, 5.0, 6.0]);

        s.set_readings(DummyReadings::default());
        assert_eq!(s.read_angles().unwrap(), [0.0; 3]);
    }

    #[test]
    fn emulated_noise_stays_in_band() {
        let drone = EmulatedDrone::shared();
        let s = EmulatedSensor::new(drone, true);
        for _ in 0..100 {
            let speeds = s.read_angle_speeds().unwrap();
            assert!(speeds.iter().all(|v| v.abs() <= NOISE_ANGLE_SPEED));
            assert_eq!(s.read_angles().unwrap(), [0.0; 3]);
        }
    }

    #[test]
    fn remote_imu_fails_fast() {
        let drone = EmulatedDrone::shared();
        assert!(matches!(
            create(SensorKind::Remote, &DummyReadings::default(), false, &drone),
            Err(FlightError::Unsupported { kind: "imu", .. })
        ));
    }
}
