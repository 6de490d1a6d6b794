use serde::{Deserialize, Serialize};

use crate::motor::MotorKind;
use crate::sensor::SensorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlightMode {
    AngleSpeed,
    Angle,
    /// Declared for the protocol, not implemented by the controller.
    Accel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Nominal PID loop period in seconds (0.006 = 166.6Hz).
    pub pid_period_s: f64,

    /// Base throttle at which the stabilization loop engages.
    pub pid_throttle_threshold: f64,

    /// Pilot input scaling, degrees and degrees/second at 100%.
    pub max_angle_x: f64,
    pub max_angle_y: f64,
    pub max_angle_speed_x: f64,
    pub max_angle_speed_y: f64,
    pub max_angle_speed_z: f64,

    pub flight_mode: FlightMode,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            pid_period_s: 0.006,
            pid_throttle_threshold: 0.0,
            max_angle_x: 20.0,
            max_angle_y: 20.0,
            max_angle_speed_x: 90.0,
            max_angle_speed_y: 90.0,
            max_angle_speed_z: 20.0,
            flight_mode: FlightMode::Angle,
        }
    }
}

/// One block of PID constants, one entry per axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: Vec<f64>,
    pub ki: Vec<f64>,
    pub kd: Vec<f64>,
}

impl PidGains {
    pub fn zeros(axes: usize) -> Self {
        Self { kp: vec![0.0; axes], ki: vec![0.0; axes], kd: vec![0.0; axes] }
    }
}

/// Angle-speed constants are written scaled by 1000 (see
/// `controller::ANGLE_SPEED_FACTOR`); angles and accel are taken as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub angles_speed: PidGains,
    pub angles: PidGains,
    pub accel: PidGains,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            angles_speed: PidGains {
                kp: vec![150.0, 150.0, 300.0],
                ki: vec![10.0, 10.0, 20.0],
                kd: vec![2.0, 2.0, 0.0],
            },
            angles: PidGains {
                kp: vec![2.0, 2.0],
                ki: vec![0.0, 0.0],
                kd: vec![0.0, 0.0],
            },
            accel: PidGains::zeros(3),
        }
    }
}

/// Sysfs PWM layout for the `local` motor class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PwmConfig {
    /// e.g. "/sys/class/pwm/pwmchip0"
    pub chip: String,
    /// PWM channel per motor, in front/right/back/left order.
    pub channels: [u32; 4],
    pub period_ns: u64,
    pub min_duty_ns: u64,
    pub max_duty_ns: u64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            chip: "/sys/class/pwm/pwmchip0".into(),
            channels: [0, 1, 2, 3],
            period_ns: 2_500_000,
            min_duty_ns: 1_000_000,
            max_duty_ns: 2_000_000,
        }
    }
}

/// Fixed readings for the `dummy` IMU class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyReadings {
    pub angles: [f64; 3],
    pub angle_speeds: [f64; 3],
    pub accels: [f64; 3],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub motor: MotorKind,
    pub imu: SensorKind,

    /// Adds uniform noise to emulated IMU readings.
    pub emulation_noise: bool,

    pub pwm: Option<PwmConfig>,
    pub dummy: DummyReadings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Doc {
        flight: FlightConfig,
        #[serde(default)]
        pid: PidConfig,
        #[serde(default)]
        hardware: HardwareConfig,
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let doc: Doc = toml::from_str(
            r#"
            [flight]
            pid_period_s = 0.01
            flight_mode = "angle-speed"

            [hardware]
            motor = "emulated"
            imu = "emulated"
            "#,
        )
        .unwrap();

        assert_eq!(doc.flight.pid_period_s, 0.01);
        assert_eq!(doc.flight.flight_mode, FlightMode::AngleSpeed);
        assert_eq!(doc.flight.max_angle_speed_z, 20.0);
        assert_eq!(doc.pid, PidConfig::default());
        assert_eq!(doc.hardware.motor, MotorKind::Emulated);
        assert_eq!(doc.hardware.imu, SensorKind::Emulated);
        assert!(doc.hardware.pwm.is_none());
    }

    #[test]
    fn pid_blocks_parse() {
        let doc: Doc = toml::from_str(
            r#"
            [flight]
            [pid.angles]
            kp = [1.5, 1.5]
            ki = [0.1, 0.1]
            kd = [0.0, 0.0]
            "#,
        )
        .unwrap();

        assert_eq!(doc.pid.angles.kp, vec![1.5, 1.5]);
        assert_eq!(doc.pid.accel, PidGains::zeros(3));
    }
}
