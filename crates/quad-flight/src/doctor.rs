use anyhow::Result;

use crate::config::{FlightConfig, FlightMode, HardwareConfig, PidConfig, PidGains};
use crate::motor::MotorKind;
use crate::sensor::SensorKind;

pub fn check_flight(cfg: &FlightConfig) -> Result<()> {
    anyhow::ensure!(
        cfg.pid_period_s >= 0.001 && cfg.pid_period_s <= 0.1,
        "flight.pid_period_s should be 0.001..0.1, got {}",
        cfg.pid_period_s
    );
    anyhow::ensure!(
        (0.0..=100.0).contains(&cfg.pid_throttle_threshold),
        "flight.pid_throttle_threshold should be 0..100"
    );
    for (name, v) in [
        ("max_angle_x", cfg.max_angle_x),
        ("max_angle_y", cfg.max_angle_y),
        ("max_angle_speed_x", cfg.max_angle_speed_x),
        ("max_angle_speed_y", cfg.max_angle_speed_y),
        ("max_angle_speed_z", cfg.max_angle_speed_z),
    ] {
        anyhow::ensure!(v > 0.0 && v.is_finite(), "flight.{} must be positive", name);
    }
    anyhow::ensure!(cfg.flight_mode != FlightMode::Accel, "flight.flight_mode accel is not implemented");
    Ok(())
}

fn check_block(name: &str, gains: &PidGains, axes: usize) -> Result<()> {
    for (k, v) in [("kp", &gains.kp), ("ki", &gains.ki), ("kd", &gains.kd)] {
        anyhow::ensure!(v.len() == axes, "pid.{}.{} needs {} entries, got {}", name, k, axes, v.len());
        anyhow::ensure!(v.iter().all(|x| x.is_finite()), "pid.{}.{} has non-finite entries", name, k);
    }
    Ok(())
}

pub fn check_pid(cfg: &PidConfig) -> Result<()> {
    check_block("angles_speed", &cfg.angles_speed, 3)?;
    check_block("angles", &cfg.angles, 2)?;
    check_block("accel", &cfg.accel, 3)?;
    Ok(())
}

pub fn check_hardware(cfg: &HardwareConfig) -> Result<()> {
    anyhow::ensure!(cfg.motor != MotorKind::Remote, "hardware.motor remote is not supported");
    anyhow::ensure!(cfg.imu != SensorKind::Remote, "hardware.imu remote is not supported");
    if cfg.motor == MotorKind::Local {
        let pwm = cfg.pwm.clone().unwrap_or_default();
        anyhow::ensure!(pwm.min_duty_ns < pwm.max_duty_ns, "hardware.pwm duty range is empty");
        anyhow::ensure!(pwm.max_duty_ns <= pwm.period_ns, "hardware.pwm.max_duty_ns exceeds period_ns");
    }
    Ok(())
}
