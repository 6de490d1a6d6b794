use serde::{Deserialize, Serialize};

/// Point-in-time view of the drone, built on demand by the flight controller.
///
/// `angles[2]` carries the Z angle speed (yaw rate), not the yaw angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub throttles: [f64; 4],
    pub angles: [f64; 3],
    pub accels: [f64; 3],
    // seconds
    pub current_period: f64,
}
