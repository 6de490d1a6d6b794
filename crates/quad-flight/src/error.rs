use thiserror::Error;

use crate::config::FlightMode;

#[derive(Debug, Error)]
pub enum FlightError {
    #[error("flight mode {0:?} is not implemented")]
    ModeNotImplemented(FlightMode),

    #[error("{kind} class '{name}' is not supported")]
    Unsupported { kind: &'static str, name: &'static str },

    #[error("{block} axis {axis} out of range (axes: {axes})")]
    AxisOutOfRange { block: &'static str, axis: usize, axes: usize },

    #[error("pid channel {index} out of range (channels: {len})")]
    ChannelOutOfRange { index: usize, len: usize },

    #[error("pid gain vectors must share a non-zero length (p={p}, i={i}, d={d})")]
    GainLength { p: usize, i: usize, d: usize },

    #[error("{block} gains need {expected} entries, got {got}")]
    GainLayout { block: &'static str, expected: usize, got: usize },

    #[error("pid period must be a positive number of seconds, got {0}")]
    InvalidPeriod(f64),

    #[error("expected {expected} values, got {got}")]
    VectorLength { expected: usize, got: usize },

    #[error("motor {index}: {source}")]
    Motor {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("sensor: {0}")]
    Sensor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = FlightError> = std::result::Result<T, E>;
