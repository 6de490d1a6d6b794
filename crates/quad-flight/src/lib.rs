pub mod config;
pub mod controller;
pub mod doctor;
pub mod driver;
pub mod emulation;
pub mod error;
pub mod hardware;
pub mod motor;
pub mod pid;
pub mod sensor;

pub use config::{FlightConfig, FlightMode, HardwareConfig, PidConfig, PidGains};
pub use controller::FlightController;
pub use driver::Driver;
pub use error::{FlightError, Result};
pub use hardware::Hardware;
