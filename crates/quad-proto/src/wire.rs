use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KEY_TARGET: &str = "target";
pub const KEY_THROTTLE: &str = "throttle";
pub const KEY_IS_STARTED: &str = "is-started";
pub const KEY_PID_CALIBRATION: &str = "pid-calibration";
pub const KEY_READ_DRONE_CONFIG: &str = "read-drone-config";
pub const KEY_READ_DRONE_STATE: &str = "read-drone-state";
pub const KEY_CLOSE: &str = "close";

/// One inbound line: `{"key": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub key: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// One outbound line. Exactly one of `response` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), response: Some(value), error: None }
    }

    pub fn error(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self { key: key.into(), response: None, error: Some(message.into()) }
    }

    /// Serialized form, newline-terminated.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Which PID block a calibration edit targets. Anything other than
/// `ang-speed` or `angles` selects the accel block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum PidLevel {
    AngSpeed,
    Angles,
    Accel,
}

impl From<String> for PidLevel {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ang-speed" => PidLevel::AngSpeed,
            "angles" => PidLevel::Angles,
            _ => PidLevel::Accel,
        }
    }
}

impl From<PidLevel> for &'static str {
    fn from(level: PidLevel) -> Self {
        match level {
            PidLevel::AngSpeed => "ang-speed",
            PidLevel::Angles => "angles",
            PidLevel::Accel => "accel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidCalibration {
    pub pid: PidLevel,
    pub axis: Axis,
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// Decoded command. `data` is validated per key.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Pilot vector in [-100, 100]: x, y, z-rate, z-accel.
    Target([f64; 4]),
    /// Throttle in [0, 100].
    Throttle(f64),
    IsStarted(bool),
    PidCalibration(PidCalibration),
    ReadDroneConfig,
    ReadDroneState,
    Close,
    Unknown(String),
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Target(_) => KEY_TARGET,
            Command::Throttle(_) => KEY_THROTTLE,
            Command::IsStarted(_) => KEY_IS_STARTED,
            Command::PidCalibration(_) => KEY_PID_CALIBRATION,
            Command::ReadDroneConfig => KEY_READ_DRONE_CONFIG,
            Command::ReadDroneState => KEY_READ_DRONE_STATE,
            Command::Close => KEY_CLOSE,
            Command::Unknown(key) => key,
        }
    }
}

impl TryFrom<Request> for Command {
    type Error = serde_json::Error;

    fn try_from(req: Request) -> Result<Self, Self::Error> {
        let cmd = match req.key.as_str() {
            KEY_TARGET => Command::Target(serde_json::from_value(req.data)?),
            KEY_THROTTLE => Command::Throttle(serde_json::from_value(req.data)?),
            KEY_IS_STARTED => Command::IsStarted(serde_json::from_value(req.data)?),
            KEY_PID_CALIBRATION => Command::PidCalibration(serde_json::from_value(req.data)?),
            KEY_READ_DRONE_CONFIG => Command::ReadDroneConfig,
            KEY_READ_DRONE_STATE => Command::ReadDroneState,
            KEY_CLOSE => Command::Close,
            _ => Command::Unknown(req.key),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(line: &str) -> Command {
        Command::try_from(Request::parse_line(line).unwrap()).unwrap()
    }

    #[test]
    fn decodes_every_known_key() {
        assert_eq!(decode(r#"{"key":"target","data":[10,-20,30,0]}"#), Command::Target([10.0, -20.0, 30.0, 0.0]));
        assert_eq!(decode(r#"{"key":"throttle","data":42.5}"#), Command::Throttle(42.5));
        assert_eq!(decode(r#"{"key":"is-started","data":true}"#), Command::IsStarted(true));
        assert_eq!(decode(r#"{"key":"read-drone-config","data":null}"#), Command::ReadDroneConfig);
        assert_eq!(decode(r#"{"key":"read-drone-state"}"#), Command::ReadDroneState);
        assert_eq!(decode(r#"{"key":"close","data":null}"#), Command::Close);
    }

    #[test]
    fn pid_calibration_falls_back_to_accel() {
        let cmd = decode(r#"{"key":"pid-calibration","data":{"pid":"whatever","axis":"Z","p":1,"i":2,"d":3}}"#);
        let Command::PidCalibration(cal) = cmd else { panic!("wrong command: {:?}", cmd) };
        assert_eq!(cal.pid, PidLevel::Accel);
        assert_eq!(cal.axis.index(), 2);
        assert_eq!((cal.p, cal.i, cal.d), (1.0, 2.0, 3.0));

        let cmd = decode(r#"{"key":"pid-calibration","data":{"pid":"ang-speed","axis":"X","p":0,"i":0,"d":0}}"#);
        assert!(matches!(cmd, Command::PidCalibration(PidCalibration { pid: PidLevel::AngSpeed, axis: Axis::X, .. })));
    }

    #[test]
    fn missing_key_is_a_parse_error() {
        assert!(Request::parse_line(r#"{"data":1}"#).is_err());
        assert!(Request::parse_line("not json").is_err());
    }

    #[test]
    fn bad_data_shape_is_rejected_per_command() {
        let req = Request::parse_line(r#"{"key":"target","data":[1,2,3]}"#).unwrap();
        assert!(Command::try_from(req).is_err());
    }

    #[test]
    fn unknown_key_is_kept() {
        assert_eq!(decode(r#"{"key":"integrals","data":true}"#), Command::Unknown("integrals".into()));
    }

    #[test]
    fn response_lines() {
        let line = Response::ok(KEY_READ_DRONE_STATE, json!({"a": 1})).to_line().unwrap();
        assert_eq!(line, "{\"key\":\"read-drone-state\",\"response\":{\"a\":1}}\n");

        let line = Response::error(KEY_TARGET, "boom").to_line().unwrap();
        assert_eq!(line, "{\"key\":\"target\",\"error\":\"boom\"}\n");
    }
}
