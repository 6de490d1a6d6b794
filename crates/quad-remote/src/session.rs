use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use quad_flight::FlightController;
use quad_proto::wire::{Command, PidCalibration, PidLevel, Request, Response};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{RemoteConfig, Server};

const OUTBOX_DEPTH: usize = 32;

/// Per-connection pilot state.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    started: bool,
    throttle_by_user: bool,
    throttle: f64,
    closed: bool,
}

impl SessionState {
    /// Whether the connection left the motors under its control.
    pub(crate) fn is_piloting(&self) -> bool {
        self.started || self.throttle_by_user
    }
}

struct Dispatcher {
    controller: Arc<FlightController>,
    cfg: RemoteConfig,
    drone_config: Arc<Value>,
    state: Mutex<SessionState>,
}

/// Reads commands until `close`, EOF or a malformed line. Every other command
/// runs on its own blocking worker; replies go through a single writer task.
/// Returns the pilot state the connection ended with; commands still in flight
/// afterwards see a closed, unarmed session.
pub(crate) async fn run(server: &Server, stream: TcpStream, peer: SocketAddr) -> SessionState {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Response>(OUTBOX_DEPTH);
    tokio::spawn(write_loop(writer, rx, peer));

    let dispatcher = Arc::new(Dispatcher {
        controller: server.controller.clone(),
        cfg: server.cfg.clone(),
        drone_config: server.drone_config.clone(),
        state: Mutex::new(SessionState::default()),
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("remote: {} read failed: {}", peer, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let req = match Request::parse_line(line) {
            Ok(req) => req,
            Err(e) => {
                error!("remote: {} dispatching error, closing: {}", peer, e);
                break;
            }
        };
        debug!("remote: {} received key '{}' data {}", peer, req.key, req.data);

        let key = req.key.clone();
        let cmd = match Command::try_from(req) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("remote: {} bad data for '{}': {}", peer, key, e);
                let _ = tx.send(Response::error(key, format!("bad data: {}", e))).await;
                continue;
            }
        };

        match cmd {
            Command::Close => break,
            Command::Unknown(key) => {
                warn!("remote: {} unknown key '{}' ignored", peer, key);
            }
            cmd => {
                let dispatcher = dispatcher.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let key = cmd.key().to_string();
                    let reply = match tokio::task::spawn_blocking(move || dispatcher.dispatch(cmd)).await {
                        Ok(Ok(Some(value))) => Response::ok(key, value),
                        Ok(Ok(None)) => return,
                        Ok(Err(e)) => {
                            warn!("remote: '{}' failed: {:#}", key, e);
                            Response::error(key, format!("{:#}", e))
                        }
                        Err(e) => Response::error(key, format!("worker failed: {}", e)),
                    };
                    let _ = tx.send(reply).await;
                });
            }
        }
    }

    let mut st = dispatcher.state();
    let last = std::mem::take(&mut *st);
    st.closed = true;
    last
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Response>, peer: SocketAddr) {
    while let Some(reply) = rx.recv().await {
        let line = match reply.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("remote: cannot serialize reply to '{}': {}", reply.key, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("remote: {} write failed: {}", peer, e);
            break;
        }
    }
}

impl Dispatcher {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one command. `Some` values are sent back as the response.
    fn dispatch(&self, cmd: Command) -> Result<Option<Value>> {
        match cmd {
            Command::Target(data) => self.target(data)?,
            Command::Throttle(value) => self.throttle(value)?,
            Command::IsStarted(started) => self.is_started(started)?,
            Command::PidCalibration(cal) => self.pid_calibration(&cal)?,
            Command::ReadDroneConfig => return Ok(Some(self.drone_config.as_ref().clone())),
            Command::ReadDroneState => {
                let state = self.controller.read_state()?;
                return Ok(Some(serde_json::to_value(state)?));
            }
            Command::Close | Command::Unknown(_) => {}
        }
        Ok(None)
    }

    fn target(&self, data: [f64; 4]) -> Result<()> {
        anyhow::ensure!(
            data.iter().all(|v| (-100.0..=100.0).contains(v)),
            "target values must be within [-100, 100], got {:?}",
            data
        );
        if !self.state().started {
            debug!("remote: target ignored, not started");
            return Ok(());
        }
        let targets = [
            data[0] * self.cfg.max_angle / 100.0,
            data[1] * self.cfg.max_angle / 100.0,
            data[2] * self.cfg.max_angle_speed / 100.0,
            data[3] * self.cfg.max_accel_z / 100.0,
        ];
        #[allow(deprecated)]
        self.controller.set_targets(targets)?;
        Ok(())
    }

    fn throttle(&self, value: f64) -> Result<()> {
        anyhow::ensure!((0.0..=100.0).contains(&value), "throttle must be within [0, 100], got {}", value);
        let mut st = self.state();
        if !st.started {
            debug!("remote: throttle ignored, not started");
            return Ok(());
        }

        if !st.throttle_by_user {
            // manual throttle from now on, z-accel loop off
            self.controller.alter_pid_accel_constants(2, 0.0, 0.0, 0.0)?;
            st.throttle = 0.0;
            self.controller.stand_by()?;
            st.throttle_by_user = true;
            info!("remote: throttle under user control");
        }

        if value > 0.0 {
            let delta = value - st.throttle;
            if delta != 0.0 {
                st.throttle = value;
                self.controller.add_throttle(delta)?;
            }
        } else {
            st.throttle = 0.0;
            self.controller.stand_by()?;
        }
        Ok(())
    }

    fn is_started(&self, started: bool) -> Result<()> {
        let mut st = self.state();
        if st.closed {
            debug!("remote: is-started ignored, session closed");
            return Ok(());
        }
        st.started = started;
        st.throttle = 0.0;
        if started {
            info!("remote: armed");
            self.controller.stand_by()?;
            self.controller.start_pid()?;
        } else {
            info!("remote: disarmed");
            self.controller.stop_pid();
            self.controller.idle()?;
        }
        Ok(())
    }

    fn pid_calibration(&self, cal: &PidCalibration) -> Result<()> {
        let axis = cal.axis.index();
        match cal.pid {
            PidLevel::AngSpeed => self.controller.alter_pid_angles_speed_constants(axis, cal.p, cal.i, cal.d)?,
            PidLevel::Angles => self.controller.alter_pid_angles_constants(axis, cal.p, cal.i, cal.d)?,
            PidLevel::Accel => self.controller.alter_pid_accel_constants(axis, cal.p, cal.i, cal.d)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use std::sync::mpsc as std_mpsc;

    use quad_flight::motor::dummy_set;
    use quad_flight::sensor::{Axes, DummySensor, Sensor};
    use quad_flight::{Driver, FlightConfig, PidConfig};
    use serde_json::json;
    use tokio::io::Lines;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout, Instant};

    const WAIT: Duration = Duration::from_secs(2);

    async fn spawn_server(sensor: impl Sensor + 'static) -> (SocketAddr, Arc<FlightController>) {
        let cfg = FlightConfig { pid_period_s: 0.004, ..FlightConfig::default() };
        let controller = Arc::new(
            FlightController::new(cfg, &PidConfig::default(), Arc::new(sensor), Driver::new(dummy_set())).unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(
            controller.clone(),
            RemoteConfig { listen: addr.to_string(), ..RemoteConfig::default() },
            json!({"flight": {"pid_period_s": 0.004}}),
        ));
        tokio::spawn(server.serve(listener));
        (addr, controller)
    }

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self { lines: BufReader::new(reader).lines(), writer }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, key: &str, data: Value) {
            self.send_raw(&json!({"key": key, "data": data}).to_string()).await;
        }

        async fn recv(&mut self) -> Option<Value> {
            let line = timeout(WAIT, self.lines.next_line()).await.unwrap().unwrap()?;
            Some(serde_json::from_str(&line).unwrap())
        }

        async fn state(&mut self) -> Value {
            self.send("read-drone-state", Value::Null).await;
            let reply = self.recv().await.unwrap();
            assert_eq!(reply["key"], "read-drone-state");
            reply["response"].clone()
        }
    }

    /// IMU whose angle reads hang until released.
    struct StallingSensor {
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl Sensor for StallingSensor {
        fn start(&self) -> quad_flight::Result<()> {
            Ok(())
        }

        fn calibrate(&self) -> quad_flight::Result<()> {
            Ok(())
        }

        fn stop(&self) -> quad_flight::Result<()> {
            Ok(())
        }

        fn refresh_state(&self) -> quad_flight::Result<()> {
            Ok(())
        }

        fn reset_gyro_read_time(&self) {}

        fn read_angles(&self) -> quad_flight::Result<Axes> {
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok([0.0; 3])
        }

        fn read_angle_speeds(&self) -> quad_flight::Result<Axes> {
            Ok([0.0; 3])
        }

        fn read_accels(&self) -> quad_flight::Result<Axes> {
            Ok([0.0; 3])
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn state_replaces_yaw_with_yaw_rate() {
        let (addr, _controller) = spawn_server(DummySensor::fixed([1.0, 2.0, 3.0], [7.0, 8.0, 9.0], [4.0, 5.0, 6.0])).await;
        let mut c = Client::connect(addr).await;

        let state = c.state().await;
        assert_eq!(state["angles"], json!([1.0, 2.0, 9.0]));
        assert_eq!(state["accels"], json!([4.0, 5.0, 6.0]));
        assert_eq!(state["throttles"], json!([0.0, 0.0, 0.0, 0.0]));
        assert!(state.get("currentPeriod").is_some());
    }

    #[tokio::test]
    async fn config_is_echoed() {
        let (addr, _controller) = spawn_server(DummySensor::default()).await;
        let mut c = Client::connect(addr).await;
        c.send("read-drone-config", Value::Null).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply["response"]["flight"]["pid_period_s"], json!(0.004));
    }

    #[tokio::test]
    async fn malformed_line_closes_only_that_connection() {
        let (addr, _controller) = spawn_server(DummySensor::default()).await;
        let mut good = Client::connect(addr).await;
        let mut bad = Client::connect(addr).await;

        bad.send_raw("{not json").await;
        assert!(bad.recv().await.is_none());

        let state = good.state().await;
        assert_eq!(state["throttles"], json!([0.0, 0.0, 0.0, 0.0]));
    }

    #[tokio::test]
    async fn throttle_needs_arming() {
        let (addr, controller) = spawn_server(DummySensor::default()).await;
        let mut c = Client::connect(addr).await;

        c.send("throttle", json!(50.0)).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(c.state().await["throttles"], json!([0.0, 0.0, 0.0, 0.0]));

        c.send("is-started", json!(true)).await;
        wait_until(|| controller.is_pid_running()).await;

        c.send("throttle", json!(30.0)).await;
        let deadline = Instant::now() + WAIT;
        loop {
            if c.state().await["throttles"] == json!([30.0, 30.0, 30.0, 30.0]) {
                break;
            }
            assert!(Instant::now() < deadline, "throttle never reached the motors");
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(controller.pid_targets().gains(7).unwrap(), (0.0, 0.0, 0.0));
        // first manual throttle goes through stand-by, which stops the loop
        assert!(!controller.is_pid_running());

        c.send("is-started", json!(false)).await;
        wait_until(|| controller.driver().base_throttle() == 0.0).await;
    }

    #[tokio::test]
    async fn failing_calibration_replies_with_error() {
        let (addr, controller) = spawn_server(DummySensor::default()).await;
        let mut c = Client::connect(addr).await;

        c.send("pid-calibration", json!({"pid": "angles", "axis": "Z", "p": 1.0, "i": 0.0, "d": 0.0})).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply["key"], "pid-calibration");
        assert!(reply["error"].as_str().unwrap().contains("axis 2"));
        assert!(reply.get("response").is_none());

        c.send("pid-calibration", json!({"pid": "ang-speed", "axis": "Y", "p": 200.0, "i": 0.0, "d": 0.0})).await;
        wait_until(|| controller.pid_targets().gains(1).unwrap() == (0.2, 0.0, 0.0)).await;
    }

    #[tokio::test]
    async fn bad_data_keeps_the_connection() {
        let (addr, _controller) = spawn_server(DummySensor::default()).await;
        let mut c = Client::connect(addr).await;

        c.send("target", json!([1, 2])).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply["key"], "target");
        assert!(reply["error"].is_string());

        c.send("integrals", json!(true)).await;
        c.state().await;
    }

    #[tokio::test]
    async fn last_session_stops_the_controller() {
        let (addr, controller) = spawn_server(DummySensor::default()).await;
        let mut a = Client::connect(addr).await;
        let mut b = Client::connect(addr).await;
        a.state().await;
        b.state().await;
        assert!(controller.is_running());

        a.send("close", Value::Null).await;
        assert!(a.recv().await.is_none());
        sleep(Duration::from_millis(50)).await;
        assert!(controller.is_running());

        drop(b);
        wait_until(|| !controller.is_running()).await;
    }

    #[tokio::test]
    async fn slow_command_does_not_hold_back_later_lines() {
        let (release, rx) = std_mpsc::channel();
        let (addr, _controller) = spawn_server(StallingSensor { release: Mutex::new(rx) }).await;
        let mut c = Client::connect(addr).await;

        c.send("read-drone-state", Value::Null).await;
        c.send("read-drone-config", Value::Null).await;
        let first = c.recv().await.unwrap();
        assert_eq!(first["key"], "read-drone-config");

        release.send(()).unwrap();
        let second = c.recv().await.unwrap();
        assert_eq!(second["key"], "read-drone-state");
    }

    #[tokio::test]
    async fn pilot_disconnect_disarms_while_others_stay() {
        let (addr, controller) = spawn_server(DummySensor::default()).await;
        let mut observer = Client::connect(addr).await;
        observer.state().await;

        // armed, loop running
        let mut pilot = Client::connect(addr).await;
        pilot.state().await;
        pilot.send("is-started", json!(true)).await;
        wait_until(|| controller.is_pid_running()).await;
        drop(pilot);
        wait_until(|| !controller.is_pid_running()).await;
        assert!(controller.is_running());

        // manual throttle
        let mut pilot = Client::connect(addr).await;
        pilot.state().await;
        pilot.send("is-started", json!(true)).await;
        wait_until(|| controller.is_pid_running()).await;
        pilot.send("throttle", json!(40.0)).await;
        let deadline = Instant::now() + WAIT;
        while observer.state().await["throttles"] != json!([40.0, 40.0, 40.0, 40.0]) {
            assert!(Instant::now() < deadline, "throttle never reached the motors");
            sleep(Duration::from_millis(10)).await;
        }
        drop(pilot);
        wait_until(|| controller.driver().base_throttle() == 0.0).await;
        assert_eq!(observer.state().await["throttles"], json!([0.0, 0.0, 0.0, 0.0]));
        assert!(!controller.is_pid_running());
        assert!(controller.is_running());
    }

    #[tokio::test]
    async fn out_of_range_commands_are_rejected() {
        let (addr, controller) = spawn_server(DummySensor::default()).await;
        let mut c = Client::connect(addr).await;
        c.send("is-started", json!(true)).await;
        wait_until(|| controller.is_pid_running()).await;

        c.send("throttle", json!(500.0)).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply["key"], "throttle");
        assert!(reply["error"].as_str().unwrap().contains("[0, 100]"));
        assert_eq!(controller.driver().base_throttle(), 0.0);

        c.send("throttle", json!(-5.0)).await;
        assert_eq!(c.recv().await.unwrap()["key"], "throttle");

        c.send("target", json!([150.0, 0.0, 0.0, 0.0])).await;
        let reply = c.recv().await.unwrap();
        assert_eq!(reply["key"], "target");
        assert!(reply["error"].as_str().unwrap().contains("[-100, 100]"));
        assert_eq!(controller.pid_targets().targets()[0], 0.0);
    }
}
