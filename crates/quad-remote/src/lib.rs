pub mod doctor;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use quad_flight::FlightController;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub listen: String,

    /// Pilot input scaling for the `target` command, at 100%.
    /// x/y angles (degrees)
    pub max_angle: f64,
    /// z angle speed (degrees/second)
    pub max_angle_speed: f64,
    /// z acceleration (m/s²)
    pub max_accel_z: f64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2121".into(),
            max_angle: 2.0,
            max_angle_speed: 20.0,
            max_accel_z: 0.5,
        }
    }
}

/// Remote-control endpoint. Each connection is a session; the controller is
/// started with the first live session and stopped when the last one ends.
pub struct Server {
    controller: Arc<FlightController>,
    cfg: RemoteConfig,
    drone_config: Arc<Value>,
    sessions: Mutex<usize>,
}

impl Server {
    /// `drone_config` is returned verbatim to `read-drone-config`.
    pub fn new(controller: Arc<FlightController>, cfg: RemoteConfig, drone_config: Value) -> Self {
        Self { controller, cfg, drone_config: Arc::new(drone_config), sessions: Mutex::new(0) }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.cfg
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.cfg.listen)
            .await
            .with_context(|| format!("bind {}", self.cfg.listen))?;
        info!("remote: listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accept remote connection")?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, peer).await {
                    warn!("remote: session {} failed: {:#}", peer, e);
                }
            });
        }
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        self.open_session().await?;
        info!("remote: {} connected, waiting for commands", peer);

        let last = session::run(&self, stream, peer).await;
        info!("remote: {} connection end", peer);

        // other sessions may keep the controller up, the motors still go idle
        let disarmed = if last.is_piloting() { self.disarm(peer).await } else { Ok(()) };
        self.close_session().await?;
        disarmed
    }

    async fn disarm(&self, peer: SocketAddr) -> Result<()> {
        warn!("remote: {} left while armed, disarming", peer);
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || {
            controller.stop_pid();
            controller.idle()
        })
        .await
        .context("disarm worker")?
        .context("disarm flight controller")
    }

    async fn open_session(&self) -> Result<()> {
        let mut live = self.sessions.lock().await;
        if *live == 0 {
            let controller = self.controller.clone();
            tokio::task::spawn_blocking(move || controller.start())
                .await
                .context("controller start worker")?
                .context("start flight controller")?;
        }
        *live += 1;
        Ok(())
    }

    async fn close_session(&self) -> Result<()> {
        let mut live = self.sessions.lock().await;
        *live = live.saturating_sub(1);
        if *live == 0 {
            let controller = self.controller.clone();
            tokio::task::spawn_blocking(move || controller.stop())
                .await
                .context("controller stop worker")?
                .context("stop flight controller")?;
        }
        Ok(())
    }
}
