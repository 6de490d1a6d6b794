use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quad_flight::{doctor as flight_doctor, FlightConfig, FlightController, Hardware, HardwareConfig, PidConfig};
use quad_proto::telemetry::TelemetrySnapshot;
use quad_remote::{doctor as remote_doctor, RemoteConfig, Server};

#[derive(Debug, Parser)]
#[command(name = "quad", version, about = "quadctl - quadcopter stabilization core and remote-control server")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve remote-control sessions until Ctrl-C.
    Run,
    Doctor,
    /// Arm locally, hold a throttle and report loop statistics.
    Bench {
        #[arg(long, default_value_t = 5)]
        secs: u64,
        #[arg(long, default_value_t = 20.0)]
        throttle: f64,
    },
    /// Print the resolved configuration as JSON.
    Config,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    flight: FlightConfig,
    pid: PidConfig,
    hardware: HardwareConfig,
    remote: RemoteConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

fn build_controller(cfg: &Config) -> Result<Arc<FlightController>> {
    flight_doctor::check_flight(&cfg.flight).context("invalid [flight] config")?;
    flight_doctor::check_pid(&cfg.pid).context("invalid [pid] config")?;
    flight_doctor::check_hardware(&cfg.hardware).context("invalid [hardware] config")?;
    let (sensor, driver) = Hardware::build(&cfg.hardware).context("hardware setup")?.into_parts();
    let controller = FlightController::new(cfg.flight.clone(), &cfg.pid, sensor, driver).context("flight controller")?;
    Ok(Arc::new(controller))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Run => run(cfg).await?,
        Command::Doctor => doctor(&cfg)?,
        Command::Bench { secs, throttle } => bench(cfg, secs, throttle).await?,
        Command::Config => println!("{}", serde_json::to_string_pretty(&cfg)?),
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    flight_doctor::check_flight(&cfg.flight)?;
    flight_doctor::check_pid(&cfg.pid)?;
    flight_doctor::check_hardware(&cfg.hardware)?;
    remote_doctor::check_remote(&cfg.remote)?;

    if cfg.flight.pid_throttle_threshold == 0.0 {
        warn!("doctor: pid_throttle_threshold is 0, the loop only starts on arming");
    }
    info!("doctor: OK");
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    info!("run: starting");
    remote_doctor::check_remote(&cfg.remote).context("invalid [remote] config")?;
    let controller = build_controller(&cfg)?;
    let drone_config = serde_json::to_value(&cfg).context("serialize configuration")?;
    let server = Arc::new(Server::new(controller.clone(), cfg.remote.clone(), drone_config));
    let listener = server.bind().await?;

    tokio::select! {
        res = server.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("run: interrupted"),
    }

    tokio::task::spawn_blocking(move || controller.stop())
        .await
        .context("shutdown worker")?
        .context("stop flight controller")?;
    info!("run: stopped");
    Ok(())
}

async fn bench(cfg: Config, secs: u64, throttle: f64) -> Result<()> {
    anyhow::ensure!((0.0..=100.0).contains(&throttle), "--throttle must be 0..100");
    let controller = build_controller(&cfg)?;

    let snapshot: TelemetrySnapshot = tokio::task::spawn_blocking(move || -> Result<TelemetrySnapshot> {
        controller.start()?;
        controller.stand_by()?;
        controller.start_pid()?;
        controller.add_throttle(throttle)?;
        info!("bench: holding throttle {} for {}s", throttle, secs);

        std::thread::sleep(Duration::from_secs(secs));

        let snapshot = controller.read_state()?;
        controller.stop()?;
        match controller.loop_stats() {
            Some(stats) => println!(
                "ticks={} avg_compute_ms={:.3} avg_freq_hz={:.1} in_range={} acceptable={} under_rate={} over_rate={}",
                stats.ticks,
                stats.avg_compute_ms(),
                stats.avg_frequency_hz(),
                stats.in_range,
                stats.acceptable,
                stats.under_rate,
                stats.over_rate
            ),
            None => println!("ticks=0 (pid did not run)"),
        }
        Ok(snapshot)
    })
    .await
    .context("bench worker")??;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
