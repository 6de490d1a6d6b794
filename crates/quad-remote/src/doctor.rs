use anyhow::{Context, Result};
use std::net::SocketAddr;

use crate::RemoteConfig;

pub fn check_remote(cfg: &RemoteConfig) -> Result<()> {
    cfg.listen
        .parse::<SocketAddr>()
        .with_context(|| format!("remote.listen is not an address: {}", cfg.listen))?;
    anyhow::ensure!(cfg.max_angle > 0.0, "remote.max_angle must be positive");
    anyhow::ensure!(cfg.max_angle_speed > 0.0, "remote.max_angle_speed must be positive");
    anyhow::ensure!(cfg.max_accel_z >= 0.0, "remote.max_accel_z must not be negative");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_must_parse() {
        check_remote(&RemoteConfig::default()).unwrap();
        let cfg = RemoteConfig { listen: "drone:2121".into(), ..RemoteConfig::default() };
        assert!(check_remote(&cfg).is_err());
    }
}
