use std::{error::Error, path::Path, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{BatteryReading, BatterySensor, parse_dumpsys_battery};
use crate::utils::resolve_binary_path;

/// Polls `dumpsys battery` and feeds the readings into a [`BatterySensor`].
#[derive(Debug)]
pub struct BatteryMonitor {
    token: CancellationToken,
}

impl BatteryMonitor {
    /// Starts polling. When `dumpsys` can't be found the sensor is left at its current
    /// state and no task is spawned.
    #[instrument(skip(sensor))]
    pub fn spawn(sensor: Arc<BatterySensor>, dumpsys_path: &str, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let bin = match resolve_binary_path(dumpsys_path) {
            Ok(bin) => bin,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Battery monitoring disabled");
                return Self { token };
            }
        };
        info!(path = %bin.display(), ?interval, "Starting battery monitor");

        tokio::spawn({
            let token = token.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match read_battery(&bin).await {
                        Ok(Some(reading)) => {
                            trace!(?reading, "Battery reading");
                            sensor.update(reading);
                        }
                        Ok(None) => debug!("Unparsable battery dump, keeping last state"),
                        Err(e) => {
                            warn!(error = e.as_ref() as &dyn Error, "Failed to read battery state")
                        }
                    }
                }
                debug!("Battery monitor stopped");
            }
        });

        Self { token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for BatteryMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn read_battery(bin: &Path) -> Result<Option<BatteryReading>> {
    let output = Command::new(bin)
        .arg("battery")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to run dumpsys")?;
    ensure!(output.status.success(), "dumpsys exited with status: {}", output.status);
    Ok(parse_dumpsys_battery(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn polls_fake_dumpsys() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("dumpsys");
        std::fs::write(&script, "#!/bin/sh\nprintf '  AC powered: false\\n  level: 12\\n  scale: 100\\n'\n")
            .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sensor = Arc::new(BatterySensor::new(30));
        let gate = sensor.gate();
        let mut rx = gate.subscribe();
        let monitor = BatteryMonitor::spawn(
            sensor.clone(),
            script.to_str().unwrap(),
            Duration::from_millis(50),
        );

        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap().unwrap();
        assert!(!gate.is_safe());
        monitor.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_binary_leaves_gate_alone() {
        let sensor = Arc::new(BatterySensor::new(30));
        let _monitor =
            BatteryMonitor::spawn(sensor.clone(), "/nonexistent/dumpsys", Duration::from_secs(1));
        assert!(sensor.gate().is_safe());
    }
}
