use std::{error::Error, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use rinf::{DartSignal, RustSignal};
use time::OffsetDateTime;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{Instrument, error, info, info_span, instrument, warn};
use updater::{
    StatusStore, Updater,
    models::{BuildInfo, ThemeMode},
};

use crate::signals::{system::Toast, updater::*};

/// Connects the [`Updater`] to Dart: requests come in as Dart signals, every status
/// channel is mirrored out as a Rust signal.
pub struct UpdaterBridge {
    updater: Arc<Updater>,
}

impl UpdaterBridge {
    pub fn start(updater: Arc<Updater>) -> Result<Arc<Self>> {
        let bridge = Arc::new(Self { updater });
        bridge.forward_status()?;

        tokio::spawn({
            let bridge = bridge.clone();
            async move {
                bridge.receive_requests().await;
            }
            .instrument(info_span!("task_updater_requests"))
        });

        Ok(bridge)
    }

    async fn receive_requests(&self) {
        let start_download = StartDownloadRequest::get_dart_signal_receiver();
        let pause_download = PauseOrResumeDownloadRequest::get_dart_signal_receiver();
        let cancel_download = CancelDownloadRequest::get_dart_signal_receiver();
        let start_update = StartUpdateRequest::get_dart_signal_receiver();
        let pause_update = PauseUpdateRequest::get_dart_signal_receiver();
        let cancel_update = CancelUpdateRequest::get_dart_signal_receiver();
        let reset_all = ResetAllRequest::get_dart_signal_receiver();
        let local_upgrade = LocalUpgradeRequest::get_dart_signal_receiver();
        let build_info = BuildInfoReceived::get_dart_signal_receiver();
        let set_theme = SetThemeRequest::get_dart_signal_receiver();
        let set_refresh_interval = SetRefreshIntervalRequest::get_dart_signal_receiver();

        info!("Listening for updater requests");
        let updater = &self.updater;

        loop {
            tokio::select! {
                Some(_) = start_download.recv() => {
                    report("Failed to start download", updater.start_download().await);
                }
                Some(_) = pause_download.recv() => {
                    report("Failed to pause or resume download", updater.pause_or_resume_download().await);
                }
                Some(_) = cancel_download.recv() => {
                    report("Failed to cancel download", updater.cancel_download().await);
                }
                Some(_) = start_update.recv() => {
                    report("Failed to start update", updater.start_update());
                }
                Some(pack) = pause_update.recv() => {
                    updater.pause_or_resume_update(pack.message.pause);
                }
                Some(_) = cancel_update.recv() => {
                    report("Failed to cancel update", updater.cancel_update());
                }
                Some(_) = reset_all.recv() => {
                    report("Failed to reset updater", updater.reset_all().await);
                }
                Some(pack) = local_upgrade.recv() => {
                    let path = PathBuf::from(pack.message.path);
                    report("Failed to select local package", updater.setup_local_upgrade(&path));
                }
                Some(pack) = build_info.recv() => {
                    let result = build_info_from_signal(pack.message)
                        .and_then(|build| updater.apply_build_info(&build));
                    report("Failed to store build info", result);
                }
                Some(pack) = set_theme.recv() => {
                    let result = ThemeMode::try_from(pack.message.theme)
                        .map_err(anyhow::Error::msg)
                        .and_then(|mode| updater.set_theme(mode));
                    report("Failed to save theme", result);
                }
                Some(pack) = set_refresh_interval.recv() => {
                    report("Failed to save refresh interval", updater.set_refresh_interval(pack.message.days));
                }
                else => {
                    error!("All updater request channels closed");
                    break;
                }
            }
        }
    }

    /// Mirrors every status channel to Dart, starting with the current values.
    #[instrument(skip(self), err)]
    fn forward_status(&self) -> Result<()> {
        let store = self.updater.store();

        forward("global_status", store.subscribe_global_status()?, |phase| {
            GlobalStatusChanged { phase: (*phase).into() }.send_signal_to_dart();
        });
        forward("download_status", store.subscribe_download_status()?, |status| {
            if let Some(status) = status {
                DownloadStatusChanged::from(status).send_signal_to_dart();
            }
        });
        let mut submissions = self.updater.downloads().subscribe_submissions();
        tokio::spawn(
            async move {
                loop {
                    match submissions.recv().await {
                        Ok(handle) => {
                            DownloadJobSubmitted { handle: handle.to_string() }.send_signal_to_dart();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Missed download job submissions");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .instrument(info_span!("task_forward", channel = "download_submissions")),
        );
        forward("update_status", self.updater.updates().subscribe_status(), |status| {
            UpdateStatusChanged::from(status).send_signal_to_dart();
        });
        forward("build_info", store.subscribe_build_info()?, |build| {
            BuildInfoChanged {
                version: build.as_ref().map(|b| b.version.clone()),
                release_date: build.as_ref().map(|b| b.release_date.unix_timestamp()),
                file_size: build.as_ref().map(|b| b.file_size),
            }
            .send_signal_to_dart();
        });
        forward("local_upgrade_file", store.subscribe_local_upgrade_file()?, |path| {
            LocalUpgradeFileChanged { path: (!path.is_empty()).then(|| path.clone()) }
                .send_signal_to_dart();
        });

        let changes = WatchStream::new(store.subscribe_theme()?)
            .map(|_| ())
            .merge(WatchStream::new(store.subscribe_refresh_interval()?).map(|_| ()));
        let store = store.clone();
        tokio::spawn(
            async move {
                tokio::pin!(changes);
                while changes.next().await.is_some() {
                    match read_preferences(&store) {
                        Ok(event) => event.send_signal_to_dart(),
                        Err(e) => warn!(error = e.as_ref() as &dyn Error, "Failed to read preferences"),
                    }
                }
            }
            .instrument(info_span!("task_forward_preferences")),
        );
        Ok(())
    }
}

/// Sends `rx`'s current value and every later change through `send`.
fn forward<T, F>(name: &'static str, rx: watch::Receiver<T>, send: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut values = WatchStream::new(rx);
            while let Some(value) = values.next().await {
                send(&value);
            }
        }
        .instrument(info_span!("task_forward", channel = name)),
    );
}

fn read_preferences(store: &StatusStore) -> Result<PreferencesChanged> {
    Ok(PreferencesChanged::new(store.theme()?, store.refresh_interval_days()?))
}

fn build_info_from_signal(signal: BuildInfoReceived) -> Result<BuildInfo> {
    let release_date = OffsetDateTime::from_unix_timestamp(signal.release_date)
        .context("Invalid build release date")?;
    Ok(BuildInfo {
        version: signal.version,
        release_date,
        url: signal.url,
        file_name: signal.file_name,
        file_size: signal.file_size,
        checksum: signal.checksum.to_lowercase(),
    })
}

/// Logs a failed command and shows it to the user.
fn report(action: &str, result: Result<()>) {
    if let Err(e) = result {
        error!(error = e.as_ref() as &dyn Error, "{action}");
        Toast::send(action.to_string(), format!("{e:#}"), true, None);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn signal(release_date: i64) -> BuildInfoReceived {
        BuildInfoReceived {
            version: "2.1".into(),
            release_date,
            url: "https://ota.example.com/ota.zip".into(),
            file_name: "ota.zip".into(),
            file_size: 2_000_000,
            checksum: "ABC123".into(),
        }
    }

    #[test]
    fn build_info_conversion() {
        let build = build_info_from_signal(signal(1_714_564_800)).unwrap();
        assert_eq!(build.release_date, time::macros::datetime!(2024-05-01 12:00 UTC));
        assert_eq!(build.checksum, "abc123");
        assert_eq!(build.file_size, 2_000_000);
    }

    #[test]
    fn out_of_range_release_date_is_rejected() {
        assert!(build_info_from_signal(signal(i64::MAX)).is_err());
    }
}
