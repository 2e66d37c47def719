use std::{path::Path, sync::Arc};

use anyhow::Result;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::{
    DownloadOrchestrator, StatusStore, UpdateOrchestrator,
    models::{BuildInfo, GlobalStatus, ThemeMode},
};

/// Command surface of the updater. Commands that span both orchestrators, or that move
/// the global status on behalf of the UI, live here; everything else is delegation.
pub struct Updater {
    store: Arc<StatusStore>,
    downloads: Arc<DownloadOrchestrator>,
    updates: Arc<UpdateOrchestrator>,
}

impl Updater {
    pub fn new(
        store: Arc<StatusStore>,
        downloads: Arc<DownloadOrchestrator>,
        updates: Arc<UpdateOrchestrator>,
    ) -> Self {
        Self { store, downloads, updates }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn downloads(&self) -> &Arc<DownloadOrchestrator> {
        &self.downloads
    }

    pub fn updates(&self) -> &Arc<UpdateOrchestrator> {
        &self.updates
    }

    /// Records a newly offered build and makes it available for download.
    #[instrument(skip(self, build_info), fields(version = %build_info.version), err)]
    pub fn apply_build_info(&self, build_info: &BuildInfo) -> Result<()> {
        self.store.set_build_info(build_info)?;
        self.store.set_entry_date(OffsetDateTime::now_utc())?;
        self.store.set_global_status(GlobalStatus::DownloadPending)
    }

    /// Selects a package already on disk, skipping the download phase.
    #[instrument(skip(self), err)]
    pub fn setup_local_upgrade(&self, path: &Path) -> Result<()> {
        self.store.set_local_upgrade_file(&path.to_string_lossy())?;
        self.store.set_global_status(GlobalStatus::UpdatePending)
    }

    #[instrument(skip(self), err)]
    pub async fn start_download(&self) -> Result<()> {
        self.downloads.clear_cache().await?;
        if self.downloads.start().await?.is_none() {
            info!("No build to download");
            return Ok(());
        }
        self.store.set_global_status(GlobalStatus::Downloading)
    }

    pub async fn pause_or_resume_download(&self) -> Result<()> {
        self.downloads.pause_or_resume().await
    }

    pub async fn cancel_download(&self) -> Result<()> {
        self.downloads.cancel().await
    }

    pub fn start_update(&self) -> Result<()> {
        self.updates.start()
    }

    pub fn pause_or_resume_update(&self, pause: bool) {
        self.updates.pause(pause);
    }

    pub fn cancel_update(&self) -> Result<()> {
        self.updates.cancel()
    }

    /// Forgets everything about the current offer: download, update and build.
    #[instrument(skip(self), err)]
    pub async fn reset_all(&self) -> Result<()> {
        self.downloads.discard().await?;
        self.updates.user_initiated_reset();
        self.store.delete_global_status()?;
        self.store.delete_build_info()?;
        info!("Updater state reset");
        Ok(())
    }

    /// Reconciles persisted state after a process restart. The update engine was reset when
    /// the orchestrator was built, so an update cannot still be running.
    #[instrument(skip(self), err)]
    pub async fn recover(&self) -> Result<()> {
        self.downloads.recover().await?;
        if self.store.global_status()? == GlobalStatus::Updating {
            info!("Update was interrupted, back to update pending");
            self.store.set_global_status(GlobalStatus::UpdatePending)?;
        }
        Ok(())
    }

    pub fn set_theme(&self, mode: ThemeMode) -> Result<()> {
        self.store.set_theme(mode)
    }

    pub fn set_refresh_interval(&self, days: u32) -> Result<()> {
        self.store.set_refresh_interval_days(days)
    }
}
