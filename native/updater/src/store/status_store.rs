use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use super::{Prefs, keys};
use crate::models::{
    BuildInfo, DEFAULT_REFRESH_INTERVAL_DAYS, DownloadStatus, GlobalStatus, JobHandle,
    StatusCode, ThemeMode,
};

/// Persisted pipeline state with a replay-latest broadcast channel per field.
///
/// Writes go to disk first and are published afterwards, both under one lock, so
/// subscribers of a field observe values in the order they were set. Reads hydrate the
/// field from disk on first access and are served from the channel's cached value after
/// that.
#[derive(Debug)]
pub struct StatusStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    prefs: Prefs,
    build_info: Field<Option<BuildInfo>>,
    global_status: Field<GlobalStatus>,
    download_status: Field<Option<DownloadStatus>>,
    download_id: Field<Option<JobHandle>>,
    entry_date: Field<Option<OffsetDateTime>>,
    local_upgrade_file: Field<String>,
    theme: Field<ThemeMode>,
    refresh_interval_days: Field<u32>,
}

/// Last published value of a field plus its subscribers.
#[derive(Debug)]
struct Field<T> {
    tx: watch::Sender<T>,
    hydrated: bool,
}

impl<T: Clone> Field<T> {
    fn new(initial: T) -> Self {
        Self { tx: watch::Sender::new(initial), hydrated: false }
    }

    fn get(&mut self, prefs: &Prefs, load: fn(&Prefs) -> Result<T>) -> Result<T> {
        if !self.hydrated {
            let value = load(prefs)?;
            self.tx.send_replace(value);
            self.hydrated = true;
        }
        Ok(self.tx.borrow().clone())
    }

    fn publish(&mut self, value: T) {
        self.tx.send_replace(value);
        self.hydrated = true;
    }

    fn subscribe(
        &mut self,
        prefs: &Prefs,
        load: fn(&Prefs) -> Result<T>,
    ) -> Result<watch::Receiver<T>> {
        self.get(prefs, load)?;
        Ok(self.tx.subscribe())
    }
}

impl StatusStore {
    #[instrument(err)]
    pub fn open(path: &Path) -> Result<Self> {
        let prefs = Prefs::open(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                prefs,
                build_info: Field::new(None),
                global_status: Field::new(GlobalStatus::Unknown),
                download_status: Field::new(None),
                download_id: Field::new(None),
                entry_date: Field::new(None),
                local_upgrade_file: Field::new(String::new()),
                theme: Field::new(ThemeMode::default()),
                refresh_interval_days: Field::new(DEFAULT_REFRESH_INTERVAL_DAYS),
            }),
        })
    }

    // Build info

    pub fn build_info(&self) -> Result<Option<BuildInfo>> {
        let inner = &mut *self.inner.lock();
        inner.build_info.get(&inner.prefs, load_build_info)
    }

    #[instrument(skip(self), fields(version = %build_info.version), err)]
    pub fn set_build_info(&self, build_info: &BuildInfo) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .put(keys::BUILD_VERSION, build_info.version.as_str())
            .put(keys::BUILD_DATE, build_info.release_date.unix_timestamp())
            .put(keys::BUILD_URL, build_info.url.as_str())
            .put(keys::BUILD_FILE_NAME, build_info.file_name.as_str())
            .put(keys::BUILD_FILE_SIZE, build_info.file_size)
            .put(keys::BUILD_MD5, build_info.checksum.as_str())
            .commit()
            .context("Failed to persist build info")?;
        inner.build_info.publish(Some(build_info.clone()));
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub fn delete_build_info(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        keys::BUILD_INFO
            .iter()
            .fold(inner.prefs.edit(), |edit, key| edit.remove(key))
            .commit()
            .context("Failed to delete build info")?;
        inner.build_info.publish(None);
        Ok(())
    }

    pub fn subscribe_build_info(&self) -> Result<watch::Receiver<Option<BuildInfo>>> {
        let inner = &mut *self.inner.lock();
        inner.build_info.subscribe(&inner.prefs, load_build_info)
    }

    // Global status

    pub fn global_status(&self) -> Result<GlobalStatus> {
        let inner = &mut *self.inner.lock();
        inner.global_status.get(&inner.prefs, load_global_status)
    }

    #[instrument(skip(self), err)]
    pub fn set_global_status(&self, status: GlobalStatus) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .put(keys::GLOBAL_STATUS, status.code())
            .commit()
            .context("Failed to persist global status")?;
        debug!(?status, "Global status changed");
        inner.global_status.publish(status);
        Ok(())
    }

    /// Forgets the current offer: global status, entry date and local upgrade file.
    #[instrument(skip(self), err)]
    pub fn delete_global_status(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .remove(keys::GLOBAL_STATUS)
            .remove(keys::ENTRY_DATE)
            .remove(keys::LOCAL_UPGRADE_FILE)
            .commit()
            .context("Failed to delete global status")?;
        inner.global_status.publish(GlobalStatus::Unknown);
        inner.entry_date.publish(None);
        inner.local_upgrade_file.publish(String::new());
        Ok(())
    }

    pub fn subscribe_global_status(&self) -> Result<watch::Receiver<GlobalStatus>> {
        let inner = &mut *self.inner.lock();
        inner.global_status.subscribe(&inner.prefs, load_global_status)
    }

    // Download status

    pub fn download_status(&self) -> Result<Option<DownloadStatus>> {
        let inner = &mut *self.inner.lock();
        inner.download_status.get(&inner.prefs, load_download_status)
    }

    pub fn download_status_code(&self) -> Result<StatusCode> {
        Ok(self.download_status()?.map(|s| s.status).unwrap_or_default())
    }

    /// Sets the download status code, creating the status if there is none yet.
    #[instrument(skip(self), err)]
    pub fn set_download_status(&self, status: StatusCode) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let mut current = inner
            .download_status
            .get(&inner.prefs, load_download_status)?
            .unwrap_or_default();
        if current.total_bytes == 0 {
            current.total_bytes = inner.prefs.get(keys::BUILD_FILE_SIZE)?.unwrap_or_default();
        }
        current.status = status;

        inner
            .prefs
            .edit()
            .put(keys::DOWNLOAD_STATUS, status.code())
            .commit()
            .context("Failed to persist download status")?;
        debug!(?status, "Download status changed");
        inner.download_status.publish(Some(current));
        Ok(())
    }

    /// Records download progress. Returns `false` without touching anything when no
    /// download status exists, which is the case for late reports after a reset.
    pub fn set_download_progress(&self, downloaded_bytes: u64, percent: u8) -> Result<bool> {
        let inner = &mut *self.inner.lock();
        let Some(mut current) = inner.download_status.get(&inner.prefs, load_download_status)?
        else {
            trace!(downloaded_bytes, percent, "No download status, ignoring progress");
            return Ok(false);
        };
        current.apply_progress(downloaded_bytes, percent);

        inner
            .prefs
            .edit()
            .put(keys::DOWNLOADED_SIZE, current.downloaded_bytes)
            .put(keys::DOWNLOADED_PERCENT, current.progress)
            .commit()
            .context("Failed to persist download progress")?;
        inner.download_status.publish(Some(current));
        Ok(true)
    }

    /// Replaces the download status with a fresh zero value.
    #[instrument(skip(self), err)]
    pub fn delete_download_status(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .remove(keys::DOWNLOAD_STATUS)
            .remove(keys::DOWNLOADED_SIZE)
            .remove(keys::DOWNLOADED_PERCENT)
            .commit()
            .context("Failed to delete download status")?;
        let total = inner.prefs.get(keys::BUILD_FILE_SIZE)?.unwrap_or_default();
        inner.download_status.publish(Some(DownloadStatus::with_total(total)));
        Ok(())
    }

    pub fn subscribe_download_status(&self) -> Result<watch::Receiver<Option<DownloadStatus>>> {
        let inner = &mut *self.inner.lock();
        inner.download_status.subscribe(&inner.prefs, load_download_status)
    }

    // Download job handle

    pub fn download_id(&self) -> Result<Option<JobHandle>> {
        let inner = &mut *self.inner.lock();
        inner.download_id.get(&inner.prefs, load_download_id)
    }

    #[instrument(skip(self), err)]
    pub fn set_download_id(&self, handle: Option<JobHandle>) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let edit = inner.prefs.edit();
        let edit = match handle {
            Some(handle) => edit.put(keys::DOWNLOAD_ID, handle.to_string()),
            None => edit.remove(keys::DOWNLOAD_ID),
        };
        edit.commit().context("Failed to persist download id")?;
        inner.download_id.publish(handle);
        Ok(())
    }

    pub fn subscribe_download_id(&self) -> Result<watch::Receiver<Option<JobHandle>>> {
        let inner = &mut *self.inner.lock();
        inner.download_id.subscribe(&inner.prefs, load_download_id)
    }

    // Entry date

    pub fn entry_date(&self) -> Result<Option<OffsetDateTime>> {
        let inner = &mut *self.inner.lock();
        inner.entry_date.get(&inner.prefs, load_entry_date)
    }

    #[instrument(skip(self), err)]
    pub fn set_entry_date(&self, date: OffsetDateTime) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .put(keys::ENTRY_DATE, date.unix_timestamp())
            .commit()
            .context("Failed to persist entry date")?;
        inner.entry_date.publish(Some(date));
        Ok(())
    }

    // Local upgrade file

    pub fn local_upgrade_file(&self) -> Result<String> {
        let inner = &mut *self.inner.lock();
        inner.local_upgrade_file.get(&inner.prefs, load_local_upgrade_file)
    }

    #[instrument(skip(self), err)]
    pub fn set_local_upgrade_file(&self, name: &str) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .put(keys::LOCAL_UPGRADE_FILE, name)
            .commit()
            .context("Failed to persist local upgrade file")?;
        inner.local_upgrade_file.publish(name.to_string());
        Ok(())
    }

    pub fn subscribe_local_upgrade_file(&self) -> Result<watch::Receiver<String>> {
        let inner = &mut *self.inner.lock();
        inner.local_upgrade_file.subscribe(&inner.prefs, load_local_upgrade_file)
    }

    // Preferences

    pub fn theme(&self) -> Result<ThemeMode> {
        let inner = &mut *self.inner.lock();
        inner.theme.get(&inner.prefs, load_theme)
    }

    #[instrument(skip(self), err)]
    pub fn set_theme(&self, mode: ThemeMode) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .put(keys::THEME, i64::from(mode))
            .commit()
            .context("Failed to persist theme")?;
        inner.theme.publish(mode);
        Ok(())
    }

    pub fn subscribe_theme(&self) -> Result<watch::Receiver<ThemeMode>> {
        let inner = &mut *self.inner.lock();
        inner.theme.subscribe(&inner.prefs, load_theme)
    }

    pub fn refresh_interval_days(&self) -> Result<u32> {
        let inner = &mut *self.inner.lock();
        inner.refresh_interval_days.get(&inner.prefs, load_refresh_interval)
    }

    #[instrument(skip(self), err)]
    pub fn set_refresh_interval_days(&self, days: u32) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner
            .prefs
            .edit()
            .put(keys::REFRESH_INTERVAL, days)
            .commit()
            .context("Failed to persist refresh interval")?;
        inner.refresh_interval_days.publish(days);
        Ok(())
    }

    pub fn subscribe_refresh_interval(&self) -> Result<watch::Receiver<u32>> {
        let inner = &mut *self.inner.lock();
        inner.refresh_interval_days.subscribe(&inner.prefs, load_refresh_interval)
    }
}

fn load_build_info(prefs: &Prefs) -> Result<Option<BuildInfo>> {
    // A record without a checksum is incomplete.
    let Some(checksum) = prefs.get::<String>(keys::BUILD_MD5)? else {
        return Ok(None);
    };
    let release_date = prefs.get::<i64>(keys::BUILD_DATE)?.unwrap_or_default();
    Ok(Some(BuildInfo {
        version: prefs.get(keys::BUILD_VERSION)?.unwrap_or_default(),
        release_date: OffsetDateTime::from_unix_timestamp(release_date)
            .context("Invalid stored build date")?,
        url: prefs.get(keys::BUILD_URL)?.unwrap_or_default(),
        file_name: prefs.get(keys::BUILD_FILE_NAME)?.unwrap_or_default(),
        file_size: prefs.get(keys::BUILD_FILE_SIZE)?.unwrap_or_default(),
        checksum,
    }))
}

fn load_global_status(prefs: &Prefs) -> Result<GlobalStatus> {
    Ok(prefs.get(keys::GLOBAL_STATUS)?.unwrap_or_default())
}

fn load_download_status(prefs: &Prefs) -> Result<Option<DownloadStatus>> {
    let Some(status) = prefs.get::<StatusCode>(keys::DOWNLOAD_STATUS)? else {
        return Ok(None);
    };
    let mut download_status =
        DownloadStatus::with_total(prefs.get(keys::BUILD_FILE_SIZE)?.unwrap_or_default());
    download_status.status = status;
    download_status.apply_progress(
        prefs.get(keys::DOWNLOADED_SIZE)?.unwrap_or_default(),
        prefs.get(keys::DOWNLOADED_PERCENT)?.unwrap_or_default(),
    );
    Ok(Some(download_status))
}

fn load_download_id(prefs: &Prefs) -> Result<Option<JobHandle>> {
    prefs.get(keys::DOWNLOAD_ID)
}

fn load_entry_date(prefs: &Prefs) -> Result<Option<OffsetDateTime>> {
    prefs
        .get::<i64>(keys::ENTRY_DATE)?
        .map(|ts| OffsetDateTime::from_unix_timestamp(ts).context("Invalid stored entry date"))
        .transpose()
}

fn load_local_upgrade_file(prefs: &Prefs) -> Result<String> {
    Ok(prefs.get(keys::LOCAL_UPGRADE_FILE)?.unwrap_or_default())
}

fn load_theme(prefs: &Prefs) -> Result<ThemeMode> {
    Ok(prefs.get(keys::THEME)?.unwrap_or_default())
}

fn load_refresh_interval(prefs: &Prefs) -> Result<u32> {
    Ok(prefs.get(keys::REFRESH_INTERVAL)?.unwrap_or(DEFAULT_REFRESH_INTERVAL_DAYS))
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};
    use test_log::test;

    use super::*;
    use crate::testing::{block_writes, sample_build_info};

    fn open() -> (TempDir, StatusStore) {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(&dir.path().join("status.json")).unwrap();
        (dir, store)
    }

    fn reopen(dir: &TempDir) -> StatusStore {
        StatusStore::open(&dir.path().join("status.json")).unwrap()
    }

    #[test]
    fn build_info_survives_restart() {
        let (dir, store) = open();
        assert_eq!(store.build_info().unwrap(), None);

        let info = sample_build_info();
        store.set_build_info(&info).unwrap();
        assert_eq!(reopen(&dir).build_info().unwrap(), Some(info));

        store.delete_build_info().unwrap();
        assert_eq!(store.build_info().unwrap(), None);
        assert_eq!(reopen(&dir).build_info().unwrap(), None);
    }

    #[test]
    fn subscriber_receives_hydrated_value_immediately() {
        let (dir, store) = open();
        store.set_global_status(GlobalStatus::UpdatePending).unwrap();
        drop(store);

        let store = reopen(&dir);
        let rx = store.subscribe_global_status().unwrap();
        assert_eq!(*rx.borrow(), GlobalStatus::UpdatePending);
    }

    #[test]
    fn set_publishes_latest_value() {
        let (_dir, store) = open();
        let mut rx = store.subscribe_global_status().unwrap();
        store.set_global_status(GlobalStatus::Downloading).unwrap();
        store.set_global_status(GlobalStatus::UpdatePending).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), GlobalStatus::UpdatePending);
    }

    #[test]
    fn delete_global_status_resets_offer_fields() {
        let (dir, store) = open();
        store.set_global_status(GlobalStatus::UpdatePending).unwrap();
        store.set_entry_date(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()).unwrap();
        store.set_local_upgrade_file("/sdcard/ota.zip").unwrap();

        store.delete_global_status().unwrap();
        assert_eq!(store.global_status().unwrap(), GlobalStatus::Unknown);
        assert_eq!(store.entry_date().unwrap(), None);
        assert_eq!(store.local_upgrade_file().unwrap(), "");

        let store = reopen(&dir);
        assert_eq!(store.global_status().unwrap(), GlobalStatus::Unknown);
        assert_eq!(store.entry_date().unwrap(), None);
    }

    #[test]
    fn download_status_takes_total_from_build_info() {
        let (dir, store) = open();
        store.set_build_info(&sample_build_info()).unwrap();

        store.set_download_status(StatusCode::Indeterminate).unwrap();
        assert!(store.set_download_progress(500_000, 25).unwrap());

        let status = store.download_status().unwrap().unwrap();
        assert_eq!(status.status, StatusCode::Indeterminate);
        assert_eq!(status.total_bytes, 2_000_000);
        assert_eq!(status.downloaded_bytes, 500_000);
        assert_eq!(status.progress, 25);

        assert_eq!(reopen(&dir).download_status().unwrap(), Some(status));
    }

    #[test]
    fn progress_without_status_is_ignored() {
        let (dir, store) = open();
        assert!(!store.set_download_progress(10, 1).unwrap());
        assert_eq!(store.download_status().unwrap(), None);
        assert_eq!(reopen(&dir).download_status().unwrap(), None);
    }

    #[test]
    fn delete_download_status_starts_fresh() {
        let (dir, store) = open();
        store.set_build_info(&sample_build_info()).unwrap();
        store.set_download_status(StatusCode::Downloading).unwrap();
        store.set_download_progress(1_000_000, 50).unwrap();

        store.delete_download_status().unwrap();
        let fresh = store.download_status().unwrap().unwrap();
        assert_eq!(fresh.status, StatusCode::Unset);
        assert_eq!(fresh.downloaded_bytes, 0);
        assert_eq!(fresh.progress, 0);
        assert_eq!(store.download_status_code().unwrap(), StatusCode::Unset);

        assert_eq!(reopen(&dir).download_status().unwrap(), None);
    }

    #[test]
    fn failed_persist_is_an_error_and_publishes_nothing() {
        let (dir, store) = open();
        store.set_global_status(GlobalStatus::DownloadPending).unwrap();
        let rx = store.subscribe_global_status().unwrap();

        block_writes(&dir.path().join("status.json"));
        let err = store.set_global_status(GlobalStatus::Downloading).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to persist global status"));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.global_status().unwrap(), GlobalStatus::DownloadPending);
    }

    #[test]
    fn download_id_roundtrips_and_clears() {
        let (dir, store) = open();
        let handle = JobHandle::new();
        let rx = store.subscribe_download_id().unwrap();
        store.set_download_id(Some(handle)).unwrap();
        assert_eq!(*rx.borrow(), Some(handle));
        assert_eq!(reopen(&dir).download_id().unwrap(), Some(handle));

        store.set_download_id(None).unwrap();
        assert_eq!(*rx.borrow(), None);
        assert_eq!(reopen(&dir).download_id().unwrap(), None);
    }

    #[test]
    fn preferences_have_defaults() {
        let (dir, store) = open();
        assert_eq!(store.theme().unwrap(), ThemeMode::FollowSystem);
        assert_eq!(store.refresh_interval_days().unwrap(), 7);

        store.set_theme(ThemeMode::Dark).unwrap();
        store.set_refresh_interval_days(3).unwrap();

        let store = reopen(&dir);
        assert_eq!(store.theme().unwrap(), ThemeMode::Dark);
        assert_eq!(store.refresh_interval_days().unwrap(), 3);
    }
}
