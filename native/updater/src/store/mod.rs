mod prefs;
pub use prefs::Prefs;
mod status_store;
pub use status_store::StatusStore;

/// Persisted key space.
pub(crate) mod keys {
    pub const BUILD_VERSION: &str = "build_version";
    pub const BUILD_DATE: &str = "build_date";
    pub const BUILD_URL: &str = "build_url";
    pub const BUILD_FILE_NAME: &str = "build_file_name";
    pub const BUILD_FILE_SIZE: &str = "build_file_size";
    pub const BUILD_MD5: &str = "build_md5";
    pub const BUILD_INFO: [&str; 6] =
        [BUILD_VERSION, BUILD_DATE, BUILD_URL, BUILD_FILE_NAME, BUILD_FILE_SIZE, BUILD_MD5];

    pub const GLOBAL_STATUS: &str = "global_status";
    pub const DOWNLOAD_ID: &str = "download_id";
    pub const DOWNLOAD_STATUS: &str = "download_status";
    pub const DOWNLOADED_SIZE: &str = "downloaded_size";
    pub const DOWNLOADED_PERCENT: &str = "downloaded_percent";
    pub const ENTRY_DATE: &str = "entry_date";
    pub const LOCAL_UPGRADE_FILE: &str = "local_upgrade_file";
    pub const THEME: &str = "theme_settings_preference";
    pub const REFRESH_INTERVAL: &str = "refresh_interval_preference";
}
