//! Over-the-air update orchestration.
//!
//! This crate owns the update pipeline state: the persisted [`StatusStore`], the download
//! and payload-application orchestrators, and the [`Updater`] facade the UI bridge calls
//! into. Everything that talks to the platform (update engine binder, battery service, UI)
//! is reached through the traits in [`engine`], [`battery`] and [`models::notification`].

pub mod battery;
pub mod config;
pub mod download;
pub mod engine;
pub mod facade;
pub mod jobs;
pub mod models;
pub mod payload;
pub mod store;
pub mod update;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use battery::{BatteryGate, BatteryMonitor, BatterySensor};
pub use config::UpdaterConfig;
pub use download::DownloadOrchestrator;
pub use facade::Updater;
pub use store::StatusStore;
pub use update::UpdateOrchestrator;

pub const USER_AGENT: &str = concat!("ota-updater/", env!("CARGO_PKG_VERSION"));
