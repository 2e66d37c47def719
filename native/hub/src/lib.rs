//! This `hub` crate is the
//! entry point of the Rust logic.

use std::{error::Error, path::Path, sync::Arc};

use anyhow::{Context, Result};
use bridge::UpdaterBridge;
use engine::SignalUpdateEngine;
use mimalloc::MiMalloc;
use notifier::ToastNotifier;
use rinf::RustSignal;
use signals::system::{RustPanic, Toast};
use tracing::{error, info};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt};
use updater::{
    BatteryMonitor, BatterySensor, DownloadOrchestrator, StatusStore, UpdateOrchestrator, Updater,
    UpdaterConfig,
    jobs::{HttpDownloadWorker, LocalJobQueue, RetryPolicy, SystemConstraintProbe},
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

rinf::write_interface!();

pub mod bridge;
pub mod engine;
pub mod notifier;
pub mod signals;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let message = format!("{panic_info}\n{backtrace}");
        error!(message, "Rust panic");
        RustPanic { message }.send_signal_to_dart();
        original_hook(panic_info);
    }));

    // Set working directory to the app's data directory
    let data_dir = dirs::data_dir().expect("Failed to get data directory");
    let app_dir = data_dir.join("OtaUpdater");
    if !app_dir.exists() {
        std::fs::create_dir_all(&app_dir).expect("Failed to create app directory");
    }
    std::env::set_current_dir(&app_dir).expect("Failed to set current working directory");

    let _guard = setup_logging();
    if let Err(e) = &_guard {
        rinf::debug_print!("Failed to setup logging: {:#}", e);
    }

    info!("Starting updater backend");

    // Held until shutdown; dropping the monitor stops battery polling.
    let _monitor = match start_updater(&app_dir).await {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            error!(error = e.as_ref() as &dyn Error, "Failed to start updater");
            Toast::send("Failed to start updater".into(), format!("{e:#}"), true, None);
            None
        }
    };

    // Keep the main function running until Dart shutdown.
    rinf::dart_shutdown().await;
}

async fn start_updater(app_dir: &Path) -> Result<BatteryMonitor> {
    let config = UpdaterConfig::load(app_dir);
    let store = Arc::new(
        StatusStore::open(&app_dir.join("status.json")).context("Failed to open status store")?,
    );

    let sensor = Arc::new(BatterySensor::new(config.min_battery_level));
    let monitor = BatteryMonitor::spawn(
        sensor.clone(),
        &config.dumpsys_path,
        config.battery_poll_interval(),
    );

    let worker = HttpDownloadWorker::new(config.cache_dir.clone(), config.downloads_dir.clone())
        .context("Failed to create download worker")?;
    let probe =
        SystemConstraintProbe::new(config.cache_dir.clone(), config.storage_low_threshold_bytes());
    let queue = LocalJobQueue::new(Arc::new(worker), Arc::new(probe), RetryPolicy::from(&config));

    let notifier = Arc::new(ToastNotifier);
    let downloads = DownloadOrchestrator::new(store.clone(), queue, notifier.clone(), &config);
    let updates = UpdateOrchestrator::new(
        SignalUpdateEngine::spawn(),
        store.clone(),
        sensor.gate(),
        notifier,
        config.downloads_dir.clone(),
    );

    let updater = Arc::new(Updater::new(store, downloads, updates));
    updater.recover().await.context("Failed to recover updater state")?;
    UpdaterBridge::start(updater).context("Failed to start updater bridge")?;
    Ok(monitor)
}

fn setup_logging() -> Result<WorkerGuard> {
    // Log to file
    std::fs::create_dir_all("logs").context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("updater_native")
        .filename_suffix("log")
        .build("logs")
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(fmt::format().pretty())
        .with_writer(non_blocking)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global subscriber")?;
    Ok(guard)
}
