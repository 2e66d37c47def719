//! Payload application state machine.
//!
//! Three inputs drive it: user commands, update engine callbacks and the battery gate.
//! Engine callbacks are funneled through one callback context task; every transition,
//! whatever its source, happens under the orchestrator's state lock.

use std::{
    error::Error,
    path::PathBuf,
    sync::{Arc, Weak},
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    StatusStore,
    battery::BatteryGate,
    engine::{EngineCallback, EngineError, EngineEvent, EngineStatus, ErrorCode, UpdateEngine},
    models::{FailureReason, GlobalStatus, Notification, Notifier, StatusCode, UpdateStatus, UpdateStep},
    payload::PayloadInfo,
};

#[derive(Default)]
struct UpdateState {
    /// Set from `start()` until the engine reports completion; guards against a second
    /// submission.
    queued: bool,
    /// The engine is actively streaming the payload.
    updating: bool,
    context: Option<CallbackContext>,
}

/// Background context draining engine callbacks in order.
struct CallbackContext {
    callback: EngineCallback,
    token: CancellationToken,
}

impl CallbackContext {
    fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops accepting events. Events already queued are still handled.
    fn terminate(&self) {
        self.token.cancel();
    }
}

pub struct UpdateOrchestrator {
    engine: Arc<dyn UpdateEngine>,
    store: Arc<StatusStore>,
    battery: BatteryGate,
    notifier: Arc<dyn Notifier>,
    downloads_dir: PathBuf,
    state: Mutex<UpdateState>,
    status_tx: watch::Sender<UpdateStatus>,
}

impl UpdateOrchestrator {
    /// Resets the engine, in case a previous process left it bound, and starts watching
    /// the battery gate.
    pub fn new(
        engine: Arc<dyn UpdateEngine>,
        store: Arc<StatusStore>,
        battery: BatteryGate,
        notifier: Arc<dyn Notifier>,
        downloads_dir: PathBuf,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            engine,
            store,
            battery,
            notifier,
            downloads_dir,
            state: Mutex::new(UpdateState::default()),
            status_tx: watch::Sender::new(UpdateStatus::default()),
        });
        orchestrator.engine_reset();

        let mut battery_rx = orchestrator.battery.subscribe();
        let weak = Arc::downgrade(&orchestrator);
        tokio::spawn(async move {
            while battery_rx.changed().await.is_ok() {
                let safe = *battery_rx.borrow_and_update();
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if !safe {
                    this.on_battery_unsafe();
                }
            }
            trace!("Battery watcher stopped");
        });

        orchestrator
    }

    /// Applies the selected package. A second call while an update is queued is a no-op.
    #[instrument(skip(self), err)]
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.queued {
            debug!("Update already queued");
            return Ok(());
        }
        if !self.battery.is_safe() {
            info!("Battery too low to start the update");
            self.notifier.notify(Notification::BatteryLow);
            self.set_status(StatusCode::BatteryLow);
            return Ok(());
        }
        state.queued = true;

        self.engine_reset();
        let callback = self.ensure_context(&mut state);
        if let Err(e) = self.engine.set_performance_mode(true) {
            warn!(error = &e as &dyn Error, "Failed to enable performance mode");
        }

        let path = match self.package_path() {
            Ok(Some(path)) => path,
            Ok(None) => {
                error!("No update package selected");
                return self.fail(&mut state, FailureReason::InvalidPackage);
            }
            Err(e) => {
                error!(error = e.as_ref() as &dyn Error, "Failed to resolve update package");
                return self.fail(&mut state, FailureReason::InvalidPackage);
            }
        };
        let payload = match PayloadInfo::from_package(&path) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = &e as &dyn Error, path = %path.display(), "Invalid update package");
                return self.fail(&mut state, FailureReason::InvalidPackage);
            }
        };
        self.set_status(StatusCode::Indeterminate);

        match self.engine.bind(callback) {
            Ok(true) => {}
            Ok(false) => {
                error!("Update engine refused the binding");
                return self.fail(&mut state, FailureReason::EngineUnavailable);
            }
            Err(e) => {
                error!(error = &e as &dyn Error, "Failed to bind update engine");
                return self.fail(&mut state, FailureReason::EngineUnavailable);
            }
        }
        if let Err(e) =
            self.engine.apply_payload(&payload.url, payload.offset, payload.size, &payload.headers)
        {
            error!(error = &e as &dyn Error, "Update engine rejected the payload");
            return self.fail(&mut state, FailureReason::EngineUnavailable);
        }
        info!(url = %payload.url, offset = payload.offset, size = payload.size, "Payload submitted");
        Ok(())
    }

    /// Suspends (`true`) or resumes (`false`) the running update.
    #[instrument(skip(self))]
    pub fn pause(&self, pause: bool) {
        let state = self.state.lock();
        if !state.queued {
            debug!(pause, "No update queued, nothing to pause or resume");
            return;
        }
        self.pause_locked(pause);
    }

    /// Stops the update and puts the engine back to a clean slate.
    #[instrument(skip(self), err)]
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.queued = false;
        state.updating = false;
        self.engine_reset();
        self.set_status(StatusCode::Cancelled);
        Self::terminate_context(&mut state);
        if self.store.global_status()? == GlobalStatus::Updating {
            self.store.set_global_status(GlobalStatus::UpdatePending)?;
        }
        info!("Update cancelled");
        Ok(())
    }

    /// Engine reset plus a fresh zero status, as opposed to the `Cancelled` that
    /// [`cancel`](Self::cancel) leaves for observers.
    #[instrument(skip(self))]
    pub fn user_initiated_reset(&self) {
        let mut state = self.state.lock();
        state.queued = false;
        state.updating = false;
        self.engine_reset();
        Self::terminate_context(&mut state);
        self.status_tx.send_replace(UpdateStatus::default());
    }

    pub fn is_updating(&self) -> bool {
        self.state.lock().updating
    }

    pub fn is_queued(&self) -> bool {
        self.state.lock().queued
    }

    pub fn status(&self) -> UpdateStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<UpdateStatus> {
        self.status_tx.subscribe()
    }

    fn on_battery_unsafe(&self) {
        let state = self.state.lock();
        if state.updating && self.status().status != StatusCode::Paused {
            info!("Battery became unsafe, pausing update");
            self.pause_locked(true);
            self.notifier.notify(Notification::BatteryLow);
        }
    }

    fn pause_locked(&self, pause: bool) {
        if pause {
            match self.engine.suspend() {
                Ok(()) => self.set_status(StatusCode::Paused),
                // Nothing to suspend.
                Err(EngineError::ServiceSpecific(_)) => {}
                Err(e) => warn!(error = &e as &dyn Error, "Failed to suspend update"),
            }
        } else {
            if !self.battery.is_safe() {
                info!("Battery too low to resume the update");
                self.notifier.notify(Notification::BatteryLow);
                return;
            }
            match self.engine.resume() {
                Ok(()) => self.set_status(StatusCode::Indeterminate),
                Err(EngineError::ServiceSpecific(_)) => {}
                Err(e) => warn!(error = &e as &dyn Error, "Failed to resume update"),
            }
        }
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        let mut state = self.state.lock();
        if !state.queued {
            trace!(?event, "No update queued, ignoring late engine event");
            return;
        }
        let result = match event {
            EngineEvent::StatusUpdate { status, percent } => {
                self.on_status_update(&mut state, status, percent)
            }
            EngineEvent::PayloadApplicationComplete(code) => {
                self.on_payload_application_complete(&mut state, code)
            }
        };
        if let Err(e) = result {
            error!(error = e.as_ref() as &dyn Error, ?event, "Failed to handle engine event");
        }
    }

    fn on_status_update(
        &self,
        state: &mut UpdateState,
        status: EngineStatus,
        percent: f32,
    ) -> Result<()> {
        match status {
            EngineStatus::Idle | EngineStatus::CleanupPreviousUpdate => {}
            EngineStatus::UpdateAvailable => self.store.set_global_status(GlobalStatus::Updating)?,
            EngineStatus::Downloading | EngineStatus::Finalizing => {
                if status == EngineStatus::Downloading {
                    state.updating = true;
                }
                let step = match status {
                    EngineStatus::Downloading => UpdateStep::Streaming,
                    _ => UpdateStep::Finalizing,
                };
                let progress = (percent * 100.0).clamp(0.0, 100.0) as u8;
                self.status_tx.send_modify(|s| {
                    s.status = StatusCode::Updating;
                    s.step = Some(step);
                    s.progress = progress;
                });
            }
            EngineStatus::UpdatedNeedReboot => {
                state.updating = false;
                self.ready_for_reboot()?;
                // The completion callback still follows and terminates the context.
            }
            EngineStatus::Other(code) => warn!(code, "Unexpected update engine status"),
        }
        Ok(())
    }

    fn on_payload_application_complete(
        &self,
        state: &mut UpdateState,
        code: ErrorCode,
    ) -> Result<()> {
        state.queued = false;
        state.updating = false;
        let reason = match code {
            ErrorCode::Success => {
                info!("Payload applied");
                self.set_status(StatusCode::Finished);
                if let Err(e) = self.engine.unbind() {
                    warn!(error = &e as &dyn Error, "Failed to unbind update engine");
                }
                Self::terminate_context(state);
                return self.ready_for_reboot();
            }
            ErrorCode::DownloadInvalidMetadataMagicString
            | ErrorCode::DownloadMetadataSignatureMismatch => {
                FailureReason::MetadataVerificationFailed
            }
            ErrorCode::PayloadTimestampError => FailureReason::AttemptingDowngrade,
            ErrorCode::NewRootfsVerificationError => FailureReason::RootfsVerificationFailed,
            ErrorCode::DownloadTransferError => FailureReason::TransferError,
            ErrorCode::UserCancelled => return Ok(()),
            ErrorCode::Other(code) => {
                warn!(code, "Unexpected payload application result");
                return Ok(());
            }
        };
        self.fail(state, reason)
    }

    /// Moves the pipeline to [`GlobalStatus::RebootPending`], notifying once.
    fn ready_for_reboot(&self) -> Result<()> {
        if self.store.global_status()? != GlobalStatus::RebootPending {
            self.store.set_global_status(GlobalStatus::RebootPending)?;
            self.notifier.notify(Notification::UpdateFinished);
        }
        Ok(())
    }

    /// Terminal failure: the engine is reset and the pipeline returns to
    /// [`GlobalStatus::UpdatePending`] so the user can retry.
    fn fail(&self, state: &mut UpdateState, reason: FailureReason) -> Result<()> {
        warn!(?reason, "Update failed");
        state.queued = false;
        state.updating = false;
        self.status_tx.send_replace(UpdateStatus::default().with_status(StatusCode::Failed));
        self.engine_reset();
        self.notifier.notify(Notification::UpdateFailed(reason));
        Self::terminate_context(state);
        self.store.set_global_status(GlobalStatus::UpdatePending)
    }

    fn set_status(&self, status: StatusCode) {
        self.status_tx.send_if_modified(|s| {
            if s.status != status {
                debug!(?status, "Update status changed");
                s.status = status;
                true
            } else {
                false
            }
        });
    }

    /// Package to apply: the user's local file if one is set, otherwise the downloaded
    /// build.
    fn package_path(&self) -> Result<Option<PathBuf>> {
        let local = self.store.local_upgrade_file()?;
        if !local.is_empty() {
            return Ok(Some(PathBuf::from(local)));
        }
        Ok(self
            .store
            .build_info()?
            .and_then(|build| build.local_file_name())
            .map(|name| self.downloads_dir.join(name)))
    }

    /// Cancel, clean up, reset and unbind, ignoring "nothing to do" answers.
    fn engine_reset(&self) {
        match self.engine.cancel() {
            Ok(()) | Err(EngineError::ServiceSpecific(_)) => {}
            Err(e) => debug!(error = &e as &dyn Error, "Engine cancel failed"),
        }
        if let Err(e) = self.engine.cleanup_applied_payload() {
            warn!(error = &e as &dyn Error, "Failed to clean up applied payload");
        }
        if let Err(e) = self.engine.reset_status() {
            warn!(error = &e as &dyn Error, "Failed to reset engine status");
        }
        if let Err(e) = self.engine.unbind() {
            warn!(error = &e as &dyn Error, "Failed to unbind update engine");
        }
    }

    /// Returns the callback of the live context, starting a new context if the previous
    /// one terminated.
    fn ensure_context(self: &Arc<Self>, state: &mut UpdateState) -> EngineCallback {
        if let Some(context) = &state.context
            && !context.is_terminated()
        {
            return context.callback.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        tokio::spawn(run_callback_context(Arc::downgrade(self), rx, token.clone()));
        let callback = EngineCallback::new(tx);
        state.context = Some(CallbackContext { callback: callback.clone(), token });
        debug!("Started engine callback context");
        callback
    }

    fn terminate_context(state: &mut UpdateState) {
        if let Some(context) = state.context.take() {
            context.terminate();
        }
    }
}

async fn run_callback_context(
    orchestrator: Weak<UpdateOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Some(this) = orchestrator.upgrade() else { break };
                this.handle_engine_event(event);
            }
            _ = token.cancelled() => {
                rx.close();
                while let Ok(event) = rx.try_recv() {
                    let Some(this) = orchestrator.upgrade() else { break };
                    this.handle_engine_event(event);
                }
                break;
            }
        }
    }
    debug!("Engine callback context terminated");
}
