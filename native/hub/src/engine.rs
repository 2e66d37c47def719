use std::sync::Arc;

use parking_lot::Mutex;
use rinf::{DartSignal, RustSignal};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info_span, trace};
use updater::engine::{EngineCallback, EngineError, UpdateEngine};

use crate::signals::engine::{
    EngineCommand, UpdateEngineCommand, UpdateEnginePayloadComplete, UpdateEngineStatusUpdate,
};

/// Update engine living on the platform side of the bridge.
///
/// Binder calls become [`UpdateEngineCommand`] signals and the service's callbacks come
/// back as Dart signals, which are handed to whichever callback is currently bound.
/// Calls are fire-and-forget; platform-side failures surface through the callbacks.
#[derive(Debug)]
pub struct SignalUpdateEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    callback: Mutex<Option<EngineCallback>>,
}

impl SignalUpdateEngine {
    /// Creates the engine and starts relaying commands to Dart and callbacks back.
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Self::new(tx);

        tokio::spawn(
            async move {
                while let Some(command) = rx.recv().await {
                    trace!(?command, "Sending engine command");
                    UpdateEngineCommand { command }.send_signal_to_dart();
                }
            }
            .instrument(info_span!("task_engine_commands")),
        );

        tokio::spawn({
            let engine = engine.clone();
            async move {
                let status_receiver = UpdateEngineStatusUpdate::get_dart_signal_receiver();
                let complete_receiver = UpdateEnginePayloadComplete::get_dart_signal_receiver();
                loop {
                    tokio::select! {
                        Some(pack) = status_receiver.recv() => {
                            engine.dispatch_status_update(pack.message.status, pack.message.percent);
                        }
                        Some(pack) = complete_receiver.recv() => {
                            engine.dispatch_payload_complete(pack.message.error_code);
                        }
                        else => {
                            error!("Engine callback channels closed");
                            break;
                        }
                    }
                }
            }
            .instrument(info_span!("task_engine_callbacks"))
        });

        engine
    }

    fn new(commands: mpsc::UnboundedSender<EngineCommand>) -> Arc<Self> {
        Arc::new(Self { commands, callback: Mutex::new(None) })
    }

    fn dispatch_status_update(&self, status: i32, percent: f32) {
        match self.callback.lock().as_ref() {
            Some(callback) => callback.on_status_update(status, percent),
            None => debug!(status, "Engine status update while unbound"),
        }
    }

    fn dispatch_payload_complete(&self, error_code: i32) {
        match self.callback.lock().as_ref() {
            Some(callback) => callback.on_payload_application_complete(error_code),
            None => debug!(error_code, "Payload completion while unbound"),
        }
    }

    fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Binder("update engine bridge is closed".into()))
    }
}

impl UpdateEngine for SignalUpdateEngine {
    fn bind(&self, callback: EngineCallback) -> Result<bool, EngineError> {
        self.send(EngineCommand::Bind)?;
        *self.callback.lock() = Some(callback);
        Ok(true)
    }

    fn unbind(&self) -> Result<bool, EngineError> {
        let was_bound = self.callback.lock().take().is_some();
        self.send(EngineCommand::Unbind)?;
        Ok(was_bound)
    }

    fn apply_payload(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        headers: &[String],
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::ApplyPayload {
            url: url.to_string(),
            offset,
            size,
            headers: headers.to_vec(),
        })
    }

    fn suspend(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Suspend)
    }

    fn resume(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Resume)
    }

    fn cancel(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Cancel)
    }

    fn cleanup_applied_payload(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::CleanupAppliedPayload)
    }

    fn reset_status(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ResetStatus)
    }

    fn set_performance_mode(&self, enable: bool) -> Result<(), EngineError> {
        self.send(EngineCommand::SetPerformanceMode { enable })
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;
    use updater::engine::{EngineEvent, EngineStatus, ErrorCode};

    use super::*;

    #[test]
    fn callbacks_reach_bound_callback_only() {
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let engine = SignalUpdateEngine::new(commands_tx);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        engine.dispatch_status_update(3, 0.1);
        assert!(engine.bind(EngineCallback::new(events_tx)).unwrap());
        engine.dispatch_status_update(3, 0.5);
        engine.dispatch_payload_complete(0);
        assert!(engine.unbind().unwrap());
        engine.dispatch_payload_complete(0);

        assert_eq!(
            events_rx.try_recv().unwrap(),
            EngineEvent::StatusUpdate { status: EngineStatus::Downloading, percent: 0.5 }
        );
        assert_eq!(
            events_rx.try_recv().unwrap(),
            EngineEvent::PayloadApplicationComplete(ErrorCode::Success)
        );
        assert!(events_rx.try_recv().is_err());

        assert_eq!(commands_rx.try_recv().unwrap(), EngineCommand::Bind);
        assert_eq!(commands_rx.try_recv().unwrap(), EngineCommand::Unbind);
    }

    #[test]
    fn closed_bridge_is_a_binder_error() {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let engine = SignalUpdateEngine::new(commands_tx);
        drop(commands_rx);

        assert!(matches!(engine.suspend(), Err(EngineError::Binder(_))));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        assert!(engine.bind(EngineCallback::new(events_tx)).is_err());
        assert!(!engine.unbind().unwrap_or(false));
    }
}
