use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};

/// Binder call for the platform side to perform on the update engine service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SignalPiece)]
pub enum EngineCommand {
    Bind,
    Unbind,
    ApplyPayload { url: String, offset: u64, size: u64, headers: Vec<String> },
    Suspend,
    Resume,
    Cancel,
    CleanupAppliedPayload,
    ResetStatus,
    SetPerformanceMode { enable: bool },
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct UpdateEngineCommand {
    pub command: EngineCommand,
}

/// `onStatusUpdate` forwarded from the platform callback.
#[derive(Debug, Serialize, Deserialize, DartSignal)]
pub struct UpdateEngineStatusUpdate {
    pub status: i32,
    pub percent: f32,
}

/// `onPayloadApplicationComplete` forwarded from the platform callback.
#[derive(Debug, Serialize, Deserialize, DartSignal)]
pub struct UpdateEnginePayloadComplete {
    pub error_code: i32,
}
