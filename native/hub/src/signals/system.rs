use std::time::Duration;

use rinf::RustSignal;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, RustSignal)]
pub struct RustPanic {
    pub message: String,
}

/// Transient message for the user. `title` and `description` are localization keys
/// unless `error` carries a raw error text.
#[derive(Serialize, Deserialize, RustSignal)]
pub struct Toast {
    pub title: String,
    pub description: String,
    pub error: bool,
    /// Display duration in milliseconds
    pub duration: Option<u32>,
}

impl Toast {
    pub fn send(title: String, description: String, error: bool, duration: Option<Duration>) {
        Toast { title, description, error, duration: duration.map(|d| d.as_millis() as u32) }
            .send_signal_to_dart();
    }
}
