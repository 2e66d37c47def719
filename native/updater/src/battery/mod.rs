//! Power-safety interlock for payload application.

use tokio::sync::watch;
use tracing::debug;

mod dumpsys;
pub use dumpsys::parse_dumpsys_battery;
mod monitor;
pub use monitor::BatteryMonitor;

/// One power-state sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    /// Charge in percent, already normalized by the reported scale.
    pub level: u8,
    /// Any charger (AC, USB or wireless) is connected.
    pub plugged: bool,
}

impl BatteryReading {
    pub fn is_safe(&self, min_level: u8) -> bool {
        self.plugged || self.level >= min_level
    }
}

/// Write side of the battery gate. Turns readings into the "safe to run" bit.
#[derive(Debug)]
pub struct BatterySensor {
    tx: watch::Sender<bool>,
    min_level: u8,
}

impl BatterySensor {
    /// Starts out safe until the first reading arrives, so a device without a battery
    /// service is never locked out.
    pub fn new(min_level: u8) -> Self {
        Self { tx: watch::Sender::new(true), min_level }
    }

    pub fn gate(&self) -> BatteryGate {
        BatteryGate { rx: self.tx.subscribe() }
    }

    pub fn update(&self, reading: BatteryReading) {
        self.set_safe(reading.is_safe(self.min_level));
    }

    /// Publishes only actual changes.
    pub fn set_safe(&self, safe: bool) {
        self.tx.send_if_modified(|current| {
            if *current != safe {
                debug!(safe, "Battery safety changed");
                *current = safe;
                true
            } else {
                false
            }
        });
    }
}

/// Read side of the battery gate.
#[derive(Debug, Clone)]
pub struct BatteryGate {
    rx: watch::Receiver<bool>,
}

impl BatteryGate {
    pub fn is_safe(&self) -> bool {
        *self.rx.borrow()
    }

    /// Receiver that yields on every change of the safe bit.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        let mut rx = self.rx.clone();
        rx.mark_unchanged();
        rx
    }
}
