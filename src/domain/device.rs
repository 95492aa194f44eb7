//! Device and host-application signals consumed by the pipeline.
//!
//! The signal sources themselves live outside the crate. They publish into a
//! [`DeviceSignals`] and every component holds its own [`DeviceWatch`].

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Foreground state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    #[default]
    Active,
    /// Visible but not receiving input. Timers keep running.
    Inactive,
    Background,
    Terminated,
}

impl AppState {
    pub fn is_backgrounded(self) -> bool {
        matches!(self, AppState::Background | AppState::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub level_percent: f32,
    /// `None` when the charging state is unknown.
    pub charging: Option<bool>,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self {
            level_percent: 100.0,
            charging: Some(true),
        }
    }
}

impl BatteryStatus {
    /// Low means not known to be charging and below the threshold.
    pub fn is_low(&self, min_level_percent: u8) -> bool {
        let charging = self.charging.unwrap_or(false);
        !charging && self.level_percent < f32::from(min_level_percent)
    }
}

/// Radio technology of the active network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Wifi,
    Cellular4G,
    Cellular3G,
    Cellular2G,
}

impl NetworkType {
    /// Weaker links get larger coefficients and so back off harder.
    pub fn coefficient(self) -> f64 {
        match self {
            NetworkType::Wifi => 1.0,
            NetworkType::Cellular4G => 1.3,
            NetworkType::Cellular3G => 1.6,
            NetworkType::Cellular2G => 2.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    pub reachable: bool,
    pub network: NetworkType,
}

impl Default for Reachability {
    fn default() -> Self {
        Self {
            reachable: true,
            network: NetworkType::Wifi,
        }
    }
}

/// Publishing side of the device signals.
#[derive(Debug)]
pub struct DeviceSignals {
    app_state: watch::Sender<AppState>,
    battery: watch::Sender<BatteryStatus>,
    reachability: watch::Sender<Reachability>,
}

impl Default for DeviceSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSignals {
    pub fn new() -> Self {
        Self {
            app_state: watch::Sender::new(AppState::default()),
            battery: watch::Sender::new(BatteryStatus::default()),
            reachability: watch::Sender::new(Reachability::default()),
        }
    }

    pub fn watch(&self) -> DeviceWatch {
        DeviceWatch {
            app_state: self.app_state.subscribe(),
            battery: self.battery.subscribe(),
            reachability: self.reachability.subscribe(),
        }
    }

    pub fn set_app_state(&self, state: AppState) {
        self.app_state.send_if_modified(|current| replace_if_changed(current, state));
    }

    pub fn set_battery(&self, status: BatteryStatus) {
        self.battery.send_if_modified(|current| replace_if_changed(current, status));
    }

    pub fn set_reachability(&self, reachability: Reachability) {
        self.reachability
            .send_if_modified(|current| replace_if_changed(current, reachability));
    }
}

fn replace_if_changed<T: PartialEq>(current: &mut T, next: T) -> bool {
    if *current == next {
        false
    } else {
        *current = next;
        true
    }
}

/// Observing side of the device signals. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeviceWatch {
    pub app_state: watch::Receiver<AppState>,
    pub battery: watch::Receiver<BatteryStatus>,
    pub reachability: watch::Receiver<Reachability>,
}

impl DeviceWatch {
    /// Receivers fed by fixed, never-changing values. Useful when no signal
    /// source exists (e.g. a headless forwarder).
    pub fn fixed(app_state: AppState, battery: BatteryStatus, reachability: Reachability) -> Self {
        let signals = DeviceSignals::new();
        signals.set_app_state(app_state);
        signals.set_battery(battery);
        signals.set_reachability(reachability);
        let watch = signals.watch();
        // Receivers keep reporting the last value once the sender is gone.
        drop(signals);
        watch
    }

    pub fn app_state(&self) -> AppState {
        *self.app_state.borrow()
    }

    pub fn battery(&self) -> BatteryStatus {
        *self.battery.borrow()
    }

    pub fn reachability(&self) -> Reachability {
        *self.reachability.borrow()
    }

    pub fn battery_low(&self, min_level_percent: u8) -> bool {
        self.battery().is_low(min_level_percent)
    }
}
