//! Observable driver state (§6 of the spec): the handful of fields a
//! top-level caller (status bar, splash screen) wants without reaching into
//! transport internals. Updated by [`crate::driver::run`] as it progresses
//! through session phases; read through a shared, lock-guarded snapshot the
//! same way this workspace's `ConfigManager` exposes a live `Config`.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Connecting,
    Running,
    Restarting,
    ShuttingDown,
}

#[derive(Debug, Clone, Default)]
pub struct GuestIdentity {
    pub os_name: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub capture_backend: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DriverState {
    pub phase: SessionPhase,
    pub format_valid: bool,
    pub guest: GuestIdentity,
    pub host_version: Option<String>,
    pub features: u32,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::default(),
            format_valid: false,
            guest: GuestIdentity::default(),
            host_version: None,
            features: 0,
        }
    }
}

pub type SharedState = Arc<Mutex<DriverState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(DriverState::default()))
}
