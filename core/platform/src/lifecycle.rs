//! Application lifecycle events.

use serde::{Deserialize, Serialize};

/// Foreground/background state reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// The app is visible and interactive.
    Active,
    /// The app moved to the background.
    Background,
}

impl AppState {
    /// True for the foreground state.
    pub fn is_active(self) -> bool {
        matches!(self, AppState::Active)
    }
}
