use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::error::EngineError;

/// Outcome of a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
}

/// Where the session stands with the location permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Unrequested,
    Granted,
    Denied,
}

/// The mobile shell that actually prompts the courier. The engine only
/// sees the decision.
#[async_trait]
pub trait PermissionPlatform: Send + Sync {
    async fn request_location_permission(&self) -> PermissionDecision;
}

/// Permission lifecycle for one session. A denial is terminal: the
/// platform is never prompted again until a new session starts.
pub struct PermissionGate {
    platform: Arc<dyn PermissionPlatform>,
    state: Mutex<PermissionState>,
}

impl PermissionGate {
    pub fn new(platform: Arc<dyn PermissionPlatform>) -> Self {
        Self {
            platform,
            state: Mutex::new(PermissionState::Unrequested),
        }
    }

    pub fn state(&self) -> PermissionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Prompts the platform on first call; afterwards replays the stored
    /// decision without prompting.
    pub async fn request(&self) -> PermissionDecision {
        match self.state() {
            PermissionState::Granted => return PermissionDecision::Granted,
            PermissionState::Denied => return PermissionDecision::Denied,
            PermissionState::Unrequested => {}
        }

        let decision = self.platform.request_location_permission().await;
        let next = match decision {
            PermissionDecision::Granted => PermissionState::Granted,
            PermissionDecision::Denied => PermissionState::Denied,
        };

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A concurrent caller may have settled the state while the
        // prompt was open; the first stored decision wins.
        if *state == PermissionState::Unrequested {
            *state = next;
            info!(?decision, "location permission settled");
        }
        match *state {
            PermissionState::Granted => PermissionDecision::Granted,
            _ => PermissionDecision::Denied,
        }
    }

    /// Fails unless the permission has been granted.
    pub fn ensure_granted(&self) -> Result<(), EngineError> {
        match self.state() {
            PermissionState::Granted => Ok(()),
            _ => Err(EngineError::PermissionDenied),
        }
    }
}
