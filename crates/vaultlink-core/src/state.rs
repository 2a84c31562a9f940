use serde::{Deserialize, Serialize};

/// Caller-visible readiness of the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultState {
    pub is_ready: bool,
    pub is_loading: bool,
    pub error: Option<String>,
    pub needs_password: bool,
}

impl VaultState {
    pub fn loading(&self) -> Self {
        Self {
            is_ready: false,
            is_loading: true,
            error: None,
            needs_password: self.needs_password,
        }
    }

    pub fn ready(&self) -> Self {
        Self {
            is_ready: true,
            is_loading: false,
            error: None,
            needs_password: self.needs_password,
        }
    }

    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            is_ready: false,
            is_loading: false,
            error: Some(error.into()),
            needs_password: self.needs_password,
        }
    }
}

/// Where the engine is in the launch/handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePhase {
    Idle,
    Launching,
    AwaitingLoad,
    Handshaking,
    Ready,
    Error,
}

impl LifecyclePhase {
    pub fn is_initializing(&self) -> bool {
        matches!(
            self,
            LifecyclePhase::Launching | LifecyclePhase::AwaitingLoad | LifecyclePhase::Handshaking
        )
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Idle => write!(f, "idle"),
            LifecyclePhase::Launching => write!(f, "launching"),
            LifecyclePhase::AwaitingLoad => write!(f, "awaiting-load"),
            LifecyclePhase::Handshaking => write!(f, "handshaking"),
            LifecyclePhase::Ready => write!(f, "ready"),
            LifecyclePhase::Error => write!(f, "error"),
        }
    }
}
