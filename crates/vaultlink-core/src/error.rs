use std::time::Duration;

use thiserror::Error;

/// Failure of a vault operation.
///
/// Every command call resolves to exactly one of these or to its result.
/// The type is `Clone` so a single initialization failure can be handed to
/// every caller that was waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("boundary failed to launch: {0}")]
    BoundaryLaunch(String),

    #[error("boundary did not signal load within {0:?}")]
    BoundaryLoadTimeout(Duration),

    #[error("boundary did not acknowledge init within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("boundary rejected the handshake")]
    InvalidAck,

    #[error("request {id} ({cmd}) timed out")]
    RequestTimeout { id: String, cmd: String },

    #[error("request {id} expired while pending")]
    RequestExpired { id: String },

    #[error("vault was reset")]
    VaultReset,

    #[error("boundary channel closed")]
    BoundaryClosed,

    #[error("access credential unavailable: {0}")]
    Credential(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Domain error reported by the boundary, carried verbatim.
    #[error("{0}")]
    Vault(String),
}

impl VaultError {
    /// True for the failures produced locally by expiry or teardown rather
    /// than by the boundary itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            VaultError::RequestTimeout { .. }
                | VaultError::RequestExpired { .. }
                | VaultError::VaultReset
                | VaultError::BoundaryClosed
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Protocol(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
