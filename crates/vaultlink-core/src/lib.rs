//! Shared vocabulary for vaultlink: the wire envelopes exchanged with the
//! vault boundary, the typed command set and its results, the caller-visible
//! [`VaultState`], configuration, and the error taxonomy.

pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod state;

pub use command::{
    BootstrapOutcome, BootstrapParams, BootstrapStatus, CreatedUser, VaultCommand, WrappedPassword,
};
pub use config::VaultConfig;
pub use envelope::{AckMsg, ControlMsg, Inbound, InitMsg, VaultEvent, VaultRequest, VaultResponse};
pub use error::{ConfigError, VaultError};
pub use state::{LifecyclePhase, VaultState};
