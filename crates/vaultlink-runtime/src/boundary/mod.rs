//! Launching and tearing down the isolated context that hosts the vault.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use vaultlink_core::config::BoundaryConfig;
use vaultlink_core::envelope::InitMsg;
use vaultlink_core::error::VaultError;

use crate::channel::Port;

pub mod in_process;
pub mod process;

pub use in_process::InProcessLauncher;
pub use process::ProcessLauncher;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability restrictions applied when a boundary is launched.
///
/// Security posture (deny-default):
/// - No host environment unless `inherit_env` is set; only allowlisted
///   variables are copied in
/// - No working directory of its own unless one is configured
/// - No visible output: stderr is discarded unless `show_output` is set
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    pub inherit_env: bool,
    pub env_allowlist: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub show_output: bool,
}

impl From<&BoundaryConfig> for SandboxPolicy {
    fn from(config: &BoundaryConfig) -> Self {
        Self {
            inherit_env: config.inherit_env,
            env_allowlist: config.env_allowlist.clone(),
            working_dir: config.working_dir.clone(),
            show_output: config.show_output,
        }
    }
}

/// Creates boundaries. One launcher serves every initialization attempt of
/// an engine; each attempt gets a fresh boundary.
pub trait BoundaryLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        policy: &'a SandboxPolicy,
    ) -> BoxFuture<'a, Result<Box<dyn Boundary>, VaultError>>;

    /// Launcher name for logging.
    fn name(&self) -> &str;
}

/// A launched context.
///
/// Dropping a boundary must release it; `shutdown` is the orderly path.
pub trait Boundary: Send {
    /// Resolves once the context signals it finished loading.
    fn wait_loaded(&mut self) -> BoxFuture<'_, Result<(), VaultError>>;

    /// Hand the boundary its end of the channel together with `init`.
    fn transfer(&mut self, init: InitMsg, port: Port) -> BoxFuture<'_, Result<(), VaultError>>;

    /// Detach and discard the context.
    fn shutdown(self: Box<Self>) -> BoxFuture<'static, ()>;
}
