//! Boundary hosted on a tokio task in the same process.
//!
//! Isolation is logical only: the service owns its state and is reachable
//! solely through the channel. Useful for embedding and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;

use vaultlink_core::envelope::InitMsg;
use vaultlink_core::error::VaultError;

use super::{Boundary, BoundaryLauncher, BoxFuture, SandboxPolicy};
use crate::channel::Port;
use crate::service::{VaultService, serve_port};

type ServiceFactory = dyn Fn() -> Box<dyn VaultService> + Send + Sync;

pub struct InProcessLauncher {
    factory: Arc<ServiceFactory>,
    launches: AtomicUsize,
}

impl InProcessLauncher {
    /// Each launch gets a fresh service from `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn VaultService> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            launches: AtomicUsize::new(0),
        }
    }

    /// Number of boundaries launched so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl BoundaryLauncher for InProcessLauncher {
    fn launch<'a>(
        &'a self,
        _policy: &'a SandboxPolicy,
    ) -> BoxFuture<'a, Result<Box<dyn Boundary>, VaultError>> {
        Box::pin(async move {
            let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(launch = n, "In-process boundary launched");
            Ok(Box::new(InProcessBoundary {
                service: Some((self.factory)()),
                task: None,
            }) as Box<dyn Boundary>)
        })
    }

    fn name(&self) -> &str {
        "in-process"
    }
}

struct InProcessBoundary {
    service: Option<Box<dyn VaultService>>,
    task: Option<JoinHandle<()>>,
}

impl Boundary for InProcessBoundary {
    fn wait_loaded(&mut self) -> BoxFuture<'_, Result<(), VaultError>> {
        Box::pin(async { Ok(()) })
    }

    fn transfer(&mut self, init: InitMsg, port: Port) -> BoxFuture<'_, Result<(), VaultError>> {
        Box::pin(async move {
            let service = self
                .service
                .take()
                .ok_or_else(|| VaultError::BoundaryLaunch("endpoint already transferred".into()))?;
            self.task = Some(tokio::spawn(serve_port(service, init, port)));
            Ok(())
        })
    }

    fn shutdown(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Box::pin(async {})
    }
}

impl Drop for InProcessBoundary {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
