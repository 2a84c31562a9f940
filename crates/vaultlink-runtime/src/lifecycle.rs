//! Boundary lifecycle: launch, handshake, readiness, teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use vaultlink_core::command::BootstrapParams;
use vaultlink_core::config::VaultConfig;
use vaultlink_core::envelope::{Inbound, InitMsg, VaultEvent};
use vaultlink_core::error::VaultError;
use vaultlink_core::state::{LifecyclePhase, VaultState};
use vaultlink_secrets::{ChainedSecretStore, EnvSecretStore, FileTokenStore, SecretStore};

use crate::boundary::{Boundary, BoundaryLauncher, ProcessLauncher, SandboxPolicy};
use crate::channel::{self, PortReceiver, PortSender};
use crate::multiplexer::{Link, Multiplexer, spawn_sweeper};

const EVENT_CAPACITY: usize = 16;

/// Timeouts, sandbox policy and credential lookup for one engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub load_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_request_age: Duration,
    pub sandbox: SandboxPolicy,
    pub access_token_service: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&VaultConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            load_timeout: config.timeouts.load(),
            handshake_timeout: config.timeouts.handshake(),
            request_timeout: config.timeouts.request(),
            sweep_interval: config.timeouts.sweep_interval(),
            max_request_age: config.timeouts.max_request_age(),
            sandbox: SandboxPolicy::from(&config.boundary),
            access_token_service: config.boundary.access_token_service.clone(),
        }
    }
}

/// Live boundary plus the tasks serving its channel.
struct Connection {
    epoch: u64,
    outbound: PortSender,
    boundary: Option<Box<dyn Boundary>>,
    reader: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Connection {
    async fn close(mut self) {
        self.reader.abort();
        self.sweeper.abort();
        if let Some(boundary) = self.boundary.take() {
            boundary.shutdown().await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.sweeper.abort();
    }
}

type InitOutcome = Option<Result<(), VaultError>>;

enum Phase {
    Idle,
    Initializing {
        epoch: u64,
        step: LifecyclePhase,
        done: Arc<watch::Sender<InitOutcome>>,
        cancel: Option<oneshot::Sender<()>>,
    },
    Ready(Connection),
    Failed(VaultError),
}

impl Phase {
    fn as_lifecycle(&self) -> LifecyclePhase {
        match self {
            Phase::Idle => LifecyclePhase::Idle,
            Phase::Initializing { step, .. } => *step,
            Phase::Ready(_) => LifecyclePhase::Ready,
            Phase::Failed(_) => LifecyclePhase::Error,
        }
    }
}

pub(crate) struct Inner {
    settings: EngineSettings,
    launcher: Arc<dyn BoundaryLauncher>,
    credentials: Arc<dyn SecretStore>,
    pub(crate) multiplexer: Multiplexer,
    phase: Mutex<Phase>,
    epoch: AtomicU64,
    pub(crate) state: watch::Sender<VaultState>,
    events: broadcast::Sender<VaultEvent>,
}

/// Host-side handle to the vault.
///
/// Owns the boundary, its channel, the pending-request table and the timers.
/// Cloning yields another handle to the same engine. Commands may be issued
/// in any phase; they initialize lazily.
#[derive(Clone)]
pub struct VaultClient {
    pub(crate) inner: Arc<Inner>,
}

enum Entry {
    Ready,
    Wait(watch::Receiver<InitOutcome>),
    Start {
        epoch: u64,
        done: Arc<watch::Sender<InitOutcome>>,
        cancel: oneshot::Receiver<()>,
    },
}

impl VaultClient {
    pub fn new(
        settings: EngineSettings,
        launcher: Arc<dyn BoundaryLauncher>,
        credentials: Arc<dyn SecretStore>,
    ) -> Self {
        let multiplexer = Multiplexer::new(settings.request_timeout);
        let (state, _) = watch::channel(VaultState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                launcher,
                credentials,
                multiplexer,
                phase: Mutex::new(Phase::Idle),
                epoch: AtomicU64::new(0),
                state,
                events,
            }),
        }
    }

    /// Engine backed by a child-process boundary, with the access token
    /// taken from `VAULTLINK_ACCESS_TOKEN` or the stored token file.
    pub fn from_config(config: &VaultConfig) -> Self {
        let mut stores: Vec<Arc<dyn SecretStore>> = vec![Arc::new(EnvSecretStore::new())];
        if let Some(file) = FileTokenStore::new() {
            stores.push(Arc::new(file));
        }
        Self::new(
            EngineSettings::from_config(config),
            Arc::new(ProcessLauncher::from_config(&config.boundary)),
            Arc::new(ChainedSecretStore::new(stores)),
        )
    }

    pub fn state(&self) -> VaultState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<VaultState> {
        self.inner.state.subscribe()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.phase().as_lifecycle()
    }

    /// Push notifications from the boundary (key rotation).
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.multiplexer.pending().len()
    }

    /// Launch the boundary and complete the handshake.
    ///
    /// Single-flight: while an attempt is in progress, further calls launch
    /// nothing and share that attempt's outcome. Returns immediately when
    /// already ready. On failure everything is torn down and a later call
    /// may retry.
    pub async fn initialize(&self, params: Option<BootstrapParams>) -> Result<(), VaultError> {
        let entry = {
            let mut phase = self.inner.phase();
            match &*phase {
                Phase::Ready(_) => Entry::Ready,
                Phase::Initializing { done, .. } => Entry::Wait(done.subscribe()),
                Phase::Idle | Phase::Failed(_) => {
                    let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let (done, _) = watch::channel(None);
                    let done = Arc::new(done);
                    let (cancel_tx, cancel_rx) = oneshot::channel();
                    *phase = Phase::Initializing {
                        epoch,
                        step: LifecyclePhase::Launching,
                        done: done.clone(),
                        cancel: Some(cancel_tx),
                    };
                    Entry::Start {
                        epoch,
                        done,
                        cancel: cancel_rx,
                    }
                }
            }
        };

        match entry {
            Entry::Ready => Ok(()),
            Entry::Wait(mut rx) => {
                tracing::debug!("Initialization already in flight; waiting");
                match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone().unwrap_or(Err(VaultError::VaultReset)),
                    Err(_) => Err(VaultError::VaultReset),
                }
            }
            Entry::Start {
                epoch,
                done,
                cancel,
            } => {
                self.inner.state.send_modify(|s| *s = s.loading());
                tracing::info!(epoch, launcher = self.inner.launcher.name(), "Initializing vault");

                let mut guard = AttemptGuard {
                    inner: &self.inner,
                    epoch,
                    done: &done,
                    armed: true,
                };
                let outcome = tokio::select! {
                    result = self.inner.establish(epoch, params) => result,
                    _ = cancel => Err(VaultError::VaultReset),
                };
                guard.armed = false;

                let result = self.inner.finish_initialize(epoch, outcome);
                done.send_replace(Some(result.clone()));
                result
            }
        }
    }

    /// Tear everything down and return to idle.
    ///
    /// Rejects every pending request with `VaultReset`, aborts an in-flight
    /// initialization, shuts the boundary down, clears timers and resets
    /// [`VaultState`]. Safe to call in any phase, any number of times.
    pub async fn reset(&self) {
        let previous = std::mem::replace(&mut *self.inner.phase(), Phase::Idle);
        let rejected = self
            .inner
            .multiplexer
            .pending()
            .reject_all(&VaultError::VaultReset);

        match previous {
            Phase::Ready(connection) => connection.close().await,
            Phase::Initializing { cancel, .. } => {
                if let Some(cancel) = cancel {
                    let _ = cancel.send(());
                }
            }
            Phase::Idle | Phase::Failed(_) => {}
        }

        self.inner.state.send_replace(VaultState::default());
        tracing::info!(rejected, "Vault reset");
    }

    /// Endpoint for sending commands, initializing first when needed.
    pub(crate) async fn ready_link(
        &self,
        params: Option<BootstrapParams>,
    ) -> Result<Link, VaultError> {
        if let Some(link) = self.inner.link() {
            return Ok(link);
        }
        self.initialize(params).await?;
        // A reset may land between initialization and this lookup.
        self.inner.link().ok_or(VaultError::VaultReset)
    }
}

impl Inner {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Bound under the phase lock, so a reset that ends this phase also
    // invalidates the link.
    fn link(&self) -> Option<Link> {
        match &*self.phase() {
            Phase::Ready(connection) => Some(self.multiplexer.link(connection.outbound.clone())),
            _ => None,
        }
    }

    fn set_step(&self, epoch: u64, next: LifecyclePhase) {
        if let Phase::Initializing { epoch: e, step, .. } = &mut *self.phase()
            && *e == epoch
        {
            *step = next;
        }
    }

    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        params: Option<BootstrapParams>,
    ) -> Result<Connection, VaultError> {
        let service = &self.settings.access_token_service;
        let access_token = self
            .credentials
            .lookup(service)
            .await
            .map_err(|e| VaultError::Credential(e.to_string()))?;

        let mut boundary = self.launcher.launch(&self.settings.sandbox).await?;

        self.set_step(epoch, LifecyclePhase::AwaitingLoad);
        let load_timeout = self.settings.load_timeout;
        let loaded = match tokio::time::timeout(load_timeout, boundary.wait_loaded()).await {
            Ok(result) => result,
            Err(_) => Err(VaultError::BoundaryLoadTimeout(load_timeout)),
        };
        if let Err(e) = loaded {
            boundary.shutdown().await;
            return Err(e);
        }

        self.set_step(epoch, LifecyclePhase::Handshaking);
        let params = params.unwrap_or_default();
        let init = InitMsg {
            encrypted_id: non_empty(params.encrypted_id),
            user_id: non_empty(params.user_id),
            encrypted_password: params.encrypted_password,
            access_token: access_token.expose().to_string(),
        };
        drop(access_token);

        let port = match channel::handshake(&mut *boundary, init, self.settings.handshake_timeout)
            .await
        {
            Ok(port) => port,
            Err(e) => {
                boundary.shutdown().await;
                return Err(e);
            }
        };

        let (outbound, inbound) = port.split();
        let reader = tokio::spawn(read_loop(Arc::downgrade(self), epoch, inbound));
        let sweeper = spawn_sweeper(
            self.multiplexer.pending().clone(),
            self.settings.sweep_interval,
            self.settings.max_request_age,
        );

        Ok(Connection {
            epoch,
            outbound,
            boundary: Some(boundary),
            reader,
            sweeper,
        })
    }

    fn finish_initialize(
        &self,
        epoch: u64,
        outcome: Result<Connection, VaultError>,
    ) -> Result<(), VaultError> {
        let mut phase = self.phase();
        if !matches!(&*phase, Phase::Initializing { epoch: e, .. } if *e == epoch) {
            drop(phase);
            if let Ok(connection) = outcome {
                // Reset while we were launching: discard the connection.
                tokio::spawn(connection.close());
            }
            tracing::debug!(epoch, "Initialization superseded by reset");
            return Err(VaultError::VaultReset);
        }

        match outcome {
            Ok(connection) => {
                *phase = Phase::Ready(connection);
                drop(phase);
                self.state.send_modify(|s| *s = s.ready());
                tracing::info!(epoch, "Vault ready");
                Ok(())
            }
            Err(e) => {
                *phase = Phase::Failed(e.clone());
                drop(phase);
                let rejected = self.multiplexer.pending().reject_all(&VaultError::VaultReset);
                self.state.send_modify(|s| *s = s.failed(e.to_string()));
                tracing::warn!(epoch, error = %e, rejected, "Vault initialization failed");
                Err(e)
            }
        }
    }

    fn route_inbound(&self, raw: &str) {
        match Inbound::parse(raw) {
            Ok(Inbound::Event(event)) => {
                tracing::info!(?event, "Vault event");
                // No subscribers is fine.
                let _ = self.events.send(event);
            }
            Ok(Inbound::Response(response)) => {
                let id = response.id.clone();
                if !self.multiplexer.pending().complete(response) {
                    tracing::debug!(request_id = %id, "Dropping response for unknown request");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Dropping malformed message from boundary"),
        }
    }

    fn connection_lost(&self, epoch: u64) {
        let connection = {
            let mut phase = self.phase();
            if !matches!(&*phase, Phase::Ready(c) if c.epoch == epoch) {
                return;
            }
            match std::mem::replace(&mut *phase, Phase::Failed(VaultError::BoundaryClosed)) {
                Phase::Ready(connection) => connection,
                _ => return,
            }
        };

        let rejected = self
            .multiplexer
            .pending()
            .reject_all(&VaultError::BoundaryClosed);
        self.state
            .send_modify(|s| *s = s.failed(VaultError::BoundaryClosed.to_string()));
        tracing::warn!(epoch, rejected, "Boundary channel closed");
        // Closing aborts this reader task, so hand it off.
        tokio::spawn(connection.close());
    }
}

/// Unwinds an initialization whose future was dropped mid-flight, so later
/// calls do not wait on an attempt that will never finish.
struct AttemptGuard<'a> {
    inner: &'a Inner,
    epoch: u64,
    done: &'a watch::Sender<InitOutcome>,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let ours = {
            let mut phase = self.inner.phase();
            let ours =
                matches!(&*phase, Phase::Initializing { epoch, .. } if *epoch == self.epoch);
            if ours {
                *phase = Phase::Idle;
            }
            ours
        };
        if ours {
            self.inner.state.send_modify(|s| {
                *s = VaultState {
                    needs_password: s.needs_password,
                    ..VaultState::default()
                }
            });
        }
        self.done.send_replace(Some(Err(VaultError::VaultReset)));
        tracing::debug!(epoch = self.epoch, "Initialization abandoned by caller");
    }
}

async fn read_loop(engine: Weak<Inner>, epoch: u64, mut inbound: PortReceiver) {
    while let Some(raw) = inbound.recv().await {
        let Some(inner) = engine.upgrade() else { return };
        inner.route_inbound(&raw);
    }
    if let Some(inner) = engine.upgrade() {
        inner.connection_lost(epoch);
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
