//! Request/response correlation over a single channel.
//!
//! Each dispatched command gets a fresh `req_<n>` id and a one-shot
//! completion stored in the pending table. Whoever removes the entry first
//! (matching response, per-request timeout, sweep, reset) delivers the one
//! and only outcome.
//!
//! The table carries a generation that every `reject_all` advances. A
//! [`Link`] remembers the generation it was taken in, so a request racing a
//! reset cannot slip into the table after it was drained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use vaultlink_core::command::VaultCommand;
use vaultlink_core::envelope::{VaultRequest, VaultResponse};
use vaultlink_core::error::VaultError;

use crate::channel::PortSender;

type Outcome = Result<VaultResponse, VaultError>;

struct PendingRequest {
    cmd: &'static str,
    responder: oneshot::Sender<Outcome>,
    created_at: Instant,
}

/// id → in-flight request. Only the multiplexer's send, receive, timeout,
/// sweep and reset paths touch it.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
    // Advanced only while `entries` is locked.
    generation: AtomicU64,
}

impl PendingTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Register a request taken in `generation`. Fails with `VaultReset`
    /// when the table was rejected since then.
    fn insert(
        &self,
        id: String,
        cmd: &'static str,
        generation: u64,
        responder: oneshot::Sender<Outcome>,
    ) -> Result<(), VaultError> {
        let mut entries = self.entries();
        if self.generation() != generation {
            return Err(VaultError::VaultReset);
        }
        let entry = PendingRequest {
            cmd,
            responder,
            created_at: Instant::now(),
        };
        entries.insert(id, entry);
        Ok(())
    }

    fn take(&self, id: &str) -> Option<PendingRequest> {
        self.entries().remove(id)
    }

    /// Deliver a response to its caller. Returns false when no request with
    /// that id is pending (late arrival after timeout or reset).
    pub fn complete(&self, response: VaultResponse) -> bool {
        let Some(entry) = self.take(&response.id) else {
            return false;
        };
        tracing::debug!(request_id = %response.id, cmd = entry.cmd, "Response correlated");
        // The caller may have stopped waiting; nothing to do then.
        let _ = entry.responder.send(Ok(response));
        true
    }

    /// Reject every entry at least `max_age` old with `RequestExpired`.
    pub fn expire_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, PendingRequest)> = {
            let mut entries = self.entries();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.created_at) >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::warn!(request_id = %id, cmd = entry.cmd, "Pending request expired");
            let _ = entry.responder.send(Err(VaultError::RequestExpired { id }));
        }
        count
    }

    /// Reject and remove every entry, and refuse requests from links taken
    /// before this call.
    pub fn reject_all(&self, error: &VaultError) -> usize {
        let drained: Vec<(String, PendingRequest)> = {
            let mut entries = self.entries();
            self.generation.fetch_add(1, Ordering::SeqCst);
            entries.drain().collect()
        };
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.responder.send(Err(error.clone()));
        }
        count
    }
}

/// Removes the entry if the dispatching future is dropped before an
/// outcome arrived.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.take(self.id).is_some() {
            tracing::debug!(request_id = %self.id, "Caller went away; request abandoned");
        }
    }
}

/// Outbound endpoint bound to the table generation it was taken in.
#[derive(Clone)]
pub struct Link {
    sender: PortSender,
    generation: u64,
}

pub struct Multiplexer {
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl Multiplexer {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Bind `sender` to the current generation.
    pub fn link(&self, sender: PortSender) -> Link {
        Link {
            sender,
            generation: self.pending.generation(),
        }
    }

    fn next_id(&self) -> String {
        format!("req_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Send `command` on `link` and wait for its single outcome.
    pub async fn dispatch(&self, link: &Link, command: VaultCommand) -> Outcome {
        let id = self.next_id();
        let cmd = command.name();
        let envelope = VaultRequest::new(id.clone(), command).to_json()?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(id.clone(), cmd, link.generation, tx)?;
        let _guard = PendingGuard {
            table: &self.pending,
            id: &id,
        };

        link.sender.post(envelope)?;
        tracing::debug!(request_id = %id, cmd, "Request sent");

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(VaultError::VaultReset),
            Err(_) => {
                if self.pending.take(&id).is_some() {
                    tracing::warn!(request_id = %id, cmd, timeout = ?self.request_timeout, "Request timed out");
                    Err(VaultError::RequestTimeout {
                        id: id.clone(),
                        cmd: cmd.to_string(),
                    })
                } else {
                    // Another path removed the entry as the timer fired; its
                    // outcome is already on the way.
                    rx.await.unwrap_or(Err(VaultError::VaultReset))
                }
            }
        }
    }
}

/// Periodically expire requests the per-request timeout did not catch.
pub fn spawn_sweeper(
    pending: Arc<PendingTable>,
    every: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = pending.expire_older_than(max_age);
            if expired > 0 {
                tracing::warn!(expired, "Sweep expired stale requests");
            }
        }
    })
}
