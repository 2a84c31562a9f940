//! Dedicated two-endpoint message channel and the `init` → `ack` handshake.

use std::time::Duration;

use tokio::sync::mpsc;

use vaultlink_core::envelope::{AckMsg, InitMsg};
use vaultlink_core::error::VaultError;

use crate::boundary::Boundary;

/// One end of a bidirectional message channel. Messages are serialized
/// envelopes; each one crosses the channel exactly once.
#[derive(Debug)]
pub struct Port {
    tx: PortSender,
    rx: PortReceiver,
}

/// Create a connected pair of ports. Whatever one end posts, the other
/// receives, in order.
pub fn pair() -> (Port, Port) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Port {
            tx: PortSender(a_tx),
            rx: PortReceiver(b_rx),
        },
        Port {
            tx: PortSender(b_tx),
            rx: PortReceiver(a_rx),
        },
    )
}

impl Port {
    pub fn post(&self, message: String) -> Result<(), VaultError> {
        self.tx.post(message)
    }

    /// Next message, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.tx, self.rx)
    }
}

#[derive(Debug, Clone)]
pub struct PortSender(mpsc::UnboundedSender<String>);

impl PortSender {
    pub fn post(&self, message: String) -> Result<(), VaultError> {
        self.0.send(message).map_err(|_| VaultError::BoundaryClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

#[derive(Debug)]
pub struct PortReceiver(mpsc::UnboundedReceiver<String>);

impl PortReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        self.0.recv().await
    }
}

/// Create a channel, hand one end to the boundary with `init`, and wait for
/// the boundary's ack on the end we keep.
///
/// Returns the host's endpoint only after `{"ok": true}` arrived, so nothing
/// can be posted on it before the handshake completed.
pub async fn handshake(
    boundary: &mut dyn Boundary,
    init: InitMsg,
    timeout: Duration,
) -> Result<Port, VaultError> {
    let (mut host, remote) = pair();
    boundary.transfer(init, remote).await?;

    let raw = match tokio::time::timeout(timeout, host.recv()).await {
        Err(_) => return Err(VaultError::HandshakeTimeout(timeout)),
        Ok(None) => return Err(VaultError::BoundaryClosed),
        Ok(Some(raw)) => raw,
    };

    match AckMsg::from_json(&raw) {
        Ok(AckMsg { ok: true }) => {
            tracing::debug!("Handshake acknowledged");
            Ok(host)
        }
        Ok(AckMsg { ok: false }) => Err(VaultError::InvalidAck),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed ack from boundary");
            Err(VaultError::InvalidAck)
        }
    }
}
