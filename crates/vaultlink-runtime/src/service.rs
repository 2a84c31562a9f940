//! Boundary-side seam: the vault implementation behind the channel.
//!
//! The host never calls a [`VaultService`] directly. A service is driven by
//! [`serve_port`] on the boundary's end of the channel, either inside a tokio
//! task ([`InProcessLauncher`](crate::boundary::InProcessLauncher)) or inside
//! a separate process speaking line-delimited JSON on stdio
//! ([`serve_stdio`]).

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use vaultlink_core::command::VaultCommand;
use vaultlink_core::envelope::{AckMsg, ControlMsg, InitMsg, VaultEvent, VaultRequest, VaultResponse};

use crate::boundary::BoxFuture;
use crate::boundary::process::write_line;
use crate::channel::{self, Port, PortSender};

/// Push channel from a service back to the host, outside request correlation.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: PortSender,
}

impl EventSink {
    /// Returns false once the host endpoint is gone.
    pub fn emit(&self, event: VaultEvent) -> bool {
        match event.to_json() {
            Ok(json) => self.tx.post(json).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode vault event");
                false
            }
        }
    }
}

/// A vault implementation.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait VaultService: Send {
    /// Inspect `init`; the return value becomes the ack's `ok` field.
    fn accept(&mut self, init: &InitMsg, events: EventSink) -> bool;

    /// Execute one command. `Ok` carries the response fields, `Err` the
    /// error string reported back verbatim.
    fn handle(&mut self, command: VaultCommand) -> BoxFuture<'_, Result<Value, String>>;
}

/// Drive `service` on the boundary's endpoint until the host goes away.
///
/// Requests are handled one at a time in arrival order.
pub async fn serve_port(mut service: Box<dyn VaultService>, init: InitMsg, port: Port) {
    let (tx, mut rx) = port.split();
    let ok = service.accept(&init, EventSink { tx: tx.clone() });

    let ack = match (AckMsg { ok }).to_json() {
        Ok(ack) => ack,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode ack");
            return;
        }
    };
    if tx.post(ack).is_err() || !ok {
        return;
    }

    while let Some(raw) = rx.recv().await {
        let request = match VaultRequest::from_json(&raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed request");
                continue;
            }
        };

        let cmd = request.command.name();
        let response = match service.handle(request.command).await {
            Ok(fields) => VaultResponse::success(request.id.clone(), &fields)
                .unwrap_or_else(|e| VaultResponse::failure(request.id.clone(), e.to_string())),
            Err(error) => {
                tracing::debug!(request_id = %request.id, cmd, error = %error, "Command failed");
                VaultResponse::failure(request.id.clone(), error)
            }
        };

        let posted = response.to_json().and_then(|json| tx.post(json));
        if posted.is_err() {
            break;
        }
    }
    tracing::debug!("Host endpoint closed; vault service stopping");
}

/// Run `service` as a process boundary over the given stdio streams.
///
/// Writes the load signal, reads the `init` line, then bridges the remaining
/// lines to [`serve_port`]. Returns when the host closes its side.
pub async fn serve_stdio<R, W>(
    service: Box<dyn VaultService>,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(input).lines();

    let loaded = ControlMsg::Loaded
        .to_json()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    write_line(&mut output, &loaded).await?;

    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let init = match ControlMsg::from_json(&first) {
        Ok(ControlMsg::Init(init)) => init,
        Ok(other) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected init, got {other:?}"),
            ));
        }
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ));
        }
    };

    let (host_side, vault_side) = channel::pair();
    let (host_tx, mut host_rx) = host_side.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = host_rx.recv().await {
            write_line(&mut output, &message).await?;
        }
        Ok::<_, std::io::Error>(())
    });
    let server = tokio::spawn(serve_port(service, init, vault_side));

    while let Some(line) = lines.next_line().await? {
        if host_tx.post(line).is_err() {
            break;
        }
    }

    drop(host_tx);
    let _ = server.await;
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e.to_string())),
    }
}
