//! Boundary hosted in a child process.
//!
//! Framing is newline-delimited JSON over the child's stdio. The child
//! writes `{"cmd":"loaded"}` once it is ready; the host answers with the
//! `init` line, after which every line in either direction is channel
//! traffic, starting with the child's ack.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use vaultlink_core::config::BoundaryConfig;
use vaultlink_core::envelope::{ControlMsg, InitMsg};
use vaultlink_core::error::VaultError;

use super::{Boundary, BoundaryLauncher, BoxFuture, SandboxPolicy};
use crate::channel::Port;

const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &BoundaryConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    /// Resolve against the host `PATH` before the child's environment is
    /// cleared.
    fn resolve_program(&self) -> PathBuf {
        which::which(&self.program).unwrap_or_else(|_| PathBuf::from(&self.program))
    }
}

impl BoundaryLauncher for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        policy: &'a SandboxPolicy,
    ) -> BoxFuture<'a, Result<Box<dyn Boundary>, VaultError>> {
        Box::pin(async move {
            let mut cmd = Command::new(self.resolve_program());
            cmd.args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(if policy.show_output {
                    Stdio::inherit()
                } else {
                    Stdio::null()
                })
                .kill_on_drop(true);

            if !policy.inherit_env {
                cmd.env_clear();
                for key in &policy.env_allowlist {
                    if let Ok(value) = std::env::var(key) {
                        cmd.env(key, value);
                    }
                }
            }
            if let Some(dir) = &policy.working_dir {
                cmd.current_dir(dir);
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| VaultError::BoundaryLaunch(format!("{}: {e}", self.program)))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| VaultError::BoundaryLaunch("child stdin not piped".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| VaultError::BoundaryLaunch("child stdout not piped".into()))?;

            tracing::info!(program = %self.program, pid = ?child.id(), "Boundary process launched");

            Ok(Box::new(ProcessBoundary {
                child: Some(child),
                stdin: Some(stdin),
                stdout: Some(BufReader::new(stdout).lines()),
                pumps: Vec::new(),
            }) as Box<dyn Boundary>)
        })
    }

    fn name(&self) -> &str {
        "process"
    }
}

struct ProcessBoundary {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    /// stdio <-> port forwarding tasks, started by `transfer`.
    pumps: Vec<JoinHandle<()>>,
}

impl Boundary for ProcessBoundary {
    fn wait_loaded(&mut self) -> BoxFuture<'_, Result<(), VaultError>> {
        Box::pin(async move {
            let lines = self
                .stdout
                .as_mut()
                .ok_or_else(|| VaultError::BoundaryLaunch("stdout already transferred".into()))?;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match ControlMsg::from_json(&line) {
                        Ok(ControlMsg::Loaded) => return Ok(()),
                        _ => tracing::debug!(line = %line, "Ignoring boundary output before load"),
                    },
                    Ok(None) => {
                        return Err(VaultError::BoundaryLaunch(
                            "boundary exited before signalling load".into(),
                        ));
                    }
                    Err(e) => return Err(VaultError::BoundaryLaunch(e.to_string())),
                }
            }
        })
    }

    fn transfer(&mut self, init: InitMsg, port: Port) -> BoxFuture<'_, Result<(), VaultError>> {
        Box::pin(async move {
            let (Some(mut stdin), Some(mut stdout)) = (self.stdin.take(), self.stdout.take())
            else {
                return Err(VaultError::BoundaryLaunch("endpoint already transferred".into()));
            };

            write_line(&mut stdin, &ControlMsg::Init(init).to_json()?)
                .await
                .map_err(|_| VaultError::BoundaryClosed)?;

            let (tx, mut rx) = port.split();

            self.pumps.push(tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = write_line(&mut stdin, &message).await {
                        tracing::debug!(error = %e, "Boundary stdin closed");
                        break;
                    }
                }
            }));

            self.pumps.push(tokio::spawn(async move {
                loop {
                    match stdout.next_line().await {
                        Ok(Some(line)) => {
                            if tx.post(line).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Boundary stdout closed");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read boundary stdout");
                            break;
                        }
                    }
                }
            }));

            Ok(())
        })
    }

    fn shutdown(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        let child = self.child.take();
        Box::pin(async move {
            let Some(mut child) = child else { return };
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Boundary process already gone");
            }
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Boundary process exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reap boundary process"),
                Err(_) => tracing::warn!("Boundary process did not exit after kill"),
            }
        })
    }
}

impl Drop for ProcessBoundary {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
        // `kill_on_drop` takes care of a child still held here.
    }
}

pub(crate) async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
