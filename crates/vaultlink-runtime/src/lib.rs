//! Host-side engine for vaultlink.
//!
//! Provides [`VaultClient`], the single interface between an application
//! and the isolated vault boundary. The client launches the boundary,
//! performs the `init` → `ack` handshake, multiplexes typed commands over
//! one channel and tears everything down on [`VaultClient::reset`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vaultlink_runtime::{EngineSettings, InProcessLauncher, StubVault, VaultClient};
//! use vaultlink_secrets::MemorySecretStore;
//!
//! # async fn run() -> Result<(), vaultlink_core::VaultError> {
//! let client = VaultClient::new(
//!     EngineSettings::default(),
//!     Arc::new(InProcessLauncher::new(|| Box::new(StubVault::new()))),
//!     Arc::new(MemorySecretStore::single("vault", "token")),
//! );
//!
//! // The first command launches the boundary.
//! client.create_user_password("correct horse", "user-1").await?;
//! client.derive().await?;
//! let sealed = client.encrypt("hello").await?;
//! assert_eq!(client.decrypt(sealed).await?, "hello");
//!
//! client.reset().await;
//! # Ok(())
//! # }
//! ```

pub mod boundary;
pub mod channel;
pub mod commands;
pub mod lifecycle;
pub mod multiplexer;
pub mod service;
pub mod stub;

pub use boundary::{Boundary, BoundaryLauncher, InProcessLauncher, ProcessLauncher, SandboxPolicy};
pub use lifecycle::{EngineSettings, VaultClient};
pub use service::{EventSink, VaultService, serve_port, serve_stdio};
pub use stub::StubVault;
