//! File-backed access token store.
//!
//! Persists the token handed to the vault at `init` as JSON at
//! `~/.config/vaultlink/token.json` (or a custom path for testing).
//!
//! ## Credential resolution order (in `vaultlink-cli`)
//!
//! 1. `VAULTLINK_ACCESS_TOKEN` env var
//! 2. This store

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SecretError;
use crate::store::{SecretStore, SecretValue};

// ── Stored format ─────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    /// Unix timestamp (seconds); `None` means the token does not expire.
    #[serde(default)]
    expires_at: Option<u64>,
}

impl StoredToken {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= now_unix())
    }
}

/// Current time as Unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Summary of stored token state.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    /// First 8 characters of the token for display purposes.
    pub token_prefix: String,
    pub expires_at_unix: Option<u64>,
    pub is_expired: bool,
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct FileTokenStore {
    token_path: PathBuf,
}

impl FileTokenStore {
    /// Create a store using the default path, if a config directory exists.
    pub fn new() -> Option<Self> {
        dirs::config_dir().map(|dir| Self {
            token_path: dir.join("vaultlink").join("token.json"),
        })
    }

    /// Create a store with a custom token path. Useful for tests.
    pub fn with_path(path: PathBuf) -> Self {
        Self { token_path: path }
    }

    pub fn path(&self) -> &Path {
        &self.token_path
    }

    /// Persist a token, replacing any previous one.
    pub async fn save(&self, access_token: &str, expires_at: Option<u64>) -> Result<(), SecretError> {
        if let Some(parent) = self.token_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stored = StoredToken {
            access_token: access_token.to_string(),
            expires_at,
        };
        let content = serde_json::to_string_pretty(&stored)?;
        tokio::fs::write(&self.token_path, &content).await?;
        tracing::debug!(path = %self.token_path.display(), ?expires_at, "Access token saved");
        Ok(())
    }

    /// Return token status. `Ok(None)` when nothing is stored.
    pub async fn status(&self) -> Result<Option<TokenStatus>, SecretError> {
        let Some(stored) = self.load().await? else {
            return Ok(None);
        };
        Ok(Some(TokenStatus {
            token_prefix: stored.access_token.chars().take(8).collect(),
            expires_at_unix: stored.expires_at,
            is_expired: stored.is_expired(),
        }))
    }

    /// Delete the stored token. Idempotent.
    pub fn clear(&self) -> Result<(), SecretError> {
        if self.token_path.exists() {
            std::fs::remove_file(&self.token_path)?;
            tracing::info!(path = %self.token_path.display(), "Access token removed");
        }
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoredToken>, SecretError> {
        if !self.token_path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.token_path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

impl SecretStore for FileTokenStore {
    fn lookup<'a>(
        &'a self,
        service: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretValue, SecretError>> + Send + 'a>> {
        Box::pin(async move {
            match self.load().await? {
                None => Err(SecretError::NotFound {
                    service: service.into(),
                }),
                Some(stored) if stored.is_expired() => {
                    tracing::warn!(service, path = %self.token_path.display(), "Stored access token expired");
                    Err(SecretError::Expired {
                        service: service.into(),
                    })
                }
                Some(stored) => Ok(SecretValue::new(stored.access_token)),
            }
        })
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
