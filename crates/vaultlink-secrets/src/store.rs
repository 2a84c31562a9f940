use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use zeroize::Zeroize;

use crate::error::SecretError;

/// A resolved credential. Held only long enough to build the `init`
/// envelope; wiped from memory on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct SecretValue {
    value: String,
}

impl SecretValue {
    pub fn new(value: String) -> Self {
        Self { value }
    }

    /// Get the raw credential value.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

/// Trait for credential backends.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait SecretStore: Send + Sync {
    /// Look up a credential by service name.
    fn lookup<'a>(
        &'a self,
        service: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretValue, SecretError>> + Send + 'a>>;

    /// Backend name for logging and configuration.
    fn backend_name(&self) -> &str;
}

/// Environment variable backend.
///
/// Service name mapping: "vault" -> "VAULTLINK_ACCESS_TOKEN"; anything else
/// falls back to `<SERVICE_NAME_UPPER>_TOKEN`.
pub struct EnvSecretStore {
    mappings: HashMap<String, String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self {
            mappings: Self::default_mappings(),
        }
    }

    pub fn with_mappings(mappings: HashMap<String, String>) -> Self {
        let mut store = Self::new();
        store.mappings.extend(mappings);
        store
    }

    fn default_mappings() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("vault".into(), "VAULTLINK_ACCESS_TOKEN".into());
        m
    }

    fn resolve_env_var(&self, service: &str) -> String {
        if let Some(var) = self.mappings.get(service) {
            return var.clone();
        }
        format!("{}_TOKEN", service.to_uppercase())
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for EnvSecretStore {
    fn lookup<'a>(
        &'a self,
        service: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretValue, SecretError>> + Send + 'a>> {
        Box::pin(async move {
            let env_var = self.resolve_env_var(service);

            match std::env::var(&env_var) {
                Ok(value) if !value.is_empty() => {
                    tracing::debug!(service = %service, env_var = %env_var, "Secret resolved");
                    Ok(SecretValue::new(value))
                }
                _ => {
                    tracing::debug!(service = %service, env_var = %env_var, "Secret not set");
                    Err(SecretError::NotFound {
                        service: service.into(),
                    })
                }
            }
        })
    }

    fn backend_name(&self) -> &str {
        "env"
    }
}

/// In-memory secret store for testing and embedding.
pub struct MemorySecretStore {
    secrets: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// A store holding exactly one credential.
    pub fn single(service: &str, value: &str) -> Self {
        Self::new(HashMap::from([(service.to_string(), value.to_string())]))
    }
}

impl SecretStore for MemorySecretStore {
    fn lookup<'a>(
        &'a self,
        service: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretValue, SecretError>> + Send + 'a>> {
        Box::pin(async move {
            match self.secrets.get(service) {
                Some(value) => Ok(SecretValue::new(value.clone())),
                None => Err(SecretError::NotFound {
                    service: service.into(),
                }),
            }
        })
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

/// Tries each backend in order; the first hit wins.
///
/// `NotFound` moves on to the next backend. Any other error (an expired
/// token, an unreadable file) stops the search so it is not masked by a
/// later backend.
pub struct ChainedSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl ChainedSecretStore {
    pub fn new(stores: Vec<Arc<dyn SecretStore>>) -> Self {
        Self { stores }
    }
}

impl SecretStore for ChainedSecretStore {
    fn lookup<'a>(
        &'a self,
        service: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SecretValue, SecretError>> + Send + 'a>> {
        Box::pin(async move {
            for store in &self.stores {
                match store.lookup(service).await {
                    Ok(value) => {
                        tracing::debug!(service, backend = store.backend_name(), "Secret resolved");
                        return Ok(value);
                    }
                    Err(SecretError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(SecretError::NotFound {
                service: service.into(),
            })
        })
    }

    fn backend_name(&self) -> &str {
        "chain"
    }
}
