use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable that overrides `boundary.program`.
pub const BOUNDARY_ENV: &str = "VAULTLINK_BOUNDARY";

const CONFIG_FILE: &str = "vaultlink.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub boundary: BoundaryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoundaryConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Pass the host environment through to the boundary. Off by default.
    #[serde(default)]
    pub inherit_env: bool,
    /// Variables copied into an otherwise empty boundary environment.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Forward the boundary's stderr instead of discarding it.
    #[serde(default)]
    pub show_output: bool,
    /// Secret store service name holding the `init` access token.
    #[serde(default = "default_token_service")]
    pub access_token_service: String,
}

fn default_program() -> String {
    "vaultlink-vault".into()
}
fn default_token_service() -> String {
    "vault".into()
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            inherit_env: false,
            env_allowlist: Vec::new(),
            working_dir: None,
            show_output: false,
            access_token_service: default_token_service(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_load_ms")]
    pub load_ms: u64,
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_request_age_ms")]
    pub max_request_age_ms: u64,
}

fn default_load_ms() -> u64 {
    10_000
}
fn default_handshake_ms() -> u64 {
    5_000
}
fn default_request_ms() -> u64 {
    30_000
}
fn default_sweep_interval_ms() -> u64 {
    30_000
}
fn default_max_request_age_ms() -> u64 {
    60_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            load_ms: default_load_ms(),
            handshake_ms: default_handshake_ms(),
            request_ms: default_request_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_request_age_ms: default_max_request_age_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn load(&self) -> Duration {
        Duration::from_millis(self.load_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_request_age(&self) -> Duration {
        Duration::from_millis(self.max_request_age_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("load_ms", self.load_ms),
            ("handshake_ms", self.handshake_ms),
            ("request_ms", self.request_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("max_request_age_ms", self.max_request_age_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("timeouts.{name} must be > 0")));
            }
        }
        Ok(())
    }
}

impl VaultConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: VaultConfig = toml::from_str(content)?;
        config.timeouts.validate()?;
        Ok(config)
    }

    /// Resolve configuration: explicit path, then `./vaultlink.toml`, then
    /// `~/.config/vaultlink/vaultlink.toml`, then built-in defaults. The
    /// boundary program can always be overridden through `VAULTLINK_BOUNDARY`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::candidate_paths().into_iter().find(|p| p.exists()) {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "Loading config");
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        if let Ok(program) = std::env::var(BOUNDARY_ENV)
            && !program.is_empty()
        {
            config.boundary.program = program;
        }
        Ok(config)
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("vaultlink").join(CONFIG_FILE));
        }
        paths
    }
}
