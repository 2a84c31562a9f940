use serde::{Deserialize, Serialize};

/// One operation the boundary knows how to perform.
///
/// Serializes to the request body without the correlation id; the `cmd`
/// field carries the variant name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VaultCommand {
    /// First-run or returning-session key setup.
    Bootstrap {
        encrypted_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Set the password for an identity that has none yet.
    SetPassword {
        password: String,
        encrypted_id: String,
        user_id: String,
    },
    /// First-time password plus identity creation.
    CreateUserPassword { password: String, user_id: String },
    /// Re-wrap key material, e.g. after the access credential rotated.
    UpdateKey { encrypted_password: String },
    /// Materialize working keys from bootstrapped state.
    Derive,
    Encrypt { plaintext: String },
    Decrypt { ciphertext: String },
    EncryptFile {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        file_name: String,
        file_type: String,
    },
    DecryptFile {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        file_name: String,
        file_type: String,
    },
    /// Erase in-memory key material.
    ClearKeys,
}

impl VaultCommand {
    /// Wire name of the command, used for logging and timeout errors.
    pub fn name(&self) -> &'static str {
        match self {
            VaultCommand::Bootstrap { .. } => "bootstrap",
            VaultCommand::SetPassword { .. } => "setPassword",
            VaultCommand::CreateUserPassword { .. } => "createUserPassword",
            VaultCommand::UpdateKey { .. } => "updateKey",
            VaultCommand::Derive => "derive",
            VaultCommand::Encrypt { .. } => "encrypt",
            VaultCommand::Decrypt { .. } => "decrypt",
            VaultCommand::EncryptFile { .. } => "encryptFile",
            VaultCommand::DecryptFile { .. } => "decryptFile",
            VaultCommand::ClearKeys => "clearKeys",
        }
    }
}

/// Identity handed to `bootstrap` and, optionally, to the `init` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapParams {
    pub encrypted_id: String,
    pub user_id: String,
    pub encrypted_password: Option<String>,
    pub password: Option<String>,
}

impl BootstrapParams {
    pub fn new(encrypted_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            encrypted_id: encrypted_id.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_encrypted_password(mut self, encrypted_password: impl Into<String>) -> Self {
        self.encrypted_password = Some(encrypted_password.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl From<BootstrapParams> for VaultCommand {
    fn from(p: BootstrapParams) -> Self {
        VaultCommand::Bootstrap {
            encrypted_id: p.encrypted_id,
            user_id: p.user_id,
            encrypted_password: p.encrypted_password,
            password: p.password,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BootstrapStatus {
    /// Key material is in place; `derive` may follow.
    Ready,
    /// The identity exists but no usable password was supplied.
    NeedsPassword,
    /// The identity has never been configured.
    NeedsSetup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapOutcome {
    pub status: BootstrapStatus,
    /// Newly wrapped password when the boundary re-wrapped during bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedPassword {
    pub encrypted_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUser {
    pub encrypted_password: String,
    pub encrypted_id: String,
}

/// Body of `derive` and `clearKeys` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    pub plaintext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Binary payloads travel as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
