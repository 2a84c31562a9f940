//! Development vault.
//!
//! **Not cryptographically secure.** Wrapping and encryption are a SHA-256
//! keystream XOR with a random nonce, enough to exercise the protocol and
//! state rules end to end (password validation, bootstrap, derive, clear,
//! rotation events) without a real key-management backend.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use vaultlink_core::command::{
    BootstrapOutcome, BootstrapStatus, Ciphertext, Completion, CreatedUser, FilePayload, Plaintext,
    VaultCommand, WrappedPassword,
};
use vaultlink_core::envelope::{InitMsg, VaultEvent};

use crate::boundary::BoxFuture;
use crate::service::{EventSink, VaultService};

const MIN_PASSWORD_LEN: usize = 8;
const NONCE_LEN: usize = 16;

struct Session {
    user_id: String,
    password: Zeroizing<String>,
}

#[derive(Default)]
pub struct StubVault {
    session: Option<Session>,
    working_key: Option<Zeroizing<Vec<u8>>>,
    events: Option<EventSink>,
}

impl StubVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn bootstrap(
        &mut self,
        encrypted_id: String,
        user_id: String,
        encrypted_password: Option<String>,
        password: Option<String>,
    ) -> Result<Value, String> {
        let outcome = match (password, encrypted_password) {
            (Some(password), previous) => {
                validate_password(&password)?;
                let wrapped = wrap(&user_id, &password);
                let changed = previous
                    .and_then(|prev| unwrap(&user_id, &prev).ok())
                    .is_some_and(|old| *old != password);
                self.open_session(user_id, Zeroizing::new(password));
                if changed {
                    self.emit(VaultEvent::PasswordUpdated {
                        encrypted_password: wrapped.clone(),
                    });
                }
                BootstrapOutcome {
                    status: BootstrapStatus::Ready,
                    encrypted_password: Some(wrapped),
                }
            }
            (None, Some(previous)) => {
                let password = unwrap(&user_id, &previous)?;
                self.open_session(user_id, password);
                BootstrapOutcome {
                    status: BootstrapStatus::Ready,
                    encrypted_password: None,
                }
            }
            (None, None) => BootstrapOutcome {
                status: if encrypted_id.is_empty() {
                    BootstrapStatus::NeedsSetup
                } else {
                    BootstrapStatus::NeedsPassword
                },
                encrypted_password: None,
            },
        };
        to_value(&outcome)
    }

    /// Switch identity. Any key derived for the previous session is dropped.
    fn open_session(&mut self, user_id: String, password: Zeroizing<String>) {
        self.working_key = None;
        self.session = Some(Session { user_id, password });
    }

    fn emit(&self, event: VaultEvent) {
        if let Some(events) = &self.events
            && !events.emit(event)
        {
            tracing::debug!("Host gone; dropping vault event");
        }
    }

    fn key(&self) -> Result<&[u8], String> {
        self.working_key
            .as_deref()
            .map(Vec::as_slice)
            .ok_or_else(|| "keys not derived".to_string())
    }

    fn dispatch(&mut self, command: VaultCommand) -> Result<Value, String> {
        match command {
            VaultCommand::Bootstrap {
                encrypted_id,
                user_id,
                encrypted_password,
                password,
            } => self.bootstrap(encrypted_id, user_id, encrypted_password, password),
            VaultCommand::SetPassword {
                password,
                encrypted_id: _,
                user_id,
            } => {
                validate_password(&password)?;
                let encrypted_password = wrap(&user_id, &password);
                self.open_session(user_id, Zeroizing::new(password));
                to_value(&WrappedPassword { encrypted_password })
            }
            VaultCommand::CreateUserPassword { password, user_id } => {
                validate_password(&password)?;
                let encrypted_password = wrap(&user_id, &password);
                let encrypted_id = uuid::Uuid::new_v4().simple().to_string();
                self.open_session(user_id, Zeroizing::new(password));
                to_value(&CreatedUser {
                    encrypted_password,
                    encrypted_id,
                })
            }
            VaultCommand::UpdateKey { encrypted_password } => {
                let session = self.session.as_ref().ok_or("no identity bootstrapped")?;
                let password = unwrap(&session.user_id, &encrypted_password)?;
                if *password != *session.password {
                    return Err("wrapped password does not match session".into());
                }
                to_value(&WrappedPassword {
                    encrypted_password: wrap(&session.user_id, &password),
                })
            }
            VaultCommand::Derive => {
                let session = self.session.as_ref().ok_or("no identity bootstrapped")?;
                let mut hasher = Sha256::new();
                hasher.update(b"vaultlink-stub-derive");
                hasher.update(session.user_id.as_bytes());
                hasher.update(session.password.as_bytes());
                self.working_key = Some(Zeroizing::new(hasher.finalize().to_vec()));
                to_value(&Completion { ok: true })
            }
            VaultCommand::Encrypt { plaintext } => {
                let sealed = seal(self.key()?, plaintext.as_bytes());
                to_value(&Ciphertext {
                    ciphertext: hex::encode(sealed),
                })
            }
            VaultCommand::Decrypt { ciphertext } => {
                let sealed = hex::decode(&ciphertext).map_err(|_| "malformed ciphertext")?;
                let bytes = open(self.key()?, &sealed)?;
                let plaintext = String::from_utf8(bytes).map_err(|_| "ciphertext is not text")?;
                to_value(&Plaintext { plaintext })
            }
            VaultCommand::EncryptFile {
                data, file_name, ..
            } => {
                tracing::debug!(file_name = %file_name, bytes = data.len(), "Encrypting file");
                to_value(&FilePayload {
                    data: seal(self.key()?, &data),
                })
            }
            VaultCommand::DecryptFile {
                data, file_name, ..
            } => {
                tracing::debug!(file_name = %file_name, bytes = data.len(), "Decrypting file");
                to_value(&FilePayload {
                    data: open(self.key()?, &data)?,
                })
            }
            VaultCommand::ClearKeys => {
                self.working_key = None;
                self.session = None;
                to_value(&Completion { ok: true })
            }
        }
    }
}

impl VaultService for StubVault {
    fn accept(&mut self, init: &InitMsg, events: EventSink) -> bool {
        if init.access_token.is_empty() {
            tracing::warn!("Rejecting init without access token");
            return false;
        }
        // Returning sessions may arrive pre-bootstrapped through init.
        if let (Some(user_id), Some(wrapped)) = (&init.user_id, &init.encrypted_password)
            && let Ok(password) = unwrap(user_id, wrapped)
        {
            self.open_session(user_id.clone(), password);
        }
        self.events = Some(events);
        true
    }

    fn handle(&mut self, command: VaultCommand) -> BoxFuture<'_, Result<Value, String>> {
        Box::pin(async move { self.dispatch(command) })
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        ));
    }
    Ok(())
}

fn wrap_key(user_id: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"vaultlink-stub-wrap");
    hasher.update(user_id.as_bytes());
    hasher.finalize().to_vec()
}

fn wrap(user_id: &str, password: &str) -> String {
    hex::encode(seal(&wrap_key(user_id), password.as_bytes()))
}

fn unwrap(user_id: &str, wrapped: &str) -> Result<Zeroizing<String>, String> {
    let sealed = hex::decode(wrapped).map_err(|_| "corrupt wrapped password")?;
    let bytes = open(&wrap_key(user_id), &sealed)?;
    String::from_utf8(bytes)
        .map(Zeroizing::new)
        .map_err(|_| "corrupt wrapped password".to_string())
}

/// `nonce || data ^ keystream(key, nonce)`
fn seal(key: &[u8], data: &[u8]) -> Vec<u8> {
    let nonce = *uuid::Uuid::new_v4().as_bytes();
    let mut out = Vec::with_capacity(NONCE_LEN + data.len());
    out.extend_from_slice(&nonce);
    out.extend(xor_keystream(key, &nonce, data));
    out
}

fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, String> {
    if sealed.len() < NONCE_LEN {
        return Err("sealed payload too short".into());
    }
    let (nonce, body) = sealed.split_at(NONCE_LEN);
    Ok(xor_keystream(key, nonce, body))
}

fn xor_keystream(key: &[u8], nonce: &[u8], data: &[u8]) -> Vec<u8> {
    data.chunks(32)
        .enumerate()
        .flat_map(|(block, chunk)| {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update(nonce);
            hasher.update((block as u64).to_le_bytes());
            let pad = hasher.finalize();
            chunk
                .iter()
                .zip(pad)
                .map(|(b, p)| b ^ p)
                .collect::<Vec<u8>>()
        })
        .collect()
}
