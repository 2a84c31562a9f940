//! Typed command API on top of the multiplexer.

use serde::de::DeserializeOwned;

use vaultlink_core::command::{
    BootstrapOutcome, BootstrapParams, BootstrapStatus, Ciphertext, Completion, CreatedUser,
    FilePayload, Plaintext, VaultCommand, WrappedPassword,
};
use vaultlink_core::envelope::VaultResponse;
use vaultlink_core::error::VaultError;

use crate::lifecycle::VaultClient;

impl VaultClient {
    /// Send one command and wait for its response, initializing first when
    /// the engine is not ready.
    pub async fn send(&self, command: VaultCommand) -> Result<VaultResponse, VaultError> {
        self.send_with(None, command).await
    }

    async fn send_with(
        &self,
        params: Option<BootstrapParams>,
        command: VaultCommand,
    ) -> Result<VaultResponse, VaultError> {
        let link = self.ready_link(params).await?;
        self.inner.multiplexer.dispatch(&link, command).await
    }

    async fn call<T: DeserializeOwned>(&self, command: VaultCommand) -> Result<T, VaultError> {
        self.send(command).await?.into_result()
    }

    async fn call_completion(&self, command: VaultCommand) -> Result<(), VaultError> {
        let cmd = command.name();
        let done: Completion = self.call(command).await?;
        if done.ok {
            Ok(())
        } else {
            Err(VaultError::Vault(format!("{cmd} reported failure")))
        }
    }

    fn set_needs_password(&self, needs_password: bool) {
        self.inner.state.send_if_modified(|s| {
            let changed = s.needs_password != needs_password;
            s.needs_password = needs_password;
            changed
        });
    }

    // ── Key setup ────────────────────────────────────────────────────────────

    /// First-run or returning-session key setup. The identity also goes into
    /// the `init` envelope when this call is what launches the boundary.
    pub async fn bootstrap(&self, params: BootstrapParams) -> Result<BootstrapOutcome, VaultError> {
        let outcome: BootstrapOutcome = self
            .send_with(Some(params.clone()), params.into())
            .await?
            .into_result()?;
        self.set_needs_password(outcome.status == BootstrapStatus::NeedsPassword);
        tracing::info!(status = ?outcome.status, "Bootstrap complete");
        Ok(outcome)
    }

    pub async fn set_password(
        &self,
        password: impl Into<String>,
        encrypted_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<WrappedPassword, VaultError> {
        let wrapped: WrappedPassword = self
            .call(VaultCommand::SetPassword {
                password: password.into(),
                encrypted_id: encrypted_id.into(),
                user_id: user_id.into(),
            })
            .await?;
        self.set_needs_password(false);
        Ok(wrapped)
    }

    pub async fn create_user_password(
        &self,
        password: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<CreatedUser, VaultError> {
        let created: CreatedUser = self
            .call(VaultCommand::CreateUserPassword {
                password: password.into(),
                user_id: user_id.into(),
            })
            .await?;
        self.set_needs_password(false);
        Ok(created)
    }

    /// Re-wrap key material; returns the new wrapped password.
    pub async fn update_key(
        &self,
        previous: impl Into<String>,
    ) -> Result<WrappedPassword, VaultError> {
        self.call(VaultCommand::UpdateKey {
            encrypted_password: previous.into(),
        })
        .await
    }

    pub async fn derive(&self) -> Result<(), VaultError> {
        self.call_completion(VaultCommand::Derive).await
    }

    pub async fn clear_keys(&self) -> Result<(), VaultError> {
        self.call_completion(VaultCommand::ClearKeys).await
    }

    // ── Payloads ─────────────────────────────────────────────────────────────

    pub async fn encrypt(&self, plaintext: impl Into<String>) -> Result<String, VaultError> {
        let out: Ciphertext = self
            .call(VaultCommand::Encrypt {
                plaintext: plaintext.into(),
            })
            .await?;
        Ok(out.ciphertext)
    }

    pub async fn decrypt(&self, ciphertext: impl Into<String>) -> Result<String, VaultError> {
        let out: Plaintext = self
            .call(VaultCommand::Decrypt {
                ciphertext: ciphertext.into(),
            })
            .await?;
        Ok(out.plaintext)
    }

    pub async fn encrypt_file(
        &self,
        data: Vec<u8>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Result<Vec<u8>, VaultError> {
        let out: FilePayload = self
            .call(VaultCommand::EncryptFile {
                data,
                file_name: file_name.into(),
                file_type: file_type.into(),
            })
            .await?;
        Ok(out.data)
    }

    pub async fn decrypt_file(
        &self,
        data: Vec<u8>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Result<Vec<u8>, VaultError> {
        let out: FilePayload = self
            .call(VaultCommand::DecryptFile {
                data,
                file_name: file_name.into(),
                file_type: file_type.into(),
            })
            .await?;
        Ok(out.data)
    }
}
