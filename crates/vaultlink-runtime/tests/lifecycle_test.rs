/// Lifecycle and multiplexing behaviour of `VaultClient` against a scripted
/// boundary the test drives by hand, plus an end-to-end run against the
/// in-process stub vault.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use vaultlink_core::command::{
    BootstrapOutcome, BootstrapParams, BootstrapStatus, Ciphertext, Completion,
};
use vaultlink_core::envelope::{InitMsg, VaultEvent, VaultRequest, VaultResponse};
use vaultlink_core::{LifecyclePhase, VaultCommand, VaultError, VaultState};
use vaultlink_runtime::boundary::BoxFuture;
use vaultlink_runtime::channel::Port;
use vaultlink_runtime::{
    Boundary, BoundaryLauncher, EngineSettings, InProcessLauncher, SandboxPolicy, StubVault,
    VaultClient,
};
use vaultlink_secrets::MemorySecretStore;

// ── Scripted boundary ────────────────────────────────────────────────────────

/// The boundary's side of one launched context, handed to the test.
struct Remote {
    init: InitMsg,
    port: Port,
}

impl Remote {
    fn ack(&self, ok: bool) {
        self.port.post(format!(r#"{{"ok":{ok}}}"#)).unwrap();
    }

    async fn next_request(&mut self) -> VaultRequest {
        let raw = self.port.recv().await.expect("host endpoint closed");
        VaultRequest::from_json(&raw).unwrap()
    }

    fn respond<T: Serialize>(&self, id: &str, result: &T) {
        let response = VaultResponse::success(id, result).unwrap();
        self.port.post(response.to_json().unwrap()).unwrap();
    }
}

struct ScriptedLauncher {
    launches: AtomicUsize,
    hang_load: AtomicBool,
    remotes: mpsc::UnboundedSender<Remote>,
}

impl BoundaryLauncher for ScriptedLauncher {
    fn launch<'a>(
        &'a self,
        _policy: &'a SandboxPolicy,
    ) -> BoxFuture<'a, Result<Box<dyn Boundary>, VaultError>> {
        Box::pin(async move {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedBoundary {
                hang_load: self.hang_load.load(Ordering::SeqCst),
                remotes: self.remotes.clone(),
            }) as Box<dyn Boundary>)
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedBoundary {
    hang_load: bool,
    remotes: mpsc::UnboundedSender<Remote>,
}

impl Boundary for ScriptedBoundary {
    fn wait_loaded(&mut self) -> BoxFuture<'_, Result<(), VaultError>> {
        let hang = self.hang_load;
        Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }

    fn transfer(&mut self, init: InitMsg, port: Port) -> BoxFuture<'_, Result<(), VaultError>> {
        let sent = self.remotes.send(Remote { init, port });
        Box::pin(async move { sent.map_err(|_| VaultError::BoundaryClosed) })
    }

    fn shutdown(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        load_timeout: Duration::from_secs(10),
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(30),
        max_request_age: Duration::from_secs(60),
        ..EngineSettings::default()
    }
}

fn scripted() -> (VaultClient, Arc<ScriptedLauncher>, mpsc::UnboundedReceiver<Remote>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(ScriptedLauncher {
        launches: AtomicUsize::new(0),
        hang_load: AtomicBool::new(false),
        remotes: tx,
    });
    let client = VaultClient::new(
        settings(),
        launcher.clone(),
        Arc::new(MemorySecretStore::single("vault", "test-token")),
    );
    (client, launcher, rx)
}

/// Initialize `client`, acking the handshake from the test side.
async fn ready(client: &VaultClient, remotes: &mut mpsc::UnboundedReceiver<Remote>) -> Remote {
    let init = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });
    let remote = remotes.recv().await.unwrap();
    remote.ack(true);
    init.await.unwrap().unwrap();
    remote
}

fn ciphertext(text: &str) -> Ciphertext {
    Ciphertext {
        ciphertext: format!("sealed:{text}"),
    }
}

// ── Handshake and initialization ─────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_from_idle_launches_and_handshakes_first() {
    let (client, launcher, mut remotes) = scripted();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.bootstrap(BootstrapParams::new("u1", "user-1")).await }
    });

    let mut remote = remotes.recv().await.unwrap();
    assert_eq!(remote.init.encrypted_id.as_deref(), Some("u1"));
    assert_eq!(remote.init.user_id.as_deref(), Some("user-1"));
    assert_eq!(remote.init.access_token, "test-token");
    assert!(client.state().is_loading);

    // Nothing may cross the channel before the ack.
    let early = tokio::time::timeout(Duration::from_millis(50), remote.port.recv()).await;
    assert!(early.is_err(), "request sent before handshake completed");

    remote.ack(true);
    let request = remote.next_request().await;
    assert_eq!(request.id, "req_1");
    assert_eq!(
        request.command,
        VaultCommand::Bootstrap {
            encrypted_id: "u1".into(),
            user_id: "user-1".into(),
            encrypted_password: None,
            password: None,
        }
    );
    remote.respond(
        &request.id,
        &BootstrapOutcome {
            status: BootstrapStatus::NeedsPassword,
            encrypted_password: None,
        },
    );

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome.status, BootstrapStatus::NeedsPassword);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    let state = client.state();
    assert!(state.is_ready);
    assert!(!state.is_loading);
    assert!(state.needs_password);
    assert_eq!(client.phase(), LifecyclePhase::Ready);
}

#[tokio::test]
async fn concurrent_initialize_launches_one_boundary() {
    let (client, launcher, mut remotes) = scripted();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });

    let remote = remotes.recv().await.unwrap();
    remote.ack(true);

    assert_eq!(first.await.unwrap(), Ok(()));
    assert_eq!(second.await.unwrap(), Ok(()));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert!(remotes.try_recv().is_err());

    // Already ready: no further launch.
    client.initialize(None).await.unwrap();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn load_timeout_cleans_up_and_allows_retry() {
    let (client, launcher, mut remotes) = scripted();
    launcher.hang_load.store(true, Ordering::SeqCst);

    let err = client.initialize(None).await.unwrap_err();
    assert_eq!(err, VaultError::BoundaryLoadTimeout(Duration::from_secs(10)));
    assert_eq!(client.phase(), LifecyclePhase::Error);
    let state = client.state();
    assert!(!state.is_ready && !state.is_loading);
    assert!(state.error.is_some());

    launcher.hang_load.store(false, Ordering::SeqCst);
    ready(&client, &mut remotes).await;
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert!(client.state().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn silent_boundary_fails_handshake() {
    let (client, _launcher, mut remotes) = scripted();

    let init = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });
    let _remote = remotes.recv().await.unwrap();

    assert_eq!(
        init.await.unwrap(),
        Err(VaultError::HandshakeTimeout(Duration::from_secs(5)))
    );
    assert_eq!(client.phase(), LifecyclePhase::Error);
}

#[tokio::test]
async fn rejected_ack_fails_initialization() {
    let (client, _launcher, mut remotes) = scripted();

    let init = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });
    remotes.recv().await.unwrap().ack(false);

    assert_eq!(init.await.unwrap(), Err(VaultError::InvalidAck));
    assert_eq!(client.state().error.as_deref(), Some("boundary rejected the handshake"));

    // Retry succeeds with a fresh boundary.
    ready(&client, &mut remotes).await;
    assert!(client.state().is_ready);
}

#[tokio::test]
async fn missing_credential_launches_nothing() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(ScriptedLauncher {
        launches: AtomicUsize::new(0),
        hang_load: AtomicBool::new(false),
        remotes: tx,
    });
    let client = VaultClient::new(
        settings(),
        launcher.clone(),
        Arc::new(MemorySecretStore::new(HashMap::new())),
    );

    let err = client.initialize(None).await.unwrap_err();
    assert!(matches!(err, VaultError::Credential(_)));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

// ── Multiplexing ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_commands_each_get_their_own_outcome() {
    let (client, _launcher, mut remotes) = scripted();
    let mut remote = ready(&client, &mut remotes).await;

    let texts = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let calls: Vec<_> = texts
        .iter()
        .map(|text| {
            let client = client.clone();
            let text = text.to_string();
            tokio::spawn(async move { client.encrypt(text).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..texts.len() {
        requests.push(remote.next_request().await);
    }
    // Answer out of order, with a stray response mixed in.
    remote.respond("req_999", &ciphertext("nobody"));
    for request in requests.iter().rev() {
        let VaultCommand::Encrypt { plaintext } = &request.command else {
            panic!("unexpected command {:?}", request.command);
        };
        remote.respond(&request.id, &ciphertext(plaintext));
    }

    for (call, text) in calls.into_iter().zip(texts) {
        assert_eq!(call.await.unwrap().unwrap(), format!("sealed:{text}"));
    }
    assert_eq!(client.pending_requests(), 0);
    assert!(client.state().is_ready);
}

#[tokio::test]
async fn boundary_error_is_surfaced_verbatim() {
    let (client, _launcher, mut remotes) = scripted();
    let mut remote = ready(&client, &mut remotes).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.decrypt("garbage").await }
    });
    let request = remote.next_request().await;
    let failure = VaultResponse::failure(request.id, "corrupt ciphertext");
    remote.port.post(failure.to_json().unwrap()).unwrap();

    assert_eq!(
        call.await.unwrap(),
        Err(VaultError::Vault("corrupt ciphertext".into()))
    );
}

#[tokio::test]
async fn negative_completion_is_an_error() {
    let (client, _launcher, mut remotes) = scripted();
    let mut remote = ready(&client, &mut remotes).await;

    let derive = tokio::spawn({
        let client = client.clone();
        async move { client.derive().await }
    });
    let request = remote.next_request().await;
    assert_eq!(request.command, VaultCommand::Derive);
    remote.respond(&request.id, &Completion { ok: false });
    assert_eq!(
        derive.await.unwrap(),
        Err(VaultError::Vault("derive reported failure".into()))
    );

    let clear = tokio::spawn({
        let client = client.clone();
        async move { client.clear_keys().await }
    });
    let request = remote.next_request().await;
    assert_eq!(request.command, VaultCommand::ClearKeys);
    remote.respond(&request.id, &Completion { ok: false });
    assert_eq!(
        clear.await.unwrap(),
        Err(VaultError::Vault("clearKeys reported failure".into()))
    );

    let derive = tokio::spawn({
        let client = client.clone();
        async move { client.derive().await }
    });
    let request = remote.next_request().await;
    remote.respond(&request.id, &Completion { ok: true });
    assert_eq!(derive.await.unwrap(), Ok(()));
    assert_eq!(client.phase(), LifecyclePhase::Ready);
}

#[tokio::test(start_paused = true)]
async fn unanswered_encrypt_times_out_and_late_reply_is_dropped() {
    let (client, _launcher, mut remotes) = scripted();
    let mut remote = ready(&client, &mut remotes).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.encrypt("hello").await }
    });
    let request = remote.next_request().await;

    assert_eq!(
        call.await.unwrap(),
        Err(VaultError::RequestTimeout {
            id: request.id.clone(),
            cmd: "encrypt".into(),
        })
    );
    assert_eq!(client.pending_requests(), 0);

    remote.respond(&request.id, &ciphertext("hello"));
    tokio::task::yield_now().await;
    assert!(client.state().is_ready);

    // The engine keeps working after the stray reply.
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.encrypt("again").await }
    });
    let request = remote.next_request().await;
    remote.respond(&request.id, &ciphertext("again"));
    assert_eq!(call.await.unwrap().unwrap(), "sealed:again");
}

// ── Reset and teardown ───────────────────────────────────────────────────────

#[tokio::test]
async fn reset_rejects_pending_and_next_command_reinitializes() {
    let (client, launcher, mut remotes) = scripted();
    let _remote = ready(&client, &mut remotes).await;

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.encrypt(format!("m{i}")).await })
        })
        .collect();
    while client.pending_requests() < 3 {
        tokio::task::yield_now().await;
    }

    client.reset().await;
    for call in calls {
        assert_eq!(call.await.unwrap(), Err(VaultError::VaultReset));
    }
    assert_eq!(client.state(), VaultState::default());
    assert_eq!(client.phase(), LifecyclePhase::Idle);
    assert_eq!(client.pending_requests(), 0);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.encrypt("fresh").await }
    });
    let mut remote = remotes.recv().await.unwrap();
    remote.ack(true);
    let request = remote.next_request().await;
    remote.respond(&request.id, &ciphertext("fresh"));

    assert_eq!(call.await.unwrap().unwrap(), "sealed:fresh");
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reset_is_idempotent() {
    let (client, _launcher, mut remotes) = scripted();
    client.reset().await;
    client.reset().await;
    assert_eq!(client.phase(), LifecyclePhase::Idle);

    let _remote = ready(&client, &mut remotes).await;
    client.reset().await;
    client.reset().await;
    assert_eq!(client.state(), VaultState::default());
}

#[tokio::test]
async fn reset_during_handshake_aborts_initialization() {
    let (client, _launcher, mut remotes) = scripted();

    let init = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });
    let remote = remotes.recv().await.unwrap();
    assert_eq!(client.phase(), LifecyclePhase::Handshaking);

    client.reset().await;
    assert_eq!(init.await.unwrap(), Err(VaultError::VaultReset));
    assert_eq!(client.phase(), LifecyclePhase::Idle);

    // The abandoned boundary's ack arrives on a dead channel.
    assert!(remote.port.post(r#"{"ok":true}"#.into()).is_err());
    assert_eq!(client.phase(), LifecyclePhase::Idle);
}

#[tokio::test]
async fn dropped_initialize_does_not_wedge_the_engine() {
    let (client, launcher, mut remotes) = scripted();

    let init = tokio::spawn({
        let client = client.clone();
        async move { client.initialize(None).await }
    });
    let _abandoned = remotes.recv().await.unwrap();
    init.abort();
    let _ = init.await;
    assert_eq!(client.phase(), LifecyclePhase::Idle);

    ready(&client, &mut remotes).await;
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lost_boundary_fails_pending_and_recovers() {
    let (client, launcher, mut remotes) = scripted();
    let mut remote = ready(&client, &mut remotes).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.derive().await }
    });
    let _request = remote.next_request().await;
    drop(remote);

    assert_eq!(call.await.unwrap(), Err(VaultError::BoundaryClosed));
    assert_eq!(client.phase(), LifecyclePhase::Error);
    assert!(!client.state().is_ready);

    ready(&client, &mut remotes).await;
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
}

// ── Push notifications ───────────────────────────────────────────────────────

#[tokio::test]
async fn push_events_bypass_correlation() {
    let (client, _launcher, mut remotes) = scripted();
    let mut events = client.subscribe();
    let remote = ready(&client, &mut remotes).await;

    remote
        .port
        .post(r#"{"cmd":"passwordUpdated","encryptedPassword":"w2"}"#.into())
        .unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        VaultEvent::PasswordUpdated {
            encrypted_password: "w2".into()
        }
    );
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn state_changes_are_observable() {
    let (client, _launcher, mut remotes) = scripted();
    let mut watch = client.watch_state();
    assert!(!watch.borrow_and_update().is_ready);

    let _remote = ready(&client, &mut remotes).await;
    watch.changed().await.unwrap();
    assert!(watch.borrow_and_update().is_ready);
}

// ── Stub vault, in process ───────────────────────────────────────────────────

fn stub_client() -> (VaultClient, Arc<InProcessLauncher>) {
    let launcher = Arc::new(InProcessLauncher::new(|| Box::new(StubVault::new())));
    let client = VaultClient::new(
        settings(),
        launcher.clone(),
        Arc::new(MemorySecretStore::single("vault", "test-token")),
    );
    (client, launcher)
}

#[tokio::test]
async fn stub_vault_full_session() {
    let (client, launcher) = stub_client();

    let created = client
        .create_user_password("correct horse", "user-1")
        .await
        .unwrap();
    assert!(!created.encrypted_id.is_empty());
    client.derive().await.unwrap();

    let sealed = client.encrypt("hello").await.unwrap();
    assert_ne!(sealed, "hello");
    assert_eq!(client.decrypt(sealed).await.unwrap(), "hello");

    let bytes = vec![7u8; 100];
    let sealed = client
        .encrypt_file(bytes.clone(), "notes.bin", "application/octet-stream")
        .await
        .unwrap();
    let opened = client
        .decrypt_file(sealed, "notes.bin", "application/octet-stream")
        .await
        .unwrap();
    assert_eq!(opened, bytes);

    let rotated = client
        .update_key(created.encrypted_password.clone())
        .await
        .unwrap();
    assert_ne!(rotated.encrypted_password, created.encrypted_password);

    client.clear_keys().await.unwrap();
    assert_eq!(
        client.encrypt("after clear").await,
        Err(VaultError::Vault("keys not derived".into()))
    );
    assert_eq!(launcher.launch_count(), 1);
}

#[tokio::test]
async fn stub_vault_rejects_short_password() {
    let (client, _launcher) = stub_client();
    assert_eq!(
        client.set_password("short", "u1", "user-1").await,
        Err(VaultError::Vault(
            "password must be at least 8 characters".into()
        ))
    );
}

#[tokio::test]
async fn returning_session_with_new_password_emits_rotation() {
    let (client, _launcher) = stub_client();
    let mut events = client.subscribe();

    let created = client
        .create_user_password("first password", "user-1")
        .await
        .unwrap();
    let outcome = client
        .bootstrap(
            BootstrapParams::new(created.encrypted_id, "user-1")
                .with_encrypted_password(created.encrypted_password)
                .with_password("second password"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, BootstrapStatus::Ready);
    let rewrapped = outcome.encrypted_password.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        VaultEvent::PasswordUpdated {
            encrypted_password: rewrapped
        }
    );
    assert!(!client.state().needs_password);
}
