use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use vaultlink_core::{BootstrapParams, BootstrapStatus, VaultConfig};
use vaultlink_runtime::{StubVault, VaultClient, serve_stdio};
use vaultlink_secrets::FileTokenStore;
use vaultlink_secrets::token_file::now_unix;

#[derive(Parser)]
#[command(
    name = "vaultlink",
    about = "vaultlink: run key operations inside an isolated vault boundary"
)]
struct Cli {
    /// Path to vaultlink.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Boundary program to launch (overrides config and VAULTLINK_BOUNDARY)
    #[arg(long, global = true)]
    boundary: Option<String>,

    /// Argument passed to the boundary program; repeatable
    #[arg(long = "boundary-arg", global = true, allow_hyphen_values = true)]
    boundary_args: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a text payload
    Encrypt {
        plaintext: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Decrypt a text payload
    Decrypt {
        ciphertext: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Encrypt a file
    EncryptFile {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        file_type: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Decrypt a file
    DecryptFile {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        file_type: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Create a password-protected identity
    CreateUser {
        #[arg(long, env = "VAULTLINK_USER_ID")]
        user_id: String,
        #[arg(long, env = "VAULTLINK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Set the password of an identity that has none yet
    SetPassword {
        #[arg(long, env = "VAULTLINK_ENCRYPTED_ID")]
        encrypted_id: String,
        #[arg(long, env = "VAULTLINK_USER_ID")]
        user_id: String,
        #[arg(long, env = "VAULTLINK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Re-wrap key material and print the new wrapped password
    Rotate {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Launch the boundary, report its state, and shut it down
    Status,
    /// Manage the stored access token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Serve the development vault on stdio (boundary side)
    #[command(hide = true)]
    StubVault,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Store an access token
    Set {
        token: String,
        /// Lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
    },
    /// Show the stored token
    Status,
    /// Remove the stored token
    Clear,
}

/// Identity of a returning session.
#[derive(Args)]
struct SessionArgs {
    #[arg(long, env = "VAULTLINK_ENCRYPTED_ID")]
    encrypted_id: String,
    #[arg(long, env = "VAULTLINK_USER_ID")]
    user_id: String,
    #[arg(long, env = "VAULTLINK_ENCRYPTED_PASSWORD", hide_env_values = true)]
    encrypted_password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays free for results and the stdio protocol
    fmt()
        .with_env_filter(EnvFilter::from_env("VAULTLINK_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::StubVault => {
            tracing::debug!("Serving stub vault on stdio");
            serve_stdio(
                Box::new(StubVault::new()),
                tokio::io::stdin(),
                tokio::io::stdout(),
            )
            .await
            .context("stub vault stdio session failed")
        }
        Commands::Token { action } => run_token(action).await,
        command => {
            let config = load_config(cli.config.as_deref(), cli.boundary, cli.boundary_args)?;
            let client = VaultClient::from_config(&config);
            let result = run_vault(&client, command).await;
            client.reset().await;
            result
        }
    }
}

fn load_config(
    explicit: Option<&Path>,
    boundary: Option<String>,
    boundary_args: Vec<String>,
) -> Result<VaultConfig> {
    let mut config = VaultConfig::load(explicit).context("failed to load vaultlink config")?;
    if let Some(program) = boundary {
        config.boundary.program = program;
    }
    if !boundary_args.is_empty() {
        config.boundary.args = boundary_args;
    }
    tracing::debug!(program = %config.boundary.program, "Configuration loaded");
    Ok(config)
}

async fn run_vault(client: &VaultClient, command: Commands) -> Result<()> {
    match command {
        Commands::Encrypt { plaintext, session } => {
            open_session(client, session).await?;
            println!("{}", client.encrypt(plaintext).await?);
        }
        Commands::Decrypt {
            ciphertext,
            session,
        } => {
            open_session(client, session).await?;
            println!("{}", client.decrypt(ciphertext).await?);
        }
        Commands::EncryptFile {
            input,
            output,
            file_type,
            session,
        } => {
            let (data, name) = read_input(&input).await?;
            open_session(client, session).await?;
            let sealed = client.encrypt_file(data, name, file_type).await?;
            write_output(&output, &sealed).await?;
        }
        Commands::DecryptFile {
            input,
            output,
            file_type,
            session,
        } => {
            let (data, name) = read_input(&input).await?;
            open_session(client, session).await?;
            let opened = client.decrypt_file(data, name, file_type).await?;
            write_output(&output, &opened).await?;
        }
        Commands::CreateUser { user_id, password } => {
            let created = client.create_user_password(password, user_id).await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
        Commands::SetPassword {
            encrypted_id,
            user_id,
            password,
        } => {
            let wrapped = client
                .set_password(password, encrypted_id, user_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&wrapped)?);
        }
        Commands::Rotate { session } => {
            let previous = session.encrypted_password.clone();
            open_session(client, session).await?;
            let wrapped = client.update_key(previous).await?;
            println!("{}", serde_json::to_string_pretty(&wrapped)?);
        }
        Commands::Status => {
            let outcome = client.initialize(None).await;
            let report = serde_json::json!({
                "phase": client.phase().to_string(),
                "state": client.state(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            outcome?;
        }
        Commands::Token { .. } | Commands::StubVault => {
            bail!("command does not use the vault boundary")
        }
    }
    Ok(())
}

/// Bootstrap a returning session and derive working keys.
async fn open_session(client: &VaultClient, session: SessionArgs) -> Result<()> {
    let params = BootstrapParams::new(session.encrypted_id, session.user_id)
        .with_encrypted_password(session.encrypted_password);
    let outcome = client.bootstrap(params).await?;
    match outcome.status {
        BootstrapStatus::Ready => {}
        BootstrapStatus::NeedsPassword => {
            bail!("vault needs a password for this identity; run `vaultlink set-password`")
        }
        BootstrapStatus::NeedsSetup => {
            bail!("identity is not set up; run `vaultlink create-user`")
        }
    }
    client.derive().await?;
    Ok(())
}

async fn read_input(path: &Path) -> Result<(Vec<u8>, String)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((data, name))
}

async fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

async fn run_token(action: TokenAction) -> Result<()> {
    let Some(store) = FileTokenStore::new() else {
        bail!("cannot determine a config directory for the token file");
    };

    match action {
        TokenAction::Set { token, expires_in } => {
            let expires_at = expires_in.map(|secs| now_unix() + secs);
            store.save(&token, expires_at).await?;
            eprintln!("Token saved to {}", store.path().display());
        }
        TokenAction::Status => match store.status().await? {
            None => {
                eprintln!("No token stored. Run `vaultlink token set <TOKEN>` or set VAULTLINK_ACCESS_TOKEN.");
            }
            Some(status) => {
                eprintln!("Token:   {}...", status.token_prefix);
                match status.expires_at_unix {
                    Some(at) if status.is_expired => eprintln!("Expires: {at} (expired)"),
                    Some(at) => eprintln!("Expires: {at}"),
                    None => eprintln!("Expires: never"),
                }
            }
        },
        TokenAction::Clear => {
            store.clear()?;
            eprintln!("Token removed.");
        }
    }
    Ok(())
}
