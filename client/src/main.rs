use std::{
    env,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memguarded_client::{ClientConfig, SecretClient};
use memguarded_common::{
    config::{Settings, CERT_PASSPHRASE_ENV},
    prompt::stdin_is_terminal,
    protocol::TERMINATOR,
    store::SecretStore,
    tls::is_key_encrypted,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memguarded")]
#[command(about = "Reads or replaces the secret held by the memguarded daemon")]
#[command(version)]
struct Args {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path, overrides the settings file
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the secret to stdout
    Get,
    /// Replace the secret
    Set {
        /// Ask twice and require both entries to match
        #[arg(long)]
        confirm: bool,

        /// Read the secret from stdin up to a newline
        #[arg(long)]
        stdin: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("Invalid log level")?)
        .with_writer(io::stderr)
        .init();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }

    let passphrase = cert_passphrase(&settings)?;
    let config = ClientConfig::from_settings(&settings, passphrase.as_ref())
        .context("Failed to create client")?;
    let mut client = SecretClient::new(config);

    match args.command {
        Commands::Get => {
            let secret = SecretStore::new();
            client.dial()?;
            client.get_secret(&secret).context("Failed to get secret")?;

            let mut stdout = io::stdout().lock();
            secret.write(&mut stdout)?;
            stdout.flush().context("Failed to write secret")?;
        }

        Commands::Set { confirm, stdin } => {
            let secret = SecretStore::new();
            if stdin || !stdin_is_terminal() {
                secret
                    .set_from_stream(&mut io::stdin().lock(), TERMINATOR)
                    .context("Failed to read secret from stdin")?;
            } else {
                secret.ask_secret(confirm, "Secret")?;
            }

            client.dial()?;
            client.set_secret(&secret).context("Failed to set secret")?;
            tracing::info!("✓ Secret replaced");
        }
    }

    client.close();
    Ok(())
}

/// Passphrase for an encrypted client key: from the environment, otherwise
/// asked on the terminal
fn cert_passphrase(settings: &Settings) -> Result<Option<SecretStore>> {
    let Some(tls) = &settings.tls else {
        return Ok(None);
    };
    if !is_key_encrypted(&tls.client.key_path)? {
        return Ok(None);
    }

    let passphrase = SecretStore::new();
    match env::var(CERT_PASSPHRASE_ENV) {
        Ok(value) if !value.is_empty() => {
            passphrase.set_from_bytes(&mut value.into_bytes())?;
        }
        _ => passphrase
            .ask_secret(false, "Cert passphrase")
            .context("Client key is encrypted and no passphrase is available")?,
    }
    Ok(Some(passphrase))
}
