use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, Credential, CredentialSource, PasswordLogin, Settings, StaticCredential,
    SystemCoordinator,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "system-ctl", about = "Query or gracefully stop a remote system")]
struct Cli {
    /// Base url of the remote control API, e.g. https://host:8080
    #[arg(long)]
    url: String,
    #[arg(long, requires = "password", conflicts_with = "token")]
    user: Option<String>,
    #[arg(long, requires = "user")]
    password: Option<String>,
    /// Use an existing access token instead of logging in.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    settle_delay_ms: Option<u64>,
    /// Give up waiting for the shutdown event after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Stop the system and wait until it is ready to shut down.
    #[default]
    Stop,
    /// Print the current system status.
    Status,
}

fn credential_source(cli: &Cli) -> Result<Arc<dyn CredentialSource>> {
    match (&cli.token, &cli.user, &cli.password) {
        (Some(token), _, _) => Ok(Arc::new(StaticCredential(Credential::new(token.clone())))),
        (None, Some(user), Some(password)) => Ok(Arc::new(PasswordLogin::new(
            cli.url.clone(),
            user.clone(),
            password.clone(),
        ))),
        _ => bail!("either --token or both --user and --password are required"),
    }
}

fn apply_overrides(mut settings: Settings, cli: &Cli) -> Settings {
    if let Some(ms) = cli.settle_delay_ms {
        settings.settle_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = cli.timeout_secs {
        settings.completion_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    settings
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let credential = credential_source(&cli)?.credential().await?;
    let settings = apply_overrides(load_settings(), &cli);
    let coordinator = SystemCoordinator::new(cli.url.clone(), credential, settings);

    let state = match cli.command.unwrap_or_default() {
        Command::Status => coordinator.status().await?,
        Command::Stop => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling graceful stop");
                    on_interrupt.cancel();
                }
            });
            coordinator.graceful_stop_with_cancel(cancel).await?
        }
    };

    println!("{}", state.status);
    Ok(())
}
