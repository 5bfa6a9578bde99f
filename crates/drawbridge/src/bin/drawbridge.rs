//! drawbridge - TLS-terminating reverse proxy daemon

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use drawbridge::{config, Server};

#[derive(Parser)]
#[command(name = "drawbridge")]
#[command(about = "TLS-terminating reverse proxy with SNI routing")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Directory for certificates and ACME account state
    #[arg(long, default_value = "/var/lib/drawbridge")]
    data_dir: PathBuf,
}

async fn load_server(cli: &Cli) -> anyhow::Result<Server> {
    let directives = config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config file {:?}", cli.config))?;
    let server = Server::load(&directives, cli.data_dir.clone())?;
    Ok(server)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut server = load_server(&cli).await?;
    server.start().await.context("failed to start server")?;
    info!("server started");

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                info!("reloading configuration");
                match load_server(&cli).await {
                    Ok(mut next) => match next.replace(&server).await {
                        Ok(()) => {
                            server = next;
                            info!("configuration reloaded");
                        }
                        Err(e) => error!(error = %e, "reload failed"),
                    },
                    Err(e) => error!(error = %e, "reload failed"),
                }
            }
        }
    }

    info!("stopping server");
    server.stop();
    Ok(())
}
