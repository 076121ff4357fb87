mod cli;
mod client;
mod config;
mod duplex;
mod http;
mod server;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::{
    cli::{Cli, Commands},
    config::ServerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = telemetry::Telemetry::init(&cli.telemetry)?;

    match cli.command {
        Some(Commands::Handshake { url, ceiling_secs }) => {
            cli::run_handshake_command(url, ceiling_secs).await
        }
        Some(Commands::Status { url, session }) => cli::run_status_command(url, session).await,
        None => {
            let config = ServerConfig::try_from(cli.serve)?;
            info!(
                listen_addr = %config.listen_addr,
                rendezvous_timeout_secs = config.registry.rendezvous_timeout.as_secs(),
                candidate_timeout_secs = config.registry.candidate_timeout.as_secs(),
                session_lifetime_secs = config.registry.session_lifetime.as_secs(),
                "starting pier"
            );
            server::run(config, telemetry.metrics_handle()).await
        }
    }
}
