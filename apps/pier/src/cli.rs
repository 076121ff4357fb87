use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::{
    client::{default_policy, run_handshake, PollClient},
    config::{ServeArgs, TelemetryArgs},
};

#[derive(Parser, Debug)]
#[command(
    name = "pier",
    author,
    version,
    about = "WebRTC signaling broker and debug client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Broker settings (used when no subcommand is given).
    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a synthetic caller/callee handshake against a running broker
    Handshake {
        /// Broker base URL
        #[arg(short, long, default_value = "http://localhost:8000")]
        url: String,

        /// Give up retrying after this many seconds
        #[arg(long, default_value_t = 120)]
        ceiling_secs: u64,
    },

    /// Print the status of a live session
    Status {
        /// Broker base URL
        #[arg(short, long, default_value = "http://localhost:8000")]
        url: String,

        /// Session id returned by emit-server-init
        #[arg(short, long)]
        session: String,
    },
}

pub async fn run_handshake_command(url: String, ceiling_secs: u64) -> Result<()> {
    let client = PollClient::new(&url, default_policy(Duration::from_secs(ceiling_secs)))
        .context("failed to build HTTP client")?;
    info!(url = %url, "running synthetic handshake");
    let report = run_handshake(&client)
        .await
        .with_context(|| format!("handshake against {url} failed"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn run_status_command(url: String, session: String) -> Result<()> {
    let client = PollClient::new(&url, default_policy(Duration::from_secs(5)))
        .context("failed to build HTTP client")?;
    let status = client
        .status(&session)
        .await
        .with_context(|| format!("failed to fetch status for session {session}"))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["pier", "--listen-addr", "127.0.0.1:9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.listen_addr, "127.0.0.1:9000");
        assert_eq!(cli.serve.session_lifetime_secs, 120);
        assert_eq!(cli.telemetry.service_name, "pier");
    }

    #[test_timeout::timeout]
    fn telemetry_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from([
            "pier",
            "handshake",
            "--service-name",
            "pier-smoke-client",
            "--otel-stdout",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Handshake { .. })));
        assert_eq!(cli.telemetry.service_name, "pier-smoke-client");
        assert!(cli.telemetry.otel_stdout);
    }

    #[test_timeout::timeout]
    fn parses_debug_subcommands() {
        let cli = Cli::try_parse_from(["pier", "status", "--session", "abc"]).unwrap();
        match cli.command {
            Some(Commands::Status { url, session }) => {
                assert_eq!(url, "http://localhost:8000");
                assert_eq!(session, "abc");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
