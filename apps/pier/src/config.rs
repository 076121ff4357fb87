use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use clap::{builder::FalseyValueParser, Args};
use pier_core::RegistryConfig;

/// Broker settings. Every flag can also be supplied through its `PIER_*`
/// environment variable.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address the HTTP and WebSocket listener binds to.
    #[arg(long, env = "PIER_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// How long an offer, answer or done wait may block before the client
    /// must poll again.
    #[arg(long, env = "PIER_RENDEZVOUS_TIMEOUT_SECS", default_value_t = 60)]
    pub rendezvous_timeout_secs: u64,

    /// How long a candidate wait may block.
    #[arg(long, env = "PIER_CANDIDATE_TIMEOUT_SECS", default_value_t = 10)]
    pub candidate_timeout_secs: u64,

    /// Absolute lifetime of a session, counted from creation.
    #[arg(long, env = "PIER_SESSION_LIFETIME_SECS", default_value_t = 120)]
    pub session_lifetime_secs: u64,

    /// Period of the expired-session sweep.
    #[arg(long, env = "PIER_REAP_INTERVAL_SECS", default_value_t = 5)]
    pub reap_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

/// Logging and tracing settings, shared by the broker and the debug clients.
#[derive(Debug, Clone, Args)]
pub struct TelemetryArgs {
    /// Name reported as `service.name` on exported spans.
    #[arg(long, env = "PIER_SERVICE_NAME", default_value = "pier", global = true)]
    pub service_name: String,

    /// Also export spans to stdout through OpenTelemetry.
    #[arg(
        long,
        env = "PIER_OTEL_STDOUT",
        value_parser = FalseyValueParser::new(),
        global = true
    )]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub registry: RegistryConfig,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Upper bound on a single duplex connection. A stream outliving its
    /// session has nothing left to relay.
    pub fn stream_lifetime(&self) -> Duration {
        self.registry.session_lifetime + self.registry.reap_interval
    }
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        ensure!(
            args.rendezvous_timeout_secs > 0,
            "rendezvous timeout must be at least one second"
        );
        ensure!(
            args.candidate_timeout_secs > 0,
            "candidate timeout must be at least one second"
        );
        ensure!(
            args.reap_interval_secs > 0,
            "reap interval must be at least one second"
        );
        ensure!(
            args.session_lifetime_secs > args.rendezvous_timeout_secs,
            "session lifetime ({}s) must exceed the rendezvous timeout ({}s)",
            args.session_lifetime_secs,
            args.rendezvous_timeout_secs
        );

        Ok(ServerConfig {
            listen_addr,
            registry: RegistryConfig {
                rendezvous_timeout: Duration::from_secs(args.rendezvous_timeout_secs),
                candidate_timeout: Duration::from_secs(args.candidate_timeout_secs),
                session_lifetime: Duration::from_secs(args.session_lifetime_secs),
                reap_interval: Duration::from_secs(args.reap_interval_secs),
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
