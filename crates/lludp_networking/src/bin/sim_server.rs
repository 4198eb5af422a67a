//! Standalone simulator endpoint.
//!
//! ```text
//! sim_server --config sim.toml --circuit 1001,<session uuid>,<agent uuid>
//! ```
//!
//! Without a login service, circuits are pre-registered from the command line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use lludp_networking::{LludpServer, ServerConfig, Services};

#[derive(Parser)]
#[command(name = "sim_server")]
#[command(about = "LLUDP simulator session endpoint")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured bind address.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Stops after this many seconds instead of running forever.
    #[arg(short, long)]
    duration: Option<u64>,

    /// Pre-registers a circuit: `code,session_id,agent_id`. Repeatable.
    #[arg(long = "circuit", value_name = "CODE,SESSION,AGENT")]
    circuits: Vec<PendingCircuit>,
}

#[derive(Clone, Debug)]
struct PendingCircuit {
    code: u32,
    session_id: Uuid,
    agent_id: Uuid,
}

impl FromStr for PendingCircuit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let (Some(code), Some(session), Some(agent), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err("expected CODE,SESSION,AGENT".to_string());
        };
        Ok(Self {
            code: code.parse().map_err(|e| format!("circuit code: {e}"))?,
            session_id: session.parse().map_err(|e| format!("session id: {e}"))?,
            agent_id: agent.parse().map_err(|e| format!("agent id: {e}"))?,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "bad configuration");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    let server = match LludpServer::bind(config, Services::default()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    for pending in &args.circuits {
        server.register_pending(pending.code, pending.session_id, pending.agent_id);
    }

    if let Some(seconds) = args.duration {
        let stopper = server.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            stopper.shutdown();
        });
    }

    match server.run() {
        Ok(()) => {
            server.shutdown();
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "server stopped");
            server.shutdown();
            ExitCode::FAILURE
        }
    }
}
