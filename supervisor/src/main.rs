//! Main entry point for the supervisor binary
//!
//! Wires the real service implementations together with dependency
//! injection and runs the health event loop until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use shared::logging;
use supervisor::services::{native_process_ops, StaticTopology, StdinConsentPrompt};
use supervisor::{Supervisor, SupervisorConfig};

/// Self-healing process supervisor for the desktop host
#[derive(Parser)]
#[command(name = "supervisor")]
#[command(about = "Monitors and recovers the host's child processes and embedded services")]
pub struct Args {
    /// Private data directory for the instance marker and process registry
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Persisted configuration file checked by the config probe
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Protocol router port
    #[arg(long, default_value = "8765")]
    pub router_port: u16,

    /// Embedded HTTP server port
    #[arg(long, default_value = "8766")]
    pub server_port: u16,

    /// The router is optional; skip its reachability expectations
    #[arg(long)]
    pub no_router: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init_tracing_with_level(Some(&args.log_level));
    logging::log_startup("health supervisor");

    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(|| args.data_dir.join("settings.json"));

    let mut topology = StaticTopology::new(args.router_port, args.server_port);
    if args.no_router {
        topology = topology.without_router();
    }

    let config = SupervisorConfig::new(args.data_dir, config_path);
    let mut supervisor = Supervisor::new(
        config,
        native_process_ops(),
        Arc::new(topology),
        Arc::new(StdinConsentPrompt),
    )?;

    if !supervisor.registry().was_last_exit_clean() {
        tracing::warn!("previous run crashed; startup cleanup will reconcile leftovers");
    }

    supervisor.init().await?;

    // Graceful shutdown on Ctrl+C writes the clean-exit marker
    let shutdown_sender = supervisor.get_shutdown_sender();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                logging::log_shutdown("Received Ctrl+C signal");
                let _ = shutdown_sender.send(()).await;
            }
            Err(err) => {
                logging::log_error("Signal handling", &err);
            }
        }
    });

    supervisor.run().await?;

    logging::log_success("Supervisor stopped gracefully");
    Ok(())
}
