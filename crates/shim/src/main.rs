//! Entry point for the containerd task v2 shim binary. containerd invokes
//! this binary twice per sandbox: once as `start` (SPEC_FULL.md §6), which
//! this process handles by binding sockets and re-executing itself as the
//! long-running server, and once as `delete` during teardown.

mod bootstrap;
mod publisher;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Set on the re-exec'd server process only; its presence is what tells
/// `main` to skip argument parsing as a bootstrap command and instead run
/// the long-running server against the inherited fds.
const SERVER_MARKER_ENV: &str = "__SHIM_SERVER_FDS";

#[derive(Parser, Debug, Clone)]
#[command(name = "containerd-shim-kata-v2")]
pub struct Cli {
    #[arg(long)]
    pub namespace: String,
    #[arg(long)]
    pub address: String,
    #[arg(long = "publish-binary")]
    pub publish_binary: String,
    #[arg(long)]
    pub id: String,
    #[arg(long)]
    pub debug: bool,
    #[arg(long, default_value = ".")]
    pub bundle: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Binds the task/control sockets and re-execs as the server.
    Start,
    /// Removes a sandbox's sockets and bundle bookkeeping files.
    Delete,
}

fn main() {
    if std::env::var_os(SERVER_MARKER_ENV).is_some() {
        server::run_inherited();
        return;
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.debug { "debug" } else { "info" }),
    )
    .init();

    let result = match cli.command {
        Commands::Start => bootstrap::start(&cli.namespace, &cli.id, &cli.bundle, SERVER_MARKER_ENV)
            .map(|address| println!("{address}")),
        Commands::Delete => bootstrap::delete(&cli.namespace, &cli.id, &cli.bundle),
    };

    if let Err(e) = result {
        eprintln!("containerd-shim-kata-v2: {e}");
        std::process::exit(1);
    }
}
