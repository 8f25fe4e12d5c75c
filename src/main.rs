mod cli;

use agentmem::config;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentmem", version, about = "Resource governance diagnostics for the agent memory store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the database and report its health
    Doctor,
    /// Print process memory pressure and the configured governance defaults
    Stats {
        /// Emit the report as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Watch memory pressure for a while, logging every pressure event
    Monitor {
        /// How long to watch
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::AgentMemConfig::load()?;

    // Log to stderr so stdout stays clean for reports.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Doctor => cli::doctor(&config).await?,
        Command::Stats { json } => cli::stats(&config, json)?,
        Command::Monitor { seconds } => cli::monitor(&config, seconds).await?,
    }

    Ok(())
}
