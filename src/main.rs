use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hippograph::cli;
use hippograph::config::HippoConfig;

#[derive(Parser)]
#[command(name = "hippograph", version, about = "Associative memory graph for AI assistants")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show store statistics: nodes, edges, entities, communities
    Stats,
    /// Run a sleep-time maintenance cycle
    Sleep {
        /// Run a deep cycle (communities, relations, consolidation)
        #[arg(long)]
        deep: bool,
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show search latency percentiles and zero-result rate
    SearchStats {
        /// Sliding window in hours
        #[arg(long, default_value_t = 24.0)]
        window_hours: f64,
    },
    /// Check database health
    Doctor,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = HippoConfig::load()?;

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Stats => cli::stats::stats(&config)?,
        Command::Sleep { deep, dry_run } => cli::sleep::sleep(&config, deep, dry_run)?,
        Command::SearchStats { window_hours } => {
            cli::stats::search_stats(&config, window_hours)?
        }
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}
