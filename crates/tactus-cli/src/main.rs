//! Tactus CLI - command-line front end for the tactus engine.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tactus")]
#[command(author, version, about = "Tactus realtime engine CLI", long_about = None)]
struct Cli {
    /// Engine configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play test tones through the threaded engine in real time
    Run(commands::run::RunArgs),

    /// Render test tones offline to a WAV file
    Render(commands::render::RenderArgs),

    /// Show tick and subdivision timing for a tempo
    Timing(commands::timing::TimingArgs),

    /// Inspect and manage the engine configuration
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => commands::run::run(args, config),
        Commands::Render(args) => commands::render::run(args, config),
        Commands::Timing(args) => commands::timing::run(args, config),
        Commands::Config(args) => commands::config::run(args, config),
    }
}
