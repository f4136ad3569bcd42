//! Configuration management commands.
//!
//! Shows the effective configuration, writes a default file and checks
//! files without starting the engine.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use tactus_config::{EngineConfig, default_config_path, ensure_user_config_dir, find_config};

use super::common::load_config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Where to write it (defaults to the user config directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show where the configuration is read from
    Path,

    /// Validate a configuration file
    Check {
        /// File to check
        file: PathBuf,
    },
}

pub fn run(args: ConfigArgs, config: Option<&Path>) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => show_config(config),
        ConfigCommand::Init { path, force } => init_config(path, force),
        ConfigCommand::Path => show_path(config),
        ConfigCommand::Check { file } => check_config(&file),
    }
}

fn show_config(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path,
        None => {
            ensure_user_config_dir()?;
            default_config_path()
        }
    };

    if path.exists() && !force {
        anyhow::bail!("'{}' already exists. Use --force to overwrite.", path.display());
    }

    EngineConfig::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn show_path(config: Option<&Path>) -> anyhow::Result<()> {
    println!("Default: {}", default_config_path().display());
    match find_config(config) {
        Some(path) => println!("Active:  {}", path.display()),
        None => println!("Active:  (built-in defaults)"),
    }
    Ok(())
}

fn check_config(file: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::load(file)?;
    let presets = config.presets()?;
    println!("{}: ok", file.display());
    println!(
        "  {} Hz, {} frames, {} channel(s), {}",
        presets.samplerate,
        presets.buffer_size,
        presets.pcm_channels,
        presets.format.as_str()
    );
    println!(
        "  {} scope thread(s), output '{}'",
        config.threads.scopes.len(),
        config.audio.output
    );
    Ok(())
}
