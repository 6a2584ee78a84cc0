//! promptloom CLI: compile and render prompt templates from the shell.
//!
//! Commands:
//! - `check`: Compile a template and print its slots, lanes and lints
//! - `render`: Render a template against a JSON context
//! - `config`: Print configuration

use clap::{Parser, Subcommand};
use promptloom_config::{AppConfig, LoggingConfig};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "promptloom",
    about = "Token-budgeted prompt assembly",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.promptloom/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a template (TOML or JSON) and report problems
    Check {
        /// Template file
        template: PathBuf,
    },

    /// Render a template to a JSON message list
    Render(commands::render::RenderArgs),

    /// Print configuration (defaults unless --effective)
    Config {
        /// Print the loaded configuration, including env overrides
        #[arg(long)]
        effective: bool,

        /// Print the default config file path
        #[arg(long, conflicts_with = "effective")]
        path: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    let config = AppConfig::load_from(&config_path)?;
    init_tracing(cli.verbose, &config.logging);

    // Loading ran before the subscriber existed.
    if !config_path.exists() {
        tracing::info!(path = %config_path.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Check { template } => commands::check::run(&template, &config)?,
        Commands::Render(args) => commands::render::run(&args, &config)?,
        Commands::Config { effective, path } => {
            if path {
                commands::config_cmd::path()?
            } else if effective {
                commands::config_cmd::show(&config)?
            } else {
                commands::config_cmd::show_default()?
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so rendered JSON on stdout stays clean.
fn init_tracing(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose { "debug" } else { logging.level.as_str() };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
