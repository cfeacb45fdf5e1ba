//! Companion CLI - manage desktop pet extensions from the command line.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod ext_cmd;

use ext_cmd::ExtensionCli;

/// Companion desktop pet
#[derive(Debug, Parser)]
#[command(name = "companion")]
#[command(about = "Manage Companion extensions")]
#[command(version)]
struct Cli {
    /// Host base directory (defaults to the platform data directory)
    #[arg(long, global = true, env = "COMPANION_HOME")]
    base_dir: Option<PathBuf>,

    /// Runtime configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Manage extensions
    #[command(visible_alias = "ext")]
    Extension(ExtensionCli),
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    let options = ext_cmd::RuntimeOptions {
        base_dir: cli.base_dir,
        config: cli.config,
    };
    match cli.command {
        Commands::Extension(ext) => ext.run(&options),
    }
}
