//! storesync CLI
//!
//! Runs scenario files against in-memory stores and an in-process hub.
//!
//! # Commands
//!
//! - `run` - Run a scenario and print the resulting store and hub state
//! - `check` - Validate a scenario file without running it

mod commands;
mod scenario;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// storesync scenario runner.
#[derive(Parser)]
#[command(name = "storesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file
    Run {
        /// Path to the scenario JSON file
        scenario: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Fail if any pulling store ends up different from the hub
        #[arg(long)]
        expect_converged: bool,
    },

    /// Validate a scenario file
    Check {
        /// Path to the scenario JSON file
        scenario: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            format,
            expect_converged,
        } => {
            commands::run::run(&scenario, &format, expect_converged)?;
        }
        Commands::Check { scenario } => {
            commands::check::run(&scenario)?;
        }
        Commands::Version => {
            println!("storesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Batch envelope format v{}",
                storesync_protocol::ENVELOPE_VERSION
            );
        }
    }

    Ok(())
}
