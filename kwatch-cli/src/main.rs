//! kwatch: watch-and-reconcile engine CLI.
//!
//! # Usage
//!
//! ```text
//! kwatch config check [--config <path>]
//! kwatch replay <fixture> [--config <path>] [--settle-ms <n>] [--log-format plain|json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config::ConfigCommand, replay::ReplayArgs};

#[derive(Parser, Debug)]
#[command(
    name = "kwatch",
    version,
    about = "Watch object changes and reconcile them through a handler",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect engine configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run the engine against a recorded fixture and print each delivery.
    Replay(ReplayArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Config { command } => commands::config::run(command),
        Commands::Replay(args) => args.run(),
    }
}
