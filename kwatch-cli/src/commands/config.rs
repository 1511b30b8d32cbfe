//! `kwatch config`: load, validate and print the effective configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use kwatch_core::{EngineConfig, KindTag};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration and print it as JSON.
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Config file. Defaults to $KWATCH_CONFIG, then ~/.kwatch.yaml.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    enabled_kinds: Vec<KindTag>,
    namespace: Option<&'a str>,
    config: &'a EngineConfig,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Check(args) => check(args),
    }
}

fn check(args: CheckArgs) -> Result<()> {
    let config = super::load_config(args.config.as_deref())?;
    let report = CheckReport {
        enabled_kinds: config.enabled_kinds(),
        namespace: config.namespace_scope(),
        config: &config,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize config")?
    );
    Ok(())
}
