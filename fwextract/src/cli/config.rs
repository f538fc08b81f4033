// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;

fn dump_subcommand(config: &Config) -> Result<()> {
    let data = config
        .to_toml()
        .context("Failed to serialize configuration")?;
    print!("{data}");

    Ok(())
}

pub fn config_main(cli: &ConfigCli, config: &Config) -> Result<()> {
    match cli.command {
        ConfigCommand::Dump(_) => dump_subcommand(config),
    }
}

/// Print the effective configuration as TOML.
///
/// This includes the values loaded from `--config` and any command-line
/// overrides.
#[derive(Debug, Parser)]
struct DumpCli {}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Dump(DumpCli),
}

/// Inspect the configuration.
#[derive(Debug, Parser)]
pub struct ConfigCli {
    #[command(subcommand)]
    command: ConfigCommand,
}
