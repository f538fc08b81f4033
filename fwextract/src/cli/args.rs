// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{completion, config, lp, payload, probe, sparse, transfer},
    config::{Config, LogLevel},
    format::{DecodeOptions, OutputPolicy},
};

#[derive(Debug, Subcommand)]
pub enum Command {
    Completion(completion::CompletionCli),
    Config(config::ConfigCli),
    Lp(lp::LpCli),
    Payload(payload::PayloadCli),
    Probe(probe::ProbeCli),
    Sparse(sparse::SparseCli),
    Transfer(transfer::TransferCli),
}

/// Options that apply to every subcommand. These override the values from the
/// config file.
#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to TOML config file.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,

    /// Block size of the containers.
    #[arg(long, global = true, value_name = "BYTES")]
    pub block_size: Option<u32>,

    /// Skip checksum and digest verification where the format allows it.
    #[arg(long, global = true)]
    pub no_verify: bool,

    /// Number of partitions to extract in parallel.
    ///
    /// 0 uses the available parallelism.
    #[arg(short, long, global = true, value_name = "N")]
    pub workers: Option<usize>,

    /// Overwrite output files that already exist.
    #[arg(long, global = true)]
    pub overwrite: bool,

    /// Lowest severity of log messages to print.
    #[arg(long, global = true, value_name = "LEVEL", value_parser = parse_log_level)]
    pub log_level: Option<LogLevel>,
}

fn parse_log_level(s: &str) -> std::result::Result<LogLevel, String> {
    match s {
        "error" => Ok(LogLevel::Error),
        "warn" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        "trace" => Ok(LogLevel::Trace),
        _ => Err(format!("Invalid log level: {s:?}")),
    }
}

impl GlobalOpts {
    /// Load the config file, if any, and apply the command-line overrides.
    pub fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(block_size) = self.block_size {
            config.decode.block_size = block_size;
        }
        if self.no_verify {
            config.decode.verify = false;
        }
        if let Some(workers) = self.workers {
            config.decode.workers = workers;
        }
        if self.overwrite {
            config.decode.output_exists = OutputPolicy::Overwrite;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate().context("Invalid configuration")?;

        Ok(config)
    }
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalOpts,
}

fn init_logging(config: &Config, initialized: &AtomicBool) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(config.logging.level)
        .with_target(false)
        .init();

    initialized.store(true, Ordering::SeqCst);
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    let config = cli.global.config()?;
    init_logging(&config, logging_initialized);

    let options: DecodeOptions = config.decode_options();

    match cli.command {
        Command::Completion(c) => completion::completion_main(&c),
        Command::Config(c) => config::config_main(&c, &config),
        Command::Lp(c) => lp::lp_main(&c, &options, cancel_signal),
        Command::Payload(c) => payload::payload_main(&c, &options, cancel_signal),
        Command::Probe(c) => probe::probe_main(&c),
        Command::Sparse(c) => sparse::sparse_main(&c, &options, cancel_signal),
        Command::Transfer(c) => transfer::transfer_main(&c, &options, cancel_signal),
    }
}
