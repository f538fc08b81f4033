// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::{
    cli::{status, warning},
    format::{
        DecodeOptions,
        transfer::{self, TransferList},
    },
    stream::FromReader,
};

fn read_transfer_list(path: &Path) -> Result<TransferList> {
    let file = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open transfer list for reading: {path:?}"))?;

    TransferList::from_reader(file)
        .with_context(|| format!("Failed to parse transfer list: {path:?}"))
}

fn unpack_subcommand(
    cli: &UnpackCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let list = read_transfer_list(&cli.transfer_list)?;

    for name in &list.skipped {
        warning!("Skipped unsupported command: {name}");
    }

    let patch = File::open(&cli.new_data)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open patch data for reading: {:?}", cli.new_data))?;

    let file = options
        .output_exists
        .create(&cli.output)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;
    let mut writer = BufWriter::new(file);

    let size = match transfer::apply(&list, patch, &mut writer, options, cancel_signal) {
        Ok(size) => size,
        Err(e) => {
            drop(writer);

            if let Err(e) = fs::remove_file(&cli.output) {
                warn!("Failed to remove incomplete output: {:?}: {e}", cli.output);
            }

            return Err(e).with_context(|| {
                format!(
                    "Failed to reconstruct image: {:?} + {:?} -> {:?}",
                    cli.transfer_list, cli.new_data, cli.output,
                )
            });
        }
    };

    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to flush output: {:?}", cli.output))?;

    status!("Reconstructed {size} bytes to {:?}", cli.output);

    Ok(())
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let list = read_transfer_list(&cli.input)?;

    println!("Version:          {} ({})", list.version, list.android_release());
    println!("New blocks:       {}", list.new_blocks);
    if let Some(n) = list.stash_entries {
        println!("Stash entries:    {n}");
    }
    if let Some(n) = list.max_stash_blocks {
        println!("Max stash blocks: {n}");
    }
    println!("Image blocks:     {}", list.total_blocks());

    for name in ["new", "erase", "zero"] {
        let commands = list.commands.iter().filter(|c| c.name() == name).count();
        println!(
            "Command {name:<8} {commands} command(s), {} block(s)",
            list.blocks_for(name),
        );
    }

    for name in &list.skipped {
        println!("Skipped command:  {name}");
    }

    Ok(())
}

pub fn transfer_main(
    cli: &TransferCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    match &cli.command {
        TransferCommand::Unpack(c) => unpack_subcommand(c, options, cancel_signal),
        TransferCommand::Info(c) => info_subcommand(c),
    }
}

/// Reconstruct a raw image from a transfer list and its patch data.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input `*.transfer.list` file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    transfer_list: PathBuf,

    /// Path to input `*.new.dat` patch data.
    ///
    /// The data must already be decompressed.
    #[arg(short, long, value_name = "FILE", value_parser)]
    new_data: PathBuf,

    /// Path to output raw image.
    ///
    /// The file must not exist unless `--overwrite` is used.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Display transfer list header and command totals.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input `*.transfer.list` file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TransferCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}

/// Reconstruct and inspect block-based OTA images.
#[derive(Debug, Parser)]
pub struct TransferCli {
    #[command(subcommand)]
    command: TransferCommand,
}
