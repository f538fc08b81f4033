// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;

use crate::{
    cli::{PartitionsFailed, status, warning},
    format::{
        DecodeOptions,
        payload::{self, PartitionSummary, PayloadHeader},
    },
    stream::FromReader,
};

const PAYLOAD_NAME: &str = "payload.bin";

/// Accept either the payload itself or a directory containing it, such as an
/// extracted OTA zip.
fn resolve_payload_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(PAYLOAD_NAME)
    } else {
        path.to_owned()
    }
}

fn open_payload(path: &Path) -> Result<(File, PayloadHeader)> {
    let path = resolve_payload_path(path);

    let file = File::open(&path)
        .with_context(|| format!("Failed to open payload for reading: {path:?}"))?;
    let header = PayloadHeader::from_reader(BufReader::new(&file))
        .with_context(|| format!("Failed to read payload header: {path:?}"))?;

    Ok((file, header))
}

#[derive(Serialize)]
struct PayloadInfo {
    version: u64,
    block_size: u32,
    minor_version: u32,
    full_ota: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_timestamp: Option<i64>,
    partitions: Vec<PartitionSummary>,
}

fn unpack_subcommand(
    cli: &UnpackCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let (file, header) = open_payload(&cli.input)?;

    if !header.is_full_ota() {
        warning!("Payload contains delta operations; affected partitions cannot be extracted");
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let results = payload::extract(
        &file,
        &header,
        &cli.output,
        &cli.partition,
        options,
        cancel_signal,
    )
    .with_context(|| format!("Failed to extract payload: {:?}", cli.input))?;

    let mut failures = vec![];

    for result in results {
        match result.result {
            Ok(size) => status!("Extracted {}: {size} bytes -> {:?}", result.name, result.path),
            Err(e) => {
                let category = e.category();
                error!("Failed to extract {}: {:?}", result.name, anyhow::Error::from(e));
                failures.push((result.name, category));
            }
        }
    }

    if !failures.is_empty() {
        return Err(PartitionsFailed { failures }.into());
    }

    Ok(())
}

fn list_subcommand(cli: &ListCli) -> Result<()> {
    let (_, header) = open_payload(&cli.input)?;

    for partition in header.partitions() {
        match partition.size {
            Some(size) => println!("{}\t{size}", partition.name),
            None => println!("{}\t-", partition.name),
        }
    }

    Ok(())
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let (_, header) = open_payload(&cli.input)?;

    let info = PayloadInfo {
        version: header.version,
        block_size: header.block_size(),
        minor_version: header.manifest.minor_version(),
        full_ota: header.is_full_ota(),
        max_timestamp: header.manifest.max_timestamp,
        partitions: header.partitions(),
    };

    let data = toml_edit::ser::to_string_pretty(&info).context("Failed to serialize payload info")?;
    print!("{data}");

    Ok(())
}

pub fn payload_main(
    cli: &PayloadCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    match &cli.command {
        PayloadCommand::Unpack(c) => unpack_subcommand(c, options, cancel_signal),
        PayloadCommand::List(c) => list_subcommand(c),
        PayloadCommand::Info(c) => info_subcommand(c),
    }
}

/// Extract partition images from a full OTA payload.
///
/// Each partition is extracted to `<partition name>.img` in the output
/// directory. A partition that fails does not stop the others from being
/// extracted. Partitions that need a source image (delta payloads) fail with
/// an unsupported operation error.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input `payload.bin` or a directory containing it.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output images directory.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = "payload_images")]
    output: PathBuf,

    /// Only extract the specified partition.
    ///
    /// This option can be specified multiple times. By default, all partitions
    /// are extracted.
    #[arg(short, long, value_name = "NAME")]
    partition: Vec<String>,
}

/// List partition names and sizes.
#[derive(Debug, Parser)]
struct ListCli {
    /// Path to input `payload.bin` or a directory containing it.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Display a TOML summary of the payload manifest.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input `payload.bin` or a directory containing it.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PayloadCommand {
    Unpack(UnpackCli),
    List(ListCli),
    Info(InfoCli),
}

/// Extract and inspect OTA payloads.
#[derive(Debug, Parser)]
pub struct PayloadCli {
    #[command(subcommand)]
    command: PayloadCommand,
}
