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
    cli::{PartitionsFailed, status},
    format::{
        DecodeOptions,
        lp::{self, ImageType, Metadata},
    },
    stream::FromReader,
};

fn open_lp_inputs(paths: &[impl AsRef<Path>]) -> Result<(Vec<File>, Metadata)> {
    let inputs = paths
        .iter()
        .map(|p| {
            let p = p.as_ref();

            File::open(p).with_context(|| format!("Failed to open LP image for reading: {p:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata = Metadata::from_reader(BufReader::new(&inputs[0]))
        .with_context(|| format!("Failed to parse LP image metadata: {:?}", paths[0].as_ref()))?;

    Ok((inputs, metadata))
}

fn write_info(path: &Path, info: &impl Serialize) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(info)
        .with_context(|| format!("Failed to serialize metadata info TOML: {path:?}"))?;
    fs::write(path, data)
        .with_context(|| format!("Failed to write metadata info TOML: {path:?}"))?;

    Ok(())
}

/// Keep only the selected slot so that the info file describes exactly what
/// was extracted.
fn retain_slot(metadata: &Metadata, slot: Option<u32>) -> Result<Metadata> {
    let selected = lp::select_slot(metadata, slot)?.clone();

    Ok(Metadata {
        slots: vec![selected],
        ..metadata.clone()
    })
}

fn unpack_subcommand(
    lp_cli: &LpCli,
    cli: &UnpackCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let (inputs, metadata) = open_lp_inputs(&cli.input)?;

    if let Some(path) = &cli.output_info {
        write_info(path, &retain_slot(&metadata, cli.slot)?)?;
    }

    if !lp_cli.quiet {
        for info in lp::list(&metadata, cli.slot)? {
            println!("{info:?}");
        }
    }

    // For empty images, there's no data to unpack.
    if metadata.image_type == ImageType::Empty {
        status!("Image contains no partition data");
        return Ok(());
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let results = lp::extract(
        &metadata,
        cli.slot,
        &inputs,
        &cli.output,
        &cli.partition,
        options,
        cancel_signal,
    )
    .with_context(|| format!("Failed to unpack LP image: {:?}", cli.input[0]))?;

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

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let (_, metadata) = open_lp_inputs(&[&cli.input])?;

    // All metadata slots are shown, even if they differ.
    if cli.toml {
        let data = toml_edit::ser::to_string_pretty(&metadata)
            .context("Failed to serialize metadata info TOML")?;
        print!("{data}");
    } else {
        println!("{metadata:#?}");
    }

    Ok(())
}

pub fn lp_main(cli: &LpCli, options: &DecodeOptions, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        LpCommand::Unpack(c) => unpack_subcommand(cli, c, options, cancel_signal),
        LpCommand::Info(c) => info_subcommand(c),
    }
}

/// Unpack an LP image.
///
/// Each partition is extracted to `<partition name>.img` in the output
/// directory. The input must be a raw image. Sparse `super` images must be
/// converted with `sparse convert` first.
///
/// If any partition names are unsafe to use in a path, the extraction process
/// will fail and exit. Extracted files are never written outside of the output
/// directory.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input LP images.
    ///
    /// If there are multiple images, they must be specified in order. If the
    /// order is unknown, run `fwextract lp info` against the `super` image and
    /// look at the `block_devices` field.
    #[arg(short, long, value_name = "FILE", value_parser, required = true)]
    input: Vec<PathBuf>,

    /// Path to output images directory.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = "lp_images")]
    output: PathBuf,

    /// Path to output info TOML for the selected slot.
    #[arg(long, value_name = "FILE", value_parser)]
    output_info: Option<PathBuf>,

    /// Only extract the specified partition.
    ///
    /// This option can be specified multiple times. By default, all partitions
    /// are extracted. Names are case-sensitive.
    #[arg(short, long, value_name = "NAME")]
    partition: Vec<String>,

    /// The LP metadata slot to use.
    ///
    /// This option is required if not all slots are identical.
    #[arg(short = 'S', long)]
    slot: Option<u32>,
}

/// Display LP image metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input LP image.
    ///
    /// If there are multiple images, this should refer to the first one, which
    /// is usually the `super` image. The metadata is only stored in the first
    /// image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Print the metadata as TOML.
    #[arg(long)]
    toml: bool,
}

#[derive(Debug, Subcommand)]
enum LpCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}

/// Unpack and inspect LP images.
#[derive(Debug, Parser)]
pub struct LpCli {
    #[command(subcommand)]
    command: LpCommand,

    /// Don't print the partition listing.
    #[arg(short, long, global = true)]
    quiet: bool,
}
