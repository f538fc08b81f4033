// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{
    cli::status,
    format::{
        DecodeOptions,
        sparse::{self, Chunk, CrcMode, Header, SparseReader},
    },
    util,
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

struct Metadata {
    header: Header,
    chunks: Vec<Chunk>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("header", &self.header)
            .field("chunks", &CompactView(&self.chunks))
            .finish()
    }
}

fn open_reader(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {path:?}"))
}

/// Result of [`convert_in_place`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversion {
    /// The file was not a sparse image and was left untouched.
    NotSparse,
    /// The file was replaced by its raw image.
    Converted(Header),
}

/// Replace a sparse image with its raw image. The raw image is written to a
/// temporary file in the same directory, which replaces the original only if
/// decoding succeeds. Files that are not sparse images are left untouched.
pub fn convert_in_place(
    path: &Path,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<Conversion> {
    let header = sparse::probe(open_reader(path)?)
        .with_context(|| format!("Failed to probe sparse image: {path:?}"))?;
    if header.is_none() {
        return Ok(Conversion::NotSparse);
    }

    let parent = util::parent_path(path);
    let mut temp_file = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in: {parent:?}"))?;

    let header = sparse::decode(open_reader(path)?, temp_file.as_file_mut(), options, cancel_signal)
        .with_context(|| format!("Failed to decode sparse image: {path:?}"))?;

    temp_file
        .as_file()
        .sync_all()
        .with_context(|| format!("Failed to flush temporary file: {:?}", temp_file.path()))?;

    // The temporary file is removed on drop if this fails.
    temp_file
        .persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace sparse image: {path:?}"))?;

    Ok(Conversion::Converted(header))
}

fn unpack_subcommand(
    cli: &UnpackCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let mut writer = options
        .output_exists
        .create(&cli.output)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;

    let result = sparse::decode(reader, &mut writer, options, cancel_signal);

    let header = match result {
        Ok(h) => h,
        Err(e) => {
            drop(writer);

            if let Err(e) = std::fs::remove_file(&cli.output) {
                warn!("Failed to remove incomplete output: {:?}: {e}", cli.output);
            }

            return Err(e)
                .with_context(|| format!("Failed to unpack sparse image: {:?}", cli.input));
        }
    };

    status!(
        "Unpacked {} blocks of {} bytes to {:?}",
        header.num_blocks,
        header.block_size,
        cli.output,
    );

    Ok(())
}

fn convert_subcommand(
    cli: &ConvertCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    for path in &cli.input {
        match convert_in_place(path, options, cancel_signal)? {
            Conversion::NotSparse => info!("Not a sparse image, leaving untouched: {path:?}"),
            Conversion::Converted(header) => status!(
                "Converted {path:?} to a raw image of {} blocks",
                header.num_blocks,
            ),
        }
    }

    Ok(())
}

fn info_subcommand(cli: &InfoCli, options: &DecodeOptions) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let crc_mode = if options.verify {
        CrcMode::Validate
    } else {
        CrcMode::Ignore
    };
    let mut sparse_reader = SparseReader::new_seekable(reader, crc_mode)
        .with_context(|| format!("Failed to read sparse file: {:?}", cli.input))?;

    let mut metadata = Metadata {
        header: sparse_reader.header(),
        chunks: vec![],
    };

    while let Some(chunk) = sparse_reader
        .next_chunk()
        .with_context(|| format!("Failed to read chunk: {:?}", cli.input))?
    {
        metadata.chunks.push(chunk);
    }

    println!("{metadata:#?}");

    Ok(())
}

pub fn sparse_main(
    cli: &SparseCli,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    match &cli.command {
        SparseCommand::Unpack(c) => unpack_subcommand(c, options, cancel_signal),
        SparseCommand::Convert(c) => convert_subcommand(c, options, cancel_signal),
        SparseCommand::Info(c) => info_subcommand(c, options),
    }
}

/// Unpack a sparse image to a new raw image.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    ///
    /// The file must not exist unless `--overwrite` is used.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Convert sparse images to raw images in place.
///
/// Files that are not sparse images are left untouched. This must be done for
/// sparse `super` images before they can be unpacked.
#[derive(Debug, Parser)]
struct ConvertCli {
    /// Paths to images to convert.
    #[arg(short, long, value_name = "FILE", value_parser, required = true)]
    input: Vec<PathBuf>,
}

/// Display sparse image metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SparseCommand {
    Unpack(UnpackCli),
    Convert(ConvertCli),
    Info(InfoCli),
}

/// Unpack and inspect sparse images.
#[derive(Debug, Parser)]
pub struct SparseCli {
    #[command(subcommand)]
    command: SparseCommand,
}
