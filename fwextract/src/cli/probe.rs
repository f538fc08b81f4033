// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::format::probe;

pub fn probe_main(cli: &ProbeCli) -> Result<()> {
    let file = File::open(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;
    let result =
        probe::probe(file).with_context(|| format!("Failed to probe file: {:?}", cli.input))?;

    println!("{result}");

    Ok(())
}

/// Identify the container format of a file.
///
/// Sparse images, OTA payloads, LP images, and transfer lists are detected, in
/// that order.
#[derive(Debug, Parser)]
pub struct ProbeCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}
