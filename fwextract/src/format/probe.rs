// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Identify which of the supported container formats a file contains.

use std::{fmt, io::Read};

use thiserror::Error;
use tracing::debug;

use crate::format::{Category, lp, payload, sparse, transfer};

/// Enough data for the sparse header, the payload header, the LP geometry
/// copies, and the transfer list header.
const PROBE_SIZE: usize = 4 * 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read probe data")]
    DataRead(#[source] std::io::Error),
    #[error("Failed to probe sparse image")]
    Sparse(#[from] sparse::Error),
    #[error("Failed to probe OTA payload")]
    Payload(#[from] payload::Error),
    #[error("Failed to probe LP image")]
    Lp(#[from] lp::Error),
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Self::DataRead(e) => Category::from_io(e),
            Self::Sparse(e) => e.category(),
            Self::Payload(e) => e.category(),
            Self::Lp(e) => e.category(),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub enum Probe {
    Sparse(sparse::Header),
    Payload { version: u64 },
    Lp(lp::ImageType),
    TransferList { version: u32 },
    Unknown,
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sparse(h) => write!(
                f,
                "Android sparse image ({} blocks of {} bytes)",
                h.num_blocks, h.block_size,
            ),
            Self::Payload { version } => write!(f, "OTA payload (version {version})"),
            Self::Lp(lp::ImageType::Normal) => f.write_str("LP super image"),
            Self::Lp(lp::ImageType::Empty) => f.write_str("LP empty super image"),
            Self::TransferList { version } => write!(f, "Transfer list (version {version})"),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Returns `true` if a probe failure just means that the data is not in the
/// probed format. Only I/O failures are fatal.
fn is_mismatch(category: Category) -> bool {
    !matches!(category, Category::Io | Category::Cancelled)
}

/// Try each supported format in a fixed order and return the first match.
pub fn probe(reader: impl Read) -> Result<Probe> {
    let mut data = Vec::with_capacity(PROBE_SIZE);
    reader
        .take(PROBE_SIZE as u64)
        .read_to_end(&mut data)
        .map_err(Error::DataRead)?;

    match sparse::probe(data.as_slice()) {
        Ok(Some(header)) => return Ok(Probe::Sparse(header)),
        Ok(None) => {}
        Err(e) if is_mismatch(e.category()) => debug!("Not a sparse image: {e}"),
        Err(e) => return Err(e.into()),
    }

    match payload::probe(data.as_slice()) {
        Ok(Some(version)) => return Ok(Probe::Payload { version }),
        Ok(None) => {}
        Err(e) if is_mismatch(e.category()) => debug!("Not an OTA payload: {e}"),
        Err(e) => return Err(e.into()),
    }

    match lp::probe(data.as_slice()) {
        Ok(Some(image_type)) => return Ok(Probe::Lp(image_type)),
        Ok(None) => {}
        Err(e) if is_mismatch(e.category()) => debug!("Not an LP image: {e}"),
        Err(e) => return Err(e.into()),
    }

    if transfer::probe(&data) {
        let version = data
            .split(|b| *b == b'\n')
            .next()
            .and_then(|l| std::str::from_utf8(l).ok())
            .and_then(|l| l.trim().parse().ok());

        if let Some(version) = version {
            return Ok(Probe::TransferList { version });
        }
    }

    Ok(Probe::Unknown)
}
