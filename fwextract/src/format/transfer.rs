// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Block-based OTA images (`*.transfer.list` + `*.new.dat`).
//!
//! The transfer list is a text file with a small header followed by one
//! command per line. Only the commands that produce data for a full image are
//! interpreted: `new` copies blocks from the patch data stream in order, while
//! `erase` and `zero` never consume patch data.

use std::{
    fmt,
    io::{self, Read, Seek, Write},
    ops::Range,
    str::FromStr,
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::{Category, DecodeOptions},
    stream::{self, FromReader, ReadFixedSizeExt, SegmentWriter},
};

/// Oldest supported transfer list version.
pub const VERSION_MIN: u32 = 1;
/// Newest supported transfer list version.
pub const VERSION_MAX: u32 = 4;

/// First version with the stash header lines.
const VERSION_FOR_STASH: u32 = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing header line: {0}")]
    MissingHeaderLine(&'static str),
    #[error("Invalid header line {name}: {value:?}")]
    InvalidHeaderLine { name: &'static str, value: String },
    #[error("Unsupported transfer list version: {0}")]
    UnsupportedVersion(u32),
    #[error("Line {line}: Invalid range set: {value:?}")]
    InvalidRangeSet { line: usize, value: String },
    #[error("Line {line}: Missing range set for command: {command}")]
    MissingRangeSet { line: usize, command: &'static str },
    #[error("Line {line}: Not valid UTF-8")]
    InvalidEncoding { line: usize },
    #[error("Commands write {actual} new blocks, but header declares {expected}")]
    MismatchedNewBlocks { expected: u64, actual: u64 },
    #[error("Block range {start}..{end} exceeds the addressable size")]
    RangeTooLarge { start: u64, end: u64 },
    #[error("Command #{index}: Failed to copy patch data")]
    PatchData {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read transfer list: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Self::MissingHeaderLine(_) => Category::Truncated,
            Self::PatchData { source: e, .. } | Self::DataRead(_, e) | Self::DataWrite(_, e) => {
                Category::from_io(e)
            }
            _ => Category::Corrupt,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// An ordered list of disjoint, half-open block ranges.
///
/// The text form is a comma-separated list of integers where the first value
/// is a count followed by `(start, end)` pairs. Some tools count the following
/// integers and others count every integer, including the count itself. Both
/// conventions are accepted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet(Vec<Range<u64>>);

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.0).finish()
    }
}

impl FromStr for RangeSet {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut numbers = s.trim().split(',').map(|n| n.trim().parse::<u64>());

        let count = numbers.next().ok_or(())?.map_err(|_| ())?;
        let values = numbers
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| ())?;

        let n = values.len() as u64;
        if n % 2 != 0 || (count != n && count != n + 1) {
            return Err(());
        }

        let ranges = values
            .chunks_exact(2)
            .map(|pair| pair[0]..pair[1])
            .collect::<Vec<_>>();

        if ranges.iter().any(|r| r.start >= r.end) {
            return Err(());
        }

        // Ranges must not overlap, though they can be listed in any order.
        let mut sorted = ranges.clone();
        sorted.sort_by_key(|r| r.start);
        if sorted.windows(2).any(|w| w[0].end > w[1].start) {
            return Err(());
        }

        Ok(Self(ranges))
    }
}

impl RangeSet {
    pub fn new(ranges: Vec<Range<u64>>) -> Self {
        Self(ranges)
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.0
    }

    /// Total number of blocks covered by all ranges.
    pub fn blocks(&self) -> u64 {
        self.0.iter().map(|r| r.end - r.start).sum()
    }

    /// End of the last block covered by any range.
    pub fn max_end(&self) -> u64 {
        self.0.iter().map(|r| r.end).max().unwrap_or(0)
    }

    /// Convert the block ranges to byte ranges.
    fn byte_ranges(&self, block_size: u64) -> Result<Vec<Range<u64>>> {
        self.0
            .iter()
            .map(|r| {
                let start = r.start.checked_mul(block_size);
                let end = r.end.checked_mul(block_size);

                match (start, end) {
                    (Some(s), Some(e)) => Ok(s..e),
                    _ => Err(Error::RangeTooLarge {
                        start: r.start,
                        end: r.end,
                    }),
                }
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Discard the blocks. Reads back as undefined data on a device, so the
    /// image is left untouched.
    Erase(RangeSet),
    /// Copy the next blocks from the patch data stream.
    New(RangeSet),
    /// Fill the blocks with zeros.
    Zero(RangeSet),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Erase(_) => "erase",
            Self::New(_) => "new",
            Self::Zero(_) => "zero",
        }
    }

    pub fn ranges(&self) -> &RangeSet {
        match self {
            Self::Erase(r) | Self::New(r) | Self::Zero(r) => r,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferList {
    /// Transfer list format version.
    pub version: u32,
    /// Number of blocks that the `new` commands write in total.
    pub new_blocks: u64,
    /// [Version >=2 only] Number of stash entries needed simultaneously.
    pub stash_entries: Option<u64>,
    /// [Version >=2 only] Maximum number of blocks stashed simultaneously.
    pub max_stash_blocks: Option<u64>,
    /// Commands in the order they must be applied.
    pub commands: Vec<Command>,
    /// Names of commands that were present but are not needed for
    /// reconstructing a full image.
    pub skipped: Vec<String>,
}

impl TransferList {
    /// Human-readable name of the Android release that introduced this
    /// transfer list version.
    pub fn android_release(&self) -> &'static str {
        match self.version {
            1 => "Android Lollipop 5.0",
            2 => "Android Lollipop 5.1",
            3 => "Android Marshmallow 6.x",
            4 => "Android Nougat 7.x or newer",
            _ => "Unknown Android version",
        }
    }

    /// Total number of blocks written by commands of the specified kind.
    pub fn blocks_for(&self, name: &str) -> u64 {
        self.commands
            .iter()
            .filter(|c| c.name() == name)
            .map(|c| c.ranges().blocks())
            .sum()
    }

    /// Size in blocks of the reconstructed image.
    pub fn total_blocks(&self) -> u64 {
        self.commands
            .iter()
            .map(|c| c.ranges().max_end())
            .max()
            .unwrap_or(0)
    }

    /// Ensure that the commands agree with the header.
    pub fn validate(&self) -> Result<()> {
        let actual = self.blocks_for("new");

        if actual != self.new_blocks {
            return Err(Error::MismatchedNewBlocks {
                expected: self.new_blocks,
                actual,
            });
        }

        Ok(())
    }

    fn parse_header_line<'a>(
        lines: &mut impl Iterator<Item = (usize, &'a [u8])>,
        name: &'static str,
    ) -> Result<u64> {
        let (_, line) = lines.next().ok_or(Error::MissingHeaderLine(name))?;

        line.to_str()
            .ok()
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidHeaderLine {
                name,
                value: line.to_str_lossy().into_owned(),
            })
    }

    /// Parse the transfer list text.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut lines = data.lines().enumerate().map(|(i, l)| (i + 1, l));

        let version = Self::parse_header_line(&mut lines, "version")?;
        let version = u32::try_from(version)
            .ok()
            .filter(|v| (VERSION_MIN..=VERSION_MAX).contains(v))
            .ok_or(Error::UnsupportedVersion(version.min(u64::from(u32::MAX)) as u32))?;

        let new_blocks = Self::parse_header_line(&mut lines, "new_blocks")?;

        let (stash_entries, max_stash_blocks) = if version >= VERSION_FOR_STASH {
            (
                Some(Self::parse_header_line(&mut lines, "stash_entries")?),
                Some(Self::parse_header_line(&mut lines, "max_stash_blocks")?),
            )
        } else {
            (None, None)
        };

        let mut commands = vec![];
        let mut skipped = vec![];

        for (line_num, line) in lines {
            let line = line
                .to_str()
                .map_err(|_| Error::InvalidEncoding { line: line_num })?;

            let mut pieces = line.split(' ');
            let name = pieces.next().unwrap_or_default();
            let arg = pieces.next();

            let command = match name {
                "erase" => "erase",
                "new" => "new",
                "zero" => "zero",
                "" => continue,
                // Some tools append block hashes or counts on their own lines.
                n if n.starts_with(|c: char| c.is_ascii_digit()) => continue,
                n => {
                    warn!("Line {line_num}: Skipping unsupported command: {n:?}");
                    skipped.push(n.to_owned());
                    continue;
                }
            };

            let arg = arg.ok_or(Error::MissingRangeSet {
                line: line_num,
                command,
            })?;
            let ranges = arg.parse::<RangeSet>().map_err(|_| Error::InvalidRangeSet {
                line: line_num,
                value: arg.to_owned(),
            })?;

            commands.push(match command {
                "erase" => Command::Erase(ranges),
                "new" => Command::New(ranges),
                _ => Command::Zero(ranges),
            });
        }

        Ok(Self {
            version,
            new_blocks,
            stash_entries,
            max_stash_blocks,
            commands,
            skipped,
        })
    }
}

impl<R: Read> FromReader<R> for TransferList {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut data = vec![];
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::DataRead("transfer_list", e))?;

        Self::parse(&data)
    }
}

/// Check whether the data looks like the beginning of a transfer list. Only
/// the first two header lines are examined.
pub fn probe(data: &[u8]) -> bool {
    let mut lines = data.lines();

    let version = lines
        .next()
        .and_then(|l| l.to_str().ok())
        .and_then(|l| l.trim().parse::<u32>().ok());
    let new_blocks = lines
        .next()
        .and_then(|l| l.to_str().ok())
        .and_then(|l| l.trim().parse::<u64>().ok());

    matches!(version, Some(v) if (VERSION_MIN..=VERSION_MAX).contains(&v)) && new_blocks.is_some()
}

/// Reconstruct the full image described by `list` into `writer`, consuming
/// blocks from `patch` for every `new` command in order. The output is extended
/// to cover the highest block referenced by any command, but is never
/// truncated. Returns the final size of the output in bytes.
pub fn apply(
    list: &TransferList,
    mut patch: impl Read,
    mut writer: impl Write + Seek,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    list.validate()?;

    let block_size = u64::from(options.block_size);

    for (index, command) in list.commands.iter().enumerate() {
        // Computed for every command so that out-of-range erase and zero
        // commands are caught before the output is extended.
        let byte_ranges = command.ranges().byte_ranges(block_size)?;

        let Command::New(ranges) = command else {
            debug!("Command #{index}: Nothing to write for {}", command.name());
            continue;
        };

        debug!("Command #{index}: Copying {} blocks: {ranges:?}", ranges.blocks());

        let mut segment_writer = SegmentWriter::new(&mut writer, byte_ranges);
        let size = segment_writer.remaining();

        stream::copy_n(&mut patch, &mut segment_writer, size, cancel_signal)
            .map_err(|source| Error::PatchData { index, source })?;
    }

    match patch.read_array_exact::<1>() {
        Ok(_) => warn!("Patch data has unused trailing bytes"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
        Err(e) => return Err(Error::DataRead("patch_trailer", e)),
    }

    let max_size = list
        .total_blocks()
        .checked_mul(block_size)
        .ok_or(Error::RangeTooLarge {
            start: 0,
            end: list.total_blocks(),
        })?;

    let size = stream::extend_to(&mut writer, max_size)
        .map_err(|e| Error::DataWrite("output_len", e))?;

    writer
        .flush()
        .map_err(|e| Error::DataWrite("output_flush", e))?;

    Ok(size)
}
