// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Decoders for the block-oriented containers that Android firmware is shipped
//! in. Every decoder consumes a container and produces raw partition images.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io,
    path::Path,
    process::ExitCode,
};

use serde::{Deserialize, Serialize};

pub mod lp;
pub mod payload;
pub mod probe;
pub mod sparse;
pub mod transfer;

/// Block size used by every supported container format.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Broad classification of a decoding failure. Every module-specific error
/// type maps each of its variants to exactly one category, which determines
/// the process exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// The input is not in the format that the decoder handles.
    NotThisFormat,
    /// The input ended before all of the data it declares was read.
    Truncated,
    /// The input is structurally invalid.
    Corrupt,
    /// A stored checksum or digest does not match the data.
    ChecksumMismatch,
    /// The output path already exists and overwriting was not requested.
    OutputExists,
    /// An operation requires functionality that is not available, such as a
    /// delta operator without a source image.
    UnsupportedOperator,
    /// The user requested cancellation.
    Cancelled,
    /// Any other I/O failure.
    Io,
}

impl Category {
    /// Classify an I/O error that was not already wrapped by a decoder.
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            io::ErrorKind::Interrupted => Self::Cancelled,
            io::ErrorKind::AlreadyExists => Self::OutputExists,
            _ => Self::Io,
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::Io => 1,
            Self::NotThisFormat => 3,
            Self::Truncated => 4,
            Self::Corrupt => 5,
            Self::ChecksumMismatch => 6,
            Self::OutputExists => 7,
            Self::UnsupportedOperator => 8,
            Self::Cancelled => 130,
        }
    }
}

impl From<Category> for ExitCode {
    fn from(category: Category) -> Self {
        Self::from(category.exit_code())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotThisFormat => "not this format",
            Self::Truncated => "truncated",
            Self::Corrupt => "corrupt",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::OutputExists => "output exists",
            Self::UnsupportedOperator => "unsupported operator",
            Self::Cancelled => "cancelled",
            Self::Io => "I/O error",
        };

        f.write_str(s)
    }
}

/// What to do when an output file already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Refuse to touch the existing file.
    #[default]
    Fail,
    /// Truncate and replace the existing file.
    Overwrite,
}

impl OutputPolicy {
    /// Open `path` for writing according to this policy. With
    /// [`OutputPolicy::Fail`], an existing file results in an error of kind
    /// [`io::ErrorKind::AlreadyExists`].
    pub fn create(self, path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);

        match self {
            Self::Fail => options.create_new(true),
            Self::Overwrite => options.create(true).truncate(true),
        };

        options.open(path)
    }
}

/// Settings shared by all decoders. These are passed explicitly to every
/// decoding operation instead of being read from global state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Expected block size of the container.
    pub block_size: u32,
    /// Whether to verify checksums and digests stored in the container.
    pub verify: bool,
    /// Maximum number of partitions to process concurrently. 0 uses the
    /// available parallelism.
    pub workers: usize,
    /// What to do when an output file already exists.
    pub output_exists: OutputPolicy,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            verify: true,
            workers: 0,
            output_exists: OutputPolicy::Fail,
        }
    }
}

impl DecodeOptions {
    /// Build a thread pool bounded by [`Self::workers`].
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
    }
}
