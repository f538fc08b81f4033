// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Android sparse image decoding.
//!
//! A sparse image is a little-endian header followed by an ordered list of
//! chunks that together describe every block of the unsparsed image exactly
//! once. Decoding streams one chunk at a time, so memory usage does not depend
//! on the image size.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    ops::Range,
    sync::atomic::AtomicBool,
};

use crc32fast::Hasher;
use thiserror::Error;
use tracing::debug;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{Category, DecodeOptions},
    stream,
};

/// Magic value at the start of every sparse image.
pub const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// Supported minor version.
pub const MINOR_VERSION: u16 = 0;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Not a sparse image: invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Not a sparse image: invalid file header size: {0} != {size}", size = mem::size_of::<RawHeader>())]
    InvalidFileHeaderSize(u16),
    #[error("Not a sparse image: invalid chunk header size: {0} != {size}", size = mem::size_of::<RawChunk>())]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    #[error("Expected block size {expected}, but have {actual}")]
    BlockSizeMismatch { expected: u32, actual: u32 },
    // Chunk errors.
    #[error("Chunk #{index}: Size overflow: {chunk_size} * {block_size}")]
    ChunkSizeOverflow {
        index: u32,
        chunk_size: u32,
        block_size: u32,
    },
    #[error("Chunk #{index}: Invalid type: {chunk_type:#06x}")]
    InvalidChunkType { index: u32, chunk_type: u16 },
    #[error("Chunk #{index}: Data size too large: {data_size}")]
    DataSizeTooLarge { index: u32, data_size: u32 },
    #[error("Chunk #{index}: Block count overflow: {start_block} + {chunk_size}")]
    BlockCountOverflow {
        index: u32,
        start_block: u32,
        chunk_size: u32,
    },
    #[error("Chunk #{index}: End block {end_block} exceeds total blocks {total_blocks}")]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u32,
        total_blocks: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk is not empty")]
    Crc32ChunkNotEmpty { index: u32, chunk_size: u32 },
    #[error("Chunk #{index}: Expected total size {expected_size}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected_size: u32,
        total_size: u32,
    },
    #[error("Chunks only cover {covered} of {total} blocks")]
    ChunksShort { covered: u32, total: u32 },
    // Reader errors.
    #[error("Must fully consume data when CRC validation is enabled")]
    Crc32RandomRead,
    #[error("Previous chunk still has {0} unread bytes")]
    UnreadChunkData(u32),
    #[error("Expected checkpoint CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Checkpoint { expected: u32, actual: u32 },
    #[error("Expected final CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Final { expected: u32, actual: u32 },
    // Wrapped errors.
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write sparse data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Self::InvalidMagic(_)
            | Self::InvalidFileHeaderSize(_)
            | Self::InvalidChunkHeaderSize(_) => Category::NotThisFormat,
            Self::ChunksShort { .. } => Category::Truncated,
            Self::MismatchedCrc32Checkpoint { .. } | Self::MismatchedCrc32Final { .. } => {
                Category::ChecksumMismatch
            }
            Self::DataRead(_, e) | Self::DataWrite(_, e) => Category::from_io(e),
            _ => Category::Corrupt,
        }
    }

    /// Whether the input was rejected because it is not a sparse image at all.
    pub fn is_not_sparse(&self) -> bool {
        self.category() == Category::NotThisFormat
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported. All
    /// other versions cannot be parsed.
    major_version: little_endian::U16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`].
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        // Both header sizes are fixed. Anything else is some other format that
        // happens to share the magic.
        if usize::from(self.file_hdr_sz.get()) != mem::size_of::<Self>() {
            return Err(Error::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if usize::from(self.chunk_hdr_sz.get()) != mem::size_of::<RawChunk>() {
            return Err(Error::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Must be [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`],
    /// [`CHUNK_TYPE_DONT_CARE`], or [`CHUNK_TYPE_CRC32`].
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &self.chunk_type.get())
            .field("reserved1", &format_args!("{:#010x}", self.reserved1.get()))
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

impl RawChunk {
    fn expected_size(&self, index: u32, header: &RawHeader) -> Result<u32> {
        let data_size = match self.chunk_type.get() {
            CHUNK_TYPE_RAW => self
                .chunk_sz
                .get()
                .checked_mul(header.blk_sz.get())
                .ok_or_else(|| Error::ChunkSizeOverflow {
                    index,
                    chunk_size: self.chunk_sz.get(),
                    block_size: header.blk_sz.get(),
                })?,
            CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => 4,
            CHUNK_TYPE_DONT_CARE => 0,
            t => {
                return Err(Error::InvalidChunkType {
                    index,
                    chunk_type: t,
                });
            }
        };

        data_size
            .checked_add(header.chunk_hdr_sz.into())
            .ok_or(Error::DataSizeTooLarge { index, data_size })
    }

    fn validate(&self, index: u32, header: &RawHeader, start_block: u32) -> Result<()> {
        let end_block = start_block
            .checked_add(self.chunk_sz.get())
            .ok_or_else(|| Error::BlockCountOverflow {
                index,
                start_block,
                chunk_size: self.chunk_sz.get(),
            })?;

        if end_block > header.total_blks.get() {
            return Err(Error::EndBlockExceedsTotal {
                index,
                end_block,
                total_blocks: header.total_blks.get(),
            })?;
        }

        if self.chunk_type.get() == CHUNK_TYPE_CRC32 && self.chunk_sz.get() != 0 {
            return Err(Error::Crc32ChunkNotEmpty {
                index,
                chunk_size: self.chunk_sz.get(),
            });
        }

        let expected_size = self.expected_size(index, header)?;

        if expected_size != self.total_sz.get() {
            return Err(Error::InvalidChunkSize {
                index,
                expected_size,
                total_size: self.total_sz.get(),
            });
        }

        Ok(())
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Major version. [`MAJOR_VERSION`] is the only version supported. All
    /// other versions cannot be parsed.
    pub major_version: u16,
    /// Minor version. Versions aside from [`MINOR_VERSION`] can be read, but
    /// not written.
    pub minor_version: u16,
    /// Block size in bytes. Must be a multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    /// Number of chunks.
    pub num_chunks: u32,
    /// CRC32 checksum of the original data.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl IntoIterator for ChunkBounds {
    type Item = u32;

    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

impl ChunkBounds {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// The type of data contained in a chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// The chunk is filled with raw data.
    Data,
    /// The chunk is filled with repeating patterns of the specified integer
    /// encoded in little-endian.
    Fill(u32),
    /// The chunk is a hole and does not represent useful or valid data.
    Hole,
    /// The chunk is a CRC32 checksum. This does not represent actual data but
    /// serves as a checkpoint for validating the current checksum while in the
    /// middle of the sparse file.
    Crc32(u32),
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::Hole => write!(f, "Hole"),
            Self::Crc32(checksum) => f
                .debug_tuple("Crc32")
                .field(&format_args!("{checksum:#010x}"))
                .finish(),
        }
    }
}

/// A type that represents a contiguous list of blocks and the type of data or
/// metadata they contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// When [`Self::data`] is [`ChunkData::Data`], this is guaranteed to not
    /// exceed the bounds of [`u32`] when multiplied by [`Header::block_size`].
    /// For other types of data, a 64-bit signed or unsigned integer is needed.
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("bounds", &self.bounds)
            .field("data", &format_args!("{:?}", self.data))
            .finish()
    }
}

/// Whether to validate CRC32 checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMode {
    Validate,
    Ignore,
}

/// Hash what a fill chunk's contents would be if it were unsparsed.
fn hash_fill_chunk(
    raw_chunk: &RawChunk,
    fill_value: little_endian::U32,
    raw_header: &RawHeader,
    hasher: &mut Hasher,
) {
    let buf = [fill_value; 1024];
    let mut remain = u64::from(raw_chunk.chunk_sz) * u64::from(raw_header.blk_sz);

    while remain > 0 {
        let n = remain.min(buf.as_bytes().len() as u64) as usize;
        hasher.update(&buf.as_bytes()[..n]);
        remain -= n as u64;
    }
}

/// A type for reading sparse files.
pub struct SparseReader<R> {
    inner: R,
    seek_relative: Option<fn(&mut R, i64) -> io::Result<()>>,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to read.
    chunk: u32,
    /// Number of bytes left to read for the current chunk if the chunk has
    /// [`ChunkData::Data`].
    data_remain: u32,
    hasher: Option<Hasher>,
}

impl<R: Read + Seek> SparseReader<R> {
    /// Create a new reader from a seekable file. This allows data chunks to be
    /// efficiently skipped without reading them.
    pub fn new_seekable(inner: R, crc_mode: CrcMode) -> Result<Self> {
        let mut result = Self::new(inner, crc_mode)?;
        result.seek_relative = Some(Seek::seek_relative);
        Ok(result)
    }
}

impl<R: Read> SparseReader<R> {
    /// Create a new reader from a stream. This cannot efficiently skip reading
    /// data chunks if they are not needed. If the underlying file is seekable
    /// and skipping chunks is needed, use [`Self::new_seekable`] instead.
    pub fn new(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let header =
            RawHeader::read_from_io(&mut inner).map_err(|e| Error::DataRead("header", e))?;

        header.validate()?;

        Ok(Self {
            inner,
            seek_relative: None,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
            hasher: match crc_mode {
                CrcMode::Validate => Some(Hasher::new()),
                CrcMode::Ignore => None,
            },
        })
    }

    /// Get the sparse file header.
    pub fn header(&self) -> Header {
        Header {
            major_version: self.header.major_version.get(),
            minor_version: self.header.minor_version.get(),
            block_size: self.header.blk_sz.get(),
            num_blocks: self.header.total_blks.get(),
            num_chunks: self.header.total_chunks.get(),
            crc32: self.header.image_checksum.get(),
        }
    }

    /// Read the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`], the data must be fully read first unless the
    /// reader is seekable and CRC validation is disabled. If the last chunk has
    /// already been read, then [`None`] is returned.
    ///
    /// For chunks with [`ChunkData::Crc32`], if CRC validation is enabled, the
    /// checksum will have already been verified. The caller does not need to
    /// perform its own verification.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.data_remain != 0 {
            if let Some(seek_relative) = self.seek_relative {
                if self.hasher.is_some() {
                    return Err(Error::Crc32RandomRead);
                }

                seek_relative(&mut self.inner, self.data_remain.into())
                    .map_err(|e| Error::DataRead("data_remain", e))?;
                self.data_remain = 0;
            } else {
                return Err(Error::UnreadChunkData(self.data_remain));
            }
        }

        if self.chunk == self.header.total_chunks.get() {
            return Ok(None);
        }

        let raw_chunk =
            RawChunk::read_from_io(&mut self.inner).map_err(|e| Error::DataRead("chunk", e))?;

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        let data: ChunkData;

        match raw_chunk.chunk_type.get() {
            CHUNK_TYPE_RAW => {
                self.data_remain =
                    raw_chunk.total_sz.get() - u32::from(self.header.chunk_hdr_sz.get());

                data = ChunkData::Data;
            }
            CHUNK_TYPE_FILL => {
                let fill_value = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_fill_value", e))?;

                if let Some(hasher) = &mut self.hasher {
                    hash_fill_chunk(&raw_chunk, fill_value, &self.header, hasher);
                }

                data = ChunkData::Fill(fill_value.get());
            }
            CHUNK_TYPE_DONT_CARE => {
                if let Some(hasher) = &mut self.hasher {
                    hash_fill_chunk(&raw_chunk, 0.into(), &self.header, hasher);
                }

                data = ChunkData::Hole;
            }
            CHUNK_TYPE_CRC32 => {
                let expected = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_crc32", e))?;

                if let Some(hasher) = &mut self.hasher {
                    let actual = hasher.clone().finalize();

                    if actual != expected.get() {
                        return Err(Error::MismatchedCrc32Checkpoint {
                            expected: expected.get(),
                            actual,
                        });
                    }
                }

                data = ChunkData::Crc32(expected.get());
            }
            _ => unreachable!(),
        }

        let chunk = Chunk {
            bounds: ChunkBounds {
                start: self.block,
                end: self.block + raw_chunk.chunk_sz.get(),
            },
            data,
        };

        self.chunk += 1;
        self.block = chunk.bounds.end;

        Ok(Some(chunk))
    }

    /// Number of unsparsed blocks described by the chunks read so far.
    pub fn blocks_covered(&self) -> u32 {
        self.block
    }

    /// Verify the final checksum and return the underlying reader.
    pub fn finish(self) -> Result<R> {
        if let Some(hasher) = self.hasher {
            let expected = self.header.image_checksum.get();
            if expected != 0 {
                let actual = hasher.finalize();

                if actual != expected {
                    return Err(Error::MismatchedCrc32Final { expected, actual });
                }
            }
        }

        Ok(self.inner)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = buf.len().min(self.data_remain as usize);

        let n = self.inner.read(&mut buf[..to_read])?;

        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }

        self.data_remain -= n as u32;

        Ok(n)
    }
}

/// Read just enough of `reader` to tell whether it contains a sparse image.
/// Returns [`None`] if the data is not a sparse image, including when it is too
/// short to hold a sparse header.
pub fn probe(reader: impl Read) -> Result<Option<Header>> {
    match SparseReader::new(reader, CrcMode::Ignore) {
        Ok(r) => Ok(Some(r.header())),
        Err(e) if e.is_not_sparse() => Ok(None),
        Err(Error::DataRead(_, e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write `size` bytes of a repeating little-endian fill pattern.
fn write_fill(
    mut writer: impl Write,
    fill_value: u32,
    mut size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let buf = [little_endian::U32::new(fill_value); 4096];
    let buf = buf.as_bytes();

    while size > 0 {
        stream::check_cancel(cancel_signal)?;

        let n = size.min(buf.len() as u64) as usize;
        writer.write_all(&buf[..n])?;
        size -= n as u64;
    }

    Ok(())
}

/// Decode the sparse image in `reader` into the raw image in `writer`.
///
/// The writer is only ever written at block offsets described by the chunks.
/// Hole chunks are skipped without writing, so the output must either be a new
/// file or one that already reads back as zeros. On success, the output is
/// exactly [`Header::num_blocks`] blocks long.
pub fn decode(
    reader: impl Read,
    mut writer: impl Write + Seek,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    let crc_mode = if options.verify {
        CrcMode::Validate
    } else {
        CrcMode::Ignore
    };
    let mut sparse = SparseReader::new(reader, crc_mode)?;
    let header = sparse.header();

    if header.block_size != options.block_size {
        return Err(Error::BlockSizeMismatch {
            expected: options.block_size,
            actual: header.block_size,
        });
    }

    debug!("Sparse header: {header:?}");

    let block_size = u64::from(header.block_size);

    while let Some(chunk) = sparse.next_chunk()? {
        let offset = u64::from(chunk.bounds.start) * block_size;
        let size = u64::from(chunk.bounds.len()) * block_size;

        match chunk.data {
            ChunkData::Data => {
                writer
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::DataWrite("raw_seek", e))?;

                stream::copy_n(&mut sparse, &mut writer, size, cancel_signal)
                    .map_err(|e| Error::DataRead("raw_data", e))?;
            }
            ChunkData::Fill(value) => {
                writer
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::DataWrite("fill_seek", e))?;

                write_fill(&mut writer, value, size, cancel_signal)
                    .map_err(|e| Error::DataWrite("fill_data", e))?;
            }
            ChunkData::Hole | ChunkData::Crc32(_) => {
                stream::check_cancel(cancel_signal)
                    .map_err(|e| Error::DataWrite("cancel", e))?;
            }
        }
    }

    let covered = sparse.blocks_covered();
    if covered != header.num_blocks {
        return Err(Error::ChunksShort {
            covered,
            total: header.num_blocks,
        });
    }

    sparse.finish()?;

    // Trailing holes do not extend the file by themselves.
    stream::extend_to(&mut writer, u64::from(header.num_blocks) * block_size)
        .map_err(|e| Error::DataWrite("output_len", e))?;

    writer
        .flush()
        .map_err(|e| Error::DataWrite("output_flush", e))?;

    Ok(header)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn reject_larger_header_sizes() {
        let raw_header = RawHeader {
            magic: HEADER_MAGIC.into(),
            major_version: MAJOR_VERSION.into(),
            minor_version: MINOR_VERSION.into(),
            file_hdr_sz: 32.into(),
            chunk_hdr_sz: (mem::size_of::<RawChunk>() as u16).into(),
            blk_sz: 4096.into(),
            total_blks: 0.into(),
            total_chunks: 0.into(),
            image_checksum: 0.into(),
        };
        let mut data = raw_header.as_bytes().to_vec();
        data.extend_from_slice(&[0u8; 4]);

        let err = SparseReader::new(Cursor::new(&data), CrcMode::Validate)
            .err()
            .unwrap();
        assert_matches!(err, Error::InvalidFileHeaderSize(32));
        assert_eq!(err.category(), Category::NotThisFormat);
        assert_matches!(probe(Cursor::new(&data)), Ok(None));
    }

    #[test]
    fn short_input_is_not_sparse() {
        assert_matches!(probe(Cursor::new(b"\x3a\xff\x26\xed")), Ok(None));
        assert_matches!(probe(Cursor::new(b"")), Ok(None));
    }

    #[test]
    fn write_fill_pattern() {
        let cancel_signal = AtomicBool::new(false);
        let mut writer = Cursor::new(Vec::new());

        write_fill(&mut writer, 0x04030201, 10, &cancel_signal).unwrap();

        assert_eq!(writer.into_inner(), b"\x01\x02\x03\x04\x01\x02\x03\x04\x01\x02");
    }
}
