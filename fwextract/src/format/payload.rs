// SPDX-FileCopyrightText: 2022-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Extractor for A/B OTA `payload.bin` files.
//!
//! A payload consists of a fixed header, a protobuf [`DeltaArchiveManifest`],
//! the metadata signature and finally the blob containing the data for every
//! [`InstallOperation`]. Only full payloads can be extracted. Operations that
//! need the previous version of a partition fail with
//! [`Error::UnsupportedOperator`].

use std::{
    collections::HashSet,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    ops::Range,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use bzip2::write::BzDecoder;
use liblzma::write::XzDecoder;
use prost::Message;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use ring::digest::{Context, SHA256};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use zstd::stream::write::Decoder as ZstdDecoder;

use crate::{
    format::{Category, DecodeOptions},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallOperation, PartitionUpdate, install_operation::Type,
    },
    stream::{
        self, FromReader, HashingReader, ReadAt, ReadDiscardExt, ReadFixedSizeExt, SegmentWriter,
        UserPosFile,
    },
    util,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Size of the fixed header fields, excluding the metadata signature size,
/// which only exists in version 2.
const HEADER_SIZE_V1: u64 = 4 + 8 + 8;

/// Upper bound for the manifest size to avoid allocating absurd amounts of
/// memory for a damaged header.
const MANIFEST_MAX_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Manifest size exceeds limit: {0} > {MANIFEST_MAX_SIZE}")]
    ManifestTooLarge(u64),
    #[error("Failed to decode manifest")]
    Manifest(#[from] prost::DecodeError),
    #[error("Payload block size {actual} does not match expected block size {expected}")]
    BlockSizeMismatch { expected: u32, actual: u32 },
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Unknown operation type: {0}")]
    UnknownOperator(i32),
    #[error("Unsupported operation: {}", .0.as_str_name())]
    UnsupportedOperator(Type),
    #[error("Operation produced {actual} bytes, but destination extents span {expected} bytes")]
    OperationSizeMismatch { expected: u64, actual: u64 },
    #[error("Expected operation data sha256 {expected}, but have {actual}")]
    DataDigest { expected: String, actual: String },
    #[error("Partition {name:?}: Expected sha256 {expected}, but have {actual}")]
    PartitionDigest {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("Partition {name:?}: Size {size} is not aligned to the block size {block_size}")]
    PartitionSizeUnaligned {
        name: String,
        size: u64,
        block_size: u32,
    },
    #[error("Partition {name:?}: Block {block} is written by more than one operation")]
    ExtentsOverlap { name: String, block: u64 },
    #[error("Partition {name:?}: Blocks {start}..{end} are not written by any operation")]
    ExtentsGap { name: String, start: u64, end: u64 },
    #[error("Partition {name:?}: Extent ending at block {end} is past the end at block {blocks}")]
    ExtentPastEnd { name: String, end: u64, blocks: u64 },
    #[error("Partition not found in payload: {0:?}")]
    PartitionNotFound(String),
    #[error("Invalid partition name: {0:?}")]
    PartitionNameInvalid(String, #[source] io::Error),
    #[error("Failed to create thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to prepare output file: {0:?}")]
    OutputFile(PathBuf, #[source] io::Error),
    #[error("Failed to process {0} operation data")]
    OperationData(&'static str, #[source] io::Error),
    #[error("Failed to read payload data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write payload data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Self::UnknownMagic(_) => Category::NotThisFormat,
            Self::UnsupportedOperator(_) => Category::UnsupportedOperator,
            Self::DataDigest { .. } | Self::PartitionDigest { .. } => Category::ChecksumMismatch,
            Self::PartitionNotFound(_) | Self::ThreadPool(_) => Category::Io,
            // Decompressors report malformed input and excess output this way.
            Self::OperationData(_, e) => match e.kind() {
                io::ErrorKind::InvalidData
                | io::ErrorKind::InvalidInput
                | io::ErrorKind::WriteZero => Category::Corrupt,
                _ => Category::from_io(e),
            },
            Self::OutputFile(_, e) | Self::DataRead(_, e) | Self::DataWrite(_, e) => {
                Category::from_io(e)
            }
            _ => Category::Corrupt,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature_size: u32,
    /// Absolute offset of the blob section.
    pub blob_offset: u64,
}

impl PayloadHeader {
    /// Block size used by every extent in the manifest.
    pub fn block_size(&self) -> u32 {
        self.manifest.block_size()
    }

    /// Whether every partition can be extracted without a source image.
    pub fn is_full_ota(&self) -> bool {
        self.manifest
            .partitions
            .iter()
            .all(|p| p.operations.iter().all(|op| check_operator(op).is_ok()))
    }

    /// Summarize each partition for listings.
    pub fn partitions(&self) -> Vec<PartitionSummary> {
        self.manifest
            .partitions
            .iter()
            .map(|p| PartitionSummary {
                name: p.partition_name.clone(),
                size: p.new_partition_info.as_ref().and_then(|i| i.size),
                sha256: p
                    .new_partition_info
                    .as_ref()
                    .and_then(|i| i.hash.as_deref())
                    .map(hex::encode),
                operations: p.operations.len(),
                full: p.operations.iter().all(|op| check_operator(op).is_ok()),
            })
            .collect()
    }

    /// Version 1 payloads store the operations for the root filesystem and the
    /// kernel in dedicated fields instead of the partition list.
    fn normalize_v1(manifest: &mut DeltaArchiveManifest) {
        if !manifest.partitions.is_empty() {
            return;
        }

        let legacy = [
            (
                "root",
                std::mem::take(&mut manifest.install_operations),
                manifest.new_rootfs_info.take(),
            ),
            (
                "kernel",
                std::mem::take(&mut manifest.kernel_install_operations),
                manifest.new_kernel_info.take(),
            ),
        ];

        for (name, operations, info) in legacy {
            if operations.is_empty() && info.is_none() {
                continue;
            }

            manifest.partitions.push(PartitionUpdate {
                partition_name: name.to_owned(),
                operations,
                new_partition_info: info,
                ..Default::default()
            });
        }
    }
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload file. After this function returns,
    /// the file position is set to the beginning of the blob section.
    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader
            .read_array_exact::<4>()
            .map_err(|e| Error::DataRead("magic", e))?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader
            .read_array_exact::<8>()
            .map(u64::from_be_bytes)
            .map_err(|e| Error::DataRead("version", e))?;
        if version != 1 && version != 2 {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = reader
            .read_array_exact::<8>()
            .map(u64::from_be_bytes)
            .map_err(|e| Error::DataRead("manifest_size", e))?;
        if manifest_size > MANIFEST_MAX_SIZE {
            return Err(Error::ManifestTooLarge(manifest_size));
        }

        let (metadata_signature_size, header_size) = if version >= 2 {
            let size = reader
                .read_array_exact::<4>()
                .map(u32::from_be_bytes)
                .map_err(|e| Error::DataRead("metadata_signature_size", e))?;

            (size, HEADER_SIZE_V1 + 4)
        } else {
            (0, HEADER_SIZE_V1)
        };

        let manifest_raw = reader
            .read_vec_exact(manifest_size as usize)
            .map_err(|e| Error::DataRead("manifest", e))?;
        let mut manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

        // The metadata signature is not verified.
        reader
            .read_discard_exact(metadata_signature_size.into())
            .map_err(|e| Error::DataRead("metadata_signature", e))?;

        if version == 1 {
            Self::normalize_v1(&mut manifest);
        }

        Ok(Self {
            version,
            manifest,
            metadata_signature_size,
            blob_offset: header_size + manifest_size + u64::from(metadata_signature_size),
        })
    }
}

/// Check whether the reader contains a payload. Returns the payload version if
/// the magic matches.
pub fn probe(mut reader: impl Read) -> Result<Option<u64>> {
    let mut buf = [0u8; 12];

    match reader.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::DataRead("header", e)),
    }

    if buf[..4] != *PAYLOAD_MAGIC {
        return Ok(None);
    }

    let mut version = [0u8; 8];
    version.copy_from_slice(&buf[4..]);

    Ok(Some(u64::from_be_bytes(version)))
}

/// Listing entry for a partition in the manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub name: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub operations: usize,
    /// Whether the partition can be extracted without a source image.
    pub full: bool,
}

/// Return the operation type if it can be applied without a source image.
fn check_operator(op: &InstallOperation) -> Result<Type> {
    let op_type = Type::try_from(op.r#type).map_err(|_| Error::UnknownOperator(op.r#type))?;

    match op_type {
        Type::Replace
        | Type::ReplaceBz
        | Type::ReplaceXz
        | Type::ReplaceZstd
        | Type::Zero
        | Type::Discard => Ok(op_type),
        Type::Move
        | Type::Bsdiff
        | Type::SourceCopy
        | Type::SourceBsdiff
        | Type::Puffdiff
        | Type::BrotliBsdiff
        | Type::Zucchini
        | Type::Lz4diffBsdiff
        | Type::Lz4diffPuffdiff => Err(Error::UnsupportedOperator(op_type)),
    }
}

/// Compute the destination byte ranges of an operation.
fn dst_ranges(op: &InstallOperation, block_size: u32) -> Result<Vec<Range<u64>>> {
    op.dst_extents
        .iter()
        .map(|extent| {
            let start_block = extent
                .start_block
                .ok_or(Error::MissingField("start_block"))?;
            let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

            let start = start_block
                .checked_mul(block_size.into())
                .ok_or(Error::IntegerTooLarge("start_block"))?;
            let end = num_blocks
                .checked_mul(block_size.into())
                .and_then(|n| n.checked_add(start))
                .ok_or(Error::IntegerTooLarge("num_blocks"))?;

            Ok(start..end)
        })
        .collect()
}

/// Ensure that the destination extents of all operations in `partition` are
/// disjoint and cover the whole partition exactly once. If the partition size
/// is not known, the extents must cover everything up to the highest block
/// written. Returns the partition size.
pub fn validate_coverage(partition: &PartitionUpdate, block_size: u32) -> Result<u64> {
    let name = &partition.partition_name;
    let bs = u64::from(block_size);

    let mut ranges = Vec::new();
    for op in &partition.operations {
        ranges.extend(dst_ranges(op, block_size)?.into_iter().filter(|r| !r.is_empty()));
    }
    ranges.sort_by_key(|r| r.start);

    let size = match partition.new_partition_info.as_ref().and_then(|i| i.size) {
        Some(size) => size,
        None => ranges.iter().map(|r| r.end).max().unwrap_or(0),
    };

    if size % bs != 0 {
        return Err(Error::PartitionSizeUnaligned {
            name: name.clone(),
            size,
            block_size,
        });
    }

    let mut offset = 0;

    for range in ranges {
        if range.end > size {
            return Err(Error::ExtentPastEnd {
                name: name.clone(),
                end: range.end / bs,
                blocks: size / bs,
            });
        } else if range.start < offset {
            return Err(Error::ExtentsOverlap {
                name: name.clone(),
                block: range.start / bs,
            });
        } else if range.start > offset {
            return Err(Error::ExtentsGap {
                name: name.clone(),
                start: offset / bs,
                end: range.start / bs,
            });
        }

        offset = range.end;
    }

    if offset < size {
        return Err(Error::ExtentsGap {
            name: name.clone(),
            start: offset / bs,
            end: size / bs,
        });
    }

    Ok(size)
}

/// Apply a single full-payload operation from the payload `reader` to the
/// partition image `writer`. If `verify` is set, the operation data is checked
/// against [`InstallOperation::data_sha256_hash`].
///
/// There is no cancellation signal. Once started, an operation always writes
/// all of its destination extents. Callers check for cancellation between
/// operations.
pub fn apply_operation(
    mut reader: impl Read + Seek,
    writer: impl Write + Seek,
    block_size: u32,
    blob_offset: u64,
    op: &InstallOperation,
    verify: bool,
) -> Result<()> {
    let op_type = check_operator(op)?;
    let cancel_signal = &AtomicBool::new(false);
    let ranges = dst_ranges(op, block_size)?;
    let dst_size = ranges
        .iter()
        .try_fold(0u64, |total, r| total.checked_add(r.end - r.start))
        .ok_or(Error::IntegerTooLarge("dst_extents"))?;
    let mut writer = SegmentWriter::new(writer, ranges);

    if matches!(op_type, Type::Zero | Type::Discard) {
        stream::copy_n(io::repeat(0), &mut writer, dst_size, cancel_signal)
            .map_err(|e| Error::DataWrite("zeros", e))?;

        return Ok(());
    }

    let data_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
    let data_length = op.data_length.ok_or(Error::MissingField("data_length"))?;
    let in_offset = blob_offset
        .checked_add(data_offset)
        .ok_or(Error::IntegerTooLarge("data_offset"))?;

    reader
        .seek(SeekFrom::Start(in_offset))
        .map_err(|e| Error::DataRead("blob", e))?;

    let mut reader = HashingReader::new(&mut reader, Context::new(&SHA256));

    match op_type {
        Type::Replace => {
            if data_length != dst_size {
                return Err(Error::OperationSizeMismatch {
                    expected: dst_size,
                    actual: data_length,
                });
            }

            stream::copy_n(&mut reader, &mut writer, data_length, cancel_signal)
                .map_err(|e| Error::OperationData("REPLACE", e))?;
        }
        Type::ReplaceBz => {
            let mut decoder = BzDecoder::new(&mut writer);
            stream::copy_n(&mut reader, &mut decoder, data_length, cancel_signal)
                .map_err(|e| Error::OperationData("REPLACE_BZ", e))?;
            decoder
                .finish()
                .map_err(|e| Error::OperationData("REPLACE_BZ", e))?;
        }
        Type::ReplaceXz => {
            let mut decoder = XzDecoder::new(&mut writer);
            stream::copy_n(&mut reader, &mut decoder, data_length, cancel_signal)
                .map_err(|e| Error::OperationData("REPLACE_XZ", e))?;
            decoder
                .finish()
                .map_err(|e| Error::OperationData("REPLACE_XZ", e))?;
        }
        Type::ReplaceZstd => {
            let mut decoder = ZstdDecoder::new(&mut writer)
                .map_err(|e| Error::OperationData("REPLACE_ZSTD", e))?;
            stream::copy_n(&mut reader, &mut decoder, data_length, cancel_signal)
                .map_err(|e| Error::OperationData("REPLACE_ZSTD", e))?;
            decoder
                .flush()
                .map_err(|e| Error::OperationData("REPLACE_ZSTD", e))?;
        }
        _ => return Err(Error::UnsupportedOperator(op_type)),
    }

    if writer.remaining() != 0 {
        return Err(Error::OperationSizeMismatch {
            expected: dst_size,
            actual: dst_size - writer.remaining(),
        });
    }

    let (_, context) = reader.finish();
    let digest = context.finish();

    if verify {
        if let Some(expected) = &op.data_sha256_hash {
            if expected.as_slice() != digest.as_ref() {
                return Err(Error::DataDigest {
                    expected: hex::encode(expected),
                    actual: hex::encode(digest),
                });
            }
        }
    }

    Ok(())
}

/// Hash the extracted partition and compare it to
/// [`PartitionUpdate::new_partition_info`], if the manifest has a digest.
fn verify_partition(
    mut file: &File,
    partition: &PartitionUpdate,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let Some(expected) = partition
        .new_partition_info
        .as_ref()
        .and_then(|i| i.hash.as_ref())
    else {
        return Ok(());
    };

    file.rewind()
        .map_err(|e| Error::DataRead("partition_image", e))?;

    let mut context = Context::new(&SHA256);
    stream::copy_inspect(
        file,
        io::sink(),
        |data| context.update(data),
        cancel_signal,
    )
    .map_err(|e| Error::DataRead("partition_image", e))?;
    let digest = context.finish();

    if expected.as_slice() != digest.as_ref() {
        return Err(Error::PartitionDigest {
            name: partition.partition_name.clone(),
            expected: hex::encode(expected),
            actual: hex::encode(digest),
        });
    }

    Ok(())
}

/// Extract a single partition to `path`. Unsupported operators are detected
/// before the output file is created.
fn extract_partition(
    payload: impl ReadAt,
    header: &PayloadHeader,
    partition: &PartitionUpdate,
    path: &Path,
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    stream::check_cancel(cancel_signal).map_err(|e| Error::DataWrite("partition", e))?;

    for op in &partition.operations {
        check_operator(op)?;
    }

    let block_size = header.block_size();
    let size = validate_coverage(partition, block_size)?;

    let mut file = options
        .output_exists
        .create(path)
        .map_err(|e| Error::OutputFile(path.to_owned(), e))?;
    file.set_len(size)
        .map_err(|e| Error::OutputFile(path.to_owned(), e))?;

    for (i, op) in partition.operations.iter().enumerate() {
        stream::check_cancel(cancel_signal).map_err(|e| Error::DataWrite("partition", e))?;

        debug!(
            "Partition {:?}: Applying operation #{i}: {:?}",
            partition.partition_name,
            op.r#type(),
        );

        apply_operation(
            UserPosFile::new(&payload),
            &mut file,
            block_size,
            header.blob_offset,
            op,
            options.verify,
        )?;
    }

    file.sync_all()
        .map_err(|e| Error::OutputFile(path.to_owned(), e))?;

    if options.verify {
        verify_partition(&file, partition, cancel_signal)?;
    }

    Ok(size)
}

/// Outcome of extracting one partition.
#[derive(Debug)]
pub struct PartitionResult {
    pub name: String,
    pub path: PathBuf,
    /// Size of the extracted image.
    pub result: Result<u64>,
}

/// Extract partitions from a full payload into `<name>.img` files in
/// `output_dir`. If `names` is empty, every partition is extracted. A name
/// that is listed more than once is only extracted once.
///
/// Each partition is extracted by its own task on a pool of
/// [`DecodeOptions::workers`] threads and its operations are applied in
/// order. A failing partition does not stop the others. The results are
/// returned in the order of the selected partitions. If the final partition
/// digest does not match, the output file is kept and the result is an
/// [`Error::PartitionDigest`].
pub fn extract<P: ReadAt + Sync>(
    payload: P,
    header: &PayloadHeader,
    output_dir: &Path,
    names: &[String],
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<Vec<PartitionResult>> {
    if header.block_size() != options.block_size {
        return Err(Error::BlockSizeMismatch {
            expected: options.block_size,
            actual: header.block_size(),
        });
    }

    let partitions = if names.is_empty() {
        header.manifest.partitions.iter().collect::<Vec<_>>()
    } else {
        let mut seen = HashSet::new();

        names
            .iter()
            .filter(|n| seen.insert(n.as_str()))
            .map(|n| {
                header
                    .manifest
                    .partitions
                    .iter()
                    .find(|p| &p.partition_name == n)
                    .ok_or_else(|| Error::PartitionNotFound(n.clone()))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let jobs = partitions
        .into_iter()
        .map(|p| {
            let path = util::path_join_single(output_dir, format!("{}.img", p.partition_name))
                .map_err(|e| Error::PartitionNameInvalid(p.partition_name.clone(), e))?;

            Ok((p, path))
        })
        .collect::<Result<Vec<_>>>()?;

    let pool = options.thread_pool()?;

    let results = pool.install(|| {
        jobs.par_iter()
            .map(|(partition, path)| {
                let result =
                    extract_partition(&payload, header, partition, path, options, cancel_signal);

                match &result {
                    Ok(size) => info!("Extracted {:?}: {size} bytes", partition.partition_name),
                    Err(e) => debug!("Failed to extract {:?}: {e}", partition.partition_name),
                }

                PartitionResult {
                    name: partition.partition_name.clone(),
                    path: path.clone(),
                    result,
                }
            })
            .collect::<Vec<_>>()
    });

    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use bzip2::{Compression, write::BzEncoder};
    use ring::digest;

    use crate::protobuf::chromeos_update_engine::{Extent, PartitionInfo};

    use super::*;

    const BS: u32 = 4096;

    fn extent(start_block: u64, num_blocks: u64) -> Extent {
        Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    fn op(op_type: Type, offset: u64, data: &[u8], dst: Vec<Extent>) -> InstallOperation {
        InstallOperation {
            r#type: op_type.into(),
            data_offset: Some(offset),
            data_length: Some(data.len() as u64),
            dst_extents: dst,
            data_sha256_hash: Some(digest::digest(&digest::SHA256, data).as_ref().to_vec()),
            ..Default::default()
        }
    }

    fn build_payload(version: u64, manifest: &DeltaArchiveManifest, blob: &[u8]) -> Vec<u8> {
        let manifest_raw = manifest.encode_to_vec();
        let mut data = Vec::new();

        data.extend_from_slice(PAYLOAD_MAGIC);
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(&(manifest_raw.len() as u64).to_be_bytes());
        if version == 2 {
            data.extend_from_slice(&3u32.to_be_bytes());
        }
        data.extend_from_slice(&manifest_raw);
        if version == 2 {
            data.extend_from_slice(b"sig");
        }
        data.extend_from_slice(blob);

        data
    }

    #[test]
    fn parse_header() {
        let manifest = DeltaArchiveManifest {
            block_size: Some(BS),
            partitions: vec![PartitionUpdate {
                partition_name: "boot".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let data = build_payload(2, &manifest, b"blob");

        assert_eq!(probe(Cursor::new(&data)).unwrap(), Some(2));

        let mut reader = Cursor::new(&data);
        let header = PayloadHeader::from_reader(&mut reader).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.metadata_signature_size, 3);
        assert_eq!(header.blob_offset, reader.position());
        assert_eq!(&data[header.blob_offset as usize..], b"blob");
        assert_eq!(header.manifest.partitions[0].partition_name, "boot");

        let mut bad = data.clone();
        bad[0] = b'X';
        assert_eq!(probe(Cursor::new(&bad)).unwrap(), None);
        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(&bad)),
            Err(Error::UnknownMagic(_))
        );

        let mut bad = data.clone();
        bad[11] = 3;
        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(&bad)),
            Err(Error::UnsupportedVersion(3))
        );

        let err = PayloadHeader::from_reader(Cursor::new(&data[..30])).unwrap_err();
        assert_eq!(err.category(), Category::Truncated);
    }

    #[test]
    fn normalize_legacy_manifest() {
        let data = [0xaau8; 4096];
        let manifest = DeltaArchiveManifest {
            install_operations: vec![op(Type::Replace, 0, &data, vec![extent(0, 1)])],
            new_rootfs_info: Some(PartitionInfo {
                size: Some(4096),
                hash: None,
            }),
            ..Default::default()
        };
        let payload = build_payload(1, &manifest, &data);
        let header = PayloadHeader::from_reader(Cursor::new(&payload)).unwrap();

        assert_eq!(header.metadata_signature_size, 0);
        assert_eq!(header.manifest.partitions.len(), 1);
        assert_eq!(header.manifest.partitions[0].partition_name, "root");
        assert!(header.is_full_ota());
    }

    #[test]
    fn coverage() {
        let mut partition = PartitionUpdate {
            partition_name: "system".into(),
            operations: vec![
                op(Type::Zero, 0, &[], vec![extent(2, 2)]),
                op(Type::Zero, 0, &[], vec![extent(0, 2)]),
            ],
            new_partition_info: Some(PartitionInfo {
                size: Some(4 * u64::from(BS)),
                hash: None,
            }),
            ..Default::default()
        };
        assert_eq!(validate_coverage(&partition, BS).unwrap(), 4 * u64::from(BS));

        partition.operations[1].dst_extents = vec![extent(0, 3)];
        assert_matches!(
            validate_coverage(&partition, BS),
            Err(Error::ExtentsOverlap { block: 2, .. })
        );

        partition.operations[1].dst_extents = vec![extent(0, 1)];
        assert_matches!(
            validate_coverage(&partition, BS),
            Err(Error::ExtentsGap { start: 1, end: 2, .. })
        );

        partition.operations[1].dst_extents = vec![extent(0, 2)];
        partition.new_partition_info = Some(PartitionInfo {
            size: Some(5 * u64::from(BS)),
            hash: None,
        });
        assert_matches!(
            validate_coverage(&partition, BS),
            Err(Error::ExtentsGap { start: 4, end: 5, .. })
        );

        partition.new_partition_info = Some(PartitionInfo {
            size: Some(100),
            hash: None,
        });
        assert_matches!(
            validate_coverage(&partition, BS),
            Err(Error::PartitionSizeUnaligned { size: 100, .. })
        );

        partition.new_partition_info = Some(PartitionInfo {
            size: Some(4 * u64::from(BS)),
            hash: None,
        });
        partition.operations[0].dst_extents = vec![extent(2, 3)];
        let err = validate_coverage(&partition, BS).unwrap_err();
        assert_matches!(err, Error::ExtentPastEnd { end: 5, blocks: 4, .. });
        assert_eq!(err.category(), Category::Corrupt);
    }

    #[test]
    fn apply_zstd_operation() {
        let raw = (0..2 * BS).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let compressed = zstd::encode_all(raw.as_slice(), 3).unwrap();
        let replace_zstd = op(Type::ReplaceZstd, 0, &compressed, vec![extent(0, 2)]);

        let mut output = Cursor::new(Vec::new());
        apply_operation(
            Cursor::new(&compressed),
            &mut output,
            BS,
            0,
            &replace_zstd,
            true,
        )
        .unwrap();
        assert_eq!(output.into_inner(), raw);

        // Decompresses to less than the destination extents.
        let short = zstd::encode_all(&raw[..4096], 3).unwrap();
        let replace_short = op(Type::ReplaceZstd, 0, &short, vec![extent(0, 2)]);
        assert_matches!(
            apply_operation(
                Cursor::new(&short),
                Cursor::new(Vec::new()),
                BS,
                0,
                &replace_short,
                true,
            ),
            Err(Error::OperationSizeMismatch {
                expected: 8192,
                actual: 4096,
            })
        );
    }

    #[test]
    fn apply_replace_operations() {
        let raw = [0x55u8; 4096];
        let mut bz = BzEncoder::new(Vec::new(), Compression::default());
        bz.write_all(&raw).unwrap();
        let bz = bz.finish().unwrap();

        let mut blob = raw.to_vec();
        blob.extend_from_slice(&bz);

        let replace = op(Type::Replace, 0, &raw, vec![extent(1, 1)]);
        let replace_bz = op(Type::ReplaceBz, raw.len() as u64, &bz, vec![extent(0, 1)]);
        let zero = op(Type::Zero, 0, &[], vec![extent(2, 1)]);

        let mut output = Cursor::new(vec![0xffu8; 3 * 4096]);

        // Operations are independent of each other's order.
        for o in [&replace_bz, &zero, &replace] {
            apply_operation(
                Cursor::new(&blob),
                &mut output,
                BS,
                0,
                o,
                true,
            )
            .unwrap();
        }

        let output = output.into_inner();
        assert_eq!(&output[..4096], &raw);
        assert_eq!(&output[4096..8192], &raw);
        assert!(util::is_zero(&output[8192..]));
    }

    #[test]
    fn reject_bad_operations() {
        let raw = [0x55u8; 4096];
        let mut output = Cursor::new(Vec::new());

        let mut bad_hash = op(Type::Replace, 0, &raw, vec![extent(0, 1)]);
        bad_hash.data_sha256_hash = Some(vec![0u8; 32]);
        let err = apply_operation(
            Cursor::new(&raw),
            &mut output,
            BS,
            0,
            &bad_hash,
            true,
        )
        .unwrap_err();
        assert_matches!(err, Error::DataDigest { .. });
        assert_eq!(err.category(), Category::ChecksumMismatch);

        // Skipped without verification.
        apply_operation(
            Cursor::new(&raw),
            &mut output,
            BS,
            0,
            &bad_hash,
            false,
        )
        .unwrap();

        let short = op(Type::Replace, 0, &raw[..100], vec![extent(0, 1)]);
        assert_matches!(
            apply_operation(
                Cursor::new(&raw),
                &mut output,
                BS,
                0,
                &short,
                true,
            ),
            Err(Error::OperationSizeMismatch {
                expected: 4096,
                actual: 100,
            })
        );

        let mut source_copy = op(Type::SourceCopy, 0, &[], vec![extent(0, 1)]);
        source_copy.src_extents = vec![extent(0, 1)];
        let err = apply_operation(
            Cursor::new(&raw),
            &mut output,
            BS,
            0,
            &source_copy,
            true,
        )
        .unwrap_err();
        assert_matches!(err, Error::UnsupportedOperator(Type::SourceCopy));
        assert_eq!(err.category(), Category::UnsupportedOperator);

        let garbage = [0x42u8; 64];
        let bad_xz = op(Type::ReplaceXz, 0, &garbage, vec![extent(0, 1)]);
        let err = apply_operation(
            Cursor::new(&garbage),
            &mut output,
            BS,
            0,
            &bad_xz,
            true,
        )
        .unwrap_err();
        assert_eq!(err.category(), Category::Corrupt);
    }
}
