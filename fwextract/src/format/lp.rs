// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader for the logical partition (LP) metadata stored at the start of a
//! `super` image, plus an extractor that slices the image into one raw file per
//! logical partition.
//!
//! On-disk layout of a normal image:
//!
//! | Offset                  | Contents                                  |
//! |-------------------------|-------------------------------------------|
//! | 0                       | 4096 reserved bytes                       |
//! | 4096                    | primary geometry, padded to 4096 bytes    |
//! | 8192                    | backup geometry, padded to 4096 bytes     |
//! | 12288                   | `slot_count` primary metadata copies      |
//! | ...                     | `slot_count` backup metadata copies       |
//!
//! Each metadata copy is padded to `metadata_max_size` bytes. Empty images
//! (`super_empty.img`) have a single unpadded geometry and metadata copy.

use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    mem,
    num::NonZeroU64,
    path::{Path, PathBuf},
    str,
    sync::atomic::AtomicBool,
};

use bitflags::bitflags;
use bstr::ByteSlice;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use ring::digest::{self, Digest};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{Category, DecodeOptions, sparse},
    stream::{self, FromReader, ReadAt, ReadDiscardExt, ReadFixedSizeExt, UserPosFile},
    util::{self, DebugString, is_zero},
};

/// Magic value for [`RawGeometry::magic`].
const GEOMETRY_MAGIC: u32 = 0x616c4467;

/// Padded size for storing a [`RawGeometry`].
const GEOMETRY_SIZE: u32 = 4096;

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0x414C5030;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 10;
/// Minimum supported minor version (inclusive).
pub const MINOR_VERSION_MIN: u16 = 0;
/// Maximum supported minor version (inclusive).
pub const MINOR_VERSION_MAX: u16 = 2;

/// Minor version required for using [`PartitionAttributes::UPDATED`].
const VERSION_FOR_UPDATED_ATTR: u16 = 1;
/// Metadata minor version needed for the 256-byte [`RawHeader`] instead of the
/// 128-byte header without [`RawHeader::flags`] and [`RawHeader::reserved`].
const VERSION_FOR_EXPANDED_HEADER: u16 = 2;

/// Size of a sector.
pub const SECTOR_SIZE: u32 = 512;

/// Offset of the primary geometry in a normal image.
pub const PARTITION_RESERVED_BYTES: u32 = 4096;

/// Upper bound for [`RawGeometry::metadata_max_size`] so that a hostile image
/// cannot make us allocate arbitrarily large slot buffers.
const METADATA_MAX_SIZE: u32 = 128 * 1024;

/// Smallest unit of work when copying extents in parallel.
const COPY_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Input is a sparse image; run `sparse convert` on it first")]
    SparseImage,
    // Naming errors.
    #[error("Invalid partition name: {0:?}")]
    PartitionNameInvalid(DebugString),
    // Geometry errors.
    #[error("Invalid geometry magic: {0:#010x}")]
    GeometryInvalidMagic(u32),
    #[error("Invalid geometry size: {0} != {size}", size = mem::size_of::<RawGeometry>())]
    GeometryInvalidSize(u32),
    #[error("Expected geometry digest {expected}, but have {actual}")]
    GeometryInvalidDigest { expected: String, actual: String },
    #[error("Maximum metadata size is not sector-aligned: {0}")]
    MaxMetadataSizeUnaligned(u32),
    #[error("Maximum metadata size exceeds limit: {0} > {METADATA_MAX_SIZE}")]
    MaxMetadataSizeTooLarge(u32),
    #[error("No metadata slots defined")]
    NoMetadataSlots,
    #[error("Logical block size is not sector-aligned: {0}")]
    LogicalBlockSizeUnaligned(u32),
    // Header errors.
    #[error("Invalid header magic: {0:#010x}")]
    HeaderInvalidMagic(u32),
    #[error("Unsupported header version: {major}.{minor}")]
    HeaderUnsupportedVersion { major: u16, minor: u16 },
    #[error("Invalid header size: {0} != {size}", size = mem::size_of::<RawHeader>())]
    HeaderInvalidSize(u32),
    #[error("Header version {major}.{minor} cannot have flags or reserved fields set")]
    HeaderUnexpectedFields { major: u16, minor: u16 },
    #[error("Expected header digest {expected}, but have {actual}")]
    HeaderInvalidDigest { expected: String, actual: String },
    #[error("Metadata slot exceeds maximum size: {metadata_size} > {max_size} - {header_size}")]
    MetadataTooLarge {
        metadata_size: u32,
        max_size: u32,
        header_size: u32,
    },
    #[error("Descriptors too large or have gaps")]
    DescriptorsTooLargeOrHaveGaps,
    #[error("Gap after last descriptor")]
    DescriptorsFinalGap,
    #[error("Invalid descriptor entry sizes")]
    DescriptorsInvalidEntrySizes,
    #[error("Descriptor entry count {entry_count} does not match {name} table length {table_len}")]
    DescriptorMismatchedEntryCount {
        name: &'static str,
        entry_count: u32,
        table_len: usize,
    },
    #[error("Expected tables digest {expected}, but have {actual}")]
    HeaderInvalidTablesDigest { expected: String, actual: String },
    // Partition errors.
    #[error("Partition {name:?}: Invalid attributes: {}", .attributes.0)]
    PartitionInvalidAttributes {
        name: DebugString,
        attributes: PartitionAttributes,
    },
    #[error("Partition {name:?}: Extent indices too large")]
    PartitionExtentIndicesTooLarge { name: DebugString },
    #[error("Partition {name:?}: Extent indices set on empty image")]
    PartitionExtentIndicesEmptyImage { name: DebugString },
    #[error("Partition {name:?}: Invalid partition group index: {index}")]
    PartitionInvalidGroupIndex { name: DebugString, index: u32 },
    #[error("Partition {name:?}: Sector count too large")]
    PartitionSectorCountTooLarge { name: DebugString },
    #[error("Partition {name:?}: Byte count too large")]
    PartitionByteCountTooLarge { name: DebugString },
    #[error("Partition {name:?}: Extent #{index} also belongs to partition {other:?}")]
    PartitionSharesExtent {
        name: DebugString,
        other: DebugString,
        index: u32,
    },
    #[error("Partition {name:?}: Size {size} is not a multiple of the logical block size {block_size}")]
    PartitionSizeUnaligned {
        name: DebugString,
        size: u64,
        block_size: u32,
    },
    // Extent errors.
    #[error("Extent #{index}: Invalid block device index: {device_index}")]
    ExtentInvalidDeviceIndex { index: usize, device_index: u32 },
    #[error("Extent #{index}: End sector too large: {start} + {count}")]
    ExtentEndSectorTooLarge {
        index: usize,
        start: u64,
        count: u64,
    },
    #[error("Extent #{index}: {start} starts before block device's first sector {sector}")]
    ExtentStartBeforeDeviceStart {
        index: usize,
        start: u64,
        sector: u64,
    },
    #[error("Extent #{index}: {end} ends after block device's last sector {sector}")]
    ExtentEndsAfterDeviceEnd { index: usize, end: u64, sector: u64 },
    #[error("Extent #{index}: Type zero extents cannot have non-zero sector or device")]
    ExtentTypeZeroNotEmpty { index: usize },
    #[error("Extent #{index}: Invalid type: {extent_type}")]
    ExtentInvalidType { index: usize, extent_type: u32 },
    #[error("Extent #{index}: Overlaps another extent: #{other}")]
    ExtentOverlapsAnother { index: usize, other: usize },
    // Partition group errors.
    #[error("Group {name:?}: Total size of partitions too large")]
    GroupTotalSizeTooLarge { name: DebugString },
    #[error("Group {name:?}: Total partition size {size} exceeds limit {limit}")]
    GroupTotalSizeExceedsLimit {
        name: DebugString,
        size: u64,
        limit: u64,
    },
    // Block device errors.
    #[error("Device {name:?}: Alignment is 0")]
    DeviceAlignmentIsZero { name: DebugString },
    #[error("Device {name:?}: Partition alignment is not sector-aligned")]
    DeviceAlignmentNotSectorAligned { name: DebugString },
    #[error("Device {name:?}: First logical sector is not partition-aligned")]
    DeviceFirstSectorNotAligned { name: DebugString },
    #[error("Device {name:?}: Alignment offset is not sector-aligned")]
    DeviceOffsetNotSectorAligned { name: DebugString },
    #[error("Device {name:?}: Size is not sector-aligned")]
    DeviceSizeNotSectorAligned { name: DebugString },
    // Metadata errors.
    #[error("Slot out of range: {slot} >= {count}")]
    SlotOutOfRange { slot: u32, count: usize },
    #[error("A slot must be specified because they are not all identical")]
    SlotsDiffer,
    // Extraction errors.
    #[error("Partition not found: {0:?}")]
    PartitionNotFound(String),
    #[error("No input provided for block device #{0}")]
    MissingBlockDevice(usize),
    #[error("Block device #{index} is {size} bytes, but extents require {required} bytes")]
    DeviceTooShort {
        index: usize,
        size: u64,
        required: u64,
    },
    #[error("Failed to create thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to prepare output file: {0:?}")]
    OutputFile(PathBuf, #[source] io::Error),
    #[error("Partition {name:?}: Failed to copy extent")]
    ExtentCopy {
        name: String,
        #[source]
        source: io::Error,
    },
    // Wrapped errors.
    #[error("Failed to read LP data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Self::SparseImage | Self::GeometryInvalidMagic(_) => Category::NotThisFormat,
            Self::GeometryInvalidDigest { .. }
            | Self::HeaderInvalidDigest { .. }
            | Self::HeaderInvalidTablesDigest { .. } => Category::ChecksumMismatch,
            Self::DeviceTooShort { .. } => Category::Truncated,
            Self::SlotOutOfRange { .. }
            | Self::SlotsDiffer
            | Self::PartitionNotFound(_)
            | Self::MissingBlockDevice(_)
            | Self::ThreadPool(_) => Category::Io,
            Self::OutputFile(_, e)
            | Self::ExtentCopy { source: e, .. }
            | Self::DataRead(_, e) => Category::from_io(e),
            _ => Category::Corrupt,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub struct HeaderFlags: u32 {
        /// The device uses virtual A/B.
        const VIRTUAL_AB_DEVICE = 1 << 0;
        /// The device has overlay mounts due to `adb remount`.
        const OVERLAYS_ACTIVE = 1 << 1;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub struct PartitionAttributes: u32 {
        /// The device-mapper block device should be created as read-only.
        const READONLY = 1 << 0;
        /// The super partition itself needs a slot suffix appended.
        const SLOT_SUFFIXED = 1 << 1;
        /// The partition was created or modified for an OTA update using
        /// snapuserd.
        const UPDATED = 1 << 2;
        /// The partition should not be mapped in device-mapper.
        const DISABLED = 1 << 3;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub struct PartitionGroupFlags: u32 {
        /// Whether the group name needs a slot suffix to be appended.
        const SLOT_SUFFIXED = 1 << 0;

        const _ = !0;
    }

    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub struct BlockDeviceFlags: u32 {
        /// Whether the partition name needs a slot suffix to be appended.
        const SLOT_SUFFIXED = 1 << 0;

        const _ = !0;
    }
}

impl PartitionAttributes {
    /// Attributes introduced in metadata minor version 0.
    pub const MASK_V0: Self = Self::READONLY.union(Self::SLOT_SUFFIXED);
    /// Attributes introduced in metadata minor version 1.
    pub const MASK_V1: Self = Self::UPDATED.union(Self::DISABLED);
    /// All supported attributes.
    pub const MASK: Self = Self::MASK_V0.union(Self::MASK_V1);
}

/// Raw on-disk layout for the metadata geometry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawGeometry {
    /// Magic value. This should be equal to [`GEOMETRY_MAGIC`].
    magic: little_endian::U32,
    /// Size of this [`RawGeometry`].
    struct_size: little_endian::U32,
    /// SHA-256 checksum of this [`RawGeometry`] when this field is set to all
    /// zeros.
    checksum: [u8; 32],
    /// Maximum size of a single copy of the metadata (header + tables). This
    /// must be a multiple of [`SECTOR_SIZE`].
    metadata_max_size: little_endian::U32,
    /// Number of metadata slots, excluding the backup copies.
    metadata_slot_count: little_endian::U32,
    /// Block size of the logical partitions. This must be a non-zero multiple
    /// of [`SECTOR_SIZE`].
    logical_block_size: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawGeometry>() < GEOMETRY_SIZE as usize);

impl fmt::Debug for RawGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawGeometry")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("struct_size", &self.struct_size.get())
            .field("checksum", &hex::encode(self.checksum))
            .field("metadata_max_size", &self.metadata_max_size.get())
            .field("metadata_slot_count", &self.metadata_slot_count.get())
            .field("logical_block_size", &self.logical_block_size.get())
            .finish()
    }
}

impl RawGeometry {
    /// Parse the geometry from the beginning of a [`GEOMETRY_SIZE`] buffer
    /// without validating it.
    fn from_buf(buf: &[u8]) -> Result<Self> {
        Self::read_from_prefix(buf)
            .map(|(geometry, _)| geometry)
            .map_err(|_| {
                Error::DataRead(
                    "geometry",
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                )
            })
    }

    fn digest(&self) -> Digest {
        let mut copy = *self;
        copy.checksum.fill(0);

        digest::digest(&digest::SHA256, copy.as_bytes())
    }

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks.
    fn validate(&self) -> Result<()> {
        if self.magic.get() != GEOMETRY_MAGIC {
            return Err(Error::GeometryInvalidMagic(self.magic.get()));
        }

        if self.struct_size.get() != mem::size_of::<Self>() as u32 {
            return Err(Error::GeometryInvalidSize(self.struct_size.get()));
        }

        let digest = self.digest();
        if digest.as_ref() != self.checksum {
            return Err(Error::GeometryInvalidDigest {
                expected: hex::encode(self.checksum),
                actual: hex::encode(digest),
            });
        }

        if self.metadata_max_size.get() == 0 || self.metadata_max_size.get() % SECTOR_SIZE != 0 {
            return Err(Error::MaxMetadataSizeUnaligned(
                self.metadata_max_size.get(),
            ));
        } else if self.metadata_max_size.get() > METADATA_MAX_SIZE {
            return Err(Error::MaxMetadataSizeTooLarge(self.metadata_max_size.get()));
        } else if self.metadata_slot_count.get() == 0 {
            return Err(Error::NoMetadataSlots);
        }

        if self.logical_block_size.get() == 0 || self.logical_block_size.get() % SECTOR_SIZE != 0 {
            return Err(Error::LogicalBlockSizeUnaligned(
                self.logical_block_size.get(),
            ));
        }

        Ok(())
    }
}

/// Raw on-disk layout for a table descriptor within a [`RawHeader`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawTableDescriptor {
    /// Offset relative to the end of the [`RawHeader`].
    offset: little_endian::U32,
    /// Number of entries in the table.
    num_entries: little_endian::U32,
    /// Size of each entry.
    entry_size: little_endian::U32,
}

impl fmt::Debug for RawTableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTableDescriptor")
            .field("offset", &self.offset.get())
            .field("num_entries", &self.num_entries.get())
            .field("entry_size", &self.entry_size.get())
            .finish()
    }
}

impl RawTableDescriptor {
    /// Copy out the table described by this descriptor from the tables
    /// buffer. The header containing this descriptor must have already passed
    /// [`RawHeader::validate`].
    fn read_table<T: FromBytes + Immutable + Copy>(&self, buf: &[u8]) -> Result<Vec<T>> {
        let offset = self.offset.get() as usize;
        let size = self.num_entries.get() as usize * self.entry_size.get() as usize;

        let table = buf
            .get(offset..)
            .and_then(|b| b.get(..size))
            .ok_or(Error::DescriptorsTooLargeOrHaveGaps)?;

        <[T]>::ref_from_bytes(table)
            .map(|items| items.to_vec())
            .map_err(|_| Error::DescriptorsInvalidEntrySizes)
    }
}

/// Raw on-disk layout for the metadata header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. Only [`MAJOR_VERSION`] can be parsed.
    major_version: little_endian::U16,
    /// Minor version. Versions between [`MINOR_VERSION_MIN`] and
    /// [`MINOR_VERSION_MAX`] are supported.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    header_size: little_endian::U32,
    /// SHA-256 checksum of this [`RawHeader`] when this field is set to all
    /// zeros.
    header_checksum: [u8; 32],
    /// Size of all tables.
    tables_size: little_endian::U32,
    /// SHA-256 checksum of all tables.
    tables_checksum: [u8; 32],
    /// Partition table descriptor.
    partitions: RawTableDescriptor,
    /// Extent table descriptor.
    extents: RawTableDescriptor,
    /// Updatable group descriptor.
    groups: RawTableDescriptor,
    /// Block device table descriptor.
    block_devices: RawTableDescriptor,
    /// [Minor version >=2 only] Header flags. These are informational and do
    /// not affect parsing.
    flags: little_endian::U32,
    /// [Minor version >=2 only] Reserved bytes for future header versions.
    reserved: [u8; 124],
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("header_size", &self.header_size.get())
            .field("header_checksum", &hex::encode(self.header_checksum))
            .field("tables_size", &self.tables_size.get())
            .field("tables_checksum", &hex::encode(self.tables_checksum))
            .field("partitions", &self.partitions)
            .field("extents", &self.extents)
            .field("groups", &self.groups)
            .field("block_devices", &self.block_devices)
            .field("flags", &HeaderFlags::from_bits_retain(self.flags.get()).0)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl RawHeader {
    const SIZE_V1_0: usize = mem::offset_of!(Self, flags);

    fn size_for_version(major_version: u16, minor_version: u16) -> usize {
        if major_version == MAJOR_VERSION && minor_version >= VERSION_FOR_EXPANDED_HEADER {
            mem::size_of::<Self>()
        } else {
            Self::SIZE_V1_0
        }
    }

    fn size(&self) -> usize {
        Self::size_for_version(self.major_version.get(), self.minor_version.get())
    }

    fn digest(&self) -> Digest {
        let mut copy = *self;
        copy.header_checksum.fill(0);

        digest::digest(&digest::SHA256, &copy.as_bytes()[..self.size()])
    }

    fn validate_descriptor(
        &self,
        descriptor: &RawTableDescriptor,
        start_offset: u32,
    ) -> Option<u32> {
        if descriptor.offset.get() != start_offset {
            return None;
        }

        let size = descriptor
            .num_entries
            .get()
            .checked_mul(descriptor.entry_size.get())?;
        let next_offset = start_offset.checked_add(size)?;

        if next_offset > self.tables_size.get() {
            return None;
        }

        Some(next_offset)
    }

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks. [`RawGeometry::validate`] must have passed before this
    /// function is called.
    fn validate(&self, geometry: &RawGeometry) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::HeaderInvalidMagic(self.magic.get()));
        }

        let (major, minor) = (self.major_version.get(), self.minor_version.get());

        if major != MAJOR_VERSION || minor > MINOR_VERSION_MAX {
            return Err(Error::HeaderUnsupportedVersion { major, minor });
        }

        let expected_size = self.size();

        if self.header_size.get() != expected_size as u32 {
            return Err(Error::HeaderInvalidSize(self.header_size.get()));
        }

        if minor < VERSION_FOR_EXPANDED_HEADER && (self.flags.get() != 0 || !is_zero(&self.reserved))
        {
            return Err(Error::HeaderUnexpectedFields { major, minor });
        }

        let digest = self.digest();
        if digest.as_ref() != self.header_checksum {
            return Err(Error::HeaderInvalidDigest {
                expected: hex::encode(self.header_checksum),
                actual: hex::encode(digest),
            });
        }

        // metadata_max_size is at least one sector and the header is smaller
        // than that.
        if self.tables_size.get() > geometry.metadata_max_size.get() - self.header_size.get() {
            return Err(Error::MetadataTooLarge {
                metadata_size: self.tables_size.get(),
                max_size: geometry.metadata_max_size.get(),
                header_size: self.header_size.get(),
            });
        }

        // The tables must be contiguous and in this order.
        let mut offset = 0;

        for descriptor in [
            &self.partitions,
            &self.extents,
            &self.groups,
            &self.block_devices,
        ] {
            offset = self
                .validate_descriptor(descriptor, offset)
                .ok_or(Error::DescriptorsTooLargeOrHaveGaps)?;
        }

        if offset != self.tables_size.get() {
            return Err(Error::DescriptorsFinalGap);
        }

        if self.partitions.entry_size.get() != mem::size_of::<RawPartition>() as u32
            || self.extents.entry_size.get() != mem::size_of::<RawExtent>() as u32
            || self.groups.entry_size.get() != mem::size_of::<RawPartitionGroup>() as u32
            || self.block_devices.entry_size.get() != mem::size_of::<RawBlockDevice>() as u32
        {
            return Err(Error::DescriptorsInvalidEntrySizes);
        }

        Ok(())
    }
}

/// A potentially invalid raw partition name string.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct PartitionName([u8; 36]);

impl fmt::Debug for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, suffix) = self.split();
        let display = if is_zero(suffix) { prefix } else { &self.0 };

        fmt::Debug::fmt(&display.as_bstr(), f)
    }
}

impl PartitionName {
    fn split(&self) -> (&[u8], &[u8]) {
        self.0
            .iter()
            .position(|b| *b == 0)
            .map_or((&self.0, &[]), |i| self.0.split_at(i))
    }

    fn validate(&self) -> Result<()> {
        let (prefix, suffix) = self.split();

        // Real devices have names like "system_b-cow", so '-' is allowed even
        // though liblp's documentation only mentions alphanumerics and '_'.
        // This also guarantees that a name is safe to use as a file name.
        let prefix_valid = !prefix.is_empty()
            && prefix
                .iter()
                .all(|b| matches!(*b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-'));

        if prefix_valid && is_zero(suffix) {
            Ok(())
        } else {
            Err(Error::PartitionNameInvalid(DebugString::new(self)))
        }
    }

    fn as_str(&self) -> Result<&str> {
        self.validate()?;

        str::from_utf8(self.split().0)
            .map_err(|_| Error::PartitionNameInvalid(DebugString::new(self)))
    }
}

/// Raw on-disk layout for an entry in the logical partitions table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartition {
    /// Partition name in ASCII. This must be unique across all partitions.
    name: PartitionName,
    /// Partition attributes.
    attributes: little_endian::U32,
    /// Index of the first extent owned by this partition.
    first_extent_index: little_endian::U32,
    /// Number of extents covered by this partition.
    num_extents: little_endian::U32,
    /// Index of the group containing this partition.
    group_index: little_endian::U32,
}

impl fmt::Debug for RawPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attributes = PartitionAttributes::from_bits_retain(self.attributes.get());

        f.debug_struct("RawPartition")
            .field("name", &self.name)
            .field("attributes", &attributes.0)
            .field("first_extent_index", &self.first_extent_index.get())
            .field("num_extents", &self.num_extents.get())
            .field("group_index", &self.group_index.get())
            .finish()
    }
}

impl RawPartition {
    /// Ensure that all fields are semantically valid and that the extents add
    /// up to a whole number of logical blocks. [`RawHeader::validate`] must
    /// have passed before this function is called.
    fn validate(
        &self,
        image_type: ImageType,
        geometry: &RawGeometry,
        header: &RawHeader,
        extents: &[RawExtent],
        groups: &[RawPartitionGroup],
    ) -> Result<()> {
        self.name.validate()?;

        let mut valid_attributes = PartitionAttributes::MASK_V0;
        if header.minor_version.get() >= VERSION_FOR_UPDATED_ATTR {
            valid_attributes |= PartitionAttributes::MASK_V1;
        }

        let attributes = PartitionAttributes::from_bits_retain(self.attributes.get());

        if !(attributes - valid_attributes).is_empty() {
            return Err(Error::PartitionInvalidAttributes {
                name: DebugString::new(self.name),
                attributes,
            });
        }

        let first = self.first_extent_index.get();
        let count = self.num_extents.get();

        let owned = match image_type {
            ImageType::Normal => first
                .checked_add(count)
                .and_then(|end| extents.get(first as usize..end as usize))
                .ok_or_else(|| Error::PartitionExtentIndicesTooLarge {
                    name: DebugString::new(self.name),
                })?,
            ImageType::Empty => {
                if first != 0 || count != 0 {
                    return Err(Error::PartitionExtentIndicesEmptyImage {
                        name: DebugString::new(self.name),
                    });
                }

                &[]
            }
        };

        if self.group_index.get() as usize >= groups.len() {
            return Err(Error::PartitionInvalidGroupIndex {
                name: DebugString::new(self.name),
                index: self.group_index.get(),
            });
        }

        let size = owned
            .iter()
            .try_fold(0u64, |total, e| total.checked_add(e.num_sectors.get()))
            .ok_or_else(|| Error::PartitionSectorCountTooLarge {
                name: DebugString::new(self.name),
            })?
            .checked_mul(SECTOR_SIZE.into())
            .ok_or_else(|| Error::PartitionByteCountTooLarge {
                name: DebugString::new(self.name),
            })?;
        let block_size = geometry.logical_block_size.get();

        if size % u64::from(block_size) != 0 {
            return Err(Error::PartitionSizeUnaligned {
                name: DebugString::new(self.name),
                size,
                block_size,
            });
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the extent table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawExtent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    num_sectors: little_endian::U64,
    /// device-mapper target type.
    target_type: little_endian::U32,
    /// Starting physical sector for linear extents. Always 0 for zero extents.
    target_data: little_endian::U64,
    /// Index into the block devices table for linear extents. Always 0 for zero
    /// extents.
    target_source: little_endian::U32,
}

impl fmt::Debug for RawExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawExtent")
            .field("num_sectors", &self.num_sectors.get())
            .field("target_type", &self.target_type.get())
            .field("target_data", &self.target_data.get())
            .field("target_source", &self.target_source.get())
            .finish()
    }
}

impl RawExtent {
    /// dm-linear target.
    const TARGET_TYPE_LINEAR: u32 = 0;
    /// dm-zero target.
    const TARGET_TYPE_ZERO: u32 = 1;

    /// Ensure that all fields are semantically valid and that linear extents
    /// lie within their block device.
    fn validate(&self, index: usize, block_devices: &[RawBlockDevice]) -> Result<()> {
        match self.target_type.get() {
            Self::TARGET_TYPE_LINEAR => {
                let Some(device) = block_devices.get(self.target_source.get() as usize) else {
                    return Err(Error::ExtentInvalidDeviceIndex {
                        index,
                        device_index: self.target_source.get(),
                    });
                };

                let count = self.num_sectors.get();
                let start = self.target_data.get();
                let end = start
                    .checked_add(count)
                    .ok_or(Error::ExtentEndSectorTooLarge {
                        index,
                        start,
                        count,
                    })?;

                if start < device.first_logical_sector.get() {
                    return Err(Error::ExtentStartBeforeDeviceStart {
                        index,
                        start,
                        sector: device.first_logical_sector.get(),
                    });
                }

                let device_sectors = device.size.get() / u64::from(SECTOR_SIZE);

                if end > device_sectors {
                    return Err(Error::ExtentEndsAfterDeviceEnd {
                        index,
                        end,
                        sector: device_sectors,
                    });
                }
            }
            Self::TARGET_TYPE_ZERO => {
                if self.target_data.get() != 0 || self.target_source.get() != 0 {
                    return Err(Error::ExtentTypeZeroNotEmpty { index });
                }
            }
            n => {
                return Err(Error::ExtentInvalidType {
                    index,
                    extent_type: n,
                });
            }
        }

        Ok(())
    }
}

/// Raw on-disk layout for an entry in the partition groups table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartitionGroup {
    /// Partition group name in ASCII. This must be unique across all groups.
    name: PartitionName,
    /// Partition group flags.
    flags: little_endian::U32,
    /// Maximum size of all partitions in this group. 0 means unlimited.
    maximum_size: little_endian::U64,
}

impl fmt::Debug for RawPartitionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = PartitionGroupFlags::from_bits_retain(self.flags.get());

        f.debug_struct("RawPartitionGroup")
            .field("name", &self.name)
            .field("flags", &flags.0)
            .field("maximum_size", &self.maximum_size.get())
            .finish()
    }
}

impl RawPartitionGroup {
    /// Ensure that the group's partitions fit within its size limit.
    /// [`RawPartition::validate`] must have passed for all partitions.
    fn validate(
        &self,
        index: usize,
        partitions: &[RawPartition],
        extents: &[RawExtent],
    ) -> Result<()> {
        if self.maximum_size.get() != 0 {
            let mut total_size = 0u64;

            for partition in partitions {
                if partition.group_index.get() as usize == index {
                    let first = partition.first_extent_index.get() as usize;
                    let count = partition.num_extents.get() as usize;

                    for extent in &extents[first..][..count] {
                        total_size = total_size
                            .checked_add(extent.num_sectors.get())
                            .ok_or_else(|| Error::GroupTotalSizeTooLarge {
                                name: DebugString::new(self.name),
                            })?;
                    }
                }
            }

            if total_size > self.maximum_size.get() {
                return Err(Error::GroupTotalSizeExceedsLimit {
                    name: DebugString::new(self.name),
                    size: total_size,
                    limit: self.maximum_size.get(),
                });
            }
        }

        self.name.validate()
    }
}

/// Raw on-disk layout for an entry in the block devices table.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawBlockDevice {
    /// The first [`SECTOR_SIZE`]-byte sector usable by logical partitions.
    first_logical_sector: little_endian::U64,
    /// Alignment for the partition start offset.
    alignment: little_endian::U32,
    /// Adjustment for when the super partition itself is not aligned.
    alignment_offset: little_endian::U32,
    /// Block device size.
    size: little_endian::U64,
    /// Partition name in ASCII. This must be unique across all block devices.
    partition_name: PartitionName,
    /// Block device flags.
    flags: little_endian::U32,
}

impl fmt::Debug for RawBlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = BlockDeviceFlags::from_bits_retain(self.flags.get());

        f.debug_struct("RawBlockDevice")
            .field("first_logical_sector", &self.first_logical_sector.get())
            .field("alignment", &self.alignment.get())
            .field("alignment_offset", &self.alignment_offset.get())
            .field("size", &self.size.get())
            .field("partition_name", &self.partition_name)
            .field("flags", &flags.0)
            .finish()
    }
}

impl RawBlockDevice {
    fn validate(&self) -> Result<()> {
        if self.alignment.get() == 0 {
            return Err(Error::DeviceAlignmentIsZero {
                name: DebugString::new(self.partition_name),
            });
        } else if self.alignment.get() % SECTOR_SIZE != 0 {
            return Err(Error::DeviceAlignmentNotSectorAligned {
                name: DebugString::new(self.partition_name),
            });
        }

        let alignment_sectors = u64::from(self.alignment.get() / SECTOR_SIZE);
        if self.first_logical_sector.get() % alignment_sectors != 0 {
            return Err(Error::DeviceFirstSectorNotAligned {
                name: DebugString::new(self.partition_name),
            });
        }

        if self.alignment_offset.get() % SECTOR_SIZE != 0 {
            return Err(Error::DeviceOffsetNotSectorAligned {
                name: DebugString::new(self.partition_name),
            });
        }

        if self.size.get() % u64::from(SECTOR_SIZE) != 0 {
            return Err(Error::DeviceSizeNotSectorAligned {
                name: DebugString::new(self.partition_name),
            });
        }

        self.partition_name.validate()
    }
}

/// A wrapper around the on-disk layouts for a single metadata slot.
#[derive(Clone, Debug)]
struct RawMetadataSlot {
    header: RawHeader,
    partitions: Vec<RawPartition>,
    extents: Vec<RawExtent>,
    groups: Vec<RawPartitionGroup>,
    block_devices: Vec<RawBlockDevice>,
}

impl RawMetadataSlot {
    fn tables_digest(&self) -> Digest {
        let mut context = digest::Context::new(&digest::SHA256);
        context.update(self.partitions.as_bytes());
        context.update(self.extents.as_bytes());
        context.update(self.groups.as_bytes());
        context.update(self.block_devices.as_bytes());
        context.finish()
    }

    /// Parse a slot from a buffer containing the header and tables. Any bytes
    /// after the tables are ignored.
    fn from_buf(
        mut buf: &[u8],
        image_type: ImageType,
        geometry: &RawGeometry,
    ) -> Result<Self> {
        let mut header = RawHeader::new_zeroed();

        buf.read_exact(&mut header.as_mut_bytes()[..RawHeader::SIZE_V1_0])
            .map_err(|e| Error::DataRead("header_v1.0", e))?;
        if header.size() > RawHeader::SIZE_V1_0 {
            buf.read_exact(&mut header.as_mut_bytes()[RawHeader::SIZE_V1_0..])
                .map_err(|e| Error::DataRead("header_v1.2", e))?;
        }

        // The descriptors must be known to be in bounds before slicing.
        header.validate(geometry)?;

        let tables_buf = buf
            .read_vec_exact(header.tables_size.get() as usize)
            .map_err(|e| Error::DataRead("tables", e))?;

        let slot = Self {
            header,
            partitions: header.partitions.read_table(&tables_buf)?,
            extents: header.extents.read_table(&tables_buf)?,
            groups: header.groups.read_table(&tables_buf)?,
            block_devices: header.block_devices.read_table(&tables_buf)?,
        };

        slot.validate(image_type, geometry)?;

        Ok(slot)
    }

    /// Ensure that all fields are semantically valid and can be used without
    /// further checks.
    fn validate(&self, image_type: ImageType, geometry: &RawGeometry) -> Result<()> {
        self.header.validate(geometry)?;

        let digest = self.tables_digest();
        if digest.as_ref() != self.header.tables_checksum {
            return Err(Error::HeaderInvalidTablesDigest {
                expected: hex::encode(self.header.tables_checksum),
                actual: hex::encode(digest),
            });
        }

        for (len, descriptor, name) in [
            (self.partitions.len(), &self.header.partitions, "partition"),
            (self.extents.len(), &self.header.extents, "extent"),
            (self.groups.len(), &self.header.groups, "partition group"),
            (
                self.block_devices.len(),
                &self.header.block_devices,
                "block device",
            ),
        ] {
            if len != descriptor.num_entries.get() as usize {
                return Err(Error::DescriptorMismatchedEntryCount {
                    name,
                    entry_count: descriptor.num_entries.get(),
                    table_len: len,
                });
            }
        }

        // Tables are checked in dependency order: devices, extents, partitions,
        // then groups.

        for block_device in &self.block_devices {
            block_device.validate()?;
        }

        for (i, extent) in self.extents.iter().enumerate() {
            extent.validate(i, &self.block_devices)?;
        }

        // Extents are not necessarily stored in physical order, and gaps are
        // allowed since they appear after a virtual A/B CoW merge.
        let mut sorted_extents = self
            .extents
            .iter()
            .enumerate()
            .filter(|(_, e)| e.target_type.get() == RawExtent::TARGET_TYPE_LINEAR)
            .collect::<Vec<_>>();
        sorted_extents.sort_by_key(|(_, e)| (e.target_source.get(), e.target_data.get()));

        for window in sorted_extents.windows(2) {
            let ((a_i, a), (b_i, b)) = (window[0], window[1]);

            if a.target_source == b.target_source
                && a.target_data.get() + a.num_sectors.get() > b.target_data.get()
            {
                return Err(Error::ExtentOverlapsAnother {
                    index: b_i,
                    other: a_i,
                });
            }
        }

        for partition in &self.partitions {
            partition.validate(
                image_type,
                geometry,
                &self.header,
                &self.extents,
                &self.groups,
            )?;
        }

        // Each extent table entry belongs to at most one partition. The index
        // ranges were bounds checked above.
        let mut extent_ranges = self
            .partitions
            .iter()
            .filter(|p| p.num_extents.get() != 0)
            .map(|p| {
                let first = p.first_extent_index.get();
                (first, first + p.num_extents.get(), p)
            })
            .collect::<Vec<_>>();
        extent_ranges.sort_by_key(|(first, _, _)| *first);

        for window in extent_ranges.windows(2) {
            let ((_, a_end, a), (b_first, _, b)) = (window[0], window[1]);

            if b_first < a_end {
                return Err(Error::PartitionSharesExtent {
                    name: DebugString::new(b.name),
                    other: DebugString::new(a.name),
                    index: b_first,
                });
            }
        }

        for (i, group) in self.groups.iter().enumerate() {
            group.validate(i, &self.partitions, &self.extents)?;
        }

        Ok(())
    }
}

/// The raw metadata of an LP image. Every slot has passed validation.
#[derive(Clone, Debug)]
struct RawMetadata {
    image_type: ImageType,
    geometry: RawGeometry,
    slots: Vec<RawMetadataSlot>,
}

impl RawMetadata {
    /// Read the [`RawGeometry`] from the start of the image, falling back to
    /// the backup copy if the primary copy is damaged. The reader is left
    /// positioned at the first metadata slot.
    fn read_geometry(mut reader: impl Read) -> Result<(ImageType, RawGeometry)> {
        let mut buf = [0u8; GEOMETRY_SIZE as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::DataRead("geometry", e))?;

        if buf[..4] == sparse::HEADER_MAGIC.to_le_bytes() {
            return Err(Error::SparseImage);
        }

        // Non-empty images should have zeros here, but Samsung stores a
        // SignerVer02 structure in this region, so only the geometry magic can
        // be used to detect empty images.
        let mut geometry = RawGeometry::from_buf(&buf)?;

        let image_type = match geometry.validate() {
            Ok(()) => ImageType::Empty,
            Err(Error::GeometryInvalidMagic(_)) => {
                reader
                    .read_exact(&mut buf)
                    .map_err(|e| Error::DataRead("geometry_primary", e))?;
                geometry = RawGeometry::from_buf(&buf)?;

                if let Err(e) = geometry.validate() {
                    debug!("Primary geometry is damaged: {e}");

                    reader
                        .read_exact(&mut buf)
                        .map_err(|e| Error::DataRead("geometry_backup", e))?;
                    geometry = RawGeometry::from_buf(&buf)?;
                    geometry.validate()?;
                } else {
                    reader
                        .read_discard_exact(GEOMETRY_SIZE.into())
                        .map_err(|e| Error::DataRead("geometry_backup", e))?;
                }

                ImageType::Normal
            }
            Err(e) => return Err(e),
        };

        Ok((image_type, geometry))
    }

    /// Read the next metadata copy. The outer error is fatal, while the inner
    /// error only means that this particular copy is damaged.
    fn read_slot(
        mut reader: impl Read,
        image_type: ImageType,
        geometry: &RawGeometry,
    ) -> Result<Result<RawMetadataSlot>> {
        let max_size = geometry.metadata_max_size.get();

        let buf = match image_type {
            ImageType::Normal => reader
                .read_vec_exact(max_size as usize)
                .map_err(|e| Error::DataRead("metadata", e))?,
            // Empty images are not padded.
            ImageType::Empty => {
                let mut buf = Vec::new();
                reader
                    .take(max_size.into())
                    .read_to_end(&mut buf)
                    .map_err(|e| Error::DataRead("metadata", e))?;
                buf
            }
        };

        Ok(RawMetadataSlot::from_buf(&buf, image_type, geometry))
    }
}

impl<R: Read> FromReader<R> for RawMetadata {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let (image_type, geometry) = Self::read_geometry(&mut reader)?;

        let num_slots = match image_type {
            ImageType::Normal => geometry.metadata_slot_count.get() as usize,
            // Empty images only contain one slot, regardless of the geometry.
            ImageType::Empty => 1,
        };

        let mut slots = (0..num_slots)
            .map(|_| Self::read_slot(&mut reader, image_type, &geometry))
            .collect::<Result<Vec<_>>>()?;

        if image_type == ImageType::Normal {
            for (i, slot) in slots.iter_mut().enumerate() {
                let backup = Self::read_slot(&mut reader, image_type, &geometry)?;

                if slot.is_err() && backup.is_ok() {
                    debug!("Using backup copy of damaged metadata slot #{i}");
                    *slot = backup;
                }
            }
        }

        let slots = slots.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(Self {
            image_type,
            geometry,
            slots,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ImageType {
    /// An image containing partition data with the on-disk layout of a real
    /// device: [`PARTITION_RESERVED_BYTES`] of padding, two copies of the
    /// geometry and two copies of every metadata slot.
    Normal,
    /// A metadata-only image for fastboot (`super_empty.img`). There is no
    /// leading padding, only a single copy of the geometry and the metadata,
    /// and the metadata is not padded to the maximum size.
    Empty,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Partition name in ASCII.
    pub name: String,
    /// Partition attributes.
    pub attributes: PartitionAttributes,
    /// Extents covered by this partition.
    #[serde(skip)]
    pub extents: Vec<Extent>,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("attributes", &self.attributes.0)
            .field("extents", &self.extents)
            .finish()
    }
}

impl Partition {
    /// Compute the number of sectors covered by the extents.
    pub fn num_sectors(&self) -> Result<u64> {
        self.extents
            .iter()
            .try_fold(0u64, |total, e| total.checked_add(e.num_sectors))
            .ok_or_else(|| Error::PartitionSectorCountTooLarge {
                name: DebugString::new(&self.name),
            })
    }

    /// Compute the number of bytes covered by the extents. This is the size of
    /// the extracted image.
    pub fn size(&self) -> Result<u64> {
        self.num_sectors()
            .ok()
            .and_then(|n| n.checked_mul(SECTOR_SIZE.into()))
            .ok_or_else(|| Error::PartitionByteCountTooLarge {
                name: DebugString::new(&self.name),
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtentType {
    Linear {
        /// The physical sector that this extent starts at on the block device.
        start_sector: u64,
        /// The index of the block device that backs this extent.
        block_device_index: usize,
    },
    Zero,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Number of [`SECTOR_SIZE`]-byte sectors in this extent.
    pub num_sectors: u64,
    /// device-mapper target type.
    pub extent_type: ExtentType,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PartitionGroup {
    /// Partition group name in ASCII.
    pub name: String,
    /// Partition group flags.
    pub flags: PartitionGroupFlags,
    /// Maximum size of all partitions in this group.
    pub maximum_size: Option<NonZeroU64>,
    /// The partitions in this group.
    pub partitions: Vec<Partition>,
}

impl fmt::Debug for PartitionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionGroup")
            .field("name", &self.name)
            .field("flags", &self.flags.0)
            .field("maximum_size", &format_args!("{:?}", self.maximum_size))
            .field("partitions", &self.partitions)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// The first [`SECTOR_SIZE`]-byte sector usable by logical partitions.
    pub first_logical_sector: u64,
    /// Alignment for both partition and extent sizes.
    pub alignment: u32,
    /// Alignment offset for when the super partition itself is not aligned.
    pub alignment_offset: u32,
    /// Block device size.
    pub size: u64,
    /// Partition name in ASCII.
    pub partition_name: String,
    /// Block device flags.
    pub flags: BlockDeviceFlags,
}

impl fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDevice")
            .field("first_logical_sector", &self.first_logical_sector)
            .field("alignment", &self.alignment)
            .field("alignment_offset", &self.alignment_offset)
            .field("size", &self.size)
            .field("partition_name", &self.partition_name)
            .field("flags", &self.flags.0)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct MetadataSlot {
    /// Major version. Only [`MAJOR_VERSION`] is supported.
    pub major_version: u16,
    /// Minor version. Versions between [`MINOR_VERSION_MIN`] and
    /// [`MINOR_VERSION_MAX`] are supported.
    pub minor_version: u16,
    /// List of partition groups.
    pub groups: Vec<PartitionGroup>,
    /// List of block devices containing data extents.
    pub block_devices: Vec<BlockDevice>,
    /// Header flags. These are informational and do not affect parsing.
    pub flags: HeaderFlags,
}

impl fmt::Debug for MetadataSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataSlot")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("groups", &self.groups)
            .field("block_devices", &self.block_devices)
            .field("flags", &self.flags.0)
            .finish()
    }
}

impl MetadataSlot {
    /// Iterate over all partitions along with the group they belong to.
    pub fn partitions(&self) -> impl Iterator<Item = (&PartitionGroup, &Partition)> {
        self.groups
            .iter()
            .flat_map(|g| g.partitions.iter().map(move |p| (g, p)))
    }

    /// Find a partition by its exact, case-sensitive name.
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions()
            .map(|(_, p)| p)
            .find(|p| p.name == name)
    }
}

impl TryFrom<&RawMetadataSlot> for MetadataSlot {
    type Error = Error;

    fn try_from(raw_slot: &RawMetadataSlot) -> Result<Self> {
        let mut slot = MetadataSlot {
            major_version: raw_slot.header.major_version.get(),
            minor_version: raw_slot.header.minor_version.get(),
            groups: Vec::with_capacity(raw_slot.groups.len()),
            block_devices: Vec::with_capacity(raw_slot.block_devices.len()),
            flags: HeaderFlags::from_bits_retain(raw_slot.header.flags.get()),
        };

        for raw_group in &raw_slot.groups {
            slot.groups.push(PartitionGroup {
                name: raw_group.name.as_str()?.to_owned(),
                flags: PartitionGroupFlags::from_bits_retain(raw_group.flags.get()),
                maximum_size: NonZeroU64::new(raw_group.maximum_size.get()),
                partitions: Vec::new(),
            });
        }

        for raw_partition in &raw_slot.partitions {
            let group_index = raw_partition.group_index.get() as usize;
            let first_extent = raw_partition.first_extent_index.get() as usize;
            let num_extents = raw_partition.num_extents.get() as usize;

            let mut partition = Partition {
                name: raw_partition.name.as_str()?.to_owned(),
                attributes: PartitionAttributes::from_bits_retain(raw_partition.attributes.get()),
                extents: Vec::with_capacity(num_extents),
            };

            for (i, raw_extent) in raw_slot.extents[first_extent..][..num_extents]
                .iter()
                .enumerate()
            {
                let extent_type = match raw_extent.target_type.get() {
                    RawExtent::TARGET_TYPE_LINEAR => ExtentType::Linear {
                        start_sector: raw_extent.target_data.get(),
                        block_device_index: raw_extent.target_source.get() as usize,
                    },
                    RawExtent::TARGET_TYPE_ZERO => ExtentType::Zero,
                    n => {
                        return Err(Error::ExtentInvalidType {
                            index: first_extent + i,
                            extent_type: n,
                        });
                    }
                };

                partition.extents.push(Extent {
                    num_sectors: raw_extent.num_sectors.get(),
                    extent_type,
                });
            }

            slot.groups[group_index].partitions.push(partition);
        }

        for raw_block_device in &raw_slot.block_devices {
            slot.block_devices.push(BlockDevice {
                first_logical_sector: raw_block_device.first_logical_sector.get(),
                alignment: raw_block_device.alignment.get(),
                alignment_offset: raw_block_device.alignment_offset.get(),
                size: raw_block_device.size.get(),
                partition_name: raw_block_device.partition_name.as_str()?.to_owned(),
                flags: BlockDeviceFlags::from_bits_retain(raw_block_device.flags.get()),
            });
        }

        Ok(slot)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// Image type.
    pub image_type: ImageType,
    /// Maximum size of a single copy of the metadata (header + tables). This
    /// must be a multiple of [`SECTOR_SIZE`].
    pub metadata_max_size: u32,
    /// Number of metadata slots.
    pub metadata_slot_count: u32,
    /// Block size of the logical partitions. Every partition's size must be a
    /// multiple of this value.
    pub logical_block_size: u32,
    /// List of metadata slots. There is only 1 slot when [`Self::image_type`]
    /// is [`ImageType::Empty`], regardless of [`Self::metadata_slot_count`].
    pub slots: Vec<MetadataSlot>,
}

impl TryFrom<&RawMetadata> for Metadata {
    type Error = Error;

    fn try_from(raw_metadata: &RawMetadata) -> Result<Self> {
        Ok(Self {
            image_type: raw_metadata.image_type,
            metadata_max_size: raw_metadata.geometry.metadata_max_size.get(),
            metadata_slot_count: raw_metadata.geometry.metadata_slot_count.get(),
            logical_block_size: raw_metadata.geometry.logical_block_size.get(),
            slots: raw_metadata
                .slots
                .iter()
                .map(MetadataSlot::try_from)
                .collect::<Result<_>>()?,
        })
    }
}

impl<R: Read> FromReader<R> for Metadata {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        (&RawMetadata::from_reader(reader)?).try_into()
    }
}

/// Check whether the reader contains LP metadata. Returns [`None`] if the
/// geometry is absent, including when the input is a sparse image.
pub fn probe(reader: impl Read) -> Result<Option<ImageType>> {
    match RawMetadata::read_geometry(reader) {
        Ok((image_type, _)) => Ok(Some(image_type)),
        Err(e) if matches!(e.category(), Category::NotThisFormat | Category::Truncated) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Pick the metadata slot to operate on. If no slot is requested, all slots
/// must be identical.
pub fn select_slot(metadata: &Metadata, requested: Option<u32>) -> Result<&MetadataSlot> {
    match requested {
        Some(n) => metadata.slots.get(n as usize).ok_or(Error::SlotOutOfRange {
            slot: n,
            count: metadata.slots.len(),
        }),
        None => {
            if metadata.slots.windows(2).any(|w| w[0] != w[1]) {
                return Err(Error::SlotsDiffer);
            }

            metadata.slots.first().ok_or(Error::NoMetadataSlots)
        }
    }
}

/// Summary of a logical partition for listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub name: String,
    pub group: String,
    pub attributes: PartitionAttributes,
    pub size: u64,
    pub num_extents: usize,
}

/// List the partitions in the selected slot without touching partition data.
pub fn list(metadata: &Metadata, slot: Option<u32>) -> Result<Vec<PartitionInfo>> {
    select_slot(metadata, slot)?
        .partitions()
        .map(|(group, partition)| {
            Ok(PartitionInfo {
                name: partition.name.clone(),
                group: group.name.clone(),
                attributes: partition.attributes,
                size: partition.size()?,
                num_extents: partition.extents.len(),
            })
        })
        .collect()
}

/// A slice of a linear extent to copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CopyExtent {
    device_index: usize,
    device_offset: u64,
    out_offset: u64,
    size: u64,
}

/// Split the linear extents of a partition into [`COPY_CHUNK_SIZE`] pieces for
/// parallelization. Zero extents produce nothing since the output file is
/// preallocated as a hole.
fn split_extents(extents: &[Extent]) -> Vec<CopyExtent> {
    let mut result = vec![];
    let mut out_offset = 0;

    for extent in extents {
        let mut remain = extent.num_sectors * u64::from(SECTOR_SIZE);

        match extent.extent_type {
            ExtentType::Linear {
                start_sector,
                block_device_index,
            } => {
                let mut device_offset = start_sector * u64::from(SECTOR_SIZE);

                while remain > 0 {
                    let size = COPY_CHUNK_SIZE.min(remain);

                    result.push(CopyExtent {
                        device_index: block_device_index,
                        device_offset,
                        out_offset,
                        size,
                    });

                    out_offset += size;
                    device_offset += size;
                    remain -= size;
                }
            }
            ExtentType::Zero => out_offset += remain,
        }
    }

    result
}

/// Ensure that every block device referenced by `partitions` was provided and
/// is large enough to contain the referenced extents.
fn check_devices(partitions: &[&Partition], devices: &[impl ReadAt]) -> Result<()> {
    let mut required = vec![0u64; devices.len()];

    for partition in partitions {
        for extent in split_extents(&partition.extents) {
            let end = extent.device_offset + extent.size;
            let slot = required
                .get_mut(extent.device_index)
                .ok_or(Error::MissingBlockDevice(extent.device_index))?;

            *slot = (*slot).max(end);
        }
    }

    for (index, (device, required)) in devices.iter().zip(required).enumerate() {
        let size = device
            .file_len()
            .map_err(|e| Error::DataRead("device_size", e))?;

        if size < required {
            return Err(Error::DeviceTooShort {
                index,
                size,
                required,
            });
        }
    }

    Ok(())
}

fn copy_extent(
    device: impl ReadAt,
    output: &File,
    extent: &CopyExtent,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut reader = UserPosFile::new(device);
    let mut writer = UserPosFile::new(output);

    reader.seek(SeekFrom::Start(extent.device_offset))?;
    writer.seek(SeekFrom::Start(extent.out_offset))?;

    stream::copy_n(&mut reader, &mut writer, extent.size, cancel_signal)
}

/// Outcome of extracting one logical partition.
#[derive(Debug)]
pub struct PartitionResult {
    pub name: String,
    pub path: PathBuf,
    /// Size of the extracted image.
    pub result: Result<u64>,
}

/// Create the output file for `partition` and allocate it to the partition's
/// full size.
fn create_output(
    partition: &Partition,
    path: &Path,
    options: &DecodeOptions,
) -> Result<(File, u64)> {
    let size = partition.size()?;

    let file = options
        .output_exists
        .create(path)
        .map_err(|e| Error::OutputFile(path.to_owned(), e))?;
    file.set_len(size)
        .map_err(|e| Error::OutputFile(path.to_owned(), e))?;

    debug!("Allocated {path:?} for {:?}: {size} bytes", partition.name);

    Ok((file, size))
}

/// Extract logical partitions from the selected slot into `<name>.img` files
/// in `output_dir`. `devices` are the raw block devices in the order listed in
/// the metadata. The first device is the `super` image itself. If `names` is
/// empty, every partition is extracted. A name that is listed more than once
/// is only extracted once.
///
/// Each output is allocated to the partition's full size first, so zero
/// extents remain holes that read back as zeros. Linear extents are copied in
/// parallel on a pool of [`DecodeOptions::workers`] threads. A partition that
/// fails does not stop the others. The results are returned in the order of
/// the selected partitions.
pub fn extract<D: ReadAt + Sync>(
    metadata: &Metadata,
    slot: Option<u32>,
    devices: &[D],
    output_dir: &Path,
    names: &[String],
    options: &DecodeOptions,
    cancel_signal: &AtomicBool,
) -> Result<Vec<PartitionResult>> {
    let slot = select_slot(metadata, slot)?;

    let partitions = if names.is_empty() {
        slot.partitions().map(|(_, p)| p).collect::<Vec<_>>()
    } else {
        let mut seen = HashSet::new();

        names
            .iter()
            .filter(|n| seen.insert(n.as_str()))
            .map(|n| {
                slot.partition(n)
                    .ok_or_else(|| Error::PartitionNotFound(n.clone()))
            })
            .collect::<Result<Vec<_>>>()?
    };

    check_devices(&partitions, devices)?;

    let paths = partitions
        .iter()
        .map(|p| {
            util::path_join_single(output_dir, format!("{}.img", p.name))
                .map_err(|e| Error::OutputFile(output_dir.to_owned(), e))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut results = Vec::with_capacity(partitions.len());
    let mut files = Vec::with_capacity(partitions.len());

    for (partition, path) in partitions.iter().zip(paths) {
        let result = match create_output(partition, &path, options) {
            Ok((file, size)) => {
                files.push(Some(file));
                Ok(size)
            }
            Err(e) => {
                files.push(None);
                Err(e)
            }
        };

        results.push(PartitionResult {
            name: partition.name.clone(),
            path,
            result,
        });
    }

    // Flatten the extents of all partitions so that a single large partition
    // can still be copied in parallel.
    let jobs = partitions
        .iter()
        .enumerate()
        .filter(|(i, _)| files[*i].is_some())
        .flat_map(|(i, p)| split_extents(&p.extents).into_iter().map(move |e| (i, e)))
        .collect::<Vec<_>>();

    let pool = options.thread_pool()?;

    let failures = pool.install(|| {
        jobs.into_par_iter()
            .filter_map(|(i, extent)| {
                let file = files[i].as_ref()?;

                copy_extent(&devices[extent.device_index], file, &extent, cancel_signal)
                    .err()
                    .map(|e| (i, e))
            })
            .collect::<Vec<_>>()
    });

    // Only the first failure of each partition is reported.
    for (i, e) in failures {
        if results[i].result.is_ok() {
            results[i].result = Err(Error::ExtentCopy {
                name: partitions[i].name.clone(),
                source: e,
            });
        }
    }

    for (result, file) in results.iter_mut().zip(&files) {
        let (Ok(size), Some(file)) = (&result.result, file) else {
            continue;
        };
        let size = *size;

        match file.sync_all() {
            Ok(()) => info!("Extracted {:?}: {size} bytes", result.name),
            Err(e) => result.result = Err(Error::OutputFile(result.path.clone(), e)),
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn test_metadata() -> Metadata {
        Metadata {
            image_type: ImageType::Normal,
            metadata_max_size: 4096,
            metadata_slot_count: 2,
            logical_block_size: 4096,
            slots: vec![
                MetadataSlot {
                    major_version: MAJOR_VERSION,
                    minor_version: MINOR_VERSION_MAX,
                    groups: vec![PartitionGroup {
                        name: "default".into(),
                        flags: PartitionGroupFlags::empty(),
                        maximum_size: None,
                        partitions: vec![Partition {
                            name: "system".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![Extent {
                                num_sectors: 16,
                                extent_type: ExtentType::Linear {
                                    start_sector: 2048,
                                    block_device_index: 0,
                                },
                            }],
                        }],
                    }],
                    block_devices: vec![BlockDevice {
                        first_logical_sector: 2048,
                        alignment: 1024 * 1024,
                        alignment_offset: 0,
                        size: 4 * 1024 * 1024,
                        partition_name: "super".into(),
                        flags: BlockDeviceFlags::empty(),
                    }],
                    flags: HeaderFlags::empty(),
                };
                2
            ],
        }
    }

    #[test]
    fn reject_sparse_input() {
        let mut data = vec![0u8; 3 * GEOMETRY_SIZE as usize];
        data[..4].copy_from_slice(&sparse::HEADER_MAGIC.to_le_bytes());

        let err = Metadata::from_reader(Cursor::new(&data)).unwrap_err();
        assert_matches!(err, Error::SparseImage);
        assert_matches!(probe(Cursor::new(&data)), Ok(None));
    }

    #[test]
    fn split_large_extents() {
        let extents = [
            Extent {
                num_sectors: 8,
                extent_type: ExtentType::Zero,
            },
            Extent {
                num_sectors: (COPY_CHUNK_SIZE + 4096) / u64::from(SECTOR_SIZE),
                extent_type: ExtentType::Linear {
                    start_sector: 2048,
                    block_device_index: 1,
                },
            },
        ];

        assert_eq!(
            split_extents(&extents),
            [
                CopyExtent {
                    device_index: 1,
                    device_offset: 1024 * 1024,
                    out_offset: 4096,
                    size: COPY_CHUNK_SIZE,
                },
                CopyExtent {
                    device_index: 1,
                    device_offset: 1024 * 1024 + COPY_CHUNK_SIZE,
                    out_offset: 4096 + COPY_CHUNK_SIZE,
                    size: 4096,
                },
            ],
        );
    }

    #[test]
    fn select_slots() {
        let mut metadata = test_metadata();

        assert!(select_slot(&metadata, None).is_ok());
        assert_matches!(
            select_slot(&metadata, Some(2)),
            Err(Error::SlotOutOfRange { slot: 2, count: 2 })
        );

        metadata.slots[1].groups[0].partitions.clear();

        assert_matches!(select_slot(&metadata, None), Err(Error::SlotsDiffer));
        assert_eq!(
            select_slot(&metadata, Some(1)).unwrap(),
            &metadata.slots[1]
        );
    }
}
