// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::Cursor,
    num::NonZeroU64,
    path::Path,
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use fwextract::{
    format::{
        Category, DecodeOptions, OutputPolicy,
        lp::{
            self, BlockDevice, BlockDeviceFlags, Error, Extent, ExtentType, HeaderFlags,
            ImageType, Metadata, MetadataSlot, Partition, PartitionAttributes, PartitionGroup,
            PartitionGroupFlags,
        },
    },
    stream::FromReader,
};
use ring::digest;

const GEOMETRY_SIZE: usize = 4096;

fn name_bytes(name: &str) -> [u8; 36] {
    let mut buf = [0u8; 36];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// On-disk tables of one metadata slot. Partitions are stored group by group
/// and each partition's extents are contiguous.
#[derive(Default)]
struct SlotTables {
    partitions: Vec<u8>,
    extents: Vec<u8>,
    groups: Vec<u8>,
    block_devices: Vec<u8>,
}

impl SlotTables {
    const PARTITION_SIZE: usize = 52;
    const EXTENT_SIZE: usize = 24;
    const GROUP_SIZE: usize = 48;
    const BLOCK_DEVICE_SIZE: usize = 64;

    fn new(slot: &MetadataSlot) -> Self {
        let mut tables = Self::default();
        let mut first_extent = 0u32;

        for (group_index, group) in slot.groups.iter().enumerate() {
            let maximum_size = group.maximum_size.map_or(0, |s| s.get());

            tables.groups.extend_from_slice(&name_bytes(&group.name));
            tables.groups.extend_from_slice(&group.flags.bits().to_le_bytes());
            tables.groups.extend_from_slice(&maximum_size.to_le_bytes());

            for partition in &group.partitions {
                let num_extents = partition.extents.len() as u32;

                let p = &mut tables.partitions;
                p.extend_from_slice(&name_bytes(&partition.name));
                p.extend_from_slice(&partition.attributes.bits().to_le_bytes());
                p.extend_from_slice(&first_extent.to_le_bytes());
                p.extend_from_slice(&num_extents.to_le_bytes());
                p.extend_from_slice(&(group_index as u32).to_le_bytes());

                for extent in &partition.extents {
                    let (target_type, target_data, target_source) = match extent.extent_type {
                        ExtentType::Linear {
                            start_sector,
                            block_device_index,
                        } => (0u32, start_sector, block_device_index as u32),
                        ExtentType::Zero => (1, 0, 0),
                    };

                    let e = &mut tables.extents;
                    e.extend_from_slice(&extent.num_sectors.to_le_bytes());
                    e.extend_from_slice(&target_type.to_le_bytes());
                    e.extend_from_slice(&target_data.to_le_bytes());
                    e.extend_from_slice(&target_source.to_le_bytes());
                }

                first_extent += num_extents;
            }
        }

        for device in &slot.block_devices {
            let d = &mut tables.block_devices;
            d.extend_from_slice(&device.first_logical_sector.to_le_bytes());
            d.extend_from_slice(&device.alignment.to_le_bytes());
            d.extend_from_slice(&device.alignment_offset.to_le_bytes());
            d.extend_from_slice(&device.size.to_le_bytes());
            d.extend_from_slice(&name_bytes(&device.partition_name));
            d.extend_from_slice(&device.flags.bits().to_le_bytes());
        }

        tables
    }

    /// Serialize the slot header, with fresh checksums, followed by the tables.
    fn encode(&self, slot: &MetadataSlot) -> Vec<u8> {
        let header_size: u32 = if slot.minor_version >= 2 { 256 } else { 128 };
        let tables = [
            (&self.partitions, Self::PARTITION_SIZE),
            (&self.extents, Self::EXTENT_SIZE),
            (&self.groups, Self::GROUP_SIZE),
            (&self.block_devices, Self::BLOCK_DEVICE_SIZE),
        ];
        let tables_size: usize = tables.iter().map(|(t, _)| t.len()).sum();

        let mut context = digest::Context::new(&digest::SHA256);
        for (table, _) in tables {
            context.update(table);
        }

        let mut data = Vec::new();
        data.extend_from_slice(&0x414c5030u32.to_le_bytes());
        data.extend_from_slice(&slot.major_version.to_le_bytes());
        data.extend_from_slice(&slot.minor_version.to_le_bytes());
        data.extend_from_slice(&header_size.to_le_bytes());
        data.extend_from_slice(&[0u8; 32]);
        data.extend_from_slice(&(tables_size as u32).to_le_bytes());
        data.extend_from_slice(context.finish().as_ref());

        let mut offset = 0;
        for (table, entry_size) in tables {
            data.extend_from_slice(&(offset as u32).to_le_bytes());
            data.extend_from_slice(&((table.len() / entry_size) as u32).to_le_bytes());
            data.extend_from_slice(&(entry_size as u32).to_le_bytes());
            offset += table.len();
        }

        if header_size == 256 {
            data.extend_from_slice(&slot.flags.bits().to_le_bytes());
            data.extend_from_slice(&[0u8; 124]);
        }

        let header_digest = digest::digest(&digest::SHA256, &data);
        data[12..44].copy_from_slice(header_digest.as_ref());

        for (table, _) in tables {
            data.extend_from_slice(table);
        }

        data
    }
}

/// Lay out the geometry and serialized slots the way a device stores them.
fn encode_image(metadata: &Metadata, slots: &[Vec<u8>]) -> Vec<u8> {
    let mut geometry = Vec::new();
    geometry.extend_from_slice(&0x616c4467u32.to_le_bytes());
    geometry.extend_from_slice(&52u32.to_le_bytes());
    geometry.extend_from_slice(&[0u8; 32]);
    geometry.extend_from_slice(&metadata.metadata_max_size.to_le_bytes());
    geometry.extend_from_slice(&metadata.metadata_slot_count.to_le_bytes());
    geometry.extend_from_slice(&metadata.logical_block_size.to_le_bytes());
    let checksum = digest::digest(&digest::SHA256, &geometry);
    geometry[8..40].copy_from_slice(checksum.as_ref());
    geometry.resize(GEOMETRY_SIZE, 0);

    let mut data = Vec::new();

    match metadata.image_type {
        ImageType::Normal => {
            data.resize(lp::PARTITION_RESERVED_BYTES as usize, 0);
            data.extend_from_slice(&geometry);
            data.extend_from_slice(&geometry);

            // Primary copies, then backup copies.
            for _ in 0..2 {
                for slot in slots {
                    let start = data.len();
                    data.extend_from_slice(slot);
                    data.resize(start + metadata.metadata_max_size as usize, 0);
                }
            }
        }
        ImageType::Empty => {
            data.extend_from_slice(&geometry);
            for slot in slots {
                data.extend_from_slice(slot);
            }
        }
    }

    data
}

fn encode(metadata: &Metadata) -> Vec<u8> {
    let slots = metadata
        .slots
        .iter()
        .map(|slot| SlotTables::new(slot).encode(slot))
        .collect::<Vec<_>>();

    encode_image(metadata, &slots)
}

fn decode_matches(metadata: &Metadata) {
    let data = encode(metadata);
    let new_metadata = Metadata::from_reader(Cursor::new(&data)).unwrap();

    assert_eq!(&new_metadata, metadata);
}

#[test]
fn decode_empty_image() {
    // Layout from Google Pixel 9 Pro XL stock factory image:
    // komodo-ad1a.240530.047-factory-bb04e484.zip -> super_empty.img
    let metadata = Metadata {
        image_type: ImageType::Empty,
        metadata_max_size: 65536,
        metadata_slot_count: 3,
        logical_block_size: 4096,
        slots: vec![MetadataSlot {
            major_version: 10,
            minor_version: 2,
            groups: vec![
                PartitionGroup {
                    name: "default".into(),
                    flags: PartitionGroupFlags::empty(),
                    maximum_size: None,
                    partitions: vec![],
                },
                PartitionGroup {
                    name: "google_dynamic_partitions_a".into(),
                    flags: PartitionGroupFlags::empty(),
                    maximum_size: NonZeroU64::new(8527020032),
                    partitions: vec![
                        Partition {
                            name: "system_a".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "system_dlkm_a".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "system_ext_a".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "product_a".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "vendor_a".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "vendor_dlkm_a".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                    ],
                },
                PartitionGroup {
                    name: "google_dynamic_partitions_b".into(),
                    flags: PartitionGroupFlags::empty(),
                    maximum_size: NonZeroU64::new(8527020032),
                    partitions: vec![
                        Partition {
                            name: "system_b".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "system_dlkm_b".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "system_ext_b".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "product_b".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "vendor_b".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                        Partition {
                            name: "vendor_dlkm_b".into(),
                            attributes: PartitionAttributes::READONLY,
                            extents: vec![],
                        },
                    ],
                },
            ],
            block_devices: vec![BlockDevice {
                first_logical_sector: 2048,
                alignment: 1048576,
                alignment_offset: 0,
                size: 8531214336,
                partition_name: "super".into(),
                flags: BlockDeviceFlags::empty(),
            }],
            flags: HeaderFlags::VIRTUAL_AB_DEVICE,
        }],
    };

    decode_matches(&metadata);
}

#[test]
fn decode_normal_image() {
    // Layout from Google Pixel 9 Pro XL GrapheneOS factory image:
    // komodo-install-2024082500.zip -> super_1.img
    let slot = MetadataSlot {
        major_version: 10,
        minor_version: 2,
        groups: vec![
            PartitionGroup {
                name: "default".into(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: None,
                partitions: vec![],
            },
            PartitionGroup {
                name: "google_dynamic_partitions_a".into(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: NonZeroU64::new(8527020032),
                partitions: vec![
                    Partition {
                        name: "system_a".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![Extent {
                            num_sectors: 2465952,
                            extent_type: ExtentType::Linear {
                                start_sector: 2048,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "system_dlkm_a".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![Extent {
                            num_sectors: 23720,
                            extent_type: ExtentType::Linear {
                                start_sector: 2469888,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "system_ext_a".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![Extent {
                            num_sectors: 786144,
                            extent_type: ExtentType::Linear {
                                start_sector: 2494464,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "product_a".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![Extent {
                            num_sectors: 1396432,
                            extent_type: ExtentType::Linear {
                                start_sector: 3280896,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "vendor_a".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![Extent {
                            num_sectors: 1959024,
                            extent_type: ExtentType::Linear {
                                start_sector: 4677632,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "vendor_dlkm_a".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![Extent {
                            num_sectors: 55008,
                            extent_type: ExtentType::Linear {
                                start_sector: 6637568,
                                block_device_index: 0,
                            },
                        }],
                    },
                ],
            },
            PartitionGroup {
                name: "google_dynamic_partitions_b".into(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: NonZeroU64::new(8527020032),
                partitions: vec![
                    Partition {
                        name: "system_b".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![],
                    },
                    Partition {
                        name: "system_dlkm_b".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![],
                    },
                    Partition {
                        name: "system_ext_b".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![],
                    },
                    Partition {
                        name: "product_b".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![],
                    },
                    Partition {
                        name: "vendor_b".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![],
                    },
                    Partition {
                        name: "vendor_dlkm_b".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![],
                    },
                ],
            },
        ],
        block_devices: vec![BlockDevice {
            first_logical_sector: 2048,
            alignment: 1048576,
            alignment_offset: 0,
            size: 8531214336,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }],
        flags: HeaderFlags::VIRTUAL_AB_DEVICE,
    };
    let metadata = Metadata {
        image_type: ImageType::Normal,
        metadata_max_size: 65536,
        metadata_slot_count: 3,
        logical_block_size: 4096,
        slots: vec![slot; 3],
    };

    decode_matches(&metadata);
}

#[test]
fn decode_retrofit_image() {
    // Layout from Google Pixel 3a XL stock factory image:
    // bonito-ota-sp2a.220505.008-37a410d5.zip -> system.img
    let slot = MetadataSlot {
        major_version: 10,
        minor_version: 0,
        groups: vec![
            PartitionGroup {
                name: "default".into(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: None,
                partitions: vec![],
            },
            PartitionGroup {
                name: "google_dynamic_partitions".into(),
                flags: PartitionGroupFlags::SLOT_SUFFIXED,
                maximum_size: NonZeroU64::new(4068474880),
                partitions: vec![
                    Partition {
                        name: "system".into(),
                        attributes: PartitionAttributes::READONLY
                            | PartitionAttributes::SLOT_SUFFIXED,
                        extents: vec![Extent {
                            num_sectors: 1757416,
                            extent_type: ExtentType::Linear {
                                start_sector: 2048,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "vendor".into(),
                        attributes: PartitionAttributes::READONLY
                            | PartitionAttributes::SLOT_SUFFIXED,
                        extents: vec![Extent {
                            num_sectors: 991848,
                            extent_type: ExtentType::Linear {
                                start_sector: 1761280,
                                block_device_index: 0,
                            },
                        }],
                    },
                    Partition {
                        name: "product".into(),
                        attributes: PartitionAttributes::READONLY
                            | PartitionAttributes::SLOT_SUFFIXED,
                        extents: vec![
                            Extent {
                                num_sectors: 3627008,
                                extent_type: ExtentType::Linear {
                                    start_sector: 2754560,
                                    block_device_index: 0,
                                },
                            },
                            Extent {
                                num_sectors: 538240,
                                extent_type: ExtentType::Linear {
                                    start_sector: 2048,
                                    block_device_index: 1,
                                },
                            },
                        ],
                    },
                    Partition {
                        name: "system_ext".into(),
                        attributes: PartitionAttributes::READONLY
                            | PartitionAttributes::SLOT_SUFFIXED,
                        extents: vec![Extent {
                            num_sectors: 490744,
                            extent_type: ExtentType::Linear {
                                start_sector: 540672,
                                block_device_index: 1,
                            },
                        }],
                    },
                ],
            },
        ],
        block_devices: vec![
            BlockDevice {
                first_logical_sector: 2048,
                alignment: 1048576,
                alignment_offset: 0,
                size: 3267362816,
                partition_name: "system".into(),
                flags: BlockDeviceFlags::SLOT_SUFFIXED,
            },
            BlockDevice {
                first_logical_sector: 2048,
                alignment: 1048576,
                alignment_offset: 0,
                size: 805306368,
                partition_name: "vendor".into(),
                flags: BlockDeviceFlags::SLOT_SUFFIXED,
            },
        ],
        flags: HeaderFlags::empty(),
    };
    let metadata = Metadata {
        image_type: ImageType::Normal,
        metadata_max_size: 65536,
        metadata_slot_count: 2,
        logical_block_size: 4096,
        slots: vec![slot; 2],
    };

    decode_matches(&metadata);
}

fn linear(num_sectors: u64, start_sector: u64) -> Extent {
    Extent {
        num_sectors,
        extent_type: ExtentType::Linear {
            start_sector,
            block_device_index: 0,
        },
    }
}

fn extraction_metadata() -> Metadata {
    let slot = MetadataSlot {
        major_version: 10,
        minor_version: 2,
        groups: vec![
            PartitionGroup {
                name: "default".into(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: None,
                partitions: vec![],
            },
            PartitionGroup {
                name: "main".into(),
                flags: PartitionGroupFlags::empty(),
                maximum_size: NonZeroU64::new(1024 * 1024),
                partitions: vec![
                    Partition {
                        name: "system".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![linear(16, 2048)],
                    },
                    Partition {
                        name: "vendor".into(),
                        attributes: PartitionAttributes::READONLY,
                        extents: vec![
                            linear(8, 2064),
                            Extent {
                                num_sectors: 8,
                                extent_type: ExtentType::Zero,
                            },
                        ],
                    },
                ],
            },
        ],
        block_devices: vec![BlockDevice {
            first_logical_sector: 2048,
            alignment: 1048576,
            alignment_offset: 0,
            size: 4 * 1024 * 1024,
            partition_name: "super".into(),
            flags: BlockDeviceFlags::empty(),
        }],
        flags: HeaderFlags::empty(),
    };

    Metadata {
        image_type: ImageType::Normal,
        metadata_max_size: 65536,
        metadata_slot_count: 2,
        logical_block_size: 4096,
        slots: vec![slot; 2],
    }
}

/// Write a super image with `system` filled with 0x11 and the linear part of
/// `vendor` filled with 0x22.
fn write_super_image(path: &Path, metadata: &Metadata) {
    let mut data = encode(metadata);
    data.resize(4 * 1024 * 1024, 0);
    data[2048 * 512..2064 * 512].fill(0x11);
    data[2064 * 512..2072 * 512].fill(0x22);

    fs::write(path, data).unwrap();
}

#[test]
fn extract_partitions() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let super_path = temp_dir.path().join("super.img");
    let output_dir = temp_dir.path().join("out");
    fs::create_dir(&output_dir).unwrap();

    write_super_image(&super_path, &extraction_metadata());

    let device = File::open(&super_path).unwrap();
    let metadata = Metadata::from_reader(&device).unwrap();
    assert_eq!(metadata, extraction_metadata());

    let listing = lp::list(&metadata, None).unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[1].name, "vendor");
    assert_eq!(listing[1].group, "main");
    assert_eq!(listing[1].size, 8192);
    assert_eq!(listing[1].num_extents, 2);

    let mut options = DecodeOptions {
        workers: 2,
        ..DecodeOptions::default()
    };

    let extracted = lp::extract(
        &metadata,
        None,
        &[&device],
        &output_dir,
        &[],
        &options,
        &cancel_signal,
    )
    .unwrap();
    assert_eq!(extracted.len(), 2);
    assert!(extracted.iter().all(|r| r.result.is_ok()));

    let system = fs::read(output_dir.join("system.img")).unwrap();
    assert_eq!(system, vec![0x11; 8192]);

    let vendor = fs::read(output_dir.join("vendor.img")).unwrap();
    assert_eq!(vendor.len(), 8192);
    assert!(vendor[..4096].iter().all(|b| *b == 0x22));
    assert!(vendor[4096..].iter().all(|b| *b == 0));

    // Existing outputs are not touched by default.
    let results = lp::extract(
        &metadata,
        None,
        &[&device],
        &output_dir,
        &["system".to_owned()],
        &options,
        &cancel_signal,
    )
    .unwrap();
    let err = results[0].result.as_ref().unwrap_err();
    assert_eq!(err.category(), Category::OutputExists);

    // Extracting again produces identical output. Repeated names are only
    // extracted once.
    options.output_exists = OutputPolicy::Overwrite;
    let results = lp::extract(
        &metadata,
        None,
        &[&device],
        &output_dir,
        &["system".to_owned(), "system".to_owned()],
        &options,
        &cancel_signal,
    )
    .unwrap();
    assert_eq!(results.len(), 1);
    assert_matches!(results[0].result, Ok(8192));
    assert_eq!(fs::read(output_dir.join("system.img")).unwrap(), system);
}

#[test]
fn failed_partition_does_not_stop_others() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let super_path = temp_dir.path().join("super.img");
    let output_dir = temp_dir.path().join("out");
    fs::create_dir(&output_dir).unwrap();

    let metadata = extraction_metadata();
    write_super_image(&super_path, &metadata);
    let device = File::open(&super_path).unwrap();

    fs::write(output_dir.join("system.img"), b"existing").unwrap();

    let results = lp::extract(
        &metadata,
        None,
        &[&device],
        &output_dir,
        &[],
        &DecodeOptions::default(),
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(results[0].name, "system");
    let err = results[0].result.as_ref().unwrap_err();
    assert_matches!(err, Error::OutputFile(..));
    assert_eq!(err.category(), Category::OutputExists);
    assert_eq!(fs::read(&results[0].path).unwrap(), b"existing");

    assert_eq!(results[1].name, "vendor");
    assert_matches!(results[1].result, Ok(8192));
    let vendor = fs::read(&results[1].path).unwrap();
    assert!(vendor[..4096].iter().all(|b| *b == 0x22));
    assert!(vendor[4096..].iter().all(|b| *b == 0));
}

#[test]
fn extract_errors() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let super_path = temp_dir.path().join("super.img");
    let metadata = extraction_metadata();

    write_super_image(&super_path, &metadata);
    let device = File::open(&super_path).unwrap();

    // Names are case-sensitive.
    let err = lp::extract(
        &metadata,
        None,
        &[&device],
        temp_dir.path(),
        &["System".to_owned()],
        &DecodeOptions::default(),
        &cancel_signal,
    )
    .unwrap_err();
    assert_matches!(err, Error::PartitionNotFound(ref n) if n == "System");

    // The device must contain every extent.
    let short_path = temp_dir.path().join("short.img");
    let data = fs::read(&super_path).unwrap();
    fs::write(&short_path, &data[..2056 * 512]).unwrap();
    let short_device = File::open(&short_path).unwrap();

    let err = lp::extract(
        &metadata,
        None,
        &[&short_device],
        temp_dir.path(),
        &[],
        &DecodeOptions::default(),
        &cancel_signal,
    )
    .unwrap_err();
    assert_matches!(err, Error::DeviceTooShort { index: 0, .. });
    assert_eq!(err.category(), Category::Truncated);
}

#[test]
fn reject_extents_disagreeing_with_block_size() {
    let mut metadata = extraction_metadata();
    for slot in &mut metadata.slots {
        slot.groups[1].partitions[0].extents = vec![linear(9, 2048)];
    }

    let err = Metadata::from_reader(Cursor::new(encode(&metadata))).unwrap_err();
    assert_matches!(err, Error::PartitionSizeUnaligned { size: 4608, .. });
    assert_eq!(err.category(), Category::Corrupt);
}

#[test]
fn reject_shared_extent() {
    let metadata = extraction_metadata();

    // Point vendor's extent range at the extent owned by system.
    let slots = metadata
        .slots
        .iter()
        .map(|slot| {
            let mut tables = SlotTables::new(slot);
            let field = SlotTables::PARTITION_SIZE + 40;
            tables.partitions[field..field + 4].copy_from_slice(&0u32.to_le_bytes());
            tables.encode(slot)
        })
        .collect::<Vec<_>>();

    let err = Metadata::from_reader(Cursor::new(encode_image(&metadata, &slots))).unwrap_err();
    assert_matches!(err, Error::PartitionSharesExtent { index: 0, .. });
    assert_eq!(err.category(), Category::Corrupt);
}

#[test]
fn fall_back_to_backup_slot() {
    let metadata = extraction_metadata();
    let max_size = metadata.metadata_max_size as usize;
    let mut data = encode(&metadata);

    // Corrupt the primary copy of slot 0 and the primary geometry.
    let reserved = lp::PARTITION_RESERVED_BYTES as usize;
    let slot_offset = reserved + 2 * GEOMETRY_SIZE;
    data[slot_offset] ^= 0xff;
    data[reserved + 8] ^= 0xff;

    let new_metadata = Metadata::from_reader(Cursor::new(&data)).unwrap();
    assert_eq!(new_metadata, metadata);

    // Corrupting the backup copy too is fatal.
    data[slot_offset + 2 * max_size] ^= 0xff;
    assert_matches!(
        Metadata::from_reader(Cursor::new(&data)),
        Err(Error::HeaderInvalidMagic(_))
    );
}

#[test]
fn detect_tables_corruption() {
    let metadata = extraction_metadata();
    let max_size = metadata.metadata_max_size as usize;
    let mut data = encode(&metadata);

    // Corrupt the first byte of the partition table in all slot copies. The
    // version 10.2 header is 256 bytes.
    let slot_offset = lp::PARTITION_RESERVED_BYTES as usize + 2 * GEOMETRY_SIZE;
    for copy in 0..4 {
        data[slot_offset + copy * max_size + 256] ^= 0xff;
    }

    let err = Metadata::from_reader(Cursor::new(&data)).unwrap_err();
    assert_matches!(err, Error::HeaderInvalidTablesDigest { .. });
    assert_eq!(err.category(), Category::ChecksumMismatch);
}
