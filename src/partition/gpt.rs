//! GUID Partition Table.
//!
//! The primary header lives in LBA 1 and the backup header in the last LBA of
//! the disk. Both carry a CRC32 of themselves and of the partition entry array.
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use binread::{BinRead, BinReaderExt};
use log::warn;

use super::partition_error::PartitionError;
use super::{PartitionDriver, PartitionEntry, PartitionFlags, PartitionLayout, PartitionScheme, PartitionType};
use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::Probe;
use crate::options::DetectOptions;
use crate::utils;

const SIGNATURE: &[u8; 8] = b"EFI PART";
const MIN_HEADER_SIZE: u32 = 92;
const MIN_ENTRY_SIZE: u32 = 128;
const MAX_ENTRIES: u32 = 4096;

/// A GUID as stored on disk (first three fields little-endian).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

impl FromStr for Guid {
    type Err = PartitionError;

    /// Parses the canonical `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PartitionError::InvalidHeader(format!("invalid GUID `{s}`"));

        let groups: Vec<&str> = s.split('-').collect();
        if groups.iter().map(|g| g.len()).collect::<Vec<_>>() != [8, 4, 4, 4, 12] {
            return Err(invalid());
        }
        let hex: String = groups.concat();
        let raw = hex::decode(hex).map_err(|_| invalid())?;

        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&[raw[3], raw[2], raw[1], raw[0]]);
        bytes[4..6].copy_from_slice(&[raw[5], raw[4]]);
        bytes[6..8].copy_from_slice(&[raw[7], raw[6]]);
        bytes[8..16].copy_from_slice(&raw[8..16]);
        Ok(Guid(bytes))
    }
}

const KNOWN_TYPES: &[(&str, &str)] = &[
    ("C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "EFI System"),
    ("21686148-6449-6E6F-744E-656564454649", "BIOS boot"),
    ("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7", "Microsoft basic data"),
    ("E3C9E316-0B5C-4DB8-817D-F92DF00215AE", "Microsoft reserved"),
    ("DE94BBA4-06D1-4D40-A16A-BFD50179D6AC", "Windows recovery"),
    ("0FC63DAF-8483-4772-8E79-3D69D8477DE4", "Linux filesystem"),
    ("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F", "Linux swap"),
    ("E6D6D379-F507-44C2-A23C-238F2A3DF928", "Linux LVM"),
    ("48465300-0000-11AA-AA11-00306543ECAC", "Apple HFS+"),
    ("7C3457EF-0000-11AA-AA11-00306543ECAC", "Apple APFS"),
];

/// Returns the name of a well-known partition type GUID.
pub fn type_name(guid: &Guid) -> Option<&'static str> {
    let text = guid.to_string();
    KNOWN_TYPES
        .iter()
        .find(|(g, _)| *g == text)
        .map(|(_, name)| *name)
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RawHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    _reserved: u32,
    my_lba: u64,
    alternate_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    entries_lba: u64,
    num_entries: u32,
    entry_size: u32,
    entries_crc32: u32,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RawEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: u64,
    /// Inclusive.
    last_lba: u64,
    attributes: u64,
    #[br(count = 36)]
    name: Vec<u16>,
}

/// Driver for GUID partition tables.
pub struct GptDriver;

impl GptDriver {
    /// Reads and validates the header at `lba` and its entry array.
    fn read_table(
        range: &BlockRange,
        sector_size: u64,
        lba: u64,
    ) -> Result<PartitionLayout, PartitionError> {
        let buf = range.read_exact(lba * sector_size, sector_size as usize)?;
        let header: RawHeader = Cursor::new(&buf).read_le()?;

        if &header.signature != SIGNATURE {
            return Err(PartitionError::InvalidHeader(format!(
                "no GPT signature at LBA {lba}"
            )));
        }
        if header.header_size < MIN_HEADER_SIZE || u64::from(header.header_size) > sector_size {
            return Err(PartitionError::InvalidHeader(format!(
                "header size {}",
                header.header_size
            )));
        }

        let mut covered = buf[..header.header_size as usize].to_vec();
        covered[16..20].fill(0);
        let computed = crc32fast::hash(&covered);
        if computed != header.header_crc32 {
            return Err(PartitionError::ChecksumMismatch {
                what: "GPT header",
                stored: header.header_crc32,
                computed,
            });
        }

        if header.my_lba != lba {
            return Err(PartitionError::InvalidHeader(format!(
                "header at LBA {lba} claims LBA {}",
                header.my_lba
            )));
        }
        if header.entry_size < MIN_ENTRY_SIZE || !header.entry_size.is_power_of_two() {
            return Err(PartitionError::InvalidHeader(format!(
                "entry size {}",
                header.entry_size
            )));
        }
        if header.num_entries > MAX_ENTRIES {
            return Err(PartitionError::ImplausibleCount(header.num_entries.into()));
        }

        let sector_cnt = range.size() / sector_size;
        if header.first_usable_lba > header.last_usable_lba || header.last_usable_lba >= sector_cnt {
            return Err(PartitionError::InvalidHeader(format!(
                "usable LBAs {}..={} on a {sector_cnt}-sector disk",
                header.first_usable_lba, header.last_usable_lba
            )));
        }

        let array_len = u64::from(header.num_entries) * u64::from(header.entry_size);
        let array_start = header.entries_lba.saturating_mul(sector_size);
        if array_start.saturating_add(array_len) > range.size() {
            return Err(PartitionError::OutOfBounds {
                index: 0,
                end: array_start.saturating_add(array_len),
                limit: range.size(),
            });
        }

        let array = range.read_exact(array_start, array_len as usize)?;
        let computed = crc32fast::hash(&array);
        if computed != header.entries_crc32 {
            return Err(PartitionError::ChecksumMismatch {
                what: "GPT partition entries",
                stored: header.entries_crc32,
                computed,
            });
        }

        let mut partitions = vec![];
        for (i, raw) in array.chunks_exact(header.entry_size as usize).enumerate() {
            let index = i as u32 + 1;
            let entry: RawEntry = Cursor::new(raw).read_le()?;
            let type_guid = Guid(entry.type_guid);
            if type_guid.is_nil() {
                continue;
            }
            if entry.last_lba < entry.first_lba
                || entry.first_lba < header.first_usable_lba
                || entry.last_lba > header.last_usable_lba
            {
                return Err(PartitionError::InvalidExtent(index));
            }

            partitions.push(
                PartitionEntry::new(
                    index,
                    entry.first_lba * sector_size,
                    (entry.last_lba - entry.first_lba + 1) * sector_size,
                    PartitionType::Gpt(type_guid),
                )
                .with_name(Some(utils::utf16_str(&entry.name)))
                .with_guid(Guid(entry.unique_guid))
                .with_flags(PartitionFlags {
                    required: entry.attributes & 0x1 != 0,
                    bootable: entry.attributes & 0x4 != 0,
                    ..Default::default()
                }),
            );
        }

        let mut attributes = Attributes::new();
        attributes.set("disk_guid", Guid(header.disk_guid).to_string());
        attributes.set(
            "revision",
            format!("{}.{}", header.revision >> 16, header.revision & 0xFFFF),
        );
        attributes.set("alternate_lba", header.alternate_lba);

        PartitionLayout::new(
            PartitionScheme::Gpt,
            sector_size,
            partitions,
            attributes,
            range.size(),
        )
    }
}

impl PartitionDriver for GptDriver {
    fn name(&self) -> &'static str {
        "gpt"
    }

    fn probe(
        &self,
        range: &BlockRange,
        options: &DetectOptions,
    ) -> Result<Probe<PartitionLayout>, PartitionError> {
        let mut sector_sizes = vec![options.sector_size() as u64];
        if !sector_sizes.contains(&4096) {
            sector_sizes.push(4096);
        }

        for sector_size in sector_sizes {
            if range.size() < sector_size * 3 {
                continue;
            }
            if range.read_exact(sector_size, SIGNATURE.len())? != SIGNATURE {
                continue;
            }

            let primary_err = match Self::read_table(range, sector_size, 1) {
                Ok(mut layout) => {
                    layout.attributes.set("header", "primary");
                    return Ok(Probe::Accepted(layout));
                }
                Err(err @ PartitionError::Source(_)) => return Err(err),
                Err(err) => err,
            };

            warn!("GPT primary header rejected ({primary_err}), trying the backup header");
            let backup_lba = range.size() / sector_size - 1;
            return match Self::read_table(range, sector_size, backup_lba) {
                Ok(mut layout) => {
                    layout.attributes.set("header", "backup");
                    layout
                        .attributes
                        .set("primary_header_error", primary_err.to_string());
                    Ok(Probe::Accepted(layout))
                }
                Err(_) => Err(primary_err),
            };
        }

        Ok(Probe::Declined)
    }
}
