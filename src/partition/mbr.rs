//! Master Boot Record partition tables.
//!
//! Reads the four primary entries of sector 0 and follows the extended boot
//! record chain of an extended partition to list its logical partitions.
use std::collections::HashSet;
use std::io::Cursor;

use binread::{BinRead, BinReaderExt};
use log::warn;

use super::partition_error::PartitionError;
use super::{PartitionDriver, PartitionEntry, PartitionFlags, PartitionLayout, PartitionScheme, PartitionType};
use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::Probe;
use crate::options::DetectOptions;

/// The number of primary partitions supported by MBR.
pub const PART_CNT: usize = 4;

/// Offset of the partition table in the boot sector.
const TABLE_OFFSET: u64 = 446;

/// The boot signature 0x55AA, as read little-endian.
const BOOT_SIGNATURE: u16 = 0xAA55;

/// Upper bound on the extended boot records followed in one chain.
const MAX_LOGICAL: usize = 128;

/// System id of a GPT protective partition.
const PROTECTIVE_GPT: u8 = 0xEE;

/// A raw 16-byte partition table entry.
#[derive(BinRead, Debug, Default, Clone, Copy)]
#[br(little)]
struct RawEntry {
    /// 0x80 for the active partition, 0x00 otherwise.
    boot_flag: u8,
    chs_start: [u8; 3],
    system_id: u8,
    chs_end: [u8; 3],
    /// Start sector, relative to the table's reference point.
    lba_start: u32,
    sector_cnt: u32,
}

impl RawEntry {
    fn is_empty(&self) -> bool {
        self.system_id == 0 || self.sector_cnt == 0
    }

    fn is_extended(&self) -> bool {
        matches!(self.system_id, 0x05 | 0x0F | 0x85)
    }
}

/// The partition table part of a boot sector (MBR or EBR).
#[derive(BinRead, Debug)]
#[br(little)]
struct RawTable {
    #[br(pad_before = 440)]
    disk_signature: u32,
    _copy_protected: u16,
    entries: [RawEntry; PART_CNT],
    boot_signature: u16,
}

impl RawTable {
    fn read(range: &BlockRange, sector: u64, sector_size: u64) -> Result<RawTable, PartitionError> {
        let buf = range.read_exact(sector * sector_size, (TABLE_OFFSET + 66) as usize)?;
        let mut reader = Cursor::new(buf);
        Ok(reader.read_le()?)
    }

    fn used_entries(&self) -> impl Iterator<Item = (usize, &RawEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.is_empty())
    }
}

/// Returns a human-readable name for an MBR system id.
pub fn type_name(system_id: u8) -> &'static str {
    match system_id {
        0x01 => "FAT12",
        0x04 | 0x06 | 0x0E => "FAT16",
        0x05 | 0x0F | 0x85 => "Extended",
        0x07 => "NTFS/exFAT",
        0x0B | 0x0C => "FAT32",
        0x11 | 0x14 | 0x16 | 0x1B | 0x1C | 0x1E => "Hidden FAT",
        0x27 => "Recovery",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x8E => "Linux LVM",
        0xA5 => "FreeBSD",
        0xA6 => "OpenBSD",
        0xA8 => "Mac OS X",
        0xAF => "HFS+",
        0xEE => "GPT protective",
        0xEF => "EFI System",
        0xFD => "Linux RAID",
        _ => "Unknown",
    }
}

/// Returns true when sector 0 is a filesystem boot sector rather than an MBR.
///
/// Volume boot records also end in 0x55AA, so an unpartitioned FAT or NTFS
/// volume would otherwise be read as a garbage partition table.
fn looks_like_boot_sector(sector: &[u8]) -> bool {
    let jump = matches!(sector.first(), Some(0xEB) | Some(0xE9));
    let tag = |offset: usize, expected: &[u8]| {
        sector.get(offset..offset + expected.len()) == Some(expected)
    };

    jump && (tag(0x36, b"FAT") || tag(0x52, b"FAT") || tag(0x03, b"NTFS") || tag(0x03, b"EXFAT"))
}

/// Driver for the legacy MBR scheme, including extended partitions.
pub struct MbrDriver;

impl MbrDriver {
    /// Collects the logical partitions of the extended partition `extended`.
    ///
    /// A broken link ends the chain; the partitions gathered so far are kept.
    /// Logical partitions reaching outside the extended partition are skipped.
    ///
    /// # Errors
    /// Only an unavailable source or another fatal read failure.
    fn follow_ebr_chain(
        range: &BlockRange,
        sector_size: u64,
        extended: &RawEntry,
        partitions: &mut Vec<PartitionEntry>,
    ) -> Result<(), PartitionError> {
        let base = u64::from(extended.lba_start);
        let limit = (base + u64::from(extended.sector_cnt)).min(range.size() / sector_size);
        let mut visited = HashSet::new();
        let mut current = base;
        let mut index = (PART_CNT + 1) as u32;

        loop {
            if current < base || current >= limit {
                warn!("EBR link to sector {current} leaves the extended partition, chain ends");
                return Ok(());
            }
            if !visited.insert(current) || visited.len() > MAX_LOGICAL {
                warn!("EBR chain loops or is too long at sector {current}");
                return Ok(());
            }

            let table = match RawTable::read(range, current, sector_size) {
                Ok(table) => table,
                Err(PartitionError::Source(err)) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!("EBR at sector {current} is unreadable ({err}), chain ends");
                    return Ok(());
                }
            };
            if table.boot_signature != BOOT_SIGNATURE {
                warn!(
                    "EBR at sector {current} has signature 0x{:04X}, chain ends",
                    table.boot_signature
                );
                return Ok(());
            }

            let logical = table.entries[0];
            if !logical.is_empty() {
                let first = current + u64::from(logical.lba_start);
                let end = first + u64::from(logical.sector_cnt);
                if first > current && end <= limit {
                    partitions.push(
                        PartitionEntry::new(
                            index,
                            first * sector_size,
                            u64::from(logical.sector_cnt) * sector_size,
                            PartitionType::Mbr(logical.system_id),
                        )
                        .with_flags(PartitionFlags {
                            bootable: logical.boot_flag == 0x80,
                            logical: true,
                            ..Default::default()
                        }),
                    );
                } else {
                    warn!("Logical partition #{index} (sectors {first}..{end}) lies outside its extended partition");
                }
                index += 1;
            }

            let next = table.entries[1];
            if next.is_empty() || !next.is_extended() {
                return Ok(());
            }
            current = base + u64::from(next.lba_start);
        }
    }
}

impl PartitionDriver for MbrDriver {
    fn name(&self) -> &'static str {
        "mbr"
    }

    fn probe(
        &self,
        range: &BlockRange,
        options: &DetectOptions,
    ) -> Result<Probe<PartitionLayout>, PartitionError> {
        let sector_size = options.sector_size() as u64;
        if range.size() < sector_size.max(512) * 2 {
            return Ok(Probe::Declined);
        }

        let sector = range.read_exact(0, 512)?;
        let table = RawTable::read(range, 0, sector_size)?;

        if table.boot_signature != BOOT_SIGNATURE || looks_like_boot_sector(&sector) {
            return Ok(Probe::Declined);
        }
        if table.entries.iter().any(|e| e.boot_flag != 0x00 && e.boot_flag != 0x80) {
            return Ok(Probe::Declined);
        }
        if table.used_entries().count() == 0
            || table.used_entries().any(|(_, e)| e.system_id == PROTECTIVE_GPT)
        {
            return Ok(Probe::Declined);
        }

        let mut partitions = vec![];
        let mut extended = 0;
        for (i, entry) in table.used_entries() {
            if entry.is_extended() {
                extended += 1;
                Self::follow_ebr_chain(range, sector_size, entry, &mut partitions)?;
                continue;
            }

            partitions.push(
                PartitionEntry::new(
                    i as u32 + 1,
                    u64::from(entry.lba_start) * sector_size,
                    u64::from(entry.sector_cnt) * sector_size,
                    PartitionType::Mbr(entry.system_id),
                )
                .with_flags(PartitionFlags {
                    bootable: entry.boot_flag == 0x80,
                    ..Default::default()
                }),
            );
        }

        if extended > 1 {
            return Err(PartitionError::InvalidHeader(format!(
                "{extended} extended partitions in the primary table"
            )));
        }

        let mut attributes = Attributes::new();
        attributes.set("disk_signature", format!("{:08X}", table.disk_signature));
        attributes.set("extended", extended == 1);

        PartitionLayout::new(
            PartitionScheme::Mbr,
            sector_size,
            partitions,
            attributes,
            range.size(),
        )
        .map(Probe::Accepted)
    }
}
