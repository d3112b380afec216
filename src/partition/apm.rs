//! Apple Partition Map.
//!
//! Block 0 holds the driver descriptor ("ER") with the device block size; the
//! map entries ("PM") follow from block 1, one per block. All fields are
//! big-endian.
use std::io::Cursor;

use binread::{BinRead, BinReaderExt};

use super::partition_error::PartitionError;
use super::{PartitionDriver, PartitionEntry, PartitionLayout, PartitionScheme, PartitionType};
use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::Probe;
use crate::options::DetectOptions;
use crate::utils;

const DDM_SIGNATURE: u16 = 0x4552;
const MAP_SIGNATURE: u16 = 0x504D;
const FREE_TYPES: [&str; 2] = ["Apple_Free", "Apple_Void"];

#[derive(BinRead, Debug)]
#[br(big)]
struct DriverDescriptor {
    signature: u16,
    block_size: u16,
    block_count: u32,
}

#[derive(BinRead, Debug)]
#[br(big)]
struct MapEntry {
    signature: u16,
    _reserved: u16,
    map_entries: u32,
    start_block: u32,
    block_count: u32,
    name: [u8; 32],
    part_type: [u8; 32],
    data_start: u32,
    data_count: u32,
    status: u32,
}

/// Driver for Apple partition maps.
pub struct ApmDriver;

impl ApmDriver {
    fn read_entry(range: &BlockRange, block: u64, block_size: u64) -> Result<MapEntry, PartitionError> {
        let buf = range.read_exact(block * block_size, 92)?;
        Ok(Cursor::new(buf).read_be()?)
    }
}

impl PartitionDriver for ApmDriver {
    fn name(&self) -> &'static str {
        "apm"
    }

    fn probe(
        &self,
        range: &BlockRange,
        _options: &DetectOptions,
    ) -> Result<Probe<PartitionLayout>, PartitionError> {
        if range.size() < 2048 {
            return Ok(Probe::Declined);
        }

        let ddm: DriverDescriptor = Cursor::new(range.read_exact(0, 8)?).read_be()?;
        let block_size = match ddm.signature {
            DDM_SIGNATURE if (512..=4096).contains(&ddm.block_size) && ddm.block_size.is_power_of_two() => {
                u64::from(ddm.block_size)
            }
            _ => 512,
        };

        if range.size() < block_size * 2 {
            return Ok(Probe::Declined);
        }
        let first = Self::read_entry(range, 1, block_size)?;
        if first.signature != MAP_SIGNATURE {
            return Ok(Probe::Declined);
        }

        let count = first.map_entries;
        if count == 0 || count as usize > super::MAX_PARTITIONS {
            return Err(PartitionError::ImplausibleCount(count.into()));
        }
        if (u64::from(count) + 1) * block_size > range.size() {
            return Err(PartitionError::InvalidHeader(format!(
                "{count} map entries do not fit the disk"
            )));
        }

        let mut partitions = vec![];
        for i in 1..=u64::from(count) {
            let entry = Self::read_entry(range, i, block_size)?;
            if entry.signature != MAP_SIGNATURE {
                return Err(PartitionError::InvalidSignature(entry.signature));
            }

            let part_type = utils::padded_str(&entry.part_type);
            if FREE_TYPES.contains(&part_type.as_str()) {
                continue;
            }

            partitions.push(
                PartitionEntry::new(
                    i as u32,
                    u64::from(entry.start_block) * block_size,
                    u64::from(entry.block_count) * block_size,
                    PartitionType::Apm(part_type),
                )
                .with_name(Some(utils::padded_str(&entry.name))),
            );
        }

        let mut attributes = Attributes::new();
        attributes.set("block_size", block_size);
        if ddm.signature == DDM_SIGNATURE {
            attributes.set("device_blocks", ddm.block_count);
        }

        PartitionLayout::new(
            PartitionScheme::Apm,
            block_size,
            partitions,
            attributes,
            range.size(),
        )
        .map(Probe::Accepted)
    }
}
