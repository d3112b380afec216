//! Partition-system detection.
//!
//! A [`PartitionDriver`] inspects the leading sectors of a block and either
//! declines or returns a validated [`PartitionLayout`]. The
//! [`PartitionRegistry`] tries every driver in a fixed priority order.
pub mod apm;
pub mod gpt;
pub mod mbr;
pub mod partition_error;

use std::fmt;
use std::fmt::Write as FmtWrite;

use getset::{CopyGetters, Getters};
use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::{Probe, Result, VfsError};
use crate::options::DetectOptions;
use crate::traits::LayoutDisplay;
use gpt::Guid;
use partition_error::PartitionError;

/// Upper bound on the partitions a single container may describe.
pub const MAX_PARTITIONS: usize = 256;

/// The scheme a layout was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Master Boot Record, including extended boot records.
    Mbr,
    /// GUID Partition Table.
    Gpt,
    /// Apple Partition Map.
    Apm,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScheme::Mbr => write!(f, "MBR"),
            PartitionScheme::Gpt => write!(f, "GPT"),
            PartitionScheme::Apm => write!(f, "APM"),
        }
    }
}

/// The type tag stored with a partition entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionType {
    /// MBR system id byte.
    Mbr(u8),
    /// GPT partition type GUID.
    Gpt(Guid),
    /// APM partition type string.
    Apm(String),
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Mbr(byte) => write!(f, "{} (0x{:02X})", mbr::type_name(*byte), byte),
            PartitionType::Gpt(guid) => match gpt::type_name(guid) {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "{guid}"),
            },
            PartitionType::Apm(name) => write!(f, "{name}"),
        }
    }
}

/// Flags carried by a partition entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionFlags {
    /// Marked active / legacy-bootable.
    pub bootable: bool,
    /// Lives inside an MBR extended partition.
    pub logical: bool,
    /// GPT "required by the platform" attribute.
    pub required: bool,
}

/// One partition of a layout. Offsets are in bytes, relative to the container.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct PartitionEntry {
    /// Position of the entry in its on-disk table (1-based).
    #[get_copy = "pub"]
    index: u32,
    #[get_copy = "pub"]
    start: u64,
    #[get_copy = "pub"]
    size: u64,
    #[get = "pub"]
    type_tag: PartitionType,
    #[get_copy = "pub"]
    flags: PartitionFlags,
    #[get = "pub"]
    name: Option<String>,
    #[get = "pub"]
    guid: Option<Guid>,
}

impl PartitionEntry {
    pub fn new(index: u32, start: u64, size: u64, type_tag: PartitionType) -> Self {
        Self {
            index,
            start,
            size,
            type_tag,
            flags: PartitionFlags::default(),
            name: None,
            guid: None,
        }
    }

    pub fn with_flags(mut self, flags: PartitionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.is_empty());
        self
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = Some(guid);
        self
    }

    /// Returns the first byte after the partition.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// The ordered, validated result of a partition driver.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct PartitionLayout {
    #[get_copy = "pub"]
    scheme: PartitionScheme,
    /// The sector size the table was interpreted with.
    #[get_copy = "pub"]
    sector_size: u64,
    /// Partitions ordered by start offset.
    #[get = "pub"]
    partitions: Vec<PartitionEntry>,
    /// Scheme-specific details (disk GUID, disk signature, ...).
    #[get = "pub"]
    attributes: Attributes,
    container_size: u64,
}

impl PartitionLayout {
    /// Sorts and validates the partitions found by a driver.
    ///
    /// # Errors
    /// - `PartitionError::ImplausibleCount` above [`MAX_PARTITIONS`]
    /// - `PartitionError::InvalidExtent` for an empty or overflowing partition
    /// - `PartitionError::OutOfBounds` if a partition ends past the container
    /// - `PartitionError::OverlappingPartitions` if two partitions share bytes
    pub fn new(
        scheme: PartitionScheme,
        sector_size: u64,
        mut partitions: Vec<PartitionEntry>,
        attributes: Attributes,
        container_size: u64,
    ) -> std::result::Result<Self, PartitionError> {
        partitions.sort_by_key(|p| (p.start, p.index));

        let layout = PartitionLayout {
            scheme,
            sector_size,
            partitions,
            attributes,
            container_size,
        };

        layout
            .check_partition_count()?
            .check_partitions_in_bounds()?
            .check_partitions_non_overlapping()
    }

    fn check_partition_count(self) -> std::result::Result<Self, PartitionError> {
        match self.partitions.len() {
            0 => Err(PartitionError::ImplausibleCount(0)),
            n if n > MAX_PARTITIONS => Err(PartitionError::ImplausibleCount(n as u64)),
            _ => Ok(self),
        }
    }

    fn check_partitions_in_bounds(self) -> std::result::Result<Self, PartitionError> {
        for part in self.partitions.iter() {
            let end = part
                .start
                .checked_add(part.size)
                .ok_or(PartitionError::InvalidExtent(part.index))?;
            if part.size == 0 {
                return Err(PartitionError::InvalidExtent(part.index));
            }
            if end > self.container_size {
                return Err(PartitionError::OutOfBounds {
                    index: part.index,
                    end,
                    limit: self.container_size,
                });
            }
        }
        Ok(self)
    }

    fn check_partitions_non_overlapping(self) -> std::result::Result<Self, PartitionError> {
        match self
            .partitions
            .windows(2)
            .find(|pair| pair[0].end() > pair[1].start)
        {
            Some(pair) => Err(PartitionError::OverlappingPartitions {
                first: pair[0].index,
                second: pair[1].index,
            }),
            None => Ok(self),
        }
    }

    /// Returns the byte ranges of the container no partition covers, as `(start, size)`.
    pub fn gaps(&self) -> Vec<(u64, u64)> {
        let mut gaps = vec![];
        let mut last_end = 0;

        for part in self.partitions.iter() {
            if part.start > last_end {
                gaps.push((last_end, part.start - last_end));
            }
            last_end = last_end.max(part.end());
        }
        if last_end < self.container_size {
            gaps.push((last_end, self.container_size - last_end));
        }

        gaps
    }
}

/// Implements the LayoutDisplay trait for PartitionLayout
///
/// Lists the partitions and the unallocated gaps in sectors, in disk order.
impl LayoutDisplay for PartitionLayout {
    fn display_layout(&self, indent: u8) -> std::result::Result<String, fmt::Error> {
        let mut out = String::from("");
        let indent = " ".repeat(indent.into());
        let ss = self.sector_size.max(1);

        writeln!(out, "{}┌{:─^55}┐", indent, format!(" {} Layout ", self.scheme))?;
        writeln!(out, "{}├{:<45}{:>10}┤", indent, "Disk Size", self.container_size / ss)?;
        writeln!(out, "{}├{:<45}{:>10}┤", indent, "Sector Size", self.sector_size)?;
        writeln!(out, "{}├{:─^55}┤", indent, "")?;
        writeln!(
            out,
            "{}├{:^12}┬{:^12}┬{:^12}┬{:^16}┤",
            indent, "Region", "Start", "End", "Description"
        )?;
        writeln!(
            out,
            "{}├{:─<12}┼{:─<12}┼{:─<12}┼{:─<16}┤",
            indent, "", "", "", ""
        )?;

        let mut last_end = 0;
        for part in self.partitions.iter() {
            if part.start > last_end {
                writeln!(
                    out,
                    "{}│{:^12}│{:>12}│{:>12}│{:^16}│",
                    indent,
                    "",
                    last_end / ss,
                    part.start / ss,
                    "Unallocated"
                )?;
            }

            let description: String = part.type_tag.to_string().chars().take(16).collect();
            writeln!(
                out,
                "{}│{:^12}│{:>12}│{:>12}│{:^16}│",
                indent,
                format!("Part #{}", part.index),
                part.start / ss,
                part.end() / ss,
                description
            )?;

            last_end = last_end.max(part.end());
        }

        if last_end < self.container_size {
            writeln!(
                out,
                "{}│{:^12}│{:>12}│{:>12}│{:^16}│",
                indent,
                "",
                last_end / ss,
                self.container_size / ss,
                "Unallocated"
            )?;
        }

        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<16}┘",
            indent, "", "", "", ""
        )?;

        Ok(out)
    }
}

/// A partition-system parser.
pub trait PartitionDriver: Send + Sync {
    /// Short name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Inspects `range` and returns its layout, or declines.
    ///
    /// An `Err` means the signature matched but the structure is inconsistent.
    fn probe(
        &self,
        range: &BlockRange,
        options: &DetectOptions,
    ) -> std::result::Result<Probe<PartitionLayout>, PartitionError>;
}

/// Ordered set of partition drivers, tried in priority order.
pub struct PartitionRegistry {
    drivers: Vec<Box<dyn PartitionDriver>>,
}

static DEFAULT_REGISTRY: Lazy<PartitionRegistry> = Lazy::new(|| {
    PartitionRegistry::with_drivers(vec![
        Box::new(gpt::GptDriver),
        Box::new(apm::ApmDriver),
        Box::new(mbr::MbrDriver),
    ])
});

impl PartitionRegistry {
    /// The process-wide registry: GPT, then APM, then MBR.
    pub fn global() -> &'static PartitionRegistry {
        &DEFAULT_REGISTRY
    }

    pub fn with_drivers(drivers: Vec<Box<dyn PartitionDriver>>) -> Self {
        Self { drivers }
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Runs every driver until one accepts `range`.
    ///
    /// Structural inconsistencies are logged, appended to `diagnostics` and
    /// treated as a decline.
    ///
    /// # Errors
    /// Only fatal conditions (unavailable source, cancellation, timeout) are returned.
    pub fn probe(
        &self,
        range: &BlockRange,
        options: &DetectOptions,
        diagnostics: &mut Vec<String>,
    ) -> Result<Option<PartitionLayout>> {
        for driver in self.drivers.iter() {
            options.control().check()?;

            match driver.probe(range, options) {
                Ok(Probe::Accepted(layout)) => {
                    info!(
                        "{} layout with {} partitions at byte {}",
                        layout.scheme(),
                        layout.partitions().len(),
                        range.offset()
                    );
                    return Ok(Some(layout));
                }
                Ok(Probe::Declined) => debug!("{} declined block at {}", driver.name(), range.offset()),
                Err(PartitionError::Source(err)) if err.is_fatal() => return Err(err),
                Err(err) => {
                    let inconsistency = VfsError::StructuralInconsistency {
                        driver: driver.name(),
                        detail: err.to_string(),
                    };
                    warn!("{inconsistency}");
                    diagnostics.push(inconsistency.to_string());
                }
            }
        }

        Ok(None)
    }
}
