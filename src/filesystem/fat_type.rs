//! Enum for the different FAT types (FAT12, FAT16, FAT32).
//!
//! The type is never read from the label in the boot sector; it follows from
//! the number of data clusters, as Microsoft's specification mandates.

use std::fmt;

use super::FsType;

/// Represents the different types of FAT filesystems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FATType {
    FAT12,
    FAT16,
    FAT32,
}

impl FATType {
    /// Derives the type from the count of data clusters.
    pub fn from_cluster_count(cluster_cnt: u32) -> Self {
        if cluster_cnt < 4085 {
            FATType::FAT12
        } else if cluster_cnt < 65525 {
            FATType::FAT16
        } else {
            FATType::FAT32
        }
    }

    /// Width of one FAT entry, in bits.
    pub fn entry_bits(&self) -> u32 {
        match self {
            FATType::FAT12 => 12,
            FATType::FAT16 => 16,
            FATType::FAT32 => 32,
        }
    }

    /// Smallest entry value that terminates a cluster chain.
    pub fn eoc_min(&self) -> u32 {
        match self {
            FATType::FAT12 => 0x0FF8,
            FATType::FAT16 => 0xFFF8,
            FATType::FAT32 => 0x0FFF_FFF8,
        }
    }

    /// Entry value marking a bad cluster.
    pub fn bad_cluster(&self) -> u32 {
        match self {
            FATType::FAT12 => 0x0FF7,
            FATType::FAT16 => 0xFFF7,
            FATType::FAT32 => 0x0FFF_FFF7,
        }
    }

    pub fn fs_type(&self) -> FsType {
        match self {
            FATType::FAT12 => FsType::Fat12,
            FATType::FAT16 => FsType::Fat16,
            FATType::FAT32 => FsType::Fat32,
        }
    }
}

impl fmt::Display for FATType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FATType::FAT12 => "FAT12",
            FATType::FAT16 => "FAT16",
            FATType::FAT32 => "FAT32",
        };
        write!(f, "{s}")
    }
}
