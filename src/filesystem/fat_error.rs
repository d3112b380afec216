//! Error types for FAT boot sector parsing and volume traversal.
//!
//! The boot sector holds the BIOS Parameter Block (BPB) that describes the
//! layout of the volume. Errors raised while validating it make the FAT driver
//! decline the block; errors raised while walking directories or cluster chains
//! are contained to the entry being read.

use thiserror::Error;

use crate::error::VfsError;

/// Errors that can occur while parsing or reading a FAT volume.
#[derive(Error, Debug)]
pub enum FATError {
    /// The first three bytes of a FAT volume must contain a valid x86 jump instruction.
    #[error("Invalid jump instruction `{0}`")]
    InvalidJmp(String),

    /// Bytes per sector must be 512, 1024, 2048 or 4096.
    #[error("Invalid count of bytes per sector: `{0}`. Legal values: 512, 1024, 2048 or 4096")]
    InvalidBytesPerSec(u16),

    /// Sectors per cluster must be a power of 2 up to 128.
    #[error(
        "Invalid number of sector per cluster: `{0}`. Legal values: 1, 2, 4, 8, 16, 32, 64, 128"
    )]
    InvalidSecPerClus(u8),

    /// Bytes per sector × sectors per cluster must not exceed 32 KiB.
    #[error("Invalid cluster size: `{0}`. Any value greater than 32K is invalid.")]
    InvalidClusSz(u32),

    /// The reserved region holds at least the boot sector.
    #[error("Invalid count of reserved sectors: `{0}`. Any value greater than 0 is valid.")]
    InvalidRsvdSecCnt(u16),

    #[error("Invalid number of FATs on this volume: `{0}`.")]
    InvalidNumFat(u8),

    /// FAT32 keeps its root directory in a cluster chain; FAT12/16 need a fixed root.
    #[error("Invalid count of directory entries in the root directory: `{0}`.")]
    InvalidRootEntCnt(u16),

    #[error("Invalid total count of sectors on the volume: `{0}`")]
    InvalidTotSec(String),

    #[error("Invalid FAT size:`{0}`")]
    InvalidFatSz(String),

    /// Clusters 0 and 1 are reserved; the data area starts at cluster 2.
    #[error("Invalid cluster number of the first cluster of the root directory: `{0}`.")]
    InvalidRootClus(u32),

    /// The boot sector signature must be 0x55AA.
    #[error("Invalid BPB signature: `{0}`. Expected signature: 0x55AA")]
    InvalidSignature(String),

    /// A region declared by the BPB does not fit in the block holding the volume.
    #[error("The {region} ends at byte {end}, beyond the {limit}-byte volume")]
    RegionOutOfBounds {
        region: &'static str,
        end: u64,
        limit: u64,
    },

    /// A directory or chain refers to a cluster outside the data region.
    #[error("Cluster `{0}` is outside the data region")]
    InvalidCluster(u32),

    /// Reading the underlying block failed.
    #[error("{0}")]
    Source(#[from] VfsError),

    /// Parsing error occurred during structure initialization
    #[error("BinRead Error: `{0}`")]
    BinReadError(#[from] binread::Error),
}

/// Folds FAT errors into the crate-wide error, keeping source failures intact.
impl From<FATError> for VfsError {
    fn from(err: FATError) -> Self {
        match err {
            FATError::Source(inner) => inner,
            other => VfsError::StructuralInconsistency {
                driver: "fat",
                detail: other.to_string(),
            },
        }
    }
}
