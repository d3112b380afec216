//! Error types for partition-table parsing and validation.
//!
//! These errors describe why a driver rejected a table whose signature it
//! recognized. The registry logs them and treats the driver as having declined.

use thiserror;

use crate::error::VfsError;

/// Represents errors that can occur while parsing a partition table.
#[derive(thiserror::Error, Debug)]
pub enum PartitionError {
    /// Reading the table failed.
    #[error("{0}")]
    Source(#[from] VfsError),
    /// Two or more partitions share sectors.
    #[error("Partitions #{first} and #{second} are overlapping")]
    OverlappingPartitions { first: u32, second: u32 },
    /// A partition reaches past the end of its container.
    #[error("Partition #{index} ends at byte {end}, beyond the {limit}-byte container")]
    OutOfBounds { index: u32, end: u64, limit: u64 },
    /// A partition has no sectors or its range overflows.
    #[error("Partition #{0} has an invalid extent")]
    InvalidExtent(u32),
    /// The boot signature is not valid.
    #[error("Invalid signature: 0x{0:04X}")]
    InvalidSignature(u16),
    /// A header field holds an impossible value.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    /// A stored checksum does not match the data it covers.
    #[error("Checksum mismatch on {what}: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },
    /// More partitions than the scheme can plausibly describe.
    #[error("Implausible partition count: {0}")]
    ImplausibleCount(u64),
    /// An on-disk record could not be decoded.
    #[error("BinRead error: {0}")]
    BinRead(#[from] binread::Error),
}
