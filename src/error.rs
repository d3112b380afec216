//! Crate-wide error type and the probe outcome shared by every driver.
//!
//! Driver families keep their own validation errors (see
//! [`crate::partition::partition_error::PartitionError`],
//! [`crate::filesystem::fat_error::FATError`] and
//! [`crate::filesystem::ext_error::ExtError`]); they are folded into
//! [`VfsError`] at the registry boundary.

use thiserror::Error;

/// Errors surfaced by the virtual block/filesystem layer.
#[derive(Error, Debug)]
pub enum VfsError {
    /// The image cannot be opened or has become unreadable.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A read request reaches past the extent of a block or an entry.
    #[error("Read of {length} bytes at offset {offset} exceeds the {size}-byte extent")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    /// A driver recognized its signature but found contradictory metadata.
    #[error("Structural inconsistency in {driver}: {detail}")]
    StructuralInconsistency { driver: &'static str, detail: String },

    /// Part of an entry's content could not be retrieved.
    #[error("Could not recover bytes at offset {offset}: {reason}")]
    ReadRecoveryFailure { offset: u64, reason: String },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller-supplied deadline expired.
    #[error("Operation timed out")]
    TimedOut,

    /// The reader was used after `close()`.
    #[error("Reader is closed")]
    Closed,
}

impl VfsError {
    /// Returns `true` for outcomes that must stop the whole scan of a source.
    ///
    /// Everything else is contained to the block, driver or entry that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VfsError::SourceUnavailable(_) | VfsError::Cancelled | VfsError::TimedOut
        )
    }
}

/// Outcome of a partition or filesystem probe.
///
/// `Declined` is the normal "not mine" answer and never an error.
#[derive(Debug)]
pub enum Probe<T> {
    Accepted(T),
    Declined,
}

impl<T> Probe<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Probe::Accepted(_))
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;
