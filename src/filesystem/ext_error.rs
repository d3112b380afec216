//! Error types for ext2/3/4 superblock validation and inode decoding.

use thiserror::Error;

use crate::error::VfsError;

/// Errors that can occur while parsing or reading an ext volume.
#[derive(Error, Debug)]
pub enum ExtError {
    /// The superblock magic must be 0xEF53.
    #[error("Invalid superblock magic: `0x{0:04X}`. Expected: 0xEF53")]
    InvalidMagic(u16),

    /// Block sizes range from 1 KiB to 64 KiB.
    #[error("Invalid block size exponent `{0}`. Legal block sizes: 1 KiB to 64 KiB")]
    InvalidBlockSize(u32),

    #[error("Invalid inode size `{0}`")]
    InvalidInodeSize(u16),

    #[error("Invalid group geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid group descriptor size `{0}`")]
    InvalidDescriptorSize(u16),

    /// The volume needs a feature this reader does not implement.
    #[error("Unsupported incompatible features `0x{0:X}`")]
    UnsupportedFeatures(u32),

    #[error("Inode `{0}` is outside the inode tables")]
    InvalidInode(u32),

    /// A block pointer leaves the volume.
    #[error("Block `{block}` of inode `{inode}` is outside the volume")]
    InvalidBlock { inode: u32, block: u64 },

    #[error("Corrupt extent tree in inode `{inode}`: {detail}")]
    InvalidExtentTree { inode: u32, detail: String },

    /// Reading the underlying block failed.
    #[error("{0}")]
    Source(#[from] VfsError),

    /// Parsing error occurred during structure initialization
    #[error("BinRead Error: `{0}`")]
    BinReadError(#[from] binread::Error),
}

/// Folds ext errors into the crate-wide error, keeping source failures intact.
impl From<ExtError> for VfsError {
    fn from(err: ExtError) -> Self {
        match err {
            ExtError::Source(inner) => inner,
            other => VfsError::StructuralInconsistency {
                driver: "ext",
                detail: other.to_string(),
            },
        }
    }
}
