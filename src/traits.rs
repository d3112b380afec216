//! Declaration of traits reused across the code.

use thiserror::Error;

use crate::error::VfsError;

/// Errors raised while rendering a structure.
#[derive(Error, Debug)]
pub enum TraitError {
    #[error("Formatting error: {0}")]
    Fmt(#[from] std::fmt::Error),

    #[error("{0}")]
    Vfs(#[from] VfsError),
}

/// Implementation of the LayoutDisplay trait.
/// It is used to display the layout of a given structure such as a disk or partition.
pub trait LayoutDisplay {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error>;
}

/// Renders the entry tree below a structure, one entry per line.
pub trait TreeDisplay {
    fn display_tree(&self, indent: usize) -> Result<String, TraitError>;
}
