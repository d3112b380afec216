//! Disk images and the session aggregating them.
//!
//! This module provides functionality for:
//! - Opening an image from a locator or wrapping an in-memory buffer
//! - Running partition and filesystem detection over it
//! - Displaying the resulting block layout and entry trees

use std::sync::Arc;

use getset::Getters;
use log::info;

use crate::block::Block;
use crate::entry::Filesystem;
use crate::error::Result;
use crate::options::DetectOptions;
use crate::source::ImageSource;
use crate::traits::{LayoutDisplay, TraitError, TreeDisplay};

/// A disk image with the block tree detected on it.
#[derive(Getters)]
pub struct Disk {
    /// The open image, shared with every block of the tree.
    #[get = "pub"]
    source: Arc<ImageSource>,
    /// The root of the block tree.
    #[get = "pub"]
    root: Arc<Block>,
    /// The options detection ran with.
    #[get = "pub"]
    options: DetectOptions,
}

impl Disk {
    /// Opens a disk image and analyzes its structure.
    ///
    /// # Parameters
    /// - `locator`: Path or `file://` URL of the image
    /// - `options`: Sector size, validation strictness and cancellation control
    ///
    /// # Returns
    /// - `Ok(Disk)`: the image with its block tree
    /// - `Err(VfsError)`: if the image cannot be read or detection was interrupted
    ///
    /// # Errors
    /// - `VfsError::SourceUnavailable` if the image cannot be opened or read
    /// - `VfsError::Cancelled` or `VfsError::TimedOut` from the options' control
    pub fn from_locator(locator: &str, options: DetectOptions) -> Result<Self> {
        let source = Arc::new(ImageSource::open(locator, options.sector_size())?);
        Self::from_source(source, options)
    }

    /// Analyzes an in-memory image named `name`.
    pub fn from_bytes(name: &str, data: Vec<u8>, options: DetectOptions) -> Result<Self> {
        let source = Arc::new(ImageSource::from_bytes(name, data, options.sector_size()));
        Self::from_source(source, options)
    }

    fn from_source(source: Arc<ImageSource>, options: DetectOptions) -> Result<Self> {
        let root = Block::detect(source.clone(), &options)?;
        info!(
            "{}: {} blocks, {} filesystems",
            source.locator(),
            root.descendants().len() + 1,
            root.filesystems().len()
        );

        Ok(Disk {
            source,
            root,
            options,
        })
    }

    /// The filesystems found on the disk, in disk order.
    pub fn filesystems(&self) -> Vec<Arc<Filesystem>> {
        self.root.filesystems()
    }

    /// Prints a hierarchical layout of the disk structure.
    ///
    /// # Parameters
    /// - `indent`: Number of spaces to indent the layout
    ///
    /// # Returns
    /// - `Ok(())` if the layout is printed successfully
    /// - `Err(std::fmt::Error)` if formatting fails
    pub fn print_layout(&self, indent: u8) -> std::result::Result<(), std::fmt::Error> {
        print!("{}", self.root.display_layout(indent)?);
        Ok(())
    }

    /// Prints the entry tree of every filesystem on the disk.
    pub fn print_tree(&self) -> std::result::Result<(), TraitError> {
        for fs in self.filesystems().iter() {
            print!("{}", fs.display_tree(0)?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("source", &self.source)
            .field("root", &self.root)
            .finish()
    }
}

/// The top-level aggregator: the disks opened during one analysis.
#[derive(Debug, Default, Getters)]
pub struct Session {
    #[get = "pub"]
    disks: Vec<Disk>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `locator`, detects its content and keeps the disk for the session.
    ///
    /// # Errors
    /// See [`Disk::from_locator`].
    pub fn add_disk(&mut self, locator: &str, options: DetectOptions) -> Result<&Disk> {
        let disk = Disk::from_locator(locator, options)?;
        Ok(self.push(disk))
    }

    /// Keeps an already analyzed disk for the session.
    pub fn push(&mut self, disk: Disk) -> &Disk {
        self.disks.push(disk);
        &self.disks[self.disks.len() - 1]
    }

    /// Every filesystem of every disk, in the order the disks were added.
    pub fn filesystems(&self) -> Vec<Arc<Filesystem>> {
        self.disks.iter().flat_map(|d| d.filesystems()).collect()
    }
}
