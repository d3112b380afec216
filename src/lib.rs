//!
//! VFSForensics: a read-only virtual block and filesystem layer for disk images.
//!
//! This crate provides tools for:
//! - Reading raw images through a bounds-checked, shared [`ImageSource`]
//! - Detecting partition systems (GPT, Apple Partition Map, MBR with extended partitions)
//! - Detecting FAT12/16/32 and ext2/3/4 filesystems inside partitions or bare images
//! - Walking the entry tree, deleted and reallocated entries included
//! - Streaming entry content through scoped readers, e.g. for hashing
//!
//! The library is designed for extensibility and can be used both as a CLI tool and as a Rust library.
//!
//! # Re-exports
//! - [`Session`] and [`Disk`]: images and their block trees
//! - [`Block`]: a node of the block tree
//! - [`Filesystem`] and [`Entry`]: a recognized filesystem and its entries
//! - [`VfsError`]: the error type of the crate

pub mod attributes;
pub mod block;
pub mod commands;
pub mod digest;
pub mod disk;
pub mod entry;
pub mod error;
pub mod filesystem;
pub mod options;
pub mod partition;
pub mod reader;
pub mod source;
pub mod traits;
pub mod utils;
pub mod walk;

/// A node of the block tree (see [`block::Block`]).
pub use crate::block::{Block, BlockKind};
/// Image and session abstractions (see [`disk::Disk`]).
pub use crate::disk::{Disk, Session};
/// Entry tree (see [`entry::Filesystem`]).
pub use crate::entry::{Entry, Filesystem};
pub use crate::error::{Result, VfsError};
pub use crate::options::{DetectOptions, ScanControl};
pub use crate::reader::{EntryReader, ReadOutcome};
pub use crate::source::ImageSource;
