//! Filesystem detection and the driver-facing data model.
//!
//! A [`FilesystemDriver`] probes a block and, when it recognizes the content,
//! returns a [`FsBackend`]: the driver's view of the volume from which the
//! entry tree is materialized on demand.
pub mod bpb;
pub mod dir_entry;
pub mod ext;
pub mod ext_error;
pub mod ext_inode;
pub mod ext_superblock;
pub mod fat;
pub mod fat_error;
pub mod fat_type;

use std::fmt;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use chrono::NaiveDateTime;
use getset::{CopyGetters, Getters};
use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::{Probe, Result, VfsError};
use crate::options::DetectOptions;
use crate::traits::LayoutDisplay;

/// Identifier of an entry, stable and unique within its filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The filesystem families understood by the built-in drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsType {
    Fat12,
    Fat16,
    Fat32,
    Ext2,
    Ext3,
    Ext4,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsType::Fat12 => "FAT12",
            FsType::Fat16 => "FAT16",
            FsType::Fat32 => "FAT32",
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
        };
        write!(f, "{s}")
    }
}

/// Volume-level metadata produced by a driver.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct FilesystemMeta {
    #[get_copy = "pub"]
    fs_type: FsType,
    #[get = "pub"]
    label: Option<String>,
    /// Allocation unit in bytes (cluster or block size).
    #[get_copy = "pub"]
    cluster_size: u64,
    #[get_copy = "pub"]
    total_space: u64,
    /// Free bytes, when the driver could establish them.
    #[get_copy = "pub"]
    free_space: Option<u64>,
    #[get_copy = "pub"]
    root: EntryId,
    #[get = "pub"]
    attributes: Attributes,
}

impl FilesystemMeta {
    pub fn new(fs_type: FsType, cluster_size: u64, total_space: u64) -> Self {
        Self {
            fs_type,
            label: None,
            cluster_size,
            total_space,
            free_space: None,
            root: EntryId(0),
            attributes: Attributes::new(),
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label.filter(|l| !l.is_empty());
        self
    }

    pub fn with_free_space(mut self, free_space: Option<u64>) -> Self {
        self.free_space = free_space;
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl LayoutDisplay for FilesystemMeta {
    fn display_layout(&self, indent: u8) -> std::result::Result<String, fmt::Error> {
        let mut out = String::from("");
        let indent = " ".repeat(indent.into());

        writeln!(out, "{}┌{:─^55}┐", indent, format!(" {} Volume ", self.fs_type))?;
        writeln!(
            out,
            "{}├{:<30}{:>25}┤",
            indent,
            "Label",
            self.label.as_deref().unwrap_or("-")
        )?;
        writeln!(out, "{}├{:<30}{:>25}┤", indent, "Cluster Size", self.cluster_size)?;
        writeln!(out, "{}├{:<30}{:>25}┤", indent, "Total Space", self.total_space)?;
        match self.free_space {
            Some(free) => writeln!(out, "{}├{:<30}{:>25}┤", indent, "Free Space", free)?,
            None => writeln!(out, "{}├{:<30}{:>25}┤", indent, "Free Space", "unknown")?,
        }
        writeln!(out, "{}└{:─^55}┘", indent, "")?;

        Ok(out)
    }
}

/// The timestamps a filesystem may record for an entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub accessed: Option<NaiveDateTime>,
    /// Metadata change time.
    pub changed: Option<NaiveDateTime>,
    pub deleted: Option<NaiveDateTime>,
}

/// One entry as described by a driver, before it joins the entry tree.
#[derive(Clone, Debug)]
pub struct EntryRecord {
    pub id: EntryId,
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    pub is_folder: bool,
    pub deleted: bool,
    pub reallocated: bool,
    /// Driver-native reference to the entry's storage: first cluster for FAT,
    /// inode number for ext. Two folders sharing it share their content.
    pub storage: Option<u64>,
    pub timestamps: Timestamps,
    pub attributes: Attributes,
}

impl EntryRecord {
    pub fn new(id: EntryId, name: &str, is_folder: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            size: 0,
            is_folder,
            deleted: false,
            reallocated: false,
            storage: None,
            timestamps: Timestamps::default(),
            attributes: Attributes::new(),
        }
    }
}

/// Where the bytes of one logical extent come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtentKind {
    /// Stored at a byte offset relative to the filesystem block.
    Mapped { physical: u64 },
    /// Declared hole; reads as zeros.
    Sparse,
    /// Stored inside the metadata itself.
    Inline(Arc<[u8]>),
}

/// A run of logically contiguous content bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub length: u64,
    pub kind: ExtentKind,
}

/// The logical-to-physical map of an entry's content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentMap {
    extents: Vec<Extent>,
    length: u64,
}

impl ContentMap {
    /// Builds a map of `length` bytes. Extents are sorted by logical offset and
    /// clipped to `length`.
    pub fn new(mut extents: Vec<Extent>, length: u64) -> Self {
        extents.retain(|e| e.length > 0 && e.logical < length);
        extents.sort_by_key(|e| e.logical);
        for extent in extents.iter_mut() {
            extent.length = extent.length.min(length - extent.logical);
        }
        Self { extents, length }
    }

    /// A map of contiguous bytes starting at `physical`.
    pub fn contiguous(physical: u64, length: u64) -> Self {
        Self::new(
            vec![Extent {
                logical: 0,
                length,
                kind: ExtentKind::Mapped { physical },
            }],
            length,
        )
    }

    pub fn inline(data: &[u8]) -> Self {
        let length = data.len() as u64;
        Self::new(
            vec![Extent {
                logical: 0,
                length,
                kind: ExtentKind::Inline(Arc::from(data)),
            }],
            length,
        )
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Shortens the map to at most `length` bytes.
    pub fn truncate(self, length: u64) -> Self {
        if length >= self.length {
            return self;
        }
        Self::new(self.extents, length)
    }

    /// Reads up to `max` bytes of content at logical `offset`.
    ///
    /// Returns an empty buffer at or past the end. When a mapped extent cannot
    /// be read, the bytes gathered so far are returned; if there are none the
    /// call fails.
    ///
    /// # Errors
    /// - `VfsError::ReadRecoveryFailure` if no byte could be read at `offset`
    /// - fatal source errors are passed through unchanged
    pub fn read_at(&self, range: &BlockRange, offset: u64, max: usize) -> Result<Vec<u8>> {
        if offset >= self.length {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(max as u64).min(self.length);
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;

        while pos < end {
            let covering = self
                .extents
                .iter()
                .find(|e| e.logical <= pos && pos < e.logical + e.length);

            let Some(extent) = covering else {
                // Not covered by any extent: a hole up to the next extent
                let next = self
                    .extents
                    .iter()
                    .map(|e| e.logical)
                    .filter(|&l| l > pos)
                    .min()
                    .unwrap_or(end)
                    .min(end);
                out.resize(out.len() + (next - pos) as usize, 0);
                pos = next;
                continue;
            };

            let inner = pos - extent.logical;
            let take = (extent.length - inner).min(end - pos);
            match &extent.kind {
                ExtentKind::Sparse => out.resize(out.len() + take as usize, 0),
                ExtentKind::Inline(data) => {
                    match data.get(inner as usize..(inner + take) as usize) {
                        Some(bytes) => out.extend_from_slice(bytes),
                        None if out.is_empty() => {
                            return Err(VfsError::ReadRecoveryFailure {
                                offset: pos,
                                reason: "inline data shorter than its extent".to_string(),
                            });
                        }
                        None => return Ok(out),
                    }
                }
                ExtentKind::Mapped { physical } => {
                    match range.read_exact(physical + inner, take as usize) {
                        Ok(bytes) => out.extend_from_slice(&bytes),
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) if out.is_empty() => {
                            return Err(VfsError::ReadRecoveryFailure {
                                offset: pos,
                                reason: err.to_string(),
                            });
                        }
                        Err(_) => return Ok(out),
                    }
                }
            }
            pos += take;
        }

        Ok(out)
    }
}

/// A driver's read-only view of a recognized volume.
pub trait FsBackend: Send + Sync {
    fn meta(&self) -> &FilesystemMeta;

    /// The root folder; its id is `meta().root()`.
    fn root(&self) -> EntryRecord;

    /// Lists a folder in the filesystem's native order, deleted entries included.
    fn read_dir(&self, folder: &EntryRecord) -> Result<Vec<EntryRecord>>;

    /// Maps the content of a file, or `None` when nothing can be recovered.
    fn content(&self, entry: &EntryRecord) -> Result<Option<ContentMap>>;

    /// A table of the volume's on-disk regions, for drivers that draw one.
    fn region_layout(&self, _indent: u8) -> std::result::Result<Option<String>, fmt::Error> {
        Ok(None)
    }
}

/// A filesystem parser.
pub trait FilesystemDriver: Send + Sync {
    /// Short name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Inspects `range` and returns a backend for it, or declines.
    ///
    /// A non-fatal `Err` means the signature matched but the structure did not.
    fn probe(&self, range: &BlockRange, options: &DetectOptions) -> Result<Probe<Box<dyn FsBackend>>>;
}

/// Ordered set of filesystem drivers, tried in priority order.
pub struct FilesystemRegistry {
    drivers: Vec<Box<dyn FilesystemDriver>>,
}

static DEFAULT_REGISTRY: Lazy<FilesystemRegistry> = Lazy::new(|| {
    FilesystemRegistry::with_drivers(vec![Box::new(fat::FatDriver), Box::new(ext::ExtDriver)])
});

impl FilesystemRegistry {
    /// The process-wide registry: FAT, then ext.
    pub fn global() -> &'static FilesystemRegistry {
        &DEFAULT_REGISTRY
    }

    pub fn with_drivers(drivers: Vec<Box<dyn FilesystemDriver>>) -> Self {
        Self { drivers }
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Runs every driver until one accepts `range`.
    ///
    /// Non-fatal failures are logged, appended to `diagnostics` and treated as
    /// a decline.
    ///
    /// # Errors
    /// Only fatal conditions (unavailable source, cancellation, timeout) are returned.
    pub fn probe(
        &self,
        range: &BlockRange,
        options: &DetectOptions,
        diagnostics: &mut Vec<String>,
    ) -> Result<Option<Box<dyn FsBackend>>> {
        for driver in self.drivers.iter() {
            options.control().check()?;

            match driver.probe(range, options) {
                Ok(Probe::Accepted(backend)) => {
                    info!(
                        "{} filesystem ({} bytes) at byte {}",
                        backend.meta().fs_type(),
                        range.size(),
                        range.offset()
                    );
                    return Ok(Some(backend));
                }
                Ok(Probe::Declined) => debug!("{} declined block at {}", driver.name(), range.offset()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    let detail = match err {
                        inconsistency @ VfsError::StructuralInconsistency { .. } => inconsistency,
                        other => VfsError::StructuralInconsistency {
                            driver: driver.name(),
                            detail: other.to_string(),
                        },
                    };
                    warn!("{detail}");
                    diagnostics.push(detail.to_string());
                }
            }
        }

        Ok(None)
    }
}
