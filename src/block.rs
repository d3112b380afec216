//! The block tree: contiguous byte ranges of an image and what was found in them.
//!
//! A disk block spans the whole [`ImageSource`]. Detection attaches a partition
//! container holding one block per partition plus the unallocated gaps between
//! them, and a filesystem block below every partition a driver recognized.
//! When no partition driver accepts the disk, the filesystem registry gets the
//! disk block itself.

use std::fmt::{self, Write as FmtWrite};
use std::sync::{Arc, Weak};

use getset::{CopyGetters, Getters};
use log::{debug, info};

use crate::attributes::Attributes;
use crate::entry::Filesystem;
use crate::error::{Result, VfsError};
use crate::filesystem::FilesystemRegistry;
use crate::options::DetectOptions;
use crate::partition::{PartitionEntry, PartitionLayout, PartitionRegistry};
use crate::source::ImageSource;
use crate::traits::LayoutDisplay;

/// A window over an image source. Offsets passed to its methods are relative.
#[derive(Clone, Debug, CopyGetters)]
pub struct BlockRange {
    source: Arc<ImageSource>,
    /// Absolute offset of the window in the source.
    #[get_copy = "pub"]
    offset: u64,
    #[get_copy = "pub"]
    size: u64,
}

impl BlockRange {
    /// A range spanning the whole source.
    pub fn new(source: Arc<ImageSource>) -> Self {
        let size = source.size();
        Self {
            source,
            offset: 0,
            size,
        }
    }

    pub fn source(&self) -> &Arc<ImageSource> {
        &self.source
    }

    pub fn sector_size(&self) -> usize {
        self.source.sector_size()
    }

    /// Returns the window of `size` bytes starting `offset` bytes into this one.
    ///
    /// # Errors
    /// - `VfsError::OutOfRange` if the window does not fit in this range
    pub fn sub(&self, offset: u64, size: u64) -> Result<BlockRange> {
        self.check(offset, size)?;
        Ok(BlockRange {
            source: self.source.clone(),
            offset: self.offset + offset,
            size,
        })
    }

    fn check(&self, offset: u64, length: u64) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VfsError::OutOfRange {
                offset,
                length,
                size: self.size,
            }),
        }
    }

    /// Reads `length` bytes at the relative `offset`.
    ///
    /// # Errors
    /// - `VfsError::OutOfRange` if the request reaches beyond the range
    /// - `VfsError::SourceUnavailable` if the source cannot be read
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.check(offset, length as u64)?;
        self.source.read(self.offset + offset, length)
    }

    /// Like [`BlockRange::read`], but a short read from the source is an error too.
    pub fn read_exact(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let buf = self.read(offset, length)?;
        if buf.len() < length {
            return Err(VfsError::OutOfRange {
                offset,
                length: length as u64,
                size: offset + buf.len() as u64,
            });
        }
        Ok(buf)
    }
}

/// What a block represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Disk,
    PartitionContainer,
    Partition,
    Filesystem,
    Unallocated,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockKind::Disk => "disk",
            BlockKind::PartitionContainer => "partition-container",
            BlockKind::Partition => "partition",
            BlockKind::Filesystem => "filesystem",
            BlockKind::Unallocated => "unallocated",
        };
        write!(f, "{s}")
    }
}

/// A node of the block tree. Immutable once detection has built it.
#[derive(Getters, CopyGetters)]
pub struct Block {
    #[get = "pub"]
    name: String,
    #[get_copy = "pub"]
    kind: BlockKind,
    #[get = "pub"]
    range: BlockRange,
    parent: Weak<Block>,
    #[get = "pub"]
    children: Vec<Arc<Block>>,
    /// The partition layout read from a container block.
    #[get = "pub"]
    layout: Option<PartitionLayout>,
    /// The table entry a partition block was built from.
    #[get = "pub"]
    partition: Option<PartitionEntry>,
    #[get = "pub"]
    filesystem: Option<Arc<Filesystem>>,
    #[get = "pub"]
    attributes: Attributes,
    /// Drivers that recognized a signature here but rejected the structure.
    #[get = "pub"]
    diagnostics: Vec<String>,
}

/// A block under construction; turned into the linked tree once detection is over.
struct Node {
    name: String,
    kind: BlockKind,
    range: BlockRange,
    children: Vec<Node>,
    layout: Option<PartitionLayout>,
    partition: Option<PartitionEntry>,
    filesystem: Option<Arc<Filesystem>>,
    attributes: Attributes,
    diagnostics: Vec<String>,
}

impl Node {
    fn new(name: String, kind: BlockKind, range: BlockRange) -> Self {
        Self {
            name,
            kind,
            range,
            children: vec![],
            layout: None,
            partition: None,
            filesystem: None,
            attributes: Attributes::new(),
            diagnostics: vec![],
        }
    }

    fn into_block(self, parent: Weak<Block>) -> Arc<Block> {
        Arc::new_cyclic(|me| Block {
            name: self.name,
            kind: self.kind,
            range: self.range,
            parent,
            children: self
                .children
                .into_iter()
                .map(|child| child.into_block(me.clone()))
                .collect(),
            layout: self.layout,
            partition: self.partition,
            filesystem: self.filesystem,
            attributes: self.attributes,
            diagnostics: self.diagnostics,
        })
    }
}

impl Block {
    /// Wraps `source` in a disk block, without running detection.
    pub fn wrap(source: Arc<ImageSource>) -> Arc<Block> {
        let name = source.locator().clone();
        Node::new(name, BlockKind::Disk, BlockRange::new(source)).into_block(Weak::new())
    }

    /// Builds the block tree of `source`.
    ///
    /// Driver failures are contained: they end up in the `diagnostics` of the
    /// block they concern.
    ///
    /// # Errors
    /// - `VfsError::SourceUnavailable` if the source cannot be read
    /// - `VfsError::Cancelled` or `VfsError::TimedOut` as requested by the options' control
    pub fn detect(source: Arc<ImageSource>, options: &DetectOptions) -> Result<Arc<Block>> {
        if !source.is_available() {
            return Err(VfsError::SourceUnavailable(source.locator().clone()));
        }
        options.control().check()?;

        let range = BlockRange::new(source.clone());
        let mut disk = Node::new(source.locator().clone(), BlockKind::Disk, range.clone());
        disk.attributes.set("size", source.size());
        disk.attributes.set("sector_size", source.sector_size() as u64);

        match PartitionRegistry::global().probe(&range, options, &mut disk.diagnostics)? {
            Some(layout) => {
                let container = Self::detect_container(&range, layout, options)?;
                disk.children.push(container);
            }
            None => {
                debug!("{}: no partition table, probing filesystems", source.locator());
                if let Some(fs) = Self::detect_filesystem(&range, options, &mut disk.diagnostics)? {
                    disk.children.push(fs);
                }
            }
        }

        Ok(disk.into_block(Weak::new()))
    }

    fn detect_container(range: &BlockRange, layout: PartitionLayout, options: &DetectOptions) -> Result<Node> {
        let mut container = Node::new(
            layout.scheme().to_string().to_lowercase(),
            BlockKind::PartitionContainer,
            range.clone(),
        );
        container.attributes = layout.attributes().clone();
        container.attributes.set("scheme", layout.scheme().to_string());
        container.attributes.set("partition_count", layout.partitions().len() as u64);

        let mut children = vec![];
        for part in layout.partitions().iter() {
            options.control().check()?;

            let sub = range.sub(part.start(), part.size())?;
            let mut node = Node::new(format!("p{}", part.index()), BlockKind::Partition, sub.clone());
            node.attributes.set("index", part.index());
            node.attributes.set("type", part.type_tag().to_string());
            node.attributes.set("bootable", part.flags().bootable);
            node.attributes.set("logical", part.flags().logical);
            node.attributes.set_opt("name", part.name().clone());
            node.attributes.set_opt("guid", part.guid().as_ref().map(|g| g.to_string()));
            node.partition = Some(part.clone());

            if let Some(fs) = Self::detect_filesystem(&sub, options, &mut node.diagnostics)? {
                node.children.push(fs);
            }
            children.push(node);
        }

        for (start, size) in layout.gaps() {
            let sub = range.sub(start, size)?;
            children.push(Node::new(
                format!("unallocated@{start}"),
                BlockKind::Unallocated,
                sub,
            ));
        }

        children.sort_by_key(|node| node.range.offset());
        container.children = children;
        container.layout = Some(layout);
        Ok(container)
    }

    fn detect_filesystem(
        range: &BlockRange,
        options: &DetectOptions,
        diagnostics: &mut Vec<String>,
    ) -> Result<Option<Node>> {
        let Some(backend) = FilesystemRegistry::global().probe(range, options, diagnostics)? else {
            return Ok(None);
        };

        let meta = backend.meta().clone();
        let mut node = Node::new(
            meta.fs_type().to_string().to_lowercase(),
            BlockKind::Filesystem,
            range.clone(),
        );
        node.attributes = meta.attributes().clone();
        node.attributes.set("fs_type", meta.fs_type().to_string());
        node.attributes.set_opt("label", meta.label().clone());
        node.filesystem = Some(Filesystem::new(backend, range.clone(), options.control().clone()));
        info!("{} at byte {}", meta.fs_type(), range.offset());
        Ok(Some(node))
    }

    /// Absolute offset in the source.
    pub fn offset(&self) -> u64 {
        self.range.offset()
    }

    pub fn size(&self) -> u64 {
        self.range.size()
    }

    /// Reads `length` bytes at `offset`, relative to the start of the block.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.range.read(offset, length)
    }

    pub fn parent(&self) -> Option<Arc<Block>> {
        self.parent.upgrade()
    }

    /// Returns `false` once the underlying source has become unreadable.
    pub fn is_available(&self) -> bool {
        self.range.source().is_available()
    }

    /// Slash-separated names from the disk down to this block.
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}/{}", parent.path(), self.name),
            None => self.name.clone(),
        }
    }

    /// Every block below this one, depth first.
    pub fn descendants(&self) -> Vec<Arc<Block>> {
        let mut out = vec![];
        for child in self.children.iter() {
            out.push(child.clone());
            out.extend(child.descendants());
        }
        out
    }

    /// The filesystems found below this block, in disk order.
    pub fn filesystems(&self) -> Vec<Arc<Filesystem>> {
        self.descendants()
            .iter()
            .filter_map(|b| b.filesystem.clone())
            .collect()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("children", &self.children)
            .finish()
    }
}

/// Implements the LayoutDisplay trait for Block
///
/// Prints the block tree as a table, then the partition layout and the
/// filesystem layouts found below the block.
impl LayoutDisplay for Block {
    fn display_layout(&self, indent: u8) -> std::result::Result<String, fmt::Error> {
        let mut out = String::from("");
        let pad = " ".repeat(indent.into());
        let ss = self.range.sector_size().max(1) as u64;

        writeln!(out, "{}┌{:─^55}┐", pad, " Block Tree ")?;
        writeln!(out, "{}├{:<45}{:>10}┤", pad, "Disk Size", self.size() / ss)?;
        writeln!(out, "{}├{:─^55}┤", pad, "")?;
        writeln!(
            out,
            "{}├{:^12}┬{:^12}┬{:^12}┬{:^16}┤",
            pad, "Block", "Start", "End", "Kind"
        )?;
        writeln!(
            out,
            "{}├{:─<12}┼{:─<12}┼{:─<12}┼{:─<16}┤",
            pad, "", "", "", ""
        )?;
        for block in std::iter::once(self).chain(self.descendants().iter().map(|b| b.as_ref())) {
            let name: String = block.name.chars().take(12).collect();
            writeln!(
                out,
                "{}│{:<12}│{:>12}│{:>12}│{:^16}│",
                pad,
                name,
                block.offset() / ss,
                (block.offset() + block.size()) / ss,
                block.kind.to_string()
            )?;
        }
        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<16}┘",
            pad, "", "", "", ""
        )?;

        for block in std::iter::once(self).chain(self.descendants().iter().map(|b| b.as_ref())) {
            if let Some(layout) = block.layout.as_ref() {
                write!(out, "\n{}", layout.display_layout(indent + 3)?)?;
            }
            if let Some(fs) = block.filesystem.as_ref() {
                write!(out, "\n{}", fs.meta().display_layout(indent + 6)?)?;
                if let Some(regions) = fs.region_layout(indent + 6)? {
                    write!(out, "\n{regions}")?;
                }
            }
            for diagnostic in block.diagnostics.iter() {
                writeln!(out, "{}! {}: {diagnostic}", pad, block.name)?;
            }
        }

        Ok(out)
    }
}
