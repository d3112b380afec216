//! ext2/3/4 volume structure and operations.
//!
//! This module implements the ext driver:
//! - Superblock and group descriptor loading
//! - Inode lookup and allocation bitmaps
//! - Block maps (direct and indirect) and extent trees
//! - Directory listing with recovery of removed records from record slack

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use super::ext_error::ExtError;
use super::ext_inode::{
    DirRecord, ExtentNode, FT_DIR, I_BLOCK_SIZE, Inode, ROOT_INODE, parse_extent_node,
};
use super::ext_superblock::{EXT_MAGIC, GroupDesc, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, Superblock};
use super::{
    ContentMap, EntryId, EntryRecord, Extent, ExtentKind, FilesystemDriver, FilesystemMeta, FsBackend,
    Timestamps,
};
use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::{Probe, Result};
use crate::options::DetectOptions;
use crate::utils::{u16_at, u32_at};

/// Extent trees deeper than this are treated as corrupt.
const MAX_TREE_DEPTH: u16 = 5;

/// Bitmap blocks kept in memory before the cache is flushed.
const BITMAP_CACHE_BLOCKS: usize = 256;

/// Offset of the inline directory entries: the parent inode comes first.
const INLINE_DIR_OFFSET: usize = 4;

/// Offset of `i_block` inside an inode record.
const I_BLOCK_OFFSET: u64 = 40;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Bitmap {
    Block,
    Inode,
}

/// The ext2/3/4 driver.
pub struct ExtDriver;

impl FilesystemDriver for ExtDriver {
    fn name(&self) -> &'static str {
        "ext"
    }

    fn probe(&self, range: &BlockRange, _options: &DetectOptions) -> Result<Probe<Box<dyn FsBackend>>> {
        if range.size() < SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64 {
            return Ok(Probe::Declined);
        }

        let raw = range.read_exact(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        if u16_at(&raw, 56) != EXT_MAGIC {
            return Ok(Probe::Declined);
        }

        let sb = Superblock::from_bytes(&raw)?.validate(range.size())?;
        let volume = ExtVol::new(range.clone(), sb)?;
        Ok(Probe::Accepted(Box::new(volume)))
    }
}

/// Structure for an ext volume.
pub struct ExtVol {
    sb: Superblock,
    range: BlockRange,
    groups: Vec<GroupDesc>,
    meta: FilesystemMeta,
    root: EntryRecord,
    bitmaps: Mutex<HashMap<(Bitmap, u32), Arc<Vec<u8>>>>,
}

impl ExtVol {
    /// Loads the group descriptors and the root inode.
    ///
    /// # Errors
    /// - `ExtError::Source` if the descriptors or the root inode cannot be read
    /// - `ExtError::InvalidGeometry` if the root inode is not a directory
    pub fn new(range: BlockRange, sb: Superblock) -> std::result::Result<ExtVol, ExtError> {
        let desc_size = sb.desc_size() as usize;
        let table = range.read_exact(sb.gdt_offset(), sb.group_count() as usize * desc_size)?;
        let groups = table
            .chunks_exact(desc_size)
            .map(|raw| GroupDesc::from_bytes(raw, sb.is_64bit()))
            .collect();

        let block_size = sb.block_size();
        let mut attributes = Attributes::new();
        attributes.set("uuid", sb.uuid_string());
        attributes.set("revision", sb.rev_level());
        attributes.set("block_size", block_size);
        attributes.set("inode_count", sb.inodes_count());
        attributes.set("free_inodes", sb.free_inodes_count());
        attributes.set("block_count", sb.blocks_count());
        attributes.set("reserved_blocks", sb.reserved_blocks_count());
        attributes.set("group_count", sb.group_count());
        attributes.set("inode_size", sb.inode_size());
        attributes.set("features_compat", format!("0x{:X}", sb.feature_compat()));
        attributes.set("features_incompat", format!("0x{:X}", sb.feature_incompat()));
        attributes.set("features_ro_compat", format!("0x{:X}", sb.feature_ro_compat()));
        attributes.set("clean", sb.state() & 0x1 != 0);
        attributes.set("creator_os", sb.creator_os());
        attributes.set_opt("last_mounted", sb.last_mounted());
        attributes.set_opt("created", crate::utils::unix_datetime(sb.mkfs_time() as i64, 0));
        attributes.set_opt("last_written", crate::utils::unix_datetime(sb.wtime() as i64, 0));

        let total = sb
            .volume_bytes()
            .ok_or_else(|| ExtError::InvalidGeometry(format!("{} blocks", sb.blocks_count())))?;
        if total > range.size() {
            warn!(
                "{} volume declares {total} bytes, the block holds {}",
                sb.fs_type(),
                range.size()
            );
            attributes.set("truncated", true);
        }

        let meta = FilesystemMeta::new(sb.fs_type(), block_size, total)
            .with_label(sb.volume_name())
            .with_free_space(sb.free_blocks_count().checked_mul(block_size))
            .with_attributes(attributes);

        let mut vol = Self {
            sb,
            range,
            groups,
            meta,
            root: EntryRecord::new(EntryId(0), "", true),
            bitmaps: Mutex::new(HashMap::new()),
        };

        let root_inode = vol.read_inode(ROOT_INODE)?;
        if !root_inode.is_dir() {
            return Err(ExtError::InvalidGeometry(format!(
                "root inode has mode 0o{:o}",
                root_inode.mode()
            )));
        }
        let mut root = EntryRecord::new(EntryId(0), "", true);
        root.storage = Some(ROOT_INODE as u64);
        root.timestamps = Self::timestamps(&root_inode);
        Self::describe(&mut root.attributes, ROOT_INODE, &root_inode);
        vol.root = root;

        Ok(vol)
    }

    pub fn block_size(&self) -> u64 {
        self.sb.block_size()
    }

    fn check_block(&self, inode: u32, block: u64, count: u64) -> std::result::Result<(), ExtError> {
        if block == 0 || block.saturating_add(count) > self.sb.blocks_count() {
            return Err(ExtError::InvalidBlock { inode, block });
        }
        Ok(())
    }

    fn read_block(&self, block: u64) -> std::result::Result<Vec<u8>, ExtError> {
        Ok(self
            .range
            .read_exact(block * self.block_size(), self.block_size() as usize)?)
    }

    /// Byte offset of the record of inode `ino`.
    pub fn inode_offset(&self, ino: u32) -> std::result::Result<u64, ExtError> {
        if ino == 0 || ino > self.sb.inodes_count() {
            return Err(ExtError::InvalidInode(ino));
        }
        let group = (ino - 1) / self.sb.inodes_per_group();
        let index = (ino - 1) % self.sb.inodes_per_group();
        let desc = self.groups.get(group as usize).ok_or(ExtError::InvalidInode(ino))?;
        Ok(desc.inode_table() * self.block_size() + index as u64 * self.sb.inode_size() as u64)
    }

    pub fn read_inode(&self, ino: u32) -> std::result::Result<Inode, ExtError> {
        let offset = self.inode_offset(ino)?;
        let raw = self.range.read_exact(offset, self.sb.inode_size() as usize)?;
        Inode::from_bytes(&raw)
    }

    fn bitmap(&self, kind: Bitmap, group: u32) -> std::result::Result<Arc<Vec<u8>>, ExtError> {
        if let Some(bitmap) = self.bitmaps.lock().get(&(kind, group)) {
            return Ok(bitmap.clone());
        }

        let desc = self.groups[group as usize];
        let block = match kind {
            Bitmap::Block => desc.block_bitmap(),
            Bitmap::Inode => desc.inode_bitmap(),
        };
        let bitmap = Arc::new(self.read_block(block)?);

        let mut cache = self.bitmaps.lock();
        if cache.len() >= BITMAP_CACHE_BLOCKS {
            cache.clear();
        }
        cache.insert((kind, group), bitmap.clone());
        Ok(bitmap)
    }

    fn bit_set(bitmap: &[u8], index: u64) -> bool {
        bitmap
            .get((index / 8) as usize)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// Returns true if the inode bitmap marks `ino` as allocated.
    pub fn inode_in_use(&self, ino: u32) -> std::result::Result<bool, ExtError> {
        if ino == 0 || ino > self.sb.inodes_count() {
            return Err(ExtError::InvalidInode(ino));
        }
        let group = (ino - 1) / self.sb.inodes_per_group();
        let index = (ino - 1) % self.sb.inodes_per_group();
        if self.groups[group as usize].inode_uninit() {
            return Ok(false);
        }
        Ok(Self::bit_set(&self.bitmap(Bitmap::Inode, group)?, index as u64))
    }

    /// Returns true if the block bitmap marks `block` as allocated.
    pub fn block_in_use(&self, block: u64) -> std::result::Result<bool, ExtError> {
        let first = self.sb.first_data_block() as u64;
        if block < first {
            return Ok(true);
        }
        let group = (block - first) / self.sb.blocks_per_group() as u64;
        let index = (block - first) % self.sb.blocks_per_group() as u64;
        let Some(desc) = self.groups.get(group as usize) else {
            return Ok(true);
        };
        if desc.block_uninit() {
            return Ok(false);
        }
        Ok(Self::bit_set(&self.bitmap(Bitmap::Block, group as u32)?, index))
    }

    /// Builds the content map of inode `ino`.
    fn map_inode(&self, ino: u32, inode: &Inode) -> std::result::Result<ContentMap, ExtError> {
        let size = inode.size();

        if inode.has_inline_data() || inode.is_fast_symlink() {
            let len = (size as usize).min(I_BLOCK_SIZE);
            return Ok(ContentMap::inline(&inode.block_area()[..len]));
        }

        let mut extents = vec![];
        if inode.uses_extents() {
            let mut visited = HashSet::new();
            self.walk_extent_node(ino, inode.block_area(), MAX_TREE_DEPTH, &mut visited, &mut extents)?;
        } else {
            self.walk_block_map(ino, inode, &mut extents)?;
        }
        Ok(ContentMap::new(extents, size))
    }

    fn walk_extent_node(
        &self,
        ino: u32,
        node: &[u8],
        budget: u16,
        visited: &mut HashSet<u64>,
        out: &mut Vec<Extent>,
    ) -> std::result::Result<(), ExtError> {
        let corrupt = |detail: String| ExtError::InvalidExtentTree { inode: ino, detail };
        let bs = self.block_size();

        match parse_extent_node(node).map_err(corrupt)? {
            ExtentNode::Leaves(leaves) => {
                for leaf in leaves {
                    if leaf.len() == 0 {
                        continue;
                    }
                    let kind = if leaf.is_unwritten() {
                        ExtentKind::Sparse
                    } else {
                        self.check_block(ino, leaf.start(), leaf.len())?;
                        ExtentKind::Mapped {
                            physical: leaf.start() * bs,
                        }
                    };
                    out.push(Extent {
                        logical: leaf.block as u64 * bs,
                        length: leaf.len() * bs,
                        kind,
                    });
                }
            }
            ExtentNode::Indexes(depth, indexes) => {
                if depth >= budget {
                    return Err(corrupt(format!("depth {depth} exceeds {budget}")));
                }
                for index in indexes {
                    self.check_block(ino, index.leaf(), 1)?;
                    if !visited.insert(index.leaf()) {
                        return Err(corrupt(format!("block {} referenced twice", index.leaf())));
                    }
                    let child = self.read_block(index.leaf())?;
                    self.walk_extent_node(ino, &child, depth, visited, out)?;
                }
            }
        }
        Ok(())
    }

    /// Appends `physical` as block `logical` of the file, extending the last extent when contiguous.
    fn push_block(&self, out: &mut Vec<Extent>, logical: u64, physical: u64) {
        let bs = self.block_size();
        if let Some(last) = out.last_mut() {
            if let ExtentKind::Mapped { physical: start } = last.kind {
                if last.logical + last.length == logical * bs && start + last.length == physical * bs {
                    last.length += bs;
                    return;
                }
            }
        }
        out.push(Extent {
            logical: logical * bs,
            length: bs,
            kind: ExtentKind::Mapped {
                physical: physical * bs,
            },
        });
    }

    fn walk_block_map(&self, ino: u32, inode: &Inode, out: &mut Vec<Extent>) -> std::result::Result<(), ExtError> {
        let nblocks = inode.size().div_ceil(self.block_size());
        let per_block = self.block_size() / 4;
        let pointers = inode.block_pointers();

        for (logical, &ptr) in pointers.iter().take(12).enumerate() {
            if logical as u64 >= nblocks {
                return Ok(());
            }
            if ptr != 0 {
                self.check_block(ino, ptr as u64, 1)?;
                self.push_block(out, logical as u64, ptr as u64);
            }
        }

        let mut start = 12u64;
        for (level, &ptr) in [(1u32, &pointers[12]), (2, &pointers[13]), (3, &pointers[14])] {
            if start >= nblocks {
                break;
            }
            if ptr != 0 {
                self.walk_indirect(ino, ptr as u64, level, start, nblocks, out)?;
            }
            start += per_block.pow(level);
        }
        Ok(())
    }

    fn walk_indirect(
        &self,
        ino: u32,
        block: u64,
        level: u32,
        start: u64,
        nblocks: u64,
        out: &mut Vec<Extent>,
    ) -> std::result::Result<(), ExtError> {
        self.check_block(ino, block, 1)?;
        let buf = self.read_block(block)?;
        let per_block = self.block_size() / 4;
        let span = per_block.pow(level - 1);

        for i in 0..per_block {
            let logical = start + i * span;
            if logical >= nblocks {
                break;
            }
            let ptr = u32_at(&buf, (i * 4) as usize) as u64;
            if ptr == 0 {
                continue;
            }
            if level == 1 {
                self.check_block(ino, ptr, 1)?;
                self.push_block(out, logical, ptr);
            } else {
                self.walk_indirect(ino, ptr, level - 1, logical, nblocks, out)?;
            }
        }
        Ok(())
    }

    /// Cuts the map of a removed file where its recoverable prefix ends: at the
    /// first hole or at the first block allocated again.
    fn recoverable_prefix(&self, map: ContentMap) -> std::result::Result<Option<ContentMap>, ExtError> {
        let bs = self.block_size();
        let mut covered = 0;

        'extents: for extent in map.extents() {
            let ExtentKind::Mapped { physical } = extent.kind else {
                break;
            };
            if extent.logical != covered {
                break;
            }
            // The last extent is clipped to the file size; its partial block counts
            for i in 0..extent.length.div_ceil(bs) {
                if self.block_in_use(physical / bs + i)? {
                    covered += i * bs;
                    break 'extents;
                }
            }
            covered += extent.length;
        }

        let length = covered.min(map.len());
        if length == 0 && !map.is_empty() {
            return Ok(None);
        }
        Ok(Some(map.truncate(length)))
    }

    fn timestamps(inode: &Inode) -> Timestamps {
        Timestamps {
            created: inode.created(),
            modified: inode.modified(),
            accessed: inode.accessed(),
            changed: inode.changed(),
            deleted: inode.deleted(),
        }
    }

    fn describe(attributes: &mut Attributes, ino: u32, inode: &Inode) {
        attributes.set("inode", ino);
        attributes.set("mode", inode.permissions());
        attributes.set("uid", inode.uid());
        attributes.set("gid", inode.gid());
        attributes.set("links", inode.links_count());
        attributes.set("flags", format!("0x{:X}", inode.flags()));
        if inode.is_fast_symlink() {
            let len = (inode.size() as usize).min(I_BLOCK_SIZE);
            attributes.set(
                "symlink_target",
                String::from_utf8_lossy(&inode.block_area()[..len]).to_string(),
            );
        }
    }

    fn record(
        &self,
        offset: u64,
        rec: &DirRecord,
        deleted: bool,
    ) -> std::result::Result<EntryRecord, ExtError> {
        let inode = self.read_inode(rec.inode)?;
        let is_folder = inode.is_dir() || (inode.mode() == 0 && rec.file_type == FT_DIR);

        let mut record = EntryRecord::new(EntryId(offset), &rec.name, is_folder);
        record.size = if is_folder { 0 } else { inode.size() };
        record.deleted = deleted;
        record.storage = Some(rec.inode as u64);
        record.timestamps = Self::timestamps(&inode);

        // The name survived but its inode describes another object now
        if deleted && self.inode_in_use(rec.inode)? {
            record.reallocated = true;
        }

        Self::describe(&mut record.attributes, rec.inode, &inode);
        record.attributes.set("record_offset", offset);
        Ok(record)
    }

    /// Decodes the records of one directory block.
    ///
    /// Live records come first in each slot; a slot whose `rec_len` is larger
    /// than its record needs is scanned for removed records at 4-byte steps.
    fn parse_dir_block(
        &self,
        buf: &[u8],
        base: u64,
        skip_slack: bool,
        deleted: bool,
        out: &mut Vec<(u64, DirRecord, bool)>,
    ) {
        let mut pos = 0;
        while let Some(rec) = DirRecord::parse(buf, pos) {
            let rec_len = rec.rec_len as usize;
            if rec_len < 8 || rec_len % 4 != 0 || pos + rec_len > buf.len() {
                debug!("Directory record at byte {} has rec_len {rec_len}", base + pos as u64);
                break;
            }

            if rec.inode != 0 && rec.name_len > 0 && !rec.is_dot() {
                out.push((base + pos as u64, rec.clone(), deleted));
            }

            let index_node = rec.inode == 0 && rec.name_len == 0 && rec_len == buf.len();
            if !(skip_slack || index_node) {
                let end = pos + rec_len;
                let mut slack = pos + rec.needed_len().max(8);
                while slack + 8 <= end {
                    match DirRecord::parse(&buf[..end], slack) {
                        Some(lost) if lost.plausible_deleted(end - slack, self.sb.inodes_count()) && !lost.is_dot() => {
                            let at = slack;
                            slack += lost.needed_len();
                            out.push((base + at as u64, lost, true));
                        }
                        _ => slack += 4,
                    }
                }
            }

            pos += rec_len;
        }
    }

    fn dir_records(&self, folder: &EntryRecord, ino: u32) -> std::result::Result<Vec<(u64, DirRecord, bool)>, ExtError> {
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Ok(vec![]);
        }

        let mut out = vec![];
        if inode.has_inline_data() {
            let base = self.inode_offset(ino)? + I_BLOCK_OFFSET + INLINE_DIR_OFFSET as u64;
            self.parse_dir_block(&inode.block_area()[INLINE_DIR_OFFSET..], base, false, folder.deleted, &mut out);
            return Ok(out);
        }

        let mut map = self.map_inode(ino, &inode)?;
        if folder.deleted {
            match self.recoverable_prefix(map)? {
                Some(prefix) => map = prefix,
                None => return Ok(out),
            }
        }

        let bs = self.block_size();
        for extent in map.extents() {
            let ExtentKind::Mapped { physical } = extent.kind else {
                continue;
            };
            for i in 0..extent.length.div_ceil(bs) {
                let logical = extent.logical / bs + i;
                if logical * bs >= map.len() {
                    break;
                }
                let offset = physical + i * bs;
                let buf = self.read_block(offset / bs)?;
                let index_root = inode.is_indexed() && logical == 0;
                self.parse_dir_block(&buf, offset, index_root, folder.deleted, &mut out);
            }
        }
        Ok(out)
    }
}

impl FsBackend for ExtVol {
    fn meta(&self) -> &FilesystemMeta {
        &self.meta
    }

    fn root(&self) -> EntryRecord {
        self.root.clone()
    }

    fn read_dir(&self, folder: &EntryRecord) -> Result<Vec<EntryRecord>> {
        let Some(ino) = folder.storage.map(|i| i as u32) else {
            return Ok(vec![]);
        };
        if folder.reallocated || (folder.deleted && self.inode_in_use(ino)?) {
            return Ok(vec![]);
        }

        let mut records = vec![];
        for (offset, rec, deleted) in self.dir_records(folder, ino)? {
            match self.record(offset, &rec, deleted) {
                Ok(record) => records.push(record),
                Err(ExtError::Source(err)) if err.is_fatal() => return Err(err),
                Err(err) => warn!("Skipping \"{}\" (inode {}): {err}", rec.name, rec.inode),
            }
        }
        Ok(records)
    }

    fn content(&self, entry: &EntryRecord) -> Result<Option<ContentMap>> {
        if entry.is_folder {
            return Ok(None);
        }
        let Some(ino) = entry.storage.map(|i| i as u32) else {
            return Ok(None);
        };
        if entry.deleted && self.inode_in_use(ino)? {
            return Ok(None);
        }

        let inode = self.read_inode(ino)?;
        let map = self.map_inode(ino, &inode)?;
        if entry.deleted {
            return Ok(self.recoverable_prefix(map)?);
        }
        Ok(Some(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ImageSource;

    const BS: usize = 1024;
    const INODE_SIZE: usize = 128;
    /// Block of the inode table
    const ITABLE: usize = 5;

    fn put_inode(img: &mut [u8], ino: usize, mode: u16, size: u32, blocks: &[u32]) {
        let at = ITABLE * BS + (ino - 1) * INODE_SIZE;
        img[at..at + 2].copy_from_slice(&mode.to_le_bytes());
        img[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
        img[at + 16..at + 20].copy_from_slice(&1_700_000_000u32.to_le_bytes());
        img[at + 26..at + 28].copy_from_slice(&1u16.to_le_bytes());
        for (i, b) in blocks.iter().enumerate() {
            let p = at + 40 + i * 4;
            img[p..p + 4].copy_from_slice(&b.to_le_bytes());
        }
    }

    fn put_record(img: &mut [u8], at: usize, ino: u32, rec_len: u16, name: &str, ft: u8) {
        img[at..at + 4].copy_from_slice(&ino.to_le_bytes());
        img[at + 4..at + 6].copy_from_slice(&rec_len.to_le_bytes());
        img[at + 6] = name.len() as u8;
        img[at + 7] = ft;
        img[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
    }

    fn set_bit(img: &mut [u8], bitmap_block: usize, index: usize) {
        img[bitmap_block * BS + index / 8] |= 1 << (index % 8);
    }

    /// A 256-block ext2 volume with 1 KiB blocks and 64 inodes.
    ///
    /// Root (inode 2, block 20) holds `notes.txt` (inode 12, block 21) and the
    /// removed `gone.txt` (inode 13, blocks 22-23) in the slack of `notes.txt`.
    fn ext2_image() -> Vec<u8> {
        let mut img = vec![0u8; 256 * BS];
        let sb = BS;
        img[sb..sb + 4].copy_from_slice(&64u32.to_le_bytes());
        img[sb + 4..sb + 8].copy_from_slice(&256u32.to_le_bytes());
        img[sb + 12..sb + 16].copy_from_slice(&200u32.to_le_bytes());
        img[sb + 20..sb + 24].copy_from_slice(&1u32.to_le_bytes());
        img[sb + 32..sb + 36].copy_from_slice(&8192u32.to_le_bytes());
        img[sb + 40..sb + 44].copy_from_slice(&64u32.to_le_bytes());
        img[sb + 56..sb + 58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        img[sb + 58] = 1;
        img[sb + 76..sb + 80].copy_from_slice(&1u32.to_le_bytes());
        img[sb + 84..sb + 88].copy_from_slice(&11u32.to_le_bytes());
        img[sb + 88..sb + 90].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
        img[sb + 96..sb + 100].copy_from_slice(&0x2u32.to_le_bytes());
        img[sb + 120..sb + 124].copy_from_slice(b"case");

        // Group descriptor: block bitmap 3, inode bitmap 4, inode table 5
        let gd = 2 * BS;
        img[gd..gd + 4].copy_from_slice(&3u32.to_le_bytes());
        img[gd + 4..gd + 8].copy_from_slice(&4u32.to_le_bytes());
        img[gd + 8..gd + 12].copy_from_slice(&(ITABLE as u32).to_le_bytes());

        for block in 1..=21 {
            set_bit(&mut img, 3, block - 1);
        }
        for ino in [1, 2, 11, 12] {
            set_bit(&mut img, 4, ino - 1);
        }

        put_inode(&mut img, 2, 0x41ED, BS as u32, &[20]);
        put_inode(&mut img, 12, 0x81A4, 6, &[21]);
        put_inode(&mut img, 13, 0x81A4, 1500, &[22, 23]);

        let root = 20 * BS;
        put_record(&mut img, root, 2, 12, ".", 2);
        put_record(&mut img, root + 12, 2, 12, "..", 2);
        put_record(&mut img, root + 24, 12, (BS - 24) as u16, "notes.txt", 1);
        put_record(&mut img, root + 44, 13, (BS - 44) as u16, "gone.txt", 1);

        img[21 * BS..21 * BS + 6].copy_from_slice(b"notes\n");
        img[22 * BS..24 * BS].fill(b'g');
        img
    }

    fn open(img: Vec<u8>) -> ExtVol {
        let range = BlockRange::new(Arc::new(ImageSource::from_bytes("ext2", img, 512)));
        match ExtDriver.probe(&range, &DetectOptions::default()).unwrap() {
            Probe::Accepted(_) => {}
            Probe::Declined => panic!("ext2 image declined"),
        }
        let sb = Superblock::from_range(&range).unwrap().validate(range.size()).unwrap();
        ExtVol::new(range, sb).unwrap()
    }

    fn by_name<'a>(records: &'a [EntryRecord], name: &str) -> &'a EntryRecord {
        records.iter().find(|r| r.name == name).unwrap()
    }

    #[test]
    fn volume_metadata() {
        let vol = open(ext2_image());
        assert_eq!(vol.meta().fs_type(), crate::filesystem::FsType::Ext2);
        assert_eq!(vol.meta().label().as_deref(), Some("case"));
        assert_eq!(vol.meta().free_space(), Some(200 * BS as u64));
        assert_eq!(vol.root().storage, Some(2));
    }

    #[test]
    fn lists_live_and_removed_records() {
        let vol = open(ext2_image());
        let entries = vol.read_dir(&vol.root()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt", "gone.txt"]);

        let notes = by_name(&entries, "notes.txt");
        assert!(!notes.deleted);
        assert_eq!(notes.size, 6);
        assert_eq!(notes.id, EntryId((20 * BS + 24) as u64));

        let gone = by_name(&entries, "gone.txt");
        assert!(gone.deleted && !gone.reallocated);
        assert_eq!(gone.size, 1500);
    }

    #[test]
    fn removed_content_stops_at_reused_blocks() {
        let mut img = ext2_image();
        let vol = open(img.clone());
        let entries = vol.read_dir(&vol.root()).unwrap();
        let map = vol.content(by_name(&entries, "gone.txt")).unwrap().unwrap();
        assert_eq!(map.read_at(&vol.range, 0, 4096).unwrap(), vec![b'g'; 1500]);

        // Block 23 is allocated again
        set_bit(&mut img, 3, 22);
        let vol = open(img);
        let entries = vol.read_dir(&vol.root()).unwrap();
        let map = vol.content(by_name(&entries, "gone.txt")).unwrap().unwrap();
        assert_eq!(map.len(), BS as u64);
    }

    #[test]
    fn reused_inode_marks_the_name_reallocated() {
        let mut img = ext2_image();
        set_bit(&mut img, 4, 12);
        let vol = open(img);
        let entries = vol.read_dir(&vol.root()).unwrap();
        let gone = by_name(&entries, "gone.txt");
        assert!(gone.deleted && gone.reallocated);
        assert!(vol.content(gone).unwrap().is_none());
    }

    #[test]
    fn live_content_is_mapped() {
        let vol = open(ext2_image());
        let entries = vol.read_dir(&vol.root()).unwrap();
        let map = vol.content(by_name(&entries, "notes.txt")).unwrap().unwrap();
        assert_eq!(map.read_at(&vol.range, 0, 100).unwrap(), b"notes\n");
    }

    #[test]
    fn indirect_blocks_are_followed() {
        let mut img = ext2_image();
        // 14 blocks: 12 direct (30..42), then one indirect block (50) listing 60 and 61
        let direct: Vec<u32> = (30..42).chain([50]).collect();
        put_inode(&mut img, 14, 0x81A4, 14 * BS as u32, &direct);
        img[50 * BS..50 * BS + 4].copy_from_slice(&60u32.to_le_bytes());
        img[50 * BS + 4..50 * BS + 8].copy_from_slice(&61u32.to_le_bytes());

        let vol = open(img);
        let inode = vol.read_inode(14).unwrap();
        let map = vol.map_inode(14, &inode).unwrap();
        assert_eq!(map.extents().len(), 2);
        assert_eq!(map.extents()[1].logical, 12 * BS as u64);
        assert_eq!(map.len(), 14 * BS as u64);
    }

    #[test]
    fn pointers_outside_the_volume_are_rejected() {
        let mut img = ext2_image();
        put_inode(&mut img, 14, 0x81A4, 10, &[5000]);
        let vol = open(img);
        let inode = vol.read_inode(14).unwrap();
        assert!(matches!(
            vol.map_inode(14, &inode),
            Err(ExtError::InvalidBlock { inode: 14, block: 5000 })
        ));
    }

    #[test]
    fn zeroed_block_is_declined() {
        let range = BlockRange::new(Arc::new(ImageSource::from_bytes("zero", vec![0; 4096], 512)));
        assert!(!ExtDriver.probe(&range, &DetectOptions::default()).unwrap().is_accepted());
    }
}
