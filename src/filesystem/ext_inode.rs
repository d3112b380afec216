//! ext inodes, extent tree nodes and directory records.

use binread::{BinRead, BinReaderExt};
use chrono::NaiveDateTime;
use getset::CopyGetters;
use std::io;

use super::ext_error::ExtError;
use crate::utils::{self, u16_at, u32_at};

pub const ROOT_INODE: u32 = 2;

pub const S_IFMT: u16 = 0xF000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFLNK: u16 = 0xA000;

pub const INDEX_FL: u32 = 0x0000_1000;
pub const HUGE_FILE_FL: u32 = 0x0004_0000;
pub const EXTENTS_FL: u32 = 0x0008_0000;
pub const INLINE_DATA_FL: u32 = 0x1000_0000;

pub const EXTENT_MAGIC: u16 = 0xF30A;
/// Extents longer than this are preallocated but unwritten.
pub const EXTENT_INIT_MAX_LEN: u16 = 32768;

/// Bytes of `i_block`, the block map / extent root / inline area.
pub const I_BLOCK_SIZE: usize = 60;

/// The 128-byte base of an inode record.
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
pub struct Inode {
    #[get_copy = "pub"]
    mode: u16,
    uid_lo: u16,
    size_lo: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    #[get_copy = "pub"]
    dtime: u32,
    gid_lo: u16,
    #[get_copy = "pub"]
    links_count: u16,
    blocks_lo: u32,
    #[get_copy = "pub"]
    flags: u32,
    osd1: u32,
    #[br(count = I_BLOCK_SIZE)]
    block: Vec<u8>,
    generation: u32,
    file_acl_lo: u32,
    size_high: u32,
    obso_faddr: u32,
    blocks_hi: u16,
    file_acl_hi: u16,
    uid_hi: u16,
    gid_hi: u16,
    checksum_lo: u16,
    reserved: u16,
    /// Fields past the base record, decoded when the record carries them
    #[br(ignore)]
    extra: InodeExtra,
}

/// Nanosecond and epoch extensions of the timestamps, plus the creation time.
#[derive(Debug, Clone, Copy, Default)]
struct InodeExtra {
    ctime_extra: u32,
    mtime_extra: u32,
    atime_extra: u32,
    crtime: u32,
    crtime_extra: u32,
}

impl Inode {
    /// Decodes a full inode record (`inode_size` bytes).
    pub fn from_bytes(buf: &[u8]) -> Result<Inode, ExtError> {
        let mut reader = io::Cursor::new(buf);
        let mut inode: Inode = reader.read_le()?;

        if buf.len() > 130 {
            let extra_isize = u16_at(buf, 128) as usize;
            let end = (128 + extra_isize).min(buf.len());
            let field = |off: usize| if off + 4 <= end { u32_at(buf, off) } else { 0 };
            inode.extra = InodeExtra {
                ctime_extra: field(132),
                mtime_extra: field(136),
                atime_extra: field(140),
                crtime: field(144),
                crtime_extra: field(148),
            };
        }
        Ok(inode)
    }

    pub fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    pub fn size(&self) -> u64 {
        ((self.size_high as u64) << 32) | self.size_lo as u64
    }

    pub fn uid(&self) -> u32 {
        ((self.uid_hi as u32) << 16) | self.uid_lo as u32
    }

    pub fn gid(&self) -> u32 {
        ((self.gid_hi as u32) << 16) | self.gid_lo as u32
    }

    pub fn uses_extents(&self) -> bool {
        self.flags & EXTENTS_FL != 0
    }

    pub fn has_inline_data(&self) -> bool {
        self.flags & INLINE_DATA_FL != 0
    }

    pub fn is_indexed(&self) -> bool {
        self.flags & INDEX_FL != 0
    }

    /// The raw 60-byte `i_block` area.
    pub fn block_area(&self) -> &[u8] {
        &self.block
    }

    /// Symlinks shorter than 60 bytes keep their target in `i_block`.
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink()
            && self.size() < I_BLOCK_SIZE as u64
            && !self.uses_extents()
            && !self.has_inline_data()
            && self.data_blocks() == 0
    }

    /// 512-byte sectors charged to the inode, extended attribute block excluded.
    fn data_blocks(&self) -> u64 {
        let sectors = ((self.blocks_hi as u64) << 32) | self.blocks_lo as u64;
        let acl = ((self.file_acl_hi as u64) << 32) | self.file_acl_lo as u64;
        if acl != 0 { sectors.saturating_sub(8) } else { sectors }
    }

    /// The 15 block pointers of a block-mapped inode.
    pub fn block_pointers(&self) -> Vec<u32> {
        (0..15).map(|i| u32_at(&self.block, i * 4)).collect()
    }

    pub fn accessed(&self) -> Option<NaiveDateTime> {
        timestamp(self.atime, self.extra.atime_extra)
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        timestamp(self.mtime, self.extra.mtime_extra)
    }

    pub fn changed(&self) -> Option<NaiveDateTime> {
        timestamp(self.ctime, self.extra.ctime_extra)
    }

    pub fn created(&self) -> Option<NaiveDateTime> {
        timestamp(self.extra.crtime, self.extra.crtime_extra)
    }

    pub fn deleted(&self) -> Option<NaiveDateTime> {
        timestamp(self.dtime, 0)
    }

    /// The permission bits in octal, e.g. `0644`.
    pub fn permissions(&self) -> String {
        format!("{:04o}", self.mode & 0o7777)
    }
}

/// Combines a 32-bit seconds field with its extension word: the two low bits
/// extend the epoch, the other 30 carry nanoseconds.
fn timestamp(seconds: u32, extra: u32) -> Option<NaiveDateTime> {
    let seconds = seconds as i32 as i64 + (((extra & 0x3) as i64) << 32);
    utils::unix_datetime(seconds, extra >> 2)
}

/// Header of an extent tree node.
#[derive(BinRead, Debug, Clone, Copy, CopyGetters)]
#[br(little)]
#[getset(get_copy = "pub")]
pub struct ExtentHeader {
    magic: u16,
    entries: u16,
    max: u16,
    depth: u16,
    generation: u32,
}

/// Leaf entry: a run of contiguous blocks.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct ExtentLeaf {
    pub block: u32,
    len: u16,
    start_hi: u16,
    start_lo: u32,
}

impl ExtentLeaf {
    pub fn start(&self) -> u64 {
        ((self.start_hi as u64) << 32) | self.start_lo as u64
    }

    pub fn is_unwritten(&self) -> bool {
        self.len > EXTENT_INIT_MAX_LEN
    }

    pub fn len(&self) -> u64 {
        if self.is_unwritten() {
            (self.len - EXTENT_INIT_MAX_LEN) as u64
        } else {
            self.len as u64
        }
    }
}

/// Index entry: points to the node covering blocks from `block` on.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct ExtentIndex {
    pub block: u32,
    leaf_lo: u32,
    leaf_hi: u16,
    unused: u16,
}

impl ExtentIndex {
    pub fn leaf(&self) -> u64 {
        ((self.leaf_hi as u64) << 32) | self.leaf_lo as u64
    }
}

/// A decoded extent tree node.
pub enum ExtentNode {
    Leaves(Vec<ExtentLeaf>),
    Indexes(u16, Vec<ExtentIndex>),
}

/// Decodes an extent tree node from `buf` (the `i_block` area or a tree block).
pub fn parse_extent_node(buf: &[u8]) -> Result<ExtentNode, String> {
    let mut reader = io::Cursor::new(buf);
    let header: ExtentHeader = reader.read_le().map_err(|e| e.to_string())?;
    if header.magic != EXTENT_MAGIC {
        return Err(format!("bad node magic 0x{:04X}", header.magic));
    }
    if header.entries > header.max || 12 + header.entries as usize * 12 > buf.len() {
        return Err(format!("{} entries in a node of {}", header.entries, header.max));
    }

    if header.depth == 0 {
        let leaves = (0..header.entries)
            .map(|_| reader.read_le::<ExtentLeaf>())
            .collect::<binread::BinResult<Vec<_>>>()
            .map_err(|e| e.to_string())?;
        Ok(ExtentNode::Leaves(leaves))
    } else {
        let indexes = (0..header.entries)
            .map(|_| reader.read_le::<ExtentIndex>())
            .collect::<binread::BinResult<Vec<_>>>()
            .map_err(|e| e.to_string())?;
        Ok(ExtentNode::Indexes(header.depth, indexes))
    }
}

/// A raw `ext4_dir_entry_2` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub name: String,
    pub file_type: u8,
}

/// Size of the record header preceding the name.
pub const DIR_RECORD_HEADER: usize = 8;

pub const FT_DIR: u8 = 2;

impl DirRecord {
    /// Decodes the record at `buf[pos..]`, or `None` when the header does not fit.
    pub fn parse(buf: &[u8], pos: usize) -> Option<DirRecord> {
        if pos + DIR_RECORD_HEADER > buf.len() {
            return None;
        }
        let name_len = buf[pos + 6];
        let name_end = (pos + DIR_RECORD_HEADER + name_len as usize).min(buf.len());
        Some(DirRecord {
            inode: u32_at(buf, pos),
            rec_len: u16_at(buf, pos + 4),
            name_len,
            name: String::from_utf8_lossy(&buf[pos + DIR_RECORD_HEADER..name_end]).to_string(),
            file_type: buf[pos + 7],
        })
    }

    /// Bytes the record needs: header plus name, rounded to 4.
    pub fn needed_len(&self) -> usize {
        (DIR_RECORD_HEADER + self.name_len as usize).next_multiple_of(4)
    }

    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// Checks whether leftover bytes plausibly hold a removed record.
    pub fn plausible_deleted(&self, available: usize, inodes_count: u32) -> bool {
        self.inode != 0
            && self.inode <= inodes_count
            && self.name_len > 0
            && self.name.len() == self.name_len as usize
            && self.needed_len() <= available
            && self.rec_len as usize >= DIR_RECORD_HEADER
            && self.rec_len % 4 == 0
            && self.file_type <= 7
            && !self.name.contains(['/', '\0', char::REPLACEMENT_CHARACTER])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_inode(mode: u16, size: u32, flags: u32) -> Vec<u8> {
        let mut raw = vec![0u8; 256];
        raw[0..2].copy_from_slice(&mode.to_le_bytes());
        raw[4..8].copy_from_slice(&size.to_le_bytes());
        raw[16..20].copy_from_slice(&1_600_000_000u32.to_le_bytes());
        raw[32..36].copy_from_slice(&flags.to_le_bytes());
        raw[128..130].copy_from_slice(&32u16.to_le_bytes());
        raw[136..140].copy_from_slice(&(500u32 << 2).to_le_bytes());
        raw
    }

    #[test]
    fn decodes_base_and_extra_fields() {
        let inode = Inode::from_bytes(&raw_inode(S_IFREG | 0o644, 100, 0)).unwrap();
        assert!(!inode.is_dir());
        assert_eq!(inode.size(), 100);
        assert_eq!(inode.permissions(), "0644");
        let mtime = inode.modified().unwrap();
        assert_eq!(mtime.and_utc().timestamp(), 1_600_000_000);
        assert_eq!(mtime.and_utc().timestamp_subsec_nanos(), 500);
        assert!(inode.created().is_none());
    }

    #[test]
    fn fast_symlinks_live_in_the_inode() {
        let mut raw = raw_inode(S_IFLNK | 0o777, 11, 0);
        raw[40..51].copy_from_slice(b"/etc/passwd");
        let inode = Inode::from_bytes(&raw).unwrap();
        assert!(inode.is_fast_symlink());
        assert_eq!(&inode.block_area()[..11], b"/etc/passwd");
    }

    #[test]
    fn extent_nodes() {
        let mut buf = vec![0u8; 60];
        buf[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        buf[2..4].copy_from_slice(&1u16.to_le_bytes());
        buf[4..6].copy_from_slice(&4u16.to_le_bytes());
        buf[12..16].copy_from_slice(&0u32.to_le_bytes());
        buf[16..18].copy_from_slice(&(EXTENT_INIT_MAX_LEN + 3).to_le_bytes());
        buf[20..24].copy_from_slice(&900u32.to_le_bytes());

        match parse_extent_node(&buf).unwrap() {
            ExtentNode::Leaves(leaves) => {
                assert_eq!(leaves.len(), 1);
                assert!(leaves[0].is_unwritten());
                assert_eq!(leaves[0].len(), 3);
                assert_eq!(leaves[0].start(), 900);
            }
            ExtentNode::Indexes(..) => panic!("expected a leaf node"),
        }

        buf[0] = 0;
        assert!(parse_extent_node(&buf).is_err());
    }

    #[test]
    fn directory_records() {
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&12u32.to_le_bytes());
        buf[4..6].copy_from_slice(&32u16.to_le_bytes());
        buf[6] = 5;
        buf[7] = 1;
        buf[8..13].copy_from_slice(b"a.txt");

        let rec = DirRecord::parse(&buf, 0).unwrap();
        assert_eq!(rec.name, "a.txt");
        assert_eq!(rec.needed_len(), 16);
        assert!(rec.plausible_deleted(32, 100));
        assert!(!rec.plausible_deleted(32, 10));
        assert!(DirRecord::parse(&buf, 28).is_none());
    }
}
