//! ext2/3/4 superblock and block group descriptors.
//!
//! The superblock sits 1024 bytes into the volume whatever the block size.
//! Group descriptors follow in the block after the one holding the superblock,
//! 32 bytes each, or `desc_size` bytes on 64-bit volumes.

use binread::{BinRead, BinReaderExt};
use getset::{CopyGetters, Getters};
use std::io;

use super::ext_error::ExtError;
use super::FsType;
use crate::block::BlockRange;
use crate::utils::{self, u16_at, u32_at};

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT_MAGIC: u16 = 0xEF53;

pub const COMPAT_HAS_JOURNAL: u32 = 0x0004;

pub const INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const INCOMPAT_META_BG: u32 = 0x0010;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const INCOMPAT_INLINE_DATA: u32 = 0x8000;
pub const INCOMPAT_ENCRYPT: u32 = 0x1_0000;
pub const INCOMPAT_CASEFOLD: u32 = 0x2_0000;

/// Incompatible features that change how metadata must be read.
pub const INCOMPAT_UNSUPPORTED: u32 =
    INCOMPAT_COMPRESSION | INCOMPAT_JOURNAL_DEV | INCOMPAT_META_BG | INCOMPAT_ENCRYPT | INCOMPAT_CASEFOLD;

/// Group flags
pub const BG_INODE_UNINIT: u16 = 0x0001;
pub const BG_BLOCK_UNINIT: u16 = 0x0002;

/// The leading fields of the ext superblock.
#[derive(BinRead, Debug, Clone, Getters, CopyGetters)]
#[br(little)]
pub struct Superblock {
    #[get_copy = "pub"]
    inodes_count: u32,
    blocks_count_lo: u32,
    r_blocks_count_lo: u32,
    free_blocks_count_lo: u32,
    #[get_copy = "pub"]
    free_inodes_count: u32,
    #[get_copy = "pub"]
    first_data_block: u32,
    /// Block size is 1024 << log_block_size
    log_block_size: u32,
    log_cluster_size: u32,
    #[get_copy = "pub"]
    blocks_per_group: u32,
    clusters_per_group: u32,
    #[get_copy = "pub"]
    inodes_per_group: u32,
    /// Last mount time
    #[get_copy = "pub"]
    mtime: u32,
    /// Last write time
    #[get_copy = "pub"]
    wtime: u32,
    mnt_count: u16,
    max_mnt_count: u16,
    #[get_copy = "pub"]
    magic: u16,
    #[get_copy = "pub"]
    state: u16,
    errors: u16,
    minor_rev_level: u16,
    lastcheck: u32,
    #[get_copy = "pub"]
    creator_os: u32,
    checkinterval: u32,
    #[get_copy = "pub"]
    rev_level: u32,
    def_resuid: u16,
    def_resgid: u16,
    /// First non-reserved inode (rev 1)
    first_ino: u32,
    /// Inode record size (rev 1)
    inode_size_raw: u16,
    block_group_nr: u16,
    #[get_copy = "pub"]
    feature_compat: u32,
    #[get_copy = "pub"]
    feature_incompat: u32,
    #[get_copy = "pub"]
    feature_ro_compat: u32,
    #[get = "pub"]
    uuid: [u8; 16],
    volume_name: [u8; 16],
    #[br(count = 64)]
    last_mounted: Vec<u8>,
    /// Group descriptor size on 64-bit volumes
    #[br(pad_before = 54)]
    desc_size_raw: u16,
    /// Filesystem creation time
    #[br(pad_before = 8)]
    #[get_copy = "pub"]
    mkfs_time: u32,
    #[br(pad_before = 68)]
    blocks_count_hi: u32,
    r_blocks_count_hi: u32,
    free_blocks_count_hi: u32,
}

impl Superblock {
    /// Reads the superblock of the volume starting at `range`, without validating it.
    pub fn from_range(range: &BlockRange) -> Result<Superblock, ExtError> {
        let buf = range.read_exact(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        Self::from_bytes(&buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Superblock, ExtError> {
        let mut reader = io::Cursor::new(buf);
        Ok(reader.read_le()?)
    }

    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & INCOMPAT_64BIT != 0
    }

    pub fn has_incompat(&self, mask: u32) -> bool {
        self.feature_incompat & mask != 0
    }

    pub fn block_size(&self) -> u64 {
        1024u64 << self.log_block_size.min(6)
    }

    pub fn blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { self.blocks_count_hi as u64 } else { 0 };
        (hi << 32) | self.blocks_count_lo as u64
    }

    pub fn free_blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { self.free_blocks_count_hi as u64 } else { 0 };
        (hi << 32) | self.free_blocks_count_lo as u64
    }

    pub fn reserved_blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() { self.r_blocks_count_hi as u64 } else { 0 };
        (hi << 32) | self.r_blocks_count_lo as u64
    }

    pub fn inode_size(&self) -> u16 {
        if self.rev_level == 0 { 128 } else { self.inode_size_raw }
    }

    pub fn first_ino(&self) -> u32 {
        if self.rev_level == 0 { 11 } else { self.first_ino }
    }

    pub fn desc_size(&self) -> u16 {
        if self.is_64bit() { self.desc_size_raw } else { 32 }
    }

    fn groups_needed(&self) -> u64 {
        let data_blocks = self.blocks_count().saturating_sub(self.first_data_block as u64);
        data_blocks.div_ceil(self.blocks_per_group.max(1) as u64)
    }

    /// Number of block groups; validation rejects counts beyond `u32`.
    pub fn group_count(&self) -> u32 {
        u32::try_from(self.groups_needed()).unwrap_or(u32::MAX)
    }

    /// Declared volume size in bytes, `None` if it does not fit in 64 bits.
    pub fn volume_bytes(&self) -> Option<u64> {
        self.blocks_count().checked_mul(self.block_size())
    }

    pub fn volume_name(&self) -> Option<String> {
        let name = utils::padded_str(&self.volume_name);
        (!name.is_empty()).then_some(name)
    }

    pub fn last_mounted(&self) -> Option<String> {
        let path = utils::padded_str(&self.last_mounted);
        (!path.is_empty()).then_some(path)
    }

    /// The volume UUID in its canonical 8-4-4-4-12 form.
    pub fn uuid_string(&self) -> String {
        let h = hex::encode(self.uuid);
        format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
    }

    /// The generation the feature flags describe.
    pub fn fs_type(&self) -> FsType {
        if self.has_incompat(INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_FLEX_BG | INCOMPAT_INLINE_DATA) {
            FsType::Ext4
        } else if self.feature_compat & COMPAT_HAS_JOURNAL != 0 {
            FsType::Ext3
        } else {
            FsType::Ext2
        }
    }

    /// Byte offset of the group descriptor table.
    pub fn gdt_offset(&self) -> u64 {
        (self.first_data_block as u64 + 1) * self.block_size()
    }

    /// Validates the superblock and its geometry.
    ///
    /// # Errors
    /// - `ExtError::InvalidMagic`, `ExtError::InvalidBlockSize`, `ExtError::InvalidInodeSize`
    /// - `ExtError::InvalidGeometry` for inconsistent block or inode counts
    /// - `ExtError::InvalidDescriptorSize` on 64-bit volumes
    /// - `ExtError::UnsupportedFeatures` for layouts this reader does not follow
    pub fn validate(self, volume_size: u64) -> Result<Self, ExtError> {
        self.check_magic()?
            .check_block_size()?
            .check_inode_size()?
            .check_features()?
            .check_geometry(volume_size)
    }

    fn check_magic(self) -> Result<Self, ExtError> {
        if self.magic != EXT_MAGIC {
            return Err(ExtError::InvalidMagic(self.magic));
        }
        Ok(self)
    }

    fn check_block_size(self) -> Result<Self, ExtError> {
        if self.log_block_size > 6 {
            return Err(ExtError::InvalidBlockSize(self.log_block_size));
        }
        Ok(self)
    }

    fn check_inode_size(self) -> Result<Self, ExtError> {
        let size = self.inode_size();
        if size < 128 || !size.is_power_of_two() || size as u64 > self.block_size() {
            return Err(ExtError::InvalidInodeSize(size));
        }
        Ok(self)
    }

    fn check_features(self) -> Result<Self, ExtError> {
        let unsupported = self.feature_incompat & INCOMPAT_UNSUPPORTED;
        if unsupported != 0 {
            return Err(ExtError::UnsupportedFeatures(unsupported));
        }

        if self.is_64bit() {
            let size = self.desc_size_raw;
            if size < 64 || !size.is_power_of_two() || size > 1024 {
                return Err(ExtError::InvalidDescriptorSize(size));
            }
        }
        Ok(self)
    }

    fn check_geometry(self, volume_size: u64) -> Result<Self, ExtError> {
        let bits_per_block = self.block_size() * 8;

        if self.blocks_per_group == 0 || self.blocks_per_group as u64 > bits_per_block {
            return Err(ExtError::InvalidGeometry(format!(
                "{} blocks per group",
                self.blocks_per_group
            )));
        }

        if self.inodes_per_group == 0 || self.inodes_per_group as u64 > bits_per_block {
            return Err(ExtError::InvalidGeometry(format!(
                "{} inodes per group",
                self.inodes_per_group
            )));
        }

        if self.blocks_count() <= self.first_data_block as u64 {
            return Err(ExtError::InvalidGeometry(format!(
                "{} blocks with the first data block at {}",
                self.blocks_count(),
                self.first_data_block
            )));
        }

        if self.volume_bytes().is_none() {
            return Err(ExtError::InvalidGeometry(format!(
                "{} blocks of {} bytes overflow a 64-bit size",
                self.blocks_count(),
                self.block_size()
            )));
        }

        let groups = match u32::try_from(self.groups_needed()) {
            Ok(groups) => groups as u64,
            Err(_) => {
                return Err(ExtError::InvalidGeometry(format!(
                    "{} block groups",
                    self.groups_needed()
                )));
            }
        };
        if self.inodes_count as u64 > groups * self.inodes_per_group as u64 || self.inodes_count < 2 {
            return Err(ExtError::InvalidGeometry(format!(
                "{} inodes in {groups} groups of {}",
                self.inodes_count, self.inodes_per_group
            )));
        }

        let gdt_end = self.gdt_offset() + groups * self.desc_size() as u64;
        if gdt_end > volume_size {
            return Err(ExtError::InvalidGeometry(format!(
                "group descriptors end at byte {gdt_end}, beyond the {volume_size}-byte volume"
            )));
        }

        Ok(self)
    }
}

/// A block group descriptor, 32- or 64-bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct GroupDesc {
    block_bitmap: u64,
    inode_bitmap: u64,
    inode_table: u64,
    flags: u16,
}

impl GroupDesc {
    /// Decodes one descriptor; the high halves are only present when `wide`.
    pub fn from_bytes(buf: &[u8], wide: bool) -> Self {
        let hi = |off: usize| if wide && buf.len() >= 64 { u32_at(buf, off) as u64 } else { 0 };
        Self {
            block_bitmap: (hi(0x20) << 32) | u32_at(buf, 0x00) as u64,
            inode_bitmap: (hi(0x24) << 32) | u32_at(buf, 0x04) as u64,
            inode_table: (hi(0x28) << 32) | u32_at(buf, 0x08) as u64,
            flags: u16_at(buf, 0x12),
        }
    }

    pub fn inode_uninit(&self) -> bool {
        self.flags & BG_INODE_UNINIT != 0
    }

    pub fn block_uninit(&self) -> bool {
        self.flags & BG_BLOCK_UNINIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 1 KiB-block ext2 superblock: 8192 blocks, 2048 inodes in one group.
    fn superblock() -> Vec<u8> {
        let mut sb = vec![0u8; SUPERBLOCK_SIZE];
        sb[0..4].copy_from_slice(&2048u32.to_le_bytes());
        sb[4..8].copy_from_slice(&8192u32.to_le_bytes());
        sb[12..16].copy_from_slice(&7000u32.to_le_bytes());
        sb[20..24].copy_from_slice(&1u32.to_le_bytes());
        sb[32..36].copy_from_slice(&8192u32.to_le_bytes());
        sb[40..44].copy_from_slice(&2048u32.to_le_bytes());
        sb[56..58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        sb[76..80].copy_from_slice(&1u32.to_le_bytes());
        sb[84..88].copy_from_slice(&11u32.to_le_bytes());
        sb[88..90].copy_from_slice(&256u16.to_le_bytes());
        sb[96..100].copy_from_slice(&INCOMPAT_FILETYPE.to_le_bytes());
        sb[104..120].copy_from_slice(&[0x11; 16]);
        sb[120..128].copy_from_slice(b"evidence");
        sb[136..141].copy_from_slice(b"/mnt/");
        sb
    }

    #[test]
    fn decodes_ext2_geometry() {
        let sb = Superblock::from_bytes(&superblock()).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.blocks_count(), 8192);
        assert_eq!(sb.free_blocks_count(), 7000);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.inode_size(), 256);
        assert_eq!(sb.desc_size(), 32);
        assert_eq!(sb.gdt_offset(), 2048);
        assert_eq!(sb.fs_type(), FsType::Ext2);
        assert_eq!(sb.volume_name().as_deref(), Some("evidence"));
        assert_eq!(sb.last_mounted().as_deref(), Some("/mnt/"));
        assert_eq!(sb.uuid_string(), "11111111-1111-1111-1111-111111111111");
        assert!(sb.validate(8192 * 1024).is_ok());
    }

    #[test]
    fn rejects_bad_magic_and_features() {
        let mut raw = superblock();
        raw[56] = 0;
        assert!(matches!(
            Superblock::from_bytes(&raw).unwrap().validate(8192 * 1024),
            Err(ExtError::InvalidMagic(_))
        ));

        let mut raw = superblock();
        raw[96..100].copy_from_slice(&(INCOMPAT_FILETYPE | INCOMPAT_META_BG).to_le_bytes());
        assert!(matches!(
            Superblock::from_bytes(&raw).unwrap().validate(8192 * 1024),
            Err(ExtError::UnsupportedFeatures(INCOMPAT_META_BG))
        ));
    }

    #[test]
    fn rejects_impossible_geometry() {
        let mut raw = superblock();
        raw[40..44].copy_from_slice(&100_000u32.to_le_bytes());
        assert!(matches!(
            Superblock::from_bytes(&raw).unwrap().validate(8192 * 1024),
            Err(ExtError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_block_counts_overflowing_the_volume_size() {
        let mut raw = superblock();
        raw[96..100].copy_from_slice(&(INCOMPAT_FILETYPE | INCOMPAT_64BIT).to_le_bytes());
        raw[254..256].copy_from_slice(&64u16.to_le_bytes());
        raw[336..340].copy_from_slice(&(1u32 << 22).to_le_bytes());
        let sb = Superblock::from_bytes(&raw).unwrap();
        assert_eq!(sb.volume_bytes(), None);
        assert!(matches!(sb.validate(8192 * 1024), Err(ExtError::InvalidGeometry(_))));

        // 2^40 groups do not fit the descriptor index
        let mut raw = superblock();
        raw[96..100].copy_from_slice(&(INCOMPAT_FILETYPE | INCOMPAT_64BIT).to_le_bytes());
        raw[254..256].copy_from_slice(&64u16.to_le_bytes());
        raw[32..36].copy_from_slice(&1u32.to_le_bytes());
        raw[336..340].copy_from_slice(&(1u32 << 8).to_le_bytes());
        let sb = Superblock::from_bytes(&raw).unwrap();
        assert!(sb.volume_bytes().is_some());
        assert!(matches!(sb.validate(8192 * 1024), Err(ExtError::InvalidGeometry(_))));
    }

    #[test]
    fn wide_group_descriptors() {
        let mut raw = vec![0u8; 64];
        raw[0x08..0x0C].copy_from_slice(&5u32.to_le_bytes());
        raw[0x28..0x2C].copy_from_slice(&1u32.to_le_bytes());
        raw[0x12] = BG_BLOCK_UNINIT as u8;
        assert_eq!(GroupDesc::from_bytes(&raw, true).inode_table(), (1 << 32) | 5);
        assert_eq!(GroupDesc::from_bytes(&raw, false).inode_table(), 5);
        assert!(GroupDesc::from_bytes(&raw, false).block_uninit());
    }
}
