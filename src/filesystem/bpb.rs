//! FAT Bpb structure.
//!
//! This module implements:
//! - BIOS Parameter Block (Bpb) parsing and validation
//! - FAT type detection (FAT12/16/32)
//! - Checks that the regions the Bpb declares fit in the block holding the volume

use binread::{BinRead, BinReaderExt};
use getset::Getters;
use std::io;

use super::fat_error::FATError;
use super::fat_type::FATType;
use crate::block::BlockRange;
use crate::utils;

/// Extended boot signature announcing valid volume id and label fields.
const EXT_BOOT_SIG: u8 = 0x29;

/// Trailing fields of the extended Bpb, shared by every FAT type (at a
/// type-dependent offset).
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct BootTail {
    /// Drive number (0x80 for hard disk)
    drv_num: u8,
    /// Reserved (used by Windows NT)
    reserved_1: u8,
    /// Extended boot signature (0x29)
    boot_sig: u8,
    /// Volume serial number
    vol_id: u32,
    /// Volume label (11 bytes)
    vol_lab: [u8; 11],
    /// Filesystem type label, informative only
    fil_sys_type: [u8; 8],
}

/// FAT32-only fields following the common Bpb.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
struct Fat32Ext {
    /// Sectors per FAT
    fat_sz_32: u32,
    /// FAT flags (mirroring, active FAT)
    ext_flags: u16,
    /// Filesystem version (should be 0:0)
    fs_ver: u16,
    /// First cluster of root directory (typically 2)
    root_clus: u32,
    /// Sector number of FSINFO structure
    fs_info: u16,
    /// Sector number of backup boot sector
    bk_boot_sec: u16,
    reserved: [u8; 12],
    tail: BootTail,
}

/// BIOS Parameter Block structure for FAT filesystems.
///
/// Both the FAT12/16 and the FAT32 layouts of the bytes following offset 36
/// are decoded; the cluster count decides which one applies.
#[derive(BinRead, Debug, Getters)]
#[br(little)]
pub struct Bpb {
    /// Jump instruction to boot code (must be 0xEB ?? 0x90 or 0xE9 ?? ??)
    jmp: [u8; 3],
    /// OEM identifier (e.g., "MSWIN4.1")
    oem_name: [u8; 8],
    /// Number of bytes per sector (512, 1024, 2048, or 4096)
    #[get = "pub(super)"]
    bytes_per_sec: u16,
    /// Number of sectors per cluster (power of 2: 1, 2, 4, 8, 16, 32, 64, or 128)
    #[get = "pub(super)"]
    sec_per_clus: u8,
    /// Number of reserved sectors from start of volume
    #[get = "pub(super)"]
    rsvd_sec_cnt: u16,
    /// Number of FAT copies (typically 2 for redundancy)
    #[get = "pub(super)"]
    num_fat: u8,
    /// Maximum number of root directory entries (0 for FAT32)
    #[get = "pub(super)"]
    root_ent_cnt: u16,
    /// Total sectors for volumes < 32MB (0 for FAT32)
    tot_sec_16: u16,
    /// Media descriptor (0xF8 for fixed disk)
    #[get = "pub(super)"]
    media: u8,
    /// Sectors per FAT for FAT12/FAT16 (0 for FAT32)
    fat_sz_16: u16,
    /// Sectors per track
    sec_per_trk: u16,
    /// Number of heads
    num_heads: u16,
    /// Number of hidden sectors preceding the partition
    #[get = "pub(super)"]
    hidd_sec: u32,
    /// Total sectors for volumes >= 32MB
    tot_sec_32: u32,

    /// FAT12/16 layout of the extended Bpb
    #[br(restore_position)]
    legacy_tail: BootTail,
    /// FAT32 layout of the extended Bpb
    fat32: Fat32Ext,

    /// Boot sector signature (0x55 0xAA)
    #[br(pad_before = 420)]
    sig: [u8; 2],
}

impl Bpb {
    /// Reads the Bpb at the start of `range` and validates it against the block.
    ///
    /// # Parameters
    /// - `range`: The block holding the volume
    /// - `strict`: Whether the jump instruction and the boot signature are checked
    ///
    /// # Errors
    /// - Returns `FATError::Source` if reading the boot sector fails
    /// - Returns various `FATError` variants if a validation check fails
    pub fn from_range(range: &BlockRange, strict: bool) -> Result<Bpb, FATError> {
        let buf = range.read_exact(0, 512)?;
        let bpb = Self::from_bytes(&buf)?;

        if strict {
            bpb.check_boot_code()?.validate(range.size())
        } else {
            bpb.validate(range.size())
        }
    }

    /// Decodes a Bpb without validating it.
    pub fn from_bytes(buf: &[u8]) -> Result<Bpb, FATError> {
        let mut reader = io::Cursor::new(buf);
        Ok(reader.read_le()?)
    }

    /// Returns true when the fields that every FAT boot sector carries look sane.
    ///
    /// Used to tell "not a FAT volume" apart from "a damaged FAT volume".
    pub fn looks_like_fat(&self) -> bool {
        [512, 1024, 2048, 4096].contains(&self.bytes_per_sec)
            && self.sec_per_clus.is_power_of_two()
            && self.num_fat > 0
            && self.rsvd_sec_cnt > 0
    }

    pub fn has_jump(&self) -> bool {
        (self.jmp[0] == 0xEB && self.jmp[2] == 0x90) || self.jmp[0] == 0xE9
    }

    pub fn has_signature(&self) -> bool {
        self.sig == [0x55, 0xAA]
    }

    /// Number of sectors taken by the fixed FAT12/16 root directory.
    pub fn root_dir_sectors(&self) -> u32 {
        (self.root_ent_cnt as u32 * 32).div_ceil(self.bytes_per_sec.max(1) as u32)
    }

    pub fn fat_sz(&self) -> u32 {
        if self.fat_sz_16 != 0 {
            self.fat_sz_16.into()
        } else {
            self.fat32.fat_sz_32
        }
    }

    pub fn tot_sec(&self) -> u32 {
        if self.tot_sec_16 != 0 {
            self.tot_sec_16.into()
        } else {
            self.tot_sec_32
        }
    }

    /// Determines the number of clusters in the data section.
    ///
    /// # Returns
    /// - The number of data clusters, 0 if the metadata regions exceed the volume.
    pub fn cluster_count(&self) -> u32 {
        let meta_sec = self.rsvd_sec_cnt as u64
            + self.num_fat as u64 * self.fat_sz() as u64
            + self.root_dir_sectors() as u64;
        let data_sec = (self.tot_sec() as u64).saturating_sub(meta_sec);
        (data_sec / self.sec_per_clus.max(1) as u64) as u32
    }

    /// Determines the FAT type based on the number of clusters in the filesystem.
    pub fn fat_type(&self) -> FATType {
        FATType::from_cluster_count(self.cluster_count())
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sec as u32 * self.sec_per_clus as u32
    }

    /// First cluster of the root directory (FAT32 only).
    pub fn root_clus(&self) -> u32 {
        self.fat32.root_clus
    }

    /// Sector of the FSInfo structure (FAT32 only).
    pub fn fs_info(&self) -> u16 {
        self.fat32.fs_info
    }

    fn tail(&self) -> &BootTail {
        match self.fat_type() {
            FATType::FAT32 => &self.fat32.tail,
            _ => &self.legacy_tail,
        }
    }

    /// Volume serial number, when the extended boot signature is present.
    pub fn volume_id(&self) -> Option<u32> {
        let tail = self.tail();
        (tail.boot_sig == EXT_BOOT_SIG).then_some(tail.vol_id)
    }

    /// Volume label stored in the boot sector, when present.
    pub fn volume_label(&self) -> Option<String> {
        let tail = self.tail();
        if tail.boot_sig != EXT_BOOT_SIG {
            return None;
        }
        let label = utils::padded_str(&tail.vol_lab);
        (!label.is_empty() && label != "NO NAME").then_some(label)
    }

    pub fn oem_name(&self) -> String {
        utils::padded_str(&self.oem_name)
    }

    /// Checks the jump instruction and the boot signature.
    fn check_boot_code(self) -> Result<Self, FATError> {
        if !self.has_jump() {
            return Err(FATError::InvalidJmp(format!(
                "0x{:02X}{:02X}{:02X}",
                self.jmp[0], self.jmp[1], self.jmp[2],
            )));
        }

        if !self.has_signature() {
            return Err(FATError::InvalidSignature(format!(
                "0x{:02X}{:02X}",
                self.sig[0], self.sig[1]
            )));
        }

        Ok(self)
    }

    /// Validates the Bpb structure according to the FAT specification requirements.
    ///
    /// # Errors
    /// - `FATError::InvalidBytesPerSec`: If bytes per sector is not a valid value
    /// - `FATError::InvalidSecPerClus`: If sectors per cluster is not a valid value
    /// - `FATError::InvalidClusSz`: If cluster size exceeds 32 KiB
    /// - `FATError::InvalidRsvdSecCnt`, `FATError::InvalidNumFat`: For empty regions
    /// - `FATError::InvalidTotSec`, `FATError::InvalidFatSz`: For inconsistent sizes
    /// - `FATError::RegionOutOfBounds`: If the FATs or the root directory leave the volume
    fn validate(self, volume_size: u64) -> Result<Self, FATError> {
        const VALID_BYTES_PER_SEC: [u16; 4] = [512, 1024, 2048, 4096];
        if !VALID_BYTES_PER_SEC.contains(&self.bytes_per_sec) {
            return Err(FATError::InvalidBytesPerSec(self.bytes_per_sec));
        }

        const VALID_SEC_PER_CLUS: [u8; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
        if !VALID_SEC_PER_CLUS.contains(&self.sec_per_clus) {
            return Err(FATError::InvalidSecPerClus(self.sec_per_clus));
        }

        if self.cluster_size() > 32 * 1024 {
            return Err(FATError::InvalidClusSz(self.cluster_size()));
        }

        if self.rsvd_sec_cnt == 0 {
            return Err(FATError::InvalidRsvdSecCnt(self.rsvd_sec_cnt));
        }

        if self.num_fat == 0 {
            return Err(FATError::InvalidNumFat(self.num_fat));
        }

        if self.tot_sec() == 0 {
            return Err(FATError::InvalidTotSec(String::from(
                "Both BPB_TotSec16 and BPB_TotSec32 are 0.",
            )));
        }

        if self.fat_sz() == 0 {
            return Err(FATError::InvalidFatSz(String::from(
                "Neither BPB_FATSz16 nor BPB_FATSz32 is set.",
            )));
        }

        if self.cluster_count() == 0 {
            return Err(FATError::InvalidTotSec(format!(
                "{} sectors leave no room for a data region",
                self.tot_sec()
            )));
        }

        let bpb = match self.fat_type() {
            FATType::FAT32 => self.validate_fat32()?,
            _ => self.validate_fat16()?,
        };
        bpb.check_fat_capacity()?.check_regions(volume_size)
    }

    /// Performs FAT32-specific validation checks.
    fn validate_fat32(self) -> Result<Self, FATError> {
        if self.root_ent_cnt != 0 {
            return Err(FATError::InvalidRootEntCnt(self.root_ent_cnt));
        }

        if self.tot_sec_16 != 0 {
            return Err(FATError::InvalidTotSec(String::from(
                "BPB_TotSec16 should be 0 for a FAT32 volume.",
            )));
        }

        if self.fat_sz_16 != 0 {
            return Err(FATError::InvalidFatSz(String::from(
                "BPB_FATSz16 should be 0 for a FAT32 volume.",
            )));
        }

        if self.root_clus() < 2 || self.root_clus() > self.cluster_count() + 1 {
            return Err(FATError::InvalidRootClus(self.root_clus()));
        }

        Ok(self)
    }

    /// Performs FAT12/16-specific validation checks.
    fn validate_fat16(self) -> Result<Self, FATError> {
        if self.root_ent_cnt == 0 {
            return Err(FATError::InvalidRootEntCnt(self.root_ent_cnt));
        }

        if self.fat_sz_16 == 0 {
            return Err(FATError::InvalidFatSz(String::from(
                "BPB_FATSz16 should be set for a FAT12/16 volume.",
            )));
        }

        Ok(self)
    }

    /// Checks that one FAT copy can describe every cluster.
    fn check_fat_capacity(self) -> Result<Self, FATError> {
        let entries =
            self.fat_sz() as u64 * self.bytes_per_sec as u64 * 8 / self.fat_type().entry_bits() as u64;
        if entries < self.cluster_count() as u64 + 2 {
            return Err(FATError::InvalidFatSz(format!(
                "{} sectors per FAT cannot map {} clusters",
                self.fat_sz(),
                self.cluster_count()
            )));
        }
        Ok(self)
    }

    /// Checks that the reserved region, the FATs and the fixed root directory fit in the volume.
    fn check_regions(self, volume_size: u64) -> Result<Self, FATError> {
        let bps = self.bytes_per_sec as u64;
        let fat_end = (self.rsvd_sec_cnt as u64 + self.num_fat as u64 * self.fat_sz() as u64) * bps;
        if fat_end > volume_size {
            return Err(FATError::RegionOutOfBounds {
                region: "FAT region",
                end: fat_end,
                limit: volume_size,
            });
        }

        let root_end = fat_end + self.root_dir_sectors() as u64 * bps;
        if root_end > volume_size {
            return Err(FATError::RegionOutOfBounds {
                region: "root directory",
                end: root_end,
                limit: volume_size,
            });
        }

        Ok(self)
    }
}
