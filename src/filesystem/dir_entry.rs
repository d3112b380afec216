//! FAT directory entry structures and parsing.
//!
//! A directory is a sequence of 32-byte slots. A slot is either a short (8.3)
//! entry carrying the metadata of a file or folder, or a long file name (LFN)
//! fragment holding 13 UTF-16 code units of the name of the short entry that
//! follows it.

use binread::{BinRead, BinReaderExt};
use chrono::NaiveDateTime;
use getset::Getters;
use std::fmt;
use std::io;

use super::fat_error::FATError;
use crate::utils;

/// Size of one directory slot.
pub const DIR_ENTRY_SIZE: usize = 32;

/// First name byte of a deleted slot.
pub const DELETED_MARK: u8 = 0xE5;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// FAT short directory entry structure.
///
/// The structure follows Microsoft's FAT specification for directory entries.
#[derive(BinRead, Debug, Clone, Getters)]
#[br(little)]
pub struct DirEntry {
    /// Filename in 8.3 format (8 characters for name, 3 for extension)
    name: [u8; 11],
    /// File attributes byte
    #[get = "pub(super)"]
    attr: u8,
    /// Case flags set by Windows NT (0x08 lower-case base, 0x10 lower-case extension)
    n_t_res: u8,
    /// Creation time refinement in 10ms units
    crt_time_tenth: u8,
    crt_time: u16,
    crt_date: u16,
    lst_acc_date: u16,
    /// High 16 bits of first cluster number (FAT32 only)
    fst_clus_hi: u16,
    wrt_time: u16,
    wrt_date: u16,
    /// Low 16 bits of first cluster number
    fst_clus_lo: u16,
    /// File size in bytes (0 for directories)
    #[get = "pub(super)"]
    file_size: u32,
}

impl DirEntry {
    /// Creates a directory entry from a 32-byte slot.
    pub fn from_slice(buf: &[u8]) -> Result<Self, FATError> {
        let mut reader = io::Cursor::new(buf);
        reader.read_le().map_err(FATError::from)
    }

    /// Builds the displayable 8.3 name.
    ///
    /// A deleted entry lost its first character; it is shown as `_`.
    pub fn short_name(&self) -> String {
        let mut raw = self.name;
        match raw[0] {
            DELETED_MARK => raw[0] = b'_',
            // 0x05 stands for a real 0xE5 first character
            0x05 => raw[0] = DELETED_MARK,
            _ => {}
        }

        let decode = |bytes: &[u8], lower: bool| {
            let text: String = bytes.iter().map(|&b| b as char).collect();
            let text = text.trim_end().to_string();
            if lower { text.to_ascii_lowercase() } else { text }
        };
        let base = decode(&raw[0..8], self.n_t_res & 0x08 != 0);
        let ext = decode(&raw[8..11], self.n_t_res & 0x10 != 0);

        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }

    /// Checksum of the 11 name bytes, repeated in every LFN fragment of the entry.
    pub fn name_checksum(&self) -> u8 {
        self.name
            .iter()
            .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
    }

    /// Returns the complete first cluster number for this entry.
    pub fn cluster_number(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) + self.fst_clus_lo as u32
    }

    /// Checks if the directory attribute bit (0x10) is set in the attributes field
    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0 && !self.is_dir()
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DELETED_MARK
    }

    /// `.` and `..` entries.
    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.' && (self.name[1] == b' ' || (self.name[1] == b'.' && self.name[2] == b' '))
    }

    pub fn created(&self) -> Option<NaiveDateTime> {
        utils::fat_datetime(self.crt_date, self.crt_time, self.crt_time_tenth)
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        utils::fat_datetime(self.wrt_date, self.wrt_time, 0)
    }

    pub fn accessed(&self) -> Option<NaiveDateTime> {
        utils::fat_datetime(self.lst_acc_date, 0, 0)
    }

    /// The attribute byte as `RHSVDA` flags, `-` where unset.
    pub fn attr_flags(&self) -> String {
        [
            (ATTR_READ_ONLY, 'R'),
            (ATTR_HIDDEN, 'H'),
            (ATTR_SYSTEM, 'S'),
            (ATTR_VOLUME_ID, 'V'),
            (ATTR_DIRECTORY, 'D'),
            (ATTR_ARCHIVE, 'A'),
        ]
        .iter()
        .map(|&(bit, c)| if self.attr & bit != 0 { c } else { '-' })
        .collect()
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" {}B", self.short_name(), self.file_size)
    }
}

/// A long file name fragment.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct LfnEntry {
    /// Sequence number; 0x40 flags the last fragment, 0xE5 a deleted one
    ord: u8,
    name1: [u16; 5],
    attr: u8,
    kind: u8,
    checksum: u8,
    name2: [u16; 6],
    fst_clus_lo: u16,
    name3: [u16; 2],
}

impl LfnEntry {
    pub fn from_slice(buf: &[u8]) -> Result<Self, FATError> {
        let mut reader = io::Cursor::new(buf);
        reader.read_le().map_err(FATError::from)
    }

    /// Returns true if the slot holds an LFN fragment (live or deleted).
    pub fn is_lfn_slot(slot: &[u8]) -> bool {
        slot.get(11) == Some(&ATTR_LONG_NAME)
    }

    pub fn sequence(&self) -> u8 {
        self.ord & 0x1F
    }

    pub fn is_last(&self) -> bool {
        self.ord & 0x40 != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.ord == DELETED_MARK
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// The 13 code units carried by the fragment, padding included.
    pub fn units(&self) -> Vec<u16> {
        self.name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter())
            .copied()
            .collect()
    }
}

/// Accumulates the LFN fragments preceding a short entry.
#[derive(Default)]
pub struct LfnBuilder {
    fragments: Vec<LfnEntry>,
}

impl LfnBuilder {
    pub fn push(&mut self, fragment: LfnEntry) {
        if fragment.is_last() && !fragment.is_deleted() {
            self.fragments.clear();
        }
        self.fragments.push(fragment);
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    /// Assembles the long name of `short`, if the pending fragments belong to it.
    ///
    /// Live fragments must be numbered down to 1 and carry the checksum of the
    /// short name. The checksum of a deleted entry cannot be verified because
    /// its first name byte was overwritten; its fragments only need to agree
    /// with each other.
    pub fn take(&mut self, short: &DirEntry) -> Option<String> {
        let fragments = std::mem::take(&mut self.fragments);
        let first = fragments.first()?;

        if short.is_deleted() {
            if !fragments.iter().all(|f| f.is_deleted() && f.checksum == first.checksum) {
                return None;
            }
        } else {
            let expected = short.name_checksum();
            let numbered = fragments
                .iter()
                .rev()
                .enumerate()
                .all(|(i, f)| f.sequence() as usize == i + 1 && f.checksum == expected);
            if !first.is_last() || !numbered {
                return None;
            }
        }

        // Fragments are stored last part first
        let units: Vec<u16> = fragments.iter().rev().flat_map(|f| f.units()).collect();
        let name = utils::utf16_str(&units);
        (!name.is_empty()).then_some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_slot(name: &[u8; 11], attr: u8, cluster: u16, size: u32) -> Vec<u8> {
        let mut slot = vec![0u8; 32];
        slot[0..11].copy_from_slice(name);
        slot[11] = attr;
        slot[26..28].copy_from_slice(&cluster.to_le_bytes());
        slot[28..32].copy_from_slice(&size.to_le_bytes());
        slot
    }

    fn lfn_slot(ord: u8, checksum: u8, part: &str) -> Vec<u8> {
        let mut units: Vec<u16> = part.encode_utf16().collect();
        if units.len() < 13 {
            units.push(0);
        }
        units.resize(13, 0xFFFF);

        let mut slot = vec![0u8; 32];
        slot[0] = ord;
        slot[11] = ATTR_LONG_NAME;
        slot[13] = checksum;
        let offsets = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        for (unit, off) in units.iter().zip(offsets) {
            slot[off..off + 2].copy_from_slice(&unit.to_le_bytes());
        }
        slot
    }

    #[test]
    fn short_names() {
        let entry = DirEntry::from_slice(&short_slot(b"README  TXT", ATTR_ARCHIVE, 5, 100)).unwrap();
        assert_eq!(entry.short_name(), "README.TXT");
        assert_eq!(entry.cluster_number(), 5);
        assert_eq!(*entry.file_size(), 100);
        assert_eq!(entry.attr_flags(), "-----A");

        let mut raw = short_slot(b"README  TXT", ATTR_ARCHIVE, 5, 100);
        raw[0] = DELETED_MARK;
        let entry = DirEntry::from_slice(&raw).unwrap();
        assert!(entry.is_deleted());
        assert_eq!(entry.short_name(), "_EADME.TXT");

        let entry = DirEntry::from_slice(&short_slot(b"..         ", ATTR_DIRECTORY, 0, 0)).unwrap();
        assert!(entry.is_dot());
    }

    #[test]
    fn long_names_are_verified_and_assembled() {
        let short = DirEntry::from_slice(&short_slot(b"LONGFI~1TXT", ATTR_ARCHIVE, 3, 1)).unwrap();
        let sum = short.name_checksum();

        let mut builder = LfnBuilder::default();
        builder.push(LfnEntry::from_slice(&lfn_slot(0x42, sum, "ame.txt")).unwrap());
        builder.push(LfnEntry::from_slice(&lfn_slot(0x01, sum, "a long file n")).unwrap());
        assert_eq!(builder.take(&short).as_deref(), Some("a long file name.txt"));

        // A stale fragment with the wrong checksum is ignored
        builder.push(LfnEntry::from_slice(&lfn_slot(0x41, sum ^ 1, "other")).unwrap());
        assert_eq!(builder.take(&short), None);
    }

    #[test]
    fn deleted_long_names_are_recovered() {
        let mut raw = short_slot(b"LONGFI~1TXT", ATTR_ARCHIVE, 3, 1);
        let sum = DirEntry::from_slice(&raw).unwrap().name_checksum();
        raw[0] = DELETED_MARK;
        let short = DirEntry::from_slice(&raw).unwrap();

        let mut builder = LfnBuilder::default();
        builder.push(LfnEntry::from_slice(&lfn_slot(DELETED_MARK, sum, "ame.txt")).unwrap());
        builder.push(LfnEntry::from_slice(&lfn_slot(DELETED_MARK, sum, "a long file n")).unwrap());
        assert_eq!(builder.take(&short).as_deref(), Some("a long file name.txt"));
    }
}
