//! In-memory image builders shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use vfs_forensics::partition::gpt::Guid;

pub const SECTOR: usize = 512;

/// Writes a classic partition table in the first sector of `disk`.
///
/// Each entry is `(system id, first LBA, sector count)`.
pub fn write_mbr(disk: &mut [u8], entries: &[(u8, u32, u32)]) {
    disk[440..444].copy_from_slice(&0x5EED_0001u32.to_le_bytes());
    for (i, (system_id, start, count)) in entries.iter().enumerate() {
        let at = 446 + i * 16;
        disk[at] = if i == 0 { 0x80 } else { 0x00 };
        disk[at + 4] = *system_id;
        disk[at + 8..at + 12].copy_from_slice(&start.to_le_bytes());
        disk[at + 12..at + 16].copy_from_slice(&count.to_le_bytes());
    }
    disk[510] = 0x55;
    disk[511] = 0xAA;
}

/// Writes an extended boot record at `sector`: one logical partition
/// `(system id, LBA relative to the EBR, sector count)` and an optional link
/// `(LBA relative to the extended partition, sector count)` to the next EBR.
pub fn write_ebr(disk: &mut [u8], sector: usize, logical: (u8, u32, u32), next: Option<(u32, u32)>) {
    let base = sector * SECTOR;
    let mut put = |slot: usize, system_id: u8, start: u32, count: u32| {
        let at = base + 446 + slot * 16;
        disk[at + 4] = system_id;
        disk[at + 8..at + 12].copy_from_slice(&start.to_le_bytes());
        disk[at + 12..at + 16].copy_from_slice(&count.to_le_bytes());
    };
    put(0, logical.0, logical.1, logical.2);
    if let Some((start, count)) = next {
        put(1, 0x05, start, count);
    }
    disk[base + 510] = 0x55;
    disk[base + 511] = 0xAA;
}

const GPT_ENTRIES: usize = 128;
const GPT_ENTRY_SIZE: usize = 128;
const BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";

fn gpt_header(disk: &mut [u8], lba: u64, alternate: u64, entries_lba: u64, last_usable: u64) {
    let start = entries_lba as usize * SECTOR;
    let entries_crc = crc32fast::hash(&disk[start..start + GPT_ENTRIES * GPT_ENTRY_SIZE]);

    let mut h = vec![0u8; 92];
    h[0..8].copy_from_slice(b"EFI PART");
    h[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    h[12..16].copy_from_slice(&92u32.to_le_bytes());
    h[24..32].copy_from_slice(&lba.to_le_bytes());
    h[32..40].copy_from_slice(&alternate.to_le_bytes());
    h[40..48].copy_from_slice(&34u64.to_le_bytes());
    h[48..56].copy_from_slice(&last_usable.to_le_bytes());
    h[56..72].copy_from_slice(&[0x42; 16]);
    h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    h[80..84].copy_from_slice(&(GPT_ENTRIES as u32).to_le_bytes());
    h[84..88].copy_from_slice(&(GPT_ENTRY_SIZE as u32).to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32fast::hash(&h);
    h[16..20].copy_from_slice(&crc.to_le_bytes());

    let off = lba as usize * SECTOR;
    disk[off..off + 92].copy_from_slice(&h);
}

/// Writes a protective MBR plus primary and backup GUID partition tables.
///
/// Each partition is `(first LBA, last LBA inclusive, name)`.
pub fn write_gpt(disk: &mut [u8], partitions: &[(u64, u64, &str)]) {
    let sectors = (disk.len() / SECTOR) as u64;
    write_mbr(disk, &[(0xEE, 1, (sectors - 1) as u32)]);

    let type_guid: Guid = BASIC_DATA.parse().expect("valid GUID");
    let backup_entries = sectors - 33;
    for entries_lba in [2, backup_entries] {
        for (slot, (first, last, name)) in partitions.iter().enumerate() {
            let off = entries_lba as usize * SECTOR + slot * GPT_ENTRY_SIZE;
            disk[off..off + 16].copy_from_slice(type_guid.as_bytes());
            disk[off + 16..off + 32].fill(slot as u8 + 1);
            disk[off + 32..off + 40].copy_from_slice(&first.to_le_bytes());
            disk[off + 40..off + 48].copy_from_slice(&last.to_le_bytes());
            for (i, unit) in name.encode_utf16().enumerate() {
                disk[off + 56 + i * 2..off + 58 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
    }
    gpt_header(disk, 1, sectors - 1, 2, sectors - 34);
    gpt_header(disk, sectors - 1, 1, backup_entries, sectors - 34);
}

/// Directory slot of a file or folder added to a [`Fat16Builder`].
#[derive(Clone, Copy, Debug)]
pub struct Slot {
    /// Byte offset of the 32-byte entry in the volume.
    pub offset: usize,
    pub first_cluster: u32,
}

/// Builds FAT16 volumes with one-sector clusters and a 512-entry root folder.
pub struct Fat16Builder {
    img: Vec<u8>,
    fat_sz: usize,
    next_cluster: u32,
    used_slots: HashMap<Option<u32>, usize>,
}

const ROOT_ENTRIES: usize = 512;

fn short_name(name: &str) -> [u8; 11] {
    let mut raw = [b' '; 11];
    let (base, ext) = name.split_once('.').unwrap_or((name, ""));
    for (i, b) in base.bytes().take(8).enumerate() {
        raw[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        raw[8 + i] = b.to_ascii_uppercase();
    }
    raw
}

impl Fat16Builder {
    /// A blank volume of `sectors` sectors; at least 4200 are needed for FAT16.
    pub fn new(sectors: usize, label: &str) -> Self {
        let fat_sz = ((sectors + 2) * 2).div_ceil(SECTOR);
        let mut img = vec![0u8; sectors * SECTOR];

        img[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        img[3..11].copy_from_slice(b"MSDOS5.0");
        img[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        img[13] = 1;
        img[14..16].copy_from_slice(&1u16.to_le_bytes());
        img[16] = 2;
        img[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
        if sectors < 0x10000 {
            img[19..21].copy_from_slice(&(sectors as u16).to_le_bytes());
        } else {
            img[32..36].copy_from_slice(&(sectors as u32).to_le_bytes());
        }
        img[21] = 0xF8;
        img[22..24].copy_from_slice(&(fat_sz as u16).to_le_bytes());
        img[36] = 0x80;
        img[38] = 0x29;
        img[39..43].copy_from_slice(&0x2024_0612u32.to_le_bytes());
        img[43..54].copy_from_slice(&short_name(""));
        img[54..62].copy_from_slice(b"FAT16   ");
        img[510] = 0x55;
        img[511] = 0xAA;

        let mut builder = Self {
            img,
            fat_sz,
            next_cluster: 2,
            used_slots: HashMap::new(),
        };
        builder.set_fat(0, 0xFFF8);
        builder.set_fat(1, 0xFFFF);
        if !label.is_empty() {
            builder.slot(None, short_name(label), 0x08, 0, 0);
        }
        builder
    }

    /// Byte offset of the root folder; its first slot is the label, if any.
    pub fn root_start(&self) -> usize {
        (1 + 2 * self.fat_sz) * SECTOR
    }

    pub fn cluster_offset(&self, cluster: u32) -> usize {
        self.root_start() + ROOT_ENTRIES * 32 + (cluster as usize - 2) * SECTOR
    }

    pub fn set_fat(&mut self, cluster: u32, value: u16) {
        for copy in 0..2 {
            let at = SECTOR + copy * self.fat_sz * SECTOR + cluster as usize * 2;
            self.img[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn fat(&self, cluster: u32) -> u16 {
        let at = SECTOR + cluster as usize * 2;
        u16::from_le_bytes([self.img[at], self.img[at + 1]])
    }

    /// Makes the next allocations start at `cluster`.
    pub fn allocate_from(&mut self, cluster: u32) {
        self.next_cluster = cluster;
    }

    fn slot(&mut self, parent: Option<u32>, name: [u8; 11], attr: u8, cluster: u32, size: u32) -> Slot {
        let root_start = self.root_start();
        let index = self.used_slots.entry(parent).or_insert(0);
        let offset = match parent {
            None => root_start + *index * 32,
            Some(folder) => root_start + ROOT_ENTRIES * 32 + (folder as usize - 2) * SECTOR + *index * 32,
        };
        *index += 1;

        let img = &mut self.img;
        img[offset..offset + 11].copy_from_slice(&name);
        img[offset + 11] = attr;
        // 2024-06-12 10:30:00
        img[offset + 22..offset + 24].copy_from_slice(&0x53C0u16.to_le_bytes());
        img[offset + 24..offset + 26].copy_from_slice(&0x58CCu16.to_le_bytes());
        img[offset + 26..offset + 28].copy_from_slice(&(cluster as u16).to_le_bytes());
        img[offset + 28..offset + 32].copy_from_slice(&size.to_le_bytes());
        Slot {
            offset,
            first_cluster: cluster,
        }
    }

    /// Adds a file stored in `clusters`, chained in the given order.
    pub fn file_in(&mut self, parent: Option<u32>, name: &str, data: &[u8], clusters: &[u32]) -> Slot {
        for (i, &cluster) in clusters.iter().enumerate() {
            let next = clusters.get(i + 1).map(|&c| c as u16).unwrap_or(0xFFFF);
            self.set_fat(cluster, next);
            let chunk = data.chunks(SECTOR).nth(i).unwrap_or(&[]);
            let at = self.cluster_offset(cluster);
            self.img[at..at + chunk.len()].copy_from_slice(chunk);
        }
        let first = clusters.first().copied().unwrap_or(0);
        self.slot(parent, short_name(name), 0x20, first, data.len() as u32)
    }

    /// Adds a file in consecutive free clusters.
    pub fn file(&mut self, parent: Option<u32>, name: &str, data: &[u8]) -> Slot {
        let count = data.len().div_ceil(SECTOR) as u32;
        let clusters: Vec<u32> = (self.next_cluster..self.next_cluster + count).collect();
        self.next_cluster += count;
        self.file_in(parent, name, data, &clusters)
    }

    /// Adds a one-cluster folder and returns its cluster.
    pub fn folder(&mut self, parent: Option<u32>, name: &str) -> u32 {
        let cluster = self.next_cluster;
        self.next_cluster += 1;
        self.set_fat(cluster, 0xFFFF);
        self.slot(Some(cluster), *b".          ", 0x10, cluster, 0);
        self.slot(Some(cluster), *b"..         ", 0x10, parent.unwrap_or(0), 0);
        self.slot(parent, short_name(name), 0x10, cluster, 0);
        cluster
    }

    /// Adds a folder entry pointing at an existing cluster.
    pub fn folder_alias(&mut self, parent: Option<u32>, name: &str, cluster: u32) -> Slot {
        self.slot(parent, short_name(name), 0x10, cluster, 0)
    }

    /// Marks the entry deleted and frees its cluster chain, as a delete would.
    pub fn delete(&mut self, slot: Slot) {
        self.img[slot.offset] = 0xE5;
        let mut cluster = slot.first_cluster;
        let mut steps = 0;
        while (2..0xFFF8).contains(&cluster) && steps < 0x10000 {
            let next = self.fat(cluster) as u32;
            self.set_fat(cluster, 0);
            cluster = next;
            steps += 1;
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.img
    }
}

const EXT_BS: usize = 1024;
const EXT_INODE_SIZE: usize = 128;
const EXT_ITABLE: usize = 5;
const EXT_INODES: usize = 64;

fn ext_inode(img: &mut [u8], ino: usize, mode: u16, size: u32, blocks: &[u32]) {
    let at = EXT_ITABLE * EXT_BS + (ino - 1) * EXT_INODE_SIZE;
    img[at..at + 2].copy_from_slice(&mode.to_le_bytes());
    img[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
    img[at + 16..at + 20].copy_from_slice(&1_700_000_000u32.to_le_bytes());
    img[at + 26..at + 28].copy_from_slice(&1u16.to_le_bytes());
    for (i, b) in blocks.iter().enumerate() {
        let p = at + 40 + i * 4;
        img[p..p + 4].copy_from_slice(&b.to_le_bytes());
    }
}

fn ext_record(img: &mut [u8], at: usize, ino: u32, rec_len: u16, name: &str, ft: u8) {
    img[at..at + 4].copy_from_slice(&ino.to_le_bytes());
    img[at + 4..at + 6].copy_from_slice(&rec_len.to_le_bytes());
    img[at + 6] = name.len() as u8;
    img[at + 7] = ft;
    img[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
}

fn set_bit(img: &mut [u8], bitmap_block: usize, index: usize) {
    img[bitmap_block * EXT_BS + index / 8] |= 1 << (index % 8);
}

/// Content of `/notes.txt` in [`ext2_image`].
pub const EXT_NOTES: &[u8] = b"notes\n";
/// Content of `/docs/readme.md` in [`ext2_image`].
pub const EXT_README: &[u8] = b"read me\n";

/// An ext2 volume of `blocks` 1 KiB blocks (at least 64).
///
/// `/notes.txt` (inode 12, block 21), `/docs` (inode 14, block 24) holding
/// `readme.md` (inode 15, block 25), and the removed `gone.txt` (inode 13,
/// blocks 22-23, 1500 bytes of `g`) in the slack of the root folder.
pub fn ext2_image(blocks: usize) -> Vec<u8> {
    let mut img = vec![0u8; blocks * EXT_BS];
    let sb = EXT_BS;
    img[sb..sb + 4].copy_from_slice(&(EXT_INODES as u32).to_le_bytes());
    img[sb + 4..sb + 8].copy_from_slice(&(blocks as u32).to_le_bytes());
    img[sb + 12..sb + 16].copy_from_slice(&((blocks - 25) as u32).to_le_bytes());
    img[sb + 16..sb + 20].copy_from_slice(&((EXT_INODES - 6) as u32).to_le_bytes());
    img[sb + 20..sb + 24].copy_from_slice(&1u32.to_le_bytes());
    img[sb + 32..sb + 36].copy_from_slice(&8192u32.to_le_bytes());
    img[sb + 40..sb + 44].copy_from_slice(&(EXT_INODES as u32).to_le_bytes());
    img[sb + 56..sb + 58].copy_from_slice(&0xEF53u16.to_le_bytes());
    img[sb + 58] = 1;
    img[sb + 76..sb + 80].copy_from_slice(&1u32.to_le_bytes());
    img[sb + 84..sb + 88].copy_from_slice(&11u32.to_le_bytes());
    img[sb + 88..sb + 90].copy_from_slice(&(EXT_INODE_SIZE as u16).to_le_bytes());
    img[sb + 96..sb + 100].copy_from_slice(&0x2u32.to_le_bytes());
    img[sb + 120..sb + 125].copy_from_slice(b"linux");

    // Group descriptor: block bitmap 3, inode bitmap 4, inode table 5
    let gd = 2 * EXT_BS;
    img[gd..gd + 4].copy_from_slice(&3u32.to_le_bytes());
    img[gd + 4..gd + 8].copy_from_slice(&4u32.to_le_bytes());
    img[gd + 8..gd + 12].copy_from_slice(&(EXT_ITABLE as u32).to_le_bytes());

    for block in (1..=21).chain(24..=25) {
        set_bit(&mut img, 3, block - 1);
    }
    for ino in [1, 2, 11, 12, 14, 15] {
        set_bit(&mut img, 4, ino - 1);
    }

    ext_inode(&mut img, 2, 0x41ED, EXT_BS as u32, &[20]);
    ext_inode(&mut img, 12, 0x81A4, EXT_NOTES.len() as u32, &[21]);
    ext_inode(&mut img, 13, 0x81A4, 1500, &[22, 23]);
    ext_inode(&mut img, 14, 0x41ED, EXT_BS as u32, &[24]);
    ext_inode(&mut img, 15, 0x81A4, EXT_README.len() as u32, &[25]);

    let root = 20 * EXT_BS;
    ext_record(&mut img, root, 2, 12, ".", 2);
    ext_record(&mut img, root + 12, 2, 12, "..", 2);
    ext_record(&mut img, root + 24, 12, 20, "notes.txt", 1);
    ext_record(&mut img, root + 44, 14, (EXT_BS - 44) as u16, "docs", 2);
    ext_record(&mut img, root + 56, 13, (EXT_BS - 56) as u16, "gone.txt", 1);

    let docs = 24 * EXT_BS;
    ext_record(&mut img, docs, 14, 12, ".", 2);
    ext_record(&mut img, docs + 12, 2, 12, "..", 2);
    ext_record(&mut img, docs + 24, 15, (EXT_BS - 24) as u16, "readme.md", 1);

    img[21 * EXT_BS..21 * EXT_BS + EXT_NOTES.len()].copy_from_slice(EXT_NOTES);
    img[22 * EXT_BS..24 * EXT_BS].fill(b'g');
    img[25 * EXT_BS..25 * EXT_BS + EXT_README.len()].copy_from_slice(EXT_README);
    img
}

/// A 10 MiB disk: an MBR with a 5 MiB FAT16 partition at 1 MiB and a 4 MiB
/// ext2 partition filling the rest.
///
/// The FAT16 volume holds `HELLO.TXT` (1000 bytes) and `DOCS/NOTE.TXT`.
pub fn two_partition_disk() -> Vec<u8> {
    let mut disk = vec![0u8; 20480 * SECTOR];
    write_mbr(&mut disk, &[(0x06, 2048, 10240), (0x83, 12288, 8192)]);

    let mut fat = Fat16Builder::new(10240, "EVIDENCE");
    fat.file(None, "HELLO.TXT", &pattern(1000));
    let docs = fat.folder(None, "DOCS");
    fat.file(Some(docs), "NOTE.TXT", b"note");
    let fat = fat.into_bytes();
    disk[2048 * SECTOR..2048 * SECTOR + fat.len()].copy_from_slice(&fat);

    let ext = ext2_image(4096);
    disk[12288 * SECTOR..12288 * SECTOR + ext.len()].copy_from_slice(&ext);
    disk
}

/// Deterministic non-repeating test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect()
}
