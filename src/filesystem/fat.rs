//! FAT volume structure and operations.
//!
//! This module implements the FAT12/16/32 driver:
//! - Reading and validating the BPB
//! - Following cluster chains with loop protection
//! - Listing directories, long names and deleted entries included
//! - Mapping file content, recovering deleted files from their first cluster
//! - Displaying the volume layout

use std::collections::{HashMap, HashSet};
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use super::bpb::Bpb;
use super::dir_entry::{DIR_ENTRY_SIZE, DirEntry, LfnBuilder, LfnEntry};
use super::fat_error::FATError;
use super::fat_type::FATType;
use super::{
    ContentMap, EntryId, EntryRecord, Extent, ExtentKind, FilesystemDriver, FilesystemMeta, FsBackend,
    Timestamps,
};
use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::{Probe, Result};
use crate::options::{DetectOptions, ScanControl};
use crate::traits::LayoutDisplay;
use crate::utils::u32_at;

/// FAT sectors kept in memory before the cache is flushed.
const FAT_CACHE_SECTORS: usize = 1024;

/// Bytes of FAT read at once while counting free clusters.
const FAT_SCAN_CHUNK: usize = 64 * 1024;

const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUC_SIG: u32 = 0x6141_7272;

/// The FAT driver.
pub struct FatDriver;

impl FilesystemDriver for FatDriver {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn probe(&self, range: &BlockRange, options: &DetectOptions) -> Result<Probe<Box<dyn FsBackend>>> {
        if range.size() < 512 {
            return Ok(Probe::Declined);
        }

        let bpb = Bpb::from_bytes(&range.read_exact(0, 512)?)?;
        let signed = bpb.has_jump() && bpb.has_signature();
        if !bpb.looks_like_fat() || (options.strict_validation() && !signed) {
            return Ok(Probe::Declined);
        }

        let bpb = Bpb::from_range(range, options.strict_validation())?;
        let volume = FATVol::new(range.clone(), bpb, options.control())?;
        Ok(Probe::Accepted(Box::new(volume)))
    }
}

/// Structure for a FAT volume.
///
/// Essentially, it is a wrapper around the Bpb plus the block it lives in.
pub struct FATVol {
    bpb: Bpb,
    fat_type: FATType,
    range: BlockRange,
    meta: FilesystemMeta,
    fat_cache: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
}

impl FATVol {
    /// Builds the volume and gathers its metadata (label, free space).
    ///
    /// # Errors
    /// - `FATError::Source` if the root directory or the FAT cannot be read
    pub fn new(range: BlockRange, bpb: Bpb, control: &ScanControl) -> std::result::Result<FATVol, FATError> {
        let fat_type = bpb.fat_type();
        let total = bpb.cluster_count() as u64 * bpb.cluster_size() as u64;

        let mut vol = Self {
            bpb,
            fat_type,
            range,
            meta: FilesystemMeta::new(fat_type.fs_type(), 0, total),
            fat_cache: Mutex::new(HashMap::new()),
        };

        let mut attributes = Attributes::new();
        attributes.set("oem_name", vol.bpb.oem_name());
        attributes.set_opt(
            "volume_serial",
            vol.bpb
                .volume_id()
                .map(|id| format!("{:04X}-{:04X}", id >> 16, id & 0xFFFF)),
        );
        attributes.set("bytes_per_sector", *vol.bpb.bytes_per_sec());
        attributes.set("sectors_per_cluster", *vol.bpb.sec_per_clus());
        attributes.set("reserved_sectors", *vol.bpb.rsvd_sec_cnt());
        attributes.set("fat_count", *vol.bpb.num_fat());
        attributes.set("cluster_count", vol.bpb.cluster_count());
        attributes.set("media", format!("0x{:02X}", vol.bpb.media()));
        attributes.set("hidden_sectors", *vol.bpb.hidd_sec());

        if vol.data_end() > vol.range.size() {
            warn!(
                "{} data region ends at byte {}, beyond the {}-byte block",
                fat_type,
                vol.data_end(),
                vol.range.size()
            );
            attributes.set("truncated", true);
        }

        let label = vol.root_label()?.or_else(|| vol.bpb.volume_label());
        let free_clusters = vol.free_clusters(control)?;

        vol.meta = FilesystemMeta::new(fat_type.fs_type(), vol.cluster_size(), total)
            .with_label(label)
            .with_free_space(free_clusters.map(|c| c as u64 * vol.cluster_size()))
            .with_attributes(attributes);

        Ok(vol)
    }

    pub fn fat_type(&self) -> FATType {
        self.fat_type
    }

    pub fn cluster_size(&self) -> u64 {
        self.bpb.cluster_size() as u64
    }

    /// Highest valid cluster number.
    fn max_cluster(&self) -> u32 {
        self.bpb.cluster_count() + 1
    }

    fn bytes_per_sec(&self) -> u64 {
        *self.bpb.bytes_per_sec() as u64
    }

    /// Returns the byte offset of the first FAT.
    fn fat_start(&self) -> u64 {
        *self.bpb.rsvd_sec_cnt() as u64 * self.bytes_per_sec()
    }

    /// Returns the byte offset of the fixed root directory.
    fn root_start(&self) -> u64 {
        self.fat_start() + self.bpb.fat_sz() as u64 * *self.bpb.num_fat() as u64 * self.bytes_per_sec()
    }

    /// Returns the byte offset of the data region.
    fn data_start(&self) -> u64 {
        self.root_start() + self.bpb.root_dir_sectors() as u64 * self.bytes_per_sec()
    }

    /// Returns the byte offset following the last cluster.
    fn data_end(&self) -> u64 {
        self.data_start() + self.bpb.cluster_count() as u64 * self.cluster_size()
    }

    /// Converts a cluster number to its byte offset in the volume.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start() + (cluster as u64 - 2) * self.cluster_size()
    }

    fn fat_sector(&self, index: u64) -> std::result::Result<Arc<Vec<u8>>, FATError> {
        if let Some(sector) = self.fat_cache.lock().get(&index) {
            return Ok(sector.clone());
        }

        let bps = self.bytes_per_sec();
        let sector = Arc::new(self.range.read_exact(self.fat_start() + index * bps, bps as usize)?);

        let mut cache = self.fat_cache.lock();
        if cache.len() >= FAT_CACHE_SECTORS {
            cache.clear();
        }
        cache.insert(index, sector.clone());
        Ok(sector)
    }

    /// Reads the FAT entry of `cluster`.
    ///
    /// # Errors
    /// - `FATError::InvalidCluster` if `cluster` is outside the data region
    pub fn fat_entry(&self, cluster: u32) -> std::result::Result<u32, FATError> {
        if cluster > self.max_cluster() {
            return Err(FATError::InvalidCluster(cluster));
        }

        let bps = self.bytes_per_sec();
        let byte_off = cluster as u64 * self.fat_type.entry_bits() as u64 / 8;
        let width = if self.fat_type == FATType::FAT32 { 4 } else { 2 };

        let mut raw = [0u8; 4];
        for (i, byte) in raw.iter_mut().take(width).enumerate() {
            let off = byte_off + i as u64;
            let sector = self.fat_sector(off / bps)?;
            *byte = sector[(off % bps) as usize];
        }
        let value = u32::from_le_bytes(raw);

        Ok(match self.fat_type {
            FATType::FAT12 if cluster & 1 == 1 => value >> 4,
            FATType::FAT12 => value & 0x0FFF,
            FATType::FAT16 => value & 0xFFFF,
            FATType::FAT32 => value & 0x0FFF_FFFF,
        })
    }

    /// Lists the clusters of the chain starting at `first`.
    ///
    /// The walk stops at the end-of-chain marker, at a free, bad or
    /// out-of-range link, and at the first cluster seen twice.
    pub fn list_clusters(&self, first: u32) -> std::result::Result<Vec<u32>, FATError> {
        if first < 2 || first > self.max_cluster() {
            return Err(FATError::InvalidCluster(first));
        }

        let mut clusters = vec![];
        let mut visited = HashSet::new();
        let mut cluster = first;

        loop {
            if !visited.insert(cluster) {
                warn!("Cluster chain from {first} loops back to {cluster}");
                break;
            }
            clusters.push(cluster);

            let next = self.fat_entry(cluster)?;
            if next >= self.fat_type.eoc_min() {
                break;
            }
            if next < 2 || next == self.fat_type.bad_cluster() || next > self.max_cluster() {
                debug!("Cluster chain from {first} broken at {cluster} (next 0x{next:X})");
                break;
            }
            cluster = next;
        }

        Ok(clusters)
    }

    fn is_free(&self, cluster: u32) -> std::result::Result<bool, FATError> {
        Ok(self.fat_entry(cluster)? == 0)
    }

    fn read_cluster(&self, cluster: u32) -> std::result::Result<Vec<u8>, FATError> {
        Ok(self
            .range
            .read_exact(self.cluster_offset(cluster), self.cluster_size() as usize)?)
    }

    /// Reads the raw slots of the root directory as `(byte offset, bytes)` runs.
    fn root_slots(&self) -> std::result::Result<Vec<(u64, Vec<u8>)>, FATError> {
        match self.fat_type {
            FATType::FAT32 => self.chain_slots(self.bpb.root_clus()),
            _ => {
                let len = self.bpb.root_dir_sectors() as u64 * self.bytes_per_sec();
                Ok(vec![(self.root_start(), self.range.read_exact(self.root_start(), len as usize)?)])
            }
        }
    }

    fn chain_slots(&self, first: u32) -> std::result::Result<Vec<(u64, Vec<u8>)>, FATError> {
        self.list_clusters(first)?
            .into_iter()
            .map(|c| Ok((self.cluster_offset(c), self.read_cluster(c)?)))
            .collect()
    }

    /// Reads the volume label entry of the root directory.
    fn root_label(&self) -> std::result::Result<Option<String>, FATError> {
        for (_, buf) in self.root_slots()? {
            for slot in buf.chunks_exact(DIR_ENTRY_SIZE) {
                if slot[0] == 0x00 {
                    return Ok(None);
                }
                if LfnEntry::is_lfn_slot(slot) {
                    continue;
                }
                let entry = DirEntry::from_slice(slot)?;
                if entry.is_volume_label() && !entry.is_deleted() {
                    let label = entry.short_name().replace('.', "");
                    return Ok(Some(label.trim_end().to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Counts free clusters from FSInfo, or by scanning the first FAT.
    fn free_clusters(&self, control: &ScanControl) -> std::result::Result<Option<u32>, FATError> {
        if self.fat_type == FATType::FAT32 && self.bpb.fs_info() != 0 {
            let offset = self.bpb.fs_info() as u64 * self.bytes_per_sec();
            if let Ok(sector) = self.range.read_exact(offset, 512) {
                let free = u32_at(&sector, 488);
                if u32_at(&sector, 0) == FSINFO_LEAD_SIG
                    && u32_at(&sector, 484) == FSINFO_STRUC_SIG
                    && free <= self.bpb.cluster_count()
                {
                    return Ok(Some(free));
                }
            }
        }

        let fat_len = (self.max_cluster() as u64 + 1) * self.fat_type.entry_bits() as u64 / 8 + 1;
        let mut free = 0;
        let mut cluster = 2u32;
        let mut chunk_start = 0u64;

        while cluster <= self.max_cluster() && chunk_start < fat_len {
            if control.check().is_err() {
                return Ok(None);
            }
            let len = (fat_len - chunk_start).min(FAT_SCAN_CHUNK as u64) as usize;
            let chunk = match self.range.read_exact(self.fat_start() + chunk_start, len) {
                Ok(chunk) => chunk,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(_) => return Ok(None),
            };

            loop {
                if cluster > self.max_cluster() {
                    break;
                }
                let byte_off = cluster as u64 * self.fat_type.entry_bits() as u64 / 8;
                let width = if self.fat_type == FATType::FAT32 { 4 } else { 2 };
                if byte_off + width > chunk_start + chunk.len() as u64 {
                    break;
                }
                let at = (byte_off - chunk_start) as usize;
                let value = match self.fat_type {
                    FATType::FAT32 => u32_at(&chunk, at) & 0x0FFF_FFFF,
                    FATType::FAT16 => u16::from_le_bytes([chunk[at], chunk[at + 1]]) as u32,
                    FATType::FAT12 => {
                        let v = u16::from_le_bytes([chunk[at], chunk[at + 1]]) as u32;
                        if cluster & 1 == 1 { v >> 4 } else { v & 0x0FFF }
                    }
                };
                if value == 0 {
                    free += 1;
                }
                cluster += 1;
            }

            // Restart at the first entry not fully contained in the chunk
            chunk_start = cluster as u64 * self.fat_type.entry_bits() as u64 / 8;
        }

        Ok(Some(free))
    }

    /// Decodes directory slots into entry records.
    fn parse_dir(&self, runs: &[(u64, Vec<u8>)]) -> std::result::Result<Vec<EntryRecord>, FATError> {
        let mut records = vec![];
        let mut lfn = LfnBuilder::default();

        for (base, buf) in runs {
            for (i, slot) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                if slot[0] == 0x00 {
                    return Ok(records);
                }

                if LfnEntry::is_lfn_slot(slot) {
                    lfn.push(LfnEntry::from_slice(slot)?);
                    continue;
                }

                let entry = DirEntry::from_slice(slot)?;
                if entry.is_volume_label() || entry.is_dot() {
                    lfn.clear();
                    continue;
                }

                let offset = base + (i * DIR_ENTRY_SIZE) as u64;
                let name = lfn.take(&entry).unwrap_or_else(|| entry.short_name());
                records.push(self.record(&entry, offset, name)?);
            }
        }

        Ok(records)
    }

    fn record(&self, entry: &DirEntry, offset: u64, name: String) -> std::result::Result<EntryRecord, FATError> {
        let cluster = entry.cluster_number();
        let valid_cluster = (2..=self.max_cluster()).contains(&cluster);

        let mut record = EntryRecord::new(EntryId(offset), &name, entry.is_dir());
        record.size = if entry.is_dir() { 0 } else { *entry.file_size() as u64 };
        record.deleted = entry.is_deleted();
        record.storage = valid_cluster.then_some(cluster as u64);
        record.timestamps = Timestamps {
            created: entry.created(),
            modified: entry.modified(),
            accessed: entry.accessed(),
            ..Default::default()
        };

        // The first cluster of a deleted entry belongs to another object again
        if record.deleted && valid_cluster && !self.is_free(cluster)? {
            record.reallocated = true;
        }

        record.attributes.set("short_name", entry.short_name());
        record.attributes.set("fat_attributes", entry.attr_flags());
        record.attributes.set("first_cluster", cluster);
        record.attributes.set("entry_offset", offset);
        Ok(record)
    }

    /// Maps the clusters of a file.
    fn map_content(&self, entry: &EntryRecord) -> std::result::Result<Option<ContentMap>, FATError> {
        if entry.size == 0 {
            return Ok(Some(ContentMap::default()));
        }
        let Some(first) = entry.storage.map(|c| c as u32) else {
            return Ok(None);
        };
        let cluster_size = self.cluster_size();

        if entry.deleted {
            // The chain is gone: assume the clusters were contiguous and stop
            // at the first one allocated again
            let needed = entry.size.div_ceil(cluster_size);
            let mut run = 0;
            while run < needed {
                let cluster = first as u64 + run;
                if cluster > self.max_cluster() as u64 || !self.is_free(cluster as u32)? {
                    break;
                }
                run += 1;
            }
            if run == 0 {
                return Ok(None);
            }
            let length = entry.size.min(run * cluster_size);
            return Ok(Some(ContentMap::contiguous(self.cluster_offset(first), length)));
        }

        let mut extents: Vec<Extent> = vec![];
        for (i, cluster) in self.list_clusters(first)?.into_iter().enumerate() {
            let physical = self.cluster_offset(cluster);
            if let Some(last) = extents.last_mut() {
                if let ExtentKind::Mapped { physical: start } = last.kind {
                    if start + last.length == physical {
                        last.length += cluster_size;
                        continue;
                    }
                }
            }
            extents.push(Extent {
                logical: i as u64 * cluster_size,
                length: cluster_size,
                kind: ExtentKind::Mapped { physical },
            });
        }

        let mapped: u64 = extents.iter().map(|e| e.length).sum();
        if mapped < entry.size {
            warn!(
                "\"{}\" declares {} bytes but its chain holds {mapped}",
                entry.name, entry.size
            );
        }
        Ok(Some(ContentMap::new(extents, entry.size.min(mapped))))
    }
}

impl FsBackend for FATVol {
    fn meta(&self) -> &FilesystemMeta {
        &self.meta
    }

    fn region_layout(&self, indent: u8) -> std::result::Result<Option<String>, std::fmt::Error> {
        self.display_layout(indent).map(Some)
    }

    fn root(&self) -> EntryRecord {
        let mut root = EntryRecord::new(EntryId(0), "", true);
        if self.fat_type == FATType::FAT32 {
            root.storage = Some(self.bpb.root_clus() as u64);
        }
        root
    }

    fn read_dir(&self, folder: &EntryRecord) -> Result<Vec<EntryRecord>> {
        if folder.id == EntryId(0) {
            return Ok(self.parse_dir(&self.root_slots()?)?);
        }

        let Some(first) = folder.storage.map(|c| c as u32) else {
            return Ok(vec![]);
        };

        let runs = if folder.deleted {
            if folder.reallocated || !self.is_free(first)? {
                return Ok(vec![]);
            }
            // Only the first cluster of a deleted folder can be located
            vec![(self.cluster_offset(first), self.read_cluster(first)?)]
        } else {
            self.chain_slots(first)?
        };

        Ok(self.parse_dir(&runs)?)
    }

    fn content(&self, entry: &EntryRecord) -> Result<Option<ContentMap>> {
        if entry.is_folder {
            return Ok(None);
        }
        Ok(self.map_content(entry)?)
    }
}

/// Implements the LayoutDisplay trait for FATVol
impl LayoutDisplay for FATVol {
    fn display_layout(&self, indent: u8) -> std::result::Result<String, std::fmt::Error> {
        let mut out = String::from("");
        let indent = " ".repeat(indent.into());
        let bps = self.bytes_per_sec();

        writeln!(out, "{}┌{:─^55}┐", indent, format!(" {} Volume Layout ", self.fat_type))?;
        writeln!(
            out,
            "{}├{:^12}┬{:^12}┬{:^12}┬{:^16}┤",
            indent, "Region", "Start", "End", "Description"
        )?;
        writeln!(
            out,
            "{}├{:─<12}┼{:─<12}┼{:─<12}┼{:─<16}┤",
            indent, "", "", "", ""
        )?;

        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent,
            "Reserved",
            0,
            self.fat_start() / bps,
            "Boot + Reserved"
        )?;
        for i in 0..*self.bpb.num_fat() {
            let fat_i_start = self.fat_start() / bps + i as u64 * self.bpb.fat_sz() as u64;
            let fat_i_end = fat_i_start + self.bpb.fat_sz() as u64;
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                format!("FAT #{}", i),
                fat_i_start,
                fat_i_end,
                "FAT Tables"
            )?;
        }
        if self.fat_type != FATType::FAT32 {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                "Root Dir",
                self.root_start() / bps,
                self.data_start() / bps,
                "Root Directory"
            )?;
        }
        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent,
            "Data",
            self.data_start() / bps,
            self.data_end() / bps,
            "Cluster Data"
        )?;
        if self.data_end() < self.range.size() {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                "",
                self.data_end() / bps,
                self.range.size() / bps,
                "Volume Slack"
            )?;
        }

        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<16}┘",
            indent, "", "", "", ""
        )?;

        Ok(out)
    }
}
