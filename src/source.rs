//! Read-only image sources.
//!
//! An [`ImageSource`] is the root of an address space: a disk image file, a raw
//! device node, or an in-memory buffer. Nothing in this module can write.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use getset::{CopyGetters, Getters};
use log::{error, info};
use parking_lot::Mutex;

use crate::error::{Result, VfsError};

/// Positioned reads against the bytes behind a source.
trait SourceBackend: Send {
    /// Fills `buf` from `offset`, returning fewer bytes only at the end of data.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

struct FileBackend {
    file: File,
}

impl SourceBackend for FileBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }
}

struct MemoryBackend {
    data: Vec<u8>,
}

impl SourceBackend for MemoryBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Where the bytes of a source come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// An image file or a device node opened read-only.
    File,
    /// A caller-provided buffer.
    Memory,
}

/// A read-only, random-access byte provider.
///
/// Physical reads are serialized under a lock so that each `read` call is atomic
/// with respect to positioning, whichever thread issues it.
#[derive(Getters, CopyGetters)]
pub struct ImageSource {
    /// The locator the source was opened from.
    #[get = "pub"]
    locator: String,
    #[get_copy = "pub"]
    kind: SourceKind,
    /// Size of the source in bytes.
    #[get_copy = "pub"]
    size: u64,
    /// Logical sector size in bytes.
    #[get_copy = "pub"]
    sector_size: usize,
    backend: Mutex<Box<dyn SourceBackend>>,
    available: AtomicBool,
}

impl ImageSource {
    /// Opens the image designated by `locator` for reading.
    ///
    /// The locator is either a filesystem path or a `file://` URL.
    ///
    /// # Errors
    /// - `VfsError::SourceUnavailable` if the locator is empty or the file cannot
    ///   be opened or sized
    pub fn open(locator: &str, sector_size: usize) -> Result<Self> {
        let path = locator.strip_prefix("file://").unwrap_or(locator);
        if path.is_empty() {
            return Err(VfsError::SourceUnavailable(format!(
                "empty locator `{locator}`"
            )));
        }

        let unavailable =
            |err: io::Error| VfsError::SourceUnavailable(format!("{locator}: {err}"));

        let mut file = File::open(Path::new(path)).map_err(unavailable)?;
        let mut size = file.metadata().map_err(unavailable)?.len();
        // Device nodes report a zero length through metadata
        if size == 0 {
            size = file.seek(SeekFrom::End(0)).map_err(unavailable)?;
        }

        info!("Opened {locator}: {size} bytes, {sector_size}-byte sectors");

        Ok(Self {
            locator: locator.to_string(),
            kind: SourceKind::File,
            size,
            sector_size,
            backend: Mutex::new(Box::new(FileBackend { file })),
            available: AtomicBool::new(true),
        })
    }

    /// Wraps an in-memory image.
    pub fn from_bytes(name: &str, data: Vec<u8>, sector_size: usize) -> Self {
        Self {
            locator: name.to_string(),
            kind: SourceKind::Memory,
            size: data.len() as u64,
            sector_size,
            backend: Mutex::new(Box::new(MemoryBackend { data })),
            available: AtomicBool::new(true),
        }
    }

    /// Returns `false` once the source has become unreadable.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Reads up to `length` bytes at `offset`.
    ///
    /// Fewer bytes are returned only when the end of the source is reached; an
    /// offset at or past the end yields an empty buffer.
    ///
    /// # Errors
    /// - `VfsError::SourceUnavailable` if the source is, or just became, unreadable
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        if !self.is_available() {
            return Err(VfsError::SourceUnavailable(self.locator.clone()));
        }
        if offset >= self.size {
            return Ok(Vec::new());
        }

        let length = length.min(usize::try_from(self.size - offset).unwrap_or(usize::MAX));
        let mut buf = vec![0; length];

        let read = self.backend.lock().read_at(offset, &mut buf);
        match read {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) => {
                error!("{}: read of {length} bytes at {offset} failed: {err}", self.locator);
                self.available.store(false, Ordering::Release);
                Err(VfsError::SourceUnavailable(format!("{}: {err}", self.locator)))
            }
        }
    }

    /// Marks the source unreadable, e.g. after the device was detached.
    ///
    /// Every later read reports [`VfsError::SourceUnavailable`].
    pub fn invalidate(&self) {
        self.available.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSource")
            .field("locator", &self.locator)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("sector_size", &self.sector_size)
            .field("available", &self.is_available())
            .finish()
    }
}
