//! Byte streams over entry content.

use std::io::{self, Read, Seek, SeekFrom};

use log::warn;

use crate::entry::Entry;
use crate::error::{Result, VfsError};
use crate::filesystem::ContentMap;

/// Outcome of draining a reader to its end.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Every byte up to the mapped length was read.
    Complete(Vec<u8>),
    /// Reading stopped early; `partial` holds the bytes read before `error`.
    Recoverable { error: VfsError, partial: Vec<u8> },
    /// The source or the scan was lost.
    Fatal(VfsError),
}

impl ReadOutcome {
    /// The bytes gathered, whatever the outcome.
    pub fn bytes(&self) -> &[u8] {
        match self {
            ReadOutcome::Complete(bytes) => bytes,
            ReadOutcome::Recoverable { partial, .. } => partial,
            ReadOutcome::Fatal(_) => &[],
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ReadOutcome::Complete(_))
    }
}

/// A sequential cursor over an entry's content; borrows the entry it reads.
///
/// Never yields more than the entry's declared size. For deleted entries the
/// mapped length may be smaller.
pub struct EntryReader<'a> {
    entry: &'a Entry,
    map: ContentMap,
    pos: u64,
    closed: bool,
}

impl<'a> EntryReader<'a> {
    pub(crate) fn new(entry: &'a Entry, map: ContentMap) -> Self {
        Self {
            entry,
            map,
            pos: 0,
            closed: false,
        }
    }

    pub fn entry(&self) -> &Entry {
        self.entry
    }

    /// Number of bytes the reader can deliver in total.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.map.len().saturating_sub(self.pos)
    }

    /// Reads up to `max` bytes at the cursor. An empty buffer means end of stream.
    ///
    /// A failed extent read aborts the call without moving the cursor past
    /// the bytes actually delivered.
    ///
    /// # Errors
    /// - `VfsError::Closed` after [`EntryReader::close`]
    /// - `VfsError::ReadRecoveryFailure` if no byte could be read at the cursor
    /// - `VfsError::SourceUnavailable` if the image became unreadable
    pub fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        let bytes = self.map.read_at(self.entry.filesystem().range(), self.pos, max)?;
        self.pos += bytes.len() as u64;
        Ok(bytes)
    }

    /// Moves the cursor to `offset`; positions past the end read nothing.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.pos = offset;
        Ok(())
    }

    /// Releases the content map. Calling it again has no effect.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.map = ContentMap::default();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads everything from the cursor to the end of the mapped content.
    pub fn read_to_end_outcome(&mut self) -> ReadOutcome {
        let mut out = Vec::with_capacity(self.remaining() as usize);
        loop {
            match self.read(64 * 1024) {
                Ok(chunk) if chunk.is_empty() => return ReadOutcome::Complete(out),
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(error) if error.is_fatal() => return ReadOutcome::Fatal(error),
                Err(error) => {
                    warn!("{}: stopped at byte {}: {}", self.entry.path(), self.pos, error);
                    return ReadOutcome::Recoverable { error, partial: out };
                }
            }
        }
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = EntryReader::read(self, buf.len()).map_err(|err| match err {
            VfsError::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::other(other),
        })?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

impl Seek for EntryReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.map.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the entry"));
        };
        self.seek_to(target).map_err(io::Error::other)?;
        Ok(target)
    }
}

impl std::fmt::Debug for EntryReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("path", &self.entry.path())
            .field("pos", &self.pos)
            .field("len", &self.map.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::BlockRange;
    use crate::entry::Filesystem;
    use crate::filesystem::{EntryId, EntryRecord, Extent, ExtentKind, FilesystemMeta, FsBackend, FsType};
    use crate::options::ScanControl;
    use crate::source::ImageSource;

    /// One file whose content sits in two runs, the second past the image end.
    struct SplitBackend {
        meta: FilesystemMeta,
        second: u64,
    }

    impl FsBackend for SplitBackend {
        fn meta(&self) -> &FilesystemMeta {
            &self.meta
        }

        fn root(&self) -> EntryRecord {
            EntryRecord::new(EntryId(0), "", true)
        }

        fn read_dir(&self, _: &EntryRecord) -> Result<Vec<EntryRecord>> {
            let mut file = EntryRecord::new(EntryId(1), "split.bin", false);
            file.size = 8;
            Ok(vec![file])
        }

        fn content(&self, _: &EntryRecord) -> Result<Option<ContentMap>> {
            Ok(Some(ContentMap::new(
                vec![
                    Extent {
                        logical: 0,
                        length: 4,
                        kind: ExtentKind::Mapped { physical: 16 },
                    },
                    Extent {
                        logical: 4,
                        length: 4,
                        kind: ExtentKind::Mapped { physical: self.second },
                    },
                ],
                8,
            )))
        }
    }

    fn file(second: u64) -> (Arc<Filesystem>, Entry) {
        let data = (0..64u8).collect();
        let range = BlockRange::new(Arc::new(ImageSource::from_bytes("split", data, 512)));
        let backend = SplitBackend {
            meta: FilesystemMeta::new(FsType::Fat12, 512, 64),
            second,
        };
        let fs = Filesystem::new(Box::new(backend), range, ScanControl::new());
        let entry = fs.root().children().unwrap().remove(0);
        (fs, entry)
    }

    #[test]
    fn reads_cross_extents_in_logical_order() {
        let (_fs, entry) = file(40);
        let mut reader = entry.new_reader().unwrap().unwrap();
        assert_eq!(reader.read(3).unwrap(), vec![16, 17, 18]);
        assert_eq!(reader.read(10).unwrap(), vec![19, 40, 41, 42, 43]);
        assert!(reader.read(10).unwrap().is_empty());
    }

    #[test]
    fn failing_extent_is_recoverable_with_partial_bytes() {
        let (_fs, entry) = file(1000);
        let mut reader = entry.new_reader().unwrap().unwrap();
        match reader.read_to_end_outcome() {
            ReadOutcome::Recoverable { error, partial } => {
                assert_eq!(partial, vec![16, 17, 18, 19]);
                assert!(matches!(error, VfsError::ReadRecoveryFailure { offset: 4, .. }));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn lost_source_is_fatal() {
        let (fs, entry) = file(40);
        let mut reader = entry.new_reader().unwrap().unwrap();
        fs.range().source().invalidate();
        assert!(matches!(reader.read_to_end_outcome(), ReadOutcome::Fatal(VfsError::SourceUnavailable(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let (_fs, entry) = file(40);
        let mut reader = entry.new_reader().unwrap().unwrap();
        reader.close();
        reader.close();
        assert!(reader.is_closed());
        assert!(matches!(reader.read(4), Err(VfsError::Closed)));
    }

    #[test]
    fn seek_gives_random_access() {
        let (_fs, entry) = file(40);
        let mut reader = entry.new_reader().unwrap().unwrap();
        reader.seek(SeekFrom::End(-2)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(Read::read(&mut reader, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[42, 43]);
        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
    }
}
