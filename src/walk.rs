//! Depth-first traversal of an entry tree.

use std::collections::HashSet;

use log::warn;

use crate::entry::Entry;
use crate::error::VfsError;
use crate::filesystem::EntryId;

/// One step of a walk.
#[derive(Debug)]
pub enum Visit {
    Entry(Entry),
    /// The entry itself is usable but its folder could not be listed.
    Recoverable { entry: Entry, error: VfsError },
    /// The walk cannot go on; this is the last item.
    Fatal(VfsError),
}

impl Visit {
    /// The visited entry, if the step produced one.
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Visit::Entry(entry) | Visit::Recoverable { entry, .. } => Some(entry),
            Visit::Fatal(_) => None,
        }
    }
}

/// Iterator over every entry below a folder, parents before children, in the
/// filesystem's native order.
///
/// Reallocated folders are yielded but never entered, and each entry is
/// visited at most once.
pub struct Walker {
    start: Option<Entry>,
    stack: Vec<Entry>,
    visited: HashSet<EntryId>,
    include_deleted: bool,
    done: bool,
}

impl Walker {
    /// Walks the subtree below `start`, which itself is not yielded.
    pub fn new(start: Entry) -> Self {
        Self {
            start: Some(start),
            stack: vec![],
            visited: HashSet::new(),
            include_deleted: true,
            done: false,
        }
    }

    /// Controls whether deleted entries (and what lies below them) are visited.
    pub fn include_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }

    /// Lists `folder` and schedules its children. Returns the listing error if any.
    fn expand(&mut self, folder: &Entry) -> Result<(), VfsError> {
        folder.filesystem().control().check()?;
        let children = folder.children()?;
        for child in children.into_iter().rev() {
            if child.is_deleted() && !self.include_deleted {
                continue;
            }
            self.stack.push(child);
        }
        Ok(())
    }
}

impl Iterator for Walker {
    type Item = Visit;

    fn next(&mut self) -> Option<Visit> {
        if let Some(start) = self.start.take() {
            self.visited.insert(start.id());
            if let Err(error) = self.expand(&start) {
                if error.is_fatal() {
                    self.done = true;
                    return Some(Visit::Fatal(error));
                }
                warn!("{}: {}", start.path(), error);
                return Some(Visit::Recoverable { entry: start, error });
            }
        }

        while !self.done {
            let entry = self.stack.pop()?;
            if !self.visited.insert(entry.id()) {
                continue;
            }

            let mut failure = None;
            if entry.is_folder() && !entry.is_reallocated() {
                if let Err(error) = self.expand(&entry) {
                    if error.is_fatal() {
                        self.done = true;
                        return Some(Visit::Fatal(error));
                    }
                    warn!("{}: {}", entry.path(), error);
                    failure = Some(error);
                }
            }

            return Some(match failure {
                Some(error) => Visit::Recoverable { entry, error },
                None => Visit::Entry(entry),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::block::BlockRange;
    use crate::entry::Filesystem;
    use crate::error::Result;
    use crate::filesystem::{ContentMap, EntryRecord, FilesystemMeta, FsBackend, FsType};
    use crate::options::ScanControl;
    use crate::source::ImageSource;

    struct GraphBackend {
        meta: FilesystemMeta,
        dirs: HashMap<u64, Vec<EntryRecord>>,
    }

    impl FsBackend for GraphBackend {
        fn meta(&self) -> &FilesystemMeta {
            &self.meta
        }

        fn root(&self) -> EntryRecord {
            let mut root = EntryRecord::new(EntryId(0), "", true);
            root.storage = Some(0);
            root
        }

        fn read_dir(&self, folder: &EntryRecord) -> Result<Vec<EntryRecord>> {
            match folder.storage.and_then(|s| self.dirs.get(&s)) {
                Some(records) => Ok(records.clone()),
                None => Err(VfsError::ReadRecoveryFailure {
                    offset: 0,
                    reason: "unreadable folder".into(),
                }),
            }
        }

        fn content(&self, _: &EntryRecord) -> Result<Option<ContentMap>> {
            Ok(None)
        }
    }

    fn record(id: u64, name: &str, folder_storage: Option<u64>, deleted: bool) -> EntryRecord {
        let mut record = EntryRecord::new(EntryId(id), name, folder_storage.is_some());
        record.storage = folder_storage;
        record.deleted = deleted;
        record
    }

    fn graph(control: ScanControl) -> Arc<Filesystem> {
        let dirs = HashMap::from([
            (
                0,
                vec![
                    record(1, "a", Some(10), false),
                    record(2, "gone.txt", None, true),
                    record(3, "b", Some(20), false),
                ],
            ),
            // "cycle" points back at the root folder
            (10, vec![record(4, "a1.txt", None, false), record(5, "cycle", Some(0), false)]),
            (20, vec![record(6, "broken", Some(99), false)]),
        ]);
        let backend = GraphBackend {
            meta: FilesystemMeta::new(FsType::Ext2, 1024, 1 << 16),
            dirs,
        };
        let range = BlockRange::new(Arc::new(ImageSource::from_bytes("graph", vec![0; 16], 512)));
        Filesystem::new(Box::new(backend), range, control)
    }

    fn names(walker: Walker) -> Vec<String> {
        walker
            .map(|visit| match visit {
                Visit::Entry(e) => e.path().to_string(),
                Visit::Recoverable { entry, .. } => format!("?{}", entry.path()),
                Visit::Fatal(err) => format!("!{err}"),
            })
            .collect()
    }

    #[test]
    fn depth_first_in_native_order() {
        let fs = graph(ScanControl::new());
        assert_eq!(
            names(fs.walk()),
            vec!["/a", "/a/a1.txt", "/a/cycle", "/gone.txt", "/b", "?/b/broken"]
        );
    }

    #[test]
    fn deleted_entries_can_be_skipped() {
        let fs = graph(ScanControl::new());
        assert!(!names(fs.walk().include_deleted(false)).contains(&"/gone.txt".to_string()));
    }

    #[test]
    fn walking_twice_gives_the_same_result() {
        let fs = graph(ScanControl::new());
        assert_eq!(names(fs.walk()), names(fs.walk()));
    }

    #[test]
    fn cancellation_ends_the_walk() {
        let control = ScanControl::new();
        let fs = graph(control.clone());
        control.cancel();
        let visits: Vec<Visit> = fs.walk().collect();
        assert_eq!(visits.len(), 1);
        assert!(matches!(visits[0], Visit::Fatal(VfsError::Cancelled)));
    }
}
