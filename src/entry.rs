//! The entry tree of a recognized filesystem.
//!
//! Entries are materialized folder by folder, the first time a folder's
//! children are asked for, and then cached in the filesystem's arena for the
//! rest of the session. The arena only grows.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as FmtWrite};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use getset::Getters;
use log::{debug, warn};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::attributes::Attributes;
use crate::block::BlockRange;
use crate::error::Result;
use crate::filesystem::{EntryId, EntryRecord, FilesystemMeta, FsBackend, Timestamps};
use crate::options::ScanControl;
use crate::reader::EntryReader;
use crate::traits::{TraitError, TreeDisplay};
use crate::walk::{Visit, Walker};

/// First identifier handed out to entries whose native id was already taken.
const SYNTHETIC_ID_BASE: u64 = 1 << 63;

struct EntryNode {
    /// Arena key; differs from `record.id` for entries given a synthetic id.
    id: EntryId,
    record: EntryRecord,
    parent: Option<EntryId>,
    path: String,
    depth: usize,
    children: OnceCell<Vec<EntryId>>,
}

/// A recognized filesystem and the cache of its materialized entries.
#[derive(Getters)]
pub struct Filesystem {
    backend: Box<dyn FsBackend>,
    /// The block holding the filesystem.
    #[get = "pub"]
    range: BlockRange,
    #[get = "pub"]
    control: ScanControl,
    arena: RwLock<HashMap<EntryId, Arc<EntryNode>>>,
    next_synthetic: AtomicU64,
    root: Arc<EntryNode>,
}

impl Filesystem {
    pub fn new(backend: Box<dyn FsBackend>, range: BlockRange, control: ScanControl) -> Arc<Filesystem> {
        let record = backend.root();
        let root = backend.meta().root();
        let node = EntryNode {
            id: root,
            record,
            parent: None,
            path: String::from("/"),
            depth: 0,
            children: OnceCell::new(),
        };

        let node = Arc::new(node);
        let mut arena = HashMap::new();
        arena.insert(root, node.clone());

        Arc::new(Filesystem {
            backend,
            range,
            control,
            arena: RwLock::new(arena),
            next_synthetic: AtomicU64::new(SYNTHETIC_ID_BASE),
            root: node,
        })
    }

    pub fn meta(&self) -> &FilesystemMeta {
        self.backend.meta()
    }

    /// The driver's table of on-disk regions, if it draws one.
    pub fn region_layout(&self, indent: u8) -> std::result::Result<Option<String>, fmt::Error> {
        self.backend.region_layout(indent)
    }

    pub fn root(self: &Arc<Self>) -> Entry {
        Entry {
            fs: self.clone(),
            node: self.root.clone(),
        }
    }

    /// Number of entries materialized so far, the root included.
    pub fn materialized(&self) -> usize {
        self.arena.read().len()
    }

    /// Returns the cached entry with arena id `id`, if it was materialized.
    pub fn entry(self: &Arc<Self>, id: EntryId) -> Option<Entry> {
        let node = self.arena.read().get(&id).cloned()?;
        Some(Entry {
            fs: self.clone(),
            node,
        })
    }

    /// Resolves a `/`-separated path from the root.
    ///
    /// Each component is matched exactly first, live entries before deleted
    /// ones, then ignoring ASCII case.
    ///
    /// # Errors
    /// Propagates the failure to list a folder on the way.
    pub fn lookup(self: &Arc<Self>, path: &str) -> Result<Option<Entry>> {
        let mut current = self.root();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let children = current.children()?;
            let found = children
                .iter()
                .find(|e| e.name() == component && !e.is_deleted())
                .or_else(|| children.iter().find(|e| e.name() == component))
                .or_else(|| children.iter().find(|e| e.name().eq_ignore_ascii_case(component)));

            match found {
                Some(entry) => current = entry.clone(),
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    /// A depth-first traversal from the root.
    pub fn walk(self: &Arc<Self>) -> Walker {
        Walker::new(self.root())
    }

    fn next_synthetic_id(&self) -> EntryId {
        EntryId(self.next_synthetic.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns `true` if `storage` is shared with `folder` or one of its ancestors.
    fn storage_in_lineage(&self, folder: &EntryNode, storage: u64) -> bool {
        let arena = self.arena.read();
        let mut seen = HashSet::new();
        let mut current = Some(folder.id);

        while let Some(id) = current {
            if !seen.insert(id) {
                break;
            }
            let Some(node) = arena.get(&id) else {
                break;
            };
            if node.record.storage == Some(storage) {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// Lists `folder` through the backend and registers its children in the arena.
    fn materialize(&self, folder: &EntryNode) -> Result<Vec<EntryId>> {
        self.control.check()?;
        let records = self.backend.read_dir(&folder.record)?;
        debug!("{}: {} records", folder.path, records.len());

        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            if folder.record.deleted {
                record.deleted = true;
            }
            let loops = match record.storage {
                Some(storage) if record.is_folder => self.storage_in_lineage(folder, storage),
                _ => false,
            };
            if loops {
                warn!("{}/{}: folder loops back to an ancestor", folder.path.trim_end_matches('/'), record.name);
                record.reallocated = true;
            }

            // Check and insert under one lock
            let mut arena = self.arena.write();
            let mut id = record.id;
            if arena.contains_key(&id) {
                id = self.next_synthetic_id();
                warn!("{}: entry {} listed under a second parent", folder.path, record.id);
                record.reallocated = true;
            }

            let path = match folder.parent {
                None => format!("/{}", record.name),
                Some(_) => format!("{}/{}", folder.path, record.name),
            };
            let node = EntryNode {
                id,
                record,
                parent: Some(folder.id),
                path,
                depth: folder.depth + 1,
                children: OnceCell::new(),
            };
            arena.insert(id, Arc::new(node));
            drop(arena);
            ids.push(id);
        }

        Ok(ids)
    }
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("meta", self.meta())
            .field("offset", &self.range.offset())
            .field("materialized", &self.materialized())
            .finish()
    }
}

/// Renders every entry reachable from the root, one per line.
///
/// Deleted entries are prefixed with `x`, reallocated ones with `!`.
impl TreeDisplay for Arc<Filesystem> {
    fn display_tree(&self, indent: usize) -> std::result::Result<String, TraitError> {
        let mut out = String::new();
        writeln!(out, "{}{} {}", " ".repeat(indent), self.meta().fs_type(), self.meta().label().as_deref().unwrap_or(""))?;

        for visit in self.walk().include_deleted(true) {
            match visit {
                Visit::Entry(entry) => writeln!(out, "{}", entry.tree_line(indent))?,
                Visit::Recoverable { entry, error } => {
                    writeln!(out, "{}", entry.tree_line(indent))?;
                    writeln!(out, "{}  ? {}", " ".repeat(indent + 2 * entry.depth()), error)?;
                }
                Visit::Fatal(error) => return Err(error.into()),
            }
        }

        Ok(out)
    }
}

/// A file or folder of a filesystem. Cheap to clone.
#[derive(Clone)]
pub struct Entry {
    fs: Arc<Filesystem>,
    node: Arc<EntryNode>,
}

impl Entry {
    pub fn id(&self) -> EntryId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.record.name
    }

    /// Absolute path from the filesystem root, `/` for the root itself.
    pub fn path(&self) -> &str {
        &self.node.path
    }

    /// Distance from the root.
    pub fn depth(&self) -> usize {
        self.node.depth
    }

    /// Declared size in bytes.
    pub fn size(&self) -> u64 {
        self.node.record.size
    }

    pub fn is_folder(&self) -> bool {
        self.node.record.is_folder
    }

    pub fn is_deleted(&self) -> bool {
        self.node.record.deleted
    }

    /// The entry's metadata or storage now belongs to something else.
    pub fn is_reallocated(&self) -> bool {
        self.node.record.reallocated
    }

    pub fn is_root(&self) -> bool {
        self.node.parent.is_none()
    }

    pub fn timestamps(&self) -> Timestamps {
        self.node.record.timestamps
    }

    pub fn attributes(&self) -> &Attributes {
        &self.node.record.attributes
    }

    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    pub fn parent(&self) -> Option<Entry> {
        self.fs.entry(self.node.parent?)
    }

    /// Lists the folder in the filesystem's native order.
    ///
    /// The listing is built once and cached; every call returns it again from
    /// the start. Files and reallocated folders have no children.
    ///
    /// # Errors
    /// - `VfsError::Cancelled` or `VfsError::TimedOut` from the filesystem's control
    /// - the backend's failure to read the folder, in which case a later call retries
    pub fn children(&self) -> Result<Vec<Entry>> {
        if !self.is_folder() || self.is_reallocated() {
            return Ok(vec![]);
        }

        let ids = self.node.children.get_or_try_init(|| self.fs.materialize(&self.node))?;
        let arena = self.fs.arena.read();
        Ok(ids
            .iter()
            .filter_map(|id| arena.get(id).cloned())
            .map(|node| Entry {
                fs: self.fs.clone(),
                node,
            })
            .collect())
    }

    /// Opens a reader over the entry's content.
    ///
    /// Returns `None` for folders and for deleted entries whose content cannot
    /// be located anymore.
    ///
    /// # Errors
    /// Propagates the backend's failure to map the content.
    pub fn new_reader(&self) -> Result<Option<EntryReader<'_>>> {
        if self.is_folder() {
            return Ok(None);
        }
        let Some(map) = self.fs.backend.content(&self.node.record)? else {
            return Ok(None);
        };
        Ok(Some(EntryReader::new(self, map.truncate(self.size()))))
    }

    fn tree_line(&self, indent: usize) -> String {
        let mark = match (self.is_reallocated(), self.is_deleted()) {
            (true, _) => "! ",
            (false, true) => "x ",
            _ => "  ",
        };
        let suffix = if self.is_folder() { "/" } else { "" };
        format!(
            "{}{}{}{} ({} bytes)",
            " ".repeat(indent + 2 * self.depth().saturating_sub(1)),
            mark,
            self.name(),
            suffix,
            self.size()
        )
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id())
            .field("path", &self.path())
            .field("size", &self.size())
            .field("is_folder", &self.is_folder())
            .field("deleted", &self.is_deleted())
            .field("reallocated", &self.is_reallocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::error::VfsError;
    use crate::filesystem::{ContentMap, FsType};
    use crate::source::ImageSource;

    /// A backend serving a fixed folder graph keyed by storage number.
    struct FakeBackend {
        meta: FilesystemMeta,
        dirs: HashMap<u64, Vec<EntryRecord>>,
        failing: HashSet<u64>,
    }

    fn folder(id: u64, name: &str, storage: u64) -> EntryRecord {
        let mut record = EntryRecord::new(EntryId(id), name, true);
        record.storage = Some(storage);
        record
    }

    fn file(id: u64, name: &str, size: u64) -> EntryRecord {
        let mut record = EntryRecord::new(EntryId(id), name, false);
        record.size = size;
        record.storage = Some(id);
        record
    }

    impl FsBackend for FakeBackend {
        fn meta(&self) -> &FilesystemMeta {
            &self.meta
        }

        fn root(&self) -> EntryRecord {
            folder(0, "", 0)
        }

        fn read_dir(&self, folder: &EntryRecord) -> Result<Vec<EntryRecord>> {
            let storage = folder.storage.unwrap_or(0);
            if self.failing.contains(&storage) {
                return Err(VfsError::ReadRecoveryFailure {
                    offset: storage,
                    reason: "bad sector".into(),
                });
            }
            Ok(self.dirs.get(&storage).cloned().unwrap_or_default())
        }

        fn content(&self, entry: &EntryRecord) -> Result<Option<ContentMap>> {
            Ok(Some(ContentMap::inline(&vec![b'a'; entry.size as usize + 8])))
        }
    }

    fn filesystem(dirs: Vec<(u64, Vec<EntryRecord>)>, failing: &[u64]) -> Arc<Filesystem> {
        let backend = FakeBackend {
            meta: FilesystemMeta::new(FsType::Fat16, 512, 1 << 20),
            dirs: dirs.into_iter().collect(),
            failing: failing.iter().copied().collect(),
        };
        let range = BlockRange::new(Arc::new(ImageSource::from_bytes("fake", vec![0; 64], 512)));
        Filesystem::new(Box::new(backend), range, ScanControl::new())
    }

    #[test]
    fn children_are_cached_and_restartable() {
        let fs = filesystem(
            vec![(0, vec![file(10, "a.txt", 3), folder(11, "docs", 5)]), (5, vec![file(20, "b.txt", 1)])],
            &[],
        );
        let root = fs.root();
        let first: Vec<String> = root.children().unwrap().iter().map(|e| e.name().to_string()).collect();
        let again: Vec<String> = root.children().unwrap().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(first, vec!["a.txt", "docs"]);
        assert_eq!(first, again);
        assert_eq!(fs.materialized(), 3);

        let b = fs.lookup("/docs/b.txt").unwrap().unwrap();
        assert_eq!(b.path(), "/docs/b.txt");
        assert_eq!(b.parent().unwrap().name(), "docs");
        assert_eq!(b.depth(), 2);
    }

    #[test]
    fn folder_pointing_at_an_ancestor_is_reallocated() {
        let fs = filesystem(vec![(0, vec![folder(11, "loop", 5)]), (5, vec![folder(12, "back", 0)])], &[]);
        let back = fs.lookup("loop/back").unwrap().unwrap();
        assert!(back.is_reallocated());
        assert!(back.children().unwrap().is_empty());
    }

    #[test]
    fn ids_seen_twice_get_synthetic_ids() {
        let fs = filesystem(
            vec![(0, vec![folder(11, "a", 5), folder(12, "b", 6)]), (5, vec![file(30, "x", 1)]), (6, vec![file(30, "x", 1)])],
            &[],
        );
        let first = fs.lookup("a/x").unwrap().unwrap();
        let second = fs.lookup("b/x").unwrap().unwrap();
        assert!(!first.is_reallocated());
        assert!(second.is_reallocated());
        assert!(second.id().0 >= SYNTHETIC_ID_BASE);
    }

    #[test]
    fn concurrent_siblings_sharing_storage_keep_one_native_id() {
        for _ in 0..50 {
            let fs = filesystem(
                vec![(0, vec![folder(11, "a", 5), folder(12, "b", 5)]), (5, vec![file(30, "x", 1)])],
                &[],
            );
            fs.root().children().unwrap();

            let barrier = Barrier::new(2);
            let found: Vec<Entry> = thread::scope(|scope| {
                let handles: Vec<_> = ["a", "b"]
                    .into_iter()
                    .map(|name| {
                        let (fs, barrier) = (&fs, &barrier);
                        scope.spawn(move || {
                            barrier.wait();
                            fs.lookup(&format!("{name}/x")).unwrap().unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(found[0].path(), "/a/x");
            assert_eq!(found[1].path(), "/b/x");
            assert_eq!(found[0].parent().unwrap().name(), "a");
            assert_eq!(found[1].parent().unwrap().name(), "b");
            let native = found.iter().filter(|e| e.id() == EntryId(30)).count();
            let flagged = found.iter().filter(|e| e.is_reallocated()).count();
            assert_eq!((native, flagged), (1, 1));
        }
    }

    #[test]
    fn deleted_folders_pass_deletion_down() {
        let mut gone = folder(11, "gone", 5);
        gone.deleted = true;
        let fs = filesystem(vec![(0, vec![gone]), (5, vec![file(20, "left.txt", 4)])], &[]);
        assert!(fs.lookup("gone/left.txt").unwrap().unwrap().is_deleted());
    }

    #[test]
    fn lookup_prefers_exact_then_ignores_case() {
        let mut old = file(10, "Report.doc", 1);
        old.deleted = true;
        let fs = filesystem(vec![(0, vec![old, file(11, "Report.doc", 2)])], &[]);
        assert_eq!(fs.lookup("Report.doc").unwrap().unwrap().size(), 2);
        assert_eq!(fs.lookup("REPORT.DOC").unwrap().unwrap().id(), EntryId(10));
        assert!(fs.lookup("missing").unwrap().is_none());
    }

    #[test]
    fn failed_listing_is_retried() {
        let fs = filesystem(vec![(0, vec![folder(11, "bad", 5)])], &[5]);
        let bad = fs.lookup("bad").unwrap().unwrap();
        assert!(bad.children().is_err());
        assert!(bad.children().is_err());
    }

    #[test]
    fn reader_is_capped_at_the_declared_size() {
        let fs = filesystem(vec![(0, vec![file(10, "a.txt", 3)])], &[]);
        let entry = fs.lookup("a.txt").unwrap().unwrap();
        let mut reader = entry.new_reader().unwrap().unwrap();
        assert_eq!(reader.read(100).unwrap(), b"aaa");
        assert!(reader.read(100).unwrap().is_empty());
        assert!(fs.root().new_reader().unwrap().is_none());
    }

    #[test]
    fn tree_marks_deleted_entries() {
        let mut old = file(10, "old.txt", 1);
        old.deleted = true;
        let fs = filesystem(vec![(0, vec![old, folder(11, "docs", 5)])], &[]);
        let tree = fs.display_tree(0).unwrap();
        assert!(tree.contains("x old.txt"));
        assert!(tree.contains("docs/"));
    }
}
