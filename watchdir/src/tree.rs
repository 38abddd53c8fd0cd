//! In-memory mirror of the watched directory tree.
//!
//! Nodes live in index-addressed arenas with free lists: parents refer to
//! children, children to parents, and the watch index to directories all by
//! [`DirId`]/[`FileId`] rather than by pointer, which makes cascade removal
//! a plain walk and lets the borrow checker stay out of the way. Node ids
//! are only handed out while the node is live; the change queue tombstones
//! entries for removed nodes before their slot can be reused.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use inotify::WatchDescriptor;

/// Index of a live directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DirId(usize);

/// Index of a live file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileId(usize);

/// Last observed stat fingerprint of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileState {
    pub mtime: i64,
    pub size: u64,
}

impl FileState {
    pub(crate) fn of(metadata: &Metadata) -> Self {
        FileState {
            mtime: metadata.mtime(),
            size: metadata.size(),
        }
    }
}

/// Outcome of re-statting a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileChange {
    /// The stored fingerprint still matches.
    Unchanged,
    /// First observation; the fingerprint was recorded.
    Populated,
    /// The fingerprint differed and has been updated.
    Changed,
    /// The file is gone or is no longer a regular file.
    Gone,
}

#[derive(Debug)]
struct FileNode {
    name: OsString,
    abs_path: PathBuf,
    parent: DirId,
    state: Option<FileState>,
    seen_in_rescan: bool,
}

#[derive(Debug)]
struct DirNode {
    name: OsString,
    abs_path: PathBuf,
    depth: usize,
    parent: Option<DirId>,
    watch: Option<WatchDescriptor>,
    dirs: HashMap<OsString, DirId>,
    files: HashMap<OsString, FileId>,
    seen_in_rescan: bool,
}

/// Everything torn down by one cascade removal, for the caller to
/// unregister kernel watches and tombstone queue entries with.
#[derive(Debug, Default)]
pub(crate) struct Removed {
    pub watches: Vec<WatchDescriptor>,
    pub dirs: Vec<DirId>,
    pub files: Vec<FileId>,
}

pub(crate) struct Tree {
    root: DirId,
    root_path: PathBuf,
    dirs: Vec<Option<DirNode>>,
    dir_free: Vec<usize>,
    files: Vec<Option<FileNode>>,
    file_free: Vec<usize>,
    watch_index: HashMap<WatchDescriptor, DirId>,
    max_depth: usize,
}

impl Tree {
    /// Build a tree rooted at `root_path`, which is canonicalised first so
    /// every node carries a resolved absolute path.
    pub(crate) fn new(root_path: &Path, max_depth: usize) -> io::Result<Self> {
        let root_path = root_path.canonicalize()?;
        let root_node = DirNode {
            name: OsString::new(),
            abs_path: root_path.clone(),
            depth: 0,
            parent: None,
            watch: None,
            dirs: HashMap::new(),
            files: HashMap::new(),
            seen_in_rescan: false,
        };
        Ok(Tree {
            root: DirId(0),
            root_path,
            dirs: vec![Some(root_node)],
            dir_free: Vec::new(),
            files: Vec::new(),
            file_free: Vec::new(),
            watch_index: HashMap::new(),
            max_depth,
        })
    }

    pub(crate) fn root(&self) -> DirId {
        self.root
    }

    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn dir(&self, id: DirId) -> &DirNode {
        self.dirs[id.0].as_ref().expect("live DirId")
    }

    fn dir_mut(&mut self, id: DirId) -> &mut DirNode {
        self.dirs[id.0].as_mut().expect("live DirId")
    }

    fn file(&self, id: FileId) -> &FileNode {
        self.files[id.0].as_ref().expect("live FileId")
    }

    fn file_mut(&mut self, id: FileId) -> &mut FileNode {
        self.files[id.0].as_mut().expect("live FileId")
    }

    pub(crate) fn dir_abs(&self, id: DirId) -> &Path {
        &self.dir(id).abs_path
    }

    /// Path of a directory relative to the root; the root itself is `""`.
    pub(crate) fn dir_rel(&self, id: DirId) -> &Path {
        self.dir(id)
            .abs_path
            .strip_prefix(&self.root_path)
            .expect("node path under root")
    }

    pub(crate) fn dir_depth(&self, id: DirId) -> usize {
        self.dir(id).depth
    }

    pub(crate) fn dir_watch(&self, id: DirId) -> Option<&WatchDescriptor> {
        self.dir(id).watch.as_ref()
    }

    pub(crate) fn dir_seen(&self, id: DirId) -> bool {
        self.dir(id).seen_in_rescan
    }

    pub(crate) fn set_dir_seen(&mut self, id: DirId) {
        self.dir_mut(id).seen_in_rescan = true;
    }

    pub(crate) fn file_abs(&self, id: FileId) -> &Path {
        &self.file(id).abs_path
    }

    pub(crate) fn file_rel(&self, id: FileId) -> &Path {
        self.file(id)
            .abs_path
            .strip_prefix(&self.root_path)
            .expect("node path under root")
    }

    pub(crate) fn file_parent(&self, id: FileId) -> DirId {
        self.file(id).parent
    }

    pub(crate) fn file_seen(&self, id: FileId) -> bool {
        self.file(id).seen_in_rescan
    }

    pub(crate) fn set_file_seen(&mut self, id: FileId) {
        self.file_mut(id).seen_in_rescan = true;
    }

    pub(crate) fn dir_child(&self, parent: DirId, name: &OsStr) -> Option<DirId> {
        self.dir(parent).dirs.get(name).copied()
    }

    pub(crate) fn file_child(&self, parent: DirId, name: &OsStr) -> Option<FileId> {
        self.dir(parent).files.get(name).copied()
    }

    pub(crate) fn dir_children(&self, parent: DirId) -> Vec<DirId> {
        self.dir(parent).dirs.values().copied().collect()
    }

    pub(crate) fn file_children(&self, parent: DirId) -> Vec<FileId> {
        self.dir(parent).files.values().copied().collect()
    }

    /// Clear the rescan markers on all immediate children of `parent`.
    pub(crate) fn clear_seen(&mut self, parent: DirId) {
        let dirs = self.dir_children(parent);
        let files = self.file_children(parent);
        for id in dirs {
            self.dir_mut(id).seen_in_rescan = false;
        }
        for id in files {
            self.file_mut(id).seen_in_rescan = false;
        }
    }

    /// Add a subdirectory under `parent`, or return the existing node.
    /// Returns `None` when the child would exceed the depth limit.
    pub(crate) fn add_dir(&mut self, parent: DirId, name: &OsStr) -> Option<DirId> {
        if self.dir(parent).depth >= self.max_depth {
            log::debug!(
                "{}: too deep - not adding",
                self.dir(parent).abs_path.join(name).display()
            );
            return None;
        }
        if let Some(existing) = self.dir(parent).dirs.get(name) {
            return Some(*existing);
        }

        let node = DirNode {
            name: name.to_os_string(),
            abs_path: self.dir(parent).abs_path.join(name),
            depth: self.dir(parent).depth + 1,
            parent: Some(parent),
            watch: None,
            dirs: HashMap::new(),
            files: HashMap::new(),
            seen_in_rescan: false,
        };
        let id = match self.dir_free.pop() {
            Some(slot) => {
                self.dirs[slot] = Some(node);
                DirId(slot)
            }
            None => {
                self.dirs.push(Some(node));
                DirId(self.dirs.len() - 1)
            }
        };
        self.dir_mut(parent).dirs.insert(name.to_os_string(), id);
        Some(id)
    }

    /// Add a file under `parent`, or return the existing node.
    pub(crate) fn add_file(&mut self, parent: DirId, name: &OsStr) -> FileId {
        if let Some(existing) = self.dir(parent).files.get(name) {
            return *existing;
        }

        let node = FileNode {
            name: name.to_os_string(),
            abs_path: self.dir(parent).abs_path.join(name),
            parent,
            state: None,
            seen_in_rescan: false,
        };
        let id = match self.file_free.pop() {
            Some(slot) => {
                self.files[slot] = Some(node);
                FileId(slot)
            }
            None => {
                self.files.push(Some(node));
                FileId(self.files.len() - 1)
            }
        };
        self.dir_mut(parent).files.insert(name.to_os_string(), id);
        id
    }

    /// Detach and free a file node.
    pub(crate) fn remove_file(&mut self, id: FileId) {
        let node = self.files[id.0].take().expect("live FileId");
        log::debug!("{}: removing from file list", node.abs_path.display());
        if let Some(parent) = self.dirs[node.parent.0].as_mut() {
            parent.files.remove(&node.name);
        }
        self.file_free.push(id.0);
    }

    /// Detach and free a directory node together with everything below it.
    ///
    /// Watch descriptors of removed directories are unregistered from the
    /// watch index and returned so the caller can drop the kernel watches;
    /// removed node ids are returned so the caller can tombstone any
    /// change-queue entries that still reference them.
    pub(crate) fn remove_dir(&mut self, id: DirId) -> Removed {
        let mut removed = Removed::default();
        // Detach from the parent before freeing the subtree.
        let (parent, name) = {
            let node = self.dir(id);
            (node.parent, node.name.clone())
        };
        if let Some(parent) = parent {
            self.dir_mut(parent).dirs.remove(&name);
        }
        self.free_dir(id, &mut removed);
        removed
    }

    fn free_dir(&mut self, id: DirId, removed: &mut Removed) {
        let node = self.dirs[id.0].take().expect("live DirId");
        log::debug!("{}: removing from directory list", node.abs_path.display());
        if let Some(wd) = node.watch {
            self.watch_index.remove(&wd);
            removed.watches.push(wd);
        }
        for (_, file) in node.files {
            let file_node = self.files[file.0].take().expect("live FileId");
            log::debug!("{}: removing from file list", file_node.abs_path.display());
            self.file_free.push(file.0);
            removed.files.push(file);
        }
        for (_, subdir) in node.dirs {
            self.free_dir(subdir, removed);
        }
        self.dir_free.push(id.0);
        removed.dirs.push(id);
    }

    /// Record a kernel watch for a directory in the watch index.
    pub(crate) fn set_watch(&mut self, id: DirId, wd: WatchDescriptor) {
        self.watch_index.insert(wd.clone(), id);
        self.dir_mut(id).watch = Some(wd);
    }

    pub(crate) fn lookup_watch(&self, wd: &WatchDescriptor) -> Option<DirId> {
        self.watch_index.get(wd).copied()
    }

    /// Drop a single directory's watch registration, returning the
    /// descriptor so the caller can remove the kernel watch.
    pub(crate) fn detach_watch(&mut self, id: DirId) -> Option<WatchDescriptor> {
        let wd = self.dir_mut(id).watch.take()?;
        self.watch_index.remove(&wd);
        Some(wd)
    }

    /// Forget every registered watch, returning the descriptors so the
    /// caller can remove them from the kernel. Used at shutdown.
    pub(crate) fn clear_watches(&mut self) -> Vec<WatchDescriptor> {
        let descriptors: Vec<WatchDescriptor> = self.watch_index.keys().cloned().collect();
        for id in self.watch_index.values().copied().collect::<Vec<_>>() {
            self.dir_mut(id).watch = None;
        }
        self.watch_index.clear();
        descriptors
    }

    #[cfg(test)]
    pub(crate) fn watch_count(&self) -> usize {
        self.watch_index.len()
    }

    /// Re-stat a tracked file and reconcile the stored fingerprint.
    pub(crate) fn check_file(&mut self, id: FileId) -> FileChange {
        let abs = self.file(id).abs_path.clone();
        let metadata = match std::fs::symlink_metadata(&abs) {
            Ok(metadata) => metadata,
            Err(_) => return FileChange::Gone,
        };
        if !metadata.file_type().is_file() {
            return FileChange::Gone;
        }

        let fresh = FileState::of(&metadata);
        let node = self.file_mut(id);
        match node.state {
            Some(old) if old == fresh => FileChange::Unchanged,
            Some(_) => {
                log::debug!("{}: file changed", abs.display());
                node.state = Some(fresh);
                FileChange::Changed
            }
            None => {
                node.state = Some(fresh);
                FileChange::Populated
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live_dirs(&self) -> usize {
        self.dirs.iter().filter(|slot| slot.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn live_files(&self) -> usize {
        self.files.iter().filter(|slot| slot.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn dir_parent(&self, id: DirId) -> Option<DirId> {
        self.dir(id).parent
    }
}
