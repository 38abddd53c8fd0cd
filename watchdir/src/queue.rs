//! The change queue and the changed-paths set.
//!
//! Both structures deliberately trade cleverness for predictability: the
//! queue is an ordered vector walked front to back under a time budget, and
//! the changed-paths set dedupes with a linear scan. Their sizes are
//! bounded by the number of live nodes and the dump interval respectively.

use std::ffi::OsString;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::tree::{DirId, FileId};

/// How long a file re-check is delayed after an event, to absorb rapid
/// rewrites of the same file into a single stat.
pub(crate) const FILE_RECHECK_DELAY: Duration = Duration::from_secs(2);

/// What a queue entry asks to be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Re-stat one file.
    File(FileId),
    /// Rescan one directory (recursively).
    Dir(DirId),
}

#[derive(Debug)]
struct Slot {
    when: Instant,
    target: Option<Target>,
}

/// Ordered queue of pending re-checks and rescans.
///
/// At most one active entry exists per target node; a cleared slot is a
/// tombstone and is compacted out by [`ChangeQueue::compact`] after each
/// processing pass.
#[derive(Debug, Default)]
pub(crate) struct ChangeQueue {
    slots: Vec<Slot>,
}

impl ChangeQueue {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, target: Target, when: Instant) {
        if self.slots.iter().any(|slot| slot.target == Some(target)) {
            return;
        }
        log::debug!("adding to change queue: {target:?}");
        self.slots.push(Slot {
            when,
            target: Some(target),
        });
    }

    pub(crate) fn push_file(&mut self, id: FileId, when: Instant) {
        self.push(Target::File(id), when);
    }

    pub(crate) fn push_dir(&mut self, id: DirId, when: Instant) {
        self.push(Target::Dir(id), when);
    }

    /// Tombstone any entry targeting a removed file.
    pub(crate) fn remove_file(&mut self, id: FileId) {
        for slot in &mut self.slots {
            if slot.target == Some(Target::File(id)) {
                slot.target = None;
            }
        }
    }

    /// Tombstone any entry targeting a removed directory.
    pub(crate) fn remove_dir(&mut self, id: DirId) {
        for slot in &mut self.slots {
            if slot.target == Some(Target::Dir(id)) {
                slot.target = None;
            }
        }
    }

    /// Take the target at `idx` if it is due, leaving a tombstone behind.
    /// Entries scheduled in the future stay put.
    pub(crate) fn take_due(&mut self, idx: usize, now: Instant) -> Option<Target> {
        let slot = &mut self.slots[idx];
        if slot.when > now {
            return None;
        }
        slot.target.take()
    }

    /// Drop tombstones, preserving the order of the remaining entries.
    pub(crate) fn compact(&mut self) {
        self.slots.retain(|slot| slot.target.is_some());
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.target.is_some()).count()
    }
}

/// Accumulated tree-relative changed paths, directories suffixed `/`.
#[derive(Debug, Default)]
pub(crate) struct ChangedPaths {
    paths: Vec<OsString>,
}

impl ChangedPaths {
    pub(crate) fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.paths.len()
    }

    /// Record a changed path, deduplicating against everything pending.
    pub(crate) fn mark(&mut self, rel: &Path, is_dir: bool) {
        let mut path = rel.as_os_str().to_os_string();
        if is_dir {
            path.push("/");
        }
        if self.paths.iter().any(|existing| *existing == path) {
            return;
        }
        log::debug!("adding to changed paths: {}", Path::new(&path).display());
        self.paths.push(path);
    }

    /// Write all pending paths to a batch file in `out_dir` named
    /// `YYYYMMDD-HHMMSS.<pid>`, via a hidden sibling temp file renamed
    /// into place. The pending list is cleared only once the rename has
    /// succeeded; on failure everything is kept for the next dump.
    ///
    /// Returns the batch path, or `None` when there was nothing to write.
    pub(crate) fn dump(&mut self, out_dir: &Path) -> io::Result<Option<PathBuf>> {
        if self.paths.is_empty() {
            return Ok(None);
        }

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let batch_path = out_dir.join(format!("{}.{}", stamp, std::process::id()));

        let mut tmp = tempfile::Builder::new().prefix(".").tempfile_in(out_dir)?;
        for path in &self.paths {
            tmp.as_file_mut().write_all(path.as_bytes())?;
            tmp.as_file_mut().write_all(b"\n")?;
        }
        tmp.persist(&batch_path).map_err(|persist| persist.error)?;

        self.paths.clear();
        Ok(Some(batch_path))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, text: &str) -> bool {
        self.paths
            .iter()
            .any(|path| path.as_os_str() == std::ffi::OsStr::new(text))
    }
}
