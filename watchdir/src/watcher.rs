//! The watcher event loop.
//!
//! One [`DirWatcher`] owns an inotify instance, the tree mirror, the change
//! queue and the changed-paths set. Its loop waits up to 100 ms for kernel
//! events, then runs whichever of the three periodic jobs are due: enqueue
//! a full rescan, process the change queue under a time budget, dump the
//! changed paths as a batch file.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use mio::unix::pipe::Receiver;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::filter::NameFilter;
use crate::queue::{ChangeQueue, ChangedPaths, Target, FILE_RECHECK_DELAY};
use crate::tree::{DirId, FileChange, FileId, Tree};
use crate::{Error, Result, WatchOptions};

const INOTIFY: Token = Token(0);
const WAKEUP: Token = Token(1);

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MODIFY
        | WatchMask::DELETE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

fn update_mask() -> EventMask {
    EventMask::ATTRIB | EventMask::CREATE | EventMask::MODIFY | EventMask::MOVED_TO
}

fn remove_mask() -> EventMask {
    EventMask::DELETE | EventMask::MOVED_FROM
}

/// Watch one directory tree and write change batches until told to exit.
///
/// See the crate-level documentation for the overall behaviour. All state,
/// including the tuning parameters, is owned by the watcher, so several
/// watchers can run side by side in one process.
pub struct DirWatcher {
    inotify: Inotify,
    poll: Poll,
    wakeup: Option<Receiver>,
    tree: Tree,
    queue: ChangeQueue,
    changed: ChangedPaths,
    filter: NameFilter,
    out_dir: PathBuf,
    full_scan_interval: Duration,
    queue_run_interval: Duration,
    queue_run_max: Duration,
    dump_interval: Duration,
}

impl DirWatcher {
    /// Create a watcher for the tree rooted at `root`, writing change
    /// batches into `out_dir`. Both paths are resolved; they must exist and
    /// be directories, and `out_dir` must not live under `root` (or every
    /// batch write would feed the watcher its own output).
    pub fn new(root: &Path, out_dir: &Path, options: &WatchOptions) -> Result<Self> {
        let filter = NameFilter::new(&options.excludes)?;
        let tree = Tree::new(root, options.max_depth).map_err(|e| Error::io(e).with_path(root))?;
        let out_dir = out_dir
            .canonicalize()
            .map_err(|e| Error::io(e).with_path(out_dir))?;

        let inotify = Inotify::init()?;
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&inotify.as_raw_fd()),
            INOTIFY,
            Interest::READABLE,
        )?;

        Ok(DirWatcher {
            inotify,
            poll,
            wakeup: None,
            tree,
            queue: ChangeQueue::default(),
            changed: ChangedPaths::default(),
            filter,
            out_dir,
            full_scan_interval: options.full_scan_interval,
            queue_run_interval: options.queue_run_interval,
            queue_run_max: options.queue_run_max,
            dump_interval: options.dump_interval,
        })
    }

    /// Register a wakeup pipe (normally the one handed out by
    /// [`signal::install_exit_handlers`]) so a pending exit interrupts the
    /// poll instead of waiting out the 100 ms timeout.
    ///
    /// [`signal::install_exit_handlers`]: crate::signal::install_exit_handlers
    pub fn register_wakeup(&mut self, mut receiver: Receiver) -> Result<()> {
        self.poll
            .registry()
            .register(&mut receiver, WAKEUP, Interest::READABLE)?;
        self.wakeup = Some(receiver);
        Ok(())
    }

    /// Run until `exit` is raised, then unregister every kernel watch and
    /// return. The first loop iteration schedules and runs a full scan, so
    /// the tree is populated (and watched) shortly after startup.
    pub fn run(&mut self, exit: &AtomicBool) -> Result<()> {
        let mut events = Events::with_capacity(16);

        let start = Instant::now();
        let mut next_full_scan = start;
        let mut next_queue_run = start;
        let mut next_dump = start;

        while !exit.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    // A signal landed; the flag check above handles it.
                    continue;
                }
                Err(e) => return Err(Error::io(e)),
            }

            let tokens: Vec<Token> = events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    INOTIFY => self.drain_inotify(),
                    WAKEUP => self.drain_wakeup(),
                    _ => unreachable!(),
                }
            }

            let now = Instant::now();

            if now >= next_full_scan {
                next_full_scan = now + self.full_scan_interval;
                self.queue.push_dir(self.tree.root(), now);
            }

            if now >= next_queue_run {
                next_queue_run = now + self.queue_run_interval;
                self.run_change_queue(now + self.queue_run_max);
            }

            if now >= next_dump {
                next_dump = now + self.dump_interval;
                self.dump_changed_paths();
            }
        }

        self.close();
        Ok(())
    }

    /// Unregister every kernel watch. Called by [`run`](Self::run) on the
    /// way out; idempotent.
    pub fn close(&mut self) {
        let mut watches = self.inotify.watches();
        for wd in self.tree.clear_watches() {
            remove_kernel_watch(&mut watches, wd);
        }
    }

    fn drain_wakeup(&mut self) {
        if let Some(receiver) = &mut self.wakeup {
            let mut buf = [0u8; 64];
            while matches!(receiver.read(&mut buf), Ok(n) if n > 0) {}
        }
    }

    fn drain_inotify(&mut self) {
        let mut buffer = [0u8; 4096];
        loop {
            let owned: Vec<(WatchDescriptor, EventMask, Option<OsString>)> =
                match self.inotify.read_events(&mut buffer) {
                    Ok(events) => events
                        .map(|event| {
                            (
                                event.wd,
                                event.mask,
                                event.name.map(|name| name.to_os_string()),
                            )
                        })
                        .collect(),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("inotify read: {e}");
                        break;
                    }
                };
            if owned.is_empty() {
                break;
            }
            for (wd, mask, name) in owned {
                self.dispatch_event(&wd, mask, name.as_deref());
            }
        }
    }

    fn dispatch_event(&mut self, wd: &WatchDescriptor, mask: EventMask, name: Option<&OsStr>) {
        log::trace!("inotify event: mask={mask:?} name={name:?}");

        if mask.contains(EventMask::Q_OVERFLOW) {
            // The kernel dropped events; schedule a full rescan to pick up
            // whatever was missed.
            log::warn!("inotify queue overflow - scheduling full rescan");
            self.queue.push_dir(self.tree.root(), Instant::now());
            return;
        }

        let Some(dir) = self.tree.lookup_watch(wd) else {
            log::debug!("inotify event for unknown watch descriptor");
            return;
        };

        if mask.contains(EventMask::DELETE_SELF) {
            self.remove_dir_node(dir);
            return;
        }

        let Some(name) = name.filter(|name| !name.is_empty()) else {
            return;
        };

        if mask.contains(EventMask::ISDIR) {
            self.dir_event(dir, name, mask);
        } else {
            self.file_event(dir, name, mask);
        }
    }

    /// A named subdirectory of `parent` was created, updated or deleted.
    fn dir_event(&mut self, parent: DirId, name: &OsStr, mask: EventMask) {
        let known = self.tree.dir_child(parent, name);

        if mask.intersects(update_mask()) {
            if let Some(subdir) = known {
                log::debug!("{}: queueing rescan", self.tree.dir_abs(subdir).display());
                self.queue.push_dir(subdir, Instant::now());
                return;
            }

            if !self.filter.accept(name) {
                return;
            }
            let full_path = self.tree.dir_abs(parent).join(name);
            let Ok(metadata) = fs::symlink_metadata(&full_path) else {
                return;
            };
            if !metadata.is_dir() {
                return;
            }

            log::debug!("{}: adding new subdirectory", full_path.display());
            if let Some(subdir) = self.tree.add_dir(parent, name) {
                self.queue.push_dir(subdir, Instant::now());
                let rel = self.tree.dir_rel(subdir).to_path_buf();
                self.changed.mark(&rel, true);
            }
        } else if mask.intersects(remove_mask()) {
            if let Some(subdir) = known {
                log::debug!("{}: triggering removal", self.tree.dir_abs(subdir).display());
                self.remove_dir_node(subdir);
                let rel = self.tree.dir_rel(parent).to_path_buf();
                self.changed.mark(&rel, true);
            }
        }
    }

    /// A named file in `parent` was created, updated or deleted.
    fn file_event(&mut self, parent: DirId, name: &OsStr, mask: EventMask) {
        let known = self.tree.file_child(parent, name);

        if mask.intersects(update_mask()) {
            if let Some(file) = known {
                // Known file: the delayed re-check reports it if its
                // fingerprint really moved.
                self.queue
                    .push_file(file, Instant::now() + FILE_RECHECK_DELAY);
            } else {
                if !self.filter.accept(name) {
                    return;
                }
                let full_path = self.tree.dir_abs(parent).join(name);
                let Ok(metadata) = fs::symlink_metadata(&full_path) else {
                    return;
                };
                if !metadata.file_type().is_file() {
                    return;
                }

                log::debug!("{}: adding new file", full_path.display());
                let file = self.tree.add_file(parent, name);
                self.queue
                    .push_file(file, Instant::now() + FILE_RECHECK_DELAY);
                let rel = self.tree.dir_rel(parent).to_path_buf();
                self.changed.mark(&rel, true);
            }
        } else if mask.intersects(remove_mask()) {
            if let Some(file) = known {
                log::debug!("{}: triggering removal", self.tree.file_abs(file).display());
                let rel = self.tree.dir_rel(parent).to_path_buf();
                self.changed.mark(&rel, true);
                self.queue.remove_file(file);
                self.tree.remove_file(file);
            }
        }
    }

    /// Cascade-remove a directory node, dropping kernel watches and
    /// tombstoning queue entries for everything underneath. Removal of the
    /// root (its own backing directory vanished) empties the tree but keeps
    /// the root node, so a later rescan can repopulate if it reappears.
    fn remove_dir_node(&mut self, id: DirId) {
        if id == self.tree.root() {
            for subdir in self.tree.dir_children(id) {
                self.remove_dir_node(subdir);
            }
            for file in self.tree.file_children(id) {
                self.queue.remove_file(file);
                self.tree.remove_file(file);
            }
            if let Some(wd) = self.tree.detach_watch(id) {
                remove_kernel_watch(&mut self.inotify.watches(), wd);
            }
            return;
        }

        let removed = self.tree.remove_dir(id);
        let mut watches = self.inotify.watches();
        for wd in removed.watches {
            remove_kernel_watch(&mut watches, wd);
        }
        for dir in removed.dirs {
            self.queue.remove_dir(dir);
        }
        for file in removed.files {
            self.queue.remove_file(file);
        }
    }

    /// Process queued changes in order until everything due has been done
    /// or the `work_until` budget is spent, then compact the queue.
    fn run_change_queue(&mut self, work_until: Instant) {
        if self.queue.len() == 0 {
            return;
        }
        log::debug!("change queue: starting run, queue length {}", self.queue.len());

        let mut idx = 0;
        while idx < self.queue.len() {
            let now = Instant::now();
            if now >= work_until {
                break;
            }
            match self.queue.take_due(idx, now) {
                Some(Target::File(file)) => self.recheck_file(file),
                Some(Target::Dir(dir)) => {
                    log::debug!("{}: triggering scan", self.tree.dir_abs(dir).display());
                    self.scan_dir(dir, false);
                }
                None => {}
            }
            idx += 1;
        }

        self.queue.compact();
        log::debug!("change queue: run ended, queue length {}", self.queue.len());
    }

    /// Re-stat one file from the change queue.
    fn recheck_file(&mut self, file: FileId) {
        log::debug!("{}: checking for changes", self.tree.file_abs(file).display());
        match self.tree.check_file(file) {
            FileChange::Gone => {
                let parent = self.tree.file_parent(file);
                let rel = self.tree.dir_rel(parent).to_path_buf();
                self.changed.mark(&rel, true);
                self.queue.remove_file(file);
                self.tree.remove_file(file);
            }
            FileChange::Changed | FileChange::Populated => {
                let rel = self.tree.file_rel(file).to_path_buf();
                self.changed.mark(&rel, false);
            }
            FileChange::Unchanged => {}
        }
    }

    /// Rescan one directory: reconcile the tree with a sorted listing, drop
    /// vanished children, re-check surviving files, recurse into seen
    /// subdirectories unless `no_recurse`, and ensure a kernel watch is
    /// registered. Returns false when the directory itself is gone (the
    /// node has then been removed).
    fn scan_dir(&mut self, id: DirId, no_recurse: bool) -> bool {
        if self.tree.dir_depth(id) > self.tree.max_depth() {
            log::debug!("{}: too deep - removing", self.tree.dir_abs(id).display());
            self.remove_dir_node(id);
            return false;
        }

        let abs = self.tree.dir_abs(id).to_path_buf();

        let dir_metadata = match fs::symlink_metadata(&abs) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::error!("{}: lstat: {}", abs.display(), e);
                self.remove_dir_node(id);
                return false;
            }
        };

        let mut names: Vec<OsString> = match fs::read_dir(&abs) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name())
                .collect(),
            Err(e) => {
                log::error!("{}: scandir: {}", abs.display(), e);
                self.remove_dir_node(id);
                return false;
            }
        };
        names.sort();

        self.tree.clear_seen(id);

        for name in names {
            if !self.filter.accept(&name) {
                continue;
            }
            let full_path = abs.join(&name);
            let Ok(metadata) = fs::symlink_metadata(&full_path) else {
                continue;
            };

            if metadata.file_type().is_file() {
                let file = self.tree.add_file(id, &name);
                self.tree.set_file_seen(file);
            } else if metadata.file_type().is_dir() {
                if metadata.dev() == dir_metadata.dev() {
                    if let Some(subdir) = self.tree.add_dir(id, &name) {
                        self.tree.set_dir_seen(subdir);
                    }
                } else {
                    log::debug!("{}: skipping - different filesystem", full_path.display());
                }
            }
        }

        // Subdirectories not seen in this pass are gone; the rest are
        // recursed into.
        for subdir in self.tree.dir_children(id) {
            if !self.tree.dir_seen(subdir) {
                self.remove_dir_node(subdir);
            } else if !no_recurse {
                self.scan_dir(subdir, false);
            }
        }

        // Files not seen in this pass are gone.
        for file in self.tree.file_children(id) {
            if !self.tree.file_seen(file) {
                self.queue.remove_file(file);
                self.tree.remove_file(file);
            }
        }

        // Re-check the survivors; first observations fill the fingerprint
        // without reporting, so a startup scan stays quiet.
        for file in self.tree.file_children(id) {
            match self.tree.check_file(file) {
                FileChange::Gone => {
                    self.queue.remove_file(file);
                    self.tree.remove_file(file);
                }
                FileChange::Changed => {
                    let rel = self.tree.file_rel(file).to_path_buf();
                    self.changed.mark(&rel, false);
                }
                FileChange::Populated | FileChange::Unchanged => {}
            }
        }

        if self.tree.dir_watch(id).is_none() {
            log::debug!("{}: adding watch", abs.display());
            match self.inotify.watches().add(&abs, watch_mask()) {
                Ok(wd) => self.tree.set_watch(id, wd),
                Err(e) => log::error!("{}: inotify_add_watch: {}", abs.display(), e),
            }
        }

        true
    }

    fn dump_changed_paths(&mut self) {
        match self.changed.dump(&self.out_dir) {
            Ok(Some(batch)) => log::debug!("wrote change batch {}", batch.display()),
            Ok(None) => {}
            Err(e) => log::error!("{}: {}", self.out_dir.display(), e),
        }
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn remove_kernel_watch(watches: &mut inotify::Watches, wd: WatchDescriptor) {
    if let Err(e) = watches.remove(wd) {
        // EINVAL just means the kernel already dropped the watch when the
        // directory was deleted.
        if e.raw_os_error() != Some(libc::EINVAL) {
            log::error!("inotify_rm_watch: {e}");
        }
    }
}

/// Watch `root`, writing change batches into `out_dir`, until `exit` is
/// raised. Blocks for the whole watch; cleans up all kernel watches and
/// tree state before returning.
pub fn watch(root: &Path, out_dir: &Path, options: &WatchOptions, exit: &AtomicBool) -> Result<()> {
    let mut watcher = DirWatcher::new(root, out_dir, options)?;
    watcher.run(exit)
}
