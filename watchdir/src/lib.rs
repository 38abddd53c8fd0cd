//! Watch a directory tree and emit batched changed-path files.
//!
//! `watchdir` maintains an in-memory mirror of a live directory tree,
//! reconciling inotify events with periodic full rescans. Changes are
//! coalesced through a change queue, so a burst of rewrites to one file
//! collapses into a single re-check, and the accumulated changed paths are
//! periodically written out as *batch files*: plain text, one tree-relative
//! path per line, directories suffixed with `/`. Batch files are renamed
//! atomically into the output directory, so a consumer never observes a
//! partially written file, and lexicographic filename order is temporal
//! order.
//!
//! The watcher is single-threaded and cooperative: event dispatch, rescans,
//! queue processing and batch dumping run in strict sequence inside one
//! loop with a bounded 100 ms poll. All tuning parameters live on the
//! watcher itself, so several independent watchers can coexist in one
//! process.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//! use watchdir::{DirWatcher, WatchOptions};
//!
//! fn main() -> watchdir::Result<()> {
//!     let exit = AtomicBool::new(false);
//!     let mut watcher = DirWatcher::new(
//!         Path::new("/srv/data"),
//!         Path::new("/run/changes"),
//!         &WatchOptions::default(),
//!     )?;
//!     watcher.run(&exit)
//! }
//! ```
//!
//! Only Linux is supported; the reconciliation logic leans on inotify
//! delivery semantics.

#![deny(missing_docs)]

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

mod filter;
mod queue;
pub mod signal;
mod tree;
mod watcher;

pub use watcher::{watch, DirWatcher};

/// Maximum number of exclude patterns a single watcher accepts.
pub const MAX_EXCLUDES: usize = 1000;

/// Tuning parameters for a [`DirWatcher`].
///
/// The defaults match the standalone `watchdir` command line tool: a full
/// rescan every two hours, queue runs every two seconds capped at five
/// seconds of work, a batch dump every thirty seconds, and a directory
/// depth limit of twenty.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Interval between full rescans of the whole tree.
    pub full_scan_interval: Duration,
    /// Interval between change queue processing passes.
    pub queue_run_interval: Duration,
    /// Hard wall-clock budget for one queue processing pass.
    pub queue_run_max: Duration,
    /// Interval between changed-path batch dumps.
    pub dump_interval: Duration,
    /// Maximum directory depth below the root; deeper entries are ignored.
    pub max_depth: usize,
    /// Exclude glob patterns. When empty, `*~` and `*.tmp` are excluded.
    pub excludes: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            full_scan_interval: Duration::from_secs(7200),
            queue_run_interval: Duration::from_secs(2),
            queue_run_max: Duration::from_secs(5),
            dump_interval: Duration::from_secs(30),
            max_depth: 20,
            excludes: Vec::new(),
        }
    }
}

/// Error type for watcher operations.
#[derive(Debug)]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// The path involved, where one is known.
    pub path: Option<PathBuf>,
}

/// Classified error cause.
#[derive(Debug)]
pub enum ErrorKind {
    /// An underlying I/O or kernel API failure.
    Io(io::Error),
    /// An exclude pattern failed to parse as a glob.
    BadExclude(String),
}

impl Error {
    pub(crate) fn io(err: io::Error) -> Self {
        Error {
            kind: ErrorKind::Io(err),
            path: None,
        }
    }

    pub(crate) fn bad_exclude(pattern: &str) -> Self {
        Error {
            kind: ErrorKind::BadExclude(pattern.to_string()),
            path: None,
        }
    }

    pub(crate) fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(err) => match &self.path {
                Some(path) => write!(f, "{}: {}", path.display(), err),
                None => err.fmt(f),
            },
            ErrorKind::BadExclude(pattern) => {
                write!(f, "invalid exclude pattern: {pattern}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            ErrorKind::BadExclude(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
