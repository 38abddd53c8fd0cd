//! The worker status file.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const ACTION_WAITING: &str = "-";
pub const ACTION_VALIDATION_SRC: &str = "VALIDATE-SOURCE";
pub const ACTION_VALIDATION_DST: &str = "VALIDATE-DESTINATION";
pub const ACTION_SYNC_FULL_WAIT: &str = "SYNC-FULL-AWAITING-LOCK";
pub const ACTION_SYNC_FULL: &str = "SYNC-FULL";
pub const ACTION_SYNC_PARTIAL_WAIT: &str = "SYNC-PARTIAL-AWAITING-LOCK";
pub const ACTION_SYNC_PARTIAL: &str = "SYNC-PARTIAL";

/// Everything a sync worker reports about itself. `None` timestamps render
/// as `-`.
#[derive(Debug)]
pub struct WorkerStatus {
    pub action: &'static str,
    pub pid: u32,
    pub watcher_pid: Option<u32>,
    pub next_full_sync: Option<SystemTime>,
    pub next_partial_sync: Option<SystemTime>,
    pub last_full_sync: Option<SystemTime>,
    pub last_partial_sync: Option<SystemTime>,
    pub last_failed_full_sync: Option<SystemTime>,
    pub last_failed_partial_sync: Option<SystemTime>,
    pub last_full_sync_status: &'static str,
    pub last_partial_sync_status: &'static str,
    pub full_sync_failures: u32,
    pub partial_sync_failures: u32,
    pub workdir: PathBuf,
}

impl WorkerStatus {
    pub fn new(workdir: PathBuf) -> Self {
        WorkerStatus {
            action: ACTION_WAITING,
            pid: std::process::id(),
            watcher_pid: None,
            next_full_sync: None,
            next_partial_sync: None,
            last_full_sync: None,
            last_partial_sync: None,
            last_failed_full_sync: None,
            last_failed_partial_sync: None,
            last_full_sync_status: "-",
            last_partial_sync_status: "-",
            full_sync_failures: 0,
            partial_sync_failures: 0,
            workdir,
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS` in local time, or `-` when unset.
fn dump_time(time: Option<SystemTime>) -> String {
    match time {
        None => "-".to_string(),
        Some(time) => chrono::DateTime::<chrono::Local>::from(time)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    }
}

/// Rewrite the status file atomically (hidden sibling temp file plus
/// rename), one aligned `key : value` pair per line with a trailing blank
/// line. Skipped once an exit has been requested so a half-torn-down
/// worker never resurrects its status.
pub fn update_status_file(status_file: Option<&Path>, section: &str, status: &WorkerStatus) {
    if watchdir::signal::exit_requested() {
        return;
    }
    let Some(path) = status_file else {
        return;
    };
    if let Err(e) = write_status_file(path, section, status) {
        log::error!("{}: {}", path.display(), e);
    }
}

fn write_status_file(path: &Path, section: &str, status: &WorkerStatus) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .tempfile_in(dir.unwrap_or_else(|| Path::new(".")))?;

    let watcher = match status.watcher_pid {
        Some(pid) => pid.to_string(),
        None => "-".to_string(),
    };

    let out = tmp.as_file_mut();
    writeln!(out, "{:<25}: {}", "section", section)?;
    writeln!(out, "{:<25}: {}", "current action", status.action)?;
    writeln!(out, "{:<25}: {}", "sync process", status.pid)?;
    writeln!(out, "{:<25}: {}", "watcher process", watcher)?;
    writeln!(
        out,
        "{:<25}: {}",
        "last full sync status", status.last_full_sync_status
    )?;
    writeln!(
        out,
        "{:<25}: {}",
        "last partial sync status", status.last_partial_sync_status
    )?;
    writeln!(out, "{:<25}: {}", "last full sync", dump_time(status.last_full_sync))?;
    writeln!(
        out,
        "{:<25}: {}",
        "last partial sync",
        dump_time(status.last_partial_sync)
    )?;
    writeln!(out, "{:<25}: {}", "next full sync", dump_time(status.next_full_sync))?;
    writeln!(
        out,
        "{:<25}: {}",
        "next partial sync",
        dump_time(status.next_partial_sync)
    )?;
    writeln!(
        out,
        "{:<25}: {}",
        "failed full sync",
        dump_time(status.last_failed_full_sync)
    )?;
    writeln!(
        out,
        "{:<25}: {}",
        "failed partial sync",
        dump_time(status.last_failed_partial_sync)
    )?;
    writeln!(
        out,
        "{:<25}: {}",
        "partial sync failures", status.partial_sync_failures
    )?;
    writeln!(out, "{:<25}: {}", "full sync failures", status.full_sync_failures)?;
    writeln!(out, "{:<25}: {}", "working directory", status.workdir.display())?;
    // Trailing blank line so catting a directory of status files stays
    // readable.
    writeln!(out)?;

    use std::os::unix::fs::PermissionsExt;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;

    tmp.persist(path).map_err(|persist| persist.error)?;
    Ok(())
}
