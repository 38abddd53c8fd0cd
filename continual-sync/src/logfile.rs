//! Per-set log file appends.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Append `[YYYY-MM-DD HH:MM:SS] text` to the log file, holding an
/// advisory lock for the duration of the write so lines from concurrent
/// workers sharing one log never interleave. Failures are reported on the
/// debug channel only; logging must never take a sync attempt down.
pub fn log_message(file: Option<&Path>, text: &str) {
    log::debug!("(log) {text}");

    let Some(path) = file else {
        return;
    };

    let mut file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) => {
            log::debug!("(log) {}: {}", path.display(), e);
            return;
        }
    };

    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("[{stamp}] {text}\n");

    let fd = file.as_raw_fd();
    unsafe {
        libc::lockf(fd, libc::F_LOCK, 0);
    }
    if let Err(e) = file.write_all(line.as_bytes()) {
        log::debug!("(log) {}: {}", path.display(), e);
    }
    unsafe {
        libc::lockf(fd, libc::F_ULOCK, 0);
    }
}
