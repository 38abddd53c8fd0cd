//! Invocation of the external transfer helper, the cross-set sync lock,
//! and transfer-list collation.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::logfile::log_message;

/// Advisory whole-file lock serialising transfer-helper runs across every
/// sync set sharing the same lock path.
///
/// The lock file is opened append-only with mode 0600 and locked with
/// `lockf`; the lock is released and the file closed on drop. `lockf` is
/// the one unbounded wait in the worker, and delivery of an exit signal
/// interrupts it: the pending acquisition fails and the caller's loop sees
/// the exit flag.
pub struct SyncLock {
    file: File,
}

impl SyncLock {
    pub fn acquire(path: &Path) -> io::Result<SyncLock> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)?;
        loop {
            let rc = unsafe { libc::lockf(file.as_raw_fd(), libc::F_LOCK, 0) };
            if rc == 0 {
                return Ok(SyncLock { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted && !watchdir::signal::exit_requested() {
                continue;
            }
            return Err(err);
        }
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        unsafe {
            libc::lockf(self.file.as_raw_fd(), libc::F_ULOCK, 0);
        }
    }
}

/// Runs the transfer helper. The program defaults to `rsync` resolved via
/// `PATH`; tests substitute a stub.
#[derive(Debug, Clone)]
pub struct RsyncRunner {
    program: PathBuf,
}

impl Default for RsyncRunner {
    fn default() -> Self {
        RsyncRunner {
            program: PathBuf::from("rsync"),
        }
    }
}

impl RsyncRunner {
    #[cfg(test)]
    pub fn with_program(program: PathBuf) -> Self {
        RsyncRunner { program }
    }

    /// Run the helper and return its exit status (-1 when it could not be
    /// run, died to a signal, or was terminated because an exit was
    /// requested mid-transfer).
    ///
    /// The option string is word-expanded shell-style without command
    /// substitution; argv is composed as
    /// `[rsync, options.., --files-from LIST, --exclude-from FILE, source,
    /// destination]`. The helper's stderr goes to `stderr_file`, which is
    /// recreated each run and afterwards tailed into the log file with an
    /// `rsync:` prefix.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        log_file: Option<&Path>,
        section: &str,
        source: &str,
        destination: &str,
        excludes_file: &Path,
        options: &str,
        transfer_list: Option<&Path>,
        stderr_file: &Path,
    ) -> i32 {
        let Some(words) = shlex::split(options) else {
            log::error!("{section}: bad rsync options: [{options}]");
            return -1;
        };

        let _ = std::fs::remove_file(stderr_file);
        let stderr = match OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o600)
            .open(stderr_file)
        {
            Ok(file) => file,
            Err(e) => {
                log::error!("{}: {}", stderr_file.display(), e);
                return -1;
            }
        };

        let mut command = std::process::Command::new(&self.program);
        command.args(&words);
        if let Some(list) = transfer_list {
            command.arg("--files-from").arg(list);
        }
        command.arg("--exclude-from").arg(excludes_file);
        command.arg(source).arg(destination);
        command.stdin(Stdio::null()).stderr(stderr);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("{}: {}", self.program.display(), e);
                return -1;
            }
        };
        log::debug!("(rsync) process spawned: {}", child.id());

        let rc = loop {
            if watchdir::signal::exit_requested() {
                log::debug!("(rsync) killing rsync process: {}", child.id());
                unsafe {
                    libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
                }
                let _ = child.wait();
                break -1;
            }
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(e) => {
                    log_message(
                        log_file,
                        &format!("[{section}] failed to wait for rsync: {e}"),
                    );
                    break -1;
                }
            }
        };
        log::debug!("(rsync) process ended, exit status: {rc}");

        self.report_stderr(log_file, section, stderr_file, rc);
        rc
    }

    /// Copy the helper's captured stderr into the log, then record the
    /// exit status. Nothing is logged for a clean, quiet run.
    fn report_stderr(&self, log_file: Option<&Path>, section: &str, stderr_file: &Path, rc: i32) {
        let Ok(metadata) = std::fs::metadata(stderr_file) else {
            return;
        };
        if metadata.len() == 0 {
            return;
        }
        let Ok(file) = File::open(stderr_file) else {
            log::error!("{}: unreadable", stderr_file.display());
            return;
        };
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            log_message(log_file, &format!("[{section}] rsync: {line}"));
        }
        log_message(
            log_file,
            &format!("[{section}] rsync failed with exit status: {rc}"),
        );
    }
}

/// Collate the change-queue directory into the transfer list: batch files
/// are read in sorted (temporal) order, their lines deduplicated across
/// this collation, and lines whose `source/line` still exists appended to
/// the list. Every batch file is deleted once handled, readable or not.
pub fn collate_transfer_list(
    change_queue: &Path,
    transfer_list: &Path,
    source: &str,
    section: &str,
) {
    let mut list = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(transfer_list)
    {
        Ok(file) => file,
        Err(e) => {
            log::error!("{section}: {}: {}", transfer_list.display(), e);
            return;
        }
    };

    let mut batches: Vec<PathBuf> = match std::fs::read_dir(change_queue) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect(),
        Err(e) => {
            log::error!("{section}: {}: {}", change_queue.display(), e);
            return;
        }
    };
    batches.sort();

    let mut seen: BTreeSet<Vec<u8>> = BTreeSet::new();

    for batch in batches {
        let name = batch.file_name().unwrap_or_default().to_os_string();
        if name.as_bytes().starts_with(b".") {
            continue;
        }
        let Ok(metadata) = std::fs::symlink_metadata(&batch) else {
            continue;
        };
        if !metadata.file_type().is_file() {
            continue;
        }

        let file = match File::open(&batch) {
            Ok(file) => file,
            Err(e) => {
                log::debug!("{}: {}", batch.display(), e);
                let _ = std::fs::remove_file(&batch);
                continue;
            }
        };

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            if seen.contains(&line) {
                log::debug!(
                    "skipping duplicate change line: {}",
                    String::from_utf8_lossy(&line)
                );
                continue;
            }
            seen.insert(line.clone());

            let changed_path = Path::new(source).join(Path::new(OsStr::from_bytes(&line)));
            if std::fs::symlink_metadata(&changed_path).is_ok() {
                let _ = list.write_all(&line);
                let _ = list.write_all(b"\n");
            }
        }

        let _ = std::fs::remove_file(&batch);
    }
}
