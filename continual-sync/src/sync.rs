//! The per-set sync worker.
//!
//! One worker process owns one sync set for its lifetime: it keeps a
//! watcher child running over the source tree, schedules full and partial
//! syncs with their retry intervals, maintains the status and log files,
//! and tears everything down when asked to exit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use crate::config::SyncSet;
use crate::logfile::log_message;
use crate::rsync::{collate_transfer_list, RsyncRunner, SyncLock};
use crate::status::{
    update_status_file, WorkerStatus, ACTION_SYNC_FULL, ACTION_SYNC_FULL_WAIT,
    ACTION_SYNC_PARTIAL, ACTION_SYNC_PARTIAL_WAIT, ACTION_VALIDATION_DST, ACTION_VALIDATION_SRC,
    ACTION_WAITING,
};

use watchdir::signal;

const DEFAULT_FULL_RSYNC_OPTS: &str = "--delete -axH";
const DEFAULT_PARTIAL_RSYNC_OPTS: &str = "--delete -dlptgoDH";
const DEFAULT_TEMPDIR: &str = "/tmp";

/// How the worker re-invokes its own executable to start children.
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub config_files: Vec<PathBuf>,
    pub debug: bool,
}

pub struct Worker {
    set: SyncSet,
    ctx: SpawnContext,
    status: WorkerStatus,
    workdir: PathBuf,
    excludes_file: PathBuf,
    rsync_error_file: PathBuf,
    transfer_list: PathBuf,
    change_queue: PathBuf,
    watcher: Option<Child>,
    runner: RsyncRunner,
}

impl Worker {
    /// Set up the private working directory and the files living in it,
    /// and derive the initial schedule from the marker files.
    pub fn new(set: SyncSet, ctx: SpawnContext) -> std::io::Result<Worker> {
        let tempdir = set
            .tempdir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPDIR));
        let workdir = tempfile::Builder::new()
            .prefix("sync")
            .tempdir_in(&tempdir)?
            .into_path();
        log::debug!("temporary working directory: {}", workdir.display());

        let rsync_error_file = workdir.join("rsync-stderr");

        let excludes_file = workdir.join("excludes");
        let mut excludes = std::fs::File::create(&excludes_file)?;
        if set.excludes.is_empty() {
            excludes.write_all(b"*.tmp\n*~\n")?;
        } else {
            for pattern in &set.excludes {
                writeln!(excludes, "{pattern}")?;
            }
        }
        drop(excludes);

        let transfer_list = match &set.transfer_list {
            Some(path) => path.clone(),
            None => {
                let path = workdir.join("transfer");
                log::debug!("automatically set transfer list: {}", path.display());
                path
            }
        };

        let change_queue = match &set.change_queue {
            Some(path) => path.clone(),
            None => {
                let path = workdir.join("changes");
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new().mode(0o700).create(&path)?;
                log::debug!("automatically set change queue: {}", path.display());
                path
            }
        };

        let mut status = WorkerStatus::new(workdir.clone());

        if let Some(marker) = &set.full_marker {
            if let Ok(metadata) = std::fs::metadata(marker) {
                if let Ok(mtime) = metadata.modified() {
                    status.next_full_sync = Some(mtime + Duration::from_secs(set.full_interval));
                }
            }
        }
        if let Some(marker) = &set.partial_marker {
            if let Ok(metadata) = std::fs::metadata(marker) {
                if let Ok(mtime) = metadata.modified() {
                    status.next_partial_sync =
                        Some(mtime + Duration::from_secs(set.partial_interval));
                }
            }
        }

        Ok(Worker {
            set,
            ctx,
            status,
            workdir,
            excludes_file,
            rsync_error_file,
            transfer_list,
            change_queue,
            watcher: None,
            runner: RsyncRunner::default(),
        })
    }

    fn log(&self, message: &str) {
        log_message(
            self.set.log_file.as_deref(),
            &format!("[{}] {}", self.set.name, message),
        );
    }

    fn update_status(&self) {
        update_status_file(self.set.status_file.as_deref(), &self.set.name, &self.status);
    }

    /// The worker main loop; returns when an exit has been requested.
    pub fn run(&mut self) {
        self.log("process started");
        if let Some(next) = self.status.next_full_sync {
            self.log(&format!(
                "used full sync marker file - next full sync: {}",
                chrono::DateTime::<chrono::Local>::from(next).format("%Y-%m-%d %H:%M:%S")
            ));
        }
        if let Some(next) = self.status.next_partial_sync {
            self.log(&format!(
                "used partial sync marker file - next partial sync: {}",
                chrono::DateTime::<chrono::Local>::from(next).format("%Y-%m-%d %H:%M:%S")
            ));
        }
        self.update_status();

        while !signal::exit_requested() {
            let mut check_workdir = false;

            if self.watcher.is_none() && self.set.partial_interval > 0 {
                if self.run_validation(
                    self.set.source_validation.clone(),
                    "source",
                    ACTION_VALIDATION_SRC,
                ) {
                    self.spawn_watcher();
                } else {
                    self.status.action = ACTION_WAITING;
                    self.update_status();
                    sleep_checking_exit(Duration::from_secs(5));
                }
            }

            if self.set.full_interval > 0 && due(self.status.next_full_sync) {
                check_workdir = true;
                if self.run_validation(
                    self.set.source_validation.clone(),
                    "source",
                    ACTION_VALIDATION_SRC,
                ) && self.run_validation(
                    self.set.destination_validation.clone(),
                    "destination",
                    ACTION_VALIDATION_DST,
                ) {
                    if self.sync_full() {
                        self.status.next_full_sync =
                            Some(SystemTime::now() + Duration::from_secs(self.set.full_interval));
                    } else {
                        self.status.next_full_sync =
                            Some(SystemTime::now() + Duration::from_secs(self.set.full_retry));
                        self.status.last_failed_full_sync = Some(SystemTime::now());
                        self.status.full_sync_failures += 1;
                        self.status.last_full_sync_status = "FAILED";
                    }
                } else {
                    self.status.next_full_sync =
                        Some(SystemTime::now() + Duration::from_secs(self.set.full_retry));
                }
                self.status.action = ACTION_WAITING;
                self.update_status();
            }

            if self.watcher.is_some() && due(self.status.next_partial_sync) {
                check_workdir = true;
                if self.run_validation(
                    self.set.source_validation.clone(),
                    "source",
                    ACTION_VALIDATION_SRC,
                ) && self.run_validation(
                    self.set.destination_validation.clone(),
                    "destination",
                    ACTION_VALIDATION_DST,
                ) {
                    if self.sync_partial() {
                        self.status.next_partial_sync = Some(
                            SystemTime::now() + Duration::from_secs(self.set.partial_interval),
                        );
                    } else {
                        self.status.next_partial_sync =
                            Some(SystemTime::now() + Duration::from_secs(self.set.partial_retry));
                        self.status.last_failed_partial_sync = Some(SystemTime::now());
                        self.status.partial_sync_failures += 1;
                        self.status.last_partial_sync_status = "FAILED";
                    }
                } else {
                    self.status.next_partial_sync =
                        Some(SystemTime::now() + Duration::from_secs(self.set.partial_retry));
                }
                self.status.action = ACTION_WAITING;
                self.update_status();
            }

            let watcher_exited = match &mut self.watcher {
                Some(watcher) => matches!(watcher.try_wait(), Ok(Some(_)) | Err(_)),
                None => false,
            };
            if watcher_exited {
                check_workdir = true;
                self.watcher = None;
                self.status.watcher_pid = None;
                self.log("watcher process ended");
            }

            if check_workdir && !self.workdir.exists() {
                self.log("working directory disappeared - exiting");
                signal::request_exit();
            }

            if !signal::exit_requested() {
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            unsafe {
                libc::kill(watcher.id() as libc::pid_t, libc::SIGTERM);
            }
            let _ = watcher.wait();
        }

        recursively_delete(&self.workdir);

        if let Some(status_file) = &self.set.status_file {
            let _ = std::fs::remove_file(status_file);
        }
        self.log("process ended");
    }

    /// Start the watcher child over the source directory, re-invoking this
    /// executable in its hidden watcher mode.
    fn spawn_watcher(&mut self) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                log::error!("current_exe: {e}");
                return;
            }
        };
        let mut command = Command::new(exe);
        command
            .arg("--watcher")
            .arg(&self.set.name)
            .arg("--change-queue")
            .arg(&self.change_queue);
        for file in &self.ctx.config_files {
            command.arg("-c").arg(file);
        }
        if self.ctx.debug {
            command.arg("-d");
        }

        match command.spawn() {
            Ok(child) => {
                self.status.watcher_pid = Some(child.id());
                self.log(&format!("started new watcher: {}", child.id()));
                self.watcher = Some(child);
            }
            Err(e) => log::error!("starting watcher: {e}"),
        }
    }

    /// Run a validation command through the shell, if one is configured.
    /// Returns true when validation passed (or none was configured). A
    /// command killed by a signal is a deliberate abort: the exit flag is
    /// raised.
    fn run_validation(&mut self, command: Option<String>, which: &str, action: &'static str) -> bool {
        let Some(command) = command else {
            return true;
        };
        log::debug!(
            "(sync) [{}] running {} validation: [{}]",
            self.set.name,
            which,
            command
        );

        self.status.action = action;
        self.update_status();

        let status = Command::new("/bin/sh").arg("-c").arg(&command).status();
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.log(&format!("{which}: validation command failed to run: {e}"));
                return false;
            }
        };

        use std::os::unix::process::ExitStatusExt;
        if let Some(signum) = status.signal() {
            self.log(&format!(
                "{which}: validation command received a signal: {signum}"
            ));
            signal::request_exit();
            return false;
        }

        match status.code() {
            Some(0) => true,
            Some(code) => {
                self.log(&format!(
                    "{which}: validation command gave non-zero exit status: {code}"
                ));
                false
            }
            None => false,
        }
    }

    fn acquire_sync_lock(&mut self, kind: &str, waiting_action: &'static str) -> Option<SyncLock> {
        let lock_path = self.set.sync_lock.clone()?;
        self.status.action = waiting_action;
        self.update_status();
        self.log(&format!("{kind}: acquiring sync lock"));
        match SyncLock::acquire(&lock_path) {
            Ok(lock) => {
                self.log(&format!("{kind}: sync lock acquired"));
                Some(lock)
            }
            Err(e) => {
                // Run unlocked rather than not at all; an exit request that
                // interrupted the wait stops the transfer immediately anyway.
                log::debug!("(lock) {}: {}", lock_path.display(), e);
                None
            }
        }
    }

    /// Run a full sync. On success the full marker is touched and the
    /// failure accounting reset.
    fn sync_full(&mut self) -> bool {
        let lock = self.acquire_sync_lock("full sync", ACTION_SYNC_FULL_WAIT);

        self.status.action = ACTION_SYNC_FULL;
        self.update_status();
        self.log("full sync: sync starting");

        let options = self
            .set
            .full_rsync_opts
            .as_deref()
            .unwrap_or(DEFAULT_FULL_RSYNC_OPTS);
        let rc = self.runner.run(
            self.set.log_file.as_deref(),
            &self.set.name,
            &self.set.source,
            &self.set.destination,
            &self.excludes_file,
            options,
            None,
            &self.rsync_error_file,
        );

        self.log(&format!(
            "full sync: sync ended: {}",
            if rc == 0 { "OK" } else { "FAILED" }
        ));
        drop(lock);

        if rc == 0 {
            self.touch_marker(self.set.full_marker.clone());
            self.status.last_full_sync = Some(SystemTime::now());
            self.status.full_sync_failures = 0;
            self.status.last_full_sync_status = "OK";
        }
        rc == 0
    }

    /// Run a partial sync from the collated transfer list. Returns true
    /// when there was nothing to transfer or the transfer succeeded.
    fn sync_partial(&mut self) -> bool {
        collate_transfer_list(
            &self.change_queue,
            &self.transfer_list,
            &self.set.source,
            &self.set.name,
        );

        match std::fs::metadata(&self.transfer_list) {
            Ok(metadata) if metadata.len() > 0 => {}
            _ => return true,
        }

        let lock = self.acquire_sync_lock("partial sync", ACTION_SYNC_PARTIAL_WAIT);

        self.status.action = ACTION_SYNC_PARTIAL;
        self.update_status();
        self.log("partial sync: sync starting");
        self.log_transfer_list();

        let options = self
            .set
            .partial_rsync_opts
            .as_deref()
            .unwrap_or(DEFAULT_PARTIAL_RSYNC_OPTS);
        let rc = self.runner.run(
            self.set.log_file.as_deref(),
            &self.set.name,
            &self.set.source,
            &self.set.destination,
            &self.excludes_file,
            options,
            Some(&self.transfer_list),
            &self.rsync_error_file,
        );

        self.log(&format!(
            "partial sync: sync ended: {}",
            if rc == 0 { "OK" } else { "FAILED" }
        ));
        drop(lock);

        let _ = std::fs::remove_file(&self.transfer_list);

        if rc == 0 {
            self.touch_marker(self.set.partial_marker.clone());
            self.status.last_partial_sync = Some(SystemTime::now());
            self.status.partial_sync_failures = 0;
            self.status.last_partial_sync_status = "OK";
        }
        rc == 0
    }

    /// Copy the first hundred transfer-list lines into the log for
    /// visibility, then an ellipsis.
    fn log_transfer_list(&self) {
        let Ok(content) = std::fs::read(&self.transfer_list) else {
            return;
        };
        for (idx, line) in content.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            if idx >= 100 {
                self.log("  ...");
                break;
            }
            self.log(&format!("  {}", String::from_utf8_lossy(line)));
        }
    }

    /// Create the marker file if needed and set its mtime to now.
    fn touch_marker(&self, marker: Option<PathBuf>) {
        let Some(path) = marker else {
            return;
        };
        if let Err(e) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            self.log(&format!("{}: {}", path.display(), e));
            return;
        }
        if let Err(e) = filetime::set_file_mtime(&path, filetime::FileTime::now()) {
            self.log(&format!("{}: {}", path.display(), e));
        }
    }
}

fn due(next: Option<SystemTime>) -> bool {
    match next {
        None => true,
        Some(next) => SystemTime::now() >= next,
    }
}

fn sleep_checking_exit(total: Duration) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && !signal::exit_requested() {
        std::thread::sleep(step);
        slept += step;
    }
}

/// Delete the working directory and everything in it, children first,
/// refusing to descend more than ten levels.
fn recursively_delete(dir: &Path) {
    for entry in WalkDir::new(dir).max_depth(10).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::error!("{}: {}", dir.display(), e);
                continue;
            }
        };
        log::debug!("removing: {}", entry.path().display());
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(e) = result {
            log::error!("{}: {}", entry.path().display(), e);
        }
    }
}
