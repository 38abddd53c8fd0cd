//! End-to-end tests driving a live watcher against a real filesystem.
//!
//! Each test runs the watcher loop on a thread with short dump and queue
//! intervals, mutates the watched tree, and inspects the batch files that
//! land in the output directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use watchdir::{watch, WatchOptions};

fn fast_options() -> WatchOptions {
    WatchOptions {
        // Keep periodic rescans out of the picture; the tests exercise the
        // event-driven path.
        full_scan_interval: Duration::from_secs(3600),
        queue_run_interval: Duration::from_secs(1),
        queue_run_max: Duration::from_secs(5),
        dump_interval: Duration::from_secs(1),
        max_depth: 20,
        excludes: Vec::new(),
    }
}

struct Running {
    exit: Arc<AtomicBool>,
    handle: JoinHandle<watchdir::Result<()>>,
}

impl Running {
    fn stop(self) {
        self.exit.store(true, Ordering::SeqCst);
        self.handle
            .join()
            .expect("watcher thread")
            .expect("clean watcher exit");
    }
}

fn start(root: &Path, out: &Path, options: WatchOptions) -> Running {
    let exit = Arc::new(AtomicBool::new(false));
    let handle = {
        let root = root.to_path_buf();
        let out = out.to_path_buf();
        let exit = Arc::clone(&exit);
        std::thread::spawn(move || watch(&root, &out, &options, &exit))
    };
    // Give the first loop iteration time to populate the tree and register
    // its watches.
    std::thread::sleep(Duration::from_millis(700));
    Running { exit, handle }
}

/// All lines across all batch files currently in `out`, in filename order.
fn batch_lines(out: &Path) -> Vec<String> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(out)
        .expect("read_dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            !path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'))
        })
        .collect();
    files.sort();

    let mut lines = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(&file).expect("read batch");
        lines.extend(content.lines().map(|line| line.to_string()));
    }
    lines
}

fn wait_for(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    pred()
}

#[test]
fn rewriting_a_file_produces_a_batch_with_just_that_file() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.txt"), b"12345").unwrap();

    let running = start(root.path(), out.path(), fast_options());

    // Startup is quiet: the initial scan reports nothing.
    assert!(batch_lines(out.path()).is_empty());

    std::fs::write(root.path().join("a.txt"), b"12345678").unwrap();

    // dump_interval + queue_run_interval + the 2 s re-check delay, with
    // slack for a loaded machine.
    assert!(wait_for(Duration::from_secs(10), || {
        batch_lines(out.path()).iter().any(|line| line == "a.txt")
    }));

    // The batch carrying the change holds exactly that one line.
    assert_eq!(batch_lines(out.path()), vec!["a.txt".to_string()]);

    running.stop();
}

#[test]
fn default_excludes_suppress_tmp_files() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();

    let running = start(root.path(), out.path(), fast_options());

    std::fs::write(root.path().join("sub/b.tmp"), b"scratch").unwrap();

    // Long enough for the event, the re-check delay and a dump.
    std::thread::sleep(Duration::from_secs(5));
    assert!(batch_lines(out.path())
        .iter()
        .all(|line| !line.contains("b.tmp")));

    running.stop();
}

#[test]
fn explicit_excludes_replace_the_defaults() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();

    let mut options = fast_options();
    options.excludes = vec!["*.log".to_string()];
    let running = start(root.path(), out.path(), options);

    std::fs::write(root.path().join("sub/b.tmp"), b"scratch").unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        batch_lines(out.path()).iter().any(|line| line == "sub/b.tmp")
    }));

    running.stop();
}

#[test]
fn directories_beyond_the_depth_cap_are_not_watched() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("d1/d2/d3/d4")).unwrap();

    let mut options = fast_options();
    options.max_depth = 3;
    let running = start(root.path(), out.path(), options);

    // Within the cap: reported.
    std::fs::write(root.path().join("d1/d2/shallow"), b"x").unwrap();
    // Beyond the cap: d4 was never added, so no watch sees this.
    std::fs::write(root.path().join("d1/d2/d3/d4/deep"), b"x").unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        batch_lines(out.path())
            .iter()
            .any(|line| line == "d1/d2/shallow")
    }));
    std::thread::sleep(Duration::from_secs(2));
    assert!(batch_lines(out.path())
        .iter()
        .all(|line| !line.contains("deep")));

    running.stop();
}

#[test]
fn touching_the_mtime_without_a_content_change_reports_nothing() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let path = root.path().join("a.txt");
    std::fs::write(&path, b"12345").unwrap();

    let running = start(root.path(), out.path(), fast_options());

    // Shift only the mtime; contents and size stay identical. The watch
    // mask does not subscribe to attribute changes, and no rescan runs
    // within the test window.
    let file = std::fs::File::options().append(true).open(&path).unwrap();
    file.set_times(
        std::fs::FileTimes::new()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(3600)),
    )
    .unwrap();
    drop(file);

    std::thread::sleep(Duration::from_secs(5));
    assert!(batch_lines(out.path()).is_empty());

    running.stop();
}

#[test]
fn deleting_a_file_reports_its_parent_directory() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();
    std::fs::write(root.path().join("sub/gone.txt"), b"x").unwrap();

    let running = start(root.path(), out.path(), fast_options());

    std::fs::remove_file(root.path().join("sub/gone.txt")).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        batch_lines(out.path()).iter().any(|line| line == "sub/")
    }));

    running.stop();
}

#[test]
fn sigterm_shuts_the_watcher_down_cleanly() {
    let root = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.txt"), b"12345").unwrap();

    let wakeup = watchdir::signal::install_exit_handlers().expect("handlers");
    let mut watcher =
        watchdir::DirWatcher::new(root.path(), out.path(), &fast_options()).expect("watcher");
    watcher.register_wakeup(wakeup).expect("wakeup");

    let handle = std::thread::spawn(move || watcher.run(watchdir::signal::exit_flag()));
    std::thread::sleep(Duration::from_millis(500));

    nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGTERM)
        .expect("kill");

    handle
        .join()
        .expect("watcher thread")
        .expect("clean shutdown after SIGTERM");
}
