//! End-to-end tests running the real `continual-sync` binary with a stub
//! `rsync` on PATH.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const BIN: &str = env!("CARGO_BIN_EXE_continual-sync");

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

/// Install a stub `rsync` into `dir` and return a PATH value resolving it
/// first.
fn stub_rsync(dir: &Path, body: &str) -> String {
    let path = dir.join("rsync");
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).expect("write rsync stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    format!(
        "{}:{}",
        dir.display(),
        std::env::var("PATH").unwrap_or_default()
    )
}

fn spawn_sync(config: &Path, path_env: &str, extra_args: &[&str]) -> Child {
    Command::new(BIN)
        .arg("-c")
        .arg(config)
        .args(extra_args)
        .env("PATH", path_env)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn continual-sync")
}

fn terminate(mut child: Child) {
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("SIGTERM");
    let status = child.wait().expect("wait");
    assert!(status.success(), "supervisor exit: {status:?}");
}

#[test]
fn partial_sync_flows_from_file_change_to_helper_invocation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("source");
    std::fs::create_dir(&source).expect("source");
    std::fs::write(source.join("a.txt"), b"12345").expect("a.txt");

    let argv_file = dir.path().join("argv");
    let path_env = stub_rsync(
        dir.path(),
        &format!("printf '%s\\n' \"$@\" >> {}\nexit 0", argv_file.display()),
    );

    let status_file = dir.path().join("demo.status");
    let log_file = dir.path().join("demo.log");
    let conf = dir.path().join("sync.conf");
    std::fs::write(
        &conf,
        format!(
            "[demo]\n\
             source = {}\n\
             destination = {}/dest\n\
             full sync interval = 0\n\
             partial sync interval = 1\n\
             partial sync retry = 1\n\
             status file = {}\n\
             log file = {}\n",
            source.display(),
            dir.path().display(),
            status_file.display(),
            log_file.display(),
        ),
    )
    .expect("conf");

    let child = spawn_sync(&conf, &path_env, &["demo"]);

    // The worker comes up and writes its status file.
    assert!(wait_for(Duration::from_secs(10), || status_file.exists()));
    let status_text = std::fs::read_to_string(&status_file).expect("status");
    assert!(status_text.contains("section                  : demo"), "{status_text}");

    // Change a file; the watcher batches it, the worker collates it, and
    // the helper runs with a files-from list.
    std::fs::write(source.join("a.txt"), b"12345678").expect("rewrite");
    assert!(
        wait_for(Duration::from_secs(25), || {
            std::fs::read_to_string(&argv_file)
                .map(|argv| argv.contains("--files-from"))
                .unwrap_or(false)
        }),
        "helper was never invoked for a partial sync"
    );

    terminate(child);

    // Worker cleanup removed the status file; the log recorded the run.
    assert!(wait_for(Duration::from_secs(5), || !status_file.exists()));
    let logged = std::fs::read_to_string(&log_file).expect("log");
    assert!(logged.contains("[demo] process started"), "{logged}");
    assert!(logged.contains("[demo] partial sync: sync ended: OK"), "{logged}");
    assert!(logged.contains("[demo] process ended"), "{logged}");
}

#[test]
fn shared_sync_lock_serialises_helper_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    for name in ["src-a", "src-b"] {
        std::fs::create_dir(dir.path().join(name)).expect("src");
    }

    let runs_file = dir.path().join("runs");
    let path_env = stub_rsync(
        dir.path(),
        &format!(
            "echo \"S $(date +%s%N)\" >> {runs}\nsleep 0.6\necho \"E $(date +%s%N)\" >> {runs}\nexit 0",
            runs = runs_file.display()
        ),
    );

    let lock = dir.path().join("sync.lock");
    let conf = dir.path().join("sync.conf");
    std::fs::write(
        &conf,
        format!(
            "[defaults]\n\
             full sync interval = 1\n\
             full sync retry = 1\n\
             partial sync interval = 0\n\
             sync lock = {lock}\n\
             [a]\n\
             source = {base}/src-a\n\
             destination = {base}/dst-a\n\
             [b]\n\
             source = {base}/src-b\n\
             destination = {base}/dst-b\n",
            lock = lock.display(),
            base = dir.path().display(),
        ),
    )
    .expect("conf");

    let child = spawn_sync(&conf, &path_env, &[]);

    // Let both sections run several full syncs against the shared lock.
    assert!(wait_for(Duration::from_secs(20), || {
        std::fs::read_to_string(&runs_file)
            .map(|runs| runs.lines().filter(|l| l.starts_with('S')).count() >= 4)
            .unwrap_or(false)
    }));

    terminate(child);

    // Start/end timestamps must strictly alternate: one helper's start
    // never precedes the previous helper's end.
    let runs = std::fs::read_to_string(&runs_file).expect("runs");
    let mut last_end: u128 = 0;
    let mut expect_start = true;
    for line in runs.lines() {
        let (kind, stamp) = line.split_at(1);
        let stamp: u128 = stamp.trim().parse().expect("timestamp");
        match kind {
            "S" => {
                assert!(expect_start, "overlapping helper runs: {runs}");
                assert!(stamp >= last_end, "start before previous end: {runs}");
                expect_start = false;
            }
            "E" => {
                assert!(!expect_start, "unpaired end: {runs}");
                last_end = stamp;
                expect_start = true;
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
}

#[test]
fn daemon_mode_writes_then_removes_the_pidfile() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("source");
    std::fs::create_dir(&source).expect("source");

    let path_env = stub_rsync(dir.path(), "exit 0");

    let status_file = dir.path().join("solo.status");
    let pidfile = dir.path().join("daemon.pid");
    let conf = dir.path().join("sync.conf");
    std::fs::write(
        &conf,
        format!(
            "[solo]\n\
             source = {}\n\
             destination = {}/dest\n\
             full sync interval = 1\n\
             full sync retry = 1\n\
             partial sync interval = 0\n\
             status file = {}\n",
            source.display(),
            dir.path().display(),
            status_file.display(),
        ),
    )
    .expect("conf");

    let mut launcher = Command::new(BIN)
        .arg("-c")
        .arg(&conf)
        .arg("-D")
        .arg(&pidfile)
        .env("PATH", &path_env)
        .spawn()
        .expect("spawn");
    let status = launcher.wait().expect("wait launcher");
    assert!(status.success());

    let pid: i32 = std::fs::read_to_string(&pidfile)
        .expect("pidfile")
        .trim()
        .parse()
        .expect("pid");

    // The daemon's worker gets far enough to write a status file.
    assert!(wait_for(Duration::from_secs(10), || status_file.exists()));

    kill(Pid::from_raw(pid), Signal::SIGTERM).expect("SIGTERM daemon");

    // The pid file disappears, then the process itself.
    assert!(wait_for(Duration::from_secs(10), || !pidfile.exists()));
    assert!(wait_for(Duration::from_secs(10), || {
        kill(Pid::from_raw(pid), None).is_err()
    }));
    // Worker cleanup happened before the supervisor left.
    assert!(!status_file.exists());
}

#[test]
fn failing_source_validation_blocks_every_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("source");
    std::fs::create_dir(&source).expect("source");

    let argv_file = dir.path().join("argv");
    let path_env = stub_rsync(
        dir.path(),
        &format!("touch {}\nexit 0", argv_file.display()),
    );

    let conf = dir.path().join("sync.conf");
    std::fs::write(
        &conf,
        format!(
            "[guarded]\n\
             source = {}\n\
             destination = {}/dest\n\
             source validation command = /bin/false\n\
             full sync interval = 1\n\
             full sync retry = 1\n\
             partial sync interval = 0\n",
            source.display(),
            dir.path().display(),
        ),
    )
    .expect("conf");

    let child = spawn_sync(&conf, &path_env, &[]);
    std::thread::sleep(Duration::from_secs(4));
    terminate(child);

    assert!(!argv_file.exists(), "helper ran despite failing validation");
}

#[test]
fn unknown_section_selection_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conf = dir.path().join("sync.conf");
    std::fs::write(&conf, "[real]\nsource = /s\ndestination = h:/d\n").expect("conf");

    let output = Command::new(BIN)
        .arg("-c")
        .arg(&conf)
        .arg("imaginary")
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("configuration section not found"), "{stderr}");
}

#[test]
fn bad_configuration_fails_with_exit_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conf = dir.path().join("sync.conf");
    std::fs::write(&conf, "[broken\nsource = /s\n").expect("conf");

    let output = Command::new(BIN).arg("-c").arg(&conf).output().expect("run");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn help_and_version_exit_zero() {
    for flag in ["--help", "--version"] {
        let output = Command::new(BIN).arg(flag).output().expect("run");
        assert_eq!(output.status.code(), Some(0), "{flag}");
    }
    let help = Command::new(BIN).arg("--help").output().expect("run");
    let text = String::from_utf8_lossy(&help.stdout);
    assert!(text.contains("--config"), "{text}");
    assert!(text.contains("--daemon"), "{text}");
    // Internal re-exec flags stay hidden.
    assert!(!text.contains("--worker"), "{text}");
}
