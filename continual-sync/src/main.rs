//! Continuously synchronise directory trees as described by a
//! configuration file, one worker process per sync set.
//!
//! The supervisor parses and validates the configuration, then keeps one
//! worker child alive per selected section. Each worker keeps a watcher
//! child over its source tree and runs full and partial rsync transfers on
//! their schedules. Workers and watchers are started by re-invoking this
//! executable with hidden flags, so the process tree matches the
//! supervisor/worker/watcher model exactly.

use std::path::PathBuf;
use std::process::{Child, Command, ExitCode};
use std::time::Duration;

use clap::Parser;

mod config;
mod daemon;
mod logfile;
mod rsync;
mod status;
mod sync;

use config::{Config, SyncSet, DEFAULT_CONFIG_FILE};
use watchdir::signal;

const DEFAULT_PATH: &str = "/usr/bin:/bin:/usr/local/bin:/usr/sbin:/sbin:/usr/local/sbin";

/// Synchronise the directories specified in the given SECTIONS of the
/// configuration file(s), or all sections if nothing is specified.
#[derive(Parser)]
#[command(name = "continual-sync", version)]
#[command(after_help = "If no configuration file is specified, the default is used: \
                        /etc/continual-sync.conf")]
struct Cli {
    /// Read configuration FILE; repeatable
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,

    /// Run as a daemon, writing the PID to FILE
    #[arg(short = 'D', long = "daemon", value_name = "FILE")]
    daemon: Option<PathBuf>,

    /// Timestamped debug output on stderr
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Internal: run the sync worker for one section
    #[arg(long = "worker", value_name = "SECTION", hide = true, conflicts_with = "watcher")]
    worker: Option<String>,

    /// Internal: run the directory watcher for one section
    #[arg(long = "watcher", value_name = "SECTION", hide = true)]
    watcher: Option<String>,

    /// Internal: change-queue directory for --watcher
    #[arg(long = "change-queue", value_name = "DIR", hide = true, requires = "watcher")]
    change_queue: Option<PathBuf>,

    /// Configuration sections to run; all non-defaults sections when empty
    #[arg(value_name = "SECTIONS")]
    sections: Vec<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            return if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    env_logger::Builder::new()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let config_files = if cli.config.is_empty() {
        vec![PathBuf::from(DEFAULT_CONFIG_FILE)]
    } else {
        cli.config.clone()
    };

    if let Some(section) = &cli.watcher {
        return run_watcher(&cli, &config_files, section);
    }
    if let Some(section) = &cli.worker {
        return run_worker(&cli, &config_files, section);
    }
    run_supervisor(&cli, &config_files)
}

fn load_section(config_files: &[PathBuf], section: &str) -> Result<SyncSet, config::ConfigError> {
    let config = Config::load(config_files)?;
    config.validate_defaults()?;
    config.resolve(section)
}

/// Hidden watcher mode: watch one section's source tree, writing change
/// batches into the change-queue directory the worker chose.
fn run_watcher(cli: &Cli, config_files: &[PathBuf], section: &str) -> ExitCode {
    let Some(change_queue) = &cli.change_queue else {
        eprintln!("continual-sync: --watcher requires --change-queue");
        return ExitCode::FAILURE;
    };

    let set = match load_section(config_files, section) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("continual-sync: {e}");
            return ExitCode::FAILURE;
        }
    };

    let wakeup = match signal::install_exit_handlers() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            eprintln!("continual-sync: sigaction: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Full rescans track the full sync schedule; batch dumps track the
    // partial sync schedule.
    let options = watchdir::WatchOptions {
        full_scan_interval: Duration::from_secs(set.full_interval),
        queue_run_interval: Duration::from_secs(2),
        queue_run_max: Duration::from_secs(5),
        dump_interval: Duration::from_secs(set.partial_interval),
        max_depth: set.recursion_depth,
        excludes: set.excludes.clone(),
    };

    let mut watcher =
        match watchdir::DirWatcher::new(set.source.as_ref(), change_queue, &options) {
            Ok(watcher) => watcher,
            Err(e) => {
                eprintln!("continual-sync: {e}");
                return ExitCode::FAILURE;
            }
        };
    if let Err(e) = watcher.register_wakeup(wakeup) {
        eprintln!("continual-sync: {e}");
        return ExitCode::FAILURE;
    }

    match watcher.run(signal::exit_flag()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("continual-sync: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Hidden worker mode: own one sync set until told to exit.
fn run_worker(cli: &Cli, config_files: &[PathBuf], section: &str) -> ExitCode {
    let set = match load_section(config_files, section) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("continual-sync: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Keep the wakeup pipe alive for the life of the worker even though
    // nothing polls it; the handler writes into it.
    let _wakeup = match signal::install_exit_handlers() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            eprintln!("continual-sync: sigaction: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = daemon::install_null_handlers() {
        eprintln!("continual-sync: sigaction: {e}");
        return ExitCode::FAILURE;
    }

    let ctx = sync::SpawnContext {
        config_files: config_files.to_vec(),
        debug: cli.debug,
    };
    let mut worker = match sync::Worker::new(set, ctx) {
        Ok(worker) => worker,
        Err(e) => {
            eprintln!("continual-sync: {section}: {e}");
            return ExitCode::FAILURE;
        }
    };
    worker.run();
    ExitCode::SUCCESS
}

fn run_supervisor(cli: &Cli, config_files: &[PathBuf]) -> ExitCode {
    let config = match Config::load(config_files) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("continual-sync: {e}");
            return ExitCode::FAILURE;
        }
    };
    let selected = match config.select(&cli.sections) {
        Ok(selected) => selected,
        Err(e) => {
            eprintln!("continual-sync: {e}");
            return ExitCode::FAILURE;
        }
    };

    if std::env::var_os("PATH").map_or(true, |path| path.is_empty()) {
        std::env::set_var("PATH", DEFAULT_PATH);
    }

    if let Some(pidfile) = &cli.daemon {
        if let Err(e) = daemon::daemonise(pidfile, cli.debug) {
            eprintln!("continual-sync: fork: {e}");
            return ExitCode::FAILURE;
        }
    }

    let _wakeup = match signal::install_exit_handlers() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            eprintln!("continual-sync: sigaction: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = daemon::install_null_handlers() {
        eprintln!("continual-sync: sigaction: {e}");
        return ExitCode::FAILURE;
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("continual-sync: current_exe: {e}");
            return ExitCode::FAILURE;
        }
    };

    // One slot per selected section; a live Child means a running worker.
    let mut workers: Vec<(String, Option<Child>)> = selected
        .iter()
        .map(|set| (set.name.clone(), None))
        .collect();

    while !signal::exit_requested() {
        for (name, slot) in &mut workers {
            if slot.is_some() {
                continue;
            }
            let mut command = Command::new(&exe);
            command.arg("--worker").arg(&*name);
            for file in config_files {
                command.arg("-c").arg(file);
            }
            if cli.debug {
                command.arg("-d");
            }
            match command.spawn() {
                Ok(child) => {
                    log::debug!("(master) pid {} spawned [{}]", child.id(), name);
                    *slot = Some(child);
                }
                Err(e) => eprintln!("continual-sync: {name}: {e}"),
            }
        }

        for (name, slot) in &mut workers {
            let exited_pid = match slot.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(_)) | Err(_) => Some(child.id()),
                    Ok(None) => None,
                },
                None => None,
            };
            if let Some(pid) = exited_pid {
                log::debug!("(master) pid {pid} exited [{name}]");
                *slot = None;
            }
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    // Exit: terminate and reap every worker still running.
    for (_, slot) in &mut workers {
        if let Some(child) = slot {
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    for (_, slot) in &mut workers {
        if let Some(mut child) = slot.take() {
            let _ = child.wait();
        }
    }

    if let Some(pidfile) = &cli.daemon {
        let _ = std::fs::remove_file(pidfile);
    }

    ExitCode::SUCCESS
}
