//! Command line interface to the directory watcher.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use watchdir::{signal, DirWatcher, WatchOptions, MAX_EXCLUDES};

/// Watch DIRECTORY for changes, dumping the changed paths to a unique file
/// in the OUTPUTDIR directory every few seconds.
#[derive(Parser)]
#[command(name = "watchdir", version)]
#[command(after_help = "The OUTPUTDIR must not be under the DIRECTORY being watched.")]
struct Cli {
    /// Interval between writing change files, in seconds
    #[arg(short = 'i', long = "dump-interval", value_name = "SEC", default_value_t = 30)]
    dump_interval: u64,

    /// Do a full rescan every SEC seconds
    #[arg(
        short = 'f',
        long = "full-scan-interval",
        value_name = "SEC",
        default_value_t = 7200
    )]
    full_scan_interval: u64,

    /// Glob pattern to exclude; repeatable (default: *.tmp, *~)
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Maximum depth to descend into subdirectories
    #[arg(
        short = 'r',
        long = "recursion-depth",
        value_name = "NUM",
        default_value_t = 20
    )]
    recursion_depth: usize,

    /// Change queue processing interval, in seconds
    #[arg(
        short = 'q',
        long = "queue-run-interval",
        value_name = "SEC",
        default_value_t = 2
    )]
    queue_run_interval: u64,

    /// Maximum time to spend in one queue processing pass, in seconds
    #[arg(short = 'm', long = "queue-run-max", value_name = "SEC", default_value_t = 5)]
    queue_run_max: u64,

    /// Timestamped debug output on stderr
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Directory to watch
    #[arg(value_name = "DIRECTORY")]
    directory: PathBuf,

    /// Directory the change batch files are written into
    #[arg(value_name = "OUTPUTDIR")]
    output_dir: PathBuf,
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

    if cli.exclude.len() > MAX_EXCLUDES {
        eprintln!("watchdir: maximum number of excludes reached");
        return ExitCode::FAILURE;
    }

    let options = WatchOptions {
        full_scan_interval: Duration::from_secs(cli.full_scan_interval),
        queue_run_interval: Duration::from_secs(cli.queue_run_interval),
        queue_run_max: Duration::from_secs(cli.queue_run_max),
        dump_interval: Duration::from_secs(cli.dump_interval),
        max_depth: cli.recursion_depth,
        excludes: cli.exclude,
    };

    let wakeup = match signal::install_exit_handlers() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            eprintln!("watchdir: sigaction: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut watcher = match DirWatcher::new(&cli.directory, &cli.output_dir, &options) {
        Ok(watcher) => watcher,
        Err(e) => {
            eprintln!("watchdir: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = watcher.register_wakeup(wakeup) {
        eprintln!("watchdir: {e}");
        return ExitCode::FAILURE;
    }

    match watcher.run(signal::exit_flag()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("watchdir: {e}");
            ExitCode::FAILURE
        }
    }
}
