//! Daemonisation and supervisor signal handling.

use std::io::{self, Write};
use std::path::Path;

/// Detach from the controlling terminal: fork, let the parent write the
/// child's pid to `pidfile` and exit 0, then redirect the child's standard
/// descriptors to `/dev/null` (stderr is kept when `keep_stderr`, for
/// debugging) and start a new session. Returns only in the child.
pub fn daemonise(pidfile: &Path, keep_stderr: bool) -> io::Result<()> {
    let child = unsafe { libc::fork() };
    if child < 0 {
        return Err(io::Error::last_os_error());
    }

    if child > 0 {
        // Parent: record the daemon's pid and leave.
        match std::fs::File::create(pidfile).and_then(|mut f| writeln!(f, "{child}")) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("continual-sync: {}: {}", pidfile.display(), e);
                unsafe {
                    libc::kill(child, libc::SIGTERM);
                }
                std::process::exit(1);
            }
        }
    }

    unsafe {
        let devnull_in = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDONLY);
        if devnull_in >= 0 {
            libc::dup2(devnull_in, 0);
            libc::close(devnull_in);
        } else {
            libc::close(0);
        }
        let devnull_out = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_WRONLY);
        if devnull_out >= 0 {
            libc::dup2(devnull_out, 1);
            libc::close(devnull_out);
        } else {
            libc::close(1);
        }
        if !keep_stderr {
            libc::dup2(1, 2);
        }
        libc::setsid();
    }

    Ok(())
}

extern "C" fn handle_null_signal(_signum: libc::c_int) {}

/// Install do-nothing handlers for SIGCHLD and SIGALRM, so child exits and
/// alarms interrupt sleeps instead of being discarded.
pub fn install_null_handlers() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_null_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for signum in [libc::SIGCHLD, libc::SIGALRM] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}
