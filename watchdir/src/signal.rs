//! Exit signal plumbing shared by the watcher and sync binaries.
//!
//! SIGTERM and SIGINT are handled by storing into a process-wide flag and
//! writing one byte to a self-pipe. Loops either poll the pipe's read end
//! (the watcher registers it alongside the inotify descriptor) or check
//! [`exit_requested`] on their regular cadence; the handler itself does
//! nothing that is not async-signal-safe.

use std::io;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use mio::unix::pipe::{self, Receiver};

static EXIT_NOW: AtomicBool = AtomicBool::new(false);
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_exit_signal(_signum: libc::c_int) {
    EXIT_NOW.store(true, Ordering::SeqCst);
    let fd = WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"!".as_ptr().cast(), 1);
        }
    }
}

/// Install SIGTERM/SIGINT handlers that raise the process exit flag.
///
/// Returns the read end of the self-pipe the handlers write to; register
/// it with a poll (see [`DirWatcher::register_wakeup`]) to have a blocked
/// loop wake as soon as the signal lands. The write end stays open for the
/// life of the process.
///
/// [`DirWatcher::register_wakeup`]: crate::DirWatcher::register_wakeup
pub fn install_exit_handlers() -> io::Result<Receiver> {
    let (sender, receiver) = pipe::new()?;
    WAKEUP_FD.store(sender.into_raw_fd(), Ordering::SeqCst);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_exit_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for signum in [libc::SIGTERM, libc::SIGINT] {
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(receiver)
}

/// The process-wide exit flag raised by the installed handlers.
pub fn exit_flag() -> &'static AtomicBool {
    &EXIT_NOW
}

/// Whether an exit signal has been received (or an exit requested).
pub fn exit_requested() -> bool {
    EXIT_NOW.load(Ordering::SeqCst)
}

/// Raise the exit flag from ordinary code, as if a signal had arrived.
pub fn request_exit() {
    EXIT_NOW.store(true, Ordering::SeqCst);
}
