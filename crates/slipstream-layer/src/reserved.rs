//! Reserved descriptor numbers owned by the layer.
//!
//! The daemon control channel, the log, and the exec state-transfer
//! segment live at fixed high fd values so they never collide with fds
//! the application allocates (the kernel hands out lowest-available
//! numbers). The application is refused any operation targeting them.

use crate::reals;
use libc::c_int;

/// Daemon control connection.
pub const DAEMON_FD: c_int = 999;
/// Layer log output.
pub const LOG_FD: c_int = 998;
/// Shared-memory state-transfer fd held across exec.
pub const SHM_FD: c_int = 997;

pub fn is_reserved(fd: c_int) -> bool {
    (SHM_FD..=DAEMON_FD).contains(&fd)
}

/// Move `fd` to exactly `newfd` and close the original.
///
/// Returns false if `newfd` (or anything below the requested number) could
/// not be claimed.
pub unsafe fn rename_fd(fd: c_int, newfd: c_int, cloexec: bool) -> bool {
    let cmd = if cloexec {
        libc::F_DUPFD_CLOEXEC
    } else {
        libc::F_DUPFD
    };
    let ret = reals::fcntl(fd, cmd, newfd as usize);
    if ret == -1 {
        return false;
    }
    if ret != newfd {
        // Requested slot was occupied; F_DUPFD gave us the next free one.
        reals::close(ret);
        return false;
    }
    reals::close(fd) == 0
}

/// Is `fd` an open descriptor? (Probe via F_GETFD, the cheapest no-op.)
pub unsafe fn fd_is_open(fd: c_int) -> bool {
    reals::fcntl(fd, libc::F_GETFD, 0) >= 0
}
