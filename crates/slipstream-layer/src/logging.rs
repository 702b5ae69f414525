//! Raw-descriptor logging.
//!
//! The layer cannot log through anything that allocates file objects or
//! re-enters intercepted calls, so this is a line logger writing straight
//! to the reserved log fd with `reals::write`. Each line is formatted
//! into a fixed stack buffer (no heap traffic on the logging path; long
//! lines truncate). One log file per pid under the configured log
//! directory; reopened transparently after fork.

use crate::reals;
use crate::reserved::{self, LOG_FD};
use std::ffi::CString;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};

const LOG_LINE_MAX: usize = 512;

/// Stack-backed line formatter. Output beyond capacity is dropped; the
/// final byte is always a newline.
struct LineBuf {
    buf: [u8; LOG_LINE_MAX],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0u8; LOG_LINE_MAX],
            len: 0,
        }
    }

    /// Guarantee the line ends with exactly one newline, even after
    /// truncation.
    fn terminate(&mut self) {
        if self.len > 0 && self.buf[self.len - 1] == b'\n' {
            return;
        }
        if self.len == self.buf.len() {
            self.buf[self.len - 1] = b'\n';
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Pid the current log fd belongs to; 0 = not opened yet.
static LOG_PID: AtomicI32 = AtomicI32::new(0);

unsafe fn open_log_file(pid: i32) -> bool {
    let dir = slipstream_config::config().logging.dir.clone();
    let dir_c = match CString::new(dir.as_os_str().to_string_lossy().as_bytes()) {
        Ok(c) => c,
        Err(_) => return false,
    };

    if libc::mkdir(dir_c.as_ptr(), 0o777) == -1 {
        let errno = *libc::__errno_location();
        if errno != libc::EEXIST {
            return false;
        }
    }
    // Best effort: other users' processes log here too.
    let _ = libc::chmod(dir_c.as_ptr(), 0o777);

    let path = format!("{}/{}.log", dir.display(), pid);
    let path_c = match CString::new(path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let fd = libc::open(
        path_c.as_ptr(),
        libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT | libc::O_CLOEXEC,
        0o666 as libc::c_uint,
    );
    if fd == -1 {
        return false;
    }
    let _ = libc::fchmod(fd, 0o666);

    if !reserved::rename_fd(fd, LOG_FD, true) {
        reals::close(fd);
        return false;
    }
    true
}

/// Make sure the log fd is open and owned by this pid.
fn ensure_open() -> bool {
    let pid = unsafe { libc::getpid() };
    let owner = LOG_PID.load(Ordering::Acquire);
    if owner == pid {
        return true;
    }
    unsafe {
        // Stale fd inherited across fork points at the parent's log.
        if owner != 0 && reserved::fd_is_open(LOG_FD) {
            reals::close(LOG_FD);
        }
        if !open_log_file(pid) {
            return false;
        }
    }
    LOG_PID.store(pid, Ordering::Release);
    true
}

pub fn write_line(args: fmt::Arguments<'_>) {
    let mut line = LineBuf::new();
    let _ = line.write_fmt(args);
    line.terminate();
    let fd = if ensure_open() { LOG_FD } else { 2 };
    unsafe {
        reals::write(
            fd,
            line.as_bytes().as_ptr() as *const libc::c_void,
            line.as_bytes().len(),
        );
    }
}

/// Log the message to both the log and stderr, then abort the process.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let mut line = LineBuf::new();
    let _ = line.write_str("slipstream fatal: ");
    let _ = line.write_fmt(args);
    line.terminate();
    unsafe {
        if ensure_open() {
            reals::write(
                LOG_FD,
                line.as_bytes().as_ptr() as *const libc::c_void,
                line.as_bytes().len(),
            );
        }
        reals::write(
            2,
            line.as_bytes().as_ptr() as *const libc::c_void,
            line.as_bytes().len(),
        );
        libc::abort()
    }
}

#[macro_export]
macro_rules! slip_log {
    ($($arg:tt)*) => {
        $crate::logging::write_line(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! slip_warn {
    ($($arg:tt)*) => {
        $crate::logging::write_line(core::format_args!("warning: {}", core::format_args!($($arg)*)))
    };
}

/// Invariant violation: log and abort. The layer is load-bearing once
/// enabled; continuing past a broken invariant corrupts the stream.
#[macro_export]
macro_rules! slip_fatal {
    ($($arg:tt)*) => {
        $crate::logging::fatal(core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    fn rendered(args: fmt::Arguments<'_>) -> Vec<u8> {
        let mut line = LineBuf::new();
        let _ = line.write_fmt(args);
        line.terminate();
        line.as_bytes().to_vec()
    }

    #[test]
    fn formats_and_terminates_on_the_stack() {
        let out = rendered(format_args!("fd={} ep={}", 5, 7));
        assert_eq!(out, b"fd=5 ep=7\n");
    }

    #[test]
    fn existing_newline_is_not_doubled() {
        let out = rendered(format_args!("done\n"));
        assert_eq!(out, b"done\n");
    }

    #[test]
    fn empty_message_becomes_a_bare_newline() {
        let out = rendered(format_args!(""));
        assert_eq!(out, b"\n");
    }

    #[test]
    fn overlong_lines_truncate_but_stay_terminated() {
        let big = "x".repeat(LOG_LINE_MAX * 2);
        let out = rendered(format_args!("{}", big));
        assert_eq!(out.len(), LOG_LINE_MAX);
        assert_eq!(*out.last().unwrap(), b'\n');
        assert!(out[..LOG_LINE_MAX - 1].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn multi_fragment_writes_accumulate() {
        let mut line = LineBuf::new();
        let _ = line.write_str("a");
        let _ = line.write_fmt(format_args!("{}{}", "b", 3));
        line.terminate();
        assert_eq!(line.as_bytes(), b"ab3\n");
    }
}
