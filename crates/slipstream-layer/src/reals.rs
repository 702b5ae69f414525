//! Access to the real libc symbols.
//!
//! Every symbol this library exports must be forwarded through here when
//! called internally. A direct `libc::send` from inside the layer would
//! resolve to our own exported `send` and recurse. `dlsym(RTLD_NEXT)`
//! skips our own definition and lands on libc's.

use libc::{c_char, c_int, c_void, nfds_t, size_t, socklen_t, ssize_t};
use std::mem;
use std::sync::atomic::{AtomicPtr, Ordering};

/// One lazily-resolved libc function pointer.
pub struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    name: &'static str,
}

impl RealSymbol {
    pub const fn new(name: &'static str) -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            name,
        }
    }

    /// Resolve (once) and return the real function pointer.
    ///
    /// # Safety
    /// `name` must be a NUL-terminated symbol that exists in a later
    /// object in lookup order.
    pub unsafe fn get(&self) -> *mut c_void {
        let p = self.ptr.load(Ordering::Acquire);
        if !p.is_null() {
            return p;
        }
        let f = libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char);
        self.ptr.store(f, Ordering::Release);
        f
    }
}

macro_rules! real {
    ($sym:ident, $fn_name:ident, ($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        static $sym: RealSymbol = RealSymbol::new(concat!(stringify!($fn_name), "\0"));

        pub unsafe fn $fn_name($($arg: $ty),*) -> $ret {
            let f: unsafe extern "C" fn($($ty),*) -> $ret = mem::transmute($sym.get());
            f($($arg),*)
        }
    };
}

// Data path
real!(READ, read, (fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t);
real!(WRITE, write, (fd: c_int, buf: *const c_void, count: size_t) -> ssize_t);
real!(RECV, recv, (fd: c_int, buf: *mut c_void, count: size_t, flags: c_int) -> ssize_t);
real!(SEND, send, (fd: c_int, buf: *const c_void, count: size_t, flags: c_int) -> ssize_t);
real!(RECVFROM, recvfrom, (fd: c_int, buf: *mut c_void, count: size_t, flags: c_int,
    addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> ssize_t);
real!(SENDTO, sendto, (fd: c_int, buf: *const c_void, count: size_t, flags: c_int,
    addr: *const libc::sockaddr, addrlen: socklen_t) -> ssize_t);
real!(READV, readv, (fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t);
real!(WRITEV, writev, (fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t);
real!(RECVMSG, recvmsg, (fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t);
real!(SENDMSG, sendmsg, (fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t);

// Socket lifecycle
real!(SOCKET, socket, (domain: c_int, ty: c_int, protocol: c_int) -> c_int);
real!(ACCEPT4, accept4, (fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t,
    flags: c_int) -> c_int);
real!(CONNECT, connect, (fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int);
real!(CLOSE, close, (fd: c_int) -> c_int);
real!(SHUTDOWN, shutdown, (fd: c_int, how: c_int) -> c_int);

// Descriptor management
real!(DUP, dup, (fd: c_int) -> c_int);
real!(DUP2, dup2, (oldfd: c_int, newfd: c_int) -> c_int);
real!(DUP3, dup3, (oldfd: c_int, newfd: c_int, flags: c_int) -> c_int);
real!(FCNTL, fcntl, (fd: c_int, cmd: c_int, arg: usize) -> c_int);

// Socket options
real!(GETSOCKOPT, getsockopt, (fd: c_int, level: c_int, optname: c_int,
    optval: *mut c_void, optlen: *mut socklen_t) -> c_int);
real!(SETSOCKOPT, setsockopt, (fd: c_int, level: c_int, optname: c_int,
    optval: *const c_void, optlen: socklen_t) -> c_int);

// Readiness
real!(POLL, poll, (fds: *mut libc::pollfd, nfds: nfds_t, timeout: c_int) -> c_int);
real!(SELECT, select, (nfds: c_int, readfds: *mut libc::fd_set, writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set, timeout: *mut libc::timeval) -> c_int);
real!(PSELECT, pselect, (nfds: c_int, readfds: *mut libc::fd_set, writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set, timeout: *const libc::timespec,
    sigmask: *const libc::sigset_t) -> c_int);
real!(EPOLL_CREATE, epoll_create, (size: c_int) -> c_int);
real!(EPOLL_CREATE1, epoll_create1, (flags: c_int) -> c_int);
real!(EPOLL_CTL, epoll_ctl, (epfd: c_int, op: c_int, fd: c_int,
    event: *mut libc::epoll_event) -> c_int);
real!(EPOLL_WAIT, epoll_wait, (epfd: c_int, events: *mut libc::epoll_event, maxevents: c_int,
    timeout: c_int) -> c_int);
real!(EPOLL_PWAIT, epoll_pwait, (epfd: c_int, events: *mut libc::epoll_event, maxevents: c_int,
    timeout: c_int, sigmask: *const libc::sigset_t) -> c_int);

// Process lifecycle
real!(FORK, fork, () -> libc::pid_t);
real!(EXECV, execv, (path: *const c_char, argv: *const *const c_char) -> c_int);
real!(EXECVE, execve, (path: *const c_char, argv: *const *const c_char,
    envp: *const *const c_char) -> c_int);
real!(EXECVP, execvp, (file: *const c_char, argv: *const *const c_char) -> c_int);
real!(EXECVPE, execvpe, (file: *const c_char, argv: *const *const c_char,
    envp: *const *const c_char) -> c_int);
