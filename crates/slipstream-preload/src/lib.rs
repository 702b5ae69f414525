//! # slipstream-preload
//!
//! The exported C symbols. These are the names the dynamic linker
//! resolves ahead of libc when this library is preloaded. Each shim
//! decides exactly one thing (is the layer live?) and then forwards
//! either to the real call or to the hook body in `slipstream-layer`.
//!
//! Nothing lives here but the export surface; keeping it in its own
//! cdylib means the core crate's tests never have their own I/O
//! intercepted.

#![allow(clippy::missing_safety_doc)]

use libc::{c_char, c_int, c_void, nfds_t, size_t, socklen_t, ssize_t};
use slipstream_layer::table::TABLES;
use slipstream_layer::{hooks, init, mux, reals};

// --- data calls -----------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    if !init::ensure() {
        return reals::read(fd, buf, count);
    }
    hooks::read_hook(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    if !init::ensure() {
        return reals::write(fd, buf, count);
    }
    hooks::write_hook(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, count: size_t, flags: c_int) -> ssize_t {
    if !init::ensure() {
        return reals::recv(fd, buf, count, flags);
    }
    hooks::recv_hook(fd, buf, count, flags)
}

#[no_mangle]
pub unsafe extern "C" fn send(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    flags: c_int,
) -> ssize_t {
    if !init::ensure() {
        return reals::send(fd, buf, count, flags);
    }
    hooks::send_hook(fd, buf, count, flags)
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    flags: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    if !init::ensure() {
        return reals::recvfrom(fd, buf, count, flags, addr, addrlen);
    }
    hooks::recvfrom_hook(fd, buf, count, flags, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    flags: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    if !init::ensure() {
        return reals::sendto(fd, buf, count, flags, addr, addrlen);
    }
    hooks::sendto_hook(fd, buf, count, flags, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    if !init::ensure() {
        return reals::readv(fd, iov, iovcnt);
    }
    hooks::readv_hook(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    if !init::ensure() {
        return reals::writev(fd, iov, iovcnt);
    }
    hooks::writev_hook(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    if !init::ensure() {
        return reals::recvmsg(fd, msg, flags);
    }
    hooks::recvmsg_hook(fd, msg, flags)
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    if !init::ensure() {
        return reals::sendmsg(fd, msg, flags);
    }
    hooks::sendmsg_hook(fd, msg, flags)
}

// --- socket lifecycle -----------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !init::ensure() {
        return reals::socket(domain, ty, protocol);
    }
    hooks::socket_hook(domain, ty, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    if !init::ensure() {
        return reals::accept4(fd, addr, addrlen, 0);
    }
    hooks::accept4_hook(fd, addr, addrlen, 0)
}

#[no_mangle]
pub unsafe extern "C" fn accept4(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    if !init::ensure() {
        return reals::accept4(fd, addr, addrlen, flags);
    }
    hooks::accept4_hook(fd, addr, addrlen, flags)
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    if !init::ensure() {
        return reals::connect(fd, addr, addrlen);
    }
    hooks::connect_hook(fd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !init::ensure() {
        return reals::close(fd);
    }
    hooks::close_hook(fd)
}

#[no_mangle]
pub unsafe extern "C" fn shutdown(fd: c_int, how: c_int) -> c_int {
    if !init::ensure() {
        return reals::shutdown(fd, how);
    }
    hooks::shutdown_hook(fd, how)
}

// --- descriptor management ------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn dup(fd: c_int) -> c_int {
    if !init::ensure() {
        return reals::dup(fd);
    }
    hooks::dup_hook(fd)
}

#[no_mangle]
pub unsafe extern "C" fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    if !init::ensure() {
        return reals::dup2(oldfd, newfd);
    }
    hooks::dup2_hook(oldfd, newfd)
}

#[no_mangle]
pub unsafe extern "C" fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    if !init::ensure() {
        return reals::dup3(oldfd, newfd, flags);
    }
    hooks::dup3_hook(oldfd, newfd, flags)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    if !init::ensure() {
        return reals::fcntl(fd, cmd, arg);
    }
    hooks::fcntl_hook(fd, cmd, arg)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !init::ensure() {
        return reals::setsockopt(fd, level, optname, optval, optlen);
    }
    hooks::setsockopt_hook(fd, level, optname, optval, optlen)
}

// --- readiness ------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn poll(fds: *mut libc::pollfd, nfds: nfds_t, timeout: c_int) -> c_int {
    if !init::ensure() {
        return reals::poll(fds, nfds, timeout);
    }
    mux::poll_hook(&TABLES, fds, nfds, timeout)
}

#[no_mangle]
pub unsafe extern "C" fn select(
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set,
    timeout: *mut libc::timeval,
) -> c_int {
    if !init::ensure() {
        return reals::select(nfds, readfds, writefds, errorfds, timeout);
    }
    mux::select_hook(&TABLES, nfds, readfds, writefds, errorfds, timeout)
}

#[no_mangle]
pub unsafe extern "C" fn pselect(
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set,
    timeout: *const libc::timespec,
    sigmask: *const libc::sigset_t,
) -> c_int {
    if !init::ensure() {
        return reals::pselect(nfds, readfds, writefds, errorfds, timeout, sigmask);
    }
    mux::pselect_hook(&TABLES, nfds, readfds, writefds, errorfds, timeout, sigmask)
}

#[no_mangle]
pub unsafe extern "C" fn epoll_create(size: c_int) -> c_int {
    let enabled = init::ensure();
    let ret = reals::epoll_create(size);
    if enabled && ret >= 0 {
        mux::note_epoll_instance(&TABLES, ret);
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn epoll_create1(flags: c_int) -> c_int {
    let enabled = init::ensure();
    let ret = reals::epoll_create1(flags);
    if enabled && ret >= 0 {
        mux::note_epoll_instance(&TABLES, ret);
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn epoll_ctl(
    epfd: c_int,
    op: c_int,
    fd: c_int,
    event: *mut libc::epoll_event,
) -> c_int {
    if !init::ensure() {
        return reals::epoll_ctl(epfd, op, fd, event);
    }
    mux::epoll_ctl_dispatch(&TABLES, epfd, op, fd, event, &mut |e, o, f, ev| {
        reals::epoll_ctl(e, o, f, ev)
    })
}

#[no_mangle]
pub unsafe extern "C" fn epoll_wait(
    epfd: c_int,
    events: *mut libc::epoll_event,
    maxevents: c_int,
    timeout: c_int,
) -> c_int {
    if !init::ensure() {
        return reals::epoll_wait(epfd, events, maxevents, timeout);
    }
    mux::epoll_pwait_hook(&TABLES, epfd, events, maxevents, timeout, std::ptr::null())
}

#[no_mangle]
pub unsafe extern "C" fn epoll_pwait(
    epfd: c_int,
    events: *mut libc::epoll_event,
    maxevents: c_int,
    timeout: c_int,
    sigmask: *const libc::sigset_t,
) -> c_int {
    if !init::ensure() {
        return reals::epoll_pwait(epfd, events, maxevents, timeout, sigmask);
    }
    mux::epoll_pwait_hook(&TABLES, epfd, events, maxevents, timeout, sigmask)
}

// --- process lifecycle ----------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn fork() -> libc::pid_t {
    if !init::ensure() {
        return reals::fork();
    }
    hooks::fork_hook()
}

#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    if !init::ensure() {
        return reals::execv(path, argv);
    }
    hooks::execv_hook(path, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    if !init::ensure() {
        return reals::execve(path, argv, envp);
    }
    hooks::execve_hook(path, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    if !init::ensure() {
        return reals::execvp(file, argv);
    }
    hooks::execvp_hook(file, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    if !init::ensure() {
        return reals::execvpe(file, argv, envp);
    }
    hooks::execvpe_hook(file, argv, envp)
}

// --- layer entry points ---------------------------------------------------

/// For preload shims with a constructor: force initialization now instead
/// of on the first intercepted call.
#[no_mangle]
pub extern "C" fn slipstream_init() {
    init::ensure();
}

/// Process-exit hook: summarize, release references, send REMOVEALL.
#[no_mangle]
pub extern "C" fn slipstream_shutdown() {
    if init::active() {
        hooks::teardown();
    }
}
