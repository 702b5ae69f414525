//! Hook bodies for the intercepted calls.
//!
//! The C symbols exported by the preload shim land here once the layer
//! is initialized. Hooks tie the pieces together: consult the table, route
//! data calls into the dispatcher, run lifecycle bookkeeping, and talk to
//! the daemon, always resolving daemon work *outside* the table lock.

use crate::daemon::DAEMON;
use crate::dispatch::{self, DispatchEnv, IoBufs};
use crate::stats::{self, Direction};
use crate::table::{EndpointState, Stamp, Unregister, TABLES};
use crate::{engine, reals, reserved, slip_fatal, slip_log, slip_warn};
use libc::{c_int, c_void, size_t, socklen_t, ssize_t};
use slipstream_ipc::{EndpointId, EndpointInfo, MonoTime, NetAddr};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;

fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn registered_ep(fd: c_int) -> Option<EndpointId> {
    TABLES.lock().endpoint_of(fd)
}

/// Daemon control/log/shm fds and local-side descriptors are invisible to
/// the application.
pub fn is_protected_fd(fd: c_int) -> bool {
    if reserved::is_reserved(fd) {
        return true;
    }
    TABLES
        .lock()
        .fd_rec(fd)
        .map(|r| r.is_local)
        .unwrap_or(false)
}

fn now_stamp() -> Stamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    Stamp {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    }
}

fn threshold() -> u64 {
    slipstream_config::config().optimize.threshold
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

unsafe fn sockaddr_raw(fd: c_int, local: bool) -> Option<(libc::sockaddr_storage, socklen_t)> {
    let mut storage: libc::sockaddr_storage = mem::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let sa = &mut storage as *mut _ as *mut libc::sockaddr;
    let ret = if local {
        libc::getsockname(fd, sa, &mut len)
    } else {
        libc::getpeername(fd, sa, &mut len)
    };
    if ret != 0 {
        return None;
    }
    Some((storage, len))
}

fn storage_to_netaddr(storage: &libc::sockaddr_storage) -> Option<NetAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(NetAddr {
                addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                port: u16::from_be(sin.sin_port),
            })
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(NetAddr {
                addr: IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                port: u16::from_be(sin6.sin6_port),
            })
        }
        _ => None,
    }
}

/// Seed the endpoint CRCs from the connection's address pair. Runs under
/// the table lock; getsockname/getpeername never block.
fn seed_from_fd(fd: c_int, info: &mut crate::table::EndpointRecord) {
    let local = unsafe { sockaddr_raw(fd, true) };
    let peer = unsafe { sockaddr_raw(fd, false) };
    match (local, peer) {
        (Some((ls, ll)), Some((ps, pl))) => {
            let lb = unsafe {
                std::slice::from_raw_parts(&ls as *const _ as *const u8, ll as usize)
            };
            let pb = unsafe {
                std::slice::from_raw_parts(&ps as *const _ as *const u8, pl as usize)
            };
            stats::seed_crcs(info, lb, pb);
        }
        _ => {
            slip_warn!("cannot resolve addresses of fd {} for CRC seed", fd);
            stats::seed_crcs(info, &[], &[]);
        }
    }
}

// ---------------------------------------------------------------------------
// Data calls
// ---------------------------------------------------------------------------

unsafe fn run_dispatch(
    fd: c_int,
    ep: EndpointId,
    dir: Direction,
    flags: c_int,
    bufs: &IoBufs<'_>,
    total: usize,
    issue: &mut dyn FnMut(c_int, usize, usize, c_int) -> ssize_t,
) -> ssize_t {
    let env = DispatchEnv {
        tables: &TABLES,
        threshold: threshold(),
    };
    dispatch::stream_io(
        &env,
        fd,
        ep,
        dir,
        flags,
        bufs,
        total,
        issue,
        &mut |f, e| engine::optimize_now(f, e),
        &mut |info| seed_from_fd(fd, info),
    )
}

unsafe fn flat_call(
    fd: c_int,
    ep: EndpointId,
    dir: Direction,
    base: *mut u8,
    len: size_t,
    flags: c_int,
) -> ssize_t {
    let bufs = IoBufs::Flat { base, len };
    let mut issue = |target: c_int, offset: usize, win: usize, fl: c_int| match dir {
        Direction::Send => reals::send(target, base.add(offset) as *const c_void, win, fl),
        Direction::Recv => reals::recv(target, base.add(offset) as *mut c_void, win, fl),
    };
    run_dispatch(fd, ep, dir, flags, &bufs, len, &mut issue)
}

pub unsafe fn read_hook(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    match registered_ep(fd) {
        None => reals::read(fd, buf, count),
        Some(ep) => flat_call(fd, ep, Direction::Recv, buf as *mut u8, count, 0),
    }
}

pub unsafe fn write_hook(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    match registered_ep(fd) {
        None => reals::write(fd, buf, count),
        Some(ep) => flat_call(fd, ep, Direction::Send, buf as *mut u8, count, 0),
    }
}

pub unsafe fn recv_hook(fd: c_int, buf: *mut c_void, count: size_t, flags: c_int) -> ssize_t {
    match registered_ep(fd) {
        None => reals::recv(fd, buf, count, flags),
        Some(ep) => flat_call(fd, ep, Direction::Recv, buf as *mut u8, count, flags),
    }
}

pub unsafe fn send_hook(fd: c_int, buf: *const c_void, count: size_t, flags: c_int) -> ssize_t {
    match registered_ep(fd) {
        None => reals::send(fd, buf, count, flags),
        Some(ep) => flat_call(fd, ep, Direction::Send, buf as *mut u8, count, flags),
    }
}

pub unsafe fn recvfrom_hook(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    flags: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    match registered_ep(fd) {
        None => reals::recvfrom(fd, buf, count, flags, addr, addrlen),
        Some(ep) => {
            // A connected stream socket has no use for the source address;
            // a caller that wants it filled in would observe the reroute.
            if !addr.is_null() {
                slip_fatal!("recvfrom with address argument on registered socket fd {}", fd);
            }
            flat_call(fd, ep, Direction::Recv, buf as *mut u8, count, flags)
        }
    }
}

pub unsafe fn sendto_hook(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    flags: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    match registered_ep(fd) {
        None => reals::sendto(fd, buf, count, flags, addr, addrlen),
        Some(ep) => {
            if !addr.is_null() {
                slip_fatal!("sendto with address argument on registered socket fd {}", fd);
            }
            flat_call(fd, ep, Direction::Send, buf as *mut u8, count, flags)
        }
    }
}

/// Vectored transfers are issued through sendmsg/recvmsg so partial
/// windows and the non-blocking continuation flag both work.
unsafe fn vec_call(
    fd: c_int,
    ep: EndpointId,
    dir: Direction,
    iov: &[libc::iovec],
    flags: c_int,
    total: usize,
) -> ssize_t {
    let bufs = IoBufs::Gather { iov };
    let mut issue = |target: c_int, offset: usize, win: usize, fl: c_int| {
        let window = bufs.window_iovec(offset, win);
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = window.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = window.len();
        match dir {
            Direction::Send => reals::sendmsg(target, &msg, fl),
            Direction::Recv => reals::recvmsg(target, &mut msg, fl),
        }
    };
    run_dispatch(fd, ep, dir, flags, &bufs, total, &mut issue)
}

pub unsafe fn readv_hook(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    let ep = match registered_ep(fd) {
        Some(ep) if iovcnt >= 0 => ep,
        _ => return reals::readv(fd, iov, iovcnt),
    };
    let slice = std::slice::from_raw_parts(iov, iovcnt as usize);
    match (IoBufs::Gather { iov: slice }).total() {
        // Length overflow: let the kernel produce the canonical error.
        None => reals::readv(fd, iov, iovcnt),
        Some(total) => vec_call(fd, ep, Direction::Recv, slice, 0, total),
    }
}

pub unsafe fn writev_hook(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    let ep = match registered_ep(fd) {
        Some(ep) if iovcnt >= 0 => ep,
        _ => return reals::writev(fd, iov, iovcnt),
    };
    let slice = std::slice::from_raw_parts(iov, iovcnt as usize);
    match (IoBufs::Gather { iov: slice }).total() {
        None => reals::writev(fd, iov, iovcnt),
        Some(total) => vec_call(fd, ep, Direction::Send, slice, 0, total),
    }
}

/// Control-bearing messages are never split: the whole message rides the
/// current transport, and if that pushes the counter past the threshold
/// without landing on it, the endpoint simply stays unoptimized.
unsafe fn msg_whole(
    fd: c_int,
    ep: EndpointId,
    dir: Direction,
    msg: *mut libc::msghdr,
    flags: c_int,
    iov: &[libc::iovec],
) -> ssize_t {
    let (state, localfd) = {
        let t = TABLES.lock();
        let info = t.ep_rec(ep);
        (info.state, info.localfd)
    };
    let target = if state == EndpointState::Optimized {
        localfd
    } else {
        fd
    };

    let mut shadow = *msg;
    shadow.msg_name = ptr::null_mut();
    shadow.msg_namelen = 0;

    let ret = match dir {
        Direction::Send => reals::sendmsg(target, &shadow, flags),
        Direction::Recv => reals::recvmsg(target, &mut shadow, flags),
    };
    if dir == Direction::Recv {
        (*msg).msg_namelen = 0;
        (*msg).msg_controllen = shadow.msg_controllen;
        (*msg).msg_flags = shadow.msg_flags;
    }

    let peek = dir == Direction::Recv && (flags & libc::MSG_PEEK) != 0;
    if ret > 0 && !peek {
        let bufs = IoBufs::Gather { iov };
        let chunks = bufs.chunks(0, ret as usize);
        let hit = {
            let mut t = TABLES.lock();
            let info = t.ep_rec_mut(ep);
            if !info.crc_seeded {
                seed_from_fd(fd, info);
            }
            stats::account(info, dir, threshold(), ret as usize, chunks)
        };
        if hit {
            engine::optimize_now(fd, ep);
        }
    }
    ret
}

unsafe fn msg_hook(fd: c_int, msg: *mut libc::msghdr, flags: c_int, dir: Direction) -> ssize_t {
    let ep = match registered_ep(fd) {
        Some(ep) => ep,
        None => {
            return match dir {
                Direction::Send => reals::sendmsg(fd, msg, flags),
                Direction::Recv => reals::recvmsg(fd, msg, flags),
            }
        }
    };
    let m = &*msg;
    let iov = if m.msg_iov.is_null() || m.msg_iovlen == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(m.msg_iov, m.msg_iovlen)
    };
    let total = match (IoBufs::Gather { iov }).total() {
        None => {
            return match dir {
                Direction::Send => reals::sendmsg(fd, msg, flags),
                Direction::Recv => reals::recvmsg(fd, msg, flags),
            }
        }
        Some(t) => t,
    };

    let has_control = !m.msg_control.is_null() && m.msg_controllen > 0;
    if has_control {
        return msg_whole(fd, ep, dir, msg, flags, iov);
    }

    let ret = vec_call(fd, ep, dir, iov, flags, total);
    if dir == Direction::Recv && ret >= 0 {
        // The local transport has no addressable peer; the name is never
        // filled in for registered sockets.
        (*msg).msg_namelen = 0;
    }
    ret
}

pub unsafe fn sendmsg_hook(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    msg_hook(fd, msg as *mut libc::msghdr, flags, Direction::Send)
}

pub unsafe fn recvmsg_hook(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    msg_hook(fd, msg, flags, Direction::Recv)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn register_socket(fd: c_int, is_accept: bool, non_blocking: bool, cloexec: bool) {
    let ep = match DAEMON.lock().register(fd) {
        Ok(ep) => ep,
        Err(e) => slip_fatal!("daemon REGISTER for fd {} failed: {}", fd, e),
    };
    let mut t = TABLES.lock();
    t.register(fd, ep, is_accept);
    t.set_nonblocking(fd, non_blocking);
    t.set_cloexec(fd, cloexec);
    drop(t);
    slip_log!(
        "registered fd={} as endpoint {} ({})",
        fd,
        ep,
        if is_accept { "accept" } else { "connect" }
    );
}

/// Finish an unregistration outside the table lock.
fn resolve_unregister(outcome: Unregister) {
    if let Unregister::Destroyed { ep, localfd } = outcome {
        if let Some(lfd) = localfd {
            unsafe { reals::close(lfd) };
            slip_log!("closed local fd {} of endpoint {}", lfd, ep);
        }
        if let Err(e) = DAEMON.lock().unregister(ep) {
            slip_warn!("daemon UNREGISTER {} failed: {}", ep, e);
        }
    }
}

pub unsafe fn socket_hook(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = reals::socket(domain, ty, protocol);

    // v4 TCP streams only; v6 is policy-excluded and passes through.
    let stream = (ty & libc::SOCK_STREAM) != 0;
    let tcp = protocol == 0 || protocol == libc::IPPROTO_TCP;
    if fd != -1 && domain == libc::AF_INET && stream && tcp && crate::table::inbounds_fd(fd) {
        register_socket(
            fd,
            false,
            (ty & libc::SOCK_NONBLOCK) != 0,
            (ty & libc::SOCK_CLOEXEC) != 0,
        );
    }
    fd
}

pub unsafe fn accept4_hook(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    let listener_registered = TABLES.lock().is_registered(fd);
    let start = now_stamp();
    let ret = reals::accept4(fd, addr, addrlen, flags);
    if listener_registered && ret != -1 && crate::table::inbounds_fd(ret) {
        let end = now_stamp();
        register_socket(
            ret,
            true,
            (flags & libc::SOCK_NONBLOCK) != 0,
            (flags & libc::SOCK_CLOEXEC) != 0,
        );
        TABLES.lock().set_connect_times(ret, start, end);
        submit_info_if_needed(ret);
    }
    ret
}

pub unsafe fn connect_hook(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    let ep = registered_ep(fd);
    let start = now_stamp();
    let ret = reals::connect(fd, addr, addrlen);
    if let Some(ep) = ep {
        let non_blocking = TABLES.lock().ep_rec(ep).non_blocking;
        let in_progress = ret == -1 && errno() == libc::EINPROGRESS && non_blocking;
        if ret != -1 || in_progress {
            // For an async connect the end stamp is best-effort: the
            // handshake may still be in flight.
            let end = now_stamp();
            let mut t = TABLES.lock();
            if t.ep_rec(ep).connect_start.is_zero() {
                t.set_connect_times(fd, start, end);
            }
            drop(t);
            submit_info_if_needed(fd);
        }
    }
    ret
}

pub fn submit_info_if_needed(fd: c_int) {
    let (ep, is_accept, start, end) = {
        let t = TABLES.lock();
        let ep = match t.endpoint_of(fd) {
            Some(ep) => ep,
            None => return,
        };
        let info = t.ep_rec(ep);
        if info.state != EndpointState::Unopt || info.sent_info {
            return;
        }
        (ep, info.is_accept, info.connect_start, info.connect_end)
    };

    let src = unsafe { sockaddr_raw(fd, true) }.and_then(|(s, _)| storage_to_netaddr(&s));
    let dst = unsafe { sockaddr_raw(fd, false) }.and_then(|(s, _)| storage_to_netaddr(&s));
    let (src, dst) = match (src, dst) {
        (Some(s), Some(d)) => (s, d),
        _ => {
            slip_log!("cannot gather address info for fd={} ep={}", fd, ep);
            return;
        }
    };

    let info = EndpointInfo {
        is_accept,
        connect_start: MonoTime {
            sec: start.sec,
            nsec: start.nsec,
        },
        connect_end: MonoTime {
            sec: end.sec,
            nsec: end.nsec,
        },
        src,
        dst,
    };
    let res = DAEMON.lock().endpoint_info(ep, info);
    match res {
        Ok(()) => {
            TABLES.lock().ep_rec_mut(ep).sent_info = true;
            slip_log!("submitted info for fd={} ep={}", fd, ep);
        }
        Err(e) => slip_warn!("ENDPOINT_INFO for ep {} failed: {}", ep, e),
    }
}

pub unsafe fn close_hook(fd: c_int) -> c_int {
    if is_protected_fd(fd) {
        slip_log!("refusing close of protected fd {}", fd);
        return 0;
    }
    let ret = reals::close(fd);
    let outcome = TABLES.lock().unregister(fd);
    if let Unregister::Destroyed { ep, .. } = outcome {
        slip_log!("last reference to endpoint {} dropped (fd {})", ep, fd);
    }
    resolve_unregister(outcome);
    ret
}

pub unsafe fn shutdown_hook(fd: c_int, how: c_int) -> c_int {
    if is_protected_fd(fd) {
        slip_log!("refusing shutdown of protected fd {}", fd);
        set_errno(libc::EBADF);
        return -1;
    }
    let ret = reals::shutdown(fd, how);
    // Mirror onto the local side so the peer observes the half-close.
    if let Some(lfd) = TABLES.lock().optimized_local(fd) {
        reals::shutdown(lfd, how);
    }
    ret
}

pub unsafe fn dup_hook(fd: c_int) -> c_int {
    if is_protected_fd(fd) {
        set_errno(libc::EBADF);
        return -1;
    }
    let ret = reals::dup(fd);
    if ret >= 0 {
        copy_binding(fd, ret, false);
    }
    ret
}

pub unsafe fn dup2_hook(oldfd: c_int, newfd: c_int) -> c_int {
    if is_protected_fd(oldfd) || is_protected_fd(newfd) {
        set_errno(libc::EBADF);
        return -1;
    }
    let ret = reals::dup2(oldfd, newfd);
    if ret >= 0 && oldfd != newfd {
        copy_binding(oldfd, newfd, false);
    }
    ret
}

pub unsafe fn dup3_hook(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    if is_protected_fd(oldfd) || is_protected_fd(newfd) {
        set_errno(libc::EBADF);
        return -1;
    }
    let ret = reals::dup3(oldfd, newfd, flags);
    if ret >= 0 {
        copy_binding(oldfd, newfd, (flags & libc::O_CLOEXEC) != 0);
    }
    ret
}

/// Shared tail of dup/dup2/dup3/F_DUPFD: the destination slot was just
/// (implicitly) closed by the kernel and now aliases the source.
fn copy_binding(src: c_int, dst: c_int, cloexec: bool) {
    let outcome = {
        let mut t = TABLES.lock();
        let outcome = t.unregister(dst);
        t.dup(src, dst);
        t.set_cloexec(dst, cloexec);
        outcome
    };
    resolve_unregister(outcome);
}

pub unsafe fn fcntl_hook(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    if is_protected_fd(fd) {
        slip_log!("refusing fcntl(cmd={}) on protected fd {}", cmd, fd);
        set_errno(libc::EBADF);
        return -1;
    }
    match cmd {
        libc::F_SETFD => {
            let ret = reals::fcntl(fd, cmd, arg);
            if ret == 0 {
                TABLES
                    .lock()
                    .set_cloexec(fd, (arg as c_int & libc::FD_CLOEXEC) != 0);
            }
            ret
        }
        libc::F_SETFL => {
            let ret = reals::fcntl(fd, cmd, arg);
            if ret == 0 {
                let non_blocking = (arg as c_int & libc::O_NONBLOCK) != 0;
                let local = {
                    let mut t = TABLES.lock();
                    t.set_nonblocking(fd, non_blocking);
                    t.optimized_local(fd)
                };
                if let Some(lfd) = local {
                    let lflags = reals::fcntl(lfd, libc::F_GETFL, 0);
                    if lflags >= 0 {
                        let lflags = if non_blocking {
                            lflags | libc::O_NONBLOCK
                        } else {
                            lflags & !libc::O_NONBLOCK
                        };
                        reals::fcntl(lfd, libc::F_SETFL, lflags as usize);
                    }
                }
            }
            ret
        }
        libc::F_DUPFD => {
            let ret = reals::fcntl(fd, cmd, arg);
            if ret >= 0 {
                copy_binding(fd, ret, false);
            }
            ret
        }
        libc::F_DUPFD_CLOEXEC => {
            let ret = reals::fcntl(fd, cmd, arg);
            if ret >= 0 {
                copy_binding(fd, ret, true);
            }
            ret
        }
        _ => reals::fcntl(fd, cmd, arg),
    }
}

pub unsafe fn setsockopt_hook(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let ret = reals::setsockopt(fd, level, optname, optval, optlen);
    // Buffer sizing must be visible on the fast path too.
    if ret == 0
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_SNDBUF || optname == libc::SO_RCVBUF)
    {
        if let Some(lfd) = TABLES.lock().optimized_local(fd) {
            reals::setsockopt(lfd, level, optname, optval, optlen);
        }
    }
    ret
}

// ---------------------------------------------------------------------------
// fork / exec / teardown
// ---------------------------------------------------------------------------

pub unsafe fn fork_hook() -> libc::pid_t {
    let pid = reals::fork();
    match pid {
        -1 => slip_log!("fork failed (errno {})", errno()),
        0 => {
            // Locks can be held by parent threads that do not exist here.
            TABLES.force_unlock_after_fork();
            DAEMON.force_unlock_after_fork();
            reregister_inherited();
        }
        child => slip_log!("forked child {}", child),
    }
    pid
}

/// Eagerly rebind every inherited endpoint to this (child) pid. The first
/// daemon command redials the control connection automatically.
fn reregister_inherited() {
    let regs = TABLES.lock().registered_fds();
    for (fd, ep) in regs {
        if let Err(e) = DAEMON.lock().reregister(ep, fd) {
            slip_warn!("REREGISTER {} for fd {} failed: {}", ep, fd, e);
        }
    }
}

pub unsafe fn execv_hook(path: *const libc::c_char, argv: *const *const libc::c_char) -> c_int {
    crate::shm::state_save();
    let ret = reals::execv(path, argv);
    crate::shm::state_destroy();
    ret
}

pub unsafe fn execve_hook(
    path: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> c_int {
    crate::shm::state_save();
    let ret = reals::execve(path, argv, envp);
    crate::shm::state_destroy();
    ret
}

pub unsafe fn execvp_hook(file: *const libc::c_char, argv: *const *const libc::c_char) -> c_int {
    crate::shm::state_save();
    let ret = reals::execvp(file, argv);
    crate::shm::state_destroy();
    ret
}

pub unsafe fn execvpe_hook(
    file: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> c_int {
    crate::shm::state_save();
    let ret = reals::execvpe(file, argv, envp);
    crate::shm::state_destroy();
    ret
}

/// Post-exec: fds the pre-exec image marked close-on-exec are gone from
/// the kernel; drop them from the restored table too.
pub fn scan_inherited_cloexec() {
    let stale: Vec<i32> = {
        let t = TABLES.lock();
        (0..crate::table::TABLE_SIZE as i32)
            .filter(|&fd| {
                let rec = t.fd_rec(fd).unwrap();
                rec.close_on_exec && (crate::table::valid_ep(rec.ep) || rec.epoll.valid)
            })
            .collect()
    };
    for fd in stale {
        let outcome = TABLES.lock().unregister(fd);
        resolve_unregister(outcome);
    }
}

pub fn log_inherited_fds() {
    let t = TABLES.lock();
    for (fd, ep) in t.registered_fds() {
        let info = t.ep_rec(ep);
        slip_log!(
            "inherited known fd: {} -> (endpoint: {}, localfd: {})",
            fd,
            ep,
            info.localfd
        );
    }
}

/// Process teardown: summarize, release our references, and let the
/// daemon drop anything still owned by this pid.
pub fn teardown() {
    let regs = TABLES.lock().registered_fds();
    for (fd, ep) in &regs {
        let t = TABLES.lock();
        let info = t.ep_rec(*ep);
        if info.state == EndpointState::Optimized {
            slip_log!(
                "optimized endpoint: ep={}, fd={}, localfd={}, S: {} R: {}",
                ep,
                fd,
                info.localfd,
                info.bytes_sent,
                info.bytes_recv
            );
        } else {
            slip_log!(
                "normal endpoint: ep={}, fd={}, S: {} R: {}",
                ep,
                fd,
                info.bytes_sent,
                info.bytes_recv
            );
        }
    }

    // Release references without mutating routing state other threads may
    // still be using.
    for (_fd, ep) in &regs {
        let last = {
            let mut t = TABLES.lock();
            let info = t.ep_rec_mut(*ep);
            info.ref_count = info.ref_count.saturating_sub(1);
            info.ref_count == 0
        };
        if last {
            if let Err(e) = DAEMON.lock().unregister(*ep) {
                slip_warn!("UNREGISTER {} at teardown failed: {}", ep, e);
            }
        }
    }

    if let Err(e) = DAEMON.lock().remove_all() {
        slip_warn!("REMOVEALL at teardown failed: {}", e);
    }
}
