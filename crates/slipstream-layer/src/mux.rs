//! Readiness multiplexer rewriting.
//!
//! After a cutover the application still waits on its original fd, but
//! readiness happens on the local descriptor. poll and select get their
//! descriptor sets rewritten on entry and mapped back on exit. epoll is
//! stateful: the layer mirrors each epoll instance's interest set in the
//! fd table and migrates watches from original to local descriptors the
//! moment it notices a cutover, so the kernel-side registration always
//! follows the live transport while the application's view (its fd, its
//! event cookie) stays untouched.

use crate::sync::SpinLock;
use crate::table::{EpollWatch, Tables};
use crate::{reals, slip_fatal};
use libc::{c_int, nfds_t};
use std::mem;
use std::ptr;

/// (application fd, local fd) pairs for every OPTIMIZED fd in `fds`.
fn optimized_map<I>(tables: &SpinLock<Tables>, fds: I) -> Vec<(i32, i32)>
where
    I: IntoIterator<Item = i32>,
{
    let t = tables.lock();
    let mut map = Vec::new();
    for fd in fds {
        if let Some(local) = t.optimized_local(fd) {
            map.push((fd, local));
        }
    }
    map
}

fn mapped(map: &[(i32, i32)], fd: i32) -> i32 {
    map.iter()
        .find(|(orig, _)| *orig == fd)
        .map(|(_, local)| *local)
        .unwrap_or(fd)
}

// ---------------------------------------------------------------------------
// poll
// ---------------------------------------------------------------------------

/// Substitute local descriptors into a copy of the caller's pollfd array.
pub fn substitute_pollfds(fds: &mut [libc::pollfd], map: &[(i32, i32)]) {
    for p in fds.iter_mut() {
        p.fd = mapped(map, p.fd);
    }
}

/// Copy kernel-reported revents back into the caller's array, positionally.
pub fn restore_pollfds(caller: &mut [libc::pollfd], rewritten: &[libc::pollfd]) {
    for (c, r) in caller.iter_mut().zip(rewritten.iter()) {
        c.revents = r.revents;
    }
}

pub unsafe fn poll_hook(
    tables: &SpinLock<Tables>,
    fds: *mut libc::pollfd,
    nfds: nfds_t,
    timeout: c_int,
) -> c_int {
    if fds.is_null() || nfds == 0 {
        return reals::poll(fds, nfds, timeout);
    }
    let caller = std::slice::from_raw_parts_mut(fds, nfds as usize);
    let map = optimized_map(tables, caller.iter().map(|p| p.fd));
    if map.is_empty() {
        return reals::poll(fds, nfds, timeout);
    }

    let mut rewritten = caller.to_vec();
    substitute_pollfds(&mut rewritten, &map);
    let ret = reals::poll(rewritten.as_mut_ptr(), nfds, timeout);
    if ret >= 0 {
        restore_pollfds(caller, &rewritten);
    }
    ret
}

// ---------------------------------------------------------------------------
// select / pselect
// ---------------------------------------------------------------------------

/// Rewrite one fd_set through the map. Returns the rewritten set and the
/// smallest nfds covering it.
pub unsafe fn remap_fdset(src: &libc::fd_set, nfds: c_int, map: &[(i32, i32)]) -> (libc::fd_set, c_int) {
    let mut out: libc::fd_set = mem::zeroed();
    libc::FD_ZERO(&mut out);
    let mut max = 0;
    for fd in 0..nfds {
        if libc::FD_ISSET(fd, src) {
            let eq = mapped(map, fd);
            libc::FD_SET(eq, &mut out);
            max = max.max(eq + 1);
        }
    }
    (out, max)
}

/// Clear each caller-set fd whose equivalent descriptor did not come back
/// ready from the kernel.
pub unsafe fn fold_fdset(
    caller: &mut libc::fd_set,
    kernel: &libc::fd_set,
    nfds: c_int,
    map: &[(i32, i32)],
) {
    for fd in 0..nfds {
        if libc::FD_ISSET(fd, caller) && !libc::FD_ISSET(mapped(map, fd), kernel) {
            libc::FD_CLR(fd, caller);
        }
    }
}

unsafe fn fdset_members(set: *const libc::fd_set, nfds: c_int, out: &mut Vec<i32>) {
    if set.is_null() {
        return;
    }
    for fd in 0..nfds {
        if libc::FD_ISSET(fd, set) {
            out.push(fd);
        }
    }
}

/// Shared body for select and pselect; `wait` runs the real syscall with
/// the rewritten sets.
unsafe fn select_common(
    tables: &SpinLock<Tables>,
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set,
    wait: &mut dyn FnMut(c_int, *mut libc::fd_set, *mut libc::fd_set, *mut libc::fd_set) -> c_int,
) -> c_int {
    let nfds = nfds.clamp(0, libc::FD_SETSIZE as c_int);
    let mut members = Vec::new();
    fdset_members(readfds, nfds, &mut members);
    fdset_members(writefds, nfds, &mut members);
    fdset_members(errorfds, nfds, &mut members);
    let map = optimized_map(tables, members.into_iter());
    if map.is_empty() {
        return wait(nfds, readfds, writefds, errorfds);
    }

    let mut new_nfds = nfds;
    let mut remap = |set: *mut libc::fd_set, new_nfds: &mut c_int| -> Option<libc::fd_set> {
        if set.is_null() {
            return None;
        }
        let (copy, max) = remap_fdset(&*set, nfds, &map);
        *new_nfds = (*new_nfds).max(max);
        Some(copy)
    };
    let mut rd = remap(readfds, &mut new_nfds);
    let mut wr = remap(writefds, &mut new_nfds);
    let mut er = remap(errorfds, &mut new_nfds);

    let as_ptr = |s: &mut Option<libc::fd_set>| {
        s.as_mut()
            .map(|x| x as *mut libc::fd_set)
            .unwrap_or(ptr::null_mut())
    };
    let ret = wait(new_nfds, as_ptr(&mut rd), as_ptr(&mut wr), as_ptr(&mut er));
    if ret >= 0 {
        if let Some(k) = rd {
            fold_fdset(&mut *readfds, &k, nfds, &map);
        }
        if let Some(k) = wr {
            fold_fdset(&mut *writefds, &k, nfds, &map);
        }
        if let Some(k) = er {
            fold_fdset(&mut *errorfds, &k, nfds, &map);
        }
    }
    ret
}

pub unsafe fn select_hook(
    tables: &SpinLock<Tables>,
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set,
    timeout: *mut libc::timeval,
) -> c_int {
    select_common(tables, nfds, readfds, writefds, errorfds, &mut |n, r, w, e| {
        reals::select(n, r, w, e, timeout)
    })
}

pub unsafe fn pselect_hook(
    tables: &SpinLock<Tables>,
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set,
    timeout: *const libc::timespec,
    sigmask: *const libc::sigset_t,
) -> c_int {
    select_common(tables, nfds, readfds, writefds, errorfds, &mut |n, r, w, e| {
        reals::pselect(n, r, w, e, timeout, sigmask)
    })
}

// ---------------------------------------------------------------------------
// epoll
// ---------------------------------------------------------------------------

/// Record a fresh epoll instance in the table.
pub fn note_epoll_instance(tables: &SpinLock<Tables>, epfd: c_int) {
    let mut t = tables.lock();
    if let Some(rec) = t.fd_rec_mut(epfd) {
        rec.epoll.valid = true;
        rec.epoll.count = 0;
    }
}

/// `epoll_ctl` with the layer's interest-set mirror kept in sync.
///
/// `ctl` issues the real syscall (injected so the registry logic is
/// testable against a scripted kernel).
pub unsafe fn epoll_ctl_dispatch(
    tables: &SpinLock<Tables>,
    epfd: c_int,
    op: c_int,
    fd: c_int,
    event: *mut libc::epoll_event,
    ctl: &mut dyn FnMut(c_int, c_int, c_int, *mut libc::epoll_event) -> c_int,
) -> c_int {
    let tracked = {
        let t = tables.lock();
        t.fd_rec(epfd).map(|r| r.epoll.valid).unwrap_or(false)
    };
    if !tracked {
        return ctl(epfd, op, fd, event);
    }

    match op {
        libc::EPOLL_CTL_ADD => {
            let target = {
                let t = tables.lock();
                let rec = t.fd_rec(epfd).expect("tracked epoll fd in range");
                // Watching one endpoint through two different fds would
                // need per-watch readiness demultiplexing; refuse loudly.
                if let Some(ep) = t.endpoint_of(fd) {
                    for w in rec.epoll.entries() {
                        if w.fd != fd && t.endpoint_of(w.fd) == Some(ep) {
                            slip_fatal!(
                                "duplicate epoll registration of one endpoint (fds {} and {})",
                                w.fd,
                                fd
                            );
                        }
                    }
                }
                if rec.epoll.count as usize == crate::table::MAX_EPOLL_WATCHES {
                    slip_fatal!("epoll instance {} exceeds watch capacity", epfd);
                }
                t.optimized_local(fd).unwrap_or(fd)
            };
            let ret = ctl(epfd, op, target, event);
            if ret == 0 {
                let mut t = tables.lock();
                let rec = t.fd_rec_mut(epfd).expect("tracked epoll fd in range");
                rec.epoll.push(EpollWatch {
                    fd,
                    events: (*event).events,
                    data: (*event).u64,
                    target,
                });
            }
            ret
        }
        libc::EPOLL_CTL_MOD => {
            let target = {
                let t = tables.lock();
                let rec = t.fd_rec(epfd).expect("tracked epoll fd in range");
                match rec.epoll.find(fd) {
                    Some(idx) => rec.epoll.entries()[idx].target,
                    None => fd,
                }
            };
            let ret = ctl(epfd, op, target, event);
            if ret == 0 {
                let mut t = tables.lock();
                let rec = t.fd_rec_mut(epfd).expect("tracked epoll fd in range");
                if let Some(idx) = rec.epoll.find(fd) {
                    let w = &mut rec.epoll.entries_mut()[idx];
                    w.events = (*event).events;
                    w.data = (*event).u64;
                }
            }
            ret
        }
        libc::EPOLL_CTL_DEL => {
            let target = {
                let t = tables.lock();
                let rec = t.fd_rec(epfd).expect("tracked epoll fd in range");
                match rec.epoll.find(fd) {
                    Some(idx) => rec.epoll.entries()[idx].target,
                    None => fd,
                }
            };
            let ret = ctl(epfd, op, target, event);
            if ret == 0 {
                let mut t = tables.lock();
                let rec = t.fd_rec_mut(epfd).expect("tracked epoll fd in range");
                if let Some(idx) = rec.epoll.find(fd) {
                    rec.epoll.remove(idx);
                }
            }
            ret
        }
        _ => ctl(epfd, op, fd, event),
    }
}

/// Move kernel registrations of freshly optimized endpoints from the
/// original fd to the local one, keeping the saved mask and cookie.
/// Called on entry to every epoll wait.
pub unsafe fn migrate_watches(
    tables: &SpinLock<Tables>,
    epfd: c_int,
    ctl: &mut dyn FnMut(c_int, c_int, c_int, *mut libc::epoll_event) -> c_int,
) {
    let pending: Vec<(i32, i32, u32, u64)> = {
        let t = tables.lock();
        let rec = match t.fd_rec(epfd) {
            Some(r) if r.epoll.valid => r,
            _ => return,
        };
        rec.epoll
            .entries()
            .iter()
            .filter(|w| w.target == w.fd)
            .filter_map(|w| {
                t.optimized_local(w.fd)
                    .map(|local| (w.fd, local, w.events, w.data))
            })
            .collect()
    };

    for (fd, local, events, data) in pending {
        ctl(epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut());
        let mut ev = libc::epoll_event { events, u64: data };
        if ctl(epfd, libc::EPOLL_CTL_ADD, local, &mut ev) == 0 {
            let mut t = tables.lock();
            if let Some(rec) = t.fd_rec_mut(epfd) {
                if let Some(idx) = rec.epoll.find(fd) {
                    rec.epoll.entries_mut()[idx].target = local;
                }
            }
        }
    }
}

pub unsafe fn epoll_pwait_hook(
    tables: &SpinLock<Tables>,
    epfd: c_int,
    events: *mut libc::epoll_event,
    maxevents: c_int,
    timeout: c_int,
    sigmask: *const libc::sigset_t,
) -> c_int {
    migrate_watches(tables, epfd, &mut |e, op, fd, ev| reals::epoll_ctl(e, op, fd, ev));
    if sigmask.is_null() {
        reals::epoll_wait(epfd, events, maxevents, timeout)
    } else {
        reals::epoll_pwait(epfd, events, maxevents, timeout, sigmask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{EndpointState, Tables};

    fn tables_with_optimized(fd: i32, ep: u32, local: i32) -> Box<SpinLock<Tables>> {
        let t = Box::new(SpinLock::new(Tables::new()));
        {
            let mut tt = t.lock();
            tt.register(fd, ep, false);
            tt.claim_local(local);
            let info = tt.ep_rec_mut(ep);
            info.localfd = local;
            info.state = EndpointState::Optimized;
        }
        t
    }

    #[test]
    fn pollfd_substitution_and_revents_restore() {
        let map = vec![(5, 40)];
        let mut fds = [
            libc::pollfd {
                fd: 5,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: 8,
                events: libc::POLLOUT,
                revents: 0,
            },
        ];
        let mut rewritten = fds.to_vec();
        substitute_pollfds(&mut rewritten, &map);
        assert_eq!(rewritten[0].fd, 40);
        assert_eq!(rewritten[1].fd, 8);

        rewritten[0].revents = libc::POLLIN;
        restore_pollfds(&mut fds, &rewritten);
        assert_eq!(fds[0].fd, 5, "caller's fd numbers untouched");
        assert_eq!(fds[0].revents, libc::POLLIN);
        assert_eq!(fds[1].revents, 0);
    }

    #[test]
    fn fdset_remap_substitutes_and_bumps_nfds() {
        unsafe {
            let mut src: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut src);
            libc::FD_SET(5, &mut src);
            libc::FD_SET(8, &mut src);

            let map = vec![(5, 40)];
            let (copy, max) = remap_fdset(&src, 16, &map);
            assert!(libc::FD_ISSET(40, &copy));
            assert!(libc::FD_ISSET(8, &copy));
            assert!(!libc::FD_ISSET(5, &copy));
            assert_eq!(max, 41);
        }
    }

    #[test]
    fn fdset_fold_reports_local_readiness_on_original_fd() {
        unsafe {
            let mut caller: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut caller);
            libc::FD_SET(5, &mut caller);
            libc::FD_SET(8, &mut caller);

            // Kernel says the local fd (40) is ready, 8 is not.
            let mut kernel: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut kernel);
            libc::FD_SET(40, &mut kernel);

            let map = vec![(5, 40)];
            fold_fdset(&mut caller, &kernel, 16, &map);
            assert!(libc::FD_ISSET(5, &caller), "ready via local fd");
            assert!(!libc::FD_ISSET(8, &caller), "not ready, cleared");
        }
    }

    #[test]
    fn optimized_map_skips_unoptimized_and_unregistered() {
        let t = tables_with_optimized(5, 0, 40);
        t.lock().register(6, 1, false);
        let map = optimized_map(&t, vec![5, 6, 7]);
        assert_eq!(map, vec![(5, 40)]);
    }

    struct FakeKernel {
        ops: Vec<(c_int, c_int, c_int)>,
    }

    impl FakeKernel {
        fn ctl(&mut self) -> impl FnMut(c_int, c_int, c_int, *mut libc::epoll_event) -> c_int + '_ {
            |epfd, op, fd, _ev| {
                self.ops.push((epfd, op, fd));
                0
            }
        }
    }

    #[test]
    fn epoll_add_on_unoptimized_fd_targets_the_fd_itself() {
        let t = Box::new(SpinLock::new(Tables::new()));
        t.lock().register(5, 0, false);
        note_epoll_instance(&t, 9);

        let mut k = FakeKernel { ops: vec![] };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0xabc,
        };
        let ret = unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut k.ctl()) };
        assert_eq!(ret, 0);
        assert_eq!(k.ops, vec![(9, libc::EPOLL_CTL_ADD, 5)]);

        let tt = t.lock();
        let set = &tt.fd_rec(9).unwrap().epoll;
        assert_eq!(set.count, 1);
        assert_eq!(set.entries()[0].fd, 5);
        assert_eq!(set.entries()[0].target, 5);
        assert_eq!(set.entries()[0].data, 0xabc);
    }

    #[test]
    fn epoll_add_on_optimized_fd_targets_local() {
        let t = tables_with_optimized(5, 0, 40);
        note_epoll_instance(&t, 9);
        let mut k = FakeKernel { ops: vec![] };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 7,
        };
        unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut k.ctl()) };
        assert_eq!(k.ops, vec![(9, libc::EPOLL_CTL_ADD, 40)]);
        let tt = t.lock();
        assert_eq!(tt.fd_rec(9).unwrap().epoll.entries()[0].target, 40);
    }

    #[test]
    fn wait_migrates_watch_after_cutover_and_only_once() {
        let t = Box::new(SpinLock::new(Tables::new()));
        t.lock().register(5, 0, false);
        note_epoll_instance(&t, 9);

        let mut k = FakeKernel { ops: vec![] };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0xfeed,
        };
        unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut k.ctl()) };

        // Cutover happens later.
        {
            let mut tt = t.lock();
            tt.claim_local(40);
            let info = tt.ep_rec_mut(0);
            info.localfd = 40;
            info.state = EndpointState::Optimized;
        }

        k.ops.clear();
        unsafe { migrate_watches(&t, 9, &mut k.ctl()) };
        assert_eq!(
            k.ops,
            vec![(9, libc::EPOLL_CTL_DEL, 5), (9, libc::EPOLL_CTL_ADD, 40)]
        );
        {
            let tt = t.lock();
            let w = tt.fd_rec(9).unwrap().epoll.entries()[0];
            assert_eq!(w.target, 40);
            assert_eq!(w.fd, 5, "application view keeps the original fd");
            assert_eq!(w.data, 0xfeed);
        }

        // Second wait: nothing left to migrate.
        k.ops.clear();
        unsafe { migrate_watches(&t, 9, &mut k.ctl()) };
        assert!(k.ops.is_empty());
    }

    #[test]
    fn mod_after_migration_drives_the_local_target() {
        let t = tables_with_optimized(5, 0, 40);
        note_epoll_instance(&t, 9);
        let mut k = FakeKernel { ops: vec![] };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 1,
        };
        unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut k.ctl()) };

        let mut ev2 = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT) as u32,
            u64: 2,
        };
        unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_MOD, 5, &mut ev2, &mut k.ctl()) };
        assert_eq!(k.ops[1], (9, libc::EPOLL_CTL_MOD, 40));
        let tt = t.lock();
        let w = tt.fd_rec(9).unwrap().epoll.entries()[0];
        assert_eq!(w.data, 2);
        assert_eq!(w.events, (libc::EPOLLIN | libc::EPOLLOUT) as u32);
    }

    #[test]
    fn del_removes_registry_entry() {
        let t = tables_with_optimized(5, 0, 40);
        note_epoll_instance(&t, 9);
        let mut k = FakeKernel { ops: vec![] };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 1,
        };
        unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut k.ctl()) };
        unsafe {
            epoll_ctl_dispatch(
                &t,
                9,
                libc::EPOLL_CTL_DEL,
                5,
                std::ptr::null_mut(),
                &mut k.ctl(),
            )
        };
        assert_eq!(k.ops[1], (9, libc::EPOLL_CTL_DEL, 40));
        assert_eq!(t.lock().fd_rec(9).unwrap().epoll.count, 0);
    }

    #[test]
    fn untracked_epfd_passes_through() {
        let t = Box::new(SpinLock::new(Tables::new()));
        let mut k = FakeKernel { ops: vec![] };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0,
        };
        unsafe { epoll_ctl_dispatch(&t, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut k.ctl()) };
        assert_eq!(k.ops, vec![(9, libc::EPOLL_CTL_ADD, 5)]);
        assert_eq!(t.lock().fd_rec(9).unwrap().epoll.count, 0);
    }
}
