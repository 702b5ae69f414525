//! The process-wide descriptor table.
//!
//! Two fixed arrays indexed by small integers: one record per fd slot and
//! one per endpoint id. Everything here is plain-old-data (the whole
//! `Tables` struct is copied bytewise into a shared-memory segment to
//! survive exec) and everything here is pure bookkeeping: no syscalls,
//! no daemon traffic. Callers get back an outcome describing what must
//! happen outside the lock (close a local fd, tell the daemon).
//!
//! Out-of-range fds are simply not registered; the layer treats them as
//! pass-through.

use crate::sync::SpinLock;
use slipstream_ipc::{EndpointId, ENDPOINT_INVALID};

pub const TABLE_SIZE: usize = 1 << 10;
// Conservative: statically sizing for the maximum possible epoll interest
// set would bloat the exec-transfer segment. Programs watching more than
// this many sockets per epoll instance are not supported.
pub const MAX_EPOLL_WATCHES: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Invalid = 0,
    Unopt = 1,
    IdExchange = 2,
    Optimized = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Stamp {
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

/// One fd the application registered with an epoll instance.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EpollWatch {
    /// The fd the application asked to watch.
    pub fd: i32,
    /// Saved event mask.
    pub events: u32,
    /// Saved application cookie (`epoll_event.u64`).
    pub data: u64,
    /// The fd currently registered with the kernel: `fd` itself, or the
    /// local descriptor after migration.
    pub target: i32,
}

impl EpollWatch {
    const EMPTY: EpollWatch = EpollWatch {
        fd: -1,
        events: 0,
        data: 0,
        target: -1,
    };
}

/// Interest-set mirror for one epoll instance.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EpollSet {
    pub valid: bool,
    pub count: u32,
    pub watches: [EpollWatch; MAX_EPOLL_WATCHES],
}

impl EpollSet {
    pub const EMPTY: EpollSet = EpollSet {
        valid: false,
        count: 0,
        watches: [EpollWatch::EMPTY; MAX_EPOLL_WATCHES],
    };

    pub fn entries(&self) -> &[EpollWatch] {
        &self.watches[..self.count as usize]
    }

    pub fn entries_mut(&mut self) -> &mut [EpollWatch] {
        &mut self.watches[..self.count as usize]
    }

    pub fn find(&self, fd: i32) -> Option<usize> {
        self.entries().iter().position(|w| w.fd == fd)
    }

    /// Returns false when the set is full.
    pub fn push(&mut self, w: EpollWatch) -> bool {
        if (self.count as usize) == MAX_EPOLL_WATCHES {
            return false;
        }
        self.watches[self.count as usize] = w;
        self.count += 1;
        true
    }

    pub fn remove(&mut self, idx: usize) {
        assert!(idx < self.count as usize);
        self.watches[idx] = self.watches[self.count as usize - 1];
        self.watches[self.count as usize - 1] = EpollWatch::EMPTY;
        self.count -= 1;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FdRecord {
    /// Endpoint this fd refers to, or `ENDPOINT_INVALID`.
    pub ep: EndpointId,
    /// Close-on-exec as the layer tracks it (distinct from the kernel bit;
    /// consulted when restoring state after exec).
    pub close_on_exec: bool,
    /// The optimized local side of some endpoint. Never shown to the
    /// application.
    pub is_local: bool,
    pub epoll: EpollSet,
}

impl FdRecord {
    pub const EMPTY: FdRecord = FdRecord {
        ep: ENDPOINT_INVALID,
        close_on_exec: false,
        is_local: false,
        epoll: EpollSet::EMPTY,
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EndpointRecord {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    /// Running CRC-32 over the first `threshold` bytes sent/received,
    /// seeded with the connection's address pair.
    pub crc_sent: u32,
    pub crc_recv: u32,
    pub crc_seeded: bool,
    pub connect_start: Stamp,
    pub connect_end: Stamp,
    /// Local descriptor; 0 when not optimized.
    pub localfd: i32,
    /// Number of fd records pointing at this endpoint.
    pub ref_count: u16,
    pub state: EndpointState,
    pub non_blocking: bool,
    /// Passive (accepted) side?
    pub is_accept: bool,
    pub sent_info: bool,
    /// Pairing was attempted and abandoned; stay unoptimized for good.
    pub no_retry: bool,
}

impl EndpointRecord {
    pub const EMPTY: EndpointRecord = EndpointRecord {
        bytes_sent: 0,
        bytes_recv: 0,
        crc_sent: 0,
        crc_recv: 0,
        crc_seeded: false,
        connect_start: Stamp { sec: 0, nsec: 0 },
        connect_end: Stamp { sec: 0, nsec: 0 },
        localfd: 0,
        ref_count: 0,
        state: EndpointState::Invalid,
        non_blocking: false,
        is_accept: false,
        sent_info: false,
        no_retry: false,
    };

    pub fn reset(&mut self) {
        *self = Self::EMPTY;
    }
}

/// What the caller must do after an unregistration, outside the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregister {
    /// fd was not registered; nothing to do.
    NotRegistered,
    /// Other fds still reference the endpoint.
    Retained { ep: EndpointId },
    /// Last reference dropped: tell the daemon, close the local fd if any.
    Destroyed {
        ep: EndpointId,
        localfd: Option<i32>,
    },
}

#[repr(C)]
pub struct Tables {
    pub fds: [FdRecord; TABLE_SIZE],
    pub eps: [EndpointRecord; TABLE_SIZE],
}

pub fn inbounds_fd(fd: i32) -> bool {
    fd >= 0 && (fd as usize) < TABLE_SIZE
}

pub fn valid_ep(ep: EndpointId) -> bool {
    (ep as usize) < TABLE_SIZE
}

impl Tables {
    pub const fn new() -> Self {
        Self {
            fds: [FdRecord::EMPTY; TABLE_SIZE],
            eps: [EndpointRecord::EMPTY; TABLE_SIZE],
        }
    }

    pub fn reset(&mut self) {
        for rec in self.fds.iter_mut() {
            *rec = FdRecord::EMPTY;
        }
        for info in self.eps.iter_mut() {
            *info = EndpointRecord::EMPTY;
        }
    }

    pub fn fd_rec(&self, fd: i32) -> Option<&FdRecord> {
        if inbounds_fd(fd) {
            Some(&self.fds[fd as usize])
        } else {
            None
        }
    }

    pub fn fd_rec_mut(&mut self, fd: i32) -> Option<&mut FdRecord> {
        if inbounds_fd(fd) {
            Some(&mut self.fds[fd as usize])
        } else {
            None
        }
    }

    pub fn ep_rec(&self, ep: EndpointId) -> &EndpointRecord {
        assert!(valid_ep(ep), "endpoint id {} out of range", ep);
        &self.eps[ep as usize]
    }

    pub fn ep_rec_mut(&mut self, ep: EndpointId) -> &mut EndpointRecord {
        assert!(valid_ep(ep), "endpoint id {} out of range", ep);
        &mut self.eps[ep as usize]
    }

    pub fn endpoint_of(&self, fd: i32) -> Option<EndpointId> {
        let rec = self.fd_rec(fd)?;
        if valid_ep(rec.ep) {
            Some(rec.ep)
        } else {
            None
        }
    }

    pub fn is_registered(&self, fd: i32) -> bool {
        self.endpoint_of(fd).is_some()
    }

    /// Local descriptor to route through, if `fd` is an application-visible
    /// registered socket whose endpoint is OPTIMIZED.
    pub fn optimized_local(&self, fd: i32) -> Option<i32> {
        let rec = self.fd_rec(fd)?;
        if rec.is_local {
            return None;
        }
        let ep = self.endpoint_of(fd)?;
        let info = self.ep_rec(ep);
        if info.state == EndpointState::Optimized {
            Some(info.localfd)
        } else {
            None
        }
    }

    /// Bind a freshly observed socket fd to a daemon-assigned endpoint id.
    pub fn register(&mut self, fd: i32, ep: EndpointId, is_accept: bool) {
        assert!(valid_ep(ep), "daemon assigned out-of-range endpoint {}", ep);
        let rec = self.fd_rec_mut(fd).expect("register: fd out of range");
        assert_eq!(
            rec.ep, ENDPOINT_INVALID,
            "fd {} already bound to an endpoint",
            fd
        );
        rec.ep = ep;

        let info = &mut self.eps[ep as usize];
        assert_eq!(info.ref_count, 0, "endpoint {} already referenced", ep);
        assert_eq!(info.state, EndpointState::Invalid);
        info.reset();
        info.ref_count = 1;
        info.is_accept = is_accept;
        info.state = EndpointState::Unopt;
    }

    /// Drop one fd reference. Clears the fd slot (including any epoll
    /// mirror) whether or not an endpoint was attached.
    pub fn unregister(&mut self, fd: i32) -> Unregister {
        let rec = match self.fd_rec_mut(fd) {
            Some(r) => r,
            None => return Unregister::NotRegistered,
        };
        // A closed epoll fd is no longer an epoll fd.
        rec.epoll = EpollSet::EMPTY;

        let ep = rec.ep;
        if !valid_ep(ep) {
            return Unregister::NotRegistered;
        }
        rec.ep = ENDPOINT_INVALID;
        rec.close_on_exec = false;

        let info = &mut self.eps[ep as usize];
        assert!(info.state != EndpointState::Invalid);
        assert!(info.ref_count > 0);
        info.ref_count -= 1;
        if info.ref_count > 0 {
            return Unregister::Retained { ep };
        }

        let localfd = if info.localfd != 0 {
            assert_eq!(info.state, EndpointState::Optimized);
            Some(info.localfd)
        } else {
            None
        };
        info.reset();

        if let Some(lfd) = localfd {
            let lrec = self.fd_rec_mut(lfd).expect("localfd out of range");
            assert!(lrec.is_local);
            assert_eq!(lrec.ep, ENDPOINT_INVALID);
            lrec.is_local = false;
        }

        Unregister::Destroyed { ep, localfd }
    }

    /// Point `dst` at the endpoint `src` references. `dst` must already be
    /// unregistered (close semantics of dup2 are the caller's problem).
    pub fn dup(&mut self, src: i32, dst: i32) {
        let ep = match self.endpoint_of(src) {
            Some(ep) => ep,
            None => return,
        };
        if !inbounds_fd(dst) {
            return;
        }
        {
            let info = self.ep_rec_mut(ep);
            assert!(info.ref_count > 0);
            assert!(info.state != EndpointState::Invalid);
            info.ref_count += 1;
        }
        let rec = &mut self.fds[dst as usize];
        assert_eq!(rec.ep, ENDPOINT_INVALID, "dup target {} still bound", dst);
        rec.ep = ep;
    }

    /// Claim a daemon-provided descriptor as the protected local side.
    pub fn claim_local(&mut self, localfd: i32) {
        let rec = self
            .fd_rec_mut(localfd)
            .expect("local descriptor out of table range");
        assert!(!rec.is_local, "local fd {} claimed twice", localfd);
        assert_eq!(rec.ep, ENDPOINT_INVALID);
        rec.is_local = true;
    }

    pub fn set_cloexec(&mut self, fd: i32, cloexec: bool) {
        if let Some(rec) = self.fd_rec_mut(fd) {
            rec.close_on_exec = cloexec;
        }
    }

    pub fn set_nonblocking(&mut self, fd: i32, non_blocking: bool) {
        if let Some(ep) = self.endpoint_of(fd) {
            self.ep_rec_mut(ep).non_blocking = non_blocking;
        }
    }

    pub fn set_connect_times(&mut self, fd: i32, start: Stamp, end: Stamp) {
        if let Some(ep) = self.endpoint_of(fd) {
            let info = self.ep_rec_mut(ep);
            assert!(info.connect_start.is_zero(), "connect start already set");
            assert!(info.connect_end.is_zero(), "connect end already set");
            info.connect_start = start;
            info.connect_end = end;
        }
    }

    /// All (fd, endpoint) pairs currently registered.
    pub fn registered_fds(&self) -> Vec<(i32, EndpointId)> {
        let mut out = Vec::new();
        for fd in 0..TABLE_SIZE as i32 {
            if let Some(ep) = self.endpoint_of(fd) {
                out.push((fd, ep));
            }
        }
        out
    }

    /// Structural invariants from the data model. Used by tests and by the
    /// post-exec restore path.
    pub fn check_invariants(&self) -> Result<(), String> {
        // ref_count equals the number of fds pointing at the endpoint.
        let mut refs = [0u16; TABLE_SIZE];
        for (fd, rec) in self.fds.iter().enumerate() {
            if valid_ep(rec.ep) {
                if rec.is_local {
                    return Err(format!("fd {} is both local and endpoint-bound", fd));
                }
                refs[rec.ep as usize] += 1;
            }
        }
        for (ep, info) in self.eps.iter().enumerate() {
            if info.state == EndpointState::Invalid {
                if info.ref_count != 0 {
                    return Err(format!("invalid endpoint {} has refs", ep));
                }
                continue;
            }
            if info.ref_count != refs[ep] {
                return Err(format!(
                    "endpoint {}: ref_count {} but {} fds point at it",
                    ep, info.ref_count, refs[ep]
                ));
            }
            match info.state {
                EndpointState::Optimized => {
                    if info.localfd == 0 {
                        return Err(format!("optimized endpoint {} has no localfd", ep));
                    }
                    let lrec = &self.fds[info.localfd as usize];
                    if !lrec.is_local || valid_ep(lrec.ep) {
                        return Err(format!(
                            "endpoint {}: localfd {} is not a clean local slot",
                            ep, info.localfd
                        ));
                    }
                }
                _ => {
                    if info.localfd != 0 {
                        return Err(format!(
                            "non-optimized endpoint {} carries localfd {}",
                            ep, info.localfd
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide table. Writes are serialized by the lock; nothing
/// holds it across a kernel call that can block on application data.
pub static TABLES: SpinLock<Tables> = SpinLock::new(Tables::new());

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Box<Tables> {
        // Boxed: the table is a few hundred KiB, too big for test stacks.
        Box::new(Tables::new())
    }

    #[test]
    fn register_then_unregister_restores_the_slot() {
        let mut t = fresh();
        t.register(5, 0, false);
        assert!(t.is_registered(5));
        assert_eq!(t.ep_rec(0).state, EndpointState::Unopt);
        assert_eq!(t.ep_rec(0).ref_count, 1);
        t.check_invariants().unwrap();

        let out = t.unregister(5);
        assert_eq!(
            out,
            Unregister::Destroyed {
                ep: 0,
                localfd: None
            }
        );
        assert!(!t.is_registered(5));
        assert_eq!(t.ep_rec(0).state, EndpointState::Invalid);
        t.check_invariants().unwrap();
    }

    #[test]
    fn dup_bumps_refs_and_close_of_dup_retains_endpoint() {
        let mut t = fresh();
        t.register(3, 1, false);
        t.dup(3, 9);
        assert_eq!(t.ep_rec(1).ref_count, 2);
        assert_eq!(t.endpoint_of(9), Some(1));
        t.check_invariants().unwrap();

        assert_eq!(t.unregister(9), Unregister::Retained { ep: 1 });
        assert_eq!(t.ep_rec(1).ref_count, 1);
        assert_eq!(t.ep_rec(1).state, EndpointState::Unopt);
        t.check_invariants().unwrap();
    }

    #[test]
    fn dup_of_unregistered_source_is_a_no_op() {
        let mut t = fresh();
        t.dup(3, 9);
        assert!(!t.is_registered(9));
    }

    #[test]
    fn last_close_of_optimized_endpoint_yields_localfd() {
        let mut t = fresh();
        t.register(4, 2, true);
        t.claim_local(77);
        {
            let info = t.ep_rec_mut(2);
            info.localfd = 77;
            info.state = EndpointState::Optimized;
        }
        t.check_invariants().unwrap();
        assert_eq!(t.optimized_local(4), Some(77));

        let out = t.unregister(4);
        assert_eq!(
            out,
            Unregister::Destroyed {
                ep: 2,
                localfd: Some(77)
            }
        );
        // Local slot released.
        assert!(!t.fd_rec(77).unwrap().is_local);
        t.check_invariants().unwrap();
    }

    #[test]
    fn local_fd_is_never_reported_as_optimized_socket() {
        let mut t = fresh();
        t.register(4, 2, false);
        t.claim_local(50);
        {
            let info = t.ep_rec_mut(2);
            info.localfd = 50;
            info.state = EndpointState::Optimized;
        }
        assert_eq!(t.optimized_local(50), None);
        assert_eq!(t.optimized_local(4), Some(50));
    }

    #[test]
    fn out_of_range_fd_is_pass_through() {
        let t = fresh();
        assert!(!t.is_registered(TABLE_SIZE as i32));
        assert!(!t.is_registered(-1));
        assert_eq!(t.optimized_local(1 << 20), None);
    }

    #[test]
    fn unregister_clears_epoll_mirror() {
        let mut t = fresh();
        let rec = t.fd_rec_mut(6).unwrap();
        rec.epoll.valid = true;
        rec.epoll.push(EpollWatch {
            fd: 3,
            events: libc::EPOLLIN as u32,
            data: 42,
            target: 3,
        });
        assert_eq!(t.unregister(6), Unregister::NotRegistered);
        assert!(!t.fd_rec(6).unwrap().epoll.valid);
        assert_eq!(t.fd_rec(6).unwrap().epoll.count, 0);
    }

    #[test]
    fn connect_times_are_recorded_once() {
        let mut t = fresh();
        t.register(8, 3, false);
        t.set_connect_times(8, Stamp { sec: 1, nsec: 2 }, Stamp { sec: 1, nsec: 9 });
        assert_eq!(t.ep_rec(3).connect_start, Stamp { sec: 1, nsec: 2 });
        assert_eq!(t.ep_rec(3).connect_end, Stamp { sec: 1, nsec: 9 });
    }

    #[test]
    fn epoll_set_push_find_remove() {
        let mut set = EpollSet::EMPTY;
        set.valid = true;
        for i in 0..MAX_EPOLL_WATCHES {
            assert!(set.push(EpollWatch {
                fd: i as i32,
                events: 0,
                data: i as u64,
                target: i as i32,
            }));
        }
        assert!(!set.push(EpollWatch::EMPTY), "capacity bound enforced");
        assert_eq!(set.find(3), Some(3));

        set.remove(0);
        assert_eq!(set.count as usize, MAX_EPOLL_WATCHES - 1);
        // Swap-removal moved the tail entry into slot 0.
        assert_eq!(set.find(MAX_EPOLL_WATCHES as i32 - 1), Some(0));
        assert_eq!(set.find(0), None);
    }

    #[test]
    fn registered_fds_enumerates_every_binding() {
        let mut t = fresh();
        t.register(3, 0, false);
        t.register(10, 1, true);
        t.dup(3, 20);
        let mut fds = t.registered_fds();
        fds.sort();
        assert_eq!(fds, vec![(3, 0), (10, 1), (20, 0)]);
    }

    #[test]
    fn invariant_checker_catches_ref_count_drift() {
        let mut t = fresh();
        t.register(3, 0, false);
        t.ep_rec_mut(0).ref_count = 2;
        assert!(t.check_invariants().is_err());
    }
}
