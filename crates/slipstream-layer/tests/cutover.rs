//! Cross-module scenarios: the I/O dispatcher driving the optimization
//! engine against the descriptor table, with a scripted daemon and a
//! scripted kernel standing in for the real ones.

use libc::{c_int, ssize_t};
use slipstream_ipc::{ClientError, EndpointId};
use slipstream_layer::dispatch::{stream_io, DispatchEnv, IoBufs};
use slipstream_layer::engine::{drive, Matchmaker, RetryPlan};
use slipstream_layer::mux;
use slipstream_layer::stats::Direction;
use slipstream_layer::sync::SpinLock;
use slipstream_layer::table::{EndpointState, Tables};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

const THRESH: u64 = 512;

const PLAN: RetryPlan = RetryPlan {
    max_attempts: 6,
    immediate: 3,
    sleep_ms: 5,
};

/// Daemon double: a queue of pairing answers plus a descriptor to hand
/// out for `GETLOCALFD`.
struct Scripted {
    answers: VecDeque<Option<EndpointId>>,
    attempts: Vec<bool>,
    handed_fd: c_int,
}

impl Scripted {
    fn new(answers: Vec<Option<EndpointId>>, handed_fd: c_int) -> Self {
        Self {
            answers: answers.into(),
            attempts: Vec::new(),
            handed_fd,
        }
    }
}

impl Matchmaker for Scripted {
    fn find_pair(
        &mut self,
        _ep: EndpointId,
        _crc_sent: u32,
        _crc_recv: u32,
        last: bool,
    ) -> Result<Option<EndpointId>, ClientError> {
        self.attempts.push(last);
        Ok(self.answers.pop_front().unwrap_or(None))
    }

    fn localize(&mut self, _local: EndpointId, _remote: EndpointId) -> Result<(), ClientError> {
        Ok(())
    }

    fn local_descriptor(&mut self, _ep: EndpointId) -> Result<c_int, ClientError> {
        Ok(self.handed_fd)
    }
}

fn fresh_tables(fd: c_int, ep: EndpointId) -> Box<SpinLock<Tables>> {
    let t = Box::new(SpinLock::new(Tables::new()));
    t.lock().register(fd, ep, false);
    t
}

/// Dispatcher and engine together: a send crossing the threshold is
/// split so that exactly the threshold rides the original fd, the
/// engine pairs and cuts over, and the remainder plus all later
/// traffic rides the local descriptor.
#[test]
fn send_crossing_threshold_cuts_over_and_moves_traffic_local() {
    let tables = fresh_tables(5, 0);

    let per_fd = RefCell::new(HashMap::<c_int, u64>::new());
    let mut issue = |target: c_int, _off: usize, len: usize, _fl: c_int| {
        *per_fd.borrow_mut().entry(target).or_insert(0) += len as u64;
        len as ssize_t
    };

    let mut mm = Scripted::new(vec![None, Some(7)], 40);
    let t2 = &tables;
    let mut optimize = |fd: c_int, ep: EndpointId| {
        drive(t2, fd, ep, &PLAN, &mut mm, &mut |_| {}, &mut |_, _, _| {});
    };

    let env = DispatchEnv {
        tables: &tables,
        threshold: THRESH,
    };
    let mut buf = vec![1u8; THRESH as usize + 100];
    let bufs = IoBufs::Flat {
        base: buf.as_mut_ptr(),
        len: buf.len(),
    };
    let ret = unsafe {
        stream_io(
            &env,
            5,
            0,
            Direction::Send,
            0,
            &bufs,
            buf.len(),
            &mut issue,
            &mut optimize,
            &mut |info| info.crc_seeded = true,
        )
    };
    assert_eq!(ret as usize, buf.len());

    // Exactly the threshold went over the kernel path, the rest local.
    assert_eq!(per_fd.borrow()[&5], THRESH);
    assert_eq!(per_fd.borrow()[&40], 100);

    // Follow-up traffic stays on the local descriptor.
    let mut small = vec![2u8; 64];
    let bufs2 = IoBufs::Flat {
        base: small.as_mut_ptr(),
        len: small.len(),
    };
    let ret2 = unsafe {
        stream_io(
            &env,
            5,
            0,
            Direction::Send,
            0,
            &bufs2,
            small.len(),
            &mut issue,
            &mut |_, _| panic!("no second optimization attempt"),
            &mut |_| {},
        )
    };
    assert_eq!(ret2, 64);
    assert_eq!(per_fd.borrow()[&5], THRESH);
    assert_eq!(per_fd.borrow()[&40], 164);

    let t = tables.lock();
    assert_eq!(t.ep_rec(0).state, EndpointState::Optimized);
    assert_eq!(t.ep_rec(0).localfd, 40);
    assert_eq!(t.ep_rec(0).bytes_sent, THRESH + 164);
    t.check_invariants().unwrap();
}

/// When the daemon never answers, the split still lands the counter on
/// the threshold, the remainder continues on the original fd, and the
/// endpoint is never queried again.
#[test]
fn abandoned_pairing_keeps_kernel_path_and_never_retries() {
    let tables = fresh_tables(5, 0);

    let per_fd = RefCell::new(HashMap::<c_int, u64>::new());
    let mut issue = |target: c_int, _off: usize, len: usize, _fl: c_int| {
        *per_fd.borrow_mut().entry(target).or_insert(0) += len as u64;
        len as ssize_t
    };

    let mut mm = Scripted::new(vec![None; 6], 40);
    let t2 = &tables;
    let mut optimize = |fd: c_int, ep: EndpointId| {
        assert!(!drive(t2, fd, ep, &PLAN, &mut mm, &mut |_| {}, &mut |_, _, _| {
            panic!("must not mirror without a pair")
        }));
    };

    let env = DispatchEnv {
        tables: &tables,
        threshold: THRESH,
    };
    let mut buf = vec![3u8; THRESH as usize + 100];
    let bufs = IoBufs::Flat {
        base: buf.as_mut_ptr(),
        len: buf.len(),
    };
    let ret = unsafe {
        stream_io(
            &env,
            5,
            0,
            Direction::Send,
            0,
            &bufs,
            buf.len(),
            &mut issue,
            &mut optimize,
            &mut |info| info.crc_seeded = true,
        )
    };
    assert_eq!(ret as usize, buf.len());
    assert_eq!(mm.attempts.len(), PLAN.max_attempts as usize);
    // Everything stayed on the kernel path.
    assert_eq!(per_fd.borrow()[&5], THRESH + 100);
    assert!(!per_fd.borrow().contains_key(&40));

    {
        let t = tables.lock();
        assert_eq!(t.ep_rec(0).state, EndpointState::Unopt);
        assert!(t.ep_rec(0).no_retry);
        t.check_invariants().unwrap();
    }

    // Later traffic never queries the daemon again.
    let mut more = vec![4u8; 64];
    let bufs2 = IoBufs::Flat {
        base: more.as_mut_ptr(),
        len: more.len(),
    };
    let ret2 = unsafe {
        stream_io(
            &env,
            5,
            0,
            Direction::Send,
            0,
            &bufs2,
            more.len(),
            &mut issue,
            &mut |_, _| panic!("abandoned endpoint optimized again"),
            &mut |_| {},
        )
    };
    assert_eq!(ret2, 64);
    assert_eq!(per_fd.borrow()[&5], THRESH + 164);
}

/// Engine cutover plus epoll mirror: a watch registered before the
/// cutover migrates to the local descriptor on the next wait, keeping
/// the application's fd and cookie intact.
#[test]
fn epoll_watch_follows_engine_cutover() {
    let tables = fresh_tables(5, 0);
    mux::note_epoll_instance(&tables, 9);

    let ops = RefCell::new(Vec::<(c_int, c_int, c_int)>::new());
    let mut kernel = |epfd: c_int, op: c_int, fd: c_int, _ev: *mut libc::epoll_event| {
        ops.borrow_mut().push((epfd, op, fd));
        0
    };

    let mut ev = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: 0xfeed,
    };
    let ret =
        unsafe { mux::epoll_ctl_dispatch(&tables, 9, libc::EPOLL_CTL_ADD, 5, &mut ev, &mut kernel) };
    assert_eq!(ret, 0);
    assert_eq!(ops.borrow()[0], (9, libc::EPOLL_CTL_ADD, 5));

    // Threshold reached elsewhere; the engine pairs and cuts over.
    let mut mm = Scripted::new(vec![Some(7)], 40);
    assert!(drive(
        &tables,
        5,
        0,
        &PLAN,
        &mut mm,
        &mut |_| {},
        &mut |_, _, _| {},
    ));

    ops.borrow_mut().clear();
    unsafe { mux::migrate_watches(&tables, 9, &mut kernel) };
    assert_eq!(
        *ops.borrow(),
        vec![(9, libc::EPOLL_CTL_DEL, 5), (9, libc::EPOLL_CTL_ADD, 40)]
    );

    let t = tables.lock();
    let w = t.fd_rec(9).unwrap().epoll.entries()[0];
    assert_eq!(w.fd, 5, "application view keeps the original fd");
    assert_eq!(w.target, 40);
    assert_eq!(w.data, 0xfeed);
    t.check_invariants().unwrap();
}
