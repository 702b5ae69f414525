//! The per-endpoint optimization engine.
//!
//! Runs synchronously inside the I/O call that lands a direction counter
//! exactly on the threshold: query the daemon for a CRC-matched peer with
//! a bounded retry schedule, then localize, fetch the local descriptor,
//! mirror the options the peer side can observe, and publish the cutover.
//!
//! The daemon is reached through the `Matchmaker` seam so the whole state
//! machine runs against a scripted double in tests.

use crate::sync::SpinLock;
use crate::table::{EndpointState, Tables};
use crate::{reals, slip_fatal, slip_log};
use libc::c_int;
use slipstream_ipc::{ClientError, EndpointId};
use std::ptr;

pub trait Matchmaker {
    fn find_pair(
        &mut self,
        ep: EndpointId,
        crc_sent: u32,
        crc_recv: u32,
        last: bool,
    ) -> Result<Option<EndpointId>, ClientError>;
    fn localize(&mut self, local: EndpointId, remote: EndpointId) -> Result<(), ClientError>;
    fn local_descriptor(&mut self, ep: EndpointId) -> Result<c_int, ClientError>;
}

/// Bounded pairing schedule: a few immediate retries (the peer is usually
/// microseconds behind), then short sleeps, ~100 ms wall clock in total.
#[derive(Debug, Clone, Copy)]
pub struct RetryPlan {
    pub max_attempts: u32,
    pub immediate: u32,
    pub sleep_ms: u64,
}

impl RetryPlan {
    pub fn from_config() -> Self {
        let cfg = slipstream_config::config();
        Self {
            max_attempts: cfg.optimize.max_sync_attempts.max(1),
            immediate: cfg.optimize.immediate_attempts,
            sleep_ms: cfg.optimize.retry_sleep_ms,
        }
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt + 1 == self.max_attempts
    }

    /// How to wait after a failed attempt: `None` = yield the CPU only.
    pub fn pause_after(&self, attempt: u32) -> Option<u64> {
        if attempt < self.immediate {
            None
        } else {
            Some(self.sleep_ms)
        }
    }
}

/// Ask the daemon for our peer until it answers or the schedule runs dry.
pub fn pair_endpoint(
    ep: EndpointId,
    crc_sent: u32,
    crc_recv: u32,
    plan: &RetryPlan,
    mm: &mut dyn Matchmaker,
    pause: &mut dyn FnMut(Option<u64>),
) -> Result<Option<EndpointId>, ClientError> {
    for attempt in 0..plan.max_attempts {
        let last = plan.is_last(attempt);
        if let Some(remote) = mm.find_pair(ep, crc_sent, crc_recv, last)? {
            return Ok(Some(remote));
        }
        if !last {
            pause(plan.pause_after(attempt));
        }
    }
    Ok(None)
}

/// Full threshold-to-cutover sequence for one endpoint.
///
/// `mirror(origfd, localfd, non_blocking)` copies peer-visible options
/// onto the local descriptor before the cutover is published. Returns
/// true when the endpoint reached OPTIMIZED.
pub fn drive(
    tables: &SpinLock<Tables>,
    fd: c_int,
    ep: EndpointId,
    plan: &RetryPlan,
    mm: &mut dyn Matchmaker,
    pause: &mut dyn FnMut(Option<u64>),
    mirror: &mut dyn FnMut(c_int, c_int, bool),
) -> bool {
    let (crc_sent, crc_recv, non_blocking) = {
        let mut t = tables.lock();
        let info = t.ep_rec_mut(ep);
        if info.state != EndpointState::Unopt || info.no_retry {
            return false;
        }
        info.state = EndpointState::IdExchange;
        (info.crc_sent, info.crc_recv, info.non_blocking)
    };

    let remote = match pair_endpoint(ep, crc_sent, crc_recv, plan, mm, pause) {
        Ok(r) => r,
        Err(e) => slip_fatal!("pairing query for endpoint {} failed: {}", ep, e),
    };

    let remote = match remote {
        Some(r) => r,
        None => {
            let mut t = tables.lock();
            let info = t.ep_rec_mut(ep);
            info.state = EndpointState::Unopt;
            info.no_retry = true;
            slip_log!(
                "no pairing for endpoint {} within the retry window, staying unoptimized",
                ep
            );
            return false;
        }
    };

    slip_log!("paired endpoint {} with remote {}", ep, remote);

    // From here on a failure is an invariant violation: the daemon told us
    // the pair exists.
    if let Err(e) = mm.localize(ep, remote) {
        slip_fatal!("LOCALIZE {} {} failed: {}", ep, remote, e);
    }
    let localfd = match mm.local_descriptor(ep) {
        Ok(fd) => fd,
        Err(e) => slip_fatal!("GETLOCALFD {} failed: {}", ep, e),
    };

    mirror(fd, localfd, non_blocking);

    {
        let mut t = tables.lock();
        t.claim_local(localfd);
        let info = t.ep_rec_mut(ep);
        info.localfd = localfd;
        info.state = EndpointState::Optimized;
    }
    slip_log!(
        "endpoint {} optimized: fd={} localfd={} remote={}",
        ep,
        fd,
        localfd,
        remote
    );
    true
}

/// `Matchmaker` over the process-wide daemon connection; the channel lock
/// is taken per command so other threads interleave between retries.
pub struct GlobalMatchmaker;

impl Matchmaker for GlobalMatchmaker {
    fn find_pair(
        &mut self,
        ep: EndpointId,
        crc_sent: u32,
        crc_recv: u32,
        last: bool,
    ) -> Result<Option<EndpointId>, ClientError> {
        crate::daemon::DAEMON.lock().find_pair(ep, crc_sent, crc_recv, last)
    }

    fn localize(&mut self, local: EndpointId, remote: EndpointId) -> Result<(), ClientError> {
        crate::daemon::DAEMON.lock().localize(local, remote)
    }

    fn local_descriptor(&mut self, ep: EndpointId) -> Result<c_int, ClientError> {
        crate::daemon::DAEMON.lock().get_local_fd(ep)
    }
}

fn real_pause(how: Option<u64>) {
    match how {
        None => unsafe {
            libc::sched_yield();
        },
        Some(ms) => {
            let ts = libc::timespec {
                tv_sec: (ms / 1000) as libc::time_t,
                tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
            };
            unsafe { libc::nanosleep(&ts, ptr::null_mut()) };
        }
    }
}

unsafe fn copy_bufsize(src: c_int, dst: c_int, buftype: c_int) {
    let mut bufsize: c_int = 0;
    let mut sz = std::mem::size_of::<c_int>() as libc::socklen_t;
    let ret = reals::getsockopt(
        src,
        libc::SOL_SOCKET,
        buftype,
        &mut bufsize as *mut c_int as *mut libc::c_void,
        &mut sz,
    );
    if ret != 0 {
        slip_fatal!("getsockopt({}, {}) failed during cutover", src, buftype);
    }
    // The kernel reports the doubled value; setting it back verbatim would
    // double it again.
    bufsize /= 2;
    let ret = reals::setsockopt(
        dst,
        libc::SOL_SOCKET,
        buftype,
        &bufsize as *const c_int as *const libc::c_void,
        sz,
    );
    if ret != 0 {
        slip_fatal!("setsockopt({}, {}) failed during cutover", dst, buftype);
    }
}

/// Copy peer-visible options from the original socket onto the local one.
fn real_mirror(orig: c_int, local: c_int, non_blocking: bool) {
    unsafe {
        copy_bufsize(orig, local, libc::SO_RCVBUF);
        copy_bufsize(orig, local, libc::SO_SNDBUF);
        if non_blocking {
            let flags = reals::fcntl(local, libc::F_GETFL, 0);
            if flags >= 0 {
                reals::fcntl(local, libc::F_SETFL, (flags | libc::O_NONBLOCK) as usize);
            }
        }
    }
}

/// Entry point for the I/O dispatcher: run the engine against the live
/// table and daemon.
pub fn optimize_now(fd: c_int, ep: EndpointId) {
    let plan = RetryPlan::from_config();
    drive(
        &crate::table::TABLES,
        fd,
        ep,
        &plan,
        &mut GlobalMatchmaker,
        &mut real_pause,
        &mut real_mirror,
    );
}
