//! The I/O dispatcher.
//!
//! Every intercepted data call lands here once the fd is known to be a
//! registered socket. One generic routine covers the whole send/recv
//! family: the caller describes its buffers and hands over a closure that
//! issues the actual kernel call for a `(target fd, offset, length)`
//! window. The dispatcher decides the route (original vs local), splits
//! the transfer that would cross the threshold so the counter lands on it
//! exactly, fires the optimization engine on that edge, and continues the
//! remainder best-effort after a cutover.

use crate::stats::{self, Direction};
use crate::sync::SpinLock;
use crate::table::{EndpointRecord, EndpointState, Tables};
use libc::{c_int, ssize_t};
use slipstream_ipc::EndpointId;

/// The application's buffer(s) for one data call.
pub enum IoBufs<'a> {
    Flat { base: *mut u8, len: usize },
    Gather { iov: &'a [libc::iovec] },
}

impl<'a> IoBufs<'a> {
    /// Total request size. `None` when the iovec lengths overflow
    /// `SSIZE_MAX`; the caller forwards such requests to the real
    /// syscall so the kernel reports the error canonically.
    pub fn total(&self) -> Option<usize> {
        match self {
            IoBufs::Flat { len, .. } => Some(*len),
            IoBufs::Gather { iov } => {
                let mut sum = 0usize;
                for v in iov.iter() {
                    sum = sum.checked_add(v.iov_len)?;
                    if sum > isize::MAX as usize {
                        return None;
                    }
                }
                Some(sum)
            }
        }
    }

    /// Byte slices covering `[offset, offset + len)` of the request, in
    /// order.
    ///
    /// # Safety
    /// The described buffers must be live and cover the range.
    pub unsafe fn chunks(&self, offset: usize, len: usize) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        if len == 0 {
            return out;
        }
        match self {
            IoBufs::Flat { base, .. } => {
                out.push(std::slice::from_raw_parts(base.add(offset), len));
            }
            IoBufs::Gather { iov } => {
                let mut skip = offset;
                let mut want = len;
                for v in iov.iter() {
                    if want == 0 {
                        break;
                    }
                    let vlen = v.iov_len;
                    if skip >= vlen {
                        skip -= vlen;
                        continue;
                    }
                    let take = (vlen - skip).min(want);
                    out.push(std::slice::from_raw_parts(
                        (v.iov_base as *const u8).add(skip),
                        take,
                    ));
                    skip = 0;
                    want -= take;
                }
            }
        }
        out
    }

    /// Build an iovec array describing `[offset, offset + len)`, for
    /// issuing a partial vectored transfer.
    ///
    /// # Safety
    /// Same liveness requirements as [`IoBufs::chunks`].
    pub unsafe fn window_iovec(&self, offset: usize, len: usize) -> Vec<libc::iovec> {
        let mut out = Vec::new();
        if len == 0 {
            return out;
        }
        match self {
            IoBufs::Flat { base, .. } => out.push(libc::iovec {
                iov_base: base.add(offset) as *mut libc::c_void,
                iov_len: len,
            }),
            IoBufs::Gather { iov } => {
                let mut skip = offset;
                let mut want = len;
                for v in iov.iter() {
                    if want == 0 {
                        break;
                    }
                    let vlen = v.iov_len;
                    if skip >= vlen {
                        skip -= vlen;
                        continue;
                    }
                    let take = (vlen - skip).min(want);
                    out.push(libc::iovec {
                        iov_base: (v.iov_base as *mut u8).add(skip) as *mut libc::c_void,
                        iov_len: take,
                    });
                    skip = 0;
                    want -= take;
                }
            }
        }
        out
    }
}

pub struct DispatchEnv<'t> {
    pub tables: &'t SpinLock<Tables>,
    pub threshold: u64,
}

/// Issue a kernel transfer for a window of the request:
/// `(target_fd, offset, len, flags) -> ssize_t`.
pub type IssueFn<'c> = &'c mut dyn FnMut(c_int, usize, usize, c_int) -> ssize_t;

/// One data call on a registered socket.
///
/// `optimize` runs the pairing engine (injected for tests); `seed` fills
/// in the CRC address seed on first accounted traffic, under the table
/// lock.
///
/// # Safety
/// `bufs` must describe live buffers of at least `total` bytes and the
/// `issue` closure must transfer within the described window.
pub unsafe fn stream_io(
    env: &DispatchEnv<'_>,
    fd: c_int,
    ep: EndpointId,
    dir: Direction,
    flags: c_int,
    bufs: &IoBufs<'_>,
    total: usize,
    issue: IssueFn<'_>,
    optimize: &mut dyn FnMut(c_int, EndpointId),
    seed: &mut dyn FnMut(&mut EndpointRecord),
) -> ssize_t {
    let peek = dir == Direction::Recv && (flags & libc::MSG_PEEK) != 0;
    let nonblock_req = (flags & libc::MSG_DONTWAIT) != 0;

    let (state, localfd, bytes_dir, ep_nonblock) = {
        let t = env.tables.lock();
        let info = t.ep_rec(ep);
        let bytes = match dir {
            Direction::Send => info.bytes_sent,
            Direction::Recv => info.bytes_recv,
        };
        (info.state, info.localfd, bytes, info.non_blocking)
    };

    // Fast path: cutover done, everything rides the local descriptor.
    if state == EndpointState::Optimized {
        let ret = issue(localfd, 0, total, flags);
        if ret > 0 && !peek {
            let chunks = bufs.chunks(0, ret as usize);
            let mut t = env.tables.lock();
            let info = t.ep_rec_mut(ep);
            if !info.crc_seeded {
                seed(info);
            }
            stats::account(info, dir, env.threshold, ret as usize, chunks);
        }
        return ret;
    }

    // Peeks do not consume and never advance the counters.
    if peek {
        return issue(fd, 0, total, flags);
    }

    let rem = env.threshold.saturating_sub(bytes_dir);
    if rem > 0 && rem <= total as u64 {
        // This transfer would cross the threshold: issue the prefix that
        // lands the counter exactly on it.
        let rem = rem as usize;
        let ret = issue(fd, 0, rem, flags);
        if ret < 0 {
            return ret;
        }
        let hit = {
            let chunks = bufs.chunks(0, ret as usize);
            let mut t = env.tables.lock();
            let info = t.ep_rec_mut(ep);
            if !info.crc_seeded {
                seed(info);
            }
            stats::account(info, dir, env.threshold, ret as usize, chunks)
        };
        if hit {
            optimize(fd, ep);
        }

        // A blocking caller whose prefix completed in full should not be
        // starved by the cutover: try the remainder without blocking.
        if ret as usize == rem && total > rem && !ep_nonblock && !nonblock_req {
            let (state2, local2) = {
                let t = env.tables.lock();
                let info = t.ep_rec(ep);
                (info.state, info.localfd)
            };
            let target = if state2 == EndpointState::Optimized {
                local2
            } else {
                fd
            };
            let extra = issue(target, rem, total - rem, flags | libc::MSG_DONTWAIT);
            if extra > 0 {
                let chunks = bufs.chunks(rem, extra as usize);
                let mut t = env.tables.lock();
                let info = t.ep_rec_mut(ep);
                stats::account(info, dir, env.threshold, extra as usize, chunks);
                return ret + extra;
            }
        }
        return ret;
    }

    // Entirely below the threshold, or already past it unoptimized.
    let ret = issue(fd, 0, total, flags);
    if ret > 0 {
        let chunks = bufs.chunks(0, ret as usize);
        let mut t = env.tables.lock();
        let info = t.ep_rec_mut(ep);
        if !info.crc_seeded {
            seed(info);
        }
        let hit = stats::account(info, dir, env.threshold, ret as usize, chunks);
        drop(t);
        if hit {
            optimize(fd, ep);
        }
    }
    ret
}
