//! State transfer across exec.
//!
//! exec wipes the address space but keeps descriptors without the
//! close-on-exec bit. The table is plain data, so the whole thing is
//! copied bytewise into a named shared-memory segment parked on the
//! reserved shm fd (cloexec cleared); the successor image finds the fd,
//! copies the table back, and unlinks the segment.

use crate::reserved::{self, SHM_FD};
use crate::table::{Tables, TABLES};
use crate::{reals, slip_fatal, slip_log, slip_warn};
use std::ffi::CString;
use std::mem;
use std::ptr;

fn shm_name() -> CString {
    let pid = unsafe { libc::getpid() };
    CString::new(format!("/ipcd.{}", pid)).expect("no NUL in shm name")
}

/// Serialize the table into the segment. Called immediately before exec.
pub unsafe fn state_save() {
    let name = shm_name();
    let fd = libc::shm_open(
        name.as_ptr(),
        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
        0o600,
    );
    if fd == -1 {
        slip_warn!("shm_open for exec state failed (errno {})", *libc::__errno_location());
        return;
    }
    // Park on the reserved fd with close-on-exec CLEAR: the whole point
    // is surviving the exec.
    if !reserved::rename_fd(fd, SHM_FD, false) {
        slip_warn!("cannot claim reserved shm fd {}", SHM_FD);
        reals::close(fd);
        libc::shm_unlink(name.as_ptr());
        return;
    }

    let size = mem::size_of::<Tables>();
    if libc::ftruncate(SHM_FD, size as libc::off_t) == -1 {
        slip_warn!("ftruncate of exec state segment failed");
        reals::close(SHM_FD);
        libc::shm_unlink(name.as_ptr());
        return;
    }

    let map = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        SHM_FD,
        0,
    );
    if map == libc::MAP_FAILED {
        slip_warn!("mmap of exec state segment failed");
        reals::close(SHM_FD);
        libc::shm_unlink(name.as_ptr());
        return;
    }

    {
        let t = TABLES.lock();
        ptr::copy_nonoverlapping(&*t as *const Tables as *const u8, map as *mut u8, size);
    }
    libc::munmap(map, size);
    slip_log!("state saved for exec ({} bytes)", size);
}

/// Restore the table from an inherited segment, if one exists. Returns
/// true when state was restored.
pub unsafe fn state_restore() -> bool {
    if !reserved::fd_is_open(SHM_FD) {
        return false;
    }
    slip_log!("inherited state fd, starting restoration");

    let size = mem::size_of::<Tables>();
    let map = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ,
        libc::MAP_SHARED,
        SHM_FD,
        0,
    );
    if map == libc::MAP_FAILED {
        slip_warn!("mmap of inherited state segment failed, starting clean");
        reals::close(SHM_FD);
        return false;
    }

    {
        let mut t = TABLES.lock();
        ptr::copy_nonoverlapping(map as *const u8, &mut *t as *mut Tables as *mut u8, size);
    }
    libc::munmap(map, size);

    let name = shm_name();
    reals::close(SHM_FD);
    libc::shm_unlink(name.as_ptr());

    if let Err(e) = TABLES.lock().check_invariants() {
        slip_fatal!("restored state violates invariants: {}", e);
    }
    slip_log!("state restored after exec");
    true
}

/// exec returned (it failed): the successor image never ran, so drop the
/// segment and keep going with the in-memory table.
pub unsafe fn state_destroy() {
    if reserved::fd_is_open(SHM_FD) {
        reals::close(SHM_FD);
    }
    libc::shm_unlink(shm_name().as_ptr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{EndpointState, EpollWatch};

    /// The exec transfer is a bytewise copy; restoring an unchanged image
    /// must reproduce the table exactly.
    #[test]
    fn pod_image_roundtrip_is_lossless() {
        let mut src = Box::new(Tables::new());
        src.register(5, 0, false);
        src.register(9, 1, true);
        src.dup(5, 12);
        src.claim_local(40);
        {
            let info = src.ep_rec_mut(0);
            info.localfd = 40;
            info.state = EndpointState::Optimized;
            info.bytes_sent = 123456;
            info.bytes_recv = 7;
            info.crc_sent = 0xdead_beef;
            info.crc_seeded = true;
        }
        {
            let rec = src.fd_rec_mut(30).unwrap();
            rec.epoll.valid = true;
            rec.epoll.push(EpollWatch {
                fd: 5,
                events: libc::EPOLLIN as u32,
                data: 99,
                target: 40,
            });
        }
        src.check_invariants().unwrap();

        let size = mem::size_of::<Tables>();
        let mut image = vec![0u8; size];
        unsafe {
            ptr::copy_nonoverlapping(
                &*src as *const Tables as *const u8,
                image.as_mut_ptr(),
                size,
            );
        }

        let mut dst = Box::new(Tables::new());
        unsafe {
            ptr::copy_nonoverlapping(
                image.as_ptr(),
                &mut *dst as *mut Tables as *mut u8,
                size,
            );
        }

        dst.check_invariants().unwrap();
        assert_eq!(dst.endpoint_of(5), Some(0));
        assert_eq!(dst.endpoint_of(12), Some(0));
        assert_eq!(dst.endpoint_of(9), Some(1));
        assert_eq!(dst.ep_rec(0).ref_count, 2);
        assert_eq!(dst.ep_rec(0).state, EndpointState::Optimized);
        assert_eq!(dst.ep_rec(0).localfd, 40);
        assert_eq!(dst.ep_rec(0).bytes_sent, 123456);
        assert_eq!(dst.ep_rec(0).crc_sent, 0xdead_beef);
        assert!(dst.fd_rec(40).unwrap().is_local);
        let set = &dst.fd_rec(30).unwrap().epoll;
        assert!(set.valid);
        assert_eq!(set.entries()[0].data, 99);

        // Idempotence: a second restore of the same image changes nothing.
        let mut again = Box::new(Tables::new());
        unsafe {
            ptr::copy_nonoverlapping(
                image.as_ptr(),
                &mut *again as *mut Tables as *mut u8,
                size,
            );
        }
        assert_eq!(again.registered_fds(), dst.registered_fds());
        assert_eq!(again.ep_rec(0).crc_sent, dst.ep_rec(0).crc_sent);
    }
}
