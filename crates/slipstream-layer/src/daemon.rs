//! Client side of the pairing-daemon control channel.
//!
//! One long-lived UNIX-stream connection per process, parked on the
//! reserved fd so the application never sees it. The connection lock makes
//! each command/response pair atomic. After fork the client notices the
//! pid change and redials before the first command in the child.
//!
//! All I/O in this module goes through `reals::`; the control channel
//! must work from inside intercepted calls without re-entering the layer.

use crate::reals;
use crate::reserved::{self, DAEMON_FD};
use crate::sync::SpinLock;
use crate::{slip_fatal, slip_log, slip_warn};
use libc::{c_int, c_void};
use slipstream_ipc::{parse_response, ClientError, EndpointId, EndpointInfo, Request, Response};
use std::ffi::{CStr, CString};
use std::mem;
use std::ptr;

pub static DAEMON: SpinLock<DaemonClient> = SpinLock::new(DaemonClient::unconnected());

pub struct DaemonClient {
    fd: c_int,
    /// Pid the connection belongs to; 0 = never connected.
    pid: i32,
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn sleep_ms(ms: u64) {
    let ts = libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
    };
    unsafe { libc::nanosleep(&ts, ptr::null_mut()) };
}

unsafe fn dial_once(path: &CStr) -> Result<c_int, i32> {
    let fd = reals::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if fd < 0 {
        return Err(errno());
    }
    let mut addr: libc::sockaddr_un = mem::zeroed();
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.to_bytes();
    if bytes.len() >= addr.sun_path.len() {
        reals::close(fd);
        return Err(libc::ENAMETOOLONG);
    }
    ptr::copy_nonoverlapping(
        bytes.as_ptr(),
        addr.sun_path.as_mut_ptr() as *mut u8,
        bytes.len(),
    );
    let len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    if reals::connect(fd, &addr as *const _ as *const libc::sockaddr, len) < 0 {
        let e = errno();
        reals::close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Fork+exec the daemon binary. The child execs immediately; everything
/// heap-allocated happens before the fork.
unsafe fn spawn_daemon(bin: &CStr) {
    match reals::fork() {
        -1 => slip_warn!("fork for daemon spawn failed (errno {})", errno()),
        0 => {
            let argv = [bin.as_ptr(), ptr::null()];
            reals::execv(bin.as_ptr(), argv.as_ptr());
            libc::_exit(127);
        }
        pid => slip_log!("spawned pairing daemon {:?}, pid={}", bin, pid),
    }
}

impl DaemonClient {
    pub const fn unconnected() -> Self {
        Self { fd: -1, pid: 0 }
    }

    /// Connect (spawning the daemon if absent). Fatal on final failure:
    /// the layer is load-bearing once enabled.
    pub fn connect(&mut self) {
        let (socket_path, binary_path, attempts, backoff_ms) = {
            let cfg = slipstream_config::config();
            (
                cfg.daemon.socket_path.clone(),
                cfg.daemon.binary_path.clone(),
                cfg.daemon.spawn_attempts.max(1),
                cfg.daemon.spawn_backoff_ms,
            )
        };
        let path = CString::new(socket_path.as_os_str().to_string_lossy().as_bytes())
            .unwrap_or_else(|_| slip_fatal!("daemon socket path contains NUL"));
        let bin = CString::new(binary_path.as_os_str().to_string_lossy().as_bytes())
            .unwrap_or_else(|_| slip_fatal!("daemon binary path contains NUL"));

        for attempt in 0..attempts {
            match unsafe { dial_once(&path) } {
                Ok(fd) => {
                    if !unsafe { reserved::rename_fd(fd, DAEMON_FD, true) } {
                        slip_fatal!("unable to claim reserved daemon fd {}", DAEMON_FD);
                    }
                    self.fd = DAEMON_FD;
                    self.pid = unsafe { libc::getpid() };
                    slip_log!("connected to pairing daemon, fd={}", self.fd);
                    return;
                }
                Err(e) if e == libc::ENOENT || e == libc::ECONNREFUSED => {
                    if attempt == 0 {
                        unsafe { spawn_daemon(&bin) };
                    }
                    sleep_ms(backoff_ms * (attempt as u64 + 1));
                }
                Err(e) => {
                    slip_fatal!("cannot reach pairing daemon at {:?}: errno {}", path, e);
                }
            }
        }
        slip_fatal!("pairing daemon unreachable after {} attempts", attempts);
    }

    /// Redial transparently when this is the first command after a fork.
    fn ensure_connected(&mut self) {
        let pid = unsafe { libc::getpid() };
        if self.fd >= 0 && self.pid == pid {
            return;
        }
        if self.fd >= 0 {
            slip_log!("pid changed ({} -> {}), redialing daemon", self.pid, pid);
            unsafe { reals::close(self.fd) };
            self.fd = -1;
        }
        self.connect();
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let mut written = 0;
        while written < data.len() {
            let n = unsafe {
                reals::write(
                    self.fd,
                    data[written..].as_ptr() as *const c_void,
                    data.len() - written,
                )
            };
            if n <= 0 {
                return Err(ClientError::Io(errno()));
            }
            written += n as usize;
        }
        Ok(())
    }

    /// Read one response line. The protocol is strict request/response, so
    /// byte-at-a-time reads are fine here; the channel carries a handful
    /// of short lines per connection lifetime.
    fn read_line(&mut self) -> Result<String, ClientError> {
        let mut line = Vec::with_capacity(64);
        loop {
            let mut b = 0u8;
            let n = unsafe { reals::read(self.fd, &mut b as *mut u8 as *mut c_void, 1) };
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            if n < 0 {
                return Err(ClientError::Io(errno()));
            }
            if b == b'\n' {
                break;
            }
            line.push(b);
            if line.len() > 512 {
                return Err(ClientError::Io(libc::EPROTO));
            }
        }
        String::from_utf8(line).map_err(|_| ClientError::Io(libc::EPROTO))
    }

    fn transact(&mut self, req: &Request) -> Result<Response, ClientError> {
        self.ensure_connected();
        self.write_all(req.encode().as_bytes())?;
        let line = self.read_line()?;
        Ok(parse_response(&line)?)
    }

    fn expect_ok(&mut self, req: &Request) -> Result<(), ClientError> {
        match self.transact(req)? {
            Response::Ok => Ok(()),
            Response::NotFound => Err(ClientError::Refused {
                status: 404,
                detail: String::new(),
            }),
            Response::Failed { status, detail } => Err(ClientError::Refused { status, detail }),
            other => Err(ClientError::Refused {
                status: 200,
                detail: format!("unexpected payload {:?}", other),
            }),
        }
    }

    pub fn register(&mut self, fd: c_int) -> Result<EndpointId, ClientError> {
        let pid = unsafe { libc::getpid() };
        match self.transact(&Request::Register { pid, fd })? {
            Response::Id(ep) => Ok(ep),
            Response::Failed { status, detail } => Err(ClientError::Refused { status, detail }),
            other => Err(ClientError::Refused {
                status: 200,
                detail: format!("unexpected payload {:?}", other),
            }),
        }
    }

    pub fn reregister(&mut self, ep: EndpointId, fd: c_int) -> Result<(), ClientError> {
        let pid = unsafe { libc::getpid() };
        self.expect_ok(&Request::Reregister { ep, pid, fd })
    }

    pub fn unregister(&mut self, ep: EndpointId) -> Result<(), ClientError> {
        self.expect_ok(&Request::Unregister { ep })
    }

    pub fn localize(&mut self, local: EndpointId, remote: EndpointId) -> Result<(), ClientError> {
        self.expect_ok(&Request::Localize { local, remote })
    }

    /// CRC-validated pairing probe. `Ok(None)` means no match yet.
    pub fn find_pair(
        &mut self,
        ep: EndpointId,
        crc_sent: u32,
        crc_recv: u32,
        last: bool,
    ) -> Result<Option<EndpointId>, ClientError> {
        let req = Request::ThreshCrcKludge {
            ep,
            crc_sent,
            crc_recv,
            last,
        };
        match self.transact(&req)? {
            Response::Pair(remote) => Ok(Some(remote)),
            Response::NotFound => Ok(None),
            Response::Failed { status, detail } => Err(ClientError::Refused { status, detail }),
            other => Err(ClientError::Refused {
                status: 200,
                detail: format!("unexpected payload {:?}", other),
            }),
        }
    }

    pub fn endpoint_info(&mut self, ep: EndpointId, info: EndpointInfo) -> Result<(), ClientError> {
        self.expect_ok(&Request::EndpointInfo { ep, info })
    }

    pub fn remove_all(&mut self) -> Result<(), ClientError> {
        let pid = unsafe { libc::getpid() };
        match self.transact(&Request::RemoveAll { pid })? {
            Response::Removed(_) => Ok(()),
            Response::Failed { status, detail } => Err(ClientError::Refused { status, detail }),
            other => Err(ClientError::Refused {
                status: 200,
                detail: format!("unexpected payload {:?}", other),
            }),
        }
    }

    /// `GETLOCALFD`: the status line is preceded by one descriptor
    /// delivered via SCM_RIGHTS ancillary data.
    pub fn get_local_fd(&mut self, ep: EndpointId) -> Result<c_int, ClientError> {
        self.ensure_connected();
        self.write_all(Request::GetLocalFd { ep }.encode().as_bytes())?;

        let fd = unsafe { self.recv_fd()? };

        match parse_response(&self.read_line()?)? {
            Response::Ok => Ok(fd),
            Response::Failed { status, detail } => {
                unsafe { reals::close(fd) };
                Err(ClientError::Refused { status, detail })
            }
            other => {
                unsafe { reals::close(fd) };
                Err(ClientError::Refused {
                    status: 200,
                    detail: format!("unexpected payload {:?}", other),
                })
            }
        }
    }

    unsafe fn recv_fd(&mut self) -> Result<c_int, ClientError> {
        let mut payload = [0u8; 64];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut c_void,
            iov_len: payload.len(),
        };

        // cmsghdr-aligned control buffer.
        #[repr(align(8))]
        struct CmsgBuf([u8; 64]);
        let mut cbuf = CmsgBuf([0u8; 64]);

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.0.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cbuf.0.len();

        let n = reals::recvmsg(self.fd, &mut msg, 0);
        if n == 0 {
            return Err(ClientError::Disconnected);
        }
        if n < 0 {
            return Err(ClientError::Io(errno()));
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(ClientError::MissingDescriptor);
        }
        let mut fd: c_int = -1;
        ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            &mut fd as *mut c_int as *mut u8,
            mem::size_of::<c_int>(),
        );
        if fd < 0 {
            return Err(ClientError::MissingDescriptor);
        }
        Ok(fd)
    }
}

impl crate::engine::Matchmaker for DaemonClient {
    fn find_pair(
        &mut self,
        ep: EndpointId,
        crc_sent: u32,
        crc_recv: u32,
        last: bool,
    ) -> Result<Option<EndpointId>, ClientError> {
        DaemonClient::find_pair(self, ep, crc_sent, crc_recv, last)
    }

    fn localize(&mut self, local: EndpointId, remote: EndpointId) -> Result<(), ClientError> {
        DaemonClient::localize(self, local, remote)
    }

    fn local_descriptor(&mut self, ep: EndpointId) -> Result<c_int, ClientError> {
        DaemonClient::get_local_fd(self, ep)
    }
}
