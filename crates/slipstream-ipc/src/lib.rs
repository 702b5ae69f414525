//! Wire protocol between the interception layer and the pairing daemon.
//!
//! The control channel is a UNIX-domain stream carrying line-terminated
//! ASCII requests and responses. Every response starts with a 3-digit
//! status; `200` is success, anything else is failure. `GETLOCALFD`
//! additionally delivers an open descriptor out-of-band via ancillary
//! data; that part is transport-level and lives in the layer's daemon
//! client, not here.
//!
//! This crate is pure: no sockets, no syscalls. It exists so the codec can
//! be exercised without a daemon on the other end.

use std::fmt;
use std::net::IpAddr;

/// Endpoint identifier assigned by the daemon.
///
/// Ids double as indexes into the layer's endpoint table, so the daemon
/// keeps them small; `ENDPOINT_INVALID` marks an unassigned slot.
pub type EndpointId = u32;

pub const ENDPOINT_INVALID: EndpointId = u32::MAX;

/// One socket address as submitted with `ENDPOINT_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port),
        }
    }
}

/// Monotonic instant, seconds + nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonoTime {
    pub sec: i64,
    pub nsec: i64,
}

impl MonoTime {
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

impl fmt::Display for MonoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Metadata the daemon feeds to its matching heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Passive (accepted) side of the connection?
    pub is_accept: bool,
    pub connect_start: MonoTime,
    pub connect_end: MonoTime,
    pub src: NetAddr,
    pub dst: NetAddr,
}

/// A request line to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        pid: i32,
        fd: i32,
    },
    Reregister {
        ep: EndpointId,
        pid: i32,
        fd: i32,
    },
    Unregister {
        ep: EndpointId,
    },
    Localize {
        local: EndpointId,
        remote: EndpointId,
    },
    GetLocalFd {
        ep: EndpointId,
    },
    /// Byte-count-only pairing probe.
    EndpointKludge {
        ep: EndpointId,
    },
    /// CRC-validated pairing probe; `last` tells the daemon this side is
    /// about to give up.
    ThreshCrcKludge {
        ep: EndpointId,
        crc_sent: u32,
        crc_recv: u32,
        last: bool,
    },
    EndpointInfo {
        ep: EndpointId,
        info: EndpointInfo,
    },
    RemoveAll {
        pid: i32,
    },
}

impl Request {
    /// Render the request as a single newline-terminated line.
    pub fn encode(&self) -> String {
        match self {
            Request::Register { pid, fd } => format!("REGISTER {} {}\n", pid, fd),
            Request::Reregister { ep, pid, fd } => {
                format!("REREGISTER {} {} {}\n", ep, pid, fd)
            }
            Request::Unregister { ep } => format!("UNREGISTER {}\n", ep),
            Request::Localize { local, remote } => format!("LOCALIZE {} {}\n", local, remote),
            Request::GetLocalFd { ep } => format!("GETLOCALFD {}\n", ep),
            Request::EndpointKludge { ep } => format!("ENDPOINT_KLUDGE {}\n", ep),
            Request::ThreshCrcKludge {
                ep,
                crc_sent,
                crc_recv,
                last,
            } => {
                if *last {
                    format!("THRESH_CRC_KLUDGE {} {} {} LAST\n", ep, crc_sent, crc_recv)
                } else {
                    format!("THRESH_CRC_KLUDGE {} {} {}\n", ep, crc_sent, crc_recv)
                }
            }
            Request::EndpointInfo { ep, info } => format!(
                "ENDPOINT_INFO {} {} {} {} {} {}\n",
                ep,
                if info.is_accept { 'A' } else { 'C' },
                info.connect_start,
                info.connect_end,
                info.src,
                info.dst,
            ),
            Request::RemoveAll { pid } => format!("REMOVEALL {}\n", pid),
        }
    }
}

/// A parsed response line from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `200 OK`
    Ok,
    /// `200 ID <ep>`: fresh endpoint id from `REGISTER`.
    Id(EndpointId),
    /// `200 PAIR <ep>`: a matching remote endpoint exists.
    Pair(EndpointId),
    /// `200 REMOVED <pid>`: acknowledgment of `REMOVEALL`.
    Removed(i32),
    /// `404 ...`: no match / unknown endpoint.
    NotFound,
    /// Any other non-200 status.
    Failed { status: u16, detail: String },
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Response::Ok | Response::Id(_) | Response::Pair(_) | Response::Removed(_)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty response line")]
    Empty,
    #[error("response has no 3-digit status: {0:?}")]
    MissingStatus(String),
    #[error("malformed {verb} payload: {line:?}")]
    BadPayload { verb: &'static str, line: String },
    #[error("unrecognized 200 response: {0:?}")]
    UnknownOk(String),
}

/// Parse one response line (trailing newline optional).
pub fn parse_response(line: &str) -> Result<Response, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let (status, rest) = match line.split_once(' ') {
        Some((s, r)) => (s, r),
        None => (line, ""),
    };
    if status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MissingStatus(line.to_string()));
    }
    let status: u16 = status.parse().expect("3 ascii digits");

    match status {
        200 => {
            let mut words = rest.split_ascii_whitespace();
            match words.next() {
                Some("OK") => Ok(Response::Ok),
                Some("ID") => {
                    let ep = words
                        .next()
                        .and_then(|w| w.parse().ok())
                        .ok_or_else(|| ProtocolError::BadPayload {
                            verb: "ID",
                            line: line.to_string(),
                        })?;
                    Ok(Response::Id(ep))
                }
                Some("PAIR") => {
                    let ep = words
                        .next()
                        .and_then(|w| w.parse().ok())
                        .ok_or_else(|| ProtocolError::BadPayload {
                            verb: "PAIR",
                            line: line.to_string(),
                        })?;
                    Ok(Response::Pair(ep))
                }
                Some("REMOVED") => {
                    let pid = words
                        .next()
                        .and_then(|w| w.parse().ok())
                        .ok_or_else(|| ProtocolError::BadPayload {
                            verb: "REMOVED",
                            line: line.to_string(),
                        })?;
                    Ok(Response::Removed(pid))
                }
                _ => Err(ProtocolError::UnknownOk(line.to_string())),
            }
        }
        404 => Ok(Response::NotFound),
        other => Ok(Response::Failed {
            status: other,
            detail: rest.to_string(),
        }),
    }
}

/// Errors surfaced by the layer's daemon client.
///
/// Defined here so both sides of the seam (the client and the optimization
/// engine that consumes it) share one vocabulary.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("control channel I/O failed (errno {0})")]
    Io(i32),
    #[error("control channel closed by daemon")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("daemon refused: status {status} {detail:?}")]
    Refused { status: u16, detail: String },
    #[error("GETLOCALFD response carried no descriptor")]
    MissingDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn encode_register() {
        let r = Request::Register { pid: 4242, fd: 7 };
        assert_eq!(r.encode(), "REGISTER 4242 7\n");
    }

    #[test]
    fn encode_reregister_carries_all_three_fields() {
        let r = Request::Reregister {
            ep: 3,
            pid: 100,
            fd: 9,
        };
        assert_eq!(r.encode(), "REREGISTER 3 100 9\n");
    }

    #[test]
    fn encode_simple_verbs() {
        assert_eq!(Request::Unregister { ep: 9 }.encode(), "UNREGISTER 9\n");
        assert_eq!(
            Request::Localize {
                local: 1,
                remote: 2
            }
            .encode(),
            "LOCALIZE 1 2\n"
        );
        assert_eq!(Request::GetLocalFd { ep: 6 }.encode(), "GETLOCALFD 6\n");
        assert_eq!(
            Request::EndpointKludge { ep: 4 }.encode(),
            "ENDPOINT_KLUDGE 4\n"
        );
        assert_eq!(Request::RemoveAll { pid: 31 }.encode(), "REMOVEALL 31\n");
    }

    #[test]
    fn encode_crc_kludge_with_and_without_last() {
        let base = Request::ThreshCrcKludge {
            ep: 5,
            crc_sent: 0xdeadbeef,
            crc_recv: 17,
            last: false,
        };
        assert_eq!(base.encode(), "THRESH_CRC_KLUDGE 5 3735928559 17\n");

        let last = Request::ThreshCrcKludge {
            ep: 5,
            crc_sent: 1,
            crc_recv: 2,
            last: true,
        };
        assert_eq!(last.encode(), "THRESH_CRC_KLUDGE 5 1 2 LAST\n");
    }

    #[test]
    fn encode_endpoint_info_line() {
        let info = EndpointInfo {
            is_accept: true,
            connect_start: MonoTime { sec: 12, nsec: 5 },
            connect_end: MonoTime {
                sec: 12,
                nsec: 999_000_000,
            },
            src: NetAddr {
                addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port: 8080,
            },
            dst: NetAddr {
                addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port: 51000,
            },
        };
        let r = Request::EndpointInfo { ep: 2, info };
        assert_eq!(
            r.encode(),
            "ENDPOINT_INFO 2 A 12.000000005 12.999000000 127.0.0.1:8080 127.0.0.1:51000\n"
        );
    }

    #[test]
    fn endpoint_info_renders_v6_in_brackets() {
        let na = NetAddr {
            addr: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: 443,
        };
        assert_eq!(na.to_string(), "[::1]:443");
    }

    #[test]
    fn parse_ok_variants() {
        assert_eq!(parse_response("200 OK\n").unwrap(), Response::Ok);
        assert_eq!(parse_response("200 ID 12\n").unwrap(), Response::Id(12));
        assert_eq!(parse_response("200 PAIR 3").unwrap(), Response::Pair(3));
        assert_eq!(
            parse_response("200 REMOVED 4242\n").unwrap(),
            Response::Removed(4242)
        );
    }

    #[test]
    fn parse_not_found() {
        assert_eq!(parse_response("404 NOMATCH\n").unwrap(), Response::NotFound);
        assert_eq!(parse_response("404").unwrap(), Response::NotFound);
    }

    #[test]
    fn parse_other_failure_keeps_status_and_detail() {
        match parse_response("500 internal wobble\n").unwrap() {
            Response::Failed { status, detail } => {
                assert_eq!(status, 500);
                assert_eq!(detail, "internal wobble");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_response(""), Err(ProtocolError::Empty));
        assert!(matches!(
            parse_response("HELLO"),
            Err(ProtocolError::MissingStatus(_))
        ));
        assert!(matches!(
            parse_response("200 ID twelve"),
            Err(ProtocolError::BadPayload { verb: "ID", .. })
        ));
        assert!(matches!(
            parse_response("200 WAT"),
            Err(ProtocolError::UnknownOk(_))
        ));
    }

    #[test]
    fn success_predicate_matches_status_class() {
        assert!(Response::Ok.is_success());
        assert!(Response::Pair(1).is_success());
        assert!(!Response::NotFound.is_success());
        assert!(!Response::Failed {
            status: 503,
            detail: String::new()
        }
        .is_success());
    }
}
