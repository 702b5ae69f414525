//! Per-endpoint traffic accounting.
//!
//! Each direction carries a byte counter and a running CRC-32 over the
//! first `threshold` bytes of the stream. The CRC is seeded with the
//! connection's address pair before the first byte so two connections
//! with identical prefixes but different peers cannot collide. Counters
//! keep growing past the threshold; the hash saturates there.
//!
//! The running CRC lives in the record as a plain `u32`
//! (`Hasher::new_with_initial` resumes it), which keeps endpoint records
//! copyable for the exec state transfer.

use crate::table::EndpointRecord;
use crc32fast::Hasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Seed both direction CRCs from the connection's addresses.
///
/// The send CRC starts from local‖peer and the receive CRC from
/// peer‖local, so the two sides of one connection hash swap-equal
/// prefixes: our send seed equals the peer's receive seed.
pub fn seed_crcs(info: &mut EndpointRecord, local_addr: &[u8], peer_addr: &[u8]) {
    let mut hs = Hasher::new();
    hs.update(local_addr);
    hs.update(peer_addr);
    info.crc_sent = hs.finalize();

    let mut hr = Hasher::new();
    hr.update(peer_addr);
    hr.update(local_addr);
    info.crc_recv = hr.finalize();

    info.crc_seeded = true;
}

/// Fold `transferred` bytes into one direction's counter and CRC.
///
/// `chunks` yields the transferred bytes in order (possibly split across
/// iovec segments; segments past `transferred` are ignored). Returns true
/// exactly when this update moves the counter onto the threshold edge,
/// which is the optimization trigger.
pub fn account<'a, I>(
    info: &mut EndpointRecord,
    dir: Direction,
    threshold: u64,
    transferred: usize,
    chunks: I,
) -> bool
where
    I: IntoIterator<Item = &'a [u8]>,
{
    if transferred == 0 {
        return false;
    }

    let (counter, crc) = match dir {
        Direction::Send => (&mut info.bytes_sent, &mut info.crc_sent),
        Direction::Recv => (&mut info.bytes_recv, &mut info.crc_recv),
    };

    let before = *counter;
    let after = before.saturating_add(transferred as u64);
    *counter = after;

    if before < threshold {
        let mut want = (threshold - before).min(transferred as u64) as usize;
        let mut h = Hasher::new_with_initial(*crc);
        for chunk in chunks {
            if want == 0 {
                break;
            }
            let take = chunk.len().min(want);
            h.update(&chunk[..take]);
            want -= take;
        }
        *crc = h.finalize();
    }

    before < threshold && after == threshold
}
