//! One-shot lazy initialization.
//!
//! There is no load-time constructor: the first intercepted call runs the
//! init under a tried-once CAS guard. While initialization is in flight
//! (including re-entry from the init path's own file and socket I/O),
//! every intercepted call is a pure pass-through.

use crate::daemon::DAEMON;
use crate::{hooks, shm, slip_log};
use std::sync::atomic::{AtomicU8, Ordering};

const UNTRIED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(UNTRIED);

/// True when the layer is initialized and interception is on. False means
/// "forward this call untouched".
pub fn ensure() -> bool {
    match STATE.load(Ordering::Acquire) {
        READY => true,
        DISABLED | IN_PROGRESS => false,
        _ => {
            if STATE
                .compare_exchange(UNTRIED, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return STATE.load(Ordering::Acquire) == READY;
            }
            let enabled = init_process();
            STATE.store(if enabled { READY } else { DISABLED }, Ordering::Release);
            enabled
        }
    }
}

pub fn active() -> bool {
    STATE.load(Ordering::Acquire) == READY
}

fn init_process() -> bool {
    if slipstream_config::interception_disabled() {
        return false;
    }
    slip_log!("slipstream init, pid={}", unsafe { libc::getpid() });

    // Daemon first: a restored table may need to unregister stale fds.
    DAEMON.lock().connect();

    if unsafe { shm::state_restore() } {
        hooks::scan_inherited_cloexec();
        hooks::log_inherited_fds();
    }
    true
}
