//! # slipstream-layer
//!
//! Transparent same-host socket acceleration as a preload layer.
//!
//! Unmodified applications keep using ordinary TCP sockets; this library
//! intercepts the socket surface of libc, accounts traffic per connection
//! endpoint, and, once the pairing daemon confirms that two endpoints on
//! this host carry matching byte streams, swaps the underlying transport
//! to a daemon-provided UNIX-domain descriptor. Already-delivered bytes
//! stay delivered exactly once on the kernel path; the application only
//! ever observes ordinary stream semantics.
//!
//! Linux only. No load-time constructor: the first intercepted call
//! initializes the layer under a tried-once guard, and everything the
//! layer does internally goes through `reals::` (dlsym RTLD_NEXT) so it
//! never re-enters the interposed symbols.
//!
//! The `#[no_mangle]` export surface itself lives in the companion
//! `slipstream-preload` cdylib; this crate stays a plain library so its
//! tests can run without intercepting their own harness.

// Inherently unsafe C ABI surface; per-function safety docs would all say
// the same thing ("caller is the dynamic linker").
#![allow(clippy::missing_safety_doc)]

#[macro_use]
pub mod logging;

pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod hooks;
pub mod init;
pub mod mux;
pub mod reals;
pub mod reserved;
pub mod shm;
pub mod stats;
pub mod sync;
pub mod table;
