//! First-failure data capture.
//!
//! Every capture is logged with the caller's source location and a debug dump
//! of the structures involved. Fatal captures then stop the process, because
//! the engine cannot continue safely from a corrupted queue or a failed lock.

use std::fmt::Debug;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

static CAPTURES: AtomicU64 = AtomicU64::new(0);

/// Number of captures taken by this process so far.
#[inline]
pub fn captures() -> u64 {
    CAPTURES.load(Ordering::SeqCst)
}

/// Record a problem the engine can survive.
#[track_caller]
pub fn capture(label: &str, dump: &dyn Debug) {
    let site = Location::caller();
    CAPTURES.fetch_add(1, Ordering::SeqCst);
    log::error!(
        "FFDC {}:{} on thread {:?}: {}, state: {:?}",
        site.file(),
        site.line(),
        std::thread::current().name().unwrap_or("<unnamed>"),
        label,
        dump
    );
}

/// Record an invariant violation and terminate.
#[track_caller]
pub fn fatal(label: &str, dump: &dyn Debug) -> ! {
    capture(label, dump);
    log::error!("FFDC fatal, stopping the process");
    log::logger().flush();
    std::process::abort()
}
