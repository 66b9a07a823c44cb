//! Clock and thread-identity helpers shared by the scheduler and timer set.

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds since the process-wide monotonic anchor.
///
/// The anchor is taken at first use, so early values are small; only
/// differences between readings are meaningful.
pub fn current_ms() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Kernel thread id of the calling thread.
///
/// Worker pinning compares against this value, so it has to be the tid the
/// kernel hands out, not an opaque `std::thread::ThreadId`.
pub fn gettid() -> i32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as i32
}
