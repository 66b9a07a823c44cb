// Copyright 2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! # fibrio
//!
//! Scalable, coroutine-based, asynchronous IO handling library for Rust.
//!
//! fibrio multiplexes stackful fibers (aka. green threads) over a pool of
//! worker threads. Application code issues ordinary-looking blocking calls
//! — connect, accept, send, recv, sleep — and the hooked syscall layer
//! turns each would-block into a suspension: the fiber parks, an
//! edge-triggered epoll reactor registers interest, and readiness (or a
//! timer) re-schedules the fiber. No callback inversion, no function
//! coloring; a fiber that never does I/O never notices the machinery.
//!
//! ```no_run
//! use fibrio::{IoManager, Socket};
//!
//! let io = IoManager::new(2, false, "demo").unwrap();
//! io.schedule_fn(|| {
//!     let mut listener = Socket::tcp();
//!     listener.bind(&"127.0.0.1:5555".parse().unwrap()).unwrap();
//!     listener.listen(128).unwrap();
//!     loop {
//!         let conn = listener.accept().unwrap();
//!         fibrio::spawn(move || {
//!             let mut buf = [0u8; 4096];
//!             loop {
//!                 match conn.recv(&mut buf) {
//!                     Ok(0) | Err(_) => break,
//!                     Ok(n) => {
//!                         if conn.send_all(&buf[..n]).is_err() {
//!                             break;
//!                         }
//!                     }
//!                 }
//!             }
//!         });
//!     }
//! });
//! ```
//!
//! The runtime is strictly cooperative: a fiber that spins without yielding
//! monopolizes its worker. Long computations should call [`yield_now`]
//! from time to time.

pub mod address;
pub mod buffer;
mod config;
pub mod fd_manager;
mod fiber;
pub mod hook;
mod io;
mod scheduler;
mod socket;
pub mod sync;
pub mod thread;
mod timer;
mod util;

pub use buffer::{BufferError, ByteBuffer};
pub use config::Config;
pub use fiber::{Fiber, State, DEFAULT_STACK_SIZE};
pub use hook::{hook_enabled, set_hook_enabled, DEFAULT_CONNECT_TIMEOUT_MS};
pub use io::{Event, IoManager};
pub use scheduler::{Scheduler, ANY_THREAD};
pub use socket::Socket;
pub use timer::{Timer, TimerManager};
pub use util::{current_ms, gettid};

use std::sync::Arc;

/// Spawn a fiber onto the calling thread's runtime.
///
/// Panics when called on a thread that no [`IoManager`] drives; use
/// [`IoManager::schedule`] with an explicit manager instead.
pub fn spawn<F>(func: F) -> Arc<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    let io = IoManager::current().expect("fibrio::spawn called outside of a runtime thread");
    let fiber =
        Fiber::new(func, io.scheduler().stack_size()).expect("failed to allocate a fiber stack");
    io.schedule(Arc::clone(&fiber));
    fiber
}

/// Block the current fiber for `ms` milliseconds without blocking its
/// worker thread. Outside the runtime this is a plain thread sleep.
pub fn sleep_ms(ms: u64) {
    hook::sleep_ms(ms);
}

/// [`sleep_ms`] with a `Duration`.
pub fn sleep(duration: std::time::Duration) {
    hook::sleep_ms(duration.as_millis() as u64);
}

/// Give up the CPU; the current fiber goes to the back of the ready queue.
pub fn yield_now() {
    Fiber::yield_ready();
}

/// Number of live fibers in the process (bootstrap fibers included).
pub fn total_fibers() -> usize {
    Fiber::total()
}
