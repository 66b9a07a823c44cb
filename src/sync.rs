//! Synchronization primitives.
//!
//! The runtime speaks one lock dialect: `parking_lot` mutexes and rwlocks,
//! re-exported here, plus a counted semaphore used for thread-startup
//! handshakes.

pub use parking_lot::{Condvar, Mutex, RwLock};

/// A counted semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Release one permit, waking a waiter if any.
    pub fn notify(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn semaphore_hands_over_a_permit() {
        let sem = Arc::new(Semaphore::new(0));
        let released = Arc::new(AtomicBool::new(false));

        let handle = {
            let sem = Arc::clone(&sem);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                sem.wait();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        sem.notify();
        handle.join().unwrap();
    }

    #[test]
    fn semaphore_initial_permits_do_not_block() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.notify();
        sem.wait();
    }
}
