//! Named worker threads.
//!
//! A thin wrapper over `std::thread` whose constructor only returns once the
//! child has reported its kernel tid. The scheduler needs that tid up front:
//! ready-queue entries can be pinned to a worker, and the pin is expressed as
//! the worker's tid.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::trace;

use crate::sync::Semaphore;
use crate::util;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("main"));
}

/// Name of the calling thread as recorded by [`Thread::spawn`].
pub fn name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

pub(crate) fn set_name(name: &str) {
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// A named OS thread whose kernel tid is known as soon as `spawn` returns.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: i32,
    name: String,
}

impl Thread {
    pub fn spawn<F>(name: String, func: F) -> io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let ready = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(-1));

        let handle = {
            let ready = Arc::clone(&ready);
            let tid = Arc::clone(&tid);
            let name = name.clone();
            std::thread::Builder::new().name(name.clone()).spawn(move || {
                tid.store(util::gettid(), Ordering::SeqCst);
                set_name(&name);
                ready.notify();
                func();
                trace!("thread {} exiting", name);
            })?
        };

        // The semaphore gates on the tid being published.
        ready.wait();
        Ok(Thread {
            handle: Some(handle),
            tid: tid.load(Ordering::SeqCst),
            name,
        })
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// Dropping without join detaches, matching std semantics.
impl Drop for Thread {
    fn drop(&mut self) {
        self.handle.take();
    }
}
