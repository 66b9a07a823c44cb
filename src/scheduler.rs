//! M:N fiber scheduler.
//!
//! A [`Scheduler`] owns a pool of worker threads and a FIFO ready queue of
//! (fiber-or-function, pinned-tid) entries. Every worker runs the same
//! dispatch loop: scan the queue for the first entry it may run (honoring
//! pins and skipping fibers currently executing elsewhere), resume it, and
//! react to how it came back. When the queue is empty the worker swaps into
//! an idle fiber — the base scheduler's idle simply parks, the I/O manager
//! replaces it with an epoll wait.
//!
//! Caller mode: the thread that constructs the scheduler donates itself as a
//! worker. Its dispatch loop runs on a dedicated root fiber which `stop()`
//! resumes to drain remaining work on the calling thread.
//!
//! The base behaviors a composing runtime may override — `tickle`, `idle`,
//! the termination predicate, per-worker setup — are a capability record of
//! closures ([`SchedulerHooks`]) installed at most once, not a class
//! hierarchy.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, trace};

use crate::fiber::{self, Fiber, State, DEFAULT_STACK_SIZE};
use crate::sync::Mutex;
use crate::thread::Thread;
use crate::util;

/// Pin value meaning "any worker may run this entry".
pub const ANY_THREAD: i32 = -1;

/// A unit of schedulable work: a fiber to resume or a function to run on a
/// lazily created fiber.
pub(crate) enum Work {
    Fiber(Arc<Fiber>),
    Func(Box<dyn FnOnce() + Send + 'static>),
}

struct ReadyEntry {
    work: Work,
    /// Kernel tid this entry is pinned to, or [`ANY_THREAD`].
    thread: i32,
}

/// Overridable scheduler behaviors, installed once by a composing runtime.
pub(crate) struct SchedulerHooks {
    /// Wake one idle worker.
    pub tickle: Box<dyn Fn() + Send + Sync>,
    /// Body of the per-worker idle fiber.
    pub idle: Arc<dyn Fn() + Send + Sync>,
    /// Termination predicate consulted by the idle fiber and `stop()`.
    pub stopping: Box<dyn Fn() -> bool + Send + Sync>,
    /// Per-worker setup, run before the dispatch loop starts.
    pub thread_start: Box<dyn Fn() + Send + Sync>,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

pub struct Scheduler {
    name: String,
    /// Back-reference to the owning `Arc`, cloned into worker threads.
    self_weak: Weak<Scheduler>,
    queue: Mutex<VecDeque<ReadyEntry>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<i32>>,
    /// OS threads to spawn (excludes the caller in caller mode).
    thread_count: usize,
    root_fiber: OnceLock<Arc<Fiber>>,
    root_thread: i32,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    stack_size: usize,
    hooks: OnceLock<SchedulerHooks>,
}

impl Scheduler {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<Arc<Scheduler>> {
        Scheduler::with_stack_size(threads, use_caller, name, DEFAULT_STACK_SIZE)
    }

    pub fn with_stack_size(
        threads: usize,
        use_caller: bool,
        name: &str,
        stack_size: usize,
    ) -> io::Result<Arc<Scheduler>> {
        assert!(threads >= 1, "scheduler needs at least one thread");

        let (root_thread, spawn_count) = if use_caller {
            (util::gettid(), threads - 1)
        } else {
            (ANY_THREAD, threads)
        };

        let sched = Arc::new_cyclic(|weak| Scheduler {
            name: name.to_string(),
            self_weak: weak.clone(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count: spawn_count,
            root_fiber: OnceLock::new(),
            root_thread,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            stack_size,
            hooks: OnceLock::new(),
        });

        if use_caller {
            fiber::init_thread();
            CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(Arc::clone(&sched)));
            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                },
                stack_size,
            )?;
            let _ = sched.root_fiber.set(root);
            sched.thread_ids.lock().push(root_thread);
        }

        Ok(sched)
    }

    /// The scheduler driving the calling thread's dispatch loop, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tids of all workers, in spawn order (caller thread first in
    /// caller mode). Valid pin targets for [`Scheduler::schedule_on`].
    pub fn thread_ids(&self) -> Vec<i32> {
        self.thread_ids.lock().clone()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub(crate) fn install_hooks(&self, hooks: SchedulerHooks) {
        if self.hooks.set(hooks).is_err() {
            panic!("scheduler hooks installed twice");
        }
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("scheduler {}: starting {} worker threads", self.name, self.thread_count);
        let mut threads = self.threads.lock();
        for i in 0..self.thread_count {
            let sched = self.handle();
            let t = Thread::spawn(format!("{}_{}", self.name, i), move || sched.run())?;
            self.thread_ids.lock().push(t.tid());
            threads.push(t);
        }
        Ok(())
    }

    /// Request shutdown, drain remaining work and join all workers.
    ///
    /// On return the ready queue is empty and no worker is active.
    pub fn stop(&self) {
        debug!("scheduler {}: stop", self.name);
        self.auto_stop.store(true, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);

        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.root_fiber.get().is_some() {
            self.tickle();
        }

        // Caller mode: the constructing thread drains the queue itself by
        // running the root fiber's dispatch loop to completion.
        if let Some(root) = self.root_fiber.get() {
            if !self.stopping() && root.state() != State::Term {
                root.swap_in();
            }
        }

        let threads = mem::take(&mut *self.threads.lock());
        for t in threads {
            t.join();
        }
        debug_assert!(self.queue.lock().is_empty());
        debug_assert_eq!(self.active.load(Ordering::SeqCst), 0);
    }

    /// Enqueue a fiber for any worker.
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.schedule_work(Work::Fiber(fiber), ANY_THREAD);
    }

    /// Enqueue a fiber pinned to the worker with kernel tid `thread`.
    pub fn schedule_on(&self, fiber: Arc<Fiber>, thread: i32) {
        self.schedule_work(Work::Fiber(fiber), thread);
    }

    /// Enqueue a bare function; the dispatch loop runs it on a reusable
    /// per-worker fiber.
    pub fn schedule_fn<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_work(Work::Func(Box::new(func)), ANY_THREAD);
    }

    pub fn schedule_fn_on<F>(&self, func: F, thread: i32)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_work(Work::Func(Box::new(func)), thread);
    }

    /// Enqueue a batch of fibers under one queue lock, waking a worker at
    /// most once.
    pub fn schedule_fibers<I>(&self, fibers: I)
    where
        I: IntoIterator<Item = Arc<Fiber>>,
    {
        self.schedule_batch(fibers.into_iter().map(Work::Fiber));
    }

    pub(crate) fn schedule_work(&self, work: Work, thread: i32) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(ReadyEntry { work, thread });
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Enqueue a batch under a single queue lock, waking a worker at most
    /// once.
    pub(crate) fn schedule_batch(&self, works: impl IntoIterator<Item = Work>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(works.into_iter().map(|work| ReadyEntry {
                work,
                thread: ANY_THREAD,
            }));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub(crate) fn tickle(&self) {
        match self.hooks.get() {
            Some(hooks) => (hooks.tickle)(),
            None => trace!("scheduler {}: tickle", self.name),
        }
    }

    /// Full termination predicate (hook-aware).
    pub(crate) fn stopping(&self) -> bool {
        match self.hooks.get() {
            Some(hooks) => (hooks.stopping)(),
            None => self.stopping_base(),
        }
    }

    /// Base termination predicate: shutdown requested, queue drained, no
    /// worker mid-dispatch.
    pub(crate) fn stopping_base(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().is_empty()
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    /// Strong handle to this scheduler; every caller of an `&self` method
    /// holds one, directly or through a worker's clone.
    fn handle(&self) -> Arc<Scheduler> {
        self.self_weak.upgrade().expect("scheduler outlived its Arc")
    }

    /// The per-worker dispatch loop.
    fn run(&self) {
        let tid = util::gettid();
        debug!("scheduler {}: dispatch loop on thread {}", self.name, tid);
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.handle()));
        if let Some(hooks) = self.hooks.get() {
            (hooks.thread_start)();
        }
        if tid != self.root_thread {
            fiber::init_thread();
        }

        let idle_fiber = {
            let body: Box<dyn FnOnce() + Send> = match self.hooks.get() {
                Some(hooks) => {
                    let idle = Arc::clone(&hooks.idle);
                    Box::new(move || idle())
                }
                None => {
                    let weak = self.self_weak.clone();
                    Box::new(move || {
                        while let Some(sched) = weak.upgrade() {
                            if sched.stopping() {
                                break;
                            }
                            drop(sched);
                            Fiber::yield_hold();
                        }
                    })
                }
            };
            Fiber::new_boxed(body, self.stack_size).expect("failed to allocate the idle fiber")
        };
        let mut func_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut entry: Option<ReadyEntry> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock();
                let mut idx = 0;
                while idx < queue.len() {
                    let candidate = &queue[idx];
                    // Pinned to another worker: leave it, wake someone.
                    if candidate.thread != ANY_THREAD && candidate.thread != tid {
                        tickle_me = true;
                        idx += 1;
                        continue;
                    }
                    // Still on another worker's CPU: it will be demoted to
                    // Hold or re-queued shortly, skip it for now.
                    if let Work::Fiber(f) = &candidate.work {
                        if f.state() == State::Exec {
                            idx += 1;
                            continue;
                        }
                    }
                    entry = queue.remove(idx);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if entry.is_some() {
                    tickle_me |= idx < queue.len();
                }
            }
            if tickle_me {
                self.tickle();
            }

            match entry {
                Some(ReadyEntry { work: Work::Fiber(f), thread }) => {
                    let state = f.state();
                    if state != State::Term && state != State::Except {
                        f.swap_in();
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        match f.state() {
                            State::Ready => self.schedule_work(Work::Fiber(f), thread),
                            State::Term | State::Except => {}
                            _ => f.set_state(State::Hold),
                        }
                    } else {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(ReadyEntry { work: Work::Func(func), thread }) => {
                    let f = match func_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(func).expect("failed to reset the function fiber");
                            f
                        }
                        None => Fiber::new_boxed(func, self.stack_size)
                            .expect("failed to allocate a function fiber"),
                    };
                    f.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        State::Ready => self.schedule_work(Work::Fiber(f), thread),
                        // Finished: keep the fiber around for the next function.
                        State::Term | State::Except => func_fiber = Some(f),
                        // Parked mid-function; its event owns the handle now.
                        _ => f.set_state(State::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        debug!("scheduler {}: thread {} done", self.name, tid);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.swap_in();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    match idle_fiber.state() {
                        State::Term | State::Except => {}
                        _ => idle_fiber.set_state(State::Hold),
                    }
                }
            }
        }

        CURRENT_SCHEDULER.with(|c| c.borrow_mut().take());
        if tid != self.root_thread {
            fiber::clear_thread();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn functions_all_run() {
        init_logs();
        let sched = Scheduler::new(2, false, "t-fns").unwrap();
        sched.start().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let h = Arc::clone(&hits);
            sched.schedule_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn fibers_run_and_yield() {
        init_logs();
        let sched = Scheduler::new(2, false, "t-fibers").unwrap();
        sched.start().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let h = Arc::clone(&hits);
            let fiber = Fiber::spawn(move || {
                for _ in 0..5 {
                    h.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_ready();
                }
            })
            .unwrap();
            sched.schedule(fiber);
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn caller_mode_drains_on_stop() {
        init_logs();
        let sched = Scheduler::new(1, true, "t-caller").unwrap();
        sched.start().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let h = Arc::clone(&hits);
            sched.schedule_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        // With one thread and use_caller, no OS worker exists; everything
        // runs here, inside stop().
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn batch_schedule_runs_everything() {
        init_logs();
        let sched = Scheduler::new(2, false, "t-batch").unwrap();
        sched.start().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let works: Vec<Work> = (0..32)
            .map(|_| {
                let h = Arc::clone(&hits);
                Work::Func(Box::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .collect();
        sched.schedule_batch(works);
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn stop_is_clean_without_work() {
        init_logs();
        let sched = Scheduler::new(3, false, "t-empty").unwrap();
        sched.start().unwrap();
        sched.stop();
        assert!(sched.stopping_base());
    }

    #[test]
    fn start_is_idempotent() {
        init_logs();
        let sched = Scheduler::new(2, false, "t-idem").unwrap();
        sched.start().unwrap();
        sched.start().unwrap();
        assert_eq!(sched.thread_ids().len(), 2);
        sched.stop();
    }
}
