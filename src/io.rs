//! The I/O manager: an epoll reactor composed with the scheduler and the
//! timer set.
//!
//! [`IoManager`] owns the three parts and wires the scheduler's capability
//! hooks so that its workers idle inside `epoll_wait` instead of spinning:
//! the idle fiber waits for readiness or the next timer deadline (clamped to
//! 3000 ms), converts whatever arrives into ready-queue entries, and yields
//! back to the dispatch loop.
//!
//! Wakeup is a self-pipe: `tickle` writes one byte when at least one worker
//! is parked in `epoll_wait`; the read end is registered edge-triggered and
//! drained on arrival.
//!
//! Per descriptor the reactor keeps one [`FdContext`] with two event slots
//! (READ and WRITE). Registering interest is `EPOLL_CTL_ADD` for the first
//! direction and `EPOLL_CTL_MOD` with the union mask afterwards — always
//! edge-triggered. Readiness, cancellation, or timer-driven cancellation
//! each clear the direction bit, re-arm epoll with whatever directions
//! remain, and schedule the stored fiber or function exactly once.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::pipe2;

use crate::config::Config;
use crate::fiber::{Fiber, State};
use crate::scheduler::{Scheduler, SchedulerHooks, Work, ANY_THREAD};
use crate::timer::{Timer, TimerCallback, TimerManager};

bitflags! {
    /// I/O direction bitmask, values matching `EPOLLIN`/`EPOLLOUT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Event: u32 {
        const READ = 0x001;
        const WRITE = 0x004;
    }
}

fn epoll_flags(events: Event) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if events.contains(Event::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if events.contains(Event::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

/// Upper bound on a single `epoll_wait`, so workers notice shutdown and
/// newly inserted timers even without a tickle.
const MAX_TIMEOUT_MS: u64 = 3000;
const MAX_EVENTS: usize = 256;

/// What to resume when a direction becomes ready, and where.
struct EventSlot {
    scheduler: Weak<Scheduler>,
    task: Option<Work>,
}

impl EventSlot {
    fn empty() -> EventSlot {
        EventSlot {
            scheduler: Weak::new(),
            task: None,
        }
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.task = None;
    }
}

struct FdContextInner {
    /// Directions currently registered in epoll for this fd.
    registered: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdContextInner {
    fn slot(&mut self, direction: Event) -> &mut EventSlot {
        if direction == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

/// Per-descriptor registration state, owned by the reactor.
pub(crate) struct FdContext {
    fd: RawFd,
    inner: crate::sync::Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: crate::sync::Mutex::new(FdContextInner {
                registered: Event::empty(),
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }),
        }
    }
}

/// The epoll reactor.
pub(crate) struct Reactor {
    epoll: Epoll,
    tickle_rd: File,
    tickle_wr: File,
    tickle_fd: RawFd,
    contexts: crate::sync::RwLock<Vec<Option<Arc<FdContext>>>>,
    /// Total registered (fd, direction) pairs.
    waiting: AtomicUsize,
}

impl Reactor {
    fn new() -> io::Result<Reactor> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let tickle_fd = rd.as_raw_fd();
        epoll.add(
            &rd,
            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, tickle_fd as u64),
        )?;
        Ok(Reactor {
            epoll,
            tickle_rd: File::from(rd),
            tickle_wr: File::from(wr),
            tickle_fd,
            contexts: crate::sync::RwLock::new(Vec::new()),
            waiting: AtomicUsize::new(0),
        })
    }

    fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// One byte into the self-pipe; any worker parked in `epoll_wait` wakes.
    fn tickle_write(&self) {
        trace!("reactor: tickle");
        let _ = (&self.tickle_wr).write(b"T");
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        while matches!((&self.tickle_rd).read(&mut buf), Ok(n) if n > 0) {}
    }

    /// The context for `fd`, growing the table geometrically on demand.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read();
            if let Some(Some(ctx)) = contexts.get(fd as usize) {
                return Arc::clone(ctx);
            }
        }
        let mut contexts = self.contexts.write();
        if fd as usize >= contexts.len() {
            let new_len = (fd as usize * 3 / 2).max(32).max(contexts.len()) + 1;
            contexts.resize(new_len, None);
        }
        let slot = &mut contexts[fd as usize];
        if slot.is_none() {
            *slot = Some(Arc::new(FdContext::new(fd)));
        }
        Arc::clone(slot.as_ref().unwrap())
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.contexts.read().get(fd as usize)?.clone()
    }

    fn add_event(
        &self,
        fd: RawFd,
        direction: Event,
        task: Option<Work>,
        scheduler: &Arc<Scheduler>,
    ) -> io::Result<()> {
        debug_assert!(direction == Event::READ || direction == Event::WRITE);
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock();
        assert!(
            !inner.registered.contains(direction),
            "{:?} already registered for fd {}",
            direction,
            fd
        );

        let mut event = EpollEvent::new(
            epoll_flags(inner.registered | direction) | EpollFlags::EPOLLET,
            fd as u64,
        );
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if inner.registered.is_empty() {
            self.epoll.add(borrowed, event)
        } else {
            self.epoll.modify(borrowed, &mut event)
        };
        if let Err(errno) = result {
            warn!("epoll_ctl add {:?} for fd {} failed: {}", direction, fd, errno);
            return Err(io::Error::from(errno));
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        inner.registered |= direction;

        let task = match task {
            Some(task) => task,
            None => {
                let current = Fiber::current().expect("add_event without a task outside a fiber");
                assert_eq!(current.state(), State::Exec);
                Work::Fiber(current)
            }
        };
        let slot = inner.slot(direction);
        debug_assert!(slot.task.is_none(), "event slot for fd {} still occupied", fd);
        slot.scheduler = Arc::downgrade(scheduler);
        slot.task = Some(task);
        trace!("fd {}: {:?} registered", fd, direction);
        Ok(())
    }

    /// Unregister a direction without resuming its waiter.
    fn del_event(&self, fd: RawFd, direction: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.registered.contains(direction) {
            return false;
        }
        if !self.rearm(fd, inner.registered & !direction) {
            return false;
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        inner.registered &= !direction;
        inner.slot(direction).reset();
        trace!("fd {}: {:?} removed", fd, direction);
        true
    }

    /// Unregister a direction and resume its waiter as if it had fired.
    fn cancel_event(&self, fd: RawFd, direction: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.registered.contains(direction) {
            return false;
        }
        if !self.rearm(fd, inner.registered & !direction) {
            return false;
        }
        Self::trigger(&mut inner, direction);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        trace!("fd {}: {:?} cancelled", fd, direction);
        true
    }

    /// Drop the fd from epoll entirely, resuming both directions' waiters.
    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.registered.is_empty() {
            return false;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(errno) = self.epoll.delete(borrowed) {
            warn!("epoll_ctl del for fd {} failed: {}", fd, errno);
            return false;
        }
        if inner.registered.contains(Event::READ) {
            Self::trigger(&mut inner, Event::READ);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.registered.contains(Event::WRITE) {
            Self::trigger(&mut inner, Event::WRITE);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.registered.is_empty());
        true
    }

    /// Re-register `fd` with the remaining directions (MOD) or drop it (DEL).
    fn rearm(&self, fd: RawFd, remaining: Event) -> bool {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if remaining.is_empty() {
            self.epoll.delete(borrowed)
        } else {
            let mut event =
                EpollEvent::new(epoll_flags(remaining) | EpollFlags::EPOLLET, fd as u64);
            self.epoll.modify(borrowed, &mut event)
        };
        if let Err(errno) = result {
            warn!("epoll_ctl rearm for fd {} failed: {}", fd, errno);
            return false;
        }
        true
    }

    /// Clear the direction bit and hand the stored work to its scheduler.
    ///
    /// The caller holds the fd mutex and owns the counter decrement.
    fn trigger(inner: &mut FdContextInner, direction: Event) {
        debug_assert!(inner.registered.contains(direction));
        inner.registered &= !direction;
        let slot = inner.slot(direction);
        let scheduler = slot.scheduler.upgrade();
        let task = slot.task.take();
        slot.reset();
        if let (Some(scheduler), Some(task)) = (scheduler, task) {
            scheduler.schedule_work(task, ANY_THREAD);
        }
    }

    /// Process one epoll readiness report.
    fn dispatch_ready(&self, fd: RawFd, mut flags: EpollFlags) {
        let Some(ctx) = self.lookup(fd) else {
            return;
        };
        let fd = ctx.fd;
        let mut inner = ctx.inner.lock();
        // An error or hangup must wake whoever is registered, whichever
        // direction they wait on.
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            flags |= (EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT) & epoll_flags(inner.registered);
        }
        let mut real = Event::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            real |= Event::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            real |= Event::WRITE;
        }
        real &= inner.registered;
        if real.is_empty() {
            return;
        }

        if !self.rearm(fd, inner.registered & !real) {
            return;
        }
        if real.contains(Event::READ) {
            Self::trigger(&mut inner, Event::READ);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if real.contains(Event::WRITE) {
            Self::trigger(&mut inner, Event::WRITE);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn wait(&self, events: &mut [EpollEvent], timeout_ms: u64) -> nix::Result<usize> {
        self.epoll
            .wait(events, EpollTimeout::from(timeout_ms.min(u16::MAX as u64) as u16))
    }
}

/// Weak handle bundle stored in thread-local storage by every worker.
#[derive(Clone)]
pub(crate) struct IoHandle {
    scheduler: Weak<Scheduler>,
    timers: Weak<TimerManager>,
    reactor: Weak<Reactor>,
}

thread_local! {
    static CURRENT_IO: RefCell<Option<IoHandle>> = const { RefCell::new(None) };
}

/// The composed runtime: scheduler + timer set + reactor.
///
/// Construction starts the worker pool; dropping the manager stops it and
/// joins every worker.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    reactor: Arc<Reactor>,
    /// Only the originally constructed manager stops the pool on drop;
    /// handles obtained through [`IoManager::current`] do not.
    owner: bool,
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<IoManager> {
        let mut config = Config::new();
        config.set_threads(threads).set_use_caller(use_caller).set_name(name);
        IoManager::with_config(config)
    }

    pub fn with_config(config: Config) -> io::Result<IoManager> {
        let scheduler = Scheduler::with_stack_size(
            config.threads(),
            config.use_caller(),
            config.name(),
            config.stack_size(),
        )?;
        let timers = TimerManager::new();
        let reactor = Arc::new(Reactor::new()?);

        let handle = IoHandle {
            scheduler: Arc::downgrade(&scheduler),
            timers: Arc::downgrade(&timers),
            reactor: Arc::downgrade(&reactor),
        };

        timers.set_front_hook(Box::new({
            let handle = handle.clone();
            move || tickle_impl(&handle)
        }));

        let hook_workers = config.hook_enabled();
        scheduler.install_hooks(SchedulerHooks {
            tickle: Box::new({
                let handle = handle.clone();
                move || tickle_impl(&handle)
            }),
            stopping: Box::new({
                let handle = handle.clone();
                move || stopping_impl(&handle)
            }),
            idle: Arc::new({
                let handle = handle.clone();
                move || idle_loop(&handle)
            }),
            thread_start: Box::new({
                let handle = handle.clone();
                move || {
                    CURRENT_IO.with(|io| *io.borrow_mut() = Some(handle.clone()));
                    if hook_workers {
                        crate::hook::set_hook_enabled(true);
                    }
                }
            }),
        });

        // The constructing thread gets the handle too: it may schedule work,
        // and in caller mode it runs the drain loop during stop().
        CURRENT_IO.with(|io| *io.borrow_mut() = Some(handle));

        scheduler.start()?;
        debug!(
            "io manager {}: started ({} threads, caller={})",
            config.name(),
            config.threads(),
            config.use_caller()
        );
        Ok(IoManager {
            scheduler,
            timers,
            reactor,
            owner: true,
        })
    }

    /// The manager driving the calling thread, if this thread belongs to (or
    /// constructed) one.
    pub fn current() -> Option<IoManager> {
        let handle = CURRENT_IO.with(|io| io.borrow().clone())?;
        Some(IoManager {
            scheduler: handle.scheduler.upgrade()?,
            timers: handle.timers.upgrade()?,
            reactor: handle.reactor.upgrade()?,
            owner: false,
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Worker kernel tids, usable as pin targets.
    pub fn thread_ids(&self) -> Vec<i32> {
        self.scheduler.thread_ids()
    }

    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule(fiber);
    }

    pub fn schedule_on(&self, fiber: Arc<Fiber>, thread: i32) {
        self.scheduler.schedule_on(fiber, thread);
    }

    pub fn schedule_fn<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule_fn(func);
    }

    pub fn add_timer<F>(&self, ms: u64, func: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, func, recurring)
    }

    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        func: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, func, cond, recurring)
    }

    /// Register interest in `direction` on `fd`.
    ///
    /// With `func` the readiness resumes that function; without it the
    /// calling fiber is parked as the resumer (the caller must then
    /// [`Fiber::yield_hold`]).
    pub fn add_event(
        &self,
        fd: RawFd,
        direction: Event,
        func: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> io::Result<()> {
        let scheduler = Scheduler::current().unwrap_or_else(|| Arc::clone(&self.scheduler));
        self.reactor
            .add_event(fd, direction, func.map(Work::Func), &scheduler)
    }

    pub fn del_event(&self, fd: RawFd, direction: Event) -> bool {
        self.reactor.del_event(fd, direction)
    }

    pub fn cancel_event(&self, fd: RawFd, direction: Event) -> bool {
        self.reactor.cancel_event(fd, direction)
    }

    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    /// Registered (fd, direction) pairs.
    pub fn waiting_events(&self) -> usize {
        self.reactor.waiting_count()
    }

    /// Stop the pool: drain the queue, join the workers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if self.owner {
            self.stop();
        }
    }
}

fn tickle_impl(handle: &IoHandle) {
    let (Some(scheduler), Some(reactor)) = (handle.scheduler.upgrade(), handle.reactor.upgrade())
    else {
        return;
    };
    if scheduler.has_idle_threads() {
        reactor.tickle_write();
    }
}

fn stopping_impl(handle: &IoHandle) -> bool {
    let (Some(scheduler), Some(timers), Some(reactor)) = (
        handle.scheduler.upgrade(),
        handle.timers.upgrade(),
        handle.reactor.upgrade(),
    ) else {
        return true;
    };
    scheduler.stopping_base() && !timers.has_timers() && reactor.waiting_count() == 0
}

/// Body of the I/O manager's idle fiber: wait for readiness or timers, turn
/// both into scheduled work, yield back to the dispatch loop.
fn idle_loop(handle: &IoHandle) {
    trace!("io idle loop entered");
    let mut events: Vec<EpollEvent> = (0..MAX_EVENTS).map(|_| EpollEvent::empty()).collect();
    let mut expired: Vec<TimerCallback> = Vec::new();

    loop {
        let (Some(scheduler), Some(timers), Some(reactor)) = (
            handle.scheduler.upgrade(),
            handle.timers.upgrade(),
            handle.reactor.upgrade(),
        ) else {
            return;
        };
        if scheduler.stopping() {
            // Edge-triggered wakeups can coalesce; pass the shutdown signal
            // on so every parked peer notices promptly.
            reactor.tickle_write();
            debug!("io idle loop: stopping");
            return;
        }

        let timeout = timers
            .next_timer_ms()
            .map_or(MAX_TIMEOUT_MS, |next| next.min(MAX_TIMEOUT_MS));
        let ready = loop {
            match reactor.wait(&mut events, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!("epoll_wait failed: {}", errno);
                    break 0;
                }
            }
        };

        expired.clear();
        timers.list_expired(&mut expired);
        if !expired.is_empty() {
            trace!("scheduling {} timer callbacks", expired.len());
            scheduler.schedule_batch(expired.drain(..).map(|func| {
                Work::Func(Box::new(move || func()) as Box<dyn FnOnce() + Send>)
            }));
        }

        for event in &events[..ready] {
            let fd = event.data() as RawFd;
            if fd == reactor.tickle_fd {
                reactor.drain_tickle();
                continue;
            }
            reactor.dispatch_ready(fd, event.events());
        }

        // Release the strong handles before parking, so shutdown can tear
        // the runtime down while idle fibers are suspended.
        drop((scheduler, timers, reactor));
        Fiber::yield_hold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn timers_drive_scheduled_functions() {
        init_logs();
        let io = IoManager::new(2, false, "io-timer").unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        io.add_timer(
            20,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        let start = Instant::now();
        while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_timer_fires_repeatedly() {
        init_logs();
        let io = IoManager::new(1, false, "io-recur").unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let timer = io.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        let start = Instant::now();
        while hits.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(hits.load(Ordering::SeqCst) >= 3);
        assert!(timer.cancel());
    }

    #[test]
    fn pipe_readiness_resumes_a_parked_fiber() {
        init_logs();
        let io = IoManager::new(2, false, "io-pipe").unwrap();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        // The reactor is edge-triggered; the fd must be non-blocking.
        unsafe {
            let flags = libc::fcntl(rd, libc::F_GETFL, 0);
            libc::fcntl(rd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::spawn(move || {
            let io = IoManager::current().unwrap();
            io.add_event(rd, Event::READ, None).unwrap();
            Fiber::yield_hold();
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut _, buf.len()) };
            assert_eq!(n, 2);
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        io.schedule(fiber);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(io.waiting_events(), 1);
        assert_eq!(unsafe { libc::write(wr, b"hi".as_ptr() as *const _, 2) }, 2);

        let start = Instant::now();
        while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(io.waiting_events(), 0);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn cancel_event_resumes_without_readiness() {
        init_logs();
        let io = IoManager::new(2, false, "io-cancel").unwrap();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let rd = fds[0];

        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::spawn(move || {
            let io = IoManager::current().unwrap();
            io.add_event(rd, Event::READ, None).unwrap();
            Fiber::yield_hold();
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        io.schedule(fiber);

        std::thread::sleep(Duration::from_millis(50));
        assert!(io.cancel_event(rd, Event::READ));
        let start = Instant::now();
        while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(io.waiting_events(), 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn del_event_does_not_fire_the_waiter() {
        init_logs();
        let io = IoManager::new(1, false, "io-del").unwrap();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let rd = fds[0];

        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        io.schedule_fn({
            let io_fd = rd;
            move || {
                let io = IoManager::current().unwrap();
                io.add_event(
                    io_fd,
                    Event::READ,
                    Some(Box::new(move || {
                        h.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
            }
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(io.waiting_events(), 1);
        assert!(io.del_event(rd, Event::READ));
        assert_eq!(io.waiting_events(), 0);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
