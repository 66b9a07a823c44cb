//! Stackful fibers.
//!
//! A [`Fiber`] is a user-space execution context with its own stack. It is
//! created suspended, resumed by a scheduler thread with [`Fiber::swap_in`],
//! and gives the CPU back either by finishing or through one of the two
//! cooperative yields:
//!
//! - [`Fiber::yield_ready`] — "re-enqueue me": the fiber leaves in state
//!   [`State::Ready`] and the dispatch loop puts it straight back on the
//!   ready queue.
//! - [`Fiber::yield_hold`] — "park me": the fiber suspends still marked
//!   [`State::Exec`]; the dispatch loop demotes it to [`State::Hold`] and it
//!   stays off the queue until some external event (readiness, timer,
//!   cancellation) schedules it again.
//!
//! The machine-context switch is carried by corosensei. A resumed fiber
//! stores a pointer to its `Yielder` in a thread-local so that a yield from
//! anywhere inside the fiber body (the hook layer, user code) can suspend
//! without threading the yielder through every call.

use std::cell::{Cell, RefCell};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use log::{error, trace};

use crate::sync::Mutex;

/// Default fiber stack size.
///
/// Stacks are virtual allocations and commit lazily, so tens of thousands of
/// fibers at 64 KiB each are fine on 64-bit hosts.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Degenerate fiber standing in for this thread's native stack.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Type-erased pointer to the running fiber's `Yielder`.
    ///
    /// Valid only while a fiber body is on the CPU; reinstalled after every
    /// resume because another fiber may have run on this thread in between.
    static YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// Execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created or reset, never resumed since.
    Init = 0,
    /// Runnable, waiting in (or headed for) a ready queue.
    Ready = 1,
    /// Parked until an external event schedules it.
    Hold = 2,
    /// On the CPU of exactly one thread.
    Exec = 3,
    /// Body returned.
    Term = 4,
    /// Body panicked.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Hold,
            3 => State::Exec,
            4 => State::Term,
            _ => State::Except,
        }
    }
}

type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// The saved machine context.
///
/// A suspended corosensei coroutine is moved between worker threads inside
/// this wrapper. Safety rests on the Exec-state protocol: the dispatch scan
/// skips fibers observed in [`State::Exec`] and `swap_in` asserts it, so at
/// most one thread ever resumes a given context, and a context is only moved
/// while fully suspended.
struct FiberContext(Coroutine<(), (), ()>);

unsafe impl Send for FiberContext {}

/// A stackful coroutine.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    state: AtomicU8,
    func: Mutex<Option<FiberFn>>,
    ctx: Mutex<Option<FiberContext>>,
    /// Back-reference to the owning `Arc`, for handing `current()` and the
    /// trampoline a strong handle from `&self` methods.
    self_weak: Weak<Fiber>,
}

impl Fiber {
    /// Spawn a fiber in state [`State::Init`] with the default stack size.
    pub fn spawn<F>(func: F) -> io::Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::new(func, DEFAULT_STACK_SIZE)
    }

    /// Spawn a fiber in state [`State::Init`] with an explicit stack size.
    pub fn new<F>(func: F, stack_size: usize) -> io::Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::new_boxed(Box::new(func), stack_size)
    }

    pub(crate) fn new_boxed(func: FiberFn, stack_size: usize) -> io::Result<Arc<Fiber>> {
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            state: AtomicU8::new(State::Init as u8),
            func: Mutex::new(Some(func)),
            ctx: Mutex::new(None),
            self_weak: weak.clone(),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::SeqCst);
        let ctx = Fiber::make_context(fiber.self_weak.clone(), stack_size)?;
        *fiber.ctx.lock() = Some(ctx);
        trace!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// The bootstrap fiber representing a thread's native stack. It owns no
    /// stack and no context; it exists so `current()` has an answer while the
    /// dispatch loop itself is on the CPU.
    fn bootstrap() -> Arc<Fiber> {
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            state: AtomicU8::new(State::Exec as u8),
            func: Mutex::new(None),
            ctx: Mutex::new(None),
            self_weak: weak.clone(),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::SeqCst);
        trace!("fiber {} created (thread bootstrap)", fiber.id);
        fiber
    }

    /// Strong handle to this fiber; valid while any `Arc` is alive, which
    /// every caller of an `&self` method necessarily guarantees.
    fn handle(&self) -> Arc<Fiber> {
        self.self_weak.upgrade().expect("fiber outlived its Arc")
    }

    fn make_context(weak: Weak<Fiber>, stack_size: usize) -> io::Result<FiberContext> {
        let stack = DefaultStack::new(stack_size)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let co = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            YIELDER.with(|y| y.set(Some(yielder as *const Yielder<(), ()> as *const ())));

            let Some(fiber) = weak.upgrade() else { return };
            let func = fiber.func.lock().take();
            match func {
                Some(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(()) => {
                        trace!("fiber {} finished", fiber.id);
                        fiber.set_state(State::Term);
                    }
                    Err(_) => {
                        error!("fiber {} panicked", fiber.id);
                        fiber.set_state(State::Except);
                    }
                },
                None => fiber.set_state(State::Term),
            }
            // Returning here is the swap back to the resuming thread; nothing
            // may run after the state is finalized.
        });
        Ok(FiberContext(co))
    }

    /// Re-arm a finished (or never-started) fiber with a new body.
    ///
    /// Legal only in Init/Term/Except and only for fibers that own a stack.
    pub fn reset<F>(&self, func: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(func))
    }

    pub(crate) fn reset_boxed(&self, func: FiberFn) -> io::Result<()> {
        let mut ctx = self.ctx.lock();
        assert!(ctx.is_some(), "cannot reset a fiber without its own stack");
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "cannot reset fiber {} in state {:?}",
            self.id,
            state
        );
        *self.func.lock() = Some(func);
        *ctx = Some(Fiber::make_context(self.self_weak.clone(), self.stack_size)?);
        self.set_state(State::Init);
        Ok(())
    }

    /// Resume this fiber on the calling thread.
    ///
    /// Returns once the fiber suspends or finishes; on return the caller's
    /// previous current-fiber pointer is restored.
    pub(crate) fn swap_in(&self) {
        let state = self.state();
        assert_ne!(state, State::Exec, "fiber {} is already running", self.id);

        let prev = CURRENT.with(|c| c.borrow_mut().replace(self.handle()));
        self.set_state(State::Exec);
        trace!("fiber {} resumed", self.id);

        let result = {
            let mut ctx = self.ctx.lock();
            let ctx = ctx.as_mut().expect("fiber has no saved context");
            ctx.0.resume(())
        };

        YIELDER.with(|y| y.set(None));
        CURRENT.with(|c| *c.borrow_mut() = prev);

        if let CoroutineResult::Return(()) = result {
            debug_assert!(
                matches!(self.state(), State::Term | State::Except),
                "fiber {} returned in state {:?}",
                self.id,
                self.state()
            );
        }
    }

    /// Suspend the current fiber, leaving it runnable: the dispatch loop
    /// re-enqueues it (keeping its pin) before picking other work.
    pub fn yield_ready() {
        let cur = Fiber::current().expect("yield_ready called outside of a fiber");
        debug_assert_eq!(cur.state(), State::Exec);
        trace!("fiber {} yields (ready)", cur.id);
        cur.set_state(State::Ready);
        drop(cur);
        suspend();
    }

    /// Suspend the current fiber and park it: it stays off the ready queue
    /// until readiness, a timer or a cancellation schedules it again.
    pub fn yield_hold() {
        let cur = Fiber::current().expect("yield_hold called outside of a fiber");
        debug_assert_eq!(cur.state(), State::Exec);
        trace!("fiber {} yields (hold)", cur.id);
        drop(cur);
        suspend();
    }

    /// The fiber currently executing on this thread, if any.
    pub fn current() -> Option<Arc<Fiber>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Number of fibers alive in the process, bootstrap fibers included.
    pub fn total() -> usize {
        LIVE_FIBERS.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.ctx.get_mut().is_some() {
            let state = self.state();
            debug_assert!(
                matches!(state, State::Init | State::Term | State::Except),
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        }
        let left = LIVE_FIBERS.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!("fiber {} dropped, {} live", self.id, left);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Switch from the running fiber back to the thread that resumed it.
fn suspend() {
    YIELDER.with(|y| {
        let ptr = y.get().expect("suspend called outside of a fiber");
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        // Reinstall: another fiber may have run here while we were parked.
        y.set(Some(ptr));
    });
}

/// Whether the caller is inside a resumable fiber body (as opposed to a
/// thread's bootstrap context, which cannot suspend).
pub(crate) fn in_fiber() -> bool {
    YIELDER.with(|y| y.get().is_some())
}

/// Install this thread's bootstrap fiber and make it current.
///
/// Called once per dispatch thread before any fiber is resumed.
pub(crate) fn init_thread() -> Arc<Fiber> {
    THREAD_FIBER.with(|t| {
        let mut t = t.borrow_mut();
        if let Some(f) = t.as_ref() {
            return Arc::clone(f);
        }
        let fiber = Fiber::bootstrap();
        *t = Some(Arc::clone(&fiber));
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&fiber)));
        fiber
    })
}

/// Drop this thread's bootstrap fiber; called when a dispatch thread exits.
pub(crate) fn clear_thread() {
    CURRENT.with(|c| c.borrow_mut().take());
    THREAD_FIBER.with(|t| t.borrow_mut().take());
}
