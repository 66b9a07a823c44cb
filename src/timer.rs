//! Deadline-ordered timer set.
//!
//! Timers live in a `BTreeMap` keyed by `(absolute deadline ms, identity)`,
//! which gives the strict weak order the expiry scan relies on: earliest
//! deadline first, ties broken by the timer's address. A latch tracks
//! whether an insert landed at the front of the set so the owner (the I/O
//! manager) can shorten an in-flight epoll wait exactly once per front
//! insert.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::trace;

use crate::sync::{Mutex, RwLock};
use crate::util;

/// A clock that jumps backwards by more than this between two expiry scans
/// is treated as rolled over and every pending timer fires.
const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Callback stored in a timer. `Arc` so recurring timers can hand the same
/// callback out on every expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

type TimerKey = (u64, usize);

struct TimerInner {
    /// Absolute deadline in [`util::current_ms`] time.
    deadline: u64,
    /// Relative period backing `refresh`/recurrence.
    period: u64,
    recurring: bool,
    /// Cleared on cancellation and on one-shot expiry.
    func: Option<TimerCallback>,
}

/// A handle to a pending timer. Shared between the set and the caller;
/// cancel/refresh/reset reach the set entry through the manager
/// back-reference.
pub struct Timer {
    inner: Mutex<TimerInner>,
    manager: Weak<TimerManager>,
    /// Back-reference to the owning `Arc`, for re-inserting from `&self`.
    self_weak: Weak<Timer>,
}

impl Timer {
    fn key(&self, deadline: u64) -> TimerKey {
        (deadline, self as *const Timer as usize)
    }

    /// Remove the timer from the set and clear its callback. Returns false
    /// if it was already cancelled.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write();
        let mut inner = self.inner.lock();
        if inner.func.is_none() {
            return false;
        }
        inner.func = None;
        timers.remove(&self.key(inner.deadline));
        trace!("timer cancelled");
        true
    }

    /// Push the deadline out to now + period. Returns false if cancelled or
    /// no longer in the set.
    pub fn refresh(&self) -> bool {
        let (Some(manager), Some(this)) = (self.manager.upgrade(), self.self_weak.upgrade())
        else {
            return false;
        };
        let mut timers = manager.timers.write();
        let mut inner = self.inner.lock();
        if inner.func.is_none() {
            return false;
        }
        if timers.remove(&self.key(inner.deadline)).is_none() {
            return false;
        }
        inner.deadline = util::current_ms() + inner.period;
        timers.insert(self.key(inner.deadline), this);
        true
    }

    /// Change the period and recompute the deadline, relative to now
    /// (`from_now`) or to the original start. Re-runs the front-insert latch
    /// so a shortened deadline can wake the epoll wait.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let (Some(manager), Some(this)) = (self.manager.upgrade(), self.self_weak.upgrade())
        else {
            return false;
        };
        {
            let inner = self.inner.lock();
            if ms == inner.period && !from_now {
                return true;
            }
        }
        let at_front = {
            let mut timers = manager.timers.write();
            let mut inner = self.inner.lock();
            if inner.func.is_none() {
                return false;
            }
            if timers.remove(&self.key(inner.deadline)).is_none() {
                return false;
            }
            let start = if from_now {
                util::current_ms()
            } else {
                inner.deadline.saturating_sub(inner.period)
            };
            inner.period = ms;
            inner.deadline = start + ms;
            let key = self.key(inner.deadline);
            timers.insert(key, this);
            *timers.keys().next().expect("set cannot be empty here") == key
        };
        if at_front {
            manager.latch_and_notify();
        }
        true
    }
}

/// The ordered timer set.
pub struct TimerManager {
    timers: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    /// Back-reference to the owning `Arc`, handed to timers as their
    /// manager link.
    self_weak: Weak<TimerManager>,
    /// Set when a front insert has already requested a wakeup; cleared when
    /// the owner reads the next deadline.
    tickled: AtomicBool,
    /// Last `now` observed by the expiry scan, for rollover detection.
    previous_time: Mutex<u64>,
    /// Invoked (outside the set lock) when an insert lands at the front and
    /// the latch was clear.
    front_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new_cyclic(|weak| TimerManager {
            timers: RwLock::new(BTreeMap::new()),
            self_weak: weak.clone(),
            tickled: AtomicBool::new(false),
            previous_time: Mutex::new(util::current_ms()),
            front_hook: OnceLock::new(),
        })
    }

    pub(crate) fn set_front_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        if self.front_hook.set(hook).is_err() {
            panic!("timer front hook installed twice");
        }
    }

    /// Insert a timer firing `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: u64, func: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_callback(ms, Arc::new(func), recurring)
    }

    pub(crate) fn add_timer_callback(
        &self,
        ms: u64,
        func: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = Arc::new_cyclic(|weak| Timer {
            inner: Mutex::new(TimerInner {
                deadline: util::current_ms() + ms,
                period: ms,
                recurring,
                func: Some(func),
            }),
            manager: self.self_weak.clone(),
            self_weak: weak.clone(),
        });
        let at_front = {
            let mut timers = self.timers.write();
            let key = timer.key(timer.inner.lock().deadline);
            timers.insert(key, Arc::clone(&timer));
            *timers.keys().next().expect("set cannot be empty here") == key
        };
        if at_front {
            self.latch_and_notify();
        }
        timer
    }

    /// Insert a timer whose callback only runs if `cond` still resolves to a
    /// live referent at fire time.
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
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    func();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: `Some(0)` if already due,
    /// `None` if the set is empty. Clears the front-insert latch.
    pub fn next_timer_ms(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::SeqCst);
        let timers = self.timers.read();
        let (&(deadline, _), _) = timers.iter().next()?;
        Some(deadline.saturating_sub(util::current_ms()))
    }

    /// Extract the callbacks of every timer due at or before now, re-arming
    /// recurring ones. Under detected clock rollover every pending timer is
    /// due.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        self.list_expired_at(util::current_ms(), out);
    }

    pub(crate) fn list_expired_at(&self, now: u64, out: &mut Vec<TimerCallback>) {
        {
            let timers = self.timers.read();
            if timers.is_empty() {
                return;
            }
        }
        let mut timers = self.timers.write();
        if timers.is_empty() {
            return;
        }
        let rollover = self.detect_rollover(now);
        if !rollover
            && timers
                .keys()
                .next()
                .map_or(true, |&(deadline, _)| deadline > now)
        {
            return;
        }

        let expired = if rollover {
            mem::take(&mut *timers)
        } else {
            // Everything strictly below (now + 1, 0) has deadline <= now.
            let rest = timers.split_off(&(now + 1, 0));
            mem::replace(&mut *timers, rest)
        };
        trace!("{} timers expired", expired.len());

        out.reserve(expired.len());
        for (_, timer) in expired {
            let mut inner = timer.inner.lock();
            let Some(func) = inner.func.clone() else {
                continue;
            };
            out.push(func);
            if inner.recurring {
                inner.deadline = now + inner.period;
                let key = (inner.deadline, Arc::as_ptr(&timer) as usize);
                drop(inner);
                timers.insert(key, timer);
            } else {
                inner.func = None;
            }
        }
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.read().is_empty()
    }

    fn detect_rollover(&self, now: u64) -> bool {
        let mut previous = self.previous_time.lock();
        let rolled = now < *previous && now < previous.saturating_sub(CLOCK_ROLLOVER_MS);
        *previous = now;
        rolled
    }

    /// Set the latch and fire the front hook if the latch was clear.
    fn latch_and_notify(&self) {
        if !self.tickled.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.front_hook.get() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn drain(mgr: &Arc<TimerManager>, now: u64) -> usize {
        let mut out = Vec::new();
        mgr.list_expired_at(now, &mut out);
        let n = out.len();
        for f in out {
            f();
        }
        n
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = Arc::clone(&order);
            mgr.add_timer(
                ms,
                move || {
                    order.lock().push(ms);
                },
                false,
            );
        }
        let now = util::current_ms();
        let mut out = Vec::new();
        mgr.list_expired_at(now + 100, &mut out);
        for f in &out {
            f();
        }
        assert_eq!(*order.lock(), vec![10, 20, 30]);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let timer = mgr.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(timer.cancel());
        assert!(!timer.cancel(), "second cancel reports false");
        assert_eq!(drain(&mgr, util::current_ms() + 100), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timers_rearm() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        mgr.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        let now = util::current_ms();
        assert_eq!(drain(&mgr, now + 15), 1);
        assert!(mgr.has_timers(), "recurring timer went back into the set");
        assert_eq!(drain(&mgr, now + 30), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn refresh_pushes_the_deadline_out() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(50, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.refresh());
        let next = mgr.next_timer_ms().unwrap();
        assert!(next > 45, "deadline was recomputed from now, got {}", next);
    }

    #[test]
    fn reset_reenters_the_front_latch() {
        let mgr = TimerManager::new();
        let _far = mgr.add_timer(10_000, || {}, false);
        let timer = mgr.add_timer(20_000, || {}, false);
        // Consume the latch so the next front insert is observable.
        let _ = mgr.next_timer_ms();
        assert!(timer.reset(5, true));
        assert!(mgr.next_timer_ms().unwrap() <= 5);
    }

    #[test]
    fn conditional_timer_respects_a_dead_observer() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicU32::new(0));

        let live = Arc::new(());
        let h = Arc::clone(&hits);
        mgr.add_condition_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&live),
            false,
        );

        let dead = Arc::new(());
        let dead_weak = Arc::downgrade(&dead);
        drop(dead);
        let h = Arc::clone(&hits);
        mgr.add_condition_timer(
            10,
            move || {
                h.fetch_add(100, Ordering::SeqCst);
            },
            dead_weak,
            false,
        );

        assert_eq!(drain(&mgr, util::current_ms() + 50), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clock_rollover_expires_everything() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            mgr.add_timer(
                100_000_000,
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                false,
            );
        }
        let now = util::current_ms();
        // Advance the observed clock, then jump it back by over an hour.
        assert_eq!(drain(&mgr, now + CLOCK_ROLLOVER_MS + 500_000), 0);
        assert_eq!(drain(&mgr, now), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn small_backwards_steps_are_not_rollover() {
        let mgr = TimerManager::new();
        mgr.add_timer(1_000_000, || {}, false);
        let now = util::current_ms();
        assert_eq!(drain(&mgr, now + 10_000), 0);
        assert_eq!(drain(&mgr, now + 5_000), 0);
        assert!(mgr.has_timers());
    }

    #[test]
    fn next_timer_ms_reports_zero_for_due_timers() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), None);
        mgr.add_timer(0, || {}, false);
        assert_eq!(mgr.next_timer_ms(), Some(0));
    }
}
