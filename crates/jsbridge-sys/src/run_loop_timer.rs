//! Run-loop timer symbols for statically linked bun-webkit.
//!
//! WTF's `RunLoop` delegates timer scheduling to the embedder through the
//! `WTFTimer__*` C functions. JSC uses these for deferred GC work and the
//! watchdog, so they have to exist even though the bridge never runs a run
//! loop of its own. Timers fire on one shared background thread.
//!
//! Every `update` and `cancel` bumps the timer's generation; a scheduled
//! firing whose generation no longer matches is discarded, so a rescheduled
//! timer never fires twice.

#![allow(non_snake_case)]

use std::collections::BinaryHeap;
use std::cmp::Ordering as CmpOrdering;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

type TimerCallback = unsafe extern "C" fn(*mut c_void);

struct TimerState {
    callback: TimerCallback,
    user_data: *mut c_void,
    generation: AtomicU64,
    active: AtomicBool,
    repeat: AtomicBool,
    interval_nanos: AtomicU64,
    deadline: Mutex<Option<Instant>>,
}

// SAFETY: `user_data` belongs to WTF, which only hands out pointers that may
// be used from the timer thread.
unsafe impl Send for TimerState {}
unsafe impl Sync for TimerState {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opaque handle returned to WTF.
pub struct RunLoopTimer {
    state: Arc<TimerState>,
}

impl RunLoopTimer {
    fn schedule(&self, delay: Duration, repeat: bool) {
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let deadline = Instant::now() + delay;
        *lock(&self.state.deadline) = Some(deadline);
        self.state
            .interval_nanos
            .store(u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX), Ordering::Release);
        self.state.repeat.store(repeat, Ordering::Release);
        self.state.active.store(true, Ordering::Release);
        scheduler().push(Pending {
            deadline,
            generation,
            state: Arc::clone(&self.state),
        });
    }

    fn cancel(&self) {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        self.state.active.store(false, Ordering::Release);
        *lock(&self.state.deadline) = None;
    }

    fn seconds_remaining(&self) -> f64 {
        match *lock(&self.state.deadline) {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .as_secs_f64(),
            None => f64::INFINITY,
        }
    }
}

struct Pending {
    deadline: Instant,
    generation: u64,
    state: Arc<TimerState>,
}

impl Pending {
    fn is_current(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
            && self.state.generation.load(Ordering::Acquire) == self.generation
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Earliest deadline on top of the max-heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

struct Scheduler {
    queue: Mutex<BinaryHeap<Pending>>,
    wakeup: Condvar,
}

impl Scheduler {
    fn push(&self, pending: Pending) {
        lock(&self.queue).push(pending);
        self.wakeup.notify_one();
    }

    fn next_due(&self) -> Pending {
        let mut queue = lock(&self.queue);
        loop {
            let now = Instant::now();
            let wait = match queue.peek() {
                Some(next) if !next.is_current() => {
                    queue.pop();
                    continue;
                }
                Some(next) if next.deadline <= now => {
                    if let Some(due) = queue.pop() {
                        return due;
                    }
                    continue;
                }
                Some(next) => Some(next.deadline - now),
                None => None,
            };
            queue = match wait {
                Some(timeout) => {
                    self.wakeup
                        .wait_timeout(queue, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

fn scheduler() -> &'static Scheduler {
    static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();
    SCHEDULER.get_or_init(|| {
        // If the thread cannot start, timers simply never fire; JSC treats
        // them as hints.
        let _ = thread::Builder::new()
            .name("jsbridge-runloop-timer".into())
            .spawn(|| loop {
                let due = scheduler().next_due();
                fire(due);
            });
        Scheduler {
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
        }
    })
}

fn fire(due: Pending) {
    // SAFETY: WTF guarantees the callback and its data outlive the timer,
    // and `deinit` cancels before freeing.
    unsafe { (due.state.callback)(due.state.user_data) };

    if !due.is_current() {
        return;
    }
    if due.state.repeat.load(Ordering::Acquire) {
        let interval = Duration::from_nanos(due.state.interval_nanos.load(Ordering::Acquire));
        let deadline = Instant::now() + interval;
        *lock(&due.state.deadline) = Some(deadline);
        scheduler().push(Pending {
            deadline,
            generation: due.generation,
            state: due.state,
        });
    } else {
        due.state.active.store(false, Ordering::Release);
        *lock(&due.state.deadline) = None;
    }
}

/// # Safety
/// `callback` must stay callable with `user_data` until `WTFTimer__deinit`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WTFTimer__create(
    callback: TimerCallback,
    user_data: *mut c_void,
) -> *mut RunLoopTimer {
    Box::into_raw(Box::new(RunLoopTimer {
        state: Arc::new(TimerState {
            callback,
            user_data,
            generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
            repeat: AtomicBool::new(false),
            interval_nanos: AtomicU64::new(0),
            deadline: Mutex::new(None),
        }),
    }))
}

/// # Safety
/// `timer` must come from `WTFTimer__create` and not be freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WTFTimer__update(timer: *mut RunLoopTimer, seconds: f64, repeat: bool) {
    // SAFETY: caller contract.
    if let Some(timer) = unsafe { timer.as_ref() } {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        timer.schedule(Duration::from_secs_f64(seconds), repeat);
    }
}

/// # Safety
/// `timer` must come from `WTFTimer__create` and not be freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WTFTimer__cancel(timer: *mut RunLoopTimer) {
    // SAFETY: caller contract.
    if let Some(timer) = unsafe { timer.as_ref() } {
        timer.cancel();
    }
}

/// # Safety
/// `timer` must come from `WTFTimer__create` and not be freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WTFTimer__isActive(timer: *const RunLoopTimer) -> bool {
    // SAFETY: caller contract.
    unsafe { timer.as_ref() }.is_some_and(|timer| timer.state.active.load(Ordering::Acquire))
}

/// # Safety
/// `timer` must come from `WTFTimer__create` and not be freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WTFTimer__secondsUntilTimer(timer: *const RunLoopTimer) -> f64 {
    // SAFETY: caller contract.
    unsafe { timer.as_ref() }.map_or(f64::INFINITY, RunLoopTimer::seconds_remaining)
}

/// # Safety
/// `timer` must come from `WTFTimer__create`; it is freed here.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WTFTimer__deinit(timer: *mut RunLoopTimer) {
    if timer.is_null() {
        return;
    }
    // SAFETY: pointer came from Box::into_raw in WTFTimer__create.
    let timer = unsafe { Box::from_raw(timer) };
    timer.cancel();
}

/// Timers fire on the scheduler thread, so there is never an imminent one to
/// run inline.
#[unsafe(no_mangle)]
pub extern "C" fn WTFTimer__runIfImminent() {}
