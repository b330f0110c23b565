//! Scope guards for isolate entry.
//!
//! A [`ScopeGuard`] marks the calling thread as the single active thread of
//! an isolate for its lifetime; dropping it exits on every path (return,
//! `?`, unwinding). Guards are `!Send`, so exit always happens on the thread
//! that entered:
//!
//! ```compile_fail
//! let isolate = jsbridge::Isolate::new().unwrap();
//! let scope = isolate.enter().unwrap();
//! std::thread::spawn(move || drop(scope));
//! ```
//!
//! A [`Locker`] additionally takes the process-wide reentrant lock first,
//! for hosts that serialize all engine work behind one lock. Lock order is
//! always global lock, then isolate.
//!
//! ```compile_fail
//! let isolate = jsbridge::Isolate::new().unwrap();
//! let locker = jsbridge::Locker::new(&isolate).unwrap();
//! std::thread::spawn(move || drop(locker));
//! ```

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, const_reentrant_mutex};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};
use crate::isolate::{Acquire, Isolate, IsolateInner};

/// Proof that the current thread is inside an isolate.
#[must_use = "the isolate is exited as soon as the guard is dropped"]
pub struct ScopeGuard {
    isolate: Arc<IsolateInner>,
    _not_send: PhantomData<*mut ()>,
}

impl ScopeGuard {
    pub(crate) fn enter(isolate: &Arc<IsolateInner>) -> BridgeResult<Self> {
        Self::acquire(isolate, Acquire::Policy)
    }

    pub(crate) fn try_enter(isolate: &Arc<IsolateInner>) -> BridgeResult<Self> {
        Self::acquire(isolate, Acquire::NonBlocking)
    }

    fn acquire(isolate: &Arc<IsolateInner>, mode: Acquire) -> BridgeResult<Self> {
        isolate.acquire(mode)?;
        Ok(Self {
            isolate: Arc::clone(isolate),
            _not_send: PhantomData,
        })
    }

    /// The isolate this guard holds.
    pub fn isolate(&self) -> Isolate {
        Isolate::from_inner(Arc::clone(&self.isolate))
    }

    /// Entry depth of this thread, including this guard.
    pub fn depth(&self) -> usize {
        self.isolate.entry_depth()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.isolate.release();
    }
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("isolate", &self.isolate.id())
            .field("depth", &self.isolate.entry_depth())
            .finish()
    }
}

static GLOBAL_LOCK: ReentrantMutex<()> = const_reentrant_mutex(());

thread_local! {
    static LOCK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Global lock plus isolate entry.
///
/// Fields drop in declaration order: the isolate is exited before the
/// global lock is released.
#[must_use = "the isolate is exited as soon as the locker is dropped"]
pub struct Locker {
    scope: ScopeGuard,
    _global: ReentrantMutexGuard<'static, ()>,
    _depth: LockDepth,
}

struct LockDepth;

impl LockDepth {
    fn new() -> Self {
        LOCK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for LockDepth {
    fn drop(&mut self) {
        LOCK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl Locker {
    /// Take the global lock (blocking), then enter `isolate` following its
    /// entry policy.
    pub fn new(isolate: &Isolate) -> BridgeResult<Self> {
        let global = GLOBAL_LOCK.lock();
        let depth = LockDepth::new();
        let scope = ScopeGuard::enter(&isolate.inner)?;
        Ok(Self {
            scope,
            _global: global,
            _depth: depth,
        })
    }

    /// Like [`Locker::new`] but never blocks; reports `Contention` if either
    /// the global lock or the isolate is held elsewhere.
    pub fn try_new(isolate: &Isolate) -> BridgeResult<Self> {
        let global = GLOBAL_LOCK.try_lock().ok_or(BridgeError::Contention)?;
        let depth = LockDepth::new();
        let scope = ScopeGuard::try_enter(&isolate.inner)?;
        Ok(Self {
            scope,
            _global: global,
            _depth: depth,
        })
    }

    /// Whether some thread holds the global lock.
    pub fn is_locked() -> bool {
        GLOBAL_LOCK.is_locked()
    }

    /// Whether the calling thread holds the global lock.
    pub fn is_held_by_current_thread() -> bool {
        LOCK_DEPTH.with(|depth| depth.get() > 0)
    }

    pub fn scope(&self) -> &ScopeGuard {
        &self.scope
    }

    pub fn isolate(&self) -> Isolate {
        self.scope.isolate()
    }
}

impl fmt::Debug for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker").field("scope", &self.scope).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_guard_reports_depth() {
        let isolate = Isolate::new().unwrap();
        let outer = isolate.enter().unwrap();
        assert_eq!(outer.depth(), 1);
        let inner = isolate.try_enter().unwrap();
        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.isolate(), isolate);
        drop(inner);
        drop(outer);
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_guard_exits_on_unwind() {
        let isolate = Isolate::new().unwrap();
        let inner = isolate.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scope = inner.enter().unwrap();
            panic!("inside scope");
        }));
        assert!(result.is_err());
        assert_eq!(isolate.entry_depth(), 0);
        assert!(!isolate.is_entered());
        isolate.dispose().unwrap();
    }

    #[test]
    #[serial]
    fn test_locker_is_reentrant() {
        let isolate = Isolate::new().unwrap();
        assert!(!Locker::is_held_by_current_thread());
        {
            let outer = Locker::new(&isolate).unwrap();
            assert!(Locker::is_locked());
            assert!(Locker::is_held_by_current_thread());
            let inner = Locker::try_new(&isolate).unwrap();
            assert_eq!(inner.scope().depth(), 2);
            drop(inner);
            assert_eq!(outer.scope().depth(), 1);
        }
        assert!(!Locker::is_held_by_current_thread());
        assert_eq!(isolate.entry_depth(), 0);
        isolate.dispose().unwrap();
    }

    #[test]
    #[serial]
    fn test_locker_try_new_contention() {
        let isolate = Isolate::new().unwrap();
        let locker = Locker::new(&isolate).unwrap();
        let other = isolate.clone();
        let result = std::thread::spawn(move || Locker::try_new(&other).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Contention)));
        drop(locker);
        isolate.dispose().unwrap();
    }
}
