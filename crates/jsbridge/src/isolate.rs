//! Isolates: independent engine heaps.
//!
//! An [`Isolate`] owns one JSC context group, its default [`Context`], the
//! release queue for host references, the host-function registry and the
//! termination flag. Entry is exclusive per thread and reentrant; see
//! [`ScopeGuard`](crate::ScopeGuard).

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use jsbridge_sys::*;
use parking_lot::{Condvar, Mutex};
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::EntryPolicy;
use crate::context::{Context, ContextId, ContextInner};
use crate::engine::{Engine, EngineInner};
use crate::error::{BridgeError, BridgeResult};
use crate::exception;
use crate::function::HostFunction;
use crate::refs::{ReferenceTable, RootKey};
use crate::scope::ScopeGuard;

/// Unique identifier of an isolate within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(pub(crate) u64);

impl IsolateId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "isolate-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct EntryState {
    pub owner: Option<ThreadId>,
    pub depth: usize,
}

/// A host error thrown into script and not yet observed by a boundary.
struct PendingHostError {
    handle: usize,
    function: String,
    cause: anyhow::Error,
}

/// How `acquire` behaves when another thread owns the isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    Policy,
    NonBlocking,
}

pub(crate) struct IsolateInner {
    id: IsolateId,
    engine: Arc<EngineInner>,
    group: JSContextGroupRef,
    default_context: Arc<ContextInner>,
    contexts: DashMap<ContextId, Arc<ContextInner>>,

    entry: Mutex<EntryState>,
    entry_released: Condvar,
    policy: EntryPolicy,
    entry_timeout: Option<Duration>,
    disposed: AtomicBool,

    terminate: AtomicBool,
    termination_poll: f64,
    hastened: AtomicBool,
    script_depth: AtomicUsize,

    release_tx: Sender<RootKey>,
    release_rx: Receiver<RootKey>,

    pub(crate) functions: DashMap<u64, HostFunction>,
    next_function_id: AtomicU64,
    /// Weak map per context from host function to its live engine wrapper.
    callback_cache: DashMap<ContextId, usize>,
    host_errors: Mutex<Vec<PendingHostError>>,
}

// SAFETY: the raw group and context pointers are only passed to the engine
// by the thread that currently owns the isolate's entry state.
unsafe impl Send for IsolateInner {}
unsafe impl Sync for IsolateInner {}

/// Watchdog interval while a termination is being forced through script.
const HASTENED_POLL_SECS: f64 = 0.000_1;

unsafe extern "C" fn callback_map_destroyed(_map: JSWeakObjectMapRef, _data: *mut c_void) {}

unsafe extern "C" fn should_terminate(_ctx: JSContextRef, flag: *mut c_void) -> bool {
    if flag.is_null() {
        return false;
    }
    // SAFETY: `flag` points at IsolateInner::terminate, and the time limit is
    // cleared before the isolate is torn down.
    let flag = unsafe { &*(flag as *const AtomicBool) };
    flag.load(Ordering::Acquire)
}

impl IsolateInner {
    pub(crate) fn create(engine: &Arc<EngineInner>) -> BridgeResult<Arc<Self>> {
        let config = engine.config();
        // SAFETY: plain constructors; results checked for null below.
        let group = unsafe { JSContextGroupCreate() };
        if group.is_null() {
            return Err(BridgeError::allocation("JSContextGroupCreate"));
        }
        let raw_ctx = unsafe { JSGlobalContextCreateInGroup(group, std::ptr::null_mut()) };
        if raw_ctx.is_null() {
            unsafe { JSContextGroupRelease(group) };
            return Err(BridgeError::allocation("JSGlobalContextCreateInGroup"));
        }

        let id = engine.next_isolate_id();
        let context_id = engine.next_context_id();
        let (release_tx, release_rx) = unbounded();

        let inner = Arc::new_cyclic(|weak: &Weak<IsolateInner>| {
            let default_context = Arc::new(ContextInner::new(context_id, weak.clone(), raw_ctx, true));
            let contexts = DashMap::new();
            contexts.insert(context_id, Arc::clone(&default_context));
            IsolateInner {
                id,
                engine: Arc::clone(engine),
                group,
                default_context,
                contexts,
                entry: Mutex::new(EntryState::default()),
                entry_released: Condvar::new(),
                policy: config.entry_policy,
                entry_timeout: config.entry_timeout_duration(),
                disposed: AtomicBool::new(false),
                terminate: AtomicBool::new(false),
                termination_poll: config.termination_poll_secs(),
                hastened: AtomicBool::new(false),
                script_depth: AtomicUsize::new(0),
                release_tx,
                release_rx,
                functions: DashMap::new(),
                next_function_id: AtomicU64::new(1),
                callback_cache: DashMap::new(),
                host_errors: Mutex::new(Vec::new()),
            }
        });

        inner.arm_watchdog(inner.termination_poll);

        debug!(isolate = %id, context = %context_id, "isolate created");
        Ok(inner)
    }

    pub(crate) fn id(&self) -> IsolateId {
        self.id
    }

    pub(crate) fn engine(&self) -> &Arc<EngineInner> {
        &self.engine
    }

    pub(crate) fn refs(&self) -> &ReferenceTable {
        self.engine.refs()
    }

    pub(crate) fn max_depth(&self) -> usize {
        self.engine.config().max_conversion_depth
    }

    pub(crate) fn max_array_length(&self) -> u32 {
        self.engine.config().max_array_length
    }

    /// Raw default context, usable for any value of this isolate.
    pub(crate) fn default_raw(&self) -> JSContextRef {
        self.default_context.raw()
    }

    pub(crate) fn default_context(&self) -> &Arc<ContextInner> {
        &self.default_context
    }

    pub(crate) fn context(&self, id: ContextId) -> Option<Arc<ContextInner>> {
        self.contexts.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// The open context behind an engine-supplied `ctx`, falling back to
    /// the default context. Caller must own the isolate.
    pub(crate) fn context_for_raw(&self, ctx: JSContextRef) -> Arc<ContextInner> {
        // SAFETY: ctx comes from an engine callback of this isolate
        let global = unsafe { JSContextGetGlobalContext(ctx) };
        self.contexts
            .iter()
            .find(|entry| entry.value().raw_global() == global)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_context))
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn check_alive(&self) -> BridgeResult<()> {
        if self.is_disposed() {
            Err(BridgeError::IsolateDisposed)
        } else {
            Ok(())
        }
    }

    // ---- entry -----------------------------------------------------------

    /// Claim the isolate for the calling thread (or deepen its claim).
    pub(crate) fn acquire(&self, mode: Acquire) -> BridgeResult<()> {
        self.check_alive()?;
        let me = thread::current().id();
        let mut state = self.entry.lock();

        if state.owner == Some(me) {
            state.depth += 1;
            trace!(isolate = %self.id, depth = state.depth, "nested entry");
            return Ok(());
        }

        if state.owner.is_some() {
            let blocking = mode == Acquire::Policy && self.policy == EntryPolicy::Block;
            if !blocking {
                return Err(BridgeError::Contention);
            }
            debug!(isolate = %self.id, "waiting for isolate owner to leave");
            let deadline = self.entry_timeout.map(|timeout| Instant::now() + timeout);
            while state.owner.is_some() {
                match deadline {
                    Some(deadline) => {
                        if self.entry_released.wait_until(&mut state, deadline).timed_out()
                            && state.owner.is_some()
                        {
                            debug!(isolate = %self.id, "entry timed out");
                            return Err(BridgeError::Contention);
                        }
                    }
                    None => self.entry_released.wait(&mut state),
                }
            }
        }

        // Re-check after waiting: dispose and shutdown happen while unowned.
        self.check_alive()?;
        self.engine.check_running()?;

        state.owner = Some(me);
        state.depth = 1;
        Ok(())
    }

    /// Undo one `acquire`. The outermost exit drains deferred releases and
    /// forgets host errors that script caught, while still owning the
    /// isolate.
    pub(crate) fn release(&self) {
        let outermost = self.entry.lock().depth == 1;
        if outermost && !self.is_disposed() {
            self.drain_releases();
            self.clear_host_errors();
        }

        let mut state = self.entry.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.entry_released.notify_all();
        }
    }

    pub(crate) fn entry_depth(&self) -> usize {
        let state = self.entry.lock();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }

    pub(crate) fn is_entered(&self) -> bool {
        self.entry.lock().owner.is_some()
    }

    pub(crate) fn is_owned_by_current_thread(&self) -> bool {
        self.entry.lock().owner == Some(thread::current().id())
    }

    // ---- release queue ---------------------------------------------------

    /// Enqueue the release of one host reference. Safe from any thread.
    pub(crate) fn queue_release(&self, key: RootKey) {
        if self.is_disposed() {
            return;
        }
        // The receiver lives as long as self, so send cannot fail.
        let _ = self.release_tx.send(key);
    }

    /// Apply queued releases. Caller must own the isolate.
    pub(crate) fn drain_releases(&self) -> usize {
        let mut released = 0;
        for key in self.release_rx.try_iter() {
            if self.refs().release(key) {
                // SAFETY: we own the isolate; the handle was protected on its
                // first retain.
                unsafe { JSValueUnprotect(self.default_raw(), key.raw()) };
                released += 1;
            }
        }
        if released > 0 {
            trace!(isolate = %self.id, released, "drained release queue");
        }
        released
    }

    pub(crate) fn pending_releases(&self) -> usize {
        self.release_rx.len()
    }

    // ---- termination -----------------------------------------------------

    pub(crate) fn request_termination(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_termination(&self) {
        self.terminate.store(false, Ordering::Release);
    }

    pub(crate) fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    fn arm_watchdog(&self, limit: f64) {
        // SAFETY: the flag lives inside the Arc allocation, which outlives
        // the group's time limit (cleared in teardown).
        unsafe {
            JSContextGroupSetExecutionTimeLimit(
                self.group,
                limit,
                Some(should_terminate),
                &self.terminate as *const AtomicBool as *mut c_void,
            );
        }
    }

    /// Make the watchdog poll almost at once, for a termination that has to
    /// unwind script without a thrown value. Caller must own the isolate.
    pub(crate) fn hasten_termination(&self) {
        if !self.hastened.swap(true, Ordering::AcqRel) {
            self.arm_watchdog(HASTENED_POLL_SECS);
        }
    }

    /// Run one host→engine boundary crossing.
    ///
    /// `f` receives the exception slot for the engine call. A pending
    /// termination request is observed before and after the call; only the
    /// outermost boundary consumes it, so nested boundaries inside host
    /// callbacks propagate termination outward.
    pub(crate) fn run_script<T>(
        self: &Arc<Self>,
        context: &Arc<ContextInner>,
        f: impl FnOnce(&mut JSValueRef) -> T,
    ) -> BridgeResult<T> {
        let outermost = self.script_depth.fetch_add(1, Ordering::AcqRel) == 0;
        let _depth = scopeguard::guard(&self.script_depth, |depth| {
            depth.fetch_sub(1, Ordering::AcqRel);
        });

        if self.termination_requested() {
            return Err(self.observe_termination(outermost));
        }

        let mut exception: JSValueRef = std::ptr::null();
        let result = f(&mut exception);
        if outermost && self.hastened.swap(false, Ordering::AcqRel) {
            self.arm_watchdog(self.termination_poll);
        }

        if self.termination_requested() {
            return Err(self.observe_termination(outermost));
        }
        if !exception.is_null() {
            return Err(exception::capture(self, context, exception));
        }
        Ok(result)
    }

    fn observe_termination(&self, outermost: bool) -> BridgeError {
        if outermost {
            self.cancel_termination();
            debug!(isolate = %self.id, "termination consumed");
        }
        self.engine.stats().record_termination(outermost);
        BridgeError::TerminationRequested
    }

    // ---- host errors -----------------------------------------------------

    /// Remember the error object thrown for a failed host callback. The
    /// object stays rooted until a boundary claims it or the outermost
    /// scope exits.
    pub(crate) fn remember_host_error(&self, handle: JSValueRef, function: &str, cause: anyhow::Error) {
        // SAFETY: owner thread, inside a callback
        unsafe { JSValueProtect(self.default_raw(), handle) };
        self.host_errors.lock().push(PendingHostError {
            handle: handle as usize,
            function: function.to_string(),
            cause,
        });
    }

    /// Claim the host error behind a thrown value, if any.
    pub(crate) fn take_host_error(&self, handle: JSValueRef) -> Option<(String, anyhow::Error)> {
        let pending = {
            let mut errors = self.host_errors.lock();
            let index = errors.iter().position(|e| e.handle == handle as usize)?;
            errors.swap_remove(index)
        };
        // SAFETY: balanced with remember_host_error
        unsafe { JSValueUnprotect(self.default_raw(), pending.handle as JSValueRef) };
        Some((pending.function, pending.cause))
    }

    fn clear_host_errors(&self) {
        let caught = std::mem::take(&mut *self.host_errors.lock());
        for pending in caught {
            trace!(isolate = %self.id, function = %pending.function, "host error caught by script");
            // SAFETY: balanced with remember_host_error; still owning the isolate
            unsafe { JSValueUnprotect(self.default_raw(), pending.handle as JSValueRef) };
        }
    }

    // ---- registry --------------------------------------------------------

    pub(crate) fn register_function(&self, function: HostFunction) -> u64 {
        let id = self.next_function_id.fetch_add(1, Ordering::Relaxed);
        self.functions.insert(id, function);
        id
    }

    pub(crate) fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// The weak wrapper map of `context`, created on first use. Caller must
    /// own the isolate.
    pub(crate) fn callback_map(&self, context: &ContextInner) -> BridgeResult<JSWeakObjectMapRef> {
        if let Some(map) = self.callback_cache.get(&context.id()) {
            return Ok(*map as JSWeakObjectMapRef);
        }
        // SAFETY: entered; the map lives as long as the context's global object
        let map = unsafe {
            JSWeakObjectMapCreate(context.raw(), std::ptr::null_mut(), Some(callback_map_destroyed))
        };
        if map.is_null() {
            return Err(BridgeError::allocation("JSWeakObjectMapCreate"));
        }
        self.callback_cache.insert(context.id(), map as usize);
        Ok(map)
    }

    pub(crate) fn create_context(self: &Arc<Self>) -> BridgeResult<Arc<ContextInner>> {
        self.check_alive()?;
        // SAFETY: group is alive while not disposed
        let raw = unsafe { JSGlobalContextCreateInGroup(self.group, std::ptr::null_mut()) };
        if raw.is_null() {
            return Err(BridgeError::allocation("JSGlobalContextCreateInGroup"));
        }
        let id = self.engine.next_context_id();
        let context = Arc::new(ContextInner::new(id, Arc::downgrade(self), raw, false));
        self.contexts.insert(id, Arc::clone(&context));
        self.engine.register_context(id, self.id);
        debug!(isolate = %self.id, context = %id, "context created");
        Ok(context)
    }

    /// Close one non-default context. Caller must own the isolate.
    pub(crate) fn close_context(&self, context: &ContextInner) {
        if !context.mark_closed() {
            return;
        }
        self.callback_cache.remove(&context.id());
        self.contexts.remove(&context.id());
        self.engine.unregister_context(context.id());
        // SAFETY: we own the isolate and the context is no longer reachable
        // through the bridge.
        unsafe { JSGlobalContextRelease(context.raw_global()) };
        debug!(isolate = %self.id, context = %context.id(), "context closed");
    }

    // ---- disposal --------------------------------------------------------

    /// Dispose unless some thread is inside. `wait` blocks until the owner
    /// leaves instead of failing (used by engine shutdown).
    pub(crate) fn dispose(&self, wait: bool) -> BridgeResult<()> {
        {
            let mut state = self.entry.lock();
            if self.is_disposed() {
                return Err(BridgeError::IsolateDisposed);
            }
            if state.owner.is_some() {
                if !wait || state.owner == Some(thread::current().id()) {
                    return Err(BridgeError::IsolateEntered);
                }
                while state.owner.is_some() {
                    self.entry_released.wait(&mut state);
                }
            }
            self.disposed.store(true, Ordering::Release);
        }
        self.entry_released.notify_all();
        self.teardown();
        debug!(isolate = %self.id, "isolate disposed");
        Ok(())
    }

    /// Release every engine resource. Runs once, after `disposed` is set,
    /// so no thread can be inside.
    fn teardown(&self) {
        // SAFETY: nobody can enter anymore; raw pointers are still valid.
        unsafe { JSContextGroupClearExecutionTimeLimit(self.group) };

        let dropped_releases = self.release_rx.try_iter().count();
        let dropped_roots = self.refs().purge_isolate(self.id);
        if dropped_roots > 0 {
            debug!(isolate = %self.id, dropped_roots, dropped_releases, "purged host roots");
        }
        self.host_errors.lock().clear();
        self.callback_cache.clear();

        let contexts: Vec<Arc<ContextInner>> =
            self.contexts.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.contexts.clear();
        for context in contexts {
            self.engine.unregister_context(context.id());
            if context.mark_closed() {
                // SAFETY: last use of this context
                unsafe { JSGlobalContextRelease(context.raw_global()) };
            }
        }
        // Finalizers of host functions and host objects may run here; they
        // only touch the maps below, and no map guard is held.
        unsafe { JSContextGroupRelease(self.group) };
        self.functions.clear();
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            warn!(isolate = %self.id, "isolate dropped without dispose");
            self.teardown();
        }
    }
}

/// Handle to an isolate. Cheap to clone; all clones refer to the same heap.
///
/// The engine keeps every isolate registered until [`Isolate::dispose`] (or
/// engine shutdown), so dropping handles does not free the heap.
#[derive(Clone)]
pub struct Isolate {
    pub(crate) inner: Arc<IsolateInner>,
}

impl Isolate {
    /// Create an isolate in the global engine.
    pub fn new() -> BridgeResult<Self> {
        Engine::global()?.create_isolate()
    }

    pub(crate) fn from_inner(inner: Arc<IsolateInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> IsolateId {
        self.inner.id
    }

    /// Enter the isolate on this thread, following the configured entry
    /// policy if another thread holds it.
    pub fn enter(&self) -> BridgeResult<ScopeGuard> {
        ScopeGuard::enter(&self.inner)
    }

    /// Enter without ever blocking; reports `Contention` if another thread
    /// holds the isolate.
    pub fn try_enter(&self) -> BridgeResult<ScopeGuard> {
        ScopeGuard::try_enter(&self.inner)
    }

    /// Entry depth of the calling thread (0 when not entered).
    pub fn entry_depth(&self) -> usize {
        self.inner.entry_depth()
    }

    /// Whether any thread is currently inside.
    pub fn is_entered(&self) -> bool {
        self.inner.is_entered()
    }

    pub fn default_context(&self) -> Context {
        Context::from_inner(Arc::clone(&self.inner.default_context))
    }

    /// Create an additional context sharing this isolate's heap.
    pub fn create_context(&self) -> BridgeResult<Context> {
        let _scope = self.enter()?;
        self.inner.create_context().map(Context::from_inner)
    }

    pub fn context(&self, id: ContextId) -> BridgeResult<Context> {
        self.inner.check_alive()?;
        self.inner
            .context(id)
            .map(Context::from_inner)
            .ok_or(BridgeError::ContextClosed)
    }

    /// Ask running script to stop. Callable from any thread at any time; a
    /// request made while nothing runs terminates the next evaluation.
    pub fn terminate_execution(&self) {
        debug!(isolate = %self.inner.id, "termination requested");
        self.inner.request_termination();
    }

    /// Withdraw a termination request that has not been observed yet.
    pub fn cancel_terminate_execution(&self) {
        self.inner.cancel_termination();
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.inner.termination_requested()
    }

    /// Apply queued releases now. Never blocks: if another thread holds the
    /// isolate, nothing happens and 0 is returned.
    pub fn pump_releases(&self) -> usize {
        match ScopeGuard::try_enter(&self.inner) {
            Ok(_scope) => self.inner.drain_releases(),
            Err(_) => 0,
        }
    }

    /// Drain releases, then run a full collection. Finalizers of
    /// unreachable host functions and host objects have run on return.
    pub fn collect_garbage(&self) -> BridgeResult<()> {
        let _scope = self.enter()?;
        self.inner.drain_releases();
        // SAFETY: entered
        unsafe { JSSynchronousGarbageCollectForDebugging(self.inner.default_raw()) };
        Ok(())
    }

    /// Host functions whose engine wrapper is still alive.
    pub fn host_function_count(&self) -> usize {
        self.inner.function_count()
    }

    /// Rooted host references into this isolate.
    pub fn live_roots(&self) -> usize {
        self.inner.refs().live_roots(self.inner.id)
    }

    /// Releases waiting for the next safe point.
    pub fn pending_releases(&self) -> usize {
        self.inner.pending_releases()
    }

    /// Free the heap. Fails with `IsolateEntered` while any thread (the
    /// caller included) is inside, and with `IsolateDisposed` the second time.
    pub fn dispose(&self) -> BridgeResult<()> {
        self.inner.dispose(false)?;
        self.inner.engine.forget_isolate(self.inner.id);
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn engine(&self) -> Engine {
        Engine::from_inner(Arc::clone(&self.inner.engine))
    }
}

impl PartialEq for Isolate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Isolate {}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}
