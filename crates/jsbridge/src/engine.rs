//! Process-wide engine handle
//!
//! One [`Engine`] exists per process. It is created explicitly with
//! [`Engine::init`] or lazily (from the environment) by [`Engine::global`],
//! owns the reference table and the isolate registry, and is shut down once
//! with [`Engine::shutdown`]. A shut-down engine cannot be restarted.
//!
//! Besides the object API (`Isolate`, `Context`, `Value`), the engine offers
//! an id-based facade for hosts that prefer to pass plain ids around.
//!
//! # Example
//!
//! ```no_run
//! use jsbridge::{Engine, HostValue};
//!
//! let engine = Engine::global().unwrap();
//! let isolate = engine.create_isolate().unwrap();
//! let context = engine.create_context(isolate.id()).unwrap();
//! let value = engine.evaluate(context, "1 + 2", "example.js").unwrap();
//! assert_eq!(engine.convert_to_host(&value).unwrap(), HostValue::from(3));
//! drop(value);
//! engine.dispose_isolate(isolate.id()).unwrap();
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::context::{Context, ContextId};
use crate::convert::HostValue;
use crate::error::{BridgeError, BridgeResult};
use crate::function::HostFunction;
use crate::isolate::{Isolate, IsolateId, IsolateInner};
use crate::refs::ReferenceTable;
use crate::scope::ScopeGuard;
use crate::value::Value;

static ENGINE: OnceLock<Engine> = OnceLock::new();

/// Lifecycle of the process-wide engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Neither `init` nor `global` has run yet.
    Uninitialized,
    Running,
    ShutDown,
}

/// Statistics about bridge operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Scripts evaluated (successfully or not)
    pub evaluations: AtomicU64,
    /// Evaluations that returned an error
    pub failures: AtomicU64,
    /// Script and host-callback exceptions that reached a host boundary
    pub exceptions: AtomicU64,
    /// Termination requests consumed by an outermost boundary
    pub terminations: AtomicU64,
    pub isolates_created: AtomicU64,
    pub isolates_disposed: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &BridgeError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if matches!(error, BridgeError::Internal(_)) {
            warn!(error = %error, "internal bridge error");
        }
    }

    pub(crate) fn record_exception(&self) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_termination(&self, consumed: bool) {
        if consumed {
            self.terminations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            terminations: self.terminations.load(Ordering::Relaxed),
            isolates_created: self.isolates_created.load(Ordering::Relaxed),
            isolates_disposed: self.isolates_disposed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub evaluations: u64,
    pub failures: u64,
    pub exceptions: u64,
    pub terminations: u64,
    pub isolates_created: u64,
    pub isolates_disposed: u64,
}

impl EngineStatsSnapshot {
    /// Isolates created and not yet disposed
    pub fn isolates_alive(&self) -> u64 {
        self.isolates_created.saturating_sub(self.isolates_disposed)
    }
}

pub(crate) struct EngineInner {
    config: BridgeConfig,
    shut_down: AtomicBool,
    /// Serializes isolate creation against shutdown.
    lifecycle: Mutex<()>,
    refs: ReferenceTable,
    stats: EngineStats,
    isolates: DashMap<IsolateId, Arc<IsolateInner>>,
    contexts: DashMap<ContextId, IsolateId>,
    next_isolate_id: AtomicU64,
    next_context_id: AtomicU64,
}

impl EngineInner {
    fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shut_down: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            refs: ReferenceTable::new(),
            stats: EngineStats::new(),
            isolates: DashMap::new(),
            contexts: DashMap::new(),
            next_isolate_id: AtomicU64::new(1),
            next_context_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn refs(&self) -> &ReferenceTable {
        &self.refs
    }

    pub(crate) fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub(crate) fn next_isolate_id(&self) -> IsolateId {
        IsolateId(self.next_isolate_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId(self.next_context_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn check_running(&self) -> BridgeResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(BridgeError::EngineShutDown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn register_context(&self, context: ContextId, isolate: IsolateId) {
        self.contexts.insert(context, isolate);
    }

    pub(crate) fn unregister_context(&self, context: ContextId) {
        self.contexts.remove(&context);
    }

    /// Drop a disposed isolate from the registry.
    pub(crate) fn forget_isolate(&self, id: IsolateId) {
        if self.isolates.remove(&id).is_some() {
            self.stats.isolates_disposed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Handle to the process-wide engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start the engine with `config`.
    ///
    /// Calling it again with the same configuration returns the running
    /// engine; a different configuration is a `Config` error. Fails with
    /// `EngineShutDown` after shutdown.
    pub fn init(config: BridgeConfig) -> BridgeResult<Engine> {
        config.validate()?;
        let mut started = false;
        let engine = ENGINE.get_or_init(|| {
            started = true;
            config.export_jsc_options();
            info!(
                entry_policy = ?config.entry_policy,
                termination_poll_ms = config.termination_poll_ms,
                "engine started"
            );
            Engine {
                inner: Arc::new(EngineInner::new(config.clone())),
            }
        });
        engine.inner.check_running()?;
        if !started && engine.inner.config != config {
            return Err(BridgeError::config(
                "engine already initialized with a different configuration",
            ));
        }
        Ok(engine.clone())
    }

    /// The running engine, started from the environment on first use
    /// (see [`BridgeConfig::from_env`]).
    pub fn global() -> BridgeResult<Engine> {
        if let Some(engine) = ENGINE.get() {
            engine.inner.check_running()?;
            return Ok(engine.clone());
        }
        Self::init(BridgeConfig::from_env()?)
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Process-wide state, without starting the engine.
    pub fn current_state() -> EngineState {
        ENGINE.get().map_or(EngineState::Uninitialized, Engine::state)
    }

    pub fn state(&self) -> EngineState {
        if self.is_shut_down() {
            EngineState::ShutDown
        } else {
            EngineState::Running
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    pub fn references(&self) -> &ReferenceTable {
        &self.inner.refs
    }

    /// Rooted host references across all isolates.
    pub fn live_roots(&self) -> usize {
        self.inner.refs.len()
    }

    /// Isolates created and not yet disposed.
    pub fn isolate_count(&self) -> usize {
        self.inner.isolates.len()
    }

    /// Stop the engine: terminate running script, dispose every isolate and
    /// refuse all further work with `EngineShutDown`.
    ///
    /// Fails with `IsolateEntered` when called from inside an isolate, and
    /// with `EngineShutDown` the second time. Blocks until threads inside
    /// other isolates have left them.
    pub fn shutdown(&self) -> BridgeResult<()> {
        let isolates: Vec<Arc<IsolateInner>> = {
            let _lifecycle = self.inner.lifecycle.lock();
            if self
                .inner
                .isolates
                .iter()
                .any(|entry| entry.value().is_owned_by_current_thread())
            {
                return Err(BridgeError::IsolateEntered);
            }
            if self.inner.shut_down.swap(true, Ordering::AcqRel) {
                return Err(BridgeError::EngineShutDown);
            }
            self.inner.isolates.iter().map(|entry| Arc::clone(entry.value())).collect()
        };

        info!(isolates = isolates.len(), "engine shutting down");
        for isolate in &isolates {
            isolate.request_termination();
        }
        for isolate in isolates {
            match isolate.dispose(true) {
                Ok(()) | Err(BridgeError::IsolateDisposed) => {}
                Err(e) => warn!(isolate = %isolate.id(), error = %e, "isolate not disposed at shutdown"),
            }
            self.inner.forget_isolate(isolate.id());
        }
        self.inner.contexts.clear();
        info!(live_roots = self.inner.refs.len(), "engine shut down");
        Ok(())
    }

    pub fn create_isolate(&self) -> BridgeResult<Isolate> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.check_running()?;
        let isolate = IsolateInner::create(&self.inner)?;
        self.inner.isolates.insert(isolate.id(), Arc::clone(&isolate));
        self.inner
            .register_context(isolate.default_context().id(), isolate.id());
        self.inner.stats.isolates_created.fetch_add(1, Ordering::Relaxed);
        Ok(Isolate::from_inner(isolate))
    }

    pub fn isolate(&self, id: IsolateId) -> BridgeResult<Isolate> {
        self.inner.check_running()?;
        self.inner
            .isolates
            .get(&id)
            .map(|entry| Isolate::from_inner(Arc::clone(entry.value())))
            .ok_or(BridgeError::IsolateDisposed)
    }

    pub fn dispose_isolate(&self, id: IsolateId) -> BridgeResult<()> {
        self.isolate(id)?.dispose()
    }

    pub fn enter_scope(&self, id: IsolateId) -> BridgeResult<ScopeGuard> {
        self.isolate(id)?.enter()
    }

    pub fn create_context(&self, isolate: IsolateId) -> BridgeResult<ContextId> {
        Ok(self.isolate(isolate)?.create_context()?.id())
    }

    pub fn context(&self, id: ContextId) -> BridgeResult<Context> {
        self.inner.check_running()?;
        let isolate = match self.inner.contexts.get(&id) {
            Some(entry) => *entry.value(),
            None => return Err(BridgeError::ContextClosed),
        };
        self.isolate(isolate)?.context(id)
    }

    pub fn close_context(&self, id: ContextId) -> BridgeResult<()> {
        self.context(id)?.close()
    }

    pub fn evaluate(&self, context: ContextId, source: &str, source_name: &str) -> BridgeResult<Value> {
        self.context(context)?.evaluate(source, source_name)
    }

    pub fn convert_to_host(&self, value: &Value) -> BridgeResult<HostValue> {
        self.inner.check_running()?;
        value.to_host()
    }

    pub fn convert_to_engine(&self, context: ContextId, value: &HostValue) -> BridgeResult<Value> {
        self.context(context)?.to_engine(value)
    }

    pub fn register_host_function(
        &self,
        context: ContextId,
        name: &str,
        function: HostFunction,
    ) -> BridgeResult<Value> {
        self.context(context)?.register_host_function(name, function)
    }

    pub fn call_script_function(&self, function: &Value, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.inner.check_running()?;
        function.call(args)
    }

    /// Callable from any thread at any time.
    pub fn terminate_execution(&self, isolate: IsolateId) -> BridgeResult<()> {
        self.isolate(isolate)?.terminate_execution();
        debug!(isolate = %isolate, "termination requested through engine");
        Ok(())
    }
}

impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Engine {}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("isolates", &self.inner.isolates.len())
            .field("live_roots", &self.inner.refs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_shared() {
        let a = Engine::global().unwrap();
        let b = Engine::global().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.state(), EngineState::Running);
    }

    #[test]
    fn test_reinit_with_same_config() {
        let engine = Engine::global().unwrap();
        let again = Engine::init(engine.config().clone()).unwrap();
        assert_eq!(engine, again);
        let different = engine.config().clone().max_conversion_depth(engine.config().max_conversion_depth + 1);
        assert!(matches!(Engine::init(different), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_id_facade() {
        let engine = Engine::global().unwrap();
        let isolate = engine.create_isolate().unwrap();
        let context = engine.create_context(isolate.id()).unwrap();
        let value = engine.evaluate(context, "[1, 2].length", "facade.js").unwrap();
        assert_eq!(engine.convert_to_host(&value).unwrap(), HostValue::from(2));

        let converted = engine.convert_to_engine(context, &HostValue::from("s")).unwrap();
        assert_eq!(converted.to_host().unwrap(), HostValue::from("s"));

        engine
            .register_host_function(context, "triple", HostFunction::new("triple", |args| {
                Ok(HostValue::from(args.get_f64(0).unwrap_or(0.0) * 3.0))
            }))
            .unwrap();
        let triple = engine.evaluate(context, "triple", "facade.js").unwrap();
        assert_eq!(engine.call_script_function(&triple, &[HostValue::from(4)]).unwrap(), HostValue::from(12));

        engine.close_context(context).unwrap();
        assert!(matches!(engine.evaluate(context, "1", "x.js"), Err(BridgeError::ContextClosed)));

        drop((value, converted, triple));
        engine.dispose_isolate(isolate.id()).unwrap();
        assert!(matches!(engine.isolate(isolate.id()), Err(BridgeError::IsolateDisposed)));
        assert!(matches!(engine.enter_scope(isolate.id()), Err(BridgeError::IsolateDisposed)));
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = EngineStats::new();
        stats.record_evaluation();
        stats.record_evaluation();
        stats.record_failure(&BridgeError::Contention);
        stats.record_termination(false);
        stats.record_termination(true);
        stats.isolates_created.fetch_add(3, Ordering::Relaxed);
        stats.isolates_disposed.fetch_add(1, Ordering::Relaxed);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.evaluations, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.terminations, 1);
        assert_eq!(snapshot.isolates_alive(), 2);
    }
}
