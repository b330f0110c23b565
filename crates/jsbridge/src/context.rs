//! Contexts: global-object scopes inside an isolate.

use jsbridge_sys::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info_span};

use crate::convert::{self, HostValue};
use crate::error::{BridgeError, BridgeResult};
use crate::function::{CallArgs, Function, HostFunction};
use crate::isolate::{Isolate, IsolateInner};
use crate::scope::ScopeGuard;
use crate::string::JsString;
use crate::value::Value;

/// Unique identifier of a context within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

pub(crate) struct ContextInner {
    id: ContextId,
    isolate: Weak<IsolateInner>,
    raw: JSGlobalContextRef,
    closed: AtomicBool,
    is_default: bool,
}

// SAFETY: `raw` is only handed to the engine while the owning isolate is
// entered by the calling thread.
unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl ContextInner {
    pub(crate) fn new(
        id: ContextId,
        isolate: Weak<IsolateInner>,
        raw: JSGlobalContextRef,
        is_default: bool,
    ) -> Self {
        Self {
            id,
            isolate,
            raw,
            closed: AtomicBool::new(false),
            is_default,
        }
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn raw(&self) -> JSContextRef {
        self.raw as JSContextRef
    }

    pub(crate) fn raw_global(&self) -> JSGlobalContextRef {
        self.raw
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that actually closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// The owning isolate, if it is still alive.
    pub(crate) fn isolate(&self) -> BridgeResult<Arc<IsolateInner>> {
        let isolate = self.isolate.upgrade().ok_or(BridgeError::IsolateDisposed)?;
        isolate.check_alive()?;
        Ok(isolate)
    }

    /// Isolate and entered scope, failing if the context is closed.
    pub(crate) fn enter(&self) -> BridgeResult<(Arc<IsolateInner>, ScopeGuard)> {
        let isolate = self.isolate()?;
        if self.is_closed() {
            return Err(BridgeError::ContextClosed);
        }
        let scope = ScopeGuard::enter(&isolate)?;
        // Closed while we were waiting for entry.
        if self.is_closed() {
            return Err(BridgeError::ContextClosed);
        }
        Ok((isolate, scope))
    }

    pub(crate) fn global_object(&self) -> JSObjectRef {
        // SAFETY: caller is entered and the context is open
        unsafe { JSContextGetGlobalObject(self.raw()) }
    }
}

/// Handle to a context. Holds its isolate weakly: a context never keeps a
/// disposed isolate alive, and every operation after disposal fails with
/// `IsolateDisposed`.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn isolate(&self) -> BridgeResult<Isolate> {
        self.inner.isolate().map(Isolate::from_inner)
    }

    pub fn is_default(&self) -> bool {
        self.inner.is_default
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Release the context. The default context closes only with its
    /// isolate. Values created here stay usable through the isolate.
    pub fn close(&self) -> BridgeResult<()> {
        if self.inner.is_default {
            return Err(BridgeError::config("the default context closes with its isolate"));
        }
        let (isolate, _scope) = self.inner.enter()?;
        isolate.close_context(&self.inner);
        Ok(())
    }

    /// Evaluate `source` with `<eval>` as the source name.
    pub fn eval(&self, source: &str) -> BridgeResult<Value> {
        self.evaluate(source, "<eval>")
    }

    /// Evaluate `source`; `source_name` appears in stack traces and as
    /// `sourceURL` on thrown errors.
    pub fn evaluate(&self, source: &str, source_name: &str) -> BridgeResult<Value> {
        let _span = info_span!("evaluate", context = %self.inner.id, source = source_name).entered();
        let (isolate, _scope) = self.inner.enter()?;
        isolate.engine().stats().record_evaluation();

        let script = JsString::new(source)?;
        let url = JsString::new(source_name)?;
        let raw = isolate
            .run_script(&self.inner, |exception| unsafe {
                // SAFETY: entered; strings live until the end of the call
                JSEvaluateScript(
                    self.inner.raw(),
                    script.raw(),
                    std::ptr::null_mut(),
                    url.raw(),
                    1,
                    exception,
                )
            })
            .inspect_err(|e| {
                isolate.engine().stats().record_failure(e);
                debug!(error = %e, kind = e.kind_name(), "evaluation failed");
            })?;
        if raw.is_null() {
            return Err(BridgeError::internal("JSEvaluateScript returned null without an exception"));
        }
        Ok(Value::from_raw(&isolate, &self.inner, raw))
    }

    /// Parse without running. Syntax errors surface as script exceptions.
    pub fn check_syntax(&self, source: &str, source_name: &str) -> BridgeResult<()> {
        let (isolate, _scope) = self.inner.enter()?;
        let script = JsString::new(source)?;
        let url = JsString::new(source_name)?;
        isolate.run_script(&self.inner, |exception| unsafe {
            // SAFETY: entered; strings live until the end of the call
            JSCheckScriptSyntax(self.inner.raw(), script.raw(), url.raw(), 1, exception)
        })?;
        Ok(())
    }

    /// The global object.
    pub fn global(&self) -> BridgeResult<Value> {
        let (isolate, _scope) = self.inner.enter()?;
        let global = self.inner.global_object();
        Ok(Value::from_raw(&isolate, &self.inner, global as JSValueRef))
    }

    /// Read a global variable.
    pub fn get_global(&self, name: &str) -> BridgeResult<Value> {
        self.global()?.get(name)
    }

    /// Assign a global variable.
    pub fn set_global(&self, name: &str, value: impl Into<HostValue>) -> BridgeResult<()> {
        self.global()?.set(name, value)
    }

    /// Convert a host value into an engine value living in this context.
    pub fn to_engine(&self, value: &HostValue) -> BridgeResult<Value> {
        let (isolate, _scope) = self.inner.enter()?;
        let raw = convert::to_engine(&isolate, &self.inner, value)?;
        Ok(Value::from_raw(&isolate, &self.inner, raw))
    }

    /// Expose `function` as a global under `name`; returns the engine
    /// function object.
    pub fn register_host_function(&self, name: &str, function: HostFunction) -> BridgeResult<Value> {
        let value = self.to_engine(&HostValue::Callback(function))?;
        self.global()?.set(name, value.clone())?;
        debug!(context = %self.inner.id, name, "host function registered");
        Ok(value)
    }

    /// Shorthand for `register_host_function(name, HostFunction::new(name, f))`.
    pub fn register_fn<F>(&self, name: &str, f: F) -> BridgeResult<Value>
    where
        F: Fn(CallArgs) -> anyhow::Result<HostValue> + Send + Sync + 'static,
    {
        self.register_host_function(name, HostFunction::new(name, f))
    }

    /// Look up a global function by name.
    pub fn function(&self, name: &str) -> BridgeResult<Function> {
        let value = self.get_global(name)?;
        value.as_function()?.ok_or_else(|| {
            BridgeError::conversion("function", format!("global `{}` is not a function", name))
        })
    }

    /// Call a global function by name.
    pub fn call_function(&self, name: &str, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.function(name)?.call(args)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("default", &self.inner.is_default)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_number() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        let value = ctx.evaluate("1 + 2", "test.js").unwrap();
        assert_eq!(value.to_host().unwrap(), HostValue::Number(3.0));
        drop(value);
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_contexts_have_separate_globals() {
        let isolate = Isolate::new().unwrap();
        let a = isolate.default_context();
        let b = isolate.create_context().unwrap();
        a.eval("var shared = 1").unwrap();
        assert_eq!(b.eval("typeof shared").unwrap().to_host().unwrap(), HostValue::from("undefined"));
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_close_context() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.create_context().unwrap();
        let kept = ctx.eval("({ answer: 42 })").unwrap();
        ctx.close().unwrap();
        assert!(ctx.is_closed());
        assert!(matches!(ctx.eval("1"), Err(BridgeError::ContextClosed)));
        assert!(matches!(isolate.context(ctx.id()), Err(BridgeError::ContextClosed)));
        // Values outlive their context.
        assert_eq!(kept.get("answer").unwrap().to_host().unwrap(), HostValue::Number(42.0));
        assert!(isolate.default_context().close().is_err());
        drop(kept);
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_context_after_dispose() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        isolate.dispose().unwrap();
        assert!(matches!(ctx.eval("1"), Err(BridgeError::IsolateDisposed)));
        assert!(matches!(ctx.isolate(), Err(BridgeError::IsolateDisposed)));
    }

    #[test]
    fn test_check_syntax() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        assert!(ctx.check_syntax("let x = 1;", "ok.js").is_ok());
        let err = ctx.check_syntax("let = ;", "bad.js").unwrap_err();
        assert_eq!(err.exception().map(|r| r.name.as_str()), Some("SyntaxError"));
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_globals() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        ctx.set_global("greeting", "hi").unwrap();
        assert_eq!(ctx.eval("greeting + '!'").unwrap().to_host().unwrap(), HostValue::from("hi!"));
        ctx.eval("function twice(x) { return x * 2 }").unwrap();
        assert_eq!(ctx.call_function("twice", &[HostValue::from(21)]).unwrap(), HostValue::Number(42.0));
        assert!(ctx.function("greeting").is_err());
        isolate.dispose().unwrap();
    }
}
