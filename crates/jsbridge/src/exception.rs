//! Exception bridge
//!
//! Engine → host: [`capture`] turns a pending exception into a
//! [`BridgeError`], either `Script` with a full [`ExceptionRecord`] or, when
//! the thrown value is the error object made for a failed host callback,
//! `HostCallback` with the original cause.
//!
//! Host → engine: [`throw_host_error`] turns a host failure into a value the
//! trampoline can hand back through the engine's exception slot. Host errors
//! never unwind through engine frames.

use jsbridge_sys::*;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::context::ContextInner;
use crate::error::BridgeError;
use crate::isolate::IsolateInner;
use crate::string::JsString;
use crate::value::Value;

/// `name` given to errors thrown for failed host callbacks.
pub const HOST_ERROR_NAME: &str = "HostError";

/// What kind of value was thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// An `Error` instance (or subclass).
    Error,
    /// Any other thrown value: `throw "x"`, `throw 42`, `throw {}`.
    Value,
    /// A `HostError` whose host cause is no longer available, e.g. one
    /// that script caught, kept and threw again later.
    Host,
}

/// A script exception as seen from the host.
#[derive(Clone)]
pub struct ExceptionRecord {
    pub kind: ExceptionKind,
    /// Type tag: the error's `name` (`"TypeError"`, `"HostError"`, ...).
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    /// `sourceURL` of the throwing script.
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// The thrown value itself.
    pub value: Option<Value>,
}

impl ExceptionRecord {
    pub fn new(kind: ExceptionKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            stack: None,
            file: None,
            line: None,
            column: None,
            value: None,
        }
    }

    /// `file:line:column`, as far as known.
    pub fn location(&self) -> Option<String> {
        let file = self.file.as_deref()?;
        Some(match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{}:{}:{}", file, line, column),
            (Some(line), None) => format!("{}:{}", file, line),
            _ => file.to_string(),
        })
    }

    pub fn is_host_error(&self) -> bool {
        self.kind == ExceptionKind::Host
    }
}

impl fmt::Display for ExceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl fmt::Debug for ExceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionRecord")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("message", &self.message)
            .field("location", &self.location())
            .field("has_stack", &self.stack.is_some())
            .finish()
    }
}

/// Convert a pending engine exception. Caller must own the isolate.
pub(crate) fn capture(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    exception: JSValueRef,
) -> BridgeError {
    if exception.is_null() {
        return BridgeError::internal("null exception");
    }
    if let Some((function, cause)) = isolate.take_host_error(exception) {
        trace!(isolate = %isolate.id(), function = %function, "host error reached the host boundary");
        isolate.engine().stats().record_exception();
        return BridgeError::host_callback(function, cause);
    }
    // SAFETY: owner thread; exception is a live value of this isolate
    let record = unsafe { read_record(isolate, context, exception) };
    isolate.engine().stats().record_exception();
    BridgeError::Script(Box::new(record))
}

unsafe fn read_record(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    exception: JSValueRef,
) -> ExceptionRecord {
    let ctx = context.raw();
    let value = Value::from_raw(isolate, context, exception);

    // SAFETY: caller contract
    unsafe {
        if !JSValueIsObject(ctx, exception) {
            let message = display_string(ctx, exception).unwrap_or_default();
            let mut record = ExceptionRecord::new(ExceptionKind::Value, "Error", message);
            record.value = Some(value);
            return record;
        }

        let object = exception as JSObjectRef;
        let name = string_property(ctx, object, "name");
        let kind = if name.as_deref() == Some(HOST_ERROR_NAME) {
            ExceptionKind::Host
        } else if is_error_instance(ctx, exception) {
            ExceptionKind::Error
        } else {
            ExceptionKind::Value
        };
        let message = match kind {
            ExceptionKind::Value => display_string(ctx, exception),
            _ => string_property(ctx, object, "message"),
        };

        ExceptionRecord {
            kind,
            name: name.unwrap_or_else(|| "Error".to_string()),
            message: message.unwrap_or_default(),
            stack: string_property(ctx, object, "stack"),
            file: string_property(ctx, object, "sourceURL"),
            line: number_property(ctx, object, "line").map(|n| n as u32),
            column: number_property(ctx, object, "column").map(|n| n as u32),
            value: Some(value),
        }
    }
}

/// `value instanceof Error`, against this context's `Error` constructor.
unsafe fn is_error_instance(ctx: JSContextRef, value: JSValueRef) -> bool {
    // SAFETY: caller contract
    unsafe {
        let global = JSContextGetGlobalObject(ctx);
        let Some(ctor) = property(ctx, global, "Error") else {
            return false;
        };
        if !JSObjectIsFunction(ctx, ctor as JSObjectRef) {
            return false;
        }
        JSValueIsInstanceOfConstructor(ctx, value, ctor as JSObjectRef, std::ptr::null_mut())
    }
}

/// Property read that swallows getter exceptions; `None` for undefined.
unsafe fn property(ctx: JSContextRef, object: JSObjectRef, name: &str) -> Option<JSValueRef> {
    let name = JsString::new(name).ok()?;
    let mut exception: JSValueRef = std::ptr::null();
    // SAFETY: caller contract
    let value = unsafe { JSObjectGetProperty(ctx, object, name.raw(), &mut exception) };
    if !exception.is_null() || value.is_null() || unsafe { JSValueIsUndefined(ctx, value) } {
        return None;
    }
    Some(value)
}

unsafe fn string_property(ctx: JSContextRef, object: JSObjectRef, name: &str) -> Option<String> {
    // SAFETY: caller contract
    unsafe {
        let value = property(ctx, object, name)?;
        display_string(ctx, value)
    }
}

unsafe fn number_property(ctx: JSContextRef, object: JSObjectRef, name: &str) -> Option<f64> {
    // SAFETY: caller contract
    unsafe {
        let value = property(ctx, object, name)?;
        if !JSValueIsNumber(ctx, value) {
            return None;
        }
        let n = JSValueToNumber(ctx, value, std::ptr::null_mut());
        n.is_finite().then_some(n)
    }
}

unsafe fn display_string(ctx: JSContextRef, value: JSValueRef) -> Option<String> {
    let mut exception: JSValueRef = std::ptr::null();
    // SAFETY: caller contract; the copy is adopted and released
    let string = unsafe { JsString::adopt(JSValueToStringCopy(ctx, value, &mut exception)) }?;
    exception.is_null().then(|| string.to_rust_string())
}

/// Produce the value to throw into script for a failed host call.
///
/// While termination is pending nothing is thrown: script must not get a
/// catchable value, so the watchdog is told to fire at its next tick and
/// `None` is returned. A `BridgeError::Script` whose thrown value belongs to
/// this isolate is rethrown as is. Anything else becomes a fresh `Error`
/// named `HostError`, remembered with its cause until a boundary claims it.
/// Caller must own the isolate and be inside an engine callback.
pub(crate) fn throw_host_error(
    isolate: &Arc<IsolateInner>,
    ctx: JSContextRef,
    function: &str,
    cause: anyhow::Error,
) -> Option<JSValueRef> {
    if isolate.termination_requested() {
        debug!(isolate = %isolate.id(), function, %cause, "host call unwound by termination");
        isolate.hasten_termination();
        return None;
    }
    if let Some(BridgeError::Script(record)) = cause.downcast_ref::<BridgeError>()
        && let Some(value) = &record.value
        && value.isolate_id() == isolate.id()
    {
        trace!(isolate = %isolate.id(), function, "rethrowing script exception");
        return Some(value.raw());
    }

    let message = format!("{:#}", cause);
    // SAFETY: owner thread, inside a callback
    let error = unsafe { make_error(ctx, &message) };
    if error.is_null() {
        // Out of memory: throw the message as a plain string instead.
        return Some(match JsString::new(&message) {
            // SAFETY: as above
            Ok(string) => unsafe { JSValueMakeString(ctx, string.raw()) },
            Err(_) => unsafe { JSValueMakeUndefined(ctx) },
        });
    }
    isolate.remember_host_error(error, function, cause);
    Some(error)
}

unsafe fn make_error(ctx: JSContextRef, message: &str) -> JSValueRef {
    let Ok(message) = JsString::new(message) else {
        return std::ptr::null();
    };
    // SAFETY: caller contract
    unsafe {
        let argument = JSValueMakeString(ctx, message.raw());
        let mut exception: JSValueRef = std::ptr::null();
        let error = JSObjectMakeError(ctx, 1, &argument, &mut exception);
        if error.is_null() || !exception.is_null() {
            return std::ptr::null();
        }
        if let (Ok(key), Ok(name)) = (JsString::new("name"), JsString::new(HOST_ERROR_NAME)) {
            JSObjectSetProperty(
                ctx,
                error,
                key.raw(),
                JSValueMakeString(ctx, name.raw()),
                K_JS_PROPERTY_ATTRIBUTE_DONT_ENUM,
                std::ptr::null_mut(),
            );
        }
        error as JSValueRef
    }
}
