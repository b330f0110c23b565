//! Rooted engine values.
//!
//! Every [`Value`] handed to host code is backed by one reference-table root
//! shared by all its clones. A `Value` is `Send + Sync`; each operation enters
//! the owning isolate (following its entry policy) for its duration.
//! Dropping the last clone queues the release for the next safe point.

use jsbridge_sys::*;
use serde::de::DeserializeOwned;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::context::{Context, ContextInner};
use crate::convert::{self, HostValue, Mode, ValueKind};
use crate::error::{BridgeError, BridgeResult};
use crate::function::Function;
use crate::isolate::{Isolate, IsolateId, IsolateInner};
use crate::refs::PersistentRef;
use crate::scope::ScopeGuard;
use crate::string::JsString;

/// A host reference to an engine-resident value.
///
/// Equality is engine identity: same isolate and same handle.
#[derive(Clone)]
pub struct Value {
    handle: Arc<PersistentRef>,
    context: Arc<ContextInner>,
}

/// An entered view of a value: isolate, the context to run in, and the guard.
struct Entered {
    isolate: Arc<IsolateInner>,
    context: Arc<ContextInner>,
    _scope: ScopeGuard,
}

impl Entered {
    fn ctx(&self) -> JSContextRef {
        self.context.raw()
    }
}

impl Value {
    /// Root `raw` and wrap it. The caller must have entered `isolate`.
    pub(crate) fn from_raw(
        isolate: &Arc<IsolateInner>,
        context: &Arc<ContextInner>,
        raw: JSValueRef,
    ) -> Self {
        Self {
            handle: Arc::new(PersistentRef::new(isolate, raw)),
            context: Arc::clone(context),
        }
    }

    pub(crate) fn raw(&self) -> JSValueRef {
        self.handle.raw()
    }

    pub(crate) fn isolate_inner(&self) -> &Arc<IsolateInner> {
        self.handle.isolate()
    }

    /// Context for engine calls: the value's own, or the isolate's default
    /// once the own one is closed.
    pub(crate) fn call_context(&self) -> Arc<ContextInner> {
        if self.context.is_closed() {
            Arc::clone(self.isolate_inner().default_context())
        } else {
            Arc::clone(&self.context)
        }
    }

    fn enter(&self) -> BridgeResult<Entered> {
        let isolate = Arc::clone(self.isolate_inner());
        isolate.check_alive()?;
        let scope = ScopeGuard::enter(&isolate)?;
        Ok(Entered {
            context: self.call_context(),
            isolate,
            _scope: scope,
        })
    }

    /// Coerce to an object (boxing primitives); `undefined`/`null` throw.
    fn object(&self, entered: &Entered) -> BridgeResult<JSObjectRef> {
        let raw = self.raw();
        entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered
            JSValueToObject(entered.ctx(), raw, exception)
        })
    }

    pub fn isolate(&self) -> Isolate {
        Isolate::from_inner(Arc::clone(self.isolate_inner()))
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.isolate_inner().id()
    }

    /// The context this value was created in.
    pub fn context(&self) -> Context {
        Context::from_inner(Arc::clone(&self.context))
    }

    pub fn kind(&self) -> BridgeResult<ValueKind> {
        let entered = self.enter()?;
        // SAFETY: entered
        Ok(unsafe { convert::kind_of(entered.ctx(), self.raw()) })
    }

    pub fn is_undefined(&self) -> BridgeResult<bool> {
        Ok(self.kind()? == ValueKind::Undefined)
    }

    pub fn is_null(&self) -> BridgeResult<bool> {
        Ok(self.kind()? == ValueKind::Null)
    }

    pub fn is_array(&self) -> BridgeResult<bool> {
        Ok(self.kind()? == ValueKind::Array)
    }

    pub fn is_function(&self) -> BridgeResult<bool> {
        Ok(self.kind()? == ValueKind::Function)
    }

    /// Convert in reference mode: arrays, objects and functions come back as
    /// references to this same engine value.
    pub fn to_host(&self) -> BridgeResult<HostValue> {
        let entered = self.enter()?;
        convert::to_host(&entered.isolate, &entered.context, self.raw(), Mode::Reference)
    }

    /// Convert with a deep copy of arrays and plain objects. Functions and
    /// host objects stay references. Cycles fail with a `cyclic object`
    /// conversion error; nesting is bounded by `max_conversion_depth`.
    pub fn to_host_deep(&self) -> BridgeResult<HostValue> {
        let entered = self.enter()?;
        entered.isolate.run_script(&entered.context, |_| {
            convert::to_host(&entered.isolate, &entered.context, self.raw(), Mode::Deep)
        })?
    }

    /// Export through the engine's `JSON.stringify`. `undefined` (and
    /// anything else `JSON.stringify` drops) becomes `null`.
    pub fn to_json(&self) -> BridgeResult<serde_json::Value> {
        let entered = self.enter()?;
        let raw = self.raw();
        let json = entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered; the returned string is adopted below
            JsString::adopt(JSValueCreateJSONString(entered.ctx(), raw, 0, exception))
        })?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json.to_rust_string())?),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Deserialize through JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }

    /// JavaScript `String(value)`. May run `toString` and throw.
    pub fn to_display_string(&self) -> BridgeResult<String> {
        let entered = self.enter()?;
        let raw = self.raw();
        let string = entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered; the returned string is adopted
            JsString::adopt(JSValueToStringCopy(entered.ctx(), raw, exception))
        })?;
        Ok(string.map(|s| s.to_rust_string()).unwrap_or_default())
    }

    /// Read a property.
    pub fn get(&self, key: &str) -> BridgeResult<Value> {
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let name = JsString::new(key)?;
        let raw = entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered; object rooted through self or on the stack
            JSObjectGetProperty(entered.ctx(), object, name.raw(), exception)
        })?;
        Ok(Value::from_raw(&entered.isolate, &entered.context, raw))
    }

    /// Assign a property.
    pub fn set(&self, key: &str, value: impl Into<HostValue>) -> BridgeResult<()> {
        let value = value.into();
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let raw = convert::to_engine(&entered.isolate, &entered.context, &value)?;
        let name = JsString::new(key)?;
        entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered
            JSObjectSetProperty(
                entered.ctx(),
                object,
                name.raw(),
                raw,
                K_JS_PROPERTY_ATTRIBUTE_NONE,
                exception,
            )
        })
    }

    /// Read an indexed element.
    pub fn get_index(&self, index: u32) -> BridgeResult<Value> {
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let raw = entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered
            JSObjectGetPropertyAtIndex(entered.ctx(), object, index, exception)
        })?;
        Ok(Value::from_raw(&entered.isolate, &entered.context, raw))
    }

    /// Assign an indexed element.
    pub fn set_index(&self, index: u32, value: impl Into<HostValue>) -> BridgeResult<()> {
        let value = value.into();
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let raw = convert::to_engine(&entered.isolate, &entered.context, &value)?;
        entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered
            JSObjectSetPropertyAtIndex(entered.ctx(), object, index, raw, exception)
        })
    }

    /// `key in value`, including the prototype chain.
    pub fn has(&self, key: &str) -> BridgeResult<bool> {
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let name = JsString::new(key)?;
        entered.isolate.run_script(&entered.context, |_| unsafe {
            // SAFETY: entered
            JSObjectHasProperty(entered.ctx(), object, name.raw())
        })
    }

    /// `delete value[key]`.
    pub fn delete(&self, key: &str) -> BridgeResult<bool> {
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let name = JsString::new(key)?;
        entered.isolate.run_script(&entered.context, |exception| unsafe {
            // SAFETY: entered
            JSObjectDeleteProperty(entered.ctx(), object, name.raw(), exception)
        })
    }

    /// Enumerable string keys.
    pub fn keys(&self) -> BridgeResult<Vec<String>> {
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        // SAFETY: entered; the name array is released by the guard
        unsafe {
            let names = scopeguard::guard(
                JSObjectCopyPropertyNames(entered.ctx(), object),
                |names| JSPropertyNameArrayRelease(names),
            );
            let count = JSPropertyNameArrayGetCount(*names);
            Ok((0..count)
                .map(|i| crate::string::js_string_to_rust(JSPropertyNameArrayGetNameAtIndex(*names, i)))
                .collect())
        }
    }

    /// The `length` property as an integer (0 when absent or not a number).
    pub fn len(&self) -> BridgeResult<usize> {
        let entered = self.enter()?;
        let object = self.object(&entered)?;
        let length = entered.isolate.run_script(&entered.context, |_| {
            convert::array_length(&entered.isolate, &entered.context, object)
        })??;
        Ok(length as usize)
    }

    pub fn is_empty(&self) -> BridgeResult<bool> {
        Ok(self.len()? == 0)
    }

    /// This value as a callable, if it is one.
    pub fn as_function(&self) -> BridgeResult<Option<Function>> {
        Ok(self.is_function()?.then(|| Function::from_value(self.clone())))
    }

    /// Call this value with `this = undefined`.
    pub fn call(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        let function = self
            .as_function()?
            .ok_or_else(|| BridgeError::conversion("function", "value is not callable"))?;
        function.call(args)
    }

    /// JavaScript `===`.
    pub fn strict_equals(&self, other: &Value) -> BridgeResult<bool> {
        if self.isolate_id() != other.isolate_id() {
            return Ok(false);
        }
        let entered = self.enter()?;
        // SAFETY: entered; both values belong to this isolate
        Ok(unsafe { JSValueIsStrictEqual(entered.ctx(), self.raw(), other.raw()) })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.isolate_id() == other.isolate_id() && self.raw() == other.raw()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.isolate_id().hash(state);
        (self.raw() as usize).hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("isolate", &self.isolate_id())
            .field("handle", &format_args!("{:p}", self.raw()))
            .finish()
    }
}
