//! Function trampoline.
//!
//! Host → script: a [`HostFunction`] becomes an engine object of one shared
//! JSC class. Its private data is a [`FunctionSlot`] naming the isolate and
//! the registry id; the class's `callAsFunction` entry point resolves the id,
//! converts arguments, runs the closure and converts the result back. Errors
//! and panics never cross engine frames; they are thrown into script as
//! `HostError`s.
//!
//! Script → host: [`Function`] wraps an engine function and calls it with
//! host arguments.

use jsbridge_sys::*;
use std::ffi::c_void;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{trace, warn};

use crate::context::{Context, ContextInner};
use crate::convert::{self, HostValue, Mode};
use crate::error::{BridgeError, BridgeResult};
use crate::exception;
use crate::isolate::IsolateInner;
use crate::refs::LocalRoots;
use crate::scope::ScopeGuard;
use crate::string::JsString;
use crate::value::Value;

type Callback = dyn Fn(CallArgs) -> anyhow::Result<HostValue> + Send + Sync;

struct HostFunctionInner {
    name: String,
    callback: Box<Callback>,
}

/// A host closure callable from script.
///
/// Cheap to clone. Identity is the closure allocation: converting the same
/// `HostFunction` twice into one context yields the same engine function
/// for as long as script keeps that function alive.
#[derive(Clone)]
pub struct HostFunction {
    inner: Arc<HostFunctionInner>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallArgs) -> anyhow::Result<HostValue> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(HostFunctionInner {
                name: name.into(),
                callback: Box::new(f),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Run the closure directly, without the engine.
    pub fn invoke(&self, args: CallArgs) -> anyhow::Result<HostValue> {
        (self.inner.callback)(args)
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostFunction").field(&self.inner.name).finish()
    }
}

static UNDEFINED: HostValue = HostValue::Undefined;

/// Arguments of one host function call, converted in reference mode.
pub struct CallArgs {
    this: HostValue,
    args: Vec<HostValue>,
    context: Context,
    function: String,
}

impl CallArgs {
    pub fn new(context: Context, this: HostValue, args: Vec<HostValue>) -> Self {
        Self {
            this,
            args,
            context,
            function: String::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument `index`; missing arguments read as `undefined`.
    pub fn get(&self, index: usize) -> &HostValue {
        self.args.get(index).unwrap_or(&UNDEFINED)
    }

    pub fn arg(&self, index: usize) -> HostValue {
        self.get(index).clone()
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        self.get(index).as_f64()
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).as_str()
    }

    pub fn args(&self) -> &[HostValue] {
        &self.args
    }

    pub fn into_args(self) -> Vec<HostValue> {
        self.args
    }

    pub fn this(&self) -> &HostValue {
        &self.this
    }

    /// The context the call came from.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Name of the host function being called.
    pub fn function_name(&self) -> &str {
        &self.function
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs")
            .field("function", &self.function)
            .field("this", &self.this)
            .field("args", &self.args)
            .finish()
    }
}

/// An engine function referenced from host code.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Function {
    value: Value,
}

impl Function {
    pub(crate) fn from_value(value: Value) -> Self {
        Self { value }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// The function's `name` property.
    pub fn name(&self) -> BridgeResult<String> {
        self.value.get("name")?.to_display_string()
    }

    /// Call with `this = undefined`.
    pub fn call(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.call_with_this(&HostValue::Undefined, args)
    }

    /// Call with an explicit receiver. Primitive receivers are dropped.
    pub fn call_with_this(&self, this: &HostValue, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.with_result(this, args, |isolate, context, raw| {
            convert::to_host(isolate, context, raw, Mode::Reference)
        })
    }

    /// Call and keep the result as an engine value.
    pub fn call_value(&self, args: &[HostValue]) -> BridgeResult<Value> {
        self.with_result(&HostValue::Undefined, args, |isolate, context, raw| {
            Ok(Value::from_raw(isolate, context, raw))
        })
    }

    fn with_result<T>(
        &self,
        this: &HostValue,
        args: &[HostValue],
        convert_result: impl FnOnce(&Arc<IsolateInner>, &Arc<ContextInner>, JSValueRef) -> BridgeResult<T>,
    ) -> BridgeResult<T> {
        let isolate = Arc::clone(self.value.isolate_inner());
        isolate.check_alive()?;
        let _scope = ScopeGuard::enter(&isolate)?;
        let context = self.value.call_context();
        let ctx = context.raw();

        let mut roots = LocalRoots::with_capacity(ctx, args.len() + 1);
        let receiver = match this {
            HostValue::Undefined | HostValue::Null => std::ptr::null_mut(),
            other => {
                let raw = roots.push(convert::to_engine(&isolate, &context, other)?);
                // SAFETY: entered
                if unsafe { JSValueIsObject(ctx, raw) } {
                    raw as JSObjectRef
                } else {
                    std::ptr::null_mut()
                }
            }
        };
        let argv: Vec<JSValueRef> = args
            .iter()
            .map(|arg| Ok(roots.push(convert::to_engine(&isolate, &context, arg)?)))
            .collect::<BridgeResult<_>>()?;

        let function = self.value.raw() as JSObjectRef;
        let raw = isolate.run_script(&context, |exception| unsafe {
            // SAFETY: entered; arguments are rooted by `roots`
            JSObjectCallAsFunction(ctx, function, receiver, argv.len(), argv.as_ptr(), exception)
        })?;
        let raw = if raw.is_null() {
            // SAFETY: entered
            unsafe { JSValueMakeUndefined(ctx) }
        } else {
            raw
        };
        convert_result(&isolate, &context, raw)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Function").field(&self.value).finish()
    }
}

/// Private data of a host-function object.
struct FunctionSlot {
    isolate: Weak<IsolateInner>,
    id: u64,
}

struct ClassRef(JSClassRef);

// SAFETY: JSC classes are immutable once created and usable from any thread.
unsafe impl Send for ClassRef {}
unsafe impl Sync for ClassRef {}

static FUNCTION_CLASS: OnceLock<ClassRef> = OnceLock::new();

fn function_class() -> BridgeResult<JSClassRef> {
    let class = FUNCTION_CLASS.get_or_init(|| {
        let definition = JSClassDefinition {
            class_name: c"HostFunction".as_ptr(),
            attributes: K_JS_CLASS_ATTRIBUTE_NO_AUTOMATIC_PROTOTYPE,
            call_as_function: Some(call_host_function),
            finalize: Some(finalize_host_function),
            ..Default::default()
        };
        // SAFETY: the definition only points at 'static data
        ClassRef(unsafe { JSClassCreate(&definition) })
    });
    if class.0.is_null() {
        return Err(BridgeError::allocation("JSClassCreate(HostFunction)"));
    }
    Ok(class.0)
}

/// The engine wrapper for `function` in `context`. Reused while the engine
/// keeps it alive, created again once it has been collected. Caller must own
/// the isolate.
pub(crate) fn callback_object(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    function: &HostFunction,
) -> BridgeResult<JSValueRef> {
    let ctx = context.raw();
    let map = isolate.callback_map(context)?;
    let key = function.key() as *mut c_void;
    // SAFETY: entered; the map belongs to this context
    let cached = unsafe { JSWeakObjectMapGet(ctx, map, key) };
    if !cached.is_null() {
        return Ok(cached as JSValueRef);
    }

    let class = function_class()?;
    let id = isolate.register_function(function.clone());
    let slot = Box::into_raw(Box::new(FunctionSlot {
        isolate: Arc::downgrade(isolate),
        id,
    }));
    // SAFETY: entered; on success the object owns `slot` and frees it in
    // its finalizer
    let object = unsafe { JSObjectMake(ctx, class, slot as *mut c_void) };
    if object.is_null() {
        // SAFETY: the engine never saw the slot
        drop(unsafe { Box::from_raw(slot) });
        isolate.functions.remove(&id);
        return Err(BridgeError::allocation("JSObjectMake(HostFunction)"));
    }

    // SAFETY: entered; `name` is defined before the prototype is set so the
    // read-only `Function.prototype.name` cannot shadow it.
    unsafe {
        define_name(ctx, object, function.name())?;
        if let Some(prototype) = function_prototype(ctx) {
            JSObjectSetPrototype(ctx, object, prototype);
        }
        JSWeakObjectMapSet(ctx, map, key, object);
    }
    trace!(isolate = %isolate.id(), context = %context.id(), function = function.name(), id, "host function wrapped");
    Ok(object as JSValueRef)
}

unsafe fn define_name(ctx: JSContextRef, object: JSObjectRef, name: &str) -> BridgeResult<()> {
    let key = JsString::new("name")?;
    let value = JsString::new(name)?;
    // SAFETY: caller contract
    unsafe {
        JSObjectSetProperty(
            ctx,
            object,
            key.raw(),
            JSValueMakeString(ctx, value.raw()),
            K_JS_PROPERTY_ATTRIBUTE_READ_ONLY | K_JS_PROPERTY_ATTRIBUTE_DONT_ENUM,
            std::ptr::null_mut(),
        );
    }
    Ok(())
}

/// `Function.prototype` of the context's realm.
unsafe fn function_prototype(ctx: JSContextRef) -> Option<JSValueRef> {
    let function_key = JsString::new("Function").ok()?;
    let prototype_key = JsString::new("prototype").ok()?;
    // SAFETY: caller contract
    unsafe {
        let global = JSContextGetGlobalObject(ctx);
        let ctor = JSObjectGetProperty(ctx, global, function_key.raw(), std::ptr::null_mut());
        if ctor.is_null() || !JSValueIsObject(ctx, ctor) {
            return None;
        }
        let prototype =
            JSObjectGetProperty(ctx, ctor as JSObjectRef, prototype_key.raw(), std::ptr::null_mut());
        (!prototype.is_null() && JSValueIsObject(ctx, prototype)).then_some(prototype)
    }
}

/// The `HostFunction` behind an engine value of this isolate, if it is a
/// host-function wrapper.
pub(crate) fn host_function_of(
    isolate: &Arc<IsolateInner>,
    ctx: JSContextRef,
    raw: JSValueRef,
) -> Option<HostFunction> {
    let class = function_class().ok()?;
    // SAFETY: entered; objects of this class carry a FunctionSlot
    unsafe {
        if !JSValueIsObjectOfClass(ctx, raw, class) {
            return None;
        }
        let slot = JSObjectGetPrivate(raw as JSObjectRef) as *const FunctionSlot;
        let slot = slot.as_ref()?;
        if !std::ptr::eq(slot.isolate.as_ptr(), Arc::as_ptr(isolate)) {
            return None;
        }
        isolate.functions.get(&slot.id).map(|entry| entry.value().clone())
    }
}

unsafe extern "C" fn call_host_function(
    ctx: JSContextRef,
    function: JSObjectRef,
    this_object: JSObjectRef,
    argument_count: usize,
    arguments: *const JSValueRef,
    exception: *mut JSValueRef,
) -> JSValueRef {
    // SAFETY: the engine hands us live pointers for the duration of the call
    unsafe {
        let undefined = JSValueMakeUndefined(ctx);
        let Some(slot) = (JSObjectGetPrivate(function) as *const FunctionSlot).as_ref() else {
            return undefined;
        };
        let Some(isolate) = slot.isolate.upgrade() else {
            return undefined;
        };
        let Some(callback) = isolate.functions.get(&slot.id).map(|entry| entry.value().clone()) else {
            warn!(isolate = %isolate.id(), id = slot.id, "call to unregistered host function");
            return undefined;
        };
        let args = if argument_count == 0 || arguments.is_null() {
            &[][..]
        } else {
            std::slice::from_raw_parts(arguments, argument_count)
        };

        match invoke(&isolate, ctx, &callback, this_object, args) {
            Ok(result) => result,
            Err(cause) => {
                if let Some(thrown) = exception::throw_host_error(&isolate, ctx, callback.name(), cause)
                    && !exception.is_null()
                {
                    *exception = thrown;
                }
                undefined
            }
        }
    }
}

/// Reference-mode host view of an engine call's receiver and arguments.
pub(crate) fn call_args_from_raw(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    function: &str,
    this_object: JSObjectRef,
    args: &[JSValueRef],
) -> BridgeResult<CallArgs> {
    let this = if this_object.is_null() {
        HostValue::Undefined
    } else {
        convert::to_host(isolate, context, this_object as JSValueRef, Mode::Reference)?
    };
    let args = args
        .iter()
        .map(|&raw| convert::to_host(isolate, context, raw, Mode::Reference))
        .collect::<BridgeResult<Vec<_>>>()?;
    Ok(CallArgs {
        this,
        args,
        context: Context::from_inner(Arc::clone(context)),
        function: function.to_string(),
    })
}

/// One host call, re-entering the isolate for its duration.
fn invoke(
    isolate: &Arc<IsolateInner>,
    ctx: JSContextRef,
    callback: &HostFunction,
    this_object: JSObjectRef,
    args: &[JSValueRef],
) -> anyhow::Result<JSValueRef> {
    let _scope = ScopeGuard::try_enter(isolate)?;
    let context = isolate.context_for_raw(ctx);
    let call_args = call_args_from_raw(isolate, &context, callback.name(), this_object, args)?;

    let result = catch_unwind(AssertUnwindSafe(|| callback.invoke(call_args))).map_err(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(function = callback.name(), %message, "host function panicked");
        anyhow::anyhow!("host function `{}` panicked: {}", callback.name(), message)
    })??;

    Ok(convert::to_engine(isolate, &context, &result)?)
}

unsafe extern "C" fn finalize_host_function(object: JSObjectRef) {
    // SAFETY: the slot was leaked into this object by callback_object
    unsafe {
        let slot = JSObjectGetPrivate(object) as *mut FunctionSlot;
        if slot.is_null() {
            return;
        }
        JSObjectSetPrivate(object, std::ptr::null_mut());
        let slot = Box::from_raw(slot);
        if let Some(isolate) = slot.isolate.upgrade() {
            isolate.functions.remove(&slot.id);
        }
    }
}
