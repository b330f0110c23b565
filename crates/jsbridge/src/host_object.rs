//! Host objects: engine objects whose property access is answered by Rust.
//!
//! Every host object is an instance of a per-name JSC class derived from one
//! base class that carries the interceptors. Classes are created once per
//! class name and cached for the life of the process.
//!
//! An interceptor that declines (`None` / `false`) hands the access back to
//! ordinary property semantics, so script can still add and read its own
//! properties on the object.

use dashmap::DashMap;
use jsbridge_sys::*;
use std::ffi::{CString, c_void};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use tracing::{debug, warn};

use crate::context::{Context, ContextInner};
use crate::convert::{self, HostValue, Mode};
use crate::error::{BridgeError, BridgeResult};
use crate::exception;
use crate::function::{self, CallArgs};
use crate::isolate::IsolateInner;
use crate::scope::ScopeGuard;
use crate::string::{JsString, js_string_to_rust};
use crate::value::Value;

/// Class name used when a host object does not pick its own.
pub const DEFAULT_CLASS_NAME: &str = "HostObject";

/// A property name as seen by an interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyKey {
    Named(String),
    /// A canonical array index (`"0"`, `"17"`, but not `"01"`).
    Indexed(u32),
}

impl PropertyKey {
    pub fn parse(name: &str) -> Self {
        let canonical = !name.is_empty()
            && name.bytes().all(|b| b.is_ascii_digit())
            && (name == "0" || !name.starts_with('0'));
        match name.parse::<u32>() {
            // 2^32 - 1 is not an array index
            Ok(index) if canonical && index != u32::MAX => Self::Indexed(index),
            _ => Self::Named(name.to_string()),
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Indexed(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            Self::Indexed(index) => Some(*index),
            Self::Named(_) => None,
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Indexed(index) => write!(f, "{}", index),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<u32> for PropertyKey {
    fn from(index: u32) -> Self {
        Self::Indexed(index)
    }
}

/// Property interceptors for an object implemented in Rust.
///
/// Only `get` is required. Errors (and panics) are thrown into script as
/// `HostError`s, except from `has`, which cannot throw and treats failure
/// as "absent". Objects that report [`HostObject::is_callable`] can also be
/// called from script; they come back to the host as functions.
pub trait HostObject: Send + Sync + 'static {
    fn class_name(&self) -> &str {
        DEFAULT_CLASS_NAME
    }

    /// `Some` answers the read; `None` falls through to the object's own
    /// properties and prototype chain.
    fn get(&self, key: &PropertyKey) -> anyhow::Result<Option<HostValue>>;

    /// `true` if the write was handled.
    fn set(&self, _key: &PropertyKey, _value: HostValue) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn has(&self, key: &PropertyKey) -> anyhow::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// `true` if the delete was handled.
    fn delete(&self, _key: &PropertyKey) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Keys reported to `Object.keys`, `for...in` and friends.
    fn keys(&self) -> Vec<PropertyKey> {
        Vec::new()
    }

    /// Whether `object(...)` is allowed. Read once, when the object is wrapped.
    fn is_callable(&self) -> bool {
        false
    }

    /// Answer `object(...)` from script.
    fn call(&self, _args: CallArgs) -> anyhow::Result<HostValue> {
        anyhow::bail!("{} is not a function", self.class_name())
    }
}

struct HostObjectSlot {
    object: Arc<dyn HostObject>,
    isolate: Weak<IsolateInner>,
}

struct ClassEntry {
    class: JSClassRef,
    _name: CString,
}

// SAFETY: JSC classes are immutable once created; the name is never mutated.
unsafe impl Send for ClassEntry {}
unsafe impl Sync for ClassEntry {}

static BASE_CLASS: OnceLock<ClassEntry> = OnceLock::new();
static CALLABLE_CLASS: OnceLock<ClassEntry> = OnceLock::new();
static CLASSES: LazyLock<DashMap<(String, bool), ClassEntry>> = LazyLock::new(DashMap::new);

fn base_class() -> BridgeResult<JSClassRef> {
    let entry = BASE_CLASS.get_or_init(|| {
        let name = CString::from(c"HostObject");
        let definition = JSClassDefinition {
            class_name: name.as_ptr(),
            finalize: Some(finalize),
            has_property: Some(has_property),
            get_property: Some(get_property),
            set_property: Some(set_property),
            delete_property: Some(delete_property),
            get_property_names: Some(get_property_names),
            ..Default::default()
        };
        // SAFETY: the definition's pointers outlive the class
        let class = unsafe { JSClassCreate(&definition) };
        ClassEntry { class, _name: name }
    });
    if entry.class.is_null() {
        return Err(BridgeError::allocation("JSClassCreate(HostObject)"));
    }
    Ok(entry.class)
}

/// The base class plus `callAsFunction`.
fn callable_class() -> BridgeResult<JSClassRef> {
    let base = base_class()?;
    let entry = CALLABLE_CLASS.get_or_init(|| {
        let name = CString::from(c"HostObject");
        let definition = JSClassDefinition {
            class_name: name.as_ptr(),
            parent_class: base,
            call_as_function: Some(call_as_function),
            ..Default::default()
        };
        // SAFETY: the definition's pointers outlive the class
        let class = unsafe { JSClassCreate(&definition) };
        ClassEntry { class, _name: name }
    });
    if entry.class.is_null() {
        return Err(BridgeError::allocation("JSClassCreate(HostObject)"));
    }
    Ok(entry.class)
}

fn class_for(name: &str, callable: bool) -> BridgeResult<JSClassRef> {
    let base = if callable { callable_class()? } else { base_class()? };
    if name == DEFAULT_CLASS_NAME {
        return Ok(base);
    }
    let cache_key = (name.to_string(), callable);
    if let Some(entry) = CLASSES.get(&cache_key) {
        return Ok(entry.class);
    }
    let c_name = CString::new(name)
        .map_err(|_| BridgeError::conversion("class name", "contains a NUL byte"))?;
    let entry = CLASSES.entry(cache_key).or_insert_with(|| {
        let definition = JSClassDefinition {
            class_name: c_name.as_ptr(),
            parent_class: base,
            ..Default::default()
        };
        // SAFETY: the name is stored next to the class and never freed
        let class = unsafe { JSClassCreate(&definition) };
        debug!(class = name, callable, "host object class created");
        ClassEntry { class, _name: c_name }
    });
    if entry.class.is_null() {
        return Err(BridgeError::allocation(format!("JSClassCreate({})", name)));
    }
    Ok(entry.class)
}

/// Whether `raw` is a host object. Caller must own the isolate.
pub(crate) fn is_host_object(ctx: JSContextRef, raw: JSValueRef) -> bool {
    match BASE_CLASS.get() {
        // SAFETY: caller contract
        Some(entry) if !entry.class.is_null() => unsafe { JSValueIsObjectOfClass(ctx, raw, entry.class) },
        _ => false,
    }
}

/// Build the engine object for `object`. Caller must own the isolate.
pub(crate) fn wrap(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    object: Arc<dyn HostObject>,
) -> BridgeResult<JSValueRef> {
    let class = class_for(object.class_name(), object.is_callable())?;
    let slot = Box::into_raw(Box::new(HostObjectSlot {
        object,
        isolate: Arc::downgrade(isolate),
    }));
    // SAFETY: entered; the object owns the slot and frees it in `finalize`
    let raw = unsafe { JSObjectMake(context.raw(), class, slot as *mut c_void) };
    if raw.is_null() {
        // SAFETY: the engine never saw the slot
        drop(unsafe { Box::from_raw(slot) });
        return Err(BridgeError::allocation("JSObjectMake(HostObject)"));
    }
    Ok(raw as JSValueRef)
}

/// The host object behind `raw`, if it is one of this isolate.
fn object_of(isolate: &Arc<IsolateInner>, ctx: JSContextRef, raw: JSValueRef) -> Option<Arc<dyn HostObject>> {
    if !is_host_object(ctx, raw) {
        return None;
    }
    // SAFETY: host objects always carry a HostObjectSlot
    let slot = unsafe { (JSObjectGetPrivate(raw as JSObjectRef) as *const HostObjectSlot).as_ref() }?;
    std::ptr::eq(slot.isolate.as_ptr(), Arc::as_ptr(isolate)).then(|| Arc::clone(&slot.object))
}

impl Context {
    /// Create an engine object backed by `object`.
    pub fn wrap_host_object(&self, object: impl HostObject) -> BridgeResult<Value> {
        self.wrap_shared_host_object(Arc::new(object))
    }

    /// Like [`Context::wrap_host_object`], for an object shared with host code.
    pub fn wrap_shared_host_object(&self, object: Arc<dyn HostObject>) -> BridgeResult<Value> {
        let (isolate, _scope) = self.inner.enter()?;
        let raw = wrap(&isolate, &self.inner, object)?;
        Ok(Value::from_raw(&isolate, &self.inner, raw))
    }

    /// Wrap `object` and install it as the global `name`.
    pub fn define_host_object(&self, name: &str, object: impl HostObject) -> BridgeResult<Value> {
        let value = self.wrap_host_object(object)?;
        self.set_global(name, value.clone())?;
        Ok(value)
    }
}

impl Value {
    /// The Rust object behind a host object.
    pub fn as_host_object(&self) -> BridgeResult<Option<Arc<dyn HostObject>>> {
        let isolate = Arc::clone(self.isolate_inner());
        isolate.check_alive()?;
        let _scope = ScopeGuard::enter(&isolate)?;
        let context = self.call_context();
        Ok(object_of(&isolate, context.raw(), self.raw()))
    }
}

/// Everything an interceptor needs, resolved from the engine callback.
struct Intercept {
    isolate: Arc<IsolateInner>,
    context: Arc<ContextInner>,
    object: Arc<dyn HostObject>,
    _scope: ScopeGuard,
}

impl Intercept {
    /// # Safety
    /// Must be called from an engine callback on a host object.
    unsafe fn resolve(ctx: JSContextRef, object: JSObjectRef) -> Option<Self> {
        // SAFETY: caller contract
        let slot = unsafe { (JSObjectGetPrivate(object) as *const HostObjectSlot).as_ref() }?;
        let isolate = slot.isolate.upgrade()?;
        let scope = ScopeGuard::try_enter(&isolate).ok()?;
        Some(Self {
            context: isolate.context_for_raw(ctx),
            object: Arc::clone(&slot.object),
            isolate,
            _scope: scope,
        })
    }

    fn run<T>(&self, key: &PropertyKey, op: &str, f: impl FnOnce(&dyn HostObject) -> anyhow::Result<T>) -> anyhow::Result<T> {
        catch_unwind(AssertUnwindSafe(|| f(self.object.as_ref()))).unwrap_or_else(|_| {
            warn!(class = self.object.class_name(), %key, op, "host object interceptor panicked");
            Err(anyhow::anyhow!("{}.{} panicked while handling `{}`", self.object.class_name(), op, key))
        })
    }

    fn throw(&self, ctx: JSContextRef, op: &str, cause: anyhow::Error, exception: *mut JSValueRef) {
        let function = format!("{}.{}", self.object.class_name(), op);
        if let Some(thrown) = exception::throw_host_error(&self.isolate, ctx, &function, cause)
            && !exception.is_null()
        {
            // SAFETY: engine-provided exception slot
            unsafe { *exception = thrown };
        }
    }
}

/// # Safety
/// `name` must be a live engine string.
unsafe fn key_of(name: JSStringRef) -> PropertyKey {
    // SAFETY: caller contract
    PropertyKey::parse(&unsafe { js_string_to_rust(name) })
}

unsafe extern "C" fn has_property(ctx: JSContextRef, object: JSObjectRef, name: JSStringRef) -> bool {
    // SAFETY: engine callback on a host object
    let Some(intercept) = (unsafe { Intercept::resolve(ctx, object) }) else {
        return false;
    };
    let key = unsafe { key_of(name) };
    intercept.run(&key, "has", |o| o.has(&key)).unwrap_or(false)
}

unsafe extern "C" fn get_property(
    ctx: JSContextRef,
    object: JSObjectRef,
    name: JSStringRef,
    exception: *mut JSValueRef,
) -> JSValueRef {
    // SAFETY: engine callback on a host object
    let Some(intercept) = (unsafe { Intercept::resolve(ctx, object) }) else {
        return std::ptr::null();
    };
    let key = unsafe { key_of(name) };
    let result = intercept.run(&key, "get", |o| o.get(&key)).and_then(|value| match value {
        Some(value) => Ok(convert::to_engine(&intercept.isolate, &intercept.context, &value)?),
        None => Ok(std::ptr::null()),
    });
    result.unwrap_or_else(|cause| {
        intercept.throw(ctx, "get", cause, exception);
        std::ptr::null()
    })
}

unsafe extern "C" fn set_property(
    ctx: JSContextRef,
    object: JSObjectRef,
    name: JSStringRef,
    value: JSValueRef,
    exception: *mut JSValueRef,
) -> bool {
    // SAFETY: engine callback on a host object
    let Some(intercept) = (unsafe { Intercept::resolve(ctx, object) }) else {
        return false;
    };
    let key = unsafe { key_of(name) };
    let result = convert::to_host(&intercept.isolate, &intercept.context, value, Mode::Reference)
        .map_err(anyhow::Error::from)
        .and_then(|value| intercept.run(&key, "set", |o| o.set(&key, value)));
    result.unwrap_or_else(|cause| {
        intercept.throw(ctx, "set", cause, exception);
        true
    })
}

unsafe extern "C" fn delete_property(
    ctx: JSContextRef,
    object: JSObjectRef,
    name: JSStringRef,
    exception: *mut JSValueRef,
) -> bool {
    // SAFETY: engine callback on a host object
    let Some(intercept) = (unsafe { Intercept::resolve(ctx, object) }) else {
        return false;
    };
    let key = unsafe { key_of(name) };
    intercept.run(&key, "delete", |o| o.delete(&key)).unwrap_or_else(|cause| {
        intercept.throw(ctx, "delete", cause, exception);
        true
    })
}

unsafe extern "C" fn get_property_names(
    ctx: JSContextRef,
    object: JSObjectRef,
    names: JSPropertyNameAccumulatorRef,
) {
    // SAFETY: engine callback on a host object
    let Some(intercept) = (unsafe { Intercept::resolve(ctx, object) }) else {
        return;
    };
    let keys = catch_unwind(AssertUnwindSafe(|| intercept.object.keys())).unwrap_or_default();
    for key in keys {
        if let Ok(name) = JsString::new(&key.to_string()) {
            // SAFETY: the accumulator copies the name
            unsafe { JSPropertyNameAccumulatorAddName(names, name.raw()) };
        }
    }
}

unsafe extern "C" fn call_as_function(
    ctx: JSContextRef,
    object: JSObjectRef,
    this_object: JSObjectRef,
    argument_count: usize,
    arguments: *const JSValueRef,
    exception: *mut JSValueRef,
) -> JSValueRef {
    // SAFETY: engine callback on a host object
    let undefined = unsafe { JSValueMakeUndefined(ctx) };
    let Some(intercept) = (unsafe { Intercept::resolve(ctx, object) }) else {
        return undefined;
    };
    let args = if argument_count == 0 || arguments.is_null() {
        &[][..]
    } else {
        // SAFETY: the engine passes `argument_count` live values
        unsafe { std::slice::from_raw_parts(arguments, argument_count) }
    };
    let class = intercept.object.class_name().to_string();
    let result = function::call_args_from_raw(
        &intercept.isolate,
        &intercept.context,
        &format!("{}.call", class),
        this_object,
        args,
    )
    .map_err(anyhow::Error::from)
    .and_then(|args| {
        catch_unwind(AssertUnwindSafe(|| intercept.object.call(args))).unwrap_or_else(|_| {
            warn!(class = %class, "host object call panicked");
            Err(anyhow::anyhow!("{}.call panicked", class))
        })
    })
    .and_then(|value| Ok(convert::to_engine(&intercept.isolate, &intercept.context, &value)?));
    result.unwrap_or_else(|cause| {
        intercept.throw(ctx, "call", cause, exception);
        undefined
    })
}

unsafe extern "C" fn finalize(object: JSObjectRef) {
    // SAFETY: the slot was leaked into this object by `wrap`
    unsafe {
        let slot = JSObjectGetPrivate(object) as *mut HostObjectSlot;
        if !slot.is_null() {
            JSObjectSetPrivate(object, std::ptr::null_mut());
            drop(Box::from_raw(slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Isolate;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[test]
    fn test_property_key_parsing() {
        assert_eq!(PropertyKey::parse("0"), PropertyKey::Indexed(0));
        assert_eq!(PropertyKey::parse("42"), PropertyKey::Indexed(42));
        assert_eq!(PropertyKey::parse("01"), PropertyKey::Named("01".into()));
        assert_eq!(PropertyKey::parse("-1"), PropertyKey::Named("-1".into()));
        assert_eq!(PropertyKey::parse("4294967295"), PropertyKey::Named("4294967295".into()));
        assert_eq!(PropertyKey::parse("length"), PropertyKey::Named("length".into()));
        assert_eq!(PropertyKey::from(7u32).to_string(), "7");
    }

    struct Settings {
        values: Mutex<BTreeMap<String, HostValue>>,
    }

    impl HostObject for Settings {
        fn class_name(&self) -> &str {
            "Settings"
        }

        fn get(&self, key: &PropertyKey) -> anyhow::Result<Option<HostValue>> {
            Ok(key.as_name().and_then(|name| self.values.lock().get(name).cloned()))
        }

        fn set(&self, key: &PropertyKey, value: HostValue) -> anyhow::Result<bool> {
            match key {
                PropertyKey::Named(name) if name.starts_with('_') => {
                    anyhow::bail!("`{}` is reserved", name)
                }
                PropertyKey::Named(name) => {
                    self.values.lock().insert(name.clone(), value);
                    Ok(true)
                }
                PropertyKey::Indexed(_) => Ok(false),
            }
        }

        fn delete(&self, key: &PropertyKey) -> anyhow::Result<bool> {
            Ok(key.as_name().is_some_and(|name| self.values.lock().remove(name).is_some()))
        }

        fn keys(&self) -> Vec<PropertyKey> {
            self.values.lock().keys().map(|k| PropertyKey::Named(k.clone())).collect()
        }
    }

    fn settings() -> Settings {
        let mut values = BTreeMap::new();
        values.insert("mode".to_string(), HostValue::from("fast"));
        Settings { values: Mutex::new(values) }
    }

    #[test]
    fn test_interceptors() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        ctx.define_host_object("settings", settings()).unwrap();

        assert_eq!(ctx.eval("settings.mode").unwrap().to_host().unwrap(), HostValue::from("fast"));
        assert_eq!(ctx.eval("'mode' in settings").unwrap().to_host().unwrap(), HostValue::from(true));
        ctx.eval("settings.level = 3").unwrap();
        assert_eq!(ctx.eval("settings.level * 2").unwrap().to_host().unwrap(), HostValue::from(6));
        assert_eq!(
            ctx.eval("Object.getOwnPropertyNames(settings).sort().join(',')").unwrap().to_host().unwrap(),
            HostValue::from("level,mode")
        );
        assert_eq!(ctx.eval("delete settings.mode; settings.mode").unwrap().to_host().unwrap(), HostValue::Undefined);
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_declined_access_uses_ordinary_properties() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        ctx.define_host_object("settings", settings()).unwrap();
        ctx.eval("settings[0] = 'own'").unwrap();
        assert_eq!(ctx.eval("settings[0]").unwrap().to_host().unwrap(), HostValue::from("own"));
        assert_eq!(ctx.eval("settings.missing").unwrap().to_host().unwrap(), HostValue::Undefined);
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_interceptor_error_is_thrown() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        ctx.define_host_object("settings", settings()).unwrap();
        let caught = ctx
            .eval("try { settings._secret = 1; 'no' } catch (e) { e.name + ': ' + e.message }")
            .unwrap();
        assert_eq!(caught.to_host().unwrap(), HostValue::from("HostError: `_secret` is reserved"));
        let err = ctx.eval("settings._x = 1").unwrap_err();
        match err {
            BridgeError::HostCallback { function, .. } => assert_eq!(function, "Settings.set"),
            other => panic!("unexpected error: {other}"),
        }
        isolate.dispose().unwrap();
    }

    #[test]
    fn test_as_host_object_and_deep_conversion() {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.default_context();
        let shared: Arc<dyn HostObject> = Arc::new(settings());
        let value = ctx.wrap_shared_host_object(Arc::clone(&shared)).unwrap();
        let back = value.as_host_object().unwrap().unwrap();
        assert!(Arc::ptr_eq(&back, &shared));
        assert!(ctx.eval("({})").unwrap().as_host_object().unwrap().is_none());

        // Host objects stay references under deep conversion.
        ctx.set_global("holder", HostValue::Map(BTreeMap::from([("s".to_string(), HostValue::from(value.clone()))])))
            .unwrap();
        let deep = ctx.get_global("holder").unwrap().to_host_deep().unwrap();
        let inner = deep.as_map().and_then(|m| m.get("s")).and_then(HostValue::as_value).unwrap();
        assert_eq!(inner, &value);
        isolate.dispose().unwrap();
    }
}
