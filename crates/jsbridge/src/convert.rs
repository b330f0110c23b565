//! Host ↔ engine value conversion.
//!
//! [`HostValue`] is the host-side representation of every engine value the
//! bridge knows how to carry. Primitives and host containers are copied;
//! engine arrays, objects and functions travel as rooted references unless a
//! deep copy is requested.
//!
//! | HostValue | Engine |
//! |---|---|
//! | `Undefined`, `Null` | `undefined`, `null` |
//! | `Bool` | boolean |
//! | `Number` | number (integers beyond ±2^53 lose precision) |
//! | `String` | string (UTF-16 inside the engine) |
//! | `List` | a new array |
//! | `Map` | a new plain object |
//! | `Array`, `Object`, `Function` | the referenced engine value |
//! | `Callback` | the engine wrapper of a host function |

use jsbridge_sys::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::ContextInner;
use crate::error::{BridgeError, BridgeResult};
use crate::exception;
use crate::function::{self, Function, HostFunction};
use crate::host_object;
use crate::isolate::IsolateInner;
use crate::refs::LocalRoots;
use crate::string::{JsString, js_string_to_rust};
use crate::value::Value;

/// Largest integer magnitude an `f64` represents exactly.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// A value on the host side of the bridge.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Copied into a new engine array.
    List(Vec<HostValue>),
    /// Copied into a new plain engine object. Keys are unordered.
    Map(BTreeMap<String, HostValue>),
    /// Reference to an engine array.
    Array(Value),
    /// Reference to any other engine value (objects, host objects, or a
    /// `Value` handed in with `From<Value>`).
    Object(Value),
    /// Reference to an engine function.
    Function(Function),
    /// A host function, wrapped for the engine on conversion.
    Callback(HostFunction),
}

impl HostValue {
    /// Short category name, as used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Callback(_) => "callback",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The number as an integer, if it is integral and exactly representable.
    pub fn as_i64(&self) -> Option<i64> {
        let n = self.as_f64()?;
        if n.fract() != 0.0 || !n.is_finite() || n.abs() > MAX_SAFE_INTEGER as f64 {
            return None;
        }
        Some(n as i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[HostValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, HostValue>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// The engine value behind a reference variant.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Array(v) | Self::Object(v) => Some(v),
            Self::Function(f) => Some(f.as_value()),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&HostFunction> {
        match self {
            Self::Callback(f) => Some(f),
            _ => None,
        }
    }

    /// Build from JSON. Numbers become `f64`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Export as JSON. Fails for `undefined`, non-finite numbers and engine
    /// references; convert references with `Value::to_host_deep` first.
    pub fn to_json(&self) -> BridgeResult<serde_json::Value> {
        Ok(match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => {
                let number = if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 {
                    Some(serde_json::Number::from(*n as i64))
                } else {
                    serde_json::Number::from_f64(*n)
                };
                serde_json::Value::Number(number.ok_or_else(|| {
                    BridgeError::conversion("number", format!("{} has no JSON representation", n))
                })?)
            }
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<BridgeResult<_>>()?,
            ),
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<BridgeResult<_>>()?,
            ),
            other => {
                return Err(BridgeError::conversion(
                    other.type_name(),
                    "has no JSON representation",
                ));
            }
        })
    }

    /// Build from any `Serialize` type (through JSON).
    pub fn from_serialize<T: Serialize>(value: &T) -> BridgeResult<Self> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// Deserialize into any `DeserializeOwned` type (through JSON).
    pub fn deserialize<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }
}

impl From<()> for HostValue {
    fn from(_: ()) -> Self {
        Self::Undefined
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<f32> for HostValue {
    fn from(n: f32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u32> for HostValue {
    fn from(n: u32) -> Self {
        Self::Number(n.into())
    }
}

/// Values beyond ±2^53 are rounded to the nearest `f64`.
impl From<i64> for HostValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

/// Values beyond 2^53 are rounded to the nearest `f64`.
impl From<u64> for HostValue {
    fn from(n: u64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<HostValue>> From<BTreeMap<String, T>> for HostValue {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Passed through to the engine unchanged.
impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}

impl From<Function> for HostValue {
    fn from(function: Function) -> Self {
        Self::Function(function)
    }
}

impl From<HostFunction> for HostValue {
    fn from(function: HostFunction) -> Self {
        Self::Callback(function)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

/// Engine-side category of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    BigInt,
    Array,
    Function,
    Object,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Symbol => "symbol",
            Self::BigInt => "bigint",
            Self::Array => "array",
            Self::Function => "function",
            Self::Object => "object",
        }
    }

    pub fn is_object(self) -> bool {
        matches!(self, Self::Array | Self::Function | Self::Object)
    }
}

/// # Safety
/// The isolate owning `raw` must be entered.
pub(crate) unsafe fn kind_of(ctx: JSContextRef, raw: JSValueRef) -> ValueKind {
    // SAFETY: caller contract
    unsafe {
        match JSValueGetType(ctx, raw) {
            K_JS_TYPE_UNDEFINED => ValueKind::Undefined,
            K_JS_TYPE_NULL => ValueKind::Null,
            K_JS_TYPE_BOOLEAN => ValueKind::Boolean,
            K_JS_TYPE_NUMBER => ValueKind::Number,
            K_JS_TYPE_STRING => ValueKind::String,
            K_JS_TYPE_SYMBOL => ValueKind::Symbol,
            K_JS_TYPE_BIGINT => ValueKind::BigInt,
            _ if JSValueIsArray(ctx, raw) => ValueKind::Array,
            _ if JSObjectIsFunction(ctx, raw as JSObjectRef) => ValueKind::Function,
            _ => ValueKind::Object,
        }
    }
}

/// How engine containers come back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Arrays, objects and functions stay references.
    Reference,
    /// Arrays and plain objects are copied recursively.
    Deep,
}

fn ensure_same_isolate(isolate: &IsolateInner, value: &Value) -> BridgeResult<()> {
    if value.isolate_id() == isolate.id() {
        Ok(())
    } else {
        Err(BridgeError::conversion(
            "foreign value",
            format!("value belongs to {}, not {}", value.isolate_id(), isolate.id()),
        ))
    }
}

/// Build the engine form of `value`. The result is unrooted: root it (or
/// hand it to the engine) before the next allocation that could collect.
pub(crate) fn to_engine(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    value: &HostValue,
) -> BridgeResult<JSValueRef> {
    to_engine_at(isolate, context, value, 0)
}

fn to_engine_at(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    value: &HostValue,
    depth: usize,
) -> BridgeResult<JSValueRef> {
    let max_depth = isolate.max_depth();
    if depth > max_depth {
        return Err(BridgeError::conversion(
            value.type_name(),
            format!("nesting deeper than {} levels", max_depth),
        ));
    }
    let ctx = context.raw();

    // SAFETY (whole match): the isolate is entered by the caller.
    match value {
        HostValue::Undefined => Ok(unsafe { JSValueMakeUndefined(ctx) }),
        HostValue::Null => Ok(unsafe { JSValueMakeNull(ctx) }),
        HostValue::Bool(b) => Ok(unsafe { JSValueMakeBoolean(ctx, *b) }),
        HostValue::Number(n) => Ok(unsafe { JSValueMakeNumber(ctx, *n) }),
        HostValue::String(s) => {
            let string = JsString::new(s)?;
            let raw = unsafe { JSValueMakeString(ctx, string.raw()) };
            if raw.is_null() {
                return Err(BridgeError::allocation("JSValueMakeString"));
            }
            Ok(raw)
        }
        HostValue::List(items) => {
            let mut roots = LocalRoots::with_capacity(ctx, items.len());
            for item in items {
                let raw = to_engine_at(isolate, context, item, depth + 1)?;
                roots.push(raw);
            }
            let mut exception: JSValueRef = std::ptr::null();
            let array = unsafe {
                JSObjectMakeArray(ctx, roots.len(), roots.as_slice().as_ptr(), &mut exception)
            };
            if array.is_null() || !exception.is_null() {
                return Err(BridgeError::allocation("JSObjectMakeArray"));
            }
            Ok(array as JSValueRef)
        }
        HostValue::Map(entries) => {
            let object = unsafe { JSObjectMake(ctx, std::ptr::null_mut(), std::ptr::null_mut()) };
            if object.is_null() {
                return Err(BridgeError::allocation("JSObjectMake"));
            }
            let mut roots = LocalRoots::new(ctx);
            roots.push(object as JSValueRef);
            for (key, item) in entries {
                let raw = to_engine_at(isolate, context, item, depth + 1)?;
                let name = JsString::new(key)?;
                let mut exception: JSValueRef = std::ptr::null();
                if key == "__proto__" {
                    roots.push(raw);
                    unsafe { define_own_property(ctx, object, &name, raw, &mut exception)? };
                } else {
                    unsafe {
                        JSObjectSetProperty(
                            ctx,
                            object,
                            name.raw(),
                            raw,
                            K_JS_PROPERTY_ATTRIBUTE_NONE,
                            &mut exception,
                        )
                    };
                }
                if !exception.is_null() {
                    return Err(BridgeError::conversion(
                        "map",
                        format!("cannot define property `{}`", key),
                    ));
                }
            }
            Ok(object as JSValueRef)
        }
        HostValue::Array(v) | HostValue::Object(v) => {
            ensure_same_isolate(isolate, v)?;
            Ok(v.raw())
        }
        HostValue::Function(f) => {
            ensure_same_isolate(isolate, f.as_value())?;
            Ok(f.as_value().raw())
        }
        HostValue::Callback(f) => function::callback_object(isolate, context, f),
    }
}

/// Convert an engine value for the host. Property reads in deep mode may
/// run getters; their exceptions are reported as script errors.
pub(crate) fn to_host(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    raw: JSValueRef,
    mode: Mode,
) -> BridgeResult<HostValue> {
    let mut path = Vec::new();
    to_host_at(isolate, context, raw, mode, &mut path)
}

fn to_host_at(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    raw: JSValueRef,
    mode: Mode,
    path: &mut Vec<usize>,
) -> BridgeResult<HostValue> {
    let ctx = context.raw();
    // SAFETY: the isolate is entered by the caller.
    let kind = unsafe { kind_of(ctx, raw) };
    match kind {
        ValueKind::Undefined => Ok(HostValue::Undefined),
        ValueKind::Null => Ok(HostValue::Null),
        ValueKind::Boolean => Ok(HostValue::Bool(unsafe { JSValueToBoolean(ctx, raw) })),
        ValueKind::Number => Ok(HostValue::Number(unsafe {
            JSValueToNumber(ctx, raw, std::ptr::null_mut())
        })),
        ValueKind::String => {
            let string = unsafe { JsString::adopt(JSValueToStringCopy(ctx, raw, std::ptr::null_mut())) }
                .ok_or_else(|| BridgeError::allocation("JSValueToStringCopy"))?;
            Ok(HostValue::String(string.to_rust_string()))
        }
        ValueKind::Symbol => Err(BridgeError::conversion(
            "symbol",
            "symbols have no host representation",
        )),
        ValueKind::BigInt => Err(BridgeError::conversion(
            "bigint",
            "bigints have no host representation",
        )),
        ValueKind::Function => {
            if let Some(callback) = function::host_function_of(isolate, ctx, raw) {
                return Ok(HostValue::Callback(callback));
            }
            Ok(HostValue::Function(Function::from_value(Value::from_raw(
                isolate, context, raw,
            ))))
        }
        ValueKind::Array if mode == Mode::Deep => {
            let object = raw as JSObjectRef;
            enter_path(isolate, path, raw)?;
            let length = array_length(isolate, context, object)?;
            let max_length = isolate.max_array_length();
            if length > max_length {
                return Err(BridgeError::conversion(
                    "array",
                    format!("length {} exceeds the limit of {}", length, max_length),
                ));
            }
            let mut items = Vec::with_capacity(length.min(1 << 16) as usize);
            for index in 0..length {
                let mut exception: JSValueRef = std::ptr::null();
                let item = unsafe { JSObjectGetPropertyAtIndex(ctx, object, index, &mut exception) };
                if !exception.is_null() {
                    return Err(exception::capture(isolate, context, exception));
                }
                items.push(to_host_at(isolate, context, item, mode, path)?);
            }
            path.pop();
            Ok(HostValue::List(items))
        }
        ValueKind::Object if mode == Mode::Deep && !host_object::is_host_object(ctx, raw) => {
            let object = raw as JSObjectRef;
            enter_path(isolate, path, raw)?;
            let names = unsafe { JSObjectCopyPropertyNames(ctx, object) };
            let names = scopeguard::guard(names, |names| unsafe { JSPropertyNameArrayRelease(names) });
            let count = unsafe { JSPropertyNameArrayGetCount(*names) };
            let mut entries = BTreeMap::new();
            for index in 0..count {
                let name = unsafe { JSPropertyNameArrayGetNameAtIndex(*names, index) };
                let key = unsafe { js_string_to_rust(name) };
                let mut exception: JSValueRef = std::ptr::null();
                let item = unsafe { JSObjectGetProperty(ctx, object, name, &mut exception) };
                if !exception.is_null() {
                    return Err(exception::capture(isolate, context, exception));
                }
                entries.insert(key, to_host_at(isolate, context, item, mode, path)?);
            }
            path.pop();
            Ok(HostValue::Map(entries))
        }
        ValueKind::Array => Ok(HostValue::Array(Value::from_raw(isolate, context, raw))),
        ValueKind::Object => Ok(HostValue::Object(Value::from_raw(isolate, context, raw))),
    }
}

fn enter_path(isolate: &IsolateInner, path: &mut Vec<usize>, raw: JSValueRef) -> BridgeResult<()> {
    if path.contains(&(raw as usize)) {
        return Err(BridgeError::conversion("cyclic object", "value contains itself"));
    }
    let max_depth = isolate.max_depth();
    if path.len() >= max_depth {
        return Err(BridgeError::conversion(
            "object",
            format!("nesting deeper than {} levels", max_depth),
        ));
    }
    path.push(raw as usize);
    Ok(())
}

/// `length` of an array-like object, clamped to `u32`.
/// `Object.defineProperty(object, name, { value, writable, enumerable,
/// configurable })`: an own data property even where a plain assignment
/// would hit an inherited setter such as `__proto__`.
///
/// # Safety
/// The isolate owning `ctx` must be entered.
unsafe fn define_own_property(
    ctx: JSContextRef,
    object: JSObjectRef,
    name: &JsString,
    value: JSValueRef,
    exception: &mut JSValueRef,
) -> BridgeResult<()> {
    let object_key = JsString::new("Object")?;
    let define_key = JsString::new("defineProperty")?;
    let flags = ["value", "writable", "enumerable", "configurable"]
        .into_iter()
        .map(JsString::new)
        .collect::<BridgeResult<Vec<_>>>()?;
    let mut roots = LocalRoots::new(ctx);
    // SAFETY: caller contract
    unsafe {
        let global = JSContextGetGlobalObject(ctx);
        let ctor = JSObjectGetProperty(ctx, global, object_key.raw(), exception);
        if !exception.is_null() || !JSValueIsObject(ctx, ctor) {
            return Err(BridgeError::conversion("map", "`Object` is not available"));
        }
        let define = JSObjectGetProperty(ctx, ctor as JSObjectRef, define_key.raw(), exception);
        if !exception.is_null() || !JSValueIsObject(ctx, define) {
            return Err(BridgeError::conversion("map", "`Object.defineProperty` is not available"));
        }

        let descriptor = JSObjectMake(ctx, std::ptr::null_mut(), std::ptr::null_mut());
        if descriptor.is_null() {
            return Err(BridgeError::allocation("JSObjectMake"));
        }
        roots.push(descriptor as JSValueRef);
        for (index, flag) in flags.iter().enumerate() {
            let item = if index == 0 { value } else { JSValueMakeBoolean(ctx, true) };
            JSObjectSetProperty(ctx, descriptor, flag.raw(), item, K_JS_PROPERTY_ATTRIBUTE_NONE, exception);
            if !exception.is_null() {
                return Ok(());
            }
        }

        let args = [object as JSValueRef, JSValueMakeString(ctx, name.raw()), descriptor as JSValueRef];
        JSObjectCallAsFunction(ctx, define as JSObjectRef, ctor as JSObjectRef, args.len(), args.as_ptr(), exception);
    }
    Ok(())
}

pub(crate) fn array_length(
    isolate: &Arc<IsolateInner>,
    context: &Arc<ContextInner>,
    object: JSObjectRef,
) -> BridgeResult<u32> {
    let ctx = context.raw();
    let name = JsString::new("length")?;
    let mut exception: JSValueRef = std::ptr::null();
    // SAFETY: entered
    let length = unsafe { JSObjectGetProperty(ctx, object, name.raw(), &mut exception) };
    if !exception.is_null() {
        return Err(exception::capture(isolate, context, exception));
    }
    let length = unsafe { JSValueToNumber(ctx, length, std::ptr::null_mut()) };
    if length.is_finite() && length > 0.0 {
        Ok(length.min(u32::MAX as f64) as u32)
    } else {
        Ok(0)
    }
}
