//! RAII wrapper for engine strings
//!
//! Strings cross the boundary as UTF-16 code units, so embedded NUL bytes
//! survive in both directions. Unpaired surrogates become U+FFFD on the way
//! out.

use jsbridge_sys::*;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{BridgeError, BridgeResult};

/// Owned `JSStringRef`, released on drop.
///
/// `!Send` and `!Sync`: strings are created and consumed inside one entered
/// scope.
pub(crate) struct JsString {
    raw: JSStringRef,
    _not_send: PhantomData<*mut ()>,
}

impl JsString {
    pub(crate) fn new(s: &str) -> BridgeResult<Self> {
        let units: Vec<u16> = s.encode_utf16().collect();
        // SAFETY: pointer and length describe `units`, which the engine copies.
        let raw = unsafe { JSStringCreateWithCharacters(units.as_ptr(), units.len()) };
        if raw.is_null() {
            return Err(BridgeError::allocation("JSStringCreateWithCharacters"));
        }
        Ok(Self {
            raw,
            _not_send: PhantomData,
        })
    }

    /// Take ownership of a string returned by a `*Copy`/`*Create` engine call.
    ///
    /// # Safety
    /// `raw` must be null or a +1 reference the caller is giving away.
    pub(crate) unsafe fn adopt(raw: JSStringRef) -> Option<Self> {
        (!raw.is_null()).then_some(Self {
            raw,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn raw(&self) -> JSStringRef {
        self.raw
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        // SAFETY: self.raw is a live string
        unsafe { JSStringGetLength(self.raw) }
    }

    pub(crate) fn to_rust_string(&self) -> String {
        // SAFETY: self.raw is a live string
        unsafe { js_string_to_rust(self.raw) }
    }
}

impl Drop for JsString {
    fn drop(&mut self) {
        // SAFETY: we own one reference
        unsafe { JSStringRelease(self.raw) };
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rust_string())
    }
}

/// Copy an engine string into a Rust `String` without consuming it.
///
/// # Safety
/// `js_str` must be null or a live `JSStringRef`.
pub(crate) unsafe fn js_string_to_rust(js_str: JSStringRef) -> String {
    if js_str.is_null() {
        return String::new();
    }
    // SAFETY: js_str is live per caller contract; the character buffer
    // lives as long as the string.
    unsafe {
        let len = JSStringGetLength(js_str);
        if len == 0 {
            return String::new();
        }
        let chars = JSStringGetCharactersPtr(js_str);
        if chars.is_null() {
            return String::new();
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(chars, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_creation() {
        let s = JsString::new("hello").unwrap();
        assert_eq!(s.to_string(), "hello");
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_empty_string() {
        let s = JsString::new("").unwrap();
        assert_eq!(s.len(), 0);
        assert_eq!(s.to_rust_string(), "");
    }

    #[test]
    fn test_embedded_nul_survives() {
        let s = JsString::new("a\0b").unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s.to_rust_string(), "a\0b");
    }

    #[test]
    fn test_length_is_utf16_units() {
        let s = JsString::new("h\u{e9}llo \u{1F600}").unwrap();
        assert_eq!(s.len(), 8);
        assert_eq!(s.to_rust_string(), "h\u{e9}llo \u{1F600}");
    }

    #[test]
    fn test_adopt_null() {
        assert!(unsafe { JsString::adopt(std::ptr::null_mut()) }.is_none());
    }
}
