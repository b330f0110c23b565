//! Cross-heap root bookkeeping.
//!
//! The engine's collector knows nothing about Rust ownership, so every
//! engine value reachable from host code is registered here and kept alive
//! with `JSValueProtect`. The table counts host references per
//! `(isolate, handle)`: the first reference protects, the last release
//! unprotects.
//!
//! Releases are deferred. Dropping a [`PersistentRef`] never touches the
//! engine; it only sends the [`RootKey`] down the isolate's release channel.
//! The owning thread drains that channel at safe points (outermost scope
//! exit, `Isolate::pump_releases`, `Isolate::collect_garbage`).

use dashmap::DashMap;
use jsbridge_sys::*;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::isolate::{IsolateId, IsolateInner};

/// Identity of one rooted engine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RootKey {
    pub isolate: IsolateId,
    pub handle: usize,
}

impl RootKey {
    pub(crate) fn new(isolate: IsolateId, raw: JSValueRef) -> Self {
        Self {
            isolate,
            handle: raw as usize,
        }
    }

    pub(crate) fn raw(&self) -> JSValueRef {
        self.handle as JSValueRef
    }
}

/// Process-wide reference counts for rooted handles.
///
/// Only counts live here; the protect/unprotect calls are made by the
/// isolate that owns the handle, while it is entered.
#[derive(Debug, Default)]
pub struct ReferenceTable {
    entries: DashMap<RootKey, usize>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new host reference. Returns `true` for the first one, in
    /// which case the caller must protect the handle.
    pub(crate) fn retain(&self, key: RootKey) -> bool {
        let mut count = self.entries.entry(key).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one host reference. Returns `true` when it was the last, in
    /// which case the caller must unprotect the handle.
    pub(crate) fn release(&self, key: RootKey) -> bool {
        let removed = self
            .entries
            .remove_if_mut(&key, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            })
            .is_some();
        if !removed && !self.entries.contains_key(&key) {
            tracing::warn!(isolate = key.isolate.0, handle = key.handle, "release of unknown root");
        }
        removed
    }

    /// Forget every entry of a disposed isolate. Returns how many were dropped.
    pub(crate) fn purge_isolate(&self, isolate: IsolateId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.isolate != isolate);
        before.saturating_sub(self.entries.len())
    }

    /// Host reference count for a handle (0 when not rooted).
    #[cfg(test)]
    pub(crate) fn count(&self, key: RootKey) -> usize {
        self.entries.get(&key).map(|entry| *entry).unwrap_or(0)
    }

    /// Number of distinct rooted handles owned by `isolate`.
    pub fn live_roots(&self, isolate: IsolateId) -> usize {
        self.entries.iter().filter(|entry| entry.key().isolate == isolate).count()
    }

    /// Number of distinct rooted handles across all isolates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A counted root for one engine value.
///
/// Not `Clone`: `Value` clones share one `Arc<PersistentRef>`, so each
/// promotion is released exactly once, by `Drop`.
pub(crate) struct PersistentRef {
    raw: JSValueRef,
    isolate: Arc<IsolateInner>,
}

// SAFETY: the raw handle is only dereferenced by engine calls made while the
// owning isolate is entered; Drop only sends an integer key on a channel.
unsafe impl Send for PersistentRef {}
unsafe impl Sync for PersistentRef {}

impl PersistentRef {
    /// Promote `raw` into the reference table.
    ///
    /// The caller must have entered `isolate` and `raw` must belong to it.
    pub(crate) fn new(isolate: &Arc<IsolateInner>, raw: JSValueRef) -> Self {
        let key = RootKey::new(isolate.id(), raw);
        if isolate.refs().retain(key) {
            // SAFETY: entered; raw is a live value of this isolate
            unsafe { JSValueProtect(isolate.default_raw(), raw) };
        }
        Self {
            raw,
            isolate: Arc::clone(isolate),
        }
    }

    pub(crate) fn raw(&self) -> JSValueRef {
        self.raw
    }

    pub(crate) fn isolate(&self) -> &Arc<IsolateInner> {
        &self.isolate
    }
}

impl Drop for PersistentRef {
    fn drop(&mut self) {
        self.isolate.queue_release(RootKey::new(self.isolate.id(), self.raw));
    }
}

/// Temporary roots for intermediate values.
///
/// The collector scans the native stack conservatively but not the Rust
/// heap, so values parked in a `Vec` while an array or argument list is
/// being built must be protected until the engine holds them.
pub(crate) struct LocalRoots {
    ctx: JSContextRef,
    values: Vec<JSValueRef>,
    _not_send: PhantomData<*mut ()>,
}

impl LocalRoots {
    pub(crate) fn new(ctx: JSContextRef) -> Self {
        Self::with_capacity(ctx, 0)
    }

    pub(crate) fn with_capacity(ctx: JSContextRef, capacity: usize) -> Self {
        Self {
            ctx,
            values: Vec::with_capacity(capacity),
            _not_send: PhantomData,
        }
    }

    /// Root `raw` for the lifetime of the guard.
    pub(crate) fn push(&mut self, raw: JSValueRef) -> JSValueRef {
        // SAFETY: caller is inside an entered scope of ctx's isolate
        unsafe { JSValueProtect(self.ctx, raw) };
        self.values.push(raw);
        raw
    }

    pub(crate) fn as_slice(&self) -> &[JSValueRef] {
        &self.values
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }
}

impl Drop for LocalRoots {
    fn drop(&mut self) {
        for raw in self.values.drain(..) {
            // SAFETY: balanced with the protect in push()
            unsafe { JSValueUnprotect(self.ctx, raw) };
        }
    }
}
