//! Bidirectional bridge between Rust and an embedded JavaScriptCore engine.
//!
//! The engine's garbage collector and Rust's ownership model meet here:
//! every engine value held by host code is a rooted [`Value`], released at
//! the next safe point after its last clone is dropped; host closures become
//! engine functions through a trampoline that never lets a Rust error or
//! panic unwind through engine frames; and script exceptions come back as
//! structured [`BridgeError`]s.
//!
//! # Example
//!
//! ```no_run
//! use jsbridge::{HostValue, Isolate};
//!
//! let isolate = Isolate::new().unwrap();
//! let ctx = isolate.default_context();
//!
//! ctx.register_fn("greet", |args| {
//!     let name = args.get_str(0).unwrap_or("world");
//!     Ok(HostValue::from(format!("hello, {}", name)))
//! })
//! .unwrap();
//!
//! let greeting = ctx.eval("greet('bridge')").unwrap();
//! assert_eq!(greeting.to_host().unwrap(), HostValue::from("hello, bridge"));
//!
//! let err = ctx.evaluate("throw new Error('x')", "test.js").unwrap_err();
//! assert_eq!(err.message(), "x");
//!
//! drop(greeting);
//! isolate.dispose().unwrap();
//! ```
//!
//! # Thread Safety
//!
//! [`Isolate`], [`Context`], [`Value`] and [`Function`] are `Send + Sync`.
//! Only one thread at a time is inside an isolate; every operation enters
//! it for its duration, following the configured [`EntryPolicy`]. Hold a
//! [`ScopeGuard`] (or a [`Locker`]) to batch several operations under one
//! entry. Guards are `!Send`.
//!
//! Long-running script can be stopped from any thread with
//! [`Isolate::terminate_execution`]; the running call returns
//! [`BridgeError::TerminationRequested`] and script cannot catch it.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

mod config;
mod context;
mod convert;
mod engine;
mod error;
mod exception;
mod function;
mod host_object;
mod isolate;
mod refs;
mod scope;
mod string;
mod value;
mod worker;

pub use config::{BridgeConfig, EntryPolicy};
pub use context::{Context, ContextId};
pub use convert::{HostValue, MAX_SAFE_INTEGER, ValueKind};
pub use engine::{Engine, EngineState, EngineStats, EngineStatsSnapshot};
pub use error::{BridgeError, BridgeResult};
pub use exception::{ExceptionKind, ExceptionRecord, HOST_ERROR_NAME};
pub use function::{CallArgs, Function, HostFunction};
pub use host_object::{DEFAULT_CLASS_NAME, HostObject, PropertyKey};
pub use isolate::{Isolate, IsolateId};
pub use refs::ReferenceTable;
pub use scope::{Locker, ScopeGuard};
pub use value::Value;
pub use worker::{IsolateWorker, WorkerHandle, WorkerOptions, WorkerStats, WorkerStatsSnapshot};
