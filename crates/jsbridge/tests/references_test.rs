//! Integration tests for host roots and deferred releases

mod common;

use jsbridge::{BridgeError, HostFunction, HostValue, Isolate};
use std::thread;

#[test]
fn test_drop_defers_release_until_pump() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    isolate.pump_releases();
    let base = isolate.live_roots();

    let value = ctx.eval("({ a: 1 })").unwrap();
    let clone = value.clone();
    assert_eq!(isolate.live_roots(), base + 1);

    drop(value);
    assert_eq!(isolate.pending_releases(), 0);
    drop(clone);
    assert_eq!(isolate.pending_releases(), 1);
    assert_eq!(isolate.live_roots(), base + 1);

    assert_eq!(isolate.pump_releases(), 1);
    assert_eq!(isolate.pending_releases(), 0);
    assert_eq!(isolate.live_roots(), base);

    isolate.dispose().unwrap();
}

#[test]
fn test_shared_handle_counted_once() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    ctx.eval("var shared = { n: 1 }").unwrap();
    isolate.pump_releases();
    let base = isolate.live_roots();

    let first = ctx.get_global("shared").unwrap();
    let second = ctx.get_global("shared").unwrap();
    assert_eq!(first, second);
    isolate.pump_releases();
    assert_eq!(isolate.live_roots(), base + 1);

    // Two promotions of one handle: the first release only decrements.
    drop(first);
    assert_eq!(isolate.pump_releases(), 0);
    assert_eq!(isolate.live_roots(), base + 1);
    drop(second);
    assert_eq!(isolate.pump_releases(), 1);
    assert_eq!(isolate.live_roots(), base);

    isolate.dispose().unwrap();
}

#[test]
fn test_drop_on_other_thread() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    isolate.pump_releases();
    let base = isolate.live_roots();

    let value = ctx.eval("[1, 2, 3]").unwrap();
    thread::spawn(move || drop(value)).join().unwrap();
    assert_eq!(isolate.pending_releases(), 1);

    // Any outermost scope exit is a safe point.
    drop(isolate.enter().unwrap());
    assert_eq!(isolate.pending_releases(), 0);
    assert_eq!(isolate.live_roots(), base);

    isolate.dispose().unwrap();
}

#[test]
fn test_drop_inside_scope_releases_on_exit() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    isolate.pump_releases();
    let base = isolate.live_roots();

    let scope = isolate.enter().unwrap();
    let value = ctx.eval("({})").unwrap();
    drop(value);
    assert_eq!(isolate.pending_releases(), 1);
    assert_eq!(isolate.live_roots(), base + 1);
    drop(scope);
    assert_eq!(isolate.live_roots(), base);

    isolate.dispose().unwrap();
}

#[test]
fn test_rooted_value_survives_collection() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let value = ctx
        .eval("(function () { return { tag: 'kept', items: [1, 2] } })()")
        .unwrap();
    ctx.eval("for (let i = 0; i < 10000; i++) { ({ garbage: [i] }) }").unwrap();
    isolate.collect_garbage().unwrap();
    isolate.collect_garbage().unwrap();

    assert_eq!(value.get("tag").unwrap().to_host().unwrap(), HostValue::from("kept"));
    assert_eq!(
        value.get("items").unwrap().to_host_deep().unwrap(),
        HostValue::from(vec![1, 2])
    );

    drop(value);
    isolate.dispose().unwrap();
}

#[test]
fn test_dispose_purges_roots() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    let engine = isolate.engine();

    let held = ctx.eval("({ held: true })").unwrap();
    let also_held = ctx.eval("[]").unwrap();
    assert!(isolate.live_roots() >= 2);

    isolate.dispose().unwrap();
    assert!(isolate.is_disposed());
    assert_eq!(isolate.live_roots(), 0);
    assert_eq!(engine.references().live_roots(isolate.id()), 0);

    // Handles outliving their isolate report it instead of touching the heap.
    assert!(matches!(held.get("held"), Err(BridgeError::IsolateDisposed)));
    drop(held);
    drop(also_held);
    assert_eq!(isolate.pending_releases(), 0);
    assert!(matches!(isolate.dispose(), Err(BridgeError::IsolateDisposed)));
    assert!(matches!(ctx.eval("1"), Err(BridgeError::IsolateDisposed)));
}

#[test]
fn test_fresh_callbacks_are_collected() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    ctx.eval("var calls = 0; function accept(f) { calls += f(); }").unwrap();
    let accept = ctx.function("accept").unwrap();
    isolate.collect_garbage().unwrap();
    let base_roots = isolate.live_roots();
    let base_functions = isolate.host_function_count();

    for _ in 0..10_000 {
        let callback = HostFunction::new("one", |_| Ok(HostValue::from(1)));
        accept.call(&[HostValue::Callback(callback)]).unwrap();
    }
    assert_eq!(ctx.eval("calls").unwrap().to_host().unwrap(), HostValue::from(10_000));

    isolate.collect_garbage().unwrap();
    isolate.collect_garbage().unwrap();
    assert_eq!(isolate.live_roots(), base_roots);
    // The native stack is scanned conservatively, so a few wrappers may linger.
    assert!(
        isolate.host_function_count() < base_functions + 100,
        "{} host functions still registered",
        isolate.host_function_count()
    );

    drop(accept);
    isolate.dispose().unwrap();
}

#[test]
fn test_callback_rewrapped_after_collection() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    let callback = HostFunction::new("seven", |_| Ok(HostValue::from(7)));

    let first = ctx.to_engine(&HostValue::Callback(callback.clone())).unwrap();
    let again = ctx.to_engine(&HostValue::Callback(callback.clone())).unwrap();
    assert_eq!(first, again);
    drop((first, again));
    isolate.collect_garbage().unwrap();

    ctx.set_global("seven", HostValue::Callback(callback.clone())).unwrap();
    assert_eq!(ctx.eval("seven()").unwrap().to_host().unwrap(), HostValue::from(7));
    let global = ctx.get_global("seven").unwrap().to_host().unwrap();
    assert_eq!(global, HostValue::Callback(callback));

    drop(global);
    isolate.dispose().unwrap();
}
