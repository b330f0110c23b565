//! Integration test for engine shutdown
//!
//! Shutdown is process-wide and irreversible, so this binary holds a single
//! test that walks through the whole lifecycle.

mod common;

use jsbridge::{BridgeConfig, BridgeError, Engine, EngineState, HostValue, Isolate};
use std::sync::mpsc;
use std::thread;

#[test]
fn test_engine_shutdown_lifecycle() {
    common::init_tracing();
    assert_eq!(Engine::current_state(), EngineState::Uninitialized);
    let engine = Engine::global().unwrap();
    assert_eq!(engine.state(), EngineState::Running);
    assert_eq!(Engine::current_state(), EngineState::Running);

    let idle = Isolate::new().unwrap();
    let held = idle.default_context().eval("({ survives: false })").unwrap();

    // Shutdown is refused from inside an isolate.
    {
        let _scope = idle.enter().unwrap();
        assert!(matches!(engine.shutdown(), Err(BridgeError::IsolateEntered)));
    }
    assert_eq!(engine.state(), EngineState::Running);

    // A thread stuck in script is terminated and waited for.
    let busy = Isolate::new().unwrap();
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let looping = {
        let busy = busy.clone();
        thread::spawn(move || {
            let ctx = busy.default_context();
            ctx.register_fn("ready", move |_| {
                let _ = ready_tx.send(());
                Ok(HostValue::Undefined)
            })
            .unwrap();
            ctx.eval("ready(); while (true) {}")
        })
    };
    ready_rx.recv().unwrap();

    engine.shutdown().unwrap();
    let outcome = looping.join().unwrap();
    assert!(matches!(outcome, Err(BridgeError::TerminationRequested)));

    assert_eq!(engine.state(), EngineState::ShutDown);
    assert_eq!(Engine::current_state(), EngineState::ShutDown);
    assert!(engine.is_shut_down());
    assert_eq!(engine.isolate_count(), 0);
    assert_eq!(engine.live_roots(), 0);
    assert!(idle.is_disposed());
    assert!(busy.is_disposed());
    assert!(matches!(held.to_host(), Err(BridgeError::IsolateDisposed)));

    // Everything after shutdown is refused.
    assert!(matches!(engine.shutdown(), Err(BridgeError::EngineShutDown)));
    assert!(matches!(Engine::global(), Err(BridgeError::EngineShutDown)));
    assert!(matches!(Engine::init(BridgeConfig::default()), Err(BridgeError::EngineShutDown)));
    assert!(matches!(Isolate::new(), Err(BridgeError::EngineShutDown)));
    assert!(matches!(engine.isolate(idle.id()), Err(BridgeError::EngineShutDown)));

    let stats = engine.stats().snapshot();
    assert_eq!(stats.isolates_created, 2);
    assert_eq!(stats.isolates_alive(), 0);
}
