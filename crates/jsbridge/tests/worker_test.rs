//! Integration tests for the isolate worker

mod common;

use jsbridge::{BridgeError, HostValue, IsolateWorker, WorkerOptions};
use serde_json::json;
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;

fn worker(name: &str) -> IsolateWorker {
    IsolateWorker::spawn(WorkerOptions::default().name(name)).unwrap()
}

#[tokio::test]
async fn test_eval_simple() {
    common::init_tracing();
    let worker = worker("eval-simple");
    let handle = worker.handle();

    assert_eq!(handle.eval("1 + 2").await.unwrap(), json!(3));
    assert_eq!(
        handle.eval("({ a: [1, 'two'], b: null })").await.unwrap(),
        json!({"a": [1, "two"], "b": null})
    );

    worker.shutdown().await;
}

#[tokio::test]
async fn test_eval_state_persists() {
    common::init_tracing();
    let worker = worker("eval-state");
    let handle = worker.handle();

    handle.eval("var visits = 0").await.unwrap();
    handle.eval("visits++").await.unwrap();
    handle.eval("visits++").await.unwrap();
    assert_eq!(handle.eval("visits").await.unwrap(), json!(2));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_eval_error_with_source() {
    common::init_tracing();
    let worker = worker("eval-error");
    let handle = worker.handle();

    let err = handle
        .eval_with_source("throw new TypeError('bad input')", "input.js")
        .await
        .unwrap_err();
    let record = err.exception().unwrap();
    assert_eq!(record.name, "TypeError");
    assert_eq!(record.message, "bad input");
    assert_eq!(record.file.as_deref(), Some("input.js"));

    let snapshot = handle.stats().snapshot();
    assert_eq!(snapshot.jobs_failed, 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_call_with_json_args() {
    common::init_tracing();
    let worker = worker("call");
    let handle = worker.handle();

    handle
        .eval("function describe(user, n) { return { greeting: 'hi ' + user.name, n: n * 2 } }")
        .await
        .unwrap();
    let result = handle
        .call("describe", vec![json!({"name": "ada"}), json!(21)])
        .await
        .unwrap();
    assert_eq!(result, json!({"greeting": "hi ada", "n": 42}));

    let err = handle.call("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, BridgeError::TypeConversion { .. }));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_run_closure_on_worker() {
    common::init_tracing();
    let worker = worker("run");
    let handle = worker.handle();

    let list = handle
        .run(|ctx| {
            ctx.register_fn("double", |args| {
                Ok(HostValue::from(args.get_f64(0).unwrap_or(0.0) * 2.0))
            })?;
            ctx.eval("[1, 2, 3].map(double)")?.to_host_deep()
        })
        .await
        .unwrap();
    assert_eq!(list, HostValue::from(vec![2, 4, 6]));

    // Registered state is visible to later jobs.
    assert_eq!(handle.eval("double(5)").await.unwrap(), json!(10));

    drop(list);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_panicking_job_is_contained() {
    common::init_tracing();
    let worker = worker("panic");
    let handle = worker.handle();

    let err = handle
        .run(|_| -> jsbridge::BridgeResult<()> { panic!("bad job") })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad job"));
    assert_eq!(handle.eval("'alive'").await.unwrap(), json!("alive"));

    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_try_eval_reports_full_queue() {
    common::init_tracing();
    let worker = IsolateWorker::spawn(WorkerOptions::default().name("full").queue_capacity(1)).unwrap();
    let handle = worker.handle();

    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocker = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .run(move |_| {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                    Ok(())
                })
                .await
        })
    };
    started_rx.await.unwrap();

    let queued = handle.try_eval("'queued'").unwrap();
    assert_eq!(handle.queued(), 1);
    assert!(matches!(handle.try_eval("'rejected'"), Err(BridgeError::QueueFull)));

    release_tx.send(()).unwrap();
    blocker.await.unwrap().unwrap();
    assert_eq!(queued.await.unwrap().unwrap(), json!("queued"));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_terminate_running_job() {
    common::init_tracing();
    let worker = worker("terminate");
    let handle = worker.handle();

    let running = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.eval("while (true) {}").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.terminate();

    let result = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(BridgeError::TerminationRequested)));
    assert_eq!(handle.eval("'next'").await.unwrap(), json!("next"));

    worker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disposes_isolate() {
    common::init_tracing();
    let worker = worker("shutdown");
    let handle = worker.handle();
    let isolate = worker.isolate().clone();

    handle.eval("1").await.unwrap();
    worker.shutdown().await;

    assert!(isolate.is_disposed());
    assert!(matches!(handle.eval("1").await, Err(BridgeError::IsolateDisposed)));
    assert!(matches!(handle.try_eval("1"), Err(BridgeError::IsolateDisposed)));
}

#[tokio::test]
async fn test_stats_track_jobs() {
    common::init_tracing();
    let worker = worker("stats");
    let handle = worker.handle();

    handle.eval("1").await.unwrap();
    handle.eval("2").await.unwrap();
    let _ = handle.eval("throw 1").await;

    let snapshot = worker.stats().snapshot();
    assert_eq!(snapshot.jobs_submitted, 3);
    assert_eq!(snapshot.jobs_completed, 3);
    assert_eq!(snapshot.jobs_failed, 1);
    assert_eq!(worker.stats().jobs_in_flight(), 0);

    worker.shutdown().await;
}
