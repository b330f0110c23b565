//! Isolate worker: one isolate driven from async code
//!
//! [`IsolateWorker::spawn`] starts a dedicated thread that owns a fresh
//! isolate and processes jobs from a bounded queue. A cloneable
//! [`WorkerHandle`] submits jobs and awaits their results over oneshot
//! channels. Panics inside jobs are caught and reported as errors. While
//! idle, the worker drains the isolate's release queue.
//!
//! # Example
//!
//! ```no_run
//! use jsbridge::{IsolateWorker, WorkerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let worker = IsolateWorker::spawn(WorkerOptions::default()).unwrap();
//!     let handle = worker.handle();
//!
//!     let result = handle.eval("1 + 1").await.unwrap();
//!     assert_eq!(result, serde_json::json!(2));
//!
//!     worker.shutdown().await;
//! }
//! ```

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, trace, warn};

use crate::context::Context;
use crate::convert::HostValue;
use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::isolate::{Isolate, IsolateId};

type Response = oneshot::Sender<BridgeResult<serde_json::Value>>;

/// Job submitted to the worker
enum Job {
    /// Evaluate JavaScript code
    Eval {
        script: String,
        source_url: Option<String>,
        response: Response,
    },
    /// Call a global function
    Call {
        function: String,
        args: Vec<serde_json::Value>,
        response: Response,
    },
    /// Run a host closure against the worker's context
    Run(Box<dyn FnOnce(&Context) -> BridgeResult<()> + Send>),
    /// Shutdown signal
    Shutdown,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Thread name
    pub name: String,
    /// Job queue capacity; defaults to `worker_queue_capacity` from the
    /// engine configuration.
    pub queue_capacity: Option<usize>,
    /// How long the worker waits for a job before pumping releases.
    pub idle_tick: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "jsbridge-worker".to_string(),
            queue_capacity: None,
            idle_tick: Duration::from_millis(50),
        }
    }
}

impl WorkerOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the job queue capacity (backpressure threshold)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    pub fn idle_tick(mut self, tick: Duration) -> Self {
        self.idle_tick = tick;
        self
    }
}

/// Statistics about worker operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Total number of jobs submitted
    pub jobs_submitted: AtomicU64,
    /// Total number of jobs completed (successfully or with error)
    pub jobs_completed: AtomicU64,
    /// Number of jobs that failed with an error
    pub jobs_failed: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Jobs submitted and not completed yet
    pub fn jobs_in_flight(&self) -> u64 {
        let submitted = self.jobs_submitted.load(Ordering::Relaxed);
        let completed = self.jobs_completed.load(Ordering::Relaxed);
        submitted.saturating_sub(completed)
    }

    fn finish<T>(&self, result: &BridgeResult<T>) {
        if result.is_err() {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of worker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// A thread owning one isolate.
pub struct IsolateWorker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl IsolateWorker {
    /// Create an isolate in the global engine and start its thread.
    pub fn spawn(options: WorkerOptions) -> BridgeResult<Self> {
        let engine = Engine::global()?;
        let capacity = options
            .queue_capacity
            .unwrap_or(engine.config().worker_queue_capacity)
            .max(1);
        let isolate = engine.create_isolate()?;
        let (job_tx, job_rx) = bounded::<Job>(capacity);
        let stats = Arc::new(WorkerStats::default());

        let worker_isolate = isolate.clone();
        let worker_stats = Arc::clone(&stats);
        let idle_tick = options.idle_tick;
        let thread = std::thread::Builder::new()
            .name(options.name.clone())
            .spawn(move || run_worker(worker_isolate, job_rx, worker_stats, idle_tick))
            .map_err(|e| {
                let _ = isolate.dispose();
                BridgeError::internal(format!("Failed to spawn worker: {}", e))
            })?;

        debug!(name = %options.name, isolate = %isolate.id(), capacity, "worker spawned");
        Ok(Self {
            handle: WorkerHandle {
                job_tx,
                stats,
                isolate,
            },
            thread: Some(thread),
        })
    }

    /// Get a thread-safe handle for submitting jobs
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn isolate(&self) -> &Isolate {
        &self.handle.isolate
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.handle.stats
    }

    /// Stop the thread after the queued jobs and dispose the isolate.
    ///
    /// A job that never finishes blocks shutdown; call
    /// [`WorkerHandle::terminate`] first to cut it short.
    pub async fn shutdown(mut self) {
        let _ = self.handle.job_tx.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            // Use spawn_blocking to avoid blocking the async runtime
            tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    warn!("worker thread panicked");
                }
            })
            .await
            .ok();
        }
    }
}

impl Drop for IsolateWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Detach: the thread exits and disposes its isolate on its own.
            let _ = self.handle.job_tx.try_send(Job::Shutdown);
        }
    }
}

fn run_worker(isolate: Isolate, job_rx: Receiver<Job>, stats: Arc<WorkerStats>, idle_tick: Duration) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("jsbridge-worker")
        .to_string();
    let _span = info_span!("worker", name = %thread_name, isolate = %isolate.id()).entered();
    debug!("Worker starting");

    let context = isolate.default_context();
    loop {
        match job_rx.recv_timeout(idle_tick) {
            Ok(Job::Shutdown) => break,
            Ok(job) => execute_job(&context, job, &stats),
            Err(RecvTimeoutError::Timeout) => {
                let released = isolate.pump_releases();
                if released > 0 {
                    trace!(released, "idle release pump");
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Job channel disconnected");
                break;
            }
        }
    }

    match isolate.dispose() {
        Ok(()) | Err(BridgeError::IsolateDisposed) => {}
        Err(e) => error!(error = %e, "Failed to dispose worker isolate"),
    }
    debug!("Worker stopped");
}

fn execute_job(context: &Context, job: Job, stats: &WorkerStats) {
    match job {
        Job::Eval {
            script,
            source_url,
            response,
        } => {
            let source = source_url.as_deref().unwrap_or("<eval>");
            let result = guarded(|| context.evaluate(&script, source)?.to_json());
            stats.finish(&result);
            let _ = response.send(result);
        }
        Job::Call {
            function,
            args,
            response,
        } => {
            let result = guarded(|| {
                let args: Vec<HostValue> = args.into_iter().map(HostValue::from_json).collect();
                context.function(&function)?.call_value(&args)?.to_json()
            });
            stats.finish(&result);
            let _ = response.send(result);
        }
        Job::Run(f) => {
            let result = guarded(|| f(context));
            stats.finish(&result);
        }
        Job::Shutdown => {}
    }
}

/// Run a job, turning a panic into an error.
fn guarded<T>(f: impl FnOnce() -> BridgeResult<T>) -> BridgeResult<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(%message, "Job panicked");
        Err(BridgeError::internal(format!("Job panicked: {}", message)))
    })
}

/// Thread-safe handle for submitting jobs to an [`IsolateWorker`]
#[derive(Clone)]
pub struct WorkerHandle {
    job_tx: Sender<Job>,
    stats: Arc<WorkerStats>,
    isolate: Isolate,
}

impl WorkerHandle {
    fn submit(&self, job: Job) -> BridgeResult<()> {
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.job_tx.send(job).map_err(|_| BridgeError::IsolateDisposed)
    }

    /// Evaluate JavaScript code and return the result as JSON
    pub async fn eval(&self, script: impl Into<String>) -> BridgeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Eval {
            script: script.into(),
            source_url: None,
            response: tx,
        })?;
        rx.await
            .map_err(|_| BridgeError::internal("Worker dropped response"))?
    }

    /// Evaluate JavaScript code with a source URL for error messages
    pub async fn eval_with_source(
        &self,
        script: impl Into<String>,
        source_url: impl Into<String>,
    ) -> BridgeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Eval {
            script: script.into(),
            source_url: Some(source_url.into()),
            response: tx,
        })?;
        rx.await
            .map_err(|_| BridgeError::internal("Worker dropped response"))?
    }

    /// Call a global function with JSON arguments
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> BridgeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Call {
            function: function.into(),
            args,
            response: tx,
        })?;
        rx.await
            .map_err(|_| BridgeError::internal("Worker dropped response"))?
    }

    /// Run `f` on the worker thread with the worker's context.
    pub async fn run<F, T>(&self, f: F) -> BridgeResult<T>
    where
        F: FnOnce(&Context) -> BridgeResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Run(Box::new(move |context| {
            let result = guarded(|| f(context));
            let failed = result.as_ref().err().map(|e| BridgeError::internal(e.kind_name()));
            let _ = tx.send(result);
            // Only the outcome is reported back to the loop for statistics.
            failed.map_or(Ok(()), Err)
        })))?;
        rx.await
            .map_err(|_| BridgeError::internal("Worker dropped response"))?
    }

    /// Try to submit an evaluation without blocking; reports `QueueFull`
    /// when the queue is at capacity.
    pub fn try_eval(
        &self,
        script: impl Into<String>,
    ) -> BridgeResult<oneshot::Receiver<BridgeResult<serde_json::Value>>> {
        let (tx, rx) = oneshot::channel();
        self.job_tx
            .try_send(Job::Eval {
                script: script.into(),
                source_url: None,
                response: tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => BridgeError::QueueFull,
                TrySendError::Disconnected(_) => BridgeError::IsolateDisposed,
            })?;
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    /// Ask the running job to stop. If nothing is running, the next job is
    /// terminated instead.
    pub fn terminate(&self) {
        self.isolate.terminate_execution();
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.isolate.id()
    }

    /// Get access to the worker statistics
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.job_tx.len()
    }
}
