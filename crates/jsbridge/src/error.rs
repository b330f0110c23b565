//! Error types for the bridge
//!
//! Every fallible operation returns [`BridgeResult`]. Script exceptions keep
//! their full [`ExceptionRecord`] (type tag, message, stack, location and the
//! thrown value) so nothing is lost crossing into host code.

use thiserror::Error;

use crate::exception::ExceptionRecord;

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while crossing the host/engine boundary
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The engine could not allocate a context, string, object or array
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    /// A value could not be converted between host and engine
    #[error("Cannot convert {category}: {reason}")]
    TypeConversion { category: String, reason: String },

    /// Script threw and nothing caught it
    #[error("{0}")]
    Script(Box<ExceptionRecord>),

    /// A host callback failed and script did not catch the resulting error
    #[error("Host function `{function}` failed: {cause}")]
    HostCallback {
        function: String,
        #[source]
        cause: anyhow::Error,
    },

    /// Execution was cancelled with `terminate_execution`
    #[error("Script execution was terminated")]
    TerminationRequested,

    /// The isolate has been disposed
    #[error("Isolate has been disposed")]
    IsolateDisposed,

    /// Another thread holds the isolate
    #[error("Isolate is entered by another thread")]
    Contention,

    /// The isolate cannot be disposed while a thread is inside it
    #[error("Isolate is still entered and cannot be disposed")]
    IsolateEntered,

    /// The context has been closed
    #[error("Context has been closed")]
    ContextClosed,

    /// The engine was shut down
    #[error("Engine has been shut down")]
    EngineShutDown,

    /// The worker job queue is full
    #[error("Worker queue is full")]
    QueueFull,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal/unexpected error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a type conversion error
    pub fn conversion(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TypeConversion {
            category: category.into(),
            reason: reason.into(),
        }
    }

    /// Create an allocation failure naming the engine call that returned null
    pub fn allocation(operation: impl Into<String>) -> Self {
        Self::AllocationFailure(operation.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap a host callback failure
    pub fn host_callback(function: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::HostCallback {
            function: function.into(),
            cause,
        }
    }

    /// Check if this error came from script (a thrown value or a failed host callback)
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Script(_) | Self::HostCallback { .. })
    }

    /// The exception record, if this is a script exception
    pub fn exception(&self) -> Option<&ExceptionRecord> {
        match self {
            Self::Script(record) => Some(record),
            _ => None,
        }
    }

    /// The script-visible message: the exception message for script errors,
    /// the host cause for failed callbacks, the display text otherwise.
    pub fn message(&self) -> String {
        match self {
            Self::Script(record) => record.message.clone(),
            Self::HostCallback { cause, .. } => cause.to_string(),
            other => other.to_string(),
        }
    }

    /// Stable tag per variant, used in logs and worker statistics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::AllocationFailure(_) => "AllocationFailure",
            Self::TypeConversion { .. } => "TypeConversion",
            Self::Script(_) => "ScriptException",
            Self::HostCallback { .. } => "HostCallback",
            Self::TerminationRequested => "TerminationRequested",
            Self::IsolateDisposed => "IsolateDisposed",
            Self::Contention => "Contention",
            Self::IsolateEntered => "IsolateEntered",
            Self::ContextClosed => "ContextClosed",
            Self::EngineShutDown => "EngineShutDown",
            Self::QueueFull => "QueueFull",
            Self::Config(_) => "Config",
            Self::Json(_) => "Json",
            Self::Internal(_) => "Internal",
        }
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
