//! Configuration for the bridge.
//!
//! A [`BridgeConfig`] can be built in code, parsed from TOML, or taken from
//! the environment. `Engine::global()` uses [`BridgeConfig::from_env`].
//!
//! ```
//! use jsbridge::{BridgeConfig, EntryPolicy};
//!
//! let config = BridgeConfig::from_toml_str(
//!     r#"
//!     entry_policy = "fail"
//!     termination_poll_ms = 5
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.entry_policy, EntryPolicy::Fail);
//! assert_eq!(config.termination_poll_ms, 5);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

/// What a thread does when the isolate it wants to enter is held by another
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPolicy {
    /// Wait for the owner to leave, bounded by `entry_timeout_ms` if set.
    #[default]
    Block,
    /// Report `Contention` immediately.
    Fail,
}

impl std::str::FromStr for EntryPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "fail" => Ok(Self::Fail),
            other => Err(BridgeError::config(format!(
                "unknown entry policy `{}` (expected `block` or `fail`)",
                other
            ))),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Contention behavior for `Isolate::enter`.
    /// Default: `Block`
    pub entry_policy: EntryPolicy,

    /// Upper bound on a blocking entry, in milliseconds.
    /// Default: none (wait forever)
    pub entry_timeout_ms: Option<u64>,

    /// How often the engine watchdog checks for a termination request, in
    /// milliseconds of script CPU time.
    /// Default: 10
    pub termination_poll_ms: u64,

    /// Maximum nesting for deep conversion and JSON export.
    /// Default: 128
    pub max_conversion_depth: usize,

    /// Longest array deep conversion will copy. Sparse arrays count their
    /// full length.
    /// Default: 16777216
    pub max_array_length: u32,

    /// Capacity of an isolate worker's job queue.
    /// Default: 64
    pub worker_queue_capacity: usize,

    /// Engine options exported as `JSC_<name>` environment variables before
    /// the first isolate is created. Variables already set win.
    pub jsc_options: BTreeMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            entry_policy: EntryPolicy::Block,
            entry_timeout_ms: None,
            termination_poll_ms: 10,
            max_conversion_depth: 128,
            max_array_length: 1 << 24,
            worker_queue_capacity: 64,
            jsc_options: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Environment variable naming a TOML config file.
    pub const ENV_FILE: &'static str = "JSBRIDGE_CONFIG";
    pub const ENV_ENTRY_POLICY: &'static str = "JSBRIDGE_ENTRY_POLICY";
    pub const ENV_ENTRY_TIMEOUT_MS: &'static str = "JSBRIDGE_ENTRY_TIMEOUT_MS";
    pub const ENV_TERMINATION_POLL_MS: &'static str = "JSBRIDGE_TERMINATION_POLL_MS";
    pub const ENV_MAX_DEPTH: &'static str = "JSBRIDGE_MAX_DEPTH";
    pub const ENV_MAX_ARRAY_LENGTH: &'static str = "JSBRIDGE_MAX_ARRAY_LENGTH";

    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> BridgeResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Build from the process environment.
    ///
    /// `JSBRIDGE_CONFIG` names a base file; the individual `JSBRIDGE_*`
    /// variables override its values.
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> BridgeResult<Self> {
        let mut config = match var(Self::ENV_FILE) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(policy) = var(Self::ENV_ENTRY_POLICY) {
            config.entry_policy = policy.parse()?;
        }
        if let Some(timeout) = var(Self::ENV_ENTRY_TIMEOUT_MS) {
            config.entry_timeout_ms = Some(parse_number(Self::ENV_ENTRY_TIMEOUT_MS, &timeout)?);
        }
        if let Some(poll) = var(Self::ENV_TERMINATION_POLL_MS) {
            config.termination_poll_ms = parse_number(Self::ENV_TERMINATION_POLL_MS, &poll)?;
        }
        if let Some(depth) = var(Self::ENV_MAX_DEPTH) {
            config.max_conversion_depth = parse_number(Self::ENV_MAX_DEPTH, &depth)?;
        }
        if let Some(length) = var(Self::ENV_MAX_ARRAY_LENGTH) {
            config.max_array_length = parse_number(Self::ENV_MAX_ARRAY_LENGTH, &length)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot work with.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.termination_poll_ms == 0 {
            return Err(BridgeError::config("termination_poll_ms must be at least 1"));
        }
        if self.max_conversion_depth == 0 {
            return Err(BridgeError::config("max_conversion_depth must be at least 1"));
        }
        if self.worker_queue_capacity == 0 {
            return Err(BridgeError::config("worker_queue_capacity must be at least 1"));
        }
        if let Some(name) = self.jsc_options.keys().find(|name| !is_option_name(name)) {
            return Err(BridgeError::config(format!("invalid JSC option name `{}`", name)));
        }
        Ok(())
    }

    /// Set the entry policy.
    pub fn entry_policy(mut self, policy: EntryPolicy) -> Self {
        self.entry_policy = policy;
        self
    }

    /// Bound blocking entry.
    pub fn entry_timeout(mut self, timeout: Duration) -> Self {
        self.entry_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the watchdog poll interval.
    pub fn termination_poll(mut self, interval: Duration) -> Self {
        self.termination_poll_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Set the deep conversion limit.
    pub fn max_conversion_depth(mut self, depth: usize) -> Self {
        self.max_conversion_depth = depth.max(1);
        self
    }

    /// Set the longest array deep conversion will copy.
    pub fn max_array_length(mut self, length: u32) -> Self {
        self.max_array_length = length;
        self
    }

    /// Set the worker queue capacity.
    pub fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity.max(1);
        self
    }

    /// Add an engine option (without the `JSC_` prefix).
    pub fn jsc_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.jsc_options.insert(name.into(), value.into());
        self
    }

    pub fn entry_timeout_duration(&self) -> Option<Duration> {
        self.entry_timeout_ms.map(Duration::from_millis)
    }

    /// Watchdog interval in seconds, as the engine expects it.
    pub(crate) fn termination_poll_secs(&self) -> f64 {
        self.termination_poll_ms as f64 / 1000.0
    }

    /// Export `jsc_options` to the environment.
    ///
    /// Must run before the engine initializes its option table, which
    /// happens when the first context group is created.
    pub(crate) fn export_jsc_options(&self) {
        for (name, value) in &self.jsc_options {
            let key = format!("JSC_{}", name);
            if std::env::var_os(&key).is_some() {
                tracing::debug!(option = %key, "JSC option already set, keeping environment value");
                continue;
            }
            // SAFETY: called once from engine start-up before any isolate
            // (and therefore any engine thread) exists.
            unsafe { std::env::set_var(&key, value) };
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> BridgeResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| BridgeError::config(format!("{} must be a non-negative integer, got `{}`", name, raw)))
}

fn is_option_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
