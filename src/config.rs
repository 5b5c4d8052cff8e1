//! Configuration for the query manager
//!
//! [`Config`] is the construction input for `Manager::new`. It carries the
//! remote [`Actions`] (required) and the tuning knobs: worker parallelism,
//! per-action requests per second, retry policy and the diagnostics
//! [`Logger`].
//!
//! [`Settings`] is the serializable subset of the tuning knobs, loadable from
//! a TOML file with environment variable overrides, and layered onto a
//! `Config` with [`Settings::apply_to`].
//!
//! Values are normalized when the manager is built, not here:
//! - `parallel`: zero → `DEFAULT_PARALLEL`, negative → 1, above
//!   `QUERY_CONCURRENCY_QUOTA_LIMIT` → the quota
//! - `rps[action]`: missing → `DEFAULT_RPS`, above `RPS_QUOTA_LIMIT` → the
//!   quota, zero or negative → kept, meaning "no rate limiting"

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{Action, Actions, ErrorClassifier, ThrottlingClassifier};

/// Worker count used when `parallel` is zero
pub const DEFAULT_PARALLEL: i32 = 4;

/// Maximum concurrent queries the log service allows per account
pub const QUERY_CONCURRENCY_QUOTA_LIMIT: i32 = 10;

/// Requests per second used for an action with no configured value
pub const DEFAULT_RPS: i32 = 3;

/// Maximum requests per second the log service allows for each action
pub const RPS_QUOTA_LIMIT: i32 = 5;

/// Default bound on retries of transient errors per chunk
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default delay before a throttled start is retried (scaled by attempt)
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound on one best-effort stop
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Message of the panic raised when `Config::actions` is missing
pub const NIL_ACTIONS_MSG: &str = "logquery: nil actions";

/// Default requests per second for an action
pub fn default_rps(_action: Action) -> i32 {
    DEFAULT_RPS
}

/// Hard requests-per-second quota for an action
pub fn rps_quota_limit(_action: Action) -> i32 {
    RPS_QUOTA_LIMIT
}

// ============================================================================
// Logger
// ============================================================================

/// Sink for manager lifecycle lines
///
/// Structured diagnostics always go through `tracing`; this sink receives the
/// small set of lifecycle lines a caller may want in their own log.
pub trait Logger: Send + Sync {
    /// Write one line
    fn log(&self, message: &str);
}

/// Logger that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NopLogger;

impl Logger for NopLogger {
    fn log(&self, _message: &str) {}
}

/// Logger that forwards lines to `tracing` at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::info!(target: "logquery", "{}", message);
    }
}

// ============================================================================
// Config
// ============================================================================

/// Construction input for `Manager::new`
#[derive(Clone)]
pub struct Config {
    /// Remote log service operations (required)
    pub actions: Option<Arc<dyn Actions>>,

    /// Retry-versus-fatal policy (default: [`ThrottlingClassifier`])
    pub classifier: Option<Arc<dyn ErrorClassifier>>,

    /// Number of concurrent chunk workers (0 = `DEFAULT_PARALLEL`)
    pub parallel: i32,

    /// Requests per second per action; missing entries use `DEFAULT_RPS`
    pub rps: HashMap<Action, i32>,

    /// Lifecycle line sink (default: [`NopLogger`])
    pub logger: Option<Arc<dyn Logger>>,

    /// Bound on transient error retries per chunk
    pub max_retries: u32,

    /// Delay before a re-queued start attempt, multiplied by the attempt number
    pub retry_backoff: Duration,

    /// Upper bound on one best-effort stop, including its rate limiter wait
    pub stop_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            actions: None,
            classifier: None,
            parallel: 0,
            rps: HashMap::new(),
            logger: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl Config {
    /// Create a config for the given actions with default tuning
    pub fn new(actions: Arc<dyn Actions>) -> Self {
        Self {
            actions: Some(actions),
            ..Default::default()
        }
    }

    /// Set worker parallelism
    pub fn with_parallel(mut self, parallel: i32) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set requests per second for one action
    pub fn with_rps(mut self, action: Action, rps: i32) -> Self {
        self.rps.insert(action, rps);
        self
    }

    /// Set the lifecycle logger
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Set the error classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Set the transient retry bound
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the start retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the stop timeout
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Apply defaults and quota clamps
    ///
    /// Returns the normalized config together with its resolved trait
    /// objects. Panics with [`NIL_ACTIONS_MSG`] if `actions` is missing.
    pub(crate) fn normalize(mut self) -> (Self, Components) {
        let Some(actions) = self.actions.clone() else {
            panic!("{}", NIL_ACTIONS_MSG);
        };

        self.parallel = match self.parallel {
            0 => DEFAULT_PARALLEL,
            p if p < 0 => 1,
            p => p.min(QUERY_CONCURRENCY_QUOTA_LIMIT),
        };

        for action in Action::ALL {
            let rps = self.rps.entry(action).or_insert_with(|| default_rps(action));
            *rps = (*rps).min(rps_quota_limit(action));
        }

        let classifier = Arc::clone(
            self.classifier
                .get_or_insert_with(|| Arc::new(ThrottlingClassifier) as Arc<dyn ErrorClassifier>),
        );
        let logger = Arc::clone(
            self.logger
                .get_or_insert_with(|| Arc::new(NopLogger) as Arc<dyn Logger>),
        );

        let components = Components {
            actions,
            classifier,
            logger,
        };
        (self, components)
    }

    /// Minimum spacing between calls implied by a requests-per-second value
    ///
    /// Zero or negative means no spacing.
    pub fn min_delay_for(rps: i32) -> Duration {
        if rps <= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / rps as u32
        }
    }
}

/// Trait objects of a normalized [`Config`], all present
pub(crate) struct Components {
    pub(crate) actions: Arc<dyn Actions>,
    pub(crate) classifier: Arc<dyn ErrorClassifier>,
    pub(crate) logger: Arc<dyn Logger>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("actions", &self.actions.is_some())
            .field("classifier", &self.classifier.is_some())
            .field("parallel", &self.parallel)
            .field("rps", &self.rps)
            .field("logger", &self.logger.is_some())
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

// ============================================================================
// Settings (file / environment)
// ============================================================================

/// Requests per second per action, as written in a settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RpsSettings {
    /// `StartQuery` requests per second
    #[serde(default)]
    pub start_query: Option<i32>,

    /// `GetQueryResults` requests per second
    #[serde(default)]
    pub get_query_results: Option<i32>,

    /// `StopQuery` requests per second
    #[serde(default)]
    pub stop_query: Option<i32>,
}

impl RpsSettings {
    fn get(&self, action: Action) -> Option<i32> {
        match action {
            Action::StartQuery => self.start_query,
            Action::GetQueryResults => self.get_query_results,
            Action::StopQuery => self.stop_query,
        }
    }
}

/// Serializable tuning for a manager
///
/// ```toml
/// parallel = 8
/// max_retries = 5
///
/// [rps]
/// start_query = 5
/// get_query_results = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Worker parallelism
    #[serde(default)]
    pub parallel: Option<i32>,

    /// Requests per second per action
    #[serde(default)]
    pub rps: RpsSettings,

    /// Transient retry bound
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Start retry backoff in milliseconds
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,

    /// Stop timeout in milliseconds
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
}

impl Settings {
    /// Parse settings from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| format!("Failed to parse settings: {}", e))
    }

    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings file {}: {}", path.display(), e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse settings file {}: {}", path.display(), e))
    }

    /// Load settings from a TOML file, then apply environment overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, String> {
        let mut settings = Self::from_file(path)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(p) = env_parse("LOGQUERY_PARALLEL") {
            self.parallel = Some(p);
        }
        if let Some(r) = env_parse("LOGQUERY_RPS_START_QUERY") {
            self.rps.start_query = Some(r);
        }
        if let Some(r) = env_parse("LOGQUERY_RPS_GET_QUERY_RESULTS") {
            self.rps.get_query_results = Some(r);
        }
        if let Some(r) = env_parse("LOGQUERY_RPS_STOP_QUERY") {
            self.rps.stop_query = Some(r);
        }
        if let Some(n) = env_parse("LOGQUERY_MAX_RETRIES") {
            self.max_retries = Some(n);
        }
    }

    /// Validate settings
    ///
    /// Out-of-quota values are clamped by the manager rather than rejected;
    /// only values that cannot mean anything are errors.
    pub fn validate(&self) -> Result<(), String> {
        if self.stop_timeout_ms == Some(0) {
            return Err("stop_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }

    /// Layer these settings onto a config
    pub fn apply_to(&self, mut config: Config) -> Config {
        if let Some(p) = self.parallel {
            config.parallel = p;
        }
        for action in Action::ALL {
            if let Some(r) = self.rps.get(action) {
                config.rps.insert(action, r);
            }
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.stop_timeout_ms {
            config.stop_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// Save settings to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), String> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write settings file {}: {}", path.display(), e))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
