//! Remote log service operations
//!
//! The query manager drives the log service through three asynchronous
//! operations, supplied by the caller as an [`Actions`] implementation:
//!
//! - `StartQuery`: begin a search over a time range, returning a query id
//! - `GetQueryResults`: poll a started search for its status and results
//! - `StopQuery`: end a started search early
//!
//! Cancellation of an in-flight call is done by dropping its future, so
//! implementations should not rely on running to completion.
//!
//! Which errors are retried is decided by an [`ErrorClassifier`]. The default
//! [`ThrottlingClassifier`] treats the service's throttling codes as transient
//! and everything else as fatal.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Record, Stats};

/// The remote operations the manager rate-limits independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Start a search
    StartQuery,
    /// Poll a started search
    GetQueryResults,
    /// Stop a started search
    StopQuery,
}

impl Action {
    /// All actions, in index order
    pub const ALL: [Action; 3] = [Action::StartQuery, Action::GetQueryResults, Action::StopQuery];

    pub(crate) fn index(self) -> usize {
        match self {
            Action::StartQuery => 0,
            Action::GetQueryResults => 1,
            Action::StopQuery => 2,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::StartQuery => "StartQuery",
            Action::GetQueryResults => "GetQueryResults",
            Action::StopQuery => "StopQuery",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Inputs and Outputs
// ============================================================================

/// Input to `StartQuery`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartQueryInput {
    /// Query text
    pub query_string: String,
    /// Inclusive start, epoch seconds
    pub start_time: i64,
    /// Exclusive end, epoch seconds
    pub end_time: i64,
    /// Log groups to search
    pub log_group_names: Vec<String>,
    /// Maximum records to return
    pub limit: u32,
}

/// Output of `StartQuery`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartQueryOutput {
    /// Identifier of the started query
    pub query_id: String,
}

/// Input to `GetQueryResults`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetQueryResultsInput {
    /// Identifier returned by `StartQuery`
    pub query_id: String,
}

/// Status reported by `GetQueryResults`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Accepted, not yet running
    Scheduled,
    /// Running, results not final
    Running,
    /// Finished, results final
    Complete,
    /// Failed on the service side
    Failed,
    /// Stopped
    Cancelled,
    /// Ran out of time on the service side
    Timeout,
    /// Status not recognized
    Unknown,
}

impl QueryStatus {
    /// Returns true while the query is still in progress
    pub fn is_pending(&self) -> bool {
        matches!(self, QueryStatus::Scheduled | QueryStatus::Running)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Output of `GetQueryResults`
#[derive(Debug, Clone, PartialEq)]
pub struct GetQueryResultsOutput {
    /// Current query status
    pub status: QueryStatus,
    /// Results so far; final once status is `Complete`
    pub results: Vec<Record>,
    /// Statistics so far
    pub statistics: Option<Stats>,
}

/// Input to `StopQuery`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopQueryInput {
    /// Identifier returned by `StartQuery`
    pub query_id: String,
}

/// Output of `StopQuery`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopQueryOutput {
    /// Whether the service stopped the query
    pub success: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// Error returned by an [`Actions`] implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    code: Option<String>,
    message: String,
}

impl ActionError {
    /// Create an error without a service error code
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create an error with a service error code, e.g. `ThrottlingException`
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Service error code, if any
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ActionError {}

/// Decides whether a remote error is retried or fails its chunk
pub trait ErrorClassifier: Send + Sync {
    /// Returns true if the error is transient and the call should be retried
    fn is_transient(&self, err: &ActionError) -> bool;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&ActionError) -> bool + Send + Sync,
{
    fn is_transient(&self, err: &ActionError) -> bool {
        self(err)
    }
}

/// Error codes the log service uses for throttling
pub const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "LimitExceededException",
    "TooManyRequestsException",
    "ServiceUnavailableException",
];

/// Default classifier: known throttling codes are transient, all else fatal
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottlingClassifier;

impl ErrorClassifier for ThrottlingClassifier {
    fn is_transient(&self, err: &ActionError) -> bool {
        err.code()
            .map(|code| THROTTLING_CODES.contains(&code))
            .unwrap_or(false)
    }
}

// ============================================================================
// Actions Trait
// ============================================================================

/// The remote log service, as seen by the query manager
///
/// Any conforming implementation works: a network client, a recording
/// proxy, or a scripted test double.
#[async_trait]
pub trait Actions: Send + Sync {
    /// Start a search
    async fn start_query(&self, input: StartQueryInput) -> Result<StartQueryOutput, ActionError>;

    /// Poll a started search
    async fn get_query_results(
        &self,
        input: GetQueryResultsInput,
    ) -> Result<GetQueryResultsOutput, ActionError>;

    /// Stop a started search
    async fn stop_query(&self, input: StopQueryInput) -> Result<StopQueryOutput, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_index_matches_all() {
        for (i, action) in Action::ALL.iter().enumerate() {
            assert_eq!(action.index(), i);
        }
    }

    #[test]
    fn test_throttling_classifier() {
        let classifier = ThrottlingClassifier;
        assert!(classifier.is_transient(&ActionError::with_code("ThrottlingException", "slow down")));
        assert!(classifier.is_transient(&ActionError::with_code("LimitExceededException", "quota")));
        assert!(!classifier.is_transient(&ActionError::with_code("AccessDeniedException", "no")));
        assert!(!classifier.is_transient(&ActionError::new("connection reset")));
    }

    #[test]
    fn test_closure_classifier() {
        let classifier = |e: &ActionError| e.message().contains("retry");
        assert!(classifier.is_transient(&ActionError::new("please retry")));
        assert!(!classifier.is_transient(&ActionError::new("fatal")));
    }

    #[test]
    fn test_action_error_display() {
        assert_eq!(ActionError::new("boom").to_string(), "boom");
        assert_eq!(
            ActionError::with_code("ThrottlingException", "Rate exceeded").to_string(),
            "ThrottlingException: Rate exceeded"
        );
    }
}
