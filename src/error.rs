//! Error types for the query manager
//!
//! Errors fall into three groups:
//! - [`ValidationError`]: a malformed [`QuerySpec`](crate::types::QuerySpec),
//!   returned synchronously from `Manager::submit`
//! - [`ChunkError`]: a fatal remote failure for one chunk, surfaced through
//!   `Stream::read`
//! - [`Error::Closed`]: the shared sentinel for operations on a closed
//!   manager or stream

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::TimeRange;

/// Main error type for the query manager
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The manager or stream has already been closed
    #[error("logquery: closed")]
    Closed,

    /// The query specification failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A chunk failed with a non-retryable remote error
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

impl Error {
    /// Returns true if this is the closed sentinel
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Returns the chunk failure, if this error is one
    pub fn as_chunk(&self) -> Option<&ChunkError> {
        match self {
            Error::Chunk(e) => Some(e),
            _ => None,
        }
    }
}

/// Validation errors for a query specification
///
/// Rules are checked in declaration order and the first failure wins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Query text is empty or only whitespace
    #[error("logquery: query text is blank")]
    TextBlank,

    /// Start instant carries a sub-second component
    #[error("logquery: start has sub-second granularity")]
    StartSubSecond,

    /// End instant carries a sub-second component
    #[error("logquery: end has sub-second granularity")]
    EndSubSecond,

    /// End is equal to or before start
    #[error("logquery: end is not after start")]
    EndNotAfterStart,

    /// No log groups were given
    #[error("logquery: no log groups")]
    NoGroups,

    /// Result limit is above the service maximum
    #[error("logquery: limit {limit} exceeds maximum {max}")]
    LimitExceeded {
        /// The requested limit
        limit: u32,
        /// The service maximum
        max: u32,
    },
}

/// Fatal failure of a single chunk
///
/// Wraps the original remote error with the chunk's query text and time
/// range. The original cause is reachable through
/// [`std::error::Error::source`] and [`ChunkError::cause`].
#[derive(Debug, Clone)]
pub struct ChunkError {
    text: String,
    range: TimeRange,
    cause: Arc<dyn std::error::Error + Send + Sync>,
}

impl ChunkError {
    /// Create a new chunk error
    pub fn new(
        text: impl Into<String>,
        range: TimeRange,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            text: text.into(),
            range,
            cause: Arc::new(cause),
        }
    }

    /// Query text of the failed chunk
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Time range of the failed chunk
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// The original error reported for the chunk
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.cause.as_ref()
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "logquery: fatal error from log service for chunk {:?} {}: {}",
            self.text, self.range, self.cause
        )
    }
}

impl std::error::Error for ChunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionError;
    use chrono::{TimeZone, Utc};
    use std::error::Error as _;

    fn range() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2020, 8, 25, 3, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 8, 25, 3, 35, 0).unwrap(),
        )
    }

    #[test]
    fn test_chunk_error_display() {
        let err = ChunkError::new("foo", range(), ActionError::new("super fatal error"));
        assert_eq!(
            err.to_string(),
            "logquery: fatal error from log service for chunk \"foo\" \
             [2020-08-25 03:30:00 UTC..2020-08-25 03:35:00 UTC): super fatal error"
        );
    }

    #[test]
    fn test_chunk_error_source_downcasts() {
        let cause = ActionError::with_code("AccessDeniedException", "nope");
        let err = Error::from(ChunkError::new("foo", range(), cause.clone()));

        let source = err.source().expect("chunk error has a source");
        assert_eq!(source.downcast_ref::<ActionError>(), Some(&cause));
        assert_eq!(
            err.as_chunk().unwrap().cause().downcast_ref::<ActionError>(),
            Some(&cause)
        );
    }

    #[test]
    fn test_validation_messages_are_distinct() {
        let all = [
            ValidationError::TextBlank,
            ValidationError::StartSubSecond,
            ValidationError::EndSubSecond,
            ValidationError::EndNotAfterStart,
            ValidationError::NoGroups,
            ValidationError::LimitExceeded { limit: 2, max: 1 },
        ];
        let messages: std::collections::HashSet<String> =
            all.iter().map(|e| e.to_string()).collect();
        assert_eq!(messages.len(), all.len());
    }

    #[test]
    fn test_closed_sentinel() {
        assert!(Error::Closed.is_closed());
        assert!(!Error::from(ValidationError::NoGroups).is_closed());
    }
}
