//! logquery - chunked, rate-limited log query manager
//!
//! This library runs large log insight queries against a remote log service
//! that only offers asynchronous, quota-limited searches:
//! - Splits each query's time window into chunks that run as independent
//!   remote searches
//! - Shares a bounded worker pool and per-action rate limiters across all
//!   queries of one account
//! - Retries throttling errors and cancels abandoned searches
//! - Streams each query's records back to the caller in chunk order
//!
//! The remote service is abstracted behind the [`Actions`] trait, so the same
//! manager runs against a real SDK client or a test double.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Remote action trait, wire types and error classification
pub mod action;

/// Manager configuration, logger sink and settings files
pub mod config;

pub mod error;

/// The query manager
pub mod manager;

/// Query validation and chunk planning
pub mod planner;

/// Per-action rate limiting
pub mod rate_limit;

/// Per-query result streams
pub mod stream;

pub mod types;

mod worker;

// Re-export main types
pub use action::{
    Action, ActionError, Actions, ErrorClassifier, GetQueryResultsInput, GetQueryResultsOutput,
    QueryStatus, StartQueryInput, StartQueryOutput, StopQueryInput, StopQueryOutput,
    ThrottlingClassifier,
};
pub use config::{Config, Logger, NopLogger, Settings, TracingLogger};
pub use error::{ChunkError, Error, Result, ValidationError};
pub use manager::Manager;
pub use stream::Stream;
pub use types::{QuerySpec, Record, ResultField, Stats, TimeRange};
