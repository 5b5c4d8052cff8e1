//! Core data types shared across the query manager
//!
//! # Key Types
//!
//! - **`QuerySpec`**: caller input describing one log query
//! - **`TimeRange`**: half-open time window `[start, end)` for a query or chunk
//! - **`Record`**: one result row returned by the log service
//! - **`Stats`**: summable usage statistics reported by the log service
//! - **`ChunkState`**: lifecycle state of one chunk of a query
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use logquery::types::{QuerySpec, Stats};
//!
//! let spec = QuerySpec {
//!     text: "fields @timestamp, @message | filter @message like /ERROR/".to_string(),
//!     start: Utc.with_ymd_and_hms(2020, 8, 25, 3, 30, 0).unwrap(),
//!     end: Utc.with_ymd_and_hms(2020, 8, 25, 4, 30, 0).unwrap(),
//!     groups: vec!["/aws/lambda/checkout".to_string()],
//!     ..Default::default()
//! };
//! assert_eq!(spec.limit, 0); // unset, defaulted on submit
//!
//! let total = Stats::new(10.0, 2.0, 5.0) + Stats::new(1.0, 1.0, 1.0);
//! assert_eq!(total.records_matched, 3.0);
//! ```

use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result limit used when a query does not set one
pub const DEFAULT_LIMIT: u32 = 1000;

/// Largest result limit the log service accepts per query
pub const MAX_LIMIT: u32 = 10_000;

/// Smallest (and default) chunk sizing hint
pub const MIN_HINT: u16 = 1;

/// Caller input describing one log query
///
/// Zero values mean "unset": `limit == 0`, `chunk == Duration::ZERO` and
/// `hint == 0` are replaced with defaults when the query is submitted. The
/// defaulted copy is what the returned stream reports from
/// `Stream::query_spec`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuerySpec {
    /// Query text in the log service's query language
    pub text: String,

    /// Inclusive start of the query window, whole seconds only
    pub start: DateTime<Utc>,

    /// Exclusive end of the query window, whole seconds only
    pub end: DateTime<Utc>,

    /// Log groups to search
    pub groups: Vec<String>,

    /// Maximum records returned per chunk (0 = `DEFAULT_LIMIT`)
    pub limit: u32,

    /// Chunk size for splitting the window (zero = derived from range and hint)
    pub chunk: Duration,

    /// Relative result density; larger hints produce larger default chunks
    pub hint: u16,
}

impl QuerySpec {
    /// Time range covered by the whole query
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Length of the range, zero if end is not after start
    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }

    /// Check if an instant falls within the range
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}

/// One field of a result record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultField {
    /// Field name, e.g. `@message`
    pub field: String,
    /// Field value as returned by the service
    pub value: String,
}

impl ResultField {
    /// Create a new field
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// One result row: an ordered list of fields
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record(pub Vec<ResultField>);

impl Record {
    /// Create a record from `(field, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| ResultField::new(k, v))
                .collect(),
        )
    }

    /// Value of the first field with the given name
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|f| f.field == field)
            .map(|f| f.value.as_str())
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the record has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Usage statistics reported by the log service
///
/// Values are floating point because that is how the service reports them.
/// Statistics are summed per stream and per manager.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Bytes scanned
    pub bytes_scanned: f64,
    /// Records that matched the query
    pub records_matched: f64,
    /// Records scanned
    pub records_scanned: f64,
}

impl Stats {
    /// Create a new stats value
    pub fn new(bytes_scanned: f64, records_matched: f64, records_scanned: f64) -> Self {
        Self {
            bytes_scanned,
            records_matched,
            records_scanned,
        }
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(mut self, rhs: Stats) -> Stats {
        self += rhs;
        self
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Stats) {
        self.bytes_scanned += rhs.bytes_scanned;
        self.records_matched += rhs.records_matched;
        self.records_scanned += rhs.records_scanned;
    }
}

/// Lifecycle state of one chunk
///
/// ```text
/// Pending → Starting → Polling → Completed
///              │          │
///              └──────────┴────→ Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Queued, not yet picked up by a worker
    Pending,
    /// Worker is starting the remote query
    Starting,
    /// Remote query started, worker is polling for results
    Polling,
    /// Results delivered to the stream
    Completed,
    /// Non-retryable error delivered to the stream
    Failed,
    /// Abandoned because the stream or manager closed
    Cancelled,
}

impl ChunkState {
    /// Returns true for `Completed`, `Failed` and `Cancelled`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkState::Completed | ChunkState::Failed | ChunkState::Cancelled
        )
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkState::Pending => "pending",
            ChunkState::Starting => "starting",
            ChunkState::Polling => "polling",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
            ChunkState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stats_sum() {
        let mut total = Stats::default();
        total += Stats::new(100.0, 1.0, 10.0);
        total += Stats::new(50.0, 2.0, 5.0);
        assert_eq!(total, Stats::new(150.0, 3.0, 15.0));
    }

    #[test]
    fn test_time_range_half_open() {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2021, 1, 1, 0, 1, 0).unwrap();
        let range = TimeRange::new(start, end);

        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert_eq!(range.duration(), Duration::from_secs(60));
        assert_eq!(
            range.to_string(),
            "[2021-01-01 00:00:00 UTC..2021-01-01 00:01:00 UTC)"
        );
    }

    #[test]
    fn test_inverted_range_has_zero_duration() {
        let a = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2021, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(TimeRange::new(b, a).duration(), Duration::ZERO);
    }

    #[test]
    fn test_record_lookup() {
        let record = Record::from_pairs([("@timestamp", "2021-01-01"), ("@message", "hi")]);
        assert_eq!(record.get("@message"), Some("hi"));
        assert_eq!(record.get("@ptr"), None);
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_chunk_state_terminal() {
        assert!(!ChunkState::Pending.is_terminal());
        assert!(!ChunkState::Polling.is_terminal());
        assert!(ChunkState::Completed.is_terminal());
        assert!(ChunkState::Cancelled.is_terminal());
    }
}
