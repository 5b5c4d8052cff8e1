//! Query validation and chunk planning
//!
//! A query's window is split into consecutive, non-overlapping chunks that
//! each run as one remote search. Smaller chunks keep each search under the
//! service's per-query result limit; larger chunks keep the number of
//! searches down.
//!
//! ```text
//! start                                                   end
//!   |---- chunk 0 ----|---- chunk 1 ----|---- chunk 2 ----|-- 3 --|
//! ```
//!
//! The final chunk is truncated at `end`. Chunk boundaries are always whole
//! seconds because the service only accepts second granularity.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::types::{QuerySpec, TimeRange, DEFAULT_LIMIT, MAX_LIMIT, MIN_HINT};

/// Chunk size per unit of hint when the chunk size is derived
pub const BASE_CHUNK: Duration = Duration::from_secs(5 * 60);

/// Target upper bound on the number of chunks when the chunk size is derived
pub const MAX_DEFAULT_CHUNKS: u32 = 24;

/// Check a query specification
///
/// Rules are applied in order and the first failure is returned:
/// blank text, sub-second start, sub-second end, end not after start,
/// no groups, limit above [`MAX_LIMIT`].
pub fn validate(spec: &QuerySpec) -> Result<(), ValidationError> {
    if spec.text.trim().is_empty() {
        return Err(ValidationError::TextBlank);
    }
    if has_sub_second(spec.start) {
        return Err(ValidationError::StartSubSecond);
    }
    if has_sub_second(spec.end) {
        return Err(ValidationError::EndSubSecond);
    }
    if spec.end <= spec.start {
        return Err(ValidationError::EndNotAfterStart);
    }
    if spec.groups.is_empty() {
        return Err(ValidationError::NoGroups);
    }
    if spec.limit > MAX_LIMIT {
        return Err(ValidationError::LimitExceeded {
            limit: spec.limit,
            max: MAX_LIMIT,
        });
    }
    Ok(())
}

fn has_sub_second(t: DateTime<Utc>) -> bool {
    t.timestamp_subsec_nanos() != 0
}

/// Fill in unset fields of a validated specification
///
/// - `limit == 0` becomes [`DEFAULT_LIMIT`]
/// - `hint == 0` becomes [`MIN_HINT`]
/// - `chunk == 0` becomes [`default_chunk`] of the range and hint
/// - any chunk is rounded up to whole seconds and capped at the range
pub fn apply_defaults(mut spec: QuerySpec) -> QuerySpec {
    if spec.limit == 0 {
        spec.limit = DEFAULT_LIMIT;
    }
    if spec.hint == 0 {
        spec.hint = MIN_HINT;
    }

    let range = spec.range().duration();
    let chunk = if spec.chunk.is_zero() {
        default_chunk(range, spec.hint)
    } else {
        spec.chunk
    };
    spec.chunk = ceil_seconds(chunk).min(range);
    spec
}

/// Derived chunk size for a range
///
/// Aims for at most [`MAX_DEFAULT_CHUNKS`] chunks, but never smaller than
/// `hint * BASE_CHUNK` and never larger than the range itself. A coarser
/// hint therefore means fewer, larger chunks.
pub fn default_chunk(range: Duration, hint: u16) -> Duration {
    let floor = BASE_CHUNK.saturating_mul(hint.max(MIN_HINT) as u32);
    let even = range / MAX_DEFAULT_CHUNKS;
    ceil_seconds(even.max(floor)).min(range)
}

fn ceil_seconds(d: Duration) -> Duration {
    if d.subsec_nanos() == 0 {
        d
    } else {
        Duration::from_secs(d.as_secs() + 1)
    }
}

/// Split a defaulted specification's window into chunk ranges
///
/// Ranges are contiguous, non-overlapping, in increasing time order and
/// cover `[start, end)` exactly.
pub fn plan(spec: &QuerySpec) -> Vec<TimeRange> {
    let chunk = match chrono::Duration::from_std(spec.chunk) {
        Ok(c) if c > chrono::Duration::zero() => c,
        _ => return vec![spec.range()],
    };

    let mut ranges = Vec::new();
    let mut next = spec.start;
    while next < spec.end {
        let end = next
            .checked_add_signed(chunk)
            .map(|e| e.min(spec.end))
            .unwrap_or(spec.end);
        ranges.push(TimeRange::new(next, end));
        next = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 8, 25, 3, 30, 0).unwrap()
    }

    fn valid() -> QuerySpec {
        QuerySpec {
            text: "fields @message".to_string(),
            start: start(),
            end: start() + chrono::Duration::minutes(5),
            groups: vec!["grp".to_string()],
            ..Default::default()
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_valid_spec() {
        assert_eq!(validate(&valid()), Ok(()));
    }

    #[test]
    fn test_blank_text() {
        let spec = QuerySpec {
            text: " \t\r\n".to_string(),
            ..valid()
        };
        assert_eq!(validate(&spec), Err(ValidationError::TextBlank));
    }

    #[test]
    fn test_sub_second_start_and_end() {
        let sub = Utc.with_ymd_and_hms(2021, 7, 15, 3, 37, 25).unwrap()
            + chrono::Duration::nanoseconds(123);

        let spec = QuerySpec { start: sub, ..valid() };
        assert_eq!(validate(&spec), Err(ValidationError::StartSubSecond));

        let spec = QuerySpec { end: sub, ..valid() };
        assert_eq!(validate(&spec), Err(ValidationError::EndSubSecond));
    }

    #[test]
    fn test_end_not_after_start() {
        let spec = QuerySpec {
            end: start(),
            ..valid()
        };
        assert_eq!(validate(&spec), Err(ValidationError::EndNotAfterStart));
    }

    #[test]
    fn test_first_failure_wins() {
        // Blank text and no groups: text is checked first
        let spec = QuerySpec {
            text: String::new(),
            groups: vec![],
            ..valid()
        };
        assert_eq!(validate(&spec), Err(ValidationError::TextBlank));
    }

    #[test]
    fn test_limit_bounds() {
        let at = QuerySpec {
            limit: MAX_LIMIT,
            ..valid()
        };
        assert_eq!(validate(&at), Ok(()));

        let above = QuerySpec {
            limit: MAX_LIMIT + 1,
            ..valid()
        };
        assert_eq!(
            validate(&above),
            Err(ValidationError::LimitExceeded {
                limit: MAX_LIMIT + 1,
                max: MAX_LIMIT
            })
        );
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_defaults_small_range() {
        let spec = apply_defaults(valid());
        assert_eq!(spec.limit, DEFAULT_LIMIT);
        assert_eq!(spec.hint, MIN_HINT);
        assert_eq!(spec.chunk, Duration::from_secs(300));
        assert_eq!(plan(&spec).len(), 1);
    }

    #[test]
    fn test_default_chunk_bounds_chunk_count() {
        let day = Duration::from_secs(24 * 3600);
        assert_eq!(default_chunk(day, 1), Duration::from_secs(3600));

        let week = day * 7;
        let chunk = default_chunk(week, 1);
        assert!(week.as_secs().div_ceil(chunk.as_secs()) <= MAX_DEFAULT_CHUNKS as u64);
    }

    #[test]
    fn test_coarser_hint_larger_chunks() {
        let day = Duration::from_secs(24 * 3600);
        assert!(default_chunk(day, 20) > default_chunk(day, 1));
        assert_eq!(default_chunk(day, 20), Duration::from_secs(100 * 60));
    }

    #[test]
    fn test_explicit_chunk_rounded_and_capped() {
        let spec = apply_defaults(QuerySpec {
            chunk: Duration::from_millis(90_500),
            ..valid()
        });
        assert_eq!(spec.chunk, Duration::from_secs(91));

        let spec = apply_defaults(QuerySpec {
            chunk: Duration::from_secs(3600),
            ..valid()
        });
        assert_eq!(spec.chunk, Duration::from_secs(300));
    }

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn test_plan_covers_range_contiguously() {
        let spec = apply_defaults(QuerySpec {
            end: start() + chrono::Duration::minutes(10),
            chunk: Duration::from_secs(180),
            ..valid()
        });
        let ranges = plan(&spec);

        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].start, spec.start);
        assert_eq!(ranges.last().unwrap().end, spec.end);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[1].start);
        }
        // Last chunk truncated at end
        assert_eq!(ranges[3].duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_plan_exact_multiple() {
        let spec = apply_defaults(QuerySpec {
            end: start() + chrono::Duration::minutes(9),
            chunk: Duration::from_secs(180),
            ..valid()
        });
        let ranges = plan(&spec);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|r| r.duration() == Duration::from_secs(180)));
    }
}
