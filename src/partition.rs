//! Partitioner: splits a legacy id range into contiguous per-worker ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::TableBounds;

/// Half-open id range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of ids (not rows) covered.
    pub fn len(&self) -> u64 {
        if self.end <= self.start {
            0
        } else {
            (self.end as i128 - self.start as i128) as u64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id < self.end
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Splits `[min_id, max_id + 1)` into at most `workers` ranges.
///
/// Every range has `span / workers` ids except the last, which also takes the
/// remainder. When the span is smaller than the worker count, each id gets a
/// range of its own.
///
/// # Arguments
///
/// * `bounds` - `MIN(id)`, `MAX(id)` and `COUNT(*)` of the legacy table.
///   `max_id` must be below `i64::MAX` (see [`TableBounds::end_exclusive`]);
///   the pipeline refuses such tables before partitioning.
/// * `workers` - Desired worker count; 0 is treated as 1.
///
/// # Returns
///
/// * `Vec<IdRange>` - Contiguous, non-overlapping ranges whose union is
///   `[min_id, max_id + 1)`. Empty for an empty table.
pub fn partition(bounds: &TableBounds, workers: usize) -> Vec<IdRange> {
    if bounds.row_count <= 0 || bounds.max_id < bounds.min_id {
        return Vec::new();
    }

    let start = bounds.min_id as i128;
    let end = bounds.max_id as i128 + 1;
    let span = end - start;
    let workers = (workers.max(1) as i128).min(span);
    let chunk = span / workers;

    (0..workers)
        .map(|i| {
            let range_start = start + i * chunk;
            let range_end = if i == workers - 1 {
                end
            } else {
                range_start + chunk
            };
            IdRange::new(clamp(range_start), clamp(range_end))
        })
        .collect()
}

// `max_id + 1` overflows i64 only for a table whose max id is i64::MAX,
// which callers reject first.
fn clamp(value: i128) -> i64 {
    value.min(i64::MAX as i128) as i64
}
