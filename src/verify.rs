//! Integrity Verifier.
//!
//! Compares source and destination row counts per table. Unresolved rows are
//! an expected shortfall, so the judgment is a ratio against a threshold, not
//! an exact match.

use std::fmt;

use crate::config::RetryPolicy;
use crate::errors::{MigrationError, ResultExt};
use crate::models::Phase;
use crate::retry::with_retry;
use crate::store::{DestinationStore, SourceStore};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableVerification {
    pub phase: Phase,
    pub source_rows: i64,
    pub destination_rows: i64,
    /// `destination_rows / source_rows`; 1.0 for an empty source table.
    pub ratio: f64,
    pub passed: bool,
}

impl TableVerification {
    pub fn judge(phase: Phase, source_rows: i64, destination_rows: i64, threshold: f64) -> Self {
        let ratio = if source_rows <= 0 {
            1.0
        } else {
            destination_rows as f64 / source_rows as f64
        };
        Self {
            phase,
            source_rows,
            destination_rows,
            ratio,
            passed: ratio >= threshold,
        }
    }

    /// Source rows not present in the destination (negative if the destination has more).
    pub fn difference(&self) -> i64 {
        self.source_rows - self.destination_rows
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub threshold: f64,
    pub tables: Vec<TableVerification>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.tables.iter().all(|t| t.passed)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<14}{:>12}{:>14}{:>12}{:>9}  result",
            "table", "source", "destination", "difference", "ratio"
        )?;
        for t in &self.tables {
            writeln!(
                f,
                "{:<14}{:>12}{:>14}{:>12}{:>8.1}%  {}",
                t.phase.destination_table(),
                t.source_rows,
                t.destination_rows,
                t.difference(),
                t.ratio * 100.0,
                if t.passed { "PASS" } else { "FAIL" }
            )?;
        }
        write!(
            f,
            "verification {} (threshold {:.1}%)",
            if self.passed() { "PASSED" } else { "FAILED" },
            self.threshold * 100.0
        )
    }
}

pub async fn verify<S, D>(
    source: &S,
    destination: &D,
    threshold: f64,
    policy: &RetryPolicy,
) -> Result<VerificationReport, MigrationError>
where
    S: SourceStore,
    D: DestinationStore,
{
    let mut tables = Vec::with_capacity(Phase::ALL.len());
    for phase in Phase::ALL {
        let source_rows = with_retry(policy, "count source rows", || source.count_rows(phase))
            .await
            .with_context(|| format!("counting legacy {}", phase.source_table()))?;
        let destination_rows =
            with_retry(policy, "count destination rows", || destination.count_rows(phase))
                .await
                .with_context(|| format!("counting {}", phase.destination_table()))?;
        tables.push(TableVerification::judge(
            phase,
            source_rows,
            destination_rows,
            threshold,
        ));
    }
    Ok(VerificationReport { threshold, tables })
}
