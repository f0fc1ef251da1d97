//! Progress events, the aggregator that owns the totals, and the reporter.
//!
//! Workers never touch shared counters. They send [`ProgressEvent`]s over a
//! channel; a single aggregator task per phase applies them, persists the
//! checkpoint and publishes a [`ProgressSnapshot`] that the reporter polls.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::checkpoint::{CheckpointStore, WorkerCheckpoint};
use crate::models::{Phase, RunStats};
use crate::worker::WorkerOutcome;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A window was flushed; carries the worker's cumulative progress.
    WindowCommitted(WorkerCheckpoint),
    WorkerFinished {
        worker_id: usize,
        outcome: WorkerOutcome,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub stats: RunStats,
    pub total_rows: u64,
    pub workers_total: usize,
    pub workers_finished: usize,
}

pub struct ProgressAggregator {
    phase: Phase,
    checkpoint: CheckpointStore,
    workers: HashMap<usize, RunStats>,
    snapshot: ProgressSnapshot,
    publisher: watch::Sender<ProgressSnapshot>,
}

impl ProgressAggregator {
    /// `starting` is the reconciled checkpoint of every worker in the phase,
    /// so resumed counts are part of the totals from the first snapshot.
    pub fn new(
        phase: Phase,
        checkpoint: CheckpointStore,
        starting: &[WorkerCheckpoint],
        total_rows: u64,
    ) -> (Self, watch::Receiver<ProgressSnapshot>) {
        let workers: HashMap<usize, RunStats> =
            starting.iter().map(|w| (w.worker_id, w.stats)).collect();
        let snapshot = ProgressSnapshot {
            stats: sum(workers.values()),
            total_rows,
            workers_total: starting.len(),
            workers_finished: starting.iter().filter(|w| w.done).count(),
        };
        let (publisher, receiver) = watch::channel(snapshot);
        (
            Self {
                phase,
                checkpoint,
                workers,
                snapshot,
                publisher,
            },
            receiver,
        )
    }

    /// Applies events until every sender is dropped, then hands the
    /// checkpoint store back.
    pub async fn run(mut self, mut events: mpsc::Receiver<ProgressEvent>) -> CheckpointStore {
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::WindowCommitted(update) => {
                    self.workers.insert(update.worker_id, update.stats);
                    self.snapshot.stats = sum(self.workers.values());

                    match self.checkpoint.record(self.phase, &update) {
                        Ok(()) => {
                            if let Err(e) = self.checkpoint.persist().await {
                                tracing::error!(
                                    "Failed to write checkpoint {}: {}",
                                    self.checkpoint.path().display(),
                                    e
                                );
                            }
                        }
                        Err(e) => tracing::error!("Failed to record checkpoint: {}", e),
                    }
                }
                ProgressEvent::WorkerFinished { worker_id, outcome } => {
                    self.snapshot.workers_finished += 1;
                    tracing::info!(
                        "Phase {} worker {} finished: {:?} ({}/{} done)",
                        self.phase,
                        worker_id,
                        outcome,
                        self.snapshot.workers_finished,
                        self.snapshot.workers_total
                    );
                }
            }
            self.publisher.send_replace(self.snapshot);
        }
        self.checkpoint
    }
}

fn sum<'a>(stats: impl Iterator<Item = &'a RunStats>) -> RunStats {
    let mut total = RunStats::default();
    for s in stats {
        total += *s;
    }
    total
}

/// Logs a progress line every `interval` until the task is aborted.
pub async fn report_progress(
    phase: Phase,
    snapshots: watch::Receiver<ProgressSnapshot>,
    interval: Duration,
) {
    let started = Instant::now();
    let baseline = snapshots.borrow().stats.scanned;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let snapshot = *snapshots.borrow();
        tracing::info!("{}", render(phase, &snapshot, baseline, started.elapsed()));
    }
}

/// One progress line. `baseline` is the scanned count when the phase
/// (re)started, so throughput ignores rows processed by earlier runs.
pub fn render(phase: Phase, snapshot: &ProgressSnapshot, baseline: u64, elapsed: Duration) -> String {
    let stats = &snapshot.stats;
    let percent = if snapshot.total_rows == 0 {
        100.0
    } else {
        stats.scanned as f64 / snapshot.total_rows as f64 * 100.0
    };

    let processed_now = stats.scanned.saturating_sub(baseline);
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        processed_now as f64 / secs
    } else {
        0.0
    };
    let eta = if rate > 0.0 {
        let remaining = snapshot.total_rows.saturating_sub(stats.scanned);
        format_duration(Duration::from_secs_f64(remaining as f64 / rate))
    } else {
        "calculating...".to_string()
    };

    format!(
        "{}: {}/{} ({:.1}%) | inserted {} | duplicate {} | unresolved {} | errored {} | {:.0} rows/s | elapsed {} | ETA {}",
        phase,
        stats.scanned,
        snapshot.total_rows,
        percent,
        stats.inserted,
        stats.skipped_duplicate,
        stats.skipped_unresolved,
        stats.errored,
        rate,
        format_duration(elapsed),
        eta
    )
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Final per-phase table.
pub fn summary_table(phases: &[(Phase, RunStats)]) -> String {
    let mut out = format!(
        "{:<14}{:>12}{:>12}{:>12}{:>12}{:>12}\n",
        "phase", "scanned", "inserted", "duplicate", "unresolved", "errored"
    );
    for (phase, stats) in phases {
        out.push_str(&format!(
            "{:<14}{:>12}{:>12}{:>12}{:>12}{:>12}\n",
            phase.to_string(),
            stats.scanned,
            stats.inserted,
            stats.skipped_duplicate,
            stats.skipped_unresolved,
            stats.errored
        ));
    }
    out
}
