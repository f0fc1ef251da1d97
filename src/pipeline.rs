//! Phase orchestration.
//!
//! Setup (connections, reference data, checkpoint) runs once; then each phase
//! is partitioned and handed to a pool of workers. The sale phase must finish
//! with every worker done before the installment phase is partitioned, since
//! installments resolve their parent through the SaleKeyIndex the sale phase
//! fills in. Verification runs only after both phases completed.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, WorkerCheckpoint};
use crate::config::PipelineOptions;
use crate::errors::MigrationError;
use crate::models::{Phase, RunStats};
use crate::partition::{partition, IdRange};
use crate::progress::{render, report_progress, summary_table, ProgressAggregator};
use crate::reference::load_reference_data;
use crate::resolver::KeyResolver;
use crate::retry::{with_retry, with_timeout};
use crate::store::{SourceStore, StoreConnector};
use crate::verify::{verify, VerificationReport};
use crate::worker::{Worker, WorkerOutcome, WorkerReport};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Both phases complete and verification passed.
    Verified,
    /// Both phases complete, destination below the verification threshold.
    VerificationFailed,
    /// Stopped or a worker failed; the checkpoint was left behind.
    Incomplete,
    /// Both phases complete but the row counts could not be read; the
    /// checkpoint was kept so a re-run only verifies.
    VerificationUnavailable,
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Verified => 0,
            RunStatus::Incomplete => 2,
            RunStatus::VerificationFailed => 3,
            RunStatus::VerificationUnavailable => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    pub stats: RunStats,
    pub workers: usize,
    pub failed_workers: Vec<usize>,
    pub cancelled_workers: usize,
    pub poisoned: Vec<IdRange>,
    /// Skipped windows whose rows are missing from `stats`.
    pub uncounted: Vec<IdRange>,
    pub completed: bool,
}

impl PhaseReport {
    fn empty(phase: Phase) -> Self {
        Self {
            phase,
            stats: RunStats::default(),
            workers: 0,
            failed_workers: Vec::new(),
            cancelled_workers: 0,
            poisoned: Vec::new(),
            uncounted: Vec::new(),
            completed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub resumed: bool,
    pub phases: Vec<PhaseReport>,
    pub verification: Option<VerificationReport>,
    pub status: RunStatus,
}

impl RunReport {
    /// Per-phase table followed by the verifier's judgment, if it ran.
    pub fn summary(&self) -> String {
        let rows: Vec<(Phase, RunStats)> = self.phases.iter().map(|p| (p.phase, p.stats)).collect();
        let mut out = summary_table(&rows);
        for phase in self.phases.iter().filter(|p| !p.uncounted.is_empty()) {
            let spans: Vec<String> = phase.uncounted.iter().map(IdRange::to_string).collect();
            out.push_str(&format!(
                "{}: {} skipped window(s) of unknown size: {}\n",
                phase.phase,
                spans.len(),
                spans.join(", ")
            ));
        }
        match (&self.verification, self.status) {
            (Some(verification), _) => out.push_str(&verification.to_string()),
            (None, RunStatus::VerificationUnavailable) => {
                out.push_str("verification could not run: row counts unavailable, checkpoint kept")
            }
            (None, _) => out.push_str("verification skipped: run incomplete, checkpoint kept"),
        }
        out
    }
}

pub struct Pipeline<C> {
    connector: Arc<C>,
    options: Arc<PipelineOptions>,
    stop: watch::Receiver<bool>,
}

impl<C: StoreConnector> Pipeline<C> {
    /// # Arguments
    ///
    /// * `connector` - Opens the source and destination pair for setup and
    ///   for every worker.
    /// * `options` - Workers, window size, retry policy and checkpoint path.
    /// * `stop` - Flips to `true` to stop workers at their next window
    ///   boundary.
    pub fn new(connector: C, options: PipelineOptions, stop: watch::Receiver<bool>) -> Self {
        Self {
            connector: Arc::new(connector),
            options: Arc::new(options),
            stop,
        }
    }

    /// Runs setup, both phases and verification.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - Every run that got past setup, including stopped
    ///   runs, failed workers and verification that could not read the row
    ///   counts. `RunReport::status` tells them apart.
    /// * `Err(MigrationError)` - Setup failures only: a store that cannot be
    ///   reached, missing reference data, an unreadable checkpoint or a
    ///   table whose max id is `i64::MAX`.
    pub async fn run(&self) -> Result<RunReport, MigrationError> {
        let policy = &self.options.retry;

        let source = with_timeout(policy, "connect to source", self.connector.connect_source())
            .await
            .map_err(|e| MigrationError::Setup(format!("cannot connect to source: {}", e)))?;
        let destination = with_timeout(
            policy,
            "connect to destination",
            self.connector.connect_destination(),
        )
        .await
        .map_err(|e| MigrationError::Setup(format!("cannot connect to destination: {}", e)))?;

        let reference = load_reference_data(
            &source,
            &destination,
            &self.options.sale_type_agreements,
            policy,
        )
        .await?;
        let resolver = KeyResolver::new(Arc::new(reference));

        let mut checkpoint = CheckpointStore::open(&self.options.checkpoint_path).await?;
        let run_id = checkpoint.run_id();
        let resumed = checkpoint.resumed();
        tracing::info!(
            "Run {} starting with {} workers, window size {}",
            run_id,
            self.options.workers,
            self.options.window_size
        );

        let mut phases = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            if *self.stop.borrow() {
                tracing::warn!("Stop requested, phase {} not started", phase);
                break;
            }
            let (report, store) = self.run_phase(phase, &source, &resolver, checkpoint).await?;
            checkpoint = store;
            let completed = report.completed;
            phases.push(report);
            if !completed {
                break;
            }
        }

        let complete = phases.len() == Phase::ALL.len() && phases.iter().all(|p| p.completed);
        if !complete {
            tracing::warn!(
                "Run {} incomplete; re-run to resume from {}",
                run_id,
                checkpoint.path().display()
            );
            return Ok(RunReport {
                run_id,
                resumed,
                phases,
                verification: None,
                status: RunStatus::Incomplete,
            });
        }

        let verification = match verify(
            &source,
            &destination,
            self.options.verify_threshold,
            policy,
        )
        .await
        {
            Ok(verification) => verification,
            Err(e) => {
                tracing::error!(
                    "Run {}: verification could not run, checkpoint kept at {}: {}",
                    run_id,
                    checkpoint.path().display(),
                    e
                );
                return Ok(RunReport {
                    run_id,
                    resumed,
                    phases,
                    verification: None,
                    status: RunStatus::VerificationUnavailable,
                });
            }
        };
        let status = if verification.passed() {
            RunStatus::Verified
        } else {
            RunStatus::VerificationFailed
        };

        // both phases are done; a re-run starts a new pass over the source
        if let Err(e) = checkpoint.remove().await {
            tracing::warn!("Could not remove checkpoint: {}", e);
        }

        tracing::info!("Run {} finished: {:?}", run_id, status);
        Ok(RunReport {
            run_id,
            resumed,
            phases,
            verification: Some(verification),
            status,
        })
    }

    async fn run_phase(
        &self,
        phase: Phase,
        source: &C::Source,
        resolver: &KeyResolver,
        mut checkpoint: CheckpointStore,
    ) -> Result<(PhaseReport, CheckpointStore), MigrationError> {
        let bounds = with_retry(&self.options.retry, "read table bounds", || {
            source.bounds(phase)
        })
        .await
        .map_err(|e| {
            MigrationError::Setup(format!("reading bounds of {}: {}", phase.source_table(), e))
        })?;

        if bounds.row_count > 0 && bounds.end_exclusive().is_none() {
            return Err(MigrationError::Setup(format!(
                "{} has an id of {}; ids must stay below i64::MAX",
                phase.source_table(),
                i64::MAX
            )));
        }

        let ranges = partition(&bounds, self.options.workers);
        if ranges.is_empty() {
            tracing::info!("Phase {}: source table is empty, nothing to do", phase);
            return Ok((PhaseReport::empty(phase), checkpoint));
        }

        let starting = checkpoint.reconcile(phase, &ranges);
        if checkpoint.is_phase_complete(phase) {
            tracing::info!("Phase {} already completed by run {}", phase, checkpoint.run_id());
            let mut report = PhaseReport::empty(phase);
            report.workers = starting.len();
            report.stats = phase_stats(&starting);
            report.poisoned = starting.iter().flat_map(|w| w.poisoned.clone()).collect();
            report.uncounted = starting.iter().flat_map(|w| w.uncounted.clone()).collect();
            return Ok((report, checkpoint));
        }
        checkpoint.persist().await?;

        tracing::info!(
            "Phase {}: {} rows, ids {}..={}, {} workers",
            phase,
            bounds.row_count,
            bounds.min_id,
            bounds.max_id,
            ranges.len()
        );

        let (events_tx, events_rx) = mpsc::channel(ranges.len() * 4);
        let (aggregator, snapshots) = ProgressAggregator::new(
            phase,
            checkpoint,
            &starting,
            bounds.row_count.max(0) as u64,
        );
        let baseline = snapshots.borrow().stats.scanned;
        let started = std::time::Instant::now();
        let aggregator = tokio::spawn(aggregator.run(events_rx));
        let reporter = tokio::spawn(report_progress(
            phase,
            snapshots.clone(),
            self.options.progress_interval,
        ));

        let mut reports: Vec<WorkerReport> = Vec::with_capacity(starting.len());
        let mut pool = JoinSet::new();
        for start in starting.iter().cloned() {
            if start.done {
                reports.push(WorkerReport {
                    worker_id: start.worker_id,
                    outcome: WorkerOutcome::Completed,
                    progress: start,
                });
                continue;
            }
            let worker = Worker::new(
                phase,
                start,
                Arc::clone(&self.options),
                resolver.clone(),
                events_tx.clone(),
                self.stop.clone(),
            );
            let connector = Arc::clone(&self.connector);
            pool.spawn(async move { worker.run(connector.as_ref()).await });
        }
        drop(events_tx);

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Phase {} worker task aborted: {}", phase, e),
            }
        }

        reporter.abort();
        let mut checkpoint = aggregator.await.map_err(|e| {
            MigrationError::Checkpoint(format!("progress aggregator stopped: {}", e))
        })?;
        tracing::info!("{}", render(phase, &snapshots.borrow(), baseline, started.elapsed()));
        self.recount_uncounted(phase, source, &mut reports, &mut checkpoint)
            .await;

        let report = phase_report(phase, &starting, &reports);
        if !report.stats.is_conserved() {
            tracing::error!(
                "Phase {} counters do not add up: {} scanned, {} classified",
                phase,
                report.stats.scanned,
                report.stats.classified()
            );
        }

        if report.completed {
            checkpoint.mark_phase_complete(phase);
            checkpoint.persist().await?;
            tracing::info!("Phase {} complete", phase);
        } else if !report.failed_workers.is_empty() {
            tracing::error!(
                "Phase {} incomplete, failed workers: {:?}; later phases will not start",
                phase,
                report.failed_workers
            );
        } else {
            tracing::warn!(
                "Phase {} stopped with {} workers unfinished",
                phase,
                report.cancelled_workers
            );
        }
        Ok((report, checkpoint))
    }

    /// Counts skipped windows whose size was unknown when the worker gave
    /// up on them, and folds their rows into the errored bucket.
    async fn recount_uncounted(
        &self,
        phase: Phase,
        source: &C::Source,
        reports: &mut [WorkerReport],
        checkpoint: &mut CheckpointStore,
    ) {
        let mut changed = false;
        for report in reports.iter_mut() {
            let spans = std::mem::take(&mut report.progress.uncounted);
            if spans.is_empty() {
                continue;
            }
            for span in spans {
                match with_retry(&self.options.retry, "recount poisoned window", || {
                    source.count_range(phase, span.start, span.end)
                })
                .await
                {
                    Ok(count) => {
                        let lost = count.max(0) as u64;
                        tracing::warn!(
                            "Phase {}: skipped window {} held {} rows, marked errored",
                            phase,
                            span,
                            lost
                        );
                        report.progress.stats.scanned += lost;
                        report.progress.stats.errored += lost;
                        report.progress.poisoned.push(span);
                    }
                    Err(e) => {
                        tracing::error!(
                            "Phase {}: rows in skipped window {} remain uncounted: {}",
                            phase,
                            span,
                            e
                        );
                        report.progress.uncounted.push(span);
                    }
                }
            }
            if let Err(e) = checkpoint.record(phase, &report.progress) {
                tracing::error!("Failed to record checkpoint: {}", e);
            }
            changed = true;
        }
        if changed {
            if let Err(e) = checkpoint.persist().await {
                tracing::error!("Failed to write checkpoint: {}", e);
            }
        }
    }
}

fn phase_stats(workers: &[WorkerCheckpoint]) -> RunStats {
    let mut total = RunStats::default();
    for worker in workers {
        total += worker.stats;
    }
    total
}

/// Workers without a report (their task panicked) count as failed with the
/// progress they started from.
fn phase_report(phase: Phase, starting: &[WorkerCheckpoint], reports: &[WorkerReport]) -> PhaseReport {
    let reported: HashSet<usize> = reports.iter().map(|r| r.worker_id).collect();
    let mut failed_workers: Vec<usize> = starting
        .iter()
        .map(|w| w.worker_id)
        .filter(|id| !reported.contains(id))
        .collect();
    failed_workers.extend(
        reports
            .iter()
            .filter(|r| r.outcome == WorkerOutcome::Failed)
            .map(|r| r.worker_id),
    );
    failed_workers.sort_unstable();

    let cancelled_workers = reports
        .iter()
        .filter(|r| r.outcome == WorkerOutcome::Cancelled)
        .count();

    let progress: Vec<WorkerCheckpoint> = starting
        .iter()
        .map(|start| {
            reports
                .iter()
                .find(|r| r.worker_id == start.worker_id)
                .map(|r| r.progress.clone())
                .unwrap_or_else(|| start.clone())
        })
        .collect();

    PhaseReport {
        phase,
        stats: phase_stats(&progress),
        workers: starting.len(),
        completed: failed_workers.is_empty() && cancelled_workers == 0,
        poisoned: progress.iter().flat_map(|w| w.poisoned.clone()).collect(),
        uncounted: progress.iter().flat_map(|w| w.uncounted.clone()).collect(),
        failed_workers,
        cancelled_workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(worker_id: usize, outcome: WorkerOutcome, scanned: u64) -> WorkerReport {
        let mut progress = WorkerCheckpoint::fresh(worker_id, IdRange::new(0, 10));
        progress.stats.scanned = scanned;
        progress.stats.inserted = scanned;
        WorkerReport {
            worker_id,
            outcome,
            progress,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Verified.exit_code(), 0);
        assert_eq!(RunStatus::Incomplete.exit_code(), 2);
        assert_eq!(RunStatus::VerificationFailed.exit_code(), 3);
        assert_eq!(RunStatus::VerificationUnavailable.exit_code(), 4);
    }

    #[test]
    fn test_missing_report_counts_as_failed_worker() {
        let starting: Vec<WorkerCheckpoint> = (0..3)
            .map(|id| WorkerCheckpoint::fresh(id, IdRange::new(0, 10)))
            .collect();
        let reports = vec![
            report(0, WorkerOutcome::Completed, 10),
            report(2, WorkerOutcome::Completed, 7),
        ];

        let phase = phase_report(Phase::Sales, &starting, &reports);
        assert_eq!(phase.failed_workers, vec![1]);
        assert!(!phase.completed);
        assert_eq!(phase.stats.scanned, 17);
    }

    #[test]
    fn test_cancelled_worker_leaves_phase_incomplete() {
        let starting: Vec<WorkerCheckpoint> = (0..2)
            .map(|id| WorkerCheckpoint::fresh(id, IdRange::new(0, 10)))
            .collect();
        let reports = vec![
            report(0, WorkerOutcome::Completed, 10),
            report(1, WorkerOutcome::Cancelled, 3),
        ];

        let phase = phase_report(Phase::Installments, &starting, &reports);
        assert!(phase.failed_workers.is_empty());
        assert_eq!(phase.cancelled_workers, 1);
        assert!(!phase.completed);
    }
}
