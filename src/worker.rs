//! Worker: drives read -> transform -> write over one id range.
//!
//! `Running -> (Draining | Failed) -> Done`. A worker owns its own pair of
//! store connections for its whole lifetime and reports progress only
//! through [`ProgressEvent`]s.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::checkpoint::WorkerCheckpoint;
use crate::config::PipelineOptions;
use crate::errors::MigrationError;
use crate::models::{Phase, RunStats};
use crate::partition::IdRange;
use crate::progress::ProgressEvent;
use crate::resolver::KeyResolver;
use crate::retry::{with_retry, with_timeout};
use crate::store::{DestinationStore, SourceStore, StoreConnector};
use crate::transform::{BatchTransformer, TransformedWindow};
use crate::writer::{BatchWriter, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Running,
    Draining,
    Failed,
    Done,
}

/// How a worker left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerOutcome {
    /// Range exhausted.
    Completed,
    /// Stop signal received; the range is not exhausted.
    Cancelled,
    /// Could not obtain its connections.
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub outcome: WorkerOutcome,
    pub progress: WorkerCheckpoint,
}

pub struct Worker {
    phase: Phase,
    progress: WorkerCheckpoint,
    state: WorkerState,
    options: Arc<PipelineOptions>,
    resolver: KeyResolver,
    events: mpsc::Sender<ProgressEvent>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        phase: Phase,
        start: WorkerCheckpoint,
        options: Arc<PipelineOptions>,
        resolver: KeyResolver,
        events: mpsc::Sender<ProgressEvent>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            phase,
            progress: start,
            state: WorkerState::Running,
            options,
            resolver,
            events,
            stop,
        }
    }

    pub fn id(&self) -> usize {
        self.progress.worker_id
    }

    pub async fn run<C: StoreConnector>(mut self, connector: &C) -> WorkerReport {
        let (source, destination) = match self.connect(connector).await {
            Ok(stores) => stores,
            Err(e) => {
                tracing::error!("{} worker {} could not connect: {}", self.phase, self.id(), e);
                self.transition(WorkerState::Failed);
                return self.finish(WorkerOutcome::Failed).await;
            }
        };

        tracing::debug!(
            "{} worker {} starting at {} in {}",
            self.phase,
            self.id(),
            self.progress.cursor,
            self.progress.range
        );

        let mut outcome = WorkerOutcome::Completed;
        while self.progress.cursor < self.progress.range.end {
            if *self.stop.borrow() {
                outcome = WorkerOutcome::Cancelled;
                break;
            }
            self.process_window(&source, &destination).await;
        }

        self.transition(WorkerState::Draining);
        if outcome == WorkerOutcome::Completed {
            self.progress.done = true;
            self.commit().await;
        }
        self.finish(outcome).await
    }

    async fn connect<C: StoreConnector>(
        &self,
        connector: &C,
    ) -> Result<(C::Source, C::Destination), MigrationError> {
        let policy = &self.options.retry;
        let source = with_retry(policy, "connect to source", || connector.connect_source()).await?;
        let destination =
            with_retry(policy, "connect to destination", || connector.connect_destination())
                .await?;
        Ok((source, destination))
    }

    async fn process_window<S, D>(&mut self, source: &S, destination: &D)
    where
        S: SourceStore,
        D: DestinationStore,
    {
        let policy = &self.options.retry;
        let start = self.progress.cursor;
        let end = self.progress.range.end;
        let limit = self.options.window_size;
        let resolver = &self.resolver;
        let writer = BatchWriter::new(destination, policy, &resolver.reference().sale_index);
        let transformer = BatchTransformer::new(resolver);

        let result = match self.phase {
            Phase::Sales => {
                match with_retry(policy, "read sales window", || source.read_sales(start, end, limit))
                    .await
                {
                    Ok(rows) => {
                        let window = transformer.sales(&rows);
                        let outcome = writer.write_sales(&window.staged).await;
                        Ok((rows.len(), settle(&window, outcome)))
                    }
                    Err(e) => Err(e),
                }
            }
            Phase::Installments => {
                match with_retry(policy, "read installments window", || {
                    source.read_installments(start, end, limit)
                })
                .await
                {
                    Ok(rows) => {
                        let window = transformer.installments(&rows);
                        let outcome = writer.write_installments(&window.staged).await;
                        Ok((rows.len(), settle(&window, outcome)))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok((read, (stats, last_id))) => {
                self.progress.stats += stats;
                tracing::debug!(
                    "{} worker {} window at {}: {} read, {} inserted, {} duplicate, {} unresolved, {} errored",
                    self.phase,
                    self.id(),
                    start,
                    read,
                    stats.inserted,
                    stats.skipped_duplicate,
                    stats.skipped_unresolved,
                    stats.errored
                );
                // a short window means the range is exhausted
                self.progress.cursor = match last_id {
                    Some(id) if read >= limit => id.saturating_add(1).min(end),
                    _ => end,
                };
                if last_id.is_some() {
                    self.progress.last_processed_id = last_id;
                }
            }
            Err(e) => self.skip_poison_window(source, start, e).await,
        }
        self.commit().await;
    }

    /// A read that exhausted its retries: count what the window would have
    /// covered as errored and move past it.
    async fn skip_poison_window<S: SourceStore>(
        &mut self,
        source: &S,
        start: i64,
        error: MigrationError,
    ) {
        let span_end = start
            .saturating_add(self.options.window_size as i64)
            .min(self.progress.range.end);
        let span = IdRange::new(start, span_end);

        let counted = with_timeout(
            &self.options.retry,
            "count poisoned window",
            source.count_range(self.phase, span.start, span.end),
        )
        .await;

        match counted {
            Ok(count) => {
                let lost = count.max(0) as u64;
                tracing::error!(
                    "{} worker {} giving up on window {} ({} rows marked errored): {}",
                    self.phase,
                    self.id(),
                    span,
                    lost,
                    error
                );
                self.progress.stats.scanned += lost;
                self.progress.stats.errored += lost;
                self.progress.poisoned.push(span);
            }
            Err(count_error) => {
                // counted again once the phase's workers have finished
                tracing::error!(
                    "{} worker {} giving up on window {} of unknown size: {} (count failed: {})",
                    self.phase,
                    self.id(),
                    span,
                    error,
                    count_error
                );
                self.progress.uncounted.push(span);
            }
        }
        self.progress.cursor = span.end;
    }

    async fn commit(&self) {
        let _ = self
            .events
            .send(ProgressEvent::WindowCommitted(self.progress.clone()))
            .await;
    }

    async fn finish(mut self, outcome: WorkerOutcome) -> WorkerReport {
        self.transition(WorkerState::Done);
        let _ = self
            .events
            .send(ProgressEvent::WorkerFinished {
                worker_id: self.id(),
                outcome,
            })
            .await;
        WorkerReport {
            worker_id: self.id(),
            outcome,
            progress: self.progress,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::debug!(
            "{} worker {}: {:?} -> {:?}",
            self.phase,
            self.id(),
            self.state,
            next
        );
        self.state = next;
    }
}

/// Window stats after writing, plus the highest id seen.
fn settle<T>(window: &TransformedWindow<T>, written: WriteOutcome) -> (RunStats, Option<i64>) {
    let mut stats = window.stats;
    stats.inserted += written.inserted;
    stats.skipped_duplicate += written.skipped_duplicate;
    stats.errored += written.errored;
    (stats, window.last_id)
}
