//! Checkpoint Store.
//!
//! A JSON document rewritten atomically (temp file + rename) after every
//! committed window. Each phase carries a fingerprint of the partition layout
//! it was recorded under; a checkpoint whose layout no longer matches the
//! current partition is discarded and that phase restarts from scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::MigrationError;
use crate::models::{Phase, RunStats};
use crate::partition::IdRange;

/// Progress of one worker within one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCheckpoint {
    pub worker_id: usize,
    pub range: IdRange,
    /// Next id to read. Never decreases.
    pub cursor: i64,
    pub last_processed_id: Option<i64>,
    pub stats: RunStats,
    pub done: bool,
    /// Id spans given up on after read retries were exhausted.
    #[serde(default)]
    pub poisoned: Vec<IdRange>,
    /// Poisoned spans whose row count could not be read either; their rows
    /// are not in `stats` yet.
    #[serde(default)]
    pub uncounted: Vec<IdRange>,
}

impl WorkerCheckpoint {
    pub fn fresh(worker_id: usize, range: IdRange) -> Self {
        Self {
            worker_id,
            range,
            cursor: range.start,
            last_processed_id: None,
            stats: RunStats::default(),
            done: false,
            poisoned: Vec::new(),
            uncounted: Vec::new(),
        }
    }

    /// Ids left to read.
    pub fn remaining(&self) -> IdRange {
        IdRange::new(self.cursor.max(self.range.start), self.range.end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub phase: Phase,
    pub fingerprint: String,
    pub workers: Vec<WorkerCheckpoint>,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl PhaseCheckpoint {
    pub fn stats(&self) -> RunStats {
        let mut total = RunStats::default();
        for worker in &self.workers {
            total += worker.stats;
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub phases: Vec<PhaseCheckpoint>,
}

impl Checkpoint {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            phases: Vec::new(),
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseCheckpoint> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    fn phase_mut(&mut self, phase: Phase) -> Option<&mut PhaseCheckpoint> {
        self.phases.iter_mut().find(|p| p.phase == phase)
    }
}

/// SHA-256 over the phase name and every range, hex encoded.
pub fn layout_fingerprint(phase: Phase, ranges: &[IdRange]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phase.to_string().as_bytes());
    for range in ranges {
        hasher.update(range.start.to_be_bytes());
        hasher.update(range.end.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Reads a checkpoint file without opening a store; `None` if absent.
pub async fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, MigrationError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            MigrationError::Checkpoint(format!("{} is not a valid checkpoint: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MigrationError::Io(e)),
    }
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Checkpoint,
    resumed: bool,
}

impl CheckpointStore {
    /// Loads the checkpoint at `path`, or starts a new run if there is none.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MigrationError> {
        let path = path.into();
        let (state, resumed) = match read_checkpoint(&path).await? {
            Some(state) => {
                tracing::info!(
                    "Resuming run {} from checkpoint {} (started {})",
                    state.run_id,
                    path.display(),
                    state.started_at
                );
                (state, true)
            }
            None => (Checkpoint::new(), false),
        };
        Ok(Self {
            path,
            state,
            resumed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.state
    }

    /// Returns the starting point of every worker for `phase`.
    ///
    /// Recorded progress is kept only if it was written under the same
    /// partition layout; otherwise the phase starts over from `ranges`.
    pub fn reconcile(&mut self, phase: Phase, ranges: &[IdRange]) -> Vec<WorkerCheckpoint> {
        let fingerprint = layout_fingerprint(phase, ranges);

        if let Some(recorded) = self.state.phase(phase) {
            if recorded.fingerprint == fingerprint && recorded.workers.len() == ranges.len() {
                tracing::info!(
                    "Phase {}: resuming {} workers from checkpoint",
                    phase,
                    recorded.workers.len()
                );
                return recorded.workers.clone();
            }
            tracing::warn!(
                "Phase {}: checkpoint was recorded under a different partition layout, restarting phase",
                phase
            );
        }

        let workers: Vec<WorkerCheckpoint> = ranges
            .iter()
            .enumerate()
            .map(|(id, range)| WorkerCheckpoint::fresh(id, *range))
            .collect();
        self.state.phases.retain(|p| p.phase != phase);
        self.state.phases.push(PhaseCheckpoint {
            phase,
            fingerprint,
            workers: workers.clone(),
            completed: false,
            updated_at: Utc::now(),
        });
        workers
    }

    /// Records a worker's progress. Cursors and last processed ids only move forward.
    pub fn record(&mut self, phase: Phase, update: &WorkerCheckpoint) -> Result<(), MigrationError> {
        let recorded = self.state.phase_mut(phase).ok_or_else(|| {
            MigrationError::Checkpoint(format!("phase {} was never reconciled", phase))
        })?;
        let worker = recorded
            .workers
            .iter_mut()
            .find(|w| w.worker_id == update.worker_id)
            .ok_or_else(|| {
                MigrationError::Checkpoint(format!(
                    "phase {} has no worker {}",
                    phase, update.worker_id
                ))
            })?;

        if update.cursor < worker.cursor {
            tracing::warn!(
                "Ignoring checkpoint regression for {} worker {}: {} < {}",
                phase,
                update.worker_id,
                update.cursor,
                worker.cursor
            );
            return Ok(());
        }
        worker.cursor = update.cursor;
        worker.last_processed_id = worker.last_processed_id.max(update.last_processed_id);
        worker.stats = update.stats;
        worker.done = update.done;
        worker.poisoned = update.poisoned.clone();
        worker.uncounted = update.uncounted.clone();
        recorded.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_phase_complete(&mut self, phase: Phase) {
        if let Some(recorded) = self.state.phase_mut(phase) {
            recorded.completed = true;
            recorded.updated_at = Utc::now();
        }
    }

    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        self.state.phase(phase).map(|p| p.completed).unwrap_or(false)
    }

    /// Atomically overwrites the checkpoint file.
    pub async fn persist(&self) -> Result<(), MigrationError> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Deletes the checkpoint file; the next invocation starts a new run.
    pub async fn remove(self) -> Result<(), MigrationError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MigrationError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ranges() -> Vec<IdRange> {
        vec![IdRange::new(1, 51), IdRange::new(51, 101)]
    }

    #[tokio::test]
    async fn test_missing_file_starts_new_run() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("cp.json")).await.unwrap();
        assert!(!store.resumed());
        assert!(store.checkpoint().phases.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");

        let mut store = CheckpointStore::open(&path).await.unwrap();
        let run_id = store.run_id();
        let mut workers = store.reconcile(Phase::Sales, &ranges());
        workers[1].cursor = 80;
        workers[1].last_processed_id = Some(79);
        workers[1].stats.scanned = 29;
        workers[1].stats.inserted = 29;
        store.record(Phase::Sales, &workers[1]).unwrap();
        store.persist().await.unwrap();

        let mut reopened = CheckpointStore::open(&path).await.unwrap();
        assert!(reopened.resumed());
        assert_eq!(reopened.run_id(), run_id);
        let resumed = reopened.reconcile(Phase::Sales, &ranges());
        assert_eq!(resumed[0].cursor, 1);
        assert_eq!(resumed[1].cursor, 80);
        assert_eq!(resumed[1].remaining(), IdRange::new(80, 101));
        assert_eq!(resumed[1].stats.inserted, 29);
    }

    #[tokio::test]
    async fn test_layout_change_discards_phase() {
        let dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(dir.path().join("cp.json")).await.unwrap();
        let mut workers = store.reconcile(Phase::Sales, &ranges());
        workers[0].cursor = 40;
        store.record(Phase::Sales, &workers[0]).unwrap();

        let three = vec![
            IdRange::new(1, 34),
            IdRange::new(34, 67),
            IdRange::new(67, 101),
        ];
        let restarted = store.reconcile(Phase::Sales, &three);
        assert_eq!(restarted.len(), 3);
        assert!(restarted.iter().all(|w| w.cursor == w.range.start));
        assert_eq!(store.checkpoint().phases.len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_back() {
        let dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::open(dir.path().join("cp.json")).await.unwrap();
        let mut workers = store.reconcile(Phase::Installments, &ranges());
        workers[0].cursor = 30;
        store.record(Phase::Installments, &workers[0]).unwrap();
        workers[0].cursor = 10;
        store.record(Phase::Installments, &workers[0]).unwrap();

        let recorded = store.checkpoint().phase(Phase::Installments).unwrap();
        assert_eq!(recorded.workers[0].cursor, 30);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            CheckpointStore::open(&path).await,
            Err(MigrationError::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        let mut store = CheckpointStore::open(&path).await.unwrap();
        store.reconcile(Phase::Sales, &ranges());
        store.persist().await.unwrap();
        assert!(path.exists());

        store.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_fingerprint_depends_on_phase_and_ranges() {
        let a = layout_fingerprint(Phase::Sales, &ranges());
        assert_eq!(a, layout_fingerprint(Phase::Sales, &ranges()));
        assert_ne!(a, layout_fingerprint(Phase::Installments, &ranges()));
        assert_ne!(a, layout_fingerprint(Phase::Sales, &ranges()[..1]));
        assert_eq!(a.len(), 64);
    }
}
