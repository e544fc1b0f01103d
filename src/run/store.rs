use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::batch::RawBatch;
use crate::error::StoreError;
use crate::run::{AnalysisRun, FlagRow, RunState, ScoreRow};
use crate::strategy::Strategy;

/// Persistence seam consumed by the orchestrator. Every call is atomic on
/// its own; `commit_results` additionally couples the score and flag writes
/// to the terminal state transition so a run is never observed with a
/// partial result set.
///
/// Only the orchestrator owning a run writes its scores; reads by
/// status-polling clients are unrestricted.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_batch(&self, batch: &RawBatch) -> Result<(), StoreError>;
    async fn load_batch(&self, batch_id: Uuid) -> Result<RawBatch, StoreError>;

    async fn save_strategy(&self, strategy: &Strategy) -> Result<(), StoreError>;
    async fn get_strategy(&self, id: Uuid) -> Result<Strategy, StoreError>;
    async fn list_strategies(&self) -> Result<Vec<Strategy>, StoreError>;

    /// Insert a freshly created run.
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), StoreError>;
    /// Persist a state/progress update for an existing run, but only while
    /// its persisted state is one of `expected`. Returns `Ok(false)` when
    /// the guard loses (a concurrent writer moved the run elsewhere), so
    /// state transitions never run backwards.
    async fn transition_run(
        &self,
        run: &AnalysisRun,
        expected: &[RunState],
    ) -> Result<bool, StoreError>;
    async fn get_run(&self, id: Uuid) -> Result<AnalysisRun, StoreError>;

    async fn save_scores(&self, run_id: Uuid, scores: &[ScoreRow]) -> Result<(), StoreError>;
    async fn save_flags(&self, run_id: Uuid, flags: &[FlagRow]) -> Result<(), StoreError>;

    /// Atomically persist a run's scores, flags, and terminal transition.
    /// Guarded on the run still being `Running`; returns `Ok(false)`
    /// without writing anything when a cancellation won the race.
    async fn commit_results(
        &self,
        run: &AnalysisRun,
        scores: &[ScoreRow],
        flags: &[FlagRow],
    ) -> Result<bool, StoreError>;

    async fn load_results(
        &self,
        run_id: Uuid,
    ) -> Result<(Vec<ScoreRow>, Vec<FlagRow>), StoreError>;
}

/// In-memory store. Backs the test suite and small single-process
/// deployments; the Postgres implementation lives in `db::repository`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    batches: HashMap<Uuid, RawBatch>,
    strategies: HashMap<Uuid, Strategy>,
    runs: HashMap<Uuid, AnalysisRun>,
    scores: HashMap<Uuid, Vec<ScoreRow>>,
    flags: HashMap<Uuid, Vec<FlagRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save_batch(&self, batch: &RawBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<RawBatch, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))
    }

    async fn save_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strategies.insert(strategy.id, strategy.clone());
        Ok(())
    }

    async fn get_strategy(&self, id: Uuid) -> Result<Strategy, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .strategies
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("strategy {id}")))
    }

    async fn list_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut strategies: Vec<_> = inner.strategies.values().cloned().collect();
        strategies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(strategies)
    }

    async fn save_run(&self, run: &AnalysisRun) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn transition_run(
        &self,
        run: &AnalysisRun,
        expected: &[RunState],
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(current) = inner.runs.get(&run.id) else {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        };
        if !expected.contains(&current.state) {
            return Ok(false);
        }
        inner.runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn get_run(&self, id: Uuid) -> Result<AnalysisRun, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))
    }

    async fn save_scores(&self, run_id: Uuid, scores: &[ScoreRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .scores
            .entry(run_id)
            .or_default()
            .extend_from_slice(scores);
        Ok(())
    }

    async fn save_flags(&self, run_id: Uuid, flags: &[FlagRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .flags
            .entry(run_id)
            .or_default()
            .extend_from_slice(flags);
        Ok(())
    }

    async fn commit_results(
        &self,
        run: &AnalysisRun,
        scores: &[ScoreRow],
        flags: &[FlagRow],
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(current) = inner.runs.get(&run.id) else {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        };
        if current.state != RunState::Running {
            return Ok(false);
        }
        inner.scores.insert(run.id, scores.to_vec());
        inner.flags.insert(run.id, flags.to_vec());
        inner.runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn load_results(
        &self,
        run_id: Uuid,
    ) -> Result<(Vec<ScoreRow>, Vec<FlagRow>), StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok((
            inner.scores.get(&run_id).cloned().unwrap_or_default(),
            inner.flags.get(&run_id).cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunState;

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = MemoryStore::new();
        let mut run = AnalysisRun::new(Uuid::new_v4(), Uuid::new_v4());
        store.save_run(&run).await.unwrap();

        run.state = RunState::Running;
        let won = store
            .transition_run(&run, &[RunState::Pending])
            .await
            .unwrap();
        assert!(won);

        let loaded = store.get_run(run.id).await.unwrap();
        assert_eq!(loaded.state, RunState::Running);
    }

    #[tokio::test]
    async fn test_transition_guard_refuses_backwards_moves() {
        let store = MemoryStore::new();
        let mut run = AnalysisRun::new(Uuid::new_v4(), Uuid::new_v4());
        run.state = RunState::Cancelling;
        store.save_run(&run).await.unwrap();

        // A stale writer still believing the run is pending or running
        // must not overwrite the cancellation.
        let mut stale = run.clone();
        stale.state = RunState::Running;
        let won = store
            .transition_run(&stale, &[RunState::Pending, RunState::Running])
            .await
            .unwrap();
        assert!(!won);
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::Cancelling
        );

        // The matching guard moves it forward.
        let mut cancelled = run.clone();
        cancelled.state = RunState::Cancelled;
        let won = store
            .transition_run(&cancelled, &[RunState::Cancelling])
            .await
            .unwrap();
        assert!(won);
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_commit_refused_once_run_left_running() {
        let store = MemoryStore::new();
        let mut run = AnalysisRun::new(Uuid::new_v4(), Uuid::new_v4());
        run.state = RunState::Cancelling;
        store.save_run(&run).await.unwrap();

        let scores = vec![ScoreRow {
            transaction_id: "t-1".to_string(),
            algorithm: "zscore".to_string(),
            score: 0.42,
            confidence: Some(0.42),
            metadata: serde_json::Value::Null,
        }];
        let mut completed = run.clone();
        completed.state = RunState::Completed;

        let won = store.commit_results(&completed, &scores, &[]).await.unwrap();
        assert!(!won);
        assert_eq!(
            store.get_run(run.id).await.unwrap().state,
            RunState::Cancelling
        );
        let (loaded_scores, _) = store.load_results(run.id).await.unwrap();
        assert!(loaded_scores.is_empty());
    }

    #[tokio::test]
    async fn test_scores_and_flags_round_trip() {
        let store = MemoryStore::new();
        let run = AnalysisRun::new(Uuid::new_v4(), Uuid::new_v4());
        store.save_run(&run).await.unwrap();

        let scores = vec![ScoreRow {
            transaction_id: "t-1".to_string(),
            algorithm: "zscore".to_string(),
            score: 0.42,
            confidence: Some(0.42),
            metadata: serde_json::Value::Null,
        }];
        let flags = vec![FlagRow {
            transaction_id: "t-1".to_string(),
            rule: "weekend_threshold".to_string(),
            triggered: true,
            flag_value: None,
        }];

        store.save_scores(run.id, &scores).await.unwrap();
        store.save_flags(run.id, &flags).await.unwrap();

        let (loaded_scores, loaded_flags) = store.load_results(run.id).await.unwrap();
        assert_eq!(loaded_scores, scores);
        assert_eq!(loaded_flags, flags);
    }

    #[tokio::test]
    async fn test_missing_rows_report_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_run(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.load_batch(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
