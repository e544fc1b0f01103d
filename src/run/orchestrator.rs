use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::algo::registry::AlgorithmRegistry;
use crate::algo::COMBINED_ALGORITHM;
use crate::batch::TransformedBatch;
use crate::config::{AnalysisConfig, RetryConfig};
use crate::engine::{self, EngineOutput};
use crate::error::{RunError, StoreError, StrategyProblem, StrategyValidationError};
use crate::run::store::ResultStore;
use crate::run::{AnalysisRun, FlagRow, RunResults, RunState, RunSummary, ScoreRow};
use crate::strategy::{validate_strategy, Strategy};
use crate::transform::transform_batch;

/// Drives analysis runs through their state machine: schedules each
/// accepted run as an independent unit of asynchronous work, tracks
/// progress, retries transient storage failures, and settles every run in
/// exactly one terminal state.
pub struct Orchestrator {
    registry: Arc<AlgorithmRegistry>,
    store: Arc<dyn ResultStore>,
    config: AnalysisConfig,
    limiter: Arc<Semaphore>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        store: Arc<dyn ResultStore>,
        config: AnalysisConfig,
    ) -> Arc<Self> {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Arc::new(Self {
            registry,
            store,
            config,
            limiter,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Validate the bound strategy and register a PENDING run, then hand it
    /// to asynchronous execution. Invalid strategies are rejected here,
    /// synchronously, before any run exists.
    pub async fn create_run(
        self: &Arc<Self>,
        batch_id: Uuid,
        strategy_id: Uuid,
    ) -> Result<Uuid, RunError> {
        let strategy = retry_store(&self.config.retry, || self.store.get_strategy(strategy_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => RunError::StrategyNotFound(strategy_id),
                other => RunError::Store(other),
            })?;

        if !strategy.active {
            return Err(RunError::InvalidStrategy(StrategyValidationError {
                problems: vec![StrategyProblem::Inactive],
            }));
        }
        validate_strategy(&strategy, &self.registry)?;

        let run = AnalysisRun::new(batch_id, strategy_id);
        retry_store(&self.config.retry, || self.store.save_run(&run)).await?;

        self.schedule(run.id).await;

        tracing::info!(
            run_id = %run.id,
            batch_id = %batch_id,
            strategy = %strategy.name,
            "Analysis run created"
        );
        Ok(run.id)
    }

    /// Hand a PENDING run to background execution. The spawned task is the
    /// delivery mechanism only; the persisted state machine stays the
    /// source of truth.
    async fn schedule(self: &Arc<Self>, run_id: Uuid) {
        let token = self.shutdown.child_token();
        self.active.lock().await.insert(run_id, token.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(run_id, token).await;
        });
    }

    async fn execute(self: Arc<Self>, run_id: Uuid, cancel: CancellationToken) {
        // Bounds the number of runs executing at once; queued runs stay
        // PENDING until a permit frees up.
        let _permit = match Arc::clone(&self.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        if let Err(e) = self.execute_inner(run_id, &cancel).await {
            tracing::error!(run_id = %run_id, error = %e, "Analysis run execution failed");
        }

        self.active.lock().await.remove(&run_id);
    }

    async fn execute_inner(&self, run_id: Uuid, cancel: &CancellationToken) -> eyre::Result<()> {
        let mut run = retry_store(&self.config.retry, || self.store.get_run(run_id)).await?;

        if run.state != RunState::Pending {
            tracing::warn!(run_id = %run_id, state = run.state.as_str(), "Run is not pending, skipping");
            return Ok(());
        }
        if cancel.is_cancelled() {
            self.settle_cancelled(&mut run).await;
            return Ok(());
        }

        // Load collaborator inputs. Missing references and structural
        // batch problems are permanent: the request itself is invalid.
        let strategy =
            match retry_store(&self.config.retry, || self.store.get_strategy(run.strategy_id))
                .await
            {
                Ok(strategy) => strategy,
                Err(e) => {
                    self.fail_run(&mut run, format!("strategy unavailable: {e}")).await;
                    return Ok(());
                }
            };

        // The strategy may have been edited between creation and pickup;
        // an invalid one must never reach RUNNING.
        if let Err(e) = validate_strategy(&strategy, &self.registry) {
            self.fail_run(&mut run, e.to_string()).await;
            return Ok(());
        }

        let raw = match retry_store(&self.config.retry, || self.store.load_batch(run.batch_id))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                self.fail_run(&mut run, format!("batch unavailable: {e}")).await;
                return Ok(());
            }
        };

        let transformed = match transform_batch(&raw) {
            Ok(batch) => Arc::new(batch),
            Err(e) => {
                self.fail_run(&mut run, e.to_string()).await;
                return Ok(());
            }
        };

        if cancel.is_cancelled() {
            self.settle_cancelled(&mut run).await;
            return Ok(());
        }

        run.state = RunState::Running;
        run.started_at = Some(Utc::now());
        run.total_transactions = transformed.len() as u64;
        let won = retry_store(&self.config.retry, || {
            self.store.transition_run(&run, &[RunState::Pending])
        })
        .await?;
        if !won {
            // A cancellation reached storage before the run started.
            self.settle_cancelled(&mut run).await;
            return Ok(());
        }

        let passes = Arc::new(AtomicU64::new(0));
        let ticker_token = CancellationToken::new();
        let ticker = self.spawn_progress_ticker(
            run.clone(),
            Arc::clone(&passes),
            strategy.algorithms.len() as u64,
            ticker_token.clone(),
        );

        let output =
            engine::execute_strategy(&self.registry, &strategy, Arc::clone(&transformed), passes)
                .await;

        ticker_token.cancel();
        let _ = ticker.await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                self.fail_run(&mut run, e.to_string()).await;
                return Ok(());
            }
        };

        // In-flight passes were allowed to finish, but a cancelled run
        // discards them: no partial results ever reach storage.
        if cancel.is_cancelled() {
            self.settle_cancelled(&mut run).await;
            return Ok(());
        }

        let (scores, flags) = collect_rows(&output);
        let summary = build_summary(&run, &strategy, &transformed, &output);

        run.state = RunState::Completed;
        run.processed_transactions = run.total_transactions;
        run.completed_at = Some(Utc::now());
        run.summary = Some(summary);

        // Scores, flags, and the COMPLETED transition land atomically,
        // guarded on the run still being RUNNING; exhausting the retry
        // budget escalates to FAILED.
        let committed = retry_store(&self.config.retry, || {
            self.store.commit_results(&run, &scores, &flags)
        })
        .await;
        match committed {
            Ok(true) => {}
            Ok(false) => {
                // Cancellation won the race; nothing was written.
                run.summary = None;
                self.settle_cancelled(&mut run).await;
                return Ok(());
            }
            Err(e) => {
                self.fail_run(&mut run, format!("failed to persist results: {e}")).await;
                return Ok(());
            }
        }

        tracing::info!(
            run_id = %run.id,
            transactions = run.total_transactions,
            anomalies = run.summary.as_ref().map(|s| s.anomalies_detected).unwrap_or(0),
            "Analysis run completed"
        );
        Ok(())
    }

    fn spawn_progress_ticker(
        &self,
        mut snapshot: AnalysisRun,
        passes: Arc<AtomicU64>,
        algorithm_count: u64,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval_ms = self.config.progress_interval_ms;
        let batch_len = snapshot.total_transactions;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let done = passes.load(Ordering::Relaxed);
                        let processed = if algorithm_count == 0 {
                            0
                        } else {
                            batch_len * done / algorithm_count
                        };
                        if processed != snapshot.processed_transactions {
                            snapshot.processed_transactions = processed;
                            // Best effort; the terminal commit carries the
                            // authoritative counts. Guarded so a ticker
                            // update can never undo a cancellation.
                            match store.transition_run(&snapshot, &[RunState::Running]).await {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(e) => {
                                    tracing::debug!(run_id = %snapshot.id, error = %e, "Progress update failed");
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    async fn settle_cancelled(&self, run: &mut AnalysisRun) {
        run.state = RunState::Cancelled;
        run.completed_at = Some(Utc::now());
        run.error_message = Some("cancelled by request".to_string());
        let run: &AnalysisRun = run;
        let expected = [RunState::Pending, RunState::Running, RunState::Cancelling];
        match retry_store(&self.config.retry, || self.store.transition_run(run, &expected)).await
        {
            Ok(true) => tracing::info!(run_id = %run.id, "Analysis run cancelled"),
            Ok(false) => {
                tracing::debug!(run_id = %run.id, "Run already settled, skipping cancellation")
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Failed to persist cancellation")
            }
        }
    }

    async fn fail_run(&self, run: &mut AnalysisRun, message: String) {
        run.state = RunState::Failed;
        run.completed_at = Some(Utc::now());
        run.error_message = Some(message.clone());
        let won = {
            let snapshot: &AnalysisRun = run;
            retry_store(&self.config.retry, || {
                self.store
                    .transition_run(snapshot, &[RunState::Pending, RunState::Running])
            })
            .await
        };
        match won {
            Ok(true) => {
                tracing::warn!(run_id = %run.id, error = %message, "Analysis run failed")
            }
            Ok(false) => {
                // The run was moved to CANCELLING under us; the failure is
                // moot and the cancellation settles it.
                self.settle_cancelled(run).await;
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Failed to persist failure state")
            }
        }
    }

    /// Request cancellation. A RUNNING run moves to CANCELLING and settles
    /// CANCELLED once its in-flight pass finishes; a PENDING run settles
    /// CANCELLED when its worker picks it up.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), RunError> {
        let mut run = retry_store(&self.config.retry, || self.store.get_run(run_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => RunError::RunNotFound(run_id),
                other => RunError::Store(other),
            })?;

        if run.state.is_terminal() {
            return Err(RunError::AlreadyTerminal(run_id));
        }
        if run.state == RunState::Cancelling {
            return Ok(());
        }

        let token = self.active.lock().await.get(&run_id).cloned();
        match token {
            Some(token) => {
                if run.state == RunState::Running {
                    run.state = RunState::Cancelling;
                    let won = retry_store(&self.config.retry, || {
                        self.store.transition_run(&run, &[RunState::Running])
                    })
                    .await?;
                    if !won {
                        // Lost the race: either a concurrent cancel already
                        // moved it to CANCELLING, or the run settled.
                        let current =
                            retry_store(&self.config.retry, || self.store.get_run(run_id))
                                .await?;
                        if current.state != RunState::Cancelling {
                            return Err(RunError::AlreadyTerminal(run_id));
                        }
                    }
                }
                token.cancel();
            }
            None => {
                // No executor owns this run in-process; settle directly.
                run.state = RunState::Cancelled;
                run.completed_at = Some(Utc::now());
                run.error_message = Some("cancelled by request".to_string());
                let won = retry_store(&self.config.retry, || {
                    self.store
                        .transition_run(&run, &[RunState::Pending, RunState::Running])
                })
                .await?;
                if !won {
                    return Err(RunError::AlreadyTerminal(run_id));
                }
            }
        }
        Ok(())
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> Result<AnalysisRun, RunError> {
        retry_store(&self.config.retry, || self.store.get_run(run_id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => RunError::RunNotFound(run_id),
                other => RunError::Store(other),
            })
    }

    /// Full results for a COMPLETED run: per-transaction aggregates,
    /// per-algorithm scores, and rule flags.
    pub async fn get_run_results(&self, run_id: Uuid) -> Result<RunResults, RunError> {
        let run = self.get_run_status(run_id).await?;
        if run.state != RunState::Completed {
            return Err(RunError::NotReady(run_id));
        }

        let (scores, flags) =
            retry_store(&self.config.retry, || self.store.load_results(run_id)).await?;
        let (aggregates, algorithm_scores) = scores
            .into_iter()
            .partition(|s| s.algorithm == COMBINED_ALGORITHM);

        Ok(RunResults {
            run_id,
            aggregates,
            algorithm_scores,
            flags,
        })
    }

    /// Cancel all in-flight runs; used on process shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let active = self.active.lock().await;
        for token in active.values() {
            token.cancel();
        }
    }
}

/// Flatten engine output into persisted rows in a stable order.
fn collect_rows(output: &EngineOutput) -> (Vec<ScoreRow>, Vec<FlagRow>) {
    let mut scores = Vec::new();
    for result in &output.per_algorithm {
        for score in &result.detection.scores {
            scores.push(ScoreRow {
                transaction_id: score.transaction_id.clone(),
                algorithm: result.algorithm.clone(),
                score: score.score,
                confidence: score.confidence,
                metadata: score.metadata.clone(),
            });
        }
    }
    for aggregate in &output.aggregates {
        scores.push(ScoreRow {
            transaction_id: aggregate.transaction_id.clone(),
            algorithm: COMBINED_ALGORITHM.to_string(),
            score: aggregate.score,
            confidence: aggregate.confidence,
            metadata: aggregate.metadata.clone(),
        });
    }
    scores.sort_by(|a, b| {
        (a.algorithm.as_str(), a.transaction_id.as_str())
            .cmp(&(b.algorithm.as_str(), b.transaction_id.as_str()))
    });

    let mut flags: Vec<FlagRow> = output
        .flags
        .iter()
        .map(|f| FlagRow {
            transaction_id: f.transaction_id.clone(),
            rule: f.rule.clone(),
            triggered: f.triggered,
            flag_value: f.flag_value.clone(),
        })
        .collect();
    flags.sort_by(|a, b| {
        (a.rule.as_str(), a.transaction_id.as_str())
            .cmp(&(b.rule.as_str(), b.transaction_id.as_str()))
    });

    (scores, flags)
}

fn build_summary(
    run: &AnalysisRun,
    strategy: &Strategy,
    batch: &TransformedBatch,
    output: &EngineOutput,
) -> RunSummary {
    let anomalies = output
        .aggregates
        .iter()
        .filter(|s| s.score >= strategy.anomaly_threshold)
        .count() as u64;
    let duration_ms = run
        .started_at
        .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
        .unwrap_or(0);

    RunSummary {
        transactions_processed: batch.len() as u64,
        algorithms_executed: strategy.algorithms.len() as u32,
        anomalies_detected: anomalies,
        excluded_transactions: batch.excluded.clone(),
        duration_ms,
    }
}

/// Retry a storage operation with exponential backoff. Only transient
/// failures are retried; configuration and structural errors propagate
/// immediately.
async fn retry_store<T, F, Fut>(retry: &RetryConfig, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(retry.initial_backoff_ms);
    let max_delay = Duration::from_millis(retry.max_backoff_ms);

    for attempt in 0..retry.max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = retry.max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient storage failure, retrying..."
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }
            Err(e) => return Err(e),
        }
    }

    // Final attempt, propagating the error.
    f().await
}
