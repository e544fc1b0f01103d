use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

use crate::batch::{RawBatch, RawTransaction};
use crate::error::StoreError;
use crate::run::store::ResultStore;
use crate::run::{AnalysisRun, FlagRow, RunState, ScoreRow};
use crate::strategy::{AlgorithmSpec, CombinationPolicy, Strategy};

/// PostgreSQL-backed result store. Multi-row inserts are chunked into
/// groups of 1000 to stay within PostgreSQL parameter limits.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Classify a driver error by whether a retry can help. Connection-level
/// failures are transient; constraint violations and decode errors are not.
fn store_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Transient(e.to_string()),
        _ => StoreError::Permanent(e.to_string()),
    }
}

fn decode_err(what: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Permanent(format!("failed to decode {what}: {e}"))
}

type StrategyRow = (Uuid, String, i32, String, JsonValue, bool, f64);

fn strategy_from_row(row: StrategyRow) -> Result<Strategy, StoreError> {
    let (id, name, version, policy, algorithms, active, anomaly_threshold) = row;
    let policy: CombinationPolicy = serde_json::from_value(JsonValue::String(policy))
        .map_err(|e| decode_err("combination policy", e))?;
    let algorithms: Vec<AlgorithmSpec> =
        serde_json::from_value(algorithms).map_err(|e| decode_err("algorithm list", e))?;
    Ok(Strategy {
        id,
        name,
        version: version as u32,
        algorithms,
        policy,
        active,
        anomaly_threshold,
    })
}

type RunRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    i64,
    i64,
    Option<String>,
    Option<JsonValue>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn run_from_row(row: RunRow) -> Result<AnalysisRun, StoreError> {
    let (
        id,
        batch_id,
        strategy_id,
        state,
        total,
        processed,
        error_message,
        summary,
        created_at,
        started_at,
        completed_at,
    ) = row;
    let state = RunState::from_str(&state)
        .ok_or_else(|| decode_err("run state", format!("unknown state '{state}'")))?;
    let summary = summary
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| decode_err("run summary", e))?;
    Ok(AnalysisRun {
        id,
        batch_id,
        strategy_id,
        state,
        total_transactions: total as u64,
        processed_transactions: processed as u64,
        error_message,
        summary,
        created_at,
        started_at,
        completed_at,
    })
}

async fn insert_scores(
    conn: &mut sqlx::PgConnection,
    run_id: Uuid,
    scores: &[ScoreRow],
) -> sqlx::Result<()> {
    for chunk in scores.chunks(1000) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO anomaly_scores (run_id, transaction_id, algorithm, score, confidence, \
             metadata) ",
        );
        query_builder.push_values(chunk, |mut b, s| {
            b.push_bind(run_id)
                .push_bind(&s.transaction_id)
                .push_bind(&s.algorithm)
                .push_bind(s.score)
                .push_bind(s.confidence)
                .push_bind(&s.metadata);
        });
        query_builder.push(" ON CONFLICT (run_id, transaction_id, algorithm) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_flags(
    conn: &mut sqlx::PgConnection,
    run_id: Uuid,
    flags: &[FlagRow],
) -> sqlx::Result<()> {
    for chunk in flags.chunks(1000) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO rule_flags (run_id, transaction_id, rule, triggered, flag_value) ",
        );
        query_builder.push_values(chunk, |mut b, f| {
            b.push_bind(run_id)
                .push_bind(&f.transaction_id)
                .push_bind(&f.rule)
                .push_bind(f.triggered)
                .push_bind(&f.flag_value);
        });
        query_builder.push(" ON CONFLICT (run_id, transaction_id, rule) DO NOTHING");
        query_builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Guarded update: the row is only written while its state column still
/// matches one of `expected`, so concurrent writers cannot move a run
/// backwards. Returns the number of rows written (0 or 1).
async fn update_run(
    executor: impl sqlx::PgExecutor<'_>,
    run: &AnalysisRun,
    expected: &[RunState],
) -> sqlx::Result<u64> {
    let summary = run
        .summary
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .unwrap_or(None);
    let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();

    let result = sqlx::query(
        "UPDATE analysis_runs
         SET state = $2, total_transactions = $3, processed_transactions = $4,
             error_message = $5, summary = $6, started_at = $7, completed_at = $8
         WHERE id = $1 AND state = ANY($9)",
    )
    .bind(run.id)
    .bind(run.state.as_str())
    .bind(run.total_transactions as i64)
    .bind(run.processed_transactions as i64)
    .bind(&run.error_message)
    .bind(summary)
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(expected)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Distinguish a lost guard from a missing row after a zero-row update.
async fn run_exists(executor: impl sqlx::PgExecutor<'_>, id: Uuid) -> sqlx::Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM analysis_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row.is_some())
}

#[async_trait]
impl ResultStore for PgStore {
    async fn save_batch(&self, batch: &RawBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query("INSERT INTO batches (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(batch.id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        for (offset, chunk) in batch.transactions.chunks(1000).enumerate() {
            let base = (offset * 1000) as i64;
            let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
                "INSERT INTO transactions (batch_id, row_index, external_id, account_id, amount, \
                 currency, occurred_at, payload) ",
            );
            query_builder.push_values(chunk.iter().enumerate(), |mut b, (i, t)| {
                b.push_bind(batch.id)
                    .push_bind(base + i as i64)
                    .push_bind(&t.external_id)
                    .push_bind(&t.account_id)
                    .push_bind(t.amount)
                    .push_bind(&t.currency)
                    .push_bind(t.occurred_at)
                    .push_bind(&t.payload);
            });
            query_builder.push(" ON CONFLICT (batch_id, row_index) DO NOTHING");
            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<RawBatch, StoreError> {
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM batches WHERE id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("batch {batch_id}")));
        }

        let rows: Vec<(
            Option<String>,
            Option<String>,
            Option<f64>,
            Option<String>,
            Option<DateTime<Utc>>,
            JsonValue,
        )> = sqlx::query_as(
            "SELECT external_id, account_id, amount, currency, occurred_at, payload
             FROM transactions WHERE batch_id = $1 ORDER BY row_index",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let transactions = rows
            .into_iter()
            .map(
                |(external_id, account_id, amount, currency, occurred_at, payload)| {
                    RawTransaction {
                        external_id,
                        account_id,
                        amount,
                        currency,
                        occurred_at,
                        payload,
                    }
                },
            )
            .collect();

        Ok(RawBatch {
            id: batch_id,
            transactions,
        })
    }

    async fn save_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let algorithms = serde_json::to_value(&strategy.algorithms)
            .map_err(|e| StoreError::Permanent(e.to_string()))?;

        sqlx::query(
            "INSERT INTO strategies (id, name, version, policy, algorithms, active, \
             anomaly_threshold)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE
             SET name = $2, version = $3, policy = $4, algorithms = $5, active = $6,
                 anomaly_threshold = $7, updated_at = NOW()",
        )
        .bind(strategy.id)
        .bind(&strategy.name)
        .bind(strategy.version as i32)
        .bind(strategy.policy.as_str())
        .bind(algorithms)
        .bind(strategy.active)
        .bind(strategy.anomaly_threshold)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn get_strategy(&self, id: Uuid) -> Result<Strategy, StoreError> {
        let row: Option<StrategyRow> = sqlx::query_as(
            "SELECT id, name, version, policy, algorithms, active, anomaly_threshold
             FROM strategies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => strategy_from_row(row),
            None => Err(StoreError::NotFound(format!("strategy {id}"))),
        }
    }

    async fn list_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        let rows: Vec<StrategyRow> = sqlx::query_as(
            "SELECT id, name, version, policy, algorithms, active, anomaly_threshold
             FROM strategies ORDER BY name, version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter().map(strategy_from_row).collect()
    }

    async fn save_run(&self, run: &AnalysisRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO analysis_runs (id, batch_id, strategy_id, state, total_transactions, \
             processed_transactions, error_message, summary, created_at, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(run.id)
        .bind(run.batch_id)
        .bind(run.strategy_id)
        .bind(run.state.as_str())
        .bind(run.total_transactions as i64)
        .bind(run.processed_transactions as i64)
        .bind(&run.error_message)
        .bind(
            run.summary
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .unwrap_or(None),
        )
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn transition_run(
        &self,
        run: &AnalysisRun,
        expected: &[RunState],
    ) -> Result<bool, StoreError> {
        let affected = update_run(&self.pool, run, expected)
            .await
            .map_err(store_err)?;
        if affected > 0 {
            return Ok(true);
        }
        if run_exists(&self.pool, run.id).await.map_err(store_err)? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(format!("run {}", run.id)))
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<AnalysisRun, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, batch_id, strategy_id, state, total_transactions, \
             processed_transactions, error_message, summary, created_at, started_at, completed_at
             FROM analysis_runs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => run_from_row(row),
            None => Err(StoreError::NotFound(format!("run {id}"))),
        }
    }

    async fn save_scores(&self, run_id: Uuid, scores: &[ScoreRow]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        insert_scores(&mut conn, run_id, scores)
            .await
            .map_err(store_err)
    }

    async fn save_flags(&self, run_id: Uuid, flags: &[FlagRow]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        insert_flags(&mut conn, run_id, flags)
            .await
            .map_err(store_err)
    }

    async fn commit_results(
        &self,
        run: &AnalysisRun,
        scores: &[ScoreRow],
        flags: &[FlagRow],
    ) -> Result<bool, StoreError> {
        // Scores, flags, and the terminal state transition land in one
        // transaction: a partially persisted run is never observable. The
        // state guard keeps a racing cancellation from being overwritten;
        // when it loses, nothing is written at all.
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let affected = update_run(&mut *tx, run, &[RunState::Running])
            .await
            .map_err(store_err)?;
        if affected == 0 {
            return if run_exists(&mut *tx, run.id).await.map_err(store_err)? {
                Ok(false)
            } else {
                Err(StoreError::NotFound(format!("run {}", run.id)))
            };
        }

        insert_scores(&mut *tx, run.id, scores)
            .await
            .map_err(store_err)?;
        insert_flags(&mut *tx, run.id, flags)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(true)
    }

    async fn load_results(
        &self,
        run_id: Uuid,
    ) -> Result<(Vec<ScoreRow>, Vec<FlagRow>), StoreError> {
        let score_rows: Vec<(String, String, f64, Option<f64>, JsonValue)> = sqlx::query_as(
            "SELECT transaction_id, algorithm, score, confidence, metadata
             FROM anomaly_scores WHERE run_id = $1 ORDER BY algorithm, transaction_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let flag_rows: Vec<(String, String, bool, Option<String>)> = sqlx::query_as(
            "SELECT transaction_id, rule, triggered, flag_value
             FROM rule_flags WHERE run_id = $1 ORDER BY rule, transaction_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let scores = score_rows
            .into_iter()
            .map(
                |(transaction_id, algorithm, score, confidence, metadata)| ScoreRow {
                    transaction_id,
                    algorithm,
                    score,
                    confidence,
                    metadata,
                },
            )
            .collect();
        let flags = flag_rows
            .into_iter()
            .map(|(transaction_id, rule, triggered, flag_value)| FlagRow {
                transaction_id,
                rule,
                triggered,
                flag_value,
            })
            .collect();

        Ok((scores, flags))
    }
}
