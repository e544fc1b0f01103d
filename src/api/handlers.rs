use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use uuid::Uuid;

use super::types::*;
use super::AppState;
use crate::batch::RawBatch;
use crate::error::{RunError, StoreError};
use crate::run::{FlagRow, ScoreRow};
use crate::strategy::{validate_strategy, Strategy};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse { error: msg.into() }),
    )
}

fn store_error(e: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Permanent(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

fn run_error(e: RunError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        RunError::RunNotFound(_)
        | RunError::BatchNotFound(_)
        | RunError::StrategyNotFound(_) => StatusCode::NOT_FOUND,
        RunError::NotReady(_) | RunError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        RunError::InvalidStrategy(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RunError::Store(e) => {
            if e.is_transient() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    };
    api_error(status, e.to_string())
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        algorithms: state.registry.names().into_iter().map(String::from).collect(),
    }))
}

// ============================================================
// Batches
// ============================================================

pub async fn create_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBatchRequest>,
) -> ApiResult<CreateBatchResponse> {
    if req.transactions.is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "batch contains no transactions",
        ));
    }

    let batch = RawBatch {
        id: Uuid::new_v4(),
        transactions: req.transactions,
    };
    state.store.save_batch(&batch).await.map_err(store_error)?;

    Ok(Json(CreateBatchResponse {
        batch_id: batch.id,
        transactions: batch.transactions.len(),
    }))
}

// ============================================================
// Strategies
// ============================================================

pub async fn create_strategy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateStrategyRequest>,
) -> ApiResult<Strategy> {
    let strategy = Strategy {
        id: Uuid::new_v4(),
        name: req.name,
        version: req.version.unwrap_or(1),
        algorithms: req.algorithms,
        policy: req.policy,
        active: req.active.unwrap_or(true),
        anomaly_threshold: req.anomaly_threshold.unwrap_or(0.7),
    };

    validate_strategy(&strategy, &state.registry)
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    state
        .store
        .save_strategy(&strategy)
        .await
        .map_err(store_error)?;

    Ok(Json(strategy))
}

pub async fn list_strategies(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Strategy>> {
    state
        .store
        .list_strategies()
        .await
        .map(Json)
        .map_err(store_error)
}

pub async fn get_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Strategy> {
    state.store.get_strategy(id).await.map(Json).map_err(store_error)
}

// ============================================================
// Runs
// ============================================================

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), (StatusCode, Json<ErrorResponse>)> {
    let run_id = state
        .orchestrator
        .create_run(req.batch_id, req.strategy_id)
        .await
        .map_err(run_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            run_id,
            state: "pending".to_string(),
        }),
    ))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<RunStatusResponse> {
    state
        .orchestrator
        .get_run_status(id)
        .await
        .map(|run| Json(run.into()))
        .map_err(run_error)
}

pub async fn get_run_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<RunResultsResponse> {
    let results = state
        .orchestrator
        .get_run_results(id)
        .await
        .map_err(run_error)?;

    Ok(Json(RunResultsResponse {
        run_id: results.run_id,
        aggregates: results.aggregates.into_iter().map(score_entry).collect(),
        algorithm_scores: results
            .algorithm_scores
            .into_iter()
            .map(score_entry)
            .collect(),
        flags: results.flags.into_iter().map(flag_entry).collect(),
    }))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<CreateRunResponse> {
    state.orchestrator.cancel_run(id).await.map_err(run_error)?;
    let run = state
        .orchestrator
        .get_run_status(id)
        .await
        .map_err(run_error)?;

    Ok(Json(CreateRunResponse {
        run_id: id,
        state: run.state.as_str().to_string(),
    }))
}

fn score_entry(row: ScoreRow) -> ScoreEntry {
    ScoreEntry {
        transaction_id: row.transaction_id,
        algorithm: row.algorithm,
        score: row.score,
        confidence: row.confidence,
        metadata: row.metadata,
    }
}

fn flag_entry(row: FlagRow) -> FlagEntry {
    FlagEntry {
        transaction_id: row.transaction_id,
        rule: row.rule,
        triggered: row.triggered,
        flag_value: row.flag_value,
    }
}
