use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::batch::RawTransaction;
use crate::run::{AnalysisRun, RunSummary};
use crate::strategy::{AlgorithmSpec, CombinationPolicy};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub algorithms: Vec<String>,
}

// ============================================================
// Batches
// ============================================================

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Serialize)]
pub struct CreateBatchResponse {
    pub batch_id: Uuid,
    pub transactions: usize,
}

// ============================================================
// Strategies
// ============================================================

#[derive(Debug, Deserialize)]
pub struct CreateStrategyRequest {
    pub name: String,
    #[serde(default)]
    pub version: Option<u32>,
    pub algorithms: Vec<AlgorithmSpec>,
    pub policy: CombinationPolicy,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub anomaly_threshold: Option<f64>,
}

// ============================================================
// Runs
// ============================================================

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub batch_id: Uuid,
    pub strategy_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: Uuid,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub strategy_id: Uuid,
    pub state: String,
    pub total_transactions: u64,
    pub processed_transactions: u64,
    pub error_message: Option<String>,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<AnalysisRun> for RunStatusResponse {
    fn from(run: AnalysisRun) -> Self {
        Self {
            id: run.id,
            batch_id: run.batch_id,
            strategy_id: run.strategy_id,
            state: run.state.as_str().to_string(),
            total_transactions: run.total_transactions,
            processed_transactions: run.processed_transactions,
            error_message: run.error_message,
            summary: run.summary,
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunResultsResponse {
    pub run_id: Uuid,
    pub aggregates: Vec<ScoreEntry>,
    pub algorithm_scores: Vec<ScoreEntry>,
    pub flags: Vec<FlagEntry>,
}

#[derive(Debug, Serialize)]
pub struct ScoreEntry {
    pub transaction_id: String,
    pub algorithm: String,
    pub score: f64,
    pub confidence: Option<f64>,
    pub metadata: JsonValue,
}

#[derive(Debug, Serialize)]
pub struct FlagEntry {
    pub transaction_id: String,
    pub rule: String,
    pub triggered: bool,
    pub flag_value: Option<String>,
}
