pub mod orchestrator;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::batch::ExcludedTransaction;

/// Lifecycle of an analysis run. `Completed`, `Failed` and `Cancelled`
/// are terminal and immutable; work only proceeds from `Pending` and
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "cancelling" => Some(Self::Cancelling),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Execution summary persisted on a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub transactions_processed: u64,
    pub algorithms_executed: u32,
    pub anomalies_detected: u64,
    pub excluded_transactions: Vec<ExcludedTransaction>,
    pub duration_ms: u64,
}

/// One execution of a strategy against a batch. State transitions are the
/// only mutations; a corrected run is always a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub strategy_id: Uuid,
    pub state: RunState,
    pub total_transactions: u64,
    pub processed_transactions: u64,
    pub error_message: Option<String>,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisRun {
    pub fn new(batch_id: Uuid, strategy_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            strategy_id,
            state: RunState::Pending,
            total_transactions: 0,
            processed_transactions: 0,
            error_message: None,
            summary: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Persisted shape of one anomaly score row, keyed by
/// (run, transaction, algorithm). The aggregate row carries the reserved
/// `combined` algorithm identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub transaction_id: String,
    pub algorithm: String,
    pub score: f64,
    pub confidence: Option<f64>,
    pub metadata: JsonValue,
}

/// Persisted shape of one rule flag row, keyed by (run, transaction, rule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRow {
    pub transaction_id: String,
    pub rule: String,
    pub triggered: bool,
    pub flag_value: Option<String>,
}

/// Full result set for a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub run_id: Uuid,
    pub aggregates: Vec<ScoreRow>,
    pub algorithm_scores: Vec<ScoreRow>,
    pub flags: Vec<FlagRow>,
}
