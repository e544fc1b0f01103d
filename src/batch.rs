use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A transaction as handed over by the upload subsystem, before any
/// cleaning. Fields the source file did not carry are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: JsonValue,
}

/// One uploaded batch, kept unmodified for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBatch {
    pub id: Uuid,
    pub transactions: Vec<RawTransaction>,
}

/// Enriched transaction every algorithm consumes. Immutable once the
/// transformer has produced it; downstream only annotates it with scores.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    /// Signed amount, canonical numeric form.
    pub amount: f64,
    /// Currency-free magnitude, the cross-algorithm scoring surface.
    pub magnitude: f64,
    pub currency: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub day_of_week: Weekday,
    pub hour_of_day: u8,
    pub is_weekend: bool,
    /// 1-based position within the account's transactions, ordered by
    /// timestamp. Seeds rolling statistics in time-series algorithms.
    pub account_sequence: u32,
    /// Hours since the account's previous transaction; `None` for the
    /// account's first transaction in the batch.
    pub hours_since_prev: Option<f64>,
    pub payload: JsonValue,
}

/// A transaction the transformer could not make scorable. Reported on the
/// run summary, never silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedTransaction {
    pub id: String,
    pub reason: String,
}

/// Output of the transformer: the enriched batch all algorithms run over.
#[derive(Debug, Clone)]
pub struct TransformedBatch {
    pub batch_id: Uuid,
    pub transactions: Vec<Transaction>,
    pub excluded: Vec<ExcludedTransaction>,
}

impl TransformedBatch {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
