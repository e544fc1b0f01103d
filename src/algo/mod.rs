pub mod correlation;
pub mod isolation_forest;
pub mod registry;
pub mod timeseries;
pub mod weekend;
pub mod zscore;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::batch::{Transaction, TransformedBatch};
use crate::error::{ConfigurationError, DetectionError};

/// Reserved algorithm identifier for the per-transaction aggregate score
/// produced by a strategy's combination policy.
pub const COMBINED_ALGORITHM: &str = "combined";

/// How an algorithm's results are interpreted by the combination policy.
/// Rule-based algorithms contribute rule flags as well as a derived score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Statistical,
    RuleBased,
    MlBased,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Statistical => "statistical",
            Self::RuleBased => "rule_based",
            Self::MlBased => "ml_based",
        }
    }
}

/// One algorithm's verdict on one transaction. `score` is in [0.0, 1.0],
/// 1.0 meaning maximally anomalous.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionScore {
    pub transaction_id: String,
    pub score: f64,
    pub confidence: Option<f64>,
    pub metadata: JsonValue,
}

/// Discrete triggered/not-triggered outcome from a rule-based algorithm,
/// kept alongside the derived score for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFlag {
    pub transaction_id: String,
    pub rule: String,
    pub triggered: bool,
    pub flag_value: Option<String>,
}

/// Everything one algorithm produces for a batch: one score per
/// transaction, plus rule flags for rule-based algorithms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub scores: Vec<TransactionScore>,
    pub flags: Vec<RuleFlag>,
}

/// A single detector. `detect` must be a pure function of its inputs:
/// identical batch and config produce identical output, so runs can be
/// reproduced deterministically. Implementations hold no mutable
/// cross-call state; the registry hands out a fresh instance per use.
pub trait Algorithm: Send + Sync {
    /// Stable identifier used in persistence and strategy configuration.
    fn name(&self) -> &'static str;

    fn category(&self) -> Category;

    /// Reject missing, mistyped, or out-of-range parameters, naming the
    /// offending field.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ConfigurationError>;

    /// Score every transaction in the batch. Degenerate numeric conditions
    /// (e.g. a zero-variance group) score 0.0 rather than erroring; a
    /// `DetectionError` means the input is numerically unusable as a whole.
    fn detect(&self, batch: &TransformedBatch, config: &JsonValue)
        -> Result<Detection, DetectionError>;
}

/// Numeric feature of an enriched transaction addressable by name from
/// algorithm configuration. Multi-feature algorithms (correlation,
/// isolation forest) build their matrices from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Feature {
    Amount,
    Magnitude,
    HourOfDay,
    DayOfWeek,
    HoursSincePrev,
}

impl Feature {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "amount" => Some(Self::Amount),
            "magnitude" => Some(Self::Magnitude),
            "hour_of_day" => Some(Self::HourOfDay),
            "day_of_week" => Some(Self::DayOfWeek),
            "hours_since_prev" => Some(Self::HoursSincePrev),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Magnitude => "magnitude",
            Self::HourOfDay => "hour_of_day",
            Self::DayOfWeek => "day_of_week",
            Self::HoursSincePrev => "hours_since_prev",
        }
    }

    pub(crate) fn value(&self, tx: &Transaction) -> f64 {
        match self {
            Self::Amount => tx.amount,
            Self::Magnitude => tx.magnitude,
            Self::HourOfDay => tx.hour_of_day as f64,
            Self::DayOfWeek => tx.day_of_week.num_days_from_monday() as f64,
            Self::HoursSincePrev => tx.hours_since_prev.unwrap_or(0.0),
        }
    }
}

/// Parse a `features` config array into feature selectors, with a default.
pub(crate) fn param_features(
    algorithm: &str,
    config: &JsonValue,
    default: &[Feature],
) -> Result<Vec<Feature>, ConfigurationError> {
    match config.get("features") {
        None => Ok(default.to_vec()),
        Some(JsonValue::Array(names)) => names
            .iter()
            .map(|name| {
                name.as_str().and_then(Feature::parse).ok_or_else(|| {
                    ConfigurationError::new(
                        algorithm,
                        "features",
                        format!("unrecognized feature '{name}'"),
                    )
                })
            })
            .collect(),
        Some(_) => Err(ConfigurationError::new(
            algorithm,
            "features",
            "expected an array of feature names",
        )),
    }
}

/// Read an f64 parameter with a default, rejecting wrong types.
pub(crate) fn param_f64(
    algorithm: &str,
    config: &JsonValue,
    field: &'static str,
    default: f64,
) -> Result<f64, ConfigurationError> {
    match config.get(field) {
        None => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| {
            ConfigurationError::new(algorithm, field, "expected a number")
        }),
    }
}

/// Read a u64 parameter with a default, rejecting wrong types.
pub(crate) fn param_u64(
    algorithm: &str,
    config: &JsonValue,
    field: &'static str,
    default: u64,
) -> Result<u64, ConfigurationError> {
    match config.get(field) {
        None => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            ConfigurationError::new(algorithm, field, "expected a non-negative integer")
        }),
    }
}

/// Read a bool parameter with a default, rejecting wrong types.
pub(crate) fn param_bool(
    algorithm: &str,
    config: &JsonValue,
    field: &'static str,
    default: bool,
) -> Result<bool, ConfigurationError> {
    match config.get(field) {
        None => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| ConfigurationError::new(algorithm, field, "expected a boolean")),
    }
}

/// Read a string parameter constrained to an allowed set, with a default.
pub(crate) fn param_choice(
    algorithm: &str,
    config: &JsonValue,
    field: &'static str,
    allowed: &[&'static str],
    default: &'static str,
) -> Result<&'static str, ConfigurationError> {
    match config.get(field) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            Some(s) => allowed
                .iter()
                .copied()
                .find(|candidate| *candidate == s)
                .ok_or_else(|| {
                    ConfigurationError::new(
                        algorithm,
                        field,
                        format!("expected one of {}", allowed.join(", ")),
                    )
                }),
            None => Err(ConfigurationError::new(algorithm, field, "expected a string")),
        },
    }
}
