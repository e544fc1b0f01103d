use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::algo::{param_bool, param_f64, param_u64, Algorithm, Category, Detection, TransactionScore};
use crate::batch::{Transaction, TransformedBatch};
use crate::error::{ConfigurationError, DetectionError};

const DEFAULT_THRESHOLD: f64 = 3.0;
const DEFAULT_MIN_SAMPLES: u64 = 5;
const DEFAULT_GROUP_BY: &str = "account_id";
const DEFAULT_FIELD: &str = "magnitude";

/// Statistical detector scoring each transaction by how far its amount sits
/// from its group, as a z-score clipped into [0, 1] at a configurable
/// saturation threshold. By default the group mean and sample standard
/// deviation include the transaction itself; setting `leave_one_out`
/// scores each transaction against the rest of its group instead, so a
/// lone outlier cannot mask itself by inflating the statistics.
///
/// Groups with fewer than `min_samples` transactions score 0.0 across the
/// board (insufficient evidence) so the output stays complete. A group
/// with zero variance scores 0.0; under leave-one-out, a transaction
/// deviating from an otherwise constant group saturates to 1.0.
pub struct ZScore;

impl ZScore {
    pub const NAME: &'static str = "zscore";
}

struct ZScoreConfig {
    threshold: f64,
    min_samples: u64,
    group_by: GroupBy,
    field: Field,
    leave_one_out: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum GroupBy {
    AccountId,
    None,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Magnitude,
    Amount,
}

impl Field {
    fn value(&self, tx: &Transaction) -> f64 {
        match self {
            Self::Magnitude => tx.magnitude,
            Self::Amount => tx.amount,
        }
    }
}

fn parse_config(config: &JsonValue) -> Result<ZScoreConfig, ConfigurationError> {
    let threshold = param_f64(ZScore::NAME, config, "threshold", DEFAULT_THRESHOLD)?;
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(ConfigurationError::new(
            ZScore::NAME,
            "threshold",
            "must be positive",
        ));
    }

    let min_samples = param_u64(ZScore::NAME, config, "min_samples", DEFAULT_MIN_SAMPLES)?;
    if min_samples < 1 {
        return Err(ConfigurationError::new(
            ZScore::NAME,
            "min_samples",
            "must be at least 1",
        ));
    }

    let group_by = match config.get("group_by") {
        None => GroupBy::AccountId,
        Some(v) => match v.as_str() {
            Some(s) if s == DEFAULT_GROUP_BY => GroupBy::AccountId,
            Some("none") => GroupBy::None,
            _ => {
                return Err(ConfigurationError::new(
                    ZScore::NAME,
                    "group_by",
                    "expected 'account_id' or 'none'",
                ))
            }
        },
    };

    let field = match config.get("field") {
        None => Field::Magnitude,
        Some(v) => match v.as_str() {
            Some(s) if s == DEFAULT_FIELD => Field::Magnitude,
            Some("amount") => Field::Amount,
            _ => {
                return Err(ConfigurationError::new(
                    ZScore::NAME,
                    "field",
                    "expected 'magnitude' or 'amount'",
                ))
            }
        },
    };

    let leave_one_out = param_bool(ZScore::NAME, config, "leave_one_out", false)?;

    Ok(ZScoreConfig {
        threshold,
        min_samples,
        group_by,
        field,
        leave_one_out,
    })
}

impl Algorithm for ZScore {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::Statistical
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ConfigurationError> {
        parse_config(config).map(|_| ())
    }

    fn detect(
        &self,
        batch: &TransformedBatch,
        config: &JsonValue,
    ) -> Result<Detection, DetectionError> {
        let cfg = parse_config(config).map_err(|e| DetectionError {
            algorithm: Self::NAME.to_string(),
            message: e.to_string(),
        })?;

        let mut groups: HashMap<&str, Vec<&Transaction>> = HashMap::new();
        for tx in &batch.transactions {
            let key = match cfg.group_by {
                GroupBy::AccountId => tx.account_id.as_str(),
                GroupBy::None => "",
            };
            groups.entry(key).or_default().push(tx);
        }

        let mut scores = Vec::with_capacity(batch.transactions.len());
        for (key, members) in groups {
            score_group(&cfg, key, &members, &mut scores);
        }

        // Group iteration order is not stable; sort so identical inputs
        // yield identical output.
        scores.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        Ok(Detection {
            scores,
            flags: Vec::new(),
        })
    }
}

fn score_group(
    cfg: &ZScoreConfig,
    key: &str,
    members: &[&Transaction],
    out: &mut Vec<TransactionScore>,
) {
    let n = members.len();

    if (n as u64) < cfg.min_samples || n < 2 {
        for tx in members {
            out.push(TransactionScore {
                transaction_id: tx.id.clone(),
                score: 0.0,
                confidence: Some(0.0),
                metadata: serde_json::json!({
                    "group": key,
                    "samples": n,
                    "reason": "insufficient_samples",
                }),
            });
        }
        return;
    }

    let values: Vec<f64> = members.iter().map(|tx| cfg.field.value(tx)).collect();
    let sum: f64 = values.iter().sum();
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();

    // Group-wide sample statistics, shared by every member in the default
    // include-self mode.
    let group_mean = sum / n as f64;
    let group_stddev =
        (((sum_sq - n as f64 * group_mean * group_mean) / (n as f64 - 1.0)).max(0.0)).sqrt();

    for (tx, &x) in members.iter().zip(&values) {
        let (mean, stddev) = if cfg.leave_one_out {
            // Scored against the rest of the group.
            let rest = (n - 1) as f64;
            let mean = (sum - x) / rest;
            let variance = if n >= 3 {
                ((sum_sq - x * x - rest * mean * mean) / (rest - 1.0)).max(0.0)
            } else {
                0.0
            };
            (mean, variance.sqrt())
        } else {
            (group_mean, group_stddev)
        };

        let (score, confidence, zscore) = if stddev <= 1e-12 {
            if (x - mean).abs() <= 1e-9 * mean.abs().max(1.0) {
                (0.0, 0.0, 0.0)
            } else {
                // Deviation from a constant group: saturate.
                (1.0, 1.0, f64::INFINITY)
            }
        } else {
            let z = (x - mean).abs() / stddev;
            let score = (z / cfg.threshold).min(1.0);
            (score, score, z)
        };

        let z_meta = if zscore.is_finite() {
            JsonValue::from(zscore)
        } else {
            JsonValue::Null
        };
        out.push(TransactionScore {
            transaction_id: tx.id.clone(),
            score,
            confidence: Some(confidence),
            metadata: serde_json::json!({
                "group": key,
                "samples": n,
                "mean": mean,
                "stddev": stddev,
                "zscore": z_meta,
            }),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn test_batch(amounts: &[f64]) -> TransformedBatch {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let transactions = amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| {
                let occurred_at = base + Duration::hours(i as i64);
                crate::batch::Transaction {
                    id: format!("row-{:06}", i),
                    account_id: "acct-1".to_string(),
                    amount,
                    magnitude: amount.abs(),
                    currency: None,
                    occurred_at,
                    day_of_week: chrono::Datelike::weekday(&occurred_at),
                    hour_of_day: 9,
                    is_weekend: false,
                    account_sequence: (i + 1) as u32,
                    hours_since_prev: (i > 0).then_some(1.0),
                    payload: JsonValue::Null,
                }
            })
            .collect();
        TransformedBatch {
            batch_id: Uuid::nil(),
            transactions,
            excluded: Vec::new(),
        }
    }

    fn config(threshold: f64, min_samples: u64) -> JsonValue {
        serde_json::json!({ "threshold": threshold, "min_samples": min_samples })
    }

    #[test]
    fn test_zero_variance_group_scores_zero() {
        let batch = test_batch(&[10.0, 10.0, 10.0, 10.0]);
        let detection = ZScore.detect(&batch, &config(3.0, 2)).unwrap();
        assert_eq!(detection.scores.len(), 4);
        for score in &detection.scores {
            assert_eq!(score.score, 0.0);
        }
    }

    #[test]
    fn test_outlier_scored_against_include_self_statistics() {
        // [10, 10, 100]: mean 40, sample stddev sqrt(2700); the outlier's
        // z-score is 2/sqrt(3) and the score z/threshold at threshold 3.
        let batch = test_batch(&[10.0, 10.0, 100.0]);
        let detection = ZScore.detect(&batch, &config(3.0, 2)).unwrap();

        let outlier = detection
            .scores
            .iter()
            .find(|s| s.transaction_id == "row-000002")
            .unwrap();
        let expected = (2.0 / 3.0_f64.sqrt()) / 3.0;
        assert!((outlier.score - expected).abs() < 1e-12, "got {}", outlier.score);

        // [10, 10, 10, 100]: z = 1.5, score 0.5.
        let batch = test_batch(&[10.0, 10.0, 10.0, 100.0]);
        let detection = ZScore.detect(&batch, &config(3.0, 2)).unwrap();
        let outlier = detection
            .scores
            .iter()
            .find(|s| s.transaction_id == "row-000003")
            .unwrap();
        assert!((outlier.score - 0.5).abs() < 1e-12, "got {}", outlier.score);
    }

    #[test]
    fn test_leave_one_out_outlier_saturates_and_rest_stay_low() {
        let batch = test_batch(&[10.0, 10.0, 10.0, 100.0]);
        let cfg = serde_json::json!({
            "threshold": 3.0,
            "min_samples": 2,
            "leave_one_out": true,
        });
        let detection = ZScore.detect(&batch, &cfg).unwrap();

        // Scored against a constant remainder, the outlier saturates.
        let outlier = detection
            .scores
            .iter()
            .find(|s| s.transaction_id == "row-000003")
            .unwrap();
        assert_eq!(outlier.score, 1.0);

        for score in detection.scores.iter().filter(|s| s.transaction_id != "row-000003") {
            assert!(score.score < 0.25, "expected near-zero, got {}", score.score);
        }
    }

    #[test]
    fn test_small_group_scores_zero_for_insufficient_evidence() {
        let batch = test_batch(&[10.0, 500.0, 20.0]);
        let detection = ZScore.detect(&batch, &config(3.0, 5)).unwrap();
        assert_eq!(detection.scores.len(), 3);
        for score in &detection.scores {
            assert_eq!(score.score, 0.0);
            assert_eq!(score.metadata["reason"], "insufficient_samples");
        }
    }

    #[test]
    fn test_detect_is_deterministic() {
        let batch = test_batch(&[12.0, 85.0, 33.0, 7.0, 41.0, 260.0]);
        let cfg = config(3.0, 2);
        let first = ZScore.detect(&batch, &cfg).unwrap();
        let second = ZScore.detect(&batch, &cfg).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scores_stay_in_unit_range() {
        let batch = test_batch(&[1.0, -2.0, 300.0, 4.5, 0.0, 99999.0, -12345.0]);
        let detection = ZScore.detect(&batch, &config(1.5, 2)).unwrap();
        for score in &detection.scores {
            assert!((0.0..=1.0).contains(&score.score));
        }
    }

    #[test]
    fn test_validation_names_offending_field() {
        let err = ZScore
            .validate_config(&serde_json::json!({ "threshold": -1.0 }))
            .unwrap_err();
        assert_eq!(err.field, "threshold");

        let err = ZScore
            .validate_config(&serde_json::json!({ "min_samples": 0 }))
            .unwrap_err();
        assert_eq!(err.field, "min_samples");

        let err = ZScore
            .validate_config(&serde_json::json!({ "group_by": "merchant" }))
            .unwrap_err();
        assert_eq!(err.field, "group_by");

        let err = ZScore
            .validate_config(&serde_json::json!({ "threshold": "three" }))
            .unwrap_err();
        assert_eq!(err.field, "threshold");
        assert!(err.message.contains("number"));

        let err = ZScore
            .validate_config(&serde_json::json!({ "leave_one_out": "yes" }))
            .unwrap_err();
        assert_eq!(err.field, "leave_one_out");
    }

    #[test]
    fn test_defaults_are_valid() {
        ZScore.validate_config(&serde_json::json!({})).unwrap();
    }
}
