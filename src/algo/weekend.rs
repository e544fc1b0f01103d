use chrono::Weekday;
use serde_json::Value as JsonValue;

use crate::algo::{param_f64, Algorithm, Category, Detection, RuleFlag, TransactionScore};
use crate::batch::TransformedBatch;
use crate::error::{ConfigurationError, DetectionError};

const DEFAULT_AMOUNT_THRESHOLD: f64 = 1000.0;

/// Rule-based detector: flags a transaction whose timestamp falls on one of
/// the configured weekdays AND whose magnitude exceeds the configured
/// threshold. Emits a rule flag for audit plus a derived score (1.0 when
/// triggered, 0.0 otherwise) so rule outcomes share the scoring surface
/// used for combination.
pub struct WeekendThreshold;

impl WeekendThreshold {
    pub const NAME: &'static str = "weekend_threshold";
}

struct WeekendConfig {
    weekdays: Vec<Weekday>,
    amount_threshold: f64,
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name.to_ascii_lowercase().as_str() {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_config(config: &JsonValue) -> Result<WeekendConfig, ConfigurationError> {
    let weekdays = match config.get("weekdays") {
        None => vec![Weekday::Sat, Weekday::Sun],
        Some(JsonValue::Array(names)) => {
            if names.is_empty() {
                return Err(ConfigurationError::new(
                    WeekendThreshold::NAME,
                    "weekdays",
                    "must not be empty",
                ));
            }
            let mut days = Vec::with_capacity(names.len());
            for name in names {
                let day = name.as_str().and_then(parse_weekday).ok_or_else(|| {
                    ConfigurationError::new(
                        WeekendThreshold::NAME,
                        "weekdays",
                        format!("unrecognized weekday '{}'", name),
                    )
                })?;
                days.push(day);
            }
            days
        }
        Some(_) => {
            return Err(ConfigurationError::new(
                WeekendThreshold::NAME,
                "weekdays",
                "expected an array of weekday names",
            ))
        }
    };

    let amount_threshold = param_f64(
        WeekendThreshold::NAME,
        config,
        "amount_threshold",
        DEFAULT_AMOUNT_THRESHOLD,
    )?;
    if !amount_threshold.is_finite() || amount_threshold < 0.0 {
        return Err(ConfigurationError::new(
            WeekendThreshold::NAME,
            "amount_threshold",
            "must be a non-negative number",
        ));
    }

    Ok(WeekendConfig {
        weekdays,
        amount_threshold,
    })
}

impl Algorithm for WeekendThreshold {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::RuleBased
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

        let mut scores = Vec::with_capacity(batch.transactions.len());
        let mut flags = Vec::with_capacity(batch.transactions.len());

        for tx in &batch.transactions {
            let day_matches = cfg.weekdays.contains(&tx.day_of_week);
            let triggered = day_matches && tx.magnitude > cfg.amount_threshold;

            flags.push(RuleFlag {
                transaction_id: tx.id.clone(),
                rule: Self::NAME.to_string(),
                triggered,
                flag_value: triggered.then(|| {
                    format!(
                        "amount {:.2} exceeds {:.2} on {}",
                        tx.magnitude, cfg.amount_threshold, tx.day_of_week
                    )
                }),
            });

            scores.push(TransactionScore {
                transaction_id: tx.id.clone(),
                score: if triggered { 1.0 } else { 0.0 },
                confidence: Some(1.0),
                metadata: serde_json::json!({
                    "day_of_week": tx.day_of_week.to_string(),
                    "amount": tx.magnitude,
                    "threshold": cfg.amount_threshold,
                    "day_matched": day_matches,
                }),
            });
        }

        Ok(Detection { scores, flags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn batch_with(rows: &[(&str, i64, f64)]) -> TransformedBatch {
        // (id, day offset from Monday 2024-03-04, amount)
        let transactions = rows
            .iter()
            .enumerate()
            .map(|(index, (id, day_offset, amount))| {
                let occurred_at = Utc
                    .with_ymd_and_hms(2024, 3, 4 + *day_offset as u32, 12, 0, 0)
                    .unwrap();
                let day_of_week = chrono::Datelike::weekday(&occurred_at);
                crate::batch::Transaction {
                    id: id.to_string(),
                    account_id: "acct-1".to_string(),
                    amount: *amount,
                    magnitude: amount.abs(),
                    currency: None,
                    occurred_at,
                    day_of_week,
                    hour_of_day: 12,
                    is_weekend: matches!(day_of_week, Weekday::Sat | Weekday::Sun),
                    account_sequence: (index + 1) as u32,
                    hours_since_prev: (index > 0).then_some(24.0),
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

    #[test]
    fn test_triggers_only_on_configured_days_above_threshold() {
        // Saturday 1500 triggers, Saturday 500 does not, Tuesday 5000 does not.
        let batch = batch_with(&[("sat-hi", 5, 1500.0), ("sat-lo", 5, 500.0), ("tue", 1, 5000.0)]);
        let config = serde_json::json!({
            "weekdays": ["saturday", "sunday"],
            "amount_threshold": 1000.0,
        });

        let detection = WeekendThreshold.detect(&batch, &config).unwrap();

        let triggered: Vec<_> = detection
            .flags
            .iter()
            .filter(|f| f.triggered)
            .map(|f| f.transaction_id.as_str())
            .collect();
        assert_eq!(triggered, vec!["sat-hi"]);

        let by_id = |id: &str| {
            detection
                .scores
                .iter()
                .find(|s| s.transaction_id == id)
                .unwrap()
                .score
        };
        assert_eq!(by_id("sat-hi"), 1.0);
        assert_eq!(by_id("sat-lo"), 0.0);
        assert_eq!(by_id("tue"), 0.0);
    }

    #[test]
    fn test_triggered_flag_carries_explanation() {
        let batch = batch_with(&[("sat", 5, 2000.0)]);
        let detection = WeekendThreshold
            .detect(&batch, &serde_json::json!({}))
            .unwrap();
        let flag = &detection.flags[0];
        assert!(flag.triggered);
        assert!(flag.flag_value.as_deref().unwrap().contains("2000.00"));
    }

    #[test]
    fn test_one_flag_and_score_per_transaction() {
        let batch = batch_with(&[("a", 0, 10.0), ("b", 5, 9999.0), ("c", 6, 50.0)]);
        let detection = WeekendThreshold
            .detect(&batch, &serde_json::json!({}))
            .unwrap();
        assert_eq!(detection.scores.len(), 3);
        assert_eq!(detection.flags.len(), 3);
    }

    #[test]
    fn test_validation_names_offending_field() {
        let err = WeekendThreshold
            .validate_config(&serde_json::json!({ "weekdays": ["caturday"] }))
            .unwrap_err();
        assert_eq!(err.field, "weekdays");

        let err = WeekendThreshold
            .validate_config(&serde_json::json!({ "amount_threshold": -5.0 }))
            .unwrap_err();
        assert_eq!(err.field, "amount_threshold");

        let err = WeekendThreshold
            .validate_config(&serde_json::json!({ "weekdays": [] }))
            .unwrap_err();
        assert_eq!(err.field, "weekdays");
    }
}
