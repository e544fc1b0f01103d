use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

use crate::algo::{
    param_bool, param_choice, param_f64, param_u64, Algorithm, Category, Detection,
    TransactionScore,
};
use crate::batch::{Transaction, TransformedBatch};
use crate::error::{ConfigurationError, DetectionError};

const DEFAULT_THRESHOLD_MULTIPLIER: f64 = 2.0;
const DEFAULT_MIN_PERIODS: u64 = 10;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;
// 1970-01-01 was a Thursday; shift so week buckets start on Monday.
const WEEK_EPOCH_SHIFT: i64 = 3 * SECONDS_PER_DAY;

/// Statistical detector for temporal patterns. Two independent analyses
/// feed one score per transaction, merged by maximum:
///
/// - period analysis buckets the whole batch into fixed time windows,
///   aggregates per bucket, and marks buckets whose (optionally
///   detrended) value falls outside a configurable band;
/// - timing analysis walks each account's inter-transaction gaps and
///   flags rapid-fire runs, long silences, and gaps far from the
///   account's usual rhythm.
pub struct TimeSeries;

impl TimeSeries {
    pub const NAME: &'static str = "timeseries";
}

#[derive(Clone, Copy, PartialEq)]
enum TimeWindow {
    Hour,
    Day,
    Week,
}

impl TimeWindow {
    fn period_of(&self, at: DateTime<Utc>) -> i64 {
        let ts = at.timestamp();
        match self {
            Self::Hour => ts.div_euclid(SECONDS_PER_HOUR),
            Self::Day => ts.div_euclid(SECONDS_PER_DAY),
            Self::Week => (ts + WEEK_EPOCH_SHIFT).div_euclid(SECONDS_PER_WEEK),
        }
    }

    fn period_start(&self, period: i64) -> DateTime<Utc> {
        let ts = match self {
            Self::Hour => period * SECONDS_PER_HOUR,
            Self::Day => period * SECONDS_PER_DAY,
            Self::Week => period * SECONDS_PER_WEEK - WEEK_EPOCH_SHIFT,
        };
        Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Aggregation {
    Count,
    Sum,
    Mean,
}

#[derive(Clone, Copy, PartialEq)]
enum ThresholdMethod {
    Std,
    Iqr,
    Percentile,
}

struct TimeSeriesConfig {
    time_window: TimeWindow,
    aggregation: Aggregation,
    threshold_method: ThresholdMethod,
    threshold_multiplier: f64,
    seasonal_adjustment: bool,
    min_periods: usize,
}

fn parse_config(config: &JsonValue) -> Result<TimeSeriesConfig, ConfigurationError> {
    let time_window = match param_choice(
        TimeSeries::NAME,
        config,
        "time_window",
        &["hour", "day", "week"],
        "hour",
    )? {
        "day" => TimeWindow::Day,
        "week" => TimeWindow::Week,
        _ => TimeWindow::Hour,
    };

    let aggregation = match param_choice(
        TimeSeries::NAME,
        config,
        "aggregation_method",
        &["count", "sum", "mean"],
        "count",
    )? {
        "sum" => Aggregation::Sum,
        "mean" => Aggregation::Mean,
        _ => Aggregation::Count,
    };

    let threshold_method = match param_choice(
        TimeSeries::NAME,
        config,
        "threshold_method",
        &["std", "iqr", "percentile"],
        "std",
    )? {
        "iqr" => ThresholdMethod::Iqr,
        "percentile" => ThresholdMethod::Percentile,
        _ => ThresholdMethod::Std,
    };

    let threshold_multiplier = param_f64(
        TimeSeries::NAME,
        config,
        "threshold_multiplier",
        DEFAULT_THRESHOLD_MULTIPLIER,
    )?;
    if !threshold_multiplier.is_finite() || threshold_multiplier <= 0.0 {
        return Err(ConfigurationError::new(
            TimeSeries::NAME,
            "threshold_multiplier",
            "must be a positive number",
        ));
    }

    let seasonal_adjustment =
        param_bool(TimeSeries::NAME, config, "seasonal_adjustment", true)?;

    let min_periods = param_u64(TimeSeries::NAME, config, "min_periods", DEFAULT_MIN_PERIODS)?;
    if min_periods < 3 {
        return Err(ConfigurationError::new(
            TimeSeries::NAME,
            "min_periods",
            "must be at least 3",
        ));
    }

    Ok(TimeSeriesConfig {
        time_window,
        aggregation,
        threshold_method,
        threshold_multiplier,
        seasonal_adjustment,
        min_periods: min_periods as usize,
    })
}

impl Algorithm for TimeSeries {
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

        // Period and timing analyses each score every transaction; keep
        // the higher of the two per transaction.
        let mut merged: HashMap<String, TransactionScore> = HashMap::new();
        for score in analyze_periods(&cfg, batch) {
            merged.insert(score.transaction_id.clone(), score);
        }
        for score in analyze_account_timing(batch) {
            match merged.entry(score.transaction_id.clone()) {
                Entry::Occupied(mut slot) => {
                    if score.score > slot.get().score {
                        slot.insert(score);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(score);
                }
            }
        }

        let mut scores: Vec<TransactionScore> = merged.into_values().collect();
        scores.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        Ok(Detection {
            scores,
            flags: Vec::new(),
        })
    }
}

struct AnomalousPeriod {
    score: f64,
    confidence: f64,
    value: f64,
    expected: f64,
}

/// Bucket the batch into time periods and score each transaction by
/// whether its period's aggregate deviates from the rest of the series.
fn analyze_periods(cfg: &TimeSeriesConfig, batch: &TransformedBatch) -> Vec<TransactionScore> {
    let mut buckets: BTreeMap<i64, Vec<&Transaction>> = BTreeMap::new();
    for tx in &batch.transactions {
        buckets
            .entry(cfg.time_window.period_of(tx.occurred_at))
            .or_default()
            .push(tx);
    }

    let Some((&first, _)) = buckets.iter().next() else {
        return Vec::new();
    };
    let &last = buckets.keys().next_back().unwrap_or(&first);

    // Dense series over the full span; quiet periods count as zero.
    let series: Vec<(i64, f64)> = (first..=last)
        .map(|period| {
            let value = match buckets.get(&period) {
                None => 0.0,
                Some(members) => match cfg.aggregation {
                    Aggregation::Count => members.len() as f64,
                    Aggregation::Sum => members.iter().map(|t| t.amount).sum(),
                    Aggregation::Mean => {
                        members.iter().map(|t| t.amount).sum::<f64>() / members.len() as f64
                    }
                },
            };
            (period, value)
        })
        .collect();

    if series.len() < cfg.min_periods {
        return batch
            .transactions
            .iter()
            .map(|tx| TransactionScore {
                transaction_id: tx.id.clone(),
                score: 0.1,
                confidence: Some(0.2),
                metadata: serde_json::json!({
                    "analysis": "period",
                    "reason": "insufficient_time_periods",
                    "periods_available": series.len(),
                }),
            })
            .collect();
    }

    let values: Vec<f64> = series.iter().map(|&(_, v)| v).collect();
    let adjusted = if cfg.seasonal_adjustment && values.len() > 24 {
        detrend(&values)
    } else {
        values.clone()
    };

    let anomalous = anomalous_periods(cfg, &series, &adjusted);

    batch
        .transactions
        .iter()
        .map(|tx| {
            let period = cfg.time_window.period_of(tx.occurred_at);
            match anomalous.get(&period) {
                Some(info) => {
                    let mut score = info.score;
                    // For value aggregations, weight by the transaction's
                    // share of the anomalous period.
                    if cfg.aggregation != Aggregation::Count {
                        let contribution = tx.magnitude / (info.value.abs() + 1e-6);
                        score = (score * (0.5 + 0.5 * contribution)).min(1.0);
                    }
                    TransactionScore {
                        transaction_id: tx.id.clone(),
                        score,
                        confidence: Some(info.confidence),
                        metadata: serde_json::json!({
                            "analysis": "period",
                            "anomalous_period_start": cfg.time_window.period_start(period).to_rfc3339(),
                            "period_value": info.value,
                            "expected_value": info.expected,
                        }),
                    }
                }
                None => TransactionScore {
                    transaction_id: tx.id.clone(),
                    score: 0.1,
                    confidence: Some(0.8),
                    metadata: serde_json::json!({
                        "analysis": "period",
                        "reason": "normal_period",
                    }),
                },
            }
        })
        .collect()
}

/// Remove the trend via a centered rolling mean; edges without a full
/// window keep their original value.
fn detrend(values: &[f64]) -> Vec<f64> {
    let window = (values.len() / 4).min(24);
    if window < 3 {
        return values.to_vec();
    }

    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let Some(start) = i.checked_sub(window / 2) else {
                return v;
            };
            let end = start + window;
            if end > values.len() {
                return v;
            }
            let mean = values[start..end].iter().sum::<f64>() / window as f64;
            v - mean
        })
        .collect()
}

fn anomalous_periods(
    cfg: &TimeSeriesConfig,
    series: &[(i64, f64)],
    adjusted: &[f64],
) -> HashMap<i64, AnomalousPeriod> {
    let mut out = HashMap::new();
    if adjusted.len() < 3 {
        return out;
    }

    let mean = adjusted.iter().sum::<f64>() / adjusted.len() as f64;
    let (upper, lower) = match cfg.threshold_method {
        ThresholdMethod::Std => {
            let std = sample_stddev(adjusted);
            (
                mean + cfg.threshold_multiplier * std,
                (mean - cfg.threshold_multiplier * std).max(0.0),
            )
        }
        ThresholdMethod::Iqr => {
            let q75 = quantile(adjusted, 0.75);
            let q25 = quantile(adjusted, 0.25);
            let iqr = q75 - q25;
            (
                q75 + cfg.threshold_multiplier * iqr,
                (q25 - cfg.threshold_multiplier * iqr).max(0.0),
            )
        }
        ThresholdMethod::Percentile => {
            let percentile = if cfg.threshold_multiplier <= 100.0 {
                cfg.threshold_multiplier
            } else {
                95.0
            };
            (
                quantile(adjusted, percentile / 100.0),
                quantile(adjusted, (100.0 - percentile) / 100.0),
            )
        }
    };

    let max_value = adjusted.iter().cloned().fold(f64::MIN, f64::max);
    let min_value = adjusted.iter().cloned().fold(f64::MAX, f64::min);

    for (&(period, raw), &value) in series.iter().zip(adjusted) {
        if value <= upper && value >= lower {
            continue;
        }
        let score = if value > upper {
            let headroom = (max_value - upper).max(1.0);
            0.5 + 0.5 * (value - upper) / headroom
        } else {
            let headroom = (lower - min_value).max(1.0);
            0.5 + 0.5 * (lower - value) / headroom
        }
        .min(1.0);

        out.insert(
            period,
            AnomalousPeriod {
                score,
                confidence: 0.7 + 0.3 * score,
                value: raw,
                expected: mean,
            },
        );
    }

    out
}

/// Walk each account's inter-transaction gaps, flagging rapid-fire
/// activity, long silences, and gaps far outside the usual rhythm.
fn analyze_account_timing(batch: &TransformedBatch) -> Vec<TransactionScore> {
    let mut accounts: HashMap<&str, Vec<&Transaction>> = HashMap::new();
    for tx in &batch.transactions {
        accounts.entry(tx.account_id.as_str()).or_default().push(tx);
    }

    let mut out = Vec::with_capacity(batch.transactions.len());
    for members in accounts.into_values() {
        let gaps: Vec<f64> = members.iter().filter_map(|t| t.hours_since_prev).collect();

        if members.len() < 5 || gaps.len() <= 3 {
            for tx in &members {
                out.push(TransactionScore {
                    transaction_id: tx.id.clone(),
                    score: 0.1,
                    confidence: Some(0.3),
                    metadata: serde_json::json!({
                        "analysis": "timing",
                        "reason": "insufficient_account_data",
                        "transaction_count": members.len(),
                    }),
                });
            }
            continue;
        }

        let median = quantile(&gaps, 0.5);
        let std = sample_stddev(&gaps);

        for tx in &members {
            let Some(gap) = tx.hours_since_prev else {
                out.push(TransactionScore {
                    transaction_id: tx.id.clone(),
                    score: 0.1,
                    confidence: Some(0.5),
                    metadata: serde_json::json!({
                        "analysis": "timing",
                        "reason": "first_transaction",
                    }),
                });
                continue;
            };

            let (score, confidence, pattern) = if gap < median * 0.1 && gap < 1.0 {
                (0.8, 0.9, "rapid_transaction")
            } else if gap > median * 10.0 && gap > 168.0 {
                (0.6, 0.7, "delayed_transaction")
            } else if std > 0.0 && (gap - median).abs() / std > 3.0 {
                let z = (gap - median).abs() / std;
                ((0.3 + z * 0.1).min(0.9), 0.8, "unusual_interval")
            } else {
                (0.1, 0.6, "normal")
            };

            out.push(TransactionScore {
                transaction_id: tx.id.clone(),
                score,
                confidence: Some(confidence),
                metadata: serde_json::json!({
                    "analysis": "timing",
                    "pattern": pattern,
                    "gap_hours": gap,
                    "median_gap_hours": median,
                }),
            });
        }
    }

    out
}

fn sample_stddev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Linearly interpolated quantile, `q` in [0, 1].
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        sorted[lower] + (pos - lower as f64) * (sorted[upper] - sorted[lower])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn tx(id: &str, account: &str, occurred_at: DateTime<Utc>, amount: f64) -> Transaction {
        Transaction {
            id: id.to_string(),
            account_id: account.to_string(),
            amount,
            magnitude: amount.abs(),
            currency: None,
            occurred_at,
            day_of_week: chrono::Datelike::weekday(&occurred_at),
            hour_of_day: chrono::Timelike::hour(&occurred_at) as u8,
            is_weekend: false,
            account_sequence: 0,
            hours_since_prev: None,
            payload: JsonValue::Null,
        }
    }

    /// Fill in sequence features the way the transformer does.
    fn with_sequence(mut transactions: Vec<Transaction>) -> TransformedBatch {
        transactions.sort_by_key(|t| t.occurred_at);
        let mut prev: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for tx in &mut transactions {
            let count = counts.entry(tx.account_id.clone()).or_insert(0);
            *count += 1;
            tx.account_sequence = *count;
            tx.hours_since_prev = prev
                .get(&tx.account_id)
                .map(|p| (tx.occurred_at - *p).num_milliseconds() as f64 / 3_600_000.0);
            prev.insert(tx.account_id.clone(), tx.occurred_at);
        }
        TransformedBatch {
            batch_id: Uuid::nil(),
            transactions,
            excluded: Vec::new(),
        }
    }

    #[test]
    fn test_burst_period_scores_above_quiet_periods() {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let mut transactions = Vec::new();
        // One transaction per hour on separate accounts, then a burst of
        // ten in a single hour.
        for i in 0..12 {
            transactions.push(tx(
                &format!("quiet-{i:02}"),
                &format!("acct-{i:02}"),
                base + Duration::hours(i),
                100.0,
            ));
        }
        for i in 0..10 {
            transactions.push(tx(
                &format!("burst-{i:02}"),
                &format!("burst-acct-{i:02}"),
                base + Duration::hours(12) + Duration::minutes(i),
                100.0,
            ));
        }
        let batch = with_sequence(transactions);

        let cfg = serde_json::json!({
            "time_window": "hour",
            "aggregation_method": "count",
            "threshold_multiplier": 2.0,
            "seasonal_adjustment": false,
            "min_periods": 5,
        });
        let detection = TimeSeries.detect(&batch, &cfg).unwrap();
        assert_eq!(detection.scores.len(), 22);

        for score in &detection.scores {
            if score.transaction_id.starts_with("burst") {
                assert!(score.score >= 0.5, "{}: {}", score.transaction_id, score.score);
            } else {
                assert!(score.score <= 0.2, "{}: {}", score.transaction_id, score.score);
            }
        }
    }

    #[test]
    fn test_rapid_fire_gap_is_flagged_per_account() {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let mut transactions: Vec<Transaction> = (0..5)
            .map(|i| tx(&format!("daily-{i}"), "acct-1", base + Duration::days(i), 100.0))
            .collect();
        // One minute after the last daily transaction.
        transactions.push(tx(
            "rapid",
            "acct-1",
            base + Duration::days(4) + Duration::minutes(1),
            100.0,
        ));
        let batch = with_sequence(transactions);

        let cfg = serde_json::json!({
            "time_window": "day",
            "min_periods": 3,
            "seasonal_adjustment": false,
        });
        let detection = TimeSeries.detect(&batch, &cfg).unwrap();

        let rapid = detection
            .scores
            .iter()
            .find(|s| s.transaction_id == "rapid")
            .unwrap();
        assert_eq!(rapid.score, 0.8);
        assert_eq!(rapid.metadata["pattern"], "rapid_transaction");

        for score in detection.scores.iter().filter(|s| s.transaction_id != "rapid") {
            assert!(score.score <= 0.2, "{}: {}", score.transaction_id, score.score);
        }
    }

    #[test]
    fn test_short_series_gets_uniform_low_score() {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let transactions = (0..3)
            .map(|i| tx(&format!("t-{i}"), "acct-1", base + Duration::hours(i), 50.0))
            .collect();
        let batch = with_sequence(transactions);

        let detection = TimeSeries
            .detect(&batch, &serde_json::json!({}))
            .unwrap();
        assert_eq!(detection.scores.len(), 3);
        for score in &detection.scores {
            assert_eq!(score.score, 0.1);
        }
    }

    #[test]
    fn test_detect_is_deterministic() {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let transactions: Vec<Transaction> = (0..40)
            .map(|i| {
                tx(
                    &format!("t-{i:02}"),
                    &format!("acct-{}", i % 3),
                    base + Duration::minutes(i * 47),
                    ((i * 31) % 200) as f64 + 10.0,
                )
            })
            .collect();
        let batch = with_sequence(transactions);
        let cfg = serde_json::json!({ "aggregation_method": "sum" });

        let first = TimeSeries.detect(&batch, &cfg).unwrap();
        let second = TimeSeries.detect(&batch, &cfg).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_validation_names_offending_field() {
        let err = TimeSeries
            .validate_config(&serde_json::json!({ "time_window": "month" }))
            .unwrap_err();
        assert_eq!(err.field, "time_window");

        let err = TimeSeries
            .validate_config(&serde_json::json!({ "aggregation_method": "median" }))
            .unwrap_err();
        assert_eq!(err.field, "aggregation_method");

        let err = TimeSeries
            .validate_config(&serde_json::json!({ "threshold_multiplier": 0.0 }))
            .unwrap_err();
        assert_eq!(err.field, "threshold_multiplier");

        let err = TimeSeries
            .validate_config(&serde_json::json!({ "min_periods": 2 }))
            .unwrap_err();
        assert_eq!(err.field, "min_periods");
    }

    #[test]
    fn test_defaults_are_valid() {
        TimeSeries.validate_config(&serde_json::json!({})).unwrap();
    }
}
