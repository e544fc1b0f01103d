use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::algo::{
    param_f64, param_features, param_u64, Algorithm, Category, Detection, Feature,
    TransactionScore,
};
use crate::batch::{Transaction, TransformedBatch};
use crate::error::{ConfigurationError, DetectionError};

const DEFAULT_CORRELATION_THRESHOLD: f64 = 0.3;
const DEFAULT_WINDOW_SIZE: u64 = 100;
const DEFAULT_FEATURES: [Feature; 3] = [Feature::Magnitude, Feature::HourOfDay, Feature::DayOfWeek];
const MIN_WINDOW: usize = 10;

/// Statistical detector scoring each transaction by how badly it fits the
/// feature correlations of its surrounding window. For every strongly
/// correlated feature pair the window's linear fit predicts one feature
/// from the other; a large normalized prediction error marks the
/// transaction as breaking the account's usual pattern.
///
/// Accounts with too little history for a meaningful window receive a
/// uniform low score rather than being dropped from the output.
pub struct Correlation;

impl Correlation {
    pub const NAME: &'static str = "correlation";
}

struct CorrelationConfig {
    correlation_threshold: f64,
    window_size: usize,
    features: Vec<Feature>,
}

fn parse_config(config: &JsonValue) -> Result<CorrelationConfig, ConfigurationError> {
    let correlation_threshold = param_f64(
        Correlation::NAME,
        config,
        "correlation_threshold",
        DEFAULT_CORRELATION_THRESHOLD,
    )?;
    if !(0.0..=1.0).contains(&correlation_threshold) {
        return Err(ConfigurationError::new(
            Correlation::NAME,
            "correlation_threshold",
            "must be between 0 and 1",
        ));
    }

    let window_size = param_u64(Correlation::NAME, config, "window_size", DEFAULT_WINDOW_SIZE)?;
    if (window_size as usize) < MIN_WINDOW {
        return Err(ConfigurationError::new(
            Correlation::NAME,
            "window_size",
            format!("must be at least {MIN_WINDOW}"),
        ));
    }

    let features = param_features(Correlation::NAME, config, &DEFAULT_FEATURES)?;
    if features.len() < 2 {
        return Err(ConfigurationError::new(
            Correlation::NAME,
            "features",
            "at least 2 features are required",
        ));
    }

    Ok(CorrelationConfig {
        correlation_threshold,
        window_size: window_size as usize,
        features,
    })
}

impl Algorithm for Correlation {
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
            groups.entry(tx.account_id.as_str()).or_default().push(tx);
        }

        let mut scores = Vec::with_capacity(batch.transactions.len());
        for members in groups.into_values() {
            score_account(&cfg, members, &mut scores);
        }
        scores.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        Ok(Detection {
            scores,
            flags: Vec::new(),
        })
    }
}

fn score_account(cfg: &CorrelationConfig, mut members: Vec<&Transaction>, out: &mut Vec<TransactionScore>) {
    if members.len() < cfg.window_size / 2 {
        for tx in &members {
            out.push(TransactionScore {
                transaction_id: tx.id.clone(),
                score: 0.1,
                confidence: Some(0.3),
                metadata: serde_json::json!({
                    "reason": "insufficient_data_for_correlation",
                    "transaction_count": members.len(),
                }),
            });
        }
        return;
    }

    members.sort_by_key(|tx| tx.occurred_at);

    // Per-transaction feature rows, in timeline order.
    let rows: Vec<Vec<f64>> = members
        .iter()
        .map(|tx| cfg.features.iter().map(|f| f.value(tx)).collect())
        .collect();

    let half = cfg.window_size / 2;
    for (i, tx) in members.iter().enumerate() {
        let start = i.saturating_sub(half);
        let end = (i + half + 1).min(members.len());
        let window = &rows[start..end];

        if window.len() < MIN_WINDOW {
            out.push(TransactionScore {
                transaction_id: tx.id.clone(),
                score: 0.1,
                confidence: Some(0.2),
                metadata: serde_json::json!({
                    "reason": "insufficient_window_data",
                    "window_size": window.len(),
                }),
            });
            continue;
        }

        out.push(score_window(cfg, tx, &rows[i], window));
    }
}

/// Score one transaction against the correlation structure of its window.
fn score_window(
    cfg: &CorrelationConfig,
    tx: &Transaction,
    row: &[f64],
    window: &[Vec<f64>],
) -> TransactionScore {
    let mut indicators: Vec<f64> = Vec::new();
    let mut strengths: Vec<f64> = Vec::new();

    for a in 0..cfg.features.len() {
        for b in (a + 1)..cfg.features.len() {
            let xs: Vec<f64> = window.iter().map(|r| r[a]).collect();
            let ys: Vec<f64> = window.iter().map(|r| r[b]).collect();

            let Some(corr) = pearson(&xs, &ys) else {
                continue;
            };
            strengths.push(corr.abs());

            if corr.abs() <= cfg.correlation_threshold {
                continue;
            }
            let Some(predicted) = predict_linear(&xs, &ys, row[a]) else {
                continue;
            };
            let error = (row[b] - predicted).abs();
            indicators.push(error / (population_stddev(&ys) + 1e-6));
        }
    }

    if indicators.is_empty() {
        return TransactionScore {
            transaction_id: tx.id.clone(),
            score: 0.1,
            confidence: Some(0.2),
            metadata: serde_json::json!({ "reason": "no_significant_correlations" }),
        };
    }

    let mean = indicators.iter().sum::<f64>() / indicators.len() as f64;
    let max = indicators.iter().cloned().fold(f64::MIN, f64::max);
    let score = ((mean + max) / 4.0).clamp(0.0, 1.0);

    let avg_strength = strengths.iter().sum::<f64>() / strengths.len() as f64;
    let confidence = (avg_strength + 0.3).min(1.0);

    TransactionScore {
        transaction_id: tx.id.clone(),
        score,
        confidence: Some(confidence),
        metadata: serde_json::json!({
            "anomaly_indicators": indicators.len(),
            "mean_prediction_error": mean,
            "max_prediction_error": max,
            "average_correlation_strength": avg_strength,
            "features": cfg.features.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
        }),
    }
}

/// Pearson correlation; `None` when either side has zero variance.
fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
        var_y += (y - mean_y) * (y - mean_y);
    }

    let denom = (var_x * var_y).sqrt();
    if denom <= 1e-12 {
        return None;
    }
    Some(cov / denom)
}

/// Predict y at `x_target` from the window's least-squares fit of y on x.
fn predict_linear(xs: &[f64], ys: &[f64], x_target: f64) -> Option<f64> {
    if xs.len() < 3 {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
    }
    if var_x <= 1e-12 {
        return None;
    }

    let slope = cov / var_x;
    Some(slope * (x_target - mean_x) + mean_y)
}

fn population_stddev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
}
