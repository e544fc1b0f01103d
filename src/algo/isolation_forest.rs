use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value as JsonValue;

use crate::algo::{
    param_bool, param_f64, param_features, param_u64, Algorithm, Category, Detection, Feature,
    TransactionScore,
};
use crate::batch::{Transaction, TransformedBatch};
use crate::error::{ConfigurationError, DetectionError};

const DEFAULT_CONTAMINATION: f64 = 0.1;
const DEFAULT_N_ESTIMATORS: u64 = 100;
const DEFAULT_MIN_SAMPLES_FIT: u64 = 50;
const DEFAULT_RANDOM_STATE: u64 = 42;
const AUTO_MAX_SAMPLES: usize = 256;
const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;

const DEFAULT_FEATURES: [Feature; 4] = [
    Feature::Amount,
    Feature::HourOfDay,
    Feature::DayOfWeek,
    Feature::HoursSincePrev,
];

/// Isolation-forest detector. Builds an ensemble of randomized binary
/// trees over standardized feature vectors; transactions that isolate
/// in few splits score high. Seeded, so repeated runs over the same
/// batch and config produce identical output.
pub struct IsolationForest;

impl IsolationForest {
    pub const NAME: &'static str = "isolation_forest";
}

enum MaxSamples {
    Auto,
    Absolute(usize),
    Fraction(f64),
}

impl MaxSamples {
    fn resolve(&self, n: usize) -> usize {
        match self {
            Self::Auto => AUTO_MAX_SAMPLES.min(n),
            Self::Absolute(m) => (*m).min(n),
            Self::Fraction(f) => ((f * n as f64).ceil() as usize).clamp(1, n),
        }
    }
}

struct ForestConfig {
    contamination: f64,
    n_estimators: usize,
    max_samples: MaxSamples,
    features: Vec<Feature>,
    min_samples_fit: usize,
    random_state: u64,
    account_specific: bool,
}

fn parse_max_samples(config: &JsonValue) -> Result<MaxSamples, ConfigurationError> {
    let invalid = || {
        ConfigurationError::new(
            IsolationForest::NAME,
            "max_samples",
            "must be \"auto\", an integer >= 1, or a fraction in (0, 1]",
        )
    };
    match config.get("max_samples") {
        None | Some(JsonValue::Null) => Ok(MaxSamples::Auto),
        Some(JsonValue::String(s)) if s == "auto" => Ok(MaxSamples::Auto),
        Some(JsonValue::Number(n)) => {
            if let Some(m) = n.as_u64() {
                if m >= 1 {
                    return Ok(MaxSamples::Absolute(m as usize));
                }
            } else if let Some(f) = n.as_f64() {
                if f > 0.0 && f <= 1.0 {
                    return Ok(MaxSamples::Fraction(f));
                }
            }
            Err(invalid())
        }
        Some(_) => Err(invalid()),
    }
}

fn parse_config(config: &JsonValue) -> Result<ForestConfig, ConfigurationError> {
    let contamination = param_f64(
        IsolationForest::NAME,
        config,
        "contamination",
        DEFAULT_CONTAMINATION,
    )?;
    if !contamination.is_finite() || contamination <= 0.0 || contamination > 0.5 {
        return Err(ConfigurationError::new(
            IsolationForest::NAME,
            "contamination",
            "must be in (0.0, 0.5]",
        ));
    }

    let n_estimators =
        param_u64(IsolationForest::NAME, config, "n_estimators", DEFAULT_N_ESTIMATORS)?;
    if n_estimators < 1 {
        return Err(ConfigurationError::new(
            IsolationForest::NAME,
            "n_estimators",
            "must be at least 1",
        ));
    }

    let features = param_features(IsolationForest::NAME, config, &DEFAULT_FEATURES)?;
    if features.is_empty() {
        return Err(ConfigurationError::new(
            IsolationForest::NAME,
            "features",
            "must name at least one feature",
        ));
    }

    let min_samples_fit = param_u64(
        IsolationForest::NAME,
        config,
        "min_samples_fit",
        DEFAULT_MIN_SAMPLES_FIT,
    )?;
    if min_samples_fit < 10 {
        return Err(ConfigurationError::new(
            IsolationForest::NAME,
            "min_samples_fit",
            "must be at least 10",
        ));
    }

    let random_state =
        param_u64(IsolationForest::NAME, config, "random_state", DEFAULT_RANDOM_STATE)?;

    let account_specific =
        param_bool(IsolationForest::NAME, config, "account_specific", false)?;

    Ok(ForestConfig {
        contamination,
        n_estimators: n_estimators as usize,
        max_samples: parse_max_samples(config)?,
        features,
        min_samples_fit: min_samples_fit as usize,
        random_state,
        account_specific,
    })
}

impl Algorithm for IsolationForest {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn category(&self) -> Category {
        Category::MlBased
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

        let mut rng = StdRng::seed_from_u64(cfg.random_state);
        let mut scores = if cfg.account_specific {
            let mut accounts: HashMap<&str, Vec<&Transaction>> = HashMap::new();
            for tx in &batch.transactions {
                accounts.entry(tx.account_id.as_str()).or_default().push(tx);
            }
            // Accounts in sorted order so the rng stream is reproducible.
            let mut keys: Vec<&str> = accounts.keys().copied().collect();
            keys.sort_unstable();

            let mut out = Vec::with_capacity(batch.transactions.len());
            for key in keys {
                let members = &accounts[key];
                if members.len() < cfg.min_samples_fit {
                    out.extend(members.iter().map(|tx| TransactionScore {
                        transaction_id: tx.id.clone(),
                        score: 0.1,
                        confidence: Some(0.3),
                        metadata: serde_json::json!({
                            "reason": "insufficient_account_data",
                            "transaction_count": members.len(),
                        }),
                    }));
                } else {
                    out.extend(score_group(&cfg, members, &mut rng));
                }
            }
            out
        } else if batch.transactions.len() < cfg.min_samples_fit {
            batch
                .transactions
                .iter()
                .map(|tx| TransactionScore {
                    transaction_id: tx.id.clone(),
                    score: 0.1,
                    confidence: Some(0.2),
                    metadata: serde_json::json!({
                        "reason": "insufficient_data",
                        "transaction_count": batch.transactions.len(),
                        "required": cfg.min_samples_fit,
                    }),
                })
                .collect()
        } else {
            let members: Vec<&Transaction> = batch.transactions.iter().collect();
            score_group(&cfg, &members, &mut rng)
        };

        scores.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        Ok(Detection {
            scores,
            flags: Vec::new(),
        })
    }
}

fn score_group(
    cfg: &ForestConfig,
    members: &[&Transaction],
    rng: &mut StdRng,
) -> Vec<TransactionScore> {
    let matrix = feature_matrix(&cfg.features, members);
    let raw = forest_scores(cfg, &matrix, rng);

    let min = raw.iter().cloned().fold(f64::MAX, f64::min);
    let max = raw.iter().cloned().fold(f64::MIN, f64::max);
    let spread = max - min;

    let normalized: Vec<f64> = if spread <= 1e-12 {
        vec![0.1; raw.len()]
    } else {
        raw.iter()
            .map(|s| ((s - min) / spread).clamp(0.01, 0.99))
            .collect()
    };

    // The top contamination fraction of isolation scores is flagged.
    let mut sorted = raw.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let cutoff_index = (((1.0 - cfg.contamination) * sorted.len() as f64).floor() as usize)
        .min(sorted.len() - 1);
    let cutoff = sorted[cutoff_index];

    members
        .iter()
        .zip(raw.iter().zip(&normalized))
        .map(|(tx, (&isolation, &score))| {
            let is_outlier = spread > 1e-12 && isolation >= cutoff && isolation > sorted[0];
            let base = (score - 0.5).abs() / 0.5;
            let confidence = if is_outlier {
                (base + 0.3).clamp(0.1, 0.95)
            } else {
                (base + 0.1).clamp(0.1, 0.9)
            };
            TransactionScore {
                transaction_id: tx.id.clone(),
                score,
                confidence: Some(confidence),
                metadata: serde_json::json!({
                    "is_outlier": is_outlier,
                    "isolation_score": isolation,
                    "n_estimators": cfg.n_estimators,
                    "contamination": cfg.contamination,
                }),
            }
        })
        .collect()
}

/// Standardized feature matrix, one row per transaction. When the
/// configuration includes a value feature, a log-compressed magnitude
/// column is appended so extreme amounts stay separable after scaling.
fn feature_matrix(features: &[Feature], members: &[&Transaction]) -> Vec<Vec<f64>> {
    let with_log = features
        .iter()
        .any(|f| matches!(f, Feature::Amount | Feature::Magnitude));

    let mut matrix: Vec<Vec<f64>> = members
        .iter()
        .map(|tx| {
            let mut row: Vec<f64> = features.iter().map(|f| f.value(tx)).collect();
            if with_log {
                row.push(tx.magnitude.ln_1p());
            }
            row
        })
        .collect();

    let columns = matrix.first().map_or(0, Vec::len);
    for col in 0..columns {
        let n = matrix.len() as f64;
        let mean = matrix.iter().map(|r| r[col]).sum::<f64>() / n;
        let variance = matrix.iter().map(|r| (r[col] - mean) * (r[col] - mean)).sum::<f64>() / n;
        let std = variance.sqrt();
        for row in &mut matrix {
            row[col] = if std > 1e-12 { (row[col] - mean) / std } else { 0.0 };
        }
    }

    matrix
}

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// Average path length of an unsuccessful BST search over `n` points,
/// the standard normalization term for isolation forests.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_MASCHERONI) - 2.0 * (n - 1.0) / n
        }
    }
}

fn build_tree(
    matrix: &[Vec<f64>],
    rows: &[usize],
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= height_limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    let columns = matrix[rows[0]].len();
    // Only columns that still vary within this node can split it.
    let splittable: Vec<(usize, f64, f64)> = (0..columns)
        .filter_map(|col| {
            let mut lo = f64::MAX;
            let mut hi = f64::MIN;
            for &row in rows {
                lo = lo.min(matrix[row][col]);
                hi = hi.max(matrix[row][col]);
            }
            (hi - lo > 1e-12).then_some((col, lo, hi))
        })
        .collect();

    let Some(&(feature, lo, hi)) = splittable.get(rng.gen_range(0..splittable.len().max(1)))
    else {
        return Node::Leaf { size: rows.len() };
    };

    let threshold = rng.gen_range(lo..hi);
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
        .iter()
        .copied()
        .partition(|&row| matrix[row][feature] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(matrix, &left_rows, depth + 1, height_limit, rng)),
        right: Box::new(build_tree(matrix, &right_rows, depth + 1, height_limit, rng)),
    }
}

fn path_length(node: &Node, row: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            let child = if row[*feature] < *threshold { left } else { right };
            path_length(child, row, depth + 1)
        }
    }
}

/// Per-row anomaly score `2^(-E[h]/c(m))`: near 1.0 for points that
/// isolate quickly, near 0.5 for average points.
fn forest_scores(cfg: &ForestConfig, matrix: &[Vec<f64>], rng: &mut StdRng) -> Vec<f64> {
    let n = matrix.len();
    let sample_size = cfg.max_samples.resolve(n);
    let height_limit = (sample_size as f64).log2().ceil().max(1.0) as usize;
    let normalizer = average_path_length(sample_size).max(1.0);

    let mut indices: Vec<usize> = (0..n).collect();
    let mut totals = vec![0.0_f64; n];

    for _ in 0..cfg.n_estimators {
        indices.shuffle(rng);
        let tree = build_tree(matrix, &indices[..sample_size], 0, height_limit, rng);
        for (row, total) in matrix.iter().zip(&mut totals) {
            *total += path_length(&tree, row, 0);
        }
    }

    totals
        .iter()
        .map(|total| {
            let mean_path = total / cfg.n_estimators as f64;
            2.0_f64.powf(-mean_path / normalizer)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn batch(amounts: &[f64]) -> TransformedBatch {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let transactions = amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| {
                let occurred_at = base + Duration::hours(i as i64);
                Transaction {
                    id: format!("t-{i:03}"),
                    account_id: format!("acct-{}", i % 4),
                    amount,
                    magnitude: amount.abs(),
                    currency: None,
                    occurred_at,
                    day_of_week: chrono::Datelike::weekday(&occurred_at),
                    hour_of_day: chrono::Timelike::hour(&occurred_at) as u8,
                    is_weekend: false,
                    account_sequence: (i / 4 + 1) as u32,
                    hours_since_prev: (i >= 4).then_some(4.0),
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
    fn test_small_batch_gets_uniform_low_score() {
        let batch = batch(&[100.0; 10]);
        let detection = IsolationForest
            .detect(&batch, &serde_json::json!({}))
            .unwrap();
        assert_eq!(detection.scores.len(), 10);
        for score in &detection.scores {
            assert_eq!(score.score, 0.1);
            assert_eq!(score.metadata["reason"], "insufficient_data");
        }
    }

    #[test]
    fn test_extreme_transaction_isolates_first() {
        // Sixty unremarkable amounts plus one five-figure outlier.
        let mut amounts: Vec<f64> = (0..60).map(|i| 90.0 + (i % 7) as f64 * 3.0).collect();
        amounts.push(50_000.0);
        let batch = batch(&amounts);

        let cfg = serde_json::json!({
            "min_samples_fit": 10,
            "n_estimators": 50,
        });
        let detection = IsolationForest.detect(&batch, &cfg).unwrap();

        let outlier = detection
            .scores
            .iter()
            .find(|s| s.transaction_id == "t-060")
            .unwrap();
        assert_eq!(outlier.metadata["is_outlier"], true);
        assert!(outlier.score >= 0.9, "outlier score {}", outlier.score);

        for score in &detection.scores {
            assert!((0.01..=0.99).contains(&score.score), "{}", score.score);
            assert!(score.score <= outlier.score);
        }
    }

    #[test]
    fn test_thin_account_skipped_when_account_specific() {
        let mut amounts: Vec<f64> = (0..60).map(|i| 90.0 + (i % 7) as f64 * 3.0).collect();
        amounts.push(50_000.0);
        let mut batch = batch(&amounts);
        // Strand the outlier on its own account; the rest share one.
        for tx in &mut batch.transactions {
            tx.account_id = "acct-main".to_string();
        }
        batch.transactions[60].account_id = "acct-thin".to_string();

        let cfg = serde_json::json!({
            "min_samples_fit": 10,
            "account_specific": true,
        });
        let detection = IsolationForest.detect(&batch, &cfg).unwrap();

        let thin = detection
            .scores
            .iter()
            .find(|s| s.transaction_id == "t-060")
            .unwrap();
        assert_eq!(thin.score, 0.1);
        assert_eq!(thin.metadata["reason"], "insufficient_account_data");
    }

    #[test]
    fn test_detect_is_deterministic() {
        let amounts: Vec<f64> = (0..80).map(|i| ((i * 53) % 400) as f64 + 20.0).collect();
        let batch = batch(&amounts);
        let cfg = serde_json::json!({ "min_samples_fit": 10, "random_state": 7 });

        let first = IsolationForest.detect(&batch, &cfg).unwrap();
        let second = IsolationForest.detect(&batch, &cfg).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_validation_names_offending_field() {
        let err = IsolationForest
            .validate_config(&serde_json::json!({ "contamination": 0.7 }))
            .unwrap_err();
        assert_eq!(err.field, "contamination");

        let err = IsolationForest
            .validate_config(&serde_json::json!({ "n_estimators": 0 }))
            .unwrap_err();
        assert_eq!(err.field, "n_estimators");

        let err = IsolationForest
            .validate_config(&serde_json::json!({ "min_samples_fit": 5 }))
            .unwrap_err();
        assert_eq!(err.field, "min_samples_fit");

        let err = IsolationForest
            .validate_config(&serde_json::json!({ "features": [] }))
            .unwrap_err();
        assert_eq!(err.field, "features");

        let err = IsolationForest
            .validate_config(&serde_json::json!({ "max_samples": "half" }))
            .unwrap_err();
        assert_eq!(err.field, "max_samples");
    }

    #[test]
    fn test_defaults_are_valid() {
        IsolationForest
            .validate_config(&serde_json::json!({}))
            .unwrap();
    }
}
