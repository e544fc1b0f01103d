use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::algo::registry::AlgorithmRegistry;
use crate::algo::{Detection, RuleFlag, TransactionScore};
use crate::batch::TransformedBatch;
use crate::error::EngineError;
use crate::strategy::{CombinationPolicy, Strategy};

/// One algorithm's complete output for the batch, tagged with its identifier.
#[derive(Debug, Clone)]
pub struct AlgorithmResult {
    pub algorithm: String,
    pub detection: Detection,
}

/// Fan-in result of a full strategy pass over a batch.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    /// One aggregate score per transaction, sorted by transaction id,
    /// carrying the reserved `combined` identifier downstream.
    pub aggregates: Vec<TransactionScore>,
    /// Per-algorithm outputs in strategy order.
    pub per_algorithm: Vec<AlgorithmResult>,
    /// All rule flags emitted by rule-based algorithms.
    pub flags: Vec<RuleFlag>,
}

/// Run every configured algorithm against the batch and combine their
/// scores. Algorithm passes are mutually independent and run concurrently
/// on the blocking pool; the single synchronization point is the fan-in
/// aggregation, which waits for all of them. `completed_passes` is bumped
/// once per finished algorithm for coarse progress polling.
pub async fn execute_strategy(
    registry: &AlgorithmRegistry,
    strategy: &Strategy,
    batch: Arc<TransformedBatch>,
    completed_passes: Arc<AtomicU64>,
) -> Result<EngineOutput, EngineError> {
    let mut handles = Vec::with_capacity(strategy.algorithms.len());

    for spec in &strategy.algorithms {
        let algorithm = registry.get(&spec.algorithm)?;
        let params = spec.params.clone();
        let batch = Arc::clone(&batch);
        let passes = Arc::clone(&completed_passes);

        handles.push(tokio::task::spawn_blocking(move || {
            let detection = algorithm.detect(&batch, &params)?;
            passes.fetch_add(1, Ordering::Relaxed);
            Ok::<Detection, crate::error::DetectionError>(detection)
        }));
    }

    let joined = futures::future::join_all(handles).await;

    let mut per_algorithm = Vec::with_capacity(joined.len());
    for (spec, result) in strategy.algorithms.iter().zip(joined) {
        let detection = result.map_err(|e| EngineError::Task(e.to_string()))??;
        per_algorithm.push(AlgorithmResult {
            algorithm: spec.algorithm.clone(),
            detection,
        });
    }

    let aggregates = aggregate(strategy, &batch, &per_algorithm);
    let flags: Vec<RuleFlag> = per_algorithm
        .iter()
        .flat_map(|r| r.detection.flags.iter().cloned())
        .collect();

    Ok(EngineOutput {
        aggregates,
        per_algorithm,
        flags,
    })
}

fn aggregate(
    strategy: &Strategy,
    batch: &TransformedBatch,
    results: &[AlgorithmResult],
) -> Vec<TransactionScore> {
    // Index each algorithm's scores by transaction for O(1) fan-in lookup.
    let indexed: Vec<HashMap<&str, &TransactionScore>> = results
        .iter()
        .map(|r| {
            r.detection
                .scores
                .iter()
                .map(|s| (s.transaction_id.as_str(), s))
                .collect()
        })
        .collect();

    let overridden: HashSet<&str> = results
        .iter()
        .flat_map(|r| r.detection.flags.iter())
        .filter(|f| f.triggered)
        .map(|f| f.transaction_id.as_str())
        .collect();

    let mut tx_ids: Vec<&str> = batch.transactions.iter().map(|t| t.id.as_str()).collect();
    // Deterministic output order; downstream ranking ties break on id.
    tx_ids.sort_unstable();

    let mut aggregates = Vec::with_capacity(tx_ids.len());
    for tx_id in tx_ids {
        let mut entries = Vec::with_capacity(strategy.algorithms.len());
        let mut score_detail = serde_json::Map::new();

        for (spec, scores) in strategy.algorithms.iter().zip(&indexed) {
            let (score, confidence) = scores
                .get(tx_id)
                .map(|s| (s.score, s.confidence))
                .unwrap_or((0.0, None));
            score_detail.insert(spec.algorithm.clone(), JsonValue::from(score));
            entries.push(ScoreEntry {
                score,
                confidence,
                weight: spec.weight,
                trigger_threshold: spec.trigger_threshold(),
            });
        }

        let rule_override = overridden.contains(tx_id);
        let score = if rule_override {
            // A triggered business rule is never diluted by statistical
            // disagreement.
            1.0
        } else {
            combine(strategy.policy, &entries)
        };

        let confidence = if rule_override {
            Some(1.0)
        } else {
            mean_confidence(&entries)
        };

        aggregates.push(TransactionScore {
            transaction_id: tx_id.to_string(),
            score,
            confidence,
            metadata: serde_json::json!({
                "policy": strategy.policy.as_str(),
                "scores": JsonValue::Object(score_detail),
                "rule_override": rule_override,
            }),
        });
    }

    aggregates
}

struct ScoreEntry {
    score: f64,
    confidence: Option<f64>,
    weight: f64,
    trigger_threshold: f64,
}

/// Apply one combination policy to a transaction's per-algorithm scores.
/// The result always lands in [0, 1].
fn combine(policy: CombinationPolicy, entries: &[ScoreEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    match policy {
        CombinationPolicy::Max => entries
            .iter()
            .map(|e| e.weight * e.score)
            .fold(0.0, f64::max)
            .clamp(0.0, 1.0),
        CombinationPolicy::WeightedAverage => {
            let total_weight: f64 = entries.iter().map(|e| e.weight).sum();
            if total_weight == 0.0 {
                // Rejected at validation time; degenerate fallback.
                return 0.0;
            }
            let weighted: f64 = entries.iter().map(|e| e.weight * e.score).sum();
            (weighted / total_weight).clamp(0.0, 1.0)
        }
        CombinationPolicy::Vote => {
            let votes = entries
                .iter()
                .filter(|e| e.score >= e.trigger_threshold)
                .count();
            votes as f64 / entries.len() as f64
        }
    }
}

fn mean_confidence(entries: &[ScoreEntry]) -> Option<f64> {
    let known: Vec<f64> = entries.iter().filter_map(|e| e.confidence).collect();
    if known.is_empty() {
        None
    } else {
        Some(known.iter().sum::<f64>() / known.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{AlgorithmSpec, CombinationPolicy};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn entry(score: f64, weight: f64) -> ScoreEntry {
        ScoreEntry {
            score,
            confidence: Some(score),
            weight,
            trigger_threshold: 0.5,
        }
    }

    #[test]
    fn test_weighted_average_matches_formula() {
        let entries = vec![entry(0.8, 2.0), entry(0.2, 1.0), entry(0.5, 1.0)];
        let expected = (2.0 * 0.8 + 0.2 + 0.5) / 4.0;
        let got = combine(CombinationPolicy::WeightedAverage, &entries);
        assert!((got - expected).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&got));
    }

    #[test]
    fn test_max_policy_clamps_to_unit_range() {
        let entries = vec![entry(0.9, 2.0), entry(0.1, 1.0)];
        assert_eq!(combine(CombinationPolicy::Max, &entries), 1.0);

        let entries = vec![entry(0.3, 1.0), entry(0.6, 0.5)];
        assert!((combine(CombinationPolicy::Max, &entries) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_vote_policy_counts_per_algorithm_thresholds() {
        let entries = vec![
            ScoreEntry { score: 0.6, confidence: None, weight: 1.0, trigger_threshold: 0.5 },
            ScoreEntry { score: 0.4, confidence: None, weight: 1.0, trigger_threshold: 0.5 },
            ScoreEntry { score: 0.3, confidence: None, weight: 1.0, trigger_threshold: 0.2 },
            ScoreEntry { score: 0.9, confidence: None, weight: 1.0, trigger_threshold: 0.95 },
        ];
        let got = combine(CombinationPolicy::Vote, &entries);
        assert!((got - 0.5).abs() < 1e-12);
    }

    fn weekend_batch() -> Arc<TransformedBatch> {
        // Saturday 2024-03-09: one large weekend transaction among quiet
        // weekday activity on the same account.
        let mk = |id: &str, day: u32, sequence: u32, amount: f64| {
            let occurred_at = Utc.with_ymd_and_hms(2024, 3, day, 10, 0, 0).unwrap();
            let day_of_week = chrono::Datelike::weekday(&occurred_at);
            crate::batch::Transaction {
                id: id.to_string(),
                account_id: "acct-1".to_string(),
                amount,
                magnitude: amount.abs(),
                currency: None,
                occurred_at,
                day_of_week,
                hour_of_day: 10,
                is_weekend: matches!(day_of_week, chrono::Weekday::Sat | chrono::Weekday::Sun),
                account_sequence: sequence,
                hours_since_prev: (sequence > 1).then_some(24.0),
                payload: JsonValue::Null,
            }
        };
        Arc::new(TransformedBatch {
            batch_id: Uuid::nil(),
            transactions: vec![
                mk("t-1", 4, 1, 100.0),
                mk("t-2", 5, 2, 110.0),
                mk("t-3", 6, 3, 95.0),
                mk("t-4", 9, 4, 5000.0), // Saturday, large
            ],
            excluded: Vec::new(),
        })
    }

    fn strategy_with(policy: CombinationPolicy) -> Strategy {
        Strategy {
            id: Uuid::nil(),
            name: "test".to_string(),
            version: 1,
            algorithms: vec![
                AlgorithmSpec {
                    algorithm: "zscore".to_string(),
                    params: serde_json::json!({ "threshold": 3.0, "min_samples": 2 }),
                    weight: 1.0,
                },
                AlgorithmSpec {
                    algorithm: "weekend_threshold".to_string(),
                    params: serde_json::json!({ "amount_threshold": 1000.0 }),
                    weight: 1.0,
                },
            ],
            policy,
            active: true,
            anomaly_threshold: 0.7,
        }
    }

    #[tokio::test]
    async fn test_rule_override_forces_aggregate_to_one_under_every_policy() {
        let registry = AlgorithmRegistry::builtin();
        let batch = weekend_batch();

        for policy in [
            CombinationPolicy::Max,
            CombinationPolicy::WeightedAverage,
            CombinationPolicy::Vote,
        ] {
            let output = execute_strategy(
                &registry,
                &strategy_with(policy),
                Arc::clone(&batch),
                Arc::new(AtomicU64::new(0)),
            )
            .await
            .unwrap();

            let flagged = output
                .aggregates
                .iter()
                .find(|s| s.transaction_id == "t-4")
                .unwrap();
            assert_eq!(flagged.score, 1.0, "policy {:?}", policy);
            assert_eq!(flagged.metadata["rule_override"], true);
        }
    }

    #[tokio::test]
    async fn test_one_aggregate_per_transaction_in_id_order() {
        let registry = AlgorithmRegistry::builtin();
        let batch = weekend_batch();
        let output = execute_strategy(
            &registry,
            &strategy_with(CombinationPolicy::WeightedAverage),
            Arc::clone(&batch),
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();

        let ids: Vec<_> = output
            .aggregates
            .iter()
            .map(|s| s.transaction_id.as_str())
            .collect();
        assert_eq!(ids, vec!["t-1", "t-2", "t-3", "t-4"]);
        for score in &output.aggregates {
            assert!((0.0..=1.0).contains(&score.score));
        }
    }

    #[tokio::test]
    async fn test_engine_output_is_deterministic() {
        let registry = AlgorithmRegistry::builtin();
        let batch = weekend_batch();
        let strategy = strategy_with(CombinationPolicy::Max);

        let first = execute_strategy(
            &registry,
            &strategy,
            Arc::clone(&batch),
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();
        let second = execute_strategy(
            &registry,
            &strategy,
            Arc::clone(&batch),
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();

        assert_eq!(first.aggregates, second.aggregates);
        assert_eq!(first.flags, second.flags);
    }

    #[tokio::test]
    async fn test_progress_counter_tracks_completed_passes() {
        let registry = AlgorithmRegistry::builtin();
        let passes = Arc::new(AtomicU64::new(0));
        execute_strategy(
            &registry,
            &strategy_with(CombinationPolicy::Max),
            weekend_batch(),
            Arc::clone(&passes),
        )
        .await
        .unwrap();
        assert_eq!(passes.load(Ordering::Relaxed), 2);
    }
}
