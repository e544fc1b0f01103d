use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::algo::registry::AlgorithmRegistry;
use crate::error::{ConfigurationError, StrategyProblem, StrategyValidationError};

/// How per-algorithm scores are merged into one verdict per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationPolicy {
    /// Maximum of weight x score. Favors sensitivity.
    Max,
    /// Sum(weight x score) / Sum(weight). Smooths disagreement.
    WeightedAverage,
    /// Fraction of algorithms whose score reaches their own trigger
    /// threshold. Useful when algorithms have heterogeneous scales.
    Vote,
}

impl CombinationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::WeightedAverage => "weighted_average",
            Self::Vote => "vote",
        }
    }
}

/// One algorithm slot in a strategy: which detector, its parameters, and
/// the weight its scores carry during combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub algorithm: String,
    #[serde(default = "default_params")]
    pub params: JsonValue,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_params() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

fn default_weight() -> f64 {
    1.0
}

/// A named, versioned detection configuration. Created and edited by an
/// external API; read-only during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub algorithms: Vec<AlgorithmSpec>,
    pub policy: CombinationPolicy,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Aggregate score at or above which a transaction counts as an
    /// anomaly in the run summary.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_anomaly_threshold() -> f64 {
    0.7
}

impl AlgorithmSpec {
    /// Score at or above which this algorithm votes anomalous under the
    /// vote policy.
    pub fn trigger_threshold(&self) -> f64 {
        self.params
            .get("trigger_threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
    }
}

/// Check a strategy against the registry, collecting every problem rather
/// than stopping at the first. A strategy that fails here never reaches a
/// running analysis.
pub fn validate_strategy(
    strategy: &Strategy,
    registry: &AlgorithmRegistry,
) -> Result<(), StrategyValidationError> {
    let mut problems = Vec::new();

    if strategy.algorithms.is_empty() {
        problems.push(StrategyProblem::EmptyAlgorithmList);
    }

    for spec in &strategy.algorithms {
        match registry.get(&spec.algorithm) {
            Err(unknown) => {
                problems.push(StrategyProblem::UnknownAlgorithm(unknown));
                continue;
            }
            Ok(algorithm) => {
                if let Err(config_problem) = algorithm.validate_config(&spec.params) {
                    problems.push(StrategyProblem::Configuration(config_problem));
                }
            }
        }

        if !spec.weight.is_finite() || spec.weight < 0.0 {
            problems.push(StrategyProblem::Configuration(ConfigurationError::new(
                &spec.algorithm,
                "weight",
                "must be a non-negative number",
            )));
        }

        if let Some(threshold) = spec.params.get("trigger_threshold") {
            match threshold.as_f64() {
                Some(t) if (0.0..=1.0).contains(&t) => {}
                _ => problems.push(StrategyProblem::Configuration(ConfigurationError::new(
                    &spec.algorithm,
                    "trigger_threshold",
                    "must be a number in [0, 1]",
                ))),
            }
        }
    }

    if strategy.policy == CombinationPolicy::WeightedAverage
        && !strategy.algorithms.is_empty()
        && strategy.algorithms.iter().all(|s| s.weight == 0.0)
    {
        problems.push(StrategyProblem::ZeroWeights);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(StrategyValidationError { problems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(algorithm: &str, weight: f64) -> AlgorithmSpec {
        AlgorithmSpec {
            algorithm: algorithm.to_string(),
            params: default_params(),
            weight,
        }
    }

    fn strategy(algorithms: Vec<AlgorithmSpec>, policy: CombinationPolicy) -> Strategy {
        Strategy {
            id: Uuid::nil(),
            name: "test".to_string(),
            version: 1,
            algorithms,
            policy,
            active: true,
            anomaly_threshold: 0.7,
        }
    }

    #[test]
    fn test_valid_strategy_passes() {
        let registry = AlgorithmRegistry::builtin();
        let s = strategy(
            vec![spec("zscore", 1.0), spec("weekend_threshold", 0.5)],
            CombinationPolicy::WeightedAverage,
        );
        validate_strategy(&s, &registry).unwrap();
    }

    #[test]
    fn test_empty_algorithm_list_rejected() {
        let registry = AlgorithmRegistry::builtin();
        let err = validate_strategy(&strategy(vec![], CombinationPolicy::Max), &registry)
            .unwrap_err();
        assert_eq!(err.problems, vec![StrategyProblem::EmptyAlgorithmList]);
    }

    #[test]
    fn test_all_problems_reported_at_once() {
        let registry = AlgorithmRegistry::builtin();
        let mut bad_config = spec("zscore", 0.0);
        bad_config.params = serde_json::json!({ "threshold": -2.0 });

        let s = strategy(
            vec![spec("no_such_algo", 1.0), bad_config],
            CombinationPolicy::WeightedAverage,
        );
        let err = validate_strategy(&s, &registry).unwrap_err();

        assert_eq!(err.problems.len(), 2);
        assert!(matches!(
            err.problems[0],
            StrategyProblem::UnknownAlgorithm(_)
        ));
        assert!(matches!(
            err.problems[1],
            StrategyProblem::Configuration(ref c) if c.field == "threshold"
        ));
    }

    #[test]
    fn test_zero_weights_rejected_under_weighted_average() {
        let registry = AlgorithmRegistry::builtin();
        let s = strategy(
            vec![spec("zscore", 0.0), spec("weekend_threshold", 0.0)],
            CombinationPolicy::WeightedAverage,
        );
        let err = validate_strategy(&s, &registry).unwrap_err();
        assert_eq!(err.problems, vec![StrategyProblem::ZeroWeights]);

        // Zero weights are fine under max: the aggregate stays defined.
        let s = strategy(
            vec![spec("zscore", 0.0), spec("weekend_threshold", 0.0)],
            CombinationPolicy::Max,
        );
        validate_strategy(&s, &registry).unwrap();
    }

    #[test]
    fn test_trigger_threshold_out_of_range_rejected() {
        let registry = AlgorithmRegistry::builtin();
        let mut voting = spec("zscore", 1.0);
        voting.params = serde_json::json!({ "trigger_threshold": 1.5 });
        let err = validate_strategy(&strategy(vec![voting], CombinationPolicy::Vote), &registry)
            .unwrap_err();
        assert!(matches!(
            err.problems[0],
            StrategyProblem::Configuration(ref c) if c.field == "trigger_threshold"
        ));
    }

    #[test]
    fn test_policy_serde_round_trip() {
        let json = serde_json::to_string(&CombinationPolicy::WeightedAverage).unwrap();
        assert_eq!(json, "\"weighted_average\"");
        let back: CombinationPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CombinationPolicy::WeightedAverage);
    }
}
