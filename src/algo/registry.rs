use std::collections::HashMap;

use crate::algo::{
    correlation::Correlation, isolation_forest::IsolationForest, timeseries::TimeSeries,
    weekend::WeekendThreshold, zscore::ZScore, Algorithm,
};
use crate::error::UnknownAlgorithmError;

type Factory = fn() -> Box<dyn Algorithm>;

/// Process-wide catalog of detection algorithms. Built once at startup and
/// never mutated afterwards, so concurrent runs can resolve algorithms
/// without locking. Factories produce a fresh instance per use since the
/// same identifier may be exercised by several runs at once.
pub struct AlgorithmRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl AlgorithmRegistry {
    /// Registry holding the built-in detectors.
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, Factory> = HashMap::new();
        factories.insert(ZScore::NAME, || Box::new(ZScore));
        factories.insert(Correlation::NAME, || Box::new(Correlation));
        factories.insert(TimeSeries::NAME, || Box::new(TimeSeries));
        factories.insert(IsolationForest::NAME, || Box::new(IsolationForest));
        factories.insert(WeekendThreshold::NAME, || Box::new(WeekendThreshold));
        Self { factories }
    }

    pub fn get(&self, name: &str) -> Result<Box<dyn Algorithm>, UnknownAlgorithmError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| UnknownAlgorithmError(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered identifiers in stable order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
