use thiserror::Error;
use uuid::Uuid;

/// A single invalid algorithm parameter, naming the offending field.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("algorithm '{algorithm}': invalid parameter '{field}': {message}")]
pub struct ConfigurationError {
    pub algorithm: String,
    pub field: String,
    pub message: String,
}

impl ConfigurationError {
    pub fn new(
        algorithm: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            algorithm: algorithm.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Lookup of an algorithm identifier that was never registered.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unknown algorithm '{0}'")]
pub struct UnknownAlgorithmError(pub String);

/// One problem found while validating a strategy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyProblem {
    #[error("strategy has no algorithms configured")]
    EmptyAlgorithmList,
    #[error("strategy is not active")]
    Inactive,
    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithmError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("all algorithm weights are zero under a weighted policy")]
    ZeroWeights,
}

/// Aggregate validation failure. Collects every problem with the strategy,
/// not just the first one encountered.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyValidationError {
    pub problems: Vec<StrategyProblem>,
}

impl std::fmt::Display for StrategyValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "strategy validation failed: ")?;
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for StrategyValidationError {}

/// Batch-level structural failure: a required field is absent on every
/// transaction. Per-row data quality issues are reported as exclusions
/// instead, never as an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("batch contains no transactions")]
    EmptyBatch,
    #[error("field '{field}' is missing on every transaction in the batch ({} rows)", ids.len())]
    MissingEverywhere { field: &'static str, ids: Vec<String> },
}

/// Numerically unusable input that slipped past validation. Degenerate
/// per-group conditions (zero variance) are absorbed inside the algorithm
/// with a fallback score and never produce this error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("algorithm '{algorithm}': {message}")]
pub struct DetectionError {
    pub algorithm: String,
    pub message: String,
}

/// Storage failure, split by whether a retry can help.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure inside the strategy engine's fan-out/fan-in pass.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithmError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("algorithm task panicked: {0}")]
    Task(String),
}

/// Errors surfaced to clients of the orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("strategy {0} not found")]
    StrategyNotFound(Uuid),
    #[error("run {0} is not completed; results are not available")]
    NotReady(Uuid),
    #[error("run {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),
    #[error(transparent)]
    InvalidStrategy(#[from] StrategyValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
