use thiserror::Error;

/// Adapter-level error, interpreted by the router's retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Entity or concept absent at this source. Not retryable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network/5xx/timeout. Retryable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Upstream throttled us. Retryable after backoff.
    #[error("rate limited")]
    RateLimited,

    /// Unparseable response. Not retryable.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::RateLimited)
    }
}

/// The full error taxonomy visible to callers of the engine.
///
/// Clone is required so single-flight waiters in the fact store can all
/// receive the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No configured source had data after exhausting the fallback chain.
    #[error("not found: {0}")]
    NotFound(String),

    /// Multiple equally plausible periods, none disambiguable by rule.
    #[error("ambiguous period: {0}")]
    AmbiguousPeriod(String),

    /// Every source's value failed plausibility checks.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// TTM or multi-period KPI without enough historical quarters.
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    /// Division by zero or a missing input in a KPI formula. Propagates
    /// through dependent KPIs.
    #[error("undefined: {0}")]
    Undefined(String),

    /// Transient upstream failure after retries exhausted on all adapters.
    #[error("all sources unavailable: {0}")]
    SourceUnavailable(String),

    /// The caller-supplied request deadline elapsed.
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl EngineError {
    /// Stable machine-readable kind, used for problem-details responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not-found",
            EngineError::AmbiguousPeriod(_) => "ambiguous-period",
            EngineError::ValidationFailed(_) => "validation-failed",
            EngineError::InsufficientHistory(_) => "insufficient-history",
            EngineError::Undefined(_) => "undefined",
            EngineError::SourceUnavailable(_) => "source-unavailable",
            EngineError::DeadlineExceeded => "deadline-exceeded",
        }
    }
}
