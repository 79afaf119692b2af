use thiserror::Error;

/// Unified error type for `nlchoice` operations.
#[derive(Debug, Error)]
pub enum ChoiceError {
    /// Raised when a required entity or argument is missing or malformed.
    #[error("invalid argument in {context}: {reason}")]
    InvalidArgument {
        /// Operation that rejected the argument.
        context: &'static str,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Raised when a choice set has no available alternative to evaluate.
    #[error("no available alternatives in choice set for case {case_id}")]
    NoAvailableAlternatives { case_id: u64 },

    /// Raised when the evaluated probability mass is not positive.
    #[error("degenerate choice distribution for case {case_id}: total probability {total}")]
    DegenerateDistribution { case_id: u64, total: f64 },

    /// Raised when an alternative is flagged as chosen while unavailable.
    #[error("alternative {index} is marked chosen but is not available")]
    InconsistentChosenAlternative { index: usize },

    /// Raised when the sampling universe cannot supply the requested draws.
    #[error("sampling universe cannot honor the request: {reason}")]
    InsufficientSampleUniverse { reason: String },

    /// Raised when sampling leaves nothing available, oddball included.
    #[error("no available alternative remains after sampling ({sampled} sampled)")]
    InsufficientAvailableAlternatives { sampled: usize },

    /// Raised when a utility term value is NaN or infinite.
    #[error("utility term for alternative {index}, coefficient {coefficient} is not finite ({value})")]
    NonFiniteUtilityTerm {
        index: usize,
        coefficient: usize,
        value: f64,
    },

    /// Raised when a nest's dissimilarity parameter is missing or outside `(0, 1]`.
    #[error("nest {nest_id} has invalid theta (coefficient {parameter}): {theta}")]
    InvalidTheta {
        nest_id: usize,
        parameter: usize,
        theta: f64,
    },

    /// Raised when a coefficient table fails validation.
    #[error("invalid coefficient table: {reason}")]
    InvalidCoefficients { reason: String },

    /// Raised when provided sizes or indices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// Raised when writing an observation fails at the sink.
    #[error("observation sink failed: {0}")]
    Io(#[from] std::io::Error),

    /// Raised when an observation record cannot be serialized.
    #[error("observation serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChoiceError {
    /// Helper to format an [`InvalidArgument`](ChoiceError::InvalidArgument) error.
    pub fn invalid_argument(context: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            context,
            reason: reason.into(),
        }
    }

    /// Helper to format a [`DimensionMismatch`](ChoiceError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for sampler failures.
    pub fn insufficient_universe(reason: impl Into<String>) -> Self {
        Self::InsufficientSampleUniverse {
            reason: reason.into(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, ChoiceError>;
