use thiserror::Error;

/// Typed error hierarchy for fundmatch.
///
/// Use at module boundaries (managed client, match engine, RAG, store).
/// Internal/leaf functions can continue using `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum FundmatchError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(
        "request budget exceeded for {model}: {input_tokens} input tokens do not fit under €{budget_eur:.4}"
    )]
    BudgetExceeded {
        model: String,
        input_tokens: u64,
        budget_eur: f64,
    },

    #[error(
        "document budget exceeded for tag '{tag}': €{spent_eur:.4} spent + €{estimate_eur:.4} estimated over cap €{cap_eur:.4}"
    )]
    DocumentBudgetExceeded {
        tag: String,
        spent_eur: f64,
        estimate_eur: f64,
        cap_eur: f64,
    },

    #[error("upstream failure for {model} ({input_tokens} input tokens): {message}")]
    UpstreamFailure {
        model: String,
        input_tokens: u64,
        message: String,
    },

    #[error(
        "structured response from {model} ({input_tokens} in / {output_tokens} out) failed to parse: {message}"
    )]
    ParseFailure {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        message: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `FundmatchError`.
pub type FundmatchResult<T> = std::result::Result<T, FundmatchError>;

impl FundmatchError {
    /// Whether a caller may reasonably retry this error. Budget errors are
    /// deterministic and never retryable; transport failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FundmatchError::UpstreamFailure { .. } | FundmatchError::StoreUnavailable(_)
        )
    }
}
