use thiserror::Error;

/// Unified error hierarchy for the engine. Every fallible boundary (exchange,
/// provider, store, config, decision parsing) resolves into one of these
/// variants so callers can match on *kind* instead of string content.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    #[error("transient server error ({status}): {body}")]
    Transient5xx { status: u16, body: String },

    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("failed to parse LLM output: {0}")]
    Parse(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("risk check rejected: {0}")]
    RiskRejected(String),

    #[error("exchange rejected order: {0}")]
    ExchangeRejected(String),

    #[error("state I/O error: {0}")]
    StateIo(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("invalid order parameters: {0}")]
    InvalidOrder(String),

    #[error("deadline exceeded")]
    Deadline,
}

impl EngineError {
    /// Retryable with exponential backoff per §4.2/§4.6: network blips, 429s,
    /// and 5xx responses. Everything else is either a hard reject or fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::RateLimited | EngineError::Transient5xx { .. }
        )
    }

    /// Fatal for the whole service once a consecutive-fatal streak is hit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Auth(_) | EngineError::Configuration(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
