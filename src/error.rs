use std::time::Duration;

/// Error taxonomy for the engine.
///
/// Each variant carries its own retry policy: `is_retryable` tells the
/// owning loop whether backing off and re-running the cycle can help.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Network-level failure (timeout, connection reset, DNS). Retry with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Exchange asked us to slow down. Retry after the mandated delay.
    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },

    /// Bad or expired credentials. Fatal for the affected symbol loop.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The request itself is malformed. Reject it, log, continue.
    #[error("validation error: {0}")]
    Validation(String),

    /// Exchange rejected the business operation (e.g. insufficient balance).
    /// Abort this attempt, alert, keep the loop alive.
    #[error("exchange rejected request: {0}")]
    ExchangeBusiness(String),

    /// Required market data is missing or too old. Skip the analysis cycle.
    #[error("stale or missing data: {0}")]
    StaleData(String),

    /// Local and exchange state disagree. Exchange wins; log a warning.
    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    /// Streaming transport failed beyond recovery (reconnect budget spent).
    #[error("stream failure: {0}")]
    Stream(String),

    /// Trade ledger could not be written or read.
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotError {
    /// Whether the owning cycle should back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BotError::TransientNetwork(_) | BotError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::TransientNetwork(err.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Validation(format!("bad payload: {err}"))
    }
}
