//! Typed rejection kinds returned by the market engine.
//!
//! Every validation failure is detected before any write; only the two
//! store kinds are safe to retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market `{0}` not found")]
    MarketNotFound(String),

    #[error("market `{0}` already exists")]
    MarketExists(String),

    #[error("market `{0}` is already resolved")]
    MarketAlreadyResolved(String),

    #[error("market `{0}` has not been resolved")]
    MarketStillOpen(String),

    #[error("amount must be positive and finite")]
    InvalidAmount,

    #[error("percent must be in (0, 100]")]
    InvalidPercent,

    #[error("insufficient cash balance")]
    InsufficientCash,

    #[error("insufficient shares held")]
    InsufficientShares,

    #[error("admin privileges required")]
    Unauthorized,

    #[error("concurrent write detected")]
    StoreConflict,

    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    /// Stable machine-readable kind for the outbound result shape.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::MarketNotFound(_) => "market_not_found",
            EngineError::MarketExists(_) => "market_exists",
            EngineError::MarketAlreadyResolved(_) => "market_already_resolved",
            EngineError::MarketStillOpen(_) => "market_still_open",
            EngineError::InvalidAmount => "invalid_amount",
            EngineError::InvalidPercent => "invalid_percent",
            EngineError::InsufficientCash => "insufficient_cash",
            EngineError::InsufficientShares => "insufficient_shares",
            EngineError::Unauthorized => "unauthorized",
            EngineError::StoreConflict => "store_conflict",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Whether the caller may retry the whole operation. A retryable error
    /// guarantees no side effect was committed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreConflict | EngineError::StoreUnavailable(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
