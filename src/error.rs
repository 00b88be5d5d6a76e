//! Engine error taxonomy.
//!
//! Every failure class the cycle can produce has its own variant so the
//! orchestrator and the management API can tell expected outcomes (lock
//! contention, margin rejection) apart from infrastructure faults.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed model configuration or trade parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown model or position.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cycle for this model is already in flight.
    #[error("a trading cycle is already running for this model")]
    ConcurrentExecution,

    /// Price/decision provider failure or malformed response.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Requested open exceeds available cash.
    #[error("margin error: {0}")]
    Margin(String),

    /// Ledger store write/read failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}
