//! Trading model: one configured strategy instance with its own oracle
//! credentials, capital and ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A registered trading model as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradingModel {
    pub id: i64,

    /// Display name shown on the leaderboard
    pub name: String,

    /// Decision oracle API key
    pub api_key: String,

    /// Decision oracle base URL (OpenAI-compatible)
    pub api_url: String,

    /// Model identifier sent to the decision oracle
    pub model_name: String,

    /// Simulated starting capital in USD
    pub initial_capital: f64,

    pub created_at: String,
}

impl TradingModel {
    /// Initial capital as a decimal for engine arithmetic.
    pub fn capital(&self) -> Decimal {
        Decimal::try_from(self.initial_capital).unwrap_or(Decimal::ZERO)
    }
}
