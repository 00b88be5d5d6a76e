//! Account valuation payloads produced by the portfolio valuer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{Position, PositionSide};

/// One open position marked against the current price set.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub coin: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub leverage: u32,

    /// Mark price, absent when the price oracle omitted the coin
    pub current_price: Option<Decimal>,

    /// Zero when no mark price is available
    pub unrealized_pnl: Decimal,
}

impl PositionView {
    /// Mark a position against an optional current price.
    pub fn mark(position: &Position, current_price: Option<Decimal>) -> Self {
        let unrealized_pnl = current_price
            .map(|mark| position.unrealized_at(mark))
            .unwrap_or(Decimal::ZERO);

        Self {
            coin: position.coin.clone(),
            side: position.side,
            quantity: position.quantity,
            avg_price: position.avg_price,
            leverage: position.leverage,
            current_price,
            unrealized_pnl,
        }
    }
}

/// Full account valuation at one observation point.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub model_id: i64,
    pub as_of: DateTime<Utc>,
    pub cash: Decimal,
    pub margin_used: Decimal,

    /// Entry-basis value of all open positions
    pub positions_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_value: Decimal,
    pub positions: Vec<PositionView>,
}
