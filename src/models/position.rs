//! Position model: open leveraged exposure to one coin on one side.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Parse the side stored in the ledger; anything unrecognised is long,
    /// matching the storage default.
    pub fn parse(s: &str) -> Self {
        match s {
            "short" => PositionSide::Short,
            _ => PositionSide::Long,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position for one (coin, side) pair of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub side: PositionSide,

    /// Number of coins held; strictly positive while the position exists
    pub quantity: Decimal,

    /// Weighted average entry price
    pub avg_price: Decimal,

    /// Margin multiplier, at least 1
    pub leverage: u32,
}

impl Position {
    pub fn new(
        coin: String,
        side: PositionSide,
        quantity: Decimal,
        avg_price: Decimal,
        leverage: u32,
    ) -> Self {
        Self {
            coin,
            side,
            quantity,
            avg_price,
            leverage: leverage.max(1),
        }
    }

    /// Cash locked by this position: `quantity * avg_price / leverage`.
    pub fn margin(&self) -> Decimal {
        self.quantity * self.avg_price / Decimal::from(self.leverage)
    }

    /// Entry-basis notional value: `quantity * avg_price`.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.avg_price
    }

    /// Add to the position (averaging in).
    pub fn add(&mut self, quantity: Decimal, price: Decimal) {
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.avg_price =
                (self.quantity * self.avg_price + quantity * price) / new_quantity;
        }

        self.quantity = new_quantity;
    }

    /// Reduce the position by up to `quantity` at the given market price.
    ///
    /// Returns the realized PnL for the closed amount, sign-correct per
    /// side. The caller caps the request: at most the held quantity is
    /// closed.
    pub fn reduce(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let closed = quantity.min(self.quantity);
        let realized = match self.side {
            PositionSide::Long => (price - self.avg_price) * closed,
            PositionSide::Short => (self.avg_price - price) * closed,
        };

        self.quantity -= closed;
        realized
    }

    /// Unrealized PnL against the given mark price.
    pub fn unrealized_at(&self, mark: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (mark - self.avg_price) * self.quantity,
            PositionSide::Short => (self.avg_price - mark) * self.quantity,
        }
    }

    /// A position at zero quantity leaves the book.
    pub fn is_closed(&self) -> bool {
        self.quantity <= Decimal::ZERO
    }
}
