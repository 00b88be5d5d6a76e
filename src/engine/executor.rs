//! Trade execution: applies one validated signal to the position book and
//! appends the resulting trade rows.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::db::{Database, NewTrade, PositionChange};
use crate::error::EngineError;
use crate::models::{Position, TradeSignal, TradingModel};

/// Outcome of applying one signal to one coin.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub coin: String,
    pub signal: TradeSignal,
    pub message: String,
    pub success: bool,
}

impl ExecutionReport {
    pub fn ok(coin: &str, signal: TradeSignal, message: String) -> Self {
        Self {
            coin: coin.to_string(),
            signal,
            message,
            success: true,
        }
    }

    pub fn rejected(coin: &str, signal: TradeSignal, message: String) -> Self {
        Self {
            coin: coin.to_string(),
            signal,
            message,
            success: false,
        }
    }
}

/// Applies signals to a model's position book.
///
/// Each non-hold application commits its position mutation and trade
/// row(s) in a single transaction; a failed persistence leaves the book
/// untouched.
pub struct TradeExecutor {
    db: Arc<Database>,
}

impl TradeExecutor {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Apply one signal at the given execution price.
    ///
    /// `Margin`, `NotFound` and `Validation` errors describe per-coin
    /// rejections the cycle reports and moves past; `Persistence` errors
    /// are infrastructure failures.
    pub async fn apply(
        &self,
        model: &TradingModel,
        coin: &str,
        signal: TradeSignal,
        quantity: Decimal,
        leverage: u32,
        price: Decimal,
    ) -> Result<ExecutionReport, EngineError> {
        match signal {
            TradeSignal::Hold => Ok(ExecutionReport::ok(
                coin,
                signal,
                "holding, no action taken".to_string(),
            )),
            TradeSignal::OpenLong | TradeSignal::OpenShort => {
                self.open(model, coin, signal, quantity, leverage, price).await
            }
            TradeSignal::CloseLong | TradeSignal::CloseShort => {
                self.close(model, coin, signal, quantity, price).await
            }
        }
    }

    async fn open(
        &self,
        model: &TradingModel,
        coin: &str,
        signal: TradeSignal,
        quantity: Decimal,
        leverage: u32,
        price: Decimal,
    ) -> Result<ExecutionReport, EngineError> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "open quantity must be positive, got {quantity}"
            )));
        }
        if leverage < 1 {
            return Err(EngineError::Validation(
                "leverage must be at least 1".to_string(),
            ));
        }
        if price <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "execution price must be positive, got {price}"
            )));
        }

        let side = signal.side().expect("open signal has a side");
        let book = self.db.get_positions(model.id).await?;
        let mut realized_pnl = self.db.sum_realized_pnl(model.id).await?;
        let mut margin_used: Decimal = book.iter().map(Position::margin).sum();

        let mut changes = Vec::new();
        let mut trades = Vec::new();
        let mut flip_pnl = None;

        // Opposite-side exposure flips: close it fully, then open.
        if let Some(opposite) = book
            .iter()
            .find(|p| p.coin == coin && p.side == side.opposite())
        {
            let mut closing = opposite.clone();
            let closed_qty = closing.quantity;
            margin_used -= closing.margin();

            let pnl = closing.reduce(closed_qty, price);
            realized_pnl += pnl;
            flip_pnl = Some(pnl);

            changes.push(PositionChange::Remove {
                coin: coin.to_string(),
                side: closing.side,
            });
            trades.push(NewTrade {
                coin: coin.to_string(),
                signal: TradeSignal::closing(closing.side),
                quantity: closed_qty,
                price,
                leverage: closing.leverage,
                side: closing.side,
                pnl,
            });
        }

        let existing = book.iter().find(|p| p.coin == coin && p.side == side);
        let (updated, added) = match existing {
            Some(current) => {
                let mut merged = current.clone();
                margin_used -= merged.margin();
                merged.add(quantity, price);
                merged.leverage = leverage.max(1);
                (merged, true)
            }
            None => (
                Position::new(coin.to_string(), side, quantity, price, leverage),
                false,
            ),
        };

        // Available cash check: margin after the open must stay within
        // initial capital plus realized PnL.
        let margin_after = margin_used + updated.margin();
        let available = model.capital() + realized_pnl;
        if margin_after > available {
            return Err(EngineError::Margin(format!(
                "open {side} {quantity} {coin} needs {margin} margin, total {margin_after} exceeds available {available}",
                margin = updated.margin().round_dp(2),
                margin_after = margin_after.round_dp(2),
                available = available.round_dp(2),
            )));
        }

        changes.push(PositionChange::Upsert {
            coin: coin.to_string(),
            side,
            quantity: updated.quantity,
            avg_price: updated.avg_price,
            leverage: updated.leverage,
        });
        trades.push(NewTrade {
            coin: coin.to_string(),
            signal,
            quantity,
            price,
            leverage: updated.leverage,
            side,
            pnl: Decimal::ZERO,
        });

        self.db.record_execution(model.id, &changes, &trades).await?;

        let message = match (flip_pnl, added) {
            (Some(pnl), _) => format!(
                "flipped to {side}: closed opposite side for {pnl} pnl, opened {quantity} {coin} @ {price} x{leverage}",
                pnl = pnl.round_dp(2),
            ),
            (None, true) => format!(
                "added {quantity} {coin} to {side} @ {price}, new avg {avg}",
                avg = updated.avg_price.round_dp(2),
            ),
            (None, false) => {
                format!("opened {side} {quantity} {coin} @ {price} x{leverage}")
            }
        };

        info!(model_id = model.id, coin = coin, signal = %signal, %message, "Trade executed");
        Ok(ExecutionReport::ok(coin, signal, message))
    }

    async fn close(
        &self,
        model: &TradingModel,
        coin: &str,
        signal: TradeSignal,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<ExecutionReport, EngineError> {
        if price <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "execution price must be positive, got {price}"
            )));
        }

        let side = signal.side().expect("close signal has a side");
        let mut position = self
            .db
            .get_position(model.id, coin, side)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("no open {side} position for {coin}"))
            })?;

        // A non-positive or omitted quantity closes the whole position.
        let requested = if quantity > Decimal::ZERO {
            quantity.min(position.quantity)
        } else {
            position.quantity
        };

        let leverage = position.leverage;
        let pnl = position.reduce(requested, price);

        let change = if position.is_closed() {
            PositionChange::Remove {
                coin: coin.to_string(),
                side,
            }
        } else {
            PositionChange::Upsert {
                coin: coin.to_string(),
                side,
                quantity: position.quantity,
                avg_price: position.avg_price,
                leverage,
            }
        };

        self.db
            .record_execution(
                model.id,
                &[change],
                &[NewTrade {
                    coin: coin.to_string(),
                    signal,
                    quantity: requested,
                    price,
                    leverage,
                    side,
                    pnl,
                }],
            )
            .await?;

        let message = if position.is_closed() {
            format!(
                "closed {side} {requested} {coin} @ {price}, realized pnl {pnl}",
                pnl = pnl.round_dp(2),
            )
        } else {
            format!(
                "reduced {side} {coin} by {requested} @ {price}, realized pnl {pnl}, {remaining} remaining",
                pnl = pnl.round_dp(2),
                remaining = position.quantity,
            )
        };

        info!(model_id = model.id, coin = coin, signal = %signal, %message, "Trade executed");
        Ok(ExecutionReport::ok(coin, signal, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::PositionSide;
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<Database>, TradingModel, TradeExecutor) {
        let db = Arc::new(db::memory().await);
        let id = db
            .insert_model("alpha", "sk-test", "https://api.test/v1", "test-model", 100000.0)
            .await
            .unwrap();
        let model = db.get_model(id).await.unwrap().unwrap();
        let executor = TradeExecutor::new(db.clone());
        (db, model, executor)
    }

    /// Conservation: cash + margin_used == initial_capital + realized_pnl.
    async fn assert_conservation(db: &Database, model: &TradingModel) {
        let positions = db.get_positions(model.id).await.unwrap();
        let realized = db.sum_realized_pnl(model.id).await.unwrap();
        let margin_used: Decimal = positions.iter().map(Position::margin).sum();
        let cash = model.capital() + realized - margin_used;

        let diff = (cash + margin_used) - (model.capital() + realized);
        assert!(diff.abs() < dec!(0.0001), "conservation violated: {diff}");
    }

    #[tokio::test]
    async fn test_hold_is_a_no_op() {
        let (db, model, executor) = setup().await;

        let report = executor
            .apply(&model, "BTC", TradeSignal::Hold, dec!(0), 1, dec!(50000))
            .await
            .unwrap();

        assert!(report.success);
        assert!(db.get_positions(model.id).await.unwrap().is_empty());
        assert!(db.list_trades(model.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_then_full_close_round_trip() {
        let (db, model, executor) = setup().await;

        // Worked example: 100k capital, 1 BTC @ 50k, leverage 1
        executor
            .apply(&model, "BTC", TradeSignal::OpenLong, dec!(1), 1, dec!(50000))
            .await
            .unwrap();

        let positions = db.get_positions(model.id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].margin(), dec!(50000));
        assert_conservation(&db, &model).await;

        // Close fully at 55k: realized +5000, book empty
        executor
            .apply(&model, "BTC", TradeSignal::CloseLong, dec!(1), 1, dec!(55000))
            .await
            .unwrap();

        assert!(db.get_positions(model.id).await.unwrap().is_empty());
        assert_eq!(db.sum_realized_pnl(model.id).await.unwrap(), dec!(5000));
        assert_conservation(&db, &model).await;

        let trades = db.list_trades(model.id, 10).await.unwrap();
        assert_eq!(trades.len(), 2);
    }

    #[tokio::test]
    async fn test_add_uses_weighted_average() {
        let (db, model, executor) = setup().await;

        executor
            .apply(&model, "ETH", TradeSignal::OpenLong, dec!(10), 2, dec!(3000))
            .await
            .unwrap();
        executor
            .apply(&model, "ETH", TradeSignal::OpenLong, dec!(10), 2, dec!(3500))
            .await
            .unwrap();

        let positions = db.get_positions(model.id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(20));
        // (10*3000 + 10*3500) / 20 = 3250
        assert_eq!(positions[0].avg_price, dec!(3250));
        assert_conservation(&db, &model).await;
    }

    #[tokio::test]
    async fn test_margin_rejection_leaves_ledger_untouched() {
        let (db, model, executor) = setup().await;

        // 3 BTC @ 50000 x1 needs 150k margin against 100k capital
        let err = executor
            .apply(&model, "BTC", TradeSignal::OpenLong, dec!(3), 1, dec!(50000))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Margin(_)));
        assert!(db.get_positions(model.id).await.unwrap().is_empty());
        assert!(db.list_trades(model.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leverage_stretches_available_margin() {
        let (db, model, executor) = setup().await;

        // Same notional as above but x2 leverage only locks 75k
        executor
            .apply(&model, "BTC", TradeSignal::OpenLong, dec!(3), 2, dec!(50000))
            .await
            .unwrap();

        let positions = db.get_positions(model.id).await.unwrap();
        assert_eq!(positions[0].margin(), dec!(75000));
        assert_conservation(&db, &model).await;
    }

    #[tokio::test]
    async fn test_close_without_position_is_not_found() {
        let (db, model, executor) = setup().await;

        let err = executor
            .apply(&model, "DOGE", TradeSignal::CloseShort, dec!(100), 1, dec!(0.1))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(db.list_trades(model.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_caps_at_held_quantity() {
        let (db, model, executor) = setup().await;

        executor
            .apply(&model, "SOL", TradeSignal::OpenShort, dec!(100), 2, dec!(150))
            .await
            .unwrap();

        // Request far more than held: closes exactly the held 100
        executor
            .apply(&model, "SOL", TradeSignal::CloseShort, dec!(500), 2, dec!(140))
            .await
            .unwrap();

        assert!(db.get_positions(model.id).await.unwrap().is_empty());
        // Short: (150 - 140) * 100 = 1000
        assert_eq!(db.sum_realized_pnl(model.id).await.unwrap(), dec!(1000));
        assert_conservation(&db, &model).await;
    }

    #[tokio::test]
    async fn test_zero_quantity_close_closes_everything() {
        let (db, model, executor) = setup().await;

        executor
            .apply(&model, "XRP", TradeSignal::OpenLong, dec!(1000), 1, dec!(2))
            .await
            .unwrap();
        executor
            .apply(&model, "XRP", TradeSignal::CloseLong, dec!(0), 1, dec!(3))
            .await
            .unwrap();

        assert!(db.get_positions(model.id).await.unwrap().is_empty());
        assert_eq!(db.sum_realized_pnl(model.id).await.unwrap(), dec!(1000));
    }

    #[tokio::test]
    async fn test_flip_closes_then_opens_with_two_trades() {
        let (db, model, executor) = setup().await;

        executor
            .apply(&model, "BTC", TradeSignal::OpenLong, dec!(1), 1, dec!(50000))
            .await
            .unwrap();

        // Opposite-side open at 55k: close long (+5000), open short
        let report = executor
            .apply(&model, "BTC", TradeSignal::OpenShort, dec!(2), 2, dec!(55000))
            .await
            .unwrap();
        assert!(report.message.contains("flipped"));

        let positions = db.get_positions(model.id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].quantity, dec!(2));

        assert_eq!(db.sum_realized_pnl(model.id).await.unwrap(), dec!(5000));

        // open_long, then close_long + open_short from the flip
        let trades = db.list_trades(model.id, 10).await.unwrap();
        assert_eq!(trades.len(), 3);
        assert_conservation(&db, &model).await;
    }

    #[tokio::test]
    async fn test_invalid_open_parameters_are_rejected() {
        let (_db, model, executor) = setup().await;

        let err = executor
            .apply(&model, "BTC", TradeSignal::OpenLong, dec!(0), 1, dec!(50000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = executor
            .apply(&model, "BTC", TradeSignal::OpenLong, dec!(1), 0, dec!(50000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
