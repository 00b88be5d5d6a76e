//! Portfolio valuation: account snapshot from the position book, trade
//! history and current prices.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{AccountSnapshot, Position, PositionView};

/// Computes account snapshots for one observation point.
pub struct PortfolioValuer {
    db: Arc<Database>,
}

impl PortfolioValuer {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Valuate a model against the given price set.
    ///
    /// A coin missing from `prices` contributes zero unrealized PnL and a
    /// `None` mark; it is never an error. Fails with `NotFound` when the
    /// model does not exist.
    pub async fn valuate(
        &self,
        model_id: i64,
        prices: &HashMap<String, Decimal>,
    ) -> Result<AccountSnapshot, EngineError> {
        let model = self
            .db
            .get_model(model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("model {model_id}")))?;

        let positions = self.db.get_positions(model_id).await?;
        let realized_pnl = self.db.sum_realized_pnl(model_id).await?;

        let margin_used: Decimal = positions.iter().map(Position::margin).sum();
        let positions_value: Decimal = positions.iter().map(Position::notional).sum();

        let views: Vec<PositionView> = positions
            .iter()
            .map(|p| PositionView::mark(p, prices.get(&p.coin).copied()))
            .collect();
        let unrealized_pnl: Decimal = views.iter().map(|v| v.unrealized_pnl).sum();

        let capital = model.capital();

        Ok(AccountSnapshot {
            model_id,
            as_of: chrono::Utc::now(),
            cash: capital + realized_pnl - margin_used,
            margin_used,
            positions_value,
            realized_pnl,
            unrealized_pnl,
            total_value: capital + realized_pnl + unrealized_pnl,
            positions: views,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, NewTrade, PositionChange};
    use crate::models::{PositionSide, TradeSignal};
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<Database>, i64) {
        let db = Arc::new(db::memory().await);
        let id = db
            .insert_model("alpha", "sk-test", "https://api.test/v1", "test-model", 100000.0)
            .await
            .unwrap();
        (db, id)
    }

    async fn open_long(db: &Database, id: i64, coin: &str, qty: Decimal, price: Decimal) {
        db.record_execution(
            id,
            &[PositionChange::Upsert {
                coin: coin.to_string(),
                side: PositionSide::Long,
                quantity: qty,
                avg_price: price,
                leverage: 1,
            }],
            &[NewTrade {
                coin: coin.to_string(),
                signal: TradeSignal::OpenLong,
                quantity: qty,
                price,
                leverage: 1,
                side: PositionSide::Long,
                pnl: dec!(0),
            }],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let (db, _) = setup().await;
        let valuer = PortfolioValuer::new(db);

        let err = valuer.valuate(9999, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_book_valuation() {
        let (db, id) = setup().await;
        let valuer = PortfolioValuer::new(db);

        let snapshot = valuer.valuate(id, &HashMap::new()).await.unwrap();
        assert_eq!(snapshot.cash, dec!(100000));
        assert_eq!(snapshot.margin_used, dec!(0));
        assert_eq!(snapshot.total_value, dec!(100000));
        assert!(snapshot.positions.is_empty());
    }

    #[tokio::test]
    async fn test_marked_valuation_matches_worked_example() {
        let (db, id) = setup().await;
        open_long(&db, id, "BTC", dec!(1), dec!(50000)).await;

        let valuer = PortfolioValuer::new(db);
        let prices = HashMap::from([("BTC".to_string(), dec!(55000))]);

        let snapshot = valuer.valuate(id, &prices).await.unwrap();
        assert_eq!(snapshot.margin_used, dec!(50000));
        assert_eq!(snapshot.cash, dec!(50000));
        assert_eq!(snapshot.unrealized_pnl, dec!(5000));
        assert_eq!(snapshot.total_value, dec!(105000));
        assert_eq!(snapshot.positions[0].current_price, Some(dec!(55000)));
    }

    #[tokio::test]
    async fn test_missing_price_is_tolerated() {
        let (db, id) = setup().await;
        open_long(&db, id, "BTC", dec!(1), dec!(50000)).await;
        open_long(&db, id, "ETH", dec!(10), dec!(3000)).await;

        let valuer = PortfolioValuer::new(db);
        // ETH omitted from the price set
        let prices = HashMap::from([("BTC".to_string(), dec!(52000))]);

        let snapshot = valuer.valuate(id, &prices).await.unwrap();
        let eth = snapshot.positions.iter().find(|p| p.coin == "ETH").unwrap();
        assert_eq!(eth.current_price, None);
        assert_eq!(eth.unrealized_pnl, dec!(0));

        let btc = snapshot.positions.iter().find(|p| p.coin == "BTC").unwrap();
        assert_eq!(btc.unrealized_pnl, dec!(2000));
        assert_eq!(snapshot.unrealized_pnl, dec!(2000));
    }
}
