//! Per-model trading cycle: valuate, decide, execute, snapshot.
//!
//! One `ModelEngine` exists per registered model and owns the model's
//! execution lock. At most one cycle is in flight per model; a racing
//! trigger gets `ConcurrentExecution` immediately instead of waiting.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{TradeSignal, TradingModel};
use crate::oracle::{build_prompt, parse_decision, Decision, DecisionProvider, PriceProvider};

use super::executor::{ExecutionReport, TradeExecutor};
use super::valuer::PortfolioValuer;

/// Result of one full cycle.
///
/// `success` is false only when a step outside per-coin execution failed
/// (valuation, decision transport, snapshot persistence); individual coin
/// rejections live in `executions`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub success: bool,
    pub executions: Vec<ExecutionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleReport {
    fn completed(executions: Vec<ExecutionReport>) -> Self {
        Self {
            success: true,
            executions,
            error: None,
        }
    }

    fn failed(executions: Vec<ExecutionReport>, error: String) -> Self {
        Self {
            success: false,
            executions,
            error: Some(error),
        }
    }
}

/// Engine state for one registered model.
pub struct ModelEngine {
    model_id: i64,
    db: Arc<Database>,
    prices: Arc<dyn PriceProvider>,
    decider: RwLock<Arc<dyn DecisionProvider>>,
    valuer: PortfolioValuer,
    executor: TradeExecutor,
    coins: Vec<String>,
    history_limit: i64,
    lock: Mutex<()>,
}

impl ModelEngine {
    pub fn new(
        model_id: i64,
        db: Arc<Database>,
        prices: Arc<dyn PriceProvider>,
        decider: Arc<dyn DecisionProvider>,
        coins: Vec<String>,
        history_limit: i64,
    ) -> Self {
        Self {
            model_id,
            db: db.clone(),
            prices,
            decider: RwLock::new(decider),
            valuer: PortfolioValuer::new(db.clone()),
            executor: TradeExecutor::new(db),
            coins,
            history_limit,
            lock: Mutex::new(()),
        }
    }

    pub fn model_id(&self) -> i64 {
        self.model_id
    }

    /// Swap the decision client after a credential edit. The execution
    /// lock stays with the engine, so the single-flight guarantee
    /// survives live updates.
    pub async fn set_decider(&self, decider: Arc<dyn DecisionProvider>) {
        *self.decider.write().await = decider;
    }

    /// Run one full trading cycle.
    ///
    /// Returns `ConcurrentExecution` without blocking when a cycle is
    /// already in flight, and `NotFound` when the model was deleted.
    pub async fn run_cycle(&self) -> Result<CycleReport, EngineError> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| EngineError::ConcurrentExecution)?;

        let cycle_id = Uuid::new_v4();
        debug!(model_id = self.model_id, cycle = %cycle_id, "Cycle started");

        let model = self
            .db
            .get_model(self.model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("model {}", self.model_id)))?;

        // 1. Current prices for the coin universe
        let prices = match self.prices.current_prices(&self.coins).await {
            Ok(prices) => prices,
            Err(e) => return Ok(CycleReport::failed(vec![], format!("price oracle: {e}"))),
        };

        // 2. Pre-trade valuation
        let account = match self.valuer.valuate(self.model_id, &prices).await {
            Ok(account) => account,
            Err(e) => return Ok(CycleReport::failed(vec![], format!("valuation: {e}"))),
        };

        // 3. Ask the decision oracle; the conversation is persisted even
        //    when the response turns out to be malformed.
        let history = self
            .db
            .list_conversations(self.model_id, self.history_limit)
            .await
            .unwrap_or_default();
        let prompt = build_prompt(&account, &prices, &history, &self.coins);

        // Clone the client out so a credential edit is not blocked for the
        // duration of the oracle call.
        let decider = self.decider.read().await.clone();
        let raw = match decider.decide(&prompt).await {
            Ok(raw) => raw,
            Err(e) => return Ok(CycleReport::failed(vec![], format!("decision oracle: {e}"))),
        };

        let decision = parse_decision(&raw);
        if decision.is_none() {
            warn!(model_id = self.model_id, "Decision response could not be parsed, holding all coins");
        }

        let trace = decision
            .as_ref()
            .map(|d| d.rationale.clone())
            .unwrap_or_default();
        if let Err(e) = self
            .db
            .append_conversation(self.model_id, &prompt, &raw, &trace)
            .await
        {
            return Ok(CycleReport::failed(
                vec![],
                format!("conversation persistence: {e}"),
            ));
        }

        // 4. Apply each coin independently; one rejection never blocks
        //    the rest of the universe.
        let mut executions = Vec::with_capacity(self.coins.len());
        for coin in &self.coins {
            match self
                .apply_coin(&model, coin, decision.as_ref(), &prices)
                .await
            {
                Ok(report) => executions.push(report),
                Err(e) => {
                    // Persistence failures abort the cycle for this model.
                    return Ok(CycleReport::failed(
                        executions,
                        format!("execution persistence on {coin}: {e}"),
                    ));
                }
            }
        }

        // 5. Post-trade snapshot
        let post = match self.valuer.valuate(self.model_id, &prices).await {
            Ok(post) => post,
            Err(e) => {
                return Ok(CycleReport::failed(executions, format!("post-trade valuation: {e}")))
            }
        };
        if let Err(e) = self
            .db
            .append_snapshot(
                self.model_id,
                post.total_value.to_f64().unwrap_or(0.0),
                post.cash.to_f64().unwrap_or(0.0),
                post.positions_value.to_f64().unwrap_or(0.0),
            )
            .await
        {
            return Ok(CycleReport::failed(executions, format!("snapshot persistence: {e}")));
        }

        info!(
            model_id = self.model_id,
            cycle = %cycle_id,
            total_value = %post.total_value.round_dp(2),
            "Cycle completed"
        );
        Ok(CycleReport::completed(executions))
    }

    /// Resolve one coin's decision and apply it, mapping per-coin
    /// rejections into the coin's report. Only infrastructure errors
    /// bubble up.
    async fn apply_coin(
        &self,
        model: &TradingModel,
        coin: &str,
        decision: Option<&Decision>,
        prices: &HashMap<String, Decimal>,
    ) -> Result<ExecutionReport, EngineError> {
        let Some(decision) = decision else {
            return Ok(ExecutionReport::rejected(
                coin,
                TradeSignal::Hold,
                "oracle error: unparseable decision response, holding".to_string(),
            ));
        };

        let Some(coin_decision) = decision.signals.get(coin) else {
            return Ok(ExecutionReport::ok(
                coin,
                TradeSignal::Hold,
                "no signal for this coin, holding".to_string(),
            ));
        };

        let signal = coin_decision.signal;
        if signal == TradeSignal::Hold {
            return Ok(ExecutionReport::ok(coin, signal, "holding".to_string()));
        }

        let Some(price) = prices.get(coin).copied() else {
            return Ok(ExecutionReport::rejected(
                coin,
                TradeSignal::Hold,
                format!("oracle error: no market price for {coin}, holding"),
            ));
        };

        let quantity = coin_decision.quantity.unwrap_or(Decimal::ZERO);
        let leverage = coin_decision.leverage.unwrap_or(1);

        match self
            .executor
            .apply(model, coin, signal, quantity, leverage, price)
            .await
        {
            Ok(report) => Ok(report),
            Err(EngineError::Persistence(e)) => Err(EngineError::Persistence(e)),
            Err(e @ (EngineError::Margin(_)
            | EngineError::NotFound(_)
            | EngineError::Validation(_))) => {
                debug!(model_id = model.id, coin = coin, error = %e, "Signal rejected");
                Ok(ExecutionReport::rejected(coin, signal, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::PositionSide;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct StaticPrices(HashMap<String, Decimal>);

    #[async_trait]
    impl PriceProvider for StaticPrices {
        async fn current_prices(
            &self,
            _coins: &[String],
        ) -> Result<HashMap<String, Decimal>, EngineError> {
            Ok(self.0.clone())
        }
    }

    /// Scripted decider: returns a fixed response, optionally slowly.
    struct ScriptedDecider {
        response: String,
        delay: Duration,
    }

    impl ScriptedDecider {
        fn fast(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.to_string(),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl DecisionProvider for ScriptedDecider {
        async fn decide(&self, _prompt: &str) -> Result<String, EngineError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.response.clone())
        }
    }

    async fn setup(decider: Arc<dyn DecisionProvider>) -> (Arc<Database>, Arc<ModelEngine>) {
        let db = Arc::new(db::memory().await);
        let id = db
            .insert_model("alpha", "sk-test", "https://api.test/v1", "test-model", 100000.0)
            .await
            .unwrap();

        let prices = Arc::new(StaticPrices(HashMap::from([
            ("BTC".to_string(), dec!(50000)),
            ("ETH".to_string(), dec!(3000)),
        ])));

        let engine = Arc::new(ModelEngine::new(
            id,
            db.clone(),
            prices,
            decider,
            vec!["BTC".to_string(), "ETH".to_string()],
            5,
        ));
        (db, engine)
    }

    #[tokio::test]
    async fn test_cycle_opens_position_and_snapshots() {
        let decider = ScriptedDecider::fast(
            r#"{"rationale": "btc up", "signals": {"BTC": {"signal": "open_long", "quantity": 1, "leverage": 2}, "ETH": {"signal": "hold"}}}"#,
        );
        let (db, engine) = setup(decider).await;

        let report = engine.run_cycle().await.unwrap();
        assert!(report.success);
        assert_eq!(report.executions.len(), 2);
        assert!(report.executions.iter().all(|e| e.success));

        let positions = db.get_positions(engine.model_id()).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);

        // One conversation and one snapshot per completed cycle
        assert_eq!(db.list_conversations(engine.model_id(), 10).await.unwrap().len(), 1);
        assert_eq!(db.list_snapshots(engine.model_id(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_decision_degrades_to_hold() {
        let decider = ScriptedDecider::fast("I would buy everything right now!!");
        let (db, engine) = setup(decider).await;

        let report = engine.run_cycle().await.unwrap();

        // Decision infrastructure worked; the content did not.
        assert!(report.success);
        assert!(report
            .executions
            .iter()
            .all(|e| e.signal == TradeSignal::Hold && !e.success));
        assert!(db.get_positions(engine.model_id()).await.unwrap().is_empty());

        // The malformed exchange is still persisted
        let conversations = db.list_conversations(engine.model_id(), 10).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert!(conversations[0].ai_response.contains("buy everything"));
    }

    #[tokio::test]
    async fn test_margin_rejection_degrades_one_coin_only() {
        let decider = ScriptedDecider::fast(
            r#"{"rationale": "size up", "signals": {"BTC": {"signal": "open_long", "quantity": 100, "leverage": 1}, "ETH": {"signal": "open_long", "quantity": 1, "leverage": 1}}}"#,
        );
        let (db, engine) = setup(decider).await;

        let report = engine.run_cycle().await.unwrap();
        assert!(report.success);

        let btc = report.executions.iter().find(|e| e.coin == "BTC").unwrap();
        assert!(!btc.success);
        assert!(btc.message.contains("margin"));

        let eth = report.executions.iter().find(|e| e.coin == "ETH").unwrap();
        assert!(eth.success);

        let positions = db.get_positions(engine.model_id()).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].coin, "ETH");
    }

    #[tokio::test]
    async fn test_missing_price_holds_that_coin() {
        let decider = ScriptedDecider::fast(
            r#"{"rationale": "sol looks good", "signals": {"SOL": {"signal": "open_long", "quantity": 10, "leverage": 1}}}"#,
        );
        let db = Arc::new(db::memory().await);
        let id = db
            .insert_model("alpha", "sk-test", "https://api.test/v1", "test-model", 100000.0)
            .await
            .unwrap();

        // SOL missing from the price set
        let prices = Arc::new(StaticPrices(HashMap::from([(
            "BTC".to_string(),
            dec!(50000),
        )])));
        let engine = ModelEngine::new(
            id,
            db.clone(),
            prices,
            decider,
            vec!["SOL".to_string()],
            5,
        );

        let report = engine.run_cycle().await.unwrap();
        assert!(report.success);
        assert!(!report.executions[0].success);
        assert!(report.executions[0].message.contains("no market price"));
        assert!(db.get_positions(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_produce_one_winner_and_no_duplicate_trades() {
        let decider = Arc::new(ScriptedDecider {
            response: r#"{"rationale": "btc up", "signals": {"BTC": {"signal": "open_long", "quantity": 1, "leverage": 2}}}"#
                .to_string(),
            delay: Duration::from_millis(100),
        });
        let (db, engine) = setup(decider).await;

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_cycle().await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move {
                // Give the first run time to take the lock
                tokio::time::sleep(Duration::from_millis(20)).await;
                engine.run_cycle().await
            }
        });

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        let (winner, loser) = if first.is_ok() {
            (first, second)
        } else {
            (second, first)
        };
        assert!(winner.unwrap().success);
        assert!(matches!(loser.unwrap_err(), EngineError::ConcurrentExecution));

        // Exactly one open_long trade row, never duplicated
        let trades = db.list_trades(engine.model_id(), 10).await.unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_model_is_not_found() {
        let decider = ScriptedDecider::fast(r#"{"rationale": "", "signals": {}}"#);
        let (db, engine) = setup(decider).await;

        db.delete_model(engine.model_id()).await.unwrap();

        let err = engine.run_cycle().await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
