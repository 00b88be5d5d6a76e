//! Trading engine: valuation, execution and the per-model cycle, plus the
//! process-scoped registry that owns one engine per registered model.

mod cycle;
mod executor;
mod valuer;

pub use cycle::{CycleReport, ModelEngine};
pub use executor::{ExecutionReport, TradeExecutor};
pub use valuer::PortfolioValuer;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::TradingModel;
use crate::oracle::{DecisionClient, DecisionProvider, PriceProvider};

/// Builds a decision client for a model; swapped out in tests.
pub type DeciderFactory = Arc<dyn Fn(&TradingModel) -> Arc<dyn DecisionProvider> + Send + Sync>;

/// Process-scoped registry of model engines.
///
/// The scheduler iterates a point-in-time snapshot while the management
/// surface adds, rebuilds and removes entries concurrently.
pub struct EngineService {
    db: Arc<Database>,
    prices: Arc<dyn PriceProvider>,
    coins: Vec<String>,
    history_limit: i64,
    decider_factory: DeciderFactory,
    engines: RwLock<HashMap<i64, Arc<ModelEngine>>>,
}

impl EngineService {
    pub fn new(db: Arc<Database>, prices: Arc<dyn PriceProvider>, config: &Config) -> Self {
        Self::with_decider_factory(
            db,
            prices,
            config,
            Arc::new(|model: &TradingModel| {
                Arc::new(DecisionClient::for_model(model)) as Arc<dyn DecisionProvider>
            }),
        )
    }

    pub fn with_decider_factory(
        db: Arc<Database>,
        prices: Arc<dyn PriceProvider>,
        config: &Config,
        decider_factory: DeciderFactory,
    ) -> Self {
        Self {
            db,
            prices,
            coins: config.coins.clone(),
            history_limit: config.history_limit as i64,
            decider_factory,
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Create engines for every stored model. Called once at startup.
    pub async fn init_from_store(&self) -> anyhow::Result<usize> {
        let models = self.db.list_models().await?;

        for model in &models {
            self.register(model).await;
            info!(model_id = model.id, name = %model.name, "Engine initialized");
        }

        Ok(models.len())
    }

    /// Register (or replace the decider of) an engine for a model.
    pub async fn register(&self, model: &TradingModel) -> Arc<ModelEngine> {
        let mut engines = self.engines.write().await;

        // An existing engine keeps its execution lock: only the decision
        // client is rebuilt on credential edits.
        if let Some(engine) = engines.get(&model.id) {
            let engine = engine.clone();
            drop(engines);
            engine.set_decider((self.decider_factory)(model)).await;
            return engine;
        }

        let engine = Arc::new(ModelEngine::new(
            model.id,
            self.db.clone(),
            self.prices.clone(),
            (self.decider_factory)(model),
            self.coins.clone(),
            self.history_limit,
        ));
        engines.insert(model.id, engine.clone());
        engine
    }

    /// Drop a model's engine; an in-flight cycle finishes on its own Arc.
    pub async fn deregister(&self, model_id: i64) {
        if self.engines.write().await.remove(&model_id).is_some() {
            info!(model_id, "Engine removed");
        }
    }

    /// Fetch a registered engine.
    pub async fn engine(&self, model_id: i64) -> Option<Arc<ModelEngine>> {
        self.engines.read().await.get(&model_id).cloned()
    }

    /// Fetch an engine, lazily registering one from the store when the
    /// model exists but was never initialized (manual trigger path).
    pub async fn ensure_engine(&self, model_id: i64) -> Result<Arc<ModelEngine>, EngineError> {
        if let Some(engine) = self.engine(model_id).await {
            return Ok(engine);
        }

        let model = self
            .db
            .get_model(model_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("model {model_id}")))?;

        warn!(model_id, "Engine missing for stored model, registering on demand");
        Ok(self.register(&model).await)
    }

    /// Point-in-time snapshot of all engines, ordered by model id so
    /// sweeps are deterministic.
    pub async fn snapshot(&self) -> Vec<Arc<ModelEngine>> {
        let engines = self.engines.read().await;
        let mut all: Vec<_> = engines.values().cloned().collect();
        all.sort_by_key(|engine| engine.model_id());
        all
    }
}
