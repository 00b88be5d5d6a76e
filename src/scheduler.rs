//! Background trading loop: sweeps every registered model on a fixed
//! cadence and never dies on an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{EngineService, ModelEngine};
use crate::error::EngineError;

/// Loop timing knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between full sweeps
    pub cycle_interval: Duration,

    /// Re-check pause while no models are registered
    pub idle_interval: Duration,

    /// Pause after a loop-level defect before resuming
    pub error_backoff: Duration,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            cycle_interval: config.cycle_interval,
            idle_interval: config.idle_interval,
            error_backoff: config.error_backoff,
        }
    }
}

/// Loop lifecycle states. The shutdown flag is only consulted at sleep
/// boundaries; an in-flight model cycle always finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Sweeping,
    Backoff,
    Stopped,
}

/// Supervised background sweep over all registered models.
pub struct Scheduler {
    service: Arc<EngineService>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(service: Arc<EngineService>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag handle for external shutdown control.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until the shutdown flag is raised. Errors and panics inside a
    /// sweep are logged and absorbed; the loop itself only ever stops on
    /// shutdown.
    pub async fn run(self) {
        info!("Trading loop started");
        let mut state = LoopState::Idle;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                transition(&mut state, LoopState::Stopped);
                break;
            }

            let engines = self.service.snapshot().await;
            if engines.is_empty() {
                transition(&mut state, LoopState::Idle);
                sleep(self.config.idle_interval).await;
                continue;
            }

            transition(&mut state, LoopState::Sweeping);
            info!(models = engines.len(), "Starting sweep");

            match self.sweep(engines).await {
                Ok(()) => {
                    debug!("Sweep completed, sleeping until next cycle");
                    sleep(self.config.cycle_interval).await;
                }
                Err(e) => {
                    transition(&mut state, LoopState::Backoff);
                    error!(error = %e, "Trading loop error, backing off");
                    sleep(self.config.error_backoff).await;
                }
            }
        }

        info!("Trading loop stopped");
    }

    /// Run every engine in the snapshot once, sequentially.
    ///
    /// Expected per-model failures are logged and skipped; only a panic
    /// escaping a cycle (a defect) aborts the sweep and triggers the
    /// loop-level backoff.
    async fn sweep(&self, engines: Vec<Arc<ModelEngine>>) -> anyhow::Result<()> {
        for engine in engines {
            let model_id = engine.model_id();

            // Spawning isolates a panicking cycle from the loop task.
            let outcome = tokio::spawn(async move { engine.run_cycle().await }).await;

            match outcome {
                Ok(Ok(report)) if report.success => {
                    info!(model_id, "Cycle completed");
                    for execution in &report.executions {
                        if execution.signal != crate::models::TradeSignal::Hold {
                            info!(model_id, coin = %execution.coin, message = %execution.message, "Trade");
                        }
                    }
                }
                Ok(Ok(report)) => {
                    warn!(
                        model_id,
                        error = report.error.as_deref().unwrap_or("unknown error"),
                        "Cycle failed"
                    );
                }
                Ok(Err(EngineError::ConcurrentExecution)) => {
                    debug!(model_id, "Cycle already in flight, skipping");
                }
                Ok(Err(EngineError::NotFound(_))) => {
                    // Deleted between snapshot and invocation
                    debug!(model_id, "Model deleted mid-sweep, skipping");
                }
                Ok(Err(e)) => {
                    warn!(model_id, error = %e, "Cycle failed");
                }
                Err(join_error) => {
                    anyhow::bail!("cycle for model {model_id} panicked: {join_error}");
                }
            }
        }

        Ok(())
    }
}

fn transition(state: &mut LoopState, next: LoopState) {
    if *state != next {
        debug!(from = ?state, to = ?next, "Loop state change");
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::TradingModel;
    use crate::oracle::{DecisionProvider, PriceProvider};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct StaticPrices;

    #[async_trait]
    impl PriceProvider for StaticPrices {
        async fn current_prices(
            &self,
            _coins: &[String],
        ) -> Result<HashMap<String, Decimal>, EngineError> {
            Ok(HashMap::from([("BTC".to_string(), dec!(50000))]))
        }
    }

    struct HoldDecider;

    #[async_trait]
    impl DecisionProvider for HoldDecider {
        async fn decide(&self, _prompt: &str) -> Result<String, EngineError> {
            Ok(r#"{"rationale": "wait", "signals": {"BTC": {"signal": "hold"}}}"#.to_string())
        }
    }

    fn test_config() -> crate::config::Config {
        crate::config::Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            cycle_interval: Duration::from_millis(10),
            idle_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            market_api_url: String::new(),
            price_cache: Duration::ZERO,
            coins: vec!["BTC".to_string()],
            history_limit: 5,
        }
    }

    async fn service_with_models(
        count: usize,
    ) -> (Arc<db::Database>, Arc<EngineService>, Vec<TradingModel>) {
        let database = Arc::new(db::memory().await);
        let config = test_config();

        let service = Arc::new(EngineService::with_decider_factory(
            database.clone(),
            Arc::new(StaticPrices),
            &config,
            Arc::new(|_model: &TradingModel| Arc::new(HoldDecider) as Arc<dyn DecisionProvider>),
        ));

        let mut models = Vec::new();
        for i in 0..count {
            let id = database
                .insert_model(
                    &format!("model-{i}"),
                    "sk-test",
                    "https://api.test/v1",
                    "test-model",
                    100000.0,
                )
                .await
                .unwrap();
            let model = database.get_model(id).await.unwrap().unwrap();
            service.register(&model).await;
            models.push(model);
        }

        (database, service, models)
    }

    #[tokio::test]
    async fn test_sweep_runs_every_model() {
        let (database, service, models) = service_with_models(2).await;
        let scheduler = Scheduler::new(service.clone(), SchedulerConfig::from(&test_config()));

        scheduler.sweep(service.snapshot().await).await.unwrap();

        // Every model got a conversation and a snapshot from its cycle
        for model in &models {
            assert_eq!(database.list_conversations(model.id, 10).await.unwrap().len(), 1);
            assert_eq!(database.list_snapshots(model.id, 10).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_mid_sweep_deletion_is_skipped() {
        let (database, service, models) = service_with_models(2).await;
        let scheduler = Scheduler::new(service.clone(), SchedulerConfig::from(&test_config()));

        // Snapshot first, then delete one model: the stale entry must be
        // skipped without aborting the rest of the sweep.
        let snapshot = service.snapshot().await;
        database.delete_model(models[0].id).await.unwrap();

        scheduler.sweep(snapshot).await.unwrap();

        assert!(database.list_snapshots(models[0].id, 10).await.unwrap().is_empty());
        assert_eq!(database.list_snapshots(models[1].id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let (_database, service, _models) = service_with_models(1).await;
        let scheduler = Scheduler::new(service, SchedulerConfig::from(&test_config()));
        let shutdown = scheduler.shutdown_handle();

        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stops after shutdown")
            .unwrap();
    }
}
