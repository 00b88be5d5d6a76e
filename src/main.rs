//! Coinarena: AI trading arena.
//!
//! Hosts independently configured LLM-driven trading models, each running
//! a simulated leveraged long/short crypto portfolio against live market
//! prices, with every decision and trade persisted.

mod config;
mod db;
mod engine;
mod error;
mod models;
mod oracle;
mod scheduler;
mod server;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::db::Database;
use crate::engine::{EngineService, PortfolioValuer};
use crate::oracle::{MarketDataClient, PriceProvider};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::server::AppState;

/// Coinarena CLI.
#[derive(Parser)]
#[command(name = "coinarena")]
#[command(about = "AI models competing on simulated leveraged crypto portfolios", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./coinarena.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the management API and the background trading loop
    Serve {
        /// Bind address (overrides HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Start without the background trading loop
        #[arg(long)]
        no_auto_trading: bool,
    },

    /// Register a new trading model
    AddModel {
        /// Display name
        name: String,

        /// Decision oracle API key
        #[arg(long)]
        api_key: String,

        /// Decision oracle base URL (OpenAI-compatible)
        #[arg(long)]
        api_url: String,

        /// Model identifier sent to the oracle
        #[arg(long)]
        model_name: String,

        /// Simulated starting capital in USD
        #[arg(long, default_value = "100000")]
        initial_capital: f64,
    },

    /// List all registered models
    ListModels,

    /// Delete a model and its history
    DeleteModel {
        /// Model id
        id: i64,
    },

    /// Run one trading cycle for a model right now
    Execute {
        /// Model id
        id: i64,
    },

    /// Show a model's current portfolio
    Portfolio {
        /// Model id
        id: i64,
    },

    /// Rank all models by return percentage
    Leaderboard,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Arc::new(Config::from_env());
    let db = Arc::new(Database::new(&cli.database).await?);

    let prices: Arc<dyn PriceProvider> = Arc::new(MarketDataClient::new(
        config.market_api_url.clone(),
        config.price_cache,
    )?);
    let service = Arc::new(EngineService::new(db.clone(), prices.clone(), &config));

    match cli.command {
        Commands::Serve {
            host,
            port,
            no_auto_trading,
        } => {
            let count = service.init_from_store().await?;
            info!(models = count, "Engines initialized");

            let shutdown = if no_auto_trading {
                info!("Auto-trading disabled");
                None
            } else {
                let scheduler =
                    Scheduler::new(service.clone(), SchedulerConfig::from(config.as_ref()));
                let shutdown = scheduler.shutdown_handle();
                tokio::spawn(scheduler.run());
                info!("Auto-trading enabled");
                Some(shutdown)
            };

            let state = AppState {
                db,
                service,
                prices,
                config: config.clone(),
            };

            let host = host.unwrap_or_else(|| config.host.clone());
            let port = port.unwrap_or(config.port);
            server::serve(state, &host, port).await?;

            // The loop observes the flag at its next sleep boundary; an
            // in-flight cycle finishes before the process exits.
            if let Some(shutdown) = shutdown {
                shutdown.store(true, Ordering::SeqCst);
            }
        }

        Commands::AddModel {
            name,
            api_key,
            api_url,
            model_name,
            initial_capital,
        } => {
            anyhow::ensure!(initial_capital > 0.0, "initial_capital must be positive");

            let id = db
                .insert_model(&name, &api_key, &api_url, &model_name, initial_capital)
                .await?;

            println!("Model {id} ({name}) added with ${initial_capital} starting capital");
        }

        Commands::ListModels => {
            let models = db.list_models().await?;

            if models.is_empty() {
                println!("No models registered. Use 'coinarena add-model' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<20} {:<24} {:>16}",
                "ID", "NAME", "MODEL", "CAPITAL"
            );
            println!("{}", "-".repeat(70));

            for model in models {
                println!(
                    "{:<6} {:<20} {:<24} {:>16.2}",
                    model.id,
                    truncate(&model.name, 18),
                    truncate(&model.model_name, 22),
                    model.initial_capital
                );
            }
        }

        Commands::DeleteModel { id } => {
            service.deregister(id).await;
            db.delete_model(id).await?;
            println!("Model {id} deleted");
        }

        Commands::Execute { id } => {
            let engine = service.ensure_engine(id).await?;
            let report = engine.run_cycle().await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Portfolio { id } => {
            let current = prices.current_prices(&config.coins).await?;
            let valuer = PortfolioValuer::new(db.clone());
            let snapshot = valuer.valuate(id, &current).await?;

            println!("\n=== Portfolio (model {id}) ===");
            println!("Cash:            ${:.2}", snapshot.cash);
            println!("Margin Used:     ${:.2}", snapshot.margin_used);
            println!("Positions Value: ${:.2}", snapshot.positions_value);
            println!("Realized P&L:    ${:.2}", snapshot.realized_pnl);
            println!("Unrealized P&L:  ${:.2}", snapshot.unrealized_pnl);
            println!("Total Value:     ${:.2}", snapshot.total_value);

            if !snapshot.positions.is_empty() {
                println!("\n--- Open Positions ({}) ---", snapshot.positions.len());
                for p in &snapshot.positions {
                    let mark = p
                        .current_price
                        .map(|m| format!("{m:.2}"))
                        .unwrap_or_else(|| "n/a".to_string());
                    println!(
                        "  {} {} x{}: {} @ {:.2} -> {} (P&L: ${:.2})",
                        p.coin, p.side, p.leverage, p.quantity, p.avg_price, mark, p.unrealized_pnl
                    );
                }
            }
        }

        Commands::Leaderboard => {
            let models = db.list_models().await?;
            if models.is_empty() {
                println!("No models registered.");
                return Ok(());
            }

            let current = prices.current_prices(&config.coins).await?;
            let valuer = PortfolioValuer::new(db.clone());

            let mut rows = Vec::new();
            for model in models {
                let snapshot = valuer.valuate(model.id, &current).await?;
                let capital = model.capital();
                let returns = if capital.is_zero() {
                    rust_decimal::Decimal::ZERO
                } else {
                    (snapshot.total_value - capital) / capital
                        * rust_decimal::Decimal::from(100)
                };
                rows.push((model, snapshot.total_value, returns));
            }
            rows.sort_by(|a, b| b.2.cmp(&a.2));

            println!(
                "\n{:<6} {:<20} {:>16} {:>10}",
                "ID", "NAME", "VALUE", "RETURN"
            );
            println!("{}", "-".repeat(56));

            for (model, value, returns) in rows {
                println!(
                    "{:<6} {:<20} {:>16.2} {:>9.2}%",
                    model.id,
                    truncate(&model.name, 18),
                    value,
                    returns
                );
            }
        }
    }

    Ok(())
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
