//! Ledger store: durable state for models, positions, trades,
//! conversations and account snapshots.
//!
//! Every write is atomic at the single-record level; compound mutations
//! (a position change plus its trade rows) go through
//! [`Database::record_execution`], which wraps them in one transaction.

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{Position, PositionSide, TradeSignal, TradingModel};

/// Database connection pool over SQLite.
pub struct Database {
    pool: SqlitePool,
}

/// Position row as stored (REAL columns; converted to `Decimal` on load).
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredPosition {
    pub coin: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub leverage: i64,
    pub side: String,
}

impl StoredPosition {
    fn into_domain(self) -> Position {
        Position::new(
            self.coin,
            PositionSide::parse(&self.side),
            Decimal::try_from(self.quantity).unwrap_or(Decimal::ZERO),
            Decimal::try_from(self.avg_price).unwrap_or(Decimal::ZERO),
            u32::try_from(self.leverage).unwrap_or(1),
        )
    }
}

/// Immutable trade record.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TradeRecord {
    pub id: i64,
    pub model_id: i64,
    pub coin: String,
    pub signal: String,
    pub quantity: f64,
    pub price: f64,
    pub leverage: i64,
    pub side: String,
    pub pnl: f64,
    pub timestamp: String,
}

/// Prompt/response pair from one decision oracle query.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ConversationRecord {
    pub id: i64,
    pub model_id: i64,
    pub user_prompt: String,
    pub ai_response: String,
    pub cot_trace: Option<String>,
    pub timestamp: String,
}

/// Account value time series point.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub model_id: i64,
    pub total_value: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub timestamp: String,
}

/// Pending mutation of the position book, applied inside
/// [`Database::record_execution`].
#[derive(Debug, Clone)]
pub enum PositionChange {
    Upsert {
        coin: String,
        side: PositionSide,
        quantity: Decimal,
        avg_price: Decimal,
        leverage: u32,
    },
    Remove {
        coin: String,
        side: PositionSide,
    },
}

/// Trade row to append alongside its position change.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub coin: String,
    pub signal: TradeSignal,
    pub quantity: Decimal,
    pub price: Decimal,
    pub leverage: u32,
    pub side: PositionSide,
    pub pnl: Decimal,
}

/// Optional fields for a model update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct ModelPatch {
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model_name: Option<String>,
    pub initial_capital: Option<f64>,
}

impl ModelPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.api_key.is_none()
            && self.api_url.is_none()
            && self.model_name.is_none()
            && self.initial_capital.is_none()
    }
}

impl Database {
    /// Create a new database connection and apply migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await.context("Failed to run migrations")?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> std::result::Result<(), sqlx::Error> {
        // Models
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_url TEXT NOT NULL,
                model_name TEXT NOT NULL,
                initial_capital REAL NOT NULL DEFAULT 10000,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Open positions, one row per (model, coin, side)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                coin TEXT NOT NULL,
                quantity REAL NOT NULL,
                avg_price REAL NOT NULL,
                leverage INTEGER NOT NULL DEFAULT 1,
                side TEXT NOT NULL DEFAULT 'long',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(model_id, coin, side)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trade history (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                coin TEXT NOT NULL,
                signal TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                leverage INTEGER NOT NULL DEFAULT 1,
                side TEXT NOT NULL DEFAULT 'long',
                pnl REAL NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Decision oracle conversations (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                user_prompt TEXT NOT NULL,
                ai_response TEXT NOT NULL,
                cot_trace TEXT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Account value history (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_values (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                total_value REAL NOT NULL,
                cash REAL NOT NULL,
                positions_value REAL NOT NULL,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_model ON positions(model_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_model ON trades(model_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_model ON conversations(model_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_account_values_model ON account_values(model_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Models ====================

    /// Register a new trading model, returning its id.
    pub async fn insert_model(
        &self,
        name: &str,
        api_key: &str,
        api_url: &str,
        model_name: &str,
        initial_capital: f64,
    ) -> std::result::Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO models (name, api_key, api_url, model_name, initial_capital)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(api_key)
        .bind(api_url)
        .bind(model_name)
        .bind(initial_capital)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Fetch one model by id.
    pub async fn get_model(
        &self,
        model_id: i64,
    ) -> std::result::Result<Option<TradingModel>, sqlx::Error> {
        sqlx::query_as::<_, TradingModel>("SELECT * FROM models WHERE id = ?")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Fetch all registered models, newest first.
    pub async fn list_models(&self) -> std::result::Result<Vec<TradingModel>, sqlx::Error> {
        sqlx::query_as::<_, TradingModel>("SELECT * FROM models ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
    }

    /// Apply a partial update. Returns false when the model does not exist.
    pub async fn update_model(
        &self,
        model_id: i64,
        patch: &ModelPatch,
    ) -> std::result::Result<bool, sqlx::Error> {
        if patch.is_empty() {
            return self
                .get_model(model_id)
                .await
                .map(|model| model.is_some());
        }

        let result = sqlx::query(
            r#"
            UPDATE models SET
                name = COALESCE(?, name),
                api_key = COALESCE(?, api_key),
                api_url = COALESCE(?, api_url),
                model_name = COALESCE(?, model_name),
                initial_capital = COALESCE(?, initial_capital)
            WHERE id = ?
            "#,
        )
        .bind(&patch.name)
        .bind(&patch.api_key)
        .bind(&patch.api_url)
        .bind(&patch.model_name)
        .bind(patch.initial_capital)
        .bind(model_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a model and all of its history in one transaction.
    pub async fn delete_model(&self, model_id: i64) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for table in [
            "models",
            "positions",
            "trades",
            "conversations",
            "account_values",
        ] {
            let column = if table == "models" { "id" } else { "model_id" };
            sqlx::query(&format!("DELETE FROM {table} WHERE {column} = ?"))
                .bind(model_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await
    }

    // ==================== Positions ====================

    /// All open positions for a model.
    pub async fn get_positions(
        &self,
        model_id: i64,
    ) -> std::result::Result<Vec<Position>, sqlx::Error> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT coin, quantity, avg_price, leverage, side FROM positions WHERE model_id = ? AND quantity > 0",
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredPosition::into_domain).collect())
    }

    /// One open position by (coin, side), if any.
    pub async fn get_position(
        &self,
        model_id: i64,
        coin: &str,
        side: PositionSide,
    ) -> std::result::Result<Option<Position>, sqlx::Error> {
        let row = sqlx::query_as::<_, StoredPosition>(
            "SELECT coin, quantity, avg_price, leverage, side FROM positions WHERE model_id = ? AND coin = ? AND side = ? AND quantity > 0",
        )
        .bind(model_id)
        .bind(coin)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredPosition::into_domain))
    }

    // ==================== Trade Execution ====================

    /// Apply position changes and their trade rows atomically: either the
    /// whole execution persists or none of it does.
    pub async fn record_execution(
        &self,
        model_id: i64,
        changes: &[PositionChange],
        trades: &[NewTrade],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for change in changes {
            match change {
                PositionChange::Upsert {
                    coin,
                    side,
                    quantity,
                    avg_price,
                    leverage,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO positions (model_id, coin, quantity, avg_price, leverage, side, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
                        ON CONFLICT(model_id, coin, side) DO UPDATE SET
                            quantity = excluded.quantity,
                            avg_price = excluded.avg_price,
                            leverage = excluded.leverage,
                            updated_at = datetime('now')
                        "#,
                    )
                    .bind(model_id)
                    .bind(coin)
                    .bind(quantity.to_f64().unwrap_or(0.0))
                    .bind(avg_price.to_f64().unwrap_or(0.0))
                    .bind(*leverage as i64)
                    .bind(side.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                PositionChange::Remove { coin, side } => {
                    sqlx::query("DELETE FROM positions WHERE model_id = ? AND coin = ? AND side = ?")
                        .bind(model_id)
                        .bind(coin)
                        .bind(side.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for trade in trades {
            sqlx::query(
                r#"
                INSERT INTO trades (model_id, coin, signal, quantity, price, leverage, side, pnl)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(model_id)
            .bind(&trade.coin)
            .bind(trade.signal.as_str())
            .bind(trade.quantity.to_f64().unwrap_or(0.0))
            .bind(trade.price.to_f64().unwrap_or(0.0))
            .bind(trade.leverage as i64)
            .bind(trade.side.as_str())
            .bind(trade.pnl.to_f64().unwrap_or(0.0))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    /// Sum of all historical trade PnL for a model.
    pub async fn sum_realized_pnl(
        &self,
        model_id: i64,
    ) -> std::result::Result<Decimal, sqlx::Error> {
        let (total,): (f64,) =
            sqlx::query_as("SELECT COALESCE(SUM(pnl), 0.0) FROM trades WHERE model_id = ?")
                .bind(model_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Decimal::try_from(total).unwrap_or(Decimal::ZERO))
    }

    /// Trade history, newest first.
    pub async fn list_trades(
        &self,
        model_id: i64,
        limit: i64,
    ) -> std::result::Result<Vec<TradeRecord>, sqlx::Error> {
        sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE model_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(model_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    // ==================== Conversations ====================

    /// Append one prompt/response pair.
    pub async fn append_conversation(
        &self,
        model_id: i64,
        user_prompt: &str,
        ai_response: &str,
        cot_trace: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO conversations (model_id, user_prompt, ai_response, cot_trace)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(model_id)
        .bind(user_prompt)
        .bind(ai_response)
        .bind(cot_trace)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Conversation history, newest first.
    pub async fn list_conversations(
        &self,
        model_id: i64,
        limit: i64,
    ) -> std::result::Result<Vec<ConversationRecord>, sqlx::Error> {
        sqlx::query_as::<_, ConversationRecord>(
            "SELECT * FROM conversations WHERE model_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(model_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    // ==================== Account Snapshots ====================

    /// Append one account value point.
    pub async fn append_snapshot(
        &self,
        model_id: i64,
        total_value: f64,
        cash: f64,
        positions_value: f64,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO account_values (model_id, total_value, cash, positions_value)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(model_id)
        .bind(total_value)
        .bind(cash)
        .bind(positions_value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Account value history, newest first.
    pub async fn list_snapshots(
        &self,
        model_id: i64,
        limit: i64,
    ) -> std::result::Result<Vec<SnapshotRecord>, sqlx::Error> {
        sqlx::query_as::<_, SnapshotRecord>(
            "SELECT * FROM account_values WHERE model_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(model_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
pub(crate) async fn memory() -> Database {
    // A single connection keeps the whole in-memory database on one handle.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    let db = Database { pool };
    db.run_migrations().await.expect("migrations");
    db
}
