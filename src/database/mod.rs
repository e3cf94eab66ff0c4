use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{SignalError, SignalResult};
use crate::types::Signal;

/// Append-only store of produced signals
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Persist one signal, returning its row id
    async fn save(&self, signal: &Signal) -> SignalResult<i64>;

    /// Most recent signals first, optionally restricted to one ticker
    async fn load_history(&self, ticker: Option<String>, limit: u32) -> SignalResult<Vec<Signal>>;
}

pub struct SqliteSignalStore {
    pool: SqlitePool,
}

impl SqliteSignalStore {
    /// Open (creating if needed) the database and ensure the schema exists
    pub async fn connect(database_url: &str) -> SignalResult<Self> {
        info!("Initializing SQLite signal store at: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database sees its own empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> SignalResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id TEXT NOT NULL UNIQUE,
                ticker TEXT NOT NULL,
                as_of TEXT NOT NULL,
                created_at TEXT NOT NULL,
                direction TEXT NOT NULL,
                regime TEXT NOT NULL,
                confidence REAL NOT NULL,
                win_probability REAL NOT NULL,
                recommended REAL NOT NULL,
                price TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trade_signals_ticker ON trade_signals(ticker)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trade_signals_created ON trade_signals(created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count(&self) -> SignalResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trade_signals")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn save(&self, signal: &Signal) -> SignalResult<i64> {
        let payload = serde_json::to_string(signal).map_err(|e| SignalError::persistence(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO trade_signals (
                signal_id, ticker, as_of, created_at, direction, regime,
                confidence, win_probability, recommended, price, payload
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(signal.id().to_string())
        .bind(signal.ticker())
        .bind(signal.as_of().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(signal.ensemble().direction.as_str())
        .bind(signal.regime().label.as_str())
        .bind(signal.ensemble().confidence)
        .bind(signal.ensemble().win_probability)
        .bind(signal.sizing().recommended)
        .bind(signal.price().to_string())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Saved signal {} for {} as row {}", signal.id(), signal.ticker(), id);
        Ok(id)
    }

    async fn load_history(&self, ticker: Option<String>, limit: u32) -> SignalResult<Vec<Signal>> {
        let rows = match ticker {
            Some(ticker) => {
                sqlx::query(
                    r#"
                    SELECT payload FROM trade_signals
                    WHERE ticker = ?
                    ORDER BY id DESC
                    LIMIT ?
                    "#,
                )
                .bind(ticker.to_uppercase())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT payload FROM trade_signals
                    ORDER BY id DESC
                    LIMIT ?
                    "#,
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload).map_err(|e| SignalError::persistence(format!("corrupt signal row: {}", e)))
            })
            .collect()
    }
}
