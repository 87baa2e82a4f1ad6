//! Durable per-account state.
//!
//! Stores what a restart needs to resume mid-week:
//! - One `AccountState` JSON document per bot (last writer wins)
//! - An append-only event log of entries, exits and resets
//! - The paper account book (cash and open positions) per bot

#[cfg(test)]
mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[cfg(test)]
pub use memory::MemoryStore;

use crate::models::AccountState;

/// Where account state lives between ticks.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read_state(&self, bot_id: &str) -> Result<Option<AccountState>>;

    async fn write_state(&self, bot_id: &str, state: &AccountState) -> Result<()>;

    async fn clear_state(&self, bot_id: &str) -> Result<()>;

    async fn record_event(&self, bot_id: &str, kind: &str, detail: &str) -> Result<()>;
}

/// Durable book behind a paper account, so simulated positions outlive the process.
#[async_trait]
pub trait PaperLedger: Send + Sync {
    async fn load_paper_account(&self, bot_id: &str) -> Result<Option<PaperAccountRecord>>;

    /// Replace the stored book for `bot_id` atomically.
    async fn save_paper_account(&self, bot_id: &str, account: &PaperAccountRecord) -> Result<()>;
}

/// Paper account cash and open positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperAccountRecord {
    pub balance: f64,
    pub next_id: i64,
    pub positions: Vec<PaperPositionRecord>,
}

/// One open paper position.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PaperPositionRecord {
    pub id: String,
    pub symbol: String,
    pub instrument: String,
    pub units: f64,
    pub entry_price: f64,
    pub tag: Option<String>,
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored audit event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub bot_id: String,
    pub kind: String,
    pub detail: String,
    pub created_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. Single connection, since each SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_states (
                bot_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bot_events_bot ON bot_events(bot_id, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_accounts (
                bot_id TEXT PRIMARY KEY,
                balance REAL NOT NULL,
                next_id INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_positions (
                bot_id TEXT NOT NULL,
                id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                instrument TEXT NOT NULL,
                units REAL NOT NULL,
                entry_price REAL NOT NULL,
                tag TEXT,
                PRIMARY KEY (bot_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Events ====================

    /// Most recent events for a bot, newest first.
    pub async fn recent_events(&self, bot_id: &str, limit: i64) -> Result<Vec<StoredEvent>> {
        sqlx::query_as::<_, StoredEvent>(
            "SELECT * FROM bot_events WHERE bot_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch bot events")
    }
}

#[async_trait]
impl StateStore for Database {
    // ==================== Account State ====================

    async fn read_state(&self, bot_id: &str) -> Result<Option<AccountState>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM bot_states WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read bot state")?;

        row.map(|(raw,)| {
            serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt stored state for {}", bot_id))
        })
        .transpose()
    }

    async fn write_state(&self, bot_id: &str, state: &AccountState) -> Result<()> {
        let raw = serde_json::to_string(state).context("Failed to encode bot state")?;
        sqlx::query(
            r#"
            INSERT INTO bot_states (bot_id, state, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(bot_id) DO UPDATE SET
                state = excluded.state,
                updated_at = datetime('now')
            "#,
        )
        .bind(bot_id)
        .bind(raw)
        .execute(&self.pool)
        .await
        .context("Failed to write bot state")?;

        Ok(())
    }

    async fn clear_state(&self, bot_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM bot_states WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear bot state")?;
        Ok(())
    }

    async fn record_event(&self, bot_id: &str, kind: &str, detail: &str) -> Result<()> {
        sqlx::query("INSERT INTO bot_events (bot_id, kind, detail) VALUES (?, ?, ?)")
            .bind(bot_id)
            .bind(kind)
            .bind(detail)
            .execute(&self.pool)
            .await
            .context("Failed to record bot event")?;
        Ok(())
    }
}

#[async_trait]
impl PaperLedger for Database {
    async fn load_paper_account(&self, bot_id: &str) -> Result<Option<PaperAccountRecord>> {
        let row: Option<(f64, i64)> =
            sqlx::query_as("SELECT balance, next_id FROM paper_accounts WHERE bot_id = ?")
                .bind(bot_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read paper account")?;
        let Some((balance, next_id)) = row else {
            return Ok(None);
        };

        let positions = sqlx::query_as::<_, PaperPositionRecord>(
            r#"
            SELECT id, symbol, instrument, units, entry_price, tag
            FROM paper_positions WHERE bot_id = ? ORDER BY rowid
            "#,
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read paper positions")?;

        Ok(Some(PaperAccountRecord {
            balance,
            next_id,
            positions,
        }))
    }

    async fn save_paper_account(&self, bot_id: &str, account: &PaperAccountRecord) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start paper account transaction")?;

        sqlx::query(
            r#"
            INSERT INTO paper_accounts (bot_id, balance, next_id, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(bot_id) DO UPDATE SET
                balance = excluded.balance,
                next_id = excluded.next_id,
                updated_at = datetime('now')
            "#,
        )
        .bind(bot_id)
        .bind(account.balance)
        .bind(account.next_id)
        .execute(&mut *tx)
        .await
        .context("Failed to write paper account")?;

        sqlx::query("DELETE FROM paper_positions WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear paper positions")?;

        for position in &account.positions {
            sqlx::query(
                r#"
                INSERT INTO paper_positions (bot_id, id, symbol, instrument, units, entry_price, tag)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(bot_id)
            .bind(&position.id)
            .bind(&position.symbol)
            .bind(&position.instrument)
            .bind(position.units)
            .bind(position.entry_price)
            .bind(&position.tag)
            .execute(&mut *tx)
            .await
            .context("Failed to write paper position")?;
        }

        tx.commit().await.context("Failed to commit paper account")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, EntrySnapshot};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn entered_state() -> AccountState {
        let mut state = AccountState::default();
        state.roll_week("2024-06-02T23:00:00.000Z");
        state.record_entry(
            Direction::Short,
            EntrySnapshot {
                time: Utc::now(),
                equity: 5_000.0,
                prices: BTreeMap::from([("EURUSD".to_string(), 1.1)]),
                notional: BTreeMap::from([("EURUSD".to_string(), 5_000.0)]),
                directions: BTreeMap::from([("EURUSD".to_string(), Direction::Short)]),
            },
        );
        state
    }

    #[tokio::test]
    async fn test_state_upsert_and_read_back() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.read_state("uni").await.unwrap().is_none());

        let state = entered_state();
        db.write_state("uni", &state).await.unwrap();
        assert_eq!(db.read_state("uni").await.unwrap(), Some(state.clone()));

        let mut later = state;
        later.locked_pct = Some(12.0);
        later.trailing_active = true;
        db.write_state("uni", &later).await.unwrap();
        assert_eq!(db.read_state("uni").await.unwrap(), Some(later));
        assert!(db.read_state("bg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_state() {
        let db = Database::in_memory().await.unwrap();
        db.write_state("uni", &entered_state()).await.unwrap();
        db.clear_state("uni").await.unwrap();
        assert!(db.read_state("uni").await.unwrap().is_none());
    }

    fn paper_position(id: &str, units: f64) -> PaperPositionRecord {
        PaperPositionRecord {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            instrument: "EUR_USD".to_string(),
            units,
            entry_price: 1.1,
            tag: Some(format!("uni-EURUSD-dealer-{}", id)),
        }
    }

    #[tokio::test]
    async fn test_paper_account_replaced_per_bot() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_paper_account("uni").await.unwrap().is_none());

        let account = PaperAccountRecord {
            balance: 10_000.0,
            next_id: 2,
            positions: vec![paper_position("1", 1000.0), paper_position("2", -500.0)],
        };
        db.save_paper_account("uni", &account).await.unwrap();
        assert_eq!(db.load_paper_account("uni").await.unwrap(), Some(account));

        let flat = PaperAccountRecord {
            balance: 10_020.0,
            next_id: 2,
            positions: Vec::new(),
        };
        db.save_paper_account("uni", &flat).await.unwrap();
        assert_eq!(db.load_paper_account("uni").await.unwrap(), Some(flat));
        assert!(db.load_paper_account("bg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_newest_first() {
        let db = Database::in_memory().await.unwrap();
        db.record_event("uni", "week_reset", "2024-06-02T23:00:00.000Z")
            .await
            .unwrap();
        db.record_event("uni", "entered", "direction=LONG").await.unwrap();
        db.record_event("bg", "entered", "direction=SHORT").await.unwrap();

        let events = db.recent_events("uni", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "entered");
        assert_eq!(events[1].kind, "week_reset");
    }
}
