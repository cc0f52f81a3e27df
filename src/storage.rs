//! Durable trade storage on SQLite.
//!
//! Writes are idempotent: the primary key is the record's content hash, and
//! inserts use INSERT OR IGNORE, so replaying a batch after a failed flush
//! (at-least-once delivery) never produces duplicate rows.
//!
//! Key optimizations carried over from production use:
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Batch inserts inside a single transaction
//! - WITHOUT ROWID clustering on the dedup key

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::models::{Side, TradeRecord};

/// Write seam for the batch persistence path. Lets tests drive the writer
/// against a failing or counting sink without a real database.
#[async_trait]
pub trait TradeSink: Send + Sync {
    /// Persist a batch, deduplicated by content hash. Returns the number of
    /// rows actually inserted (duplicates are silently ignored, not errors).
    async fn store_batch(&self, records: &[TradeRecord]) -> Result<usize>;
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    content_hash TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    wallet TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    size REAL NOT NULL,
    notional REAL NOT NULL,
    fee REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    event_time_ms INTEGER NOT NULL,
    stored_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_time
    ON trades(event_time_ms DESC);

CREATE INDEX IF NOT EXISTS idx_trades_symbol
    ON trades(symbol, event_time_ms DESC);

CREATE INDEX IF NOT EXISTS idx_trades_wallet
    ON trades(wallet, event_time_ms DESC);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .unwrap_or(0);

        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES ('total_trades_ever', ?1)",
            params![count.to_string()],
        )
        .ok();

        info!(db_path, existing_rows = count, "trade store initialized");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent trades by event time, newest first.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare_cached(
            "SELECT content_hash, id, wallet, symbol, side, price, size,
                    notional, fee, realized_pnl, event_time_ms
             FROM trades
             ORDER BY event_time_ms DESC, content_hash
             LIMIT ?1",
        )?;

        let trades = stmt
            .query_map([limit], Self::row_to_record)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(trades)
    }

    /// Cumulative count of unique trades ever persisted.
    pub fn total_trades_ever(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let total: i64 = conn
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'total_trades_ever'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        Ok(total)
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM trades", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete rows with an event time before `cutoff_ms`. Returns the number
    /// of rows removed.
    pub fn prune_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM trades WHERE event_time_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    /// Run periodically (e.g. after a prune sweep).
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        debug!("trade store optimized");
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TradeRecord> {
        let content_hash: String = row.get(0)?;
        let id: String = row.get(1)?;
        let wallet: String = row.get(2)?;
        let symbol: String = row.get(3)?;
        let side_str: String = row.get(4)?;
        let price: f64 = row.get(5)?;
        let size: f64 = row.get(6)?;
        let notional: f64 = row.get(7)?;
        let fee: f64 = row.get(8)?;
        let realized_pnl: f64 = row.get(9)?;
        let event_time_ms: i64 = row.get(10)?;

        let side = Side::parse(&side_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown side {:?}", side_str).into(),
            )
        })?;

        Ok(TradeRecord {
            id,
            wallet,
            symbol,
            price,
            size,
            side,
            event_time_ms,
            notional,
            fee,
            realized_pnl,
            content_hash,
        })
    }
}

#[async_trait]
impl TradeSink for TradeStore {
    async fn store_batch(&self, records: &[TradeRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let stored_at = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();

        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut inserted = 0usize;
        let insert_result: rusqlite::Result<()> = (|| {
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO trades
                 (content_hash, id, wallet, symbol, side, price, size,
                  notional, fee, realized_pnl, event_time_ms, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for record in records {
                inserted += stmt.execute(params![
                    &record.content_hash,
                    &record.id,
                    &record.wallet,
                    &record.symbol,
                    record.side.as_str(),
                    record.price,
                    record.size,
                    record.notional,
                    record.fee,
                    record.realized_pnl,
                    record.event_time_ms,
                    stored_at,
                ])?;
            }
            Ok(())
        })();

        if let Err(e) = insert_result {
            conn.execute("ROLLBACK", []).ok();
            return Err(e).context("batch insert failed");
        }

        if inserted > 0 {
            conn.execute(
                &format!(
                    "UPDATE metadata SET value = CAST(CAST(value AS INTEGER) + {} AS TEXT)
                     WHERE key = 'total_trades_ever'",
                    inserted
                ),
                [],
            )
            .ok();
        }

        conn.execute("COMMIT", [])?;

        debug!(batch = records.len(), inserted, "trade batch persisted");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn record(hash: &str, id: &str, time_ms: i64) -> TradeRecord {
        TradeRecord {
            id: id.to_string(),
            wallet: "0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d".to_string(),
            symbol: "BTC".to_string(),
            price: 60_000.0,
            size: 0.1,
            side: Side::Buy,
            event_time_ms: time_ms,
            notional: 6_000.0,
            fee: 0.0,
            realized_pnl: 0.0,
            content_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_create() {
        let store = TradeStore::new(":memory:").expect("create store");
        assert!(store.is_empty());
        assert_eq!(store.total_trades_ever().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_content_hash_yields_one_row() {
        let store = TradeStore::new(":memory:").expect("create store");

        // Same logical event seen twice with different record ids.
        let batch = vec![record("abc", "ord-1", 1_000), record("abc", "ord-2", 1_000)];
        let inserted = store.store_batch(&batch).await.expect("store batch");
        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);

        // A retried flush of the same batch is a no-op.
        let inserted = store.store_batch(&batch).await.expect("store batch again");
        assert_eq!(inserted, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_trades_ever().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_insert_and_recent_ordering() {
        let store = TradeStore::new(":memory:").expect("create store");

        let batch: Vec<_> = (0..100)
            .map(|i| record(&format!("h-{}", i), &format!("id-{}", i), i))
            .collect();
        let inserted = store.store_batch(&batch).await.expect("store batch");
        assert_eq!(inserted, 100);
        assert_eq!(store.total_trades_ever().unwrap(), 100);

        let recent = store.get_recent(3).expect("get recent");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content_hash, "h-99");
        assert_eq!(recent[0].side, Side::Buy);
    }

    #[tokio::test]
    async fn test_prune_before() {
        let store = TradeStore::new(":memory:").expect("create store");
        let batch: Vec<_> = (0..10)
            .map(|i| record(&format!("h-{}", i), &format!("id-{}", i), i * 1_000))
            .collect();
        store.store_batch(&batch).await.expect("store batch");

        let deleted = store.prune_before(5_000).expect("prune");
        assert_eq!(deleted, 5);
        assert_eq!(store.len(), 5);
        // The cumulative counter is not rewound by retention.
        assert_eq!(store.total_trades_ever().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows_and_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trades.db");
        let path = path.to_str().unwrap();

        {
            let store = TradeStore::new(path).expect("create store");
            store
                .store_batch(&[record("abc", "ord-1", 1_000)])
                .await
                .expect("store");
        }

        let store = TradeStore::new(path).expect("reopen store");
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_trades_ever().unwrap(), 1);
        let rows = store.get_recent(10).expect("get recent");
        assert_eq!(rows[0].content_hash, "abc");
    }
}
