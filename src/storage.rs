//! Sqlite persistence for trades, orders, events, watches, and settings.
//!
//! Money and price columns are REAL; exchange strings are parsed before they
//! get here. Multi-row updates that must be atomic run inside one transaction.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::events::Event;

/// Persisted trade row. The full immutable contract rides along as JSON so a
/// restart rehydrates exactly what was constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub contract_json: String,
    pub entry_price: Option<f64>,
    pub size: Option<f64>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
}

/// Local shadow of an exchange order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub local_id: String,
    pub trade_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub is_entry: bool,
    pub is_exit: bool,
    pub is_stop: bool,
    pub status: String,
    pub avg_fill_price: Option<f64>,
    pub filled_qty: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRecord {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub trigger_type: String,
    pub threshold_pct: Option<f64>,
    pub target_price: Option<f64>,
    pub mode: String,
    pub expiry_ts: Option<i64>,
    pub status: String,
    pub preset_json: Option<String>,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct AgentDb {
    conn: Arc<Mutex<Connection>>,
}

impl AgentDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open agent db")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory agent db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                contract_json TEXT NOT NULL,
                entry_price REAL,
                size REAL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                exit_reason TEXT,
                realized_pnl REAL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol_opened ON trades(symbol, opened_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                local_id TEXT PRIMARY KEY,
                trade_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                qty REAL NOT NULL,
                price REAL,
                reduce_only INTEGER NOT NULL,
                is_entry INTEGER NOT NULL,
                is_exit INTEGER NOT NULL,
                is_stop INTEGER NOT NULL,
                status TEXT NOT NULL,
                avg_fill_price REAL,
                filled_qty REAL NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol, created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                symbol TEXT,
                trade_id TEXT,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                message TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_symbol_ts ON events(symbol, ts DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS watches (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                threshold_pct REAL,
                target_price REAL,
                mode TEXT NOT NULL,
                expiry_ts INTEGER,
                status TEXT NOT NULL,
                preset_json TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS symbol_configs (
                symbol TEXT PRIMARY KEY,
                config_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    pub async fn insert_trade(&self, rec: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::insert_trade_inner(&conn, rec)
    }

    fn insert_trade_inner(conn: &Connection, rec: &TradeRecord) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO trades \
             (trade_id, symbol, side, status, contract_json, entry_price, size, opened_at, closed_at, exit_reason, realized_pnl) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &rec.trade_id,
                &rec.symbol,
                &rec.side,
                &rec.status,
                &rec.contract_json,
                rec.entry_price,
                rec.size,
                rec.opened_at,
                rec.closed_at,
                rec.exit_reason.as_deref(),
                rec.realized_pnl,
            ],
        )?;
        Ok(())
    }

    /// Atomic entry persist: trade row + entry order row + audit event.
    pub async fn persist_entry(
        &self,
        trade: &TradeRecord,
        order: &OrderRecord,
        event: &Event,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        Self::insert_trade_inner(&tx, trade)?;
        Self::insert_order_inner(&tx, order)?;
        Self::insert_event_inner(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    pub async fn update_trade_fill(&self, trade_id: &str, entry_price: f64, size: f64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET entry_price = ?2, size = ?3 WHERE trade_id = ?1",
            params![trade_id, entry_price, size],
        )?;
        Ok(())
    }

    pub async fn close_trade(
        &self,
        trade_id: &str,
        closed_at: i64,
        exit_reason: &str,
        realized_pnl: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET status = 'CLOSED', closed_at = ?2, exit_reason = ?3, realized_pnl = ?4 \
             WHERE trade_id = ?1",
            params![trade_id, closed_at, exit_reason, realized_pnl],
        )?;
        Ok(())
    }

    pub async fn load_open_trades(&self) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, symbol, side, status, contract_json, entry_price, size, opened_at, closed_at, exit_reason, realized_pnl \
             FROM trades WHERE closed_at IS NULL AND status = 'EXECUTED' ORDER BY opened_at ASC",
        )?;
        let rows = stmt.query_map([], Self::map_trade_row)?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(v) = r {
                out.push(v);
            }
        }
        Ok(out)
    }

    pub async fn list_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trade_id, symbol, side, status, contract_json, entry_price, size, opened_at, closed_at, exit_reason, realized_pnl \
             FROM trades ORDER BY opened_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], Self::map_trade_row)?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(v) = r {
                out.push(v);
            }
        }
        Ok(out)
    }

    fn map_trade_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
        Ok(TradeRecord {
            trade_id: row.get(0)?,
            symbol: row.get(1)?,
            side: row.get(2)?,
            status: row.get(3)?,
            contract_json: row.get(4)?,
            entry_price: row.get(5)?,
            size: row.get(6)?,
            opened_at: row.get(7)?,
            closed_at: row.get(8)?,
            exit_reason: row.get(9)?,
            realized_pnl: row.get(10)?,
        })
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub async fn insert_order(&self, rec: &OrderRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::insert_order_inner(&conn, rec)
    }

    fn insert_order_inner(conn: &Connection, rec: &OrderRecord) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO orders \
             (local_id, trade_id, symbol, side, order_type, qty, price, reduce_only, is_entry, is_exit, is_stop, status, avg_fill_price, filled_qty, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                &rec.local_id,
                rec.trade_id.as_deref(),
                &rec.symbol,
                &rec.side,
                &rec.order_type,
                rec.qty,
                rec.price,
                rec.reduce_only as i64,
                rec.is_entry as i64,
                rec.is_exit as i64,
                rec.is_stop as i64,
                &rec.status,
                rec.avg_fill_price,
                rec.filled_qty,
                rec.created_at,
                rec.updated_at,
            ],
        )?;
        Ok(())
    }

    pub async fn update_order_status(
        &self,
        local_id: &str,
        status: &str,
        avg_fill_price: Option<f64>,
        filled_qty: f64,
        updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE orders SET status = ?2, avg_fill_price = ?3, filled_qty = ?4, updated_at = ?5 \
             WHERE local_id = ?1",
            params![local_id, status, avg_fill_price, filled_qty, updated_at],
        )?;
        Ok(())
    }

    pub async fn list_orders_for_symbol(&self, symbol: &str, limit: usize) -> Result<Vec<OrderRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT local_id, trade_id, symbol, side, order_type, qty, price, reduce_only, is_entry, is_exit, is_stop, status, avg_fill_price, filled_qty, created_at, updated_at \
             FROM orders WHERE symbol = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit], Self::map_order_row)?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(v) = r {
                out.push(v);
            }
        }
        Ok(out)
    }

    fn map_order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
        Ok(OrderRecord {
            local_id: row.get(0)?,
            trade_id: row.get(1)?,
            symbol: row.get(2)?,
            side: row.get(3)?,
            order_type: row.get(4)?,
            qty: row.get(5)?,
            price: row.get(6)?,
            reduce_only: row.get::<_, i64>(7)? != 0,
            is_entry: row.get::<_, i64>(8)? != 0,
            is_exit: row.get::<_, i64>(9)? != 0,
            is_stop: row.get::<_, i64>(10)? != 0,
            status: row.get(11)?,
            avg_fill_price: row.get(12)?,
            filled_qty: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub async fn insert_event(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::insert_event_inner(&conn, event)
    }

    fn insert_event_inner(conn: &Connection, event: &Event) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO events (id, symbol, trade_id, event_type, payload, message, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &event.id,
                event.symbol.as_deref(),
                event.trade_id.as_deref(),
                event.event_type.as_str(),
                event.payload.to_string(),
                &event.message,
                event.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_events(&self, symbol: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;

        let mut out: Vec<Event> = Vec::new();
        if let Some(symbol) = symbol {
            let mut stmt = conn.prepare_cached(
                "SELECT id, symbol, trade_id, event_type, payload, message, ts \
                 FROM events WHERE symbol = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![symbol, limit], Self::map_event_row)?;
            for r in rows.flatten() {
                out.push(r);
            }
            return Ok(out);
        }

        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, trade_id, event_type, payload, message, ts \
             FROM events ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], Self::map_event_row)?;
        for r in rows.flatten() {
            out.push(r);
        }
        Ok(out)
    }

    fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
        let event_type_str: String = row.get(3)?;
        let payload_str: String = row.get(4)?;
        let ts_ms: i64 = row.get(6)?;
        Ok(Event {
            id: row.get(0)?,
            symbol: row.get(1)?,
            trade_id: row.get(2)?,
            event_type: serde_json::from_value(serde_json::Value::String(event_type_str))
                .unwrap_or(crate::events::EventType::SystemError),
            payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
            message: row.get(5)?,
            timestamp: chrono::DateTime::from_timestamp_millis(ts_ms)
                .unwrap_or_else(chrono::Utc::now),
        })
    }

    // ------------------------------------------------------------------
    // Watches
    // ------------------------------------------------------------------

    pub async fn upsert_watch(&self, rec: &WatchRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO watches \
             (id, symbol, side, trigger_type, threshold_pct, target_price, mode, expiry_ts, status, preset_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &rec.id,
                &rec.symbol,
                &rec.side,
                &rec.trigger_type,
                rec.threshold_pct,
                rec.target_price,
                &rec.mode,
                rec.expiry_ts,
                &rec.status,
                rec.preset_json.as_deref(),
                rec.created_at,
            ],
        )?;
        Ok(())
    }

    pub async fn update_watch_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE watches SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    pub async fn load_watches(&self, active_only: bool) -> Result<Vec<WatchRecord>> {
        let conn = self.conn.lock().await;
        let sql = if active_only {
            "SELECT id, symbol, side, trigger_type, threshold_pct, target_price, mode, expiry_ts, status, preset_json, created_at \
             FROM watches WHERE status = 'ACTIVE' ORDER BY created_at ASC"
        } else {
            "SELECT id, symbol, side, trigger_type, threshold_pct, target_price, mode, expiry_ts, status, preset_json, created_at \
             FROM watches ORDER BY created_at ASC"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(WatchRecord {
                id: row.get(0)?,
                symbol: row.get(1)?,
                side: row.get(2)?,
                trigger_type: row.get(3)?,
                threshold_pct: row.get(4)?,
                target_price: row.get(5)?,
                mode: row.get(6)?,
                expiry_ts: row.get(7)?,
                status: row.get(8)?,
                preset_json: row.get(9)?,
                created_at: row.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows.flatten() {
            out.push(r);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT value FROM settings WHERE key = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![key])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    pub async fn set_setting(&self, key: &str, value: &str, updated_at: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, updated_at],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-symbol configuration
    // ------------------------------------------------------------------

    pub async fn get_symbol_config(&self, symbol: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT config_json FROM symbol_configs WHERE symbol = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![symbol])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    pub async fn set_symbol_config(
        &self,
        symbol: &str,
        config_json: &str,
        updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO symbol_configs (symbol, config_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET
                config_json = excluded.config_json,
                updated_at = excluded.updated_at",
            params![symbol, config_json, updated_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventType};

    fn db() -> AgentDb {
        AgentDb::in_memory().expect("db")
    }

    fn trade(id: &str, symbol: &str) -> TradeRecord {
        TradeRecord {
            trade_id: id.to_string(),
            symbol: symbol.to_string(),
            side: "LONG".to_string(),
            status: "EXECUTED".to_string(),
            contract_json: "{}".to_string(),
            entry_price: Some(100.0),
            size: Some(0.5),
            opened_at: 1_700_000_000_000,
            closed_at: None,
            exit_reason: None,
            realized_pnl: None,
        }
    }

    #[tokio::test]
    async fn trade_round_trip_and_close() {
        let db = db();
        db.insert_trade(&trade("t1", "BTCUSDT")).await.unwrap();
        db.insert_trade(&trade("t2", "ETHUSDT")).await.unwrap();

        let open = db.load_open_trades().await.unwrap();
        assert_eq!(open.len(), 2);

        db.close_trade("t1", 1_700_000_100_000, "STOP_LOSS", Some(-12.5))
            .await
            .unwrap();
        let open = db.load_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, "t2");

        let all = db.list_trades(10).await.unwrap();
        let closed = all.iter().find(|t| t.trade_id == "t1").unwrap();
        assert_eq!(closed.exit_reason.as_deref(), Some("STOP_LOSS"));
        assert_eq!(closed.realized_pnl, Some(-12.5));
    }

    #[tokio::test]
    async fn events_are_append_only_and_listable() {
        let db = db();
        let e = Event::new(EventType::EntryPlaced, "entry").with_symbol("BTCUSDT");
        db.insert_event(&e).await.unwrap();
        // Re-inserting the same id must not duplicate.
        db.insert_event(&e).await.unwrap();

        let events = db.list_events(Some("BTCUSDT"), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::EntryPlaced);
    }

    #[tokio::test]
    async fn reopening_the_db_rehydrates_open_trades() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.db");
        let path = path.to_str().unwrap();

        {
            let db = AgentDb::new(path).unwrap();
            let mut rec = trade("t1", "BTCUSDT");
            rec.contract_json = r#"{"side":"LONG"}"#.to_string();
            db.insert_trade(&rec).await.unwrap();
        }

        // Fresh handle over the same file: identical row comes back.
        let db = AgentDb::new(path).unwrap();
        let open = db.load_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, "t1");
        assert_eq!(open[0].contract_json, r#"{"side":"LONG"}"#);
        assert_eq!(open[0].entry_price, Some(100.0));
    }

    #[tokio::test]
    async fn symbol_config_round_trip() {
        let db = db();
        assert_eq!(db.get_symbol_config("BTCUSDT").await.unwrap(), None);
        db.set_symbol_config("BTCUSDT", r#"{"default_risk_pct":2.0}"#, 1)
            .await
            .unwrap();
        db.set_symbol_config("BTCUSDT", r#"{"default_risk_pct":1.5}"#, 2)
            .await
            .unwrap();
        assert_eq!(
            db.get_symbol_config("BTCUSDT").await.unwrap().as_deref(),
            Some(r#"{"default_risk_pct":1.5}"#)
        );
    }

    #[tokio::test]
    async fn settings_upsert() {
        let db = db();
        db.set_setting("paused", "true", 1).await.unwrap();
        db.set_setting("paused", "false", 2).await.unwrap();
        assert_eq!(
            db.get_setting("paused").await.unwrap().as_deref(),
            Some("false")
        );
        assert_eq!(db.get_setting("missing").await.unwrap(), None);
    }
}
