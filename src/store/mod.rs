//! Durable state: one sqlite database holding trades, orders, the event
//! queue, the decision audit, working memory, experiments and system
//! flags.
//!
//! Key choices:
//! - WAL mode for concurrent reads during writes
//! - Schema applied idempotently from a single batch
//! - All multi-row mutations inside explicit transactions
//! - Repositories are `impl Db` blocks, one module per aggregate

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

pub mod decisions;
pub mod events;
pub mod experiments;
pub mod fallback;
pub mod memory;
pub mod orders;
pub mod state;
pub mod trades;

pub use decisions::{DecisionRecord, PendingApproval};
pub use events::{EventRow, EventState};
pub use experiments::{ArmStats, ExperimentRow, ExperimentStatus, PatternRow, PatternStatus};
pub use memory::WorkingMemoryRow;
pub use state::CostCounters;
pub use trades::NewTrade;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT UNIQUE,
    symbol TEXT NOT NULL,
    right TEXT NOT NULL,
    strike REAL NOT NULL,
    expiration TEXT NOT NULL,
    contracts INTEGER NOT NULL CHECK (contracts > 0),
    entry_premium REAL,
    entry_time TEXT,
    exit_premium REAL,
    exit_time TEXT,
    exit_kind TEXT,
    realized_pnl REAL,
    commission REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    strategy_tag TEXT NOT NULL,
    rolled_from INTEGER REFERENCES trades(id),
    roll_count INTEGER NOT NULL DEFAULT 0,
    experiment_arm TEXT,
    needs_reconciliation INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_status_exp ON trades(status, expiration);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_status ON trades(symbol, status);

CREATE TABLE IF NOT EXISTS entry_snapshots (
    trade_id INTEGER PRIMARY KEY REFERENCES trades(id),
    captured_at TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    strike_selection_method TEXT NOT NULL,
    original_strike REAL NOT NULL,
    live_delta_at_selection REAL
);

CREATE TABLE IF NOT EXISTS exit_snapshots (
    trade_id INTEGER PRIMARY KEY REFERENCES trades(id),
    captured_at TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    strike_selection_method TEXT NOT NULL,
    original_strike REAL NOT NULL,
    live_delta_at_selection REAL
);

CREATE TABLE IF NOT EXISTS staged_opportunities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    original_strike REAL NOT NULL,
    strike REAL NOT NULL,
    target_delta REAL NOT NULL,
    target_dte INTEGER NOT NULL,
    expiration TEXT NOT NULL,
    limit_price REAL NOT NULL,
    contracts INTEGER NOT NULL,
    underlying_price REAL NOT NULL,
    live_delta REAL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staged_status ON staged_opportunities(status, created_at);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broker_order_id TEXT NOT NULL UNIQUE,
    parent_broker_order_id TEXT,
    trade_id INTEGER REFERENCES trades(id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    limit_price REAL NOT NULL,
    order_type TEXT NOT NULL,
    tif TEXT NOT NULL,
    state TEXT NOT NULL,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    avg_fill_price REAL,
    commission REAL NOT NULL DEFAULT 0,
    last_broker_status TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_trade ON orders(trade_id);
CREATE INDEX IF NOT EXISTS idx_orders_state ON orders(state);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    scheduled_for TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    not_before INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    claimed_at INTEGER,
    processed_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_events_scheduled
    ON events(event_type, scheduled_for) WHERE scheduled_for IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_events_state ON events(state, priority DESC, id);

CREATE TABLE IF NOT EXISTS event_consumptions (
    event_id INTEGER NOT NULL,
    consumer TEXT NOT NULL,
    processed_at INTEGER NOT NULL,
    PRIMARY KEY (event_id, consumer)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    event_id INTEGER,
    context_json TEXT NOT NULL,
    output_json TEXT NOT NULL,
    action TEXT NOT NULL,
    result_json TEXT NOT NULL DEFAULT '{}',
    autonomy_level INTEGER NOT NULL,
    cost_usd REAL NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_decisions_session ON decisions(session_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_decisions_action ON decisions(action, created_at DESC);

CREATE TABLE IF NOT EXISTS decision_embeddings (
    decision_id TEXT PRIMARY KEY REFERENCES decisions(id),
    summary TEXT NOT NULL,
    vector_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS working_memory (
    session_id TEXT PRIMARY KEY,
    strategy_json TEXT NOT NULL,
    experiments_json TEXT NOT NULL DEFAULT '[]',
    performance_json TEXT NOT NULL DEFAULT '{}',
    anomalies_json TEXT NOT NULL DEFAULT '[]',
    autonomy_level INTEGER NOT NULL,
    autonomy_json TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS experiments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    parameter TEXT NOT NULL,
    control_value REAL NOT NULL,
    test_value REAL NOT NULL,
    allocation REAL NOT NULL,
    min_samples INTEGER NOT NULL,
    control_json TEXT NOT NULL DEFAULT '{}',
    test_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    decision_reason TEXT,
    started_at TEXT NOT NULL,
    deadline TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);

CREATE TABLE IF NOT EXISTS patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    name TEXT NOT NULL,
    sample_size INTEGER NOT NULL,
    win_rate REAL NOT NULL,
    avg_roi REAL NOT NULL,
    confidence REAL NOT NULL,
    p_value REAL NOT NULL,
    effect_size REAL NOT NULL,
    status TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    UNIQUE (category, name)
);

CREATE TABLE IF NOT EXISTS system_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS earnings_calendar (
    symbol TEXT NOT NULL,
    report_date TEXT NOT NULL,
    PRIMARY KEY (symbol, report_date)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS discrepancies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    broker_order_id TEXT,
    trade_id INTEGER,
    detail TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
"#;

/// Shared handle to the daemon database. Cheap to clone; a single
/// connection guarded by a mutex keeps write ordering deterministic.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // we handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        Self::init(conn, Some(db_path))
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<&str>) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        if let Some(path) = path {
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap_or_default();
            if journal_mode.to_lowercase() != "wal" {
                warn!("WAL mode not active, journal_mode = {}", journal_mode);
            }
            info!("📊 Database initialized at: {}", path);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_twice() {
        let db = Db::open_in_memory().unwrap();
        // idempotent re-apply
        db.lock().execute_batch(SCHEMA_SQL).unwrap();
    }

    #[test]
    fn on_disk_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("putbot.db");
        let db = Db::open(path.to_str().unwrap()).unwrap();
        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
