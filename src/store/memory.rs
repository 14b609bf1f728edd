//! Working-memory persistence: one row per session, JSON columns for the
//! strategy/experiment/performance/anomaly payloads. The `memory` module
//! owns the typed view; this layer only moves rows.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix, Db};

#[derive(Debug, Clone)]
pub struct WorkingMemoryRow {
    pub session_id: String,
    pub strategy_json: String,
    pub experiments_json: String,
    pub performance_json: String,
    pub anomalies_json: String,
    pub autonomy_level: i64,
    pub autonomy_json: String,
    pub updated_at: i64,
}

fn row_from_row(row: &Row) -> rusqlite::Result<WorkingMemoryRow> {
    Ok(WorkingMemoryRow {
        session_id: row.get("session_id")?,
        strategy_json: row.get("strategy_json")?,
        experiments_json: row.get("experiments_json")?,
        performance_json: row.get("performance_json")?,
        anomalies_json: row.get("anomalies_json")?,
        autonomy_level: row.get("autonomy_level")?,
        autonomy_json: row.get("autonomy_json")?,
        updated_at: row.get("updated_at")?,
    })
}

const WM_COLS: &str = "session_id, strategy_json, experiments_json, performance_json, \
     anomalies_json, autonomy_level, autonomy_json, updated_at";

impl Db {
    /// Atomic whole-row upsert; readers observe pre- or post-state only.
    pub fn upsert_working_memory(&self, row: &WorkingMemoryRow) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO working_memory (session_id, strategy_json, experiments_json, \
             performance_json, anomalies_json, autonomy_level, autonomy_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(session_id) DO UPDATE SET \
             strategy_json = excluded.strategy_json, \
             experiments_json = excluded.experiments_json, \
             performance_json = excluded.performance_json, \
             anomalies_json = excluded.anomalies_json, \
             autonomy_level = excluded.autonomy_level, \
             autonomy_json = excluded.autonomy_json, \
             updated_at = excluded.updated_at",
            params![
                row.session_id,
                row.strategy_json,
                row.experiments_json,
                row.performance_json,
                row.anomalies_json,
                row.autonomy_level,
                row.autonomy_json,
                now_unix(),
            ],
        )
        .context("upsert working memory")?;
        Ok(())
    }

    pub fn load_working_memory(&self, session_id: &str) -> Result<Option<WorkingMemoryRow>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {WM_COLS} FROM working_memory WHERE session_id = ?1"),
            params![session_id],
            row_from_row,
        )
        .optional()
        .context("load working memory")
    }

    /// Most recently updated session row; a fresh session inherits its
    /// final state.
    pub fn latest_working_memory(&self) -> Result<Option<WorkingMemoryRow>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {WM_COLS} FROM working_memory ORDER BY updated_at DESC LIMIT 1"),
            [],
            row_from_row,
        )
        .optional()
        .context("latest working memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(session_id: &str) -> WorkingMemoryRow {
        WorkingMemoryRow {
            session_id: session_id.to_string(),
            strategy_json: r#"{"target_delta":0.065}"#.into(),
            experiments_json: "[]".into(),
            performance_json: "{}".into(),
            anomalies_json: "[]".into(),
            autonomy_level: 2,
            autonomy_json: "{}".into(),
            updated_at: 0,
        }
    }

    #[test]
    fn single_row_per_session() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_working_memory(&sample_row("s1")).unwrap();

        let mut updated = sample_row("s1");
        updated.autonomy_level = 3;
        db.upsert_working_memory(&updated).unwrap();

        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM working_memory", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            db.load_working_memory("s1").unwrap().unwrap().autonomy_level,
            3
        );
    }

    #[test]
    fn latest_session_carries_over() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_working_memory(&sample_row("s1")).unwrap();
        // ensure distinct updated_at ordering
        db.lock()
            .execute("UPDATE working_memory SET updated_at = updated_at - 100", [])
            .unwrap();
        db.upsert_working_memory(&sample_row("s2")).unwrap();

        let latest = db.latest_working_memory().unwrap().unwrap();
        assert_eq!(latest.session_id, "s2");
    }
}
