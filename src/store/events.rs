//! Durable event queue. At-least-once delivery: rows are claimed into
//! `processing` under the connection lock, acked to `done`, and failures
//! retry with exponential backoff until the retry budget is spent.
//! Exactly-once effect comes from the `(event_id, consumer)` dedup table.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix, Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::Processing => "processing",
            EventState::Done => "done",
            EventState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub event_type: String,
    pub payload_json: String,
    pub state: EventState,
    pub priority: i64,
    pub scheduled_for: Option<String>,
    pub retries: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

fn event_from_row(row: &Row) -> rusqlite::Result<EventRow> {
    let state: String = row.get("state")?;
    Ok(EventRow {
        id: row.get("id")?,
        event_type: row.get("event_type")?,
        payload_json: row.get("payload_json")?,
        state: EventState::parse(&state).unwrap_or(EventState::Pending),
        priority: row.get("priority")?,
        scheduled_for: row.get("scheduled_for")?,
        retries: row.get("retries")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
    })
}

const EVENT_COLS: &str =
    "id, event_type, payload_json, state, priority, scheduled_for, retries, last_error, created_at";

impl Db {
    /// Durably insert a pending event; returns its id.
    pub fn publish_event(&self, event_type: &str, payload_json: &str, priority: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (event_type, payload_json, priority, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, payload_json, priority, now_unix()],
        )
        .context("publish event")?;
        Ok(conn.last_insert_rowid())
    }

    /// Calendar-materialised event, deduped by `(type, scheduled_for)`.
    /// Returns `None` when the slot was already emitted.
    pub fn publish_scheduled_event(
        &self,
        event_type: &str,
        payload_json: &str,
        priority: i64,
        scheduled_for: &str,
    ) -> Result<Option<i64>> {
        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO events \
                 (event_type, payload_json, priority, scheduled_for, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_type, payload_json, priority, scheduled_for, now_unix()],
            )
            .context("publish scheduled event")?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Claim the next runnable event: critical-priority rows drain ahead
    /// of normal ones, FIFO within a priority band. The claimed row moves
    /// to `processing` before the lock is released.
    pub fn claim_next_event(&self) -> Result<Option<EventRow>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_unix();

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM events WHERE state = 'pending' AND not_before <= ?1 \
                 ORDER BY priority DESC, id ASC LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE events SET state = 'processing', claimed_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        let row = tx.query_row(
            &format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1"),
            params![id],
            event_from_row,
        )?;
        tx.commit()?;
        Ok(Some(row))
    }

    pub fn mark_event_done(&self, event_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE events SET state = 'done', processed_at = ?2, last_error = NULL \
             WHERE id = ?1",
            params![event_id, now_unix()],
        )?;
        Ok(())
    }

    /// Retry with exponential backoff (30s, 60s, 120s ...) until
    /// `max_retries` is exhausted, then park the row as `failed`.
    pub fn mark_event_failed(&self, event_id: i64, error: &str, max_retries: i64) -> Result<EventState> {
        let conn = self.lock();
        let retries: i64 = conn.query_row(
            "SELECT retries FROM events WHERE id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;

        if retries < max_retries {
            let backoff_secs = 30_i64 << retries;
            conn.execute(
                "UPDATE events SET state = 'pending', retries = retries + 1, \
                 last_error = ?2, not_before = ?3 WHERE id = ?1",
                params![event_id, error, now_unix() + backoff_secs],
            )?;
            Ok(EventState::Pending)
        } else {
            conn.execute(
                "UPDATE events SET state = 'failed', processed_at = ?3, last_error = ?2 \
                 WHERE id = ?1",
                params![event_id, error, now_unix()],
            )?;
            Ok(EventState::Failed)
        }
    }

    /// Rows stuck in `processing` longer than `max_runtime_secs` belong
    /// to a presumed-crashed consumer; requeue them.
    pub fn requeue_stuck_events(&self, max_runtime_secs: i64) -> Result<usize> {
        let conn = self.lock();
        let cutoff = now_unix() - max_runtime_secs;
        let n = conn.execute(
            "UPDATE events SET state = 'pending', retries = retries + 1, \
             last_error = 'requeued: consumer presumed crashed' \
             WHERE state = 'processing' AND claimed_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    /// Idempotency gate: returns false when this consumer already
    /// processed the event (replay must be a no-op).
    pub fn record_consumption(&self, event_id: i64, consumer: &str) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO event_consumptions (event_id, consumer, processed_at) \
             VALUES (?1, ?2, ?3)",
            params![event_id, consumer, now_unix()],
        )?;
        Ok(inserted > 0)
    }

    pub fn event_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM events GROUP BY state ORDER BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("event counts")
    }

    pub fn get_event(&self, event_id: i64) -> Result<Option<EventRow>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1"),
            params![event_id],
            event_from_row,
        )
        .optional()
        .context("get event")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_critical_fast_lane() {
        let db = Db::open_in_memory().unwrap();
        db.publish_event("SCHEDULED_CHECK", "{}", 0).unwrap();
        db.publish_event("MARKET_OPEN", "{}", 0).unwrap();
        db.publish_event("ORDER_FILLED", "{}", 1).unwrap();

        // critical first, then insertion order
        let first = db.claim_next_event().unwrap().unwrap();
        assert_eq!(first.event_type, "ORDER_FILLED");
        let second = db.claim_next_event().unwrap().unwrap();
        assert_eq!(second.event_type, "SCHEDULED_CHECK");
        let third = db.claim_next_event().unwrap().unwrap();
        assert_eq!(third.event_type, "MARKET_OPEN");
        assert!(db.claim_next_event().unwrap().is_none());
    }

    #[test]
    fn scheduled_dedup_by_trading_date() {
        let db = Db::open_in_memory().unwrap();
        let first = db
            .publish_scheduled_event("MARKET_OPEN", "{}", 0, "2025-07-14")
            .unwrap();
        assert!(first.is_some());
        let dup = db
            .publish_scheduled_event("MARKET_OPEN", "{}", 0, "2025-07-14")
            .unwrap();
        assert!(dup.is_none());
        let next_day = db
            .publish_scheduled_event("MARKET_OPEN", "{}", 0, "2025-07-15")
            .unwrap();
        assert!(next_day.is_some());
    }

    #[test]
    fn retry_then_fail() {
        let db = Db::open_in_memory().unwrap();
        let id = db.publish_event("SCHEDULED_CHECK", "{}", 0).unwrap();
        db.claim_next_event().unwrap().unwrap();

        // first two failures requeue (with backoff in the future)
        assert_eq!(
            db.mark_event_failed(id, "boom", 2).unwrap(),
            EventState::Pending
        );
        // backoff means it is not immediately claimable
        assert!(db.claim_next_event().unwrap().is_none());

        // force the clock past the backoff for the test
        db.lock()
            .execute("UPDATE events SET not_before = 0 WHERE id = ?1", params![id])
            .unwrap();
        db.claim_next_event().unwrap().unwrap();
        assert_eq!(
            db.mark_event_failed(id, "boom", 2).unwrap(),
            EventState::Pending
        );

        db.lock()
            .execute("UPDATE events SET not_before = 0 WHERE id = ?1", params![id])
            .unwrap();
        db.claim_next_event().unwrap().unwrap();
        assert_eq!(
            db.mark_event_failed(id, "boom", 2).unwrap(),
            EventState::Failed
        );
    }

    #[test]
    fn consumption_dedup() {
        let db = Db::open_in_memory().unwrap();
        let id = db.publish_event("ORDER_FILLED", "{}", 1).unwrap();
        assert!(db.record_consumption(id, "orchestrator").unwrap());
        assert!(!db.record_consumption(id, "orchestrator").unwrap());
        assert!(db.record_consumption(id, "reconciler").unwrap());
    }

    #[test]
    fn stuck_events_requeued() {
        let db = Db::open_in_memory().unwrap();
        let id = db.publish_event("SCHEDULED_CHECK", "{}", 0).unwrap();
        db.claim_next_event().unwrap().unwrap();

        // fresh claim is not stuck
        assert_eq!(db.requeue_stuck_events(600).unwrap(), 0);

        db.lock()
            .execute(
                "UPDATE events SET claimed_at = claimed_at - 10000 WHERE id = ?1",
                params![id],
            )
            .unwrap();
        assert_eq!(db.requeue_stuck_events(600).unwrap(), 1);
        assert!(db.claim_next_event().unwrap().is_some());
    }
}
