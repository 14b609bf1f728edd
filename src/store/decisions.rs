//! Decision audit (append-only) and embedding store for similar-context
//! retrieval.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix, Db};

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub id: String,
    pub session_id: String,
    pub event_id: Option<i64>,
    pub context_json: String,
    pub output_json: String,
    pub action: String,
    pub result_json: String,
    pub autonomy_level: i64,
    pub cost_usd: f64,
    pub created_at: i64,
}

fn decision_from_row(row: &Row) -> rusqlite::Result<DecisionRecord> {
    Ok(DecisionRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        event_id: row.get("event_id")?,
        context_json: row.get("context_json")?,
        output_json: row.get("output_json")?,
        action: row.get("action")?,
        result_json: row.get("result_json")?,
        autonomy_level: row.get("autonomy_level")?,
        cost_usd: row.get("cost_usd")?,
        created_at: row.get("created_at")?,
    })
}

const DECISION_COLS: &str = "id, session_id, event_id, context_json, output_json, action, \
     result_json, autonomy_level, cost_usd, created_at";

/// A decision blocked by the autonomy governor, waiting on an operator.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub decision_id: String,
    pub action: String,
    pub urgency: Option<String>,
    pub created_at: i64,
}

impl Db {
    pub fn insert_decision(&self, decision: &DecisionRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO decisions (id, session_id, event_id, context_json, output_json, \
             action, result_json, autonomy_level, cost_usd, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                decision.id,
                decision.session_id,
                decision.event_id,
                decision.context_json,
                decision.output_json,
                decision.action,
                decision.result_json,
                decision.autonomy_level,
                decision.cost_usd,
                decision.created_at,
            ],
        )
        .context("insert decision")?;
        Ok(())
    }

    /// The only post-insert mutation: attaching the execution result.
    pub fn update_decision_result(&self, decision_id: &str, result_json: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE decisions SET result_json = ?2 WHERE id = ?1",
            params![decision_id, result_json],
        )?;
        Ok(())
    }

    pub fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {DECISION_COLS} FROM decisions WHERE id = ?1"),
            params![decision_id],
            decision_from_row,
        )
        .optional()
        .context("get decision")
    }

    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DECISION_COLS} FROM decisions ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], decision_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("recent decisions")
    }

    pub fn insert_decision_embedding(
        &self,
        decision_id: &str,
        summary: &str,
        vector: &[f32],
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO decision_embeddings (decision_id, summary, vector_json) \
             VALUES (?1, ?2, ?3)",
            params![decision_id, summary, serde_json::to_string(vector)?],
        )
        .context("insert decision embedding")?;
        Ok(())
    }

    /// Embeddings eligible for retrieval: decisions older than `cutoff`
    /// (unix seconds), newest first, bounded. Paired with the decision's
    /// recorded outcome so retrieval can show what happened next.
    pub fn embeddings_before(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<(String, String, Vec<f32>, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT e.decision_id, e.summary, e.vector_json, d.result_json \
             FROM decision_embeddings e JOIN decisions d ON d.id = e.decision_id \
             WHERE d.created_at < ?1 ORDER BY d.created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, summary, vector_json, result_json) = row?;
            let vector: Vec<f32> = serde_json::from_str(&vector_json).unwrap_or_default();
            out.push((id, summary, vector, result_json));
        }
        Ok(out)
    }

    pub fn pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, action, json_extract(result_json, '$.urgency'), created_at \
             FROM decisions WHERE json_extract(result_json, '$.status') = 'queued_for_approval' \
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingApproval {
                decision_id: row.get(0)?,
                action: row.get(1)?,
                urgency: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("pending approvals")
    }

    /// Engine spend since `day_start` (unix seconds).
    pub fn cost_since(&self, day_start: i64) -> Result<f64> {
        let conn = self.lock();
        let cost: Option<f64> = conn.query_row(
            "SELECT SUM(cost_usd) FROM decisions WHERE created_at >= ?1",
            params![day_start],
            |row| row.get(0),
        )?;
        Ok(cost.unwrap_or(0.0))
    }

    pub fn decisions_since(&self, day_start: i64) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM decisions WHERE created_at >= ?1",
            params![day_start],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_decision(id: &str, result_json: &str) -> DecisionRecord {
        DecisionRecord {
            id: id.to_string(),
            session_id: "putbot-2025-07-14".into(),
            event_id: Some(1),
            context_json: "{}".into(),
            output_json: "{}".into(),
            action: "MONITOR_ONLY".into(),
            result_json: result_json.to_string(),
            autonomy_level: 2,
            cost_usd: 0.004,
            created_at: now_unix(),
        }
    }

    #[test]
    fn audit_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.insert_decision(&sample_decision("d1", "{}")).unwrap();
        db.update_decision_result("d1", r#"{"status":"executed"}"#)
            .unwrap();
        let got = db.get_decision("d1").unwrap().unwrap();
        assert_eq!(got.action, "MONITOR_ONLY");
        assert!(got.result_json.contains("executed"));
    }

    #[test]
    fn pending_approval_queue() {
        let db = Db::open_in_memory().unwrap();
        db.insert_decision(&sample_decision("d1", "{}")).unwrap();
        db.insert_decision(&sample_decision(
            "d2",
            r#"{"status":"queued_for_approval","urgency":"high"}"#,
        ))
        .unwrap();

        let queue = db.pending_approvals().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].decision_id, "d2");
        assert_eq!(queue[0].urgency.as_deref(), Some("high"));
    }

    #[test]
    fn embeddings_exclude_recent() {
        let db = Db::open_in_memory().unwrap();
        db.insert_decision(&sample_decision("d1", "{}")).unwrap();
        db.insert_decision_embedding("d1", "sold XSP 560p", &[0.1, 0.2])
            .unwrap();

        // cutoff before the decision excludes it, cutoff after includes it
        assert!(db.embeddings_before(now_unix() - 3600, 10).unwrap().is_empty());
        let rows = db.embeddings_before(now_unix() + 10, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2.len(), 2);
    }
}
