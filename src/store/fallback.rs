//! Fallback decision log: when the database is unavailable mid-flight,
//! decisions are appended to a local JSONL file and replayed into the
//! audit on recovery. No trading proceeds without persistence; this
//! only preserves the records that were already in motion.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{info, warn};

use super::{Db, DecisionRecord};

pub fn fallback_path(database_path: &str) -> String {
    format!("{database_path}.fallback.jsonl")
}

pub fn append_fallback(path: &str, record: &DecisionRecord) -> Result<()> {
    let line = serde_json::json!({
        "id": record.id,
        "session_id": record.session_id,
        "event_id": record.event_id,
        "context_json": record.context_json,
        "output_json": record.output_json,
        "action": record.action,
        "result_json": record.result_json,
        "autonomy_level": record.autonomy_level,
        "cost_usd": record.cost_usd,
        "created_at": record.created_at,
    });
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open fallback log {path}"))?;
    writeln!(file, "{line}").context("append fallback record")
}

/// Replay the fallback log into the audit, then truncate it. Records
/// already present (same id) are skipped, so replay is idempotent.
pub fn replay_fallback(db: &Db, path: &str) -> Result<usize> {
    if !Path::new(path).exists() {
        return Ok(0);
    }
    let file = std::fs::File::open(path).with_context(|| format!("open {path}"))?;
    let mut replayed = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("fallback line unparseable, skipped: {e}");
                continue;
            }
        };
        let record = DecisionRecord {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            session_id: value["session_id"].as_str().unwrap_or_default().to_string(),
            event_id: value["event_id"].as_i64(),
            context_json: value["context_json"].as_str().unwrap_or("{}").to_string(),
            output_json: value["output_json"].as_str().unwrap_or("{}").to_string(),
            action: value["action"].as_str().unwrap_or("MONITOR_ONLY").to_string(),
            result_json: value["result_json"].as_str().unwrap_or("{}").to_string(),
            autonomy_level: value["autonomy_level"].as_i64().unwrap_or(0),
            cost_usd: value["cost_usd"].as_f64().unwrap_or(0.0),
            created_at: value["created_at"].as_i64().unwrap_or(0),
        };
        if record.id.is_empty() || db.get_decision(&record.id)?.is_some() {
            continue;
        }
        db.insert_decision(&record)?;
        replayed += 1;
    }
    std::fs::remove_file(path).with_context(|| format!("truncate {path}"))?;
    if replayed > 0 {
        info!(replayed, "fallback decisions replayed into the audit");
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_unix;

    fn record(id: &str) -> DecisionRecord {
        DecisionRecord {
            id: id.to_string(),
            session_id: "s".into(),
            event_id: Some(1),
            context_json: "{}".into(),
            output_json: "{}".into(),
            action: "MONITOR_ONLY".into(),
            result_json: "{}".into(),
            autonomy_level: 2,
            cost_usd: 0.0,
            created_at: now_unix(),
        }
    }

    #[test]
    fn append_then_replay_then_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("putbot.db.fallback.jsonl");
        let path = path.to_str().unwrap();

        append_fallback(path, &record("f1")).unwrap();
        append_fallback(path, &record("f2")).unwrap();

        let db = Db::open_in_memory().unwrap();
        // one already landed before the outage resolved
        db.insert_decision(&record("f1")).unwrap();

        let replayed = replay_fallback(&db, path).unwrap();
        assert_eq!(replayed, 1);
        assert!(db.get_decision("f2").unwrap().is_some());
        // log consumed; a second replay is a no-op
        assert_eq!(replay_fallback(&db, path).unwrap(), 0);
    }
}
