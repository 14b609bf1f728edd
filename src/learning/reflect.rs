//! End-of-day reflection: summarize the day's decisions and outcomes
//! into a retrievable record. Reflection may surface experiment ideas
//! upstream but never touches strategy parameters itself.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;

use crate::store::{Db, DecisionRecord};

pub struct DayReflection {
    pub summary: String,
    pub record: DecisionRecord,
}

/// Build the reflection for the current session day from the audit and
/// the closed-trade book.
pub fn reflect_on_day(db: &Db, session_id: &str) -> Result<DayReflection> {
    let day_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc();

    let decisions = db.recent_decisions(200)?;
    let mut action_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut todays = 0usize;
    for decision in &decisions {
        if decision.created_at >= day_start.timestamp() {
            todays += 1;
            *action_counts.entry(decision.action.clone()).or_insert(0) += 1;
        }
    }

    let realized = db.realized_pnl_between(day_start, Utc::now())?;
    let opened = db.positions_opened_since(day_start)?;
    let cost = db.cost_since(day_start.timestamp())?;

    let actions: Vec<String> = action_counts
        .iter()
        .map(|(action, n)| format!("{action}x{n}"))
        .collect();
    let summary = format!(
        "reflection {}: {} decisions [{}], {} opened, realized {:+.2}, engine spend ${:.2}",
        Utc::now().date_naive(),
        todays,
        actions.join(" "),
        opened,
        realized,
        cost
    );

    let record = DecisionRecord {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        event_id: None,
        context_json: json!({
            "kind": "end_of_day_reflection",
            "decision_count": todays,
            "actions": action_counts,
            "opened": opened,
            "realized_pnl": realized,
        })
        .to_string(),
        output_json: json!({"summary": summary}).to_string(),
        action: "END_OF_DAY_REFLECTION".to_string(),
        result_json: json!({"status": "recorded"}).to_string(),
        autonomy_level: 0,
        cost_usd: 0.0,
        created_at: Utc::now().timestamp(),
    };

    Ok(DayReflection { summary, record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_unix;

    #[test]
    fn reflection_counts_todays_decisions() {
        let db = Db::open_in_memory().unwrap();
        for (id, action, age) in [
            ("d1", "MONITOR_ONLY", 0_i64),
            ("d2", "EXECUTE_TRADES", 0),
            ("d3", "MONITOR_ONLY", 3 * 86_400),
        ] {
            db.insert_decision(&DecisionRecord {
                id: id.into(),
                session_id: "s".into(),
                event_id: None,
                context_json: "{}".into(),
                output_json: "{}".into(),
                action: action.into(),
                result_json: "{}".into(),
                autonomy_level: 2,
                cost_usd: 0.01,
                created_at: now_unix() - age,
            })
            .unwrap();
        }

        let reflection = reflect_on_day(&db, "s").unwrap();
        assert!(reflection.summary.contains("2 decisions"));
        assert!(reflection.summary.contains("EXECUTE_TRADESx1"));
        assert_eq!(reflection.record.action, "END_OF_DAY_REFLECTION");
    }
}
