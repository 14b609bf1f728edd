//! System flags: kill switch, heartbeat, and the daily engine budget.
//! Written through this module so a restart observes them before any
//! event is processed.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{now_unix, Db};

const KEY_HALTED: &str = "trading_halted";
const KEY_HALT_REASON: &str = "halt_reason";
const KEY_HEARTBEAT: &str = "last_heartbeat";
const KEY_ACTIVITY: &str = "current_activity";
const KEY_ENGINE_BUDGET: &str = "engine_budget";
const KEY_PEAK_EQUITY: &str = "peak_equity";

/// Daily LLM spend counters; reset at session rollover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostCounters {
    pub day_start: i64,
    pub calls: u32,
    pub tokens: u64,
    pub cost_usd: f64,
}

impl Db {
    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO system_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("system_state set")?;
        Ok(())
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT value FROM system_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("system_state get")
    }

    pub fn set_kill_switch(&self, halted: bool, reason: &str) -> Result<()> {
        self.kv_set(KEY_HALTED, if halted { "1" } else { "0" })?;
        self.kv_set(KEY_HALT_REASON, reason)
    }

    pub fn kill_switch(&self) -> Result<(bool, Option<String>)> {
        let halted = self.kv_get(KEY_HALTED)?.as_deref() == Some("1");
        let reason = self.kv_get(KEY_HALT_REASON)?.filter(|s| !s.is_empty());
        Ok((halted, reason))
    }

    pub fn heartbeat(&self, activity: &str) -> Result<()> {
        self.kv_set(KEY_HEARTBEAT, &now_unix().to_string())?;
        self.kv_set(KEY_ACTIVITY, activity)
    }

    pub fn last_heartbeat(&self) -> Result<Option<(i64, String)>> {
        let ts = self
            .kv_get(KEY_HEARTBEAT)?
            .and_then(|s| s.parse::<i64>().ok());
        let activity = self.kv_get(KEY_ACTIVITY)?.unwrap_or_default();
        Ok(ts.map(|t| (t, activity)))
    }

    /// Track the equity high-water mark for the drawdown check.
    /// Returns the current peak after folding in `equity`.
    pub fn observe_equity(&self, equity: f64) -> Result<f64> {
        let prior = self
            .kv_get(KEY_PEAK_EQUITY)?
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let peak = prior.max(equity);
        if peak > prior {
            self.kv_set(KEY_PEAK_EQUITY, &format!("{peak:.2}"))?;
        }
        Ok(peak)
    }

    pub fn engine_budget(&self) -> Result<CostCounters> {
        match self.kv_get(KEY_ENGINE_BUDGET)? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(CostCounters::default()),
        }
    }

    pub fn save_engine_budget(&self, counters: &CostCounters) -> Result<()> {
        self.kv_set(KEY_ENGINE_BUDGET, &serde_json::to_string(counters)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_round_trip() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.kill_switch().unwrap(), (false, None));

        db.set_kill_switch(true, "shutdown").unwrap();
        let (halted, reason) = db.kill_switch().unwrap();
        assert!(halted);
        assert_eq!(reason.as_deref(), Some("shutdown"));

        db.set_kill_switch(false, "").unwrap();
        assert_eq!(db.kill_switch().unwrap(), (false, None));
    }

    #[test]
    fn budget_persists() {
        let db = Db::open_in_memory().unwrap();
        let counters = CostCounters {
            day_start: 1_700_000_000,
            calls: 12,
            tokens: 48_000,
            cost_usd: 0.43,
        };
        db.save_engine_budget(&counters).unwrap();
        let got = db.engine_budget().unwrap();
        assert_eq!(got.calls, 12);
        assert_eq!(got.tokens, 48_000);
    }
}
