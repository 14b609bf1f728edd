//! Trade + snapshot + staged-opportunity repositories.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{now_unix, Db};
use crate::models::{
    ExitKind, FillSnapshot, OptionRight, StagedOpportunity, StagedStatus, Trade, TradeStatus,
};

/// Fields needed to create a `pending` trade row at submission time.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub symbol: String,
    pub right: OptionRight,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub contracts: i64,
    pub strategy_tag: String,
    pub rolled_from: Option<i64>,
    pub roll_count: i64,
    pub experiment_arm: Option<String>,
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn trade_from_row(row: &Row) -> rusqlite::Result<Trade> {
    let right: String = row.get("right")?;
    let expiration: String = row.get("expiration")?;
    let status: String = row.get("status")?;
    let exit_kind: Option<String> = row.get("exit_kind")?;
    let entry_time: Option<String> = row.get("entry_time")?;
    let exit_time: Option<String> = row.get("exit_time")?;

    Ok(Trade {
        id: row.get("id")?,
        execution_id: row.get("execution_id")?,
        symbol: row.get("symbol")?,
        right: OptionRight::parse(&right).unwrap_or(OptionRight::Put),
        strike: row.get("strike")?,
        expiration: parse_date(&expiration),
        contracts: row.get("contracts")?,
        entry_premium: row.get("entry_premium")?,
        entry_time: entry_time.as_deref().map(parse_ts),
        exit_premium: row.get("exit_premium")?,
        exit_time: exit_time.as_deref().map(parse_ts),
        exit_kind: exit_kind.as_deref().and_then(ExitKind::parse),
        realized_pnl: row.get("realized_pnl")?,
        commission: row.get("commission")?,
        status: TradeStatus::parse(&status).unwrap_or(TradeStatus::Pending),
        strategy_tag: row.get("strategy_tag")?,
        rolled_from: row.get("rolled_from")?,
        roll_count: row.get("roll_count")?,
        experiment_arm: row.get("experiment_arm")?,
    })
}

const TRADE_COLS: &str = "id, execution_id, symbol, right, strike, expiration, contracts, \
     entry_premium, entry_time, exit_premium, exit_time, exit_kind, realized_pnl, commission, \
     status, strategy_tag, rolled_from, roll_count, experiment_arm";

impl Db {
    pub fn insert_pending_trade(&self, new: &NewTrade) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO trades (symbol, right, strike, expiration, contracts, status, \
             strategy_tag, rolled_from, roll_count, experiment_arm, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10)",
            params![
                new.symbol,
                new.right.as_str(),
                new.strike,
                new.expiration.format("%Y-%m-%d").to_string(),
                new.contracts,
                new.strategy_tag,
                new.rolled_from,
                new.roll_count,
                new.experiment_arm,
                now_unix(),
            ],
        )
        .context("insert pending trade")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_trade(&self, trade_id: i64) -> Result<Option<Trade>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {TRADE_COLS} FROM trades WHERE id = ?1"),
            params![trade_id],
            trade_from_row,
        )
        .optional()
        .context("get trade")
    }

    pub fn find_trade_by_execution_id(&self, execution_id: &str) -> Result<Option<Trade>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {TRADE_COLS} FROM trades WHERE execution_id = ?1"),
            params![execution_id],
            trade_from_row,
        )
        .optional()
        .context("find trade by execution id")
    }

    pub fn trades_with_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades WHERE status = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], trade_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("trades with status")
    }

    pub fn open_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades WHERE status IN ('open', 'closing') ORDER BY id"
        ))?;
        let rows = stmt.query_map([], trade_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("open trades")
    }

    /// Duplicate-position guard: any non-closed trade on the same contract.
    pub fn open_trade_on_contract(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        right: OptionRight,
    ) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1 AND strike = ?2 \
             AND expiration = ?3 AND right = ?4 AND status != 'closed'",
            params![
                symbol,
                strike,
                expiration.format("%Y-%m-%d").to_string(),
                right.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn mark_trade_working(&self, trade_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET status = 'working' WHERE id = ?1",
            params![trade_id],
        )?;
        Ok(())
    }

    /// Transition a trade to `open` and capture its entry snapshot in the
    /// same transaction. Either both land or neither does.
    pub fn mark_trade_open_with_snapshot(
        &self,
        trade_id: i64,
        execution_id: &str,
        entry_premium: f64,
        entry_time: DateTime<Utc>,
        commission: f64,
        snapshot: &FillSnapshot,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE trades SET status = 'open', execution_id = ?2, entry_premium = ?3, \
             entry_time = ?4, commission = commission + ?5 WHERE id = ?1",
            params![
                trade_id,
                execution_id,
                entry_premium,
                entry_time.to_rfc3339(),
                commission,
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO entry_snapshots \
             (trade_id, captured_at, payload_json, strike_selection_method, original_strike, \
              live_delta_at_selection) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                trade_id,
                snapshot.captured_at.to_rfc3339(),
                serde_json::to_string(snapshot)?,
                snapshot.selection_method.as_str(),
                snapshot.original_strike,
                snapshot.live_delta_at_selection,
            ],
        )?;
        tx.commit().context("commit open + entry snapshot")
    }

    /// Snapshot capture failed after a confirmed fill: open the trade
    /// anyway and flag it for reconciliation instead of orphaning it.
    pub fn mark_trade_open_needs_reconciliation(
        &self,
        trade_id: i64,
        execution_id: &str,
        entry_premium: f64,
        entry_time: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET status = 'open', execution_id = ?2, entry_premium = ?3, \
             entry_time = ?4, needs_reconciliation = 1 WHERE id = ?1",
            params![trade_id, execution_id, entry_premium, entry_time.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Partial-fill split is the only legal way contracts shrink.
    pub fn set_trade_contracts(&self, trade_id: i64, contracts: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET contracts = ?2 WHERE id = ?1 AND ?2 > 0 AND ?2 <= contracts",
            params![trade_id, contracts],
        )?;
        Ok(())
    }

    /// Remove a submission that never filled, detaching its order rows
    /// (they stay for audit). Guarded: rows with any entry premium
    /// recorded must go through the close path instead.
    pub fn discard_unfilled_trade(&self, trade_id: i64) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let eligible: i64 = tx.query_row(
            "SELECT COUNT(*) FROM trades WHERE id = ?1 AND entry_premium IS NULL \
             AND status IN ('pending', 'working')",
            params![trade_id],
            |row| row.get(0),
        )?;
        if eligible == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE orders SET trade_id = NULL WHERE trade_id = ?1",
            params![trade_id],
        )?;
        tx.execute("DELETE FROM trades WHERE id = ?1", params![trade_id])?;
        tx.commit()?;
        Ok(true)
    }

    pub fn mark_trade_closing(&self, trade_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET status = 'closing' WHERE id = ?1",
            params![trade_id],
        )?;
        Ok(())
    }

    /// A closing attempt that never filled puts the trade back to open.
    pub fn revert_trade_to_open(&self, trade_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET status = 'open' WHERE id = ?1 AND status = 'closing'",
            params![trade_id],
        )?;
        Ok(())
    }

    /// Stamp roll lineage on the replacement leg.
    pub fn set_trade_roll_lineage(
        &self,
        trade_id: i64,
        rolled_from: i64,
        roll_count: i64,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET rolled_from = ?2, roll_count = ?3 WHERE id = ?1",
            params![trade_id, rolled_from, roll_count],
        )?;
        Ok(())
    }

    /// Finalize a trade and capture the exit snapshot atomically.
    pub fn close_trade_with_snapshot(
        &self,
        trade_id: i64,
        exit_premium: f64,
        exit_time: DateTime<Utc>,
        exit_kind: ExitKind,
        realized_pnl: f64,
        commission: f64,
        snapshot: Option<&FillSnapshot>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE trades SET status = 'closed', exit_premium = ?2, exit_time = ?3, \
             exit_kind = ?4, realized_pnl = ?5, commission = commission + ?6 WHERE id = ?1",
            params![
                trade_id,
                exit_premium,
                exit_time.to_rfc3339(),
                exit_kind.as_str(),
                realized_pnl,
                commission,
            ],
        )?;
        if let Some(snapshot) = snapshot {
            tx.execute(
                "INSERT OR REPLACE INTO exit_snapshots \
                 (trade_id, captured_at, payload_json, strike_selection_method, original_strike, \
                  live_delta_at_selection) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    trade_id,
                    snapshot.captured_at.to_rfc3339(),
                    serde_json::to_string(snapshot)?,
                    snapshot.selection_method.as_str(),
                    snapshot.original_strike,
                    snapshot.live_delta_at_selection,
                ],
            )?;
        }
        tx.commit().context("commit close + exit snapshot")
    }

    pub fn entry_snapshot(&self, trade_id: i64) -> Result<Option<FillSnapshot>> {
        let conn = self.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM entry_snapshots WHERE trade_id = ?1",
                params![trade_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn closed_trades(&self, limit: usize) -> Result<Vec<Trade>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades WHERE status = 'closed' \
             ORDER BY exit_time DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], trade_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("closed trades")
    }

    /// Realized P&L over closed trades whose exit fell in `[start, end)`.
    pub fn realized_pnl_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64> {
        let conn = self.lock();
        let pnl: Option<f64> = conn.query_row(
            "SELECT SUM(realized_pnl) FROM trades WHERE status = 'closed' \
             AND exit_time >= ?1 AND exit_time < ?2",
            params![start.to_rfc3339(), end.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(pnl.unwrap_or(0.0))
    }

    pub fn positions_opened_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE entry_time >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Rolling average contracts over the last `n` filled trades; used by
    /// the autonomy governor's size triggers. Defaults to 1 with no
    /// history so multiples stay meaningful.
    pub fn rolling_avg_contracts(&self, n: usize) -> Result<f64> {
        let conn = self.lock();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(contracts) FROM (SELECT contracts FROM trades \
             WHERE entry_time IS NOT NULL ORDER BY entry_time DESC LIMIT ?1)",
            params![n as i64],
            |row| row.get(0),
        )?;
        Ok(avg.unwrap_or(1.0))
    }

    pub fn has_traded_symbol(&self, symbol: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn trades_needing_reconciliation(&self) -> Result<Vec<Trade>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLS} FROM trades WHERE needs_reconciliation = 1"
        ))?;
        let rows = stmt.query_map([], trade_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("trades needing reconciliation")
    }

    pub fn clear_reconciliation_flag(&self, trade_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE trades SET needs_reconciliation = 0 WHERE id = ?1",
            params![trade_id],
        )?;
        Ok(())
    }

    // ---- staged opportunities ----

    pub fn insert_staged(&self, staged: &StagedOpportunity) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO staged_opportunities (symbol, original_strike, strike, target_delta, \
             target_dte, expiration, limit_price, contracts, underlying_price, live_delta, \
             status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                staged.symbol,
                staged.original_strike,
                staged.strike,
                staged.target_delta,
                staged.target_dte,
                staged.expiration.format("%Y-%m-%d").to_string(),
                staged.limit_price,
                staged.contracts,
                staged.underlying_price,
                staged.live_delta,
                staged.status.as_str(),
                staged.created_at.to_rfc3339(),
            ],
        )
        .context("insert staged opportunity")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_staged(&self, id: i64) -> Result<Option<StagedOpportunity>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, symbol, original_strike, strike, target_delta, target_dte, expiration, \
             limit_price, contracts, underlying_price, live_delta, status, created_at \
             FROM staged_opportunities WHERE id = ?1",
            params![id],
            staged_from_row,
        )
        .optional()
        .context("get staged")
    }

    pub fn staged_with_status(&self, status: StagedStatus) -> Result<Vec<StagedOpportunity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, original_strike, strike, target_delta, target_dte, expiration, \
             limit_price, contracts, underlying_price, live_delta, status, created_at \
             FROM staged_opportunities WHERE status = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], staged_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("staged with status")
    }

    /// The live strike selector rewrites strike/limit/delta in place.
    pub fn update_staged_selection(
        &self,
        id: i64,
        strike: f64,
        limit_price: f64,
        live_delta: Option<f64>,
        status: StagedStatus,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE staged_opportunities SET strike = ?2, limit_price = ?3, live_delta = ?4, \
             status = ?5 WHERE id = ?1",
            params![id, strike, limit_price, live_delta, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_staged_status(&self, id: i64, status: StagedStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE staged_opportunities SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    // ---- earnings calendar ----

    pub fn upsert_earnings(&self, symbol: &str, report_date: NaiveDate) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO earnings_calendar (symbol, report_date) VALUES (?1, ?2)",
            params![symbol, report_date.format("%Y-%m-%d").to_string()],
        )?;
        Ok(())
    }

    /// First earnings date for `symbol` in `[from, to]`, if any.
    pub fn earnings_between(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        let conn = self.lock();
        let date: Option<String> = conn
            .query_row(
                "SELECT report_date FROM earnings_calendar WHERE symbol = ?1 \
                 AND report_date >= ?2 AND report_date <= ?3 ORDER BY report_date LIMIT 1",
                params![
                    symbol,
                    from.format("%Y-%m-%d").to_string(),
                    to.format("%Y-%m-%d").to_string()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(date.as_deref().map(parse_date))
    }
}

fn staged_from_row(row: &Row) -> rusqlite::Result<StagedOpportunity> {
    let expiration: String = row.get("expiration")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(StagedOpportunity {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        original_strike: row.get("original_strike")?,
        strike: row.get("strike")?,
        target_delta: row.get("target_delta")?,
        target_dte: row.get("target_dte")?,
        expiration: parse_date(&expiration),
        limit_price: row.get("limit_price")?,
        contracts: row.get("contracts")?,
        underlying_price: row.get("underlying_price")?,
        live_delta: row.get("live_delta")?,
        status: StagedStatus::parse(&status).unwrap_or(StagedStatus::Stale),
        created_at: parse_ts(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Greeks, StrikeSelectionMethod};

    fn sample_new_trade() -> NewTrade {
        NewTrade {
            symbol: "XSP".into(),
            right: OptionRight::Put,
            strike: 560.0,
            expiration: NaiveDate::from_ymd_opt(2025, 7, 18).unwrap(),
            contracts: 1,
            strategy_tag: "csp_weekly".into(),
            rolled_from: None,
            roll_count: 0,
            experiment_arm: None,
        }
    }

    fn sample_snapshot(trade_id: i64) -> FillSnapshot {
        FillSnapshot {
            trade_id,
            captured_at: Utc::now(),
            option_bid: 1.75,
            option_ask: 1.85,
            option_mid: 1.80,
            greeks: Greeks {
                delta: Some(-0.068),
                gamma: Some(0.01),
                theta: Some(-0.12),
                iv: Some(0.18),
            },
            underlying_price: 598.4,
            vix: Some(14.2),
            indicators: serde_json::json!({"rsi_14": 55.0}),
            selection_method: StrikeSelectionMethod::StagedUnchanged,
            target_delta: 0.065,
            original_strike: 560.0,
            live_delta_at_selection: Some(-0.068),
        }
    }

    #[test]
    fn open_close_lifecycle() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_pending_trade(&sample_new_trade()).unwrap();

        db.mark_trade_working(id).unwrap();
        db.mark_trade_open_with_snapshot(
            id,
            "exec-1",
            1.80,
            Utc::now(),
            1.05,
            &sample_snapshot(id),
        )
        .unwrap();

        let trade = db.get_trade(id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.entry_premium, Some(1.80));
        assert!(db.entry_snapshot(id).unwrap().is_some());

        db.close_trade_with_snapshot(
            id,
            0.54,
            Utc::now(),
            ExitKind::ProfitTarget,
            124.95,
            1.05,
            Some(&sample_snapshot(id)),
        )
        .unwrap();

        let trade = db.get_trade(id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_kind, Some(ExitKind::ProfitTarget));
        assert!(trade.exit_premium.is_some() && trade.exit_time.is_some());
    }

    #[test]
    fn duplicate_contract_guard() {
        let db = Db::open_in_memory().unwrap();
        let new = sample_new_trade();
        db.insert_pending_trade(&new).unwrap();
        assert!(db
            .open_trade_on_contract("XSP", 560.0, new.expiration, OptionRight::Put)
            .unwrap());
        assert!(!db
            .open_trade_on_contract("XSP", 555.0, new.expiration, OptionRight::Put)
            .unwrap());
    }

    #[test]
    fn earnings_window_lookup() {
        let db = Db::open_in_memory().unwrap();
        let report = NaiveDate::from_ymd_opt(2025, 7, 24).unwrap();
        db.upsert_earnings("AAPL", report).unwrap();

        let hit = db
            .earnings_between(
                "AAPL",
                NaiveDate::from_ymd_opt(2025, 7, 20).unwrap(),
                NaiveDate::from_ymd_opt(2025, 7, 30).unwrap(),
            )
            .unwrap();
        assert_eq!(hit, Some(report));

        let miss = db
            .earnings_between(
                "AAPL",
                NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 8, 10).unwrap(),
            )
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn staged_selector_rewrite() {
        let db = Db::open_in_memory().unwrap();
        let staged = StagedOpportunity {
            id: 0,
            symbol: "XSP".into(),
            original_strike: 560.0,
            strike: 560.0,
            target_delta: 0.065,
            target_dte: 7,
            expiration: NaiveDate::from_ymd_opt(2025, 7, 18).unwrap(),
            limit_price: 1.80,
            contracts: 1,
            underlying_price: 598.4,
            live_delta: None,
            status: StagedStatus::Staged,
            created_at: Utc::now(),
        };
        let id = db.insert_staged(&staged).unwrap();
        db.update_staged_selection(id, 555.0, 1.62, Some(-0.061), StagedStatus::Validated)
            .unwrap();

        let got = db.get_staged(id).unwrap().unwrap();
        assert_eq!(got.strike, 555.0);
        assert_eq!(got.original_strike, 560.0);
        assert_eq!(got.status, StagedStatus::Validated);
    }
}
