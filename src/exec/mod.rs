//! Action executor: turns an authorized decision into broker operations
//! and persistence mutations. Contracts are qualified in batches,
//! quotes fetched up front, but submissions go to the broker serially
//! so broker-order-id assignment stays deterministic; all parents are
//! then handed to the fill manager together.

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{
    BracketTicket, BrokerAdapter, ChainEntry, MarginImpact, OptionContract, OrderTicket,
};
use crate::config::Config;
use crate::events::{EventBus, EventType, MarketCalendar, Session};
use crate::governor::{sector_for, RiskGovernor, RiskSnapshot, RiskVerdict, TradeProposal};
use crate::learning::experiments::assign_arm;
use crate::memory::{StrategyParams, WorkingMemory};
use crate::models::{
    AnomalyKind, Anomaly, ExitKind, FillSnapshot, Greeks, OptionRight, OrderRecord, OrderSide,
    OrderState, Quote, StagedOpportunity, StagedStatus, StrikeSelectionMethod, TimeInForce, Trade,
    TradeStatus,
};
use crate::store::{Db, NewTrade};

pub mod fills;
pub mod sizing;
pub mod strike;

pub use fills::{FillManager, FillOutcome, FillReport, MonitoredOrder};
pub use strike::{LiveStrikeSelector, SelectionRequest, StrikeSelection};

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

pub struct ActionExecutor {
    broker: Arc<dyn BrokerAdapter>,
    db: Db,
    memory: Arc<WorkingMemory>,
    bus: EventBus,
    risk: RiskGovernor,
    selector: LiveStrikeSelector,
    fills: FillManager,
    calendar: MarketCalendar,
    config: Config,
}

impl ActionExecutor {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        db: Db,
        memory: Arc<WorkingMemory>,
        bus: EventBus,
        config: Config,
    ) -> Self {
        Self {
            risk: RiskGovernor::new(config.risk.clone()),
            selector: LiveStrikeSelector::new(broker.clone(), config.selector.clone()),
            fills: FillManager::new(broker.clone(), db.clone(), config.fills.clone()),
            calendar: MarketCalendar,
            broker,
            db,
            memory,
            bus,
            config,
        }
    }

    /// Next expiration at or after `target_dte` days out that is a
    /// trading day.
    fn target_expiration(&self, from: NaiveDate, target_dte: i64) -> NaiveDate {
        let mut date = from + Duration::days(target_dte.max(1));
        for _ in 0..6 {
            if self.calendar.is_trading_day(date) {
                return date;
            }
            date += Duration::days(1);
        }
        date
    }

    async fn vix(&self) -> Option<f64> {
        match self.broker.stock_quote("VIX").await {
            Ok(quote) => quote.last.or(Some(quote.mid())),
            Err(_) => None,
        }
    }

    /// Strategy as the experiment arm sees it: the tested parameter is
    /// overridden for trades landing in the test arm.
    fn arm_strategy(
        strategy: &StrategyParams,
        experiment: Option<&crate::memory::OpenExperiment>,
        arm: Option<&str>,
    ) -> StrategyParams {
        let mut effective = strategy.clone();
        if let (Some(exp), Some("test")) = (experiment, arm) {
            effective.set_parameter(&exp.parameter, exp.test_value);
        }
        effective
    }

    // ------------------------------------------------------------------
    // stage_candidates
    // ------------------------------------------------------------------

    /// Scan the universe and persist staged opportunities. Candidates
    /// with insufficient chain data are kept as `stale`.
    pub async fn stage_candidates(&self, strategy: &StrategyParams) -> Result<serde_json::Value> {
        let account = self.broker.account_summary().await?;
        let today = self.calendar.trading_date(Utc::now());
        let expiration = self.target_expiration(today, strategy.target_dte);

        let mut staged_ids = Vec::new();
        let mut skipped = Vec::new();

        for symbol in &strategy.universe {
            let open = self.db.open_trades()?;
            if open.iter().any(|t| &t.symbol == symbol) {
                skipped.push(json!({"symbol": symbol, "reason": "position already open"}));
                continue;
            }

            let spot = match self.broker.stock_quote(symbol).await {
                Ok(quote) => quote.mid(),
                Err(e) => {
                    warn!(%symbol, "stage: quote failed: {e:#}");
                    skipped.push(json!({"symbol": symbol, "reason": "no quote"}));
                    continue;
                }
            };

            let strike_guess =
                spot * (1.0 - strategy.target_delta.max(self.config.selector.min_otm_pct));
            let request = SelectionRequest {
                symbol: symbol.clone(),
                expiration,
                current_strike: strike_guess,
                target_delta: strategy.target_delta,
                tolerance: strategy.delta_tolerance,
                staged_underlying: spot,
            };
            let outcome = self.selector.select(&request).await?;

            match outcome.selection {
                StrikeSelection::Selected(entry) | StrikeSelection::Unchanged(entry) => {
                    let limit = round_cents((entry.bid + entry.ask) / 2.0);
                    let contracts = sizing::size_contracts(
                        account.net_liquidation,
                        self.config.risk.per_trade_margin_cap_pct,
                        sizing::estimated_margin_per_contract(entry.contract.strike),
                        self.config.risk.max_contracts_per_trade,
                    );
                    if contracts == 0 {
                        skipped.push(json!({"symbol": symbol, "reason": "sized to zero"}));
                        continue;
                    }
                    let staged = StagedOpportunity {
                        id: 0,
                        symbol: symbol.clone(),
                        original_strike: entry.contract.strike,
                        strike: entry.contract.strike,
                        target_delta: strategy.target_delta,
                        target_dte: strategy.target_dte,
                        expiration,
                        limit_price: limit,
                        contracts,
                        underlying_price: outcome.underlying_price,
                        live_delta: entry.greeks.delta,
                        status: StagedStatus::Staged,
                        created_at: Utc::now(),
                    };
                    let id = self.db.insert_staged(&staged)?;
                    info!(
                        %symbol,
                        strike = entry.contract.strike,
                        limit,
                        contracts,
                        "candidate staged"
                    );
                    staged_ids.push(id);
                }
                StrikeSelection::Abandoned(reason) => {
                    let staged = StagedOpportunity {
                        id: 0,
                        symbol: symbol.clone(),
                        original_strike: strike_guess,
                        strike: strike_guess,
                        target_delta: strategy.target_delta,
                        target_dte: strategy.target_dte,
                        expiration,
                        limit_price: 0.0,
                        contracts: 0,
                        underlying_price: outcome.underlying_price,
                        live_delta: None,
                        status: StagedStatus::Stale,
                        created_at: Utc::now(),
                    };
                    self.db.insert_staged(&staged)?;
                    skipped.push(json!({"symbol": symbol, "reason": reason}));
                }
            }
        }

        Ok(json!({
            "status": if staged_ids.is_empty() { "no candidates staged" } else { "staged" },
            "staged_ids": staged_ids,
            "skipped": skipped,
        }))
    }

    // ------------------------------------------------------------------
    // execute_staged
    // ------------------------------------------------------------------

    pub async fn execute_staged(
        &self,
        ids: &[i64],
        strategy: &StrategyParams,
        session: Session,
    ) -> Result<serde_json::Value> {
        let mut results = Vec::new();
        let mut monitored = Vec::new();
        // parent broker order id -> submission facts
        type Submission = (i64, StagedOpportunity, ChainEntry, StrikeSelectionMethod);
        let mut submitted: HashMap<String, Submission> = HashMap::new();

        for &id in ids {
            match self.prepare_and_submit(id, strategy, session).await {
                Ok(Some((trade_id, staged, entry, method, monitor))) => {
                    submitted.insert(
                        monitor.broker_order_id.clone(),
                        (trade_id, staged, entry, method),
                    );
                    monitored.push(monitor);
                }
                Ok(None) => {
                    results.push(json!({"staged_id": id, "status": "not authorized"}));
                }
                Err(e) => {
                    warn!(staged_id = id, "execution failed: {e:#}");
                    results.push(json!({"staged_id": id, "status": "error", "error": format!("{e:#}")}));
                }
            }
        }

        if monitored.is_empty() {
            return Ok(json!({
                "status": "no candidates authorized",
                "results": results,
            }));
        }

        // all parents monitored together
        let report = self.fills.monitor(monitored).await?;

        for result in &report.results {
            let Some((trade_id, staged, entry, method)) = submitted.get(&result.broker_order_id)
            else {
                continue;
            };
            let summary = self
                .settle_entry(*trade_id, staged, entry, *method, result)
                .await
                .unwrap_or_else(|e| {
                    json!({"trade_id": trade_id, "status": "settle error", "error": format!("{e:#}")})
                });
            results.push(summary);
        }

        Ok(json!({
            "status": "executed",
            "fully_filled": report.fully_filled,
            "total_adjustments": report.total_adjustments,
            "results": results,
        }))
    }

    /// Validate one staged opportunity, pass the risk governor, and
    /// submit its bracket. Returns None when risk rejected it.
    async fn prepare_and_submit(
        &self,
        staged_id: i64,
        strategy: &StrategyParams,
        session: Session,
    ) -> Result<
        Option<(
            i64,
            StagedOpportunity,
            ChainEntry,
            StrikeSelectionMethod,
            MonitoredOrder,
        )>,
    > {
        let mut staged = self
            .db
            .get_staged(staged_id)?
            .ok_or_else(|| anyhow!("staged {staged_id} not found"))?;
        if !matches!(staged.status, StagedStatus::Staged | StagedStatus::Validated) {
            return Err(anyhow!(
                "staged {staged_id} not executable in status {}",
                staged.status.as_str()
            ));
        }
        self.db.set_staged_status(staged_id, StagedStatus::Executing)?;

        // experiment arm decided before selection so the tested
        // parameter shapes the trade
        let experiments = self.memory.snapshot().experiments;
        let experiment = experiments.first();
        let arm = experiment.map(|e| assign_arm(e.id, e.allocation, Utc::now()));
        let effective = Self::arm_strategy(strategy, experiment, arm);

        // pre-execution validation: underlying drift vs staged
        let quote = self.broker.stock_quote(&staged.symbol).await?;
        let drift = (quote.mid() - staged.underlying_price).abs() / staged.underlying_price;
        if drift > self.config.selector.drift_stale_pct {
            warn!(
                symbol = %staged.symbol,
                drift = format!("{:.1}%", drift * 100.0),
                "staged price drifted too far, marking stale"
            );
            self.db.set_staged_status(staged_id, StagedStatus::Stale)?;
            return Ok(None);
        }
        if drift > self.config.selector.drift_adjust_pct {
            info!(
                symbol = %staged.symbol,
                drift = format!("{:.1}%", drift * 100.0),
                "drift above adjust threshold, strike will re-resolve"
            );
        }

        // live strike re-selection
        let request = SelectionRequest {
            symbol: staged.symbol.clone(),
            expiration: staged.expiration,
            current_strike: staged.strike,
            target_delta: effective.target_delta,
            tolerance: effective.delta_tolerance,
            staged_underlying: staged.underlying_price,
        };
        let outcome = self.selector.select(&request).await?;
        let (entry, method) = match (&outcome.selection, outcome.used_stale_fallback) {
            (StrikeSelection::Abandoned(reason), _) => {
                info!(symbol = %staged.symbol, %reason, "selection abandoned, staged goes stale");
                self.db.set_staged_status(staged_id, StagedStatus::Stale)?;
                return Ok(None);
            }
            (StrikeSelection::Unchanged(e), false) => {
                (e.clone(), StrikeSelectionMethod::StagedUnchanged)
            }
            (StrikeSelection::Unchanged(e), true) | (StrikeSelection::Selected(e), true) => {
                (e.clone(), StrikeSelectionMethod::StaleFallback)
            }
            (StrikeSelection::Selected(e), false) => (e.clone(), StrikeSelectionMethod::LiveDelta),
        };

        let limit = round_cents((entry.bid + entry.ask) / 2.0).max(self.config.selector.premium_floor);
        self.db.update_staged_selection(
            staged_id,
            entry.contract.strike,
            limit,
            entry.greeks.delta,
            StagedStatus::Validated,
        )?;
        staged.strike = entry.contract.strike;
        staged.limit_price = limit;
        staged.live_delta = entry.greeks.delta;

        // risk gate
        let parent_ticket = OrderTicket::limit(
            OrderSide::Sell,
            staged.contracts,
            limit,
            TimeInForce::Day,
        );
        let margin_impact = self
            .broker
            .whatif_order(&entry.contract, &parent_ticket)
            .await?;
        let snapshot = self
            .risk_snapshot(&staged, session, margin_impact)
            .await?;
        let proposal = TradeProposal {
            symbol: staged.symbol.clone(),
            strike: staged.strike,
            expiration: staged.expiration,
            contracts: staged.contracts,
            entry_date: self.calendar.trading_date(Utc::now()),
        };
        match self.risk.evaluate(&proposal, &snapshot) {
            RiskVerdict::Approved => {}
            RiskVerdict::Rejected(reason) => {
                info!(
                    symbol = %staged.symbol,
                    reason = reason.as_str(),
                    "risk governor rejected"
                );
                self.db.set_staged_status(staged_id, StagedStatus::Cancelled)?;
                return Ok(None);
            }
        }

        // bracket: parent SELL + profit-target BUY + optional stop BUY
        let profit_price = round_cents(limit * (1.0 - effective.profit_target_pct)).max(0.01);
        let bracket = BracketTicket {
            parent: parent_ticket,
            profit_target: Some(OrderTicket::limit(
                OrderSide::Buy,
                staged.contracts,
                profit_price,
                TimeInForce::Gtc,
            )),
            stop: (effective.stop_multiple > 0.0).then(|| {
                OrderTicket::stop(
                    OrderSide::Buy,
                    staged.contracts,
                    round_cents(limit * effective.stop_multiple),
                    TimeInForce::Gtc,
                )
            }),
        };

        let trade_id = self.db.insert_pending_trade(&NewTrade {
            symbol: staged.symbol.clone(),
            right: OptionRight::Put,
            strike: staged.strike,
            expiration: staged.expiration,
            contracts: staged.contracts,
            strategy_tag: effective.strategy_tag.clone(),
            rolled_from: None,
            roll_count: 0,
            experiment_arm: experiment
                .zip(arm)
                .map(|(e, arm)| format!("{}:{arm}", e.id)),
        })?;

        // semantic rejection gets one retry with the fallback shape: a
        // plain limit entry without children (the exit is then managed
        // from the event stream)
        let refs = match self.broker.place_bracket(&entry.contract, &bracket).await {
            Ok(refs) => refs,
            Err(first) => {
                warn!(
                    symbol = %staged.symbol,
                    "bracket rejected, retrying as plain limit: {first:#}"
                );
                match self.broker.place_order(&entry.contract, &bracket.parent).await {
                    Ok(parent) => crate::broker::BracketRefs {
                        parent,
                        children: Vec::new(),
                    },
                    Err(second) => {
                        self.db.discard_unfilled_trade(trade_id)?;
                        self.db.set_staged_status(staged_id, StagedStatus::Cancelled)?;
                        return Err(second.context("order rejected after fallback retry"));
                    }
                }
            }
        };
        self.db.mark_trade_working(trade_id)?;
        self.db.set_staged_status(staged_id, StagedStatus::Submitted)?;

        self.db.insert_order(&OrderRecord {
            id: 0,
            broker_order_id: refs.parent.broker_order_id.clone(),
            parent_broker_order_id: None,
            trade_id: Some(trade_id),
            symbol: staged.symbol.clone(),
            side: OrderSide::Sell,
            quantity: staged.contracts,
            limit_price: limit,
            order_type: "LMT".to_string(),
            tif: TimeInForce::Day,
            state: OrderState::Working,
            filled_quantity: 0,
            avg_fill_price: None,
            commission: 0.0,
            last_broker_status: refs.parent.status.clone(),
            created_at: Utc::now(),
        })?;
        let child_specs = [
            ("LMT", profit_price),
            ("STP", round_cents(limit * effective.stop_multiple)),
        ];
        for (child_ref, (order_type, price)) in refs.children.iter().zip(child_specs.iter()) {
            self.db.insert_order(&OrderRecord {
                id: 0,
                broker_order_id: child_ref.broker_order_id.clone(),
                parent_broker_order_id: Some(refs.parent.broker_order_id.clone()),
                trade_id: Some(trade_id),
                symbol: staged.symbol.clone(),
                side: OrderSide::Buy,
                quantity: staged.contracts,
                limit_price: *price,
                order_type: order_type.to_string(),
                tif: TimeInForce::Gtc,
                state: OrderState::Working,
                filled_quantity: 0,
                avg_fill_price: None,
                commission: 0.0,
                last_broker_status: child_ref.status.clone(),
                created_at: Utc::now(),
            })?;
        }

        info!(
            symbol = %staged.symbol,
            trade_id,
            parent = %refs.parent.broker_order_id,
            children = refs.children.len(),
            "bracket submitted"
        );

        let monitor = MonitoredOrder {
            broker_order_id: refs.parent.broker_order_id.clone(),
            contract: entry.contract.clone(),
            side: OrderSide::Sell,
            quantity: staged.contracts,
            limit_price: limit,
            premium_floor: self.config.selector.premium_floor,
            price_ceiling: None,
        };
        Ok(Some((trade_id, staged, entry, method, monitor)))
    }

    /// Post-monitor settlement of one entry: open + snapshot on fill,
    /// discard on a dead submission.
    async fn settle_entry(
        &self,
        trade_id: i64,
        staged: &StagedOpportunity,
        entry: &ChainEntry,
        method: StrikeSelectionMethod,
        result: &fills::OrderFillResult,
    ) -> Result<serde_json::Value> {
        // pull broker truth for the whole order set of this trade
        let orders = self.db.orders_for_trade(trade_id)?;
        let filled: i64 = orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .map(|o| o.filled_quantity)
            .sum();
        let weighted: f64 = orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell && o.filled_quantity > 0)
            .map(|o| o.avg_fill_price.unwrap_or(0.0) * o.filled_quantity as f64)
            .sum();

        if filled == 0 {
            match result.outcome {
                FillOutcome::LeftWorkingOnTimeout => {
                    // DAY order still working; fills will arrive as events
                    self.memory.note_fill_failure()?;
                    return Ok(json!({
                        "trade_id": trade_id,
                        "status": "left working",
                    }));
                }
                _ => {
                    self.db.discard_unfilled_trade(trade_id)?;
                    let streak = self.memory.note_fill_failure()?;
                    if streak >= self.config.autonomy.review_fill_failure_streak {
                        self.memory.raise_anomaly(Anomaly::new(
                            AnomalyKind::FillFailureStreak,
                            format!("{streak} consecutive entry fill failures"),
                        ))?;
                    }
                    return Ok(json!({
                        "trade_id": trade_id,
                        "status": "unfilled, discarded",
                    }));
                }
            }
        }

        self.memory.reset_fill_failures()?;
        let entry_premium = round_cents(weighted / filled as f64);
        if filled < staged.contracts {
            self.db.set_trade_contracts(trade_id, filled)?;
        }
        let execution_id = result
            .avg_fill_price
            .map(|_| format!("{}-{}", result.broker_order_id, filled))
            .unwrap_or_else(|| result.broker_order_id.clone());
        let commission: f64 = orders.iter().map(|o| o.commission).sum();

        // entry snapshot in the same transaction as the open transition
        match self.build_snapshot(trade_id, staged, entry, method).await {
            Ok(snapshot) => {
                self.db.mark_trade_open_with_snapshot(
                    trade_id,
                    &execution_id,
                    entry_premium,
                    Utc::now(),
                    commission,
                    &snapshot,
                )?;
            }
            Err(e) => {
                warn!(trade_id, "entry snapshot capture failed: {e:#}");
                self.db.mark_trade_open_needs_reconciliation(
                    trade_id,
                    &execution_id,
                    entry_premium,
                    Utc::now(),
                )?;
                self.db.record_discrepancy(
                    "entry_snapshot_missing",
                    Some(&result.broker_order_id),
                    Some(trade_id),
                    &format!("{e:#}"),
                )?;
            }
        }

        info!(
            trade_id,
            premium = entry_premium,
            contracts = filled,
            "trade open"
        );

        // post-fill margin verification; degraded liquidity halts
        let account = self.broker.account_summary().await?;
        self.db.observe_equity(account.net_liquidation)?;
        if let Some(reason) = self.risk.verify_post_trade_margin(&account) {
            self.trigger_emergency_halt(&format!("post-trade margin: {reason}"))
                .await?;
        }

        Ok(json!({
            "trade_id": trade_id,
            "status": "open",
            "entry_premium": entry_premium,
            "contracts": filled,
            "adjustments": result.adjustments,
        }))
    }

    async fn build_snapshot(
        &self,
        trade_id: i64,
        staged: &StagedOpportunity,
        entry: &ChainEntry,
        method: StrikeSelectionMethod,
    ) -> Result<FillSnapshot> {
        // refresh greeks at fill time; fall back to selection greeks
        let (greeks, quote) = match self.broker.greeks_batch(&[entry.contract.clone()]).await {
            Ok(batch) => match batch.into_iter().next().flatten() {
                Some(live) => (
                    live.greeks,
                    Quote {
                        bid: live.bid,
                        ask: live.ask,
                        last: None,
                        ts: Utc::now(),
                    },
                ),
                None => (
                    entry.greeks,
                    Quote {
                        bid: entry.bid,
                        ask: entry.ask,
                        last: None,
                        ts: Utc::now(),
                    },
                ),
            },
            Err(e) => return Err(e).context("snapshot greeks"),
        };

        let underlying = self
            .broker
            .stock_quote(&staged.symbol)
            .await
            .map(|q| q.mid())
            .unwrap_or(staged.underlying_price);
        let vix = self.vix().await;

        Ok(FillSnapshot {
            trade_id,
            captured_at: Utc::now(),
            option_bid: quote.bid,
            option_ask: quote.ask,
            option_mid: quote.mid(),
            greeks,
            underlying_price: underlying,
            vix,
            indicators: json!({
                "underlying_drift_vs_staged":
                    (underlying - staged.underlying_price) / staged.underlying_price,
                "day_of_week": self.calendar.trading_date(Utc::now()).weekday().to_string(),
            }),
            selection_method: method,
            target_delta: staged.target_delta,
            original_strike: staged.original_strike,
            live_delta_at_selection: staged.live_delta,
        })
    }

    async fn risk_snapshot(
        &self,
        staged: &StagedOpportunity,
        session: Session,
        margin_impact: MarginImpact,
    ) -> Result<RiskSnapshot> {
        let account = self.broker.account_summary().await?;
        let peak_equity = self.db.observe_equity(account.net_liquidation)?;
        let (halted, _) = self.db.kill_switch()?;

        let open = self.db.open_trades()?;
        let mut sector_counts: HashMap<String, i64> = HashMap::new();
        for trade in &open {
            *sector_counts
                .entry(sector_for(&trade.symbol).to_string())
                .or_insert(0) += 1;
        }

        let now = Utc::now();
        let day_start = now.date_naive().and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let week_start = day_start - Duration::days(7);
        let today = self.calendar.trading_date(now);

        Ok(RiskSnapshot {
            trading_halted: halted,
            session,
            earnings_date: self
                .db
                .earnings_between(&staged.symbol, today, staged.expiration)?,
            open_positions: open.len() as i64,
            opened_today: self.db.positions_opened_since(day_start)?,
            duplicate_position: self.db.open_trade_on_contract(
                &staged.symbol,
                staged.strike,
                staged.expiration,
                OptionRight::Put,
            )?,
            realized_today: self.db.realized_pnl_between(day_start, now)?,
            realized_week: self.db.realized_pnl_between(week_start, now)?,
            peak_equity,
            account,
            margin_impact,
            sector_counts,
            vix: self.vix().await,
        })
    }

    // ------------------------------------------------------------------
    // close_position
    // ------------------------------------------------------------------

    pub async fn close_position(
        &self,
        trade_id: i64,
        exit_kind: ExitKind,
        reason: &str,
    ) -> Result<serde_json::Value> {
        let trade = self
            .db
            .get_trade(trade_id)?
            .ok_or_else(|| anyhow!("trade {trade_id} not found"))?;
        if trade.status != TradeStatus::Open {
            return Ok(json!({
                "trade_id": trade_id,
                "status": "not open",
                "current": trade.status.as_str(),
            }));
        }

        info!(trade_id, reason, "closing position");

        // cancel resting children before the closing order goes out
        for order in self.db.orders_for_trade(trade_id)? {
            if order.side == OrderSide::Buy && !order.state.is_terminal() {
                if let Err(e) = self.broker.cancel_order(&order.broker_order_id).await {
                    warn!(order = %order.broker_order_id, "child cancel failed: {e:#}");
                } else {
                    self.db.update_order_from_broker(
                        &order.broker_order_id,
                        OrderState::Cancelled,
                        order.filled_quantity,
                        order.avg_fill_price,
                        "Cancelled",
                    )?;
                }
            }
        }

        let contract = OptionContract::put(&trade.symbol, trade.expiration, trade.strike);
        let quote = self.broker.option_quote(&contract).await?;
        let limit = round_cents(quote.mid());
        let ticket = OrderTicket::limit(OrderSide::Buy, trade.contracts, limit, TimeInForce::Day);
        let order_ref = self.broker.place_order(&contract, &ticket).await?;
        self.db.mark_trade_closing(trade_id)?;
        self.db.insert_order(&OrderRecord {
            id: 0,
            broker_order_id: order_ref.broker_order_id.clone(),
            parent_broker_order_id: None,
            trade_id: Some(trade_id),
            symbol: trade.symbol.clone(),
            side: OrderSide::Buy,
            quantity: trade.contracts,
            limit_price: limit,
            order_type: "LMT".to_string(),
            tif: TimeInForce::Day,
            state: OrderState::Working,
            filled_quantity: 0,
            avg_fill_price: None,
            commission: 0.0,
            last_broker_status: order_ref.status.clone(),
            created_at: Utc::now(),
        })?;

        let report = self
            .fills
            .monitor(vec![MonitoredOrder {
                broker_order_id: order_ref.broker_order_id.clone(),
                contract: contract.clone(),
                side: OrderSide::Buy,
                quantity: trade.contracts,
                limit_price: limit,
                premium_floor: 0.0,
                price_ceiling: Some(round_cents(quote.ask * 1.10)),
            }])
            .await?;

        let filled = report.fully_filled;
        if filled == 0 {
            // the closing attempt failed; the position is still on
            self.db.revert_trade_to_open(trade_id)?;
            self.memory.note_fill_failure()?;
            return Ok(json!({
                "trade_id": trade_id,
                "status": "close unfilled",
                "reason": reason,
            }));
        }

        let exit_result = report
            .results
            .iter()
            .find(|r| r.filled > 0)
            .and_then(|r| r.avg_fill_price)
            .unwrap_or(limit);
        self.finalize_close(&trade, exit_result, exit_kind).await
    }

    /// Shared close bookkeeping, also used when a profit-target child
    /// fill arrives via the event stream.
    pub async fn finalize_close(
        &self,
        trade: &Trade,
        exit_premium: f64,
        exit_kind: ExitKind,
    ) -> Result<serde_json::Value> {
        let entry_premium = trade.entry_premium.unwrap_or(0.0);
        let commissions: f64 = self
            .db
            .orders_for_trade(trade.id)?
            .iter()
            .map(|o| o.commission)
            .sum();
        let pnl =
            (entry_premium - exit_premium) * 100.0 * trade.contracts as f64 - commissions;

        let contract = OptionContract::put(&trade.symbol, trade.expiration, trade.strike);
        let snapshot = self
            .exit_snapshot(trade, &contract, exit_premium)
            .await
            .ok();
        self.db.close_trade_with_snapshot(
            trade.id,
            exit_premium,
            Utc::now(),
            exit_kind,
            pnl,
            0.0,
            snapshot.as_ref(),
        )?;

        // outcome feeds the learning loop and rolling performance
        let collateral = trade.strike * 100.0 * trade.contracts as f64;
        let roi = if collateral > 0.0 { pnl / collateral } else { 0.0 };
        let won = pnl > 0.0;
        self.memory
            .record_outcome(roi, won, sector_for(&trade.symbol))?;
        if let Some((experiment_id, arm)) = parse_experiment_arm(trade.experiment_arm.as_deref()) {
            self.db
                .record_experiment_result(experiment_id, arm, won, roi)?;
        }

        info!(
            trade_id = trade.id,
            pnl = format!("{pnl:.2}"),
            exit = exit_kind.as_str(),
            "trade closed"
        );

        Ok(json!({
            "trade_id": trade.id,
            "status": "closed",
            "exit_kind": exit_kind.as_str(),
            "exit_premium": exit_premium,
            "realized_pnl": pnl,
        }))
    }

    async fn exit_snapshot(
        &self,
        trade: &Trade,
        contract: &OptionContract,
        exit_premium: f64,
    ) -> Result<FillSnapshot> {
        let batch = self.broker.greeks_batch(&[contract.clone()]).await?;
        let live = batch.into_iter().next().flatten();
        let (greeks, bid, ask) = match live {
            Some(e) => (e.greeks, e.bid, e.ask),
            None => (Greeks::default(), exit_premium, exit_premium),
        };
        let underlying = self
            .broker
            .stock_quote(&trade.symbol)
            .await
            .map(|q| q.mid())
            .unwrap_or(0.0);

        Ok(FillSnapshot {
            trade_id: trade.id,
            captured_at: Utc::now(),
            option_bid: bid,
            option_ask: ask,
            option_mid: (bid + ask) / 2.0,
            greeks,
            underlying_price: underlying,
            vix: self.vix().await,
            indicators: json!({
                "dte_at_exit":
                    (trade.expiration - self.calendar.trading_date(Utc::now())).num_days(),
            }),
            selection_method: StrikeSelectionMethod::StagedUnchanged,
            target_delta: 0.0,
            original_strike: trade.strike,
            live_delta_at_selection: greeks.delta,
        })
    }

    // ------------------------------------------------------------------
    // roll_position
    // ------------------------------------------------------------------

    /// Close the current leg and open a later-dated one, combo-style:
    /// both legs must net a credit and the new leg passes entry checks.
    pub async fn roll_position(
        &self,
        trade_id: i64,
        strategy: &StrategyParams,
        session: Session,
    ) -> Result<serde_json::Value> {
        let trade = self
            .db
            .get_trade(trade_id)?
            .ok_or_else(|| anyhow!("trade {trade_id} not found"))?;
        if trade.status != TradeStatus::Open {
            return Ok(json!({"trade_id": trade_id, "status": "not open"}));
        }
        if trade.roll_count >= strategy.max_rolls {
            return Ok(json!({
                "trade_id": trade_id,
                "status": "roll refused",
                "reason": format!("roll_count {} at max {}", trade.roll_count, strategy.max_rolls),
            }));
        }

        // price both legs before committing
        let old_contract = OptionContract::put(&trade.symbol, trade.expiration, trade.strike);
        let close_quote = self.broker.option_quote(&old_contract).await?;
        let today = self.calendar.trading_date(Utc::now());
        let new_expiration = self.target_expiration(today, strategy.target_dte);
        let request = SelectionRequest {
            symbol: trade.symbol.clone(),
            expiration: new_expiration,
            current_strike: trade.strike,
            target_delta: strategy.target_delta,
            tolerance: strategy.delta_tolerance,
            staged_underlying: close_quote.mid().max(trade.strike),
        };
        let outcome = self.selector.select(&request).await?;
        let Some(new_entry) = outcome.selection.entry().cloned() else {
            return Ok(json!({
                "trade_id": trade_id,
                "status": "roll refused",
                "reason": "no viable strike for the new leg",
            }));
        };

        let close_cost = close_quote.ask;
        let new_credit = new_entry.bid;
        if new_credit <= close_cost {
            return Ok(json!({
                "trade_id": trade_id,
                "status": "roll refused",
                "reason": format!(
                    "no net credit: new bid {new_credit:.2} vs close ask {close_cost:.2}"
                ),
            }));
        }

        // close the old leg first
        let close_result = self
            .close_position(trade_id, ExitKind::Time, "roll")
            .await?;
        if close_result["status"] != "closed" {
            return Ok(json!({
                "trade_id": trade_id,
                "status": "roll aborted at close",
                "close": close_result,
            }));
        }

        // stage and execute the replacement leg with roll lineage
        let staged = StagedOpportunity {
            id: 0,
            symbol: trade.symbol.clone(),
            original_strike: new_entry.contract.strike,
            strike: new_entry.contract.strike,
            target_delta: strategy.target_delta,
            target_dte: strategy.target_dte,
            expiration: new_expiration,
            limit_price: round_cents((new_entry.bid + new_entry.ask) / 2.0),
            contracts: trade.contracts,
            underlying_price: outcome.underlying_price,
            live_delta: new_entry.greeks.delta,
            status: StagedStatus::Staged,
            created_at: Utc::now(),
        };
        let staged_id = self.db.insert_staged(&staged)?;
        let open_result = self
            .execute_staged(&[staged_id], strategy, session)
            .await?;

        // stamp roll lineage on the new leg
        if let Some(new_trade_id) = open_result["results"]
            .as_array()
            .and_then(|rs| rs.iter().find_map(|r| r["trade_id"].as_i64()))
        {
            self.db.set_trade_roll_lineage(
                new_trade_id,
                trade_id,
                trade.roll_count + 1,
            )?;
        }

        Ok(json!({
            "trade_id": trade_id,
            "status": "rolled",
            "close": close_result,
            "open": open_result,
        }))
    }

    pub async fn trigger_emergency_halt(&self, reason: &str) -> Result<()> {
        warn!(reason, "🛑 EMERGENCY HALT");
        self.db.set_kill_switch(true, reason)?;
        self.memory
            .raise_anomaly(Anomaly::new(AnomalyKind::MarginDegraded, reason))?;
        self.bus.publish(
            EventType::AnomalyDetected,
            json!({"kind": "margin_degraded", "detail": reason}),
        )?;
        Ok(())
    }
}

fn parse_experiment_arm(raw: Option<&str>) -> Option<(i64, &str)> {
    let raw = raw?;
    let (id, arm) = raw.split_once(':')?;
    let id = id.parse().ok()?;
    if arm != "control" && arm != "test" {
        return None;
    }
    Some((id, arm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperBrokerConfig};
    use crate::config::FillConfig;
    use crate::memory::HashEmbedder;

    fn fast_fill_config() -> FillConfig {
        FillConfig {
            check_interval_secs: 0,
            adjustment_interval_secs: 0,
            max_adjustments: 2,
            adjustment_increment: 0.01,
            partial_threshold: 0.5,
            monitoring_window_secs: 5,
            leave_day_orders: false,
        }
    }

    fn executor_with(
        broker_config: PaperBrokerConfig,
    ) -> (Arc<PaperBroker>, Db, Arc<WorkingMemory>, ActionExecutor) {
        let mut config = Config::load().unwrap();
        config.fills = fast_fill_config();
        config.selector.premium_floor = 0.05;
        config.strategy.universe = vec!["XSP".to_string()];
        // generous caps so the paper account can trade
        config.risk.per_trade_margin_cap_pct = 0.20;
        config.risk.max_margin_utilisation = 0.50;
        config.risk.min_excess_liquidity_pct = 0.10;

        let broker = Arc::new(PaperBroker::new(broker_config));
        let db = Db::open_in_memory().unwrap();
        let memory = Arc::new(
            WorkingMemory::load_session(
                db.clone(),
                Arc::new(HashEmbedder),
                "test-session",
                &config.strategy,
                &config.autonomy,
            )
            .unwrap(),
        );
        let bus = EventBus::new(db.clone(), 3);
        let executor = ActionExecutor::new(broker.clone(), db.clone(), memory.clone(), bus, config);
        (broker, db, memory, executor)
    }

    fn strategy() -> StrategyParams {
        let mut params =
            StrategyParams::from_defaults(&crate::config::StrategyDefaults::default());
        params.universe = vec!["XSP".to_string()];
        params.target_delta = 0.10;
        params.delta_tolerance = 0.08;
        params
    }

    #[tokio::test]
    async fn stage_then_execute_happy_path() {
        let (_broker, db, _memory, executor) = executor_with(PaperBrokerConfig::default());
        let staged = executor.stage_candidates(&strategy()).await.unwrap();
        let ids: Vec<i64> = staged["staged_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(ids.len(), 1, "XSP should stage: {staged}");

        let result = executor
            .execute_staged(&ids, &strategy(), Session::Regular)
            .await
            .unwrap();
        assert_eq!(result["status"], "executed", "{result}");

        let open = db.open_trades().unwrap();
        assert_eq!(open.len(), 1);
        let trade = &open[0];
        assert_eq!(trade.status, TradeStatus::Open);
        assert!(trade.entry_premium.is_some());
        // entry snapshot captured with the open transition
        assert!(db.entry_snapshot(trade.id).unwrap().is_some());
        // one decision-side effect: bracket children persisted
        let orders = db.orders_for_trade(trade.id).unwrap();
        assert!(orders.len() >= 2);
        assert!(orders
            .iter()
            .any(|o| o.parent_broker_order_id.is_some() && o.side == OrderSide::Buy));
    }

    #[tokio::test]
    async fn kill_switch_blocks_execution() {
        let (_broker, db, _memory, executor) = executor_with(PaperBrokerConfig::default());
        let staged = executor.stage_candidates(&strategy()).await.unwrap();
        let ids: Vec<i64> = staged["staged_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();

        db.set_kill_switch(true, "test halt").unwrap();
        let result = executor
            .execute_staged(&ids, &strategy(), Session::Regular)
            .await
            .unwrap();
        assert_eq!(result["status"], "no candidates authorized");
        assert!(db.open_trades().unwrap().is_empty());
    }

    #[tokio::test]
    async fn earnings_blocks_candidate() {
        let (_broker, db, _memory, executor) = executor_with(PaperBrokerConfig::default());
        let staged = executor.stage_candidates(&strategy()).await.unwrap();
        let ids: Vec<i64> = staged["staged_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();

        // earnings inside [entry, expiration]
        let report_date = Utc::now().date_naive() + Duration::days(3);
        db.upsert_earnings("XSP", report_date).unwrap();

        let result = executor
            .execute_staged(&ids, &strategy(), Session::Regular)
            .await
            .unwrap();
        assert_eq!(result["status"], "no candidates authorized", "{result}");
        assert!(db.open_trades().unwrap().is_empty());
        // staged opportunity was cancelled by the risk governor
        let row = db.get_staged(ids[0]).unwrap().unwrap();
        assert_eq!(row.status, StagedStatus::Cancelled);
    }

    #[tokio::test]
    async fn close_position_records_outcome() {
        let (_broker, db, memory, executor) = executor_with(PaperBrokerConfig::default());
        let staged = executor.stage_candidates(&strategy()).await.unwrap();
        let ids: Vec<i64> = staged["staged_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        executor
            .execute_staged(&ids, &strategy(), Session::Regular)
            .await
            .unwrap();
        let trade_id = db.open_trades().unwrap()[0].id;

        let result = executor
            .close_position(trade_id, ExitKind::Manual, "test close")
            .await
            .unwrap();
        assert_eq!(result["status"], "closed", "{result}");

        let trade = db.get_trade(trade_id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert!(trade.exit_premium.is_some() && trade.exit_time.is_some());
        assert_eq!(memory.snapshot().performance.closed, 1);
    }

    #[test]
    fn experiment_arm_parsing() {
        assert_eq!(parse_experiment_arm(Some("4:test")), Some((4, "test")));
        assert_eq!(parse_experiment_arm(Some("4:control")), Some((4, "control")));
        assert_eq!(parse_experiment_arm(Some("nope")), None);
        assert_eq!(parse_experiment_arm(None), None);
    }
}
