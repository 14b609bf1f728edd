//! Orchestrator: the single event-dispatch loop. Stream events, per
//! event assemble context, reason, gate, execute, record the outcome,
//! heartbeat. Errors never cross this boundary: the event is marked
//! done or failed and the loop moves on.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{BrokerAdapter, BrokerEvent, OptionContract};
use crate::config::Config;
use crate::engine::{
    context::{
        AccountContext, CandidateContext, ExperimentContext, MarketContext, PatternContext,
        PositionContext, RecentDecisionContext, SimilarDecisionContext,
    },
    DecisionAction, EngineDecision, GroundingFacts, ReasoningContextV1, ReasoningEngine,
    CONTEXT_VERSION,
};
use crate::events::{CalendarScheduler, Event, EventBus, EventType, MarketCalendar, Session};
use crate::exec::ActionExecutor;
use crate::governor::{autonomy::GateInputs, AutonomyGovernor, Authorization};
use crate::learning::LearningLoop;
use crate::memory::WorkingMemory;
use crate::models::{Anomaly, AnomalyKind, ExitKind, OrderSide, OrderState, TradeStatus};
use crate::reconcile::Reconciler;
use crate::store::{Db, DecisionRecord};

const CONSUMER: &str = "orchestrator";

pub struct Orchestrator {
    db: Db,
    bus: EventBus,
    broker: Arc<dyn BrokerAdapter>,
    memory: Arc<WorkingMemory>,
    engine: ReasoningEngine,
    executor: ActionExecutor,
    reconciler: Reconciler,
    learning: LearningLoop,
    autonomy: AutonomyGovernor,
    calendar: MarketCalendar,
    config: Config,
    /// First VIX print of the session, for the intraday-spike trigger.
    session_open_vix: parking_lot::Mutex<Option<(chrono::NaiveDate, f64)>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        bus: EventBus,
        broker: Arc<dyn BrokerAdapter>,
        memory: Arc<WorkingMemory>,
        engine: ReasoningEngine,
        executor: ActionExecutor,
        reconciler: Reconciler,
        learning: LearningLoop,
        config: Config,
    ) -> Self {
        Self {
            autonomy: AutonomyGovernor::new(config.autonomy.clone()),
            calendar: MarketCalendar,
            db,
            bus,
            broker,
            memory,
            engine,
            executor,
            reconciler,
            learning,
            config,
            session_open_vix: parking_lot::Mutex::new(None),
        }
    }

    /// Main loop. Returns when `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(session = %self.memory.session_id(), "🚀 orchestrator started");

        let scheduler = CalendarScheduler::new(
            self.bus.clone(),
            self.calendar,
            self.config.events.scheduled_check_interval_mins,
            self.config.events.ticker_interval_secs,
        );
        tokio::spawn(scheduler.run(shutdown.clone()));

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.pump_broker_events()?;
            self.db
                .requeue_stuck_events(self.config.events.max_event_runtime_secs)?;

            match self.bus.next() {
                Ok(Some(event)) => {
                    self.db
                        .heartbeat(&format!("dispatch {}", event.event_type.as_str()))?;
                    self.dispatch(event).await;
                }
                Ok(None) => {
                    self.db.heartbeat("idle")?;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("event claim failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // drain: mark the stop reason and flush the heartbeat
        self.db.set_kill_switch(true, "shutdown")?;
        self.db.heartbeat("shutdown")?;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Move adapter-queued callbacks onto the durable bus.
    fn pump_broker_events(&self) -> Result<()> {
        for event in self.broker.drain_events() {
            match event {
                BrokerEvent::OrderStatus(status) => {
                    self.bus.publish(
                        EventType::OrderStatusChanged,
                        json!({
                            "broker_order_id": status.broker_order_id,
                            "status": status.status,
                            "filled": status.filled,
                            "remaining": status.remaining,
                            "avg_fill_price": status.avg_fill_price,
                        }),
                    )?;
                }
                BrokerEvent::OrderFilled(fill) => {
                    self.bus.publish(
                        EventType::OrderFilled,
                        json!({
                            "broker_order_id": fill.broker_order_id,
                            "execution_id": fill.execution_id,
                            "quantity": fill.quantity,
                            "price": fill.price,
                        }),
                    )?;
                }
                BrokerEvent::Disconnected => {
                    self.bus
                        .publish(EventType::BrokerDisconnected, json!({}))?;
                }
                BrokerEvent::Reconnected => {
                    self.bus.publish(EventType::BrokerReconnected, json!({}))?;
                }
            }
        }
        Ok(())
    }

    /// Outermost dispatch: every outcome is recorded, nothing escapes.
    pub async fn dispatch(&self, event: Event) {
        // replaying a completed event is a no-op
        match self.db.record_consumption(event.id, CONSUMER) {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.bus.done(event.id);
                return;
            }
            Err(e) => {
                error!(event = event.id, "consumption check failed: {e:#}");
                let _ = self.bus.failed(event.id, &format!("{e:#}"));
                return;
            }
        }

        let result = self.handle(&event).await;
        match result {
            Ok(()) => {
                if let Err(e) = self.bus.done(event.id) {
                    error!(event = event.id, "ack failed: {e:#}");
                }
            }
            Err(e) => {
                error!(
                    event = event.id,
                    kind = event.event_type.as_str(),
                    "event failed: {e:#}"
                );
                let _ = self.bus.failed(event.id, &format!("{e:#}"));
            }
        }
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match event.event_type {
            EventType::BrokerDisconnected => {
                self.broker.invalidate_caches();
                self.memory.raise_anomaly(Anomaly::new(
                    AnomalyKind::BrokerDisconnected,
                    "gateway connection lost",
                ))?;
                Ok(())
            }
            EventType::BrokerReconnected => {
                self.memory.clear_anomaly(AnomalyKind::BrokerDisconnected)?;
                // broker truth first, decisions after
                self.reconciler.run().await?;
                Ok(())
            }
            EventType::StaleMarketData => {
                self.memory.raise_anomaly(Anomaly::new(
                    AnomalyKind::StaleMarketData,
                    event.payload["detail"].as_str().unwrap_or("stale quotes"),
                ))?;
                Ok(())
            }
            EventType::AnomalyDetected => {
                if let Some(kind) = event.payload["kind"].as_str().and_then(AnomalyKind::parse) {
                    self.memory.raise_anomaly(Anomaly::new(
                        kind,
                        event.payload["detail"].as_str().unwrap_or(""),
                    ))?;
                }
                Ok(())
            }
            EventType::OrderStatusChanged => self.handle_order_status(event),
            EventType::OrderFilled => self.handle_order_filled(event).await,
            EventType::EndOfDayReflection => {
                self.learning.reflect().await?;
                self.review_autonomy()?;
                self.reconciler.run().await?;
                Ok(())
            }
            EventType::WeeklyLearning => {
                let summary = self.learning.run_weekly()?;
                info!(%summary, "weekly learning pass");
                Ok(())
            }
            EventType::ExperimentResultReady => {
                info!(payload = %event.payload, "experiment verdict recorded");
                Ok(())
            }
            EventType::MarketClose => {
                self.reconciler.run().await?;
                Ok(())
            }
            EventType::ScheduledCheck => {
                self.emit_position_alerts().await?;
                self.reason_and_act(event).await
            }
            // the reasoning path
            EventType::MarketOpen
            | EventType::PreMarketPrep
            | EventType::PositionStopApproaching
            | EventType::UnderlyingSignificantMove => self.reason_and_act(event).await,
        }
    }

    fn handle_order_status(&self, event: &Event) -> Result<()> {
        let Some(broker_order_id) = event.payload["broker_order_id"].as_str() else {
            return Ok(());
        };
        let Some(local) = self.db.get_order_by_broker_id(broker_order_id)? else {
            return Ok(());
        };
        let status = event.payload["status"].as_str().unwrap_or("");
        let filled = event.payload["filled"].as_i64().unwrap_or(local.filled_quantity);
        let avg = event.payload["avg_fill_price"].as_f64().or(local.avg_fill_price);
        let state = match status {
            "Filled" => OrderState::Filled,
            "Cancelled" | "ApiCancelled" | "Inactive" => OrderState::Cancelled,
            _ if filled > 0 && filled < local.quantity => OrderState::PartiallyFilled,
            _ => local.state,
        };
        self.db
            .update_order_from_broker(broker_order_id, state, filled, avg, status)?;
        Ok(())
    }

    /// Fills arriving via the event stream: a BUY child filling while
    /// its trade is open/closing completes the exit.
    async fn handle_order_filled(&self, event: &Event) -> Result<()> {
        let Some(broker_order_id) = event.payload["broker_order_id"].as_str() else {
            return Ok(());
        };
        let Some(order) = self.db.get_order_by_broker_id(broker_order_id)? else {
            // not ours; reconciler will classify it
            self.reconciler.run().await?;
            return Ok(());
        };
        let price = event.payload["price"].as_f64().or(order.avg_fill_price);
        let quantity = event.payload["quantity"].as_i64().unwrap_or(0);
        self.db.update_order_from_broker(
            broker_order_id,
            if order.filled_quantity + quantity >= order.quantity {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            },
            order.filled_quantity + quantity,
            price,
            "Filled",
        )?;

        let Some(trade_id) = order.trade_id else {
            return Ok(());
        };
        let Some(trade) = self.db.get_trade(trade_id)? else {
            return Ok(());
        };

        if order.side == OrderSide::Buy
            && matches!(trade.status, TradeStatus::Open | TradeStatus::Closing)
        {
            let exit_kind = match order.order_type.as_str() {
                "STP" => ExitKind::Stop,
                _ => ExitKind::ProfitTarget,
            };
            let exit_premium = price.unwrap_or(order.limit_price);
            self.executor
                .finalize_close(&trade, exit_premium, exit_kind)
                .await?;
        }
        Ok(())
    }

    /// Mid-session position watch: stops being approached and large
    /// underlying moves become their own events, deduped per trade/day.
    async fn emit_position_alerts(&self) -> Result<()> {
        let strategy = self.memory.snapshot().strategy;
        let today = self.calendar.trading_date(Utc::now());

        for trade in self.db.open_trades()? {
            let contract = OptionContract::put(&trade.symbol, trade.expiration, trade.strike);
            if let (Ok(quote), Some(entry), true) = (
                self.broker.option_quote(&contract).await,
                trade.entry_premium,
                strategy.stop_multiple > 0.0,
            ) {
                let stop = entry * strategy.stop_multiple;
                if quote.mid() >= stop * 0.8 {
                    self.bus.publish_scheduled(
                        EventType::PositionStopApproaching,
                        json!({
                            "trade_id": trade.id,
                            "mid": quote.mid(),
                            "stop": stop,
                        }),
                        &format!("{}:{}", trade.id, today),
                    )?;
                }
            }

            if let Some(snapshot) = self.db.entry_snapshot(trade.id)? {
                if let Ok(under) = self.broker.stock_quote(&trade.symbol).await {
                    let change = (under.mid() - snapshot.underlying_price).abs()
                        / snapshot.underlying_price.max(1e-9);
                    if change >= 0.03 {
                        self.bus.publish_scheduled(
                            EventType::UnderlyingSignificantMove,
                            json!({"symbol": trade.symbol, "change_pct": change}),
                            &format!("{}:{}", trade.symbol, today),
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // the reasoning path
    // ------------------------------------------------------------------

    async fn reason_and_act(&self, event: &Event) -> Result<()> {
        let (context, facts) = self.assemble_context(event).await?;
        let decision = self.engine.decide(&context, &facts).await;

        if decision.degraded.as_deref() == Some("engine unavailable") {
            self.memory.raise_anomaly(Anomaly::new(
                AnomalyKind::ReasoningUnavailable,
                "engine call failed",
            ))?;
        }

        let decision_id = uuid::Uuid::new_v4().to_string();
        let record = DecisionRecord {
            id: decision_id.clone(),
            session_id: self.memory.session_id(),
            event_id: Some(event.id),
            context_json: serde_json::to_string(&context)?,
            output_json: serde_json::to_string(&decision.output)?,
            action: decision.output.action.as_str().to_string(),
            result_json: json!({"status": "pending"}).to_string(),
            autonomy_level: self.memory.snapshot().autonomy_level as i64,
            cost_usd: decision.cost_usd,
            created_at: Utc::now().timestamp(),
        };
        let summary = format!(
            "{} -> {} | {}",
            context.summary_line(),
            decision.output.action.as_str(),
            decision.output.reasoning.chars().take(200).collect::<String>()
        );
        if let Err(e) = self.memory.record_decision(&record, &summary).await {
            // no trading without persistence: save the record to the
            // fallback log and fail the event for retry
            warn!("decision persistence failed, using fallback log: {e:#}");
            let path = crate::store::fallback::fallback_path(&self.config.database_path);
            crate::store::fallback::append_fallback(&path, &record)?;
            return Err(e);
        }

        let result = self
            .gate_and_execute(&context, &decision)
            .await
            .unwrap_or_else(|e| json!({"status": "error", "error": format!("{e:#}")}));
        self.db
            .update_decision_result(&decision_id, &result.to_string())?;

        info!(
            event = event.event_type.as_str(),
            action = decision.output.action.as_str(),
            result = %result["status"],
            "decision recorded"
        );
        Ok(())
    }

    async fn gate_and_execute(
        &self,
        context: &ReasoningContextV1,
        decision: &EngineDecision,
    ) -> Result<serde_json::Value> {
        let output = &decision.output;
        let state = self.memory.snapshot();
        let strategy = state.strategy.clone();
        let session = self.calendar.session_at(Utc::now());

        let total_contracts: i64 = context
            .candidates
            .iter()
            .filter(|c| output.symbols.is_empty() || output.symbols.contains(&c.symbol))
            .map(|c| c.contracts)
            .sum();
        let mut new_symbol = false;
        for candidate in &context.candidates {
            if !self.db.has_traded_symbol(&candidate.symbol)? {
                new_symbol = true;
            }
        }
        let inputs = GateInputs {
            action_confidence: output.confidence,
            total_contracts,
            rolling_avg_contracts: self.db.rolling_avg_contracts(20)?,
            new_symbol: new_symbol && output.action.opens_positions(),
            max_sector_loss_streak: state
                .performance
                .sector_loss_streaks
                .values()
                .copied()
                .max()
                .unwrap_or(0),
            vix_change_pct: self.vix_change_pct(context.market.vix),
            stale_minutes: context
                .market
                .minutes_since_last_quote
                .iter()
                .map(|(_, m)| *m)
                .max()
                .unwrap_or(0),
            margin_utilisation_after: Some(context.account.margin_utilisation),
            fill_failure_streak: state.performance.fill_failure_streak,
        };

        match self
            .autonomy
            .authorize(state.autonomy_level, output.action, &inputs)
        {
            Authorization::Allow => {}
            Authorization::QueueForApproval(reason) => {
                info!(action = output.action.as_str(), %reason, "queued for approval");
                return Ok(json!({
                    "status": "queued_for_approval",
                    "reason": reason,
                    "urgency": output.urgency.clone().unwrap_or_else(|| "normal".to_string()),
                }));
            }
            Authorization::Block(reason) => {
                warn!(action = output.action.as_str(), %reason, "blocked");
                return Ok(json!({"status": "blocked", "reason": reason}));
            }
        }

        match output.action {
            DecisionAction::MonitorOnly | DecisionAction::SkipSession => {
                Ok(json!({"status": "no action"}))
            }
            DecisionAction::StageCandidates => self.executor.stage_candidates(&strategy).await,
            DecisionAction::ExecuteTrades => {
                let ids: Vec<i64> = context
                    .candidates
                    .iter()
                    .filter(|c| output.symbols.is_empty() || output.symbols.contains(&c.symbol))
                    .map(|c| c.staged_id)
                    .collect();
                if ids.is_empty() {
                    return Ok(json!({"status": "no candidates authorized"}));
                }
                self.executor.execute_staged(&ids, &strategy, session).await
            }
            DecisionAction::ClosePosition => {
                let mut results = Vec::new();
                for trade_id in &output.position_ids {
                    results.push(
                        self.executor
                            .close_position(*trade_id, ExitKind::Manual, "engine decision")
                            .await?,
                    );
                }
                Ok(json!({"status": "closed", "results": results}))
            }
            DecisionAction::RollPosition => {
                let mut results = Vec::new();
                for trade_id in &output.position_ids {
                    results.push(
                        self.executor
                            .roll_position(*trade_id, &strategy, session)
                            .await?,
                    );
                }
                Ok(json!({"status": "rolled", "results": results}))
            }
            DecisionAction::ProposeExperiment => {
                let Some(proposal) = &output.experiment else {
                    return Ok(json!({"status": "error", "error": "missing proposal"}));
                };
                self.learning.start_experiment(proposal)
            }
            DecisionAction::RequestHumanReview => Ok(json!({
                "status": "queued_for_approval",
                "reason": "engine requested review",
                "urgency": output.urgency.clone().unwrap_or_else(|| "normal".to_string()),
            })),
            DecisionAction::EmergencyHalt => {
                self.executor
                    .trigger_emergency_halt("engine emergency halt")
                    .await?;
                Ok(json!({"status": "halted"}))
            }
        }
    }

    async fn assemble_context(
        &self,
        event: &Event,
    ) -> Result<(ReasoningContextV1, GroundingFacts)> {
        let state = self.memory.snapshot();
        let now = Utc::now();
        let eastern = self.calendar.to_eastern(now);

        let account = self
            .broker
            .account_summary()
            .await
            .context("context account summary")?;
        self.db.observe_equity(account.net_liquidation)?;

        // open positions with live greeks where available
        let open = self.db.open_trades()?;
        let contracts: Vec<OptionContract> = open
            .iter()
            .map(|t| OptionContract::put(&t.symbol, t.expiration, t.strike))
            .collect();
        let live = if contracts.is_empty() {
            Vec::new()
        } else {
            self.broker
                .greeks_batch(&contracts)
                .await
                .unwrap_or_else(|_| vec![None; contracts.len()])
        };

        let today = self.calendar.trading_date(now);
        let mut positions = Vec::with_capacity(open.len());
        let mut facts = GroundingFacts::default();
        for (trade, entry) in open.iter().zip(live.into_iter()) {
            let (delta, mid) = match &entry {
                Some(e) => (e.greeks.delta, Some((e.bid + e.ask) / 2.0)),
                None => (None, None),
            };
            if let Some(d) = delta {
                facts.deltas.push(d);
            }
            if let Some(e) = &entry {
                facts.bids.push(e.bid);
            }
            positions.push(PositionContext {
                trade_id: trade.id,
                symbol: trade.symbol.clone(),
                strike: trade.strike,
                expiration: trade.expiration.to_string(),
                dte: (trade.expiration - today).num_days(),
                contracts: trade.contracts,
                entry_premium: trade.entry_premium.unwrap_or(0.0),
                current_delta: delta,
                current_mid: mid,
                unrealized_pnl: trade
                    .entry_premium
                    .zip(mid)
                    .map(|(entry, mid)| (entry - mid) * 100.0 * trade.contracts as f64),
            });
        }

        // market context + staleness
        let mut minutes_since_last_quote = Vec::new();
        let mut stale = false;
        for symbol in &state.strategy.universe {
            match self.broker.stock_quote(symbol).await {
                Ok(_) => minutes_since_last_quote.push((symbol.clone(), 0)),
                Err(_) => {
                    minutes_since_last_quote.push((
                        symbol.clone(),
                        self.config.events.staleness_threshold_secs / 60 + 1,
                    ));
                    stale = true;
                }
            }
        }
        if stale && !matches!(event.event_type, EventType::PreMarketPrep) {
            self.bus.publish(
                EventType::StaleMarketData,
                json!({"detail": "quote refresh failed during context assembly"}),
            )?;
        }

        let vix = match self.broker.stock_quote("VIX").await {
            Ok(q) => q.last.or(Some(q.mid())),
            Err(_) => None,
        };
        facts.vix = vix;
        facts.margin_utilisation = Some(account.margin_utilisation());
        self.note_session_open_vix(today, vix);

        let regime = crate::learning::patterns::vix_regime(vix)
            .trim_start_matches("vix_")
            .to_string();
        let session = match self.calendar.session_at(now) {
            Session::Regular => "regular",
            Session::PreMarket => "pre_market",
            Session::Closed => "closed",
        };

        // candidates from the staged book
        let mut candidates = Vec::new();
        for status in [
            crate::models::StagedStatus::Staged,
            crate::models::StagedStatus::Validated,
        ] {
            for staged in self.db.staged_with_status(status)? {
                facts.bids.push(staged.limit_price);
                if let Some(d) = staged.live_delta {
                    facts.deltas.push(d);
                }
                candidates.push(CandidateContext {
                    staged_id: staged.id,
                    symbol: staged.symbol,
                    strike: staged.strike,
                    expiration: staged.expiration.to_string(),
                    target_delta: staged.target_delta,
                    live_delta: staged.live_delta,
                    limit_price: staged.limit_price,
                    contracts: staged.contracts,
                });
            }
        }

        let recent = self
            .db
            .recent_decisions(5)?
            .into_iter()
            .map(|d| RecentDecisionContext {
                action: d.action,
                summary: d
                    .output_json
                    .chars()
                    .take(160)
                    .collect::<String>(),
                minutes_ago: (Utc::now().timestamp() - d.created_at) / 60,
            })
            .collect();

        let similar = self
            .memory
            .retrieve_similar(
                &format!("{} positions={}", event.event_type.as_str(), positions.len()),
                self.config.engine.retrieval_k,
            )
            .await?
            .into_iter()
            .map(|s| SimilarDecisionContext {
                summary: s.summary,
                outcome: s.outcome_json.chars().take(160).collect::<String>(),
                similarity: s.similarity,
            })
            .collect();

        let patterns = self
            .db
            .active_patterns()?
            .into_iter()
            .take(10)
            .map(|p| PatternContext {
                name: p.name,
                category: p.category,
                win_rate: p.win_rate,
                avg_roi: p.avg_roi,
                p_value: p.p_value,
            })
            .collect();

        let experiments = state
            .experiments
            .iter()
            .map(|e| ExperimentContext {
                id: e.id,
                parameter: e.parameter.clone(),
                control_value: e.control_value,
                test_value: e.test_value,
                control_count: e.control_count,
                test_count: e.test_count,
            })
            .collect();

        let context = ReasoningContextV1 {
            version: CONTEXT_VERSION,
            event_type: event.event_type.as_str().to_string(),
            session_id: state.session_id.clone(),
            autonomy_level: state.autonomy_level,
            positions,
            account: AccountContext {
                net_liquidation: account.net_liquidation,
                available_funds: account.available_funds,
                excess_liquidity: account.excess_liquidity,
                margin_utilisation: account.margin_utilisation(),
            },
            market: MarketContext {
                vix,
                vix_term_sign: None,
                regime,
                session: session.to_string(),
                time_of_day_et: eastern.format("%H:%M").to_string(),
                minutes_since_last_quote,
            },
            candidates,
            recent_decisions: recent,
            similar_past_decisions: similar,
            active_patterns: patterns,
            open_experiments: experiments,
            strategy: serde_json::to_value(&state.strategy)?,
            anomalies: state.anomalies.clone(),
        };
        Ok((context, facts))
    }

    fn note_session_open_vix(&self, today: chrono::NaiveDate, vix: Option<f64>) {
        let mut guard = self.session_open_vix.lock();
        match (&*guard, vix) {
            (Some((date, _)), _) if *date == today => {}
            (_, Some(v)) => *guard = Some((today, v)),
            _ => {}
        }
    }

    fn vix_change_pct(&self, current: Option<f64>) -> Option<f64> {
        let guard = self.session_open_vix.lock();
        match (&*guard, current) {
            (Some((_, open)), Some(now)) if *open > 0.0 => Some((now - open) / open),
            _ => None,
        }
    }

    /// End-of-day autonomy review: demote immediately on overrides,
    /// loss streaks or fired anomalies; otherwise bank a clean day and
    /// consider promotion.
    fn review_autonomy(&self) -> Result<()> {
        let state = self.memory.snapshot();
        let anomaly_fired = !state.anomalies.is_empty();
        let overridden = state.autonomy.last_override_at.map_or(false, |ts| {
            ts >= Utc::now().timestamp() - 86_400
        });

        if self
            .autonomy
            .demotion_due(overridden, state.performance.loss_streak, anomaly_fired)
        {
            self.memory.update_autonomy(|level, metrics| {
                let from = *level;
                *level = level.saturating_sub(1).max(1);
                metrics.clean_days = 0;
                info!(from, to = *level, "autonomy demoted");
            })?;
            return Ok(());
        }

        let win_rate = state.performance.win_rate();
        let sharpe = state.performance.sharpe();
        self.memory.update_autonomy(|level, metrics| {
            metrics.clean_days += 1;
            if self
                .autonomy
                .promotion_due(*level, metrics.clean_days, win_rate, sharpe)
            {
                let from = *level;
                *level += 1;
                metrics.clean_days = 0;
                metrics.last_promotion_at = Some(Utc::now().timestamp());
                info!(from, to = *level, "autonomy promoted");
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperBrokerConfig};
    use crate::config::FillConfig;
    use crate::engine::ReasoningEngine;
    use crate::memory::HashEmbedder;
    use crate::models::{OptionRight, OrderRecord, TimeInForce};
    use crate::store::NewTrade;
    use chrono::Duration as ChronoDuration;

    fn orchestrator() -> (Db, Arc<PaperBroker>, Arc<WorkingMemory>, Orchestrator) {
        let mut config = Config::load().unwrap();
        config.fills = FillConfig {
            check_interval_secs: 0,
            adjustment_interval_secs: 0,
            max_adjustments: 1,
            adjustment_increment: 0.01,
            partial_threshold: 0.5,
            monitoring_window_secs: 3,
            leave_day_orders: false,
        };
        config.selector.premium_floor = 0.05;
        config.strategy.universe = vec!["XSP".to_string()];

        let db = Db::open_in_memory().unwrap();
        let bus = EventBus::new(db.clone(), config.events.max_retries);
        let broker = Arc::new(PaperBroker::new(PaperBrokerConfig::default()));
        let broker_dyn: Arc<dyn BrokerAdapter> = broker.clone();
        let memory = Arc::new(
            WorkingMemory::load_session(
                db.clone(),
                Arc::new(HashEmbedder),
                "daemon-test",
                &config.strategy,
                &config.autonomy,
            )
            .unwrap(),
        );
        let engine = ReasoningEngine::new(None, db.clone(), config.engine.clone());
        let executor = ActionExecutor::new(
            broker_dyn.clone(),
            db.clone(),
            memory.clone(),
            bus.clone(),
            config.clone(),
        );
        let reconciler = Reconciler::new(
            broker_dyn.clone(),
            db.clone(),
            bus.clone(),
            memory.clone(),
            false,
        );
        let learning = LearningLoop::new(db.clone(), memory.clone(), bus.clone(), 30);
        let orchestrator = Orchestrator::new(
            db.clone(),
            bus,
            broker_dyn,
            memory.clone(),
            engine,
            executor,
            reconciler,
            learning,
            config,
        );
        (db, broker, memory, orchestrator)
    }

    #[tokio::test]
    async fn reasoning_event_records_decision_and_completes() {
        let (db, _broker, _memory, orchestrator) = orchestrator();
        let event_id = db
            .publish_event("SCHEDULED_CHECK", r#"{"slot":"10:15"}"#, 0)
            .unwrap();
        let event = orchestrator.bus.next().unwrap().unwrap();
        orchestrator.dispatch(event).await;

        // no LLM wired: the engine degrades to MONITOR_ONLY, the event
        // completes, and the audit row exists
        let row = db.get_event(event_id).unwrap().unwrap();
        assert_eq!(row.state, crate::store::EventState::Done);
        let decisions = db.recent_decisions(5).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, "MONITOR_ONLY");
        assert_eq!(decisions[0].event_id, Some(event_id));
        // no order was placed
        assert!(db.working_orders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_event_is_a_noop() {
        let (db, _broker, _memory, orchestrator) = orchestrator();
        db.publish_event("SCHEDULED_CHECK", "{}", 0).unwrap();
        let event = orchestrator.bus.next().unwrap().unwrap();
        orchestrator.dispatch(event.clone()).await;
        assert_eq!(db.recent_decisions(5).unwrap().len(), 1);

        // same event replayed: consumer dedup suppresses the handler
        orchestrator.dispatch(event).await;
        assert_eq!(db.recent_decisions(5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_raises_anomaly_and_blocks_reasoning() {
        let (db, _broker, memory, orchestrator) = orchestrator();
        db.publish_event("BROKER_DISCONNECTED", "{}", 1).unwrap();
        let event = orchestrator.bus.next().unwrap().unwrap();
        orchestrator.dispatch(event).await;
        assert!(memory
            .active_anomalies()
            .iter()
            .any(|a| a.kind == AnomalyKind::BrokerDisconnected));

        // subsequent reasoning event is pre-LLM blocked
        db.publish_event("SCHEDULED_CHECK", "{}", 0).unwrap();
        let event = orchestrator.bus.next().unwrap().unwrap();
        orchestrator.dispatch(event).await;
        let decision = &db.recent_decisions(1).unwrap()[0];
        assert!(decision.output_json.contains("pre-LLM block"));

        // reconnect clears it
        db.publish_event("BROKER_RECONNECTED", "{}", 0).unwrap();
        let event = orchestrator.bus.next().unwrap().unwrap();
        orchestrator.dispatch(event).await;
        assert!(memory.active_anomalies().is_empty());
    }

    #[tokio::test]
    async fn profit_target_child_fill_closes_trade() {
        let (db, _broker, _memory, orchestrator) = orchestrator();
        // an open trade with a resting profit-target child
        let trade_id = db
            .insert_pending_trade(&NewTrade {
                symbol: "XSP".into(),
                right: OptionRight::Put,
                strike: 560.0,
                expiration: (Utc::now() + ChronoDuration::days(7)).date_naive(),
                contracts: 1,
                strategy_tag: "csp_weekly".into(),
                rolled_from: None,
                roll_count: 0,
                experiment_arm: None,
            })
            .unwrap();
        db.lock()
            .execute(
                "UPDATE trades SET status = 'open', entry_premium = 1.8, entry_time = ?2 \
                 WHERE id = ?1",
                rusqlite::params![trade_id, Utc::now().to_rfc3339()],
            )
            .unwrap();
        db.insert_order(&OrderRecord {
            id: 0,
            broker_order_id: "child-1".into(),
            parent_broker_order_id: Some("parent-1".into()),
            trade_id: Some(trade_id),
            symbol: "XSP".into(),
            side: OrderSide::Buy,
            quantity: 1,
            limit_price: 0.54,
            order_type: "LMT".into(),
            tif: TimeInForce::Gtc,
            state: OrderState::Working,
            filled_quantity: 0,
            avg_fill_price: None,
            commission: 0.0,
            last_broker_status: "Submitted".into(),
            created_at: Utc::now(),
        })
        .unwrap();

        db.publish_event(
            "ORDER_FILLED",
            r#"{"broker_order_id":"child-1","execution_id":"x1","quantity":1,"price":0.54}"#,
            1,
        )
        .unwrap();
        let event = orchestrator.bus.next().unwrap().unwrap();
        orchestrator.dispatch(event).await;

        let trade = db.get_trade(trade_id).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_kind, Some(ExitKind::ProfitTarget));
        assert_eq!(trade.exit_premium, Some(0.54));
        // P&L: (1.80 - 0.54) * 100 * 1
        assert!((trade.realized_pnl.unwrap() - 126.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn autonomy_review_promotes_after_clean_days() {
        let (_db, _broker, memory, orchestrator) = orchestrator();
        // seed a performance record above the promotion floor
        for _ in 0..20 {
            memory.record_outcome(0.012, true, "broad_index").unwrap();
        }
        memory.record_outcome(0.010, true, "broad_index").unwrap();
        memory
            .update_autonomy(|_, metrics| metrics.clean_days = 9)
            .unwrap();

        orchestrator.review_autonomy().unwrap();
        let state = memory.snapshot();
        assert_eq!(state.autonomy_level, 2);
        assert_eq!(state.autonomy.clean_days, 0);
    }

    #[tokio::test]
    async fn anomaly_forces_demotion() {
        let (_db, _broker, memory, orchestrator) = orchestrator();
        memory.update_autonomy(|level, _| *level = 3).unwrap();
        memory
            .raise_anomaly(Anomaly::new(AnomalyKind::VixSpike, "vix +40%"))
            .unwrap();

        orchestrator.review_autonomy().unwrap();
        assert_eq!(memory.snapshot().autonomy_level, 2);
    }
}
