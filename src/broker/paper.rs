//! Paper broker: a seeded in-process simulation of the gateway used for
//! dry-run operation and tests. Latency, rejections and partial fills
//! are configurable; with the default seed the behaviour is fully
//! reproducible.

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use tokio::time::{sleep, Duration};

use super::{
    BracketRefs, BracketTicket, BrokerAdapter, BrokerEvent, BrokerOrderStatus, BrokerPosition,
    ChainEntry, ExecutionFill, MarginImpact, OptionContract, OrderRef, OrderTicket,
};
use crate::models::{AccountSummary, Greeks, OptionRight, OrderSide, Quote};

#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Probability a submission is rejected outright.
    pub reject_prob: f64,
    /// Probability a fill arrives on any given poll of a working order.
    pub fill_prob_per_poll: f64,
    /// Probability that an arriving fill is partial.
    pub partial_fill_prob: f64,
    pub min_fill_ratio: f64,
    pub commission_per_contract: f64,
    pub starting_net_liq: f64,
    pub seed: u64,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 20,
            latency_jitter_ms: 30,
            reject_prob: 0.0,
            fill_prob_per_poll: 1.0,
            partial_fill_prob: 0.0,
            min_fill_ratio: 0.4,
            commission_per_contract: 1.05,
            starting_net_liq: 100_000.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
struct SimOrder {
    contract: OptionContract,
    ticket: OrderTicket,
    status: String,
    filled: i64,
    avg_price: Option<f64>,
    parent_id: Option<String>,
    /// Bracket children hold until the parent is accepted and filled.
    dormant: bool,
}

struct PaperState {
    rng: StdRng,
    next_order_id: u64,
    next_exec_id: u64,
    orders: HashMap<String, SimOrder>,
    executions: Vec<ExecutionFill>,
    events: VecDeque<BrokerEvent>,
    marks: HashMap<String, f64>,
    init_margin: f64,
    connected: bool,
}

pub struct PaperBroker {
    config: PaperBrokerConfig,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            state: Mutex::new(PaperState {
                rng,
                next_order_id: 100,
                next_exec_id: 1,
                orders: HashMap::new(),
                executions: Vec::new(),
                events: VecDeque::new(),
                marks: HashMap::from([
                    ("XSP".to_string(), 598.4),
                    ("SPY".to_string(), 597.2),
                    ("QQQ".to_string(), 531.8),
                    ("VIX".to_string(), 14.2),
                ]),
                init_margin: 0.0,
                connected: true,
            }),
        }
    }

    /// Pin an underlying mark (tests and replay tooling).
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// Flip simulated connectivity, queueing the matching event.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock();
        if state.connected != connected {
            state.connected = connected;
            state.events.push_back(if connected {
                BrokerEvent::Reconnected
            } else {
                BrokerEvent::Disconnected
            });
        }
    }

    /// Force a full fill at a price (tests drive exact scenarios).
    pub fn force_fill(&self, broker_order_id: &str, price: f64) {
        let mut state = self.state.lock();
        Self::fill_order(&self.config, &mut state, broker_order_id, price, None);
    }

    async fn latency(&self) {
        let jitter = {
            let mut state = self.state.lock();
            state.rng.gen_range(0..=self.config.latency_jitter_ms)
        };
        sleep(Duration::from_millis(self.config.base_latency_ms + jitter)).await;
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.state.lock().connected {
            return Err(anyhow!("paper broker: gateway disconnected"));
        }
        Ok(())
    }

    fn mark_for(state: &mut PaperState, symbol: &str) -> f64 {
        *state.marks.entry(symbol.to_string()).or_insert(100.0)
    }

    /// Crude synthetic pricing: time value decays with OTM distance,
    /// scales with sqrt(DTE). Good enough to exercise every floor.
    fn option_mid(underlying: f64, strike: f64, expiration: NaiveDate) -> f64 {
        let dte = (expiration - Utc::now().date_naive()).num_days().max(0) as f64;
        let otm_pct = ((underlying - strike) / underlying).max(0.0);
        let intrinsic = (strike - underlying).max(0.0);
        let time_value = underlying * 0.004 * (dte.max(0.5)).sqrt() * (-otm_pct * 28.0).exp();
        (intrinsic + time_value).max(0.02)
    }

    fn synthetic_delta(underlying: f64, strike: f64, expiration: NaiveDate) -> f64 {
        let dte = (expiration - Utc::now().date_naive()).num_days().max(0) as f64;
        let otm_pct = (underlying - strike) / underlying;
        // short-put delta shrinks fast as the strike moves OTM
        let scale = 18.0 / (dte.max(1.0)).sqrt().max(1.0);
        -(0.5 * (-otm_pct * scale * 4.0).exp()).clamp(0.001, 0.5)
    }

    fn fill_order(
        config: &PaperBrokerConfig,
        state: &mut PaperState,
        broker_order_id: &str,
        price: f64,
        quantity: Option<i64>,
    ) {
        let Some(order) = state.orders.get_mut(broker_order_id) else {
            return;
        };
        if order.status == "Filled" || order.status == "Cancelled" {
            return;
        }
        let remaining = order.ticket.quantity - order.filled;
        let qty = quantity.unwrap_or(remaining).min(remaining);
        if qty <= 0 {
            return;
        }

        let prior_notional = order.avg_price.unwrap_or(0.0) * order.filled as f64;
        order.filled += qty;
        order.avg_price =
            Some((prior_notional + price * qty as f64) / order.filled as f64);
        let full = order.filled >= order.ticket.quantity;
        order.status = if full { "Filled" } else { "Submitted" }.to_string();

        let exec_id = format!("paper-exec-{}", state.next_exec_id);
        state.next_exec_id += 1;
        let fill = ExecutionFill {
            execution_id: exec_id,
            broker_order_id: broker_order_id.to_string(),
            symbol: state.orders[broker_order_id].contract.symbol.clone(),
            side: state.orders[broker_order_id].ticket.side,
            quantity: qty,
            price,
            time: Utc::now(),
            commission: Some(config.commission_per_contract * qty as f64),
        };
        state.executions.push(fill.clone());
        state.events.push_back(BrokerEvent::OrderFilled(fill));

        let snapshot = &state.orders[broker_order_id];
        state.events.push_back(BrokerEvent::OrderStatus(BrokerOrderStatus {
            broker_order_id: broker_order_id.to_string(),
            status: snapshot.status.clone(),
            filled: snapshot.filled,
            remaining: snapshot.ticket.quantity - snapshot.filled,
            avg_fill_price: snapshot.avg_price,
        }));

        // a filled bracket parent activates its children
        if full {
            let parent_id = broker_order_id.to_string();
            let child_ids: Vec<String> = state
                .orders
                .iter()
                .filter(|(_, o)| o.parent_id.as_deref() == Some(parent_id.as_str()) && o.dormant)
                .map(|(id, _)| id.clone())
                .collect();
            for id in child_ids {
                if let Some(child) = state.orders.get_mut(&id) {
                    child.dormant = false;
                    child.status = "Submitted".to_string();
                }
            }
        }
    }

    /// Advance the simulation one step: working orders may fill.
    fn advance(&self) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        let ids: Vec<String> = state
            .orders
            .iter()
            // stop orders only fire when a test forces them
            .filter(|(_, o)| {
                !o.dormant && o.status == "Submitted" && o.ticket.kind == super::OrderKind::Limit
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let roll: f64 = state.rng.gen();
            if roll >= self.config.fill_prob_per_poll {
                continue;
            }
            let (limit, remaining) = {
                let order = &state.orders[&id];
                (order.ticket.limit_price, order.ticket.quantity - order.filled)
            };
            let partial_roll: f64 = state.rng.gen();
            let qty = if partial_roll < self.config.partial_fill_prob && remaining > 1 {
                let ratio = state
                    .rng
                    .gen_range(self.config.min_fill_ratio..1.0_f64);
                ((remaining as f64 * ratio).ceil() as i64).clamp(1, remaining - 1)
            } else {
                remaining
            };
            Self::fill_order(&self.config, &mut state, &id, limit, Some(qty));
        }
    }

    fn submit(
        &self,
        contract: &OptionContract,
        ticket: &OrderTicket,
        parent_id: Option<String>,
        dormant: bool,
    ) -> Result<OrderRef> {
        let mut state = self.state.lock();
        let roll: f64 = state.rng.gen();
        if roll < self.config.reject_prob {
            return Err(anyhow!("paper broker: order rejected (simulated)"));
        }
        let id = state.next_order_id.to_string();
        state.next_order_id += 1;
        let status = if dormant { "PreSubmitted" } else { "Submitted" };
        state.orders.insert(
            id.clone(),
            SimOrder {
                contract: contract.clone(),
                ticket: ticket.clone(),
                status: status.to_string(),
                filled: 0,
                avg_price: None,
                parent_id,
                dormant,
            },
        );
        Ok(OrderRef {
            broker_order_id: id,
            status: status.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl BrokerAdapter for PaperBroker {
    async fn account_summary(&self) -> Result<AccountSummary> {
        self.ensure_connected()?;
        let state = self.state.lock();
        let net_liq = self.config.starting_net_liq;
        Ok(AccountSummary {
            net_liquidation: net_liq,
            available_funds: net_liq - state.init_margin,
            excess_liquidity: net_liq - state.init_margin,
            init_margin: state.init_margin,
            maint_margin: state.init_margin * 0.8,
        })
    }

    async fn stock_quote(&self, symbol: &str) -> Result<Quote> {
        self.ensure_connected()?;
        self.latency().await;
        let mut state = self.state.lock();
        let mark = Self::mark_for(&mut state, symbol);
        let half_spread = (mark * 0.0002).max(0.01);
        Ok(Quote {
            bid: mark - half_spread,
            ask: mark + half_spread,
            last: Some(mark),
            ts: Utc::now(),
        })
    }

    async fn option_quote(&self, contract: &OptionContract) -> Result<Quote> {
        self.ensure_connected()?;
        self.latency().await;
        let mut state = self.state.lock();
        let underlying = Self::mark_for(&mut state, &contract.symbol);
        let mid = Self::option_mid(underlying, contract.strike, contract.expiration);
        let half_spread = (mid * 0.03).max(0.01);
        Ok(Quote {
            bid: (mid - half_spread).max(0.01),
            ask: mid + half_spread,
            last: Some(mid),
            ts: Utc::now(),
        })
    }

    async fn option_chain(&self, underlying: &str, _expiration: NaiveDate) -> Result<Vec<f64>> {
        self.ensure_connected()?;
        self.latency().await;
        let mut state = self.state.lock();
        let mark = Self::mark_for(&mut state, underlying);
        let step = if mark >= 200.0 { 5.0 } else { 1.0 };
        let mut strikes = Vec::new();
        let mut strike = (mark * 0.60 / step).floor() * step;
        while strike <= (mark * 1.05 / step).ceil() * step {
            strikes.push(strike);
            strike += step;
        }
        Ok(strikes)
    }

    async fn greeks_batch(&self, contracts: &[OptionContract]) -> Result<Vec<Option<ChainEntry>>> {
        self.ensure_connected()?;
        self.latency().await;
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(contracts.len());
        for contract in contracts {
            let underlying = Self::mark_for(&mut state, &contract.symbol);
            let mid = Self::option_mid(underlying, contract.strike, contract.expiration);
            let half_spread = (mid * 0.03).max(0.01);
            let delta = Self::synthetic_delta(underlying, contract.strike, contract.expiration);
            out.push(Some(ChainEntry {
                contract: contract.clone(),
                greeks: Greeks {
                    delta: Some(delta),
                    gamma: Some(0.01),
                    theta: Some(-mid * 0.08),
                    iv: Some(0.18),
                },
                bid: (mid - half_spread).max(0.01),
                ask: mid + half_spread,
                volume: 250,
                open_interest: 1_500,
            }));
        }
        Ok(out)
    }

    async fn qualify_contracts(
        &self,
        contracts: Vec<OptionContract>,
    ) -> Result<Vec<OptionContract>> {
        self.ensure_connected()?;
        self.latency().await;
        Ok(contracts
            .into_iter()
            .map(|mut c| {
                c.conid = Some(c.occ_symbol());
                c
            })
            .collect())
    }

    async fn whatif_order(
        &self,
        contract: &OptionContract,
        ticket: &OrderTicket,
    ) -> Result<MarginImpact> {
        self.ensure_connected()?;
        self.latency().await;
        let state = self.state.lock();
        // naked put margin approximation: 20% of strike notional
        let add = 0.20 * contract.strike * 100.0 * ticket.quantity as f64;
        Ok(MarginImpact {
            init_margin_after: state.init_margin + add,
            maint_margin_after: (state.init_margin + add) * 0.8,
            equity_after: self.config.starting_net_liq,
            commission_est: self.config.commission_per_contract * ticket.quantity as f64,
        })
    }

    async fn place_order(
        &self,
        contract: &OptionContract,
        ticket: &OrderTicket,
    ) -> Result<OrderRef> {
        self.ensure_connected()?;
        self.latency().await;
        self.submit(contract, ticket, None, false)
    }

    async fn place_bracket(
        &self,
        contract: &OptionContract,
        bracket: &BracketTicket,
    ) -> Result<BracketRefs> {
        self.ensure_connected()?;
        self.latency().await;
        let parent = self.submit(contract, &bracket.parent, None, false)?;
        let mut children = Vec::new();
        for child in [&bracket.profit_target, &bracket.stop].into_iter().flatten() {
            children.push(self.submit(
                contract,
                child,
                Some(parent.broker_order_id.clone()),
                true,
            )?);
        }
        Ok(BracketRefs { parent, children })
    }

    async fn modify_order(&self, broker_order_id: &str, new_limit: f64) -> Result<OrderRef> {
        self.ensure_connected()?;
        self.latency().await;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| anyhow!("paper broker: unknown order {broker_order_id}"))?;
        if order.status == "Filled" || order.status == "Cancelled" {
            return Err(anyhow!("paper broker: order {broker_order_id} is terminal"));
        }
        order.ticket.limit_price = new_limit;
        Ok(OrderRef {
            broker_order_id: broker_order_id.to_string(),
            status: order.status.clone(),
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<String> {
        self.ensure_connected()?;
        self.latency().await;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| anyhow!("paper broker: unknown order {broker_order_id}"))?;
        if order.status != "Filled" {
            order.status = "Cancelled".to_string();
        }
        let status = order.status.clone();
        let update = BrokerOrderStatus {
            broker_order_id: broker_order_id.to_string(),
            status: status.clone(),
            filled: order.filled,
            remaining: order.ticket.quantity - order.filled,
            avg_fill_price: order.avg_price,
        };
        state.events.push_back(BrokerEvent::OrderStatus(update));
        Ok(status)
    }

    async fn order_status(&self, broker_order_id: &str) -> Result<BrokerOrderStatus> {
        self.ensure_connected()?;
        self.advance();
        let state = self.state.lock();
        let order = state
            .orders
            .get(broker_order_id)
            .ok_or_else(|| anyhow!("paper broker: unknown order {broker_order_id}"))?;
        Ok(BrokerOrderStatus {
            broker_order_id: broker_order_id.to_string(),
            status: order.status.clone(),
            filled: order.filled,
            remaining: order.ticket.quantity - order.filled,
            avg_fill_price: order.avg_price,
        })
    }

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrderStatus>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        Ok(state
            .orders
            .iter()
            .filter(|(_, o)| o.status == "Submitted" || o.status == "PreSubmitted")
            .map(|(id, o)| BrokerOrderStatus {
                broker_order_id: id.clone(),
                status: o.status.clone(),
                filled: o.filled,
                remaining: o.ticket.quantity - o.filled,
                avg_fill_price: o.avg_price,
            })
            .collect())
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionFill>> {
        self.ensure_connected()?;
        Ok(self.state.lock().executions.clone())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.ensure_connected()?;
        let state = self.state.lock();
        let mut agg: HashMap<String, BrokerPosition> = HashMap::new();
        for order in state.orders.values() {
            if order.filled == 0 {
                continue;
            }
            let key = order.contract.occ_symbol();
            let signed = match order.ticket.side {
                OrderSide::Sell => -order.filled,
                OrderSide::Buy => order.filled,
            };
            let entry = agg.entry(key).or_insert_with(|| BrokerPosition {
                symbol: order.contract.symbol.clone(),
                sec_type: "OPT".to_string(),
                right: Some(OptionRight::Put),
                strike: Some(order.contract.strike),
                expiration: Some(order.contract.expiration),
                quantity: 0,
                avg_cost: order.avg_price.unwrap_or(0.0),
            });
            entry.quantity += signed;
        }
        Ok(agg.into_values().filter(|p| p.quantity != 0).collect())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn drain_events(&self) -> Vec<BrokerEvent> {
        self.advance();
        let mut state = self.state.lock();
        state.events.drain(..).collect()
    }

    fn invalidate_caches(&self) {
        // nothing cached in the simulation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> OptionContract {
        OptionContract::put(
            "XSP",
            (Utc::now() + chrono::Duration::days(7)).date_naive(),
            560.0,
        )
    }

    fn sell_ticket(qty: i64, limit: f64) -> OrderTicket {
        OrderTicket::limit(OrderSide::Sell, qty, limit, crate::models::TimeInForce::Day)
    }

    #[tokio::test]
    async fn bracket_children_dormant_until_parent_fill() {
        let broker = PaperBroker::new(PaperBrokerConfig {
            fill_prob_per_poll: 0.0,
            ..Default::default()
        });
        let bracket = BracketTicket {
            parent: sell_ticket(1, 1.80),
            profit_target: Some(OrderTicket::limit(
                OrderSide::Buy,
                1,
                0.54,
                crate::models::TimeInForce::Gtc,
            )),
            stop: None,
        };
        let refs = broker.place_bracket(&contract(), &bracket).await.unwrap();
        assert_eq!(refs.children.len(), 1);
        assert_eq!(refs.children[0].status, "PreSubmitted");

        broker.force_fill(&refs.parent.broker_order_id, 1.80);
        let child = broker
            .order_status(&refs.children[0].broker_order_id)
            .await
            .unwrap();
        assert_eq!(child.status, "Submitted");

        let events = broker.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, BrokerEvent::OrderFilled(f) if f.quantity == 1)));
    }

    #[tokio::test]
    async fn fills_arrive_on_poll() {
        let broker = PaperBroker::new(PaperBrokerConfig::default());
        let order = broker
            .place_order(&contract(), &sell_ticket(2, 1.75))
            .await
            .unwrap();
        // fill_prob_per_poll = 1.0 fills on first status sample
        let status = broker.order_status(&order.broker_order_id).await.unwrap();
        assert!(status.is_filled());
        assert_eq!(status.avg_fill_price, Some(1.75));

        let executions = broker.list_executions().await.unwrap();
        assert_eq!(executions.iter().map(|e| e.quantity).sum::<i64>(), 2);
    }

    #[tokio::test]
    async fn disconnect_refuses_submissions() {
        let broker = PaperBroker::new(PaperBrokerConfig::default());
        broker.set_connected(false);
        assert!(broker
            .place_order(&contract(), &sell_ticket(1, 1.0))
            .await
            .is_err());
        let events = broker.drain_events();
        assert!(matches!(events.first(), Some(BrokerEvent::Disconnected)));

        broker.set_connected(true);
        let events = broker.drain_events();
        assert!(matches!(events.first(), Some(BrokerEvent::Reconnected)));
    }

    #[tokio::test]
    async fn short_position_aggregation() {
        let broker = PaperBroker::new(PaperBrokerConfig::default());
        let order = broker
            .place_order(&contract(), &sell_ticket(3, 1.70))
            .await
            .unwrap();
        broker.force_fill(&order.broker_order_id, 1.70);
        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, -3);
    }
}
