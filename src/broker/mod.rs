//! Broker adapter: the only broker dependency of the core. One trait,
//! two implementations: the IB Client Portal gateway and a seeded
//! paper simulator. Asynchronous broker happenings (status changes,
//! fills, connectivity) are queued inside the adapter and drained by
//! the daemon's event pump, never executed on the I/O path.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AccountSummary, Greeks, OptionRight, OrderSide, Quote, TimeInForce};

pub mod ibkr;
pub mod paper;

pub use ibkr::IbkrAdapter;
pub use paper::{PaperBroker, PaperBrokerConfig};

/// An option contract, possibly qualified (conid resolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub symbol: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub right: OptionRight,
    pub conid: Option<String>,
}

impl OptionContract {
    pub fn put(symbol: &str, expiration: NaiveDate, strike: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            expiration,
            strike,
            right: OptionRight::Put,
            conid: None,
        }
    }

    pub fn occ_symbol(&self) -> String {
        format!(
            "{}{}{}{:08}",
            self.symbol,
            self.expiration.format("%y%m%d"),
            self.right.as_str(),
            (self.strike * 1000.0).round() as i64
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Limit,
    Stop,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Limit => "LMT",
            OrderKind::Stop => "STP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub side: OrderSide,
    pub quantity: i64,
    /// Limit price, or the trigger price for stop orders.
    pub limit_price: f64,
    pub tif: TimeInForce,
    pub kind: OrderKind,
}

impl OrderTicket {
    pub fn limit(side: OrderSide, quantity: i64, limit_price: f64, tif: TimeInForce) -> Self {
        Self {
            side,
            quantity,
            limit_price,
            tif,
            kind: OrderKind::Limit,
        }
    }

    pub fn stop(side: OrderSide, quantity: i64, trigger: f64, tif: TimeInForce) -> Self {
        Self {
            side,
            quantity,
            limit_price: trigger,
            tif,
            kind: OrderKind::Stop,
        }
    }
}

/// Parent entry plus linked exits, transmitted parent-first: children
/// are never sent before the parent is accepted.
#[derive(Debug, Clone)]
pub struct BracketTicket {
    pub parent: OrderTicket,
    pub profit_target: Option<OrderTicket>,
    pub stop: Option<OrderTicket>,
}

#[derive(Debug, Clone)]
pub struct OrderRef {
    pub broker_order_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct BracketRefs {
    pub parent: OrderRef,
    pub children: Vec<OrderRef>,
}

#[derive(Debug, Clone)]
pub struct BrokerOrderStatus {
    pub broker_order_id: String,
    pub status: String,
    pub filled: i64,
    pub remaining: i64,
    pub avg_fill_price: Option<f64>,
}

impl BrokerOrderStatus {
    pub fn is_filled(&self) -> bool {
        self.remaining == 0 && self.filled > 0
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status.as_str(), "Cancelled" | "ApiCancelled" | "Inactive")
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionFill {
    pub execution_id: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub time: DateTime<Utc>,
    pub commission: Option<f64>,
}

/// What-if result: post-trade margin without placing the order.
#[derive(Debug, Clone, Copy)]
pub struct MarginImpact {
    pub init_margin_after: f64,
    pub maint_margin_after: f64,
    pub equity_after: f64,
    pub commission_est: f64,
}

#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub sec_type: String,
    pub right: Option<OptionRight>,
    pub strike: Option<f64>,
    pub expiration: Option<NaiveDate>,
    pub quantity: i64,
    pub avg_cost: f64,
}

/// Per-contract chain sample used by the live strike selector.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub contract: OptionContract,
    pub greeks: Greeks,
    pub bid: f64,
    pub ask: f64,
    pub volume: i64,
    pub open_interest: i64,
}

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    OrderStatus(BrokerOrderStatus),
    OrderFilled(ExecutionFill),
    Disconnected,
    Reconnected,
}

/// Synchronous facade over the broker gateway. Every call carries a
/// deadline inside the implementation; timeouts surface as errors and
/// the caller treats the order state as unknown until reconciled.
#[async_trait::async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn account_summary(&self) -> Result<AccountSummary>;

    /// Quote for a stock or index symbol (underlyings and VIX).
    async fn stock_quote(&self, symbol: &str) -> Result<Quote>;

    async fn option_quote(&self, contract: &OptionContract) -> Result<Quote>;

    /// Available strikes for an expiration.
    async fn option_chain(&self, underlying: &str, expiration: NaiveDate) -> Result<Vec<f64>>;

    /// Model greeks + top of book for a batch of contracts; entries the
    /// broker cannot price come back as `None`.
    async fn greeks_batch(&self, contracts: &[OptionContract]) -> Result<Vec<Option<ChainEntry>>>;

    async fn qualify_contracts(&self, contracts: Vec<OptionContract>)
        -> Result<Vec<OptionContract>>;

    async fn whatif_order(
        &self,
        contract: &OptionContract,
        ticket: &OrderTicket,
    ) -> Result<MarginImpact>;

    async fn place_order(&self, contract: &OptionContract, ticket: &OrderTicket)
        -> Result<OrderRef>;

    async fn place_bracket(
        &self,
        contract: &OptionContract,
        bracket: &BracketTicket,
    ) -> Result<BracketRefs>;

    async fn modify_order(&self, broker_order_id: &str, new_limit: f64) -> Result<OrderRef>;

    /// Returns the final status string.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<String>;

    async fn order_status(&self, broker_order_id: &str) -> Result<BrokerOrderStatus>;

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrderStatus>>;

    async fn list_executions(&self) -> Result<Vec<ExecutionFill>>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>>;

    fn is_connected(&self) -> bool;

    /// Drain queued asynchronous broker events. Called by the daemon's
    /// event pump; implementations must never block here.
    fn drain_events(&self) -> Vec<BrokerEvent>;

    /// Drop per-process caches (chain, qualifications). Called on
    /// disconnect so stale identifiers cannot leak across sessions.
    fn invalidate_caches(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occ_symbol_format() {
        let contract = OptionContract::put(
            "XSP",
            NaiveDate::from_ymd_opt(2025, 7, 18).unwrap(),
            560.0,
        );
        assert_eq!(contract.occ_symbol(), "XSP250718P00560000");
    }
}
