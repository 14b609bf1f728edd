//! Core domain types shared across the daemon: trades, orders, staged
//! opportunities, fill snapshots and account/market quotes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Option right. The daemon only ever sells puts, but reconciliation can
/// surface calls from manual activity in the same account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionRight {
    Put,
    Call,
}

impl OptionRight {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionRight::Put => "P",
            OptionRight::Call => "C",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P" | "PUT" => Some(Self::Put),
            "C" | "CALL" => Some(Self::Call),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Working,
    Open,
    Closing,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Working => "working",
            TradeStatus::Open => "open",
            TradeStatus::Closing => "closing",
            TradeStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "working" => Some(Self::Working),
            "open" => Some(Self::Open),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// How a position left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    ProfitTarget,
    Stop,
    Time,
    Expired,
    Assigned,
    Manual,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::ProfitTarget => "profit_target",
            ExitKind::Stop => "stop",
            ExitKind::Time => "time",
            ExitKind::Expired => "expired",
            ExitKind::Assigned => "assigned",
            ExitKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "profit_target" => Some(Self::ProfitTarget),
            "stop" => Some(Self::Stop),
            "time" => Some(Self::Time),
            "expired" => Some(Self::Expired),
            "assigned" => Some(Self::Assigned),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One short-put position lifecycle. Identity is the broker execution id
/// of the opening fill; rows are created `pending` at submission and only
/// reach `closed` with both exit premium and exit time set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    /// Broker-assigned execution id of the entry fill. Empty until filled.
    pub execution_id: Option<String>,
    pub symbol: String,
    pub right: OptionRight,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub contracts: i64,
    pub entry_premium: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_premium: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_kind: Option<ExitKind>,
    pub realized_pnl: Option<f64>,
    pub commission: f64,
    pub status: TradeStatus,
    pub strategy_tag: String,
    /// Set on the leg opened by a roll; points at the closed leg.
    pub rolled_from: Option<i64>,
    pub roll_count: i64,
    pub experiment_arm: Option<String>,
}

impl Trade {
    /// P&L for a short premium position: entry credit minus exit debit.
    pub fn pnl(&self) -> Option<f64> {
        match (self.entry_premium, self.exit_premium) {
            (Some(entry), Some(exit)) => {
                Some((entry - exit) * 100.0 * self.contracts as f64 - self.commission)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == TradeStatus::Closed
    }

    pub fn contract_key(&self) -> String {
        format!(
            "{}|{:.2}|{}|{}",
            self.symbol,
            self.strike,
            self.expiration,
            self.right.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedStatus {
    Staged,
    Validated,
    Stale,
    Executing,
    Submitted,
    Cancelled,
}

impl StagedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedStatus::Staged => "staged",
            StagedStatus::Validated => "validated",
            StagedStatus::Stale => "stale",
            StagedStatus::Executing => "executing",
            StagedStatus::Submitted => "submitted",
            StagedStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staged" => Some(Self::Staged),
            "validated" => Some(Self::Validated),
            "stale" => Some(Self::Stale),
            "executing" => Some(Self::Executing),
            "submitted" => Some(Self::Submitted),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A candidate trade that has not been sent to the broker yet. The live
/// strike selector may rewrite strike/greeks/limit in place before
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedOpportunity {
    pub id: i64,
    pub symbol: String,
    pub original_strike: f64,
    pub strike: f64,
    pub target_delta: f64,
    pub target_dte: i64,
    pub expiration: NaiveDate,
    pub limit_price: f64,
    pub contracts: i64,
    pub underlying_price: f64,
    pub live_delta: Option<f64>,
    pub status: StagedStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "BOT" => Some(Self::Buy),
            "SELL" | "SLD" => Some(Self::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "DAY",
            TimeInForce::Gtc => "GTC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAY" => Some(Self::Day),
            "GTC" => Some(Self::Gtc),
            _ => None,
        }
    }
}

/// Local view of an order's lifecycle. The broker's raw status string is
/// kept verbatim alongside for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Working,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Working => "working",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "working" => Some(Self::Working),
            "partially_filled" => Some(Self::PartiallyFilled),
            "filled" => Some(Self::Filled),
            "cancelled" => Some(Self::Cancelled),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

/// A broker-side order reference. Bracket children carry the parent's
/// broker order id; the reconciler is the only mutator after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: i64,
    pub broker_order_id: String,
    pub parent_broker_order_id: Option<String>,
    pub trade_id: Option<i64>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub limit_price: f64,
    pub order_type: String,
    pub tif: TimeInForce,
    pub state: OrderState,
    pub filled_quantity: i64,
    pub avg_fill_price: Option<f64>,
    pub commission: f64,
    pub last_broker_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub iv: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: Option<f64>,
    pub ts: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread_pct(&self) -> f64 {
        if self.bid <= 0.0 {
            return f64::INFINITY;
        }
        (self.ask - self.bid) / self.bid
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSummary {
    pub net_liquidation: f64,
    pub available_funds: f64,
    pub excess_liquidity: f64,
    pub init_margin: f64,
    pub maint_margin: f64,
}

impl AccountSummary {
    pub fn margin_utilisation(&self) -> f64 {
        if self.net_liquidation <= 0.0 {
            return 1.0;
        }
        self.init_margin / self.net_liquidation
    }
}

/// How the executed strike was chosen, recorded on the entry snapshot so
/// the learning loop can compare selection methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrikeSelectionMethod {
    StagedUnchanged,
    LiveDelta,
    StaleFallback,
}

impl StrikeSelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrikeSelectionMethod::StagedUnchanged => "staged_unchanged",
            StrikeSelectionMethod::LiveDelta => "live_delta",
            StrikeSelectionMethod::StaleFallback => "stale_fallback",
        }
    }
}

/// Market facts captured in the same transaction that opens or closes a
/// trade. Append-only; the learning loop reads these, nothing writes them
/// twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillSnapshot {
    pub trade_id: i64,
    pub captured_at: DateTime<Utc>,
    pub option_bid: f64,
    pub option_ask: f64,
    pub option_mid: f64,
    pub greeks: Greeks,
    pub underlying_price: f64,
    pub vix: Option<f64>,
    /// Technical indicators keyed by name (rsi_14, sma_50_dist, ...).
    pub indicators: serde_json::Value,
    pub selection_method: StrikeSelectionMethod,
    pub target_delta: f64,
    pub original_strike: f64,
    pub live_delta_at_selection: Option<f64>,
}

/// Anomalies fed to the reasoning pre-call guard and the autonomy
/// governor. Hard-block anomalies bypass the LLM entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ReasoningUnavailable,
    StaleMarketData,
    BrokerDisconnected,
    AssignmentDetected,
    VixSpike,
    MarginDegraded,
    FillFailureStreak,
    ReconciliationMismatch,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::ReasoningUnavailable => "reasoning_unavailable",
            AnomalyKind::StaleMarketData => "stale_market_data",
            AnomalyKind::BrokerDisconnected => "broker_disconnected",
            AnomalyKind::AssignmentDetected => "assignment_detected",
            AnomalyKind::VixSpike => "vix_spike",
            AnomalyKind::MarginDegraded => "margin_degraded",
            AnomalyKind::FillFailureStreak => "fill_failure_streak",
            AnomalyKind::ReconciliationMismatch => "reconciliation_mismatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reasoning_unavailable" => Some(Self::ReasoningUnavailable),
            "stale_market_data" => Some(Self::StaleMarketData),
            "broker_disconnected" => Some(Self::BrokerDisconnected),
            "assignment_detected" => Some(Self::AssignmentDetected),
            "vix_spike" => Some(Self::VixSpike),
            "margin_degraded" => Some(Self::MarginDegraded),
            "fill_failure_streak" => Some(Self::FillFailureStreak),
            "reconciliation_mismatch" => Some(Self::ReconciliationMismatch),
            _ => None,
        }
    }

    /// Anomalies that must never be overridden by the reasoning engine.
    pub fn is_hard_block(&self) -> bool {
        matches!(
            self,
            AnomalyKind::BrokerDisconnected
                | AnomalyKind::StaleMarketData
                | AnomalyKind::AssignmentDetected
                | AnomalyKind::MarginDegraded
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            raised_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_pnl_short_put() {
        let trade = Trade {
            id: 1,
            execution_id: Some("0001".into()),
            symbol: "XSP".into(),
            right: OptionRight::Put,
            strike: 560.0,
            expiration: NaiveDate::from_ymd_opt(2025, 7, 18).unwrap(),
            contracts: 2,
            entry_premium: Some(1.80),
            entry_time: Some(Utc::now()),
            exit_premium: Some(0.54),
            exit_time: Some(Utc::now()),
            exit_kind: Some(ExitKind::ProfitTarget),
            realized_pnl: None,
            commission: 2.10,
            status: TradeStatus::Closed,
            strategy_tag: "csp_weekly".into(),
            rolled_from: None,
            roll_count: 0,
            experiment_arm: None,
        };
        // (1.80 - 0.54) * 100 * 2 - 2.10
        assert!((trade.pnl().unwrap() - 249.9).abs() < 1e-9);
    }

    #[test]
    fn quote_spread() {
        let q = Quote {
            bid: 1.00,
            ask: 1.10,
            last: None,
            ts: Utc::now(),
        };
        assert!((q.mid() - 1.05).abs() < 1e-9);
        assert!((q.spread_pct() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn hard_block_anomalies() {
        assert!(AnomalyKind::BrokerDisconnected.is_hard_block());
        assert!(AnomalyKind::StaleMarketData.is_hard_block());
        assert!(!AnomalyKind::ReasoningUnavailable.is_hard_block());
    }

    #[test]
    fn enum_round_trips() {
        for s in ["pending", "working", "open", "closing", "closed"] {
            assert_eq!(TradeStatus::parse(s).unwrap().as_str(), s);
        }
        for s in [
            "profit_target",
            "stop",
            "time",
            "expired",
            "assigned",
            "manual",
        ] {
            assert_eq!(ExitKind::parse(s).unwrap().as_str(), s);
        }
    }
}
