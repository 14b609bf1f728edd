//! Risk governor: stateless pre-trade checks over the proposal, the
//! account and the calendar. Checks run in a fixed order and the first
//! failure short-circuits with a typed reason. All thresholds come from
//! configuration; the logic itself is pure arithmetic.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::broker::MarginImpact;
use crate::config::RiskConfig;
use crate::events::Session;
use crate::models::AccountSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TradingHalted,
    OutsideMarketHours,
    EarningsWithinDte,
    MaxOpenPositions,
    MaxDailyPositions,
    DuplicatePosition,
    DailyLossLimit,
    WeeklyLossLimit,
    DrawdownLimit,
    SectorConcentration,
    PerTradeMarginCap,
    MarginUtilisation,
    ExcessLiquidity,
    VixHalt,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::TradingHalted => "trading_halted",
            RejectReason::OutsideMarketHours => "outside_market_hours",
            RejectReason::EarningsWithinDte => "earnings_within_dte",
            RejectReason::MaxOpenPositions => "max_open_positions",
            RejectReason::MaxDailyPositions => "max_daily_positions",
            RejectReason::DuplicatePosition => "duplicate_position",
            RejectReason::DailyLossLimit => "daily_loss_limit",
            RejectReason::WeeklyLossLimit => "weekly_loss_limit",
            RejectReason::DrawdownLimit => "drawdown_limit",
            RejectReason::SectorConcentration => "sector_concentration",
            RejectReason::PerTradeMarginCap => "per_trade_margin_cap",
            RejectReason::MarginUtilisation => "margin_utilisation",
            RejectReason::ExcessLiquidity => "excess_liquidity",
            RejectReason::VixHalt => "vix_halt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskVerdict {
    Approved,
    Rejected(RejectReason),
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskVerdict::Approved)
    }
}

/// The trade under evaluation.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub symbol: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub contracts: i64,
    pub entry_date: NaiveDate,
}

/// Everything the checks read, assembled by the executor before the
/// call. Keeping it a plain struct keeps the governor pure and the
/// tests table-driven.
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    pub trading_halted: bool,
    pub session: Session,
    pub earnings_date: Option<NaiveDate>,
    pub open_positions: i64,
    pub opened_today: i64,
    pub duplicate_position: bool,
    pub realized_today: f64,
    pub realized_week: f64,
    pub peak_equity: f64,
    pub account: AccountSummary,
    pub margin_impact: MarginImpact,
    pub sector_counts: HashMap<String, i64>,
    pub vix: Option<f64>,
}

/// Static symbol -> sector map; anything unknown is its own bucket.
pub fn sector_for(symbol: &str) -> &'static str {
    match symbol {
        "SPY" | "XSP" | "IWM" | "DIA" | "VOO" => "broad_index",
        "QQQ" | "AAPL" | "MSFT" | "GOOGL" | "META" | "NVDA" | "AMD" | "AVGO" | "CRM" | "ORCL" => {
            "tech"
        }
        "AMZN" | "TSLA" | "HD" | "MCD" | "NKE" | "SBUX" => "consumer",
        "JPM" | "BAC" | "GS" | "MS" | "WFC" | "SCHW" => "financials",
        "XOM" | "CVX" | "COP" | "SLB" => "energy",
        "JNJ" | "PFE" | "UNH" | "LLY" | "MRK" | "ABBV" => "healthcare",
        "BA" | "CAT" | "DE" | "GE" | "LMT" | "RTX" => "industrials",
        _ => "unknown",
    }
}

pub struct RiskGovernor {
    config: RiskConfig,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Evaluate in documented order; first failure wins.
    pub fn evaluate(&self, proposal: &TradeProposal, snapshot: &RiskSnapshot) -> RiskVerdict {
        use RejectReason::*;

        if snapshot.trading_halted {
            return RiskVerdict::Rejected(TradingHalted);
        }

        let session_ok = match snapshot.session {
            Session::Regular => true,
            Session::PreMarket => self.config.allow_pre_market,
            Session::Closed => false,
        };
        if !session_ok {
            return RiskVerdict::Rejected(OutsideMarketHours);
        }

        if let Some(earnings) = snapshot.earnings_date {
            if earnings >= proposal.entry_date && earnings <= proposal.expiration {
                return RiskVerdict::Rejected(EarningsWithinDte);
            }
        }

        if snapshot.open_positions >= self.config.max_open_positions {
            return RiskVerdict::Rejected(MaxOpenPositions);
        }
        if snapshot.opened_today >= self.config.max_daily_new_positions {
            return RiskVerdict::Rejected(MaxDailyPositions);
        }

        if snapshot.duplicate_position {
            return RiskVerdict::Rejected(DuplicatePosition);
        }

        let nlv = snapshot.account.net_liquidation;
        if nlv <= 0.0 {
            return RiskVerdict::Rejected(ExcessLiquidity);
        }

        if snapshot.realized_today / nlv <= -self.config.max_daily_loss_pct {
            return RiskVerdict::Rejected(DailyLossLimit);
        }
        if snapshot.realized_week / nlv <= -self.config.max_weekly_loss_pct {
            return RiskVerdict::Rejected(WeeklyLossLimit);
        }
        if snapshot.peak_equity > 0.0 {
            let drawdown = (snapshot.peak_equity - nlv) / snapshot.peak_equity;
            if drawdown >= self.config.max_drawdown_pct {
                return RiskVerdict::Rejected(DrawdownLimit);
            }
        }

        let sector = sector_for(&proposal.symbol);
        let sector_count = snapshot.sector_counts.get(sector).copied().unwrap_or(0);
        let total_after = snapshot.open_positions + 1;
        if (sector_count + 1) as f64 / total_after as f64 > self.config.max_sector_concentration
            && total_after > 1
        {
            return RiskVerdict::Rejected(SectorConcentration);
        }

        let margin_add =
            snapshot.margin_impact.init_margin_after - snapshot.account.init_margin;
        if margin_add > self.config.per_trade_margin_cap_pct * nlv {
            return RiskVerdict::Rejected(PerTradeMarginCap);
        }

        let equity_after = if snapshot.margin_impact.equity_after > 0.0 {
            snapshot.margin_impact.equity_after
        } else {
            nlv
        };
        // non-strict: utilisation exactly at the cap is rejected
        if snapshot.margin_impact.init_margin_after / equity_after
            >= self.config.max_margin_utilisation
        {
            return RiskVerdict::Rejected(MarginUtilisation);
        }
        let excess_after = equity_after - snapshot.margin_impact.init_margin_after;
        if excess_after < self.config.min_excess_liquidity_pct * nlv {
            return RiskVerdict::Rejected(ExcessLiquidity);
        }

        if let Some(vix) = snapshot.vix {
            if vix >= self.config.vix_halt_threshold {
                return RiskVerdict::Rejected(VixHalt);
            }
        }

        RiskVerdict::Approved
    }

    /// Post-fill account read: a degraded excess-liquidity floor after
    /// the trade trips the kill switch upstream.
    pub fn verify_post_trade_margin(&self, account: &AccountSummary) -> Option<String> {
        let nlv = account.net_liquidation;
        if nlv <= 0.0 {
            return Some("net liquidation non-positive".to_string());
        }
        if account.excess_liquidity < self.config.min_excess_liquidity_pct * nlv {
            return Some(format!(
                "excess liquidity {:.0} below {:.0}% of NLV",
                account.excess_liquidity,
                self.config.min_excess_liquidity_pct * 100.0
            ));
        }
        if account.margin_utilisation() >= self.config.max_margin_utilisation {
            return Some(format!(
                "margin utilisation {:.2} at/above cap {:.2}",
                account.margin_utilisation(),
                self.config.max_margin_utilisation
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_snapshot() -> RiskSnapshot {
        RiskSnapshot {
            trading_halted: false,
            session: Session::Regular,
            earnings_date: None,
            open_positions: 1,
            opened_today: 0,
            duplicate_position: false,
            realized_today: 0.0,
            realized_week: 0.0,
            peak_equity: 100_000.0,
            account: AccountSummary {
                net_liquidation: 100_000.0,
                available_funds: 80_000.0,
                excess_liquidity: 75_000.0,
                init_margin: 12_000.0,
                maint_margin: 10_000.0,
            },
            margin_impact: MarginImpact {
                init_margin_after: 20_000.0,
                maint_margin_after: 16_000.0,
                equity_after: 100_000.0,
                commission_est: 1.05,
            },
            sector_counts: HashMap::new(),
            vix: Some(14.2),
        }
    }

    fn proposal() -> TradeProposal {
        TradeProposal {
            symbol: "XSP".into(),
            strike: 560.0,
            expiration: NaiveDate::from_ymd_opt(2025, 7, 18).unwrap(),
            contracts: 1,
            entry_date: NaiveDate::from_ymd_opt(2025, 7, 14).unwrap(),
        }
    }

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default())
    }

    #[test]
    fn clean_proposal_approved() {
        assert_eq!(
            governor().evaluate(&proposal(), &base_snapshot()),
            RiskVerdict::Approved
        );
    }

    #[test]
    fn kill_switch_first() {
        let mut snapshot = base_snapshot();
        snapshot.trading_halted = true;
        // even with every other check failing, the halt wins
        snapshot.vix = Some(90.0);
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::TradingHalted)
        );
    }

    #[test]
    fn earnings_inside_window_rejected() {
        let mut snapshot = base_snapshot();
        snapshot.earnings_date = NaiveDate::from_ymd_opt(2025, 7, 16);
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::EarningsWithinDte)
        );

        // earnings after expiration is fine
        snapshot.earnings_date = NaiveDate::from_ymd_opt(2025, 7, 24);
        assert!(governor().evaluate(&proposal(), &snapshot).is_approved());
    }

    #[test]
    fn pre_market_respects_config() {
        let mut snapshot = base_snapshot();
        snapshot.session = Session::PreMarket;
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::OutsideMarketHours)
        );

        let mut config = RiskConfig::default();
        config.allow_pre_market = true;
        assert!(RiskGovernor::new(config)
            .evaluate(&proposal(), &snapshot)
            .is_approved());
    }

    #[test]
    fn margin_utilisation_cap_is_non_strict() {
        let mut snapshot = base_snapshot();
        // exactly at the 30% default cap: 30_000 / 100_000
        snapshot.margin_impact.init_margin_after = 30_000.0;
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::MarginUtilisation)
        );

        snapshot.margin_impact.init_margin_after = 29_999.0;
        assert!(governor().evaluate(&proposal(), &snapshot).is_approved());
    }

    #[test]
    fn per_trade_margin_cap() {
        let mut snapshot = base_snapshot();
        // default cap 10% of 100k = 10k; this trade adds 12k
        snapshot.margin_impact.init_margin_after = snapshot.account.init_margin + 12_000.0;
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::PerTradeMarginCap)
        );
    }

    #[test]
    fn daily_loss_halts_new_entries() {
        let mut snapshot = base_snapshot();
        snapshot.realized_today = -2_000.0; // exactly -2% of 100k
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::DailyLossLimit)
        );
    }

    #[test]
    fn sector_concentration() {
        let mut snapshot = base_snapshot();
        snapshot.open_positions = 2;
        snapshot
            .sector_counts
            .insert("broad_index".to_string(), 2);
        // 3 of 3 in one sector > 40%
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::SectorConcentration)
        );
    }

    #[test]
    fn vix_halt_blocks_entries() {
        let mut snapshot = base_snapshot();
        snapshot.vix = Some(35.0);
        assert_eq!(
            governor().evaluate(&proposal(), &snapshot),
            RiskVerdict::Rejected(RejectReason::VixHalt)
        );
    }

    #[test]
    fn post_trade_margin_verify() {
        let governor = governor();
        let healthy = base_snapshot().account;
        assert!(governor.verify_post_trade_margin(&healthy).is_none());

        let degraded = AccountSummary {
            excess_liquidity: 10_000.0,
            ..healthy
        };
        assert!(governor.verify_post_trade_margin(&degraded).is_some());
    }

    #[test]
    fn unknown_symbol_is_its_own_sector() {
        assert_eq!(sector_for("ZZTOP"), "unknown");
        assert_eq!(sector_for("XSP"), "broad_index");
    }
}
