//! Versioned reasoning context. Additive changes bump `CONTEXT_VERSION`
//! and the prompt embeds the version so older audit rows stay
//! re-parseable.

use serde::{Deserialize, Serialize};

use crate::models::Anomaly;

pub const CONTEXT_VERSION: u32 = 1;

pub const SYSTEM_PROMPT: &str = "\
You are the decision core of an options-income daemon that sells \
short-dated cash-secured puts through a brokerage gateway. You receive \
one JSON context per market event and must answer with a single JSON \
object, no prose outside it.

Rules:
- Choose exactly one action from: EXECUTE_TRADES, STAGE_CANDIDATES, \
CLOSE_POSITION, ROLL_POSITION, MONITOR_ONLY, SKIP_SESSION, \
PROPOSE_EXPERIMENT, REQUEST_HUMAN_REVIEW, EMERGENCY_HALT.
- Reply with fields: action, symbols, position_ids, confidence (0..1), \
reasoning, risks, and experiment (only for PROPOSE_EXPERIMENT) or \
urgency (only for REQUEST_HUMAN_REVIEW).
- Every number you cite in reasoning must come from the context verbatim.
- Prefer inaction under uncertainty. You cannot override risk blocks; \
do not try.
- Never invent symbols or position ids that are not in the context.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionContext {
    pub trade_id: i64,
    pub symbol: String,
    pub strike: f64,
    pub expiration: String,
    pub dte: i64,
    pub contracts: i64,
    pub entry_premium: f64,
    pub current_delta: Option<f64>,
    pub current_mid: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountContext {
    pub net_liquidation: f64,
    pub available_funds: f64,
    pub excess_liquidity: f64,
    pub margin_utilisation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub vix: Option<f64>,
    /// Sign of the front-month term structure: 1 contango, -1 backwardation.
    pub vix_term_sign: Option<i8>,
    pub regime: String,
    pub session: String,
    pub time_of_day_et: String,
    /// Per-symbol quote staleness, minutes.
    pub minutes_since_last_quote: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateContext {
    pub staged_id: i64,
    pub symbol: String,
    pub strike: f64,
    pub expiration: String,
    pub target_delta: f64,
    pub live_delta: Option<f64>,
    pub limit_price: f64,
    pub contracts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentDecisionContext {
    pub action: String,
    pub summary: String,
    pub minutes_ago: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarDecisionContext {
    pub summary: String,
    pub outcome: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternContext {
    pub name: String,
    pub category: String,
    pub win_rate: f64,
    pub avg_roi: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentContext {
    pub id: i64,
    pub parameter: String,
    pub control_value: f64,
    pub test_value: f64,
    pub control_count: i64,
    pub test_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningContextV1 {
    pub version: u32,
    pub event_type: String,
    pub session_id: String,
    pub autonomy_level: u8,
    pub positions: Vec<PositionContext>,
    pub account: AccountContext,
    pub market: MarketContext,
    pub candidates: Vec<CandidateContext>,
    pub recent_decisions: Vec<RecentDecisionContext>,
    pub similar_past_decisions: Vec<SimilarDecisionContext>,
    pub active_patterns: Vec<PatternContext>,
    pub open_experiments: Vec<ExperimentContext>,
    pub strategy: serde_json::Value,
    pub anomalies: Vec<Anomaly>,
}

impl ReasoningContextV1 {
    /// Deterministic prompt rendering: struct field order is fixed, so
    /// identical contexts serialize identically.
    pub fn render_prompt(&self) -> String {
        format!(
            "context_version: {}\n\n{}\n\nRespond with the decision JSON object only.",
            self.version,
            serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
        )
    }

    /// A one-line summary used for embedding and retrieval.
    pub fn summary_line(&self) -> String {
        let candidates: Vec<String> = self
            .candidates
            .iter()
            .map(|c| format!("{} {}p", c.symbol, c.strike))
            .collect();
        format!(
            "{} | positions={} candidates=[{}] vix={} regime={} autonomy=L{}",
            self.event_type,
            self.positions.len(),
            candidates.join(","),
            self.market
                .vix
                .map(|v| format!("{v:.1}"))
                .unwrap_or_else(|| "n/a".to_string()),
            self.market.regime,
            self.autonomy_level,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_context() -> ReasoningContextV1 {
        ReasoningContextV1 {
            version: CONTEXT_VERSION,
            event_type: "MARKET_OPEN".into(),
            session_id: "putbot-2025-07-14".into(),
            autonomy_level: 2,
            positions: Vec::new(),
            account: AccountContext {
                net_liquidation: 100_000.0,
                available_funds: 80_000.0,
                excess_liquidity: 75_000.0,
                margin_utilisation: 0.2,
            },
            market: MarketContext {
                vix: Some(14.2),
                vix_term_sign: Some(1),
                regime: "calm".into(),
                session: "regular".into(),
                time_of_day_et: "09:30".into(),
                minutes_since_last_quote: vec![("XSP".into(), 0)],
            },
            candidates: Vec::new(),
            recent_decisions: Vec::new(),
            similar_past_decisions: Vec::new(),
            active_patterns: Vec::new(),
            open_experiments: Vec::new(),
            strategy: serde_json::json!({"target_delta": 0.065}),
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn prompt_is_deterministic() {
        let a = minimal_context().render_prompt();
        let b = minimal_context().render_prompt();
        assert_eq!(a, b);
        assert!(a.starts_with("context_version: 1"));
    }

    #[test]
    fn context_round_trips_through_json() {
        let context = minimal_context();
        let raw = serde_json::to_string(&context).unwrap();
        let back: ReasoningContextV1 = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.version, CONTEXT_VERSION);
        assert_eq!(back.market.vix, Some(14.2));
    }

    #[test]
    fn summary_line_names_candidates() {
        let mut context = minimal_context();
        context.candidates.push(CandidateContext {
            staged_id: 1,
            symbol: "XSP".into(),
            strike: 560.0,
            expiration: "2025-07-18".into(),
            target_delta: 0.065,
            live_delta: Some(-0.068),
            limit_price: 1.80,
            contracts: 1,
        });
        let line = context.summary_line();
        assert!(line.contains("XSP 560p"));
        assert!(line.contains("vix=14.2"));
    }
}
