//! Reasoning engine: event + context in, validated decision out. Hard
//! anomaly blocks run before the model is ever consulted, the model
//! gets one repair attempt on malformed output, and every guard failure
//! degrades to MONITOR_ONLY rather than erroring.

use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::store::{CostCounters, Db};

pub mod context;
pub mod llm;
pub mod output;

pub use context::{ReasoningContextV1, CONTEXT_VERSION, SYSTEM_PROMPT};
pub use llm::{LlmCallOutput, LlmClient};
pub use output::{
    grounding_mismatches, parse_decision_output, DecisionAction, DecisionOutput, GroundingFacts,
};

const REPAIR_INSTRUCTION: &str = "\nYour previous reply was not valid decision JSON. \
Respond again with ONLY the corrected JSON object, no commentary.";

/// Outcome of one reasoning pass. Guard degradations are reported, not
/// raised; the daemon treats this as infallible.
#[derive(Debug, Clone)]
pub struct EngineDecision {
    pub output: DecisionOutput,
    pub raw_content: String,
    pub cost_usd: f64,
    /// Set when a guard forced the action down to MONITOR_ONLY.
    pub degraded: Option<String>,
}

impl EngineDecision {
    fn degraded(reason: &str, original: Option<&str>, cost_usd: f64, raw: String) -> Self {
        Self {
            output: DecisionOutput::monitor_only(reason, original),
            raw_content: raw,
            cost_usd,
            degraded: Some(reason.to_string()),
        }
    }
}

pub struct ReasoningEngine {
    llm: Option<LlmClient>,
    db: Db,
    config: EngineConfig,
}

impl ReasoningEngine {
    pub fn new(llm: Option<LlmClient>, db: Db, config: EngineConfig) -> Self {
        Self { llm, db, config }
    }

    /// Daily budget with UTC-midnight rollover.
    fn budget(&self) -> Result<CostCounters> {
        let mut counters = self.db.engine_budget()?;
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc()
            .timestamp();
        if counters.day_start != day_start {
            counters = CostCounters {
                day_start,
                ..Default::default()
            };
        }
        Ok(counters)
    }

    fn budget_exhausted(&self, counters: &CostCounters) -> Option<String> {
        if counters.cost_usd >= self.config.daily_cost_cap_usd {
            return Some(format!(
                "daily cost cap reached (${:.2})",
                counters.cost_usd
            ));
        }
        if counters.calls >= self.config.max_calls_per_day {
            return Some(format!("daily call cap reached ({})", counters.calls));
        }
        if counters.tokens >= self.config.max_tokens_per_day {
            return Some(format!("daily token cap reached ({})", counters.tokens));
        }
        None
    }

    fn call_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens_usd
    }

    /// One reasoning pass. Order of guards:
    /// 1. hard-block anomalies (pre-LLM, cannot be overridden)
    /// 2. daily budget
    /// 3. model call + single repair attempt
    /// 4. numeric grounding
    /// 5. minimal-footprint confidence floor
    pub async fn decide(
        &self,
        context: &ReasoningContextV1,
        facts: &GroundingFacts,
    ) -> EngineDecision {
        if let Some(anomaly) = context.anomalies.iter().find(|a| a.kind.is_hard_block()) {
            return EngineDecision::degraded(
                &format!("pre-LLM block: {}", anomaly.kind.as_str()),
                None,
                0.0,
                String::new(),
            );
        }

        let mut counters = match self.budget() {
            Ok(c) => c,
            Err(e) => {
                warn!("budget read failed: {e:#}");
                return EngineDecision::degraded("engine budget unavailable", None, 0.0, String::new());
            }
        };
        if let Some(reason) = self.budget_exhausted(&counters) {
            return EngineDecision::degraded(&reason, None, 0.0, String::new());
        }

        let Some(llm) = &self.llm else {
            return EngineDecision::degraded("engine disabled (no api key)", None, 0.0, String::new());
        };

        let prompt = context.render_prompt();
        let timeout = Duration::from_secs(self.config.llm_timeout_secs);
        let mut cost_usd = 0.0;
        let mut raw_content = String::new();
        let mut parsed = None;

        for attempt in 0..2 {
            let user = if attempt == 0 {
                prompt.clone()
            } else {
                format!("{prompt}{REPAIR_INSTRUCTION}")
            };
            let call = llm
                .chat_completion(
                    &self.config.model,
                    SYSTEM_PROMPT,
                    &user,
                    self.config.max_tokens,
                    self.config.temperature,
                    timeout,
                )
                .await;

            let call = match call {
                Ok(call) => call,
                Err(e) => {
                    warn!("engine unavailable: {e:#}");
                    self.save_budget(&mut counters, 0, cost_usd);
                    return EngineDecision::degraded(
                        "engine unavailable",
                        None,
                        cost_usd,
                        raw_content,
                    );
                }
            };

            let tokens = call.usage.billed_tokens();
            cost_usd += self.call_cost(tokens);
            counters.calls += 1;
            counters.tokens += tokens;
            raw_content = call.content.clone();

            match parse_decision_output(&call.content) {
                Ok(output) => {
                    parsed = Some(output);
                    break;
                }
                Err(e) => {
                    warn!(attempt, "engine output invalid: {e:#}");
                }
            }
        }

        self.save_budget(&mut counters, 0, cost_usd);

        let Some(output) = parsed else {
            return EngineDecision::degraded("invalid engine output", None, cost_usd, raw_content);
        };

        let mismatches =
            grounding_mismatches(&output.reasoning, facts, self.config.grounding_tolerance);
        if !mismatches.is_empty() {
            warn!(?mismatches, "numeric grounding failed");
            return EngineDecision::degraded(
                &format!("numeric grounding failed: {}", mismatches.join("; ")),
                Some(&output.reasoning),
                cost_usd,
                raw_content,
            );
        }

        if output.confidence < self.config.min_confidence
            && output.action != DecisionAction::MonitorOnly
        {
            info!(
                confidence = output.confidence,
                floor = self.config.min_confidence,
                "minimal footprint: confidence below floor"
            );
            return EngineDecision::degraded(
                &format!(
                    "confidence {:.2} below floor {:.2}",
                    output.confidence, self.config.min_confidence
                ),
                Some(&output.reasoning),
                cost_usd,
                raw_content,
            );
        }

        EngineDecision {
            output,
            raw_content,
            cost_usd,
            degraded: None,
        }
    }

    fn save_budget(&self, counters: &mut CostCounters, extra_tokens: u64, cost_usd: f64) {
        counters.tokens += extra_tokens;
        counters.cost_usd += cost_usd;
        if let Err(e) = self.db.save_engine_budget(counters) {
            warn!("budget save failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::AccountContext;
    use crate::models::{Anomaly, AnomalyKind};

    fn engine() -> ReasoningEngine {
        // no LLM client wired: decide() exercises the guard paths
        ReasoningEngine::new(None, Db::open_in_memory().unwrap(), EngineConfig::default())
    }

    fn context_with_anomalies(anomalies: Vec<Anomaly>) -> ReasoningContextV1 {
        ReasoningContextV1 {
            version: CONTEXT_VERSION,
            event_type: "SCHEDULED_CHECK".into(),
            session_id: "s".into(),
            autonomy_level: 2,
            positions: Vec::new(),
            account: AccountContext {
                net_liquidation: 100_000.0,
                available_funds: 80_000.0,
                excess_liquidity: 75_000.0,
                margin_utilisation: 0.2,
            },
            market: crate::engine::context::MarketContext {
                vix: Some(14.2),
                vix_term_sign: Some(1),
                regime: "calm".into(),
                session: "regular".into(),
                time_of_day_et: "10:00".into(),
                minutes_since_last_quote: Vec::new(),
            },
            candidates: Vec::new(),
            recent_decisions: Vec::new(),
            similar_past_decisions: Vec::new(),
            active_patterns: Vec::new(),
            open_experiments: Vec::new(),
            strategy: serde_json::json!({}),
            anomalies,
        }
    }

    #[tokio::test]
    async fn hard_block_bypasses_llm() {
        let engine = engine();
        let context = context_with_anomalies(vec![Anomaly::new(
            AnomalyKind::StaleMarketData,
            "no quotes for 3 minutes",
        )]);
        let decision = engine.decide(&context, &GroundingFacts::default()).await;
        assert_eq!(decision.output.action, DecisionAction::MonitorOnly);
        assert!(decision.output.reasoning.contains("pre-LLM block"));
        assert_eq!(decision.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn soft_anomaly_reaches_next_guard() {
        let engine = engine();
        // reasoning_unavailable is not a hard block; with no client the
        // next stop is "engine disabled"
        let context = context_with_anomalies(vec![Anomaly::new(
            AnomalyKind::ReasoningUnavailable,
            "previous call failed",
        )]);
        let decision = engine.decide(&context, &GroundingFacts::default()).await;
        assert!(decision.output.reasoning.contains("engine disabled"));
    }

    #[tokio::test]
    async fn budget_cap_short_circuits() {
        let db = Db::open_in_memory().unwrap();
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        db.save_engine_budget(&CostCounters {
            day_start,
            calls: 10,
            tokens: 1000,
            cost_usd: 99.0,
        })
        .unwrap();
        let engine = ReasoningEngine::new(None, db, EngineConfig::default());
        let decision = engine
            .decide(&context_with_anomalies(Vec::new()), &GroundingFacts::default())
            .await;
        assert!(decision.output.reasoning.contains("cost cap"));
    }
}
