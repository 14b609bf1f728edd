//! Engine output schema: the closed action set, JSON parsing with a
//! single repair attempt upstream, and the numeric-grounding guard that
//! checks the engine's stated quantities against the context it was
//! given.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    ExecuteTrades,
    StageCandidates,
    ClosePosition,
    RollPosition,
    MonitorOnly,
    SkipSession,
    ProposeExperiment,
    RequestHumanReview,
    EmergencyHalt,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::ExecuteTrades => "EXECUTE_TRADES",
            DecisionAction::StageCandidates => "STAGE_CANDIDATES",
            DecisionAction::ClosePosition => "CLOSE_POSITION",
            DecisionAction::RollPosition => "ROLL_POSITION",
            DecisionAction::MonitorOnly => "MONITOR_ONLY",
            DecisionAction::SkipSession => "SKIP_SESSION",
            DecisionAction::ProposeExperiment => "PROPOSE_EXPERIMENT",
            DecisionAction::RequestHumanReview => "REQUEST_HUMAN_REVIEW",
            DecisionAction::EmergencyHalt => "EMERGENCY_HALT",
        }
    }

    /// Actions that open new risk (vs observe/close/ask).
    pub fn opens_positions(&self) -> bool {
        matches!(
            self,
            DecisionAction::ExecuteTrades | DecisionAction::RollPosition
        )
    }

    pub fn is_closing_only(&self) -> bool {
        matches!(
            self,
            DecisionAction::ClosePosition
                | DecisionAction::MonitorOnly
                | DecisionAction::SkipSession
                | DecisionAction::RequestHumanReview
                | DecisionAction::EmergencyHalt
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentProposal {
    pub parameter: String,
    pub control_value: f64,
    pub test_value: f64,
    pub allocation: f64,
    pub min_samples: i64,
    pub success_metric: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub action: DecisionAction,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub position_ids: Vec<i64>,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
}

impl DecisionOutput {
    /// Canonical degraded output used by every guard path. The original
    /// reasoning (when any) is preserved for audit.
    pub fn monitor_only(reason: &str, original_reasoning: Option<&str>) -> Self {
        let reasoning = match original_reasoning {
            Some(orig) => format!("{reason} | original: {orig}"),
            None => reason.to_string(),
        };
        Self {
            action: DecisionAction::MonitorOnly,
            symbols: Vec::new(),
            position_ids: Vec::new(),
            confidence: 0.0,
            reasoning,
            risks: Vec::new(),
            experiment: None,
            urgency: None,
        }
    }
}

/// Strip optional markdown fences and parse against the schema.
/// Violations come back as errors so the engine can issue its single
/// repair call.
pub fn parse_decision_output(raw: &str) -> Result<DecisionOutput> {
    let trimmed = raw.trim();
    let body = if let Some(stripped) = trimmed.strip_prefix("```") {
        let inner = stripped.trim_start_matches("json").trim_start();
        inner.strip_suffix("```").unwrap_or(inner).trim()
    } else {
        trimmed
    };

    let output: DecisionOutput =
        serde_json::from_str(body).map_err(|e| anyhow!("schema parse: {e}"))?;

    if !(0.0..=1.0).contains(&output.confidence) || !output.confidence.is_finite() {
        return Err(anyhow!("confidence {} outside [0,1]", output.confidence));
    }
    if output.reasoning.trim().is_empty() {
        return Err(anyhow!("empty reasoning"));
    }
    if output.action == DecisionAction::ProposeExperiment && output.experiment.is_none() {
        return Err(anyhow!("PROPOSE_EXPERIMENT without experiment proposal"));
    }
    if output.action == DecisionAction::RequestHumanReview && output.urgency.is_none() {
        return Err(anyhow!("REQUEST_HUMAN_REVIEW without urgency"));
    }
    if let Some(exp) = &output.experiment {
        if !(0.0..=1.0).contains(&exp.allocation) || exp.min_samples <= 0 {
            return Err(anyhow!("experiment proposal out of range"));
        }
    }

    Ok(output)
}

/// Known quantities the grounding guard can verify against reasoning
/// text.
#[derive(Debug, Clone, Default)]
pub struct GroundingFacts {
    pub deltas: Vec<f64>,
    pub vix: Option<f64>,
    pub margin_utilisation: Option<f64>,
    pub bids: Vec<f64>,
}

fn parse_leading_number(token: &str) -> Option<f64> {
    let cleaned: String = token
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" || cleaned == "." {
        return None;
    }
    cleaned.parse().ok()
}

fn matches_any(claim: f64, known: &[f64], tolerance: f64) -> bool {
    known.iter().any(|k| {
        let scale = k.abs().max(0.5);
        (claim - k).abs() <= scale * tolerance + 1e-9
    })
}

/// Scan the reasoning text for `<keyword> <number>` claims and check
/// each against the context. Returns the list of mismatched claims;
/// any entry downgrades the action to MONITOR_ONLY upstream.
pub fn grounding_mismatches(
    reasoning: &str,
    facts: &GroundingFacts,
    tolerance: f64,
) -> Vec<String> {
    let tokens: Vec<&str> = reasoning
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')' || c == '=')
        .filter(|t| !t.is_empty())
        .collect();

    let mut mismatches = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let keyword = token.to_ascii_lowercase();
        let claim = tokens
            .iter()
            .skip(i + 1)
            .take(2)
            .find_map(|t| parse_leading_number(t));
        let Some(claim) = claim else { continue };

        match keyword.as_str() {
            "delta" => {
                // deltas are quoted unsigned in prose
                let known: Vec<f64> = facts.deltas.iter().map(|d| d.abs()).collect();
                if !known.is_empty() && !matches_any(claim.abs(), &known, tolerance) {
                    mismatches.push(format!("delta {claim} not in context"));
                }
            }
            "vix" => {
                if let Some(vix) = facts.vix {
                    if !matches_any(claim, &[vix], tolerance) {
                        mismatches.push(format!("vix {claim} vs context {vix}"));
                    }
                }
            }
            "margin" => {
                if let Some(util) = facts.margin_utilisation {
                    // accept either fraction or percent phrasing
                    let ok = matches_any(claim, &[util], tolerance)
                        || matches_any(claim, &[util * 100.0], tolerance);
                    if !ok {
                        mismatches.push(format!("margin {claim} vs context {util:.3}"));
                    }
                }
            }
            "bid" => {
                if !facts.bids.is_empty() && !matches_any(claim, &facts.bids, tolerance) {
                    mismatches.push(format!("bid {claim} not in context"));
                }
            }
            _ => {}
        }
    }
    mismatches
}
