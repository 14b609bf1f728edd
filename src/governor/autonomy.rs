//! Autonomy governor: maps a proposed decision to an execution
//! authorization. Levels gate what the daemon may do unattended;
//! mandatory-review triggers force the approval queue regardless of
//! level. L4 exists but is never reached automatically.

use serde::{Deserialize, Serialize};

use crate::config::AutonomyConfig;
use crate::engine::DecisionAction;

/// Conditions that force human review independent of level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewTrigger {
    FirstTradeOnSymbol,
    OversizedPosition,
    SectorLossStreak,
    VixSpike,
    StaleData,
    MarginAfterTrade,
    LowConfidence,
    FillFailureStreak,
}

impl ReviewTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewTrigger::FirstTradeOnSymbol => "first_trade_on_symbol",
            ReviewTrigger::OversizedPosition => "oversized_position",
            ReviewTrigger::SectorLossStreak => "sector_loss_streak",
            ReviewTrigger::VixSpike => "vix_spike",
            ReviewTrigger::StaleData => "stale_data",
            ReviewTrigger::MarginAfterTrade => "margin_after_trade",
            ReviewTrigger::LowConfidence => "low_confidence",
            ReviewTrigger::FillFailureStreak => "fill_failure_streak",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    QueueForApproval(String),
    Block(String),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allow)
    }
}

/// Facts the gate inspects for one decision.
#[derive(Debug, Clone, Default)]
pub struct GateInputs {
    pub action_confidence: f64,
    pub total_contracts: i64,
    pub rolling_avg_contracts: f64,
    pub new_symbol: bool,
    pub max_sector_loss_streak: i64,
    /// Intraday VIX change as a fraction (0.3 = +30%).
    pub vix_change_pct: Option<f64>,
    pub stale_minutes: i64,
    pub margin_utilisation_after: Option<f64>,
    pub fill_failure_streak: i64,
}

pub struct AutonomyGovernor {
    config: AutonomyConfig,
}

impl AutonomyGovernor {
    pub fn new(config: AutonomyConfig) -> Self {
        Self { config }
    }

    fn mandatory_triggers(&self, inputs: &GateInputs) -> Vec<ReviewTrigger> {
        let mut fired = Vec::new();
        if inputs.new_symbol {
            fired.push(ReviewTrigger::FirstTradeOnSymbol);
        }
        if inputs.rolling_avg_contracts > 0.0
            && inputs.total_contracts as f64
                >= self.config.review_size_multiple * inputs.rolling_avg_contracts
        {
            fired.push(ReviewTrigger::OversizedPosition);
        }
        if inputs.max_sector_loss_streak >= self.config.review_sector_loss_streak {
            fired.push(ReviewTrigger::SectorLossStreak);
        }
        if inputs
            .vix_change_pct
            .map(|c| c >= self.config.review_vix_spike_pct)
            .unwrap_or(false)
        {
            fired.push(ReviewTrigger::VixSpike);
        }
        if inputs.stale_minutes > self.config.review_stale_minutes {
            fired.push(ReviewTrigger::StaleData);
        }
        if inputs
            .margin_utilisation_after
            .map(|m| m > self.config.review_margin_utilisation)
            .unwrap_or(false)
        {
            fired.push(ReviewTrigger::MarginAfterTrade);
        }
        if inputs.action_confidence < self.config.review_min_confidence {
            fired.push(ReviewTrigger::LowConfidence);
        }
        if inputs.fill_failure_streak >= self.config.review_fill_failure_streak {
            fired.push(ReviewTrigger::FillFailureStreak);
        }
        fired
    }

    /// `(decision, context) -> allow | queue | block`.
    pub fn authorize(
        &self,
        level: u8,
        action: DecisionAction,
        inputs: &GateInputs,
    ) -> Authorization {
        // observational actions never need authorization
        if matches!(
            action,
            DecisionAction::MonitorOnly | DecisionAction::SkipSession
        ) {
            return Authorization::Allow;
        }
        // the halt path must never be stuck behind a queue
        if action == DecisionAction::EmergencyHalt {
            return Authorization::Allow;
        }
        if action == DecisionAction::RequestHumanReview {
            return Authorization::QueueForApproval("engine requested review".to_string());
        }

        let triggers = self.mandatory_triggers(inputs);
        if !triggers.is_empty() {
            let names: Vec<&str> = triggers.iter().map(|t| t.as_str()).collect();
            return Authorization::QueueForApproval(format!(
                "mandatory review: {}",
                names.join(", ")
            ));
        }

        // experiments mutate parameters only via the learning loop; any
        // level may propose, adoption is gated there
        if action == DecisionAction::ProposeExperiment {
            return Authorization::Allow;
        }

        match level {
            1 => Authorization::QueueForApproval("L1 recommend-only".to_string()),
            2 => {
                if action.opens_positions() {
                    let cap = inputs.rolling_avg_contracts.max(1.0);
                    if inputs.total_contracts as f64 <= cap {
                        Authorization::Allow
                    } else {
                        Authorization::QueueForApproval(format!(
                            "L2 size cap: {} contracts > 1x avg {:.1}",
                            inputs.total_contracts, cap
                        ))
                    }
                } else {
                    Authorization::Allow
                }
            }
            3 => {
                if action.opens_positions() {
                    let cap = 2.0 * inputs.rolling_avg_contracts.max(1.0);
                    if inputs.total_contracts as f64 <= cap {
                        Authorization::Allow
                    } else {
                        Authorization::QueueForApproval(format!(
                            "L3 size cap: {} contracts > 2x avg {:.1}",
                            inputs.total_contracts,
                            inputs.rolling_avg_contracts.max(1.0)
                        ))
                    }
                } else {
                    Authorization::Allow
                }
            }
            4 => Authorization::Allow,
            other => Authorization::Block(format!("invalid autonomy level {other}")),
        }
    }

    /// Promotion needs N clean days plus the performance floor.
    pub fn promotion_due(&self, level: u8, clean_days: i64, win_rate: f64, sharpe: f64) -> bool {
        if level >= 3 {
            // L4 is never reached automatically
            return false;
        }
        clean_days >= self.config.promotion_clean_days
            && win_rate >= self.config.promotion_min_win_rate
            && sharpe >= self.config.promotion_min_sharpe
    }

    /// Demotion is immediate: overrides, loss streaks, fired anomalies.
    pub fn demotion_due(&self, manual_override: bool, loss_streak: i64, anomaly_fired: bool) -> bool {
        manual_override || anomaly_fired || loss_streak >= self.config.demotion_loss_streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> AutonomyGovernor {
        AutonomyGovernor::new(AutonomyConfig::default())
    }

    fn clean_inputs() -> GateInputs {
        GateInputs {
            action_confidence: 0.8,
            total_contracts: 1,
            rolling_avg_contracts: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn l1_queues_everything_executable() {
        let auth = governor().authorize(1, DecisionAction::ExecuteTrades, &clean_inputs());
        assert!(matches!(auth, Authorization::QueueForApproval(_)));
        let auth = governor().authorize(1, DecisionAction::ClosePosition, &clean_inputs());
        assert!(matches!(auth, Authorization::QueueForApproval(_)));
        assert!(governor()
            .authorize(1, DecisionAction::MonitorOnly, &clean_inputs())
            .is_allowed());
    }

    #[test]
    fn l2_allows_closing_and_small_entries() {
        let governor = governor();
        assert!(governor
            .authorize(2, DecisionAction::ClosePosition, &clean_inputs())
            .is_allowed());
        assert!(governor
            .authorize(2, DecisionAction::ExecuteTrades, &clean_inputs())
            .is_allowed());

        let mut big = clean_inputs();
        big.total_contracts = 2; // > 1x avg of 1
        assert!(matches!(
            governor.authorize(2, DecisionAction::ExecuteTrades, &big),
            Authorization::QueueForApproval(_)
        ));
    }

    #[test]
    fn l3_doubles_the_cap() {
        let mut inputs = clean_inputs();
        inputs.total_contracts = 2;
        assert!(governor()
            .authorize(3, DecisionAction::ExecuteTrades, &inputs)
            .is_allowed());
        inputs.total_contracts = 3;
        assert!(matches!(
            governor().authorize(3, DecisionAction::ExecuteTrades, &inputs),
            Authorization::QueueForApproval(_)
        ));
    }

    #[test]
    fn mandatory_triggers_override_level() {
        let mut inputs = clean_inputs();
        inputs.new_symbol = true;
        // even L4 queues on a mandatory trigger
        let auth = governor().authorize(4, DecisionAction::ExecuteTrades, &inputs);
        match auth {
            Authorization::QueueForApproval(reason) => {
                assert!(reason.contains("first_trade_on_symbol"))
            }
            other => panic!("expected queue, got {other:?}"),
        }
    }

    #[test]
    fn every_documented_trigger_fires() {
        let governor = governor();
        let cases: Vec<(GateInputs, ReviewTrigger)> = vec![
            (
                GateInputs {
                    new_symbol: true,
                    ..clean_inputs()
                },
                ReviewTrigger::FirstTradeOnSymbol,
            ),
            (
                GateInputs {
                    total_contracts: 3,
                    rolling_avg_contracts: 1.0,
                    ..clean_inputs()
                },
                ReviewTrigger::OversizedPosition,
            ),
            (
                GateInputs {
                    max_sector_loss_streak: 3,
                    ..clean_inputs()
                },
                ReviewTrigger::SectorLossStreak,
            ),
            (
                GateInputs {
                    vix_change_pct: Some(0.35),
                    ..clean_inputs()
                },
                ReviewTrigger::VixSpike,
            ),
            (
                GateInputs {
                    stale_minutes: 31,
                    ..clean_inputs()
                },
                ReviewTrigger::StaleData,
            ),
            (
                GateInputs {
                    margin_utilisation_after: Some(0.45),
                    ..clean_inputs()
                },
                ReviewTrigger::MarginAfterTrade,
            ),
            (
                GateInputs {
                    action_confidence: 0.35,
                    ..clean_inputs()
                },
                ReviewTrigger::LowConfidence,
            ),
            (
                GateInputs {
                    fill_failure_streak: 3,
                    ..clean_inputs()
                },
                ReviewTrigger::FillFailureStreak,
            ),
        ];
        for (inputs, expected) in cases {
            let fired = governor.mandatory_triggers(&inputs);
            assert!(
                fired.contains(&expected),
                "expected {expected:?} for {inputs:?}, fired {fired:?}"
            );
        }
    }

    #[test]
    fn emergency_halt_never_queued() {
        let mut inputs = clean_inputs();
        inputs.new_symbol = true;
        inputs.action_confidence = 0.0;
        assert!(governor()
            .authorize(1, DecisionAction::EmergencyHalt, &inputs)
            .is_allowed());
    }

    #[test]
    fn promotion_and_demotion_rules() {
        let governor = governor();
        assert!(governor.promotion_due(2, 10, 0.75, 1.2));
        assert!(!governor.promotion_due(2, 9, 0.75, 1.2));
        assert!(!governor.promotion_due(2, 10, 0.60, 1.2));
        // no automatic path to L4
        assert!(!governor.promotion_due(3, 100, 0.99, 5.0));

        assert!(governor.demotion_due(true, 0, false));
        assert!(governor.demotion_due(false, 3, false));
        assert!(governor.demotion_due(false, 0, true));
        assert!(!governor.demotion_due(false, 2, false));
    }
}
