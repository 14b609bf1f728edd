//! Learning loop: pattern detection over closed trades, A/B experiment
//! lifecycle, and end-of-day reflection. This is the only path allowed
//! to mutate strategy parameters, and it only does so when an
//! experiment terminates `adopted`.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::output::ExperimentProposal;
use crate::events::{EventBus, EventType};
use crate::memory::{OpenExperiment, WorkingMemory};
use crate::store::{Db, DecisionRecord, ExperimentStatus};

pub mod experiments;
pub mod patterns;
pub mod reflect;

pub use experiments::assign_arm;
pub use patterns::{detect_patterns, TradeFact};

pub struct LearningLoop {
    db: Db,
    memory: Arc<WorkingMemory>,
    bus: EventBus,
    min_samples: usize,
    experiment_deadline_days: i64,
}

impl LearningLoop {
    pub fn new(db: Db, memory: Arc<WorkingMemory>, bus: EventBus, min_samples: usize) -> Self {
        Self {
            db,
            memory,
            bus,
            min_samples,
            experiment_deadline_days: 90,
        }
    }

    /// Weekly pass: refresh patterns, then judge running experiments.
    pub fn run_weekly(&self) -> Result<serde_json::Value> {
        let patterns = self.run_pattern_detection()?;
        let verdicts = self.evaluate_experiments()?;
        Ok(json!({
            "patterns_detected": patterns,
            "experiment_verdicts": verdicts,
        }))
    }

    pub fn run_pattern_detection(&self) -> Result<usize> {
        let closed = self.db.closed_trades(500)?;
        if closed.len() < self.min_samples {
            info!(
                closed = closed.len(),
                needed = self.min_samples,
                "pattern detection skipped, not enough closed trades"
            );
            return Ok(0);
        }

        let mut facts = Vec::with_capacity(closed.len());
        for trade in &closed {
            facts.push(patterns::fact_for(&self.db, trade)?);
        }
        let detected = detect_patterns(&facts, self.min_samples);
        for pattern in &detected {
            info!(
                category = %pattern.category,
                name = %pattern.name,
                p = pattern.p_value,
                effect = pattern.effect_size,
                "pattern retained"
            );
            self.db.upsert_pattern(pattern)?;
        }
        Ok(detected.len())
    }

    /// Engine proposals come through here; one experiment per parameter
    /// at a time.
    pub fn start_experiment(&self, proposal: &ExperimentProposal) -> Result<serde_json::Value> {
        let strategy = self.memory.snapshot().strategy;
        let Some(control_value) = strategy.get_parameter(&proposal.parameter) else {
            return Ok(json!({
                "status": "rejected",
                "reason": format!("unknown parameter {}", proposal.parameter),
            }));
        };
        let running = self.db.running_experiments()?;
        if running.iter().any(|e| e.parameter == proposal.parameter) {
            return Ok(json!({
                "status": "rejected",
                "reason": format!("experiment already running on {}", proposal.parameter),
            }));
        }

        let row = experiments::from_proposal(proposal, control_value, self.experiment_deadline_days);
        let id = self.db.insert_experiment(&row)?;
        info!(
            id,
            parameter = %proposal.parameter,
            control = control_value,
            test = proposal.test_value,
            "experiment started"
        );
        self.sync_open_experiments()?;
        Ok(json!({"status": "started", "experiment_id": id}))
    }

    /// Judge every running experiment; adoption updates the strategy
    /// through working memory and leaves a parameter_adjusted record in
    /// the audit.
    pub fn evaluate_experiments(&self) -> Result<Vec<serde_json::Value>> {
        let today = Utc::now().date_naive();
        let mut verdicts = Vec::new();

        for exp in self.db.running_experiments()? {
            let Some((status, reason)) = experiments::evaluate(&exp, today) else {
                continue;
            };
            self.db.finish_experiment(exp.id, status, &reason)?;
            info!(
                experiment = exp.id,
                parameter = %exp.parameter,
                status = status.as_str(),
                %reason,
                "experiment terminated"
            );

            if status == ExperimentStatus::Adopted {
                let old = exp.control_value;
                let applied = {
                    let parameter = exp.parameter.clone();
                    let value = exp.test_value;
                    let mut ok = false;
                    self.memory.update_strategy(|s| {
                        ok = s.set_parameter(&parameter, value);
                    })?;
                    ok
                };
                if !applied {
                    warn!(parameter = %exp.parameter, "adopted parameter no longer exists");
                } else {
                    self.db.insert_decision(&DecisionRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        session_id: self.memory.session_id(),
                        event_id: None,
                        context_json: json!({
                            "event_type": "parameter_adjusted",
                            "experiment_id": exp.id,
                        })
                        .to_string(),
                        output_json: json!({
                            "parameter": exp.parameter,
                            "from": old,
                            "to": exp.test_value,
                            "reason": reason,
                        })
                        .to_string(),
                        action: "PARAMETER_ADJUSTED".to_string(),
                        result_json: json!({"status": "applied"}).to_string(),
                        autonomy_level: self.memory.snapshot().autonomy_level as i64,
                        cost_usd: 0.0,
                        created_at: Utc::now().timestamp(),
                    })?;
                }
            }

            self.bus.publish(
                EventType::ExperimentResultReady,
                json!({
                    "experiment_id": exp.id,
                    "status": status.as_str(),
                    "reason": reason,
                }),
            )?;
            verdicts.push(json!({
                "experiment_id": exp.id,
                "status": status.as_str(),
            }));
        }

        self.sync_open_experiments()?;
        Ok(verdicts)
    }

    /// Keep working memory's open-experiment summaries hot for the
    /// executor's arm tagging.
    pub fn sync_open_experiments(&self) -> Result<()> {
        let open: Vec<OpenExperiment> = self
            .db
            .running_experiments()?
            .into_iter()
            .map(|e| OpenExperiment {
                id: e.id,
                parameter: e.parameter,
                control_value: e.control_value,
                test_value: e.test_value,
                allocation: e.allocation,
                control_count: e.control.samples,
                test_count: e.test.samples,
            })
            .collect();
        self.memory.set_experiments(open)
    }

    /// End-of-day reflection, stored for retrieval.
    pub async fn reflect(&self) -> Result<String> {
        let reflection = reflect::reflect_on_day(&self.db, &self.memory.session_id())?;
        self.memory
            .record_decision(&reflection.record, &reflection.summary)
            .await?;
        info!("{}", reflection.summary);
        Ok(reflection.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutonomyConfig, StrategyDefaults};
    use crate::memory::HashEmbedder;

    fn learning() -> (Db, Arc<WorkingMemory>, LearningLoop) {
        let db = Db::open_in_memory().unwrap();
        let memory = Arc::new(
            WorkingMemory::load_session(
                db.clone(),
                Arc::new(HashEmbedder),
                "learn-test",
                &StrategyDefaults::default(),
                &AutonomyConfig::default(),
            )
            .unwrap(),
        );
        let bus = EventBus::new(db.clone(), 3);
        let learning = LearningLoop::new(db.clone(), memory.clone(), bus, 30);
        (db, memory, learning)
    }

    fn proposal() -> ExperimentProposal {
        ExperimentProposal {
            parameter: "target_delta".into(),
            control_value: 0.065,
            test_value: 0.08,
            allocation: 0.2,
            min_samples: 40,
            success_metric: "roi".into(),
        }
    }

    #[test]
    fn proposal_starts_one_experiment_per_parameter() {
        let (_db, memory, learning) = learning();
        let first = learning.start_experiment(&proposal()).unwrap();
        assert_eq!(first["status"], "started");
        assert_eq!(memory.snapshot().experiments.len(), 1);

        let second = learning.start_experiment(&proposal()).unwrap();
        assert_eq!(second["status"], "rejected");
    }

    #[test]
    fn unknown_parameter_rejected() {
        let (_db, _memory, learning) = learning();
        let mut bad = proposal();
        bad.parameter = "vibes".into();
        let result = learning.start_experiment(&bad).unwrap();
        assert_eq!(result["status"], "rejected");
    }

    #[test]
    fn adoption_updates_strategy_and_audit() {
        let (db, memory, learning) = learning();
        let started = learning.start_experiment(&proposal()).unwrap();
        let id = started["experiment_id"].as_i64().unwrap();

        // feed both arms to significance: test arm clearly better
        for i in 0..40 {
            let jitter = (i % 5) as f64 * 4e-4;
            db.record_experiment_result(id, "control", true, 0.002 + jitter)
                .unwrap();
            db.record_experiment_result(id, "test", true, 0.014 + jitter)
                .unwrap();
        }

        let verdicts = learning.evaluate_experiments().unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0]["status"], "adopted");

        // strategy_state.target_delta moved 0.065 -> 0.08
        assert_eq!(memory.snapshot().strategy.target_delta, 0.08);
        // decisions has the parameter_adjusted entry
        let audit = db.recent_decisions(10).unwrap();
        assert!(audit.iter().any(|d| d.action == "PARAMETER_ADJUSTED"));
        // working memory no longer lists the experiment as open
        assert!(memory.snapshot().experiments.is_empty());
        // termination event published
        let event = db.claim_next_event().unwrap().unwrap();
        assert_eq!(event.event_type, "EXPERIMENT_RESULT_READY");
    }
}
