//! Working memory: the daemon's persistent state across restarts, plus
//! similar-decision retrieval over the embedding store. One logical row
//! per session; every mutation is written through atomically.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{AutonomyConfig, StrategyDefaults};
use crate::models::{Anomaly, AnomalyKind};
use crate::store::{Db, DecisionRecord, WorkingMemoryRow};

pub mod embed;

pub use embed::{cosine_similarity, Embedder, HashEmbedder, OpenRouterEmbedder};

/// Live strategy parameters. Experiments mutate these only through
/// `set_parameter` at adoption time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub target_delta: f64,
    pub delta_tolerance: f64,
    pub target_dte: i64,
    pub profit_target_pct: f64,
    pub stop_multiple: f64,
    pub max_rolls: i64,
    pub strategy_tag: String,
    pub universe: Vec<String>,
}

impl StrategyParams {
    pub fn from_defaults(defaults: &StrategyDefaults) -> Self {
        Self {
            target_delta: defaults.target_delta,
            delta_tolerance: defaults.delta_tolerance,
            target_dte: defaults.target_dte,
            profit_target_pct: defaults.profit_target_pct,
            stop_multiple: defaults.stop_multiple,
            max_rolls: defaults.max_rolls,
            strategy_tag: defaults.strategy_tag.clone(),
            universe: defaults.universe.clone(),
        }
    }

    pub fn get_parameter(&self, name: &str) -> Option<f64> {
        match name {
            "target_delta" => Some(self.target_delta),
            "delta_tolerance" => Some(self.delta_tolerance),
            "target_dte" => Some(self.target_dte as f64),
            "profit_target_pct" => Some(self.profit_target_pct),
            "stop_multiple" => Some(self.stop_multiple),
            _ => None,
        }
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> bool {
        match name {
            "target_delta" => self.target_delta = value,
            "delta_tolerance" => self.delta_tolerance = value,
            "target_dte" => self.target_dte = value.round() as i64,
            "profit_target_pct" => self.profit_target_pct = value,
            "stop_multiple" => self.stop_multiple = value,
            _ => return false,
        }
        true
    }
}

/// Rolling performance window feeding the autonomy ladder and the
/// reasoning context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceState {
    pub closed: i64,
    pub wins: i64,
    pub realized_pnl: f64,
    /// Per-trade ROI observations, most recent last, bounded.
    pub recent_returns: Vec<f64>,
    pub loss_streak: i64,
    pub fill_failure_streak: i64,
    pub sector_loss_streaks: HashMap<String, i64>,
}

const RETURNS_WINDOW: usize = 60;

impl PerformanceState {
    pub fn win_rate(&self) -> f64 {
        if self.closed == 0 {
            return 0.0;
        }
        self.wins as f64 / self.closed as f64
    }

    /// Annualisation-free Sharpe over the rolling per-trade returns.
    pub fn sharpe(&self) -> f64 {
        let n = self.recent_returns.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.recent_returns.iter().sum::<f64>() / n as f64;
        let var = self
            .recent_returns
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>()
            / (n as f64 - 1.0);
        if var <= 0.0 {
            return 0.0;
        }
        mean / var.sqrt()
    }

    pub fn record_trade(&mut self, roi: f64, won: bool, sector: &str) {
        self.closed += 1;
        if won {
            self.wins += 1;
            self.loss_streak = 0;
            self.sector_loss_streaks.remove(sector);
        } else {
            self.loss_streak += 1;
            *self
                .sector_loss_streaks
                .entry(sector.to_string())
                .or_insert(0) += 1;
        }
        self.recent_returns.push(roi);
        if self.recent_returns.len() > RETURNS_WINDOW {
            self.recent_returns.remove(0);
        }
    }
}

/// Autonomy bookkeeping persisted alongside the level itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutonomyMetrics {
    pub clean_days: i64,
    pub last_override_at: Option<i64>,
    pub last_promotion_at: Option<i64>,
}

/// Summary of a running experiment kept hot in memory so the executor
/// can tag trades without a repo round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenExperiment {
    pub id: i64,
    pub parameter: String,
    pub control_value: f64,
    pub test_value: f64,
    pub allocation: f64,
    pub control_count: i64,
    pub test_count: i64,
}

#[derive(Debug, Clone)]
pub struct WorkingMemoryState {
    pub session_id: String,
    pub strategy: StrategyParams,
    pub experiments: Vec<OpenExperiment>,
    pub performance: PerformanceState,
    pub anomalies: Vec<Anomaly>,
    pub autonomy_level: u8,
    pub autonomy: AutonomyMetrics,
}

/// A retrieved past decision with its recorded outcome.
#[derive(Debug, Clone)]
pub struct SimilarDecision {
    pub decision_id: String,
    pub summary: String,
    pub outcome_json: String,
    pub similarity: f32,
}

pub struct WorkingMemory {
    db: Db,
    embedder: Arc<dyn Embedder>,
    state: Mutex<WorkingMemoryState>,
}

impl WorkingMemory {
    /// Load the session row, or initialize from the prior session's
    /// final state and configuration defaults.
    pub fn load_session(
        db: Db,
        embedder: Arc<dyn Embedder>,
        session_id: &str,
        defaults: &StrategyDefaults,
        autonomy: &AutonomyConfig,
    ) -> Result<Self> {
        let state = match db.load_working_memory(session_id)? {
            Some(row) => Self::state_from_row(&row),
            None => match db.latest_working_memory()? {
                Some(prior) => {
                    debug!(prior = %prior.session_id, "new session inherits prior state");
                    let mut state = Self::state_from_row(&prior);
                    state.session_id = session_id.to_string();
                    // anomalies do not carry across sessions
                    state.anomalies.clear();
                    state
                }
                None => WorkingMemoryState {
                    session_id: session_id.to_string(),
                    strategy: StrategyParams::from_defaults(defaults),
                    experiments: Vec::new(),
                    performance: PerformanceState::default(),
                    anomalies: Vec::new(),
                    autonomy_level: autonomy.initial_level.clamp(1, 3),
                    autonomy: AutonomyMetrics::default(),
                },
            },
        };

        let memory = Self {
            db,
            embedder,
            state: Mutex::new(state),
        };
        memory.persist()?;
        Ok(memory)
    }

    fn state_from_row(row: &WorkingMemoryRow) -> WorkingMemoryState {
        WorkingMemoryState {
            session_id: row.session_id.clone(),
            strategy: serde_json::from_str(&row.strategy_json).unwrap_or_else(|_| {
                StrategyParams::from_defaults(&StrategyDefaults::default())
            }),
            experiments: serde_json::from_str(&row.experiments_json).unwrap_or_default(),
            performance: serde_json::from_str(&row.performance_json).unwrap_or_default(),
            anomalies: serde_json::from_str(&row.anomalies_json).unwrap_or_default(),
            autonomy_level: row.autonomy_level.clamp(1, 4) as u8,
            autonomy: serde_json::from_str(&row.autonomy_json).unwrap_or_default(),
        }
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.lock();
        let row = WorkingMemoryRow {
            session_id: state.session_id.clone(),
            strategy_json: serde_json::to_string(&state.strategy)?,
            experiments_json: serde_json::to_string(&state.experiments)?,
            performance_json: serde_json::to_string(&state.performance)?,
            anomalies_json: serde_json::to_string(&state.anomalies)?,
            autonomy_level: state.autonomy_level as i64,
            autonomy_json: serde_json::to_string(&state.autonomy)?,
            updated_at: 0, // set by the repo
        };
        drop(state);
        self.db.upsert_working_memory(&row)
    }

    pub fn snapshot(&self) -> WorkingMemoryState {
        self.state.lock().clone()
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    pub fn update_strategy<F: FnOnce(&mut StrategyParams)>(&self, mutate: F) -> Result<()> {
        mutate(&mut self.state.lock().strategy);
        self.persist()
    }

    pub fn set_experiments(&self, experiments: Vec<OpenExperiment>) -> Result<()> {
        self.state.lock().experiments = experiments;
        self.persist()
    }

    pub fn update_autonomy<F: FnOnce(&mut u8, &mut AutonomyMetrics)>(&self, mutate: F) -> Result<()> {
        {
            let mut state = self.state.lock();
            let mut level = state.autonomy_level;
            let mut metrics = state.autonomy.clone();
            mutate(&mut level, &mut metrics);
            state.autonomy_level = level.clamp(1, 4);
            state.autonomy = metrics;
        }
        self.persist()
    }

    pub fn raise_anomaly(&self, anomaly: Anomaly) -> Result<()> {
        {
            let mut state = self.state.lock();
            // one live entry per kind; re-raising refreshes it
            state.anomalies.retain(|a| a.kind != anomaly.kind);
            state.anomalies.push(anomaly);
        }
        self.persist()
    }

    pub fn clear_anomaly(&self, kind: AnomalyKind) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.anomalies.retain(|a| a.kind != kind);
        }
        self.persist()
    }

    pub fn active_anomalies(&self) -> Vec<Anomaly> {
        self.state.lock().anomalies.clone()
    }

    /// Record a decision and (best effort) its embedding. An embedding
    /// failure stores the decision without a vector and moves on.
    pub async fn record_decision(&self, record: &DecisionRecord, summary: &str) -> Result<()> {
        self.db.insert_decision(record).context("record decision")?;
        match self.embedder.embed(summary).await {
            Ok(vector) => {
                self.db
                    .insert_decision_embedding(&record.id, summary, &vector)?;
            }
            Err(e) => {
                warn!(decision = %record.id, "embedding failed, stored without vector: {e:#}");
            }
        }
        Ok(())
    }

    pub fn record_outcome(&self, roi: f64, won: bool, sector: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.performance.record_trade(roi, won, sector);
        }
        self.persist()
    }

    pub fn note_fill_failure(&self) -> Result<i64> {
        let streak = {
            let mut state = self.state.lock();
            state.performance.fill_failure_streak += 1;
            state.performance.fill_failure_streak
        };
        self.persist()?;
        Ok(streak)
    }

    pub fn reset_fill_failures(&self) -> Result<()> {
        self.state.lock().performance.fill_failure_streak = 0;
        self.persist()
    }

    /// k-nearest past decisions by cosine similarity, excluding the last
    /// hour to avoid the engine feeding on its own fresh output.
    pub async fn retrieve_similar(&self, query: &str, k: usize) -> Result<Vec<SimilarDecision>> {
        let vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed, retrieval skipped: {e:#}");
                return Ok(Vec::new());
            }
        };

        let cutoff = Utc::now().timestamp() - 3600;
        let candidates = self.db.embeddings_before(cutoff, 500)?;
        let mut scored: Vec<SimilarDecision> = candidates
            .into_iter()
            .filter(|(_, _, v, _)| !v.is_empty())
            .map(|(decision_id, summary, v, outcome_json)| SimilarDecision {
                decision_id,
                summary,
                outcome_json,
                similarity: cosine_similarity(&vector, &v),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_unix;

    fn memory(session: &str) -> (Db, WorkingMemory) {
        let db = Db::open_in_memory().unwrap();
        let wm = WorkingMemory::load_session(
            db.clone(),
            Arc::new(HashEmbedder),
            session,
            &StrategyDefaults::default(),
            &AutonomyConfig::default(),
        )
        .unwrap();
        (db, wm)
    }

    #[test]
    fn fresh_session_uses_defaults() {
        let (_db, wm) = memory("s1");
        let state = wm.snapshot();
        assert_eq!(state.autonomy_level, 1);
        assert_eq!(state.strategy.target_delta, 0.065);
    }

    #[test]
    fn new_session_inherits_prior_state() {
        let (db, wm) = memory("s1");
        wm.update_strategy(|s| s.target_delta = 0.08).unwrap();
        wm.update_autonomy(|level, _| *level = 3).unwrap();
        wm.raise_anomaly(Anomaly::new(AnomalyKind::VixSpike, "vix +35%"))
            .unwrap();

        let wm2 = WorkingMemory::load_session(
            db,
            Arc::new(HashEmbedder),
            "s2",
            &StrategyDefaults::default(),
            &AutonomyConfig::default(),
        )
        .unwrap();
        let state = wm2.snapshot();
        assert_eq!(state.strategy.target_delta, 0.08);
        assert_eq!(state.autonomy_level, 3);
        // anomalies are session-scoped
        assert!(state.anomalies.is_empty());
    }

    #[test]
    fn outcome_updates_streaks() {
        let (_db, wm) = memory("s1");
        wm.record_outcome(-0.02, false, "tech").unwrap();
        wm.record_outcome(-0.01, false, "tech").unwrap();
        let state = wm.snapshot();
        assert_eq!(state.performance.loss_streak, 2);
        assert_eq!(state.performance.sector_loss_streaks["tech"], 2);

        wm.record_outcome(0.015, true, "tech").unwrap();
        let state = wm.snapshot();
        assert_eq!(state.performance.loss_streak, 0);
        assert!(!state.performance.sector_loss_streaks.contains_key("tech"));
    }

    #[tokio::test]
    async fn retrieval_excludes_recent_and_ranks() {
        let (db, wm) = memory("s1");

        for (id, summary, age_secs) in [
            ("d1", "sold XSP 560 put delta 0.068 vix 14", 7200_i64),
            ("d2", "halted entries on vix spike anomaly", 7200),
            ("d3", "sold XSP 555 put delta 0.060 vix 15", 60),
        ] {
            let record = DecisionRecord {
                id: id.into(),
                session_id: "s1".into(),
                event_id: None,
                context_json: "{}".into(),
                output_json: "{}".into(),
                action: "EXECUTE_TRADES".into(),
                result_json: r#"{"status":"executed"}"#.into(),
                autonomy_level: 2,
                cost_usd: 0.0,
                created_at: now_unix() - age_secs,
            };
            wm.record_decision(&record, summary).await.unwrap();
        }
        let _ = db;

        let similar = wm
            .retrieve_similar("sell XSP put near delta 0.065", 2)
            .await
            .unwrap();
        // d3 is too recent to appear
        assert!(similar.iter().all(|s| s.decision_id != "d3"));
        assert_eq!(similar.first().unwrap().decision_id, "d1");
    }
}
