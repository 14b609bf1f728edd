//! Experiment and pattern repositories for the learning loop.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Adopted,
    Rejected,
    Inconclusive,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Running => "running",
            ExperimentStatus::Adopted => "adopted",
            ExperimentStatus::Rejected => "rejected",
            ExperimentStatus::Inconclusive => "inconclusive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "adopted" => Some(Self::Adopted),
            "rejected" => Some(Self::Rejected),
            "inconclusive" => Some(Self::Inconclusive),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExperimentStatus::Running)
    }
}

/// Running tallies per experiment arm; enough to reconstruct mean and
/// variance for the significance test without rescanning trades.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmStats {
    pub samples: i64,
    pub wins: i64,
    pub roi_sum: f64,
    pub roi_sq_sum: f64,
}

impl ArmStats {
    pub fn observe(&mut self, won: bool, roi: f64) {
        self.samples += 1;
        if won {
            self.wins += 1;
        }
        self.roi_sum += roi;
        self.roi_sq_sum += roi * roi;
    }

    pub fn mean_roi(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.roi_sum / self.samples as f64
    }

    /// Unbiased sample variance.
    pub fn variance(&self) -> f64 {
        if self.samples < 2 {
            return 0.0;
        }
        let n = self.samples as f64;
        ((self.roi_sq_sum - self.roi_sum * self.roi_sum / n) / (n - 1.0)).max(0.0)
    }

    pub fn win_rate(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.wins as f64 / self.samples as f64
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentRow {
    pub id: i64,
    pub name: String,
    pub parameter: String,
    pub control_value: f64,
    pub test_value: f64,
    pub allocation: f64,
    pub min_samples: i64,
    pub control: ArmStats,
    pub test: ArmStats,
    pub status: ExperimentStatus,
    pub decision_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<NaiveDate>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn experiment_from_row(row: &Row) -> rusqlite::Result<ExperimentRow> {
    let control_json: String = row.get("control_json")?;
    let test_json: String = row.get("test_json")?;
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let deadline: Option<String> = row.get("deadline")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    Ok(ExperimentRow {
        id: row.get("id")?,
        name: row.get("name")?,
        parameter: row.get("parameter")?,
        control_value: row.get("control_value")?,
        test_value: row.get("test_value")?,
        allocation: row.get("allocation")?,
        min_samples: row.get("min_samples")?,
        control: serde_json::from_str(&control_json).unwrap_or_default(),
        test: serde_json::from_str(&test_json).unwrap_or_default(),
        status: ExperimentStatus::parse(&status).unwrap_or(ExperimentStatus::Running),
        decision_reason: row.get("decision_reason")?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
        deadline: deadline
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        finished_at: finished_at.as_deref().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }),
    })
}

const EXPERIMENT_COLS: &str = "id, name, parameter, control_value, test_value, allocation, \
     min_samples, control_json, test_json, status, decision_reason, started_at, deadline, \
     finished_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Active,
    Archived,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Active => "active",
            PatternStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRow {
    pub id: i64,
    pub category: String,
    pub name: String,
    pub sample_size: i64,
    pub win_rate: f64,
    pub avg_roi: f64,
    pub confidence: f64,
    pub p_value: f64,
    pub effect_size: f64,
    pub status: PatternStatus,
    pub detected_at: DateTime<Utc>,
}

fn pattern_from_row(row: &Row) -> rusqlite::Result<PatternRow> {
    let status: String = row.get("status")?;
    let detected_at: String = row.get("detected_at")?;
    Ok(PatternRow {
        id: row.get("id")?,
        category: row.get("category")?,
        name: row.get("name")?,
        sample_size: row.get("sample_size")?,
        win_rate: row.get("win_rate")?,
        avg_roi: row.get("avg_roi")?,
        confidence: row.get("confidence")?,
        p_value: row.get("p_value")?,
        effect_size: row.get("effect_size")?,
        status: PatternStatus::parse(&status).unwrap_or(PatternStatus::Active),
        detected_at: DateTime::parse_from_rfc3339(&detected_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

impl Db {
    pub fn insert_experiment(&self, exp: &ExperimentRow) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO experiments (name, parameter, control_value, test_value, allocation, \
             min_samples, control_json, test_json, status, decision_reason, started_at, deadline) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                exp.name,
                exp.parameter,
                exp.control_value,
                exp.test_value,
                exp.allocation,
                exp.min_samples,
                serde_json::to_string(&exp.control)?,
                serde_json::to_string(&exp.test)?,
                exp.status.as_str(),
                exp.decision_reason,
                exp.started_at.to_rfc3339(),
                exp.deadline.map(|d| d.format("%Y-%m-%d").to_string()),
            ],
        )
        .context("insert experiment")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_experiment(&self, id: i64) -> Result<Option<ExperimentRow>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {EXPERIMENT_COLS} FROM experiments WHERE id = ?1"),
            params![id],
            experiment_from_row,
        )
        .optional()
        .context("get experiment")
    }

    pub fn running_experiments(&self) -> Result<Vec<ExperimentRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLS} FROM experiments WHERE status = 'running' ORDER BY id"
        ))?;
        let rows = stmt.query_map([], experiment_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("running experiments")
    }

    /// Fold one trade outcome into an arm's running stats.
    pub fn record_experiment_result(
        &self,
        experiment_id: i64,
        arm: &str,
        won: bool,
        roi: f64,
    ) -> Result<()> {
        let column = match arm {
            "control" => "control_json",
            "test" => "test_json",
            other => anyhow::bail!("unknown experiment arm: {other}"),
        };

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let raw: String = tx.query_row(
            &format!("SELECT {column} FROM experiments WHERE id = ?1"),
            params![experiment_id],
            |row| row.get(0),
        )?;
        let mut stats: ArmStats = serde_json::from_str(&raw).unwrap_or_default();
        stats.observe(won, roi);
        tx.execute(
            &format!("UPDATE experiments SET {column} = ?2 WHERE id = ?1"),
            params![experiment_id, serde_json::to_string(&stats)?],
        )?;
        tx.commit().context("record experiment result")
    }

    pub fn finish_experiment(
        &self,
        experiment_id: i64,
        status: ExperimentStatus,
        reason: &str,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE experiments SET status = ?2, decision_reason = ?3, finished_at = ?4 \
             WHERE id = ?1",
            params![
                experiment_id,
                status.as_str(),
                reason,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn upsert_pattern(&self, pattern: &PatternRow) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO patterns (category, name, sample_size, win_rate, avg_roi, confidence, \
             p_value, effect_size, status, detected_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(category, name) DO UPDATE SET \
             sample_size = excluded.sample_size, win_rate = excluded.win_rate, \
             avg_roi = excluded.avg_roi, confidence = excluded.confidence, \
             p_value = excluded.p_value, effect_size = excluded.effect_size, \
             status = excluded.status, detected_at = excluded.detected_at",
            params![
                pattern.category,
                pattern.name,
                pattern.sample_size,
                pattern.win_rate,
                pattern.avg_roi,
                pattern.confidence,
                pattern.p_value,
                pattern.effect_size,
                pattern.status.as_str(),
                pattern.detected_at.to_rfc3339(),
            ],
        )
        .context("upsert pattern")?;
        Ok(())
    }

    pub fn active_patterns(&self) -> Result<Vec<PatternRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, category, name, sample_size, win_rate, avg_roi, confidence, p_value, \
             effect_size, status, detected_at FROM patterns WHERE status = 'active' \
             ORDER BY p_value",
        )?;
        let rows = stmt.query_map([], pattern_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("active patterns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_experiment() -> ExperimentRow {
        ExperimentRow {
            id: 0,
            name: "delta_target_0.08".into(),
            parameter: "target_delta".into(),
            control_value: 0.065,
            test_value: 0.08,
            allocation: 0.2,
            min_samples: 40,
            control: ArmStats::default(),
            test: ArmStats::default(),
            status: ExperimentStatus::Running,
            decision_reason: None,
            started_at: Utc::now(),
            deadline: NaiveDate::from_ymd_opt(2025, 9, 1),
            finished_at: None,
        }
    }

    #[test]
    fn arm_stats_accumulate() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_experiment(&sample_experiment()).unwrap();

        db.record_experiment_result(id, "control", true, 0.012).unwrap();
        db.record_experiment_result(id, "control", false, -0.020)
            .unwrap();
        db.record_experiment_result(id, "test", true, 0.015).unwrap();

        let exp = db.get_experiment(id).unwrap().unwrap();
        assert_eq!(exp.control.samples, 2);
        assert_eq!(exp.control.wins, 1);
        assert_eq!(exp.test.samples, 1);
        assert!((exp.control.mean_roi() - (-0.004)).abs() < 1e-9);
    }

    #[test]
    fn terminal_states_leave_running_set() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_experiment(&sample_experiment()).unwrap();
        assert_eq!(db.running_experiments().unwrap().len(), 1);

        db.finish_experiment(id, ExperimentStatus::Adopted, "test arm roi lift p=0.03")
            .unwrap();
        assert!(db.running_experiments().unwrap().is_empty());
        let exp = db.get_experiment(id).unwrap().unwrap();
        assert!(exp.status.is_terminal());
        assert!(exp.finished_at.is_some());
    }

    #[test]
    fn variance_from_running_sums() {
        let mut stats = ArmStats::default();
        for roi in [0.01, 0.02, 0.03] {
            stats.observe(roi > 0.0, roi);
        }
        assert!((stats.mean_roi() - 0.02).abs() < 1e-12);
        assert!((stats.variance() - 0.0001).abs() < 1e-9);
    }

    #[test]
    fn pattern_upsert_replaces() {
        let db = Db::open_in_memory().unwrap();
        let mut pattern = PatternRow {
            id: 0,
            category: "vix_regime".into(),
            name: "vix_under_15".into(),
            sample_size: 34,
            win_rate: 0.82,
            avg_roi: 0.011,
            confidence: 0.95,
            p_value: 0.03,
            effect_size: 0.008,
            status: PatternStatus::Active,
            detected_at: Utc::now(),
        };
        db.upsert_pattern(&pattern).unwrap();
        pattern.sample_size = 40;
        db.upsert_pattern(&pattern).unwrap();

        let active = db.active_patterns().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sample_size, 40);
    }
}
