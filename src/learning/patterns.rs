//! Pattern detection over closed trades: bucket the book along known
//! axes, compare each bucket against its complement with a two-sample
//! Welch test, and keep what is both significant and material.

use anyhow::Result;
use chrono::{Datelike, Utc};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::models::Trade;
use crate::store::{Db, PatternRow, PatternStatus};

pub const P_VALUE_THRESHOLD: f64 = 0.05;
pub const EFFECT_SIZE_FLOOR: f64 = 0.005;

/// One closed trade reduced to the axes the detector buckets on.
#[derive(Debug, Clone)]
pub struct TradeFact {
    pub won: bool,
    pub roi: f64,
    pub delta_bucket: &'static str,
    pub dte_bucket: &'static str,
    pub vix_regime: &'static str,
    pub sector: &'static str,
    pub day_of_week: &'static str,
}

pub fn delta_bucket(delta: f64) -> &'static str {
    let d = delta.abs();
    if d < 0.05 {
        "delta_lt_05"
    } else if d < 0.10 {
        "delta_05_10"
    } else if d < 0.20 {
        "delta_10_20"
    } else {
        "delta_ge_20"
    }
}

pub fn dte_bucket(dte: i64) -> &'static str {
    if dte <= 3 {
        "dte_0_3"
    } else if dte <= 7 {
        "dte_4_7"
    } else if dte <= 14 {
        "dte_8_14"
    } else {
        "dte_gt_14"
    }
}

pub fn vix_regime(vix: Option<f64>) -> &'static str {
    match vix {
        Some(v) if v < 15.0 => "vix_calm",
        Some(v) if v < 20.0 => "vix_normal",
        Some(v) if v < 30.0 => "vix_elevated",
        Some(_) => "vix_stressed",
        None => "vix_unknown",
    }
}

fn weekday_name(day: chrono::Weekday) -> &'static str {
    match day {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    }
}

/// Reduce a closed trade + its entry snapshot to a fact row. Trades
/// without a usable snapshot fall back to neutral buckets.
pub fn fact_for(db: &Db, trade: &Trade) -> Result<TradeFact> {
    let snapshot = db.entry_snapshot(trade.id)?;
    let (delta, vix) = match &snapshot {
        Some(s) => (
            s.live_delta_at_selection
                .or(s.greeks.delta)
                .unwrap_or(0.0),
            s.vix,
        ),
        None => (0.0, None),
    };
    let dte = trade
        .entry_time
        .map(|t| (trade.expiration - t.date_naive()).num_days())
        .unwrap_or(0);
    let pnl = trade.realized_pnl.or_else(|| trade.pnl()).unwrap_or(0.0);
    let collateral = trade.strike * 100.0 * trade.contracts.max(1) as f64;

    Ok(TradeFact {
        won: pnl > 0.0,
        roi: if collateral > 0.0 { pnl / collateral } else { 0.0 },
        delta_bucket: delta_bucket(delta),
        dte_bucket: dte_bucket(dte),
        vix_regime: vix_regime(vix),
        sector: crate::governor::sector_for(&trade.symbol),
        day_of_week: trade
            .entry_time
            .map(|t| weekday_name(t.date_naive().weekday()))
            .unwrap_or("unknown_day"),
    })
}

fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n < 2.0 {
        return (values.first().copied().unwrap_or(0.0), 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

/// Two-sample Welch t-test; returns (t, p). Degenerate inputs come back
/// as p = 1 so they never pass the threshold.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> (f64, f64) {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    if n1 < 2.0 || n2 < 2.0 {
        return (0.0, 1.0);
    }
    let (m1, v1) = mean_var(a);
    let (m2, v2) = mean_var(b);
    let se_sq = v1 / n1 + v2 / n2;
    if se_sq <= 0.0 {
        return (0.0, 1.0);
    }
    let t = (m1 - m2) / se_sq.sqrt();
    let df = se_sq * se_sq
        / ((v1 / n1) * (v1 / n1) / (n1 - 1.0) + (v2 / n2) * (v2 / n2) / (n2 - 1.0));
    if !df.is_finite() || df <= 0.0 {
        return (t, 1.0);
    }
    let dist = match StudentsT::new(0.0, 1.0, df) {
        Ok(d) => d,
        Err(_) => return (t, 1.0),
    };
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    (t, p.clamp(0.0, 1.0))
}

/// Evaluate every axis bucket against its complement. Retains patterns
/// with `p < 0.05` and `|effect| >= 0.005` (absolute ROI difference).
pub fn detect_patterns(facts: &[TradeFact], min_samples: usize) -> Vec<PatternRow> {
    if facts.len() < min_samples {
        return Vec::new();
    }

    let axes: [(&str, fn(&TradeFact) -> &'static str); 5] = [
        ("delta_bucket", |f| f.delta_bucket),
        ("dte_bucket", |f| f.dte_bucket),
        ("vix_regime", |f| f.vix_regime),
        ("sector", |f| f.sector),
        ("day_of_week", |f| f.day_of_week),
    ];

    let mut patterns = Vec::new();
    for (category, key) in axes {
        let mut buckets: Vec<&'static str> = facts.iter().map(|f| key(f)).collect();
        buckets.sort_unstable();
        buckets.dedup();

        for bucket in buckets {
            let (inside, outside): (Vec<&TradeFact>, Vec<&TradeFact>) =
                facts.iter().partition(|f| key(f) == bucket);
            if inside.len() < 5 || outside.len() < 5 {
                continue;
            }
            let roi_in: Vec<f64> = inside.iter().map(|f| f.roi).collect();
            let roi_out: Vec<f64> = outside.iter().map(|f| f.roi).collect();
            let (_, p_value) = welch_t_test(&roi_in, &roi_out);

            let mean_in = roi_in.iter().sum::<f64>() / roi_in.len() as f64;
            let mean_out = roi_out.iter().sum::<f64>() / roi_out.len() as f64;
            let effect = mean_in - mean_out;
            if p_value >= P_VALUE_THRESHOLD || effect.abs() < EFFECT_SIZE_FLOOR {
                continue;
            }

            let wins = inside.iter().filter(|f| f.won).count();
            patterns.push(PatternRow {
                id: 0,
                category: category.to_string(),
                name: bucket.to_string(),
                sample_size: inside.len() as i64,
                win_rate: wins as f64 / inside.len() as f64,
                avg_roi: mean_in,
                confidence: 1.0 - p_value,
                p_value,
                effect_size: effect,
                status: PatternStatus::Active,
                detected_at: Utc::now(),
            });
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(roi: f64, bucket: &'static str) -> TradeFact {
        TradeFact {
            won: roi > 0.0,
            roi,
            delta_bucket: bucket,
            dte_bucket: "dte_4_7",
            vix_regime: "vix_calm",
            sector: "broad_index",
            day_of_week: "monday",
        }
    }

    #[test]
    fn buckets_are_stable() {
        assert_eq!(delta_bucket(-0.068), "delta_05_10");
        assert_eq!(delta_bucket(0.02), "delta_lt_05");
        assert_eq!(dte_bucket(7), "dte_4_7");
        assert_eq!(vix_regime(Some(14.2)), "vix_calm");
        assert_eq!(vix_regime(None), "vix_unknown");
    }

    #[test]
    fn welch_detects_separated_samples() {
        let a: Vec<f64> = (0..30).map(|i| 0.020 + (i % 5) as f64 * 1e-4).collect();
        let b: Vec<f64> = (0..30).map(|i| 0.002 + (i % 5) as f64 * 1e-4).collect();
        let (t, p) = welch_t_test(&a, &b);
        assert!(t > 0.0);
        assert!(p < 0.01, "p = {p}");

        // identical samples are not significant
        let (_, p_same) = welch_t_test(&a, &a);
        assert!(p_same > 0.9);
    }

    #[test]
    fn degenerate_samples_never_pass() {
        assert_eq!(welch_t_test(&[0.1], &[0.2, 0.3]).1, 1.0);
        // zero variance both sides
        let (_, p) = welch_t_test(&[0.1, 0.1], &[0.1, 0.1]);
        assert_eq!(p, 1.0);
    }

    #[test]
    fn detects_a_planted_pattern() {
        let mut facts = Vec::new();
        for i in 0..20 {
            facts.push(fact(0.018 + (i % 4) as f64 * 2e-4, "delta_05_10"));
        }
        for i in 0..20 {
            facts.push(fact(-0.004 + (i % 4) as f64 * 2e-4, "delta_10_20"));
        }

        let patterns = detect_patterns(&facts, 30);
        let hit = patterns
            .iter()
            .find(|p| p.category == "delta_bucket" && p.name == "delta_05_10")
            .expect("planted pattern detected");
        assert!(hit.p_value < 0.05);
        assert!(hit.effect_size > 0.005);
        assert!(hit.win_rate > 0.9);
    }

    #[test]
    fn below_min_samples_detects_nothing() {
        let facts: Vec<TradeFact> = (0..10).map(|_| fact(0.01, "delta_05_10")).collect();
        assert!(detect_patterns(&facts, 30).is_empty());
    }
}
