//! Daemon configuration.
//!
//! Layering: built-in defaults < optional TOML file (`PUTBOT_CONFIG`) <
//! environment variables for the handful of deployment-specific knobs
//! (db path, gateway URL, API keys, paper mode). Every threshold quoted
//! in the component docs is a field here with its default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

fn d_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_database_path")]
    pub database_path: String,
    /// Session identifier prefix; the daemon appends the trading date.
    #[serde(default = "Config::default_session_prefix")]
    pub session_prefix: String,
    /// Simulated broker instead of the live gateway. Safe default.
    #[serde(default = "d_true")]
    pub paper: bool,

    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub strategy: StrategyDefaults,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub fills: FillConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub events: EventConfig,
}

impl Config {
    fn default_database_path() -> String {
        "./putbot.db".to_string()
    }

    fn default_session_prefix() -> String {
        "putbot".to_string()
    }

    /// Load config: TOML file if `PUTBOT_CONFIG` points at one, defaults
    /// otherwise, then environment overrides on top.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config: Config = match env::var("PUTBOT_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path))?;
                toml::from_str(&raw).with_context(|| format!("parsing config file {}", path))?
            }
            _ => toml::from_str("").expect("empty config parses to defaults"),
        };

        if let Ok(v) = env::var("DATABASE_PATH") {
            if !v.trim().is_empty() {
                config.database_path = v;
            }
        }
        if let Ok(v) = env::var("PUTBOT_PAPER") {
            config.paper = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = env::var("IBKR_GATEWAY_URL") {
            if !v.trim().is_empty() {
                config.broker.gateway_url = v;
            }
        }
        if let Ok(v) = env::var("IBKR_ACCOUNT_ID") {
            if !v.trim().is_empty() {
                config.broker.account_id = v;
            }
        }
        if let Ok(v) = env::var("PUTBOT_MODEL") {
            if !v.trim().is_empty() {
                config.engine.model = v;
            }
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// IB Client Portal gateway base URL.
    pub gateway_url: String,
    pub account_id: String,
    pub quote_timeout_secs: u64,
    pub chain_timeout_secs: u64,
    pub whatif_timeout_secs: u64,
    pub submit_timeout_secs: u64,
    /// Cadence of the order/connection polling pump.
    pub poll_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://localhost:5000/v1/api".to_string(),
            account_id: String::new(),
            quote_timeout_secs: 3,
            chain_timeout_secs: 5,
            whatif_timeout_secs: 5,
            submit_timeout_secs: 5,
            poll_interval_secs: 2,
        }
    }
}

/// Initial strategy parameters. Working memory owns the live values;
/// these seed a fresh session and experiments mutate them from there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyDefaults {
    pub target_delta: f64,
    pub delta_tolerance: f64,
    pub target_dte: i64,
    /// Child BUY-to-close at this fraction of entry credit retained
    /// (0.70 = buy back at 30% of entry premium).
    pub profit_target_pct: f64,
    /// Optional stop child at this multiple of entry credit; 0 disables.
    pub stop_multiple: f64,
    pub max_rolls: i64,
    pub strategy_tag: String,
    pub universe: Vec<String>,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            target_delta: 0.065,
            delta_tolerance: 0.02,
            target_dte: 7,
            profit_target_pct: 0.70,
            stop_multiple: 2.5,
            max_rolls: 2,
            strategy_tag: "csp_weekly".to_string(),
            universe: vec!["XSP".to_string(), "SPY".to_string(), "QQQ".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_open_positions: i64,
    pub max_daily_new_positions: i64,
    pub max_daily_loss_pct: f64,
    pub max_weekly_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_sector_concentration: f64,
    pub per_trade_margin_cap_pct: f64,
    pub max_margin_utilisation: f64,
    pub min_excess_liquidity_pct: f64,
    pub vix_halt_threshold: f64,
    pub allow_pre_market: bool,
    /// Max contracts on any single trade regardless of margin headroom.
    pub max_contracts_per_trade: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            max_daily_new_positions: 3,
            max_daily_loss_pct: 0.02,
            max_weekly_loss_pct: 0.05,
            max_drawdown_pct: 0.10,
            max_sector_concentration: 0.40,
            per_trade_margin_cap_pct: 0.10,
            max_margin_utilisation: 0.30,
            min_excess_liquidity_pct: 0.30,
            vix_halt_threshold: 35.0,
            allow_pre_market: false,
            max_contracts_per_trade: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub min_otm_pct: f64,
    pub max_candidates: usize,
    pub premium_floor: f64,
    pub max_spread_pct: f64,
    pub min_volume: i64,
    pub min_open_interest: i64,
    /// Bounded fan-out for qualify + greeks requests.
    pub max_concurrency: usize,
    /// Stock drift vs staged price that triggers auto-adjust.
    pub drift_adjust_pct: f64,
    /// Stock drift vs staged price that marks the candidate stale.
    pub drift_stale_pct: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_otm_pct: 0.03,
            max_candidates: 12,
            premium_floor: 0.30,
            max_spread_pct: 0.25,
            min_volume: 10,
            min_open_interest: 100,
            max_concurrency: 5,
            drift_adjust_pct: 0.05,
            drift_stale_pct: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    pub check_interval_secs: u64,
    pub adjustment_interval_secs: u64,
    pub max_adjustments: u32,
    pub adjustment_increment: f64,
    /// Partial fill fraction at which the remainder is re-priced.
    pub partial_threshold: f64,
    pub monitoring_window_secs: u64,
    /// Leave unfilled orders working as DAY orders at window end
    /// instead of cancelling them.
    pub leave_day_orders: bool,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            adjustment_interval_secs: 60,
            max_adjustments: 3,
            adjustment_increment: 0.01,
            partial_threshold: 0.5,
            monitoring_window_secs: 600,
            leave_day_orders: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: String,
    pub embed_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub llm_timeout_secs: u64,
    pub min_confidence: f64,
    pub daily_cost_cap_usd: f64,
    pub max_calls_per_day: u32,
    pub max_tokens_per_day: u64,
    /// Blended $/1k tokens used to derive call cost from usage counts.
    pub cost_per_1k_tokens_usd: f64,
    /// Relative tolerance for the numeric-grounding guard.
    pub grounding_tolerance: f64,
    pub retrieval_k: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4.5".to_string(),
            embed_model: "openai/text-embedding-3-small".to_string(),
            max_tokens: 1200,
            temperature: 0.0,
            llm_timeout_secs: 30,
            min_confidence: 0.55,
            daily_cost_cap_usd: 10.0,
            max_calls_per_day: 200,
            max_tokens_per_day: 500_000,
            cost_per_1k_tokens_usd: 0.009,
            grounding_tolerance: 0.02,
            retrieval_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    /// Starting level for a brand new session (1..=3; L4 is never
    /// reached automatically).
    pub initial_level: u8,
    pub promotion_clean_days: i64,
    pub promotion_min_win_rate: f64,
    pub promotion_min_sharpe: f64,
    pub demotion_loss_streak: i64,
    pub review_size_multiple: f64,
    pub review_sector_loss_streak: i64,
    pub review_vix_spike_pct: f64,
    pub review_stale_minutes: i64,
    pub review_margin_utilisation: f64,
    pub review_min_confidence: f64,
    pub review_fill_failure_streak: i64,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            initial_level: 1,
            promotion_clean_days: 10,
            promotion_min_win_rate: 0.70,
            promotion_min_sharpe: 1.0,
            demotion_loss_streak: 3,
            review_size_multiple: 3.0,
            review_sector_loss_streak: 3,
            review_vix_spike_pct: 0.30,
            review_stale_minutes: 30,
            review_margin_utilisation: 0.40,
            review_min_confidence: 0.40,
            review_fill_failure_streak: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub scheduled_check_interval_mins: i64,
    pub staleness_threshold_secs: i64,
    /// A `processing` row older than this is presumed orphaned by a
    /// crashed consumer and requeued.
    pub max_event_runtime_secs: i64,
    pub max_retries: i64,
    pub ticker_interval_secs: u64,
    pub learning_min_samples: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            scheduled_check_interval_mins: 15,
            staleness_threshold_secs: 120,
            max_event_runtime_secs: 600,
            max_retries: 3,
            ticker_interval_secs: 30,
            learning_min_samples: 30,
        }
    }
}
