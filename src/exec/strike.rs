//! Live strike selection: resolve the strike at execution time from
//! live chain greeks, picking the closest-to-target delta that clears
//! every liquidity floor. Never silently picks an invalid strike; a
//! dry chain comes back `Abandoned` with the reason.

use anyhow::Result;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::{BrokerAdapter, ChainEntry, OptionContract};
use crate::config::SelectorConfig;

#[derive(Debug, Clone)]
pub enum StrikeSelection {
    /// A different strike than staged won on live delta.
    Selected(ChainEntry),
    /// The staged strike is still the best candidate.
    Unchanged(ChainEntry),
    Abandoned(String),
}

impl StrikeSelection {
    pub fn entry(&self) -> Option<&ChainEntry> {
        match self {
            StrikeSelection::Selected(e) | StrikeSelection::Unchanged(e) => Some(e),
            StrikeSelection::Abandoned(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub symbol: String,
    pub expiration: NaiveDate,
    pub current_strike: f64,
    pub target_delta: f64,
    pub tolerance: f64,
    /// Staged underlying price, the fallback when live data is stale.
    pub staged_underlying: f64,
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selection: StrikeSelection,
    /// Live quote was unavailable and the staged price was used.
    pub used_stale_fallback: bool,
    pub underlying_price: f64,
}

pub struct LiveStrikeSelector {
    broker: Arc<dyn BrokerAdapter>,
    config: SelectorConfig,
}

impl LiveStrikeSelector {
    pub fn new(broker: Arc<dyn BrokerAdapter>, config: SelectorConfig) -> Self {
        Self { broker, config }
    }

    pub async fn select(&self, request: &SelectionRequest) -> Result<SelectionOutcome> {
        // 1. live underlying, staged fallback on stale data
        let (underlying, used_stale_fallback) =
            match self.broker.stock_quote(&request.symbol).await {
                Ok(quote) => (quote.mid(), false),
                Err(e) => {
                    warn!(symbol = %request.symbol, "live quote unavailable, staged fallback: {e:#}");
                    (request.staged_underlying, true)
                }
            };

        // 2. chain strikes for the expiration
        let strikes = self
            .broker
            .option_chain(&request.symbol, request.expiration)
            .await?;
        if strikes.is_empty() {
            return Ok(SelectionOutcome {
                selection: StrikeSelection::Abandoned("empty option chain".to_string()),
                used_stale_fallback,
                underlying_price: underlying,
            });
        }

        // 3. OTM puts beyond the floor, nearest the current strike first
        let max_strike = underlying * (1.0 - self.config.min_otm_pct);
        let mut candidates: Vec<f64> = strikes.into_iter().filter(|s| *s <= max_strike).collect();
        if candidates.is_empty() {
            return Ok(SelectionOutcome {
                selection: StrikeSelection::Abandoned(format!(
                    "no strikes at least {:.1}% OTM",
                    self.config.min_otm_pct * 100.0
                )),
                used_stale_fallback,
                underlying_price: underlying,
            });
        }
        candidates.sort_by(|a, b| {
            let da = (a - request.current_strike).abs();
            let db = (b - request.current_strike).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(self.config.max_candidates);

        // 4. qualify + greeks, bounded fan-out
        let contracts: Vec<OptionContract> = candidates
            .iter()
            .map(|s| OptionContract::put(&request.symbol, request.expiration, *s))
            .collect();
        let qualified = self.broker.qualify_contracts(contracts).await?;

        let mut entries: Vec<ChainEntry> = Vec::new();
        for chunk in qualified.chunks(self.config.max_concurrency.max(1)) {
            let batch = self.broker.greeks_batch(chunk).await?;
            entries.extend(batch.into_iter().flatten());
        }

        // 5. liquidity/spread/delta floors
        let total = entries.len();
        let viable: Vec<ChainEntry> = entries
            .into_iter()
            .filter(|e| {
                e.bid >= self.config.premium_floor
                    && e.bid > 0.0
                    && (e.ask - e.bid) / e.bid <= self.config.max_spread_pct
                    && e.volume >= self.config.min_volume
                    && e.open_interest >= self.config.min_open_interest
                    && e.greeks.delta.is_some()
            })
            .collect();
        debug!(
            symbol = %request.symbol,
            total,
            viable = viable.len(),
            "chain sampled"
        );
        if viable.is_empty() {
            return Ok(SelectionOutcome {
                selection: StrikeSelection::Abandoned(format!(
                    "no candidate cleared floors ({total} sampled)"
                )),
                used_stale_fallback,
                underlying_price: underlying,
            });
        }

        // 6. nearest |delta| to target, must land inside tolerance
        let best = viable
            .into_iter()
            .min_by(|a, b| {
                let da = (a.greeks.delta.unwrap_or(0.0).abs() - request.target_delta).abs();
                let db = (b.greeks.delta.unwrap_or(0.0).abs() - request.target_delta).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty viable set");

        let best_delta = best.greeks.delta.unwrap_or(0.0).abs();
        if (best_delta - request.target_delta).abs() > request.tolerance {
            return Ok(SelectionOutcome {
                selection: StrikeSelection::Abandoned(format!(
                    "best delta {:.3} outside tolerance {:.3} of target {:.3}",
                    best_delta, request.tolerance, request.target_delta
                )),
                used_stale_fallback,
                underlying_price: underlying,
            });
        }

        let selection = if (best.contract.strike - request.current_strike).abs() < 1e-9 {
            StrikeSelection::Unchanged(best)
        } else {
            StrikeSelection::Selected(best)
        };
        Ok(SelectionOutcome {
            selection,
            used_stale_fallback,
            underlying_price: underlying,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperBrokerConfig};
    use chrono::{Duration, Utc};

    fn selector_with(config: SelectorConfig) -> (Arc<PaperBroker>, LiveStrikeSelector) {
        let broker = Arc::new(PaperBroker::new(PaperBrokerConfig::default()));
        let selector = LiveStrikeSelector::new(broker.clone(), config);
        (broker, selector)
    }

    fn request(strike: f64, target_delta: f64, tolerance: f64) -> SelectionRequest {
        SelectionRequest {
            symbol: "XSP".into(),
            expiration: (Utc::now() + Duration::days(7)).date_naive(),
            current_strike: strike,
            target_delta,
            tolerance,
            staged_underlying: 598.4,
        }
    }

    #[tokio::test]
    async fn picks_a_strike_near_target_delta() {
        let (_broker, selector) = selector_with(SelectorConfig {
            premium_floor: 0.05,
            ..Default::default()
        });
        let outcome = selector.select(&request(560.0, 0.10, 0.1)).await.unwrap();
        let entry = outcome.selection.entry().expect("selection expected");
        let delta = entry.greeks.delta.unwrap().abs();
        assert!((delta - 0.10).abs() <= 0.1);
        assert!(!outcome.used_stale_fallback);
        // OTM floor respected
        assert!(entry.contract.strike <= 598.4 * (1.0 - 0.03));
    }

    #[tokio::test]
    async fn abandons_when_floors_filter_everything() {
        let (_broker, selector) = selector_with(SelectorConfig {
            premium_floor: 10_000.0, // nothing bids this high
            ..Default::default()
        });
        let outcome = selector.select(&request(560.0, 0.065, 0.02)).await.unwrap();
        match outcome.selection {
            StrikeSelection::Abandoned(reason) => {
                assert!(reason.contains("no candidate cleared floors"))
            }
            other => panic!("expected abandoned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandons_outside_tolerance() {
        let (_broker, selector) = selector_with(SelectorConfig {
            premium_floor: 0.05,
            ..Default::default()
        });
        // demand an absurdly tight tolerance around an unlikely target
        let outcome = selector.select(&request(560.0, 0.4999, 0.0001)).await.unwrap();
        assert!(matches!(
            outcome.selection,
            StrikeSelection::Abandoned(_)
        ));
    }
}
