//! Fill manager: time-boxed monitoring of submitted orders with
//! progressive limit adjustment. Entry sells walk the limit down but
//! never through the premium floor; closing buys walk it up against an
//! optional ceiling. Partial fills above the threshold re-price the
//! remainder as a fresh working order.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker::{BrokerAdapter, OptionContract, OrderTicket};
use crate::config::FillConfig;
use crate::models::{OrderRecord, OrderSide, OrderState, TimeInForce};
use crate::store::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Filled,
    Cancelled,
    LeftWorkingOnTimeout,
}

#[derive(Debug, Clone)]
pub struct OrderFillResult {
    pub broker_order_id: String,
    pub outcome: FillOutcome,
    pub filled: i64,
    pub avg_fill_price: Option<f64>,
    pub adjustments: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FillReport {
    pub results: Vec<OrderFillResult>,
    pub fully_filled: i64,
    pub total_adjustments: u32,
}

impl FillReport {
    pub fn all_filled(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.outcome == FillOutcome::Filled)
    }
}

/// One order under management.
#[derive(Debug, Clone)]
pub struct MonitoredOrder {
    pub broker_order_id: String,
    pub contract: OptionContract,
    pub side: OrderSide,
    pub quantity: i64,
    pub limit_price: f64,
    /// Sell orders never go below this.
    pub premium_floor: f64,
    /// Buy orders never go above this (closing spend cap), if set.
    pub price_ceiling: Option<f64>,
}

struct Tracked {
    order: MonitoredOrder,
    adjustments: u32,
    last_adjustment: Instant,
    last_filled_seen: i64,
}

pub struct FillManager {
    broker: Arc<dyn BrokerAdapter>,
    db: Db,
    config: FillConfig,
}

impl FillManager {
    pub fn new(broker: Arc<dyn BrokerAdapter>, db: Db, config: FillConfig) -> Self {
        Self { broker, db, config }
    }

    /// Monitor until every order is terminal or the window closes.
    pub async fn monitor(&self, orders: Vec<MonitoredOrder>) -> Result<FillReport> {
        let deadline = Instant::now() + Duration::from_secs(self.config.monitoring_window_secs);
        let mut active: Vec<Tracked> = orders
            .into_iter()
            .map(|order| Tracked {
                order,
                adjustments: 0,
                last_adjustment: Instant::now(),
                last_filled_seen: 0,
            })
            .collect();
        let mut report = FillReport::default();

        while !active.is_empty() && Instant::now() < deadline {
            // broker gone: suspend sampling and adjustments, keep waiting
            if !self.broker.is_connected() {
                debug!("fill monitor suspended: broker disconnected");
                sleep(Duration::from_secs(self.config.check_interval_secs)).await;
                continue;
            }

            let mut still_active = Vec::new();
            let mut spawned: Vec<Tracked> = Vec::new();
            for mut tracked in active {
                match self.step(&mut tracked, &mut report, &mut spawned).await {
                    Ok(true) => still_active.push(tracked),
                    Ok(false) => {}
                    Err(e) => {
                        // unknown state; keep watching, reconciliation
                        // will settle it if this persists
                        warn!(
                            order = %tracked.order.broker_order_id,
                            "fill sample failed: {e:#}"
                        );
                        still_active.push(tracked);
                    }
                }
            }
            still_active.extend(spawned);
            active = still_active;

            if !active.is_empty() {
                sleep(Duration::from_secs(self.config.check_interval_secs)).await;
            }
        }

        // window closed
        for tracked in active {
            let outcome = if self.config.leave_day_orders {
                info!(order = %tracked.order.broker_order_id, "window closed, left working as DAY");
                FillOutcome::LeftWorkingOnTimeout
            } else {
                match self
                    .broker
                    .cancel_order(&tracked.order.broker_order_id)
                    .await
                {
                    Ok(_) => FillOutcome::Cancelled,
                    Err(e) => {
                        warn!(
                            order = %tracked.order.broker_order_id,
                            "cancel at window close failed: {e:#}"
                        );
                        FillOutcome::LeftWorkingOnTimeout
                    }
                }
            };
            report.results.push(OrderFillResult {
                broker_order_id: tracked.order.broker_order_id.clone(),
                outcome,
                filled: tracked.last_filled_seen,
                avg_fill_price: None,
                adjustments: tracked.adjustments,
            });
        }

        Ok(report)
    }

    /// Returns Ok(true) while the order stays under management.
    async fn step(
        &self,
        tracked: &mut Tracked,
        report: &mut FillReport,
        spawned: &mut Vec<Tracked>,
    ) -> Result<bool> {
        let status = self
            .broker
            .order_status(&tracked.order.broker_order_id)
            .await?;
        tracked.last_filled_seen = status.filled;

        if status.is_filled() {
            self.db.update_order_from_broker(
                &status.broker_order_id,
                OrderState::Filled,
                status.filled,
                status.avg_fill_price,
                &status.status,
            )?;
            report.fully_filled += status.filled;
            report.results.push(OrderFillResult {
                broker_order_id: status.broker_order_id.clone(),
                outcome: FillOutcome::Filled,
                filled: status.filled,
                avg_fill_price: status.avg_fill_price,
                adjustments: tracked.adjustments,
            });
            return Ok(false);
        }

        if status.is_cancelled() {
            self.db.update_order_from_broker(
                &status.broker_order_id,
                OrderState::Cancelled,
                status.filled,
                status.avg_fill_price,
                &status.status,
            )?;
            report.fully_filled += status.filled;
            report.results.push(OrderFillResult {
                broker_order_id: status.broker_order_id.clone(),
                outcome: FillOutcome::Cancelled,
                filled: status.filled,
                avg_fill_price: status.avg_fill_price,
                adjustments: tracked.adjustments,
            });
            return Ok(false);
        }

        // partial at/above threshold: take the fill, re-price the rest
        let fraction = status.filled as f64 / tracked.order.quantity.max(1) as f64;
        if status.filled > 0 && fraction >= self.config.partial_threshold {
            return self.split_remainder(tracked, &status.status, status.filled, status.avg_fill_price, report, spawned).await;
        }

        // progressive limit adjustment
        if tracked.last_adjustment.elapsed()
            >= Duration::from_secs(self.config.adjustment_interval_secs)
            && tracked.adjustments < self.config.max_adjustments
        {
            if let Some(new_limit) = self.next_limit(&tracked.order) {
                self.broker
                    .modify_order(&tracked.order.broker_order_id, new_limit)
                    .await?;
                self.db
                    .update_order_limit(&tracked.order.broker_order_id, new_limit)?;
                info!(
                    order = %tracked.order.broker_order_id,
                    from = tracked.order.limit_price,
                    to = new_limit,
                    "limit adjusted"
                );
                tracked.order.limit_price = new_limit;
                tracked.adjustments += 1;
                report.total_adjustments += 1;
                tracked.last_adjustment = Instant::now();
            } else {
                debug!(
                    order = %tracked.order.broker_order_id,
                    "adjustment would cross the floor, holding"
                );
                tracked.last_adjustment = Instant::now();
            }
        }

        Ok(true)
    }

    /// Next limit one increment toward the market, or None when the
    /// floor/ceiling would be crossed.
    fn next_limit(&self, order: &MonitoredOrder) -> Option<f64> {
        match order.side {
            OrderSide::Sell => {
                let new_limit = round_cents(order.limit_price - self.config.adjustment_increment);
                (new_limit >= order.premium_floor).then_some(new_limit)
            }
            OrderSide::Buy => {
                let new_limit = round_cents(order.limit_price + self.config.adjustment_increment);
                match order.price_ceiling {
                    Some(ceiling) if new_limit > ceiling => None,
                    _ => Some(new_limit),
                }
            }
        }
    }

    /// Cancel the remainder and resubmit it at a fresh limit computed
    /// from the live quote; the new order is tracked alongside.
    async fn split_remainder(
        &self,
        tracked: &mut Tracked,
        broker_status: &str,
        filled: i64,
        avg_fill_price: Option<f64>,
        report: &mut FillReport,
        spawned: &mut Vec<Tracked>,
    ) -> Result<bool> {
        let remaining = tracked.order.quantity - filled;
        info!(
            order = %tracked.order.broker_order_id,
            filled,
            remaining,
            "partial fill above threshold, re-pricing remainder"
        );

        self.broker
            .cancel_order(&tracked.order.broker_order_id)
            .await?;
        self.db.update_order_from_broker(
            &tracked.order.broker_order_id,
            OrderState::Cancelled,
            filled,
            avg_fill_price,
            broker_status,
        )?;
        report.fully_filled += filled;
        report.results.push(OrderFillResult {
            broker_order_id: tracked.order.broker_order_id.clone(),
            outcome: FillOutcome::Filled,
            filled,
            avg_fill_price,
            adjustments: tracked.adjustments,
        });

        if remaining <= 0 {
            return Ok(false);
        }

        let quote = self.broker.option_quote(&tracked.order.contract).await?;
        let fresh_limit = match tracked.order.side {
            OrderSide::Sell => round_cents(quote.mid()).max(tracked.order.premium_floor),
            OrderSide::Buy => {
                let mid = round_cents(quote.mid());
                match tracked.order.price_ceiling {
                    Some(ceiling) => mid.min(ceiling),
                    None => mid,
                }
            }
        };
        if (fresh_limit - tracked.order.limit_price).abs() > 1e-9 {
            report.total_adjustments += 1;
        }
        let ticket = OrderTicket::limit(tracked.order.side, remaining, fresh_limit, TimeInForce::Day);
        let order_ref = self
            .broker
            .place_order(&tracked.order.contract, &ticket)
            .await?;

        // persist the replacement next to the original
        let original = self
            .db
            .get_order_by_broker_id(&tracked.order.broker_order_id)?;
        self.db.insert_order(&OrderRecord {
            id: 0,
            broker_order_id: order_ref.broker_order_id.clone(),
            parent_broker_order_id: original
                .as_ref()
                .and_then(|o| o.parent_broker_order_id.clone()),
            trade_id: original.as_ref().and_then(|o| o.trade_id),
            symbol: tracked.order.contract.symbol.clone(),
            side: tracked.order.side,
            quantity: remaining,
            limit_price: fresh_limit,
            order_type: "LMT".to_string(),
            tif: TimeInForce::Day,
            state: OrderState::Working,
            filled_quantity: 0,
            avg_fill_price: None,
            commission: 0.0,
            last_broker_status: order_ref.status.clone(),
            created_at: Utc::now(),
        })?;

        spawned.push(Tracked {
            order: MonitoredOrder {
                broker_order_id: order_ref.broker_order_id,
                contract: tracked.order.contract.clone(),
                side: tracked.order.side,
                quantity: remaining,
                limit_price: fresh_limit,
                premium_floor: tracked.order.premium_floor,
                price_ceiling: tracked.order.price_ceiling,
            },
            adjustments: 0,
            last_adjustment: Instant::now(),
            last_filled_seen: 0,
        });
        Ok(false)
    }
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperBrokerConfig};
    use chrono::Duration as ChronoDuration;

    fn contract() -> OptionContract {
        OptionContract::put(
            "XSP",
            (Utc::now() + ChronoDuration::days(7)).date_naive(),
            560.0,
        )
    }

    fn fast_config() -> FillConfig {
        FillConfig {
            check_interval_secs: 0,
            adjustment_interval_secs: 0,
            max_adjustments: 3,
            adjustment_increment: 0.01,
            partial_threshold: 0.5,
            monitoring_window_secs: 5,
            leave_day_orders: true,
        }
    }

    async fn submit_and_monitor(
        broker_config: PaperBrokerConfig,
        fill_config: FillConfig,
        qty: i64,
        limit: f64,
        floor: f64,
    ) -> (Arc<PaperBroker>, FillReport) {
        let broker = Arc::new(PaperBroker::new(broker_config));
        let db = Db::open_in_memory().unwrap();
        let ticket = OrderTicket::limit(OrderSide::Sell, qty, limit, TimeInForce::Day);
        let order_ref = broker.place_order(&contract(), &ticket).await.unwrap();
        db.insert_order(&OrderRecord {
            id: 0,
            broker_order_id: order_ref.broker_order_id.clone(),
            parent_broker_order_id: None,
            trade_id: None,
            symbol: "XSP".into(),
            side: OrderSide::Sell,
            quantity: qty,
            limit_price: limit,
            order_type: "LMT".into(),
            tif: TimeInForce::Day,
            state: OrderState::Working,
            filled_quantity: 0,
            avg_fill_price: None,
            commission: 0.0,
            last_broker_status: "Submitted".into(),
            created_at: Utc::now(),
        })
        .unwrap();

        let manager = FillManager::new(broker.clone(), db, fill_config);
        let report = manager
            .monitor(vec![MonitoredOrder {
                broker_order_id: order_ref.broker_order_id,
                contract: contract(),
                side: OrderSide::Sell,
                quantity: qty,
                limit_price: limit,
                premium_floor: floor,
                price_ceiling: None,
            }])
            .await
            .unwrap();
        (broker, report)
    }

    #[tokio::test]
    async fn immediate_fill_reported() {
        let (_broker, report) = submit_and_monitor(
            PaperBrokerConfig::default(),
            fast_config(),
            3,
            0.45,
            0.30,
        )
        .await;
        assert_eq!(report.fully_filled, 3);
        assert!(report.all_filled());
        assert_eq!(report.total_adjustments, 0);
    }

    #[tokio::test]
    async fn adjustments_stop_at_floor() {
        // orders never fill; the limit may only walk down to the floor
        let (_broker, report) = submit_and_monitor(
            PaperBrokerConfig {
                fill_prob_per_poll: 0.0,
                ..Default::default()
            },
            FillConfig {
                monitoring_window_secs: 1,
                max_adjustments: 10,
                ..fast_config()
            },
            1,
            0.32,
            0.30,
        )
        .await;
        // 0.32 -> 0.31 -> 0.30, then the floor holds
        assert!(report.total_adjustments <= 2);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].outcome, FillOutcome::LeftWorkingOnTimeout);
    }

    #[tokio::test]
    async fn partial_fill_resubmits_remainder() {
        // every poll fills, always partially, at least 40% of remainder
        let (broker, report) = submit_and_monitor(
            PaperBrokerConfig {
                fill_prob_per_poll: 1.0,
                partial_fill_prob: 1.0,
                min_fill_ratio: 0.4,
                ..Default::default()
            },
            fast_config(),
            3,
            0.45,
            0.05,
        )
        .await;

        // all three contracts filled across original + remainder orders
        assert_eq!(report.fully_filled, 3);
        assert!(report.results.len() >= 2);
        // re-pricing the remainder counts as an adjustment
        assert!(report.total_adjustments >= 1);
        let executions = broker.list_executions().await.unwrap();
        assert_eq!(executions.iter().map(|e| e.quantity).sum::<i64>(), 3);
    }

    #[tokio::test]
    async fn window_close_cancels_when_configured() {
        let (broker, report) = submit_and_monitor(
            PaperBrokerConfig {
                fill_prob_per_poll: 0.0,
                ..Default::default()
            },
            FillConfig {
                monitoring_window_secs: 0,
                leave_day_orders: false,
                ..fast_config()
            },
            1,
            1.80,
            0.30,
        )
        .await;
        assert_eq!(report.results[0].outcome, FillOutcome::Cancelled);
        let open = broker.list_open_orders().await.unwrap();
        assert!(open.is_empty());
    }
}
