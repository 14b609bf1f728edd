//! Typed event bus over the durable queue: producers publish rows, the
//! orchestrator is the single dispatching consumer. Scheduled events are
//! materialised by the calendar ticker in `scheduler`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::{Db, EventRow, EventState};

pub mod calendar;
pub mod scheduler;

pub use calendar::{MarketCalendar, Session};
pub use scheduler::CalendarScheduler;

/// Closed set of event types the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MarketOpen,
    PreMarketPrep,
    MarketClose,
    EndOfDayReflection,
    ScheduledCheck,
    WeeklyLearning,
    OrderFilled,
    OrderStatusChanged,
    PositionStopApproaching,
    UnderlyingSignificantMove,
    BrokerDisconnected,
    BrokerReconnected,
    StaleMarketData,
    ExperimentResultReady,
    AnomalyDetected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MarketOpen => "MARKET_OPEN",
            EventType::PreMarketPrep => "PRE_MARKET_PREP",
            EventType::MarketClose => "MARKET_CLOSE",
            EventType::EndOfDayReflection => "END_OF_DAY_REFLECTION",
            EventType::ScheduledCheck => "SCHEDULED_CHECK",
            EventType::WeeklyLearning => "WEEKLY_LEARNING",
            EventType::OrderFilled => "ORDER_FILLED",
            EventType::OrderStatusChanged => "ORDER_STATUS_CHANGED",
            EventType::PositionStopApproaching => "POSITION_STOP_APPROACHING",
            EventType::UnderlyingSignificantMove => "UNDERLYING_SIGNIFICANT_MOVE",
            EventType::BrokerDisconnected => "BROKER_DISCONNECTED",
            EventType::BrokerReconnected => "BROKER_RECONNECTED",
            EventType::StaleMarketData => "STALE_MARKET_DATA",
            EventType::ExperimentResultReady => "EXPERIMENT_RESULT_READY",
            EventType::AnomalyDetected => "ANOMALY_DETECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET_OPEN" => Some(Self::MarketOpen),
            "PRE_MARKET_PREP" => Some(Self::PreMarketPrep),
            "MARKET_CLOSE" => Some(Self::MarketClose),
            "END_OF_DAY_REFLECTION" => Some(Self::EndOfDayReflection),
            "SCHEDULED_CHECK" => Some(Self::ScheduledCheck),
            "WEEKLY_LEARNING" => Some(Self::WeeklyLearning),
            "ORDER_FILLED" => Some(Self::OrderFilled),
            "ORDER_STATUS_CHANGED" => Some(Self::OrderStatusChanged),
            "POSITION_STOP_APPROACHING" => Some(Self::PositionStopApproaching),
            "UNDERLYING_SIGNIFICANT_MOVE" => Some(Self::UnderlyingSignificantMove),
            "BROKER_DISCONNECTED" => Some(Self::BrokerDisconnected),
            "BROKER_RECONNECTED" => Some(Self::BrokerReconnected),
            "STALE_MARKET_DATA" => Some(Self::StaleMarketData),
            "EXPERIMENT_RESULT_READY" => Some(Self::ExperimentResultReady),
            "ANOMALY_DETECTED" => Some(Self::AnomalyDetected),
            _ => None,
        }
    }

    /// Critical events drain ahead of normal ones when the consumer is
    /// between normal rows.
    pub fn priority(&self) -> i64 {
        match self {
            EventType::OrderFilled
            | EventType::BrokerDisconnected
            | EventType::StaleMarketData => 1,
            _ => 0,
        }
    }
}

/// A claimed event, typed. Unknown rows (schema drift) are surfaced as
/// `None` by the bus and failed.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub retries: i64,
}

impl Event {
    fn from_row(row: &EventRow) -> Option<Self> {
        let event_type = EventType::parse(&row.event_type)?;
        let payload = serde_json::from_str(&row.payload_json).unwrap_or(serde_json::Value::Null);
        Some(Self {
            id: row.id,
            event_type,
            payload,
            retries: row.retries,
        })
    }
}

/// Producer + consumer facade over the durable queue.
#[derive(Clone)]
pub struct EventBus {
    db: Db,
    max_retries: i64,
}

impl EventBus {
    pub fn new(db: Db, max_retries: i64) -> Self {
        Self { db, max_retries }
    }

    pub fn publish(&self, event_type: EventType, payload: serde_json::Value) -> Result<i64> {
        self.db
            .publish_event(
                event_type.as_str(),
                &payload.to_string(),
                event_type.priority(),
            )
            .context("bus publish")
    }

    /// Dedup key is `(type, slot)`; duplicate calendar emissions for the
    /// same slot are suppressed.
    pub fn publish_scheduled(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        slot: &str,
    ) -> Result<Option<i64>> {
        self.db
            .publish_scheduled_event(
                event_type.as_str(),
                &payload.to_string(),
                event_type.priority(),
                slot,
            )
            .context("bus publish scheduled")
    }

    /// Claim the next runnable event. Rows with an unknown type are
    /// immediately failed (no retry loop for garbage).
    pub fn next(&self) -> Result<Option<Event>> {
        loop {
            let Some(row) = self.db.claim_next_event()? else {
                return Ok(None);
            };
            match Event::from_row(&row) {
                Some(event) => return Ok(Some(event)),
                None => {
                    self.db.mark_event_failed(
                        row.id,
                        &format!("unknown event type: {}", row.event_type),
                        0,
                    )?;
                }
            }
        }
    }

    pub fn done(&self, event_id: i64) -> Result<()> {
        self.db.mark_event_done(event_id)
    }

    pub fn failed(&self, event_id: i64, error: &str) -> Result<EventState> {
        self.db.mark_event_failed(event_id, error, self.max_retries)
    }

    pub fn requeue_stuck(&self, max_runtime_secs: i64) -> Result<usize> {
        self.db.requeue_stuck_events(max_runtime_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_round_trip() {
        let all = [
            EventType::MarketOpen,
            EventType::PreMarketPrep,
            EventType::MarketClose,
            EventType::EndOfDayReflection,
            EventType::ScheduledCheck,
            EventType::WeeklyLearning,
            EventType::OrderFilled,
            EventType::OrderStatusChanged,
            EventType::PositionStopApproaching,
            EventType::UnderlyingSignificantMove,
            EventType::BrokerDisconnected,
            EventType::BrokerReconnected,
            EventType::StaleMarketData,
            EventType::ExperimentResultReady,
            EventType::AnomalyDetected,
        ];
        for t in all {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn bus_publish_claim_ack() {
        let db = Db::open_in_memory().unwrap();
        let bus = EventBus::new(db, 3);

        bus.publish(EventType::ScheduledCheck, serde_json::json!({"slot": "10:15"}))
            .unwrap();
        bus.publish(
            EventType::OrderFilled,
            serde_json::json!({"broker_order_id": "42"}),
        )
        .unwrap();

        // critical fast lane
        let event = bus.next().unwrap().unwrap();
        assert_eq!(event.event_type, EventType::OrderFilled);
        assert_eq!(event.payload["broker_order_id"], "42");
        bus.done(event.id).unwrap();

        let event = bus.next().unwrap().unwrap();
        assert_eq!(event.event_type, EventType::ScheduledCheck);
        bus.done(event.id).unwrap();
        assert!(bus.next().unwrap().is_none());
    }

    #[test]
    fn unknown_rows_are_failed_not_looped() {
        let db = Db::open_in_memory().unwrap();
        db.publish_event("NOT_A_THING", "{}", 0).unwrap();
        let bus = EventBus::new(db, 3);
        assert!(bus.next().unwrap().is_none());
    }
}
