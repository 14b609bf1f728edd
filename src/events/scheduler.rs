//! Calendar ticker: materialises time-based events into the durable
//! queue. Idempotent by construction: every emission carries a
//! `(type, slot)` dedup key, so restarts and overlapping ticks cannot
//! double-fire a trading day's events.

use anyhow::Result;
use chrono::{Datelike, NaiveTime, Timelike, Utc, Weekday};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{EventBus, EventType, MarketCalendar};

pub struct CalendarScheduler {
    bus: EventBus,
    calendar: MarketCalendar,
    check_interval_mins: i64,
    tick_interval: Duration,
}

impl CalendarScheduler {
    pub fn new(
        bus: EventBus,
        calendar: MarketCalendar,
        check_interval_mins: i64,
        tick_interval_secs: u64,
    ) -> Self {
        Self {
            bus,
            calendar,
            check_interval_mins: check_interval_mins.max(1),
            tick_interval: Duration::from_secs(tick_interval_secs.max(1)),
        }
    }

    /// Run until shutdown flips. Each tick emits whatever slots are due.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            check_interval_mins = self.check_interval_mins,
            "calendar scheduler started"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        error!("calendar tick failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("calendar scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One evaluation of the clock against the calendar. Public for tests.
    pub fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let eastern = self.calendar.to_eastern(now);
        let date = eastern.date();
        if !self.calendar.is_trading_day(date) {
            return Ok(());
        }

        let t = eastern.time();
        let day_slot = date.format("%Y-%m-%d").to_string();
        let payload = serde_json::json!({ "trading_date": day_slot });
        let open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
        let prep = NaiveTime::from_hms_opt(9, 15, 0).expect("valid time");
        let close = self.calendar.session_close_time(date);

        if t >= prep {
            self.emit(EventType::PreMarketPrep, &payload, &day_slot)?;
        }
        if t >= open && t < close {
            self.emit(EventType::MarketOpen, &payload, &day_slot)?;
        }

        // mid-session checks on a fixed cadence from the open
        if t >= open && t < close {
            let elapsed_mins = (t - open).num_minutes();
            let slot_index = elapsed_mins / self.check_interval_mins;
            if slot_index > 0 {
                let slot_time = open
                    + chrono::Duration::minutes(slot_index * self.check_interval_mins);
                let slot = format!(
                    "{}T{:02}:{:02}",
                    day_slot,
                    slot_time.hour(),
                    slot_time.minute()
                );
                let check_payload = serde_json::json!({
                    "trading_date": day_slot,
                    "slot": slot,
                });
                self.emit(EventType::ScheduledCheck, &check_payload, &slot)?;
            }
        }

        if t >= close {
            self.emit(EventType::MarketClose, &payload, &day_slot)?;
            self.emit(EventType::EndOfDayReflection, &payload, &day_slot)?;
            if date.weekday() == Weekday::Fri {
                self.emit(EventType::WeeklyLearning, &payload, &day_slot)?;
            }
        }

        Ok(())
    }

    fn emit(&self, event_type: EventType, payload: &serde_json::Value, slot: &str) -> Result<()> {
        if let Some(id) = self.bus.publish_scheduled(event_type, payload.clone(), slot)? {
            info!(event = event_type.as_str(), slot, id, "scheduled event emitted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Db;

    #[test]
    fn tick_is_idempotent_per_slot() {
        let db = Db::open_in_memory().unwrap();
        let bus = EventBus::new(db.clone(), 3);
        let scheduler = CalendarScheduler::new(bus.clone(), MarketCalendar, 15, 30);

        // two consecutive ticks must not double-emit any slot
        scheduler.tick().unwrap();
        let first: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        scheduler.tick().unwrap();
        let second: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(first, second);
    }
}
