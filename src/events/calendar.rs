//! US equity market calendar: weekends, NYSE holidays, early closes and
//! session boundaries. All computation is done in US Eastern time with
//! hand-rolled DST rules (second Sunday of March through first Sunday of
//! November) so the daemon stays chrono-only.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Closed,
    PreMarket,
    Regular,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarketCalendar;

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let offset = (7 + weekday.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    first + Duration::days(offset + 7 * (n as i64 - 1))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let mut d = next_month - Duration::days(1);
    while d.weekday() != weekday {
        d -= Duration::days(1);
    }
    d
}

/// Anonymous Gregorian algorithm.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).expect("easter in range")
}

/// Saturday holidays are observed Friday, Sunday holidays Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

impl MarketCalendar {
    fn holidays(year: i32) -> Vec<NaiveDate> {
        let fixed = |m: u32, d: u32| {
            observed(NaiveDate::from_ymd_opt(year, m, d).expect("valid holiday date"))
        };
        vec![
            fixed(1, 1),                                  // New Year's Day
            nth_weekday(year, 1, Weekday::Mon, 3),        // MLK Day
            nth_weekday(year, 2, Weekday::Mon, 3),        // Presidents' Day
            easter_sunday(year) - Duration::days(2),      // Good Friday
            last_weekday(year, 5, Weekday::Mon),          // Memorial Day
            fixed(6, 19),                                 // Juneteenth
            fixed(7, 4),                                  // Independence Day
            nth_weekday(year, 9, Weekday::Mon, 1),        // Labor Day
            nth_weekday(year, 11, Weekday::Thu, 4),       // Thanksgiving
            fixed(12, 25),                                // Christmas
        ]
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !Self::holidays(date.year()).contains(&date)
    }

    /// 13:00 ET closes: July 3rd, the day after Thanksgiving, Christmas
    /// Eve (when those fall on a trading day).
    pub fn is_early_close(&self, date: NaiveDate) -> bool {
        if !self.is_trading_day(date) {
            return false;
        }
        let year = date.year();
        let thanksgiving = nth_weekday(year, 11, Weekday::Thu, 4);
        date == thanksgiving + Duration::days(1)
            || date == NaiveDate::from_ymd_opt(year, 7, 3).expect("valid date")
            || date == NaiveDate::from_ymd_opt(year, 12, 24).expect("valid date")
    }

    /// Eastern offset in hours for a date: EDT (-4) between the second
    /// Sunday of March and the first Sunday of November, EST (-5)
    /// otherwise. DST flips at 02:00 local; a date-level approximation
    /// is fine at market-session granularity.
    fn eastern_offset_hours(date: NaiveDate) -> i64 {
        let year = date.year();
        let dst_start = nth_weekday(year, 3, Weekday::Sun, 2);
        let dst_end = nth_weekday(year, 11, Weekday::Sun, 1);
        if date >= dst_start && date < dst_end {
            -4
        } else {
            -5
        }
    }

    pub fn to_eastern(&self, now: DateTime<Utc>) -> NaiveDateTime {
        // offset determined by the tentative eastern date to handle the
        // late-evening UTC boundary
        let tentative = now.naive_utc() - Duration::hours(5);
        let offset = Self::eastern_offset_hours(tentative.date());
        now.naive_utc() + Duration::hours(offset)
    }

    /// The trading date a wall-clock instant belongs to (Eastern date).
    pub fn trading_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.to_eastern(now).date()
    }

    pub fn session_close_time(&self, date: NaiveDate) -> NaiveTime {
        if self.is_early_close(date) {
            NaiveTime::from_hms_opt(13, 0, 0).expect("valid time")
        } else {
            NaiveTime::from_hms_opt(16, 0, 0).expect("valid time")
        }
    }

    pub fn session_at(&self, now: DateTime<Utc>) -> Session {
        let eastern = self.to_eastern(now);
        let date = eastern.date();
        if !self.is_trading_day(date) {
            return Session::Closed;
        }
        let t = eastern.time();
        let open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
        let pre = NaiveTime::from_hms_opt(8, 0, 0).expect("valid time");
        let close = self.session_close_time(date);
        if t >= open && t < close {
            Session::Regular
        } else if t >= pre && t < open {
            Session::PreMarket
        } else {
            Session::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> MarketCalendar {
        MarketCalendar
    }

    #[test]
    fn weekends_closed() {
        // 2025-07-12 is a Saturday
        assert!(!cal().is_trading_day(NaiveDate::from_ymd_opt(2025, 7, 12).unwrap()));
        assert!(cal().is_trading_day(NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()));
    }

    #[test]
    fn known_holidays_2025() {
        let c = cal();
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())); // New Year
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 1, 20).unwrap())); // MLK
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 4, 18).unwrap())); // Good Friday
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 5, 26).unwrap())); // Memorial
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 6, 19).unwrap())); // Juneteenth
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 7, 4).unwrap())); // July 4
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap())); // Labor Day
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 11, 27).unwrap())); // Thanksgiving
        assert!(!c.is_trading_day(NaiveDate::from_ymd_opt(2025, 12, 25).unwrap())); // Christmas
    }

    #[test]
    fn observed_holiday_shift() {
        // July 4th 2026 is a Saturday; observed Friday July 3rd
        assert!(!cal().is_trading_day(NaiveDate::from_ymd_opt(2026, 7, 3).unwrap()));
        assert!(cal().is_trading_day(NaiveDate::from_ymd_opt(2026, 7, 6).unwrap()));
    }

    #[test]
    fn early_closes() {
        let c = cal();
        // day after Thanksgiving 2025
        assert!(c.is_early_close(NaiveDate::from_ymd_opt(2025, 11, 28).unwrap()));
        assert!(c.is_early_close(NaiveDate::from_ymd_opt(2025, 12, 24).unwrap()));
        assert!(!c.is_early_close(NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()));
        assert_eq!(
            c.session_close_time(NaiveDate::from_ymd_opt(2025, 11, 28).unwrap()),
            NaiveTime::from_hms_opt(13, 0, 0).unwrap()
        );
    }

    #[test]
    fn session_boundaries_summer() {
        let c = cal();
        // 2025-07-14 is a Monday, EDT (UTC-4): 13:30 UTC = 09:30 ET
        let open = DateTime::parse_from_rfc3339("2025-07-14T13:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(c.session_at(open), Session::Regular);

        let pre = DateTime::parse_from_rfc3339("2025-07-14T13:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(c.session_at(pre), Session::PreMarket);

        let after = DateTime::parse_from_rfc3339("2025-07-14T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(c.session_at(after), Session::Closed);
    }

    #[test]
    fn session_boundaries_winter() {
        let c = cal();
        // 2025-12-15 is a Monday, EST (UTC-5): 14:30 UTC = 09:30 ET
        let open = DateTime::parse_from_rfc3339("2025-12-15T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(c.session_at(open), Session::Regular);
        let before = DateTime::parse_from_rfc3339("2025-12-15T14:29:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(c.session_at(before), Session::PreMarket);
    }

    #[test]
    fn trading_date_crosses_utc_midnight() {
        let c = cal();
        // 01:00 UTC is the prior evening in New York
        let late = DateTime::parse_from_rfc3339("2025-07-15T01:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            c.trading_date(late),
            NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()
        );
    }
}
