//! Business-day and market-timezone helpers.
//!
//! `MARKET_TIMEZONE` (default `Asia/Seoul`) is consulted everywhere a
//! date-boundary decision is made: the chart engine's past-case cutoff, the
//! flow engine's EOD lookback, and the vector store's `daily_news` purge.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Resolve the configured market timezone, falling back to Asia/Seoul on any
/// parse failure (an unrecognized `MARKET_TIMEZONE` value is a config typo,
/// not a reason to crash a worker).
pub fn market_tz(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::Asia::Seoul)
}

pub fn now_in_market_tz(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Step `date` backward by `n` business days (weekends skipped, holidays not
/// modeled — no holiday calendar is an external collaborator under this
/// spec). Used for the chart engine's past-case cutoff and the flow
/// engine's 5-day institutional lookback.
pub fn subtract_business_days(date: NaiveDate, n: u32) -> NaiveDate {
    let mut d = date;
    let mut remaining = n;
    while remaining > 0 {
        d -= Duration::days(1);
        if is_business_day(d) {
            remaining -= 1;
        }
    }
    d
}

/// Most recent `n` business days up to and including `reference_date`,
/// oldest first. Never includes a day after `reference_date` — the flow
/// engine's ordering invariant depends on this.
pub fn recent_business_days(reference_date: NaiveDate, n: u32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n as usize);
    let mut d = reference_date;
    while days.len() < n as usize {
        if is_business_day(d) {
            days.push(d);
        }
        d -= Duration::days(1);
    }
    days.reverse();
    days
}

pub fn is_market_close_window(
    now: DateTime<Tz>,
    close_hour: u32,
    close_minute: u32,
    window_minutes: u32,
) -> bool {
    let close = now.date_naive().and_hms_opt(close_hour, close_minute, 0).unwrap();
    let close = Tz::from_local_datetime(&now.timezone(), &close)
        .single()
        .unwrap_or(now);
    let end = close + Duration::minutes(window_minutes as i64);
    now >= close && now < end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_weekends_going_backward() {
        // 2024-01-08 is a Monday; 5 business days back lands on 2024-01-01 (Monday).
        let monday = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let back5 = subtract_business_days(monday, 5);
        assert_eq!(back5, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn recent_business_days_excludes_future_and_weekends() {
        let saturday = NaiveDate::from_ymd_opt(2024, 1, 13).unwrap();
        let days = recent_business_days(saturday, 5);
        assert_eq!(days.len(), 5);
        assert!(days.iter().all(|d| is_business_day(*d)));
        assert!(days.iter().all(|d| *d <= saturday));
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }
}
