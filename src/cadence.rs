//! Local cadence gate consulted by each analysis worker's `/check-schedule`
//! handler (spec.md §4.10): the scheduler only pings, every worker decides
//! for itself whether its own window has arrived.

use crate::config::Cadence;
use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub struct CadenceGate {
    cadence: Cadence,
    market_tz: Tz,
    market_close: (u32, u32),
    window_minutes: u32,
    last_run: Mutex<Option<Instant>>,
    last_run_date: Mutex<Option<chrono::NaiveDate>>,
}

impl CadenceGate {
    pub fn new(cadence: Cadence, market_tz: Tz, market_close: (u32, u32), window_minutes: u32) -> Self {
        Self {
            cadence,
            market_tz,
            market_close,
            window_minutes,
            last_run: Mutex::new(None),
            last_run_date: Mutex::new(None),
        }
    }

    fn in_close_window(&self) -> (bool, chrono::NaiveDate) {
        let now_local = chrono::Utc::now().with_timezone(&self.market_tz);
        let (h, m) = self.market_close;
        let close_minutes = h * 60 + m;
        let now_minutes = now_local.hour() * 60 + now_local.minute();
        let in_window = now_minutes >= close_minutes && now_minutes < close_minutes + self.window_minutes;
        (in_window, now_local.date_naive())
    }

    /// True exactly once per due window; false on every other call within
    /// that same window so a worker polled several times an hour doesn't
    /// run its pass repeatedly.
    pub fn take_if_due(&self) -> bool {
        match self.cadence {
            Cadence::Hourly => {
                let mut last = self.last_run.lock();
                let now = Instant::now();
                let due = last.map(|t| now.duration_since(t) >= Duration::from_secs(3600)).unwrap_or(true);
                if due {
                    *last = Some(now);
                }
                due
            }
            Cadence::MarketClose => {
                let (in_window, today) = self.in_close_window();
                if !in_window {
                    return false;
                }
                let mut last_date = self.last_run_date.lock();
                let due = *last_date != Some(today);
                if due {
                    *last_date = Some(today);
                }
                due
            }
            Cadence::Weekly => {
                let now_local = chrono::Utc::now().with_timezone(&self.market_tz);
                if now_local.weekday() != chrono::Weekday::Fri {
                    return false;
                }
                let (in_window, today) = self.in_close_window();
                if !in_window {
                    return false;
                }
                let mut last_date = self.last_run_date.lock();
                let due = *last_date != Some(today);
                if due {
                    *last_date = Some(today);
                }
                due
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hourly_gate_fires_once_then_waits() {
        let gate = CadenceGate::new(Cadence::Hourly, chrono_tz::Asia::Seoul, (15, 30), 30);
        assert!(gate.take_if_due());
        assert!(!gate.take_if_due());
    }
}
