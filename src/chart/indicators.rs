//! Rolling indicator windows for the chart condition engine.
//!
//! Each stock gets one `IndicatorState`, updated tick-by-tick. Bootstrap
//! behavior follows spec.md §4.7: NaN values are forward-filled, then
//! back-filled, then zero-filled so every comparison is well-defined even
//! before the warmup period completes; firings themselves stay suppressed
//! until at least 26 observations have been seen (MACD's slow EMA length).

use std::collections::VecDeque;

const MA_SHORT: usize = 5;
const MA_LONG: usize = 20;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STDDEV: f64 = 2.0;
const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const VOLUME_MA_PERIOD: usize = 5;
const HIGH_LOW_PERIOD: usize = 20;
pub const MIN_OBSERVATIONS_FOR_MACD: usize = 26;

#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub price: f64,
    pub volume: f64,
    pub ma5: f64,
    pub ma20: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub volume_ma5: f64,
    pub rolling_high_20: f64,
    pub rolling_low_20: f64,
}

/// Wilder's RSI smoothing state: running averages of gains/losses rather
/// than a plain windowed mean.
#[derive(Debug, Clone, Default)]
struct RsiState {
    avg_gain: f64,
    avg_loss: f64,
    initialized: bool,
}

impl RsiState {
    fn update(&mut self, delta: f64) -> f64 {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        if !self.initialized {
            self.avg_gain = gain;
            self.avg_loss = loss;
            self.initialized = true;
        } else {
            let n = RSI_PERIOD as f64;
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }
        if self.avg_loss == 0.0 {
            return 100.0;
        }
        let rs = self.avg_gain / self.avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}

#[derive(Debug, Clone, Default)]
struct Ema {
    value: Option<f64>,
    period: usize,
}

impl Ema {
    fn new(period: usize) -> Self {
        Self { value: None, period }
    }

    fn update(&mut self, x: f64) -> f64 {
        let alpha = 2.0 / (self.period as f64 + 1.0);
        let v = match self.value {
            Some(prev) => alpha * x + (1.0 - alpha) * prev,
            None => x,
        };
        self.value = Some(v);
        v
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorState {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    rsi_state: RsiState,
    last_price: Option<f64>,
    ema_fast: Ema,
    ema_slow: Ema,
    macd_signal_ema: Ema,
    observations: usize,
    pub last_snapshot: Option<Snapshot>,
}

impl Default for IndicatorState {
    fn default() -> Self {
        Self {
            prices: VecDeque::with_capacity(HIGH_LOW_PERIOD.max(BOLLINGER_PERIOD) + 1),
            volumes: VecDeque::with_capacity(VOLUME_MA_PERIOD + 1),
            rsi_state: RsiState::default(),
            last_price: None,
            ema_fast: Ema::new(MACD_FAST),
            ema_slow: Ema::new(MACD_SLOW),
            macd_signal_ema: Ema::new(MACD_SIGNAL),
            observations: 0,
            last_snapshot: None,
        }
    }
}

fn mean(values: impl Iterator<Item = f64> + Clone, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    values.take(n).sum::<f64>() / n as f64
}

fn fill_nan(value: f64, fallback_forward: Option<f64>) -> f64 {
    if value.is_nan() {
        fallback_forward.unwrap_or(0.0)
    } else {
        value
    }
}

impl IndicatorState {
    /// Consume one realtime tick; returns the previous snapshot (for
    /// crossover comparisons) and the freshly-computed current snapshot.
    /// Firings based on the current snapshot are only meaningful once
    /// `observations >= MIN_OBSERVATIONS_FOR_MACD` — the caller checks that.
    pub fn push(&mut self, price: f64, volume: f64) -> (Option<Snapshot>, Snapshot) {
        let prev = self.last_snapshot;
        self.observations += 1;

        self.prices.push_back(price);
        if self.prices.len() > BOLLINGER_PERIOD.max(HIGH_LOW_PERIOD) {
            self.prices.pop_front();
        }
        self.volumes.push_back(volume);
        if self.volumes.len() > VOLUME_MA_PERIOD {
            self.volumes.pop_front();
        }

        let ma5 = mean(self.prices.iter().rev().copied(), MA_SHORT.min(self.prices.len()));
        let ma20 = mean(self.prices.iter().rev().copied(), MA_LONG.min(self.prices.len()));

        let bb_n = BOLLINGER_PERIOD.min(self.prices.len());
        let bb_mid = mean(self.prices.iter().rev().copied(), bb_n);
        let variance = if bb_n > 0 {
            self.prices.iter().rev().take(bb_n).map(|p| (p - bb_mid).powi(2)).sum::<f64>() / bb_n as f64
        } else {
            0.0
        };
        let std_dev = variance.sqrt();
        let bb_upper = bb_mid + BOLLINGER_STDDEV * std_dev;
        let bb_lower = bb_mid - BOLLINGER_STDDEV * std_dev;

        let rsi = match self.last_price {
            Some(last) => self.rsi_state.update(price - last),
            None => 50.0,
        };
        self.last_price = Some(price);

        let fast = self.ema_fast.update(price);
        let slow = self.ema_slow.update(price);
        let macd = fast - slow;
        let macd_signal = self.macd_signal_ema.update(macd);

        let volume_ma5 = mean(self.volumes.iter().rev().copied(), self.volumes.len());

        let hl_n = HIGH_LOW_PERIOD.min(self.prices.len());
        let rolling_high_20 = self.prices.iter().rev().take(hl_n).cloned().fold(f64::MIN, f64::max);
        let rolling_low_20 = self.prices.iter().rev().take(hl_n).cloned().fold(f64::MAX, f64::min);

        let prev_close_or_price = prev.map(|s| s.price).unwrap_or(price);
        let snapshot = Snapshot {
            price,
            volume,
            ma5: fill_nan(ma5, Some(prev_close_or_price)),
            ma20: fill_nan(ma20, Some(prev_close_or_price)),
            bb_upper: fill_nan(bb_upper, Some(prev_close_or_price)),
            bb_middle: fill_nan(bb_mid, Some(prev_close_or_price)),
            bb_lower: fill_nan(bb_lower, Some(prev_close_or_price)),
            rsi: fill_nan(rsi, Some(50.0)),
            macd: fill_nan(macd, Some(0.0)),
            macd_signal: fill_nan(macd_signal, Some(0.0)),
            volume_ma5: fill_nan(volume_ma5, Some(volume)),
            rolling_high_20: fill_nan(rolling_high_20, Some(price)),
            rolling_low_20: fill_nan(rolling_low_20, Some(price)),
        };
        self.last_snapshot = Some(snapshot);
        (prev, snapshot)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.observations >= MIN_OBSERVATIONS_FOR_MACD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_26_ticks_is_not_bootstrapped() {
        let mut state = IndicatorState::default();
        for i in 0..25 {
            state.push(100.0 + i as f64, 1000.0);
        }
        assert!(!state.is_bootstrapped());
        state.push(126.0, 1000.0);
        assert!(state.is_bootstrapped());
    }

    #[test]
    fn ma5_tracks_recent_average() {
        let mut state = IndicatorState::default();
        let mut last = Snapshot::default();
        for p in [10.0, 10.0, 10.0, 10.0, 20.0] {
            let (_, cur) = state.push(p, 1000.0);
            last = cur;
        }
        // last 5 prices: 10,10,10,10,20 -> mean 12
        assert!((last.ma5 - 12.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_is_bounded() {
        let mut state = IndicatorState::default();
        let mut last = Snapshot::default();
        for i in 0..40 {
            let (_, cur) = state.push(100.0 + i as f64, 1000.0);
            last = cur;
        }
        assert!(last.rsi >= 0.0 && last.rsi <= 100.0);
    }
}
