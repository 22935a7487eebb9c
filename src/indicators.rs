//! Trend-exhaustion reversal indicator over hourly candles.
//!
//! Two counters track how many bars closed above (bull) or below (bear) the
//! close four bars earlier. A long run of higher closes that ends with a red
//! bar printing a new `length`-bar high fires a short reversal; the mirror
//! fires a long reversal. Firing resets the counter that triggered it.
//!
//! Everything is recomputed from the full series on each call.

use crate::exchange::Candle;

/// Bars between the compared closes.
const OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BullsParams {
    /// Lookback for the rolling highest high / lowest low.
    pub length: usize,
    /// Counter must exceed this before a reversal can fire.
    pub bars: usize,
    /// Carry the last reversal forward (true) or look at the last bar only.
    pub latch: bool,
}

impl Default for BullsParams {
    fn default() -> Self {
        Self { length: 50, bars: 30, latch: true }
    }
}

impl BullsParams {
    pub fn from_config(cfg: &crate::state::Config) -> Self {
        Self { length: cfg.bulls_length, bars: cfg.bulls_bars, latch: cfg.signal_latch }
    }

    /// Fewer candles than this yields no signal.
    pub fn min_candles(&self) -> usize {
        self.length.max(self.bars + 5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalMark {
    Long,
    Short,
    #[default]
    None,
}

/// Evaluated signal on the last closed candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BullsSignal {
    pub long: bool,
    pub short: bool,
    pub fresh_long: bool,
    pub fresh_short: bool,
}

impl BullsSignal {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.long || self.short
    }
}

/// Per-bar indicator trace, useful for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct BullsTrace {
    pub bull_count: Vec<usize>,
    pub bear_count: Vec<usize>,
    /// Reversal that fired on each bar.
    pub fired: Vec<SignalMark>,
    /// Marks as evaluated from post-reset counters (last-bar mode).
    pub bar_marks: Vec<SignalMark>,
    /// Most recent fired reversal carried forward.
    pub latched: Vec<SignalMark>,
}

fn rolling_extremes(candles: &[Candle], length: usize) -> (Vec<f64>, Vec<f64>) {
    let window = length.max(1);
    let mut highest = Vec::with_capacity(candles.len());
    let mut lowest = Vec::with_capacity(candles.len());
    for i in 0..candles.len() {
        let start = (i + 1).saturating_sub(window);
        let slice = &candles[start..=i];
        highest.push(slice.iter().map(|c| c.h).fold(f64::NEG_INFINITY, f64::max));
        lowest.push(slice.iter().map(|c| c.l).fold(f64::INFINITY, f64::min));
    }
    (highest, lowest)
}

/// Run the counters across the whole series.
pub fn bulls_trace(candles: &[Candle], params: &BullsParams) -> BullsTrace {
    let n = candles.len();
    let (highest, lowest) = rolling_extremes(candles, params.length);
    let mut t = BullsTrace {
        bull_count: vec![0; n],
        bear_count: vec![0; n],
        fired: vec![SignalMark::None; n],
        bar_marks: vec![SignalMark::None; n],
        latched: vec![SignalMark::None; n],
    };

    for i in 0..n {
        let c = &candles[i];
        let (mut bull, mut bear) = if i >= 1 {
            (t.bull_count[i - 1], t.bear_count[i - 1])
        } else {
            (0, 0)
        };
        if i >= OFFSET {
            let prev = candles[i - OFFSET].c;
            if c.c > prev {
                bull += 1;
            }
            if c.c < prev {
                bear += 1;
            }
        }

        // both checks read the counters as they stand after this bar's increment
        let cond_short = bull > params.bars && c.c < c.o && c.h >= highest[i];
        let cond_long = bear > params.bars && c.c > c.o && c.l <= lowest[i];
        if cond_short {
            bull = 0;
            t.fired[i] = SignalMark::Short;
        }
        if cond_long {
            bear = 0;
            if t.fired[i] == SignalMark::None {
                t.fired[i] = SignalMark::Long;
            }
        }
        t.bull_count[i] = bull;
        t.bear_count[i] = bear;

        t.bar_marks[i] = if bear == 0 && c.c > c.o && c.l <= lowest[i] {
            SignalMark::Long
        } else if bull == 0 && c.c < c.o && c.h >= highest[i] {
            SignalMark::Short
        } else {
            SignalMark::None
        };

        t.latched[i] = match t.fired[i] {
            SignalMark::None if i >= 1 => t.latched[i - 1],
            mark => mark,
        };
    }
    t
}

/// Evaluate the reversal signal on the last candle of an ascending series.
///
/// Short series return `BullsSignal::none()`.
pub fn bulls_signal(candles: &[Candle], params: &BullsParams) -> BullsSignal {
    let n = candles.len();
    if n < params.min_candles() || n < 2 {
        return BullsSignal::none();
    }
    let trace = bulls_trace(candles, params);
    if params.latch {
        // a reversal firing on the last bar is new even when the previous
        // latched reversal pointed the same way
        let last = trace.latched[n - 1];
        let fired = trace.fired[n - 1];
        return BullsSignal {
            long: last == SignalMark::Long,
            short: last == SignalMark::Short,
            fresh_long: fired == SignalMark::Long,
            fresh_short: fired == SignalMark::Short,
        };
    }
    let (last, prev) = (trace.bar_marks[n - 1], trace.bar_marks[n - 2]);
    let long = last == SignalMark::Long;
    let short = last == SignalMark::Short;
    BullsSignal {
        long,
        short,
        fresh_long: long && prev != SignalMark::Long,
        fresh_short: short && prev != SignalMark::Short,
    }
}

/// Drop candles that are still forming at `now_ms`.
pub fn closed_candles(candles: &[Candle], now_ms: u64, interval_ms: u64) -> &[Candle] {
    let mut end = candles.len();
    while end > 0 && candles[end - 1].ts.saturating_add(interval_ms) > now_ms {
        end -= 1;
    }
    &candles[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000;

    fn bar(i: usize, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle { ts: i as u64 * HOUR, o, h, l, c, v: 1.0 }
    }

    /// `n` green bars each closing one unit higher.
    fn uptrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 100.0 + i as f64;
                bar(i, c - 0.5, c + 0.5, c - 1.0, c)
            })
            .collect()
    }

    fn downtrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 200.0 - i as f64;
                bar(i, c + 0.5, c + 1.0, c - 0.5, c)
            })
            .collect()
    }

    #[test]
    fn test_short_series_has_no_signal() {
        let p = BullsParams::default();
        assert_eq!(bulls_signal(&[], &p), BullsSignal::none());
        assert_eq!(bulls_signal(&uptrend(49), &p), BullsSignal::none());
    }

    #[test]
    fn test_counters_accumulate_from_offset() {
        let t = bulls_trace(&uptrend(10), &BullsParams::default());
        assert_eq!(t.bull_count[3], 0);
        assert_eq!(t.bull_count[4], 1);
        assert_eq!(t.bull_count[9], 6);
        assert!(t.bear_count.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhausted_uptrend_fires_fresh_short() {
        let mut candles = uptrend(60);
        // red bar printing a new high after a long run of higher closes
        candles.push(bar(60, 160.5, 162.0, 159.0, 159.7));
        let p = BullsParams::default();
        let sig = bulls_signal(&candles, &p);
        assert!(sig.short && sig.fresh_short);
        assert!(!sig.long && !sig.fresh_long);

        let t = bulls_trace(&candles, &p);
        assert_eq!(t.fired[60], SignalMark::Short);
        assert_eq!(t.bull_count[60], 0);
    }

    #[test]
    fn test_exhausted_downtrend_fires_fresh_long() {
        let mut candles = downtrend(60);
        candles.push(bar(60, 139.5, 141.0, 138.0, 140.6));
        let sig = bulls_signal(&candles, &BullsParams::default());
        assert!(sig.long && sig.fresh_long);
        assert!(!sig.short);
    }

    #[test]
    fn test_latched_signal_persists_but_is_not_fresh() {
        let mut candles = uptrend(60);
        candles.push(bar(60, 160.5, 162.0, 159.0, 159.7));
        candles.push(bar(61, 159.7, 160.0, 159.0, 159.8));
        let latched = bulls_signal(&candles, &BullsParams::default());
        assert!(latched.short);
        assert!(!latched.fresh_short);

        let bar_only = bulls_signal(&candles, &BullsParams { latch: false, ..Default::default() });
        assert!(!bar_only.short);
    }

    /// Two short reversals 41 bars apart with an uptrend in between.
    fn repeated_short_reversal() -> Vec<Candle> {
        let mut candles = uptrend(101);
        candles[60] = bar(60, 160.5, 162.0, 159.0, 159.7);
        candles.push(bar(101, 201.5, 203.0, 200.0, 200.7));
        candles
    }

    #[test]
    fn test_repeated_reversal_is_fresh_again() {
        let candles = repeated_short_reversal();
        let p = BullsParams::default();
        let t = bulls_trace(&candles, &p);
        assert_eq!(t.fired[60], SignalMark::Short);
        assert_eq!(t.fired[100], SignalMark::None);
        assert_eq!(t.latched[100], SignalMark::Short);
        assert_eq!(t.fired[101], SignalMark::Short);

        let sig = bulls_signal(&candles, &p);
        assert!(sig.short && sig.fresh_short);
        assert!(!sig.long && !sig.fresh_long);

        let bar_only = bulls_signal(&candles, &BullsParams { latch: false, ..p });
        assert!(bar_only.short && bar_only.fresh_short);

        // the bar before the second reversal still carries the first, stale
        let before = bulls_signal(&candles[..101], &p);
        assert!(before.short && !before.fresh_short);
    }

    #[test]
    fn test_green_bar_does_not_fire_short() {
        let mut candles = uptrend(60);
        candles.push(bar(60, 159.0, 162.0, 158.5, 160.5));
        let sig = bulls_signal(&candles, &BullsParams::default());
        assert!(!sig.short && !sig.long);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut candles = uptrend(60);
        candles.push(bar(60, 160.5, 162.0, 159.0, 159.7));
        let p = BullsParams::default();
        let a = bulls_trace(&candles, &p);
        let b = bulls_trace(&candles, &p);
        assert_eq!(a.fired, b.fired);
        assert_eq!(a.bull_count, b.bull_count);
        assert_eq!(bulls_signal(&candles, &p), bulls_signal(&candles, &p));
    }

    #[test]
    fn test_closed_candles_drops_forming_bar() {
        let candles = uptrend(3);
        let now = 2 * HOUR + HOUR / 2;
        assert_eq!(closed_candles(&candles, now, HOUR).len(), 2);
        assert_eq!(closed_candles(&candles, 3 * HOUR, HOUR).len(), 3);
    }
}
