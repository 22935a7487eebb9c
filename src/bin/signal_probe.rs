//! Evaluate the reversal signal on live public candles and print the tail
//! of the indicator trace.
//!
//! Usage: signal_probe [bars_to_show]

use anyhow::Result;

use bulls_dca::exchange::bybit::BybitClient;
use bulls_dca::exchange::retry::{retry_async, RetryConfig};
use bulls_dca::exchange::Venue;
use bulls_dca::indicators::{bulls_signal, bulls_trace, closed_candles, BullsParams, SignalMark};
use bulls_dca::state::{now_ms, Config};

fn mark_str(m: SignalMark) -> &'static str {
    match m {
        SignalMark::Long => "LONG",
        SignalMark::Short => "SHORT",
        SignalMark::None => "-",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let show: usize = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(10);
    let cfg = Config::from_env();
    let client = BybitClient::new(&cfg, None);
    let retry = RetryConfig::from_config(&cfg);

    let mut candles = {
        let client = &client;
        let symbol = cfg.symbol.as_str();
        let (interval, limit) = (cfg.kline_interval, cfg.kline_limit);
        retry_async(&retry, "candles", move || client.candles(symbol, interval, limit)).await?
    };
    candles.sort_by_key(|c| c.ts);
    let closed = closed_candles(&candles, now_ms(), cfg.kline_interval_ms());
    let params = BullsParams::from_config(&cfg);

    println!(
        "{} {}m: {} candles fetched, {} closed (need {})",
        cfg.symbol,
        cfg.kline_interval,
        candles.len(),
        closed.len(),
        params.min_candles()
    );

    let sig = bulls_signal(closed, &params);
    println!(
        "signal: long={} short={} fresh_long={} fresh_short={} (latch={})",
        sig.long, sig.short, sig.fresh_long, sig.fresh_short, params.latch
    );

    let trace = bulls_trace(closed, &params);
    let start = closed.len().saturating_sub(show);
    println!();
    println!("{:>14} {:>10} {:>5} {:>5} {:>6} {:>6} {:>6}", "open_ms", "close", "bull", "bear", "fired", "bar", "latch");
    for i in start..closed.len() {
        println!(
            "{:>14} {:>10.5} {:>5} {:>5} {:>6} {:>6} {:>6}",
            closed[i].ts,
            closed[i].c,
            trace.bull_count[i],
            trace.bear_count[i],
            mark_str(trace.fired[i]),
            mark_str(trace.bar_marks[i]),
            mark_str(trace.latched[i]),
        );
    }
    Ok(())
}
