//! Process configuration and clock helpers.
//!
//! `Config` is read from the environment exactly once at startup and then
//! passed to every component. Nothing below the bootstrap reads env vars.

use anyhow::{bail, Result};

/// Longest sleep between cycles.
pub const MAX_POLL_SECS: f64 = 3600.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub category: String,
    pub bybit_base: String,
    pub recv_window_ms: u64,
    pub poll_secs: f64,
    pub equity_usdt: f64,
    pub use_cross: bool,
    pub leverage: f64,
    pub tp_pct: f64,
    pub max_dca: u32,
    pub vol_scale_long: f64,
    pub vol_scale_short: f64,
    /// Adverse step for long adds, as a percentage.
    pub long_step_pct: f64,
    /// Adverse step for short adds, as a percentage.
    pub short_step_pct: f64,
    pub flip_buffer_pct: f64,
    pub min_profit_usd: f64,
    pub use_emergency_sl: bool,
    pub emergency_sl_pct: f64,
    pub reseed_immediately: bool,
    pub seed_fresh_only: bool,
    pub taker_fee: f64,
    pub maker_fee: f64,
    pub bulls_length: usize,
    pub bulls_bars: usize,
    /// Candle interval in minutes.
    pub kline_interval: u64,
    pub kline_limit: usize,
    pub signal_latch: bool,
    pub retry_tries: u32,
    pub retry_base_ms: u64,
    /// Fraction of each backoff delay drawn at random either way.
    pub retry_jitter: f64,
    pub journal_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "ADAUSDT".to_string(),
            category: "linear".to_string(),
            bybit_base: "https://api.bybit.com".to_string(),
            recv_window_ms: 60_000,
            poll_secs: 3.0,
            equity_usdt: 150.0,
            use_cross: false,
            leverage: 10.0,
            tp_pct: 1.0,
            max_dca: 5,
            vol_scale_long: 1.18,
            vol_scale_short: 1.15,
            long_step_pct: 11.05,
            short_step_pct: 8.61,
            flip_buffer_pct: 0.5,
            min_profit_usd: 0.0,
            use_emergency_sl: false,
            emergency_sl_pct: 6.0,
            reseed_immediately: true,
            seed_fresh_only: false,
            taker_fee: 0.0006,
            maker_fee: 0.0002,
            bulls_length: 50,
            bulls_bars: 30,
            kline_interval: 60,
            kline_limit: 200,
            signal_latch: true,
            retry_tries: 5,
            retry_base_ms: 1200,
            retry_jitter: 0.0,
            journal_path: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Non-finite values fall back to the default.
fn env_f64(key: &str, default: f64) -> f64 {
    let v = env_parse(key, default);
    if v.is_finite() {
        v
    } else {
        default
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            symbol: env_string("SYMBOL", &d.symbol),
            category: env_string("CATEGORY", &d.category),
            bybit_base: env_string("BYBIT_BASE", &d.bybit_base),
            recv_window_ms: env_parse("RECV_WINDOW", d.recv_window_ms),
            poll_secs: env_f64("POLL_SEC", d.poll_secs),
            equity_usdt: env_f64("EQUITY_USDT", d.equity_usdt),
            use_cross: env_bool("USE_CROSS", d.use_cross),
            leverage: env_f64("LEVERAGE_X", d.leverage),
            tp_pct: env_f64("TP_PCT", d.tp_pct),
            max_dca: env_parse("MAX_DCA", d.max_dca),
            vol_scale_long: env_f64("VOL_SCALE_LONG", d.vol_scale_long),
            vol_scale_short: env_f64("VOL_SCALE_SHORT", d.vol_scale_short),
            long_step_pct: env_f64("FIT_LONG_STEP", d.long_step_pct),
            short_step_pct: env_f64("FIT_SHORT_STEP", d.short_step_pct),
            flip_buffer_pct: env_f64("FLIP_BUFFER_PCT", d.flip_buffer_pct),
            min_profit_usd: env_f64("MIN_PROFIT_USD", d.min_profit_usd),
            use_emergency_sl: env_bool("USE_EMERGENCY_SL", d.use_emergency_sl),
            emergency_sl_pct: env_f64("EMERGENCY_SL_PCT", d.emergency_sl_pct),
            reseed_immediately: env_bool("RESEED_IMMEDIATELY", d.reseed_immediately),
            seed_fresh_only: env_bool("SEED_FRESH_ONLY", d.seed_fresh_only),
            taker_fee: env_f64("TAKER_FEE", d.taker_fee),
            maker_fee: env_f64("MAKER_FEE", d.maker_fee),
            bulls_length: env_parse("BULLS_LENGTH", d.bulls_length),
            bulls_bars: env_parse("BULLS_BARS", d.bulls_bars),
            kline_interval: env_parse("KLINE_INTERVAL", d.kline_interval),
            kline_limit: env_parse("KLINE_LIMIT", d.kline_limit),
            signal_latch: env_bool("SIGNAL_LATCH", d.signal_latch),
            retry_tries: env_parse("RETRY_TRIES", d.retry_tries),
            retry_base_ms: env_parse("RETRY_BASE_MS", d.retry_base_ms),
            retry_jitter: env_f64("RETRY_JITTER", d.retry_jitter),
            journal_path: std::env::var("JOURNAL_PATH").ok().filter(|p| !p.trim().is_empty()),
        }
    }

    /// Notional available to one position over its whole DCA ladder.
    pub fn total_budget(&self) -> f64 {
        self.equity_usdt * if self.use_cross { self.leverage } else { 1.0 }
    }

    pub fn kline_interval_ms(&self) -> u64 {
        self.kline_interval.saturating_mul(60_000)
    }

    /// Sleep between cycles, clamped to `[0, MAX_POLL_SECS]`.
    pub fn poll_interval(&self) -> std::time::Duration {
        let secs = if self.poll_secs.is_nan() { 0.0 } else { self.poll_secs.clamp(0.0, MAX_POLL_SECS) };
        std::time::Duration::from_secs_f64(secs)
    }
}

/// API credentials. Kept apart from `Config` so the config can be logged.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let pick = |primary: &str, fallback: &str| {
            std::env::var(primary)
                .ok()
                .or_else(|| std::env::var(fallback).ok())
                .filter(|v| !v.trim().is_empty())
        };
        match (pick("BYBIT_API_KEY", "API_KEY"), pick("BYBIT_API_SECRET", "API_SECRET")) {
            (Some(api_key), Some(api_secret)) => Ok(Self { api_key, api_secret }),
            _ => bail!("set BYBIT_API_KEY/BYBIT_API_SECRET (or API_KEY/API_SECRET)"),
        }
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
