use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub mod bybit;
pub mod paper;
pub mod retry;
pub mod signing;

/// One OHLC bar. `ts` is the bar open time in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ticker {
    pub last: f64,
    pub mark: f64,
}

impl Ticker {
    /// Working price used by every decision in a cycle.
    pub fn mid(&self) -> f64 {
        (self.last + self.mark) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentFilters {
    pub qty_step: f64,
    pub min_qty: f64,
    pub price_tick: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
}

/// Result of an idempotent setup call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Applied,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct LimitOrder<'a> {
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
    pub reduce_only: bool,
    pub post_only: bool,
    pub link_id: &'a str,
}

/// Venue connectivity needed by the engine. Every call may fail; the engine
/// wraps each one in `retry::retry_async`.
#[async_trait]
pub trait Venue: Send + Sync {
    async fn instrument_filters(&self, symbol: &str) -> Result<InstrumentFilters>;
    async fn set_position_mode(&self, symbol: &str, one_way: bool) -> Result<SetupOutcome>;
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<SetupOutcome>;
    async fn ticker(&self, symbol: &str) -> Result<Ticker>;
    /// Candles sorted ascending by open time.
    async fn candles(&self, symbol: &str, interval_min: u64, limit: usize) -> Result<Vec<Candle>>;
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<OrderAck>;
    async fn place_limit_order(&self, symbol: &str, order: LimitOrder<'_>) -> Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;
    /// Absolute size of the open position, zero when flat.
    async fn open_position_size(&self, symbol: &str) -> Result<f64>;
}
