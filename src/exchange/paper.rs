//! In-memory venue with scripted market data.
//!
//! Market orders fill immediately against the signed position. Limit orders
//! rest until `fill_take_profit` fills them. Failures can be queued per call
//! family to exercise retry and cycle-abort paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::exchange::{
    Candle, InstrumentFilters, LimitOrder, OrderAck, OrderSide, SetupOutcome, Ticker, Venue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VenueCall {
    Filters,
    Setup,
    Ticker,
    Candles,
    MarketOrder,
    LimitOrder,
    Cancel,
    Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperOrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub order_id: String,
    pub link_id: String,
    pub order_type: PaperOrderType,
    pub side: OrderSide,
    pub qty: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
}

#[derive(Debug)]
struct Book {
    filters: InstrumentFilters,
    ticker: Ticker,
    candles: Vec<Candle>,
    /// Signed: positive long, negative short.
    position: f64,
    orders: Vec<PaperOrder>,
    resting: Vec<PaperOrder>,
    cancels: Vec<String>,
    setup_calls: u32,
    setup_outcome: SetupOutcome,
    failures: HashMap<VenueCall, u32>,
    calls: HashMap<VenueCall, u32>,
    next_id: u64,
}

#[derive(Debug)]
pub struct PaperVenue {
    book: Mutex<Book>,
}

impl PaperVenue {
    pub fn new(filters: InstrumentFilters) -> Self {
        Self {
            book: Mutex::new(Book {
                filters,
                ticker: Ticker { last: 1.0, mark: 1.0 },
                candles: Vec::new(),
                position: 0.0,
                orders: Vec::new(),
                resting: Vec::new(),
                cancels: Vec::new(),
                setup_calls: 0,
                setup_outcome: SetupOutcome::Applied,
                failures: HashMap::new(),
                calls: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        // a poisoned lock only means a test panicked mid-call; keep the data
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, call: VenueCall) -> Result<MutexGuard<'_, Book>> {
        let mut book = self.book();
        *book.calls.entry(call).or_insert(0) += 1;
        if let Some(left) = book.failures.get_mut(&call) {
            if *left > 0 {
                *left -= 1;
                bail!("injected {:?} failure", call);
            }
        }
        Ok(book)
    }

    pub fn set_price(&self, price: f64) {
        self.book().ticker = Ticker { last: price, mark: price };
    }

    pub fn set_ticker(&self, last: f64, mark: f64) {
        self.book().ticker = Ticker { last, mark };
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.book().candles = candles;
    }

    pub fn set_setup_outcome(&self, outcome: SetupOutcome) {
        self.book().setup_outcome = outcome;
    }

    /// Make the next `times` calls of this family fail.
    pub fn fail_next(&self, call: VenueCall, times: u32) {
        self.book().failures.insert(call, times);
    }

    pub fn calls(&self, call: VenueCall) -> u32 {
        self.book().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn setup_calls(&self) -> u32 {
        self.book().setup_calls
    }

    /// Every accepted order, in submission order.
    pub fn orders(&self) -> Vec<PaperOrder> {
        self.book().orders.clone()
    }

    pub fn market_orders(&self) -> Vec<PaperOrder> {
        self.orders().into_iter().filter(|o| o.order_type == PaperOrderType::Market).collect()
    }

    pub fn resting_orders(&self) -> Vec<PaperOrder> {
        self.book().resting.clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.book().cancels.clone()
    }

    pub fn signed_position(&self) -> f64 {
        self.book().position
    }

    /// Force the venue-side position, e.g. to mimic a manual close.
    pub fn set_position(&self, signed: f64) {
        self.book().position = signed;
    }

    /// Fill the first resting reduce-only limit order. Returns whether one filled.
    pub fn fill_take_profit(&self) -> bool {
        let mut book = self.book();
        let Some(idx) = book.resting.iter().position(|o| o.reduce_only) else {
            return false;
        };
        let order = book.resting.remove(idx);
        book.position = reduce_toward_zero(book.position, order.side, order.qty);
        true
    }

    fn next_order_id(book: &mut Book) -> String {
        let id = format!("paper-{}", book.next_id);
        book.next_id += 1;
        id
    }
}

fn signed(side: OrderSide, qty: f64) -> f64 {
    match side {
        OrderSide::Buy => qty,
        OrderSide::Sell => -qty,
    }
}

fn reduce_toward_zero(position: f64, side: OrderSide, qty: f64) -> f64 {
    let next = position + signed(side, qty);
    if position.signum() != next.signum() && next != 0.0 {
        0.0
    } else {
        next
    }
}

#[async_trait]
impl Venue for PaperVenue {
    async fn instrument_filters(&self, _symbol: &str) -> Result<InstrumentFilters> {
        Ok(self.enter(VenueCall::Filters)?.filters)
    }

    async fn set_position_mode(&self, _symbol: &str, _one_way: bool) -> Result<SetupOutcome> {
        let mut book = self.enter(VenueCall::Setup)?;
        book.setup_calls += 1;
        Ok(book.setup_outcome)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> Result<SetupOutcome> {
        let mut book = self.enter(VenueCall::Setup)?;
        book.setup_calls += 1;
        Ok(book.setup_outcome)
    }

    async fn ticker(&self, _symbol: &str) -> Result<Ticker> {
        Ok(self.enter(VenueCall::Ticker)?.ticker)
    }

    async fn candles(&self, _symbol: &str, _interval_min: u64, limit: usize) -> Result<Vec<Candle>> {
        let book = self.enter(VenueCall::Candles)?;
        let skip = book.candles.len().saturating_sub(limit);
        Ok(book.candles[skip..].to_vec())
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<OrderAck> {
        let mut book = self.enter(VenueCall::MarketOrder)?;
        if qty <= 0.0 {
            bail!("invalid qty {}", qty);
        }
        let order_id = Self::next_order_id(&mut book);
        book.position = if reduce_only {
            reduce_toward_zero(book.position, side, qty)
        } else {
            book.position + signed(side, qty)
        };
        book.orders.push(PaperOrder {
            order_id: order_id.clone(),
            link_id: link_id.to_string(),
            order_type: PaperOrderType::Market,
            side,
            qty,
            price: None,
            reduce_only,
            post_only: false,
        });
        Ok(OrderAck { order_id })
    }

    async fn place_limit_order(&self, _symbol: &str, order: LimitOrder<'_>) -> Result<OrderAck> {
        let mut book = self.enter(VenueCall::LimitOrder)?;
        if order.qty <= 0.0 || order.price <= 0.0 {
            bail!("invalid limit order qty={} price={}", order.qty, order.price);
        }
        let order_id = Self::next_order_id(&mut book);
        let paper = PaperOrder {
            order_id: order_id.clone(),
            link_id: order.link_id.to_string(),
            order_type: PaperOrderType::Limit,
            side: order.side,
            qty: order.qty,
            price: Some(order.price),
            reduce_only: order.reduce_only,
            post_only: order.post_only,
        };
        book.orders.push(paper.clone());
        book.resting.push(paper);
        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<()> {
        let mut book = self.enter(VenueCall::Cancel)?;
        let idx = book
            .resting
            .iter()
            .position(|o| o.order_id == order_id)
            .ok_or_else(|| anyhow!("order {} not found", order_id))?;
        book.resting.remove(idx);
        book.cancels.push(order_id.to_string());
        Ok(())
    }

    async fn open_position_size(&self, _symbol: &str) -> Result<f64> {
        Ok(self.enter(VenueCall::Position)?.position.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> PaperVenue {
        PaperVenue::new(InstrumentFilters { qty_step: 1.0, min_qty: 1.0, price_tick: 0.0001 })
    }

    #[tokio::test]
    async fn test_market_orders_move_position() {
        let v = venue();
        v.place_market_order("X", OrderSide::Sell, 10.0, false, "a").await.unwrap();
        assert_eq!(v.signed_position(), -10.0);
        assert_eq!(v.open_position_size("X").await.unwrap(), 10.0);
        v.place_market_order("X", OrderSide::Buy, 25.0, true, "b").await.unwrap();
        assert_eq!(v.signed_position(), 0.0);
    }

    #[tokio::test]
    async fn test_take_profit_fill_flattens() {
        let v = venue();
        v.place_market_order("X", OrderSide::Buy, 10.0, false, "a").await.unwrap();
        let order = LimitOrder {
            side: OrderSide::Sell,
            qty: 10.0,
            price: 1.01,
            reduce_only: true,
            post_only: true,
            link_id: "tp",
        };
        v.place_limit_order("X", order).await.unwrap();
        assert!(v.fill_take_profit());
        assert_eq!(v.signed_position(), 0.0);
        assert!(v.resting_orders().is_empty());
        assert!(!v.fill_take_profit());
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let v = venue();
        v.fail_next(VenueCall::Ticker, 2);
        assert!(v.ticker("X").await.is_err());
        assert!(v.ticker("X").await.is_err());
        assert!(v.ticker("X").await.is_ok());
        assert_eq!(v.calls(VenueCall::Ticker), 3);
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_fails() {
        let v = venue();
        assert!(v.cancel_order("X", "nope").await.is_err());
    }
}
