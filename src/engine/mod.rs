//! Decision loop for one symbol.
//!
//! Each cycle runs to completion before the next starts:
//!
//! ```text
//! ticker ─► reconcile ─► restore TP ─► signal ─► seed-if-flat ─► add ─► flip ─► emergency stop
//! ```
//!
//! A ticker failure skips the cycle. A candle failure is treated as "no
//! signal". A rejected order aborts the rest of the cycle with the position
//! left as it was before that order. Every venue call goes through
//! `retry_async`.

pub mod reconcile;

use anyhow::{bail, Result};
use serde_json::json;
use tokio::time::sleep;

use crate::exchange::retry::{retry_async, RetryConfig};
use crate::exchange::{InstrumentFilters, LimitOrder, SetupOutcome, Venue};
use crate::indicators::{bulls_signal, closed_candles, BullsParams, BullsSignal};
use crate::journal::{Journal, JournalEntry};
use crate::logging::{
    log, log_cycle_error, log_order_submit, log_risk_check, log_signal, log_transition, log_warn,
    obj, v_num, v_str, Domain, Level,
};
use crate::position::{Direction, PendingTakeProfit, Position, TakeProfitParams};
use crate::sizing::{round_qty, Budget};
use crate::state::{now_ms, now_ts, Config};

pub use reconcile::{detects_external_close, ReconcileOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Flip,
    EmergencyStop,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Flip => "flip",
            CloseReason::EmergencyStop => "emergency_stop",
        }
    }
}

/// Transition applied during a cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Seed(Direction),
    Add { level: i32 },
    Close { direction: Direction, reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// `None` when the ticker could not be fetched and the cycle was skipped.
    pub price: Option<f64>,
    pub reconcile: ReconcileOutcome,
    pub signal: BullsSignal,
    pub transitions: Vec<Transition>,
}

impl CycleReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            price: None,
            reconcile: ReconcileOutcome::Skipped,
            signal: BullsSignal::none(),
            transitions: Vec::new(),
        }
    }
}

/// Quantity actually sent for a market order.
#[derive(Debug, Clone, Copy)]
struct MarketFill {
    qty: f64,
    fee: f64,
}

pub struct DcaEngine<V: Venue> {
    cfg: Config,
    venue: V,
    retry: RetryConfig,
    budget: Budget,
    filters: InstrumentFilters,
    bulls: BullsParams,
    tp: TakeProfitParams,
    position: Position,
    journal: Option<Journal>,
    cycle: u64,
    order_seq: u64,
}

impl<V: Venue> DcaEngine<V> {
    /// Fetch instrument filters, apply account setup and open the journal.
    ///
    /// Only the filter lookup is fatal. Setup calls that fail are logged and
    /// the venue keeps whatever mode it already had.
    pub async fn bootstrap(cfg: Config, venue: V) -> Result<Self> {
        let retry = RetryConfig::from_config(&cfg);
        let filters = {
            let venue = &venue;
            let symbol = cfg.symbol.as_str();
            retry_async(&retry, "instrument_filters", move || venue.instrument_filters(symbol)).await?
        };
        if filters.qty_step <= 0.0 || filters.price_tick <= 0.0 {
            bail!(
                "invalid instrument filters for {}: qty_step={} price_tick={}",
                cfg.symbol,
                filters.qty_step,
                filters.price_tick
            );
        }

        let mode = {
            let venue = &venue;
            let symbol = cfg.symbol.as_str();
            retry_async(&retry, "set_position_mode", move || venue.set_position_mode(symbol, true)).await
        };
        log_setup("position_mode", mode);

        let leverage = {
            let venue = &venue;
            let symbol = cfg.symbol.as_str();
            let lev = cfg.leverage;
            retry_async(&retry, "set_leverage", move || venue.set_leverage(symbol, lev)).await
        };
        log_setup("leverage", leverage);

        let journal = match cfg.journal_path.as_deref() {
            Some(path) => match Journal::open(path) {
                Ok(j) => Some(j),
                Err(e) => {
                    log_warn(Domain::System, "journal_unavailable", path, &anyhow::Error::from(e));
                    None
                }
            },
            None => None,
        };

        let budget = Budget::from_config(&cfg);
        log(
            Level::Info,
            Domain::System,
            "engine_ready",
            ready_fields(&cfg, &budget, &filters, journal.as_ref().map(|j| j.path())),
        );

        Ok(Self {
            bulls: BullsParams::from_config(&cfg),
            tp: TakeProfitParams::from_config(&cfg),
            budget,
            filters,
            retry,
            venue,
            cfg,
            position: Position::flat(),
            journal,
            cycle: 0,
            order_seq: 0,
        })
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn filters(&self) -> &InstrumentFilters {
        &self.filters
    }

    pub fn venue(&self) -> &V {
        &self.venue
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Run cycles forever, one every poll interval.
    pub async fn run(&mut self) {
        log(
            Level::Info,
            Domain::System,
            "loop_start",
            obj(&[
                ("symbol", v_str(&self.cfg.symbol)),
                ("poll_secs", v_num(self.cfg.poll_secs)),
            ]),
        );
        loop {
            if let Err(e) = self.run_cycle().await {
                log_cycle_error(self.cycle, &e);
            }
            sleep(self.cfg.poll_interval()).await;
        }
    }

    /// One decision cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycle += 1;
        let mut report = CycleReport::new(self.cycle);

        let price = match self.working_price().await {
            Ok(p) => p,
            Err(e) => {
                log_warn(Domain::Market, "price_fetch_failed", "skipping cycle", &e);
                return Ok(report);
            }
        };
        report.price = Some(price);

        report.reconcile = match self.reconcile(price).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log_warn(Domain::Audit, "reconcile_failed", "position sync skipped", &e);
                ReconcileOutcome::Failed
            }
        };

        if !self.position.is_flat() && self.position.take_profit.is_none() {
            self.replace_take_profit().await;
        }

        let signal = match self.fetch_signal().await {
            Ok(s) => s,
            Err(e) => {
                log_warn(Domain::Strategy, "signal_fetch_failed", "treating as no signal", &e);
                BullsSignal::none()
            }
        };
        report.signal = signal;
        self.position.observe_signal(signal.long, signal.short);

        if let Some(direction) = self.seed_if_flat(price, &signal).await? {
            report.transitions.push(Transition::Seed(direction));
        }
        if let Some(level) = self.maybe_add(price).await? {
            report.transitions.push(Transition::Add { level });
        }
        report.transitions.extend(self.maybe_flip(price, &signal).await?);
        if let Some(close) = self.maybe_emergency_stop(price).await? {
            report.transitions.push(close);
        }
        Ok(report)
    }

    async fn working_price(&self) -> Result<f64> {
        let venue = &self.venue;
        let symbol = self.cfg.symbol.as_str();
        let ticker = retry_async(&self.retry, "ticker", move || venue.ticker(symbol)).await?;
        let price = ticker.mid();
        if !price.is_finite() || price <= 0.0 {
            bail!("unusable ticker last={} mark={}", ticker.last, ticker.mark);
        }
        Ok(price)
    }

    async fn fetch_signal(&self) -> Result<BullsSignal> {
        let mut candles = {
            let venue = &self.venue;
            let symbol = self.cfg.symbol.as_str();
            let (interval, limit) = (self.cfg.kline_interval, self.cfg.kline_limit);
            retry_async(&self.retry, "candles", move || venue.candles(symbol, interval, limit)).await?
        };
        candles.sort_by_key(|c| c.ts);
        let closed = closed_candles(&candles, now_ms(), self.cfg.kline_interval_ms());
        let signal = bulls_signal(closed, &self.bulls);
        log_signal(&self.cfg.symbol, signal.long, signal.short, signal.fresh_long, signal.fresh_short);
        Ok(signal)
    }

    async fn seed_if_flat(&mut self, price: f64, signal: &BullsSignal) -> Result<Option<Direction>> {
        if !self.position.is_flat() {
            return Ok(None);
        }
        let (want_long, want_short) = if self.cfg.seed_fresh_only {
            (signal.fresh_long, signal.fresh_short)
        } else {
            (signal.long, signal.short)
        };
        let direction = if want_long {
            Direction::Long
        } else if want_short {
            Direction::Short
        } else {
            return Ok(None);
        };
        Ok(self.seed(direction, price).await?.then_some(direction))
    }

    /// Open a fresh level-0 position. Returns false when the leg rounds to zero.
    async fn seed(&mut self, direction: Direction, price: f64) -> Result<bool> {
        let leg = self.budget.base_for(direction);
        let Some(fill) = self.submit_market(direction, leg / price, false, price).await? else {
            log_risk_check("seed_qty", "skip", leg / price, self.filters.qty_step);
            return Ok(false);
        };
        self.position.seed(direction, fill.qty, price, leg, fill.fee)?;
        self.after_transition("seed", price);
        self.record(JournalEntry::Seed {
            ts: now_ts(),
            direction,
            qty: fill.qty,
            price,
            leg_notional: leg,
        });
        self.replace_take_profit().await;
        Ok(true)
    }

    async fn maybe_add(&mut self, price: f64) -> Result<Option<i32>> {
        let direction = self.position.direction;
        let (step, scale) = match direction {
            Direction::Long => (self.cfg.long_step_pct, self.cfg.vol_scale_long),
            Direction::Short => (self.cfg.short_step_pct, self.cfg.vol_scale_short),
            Direction::Flat => return Ok(None),
        };
        if self.position.level < 0 || self.position.level >= self.cfg.max_dca as i32 {
            return Ok(None);
        }
        if !self.position.adverse_reached(price, step) {
            return Ok(None);
        }

        let next_leg = self.position.leg_notional * scale;
        if !self.budget.allows(self.position.used_notional, next_leg) {
            // no level change; the same threshold is tested again next cycle
            log_risk_check(
                "dca_budget",
                "skip",
                self.position.used_notional + next_leg,
                self.budget.total_notional,
            );
            return Ok(None);
        }

        let Some(fill) = self.submit_market(direction, next_leg / price, false, price).await? else {
            log_risk_check("dca_qty", "skip", next_leg / price, self.filters.qty_step);
            return Ok(None);
        };
        let level = self.position.add(fill.qty, price, next_leg, fill.fee)?;
        self.after_transition("add", price);
        self.record(JournalEntry::Add {
            ts: now_ts(),
            level,
            qty: fill.qty,
            price,
            avg_price: self.position.avg_price.unwrap_or(price),
            used_notional: self.position.used_notional,
        });
        self.replace_take_profit().await;
        Ok(Some(level))
    }

    /// Close and reopen the other way on a fresh opposite reversal in profit.
    ///
    /// The close and the new seed are separate orders. If the seed fails the
    /// position stays flat and the next cycle's seed step picks it up.
    async fn maybe_flip(&mut self, price: f64, signal: &BullsSignal) -> Result<Vec<Transition>> {
        let current = self.position.direction;
        let fresh_opposite = match current {
            Direction::Long => signal.fresh_short,
            Direction::Short => signal.fresh_long,
            Direction::Flat => return Ok(vec![]),
        };
        if !fresh_opposite {
            return Ok(vec![]);
        }
        let pnl = self.position.pnl_pct(price);
        if pnl <= self.cfg.flip_buffer_pct {
            log_risk_check("flip_pnl", "skip", pnl, self.cfg.flip_buffer_pct);
            return Ok(vec![]);
        }

        let mut done = vec![self.close_position(price, CloseReason::Flip).await?];
        let target = current.opposite();
        if self.seed(target, price).await? {
            done.push(Transition::Seed(target));
        }
        Ok(done)
    }

    async fn maybe_emergency_stop(&mut self, price: f64) -> Result<Option<Transition>> {
        if !self.cfg.use_emergency_sl || self.position.is_flat() {
            return Ok(None);
        }
        if !self.position.emergency_triggered(price, self.cfg.emergency_sl_pct) {
            return Ok(None);
        }
        log(
            Level::Warn,
            Domain::Risk,
            "emergency_stop",
            obj(&[
                ("symbol", v_str(&self.cfg.symbol)),
                ("price", v_num(price)),
                ("avg_price", json!(self.position.avg_price)),
                ("threshold_pct", v_num(self.cfg.emergency_sl_pct)),
            ]),
        );
        Ok(Some(self.close_position(price, CloseReason::EmergencyStop).await?))
    }

    async fn close_position(&mut self, price: f64, reason: CloseReason) -> Result<Transition> {
        let direction = self.position.direction;
        let qty = self.position.qty;
        self.submit_market(direction, qty, true, price).await?;
        let tp = self.position.reset();
        self.cancel_take_profit(tp).await;
        self.after_transition(reason.as_str(), price);
        self.record(JournalEntry::Close {
            ts: now_ts(),
            reason: reason.as_str().to_string(),
            direction,
            qty,
            price,
        });
        Ok(Transition::Close { direction, reason })
    }

    /// Round and send a market order. `None` when the quantity rounds to zero.
    ///
    /// Opening orders accrue the taker fee on `qty * price`; closes do not.
    async fn submit_market(
        &mut self,
        direction: Direction,
        raw_qty: f64,
        reduce_only: bool,
        price: f64,
    ) -> Result<Option<MarketFill>> {
        let side = if reduce_only { direction.exit_side() } else { direction.entry_side() };
        let Some(side) = side else {
            bail!("no order side for a {} position", direction.as_str());
        };
        let qty = round_qty(raw_qty, &self.filters);
        if qty <= 0.0 {
            return Ok(None);
        }

        let link_id = self.next_link_id();
        log_order_submit(&link_id, &self.cfg.symbol, "Market", side.as_str(), qty, price, reduce_only);
        let ack = {
            let venue = &self.venue;
            let symbol = self.cfg.symbol.as_str();
            let link = link_id.as_str();
            retry_async(&self.retry, "place_market_order", move || {
                venue.place_market_order(symbol, side, qty, reduce_only, link)
            })
            .await?
        };
        log(
            Level::Info,
            Domain::Exec,
            "order_ack",
            obj(&[("order_id", v_str(&ack.order_id)), ("link_id", v_str(&link_id))]),
        );

        let fee = if reduce_only { 0.0 } else { qty * price * self.cfg.taker_fee };
        Ok(Some(MarketFill { qty, fee }))
    }

    /// Cancel the resting take-profit, if any, then place one for the current
    /// position. Failures are logged; a position left without a take-profit
    /// gets one at the start of the next cycle.
    async fn replace_take_profit(&mut self) {
        let previous = self.position.take_profit.take();
        self.cancel_take_profit(previous).await;
        if let Err(e) = self.place_take_profit().await {
            log_warn(Domain::Exec, "take_profit_failed", "position left without take-profit", &e);
        }
    }

    async fn place_take_profit(&mut self) -> Result<()> {
        let Some(side) = self.position.direction.exit_side() else {
            return Ok(());
        };
        let Some(price) = self.position.take_profit_target(&self.tp, self.filters.price_tick) else {
            return Ok(());
        };
        let qty = round_qty(self.position.qty, &self.filters);
        if qty <= 0.0 || price <= 0.0 {
            log_risk_check("take_profit", "skip", price, 0.0);
            return Ok(());
        }

        let link_id = self.next_link_id();
        log_order_submit(&link_id, &self.cfg.symbol, "Limit", side.as_str(), qty, price, true);
        let ack = {
            let venue = &self.venue;
            let symbol = self.cfg.symbol.as_str();
            let link = link_id.as_str();
            retry_async(&self.retry, "place_take_profit", move || {
                let order = LimitOrder {
                    side,
                    qty,
                    price,
                    reduce_only: true,
                    post_only: true,
                    link_id: link,
                };
                venue.place_limit_order(symbol, order)
            })
            .await?
        };
        self.record(JournalEntry::TakeProfit {
            ts: now_ts(),
            order_id: ack.order_id.clone(),
            price,
            qty,
        });
        self.position.take_profit = Some(PendingTakeProfit { order_id: ack.order_id, price, qty, side });
        Ok(())
    }

    async fn cancel_take_profit(&self, tp: Option<PendingTakeProfit>) {
        let Some(tp) = tp else {
            return;
        };
        let result = {
            let venue = &self.venue;
            let symbol = self.cfg.symbol.as_str();
            let order_id = tp.order_id.as_str();
            retry_async(&self.retry, "cancel_take_profit", move || venue.cancel_order(symbol, order_id)).await
        };
        match result {
            Ok(()) => log(
                Level::Info,
                Domain::Exec,
                "take_profit_cancelled",
                obj(&[("order_id", v_str(&tp.order_id)), ("price", v_num(tp.price))]),
            ),
            Err(e) => log_warn(Domain::Exec, "cancel_failed", &tp.order_id, &e),
        }
    }

    fn next_link_id(&mut self) -> String {
        self.order_seq += 1;
        format!("bulls-{}-{}", now_ms(), self.order_seq)
    }

    fn after_transition(&self, transition: &str, price: f64) {
        let p = &self.position;
        log_transition(transition, p.direction.as_str(), p.qty, p.avg_price, p.level, price);
        if let Err(v) = p.check_invariants(self.cfg.max_dca, self.budget.total_notional) {
            log(
                Level::Error,
                Domain::Audit,
                "invariant_violation",
                obj(&[("transition", v_str(transition)), ("msg", v_str(&v.msg))]),
            );
        }
    }

    fn record(&mut self, entry: JournalEntry) {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.append(&entry) {
                log_warn(Domain::Audit, "journal_write_failed", journal.path(), &anyhow::Error::from(e));
            }
        }
    }
}

fn log_setup(call: &str, result: Result<SetupOutcome>) {
    match result {
        Ok(outcome) => log(
            Level::Info,
            Domain::System,
            "setup",
            obj(&[
                ("call", v_str(call)),
                ("outcome", v_str(if outcome == SetupOutcome::Unchanged { "unchanged" } else { "applied" })),
            ]),
        ),
        Err(e) => log_warn(Domain::System, "setup_failed", call, &e),
    }
}

/// Startup summary. The maker fee is informational; fills are charged the
/// taker rate.
fn ready_fields(
    cfg: &Config,
    budget: &Budget,
    filters: &InstrumentFilters,
    journal: Option<&str>,
) -> serde_json::Map<String, serde_json::Value> {
    obj(&[
        ("symbol", v_str(&cfg.symbol)),
        ("total_budget", v_num(budget.total_notional)),
        ("long_base", v_num(budget.long_base)),
        ("short_base", v_num(budget.short_base)),
        ("qty_step", v_num(filters.qty_step)),
        ("min_qty", v_num(filters.min_qty)),
        ("price_tick", v_num(filters.price_tick)),
        ("taker_fee", v_num(cfg.taker_fee)),
        ("maker_fee", v_num(cfg.maker_fee)),
        ("journal", json!(journal)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperVenue;
    use crate::exchange::Candle;

    fn filters() -> InstrumentFilters {
        InstrumentFilters { qty_step: 1.0, min_qty: 1.0, price_tick: 0.0001 }
    }

    fn quiet_config() -> Config {
        Config { retry_tries: 0, retry_base_ms: 1, ..Config::default() }
    }

    /// Long run of lower closes ending in a green bar at a new low.
    fn fresh_long_candles() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..60)
            .map(|i| {
                let c = 200.0 - i as f64;
                Candle { ts: i as u64 * 3_600_000, o: c + 0.5, h: c + 1.0, l: c - 0.5, c, v: 1.0 }
            })
            .collect();
        candles.push(Candle { ts: 60 * 3_600_000, o: 139.5, h: 141.0, l: 138.0, c: 140.6, v: 1.0 });
        candles
    }

    async fn long_engine() -> DcaEngine<PaperVenue> {
        let venue = PaperVenue::new(filters());
        venue.set_price(1.0);
        venue.set_candles(fresh_long_candles());
        let mut engine = DcaEngine::bootstrap(quiet_config(), venue).await.unwrap();
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.position().direction, Direction::Long);
        engine
    }

    #[tokio::test]
    async fn test_budget_guard_blocks_level_increment() {
        let mut engine = long_engine().await;
        let used = engine.position.used_notional;
        // room for the seed only
        engine.budget.total_notional = used * 1.5;

        engine.venue().set_price(0.85);
        for _ in 0..3 {
            let report = engine.run_cycle().await.unwrap();
            assert!(report.transitions.is_empty());
        }
        assert_eq!(engine.position().level, 0);
        assert_eq!(engine.position().used_notional, used);
        assert_eq!(engine.venue().market_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_add_stops_at_max_dca() {
        let mut engine = long_engine().await;
        engine.cfg.max_dca = 1;
        engine.budget.total_notional = 1_000.0;

        engine.venue().set_price(0.85);
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.transitions, vec![Transition::Add { level: 1 }]);

        engine.venue().set_price(0.70);
        let report = engine.run_cycle().await.unwrap();
        assert!(report.transitions.is_empty());
        assert_eq!(engine.position().level, 1);
    }

    #[tokio::test]
    async fn test_entry_fees_accrue_on_opening_orders() {
        let engine = long_engine().await;
        let p = engine.position();
        assert!((p.entry_fees - p.qty * 1.0 * 0.0006).abs() < 1e-12);
    }

    #[test]
    fn test_ready_record_carries_fee_rates() {
        let cfg = Config { maker_fee: 0.0001, ..quiet_config() };
        let budget = Budget::from_config(&cfg);
        let fields = ready_fields(&cfg, &budget, &filters(), None);
        assert_eq!(fields["maker_fee"], json!(0.0001));
        assert_eq!(fields["taker_fee"], json!(0.0006));
        assert_eq!(fields["journal"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_link_ids_are_unique() {
        let mut engine = long_engine().await;
        let a = engine.next_link_id();
        let b = engine.next_link_id();
        assert_ne!(a, b);
        assert!(a.starts_with("bulls-"));
    }
}
