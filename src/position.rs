//! Local belief about the open position and its pure transitions.
//!
//! The engine submits orders first and only then applies the matching
//! transition here, so a rejected order leaves the position untouched.

use serde::{Deserialize, Serialize};

use crate::exchange::OrderSide;
use crate::sizing::round_price;
use crate::state::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Flat,
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Flat => Direction::Flat,
        }
    }

    /// Order side that grows a position in this direction.
    pub fn entry_side(&self) -> Option<OrderSide> {
        match self {
            Direction::Long => Some(OrderSide::Buy),
            Direction::Short => Some(OrderSide::Sell),
            Direction::Flat => None,
        }
    }

    /// Order side that reduces a position in this direction.
    pub fn exit_side(&self) -> Option<OrderSide> {
        self.opposite().entry_side()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Flat => "flat",
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

/// Resting reduce-only limit order that closes the whole position.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTakeProfit {
    pub order_id: String,
    pub price: f64,
    pub qty: f64,
    pub side: OrderSide,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeProfitParams {
    pub tp_pct: f64,
    /// Net profit floor in quote currency; zero disables it.
    pub min_profit: f64,
    pub exit_fee_rate: f64,
}

impl TakeProfitParams {
    pub fn from_config(cfg: &Config) -> Self {
        Self { tp_pct: cfg.tp_pct, min_profit: cfg.min_profit_usd, exit_fee_rate: cfg.taker_fee }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvariantViolation {
    pub msg: String,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position invariant violated: {}", self.msg)
    }
}

impl std::error::Error for InvariantViolation {}

fn violation(msg: &str) -> InvariantViolation {
    InvariantViolation { msg: msg.to_string() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub direction: Direction,
    /// Absolute size in base units.
    pub qty: f64,
    pub avg_price: Option<f64>,
    /// -1 when flat, 0 after the seed, +1 per accepted add.
    pub level: i32,
    pub leg_notional: f64,
    pub used_notional: f64,
    pub last_fill_price: Option<f64>,
    pub entry_fees: f64,
    /// Last direction the signal pointed to. Survives resets.
    pub last_direction: Direction,
    pub take_profit: Option<PendingTakeProfit>,
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

impl Position {
    pub fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            qty: 0.0,
            avg_price: None,
            level: -1,
            leg_notional: 0.0,
            used_notional: 0.0,
            last_fill_price: None,
            entry_fees: 0.0,
            last_direction: Direction::Flat,
            take_profit: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.direction == Direction::Flat
    }

    /// Flat -> Open(direction, 0).
    pub fn seed(
        &mut self,
        direction: Direction,
        qty: f64,
        price: f64,
        leg_notional: f64,
        fee: f64,
    ) -> Result<(), InvariantViolation> {
        if !self.is_flat() {
            return Err(violation("seed on an open position"));
        }
        if direction == Direction::Flat || qty <= 0.0 {
            return Err(violation("seed needs a direction and a positive quantity"));
        }
        self.direction = direction;
        self.qty = qty;
        self.avg_price = Some(price);
        self.level = 0;
        self.leg_notional = leg_notional;
        self.used_notional = leg_notional;
        self.last_fill_price = Some(price);
        self.entry_fees += fee;
        self.last_direction = direction;
        Ok(())
    }

    /// Open(d, k) -> Open(d, k+1). Returns the new level.
    pub fn add(
        &mut self,
        qty: f64,
        price: f64,
        leg_notional: f64,
        fee: f64,
    ) -> Result<i32, InvariantViolation> {
        let avg = match (self.direction, self.avg_price) {
            (Direction::Flat, _) | (_, None) => return Err(violation("add on a flat position")),
            (_, Some(avg)) => avg,
        };
        if qty <= 0.0 {
            return Err(violation("add needs a positive quantity"));
        }
        let new_qty = self.qty + qty;
        self.avg_price = Some((avg * self.qty + price * qty) / new_qty);
        self.qty = new_qty;
        self.level += 1;
        self.leg_notional = leg_notional;
        self.used_notional += leg_notional;
        self.last_fill_price = Some(price);
        self.entry_fees += fee;
        Ok(self.level)
    }

    /// Remember where the signal points; long wins when both are active.
    pub fn observe_signal(&mut self, long: bool, short: bool) {
        if long {
            self.last_direction = Direction::Long;
        } else if short {
            self.last_direction = Direction::Short;
        }
    }

    /// Back to Flat. Hands back the take-profit order so the caller can cancel it.
    pub fn reset(&mut self) -> Option<PendingTakeProfit> {
        let tp = self.take_profit.take();
        let last_direction = self.last_direction;
        *self = Self::flat();
        self.last_direction = last_direction;
        tp
    }

    /// Unrealized PnL in percent of the average price.
    pub fn pnl_pct(&self, price: f64) -> f64 {
        match (self.direction, self.avg_price) {
            (Direction::Long, Some(avg)) if avg > 0.0 => 100.0 * (price / avg - 1.0),
            (Direction::Short, Some(avg)) if avg > 0.0 => 100.0 * (1.0 - price / avg),
            _ => 0.0,
        }
    }

    /// Price at which the next add becomes due, `step_pct` away from the last fill.
    pub fn next_adverse_price(&self, step_pct: f64) -> Option<f64> {
        let from = self.last_fill_price?;
        let step = step_pct / 100.0;
        match self.direction {
            Direction::Long => Some(from * (1.0 - step)),
            Direction::Short => Some(from * (1.0 + step)),
            Direction::Flat => None,
        }
    }

    pub fn adverse_reached(&self, price: f64, step_pct: f64) -> bool {
        match (self.direction, self.next_adverse_price(step_pct)) {
            (Direction::Long, Some(trigger)) => price <= trigger,
            (Direction::Short, Some(trigger)) => price >= trigger,
            _ => false,
        }
    }

    /// Whether price has crossed `pct` percent against the average.
    pub fn emergency_triggered(&self, price: f64, pct: f64) -> bool {
        match (self.direction, self.avg_price) {
            (Direction::Long, Some(avg)) => price <= avg * (1.0 - pct / 100.0),
            (Direction::Short, Some(avg)) => price >= avg * (1.0 + pct / 100.0),
            _ => false,
        }
    }

    /// Limit price that closes the whole position at the configured profit.
    ///
    /// With a profit floor, the price must also cover accrued entry fees plus
    /// the floor after paying the exit fee. Floored to `tick` on both sides.
    pub fn take_profit_target(&self, params: &TakeProfitParams, tick: f64) -> Option<f64> {
        let avg = self.avg_price?;
        if self.qty <= 0.0 {
            return None;
        }
        let per_unit = (self.entry_fees + params.min_profit) / self.qty.max(1e-9);
        let raw = match self.direction {
            Direction::Long => {
                let pct = avg * (1.0 + params.tp_pct / 100.0);
                if params.min_profit > 0.0 {
                    pct.max((avg + per_unit) / (1.0 - params.exit_fee_rate))
                } else {
                    pct
                }
            }
            Direction::Short => {
                let pct = avg * (1.0 - params.tp_pct / 100.0);
                if params.min_profit > 0.0 {
                    pct.min((avg - per_unit) / (1.0 + params.exit_fee_rate))
                } else {
                    pct
                }
            }
            Direction::Flat => return None,
        };
        Some(round_price(raw, tick))
    }

    pub fn check_invariants(&self, max_dca: u32, total_budget: f64) -> Result<(), InvariantViolation> {
        if self.qty.is_nan() || self.qty < 0.0 {
            return Err(violation("quantity negative or NaN"));
        }
        let flat = self.is_flat();
        if flat != (self.qty == 0.0) || flat != self.avg_price.is_none() || flat != (self.level == -1) {
            return Err(violation("flat state disagrees across qty/avg/level"));
        }
        if self.level > max_dca as i32 {
            return Err(violation("dca level above maximum"));
        }
        if self.used_notional > total_budget + 1e-6 {
            return Err(violation("used notional above budget"));
        }
        if flat && self.take_profit.is_some() {
            return Err(violation("take-profit resting on a flat position"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(tp_pct: f64, min_profit: f64) -> TakeProfitParams {
        TakeProfitParams { tp_pct, min_profit, exit_fee_rate: 0.0006 }
    }

    fn long_at(price: f64, qty: f64) -> Position {
        let mut p = Position::flat();
        p.seed(Direction::Long, qty, price, 10.0, 0.0).unwrap();
        p
    }

    #[test]
    fn test_flat_invariants_hold() {
        assert!(Position::flat().check_invariants(5, 100.0).is_ok());
    }

    #[test]
    fn test_seed_then_add_weights_average() {
        let mut p = long_at(1.0, 10.0);
        let level = p.add(20.0, 0.7, 11.8, 0.0).unwrap();
        assert_eq!(level, 1);
        assert!((p.avg_price.unwrap() - 0.8).abs() < 1e-12);
        assert_eq!(p.qty, 30.0);
        assert!((p.used_notional - 21.8).abs() < 1e-12);
        assert_eq!(p.last_fill_price, Some(0.7));
        assert!(p.check_invariants(5, 100.0).is_ok());
    }

    #[test]
    fn test_seed_on_open_position_is_rejected() {
        let mut p = long_at(1.0, 10.0);
        let before = p.clone();
        assert!(p.seed(Direction::Short, 5.0, 1.0, 10.0, 0.0).is_err());
        assert_eq!(p, before);
    }

    #[test]
    fn test_add_on_flat_is_rejected() {
        let mut p = Position::flat();
        assert!(p.add(1.0, 1.0, 1.0, 0.0).is_err());
        assert!(p.is_flat());
    }

    #[test]
    fn test_reset_keeps_last_direction_and_returns_tp() {
        let mut p = long_at(1.0, 10.0);
        p.take_profit = Some(PendingTakeProfit {
            order_id: "tp-1".into(),
            price: 1.01,
            qty: 10.0,
            side: OrderSide::Sell,
        });
        let tp = p.reset();
        assert_eq!(tp.map(|t| t.order_id), Some("tp-1".to_string()));
        assert!(p.is_flat());
        assert_eq!(p.last_direction, Direction::Long);
        assert!(p.check_invariants(5, 100.0).is_ok());
    }

    #[test]
    fn test_observed_signal_survives_reset() {
        let mut p = long_at(1.0, 10.0);
        p.observe_signal(false, true);
        p.reset();
        assert_eq!(p.last_direction, Direction::Short);
        p.observe_signal(false, false);
        assert_eq!(p.last_direction, Direction::Short);
    }

    #[test]
    fn test_take_profit_long_floor_rounded() {
        let p = long_at(1.0, 10.0);
        let target = p.take_profit_target(&tp(1.0, 0.0), 0.0001).unwrap();
        assert!((target - 1.0100).abs() < 1e-12, "target {}", target);
    }

    #[test]
    fn test_take_profit_short_mirrors() {
        let mut p = Position::flat();
        p.seed(Direction::Short, 10.0, 2.0, 10.0, 0.0).unwrap();
        let target = p.take_profit_target(&tp(1.0, 0.0), 0.0001).unwrap();
        assert!((target - 1.98).abs() < 1e-12);
    }

    #[test]
    fn test_profit_floor_lifts_long_target() {
        let mut p = Position::flat();
        p.seed(Direction::Long, 10.0, 1.0, 10.0, 0.006).unwrap();
        // floor of 1.0 on 10 units needs +0.1006 per unit before exit fee
        let target = p.take_profit_target(&tp(1.0, 1.0), 0.0001).unwrap();
        let expected = round_price((1.0 + 1.006 / 10.0) / (1.0 - 0.0006), 0.0001);
        assert!((target - expected).abs() < 1e-12);
        assert!(target > 1.01);
    }

    #[test]
    fn test_pnl_and_adverse_levels() {
        let p = long_at(1.0, 10.0);
        assert!((p.pnl_pct(1.02) - 2.0).abs() < 1e-9);
        assert!((p.next_adverse_price(10.0).unwrap() - 0.9).abs() < 1e-12);
        assert!(p.adverse_reached(0.89, 10.0));
        assert!(!p.adverse_reached(0.95, 10.0));

        let mut s = Position::flat();
        s.seed(Direction::Short, 10.0, 1.0, 10.0, 0.0).unwrap();
        assert!((s.pnl_pct(0.98) - 2.0).abs() < 1e-9);
        assert!(s.adverse_reached(1.11, 10.0));
    }

    #[test]
    fn test_emergency_trigger() {
        let p = long_at(1.0, 10.0);
        assert!(p.emergency_triggered(0.93, 6.0));
        assert!(!p.emergency_triggered(0.95, 6.0));
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), Some(OrderSide::Buy));
        assert_eq!(Direction::Long.exit_side(), Some(OrderSide::Sell));
        assert_eq!(Direction::Short.exit_side(), Some(OrderSide::Buy));
        assert_eq!(Direction::Flat.entry_side(), None);
    }
}
