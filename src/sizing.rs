//! Leg sizing for the DCA ladder and venue rounding rules.
//!
//! Notional values are in quote currency (USDT); quantities in base units.

use crate::exchange::InstrumentFilters;
use crate::position::Direction;
use crate::state::Config;

/// Relative slack for floor rounding, so `1.01 / 0.0001` that lands a hair
/// under 10100 in binary still floors to 10100.
const FLOOR_EPS: f64 = 1e-9;

// =============================================================================
// Geometric ladder
// =============================================================================

/// Sum of `legs` terms `1 + scale + scale^2 + ...`.
pub fn geometric_sum(scale: f64, legs: u32) -> f64 {
    if legs == 0 {
        return 0.0;
    }
    if (scale - 1.0).abs() < 1e-12 {
        return legs as f64;
    }
    (1.0 - scale.powi(legs as i32)) / (1.0 - scale)
}

/// Per-leg multipliers `scale^k` for `k = 0..=max_dca`.
pub fn leg_multipliers(scale: f64, max_dca: u32) -> Vec<f64> {
    (0..=max_dca).map(|k| scale.powi(k as i32)).collect()
}

/// Notional budget split into base legs per side. Derived once at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub total_notional: f64,
    pub long_base: f64,
    pub short_base: f64,
}

impl Budget {
    pub fn new(total_notional: f64, scale_long: f64, scale_short: f64, max_dca: u32) -> Self {
        let legs = max_dca + 1;
        Self {
            total_notional,
            long_base: total_notional / geometric_sum(scale_long, legs),
            short_base: total_notional / geometric_sum(scale_short, legs),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.total_budget(), cfg.vol_scale_long, cfg.vol_scale_short, cfg.max_dca)
    }

    /// Seed leg notional for a direction; zero for `Flat`.
    pub fn base_for(&self, dir: Direction) -> f64 {
        match dir {
            Direction::Long => self.long_base,
            Direction::Short => self.short_base,
            Direction::Flat => 0.0,
        }
    }

    /// Whether adding `next_leg` keeps the ladder inside the budget.
    pub fn allows(&self, used: f64, next_leg: f64) -> bool {
        used + next_leg <= self.total_notional + 1e-6
    }
}

// =============================================================================
// Venue rounding
// =============================================================================

/// Round to exchange lot size
pub fn round_to_lot(qty: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return qty;
    }
    ((qty / lot_size) * (1.0 + FLOOR_EPS)).floor() * lot_size
}

/// Floor to `qty_step`, then lift a positive result below `min_qty` up to it.
pub fn round_qty(qty: f64, filters: &InstrumentFilters) -> f64 {
    let q = round_to_lot(qty, filters.qty_step);
    if q > 0.0 && q < filters.min_qty {
        filters.min_qty
    } else {
        q.max(0.0)
    }
}

/// Floor to the price tick.
pub fn round_price(price: f64, tick: f64) -> f64 {
    round_to_lot(price, tick)
}

fn step_decimals(step: f64) -> usize {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 12 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Render a value with as many decimals as `step` implies.
pub fn format_to_step(value: f64, step: f64) -> String {
    format!("{:.*}", step_decimals(step), value)
}

// =============================================================================
// Tests
// =============================================================================
