//! Venue position sync.
//!
//! The only place local belief is corrected from venue state. A take-profit
//! fill is never observed directly; it shows up here as the venue reporting
//! no position while we still think one is open.

use anyhow::Result;

use super::DcaEngine;
use crate::exchange::retry::retry_async;
use crate::exchange::Venue;
use crate::journal::JournalEntry;
use crate::logging::log_reconcile;
use crate::position::{Direction, Position};
use crate::state::now_ts;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// Not attempted this cycle.
    Skipped,
    InSync,
    /// Venue holds a position we do not track, e.g. after a restart.
    Untracked { venue_size: f64 },
    ExternalClose { reseeded: bool },
    Failed,
}

/// Local belief is open but the venue reports nothing.
pub fn detects_external_close(local: &Position, venue_size: f64) -> bool {
    !local.is_flat() && venue_size <= 0.0
}

impl<V: Venue> DcaEngine<V> {
    /// Compare against the venue and reset once on an external close,
    /// reseeding in the last seen direction when enabled.
    pub(crate) async fn reconcile(&mut self, price: f64) -> Result<ReconcileOutcome> {
        let venue_size = {
            let venue = &self.venue;
            let symbol = self.cfg.symbol.as_str();
            retry_async(&self.retry, "open_position_size", move || venue.open_position_size(symbol)).await?
        };
        let local_qty = self.position.qty;

        if !detects_external_close(&self.position, venue_size) {
            if self.position.is_flat() && venue_size > 0.0 {
                log_reconcile(&self.cfg.symbol, local_qty, venue_size, "untracked");
                return Ok(ReconcileOutcome::Untracked { venue_size });
            }
            log_reconcile(&self.cfg.symbol, local_qty, venue_size, "in_sync");
            return Ok(ReconcileOutcome::InSync);
        }

        log_reconcile(&self.cfg.symbol, local_qty, venue_size, "external_close");
        let direction = self.position.direction;
        let tp = self.position.reset();
        self.cancel_take_profit(tp).await;
        self.after_transition("external_close", price);
        self.record(JournalEntry::ExternalClose { ts: now_ts(), direction, qty: local_qty });

        let again = self.position.last_direction;
        if !self.cfg.reseed_immediately || again == Direction::Flat {
            return Ok(ReconcileOutcome::ExternalClose { reseeded: false });
        }
        let reseeded = self.seed(again, price).await?;
        Ok(ReconcileOutcome::ExternalClose { reseeded })
    }
}
