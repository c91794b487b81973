// =============================================================================
// Tiered Exit Book — per-symbol partial take-profit legs
// =============================================================================
//
// A tiered entry splits the take-profit into N reduce-only limit legs whose
// quantities are cumulative fractions of the position.  The book remembers
// the legs so reconciliation can tell which have executed (the position
// shrank by at least the cumulative leg quantity) and drop the state once
// the position is gone.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::types::Side;

/// Absorbs float noise when comparing exchange quantities.
const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierLeg {
    pub quantity: f64,
    pub price: f64,
    pub executed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredExitState {
    pub side: Side,
    pub original_quantity: f64,
    pub legs: Vec<TierLeg>,
    pub created_at: DateTime<Utc>,
}

impl TieredExitState {
    pub fn new(side: Side, original_quantity: f64, legs: Vec<(f64, f64)>) -> Self {
        Self {
            side,
            original_quantity,
            legs: legs
                .into_iter()
                .map(|(quantity, price)| TierLeg { quantity, price, executed: false })
                .collect(),
            created_at: Utc::now(),
        }
    }
}

/// What reconciliation learned about a tiered position.
#[derive(Debug, Clone, PartialEq)]
pub enum TierObservation {
    /// No state for the symbol.
    Untracked,
    /// The position is gone; the state was removed.
    Closed(TieredExitState),
    /// These leg indices just flipped to executed.
    LegsExecuted(Vec<usize>),
    Unchanged,
}

/// Split `total_lots` into legs for cumulative `ratios`.
///
/// Leg k gets `floor(ratio_k × total) − already allocated`, so the legs never
/// sum to more than `total_lots` and sum to exactly `total_lots` when the last
/// ratio is 1.0.
pub fn split_lots(total_lots: u64, ratios: &[f64]) -> Vec<u64> {
    let mut allocated = 0u64;
    ratios
        .iter()
        .map(|ratio| {
            let target = ((ratio.clamp(0.0, 1.0) * total_lots as f64) + QTY_EPSILON).floor() as u64;
            let leg = target.min(total_lots).saturating_sub(allocated);
            allocated += leg;
            leg
        })
        .collect()
}

#[derive(Default)]
pub struct TieredExitBook {
    states: Mutex<HashMap<String, TieredExitState>>,
}

impl TieredExitBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, symbol: &str, state: TieredExitState) {
        self.states.lock().insert(symbol.to_string(), state);
    }

    pub fn get(&self, symbol: &str) -> Option<TieredExitState> {
        self.states.lock().get(symbol).cloned()
    }

    pub fn remove(&self, symbol: &str) -> Option<TieredExitState> {
        self.states.lock().remove(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.states.lock().keys().cloned().collect()
    }

    /// Compare the stored legs with the position's current size (`None` when
    /// the exchange shows no position).
    pub fn observe(&self, symbol: &str, current_quantity: Option<f64>) -> TierObservation {
        let mut states = self.states.lock();

        let remaining = match current_quantity {
            Some(q) if q > QTY_EPSILON => q,
            _ => {
                return match states.remove(symbol) {
                    Some(state) => TierObservation::Closed(state),
                    None => TierObservation::Untracked,
                };
            }
        };

        let Some(state) = states.get_mut(symbol) else {
            return TierObservation::Untracked;
        };

        let shrink = state.original_quantity - remaining;
        let mut cumulative = 0.0;
        let mut newly_executed = Vec::new();
        for (i, leg) in state.legs.iter_mut().enumerate() {
            cumulative += leg.quantity;
            if !leg.executed && shrink + QTY_EPSILON >= cumulative {
                leg.executed = true;
                newly_executed.push(i);
                info!(symbol, leg = i + 1, quantity = leg.quantity, price = leg.price, "tiered exit leg executed");
            }
        }

        if newly_executed.is_empty() {
            TierObservation::Unchanged
        } else {
            TierObservation::LegsExecuted(newly_executed)
        }
    }
}
