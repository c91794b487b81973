// =============================================================================
// Stop-Loss Tightening — pull the stop toward entry once a trade is in profit
// =============================================================================
//
// Triggers when unrealised pnl / entry notional exceeds `tighten_threshold`
// (profit only).  Existing protective orders are cancelled and a new
// full-quantity stop is placed at
//
//   long:  entry × (1 − stop_loss_pct × tighten_ratio)
//   short: entry × (1 + stop_loss_pct × tighten_ratio)
//
// The per-symbol flag is claimed under the book's mutex before any remote
// call, together with the tightened price.  If nothing was cancelled yet the
// claim is released and the next sweep tries again.  Once the old orders are
// gone the claim stays until reconciliation sees the position closed, and
// the repair sweep places the stop at the recorded tightened price.
// Cancelling also removes the take-profits; the repair sweep restores them,
// tiered legs at their own prices.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::gateway::ExchangeGateway;
use crate::protection::legs::place_stop_with_fallback;
use crate::runtime_config::{ExecutionParams, ProtectionParams};
use crate::types::{Position, Side};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlTighteningState {
    pub tightened: bool,
    pub original_sl: f64,
    /// Stop price protection must use from the moment of the claim.
    pub tightened_sl: f64,
    /// The tightened stop was acknowledged by the exchange.
    pub placed: bool,
}

#[derive(Default)]
pub struct SlTighteningBook {
    states: Mutex<HashMap<String, SlTighteningState>>,
}

impl SlTighteningBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark `symbol` as tightened to `tightened_sl`.  Returns
    /// `false` if it already was.
    pub fn try_claim(&self, symbol: &str, original_sl: f64, tightened_sl: f64) -> bool {
        let mut states = self.states.lock();
        match states.get(symbol) {
            Some(s) if s.tightened => false,
            _ => {
                states.insert(
                    symbol.to_string(),
                    SlTighteningState { tightened: true, original_sl, tightened_sl, placed: false },
                );
                true
            }
        }
    }

    pub fn mark_placed(&self, symbol: &str) {
        if let Some(s) = self.states.lock().get_mut(symbol) {
            s.placed = true;
        }
    }

    pub fn get(&self, symbol: &str) -> Option<SlTighteningState> {
        self.states.lock().get(symbol).cloned()
    }

    pub fn is_tightened(&self, symbol: &str) -> bool {
        self.states.lock().get(symbol).is_some_and(|s| s.tightened)
    }

    pub fn clear(&self, symbol: &str) -> bool {
        self.states.lock().remove(symbol).is_some()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.states.lock().keys().cloned().collect()
    }
}

/// Stop price after tightening.
pub fn tightened_stop(side: Side, entry: f64, stop_loss_pct: f64, tighten_ratio: f64) -> f64 {
    entry * (1.0 - side.direction() * stop_loss_pct * tighten_ratio)
}

pub struct SlTightener {
    gateway: Arc<ExchangeGateway>,
    book: Arc<SlTighteningBook>,
    enabled: bool,
    threshold: f64,
    tighten_ratio: f64,
    stop_loss_pct: f64,
}

impl SlTightener {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        book: Arc<SlTighteningBook>,
        protection: &ProtectionParams,
        execution: &ExecutionParams,
    ) -> Self {
        Self {
            gateway,
            book,
            enabled: protection.enable_sl_tightening,
            threshold: protection.tighten_threshold,
            tighten_ratio: protection.tighten_ratio,
            stop_loss_pct: execution.stop_loss_pct,
        }
    }

    /// Tighten `pos` if it qualifies.  `Ok(true)` means protective orders were
    /// replaced and the take-profit must be restored.
    pub async fn check(&self, pos: &Position) -> Result<bool, EngineError> {
        if !self.enabled || pos.entry_price <= 0.0 {
            return Ok(false);
        }
        let ratio = pos.pnl_ratio();
        if ratio <= self.threshold {
            return Ok(false);
        }

        let original = entry_stop(pos.side, pos.entry_price, self.stop_loss_pct);
        let new_stop = tightened_stop(pos.side, pos.entry_price, self.stop_loss_pct, self.tighten_ratio);
        if !self.book.try_claim(&pos.symbol, original, new_stop) {
            return Ok(false);
        }

        info!(
            symbol = %pos.symbol,
            pnl_ratio = ratio,
            threshold = self.threshold,
            original_sl = original,
            new_sl = new_stop,
            "profit threshold crossed, tightening stop-loss"
        );

        let filters = match self.gateway.symbol_filters(&pos.symbol).await {
            Ok(f) => f,
            Err(e) => {
                self.book.clear(&pos.symbol);
                return Err(EngineError::from_gateway(&pos.symbol, e));
            }
        };

        if let Err(e) = self.gateway.cancel_all_orders(&pos.symbol).await {
            // Old orders may still rest; release so the next sweep retries.
            self.book.clear(&pos.symbol);
            warn!(symbol = %pos.symbol, error = %e, "cancel before tightening failed, will retry");
            return Err(EngineError::from_gateway(&pos.symbol, e));
        }

        match place_stop_with_fallback(&self.gateway, &filters, pos.side.opposite(), pos.quantity, new_stop).await {
            Ok(ack) => {
                self.book.mark_placed(&pos.symbol);
                info!(symbol = %pos.symbol, order_id = ack.order_id, new_sl = new_stop, "tightened stop-loss placed");
                Ok(true)
            }
            Err(e) => {
                warn!(symbol = %pos.symbol, error = %e, "tightened stop-loss failed, repair sweep will restore protection");
                Err(EngineError::from_gateway(&pos.symbol, e))
            }
        }
    }
}

/// Stop price at entry for the default stop distance.
pub fn entry_stop(side: Side, entry: f64, stop_loss_pct: f64) -> f64 {
    entry * (1.0 - side.direction() * stop_loss_pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::test_support::{gateway_over, long_position, short_position, MockExchange};
    use crate::types::OrderType;

    fn tightener(mock: &Arc<MockExchange>, book: &Arc<SlTighteningBook>) -> SlTightener {
        let protection = ProtectionParams {
            tighten_threshold: 0.005,
            tighten_ratio: 0.5,
            ..ProtectionParams::default()
        };
        let execution = ExecutionParams { stop_loss_pct: 0.02, ..ExecutionParams::default() };
        SlTightener::new(gateway_over(mock), book.clone(), &protection, &execution)
    }

    #[test]
    fn tightened_stop_is_side_aware() {
        assert!((tightened_stop(Side::Buy, 100.0, 0.02, 0.5) - 99.0).abs() < 1e-9);
        assert!((tightened_stop(Side::Sell, 100.0, 0.02, 0.5) - 101.0).abs() < 1e-9);
        assert!((entry_stop(Side::Buy, 100.0, 0.02) - 98.0).abs() < 1e-9);
    }

    #[test]
    fn claim_is_exclusive_until_cleared() {
        let book = SlTighteningBook::new();
        assert!(book.try_claim("BTCUSDT", 98.0, 99.0));
        assert!(!book.try_claim("BTCUSDT", 98.0, 99.0));
        assert_eq!(book.get("BTCUSDT").unwrap().tightened_sl, 99.0);
        assert!(book.clear("BTCUSDT"));
        assert!(book.try_claim("BTCUSDT", 98.0, 99.0));
    }

    #[tokio::test(start_paused = true)]
    async fn below_threshold_or_loss_does_nothing() {
        let mock = Arc::new(MockExchange::new());
        let book = Arc::new(SlTighteningBook::new());
        let t = tightener(&mock, &book);

        let mut pos = long_position("BTCUSDT", 1.0, 100.0);
        pos.unrealized_pnl = 0.4; // 0.4 %
        assert!(!t.check(&pos).await.unwrap());
        pos.unrealized_pnl = -5.0;
        assert!(!t.check(&pos).await.unwrap());
        assert!(mock.submitted().is_empty());
        assert!(!book.is_tightened("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn tightens_once_per_position() {
        let mock = Arc::new(MockExchange::new());
        mock.set_position(short_position("ETHUSDT", 2.0, 100.0));
        mock.add_open_order("ETHUSDT", Side::Buy, OrderType::StopMarket, 2.0, true);
        let book = Arc::new(SlTighteningBook::new());
        let t = tightener(&mock, &book);

        let mut pos = short_position("ETHUSDT", 2.0, 100.0);
        pos.unrealized_pnl = 2.0; // 1 %
        assert!(t.check(&pos).await.unwrap());
        assert!(!t.check(&pos).await.unwrap());

        let resting = mock.resting_orders("ETHUSDT");
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].order_type, OrderType::StopMarket);
        assert_eq!(resting[0].side, Side::Buy);
        assert!((resting[0].stop_price - 101.0).abs() < 1e-9);
        assert_eq!(resting[0].quantity, 2.0);
        assert_eq!(mock.cancels(), vec!["ETHUSDT".to_string()]);

        let state = book.get("ETHUSDT").unwrap();
        assert!((state.tightened_sl - 101.0).abs() < 1e-9);
        assert!(state.placed);
        assert!((state.original_sl - 102.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_releases_the_claim() {
        let mock = Arc::new(MockExchange::new());
        mock.set_position(long_position("BTCUSDT", 1.0, 100.0));
        mock.add_open_order("BTCUSDT", Side::Sell, OrderType::StopMarket, 1.0, true);
        mock.fail_next_cancel(GatewayError::Network("reset".into()));
        let book = Arc::new(SlTighteningBook::new());
        let t = tightener(&mock, &book);

        let mut pos = long_position("BTCUSDT", 1.0, 100.0);
        pos.unrealized_pnl = 1.0;
        assert!(t.check(&pos).await.is_err());
        assert!(!book.is_tightened("BTCUSDT"));

        assert!(t.check(&pos).await.unwrap());
        assert!(book.get("BTCUSDT").unwrap().placed);
        let resting = mock.resting_orders("BTCUSDT");
        assert_eq!(resting.len(), 1);
        assert!((resting[0].stop_price - 99.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_placement_keeps_the_tightened_price() {
        let mock = Arc::new(MockExchange::new());
        mock.set_position(long_position("BTCUSDT", 1.0, 100.0));
        mock.fail_next_order(OrderType::StopMarket, GatewayError::Timeout(10_000));
        let book = Arc::new(SlTighteningBook::new());
        let t = tightener(&mock, &book);

        let mut pos = long_position("BTCUSDT", 1.0, 100.0);
        pos.unrealized_pnl = 1.0;
        assert!(t.check(&pos).await.is_err());

        let state = book.get("BTCUSDT").unwrap();
        assert!(state.tightened);
        assert!(!state.placed);
        assert!((state.tightened_sl - 99.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_tightener_is_inert() {
        let mock = Arc::new(MockExchange::new());
        let book = Arc::new(SlTighteningBook::new());
        let protection = ProtectionParams { enable_sl_tightening: false, ..ProtectionParams::default() };
        let t = SlTightener::new(gateway_over(&mock), book, &protection, &ExecutionParams::default());
        let mut pos = long_position("BTCUSDT", 1.0, 100.0);
        pos.unrealized_pnl = 50.0;
        assert!(!t.check(&pos).await.unwrap());
    }
}
