// =============================================================================
// Position Tracker — cached account view plus reconciliation
// =============================================================================
//
// Reads go through the gateway's TTL caches unless the caller asks for a
// bypass.  `reconcile()` always reads the exchange directly and compares it
// with the last reconciled view:
//
//   - positions that disappeared are reported closed (trade event + win-rate)
//   - tiered-exit legs are marked executed as the position shrinks
//   - tiered and SL-tightening state is cleared once a position is gone
//   - positions the engine did not open are logged once
//
// SAFETY POLICY: reconciliation never places or cancels orders itself.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::GatewayResult;
use crate::exit::tiered::TierObservation;
use crate::exit::{SlTighteningBook, TieredExitBook};
use crate::gateway::{CacheMode, ExchangeGateway};
use crate::status::EngineStatus;
use crate::trade_events::{TradeEvent, TradeEventSink, TradeStatus};
use crate::types::{Balance, Position};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Every open position on the exchange.
    pub positions: Vec<Position>,
    /// Symbols whose position closed since the previous pass.
    pub closed: Vec<String>,
    /// (symbol, leg index) pairs that executed since the previous pass.
    pub legs_executed: Vec<(String, usize)>,
    /// Positions seen for the first time that the engine did not open.
    pub adopted: Vec<String>,
}

pub struct PositionTracker {
    gateway: Arc<ExchangeGateway>,
    tiered: Arc<TieredExitBook>,
    tightening: Arc<SlTighteningBook>,
    events: TradeEventSink,
    status: Arc<EngineStatus>,
    /// Positions as of the last reconciliation or engine-driven open.
    mirror: Mutex<HashMap<String, Position>>,
}

impl PositionTracker {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        tiered: Arc<TieredExitBook>,
        tightening: Arc<SlTighteningBook>,
        events: TradeEventSink,
        status: Arc<EngineStatus>,
    ) -> Self {
        Self {
            gateway,
            tiered,
            tightening,
            events,
            status,
            mirror: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn balance(&self, mode: CacheMode) -> GatewayResult<Balance> {
        self.gateway.balance(mode).await
    }

    pub async fn open_positions(&self, mode: CacheMode) -> GatewayResult<Vec<Position>> {
        self.gateway.positions(mode).await
    }

    pub async fn position(&self, symbol: &str, mode: CacheMode) -> GatewayResult<Option<Position>> {
        self.gateway.position(symbol, mode).await
    }

    /// Last reconciled view of `symbol`, without touching the network.
    pub fn mirrored(&self, symbol: &str) -> Option<Position> {
        self.mirror.lock().get(symbol).cloned()
    }

    pub fn tiered(&self) -> &Arc<TieredExitBook> {
        &self.tiered
    }

    pub fn tightening(&self) -> &Arc<SlTighteningBook> {
        &self.tightening
    }

    // -------------------------------------------------------------------------
    // Engine-driven changes
    // -------------------------------------------------------------------------

    /// Note a position the engine just opened.
    pub fn record_open(&self, pos: Position) {
        self.mirror.lock().insert(pos.symbol.clone(), pos);
    }

    /// Drop `symbol` from the mirror after the engine closed it itself and
    /// already reported the close.
    pub fn forget(&self, symbol: &str) {
        self.mirror.lock().remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    pub async fn reconcile(&self) -> GatewayResult<ReconcileReport> {
        let positions = self.gateway.positions(CacheMode::Bypass).await?;
        let current: HashMap<String, Position> =
            positions.iter().map(|p| (p.symbol.clone(), p.clone())).collect();

        let previous = {
            let mut mirror = self.mirror.lock();
            std::mem::replace(&mut *mirror, current.clone())
        };

        let mut report = ReconcileReport {
            positions,
            ..ReconcileReport::default()
        };

        for (symbol, last_seen) in &previous {
            if current.contains_key(symbol) {
                continue;
            }
            let pnl = last_seen.unrealized_pnl;
            info!(symbol = %symbol, side = %last_seen.side, pnl, "position closed on exchange");
            self.status.record_close(pnl);

            let mut event = TradeEvent::new(
                symbol,
                last_seen.side,
                last_seen.entry_price,
                last_seen.quantity,
                TradeStatus::Closed,
            );
            event.leverage = last_seen.leverage;
            event.pnl = Some(pnl);
            self.events.emit(event);
            report.closed.push(symbol.clone());
        }

        for (symbol, pos) in &current {
            if !previous.contains_key(symbol) && self.tiered.get(symbol).is_none() {
                info!(
                    symbol = %symbol,
                    side = %pos.side,
                    quantity = pos.quantity,
                    entry = pos.entry_price,
                    "tracking position opened outside this session"
                );
                report.adopted.push(symbol.clone());
            }
        }

        for symbol in self.tiered.symbols() {
            match self.tiered.observe(&symbol, current.get(&symbol).map(|p| p.quantity)) {
                TierObservation::LegsExecuted(legs) => {
                    report.legs_executed.extend(legs.into_iter().map(|i| (symbol.clone(), i)));
                }
                TierObservation::Closed(_) => debug!(symbol = %symbol, "tiered exit state cleared"),
                TierObservation::Unchanged | TierObservation::Untracked => {}
            }
        }

        for symbol in self.tightening.symbols() {
            if !current.contains_key(&symbol) && self.tightening.clear(&symbol) {
                debug!(symbol = %symbol, "sl tightening state cleared");
            }
        }

        debug!(
            open = report.positions.len(),
            closed = report.closed.len(),
            legs_executed = report.legs_executed.len(),
            "reconciliation complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::exit::TieredExitState;
    use crate::test_support::{gateway_over, long_position, MockExchange};
    use crate::types::Side;

    struct Fixture {
        mock: Arc<MockExchange>,
        tracker: PositionTracker,
        tiered: Arc<TieredExitBook>,
        tightening: Arc<SlTighteningBook>,
        status: Arc<EngineStatus>,
        rx: tokio::sync::mpsc::Receiver<TradeEvent>,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockExchange::new());
        let tiered = Arc::new(TieredExitBook::new());
        let tightening = Arc::new(SlTighteningBook::new());
        let status = Arc::new(EngineStatus::new());
        let (events, rx) = TradeEventSink::channel(16);
        let tracker = PositionTracker::new(gateway_over(&mock), tiered.clone(), tightening.clone(), events, status.clone());
        Fixture { mock, tracker, tiered, tightening, status, rx }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_position_emits_event_and_clears_state() {
        let mut f = fixture();
        let mut pos = long_position("BTCUSDT", 1.0, 100.0);
        pos.unrealized_pnl = 3.0;
        f.mock.set_position(pos);
        f.tiered.insert("BTCUSDT", TieredExitState::new(Side::Buy, 1.0, vec![(0.5, 101.0), (0.5, 102.0)]));
        f.tightening.try_claim("BTCUSDT", 98.0, 99.0);

        let first = f.tracker.reconcile().await.unwrap();
        assert_eq!(first.positions.len(), 1);
        assert!(first.closed.is_empty());

        f.mock.clear_position("BTCUSDT");
        let second = f.tracker.reconcile().await.unwrap();
        assert_eq!(second.closed, vec!["BTCUSDT".to_string()]);
        assert!(f.tiered.get("BTCUSDT").is_none());
        assert!(!f.tightening.is_tightened("BTCUSDT"));

        let ev = f.rx.recv().await.unwrap();
        assert_eq!(ev.status, TradeStatus::Closed);
        assert_eq!(ev.pnl, Some(3.0));
        assert_eq!(f.status.snapshot(None).wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_position_marks_tier_legs() {
        let f = fixture();
        f.mock.set_position(long_position("ETHUSDT", 1.0, 100.0));
        f.tiered.insert("ETHUSDT", TieredExitState::new(Side::Buy, 1.0, vec![(0.5, 101.0), (0.5, 102.0)]));
        f.tracker.record_open(long_position("ETHUSDT", 1.0, 100.0));

        f.mock.set_position(long_position("ETHUSDT", 0.5, 100.0));
        let report = f.tracker.reconcile().await.unwrap();
        assert_eq!(report.legs_executed, vec![("ETHUSDT".to_string(), 0)]);
        assert!(report.adopted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_positions_are_adopted_once() {
        let f = fixture();
        f.mock.set_position(long_position("SOLUSDT", 3.0, 20.0));
        assert_eq!(f.tracker.reconcile().await.unwrap().adopted, vec!["SOLUSDT".to_string()]);
        assert!(f.tracker.reconcile().await.unwrap().adopted.is_empty());
        assert!(f.tracker.mirrored("SOLUSDT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_keeps_previous_view() {
        let f = fixture();
        f.mock.set_position(long_position("BTCUSDT", 1.0, 100.0));
        f.tracker.reconcile().await.unwrap();

        f.mock.fail_next_positions(GatewayError::Timeout(10_000));
        assert!(f.tracker.reconcile().await.is_err());
        assert!(f.tracker.mirrored("BTCUSDT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_position_is_not_reported_twice() {
        let mut f = fixture();
        f.tracker.record_open(long_position("BTCUSDT", 1.0, 100.0));
        f.tracker.forget("BTCUSDT");
        let report = f.tracker.reconcile().await.unwrap();
        assert!(report.closed.is_empty());
        assert!(f.rx.try_recv().is_err());
    }
}
