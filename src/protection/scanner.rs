// =============================================================================
// Protection Scanner — periodic repair of unprotected positions
// =============================================================================
//
// Every sweep:
//   1. reconcile the position tracker (closed positions clear their state)
//   2. run SL tightening on each open position
//   3. for positions not yet marked processed, check the resting orders and
//      place whichever of stop-loss / take-profit is missing
//
// A position is identified by symbol + quantity + entry price, so a position
// that grows or is replaced gets looked at again.  Identities are only marked
// once protection is confirmed; anything unresolved is retried next sweep.
//
// Take-profit coverage is measured in quantity, not presence: the resting
// reduce-only take-profits must add up to the position size.  Missing tiered
// legs are re-placed at their own prices; any remainder goes out as one
// default take-profit.
//
// A symbol is claimed for the whole of one protocol run or one repair, so the
// scanner never places legs for an entry that is still placing its own.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, GatewayResult};
use crate::exit::sl_tightening::entry_stop;
use crate::exit::SlTightener;
use crate::gateway::ExchangeGateway;
use crate::market_data::StopFlag;
use crate::position_tracker::PositionTracker;
use crate::precision::SymbolFilters;
use crate::protection::legs::{place_stop_with_fallback, place_take_profit_with_fallback};
use crate::runtime_config::{ExecutionParams, ProtectionParams};
use crate::status::EngineStatus;
use crate::types::{OpenOrder, Position, Side};

// ---------------------------------------------------------------------------
// Processed identities
// ---------------------------------------------------------------------------

/// Positions already confirmed protected, plus the symbols someone is
/// currently placing orders for.  Shared with the execution protocol, which
/// drops a symbol's entries to request a repair.
#[derive(Default)]
pub struct ProtectionLedger {
    processed: Mutex<HashSet<String>>,
    claimed: Mutex<HashSet<String>>,
}

/// Exclusive right to place or cancel orders on a symbol.  Released on drop.
pub struct SymbolClaim<'a> {
    ledger: &'a ProtectionLedger,
    symbol: String,
}

impl Drop for SymbolClaim<'_> {
    fn drop(&mut self) {
        self.ledger.claimed.lock().remove(&self.symbol);
    }
}

impl ProtectionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(pos: &Position) -> String {
        format!("{}|{}|{}", pos.symbol, pos.quantity, pos.entry_price)
    }

    pub fn is_processed(&self, identity: &str) -> bool {
        self.processed.lock().contains(identity)
    }

    pub fn mark(&self, identity: String) {
        self.processed.lock().insert(identity);
    }

    /// Forget every identity of `symbol` so the next sweep re-checks it.
    pub fn request_repair(&self, symbol: &str) -> usize {
        let prefix = format!("{symbol}|");
        let mut processed = self.processed.lock();
        let before = processed.len();
        processed.retain(|id| !id.starts_with(&prefix));
        before - processed.len()
    }

    /// `None` while another protocol run or repair holds `symbol`.
    pub fn claim(&self, symbol: &str) -> Option<SymbolClaim<'_>> {
        if !self.claimed.lock().insert(symbol.to_string()) {
            return None;
        }
        Some(SymbolClaim { ledger: self, symbol: symbol.to_string() })
    }

    pub fn len(&self) -> usize {
        self.processed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Order classification
// ---------------------------------------------------------------------------

/// Protective orders already resting for a position.  Only closing-side
/// orders that can only shrink the position count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProtectionCoverage {
    pub has_stop: bool,
    /// Summed quantity of reduce-only take-profits.
    pub take_profit_quantity: f64,
    /// A close-position take-profit covers any size.
    pub take_profit_closes_all: bool,
    /// Limit price, or trigger price for conditional take-profits.
    pub take_profit_prices: Vec<f64>,
}

impl ProtectionCoverage {
    pub fn has_take_profit(&self) -> bool {
        self.take_profit_closes_all || self.take_profit_quantity > 0.0
    }

    /// Whole steps of `position_quantity` no take-profit covers yet.
    pub fn uncovered_lots(&self, filters: &SymbolFilters, position_quantity: f64) -> u64 {
        if self.take_profit_closes_all {
            return 0;
        }
        filters
            .to_lots(position_quantity)
            .saturating_sub(filters.to_lots(self.take_profit_quantity))
    }

    fn rests_at(&self, filters: &SymbolFilters, price: f64) -> bool {
        let wanted = filters.format_price(price);
        self.take_profit_prices.iter().any(|p| filters.format_price(*p) == wanted)
    }
}

pub fn classify_orders(orders: &[OpenOrder], position_side: Side) -> ProtectionCoverage {
    let closing = position_side.opposite();
    let mut coverage = ProtectionCoverage::default();
    for o in orders.iter().filter(|o| o.side == closing && (o.reduce_only || o.close_position)) {
        if o.order_type.is_stop() {
            coverage.has_stop = true;
        } else if o.order_type.is_take_profit() {
            if o.close_position {
                coverage.take_profit_closes_all = true;
            } else {
                coverage.take_profit_quantity += o.quantity;
            }
            coverage.take_profit_prices.push(if o.price > 0.0 { o.price } else { o.stop_price });
        }
    }
    coverage
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    AlreadyProtected,
    Repaired,
    Unresolved,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub positions: usize,
    pub skipped: usize,
    /// Positions left alone because an entry or close was placing orders.
    pub in_flight: usize,
    pub already_protected: usize,
    pub repaired: usize,
    pub unresolved: usize,
    pub tightened: usize,
}

pub struct ProtectionScanner {
    gateway: Arc<ExchangeGateway>,
    tracker: Arc<PositionTracker>,
    ledger: Arc<ProtectionLedger>,
    tightener: SlTightener,
    status: Arc<EngineStatus>,
    interval: Duration,
    min_elapsed: Duration,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    last_sweep: Mutex<Option<Instant>>,
}

impl ProtectionScanner {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        tracker: Arc<PositionTracker>,
        ledger: Arc<ProtectionLedger>,
        status: Arc<EngineStatus>,
        protection: &ProtectionParams,
        execution: &ExecutionParams,
    ) -> Self {
        let tightener = SlTightener::new(gateway.clone(), tracker.tightening().clone(), protection, execution);
        Self {
            gateway,
            tracker,
            ledger,
            tightener,
            status,
            interval: Duration::from_secs(protection.scan_interval_secs),
            min_elapsed: Duration::from_secs(protection.scan_min_elapsed_secs),
            stop_loss_pct: execution.stop_loss_pct,
            take_profit_pct: execution.take_profit_pct,
            last_sweep: Mutex::new(None),
        }
    }

    /// Background loop.  Returns once `stop` is raised.
    pub async fn run(&self, stop: StopFlag) {
        info!(interval_secs = self.interval.as_secs(), "protection scanner started");
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if stop.is_stopped() {
                break;
            }
            if let Some(report) = self.sweep().await {
                if report.repaired > 0 || report.unresolved > 0 {
                    info!(
                        positions = report.positions,
                        repaired = report.repaired,
                        unresolved = report.unresolved,
                        tightened = report.tightened,
                        "protection sweep"
                    );
                }
            }
        }
        info!("protection scanner stopped");
    }

    /// One sweep, or `None` when the previous one finished too recently.
    pub async fn sweep(&self) -> Option<SweepReport> {
        {
            let mut last = self.last_sweep.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.min_elapsed {
                    debug!("protection sweep skipped, previous sweep too recent");
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        let positions = match self.tracker.reconcile().await {
            Ok(r) => r.positions,
            Err(e) => {
                warn!(error = %e, "reconciliation failed, sweep aborted");
                self.status.push_error_message(format!("protection sweep: {e}"), None);
                return Some(SweepReport::default());
            }
        };

        let mut report = SweepReport { positions: positions.len(), ..SweepReport::default() };

        for pos in &positions {
            let Some(_claim) = self.ledger.claim(&pos.symbol) else {
                debug!(symbol = %pos.symbol, "orders being placed for symbol, left for next sweep");
                report.in_flight += 1;
                continue;
            };

            match self.tightener.check(pos).await {
                Ok(true) => {
                    report.tightened += 1;
                    self.ledger.request_repair(&pos.symbol);
                }
                Ok(false) => {}
                Err(e) => {
                    self.status.push_error(&e);
                    self.ledger.request_repair(&pos.symbol);
                }
            }

            let identity = ProtectionLedger::identity(pos);
            if self.ledger.is_processed(&identity) {
                report.skipped += 1;
                continue;
            }

            match self.protect(pos).await {
                Ok(RepairOutcome::AlreadyProtected) => {
                    report.already_protected += 1;
                    self.ledger.mark(identity);
                }
                Ok(RepairOutcome::Repaired) => {
                    report.repaired += 1;
                    self.ledger.mark(identity);
                }
                Ok(RepairOutcome::Unresolved) => report.unresolved += 1,
                Err(e) => {
                    report.unresolved += 1;
                    let err = EngineError::from_gateway(&pos.symbol, e);
                    warn!(symbol = %pos.symbol, error = %err, "protection check failed, retrying next sweep");
                    self.status.push_error(&err);
                }
            }
        }

        *self.last_sweep.lock() = Some(Instant::now());
        Some(report)
    }

    async fn protect(&self, pos: &Position) -> GatewayResult<RepairOutcome> {
        let orders = self.gateway.open_orders(&pos.symbol).await?;
        let coverage = classify_orders(&orders, pos.side);
        let filters = self.gateway.symbol_filters(&pos.symbol).await?;
        let uncovered = coverage.uncovered_lots(&filters, pos.quantity);
        if coverage.has_stop && uncovered == 0 {
            return Ok(RepairOutcome::AlreadyProtected);
        }

        warn!(
            symbol = %pos.symbol,
            side = %pos.side,
            quantity = pos.quantity,
            has_stop = coverage.has_stop,
            take_profit_quantity = coverage.take_profit_quantity,
            uncovered = filters.from_lots(uncovered),
            "unprotected position, repairing"
        );

        let closing = pos.side.opposite();
        let mut resolved = true;

        if !coverage.has_stop {
            // A tightened stop survives the repair.
            let tightened = self.tracker.tightening().get(&pos.symbol);
            let stop = match &tightened {
                Some(t) => {
                    if !t.placed {
                        warn!(symbol = %pos.symbol, stop = t.tightened_sl, "tightened stop-loss never acknowledged, placing it");
                    }
                    t.tightened_sl
                }
                None => entry_stop(pos.side, pos.entry_price, self.stop_loss_pct),
            };
            match place_stop_with_fallback(&self.gateway, &filters, closing, pos.quantity, stop).await {
                Ok(ack) => {
                    if tightened.is_some() {
                        self.tracker.tightening().mark_placed(&pos.symbol);
                    }
                    info!(symbol = %pos.symbol, order_id = ack.order_id, stop, "stop-loss restored");
                }
                Err(e) => {
                    error!(symbol = %pos.symbol, error = %e, "stop-loss repair failed");
                    resolved = false;
                }
            }
        }

        if uncovered > 0 && self.restore_take_profit(pos, &filters, &coverage, uncovered).await > 0 {
            resolved = false;
        }

        Ok(if resolved { RepairOutcome::Repaired } else { RepairOutcome::Unresolved })
    }

    /// Cover `uncovered` lots: open tiered legs first, at their own prices,
    /// then one default take-profit for the rest.  Returns the lots still
    /// uncovered.
    async fn restore_take_profit(
        &self,
        pos: &Position,
        filters: &SymbolFilters,
        coverage: &ProtectionCoverage,
        mut uncovered: u64,
    ) -> u64 {
        let closing = pos.side.opposite();

        if let Some(tiers) = self.tracker.tiered().get(&pos.symbol) {
            for (k, leg) in tiers.legs.iter().enumerate().filter(|(_, l)| !l.executed) {
                if uncovered == 0 {
                    break;
                }
                if coverage.rests_at(filters, leg.price) {
                    continue;
                }
                let lots = filters.to_lots(leg.quantity).min(uncovered);
                if lots == 0 {
                    continue;
                }
                let qty = filters.from_lots(lots);
                match self
                    .gateway
                    .submit_reduce_only_limit(
                        &pos.symbol,
                        closing,
                        filters.format_quantity(qty),
                        filters.format_price(leg.price),
                        "tp",
                    )
                    .await
                {
                    Ok(ack) => {
                        uncovered -= lots;
                        info!(symbol = %pos.symbol, leg = k + 1, order_id = ack.order_id, qty, price = leg.price, "tiered take-profit leg restored");
                    }
                    Err(e) => warn!(symbol = %pos.symbol, leg = k + 1, error = %e, "tiered take-profit leg repair failed"),
                }
            }
        }

        if uncovered > 0 {
            let qty = filters.from_lots(uncovered);
            let target = pos.entry_price * (1.0 + pos.side.direction() * self.take_profit_pct);
            match place_take_profit_with_fallback(&self.gateway, filters, closing, qty, target).await {
                Ok(ack) => {
                    uncovered = 0;
                    info!(symbol = %pos.symbol, order_id = ack.order_id, qty, target, "take-profit restored");
                }
                Err(e) => error!(symbol = %pos.symbol, error = %e, "take-profit repair failed"),
            }
        }
        uncovered
    }
}
