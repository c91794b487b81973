// =============================================================================
// Order Execution Protocol — entry plus protective legs
// =============================================================================
//
//   Idle → EntrySubmitted → EntryFilled → ProtectionPlacing
//        → Protected | PartiallyProtected → Done
//   Failed is reachable from every state.
//
// The sequence never propagates an error: every outcome is folded into an
// `ExecutionReport`.  Missing legs are handed to the protection scanner by
// dropping the symbol's processed identities.  When nothing at all could be
// placed the position is closed with a reduce-only market order (if
// `close_unprotected` is set).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, LegKind};
use crate::execution::decision::{plan_protection, DecisionRecord, SizingInputs, SizingPolicy};
use crate::exit::tiered::split_lots;
use crate::exit::TieredExitState;
use crate::gateway::{CacheMode, ExchangeGateway};
use crate::position_tracker::PositionTracker;
use crate::precision::SymbolFilters;
use crate::protection::scanner::ProtectionLedger;
use crate::runtime_config::ExecutionParams;
use crate::status::EngineStatus;
use crate::trade_events::{TradeEvent, TradeEventSink, TradeStatus};
use crate::types::{OrderType, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolState {
    Idle,
    EntrySubmitted,
    EntryFilled,
    ProtectionPlacing,
    Protected,
    PartiallyProtected,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionOutcome {
    Protected,
    PartiallyProtected,
    Failed,
    /// The decision was dropped before any order (size too small).
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub symbol: String,
    pub side: Side,
    pub outcome: ExecutionOutcome,
    pub transitions: Vec<ProtocolState>,
    pub entry_order_id: Option<i64>,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profits: Vec<f64>,
    pub placed: Vec<LegKind>,
    pub missing: Vec<LegKind>,
    /// At least `min_protective_legs` of {SL, TP1, TP2} were placed.
    pub protected_enough: bool,
    pub emergency_closed: bool,
    pub reason: Option<String>,
    pub error: Option<EngineError>,
}

impl ExecutionReport {
    fn new(decision: &DecisionRecord) -> Self {
        Self {
            symbol: decision.symbol.clone(),
            side: decision.side,
            outcome: ExecutionOutcome::Failed,
            transitions: vec![ProtocolState::Idle],
            entry_order_id: None,
            quantity: 0.0,
            entry_price: 0.0,
            stop_loss: None,
            take_profits: Vec::new(),
            placed: Vec::new(),
            missing: Vec::new(),
            protected_enough: false,
            emergency_closed: false,
            reason: None,
            error: None,
        }
    }

    fn enter(&mut self, state: ProtocolState) {
        debug!(symbol = %self.symbol, ?state, "protocol transition");
        self.transitions.push(state);
    }

    fn fail(mut self, err: EngineError) -> Self {
        self.enter(ProtocolState::Failed);
        self.outcome = ExecutionOutcome::Failed;
        self.reason = Some(err.to_string());
        self.error = Some(err);
        self
    }

    fn skip(mut self, reason: String) -> Self {
        info!(symbol = %self.symbol, %reason, "decision skipped");
        self.outcome = ExecutionOutcome::Skipped;
        self.reason = Some(reason);
        self
    }

    pub fn state(&self) -> ProtocolState {
        self.transitions.last().copied().unwrap_or(ProtocolState::Idle)
    }

    /// An entry order was accepted by the exchange.
    pub fn entered(&self) -> bool {
        self.entry_order_id.is_some()
    }

    fn record_leg(&mut self, leg: LegKind, placed: bool) {
        if placed {
            self.placed.push(leg);
        } else {
            self.missing.push(leg);
        }
    }
}

/// Legs counted by the protection policy: SL, TP1, TP2.
fn core_legs(legs: &[LegKind]) -> usize {
    legs.iter()
        .filter(|l| matches!(l, LegKind::StopLoss | LegKind::TakeProfit(0) | LegKind::TakeProfit(1)))
        .count()
}

pub struct OrderExecutionProtocol {
    gateway: Arc<ExchangeGateway>,
    tracker: Arc<PositionTracker>,
    ledger: Arc<ProtectionLedger>,
    events: TradeEventSink,
    status: Arc<EngineStatus>,
    sizing: Box<dyn SizingPolicy>,
    params: ExecutionParams,
    leverage: u32,
}

impl OrderExecutionProtocol {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        tracker: Arc<PositionTracker>,
        ledger: Arc<ProtectionLedger>,
        events: TradeEventSink,
        status: Arc<EngineStatus>,
        params: ExecutionParams,
        leverage: u32,
    ) -> Self {
        let sizing = crate::execution::decision::sizing_policy(&params.sizing);
        Self {
            gateway,
            tracker,
            ledger,
            events,
            status,
            sizing,
            params,
            leverage,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    #[instrument(skip(self, decision), fields(symbol = %decision.symbol, side = %decision.side))]
    pub async fn execute(&self, decision: &DecisionRecord) -> ExecutionReport {
        let symbol = decision.symbol.as_str();
        let side = decision.side;
        let mut report = ExecutionReport::new(decision);

        let filters = match self.gateway.symbol_filters(symbol).await {
            Ok(f) => f,
            Err(e) => return self.entry_failed(report, EngineError::from_gateway(symbol, e)),
        };

        let reference_price = match decision.entry_price {
            Some(p) if p.is_finite() && p > 0.0 => p,
            _ => match self.gateway.last_price(symbol).await {
                Ok(p) => p,
                Err(e) => return self.entry_failed(report, EngineError::from_gateway(symbol, e)),
            },
        };

        let raw_quantity = match decision.quantity {
            Some(q) => q,
            None => match self.tracker.balance(CacheMode::Cached).await {
                Ok(b) => self.sizing.quantity(&SizingInputs {
                    wallet_balance: b.wallet,
                    leverage: self.leverage,
                    price: reference_price,
                }),
                Err(e) => return self.entry_failed(report, EngineError::from_gateway(symbol, e)),
            },
        };
        let quantity = filters.truncate_quantity(raw_quantity);
        if filters.to_lots(quantity) == 0 || quantity < filters.min_qty {
            return report.skip(format!("quantity {raw_quantity} below one step"));
        }
        let notional = quantity * reference_price;
        if notional < filters.min_notional {
            return report.skip(format!("notional {notional:.2} below minimum {}", filters.min_notional));
        }
        report.quantity = quantity;

        // Held until the run returns; the scanner leaves the symbol alone meanwhile.
        let Some(_claim) = self.ledger.claim(symbol) else {
            return report.skip("another execution or close in progress for symbol".to_string());
        };

        // 1. orphan cleanup
        if let Err(e) = self.gateway.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "orphan cleanup failed, continuing with entry");
        }
        tokio::time::sleep(Self::ms(self.params.cleanup_settle_ms)).await;

        // 2. market entry
        report.enter(ProtocolState::EntrySubmitted);
        let ack = match self
            .gateway
            .submit_market_order(symbol, side, filters.format_quantity(quantity), false, "entry")
            .await
        {
            Ok(ack) => ack,
            Err(e) => return self.entry_failed(report, EngineError::from_gateway(symbol, e)),
        };
        report.entry_order_id = Some(ack.order_id);
        self.status.record_entry(true);
        info!(symbol, %side, quantity, order_id = ack.order_id, "entry order accepted");

        // 3. confirm the fill
        tokio::time::sleep(Self::ms(self.params.entry_settle_ms)).await;
        report.entry_price = match self.gateway.position(symbol, CacheMode::Bypass).await {
            Ok(Some(pos)) if pos.side == side => {
                let price = pos.entry_price;
                self.tracker.record_open(pos);
                price
            }
            Ok(_) => {
                warn!(symbol, "position not visible after entry, using reference price");
                reference_price
            }
            Err(e) => {
                warn!(symbol, error = %e, "position read failed after entry, using reference price");
                reference_price
            }
        };
        report.enter(ProtocolState::EntryFilled);

        self.protect(decision, &filters, report).await
    }

    fn entry_failed(&self, report: ExecutionReport, err: EngineError) -> ExecutionReport {
        error!(symbol = %report.symbol, error = %err, "entry failed");
        self.status.record_entry(false);
        self.status.push_error(&err);
        report.fail(err)
    }

    // -------------------------------------------------------------------------
    // Protective legs
    // -------------------------------------------------------------------------

    async fn protect(&self, decision: &DecisionRecord, filters: &SymbolFilters, mut report: ExecutionReport) -> ExecutionReport {
        report.enter(ProtocolState::ProtectionPlacing);
        let symbol = decision.symbol.as_str();
        let side = decision.side;
        let closing = side.opposite();
        let quantity = report.quantity;

        let ratios = &self.params.tier_ratios;
        let tiered = decision.tiered && ratios.len() > 1;
        let plan = plan_protection(decision, report.entry_price, if tiered { ratios.len() } else { 1 }, &self.params);
        if !plan.is_valid() {
            let err = EngineError::Unexpected {
                symbol: symbol.to_string(),
                reason: format!("invalid protective prices sl={} tp={:?}", plan.stop_loss, plan.take_profits),
            };
            return self.abort_protection(report, err).await;
        }
        report.stop_loss = Some(plan.stop_loss);
        report.take_profits = plan.take_profits.clone();

        // 4. stop-loss
        let sl = self
            .gateway
            .submit_stop_order(
                symbol,
                closing,
                OrderType::StopMarket,
                filters.format_quantity(quantity),
                filters.format_price(plan.stop_loss),
                None,
                "sl",
            )
            .await;
        if let Err(e) = &sl {
            warn!(symbol, error = %e, stop = plan.stop_loss, "stop-loss placement failed");
        }
        report.record_leg(LegKind::StopLoss, sl.is_ok());

        // 5. take-profit leg(s)
        if tiered {
            let legs = split_lots(filters.to_lots(quantity), ratios);
            let mut tracked = Vec::with_capacity(legs.len());
            for (k, (lots, target)) in legs.into_iter().zip(plan.take_profits.iter().copied()).enumerate() {
                if lots == 0 {
                    continue;
                }
                let leg_qty = filters.from_lots(lots);
                tracked.push((leg_qty, target));
                tokio::time::sleep(Self::ms(self.params.leg_settle_ms)).await;
                let tp = self
                    .gateway
                    .submit_reduce_only_limit(
                        symbol,
                        closing,
                        filters.format_quantity(leg_qty),
                        filters.format_price(target),
                        "tp",
                    )
                    .await;
                if let Err(e) = &tp {
                    warn!(symbol, leg = k + 1, error = %e, target, "take-profit leg failed");
                }
                report.record_leg(LegKind::TakeProfit(k), tp.is_ok());
            }
            self.tracker.tiered().insert(symbol, TieredExitState::new(side, quantity, tracked));
        } else {
            tokio::time::sleep(Self::ms(self.params.leg_settle_ms)).await;
            let target = plan.take_profits[0];
            let tp = self
                .gateway
                .submit_stop_order(
                    symbol,
                    closing,
                    OrderType::TakeProfitMarket,
                    filters.format_quantity(quantity),
                    filters.format_price(target),
                    None,
                    "tp",
                )
                .await;
            if let Err(e) = &tp {
                warn!(symbol, error = %e, target, "take-profit placement failed");
            }
            report.record_leg(LegKind::TakeProfit(0), tp.is_ok());
        }

        // 6. outcome
        let candidates = core_legs(&report.placed) + core_legs(&report.missing);
        let required = self.params.min_protective_legs.min(candidates);
        report.protected_enough = core_legs(&report.placed) >= required;

        if report.placed.is_empty() {
            return self.unprotected(filters, report).await;
        }

        let status = if report.missing.is_empty() {
            report.enter(ProtocolState::Protected);
            report.outcome = ExecutionOutcome::Protected;
            info!(symbol, quantity, entry = report.entry_price, "position protected");
            TradeStatus::Opened
        } else {
            report.enter(ProtocolState::PartiallyProtected);
            report.outcome = ExecutionOutcome::PartiallyProtected;
            let err = EngineError::PartialProtectionFailure {
                symbol: symbol.to_string(),
                missing: report.missing.clone(),
            };
            if report.protected_enough {
                warn!(symbol, error = %err, "position partially protected, repair queued");
            } else {
                error!(symbol, error = %err, required, "position below protection policy, repair queued");
            }
            self.ledger.request_repair(symbol);
            self.status.push_error(&err);
            report.error = Some(err);
            TradeStatus::PartiallyProtected
        };

        self.events.emit(self.trade_event(decision, &report, status));
        report.enter(ProtocolState::Done);
        report
    }

    /// Nothing could be placed.  Close the position or hand it to the scanner.
    async fn unprotected(&self, filters: &SymbolFilters, report: ExecutionReport) -> ExecutionReport {
        let symbol = report.symbol.clone();
        let err = EngineError::PartialProtectionFailure {
            symbol: symbol.clone(),
            missing: report.missing.clone(),
        };
        self.status.push_error(&err);

        if !self.params.close_unprotected {
            error!(%symbol, "no protective leg placed, repair queued");
            self.ledger.request_repair(&symbol);
            return report.fail(err);
        }

        error!(%symbol, "no protective leg placed, closing position");
        let mut report = report;
        match self
            .market_close(&symbol, report.side, report.quantity, filters, TradeStatus::EmergencyClosed, None)
            .await
        {
            Ok(()) => report.emergency_closed = true,
            Err(close_err) => {
                error!(%symbol, error = %close_err, "emergency close failed, repair queued");
                self.status.push_error(&close_err);
                self.ledger.request_repair(&symbol);
            }
        }
        report.fail(err)
    }

    /// Unexpected mid-sequence failure: pull every order and let the scanner
    /// rebuild protection from defaults.
    async fn abort_protection(&self, report: ExecutionReport, err: EngineError) -> ExecutionReport {
        let symbol = report.symbol.as_str();
        error!(symbol, error = %err, "protection sequence aborted");
        if let Err(e) = self.gateway.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "cancel after abort failed");
        }
        self.ledger.request_repair(symbol);
        self.status.push_error(&err);
        report.fail(err)
    }

    fn trade_event(&self, decision: &DecisionRecord, report: &ExecutionReport, status: TradeStatus) -> TradeEvent {
        let mut event = TradeEvent::new(&report.symbol, report.side, report.entry_price, report.quantity, status);
        event.tp = report.take_profits.first().copied();
        event.sl = report.stop_loss;
        event.leverage = self.leverage;
        event.strategy = decision.strategy.clone();
        event
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close `symbol`'s position at market.  Returns the pnl reported at close,
    /// or `None` when there was no position.
    #[instrument(skip(self))]
    pub async fn close_position(&self, symbol: &str) -> Result<Option<f64>, EngineError> {
        let Some(_claim) = self.ledger.claim(symbol) else {
            return Err(EngineError::Unexpected {
                symbol: symbol.to_string(),
                reason: "orders are being placed for this symbol, retry shortly".to_string(),
            });
        };

        let pos = self
            .gateway
            .position(symbol, CacheMode::Bypass)
            .await
            .map_err(|e| EngineError::from_gateway(symbol, e))?;

        let Some(pos) = pos else {
            self.clear_symbol_state(symbol);
            return Ok(None);
        };

        let filters = self
            .gateway
            .symbol_filters(symbol)
            .await
            .map_err(|e| EngineError::from_gateway(symbol, e))?;

        let pnl = pos.unrealized_pnl;
        self.market_close(symbol, pos.side, pos.quantity, &filters, TradeStatus::Closed, Some(pnl))
            .await?;
        Ok(Some(pnl))
    }

    async fn market_close(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        filters: &SymbolFilters,
        status: TradeStatus,
        pnl: Option<f64>,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.gateway.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "cancel before close failed");
        }
        self.gateway
            .submit_market_order(symbol, side.opposite(), filters.format_quantity(quantity), true, "close")
            .await
            .map_err(|e| EngineError::from_gateway(symbol, e))?;

        self.clear_symbol_state(symbol);
        if let Some(pnl) = pnl {
            self.status.record_close(pnl);
        }

        let entry = self.tracker.mirrored(symbol).map(|p| p.entry_price).unwrap_or_default();
        let mut event = TradeEvent::new(symbol, side, entry, quantity, status);
        event.leverage = self.leverage;
        event.pnl = pnl;
        self.events.emit(event);
        self.tracker.forget(symbol);

        info!(symbol, %side, quantity, ?pnl, ?status, "position closed");
        Ok(())
    }

    fn clear_symbol_state(&self, symbol: &str) {
        self.tracker.tiered().remove(symbol);
        self.tracker.tightening().clear(symbol);
        self.ledger.request_repair(symbol);
    }
}
