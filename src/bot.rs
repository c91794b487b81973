// =============================================================================
// Symbol Trader — one stream's closed candles in, protected entries out
// =============================================================================
//
// A trader is the thin layer between a symbol's kline stream and the shared
// execution protocol:
//
//   closed candle → enough history? → signal source → cooldown
//                 → existing position? (same side: skip, opposite: close)
//                 → OrderExecutionProtocol::execute
//
// `prepare_symbol` runs once at startup, before the stream is started.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::execution::{DecisionRecord, ExecutionOutcome, ExecutionReport, OrderExecutionProtocol};
use crate::gateway::{CacheMode, ExchangeGateway};
use crate::market_data::{Candle, CandleBuffer, ClosedCandleHandler};
use crate::position_tracker::PositionTracker;
use crate::runtime_config::RuntimeConfig;
use crate::signal::SignalSource;
use crate::status::EngineStatus;

// ---------------------------------------------------------------------------
// Startup preparation
// ---------------------------------------------------------------------------

/// Clean up, load filters, seed history and (when flat) set leverage and
/// margin mode.  Returns the number of seeded candles.
pub async fn prepare_symbol(
    gateway: &ExchangeGateway,
    buffer: &CandleBuffer,
    symbol: &str,
    config: &RuntimeConfig,
) -> Result<usize, EngineError> {
    let gw_err = |e| EngineError::from_gateway(symbol, e);

    let position = gateway.position(symbol, CacheMode::Bypass).await.map_err(gw_err)?;
    match &position {
        None => {
            gateway.cancel_all_orders(symbol).await.map_err(gw_err)?;
            gateway.set_leverage(symbol, config.leverage).await.map_err(gw_err)?;
            gateway.set_margin_mode(symbol, config.margin_mode).await.map_err(gw_err)?;
        }
        Some(pos) => info!(
            symbol,
            side = %pos.side,
            quantity = pos.quantity,
            "open position found at startup, leaving orders and leverage untouched"
        ),
    }

    let filters = gateway.symbol_filters(symbol).await.map_err(gw_err)?;

    let candles = gateway
        .klines(symbol, &config.stream.interval, buffer.capacity() as u32)
        .await
        .map_err(gw_err)?;
    let seeded = buffer.seed(symbol, candles, Utc::now().timestamp_millis());

    info!(
        symbol,
        seeded,
        quantity_decimals = filters.quantity_decimals,
        price_decimals = filters.price_decimals,
        leverage = config.leverage,
        "symbol prepared"
    );
    Ok(seeded)
}

// ---------------------------------------------------------------------------
// Trader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TraderAction {
    NoSignal,
    StaleData(EngineError),
    Cooldown { remaining: Duration },
    SameSide,
    Failed(EngineError),
    Executed(ExecutionReport),
}

pub struct SymbolTrader {
    symbol: String,
    tracker: Arc<PositionTracker>,
    protocol: Arc<OrderExecutionProtocol>,
    signals: Arc<dyn SignalSource>,
    buffer: Arc<CandleBuffer>,
    status: Arc<EngineStatus>,
    min_history: usize,
    cooldown: Duration,
    last_entry: Mutex<Option<Instant>>,
}

impl SymbolTrader {
    pub fn new(
        symbol: &str,
        tracker: Arc<PositionTracker>,
        protocol: Arc<OrderExecutionProtocol>,
        signals: Arc<dyn SignalSource>,
        buffer: Arc<CandleBuffer>,
        status: Arc<EngineStatus>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            tracker,
            protocol,
            signals,
            buffer,
            status,
            min_history: config.stream.min_history,
            cooldown: Duration::from_secs(config.execution.trade_cooldown_secs),
            last_entry: Mutex::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub async fn handle_candle(&self, candle: &Candle) -> TraderAction {
        let have = self.buffer.len(&self.symbol);
        if have < self.min_history {
            return TraderAction::StaleData(EngineError::StaleDataFailure {
                symbol: self.symbol.clone(),
                have,
                need: self.min_history,
            });
        }

        let history = self.buffer.closed(&self.symbol, self.buffer.capacity());
        let Some(mut decision) = self.signals.on_candle(&self.symbol, &history).await else {
            return TraderAction::NoSignal;
        };
        if decision.entry_price.is_none() {
            decision.entry_price = Some(candle.close);
        }
        self.handle_decision(decision).await
    }

    pub async fn handle_decision(&self, decision: DecisionRecord) -> TraderAction {
        if let Some(at) = *self.last_entry.lock() {
            let elapsed = at.elapsed();
            if elapsed < self.cooldown {
                return TraderAction::Cooldown { remaining: self.cooldown - elapsed };
            }
        }

        let position = match self.tracker.position(&self.symbol, CacheMode::Bypass).await {
            Ok(p) => p,
            Err(e) => return TraderAction::Failed(EngineError::from_gateway(&self.symbol, e)),
        };

        if let Some(pos) = position {
            if pos.side == decision.side {
                return TraderAction::SameSide;
            }
            info!(symbol = %self.symbol, from = %pos.side, to = %decision.side, "flipping position");
            if let Err(e) = self.protocol.close_position(&self.symbol).await {
                return TraderAction::Failed(e);
            }
        }

        let report = self.protocol.execute(&decision).await;
        if report.entered() {
            *self.last_entry.lock() = Some(Instant::now());
        }
        TraderAction::Executed(report)
    }
}

#[async_trait]
impl ClosedCandleHandler for SymbolTrader {
    async fn on_closed_candle(&self, symbol: &str, candle: Candle) {
        match self.handle_candle(&candle).await {
            TraderAction::NoSignal => {}
            TraderAction::StaleData(e) => debug!(symbol, error = %e, "waiting for history"),
            TraderAction::Cooldown { remaining } => {
                info!(symbol, remaining_secs = remaining.as_secs(), "decision skipped, cooldown active")
            }
            TraderAction::SameSide => info!(symbol, "decision skipped, position already open on that side"),
            TraderAction::Failed(e) => {
                error!(symbol, error = %e, "decision failed");
                self.status.push_error(&e);
            }
            TraderAction::Executed(report) => match report.outcome {
                ExecutionOutcome::Protected | ExecutionOutcome::PartiallyProtected => info!(
                    symbol,
                    outcome = ?report.outcome,
                    quantity = report.quantity,
                    entry = report.entry_price,
                    "trade opened"
                ),
                ExecutionOutcome::Skipped => {}
                ExecutionOutcome::Failed => warn!(symbol, reason = ?report.reason, "trade failed"),
            },
        }
    }
}
