// =============================================================================
// Trade Events — best-effort feed of opens and closes
// =============================================================================
//
// Producers call `TradeEventSink::emit`, which never blocks: when the bounded
// channel is full or the consumer is gone the event is dropped with a
// warning.  The logger task writes every event as one JSON line on the
// `trade_events` tracing target.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Opened,
    PartiallyProtected,
    Closed,
    EmergencyClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    /// Take-profit price of the first leg.
    pub tp: Option<f64>,
    pub sl: Option<f64>,
    pub notional: f64,
    pub leverage: u32,
    pub status: TradeStatus,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TradeEvent {
    pub fn new(symbol: &str, side: Side, entry_price: f64, quantity: f64, status: TradeStatus) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            tp: None,
            sl: None,
            notional: entry_price * quantity,
            leverage: 0,
            status,
            strategy: String::new(),
            pnl: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct TradeEventSink {
    tx: mpsc::Sender<TradeEvent>,
}

impl TradeEventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TradeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue `event` without waiting.  Returns whether it was accepted.
    pub fn emit(&self, event: TradeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                warn!(symbol = %ev.symbol, status = ?ev.status, "trade event channel full, event dropped");
                false
            }
            Err(TrySendError::Closed(ev)) => {
                warn!(symbol = %ev.symbol, status = ?ev.status, "trade event channel closed, event dropped");
                false
            }
        }
    }
}

/// Drain the channel, logging each event.  Returns when every sink is gone.
pub async fn run_trade_event_logger(mut rx: mpsc::Receiver<TradeEvent>) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!(
                target: "trade_events",
                symbol = %event.symbol,
                status = ?event.status,
                pnl = event.pnl,
                "{json}"
            ),
            Err(e) => warn!(symbol = %event.symbol, error = %e, "failed to serialise trade event"),
        }
    }
    info!("trade event logger stopped");
}
