// =============================================================================
// Signal Source — where trading decisions come from
// =============================================================================
//
// The engine does not generate signals.  A `SignalSource` is asked once per
// closed candle whether it has a decision for the symbol.  The bundled
// `QueuedSignalSource` holds decisions pushed by an external producer (the
// stdin JSON-lines feed in `main`) and releases at most one per candle.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::execution::DecisionRecord;
use crate::market_data::{Candle, StopFlag};

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Called after each closed candle with the symbol's recent history.
    async fn on_candle(&self, symbol: &str, history: &[Candle]) -> Option<DecisionRecord>;
}

/// Pending decisions, per symbol, in arrival order.
#[derive(Default)]
pub struct QueuedSignalSource {
    pending: Mutex<HashMap<String, VecDeque<DecisionRecord>>>,
}

impl QueuedSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, decision: DecisionRecord) {
        self.pending
            .lock()
            .entry(decision.symbol.clone())
            .or_default()
            .push_back(decision);
    }

    pub fn pending(&self, symbol: &str) -> usize {
        self.pending.lock().get(symbol).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl SignalSource for QueuedSignalSource {
    async fn on_candle(&self, symbol: &str, _history: &[Candle]) -> Option<DecisionRecord> {
        self.pending.lock().get_mut(symbol).and_then(VecDeque::pop_front)
    }
}

/// Decode one feed line.  Symbols are normalised to upper case.
pub fn parse_decision_line(line: &str) -> Result<DecisionRecord> {
    let mut decision: DecisionRecord =
        serde_json::from_str(line).context("failed to decode decision record")?;
    decision.symbol = decision.symbol.trim().to_uppercase();
    Ok(decision)
}

/// Read JSON-lines decisions from `reader` into `source` until EOF or stop.
/// Lines for symbols outside `active` are dropped with a warning.
pub async fn run_decision_feed<R>(reader: R, source: Arc<QueuedSignalSource>, active: HashSet<String>, stop: StopFlag)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        if stop.is_stopped() {
            break;
        }
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "decision feed read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_decision_line(line) {
            Ok(d) if active.contains(&d.symbol) => {
                info!(symbol = %d.symbol, side = %d.side, strategy = %d.strategy, "decision queued");
                source.push(d);
            }
            Ok(d) => warn!(symbol = %d.symbol, "decision for inactive symbol dropped"),
            Err(e) => warn!(error = %e, "bad decision line ignored"),
        }
    }
    info!("decision feed closed");
}
