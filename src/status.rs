// =============================================================================
// Engine Status — the user-visible state of the bot
// =============================================================================
//
// A phase, a human-readable message, success / failure counters, closed-trade
// win rate and the state of every market-data stream.  Every task holds an
// `Arc<EngineStatus>`; `snapshot()` produces a serialisable copy that is
// logged periodically.
//
// Thread safety: parking_lot::RwLock around one inner struct, never held
// across an await.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::rate_limit::RateLimitSnapshot;
use crate::error::EngineError;
use crate::market_data::StreamState;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BotPhase {
    Starting,
    Running,
    Stopped,
    Error,
}

/// A recorded error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub symbol: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

struct StatusInner {
    phase: BotPhase,
    message: String,
    started_at: DateTime<Utc>,
    successful_entries: u64,
    failed_entries: u64,
    wins: u64,
    losses: u64,
    realized_pnl: f64,
    stream_states: BTreeMap<String, StreamState>,
    recent_errors: VecDeque<ErrorRecord>,
}

pub struct EngineStatus {
    inner: RwLock<StatusInner>,
}

/// Serialisable copy of the status at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: BotPhase,
    pub message: String,
    pub uptime_secs: i64,
    pub successful_entries: u64,
    pub failed_entries: u64,
    pub wins: u64,
    pub losses: u64,
    /// Winning closes / all closes, in percent.  0 before the first close.
    pub win_rate: f64,
    pub realized_pnl: f64,
    pub stream_states: BTreeMap<String, StreamState>,
    pub recent_errors: Vec<ErrorRecord>,
    pub rate_limits: Option<RateLimitSnapshot>,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatusInner {
                phase: BotPhase::Starting,
                message: "starting".to_string(),
                started_at: Utc::now(),
                successful_entries: 0,
                failed_entries: 0,
                wins: 0,
                losses: 0,
                realized_pnl: 0.0,
                stream_states: BTreeMap::new(),
                recent_errors: VecDeque::new(),
            }),
        }
    }

    pub fn set_phase(&self, phase: BotPhase, message: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.phase = phase;
        inner.message = message.into();
    }

    pub fn phase(&self) -> BotPhase {
        self.inner.read().phase
    }

    pub fn record_entry(&self, success: bool) {
        let mut inner = self.inner.write();
        if success {
            inner.successful_entries += 1;
        } else {
            inner.failed_entries += 1;
        }
    }

    /// Count a closed trade towards the win rate.
    pub fn record_close(&self, pnl: f64) {
        let mut inner = self.inner.write();
        if pnl > 0.0 {
            inner.wins += 1;
        } else {
            inner.losses += 1;
        }
        inner.realized_pnl += pnl;
    }

    pub fn set_stream_state(&self, symbol: &str, state: StreamState) {
        self.inner.write().stream_states.insert(symbol.to_string(), state);
    }

    pub fn stream_state(&self, symbol: &str) -> Option<StreamState> {
        self.inner.read().stream_states.get(symbol).copied()
    }

    pub fn push_error(&self, err: &EngineError) {
        self.push_error_message(err.to_string(), Some(err.symbol().to_string()));
    }

    pub fn push_error_message(&self, message: String, symbol: Option<String>) {
        let record = ErrorRecord {
            message,
            symbol,
            at: Utc::now().to_rfc3339(),
        };
        let mut inner = self.inner.write();
        inner.recent_errors.push_back(record);
        while inner.recent_errors.len() > MAX_RECENT_ERRORS {
            inner.recent_errors.pop_front();
        }
    }

    pub fn snapshot(&self, rate_limits: Option<RateLimitSnapshot>) -> StatusSnapshot {
        let inner = self.inner.read();
        let closes = inner.wins + inner.losses;
        StatusSnapshot {
            phase: inner.phase,
            message: inner.message.clone(),
            uptime_secs: (Utc::now() - inner.started_at).num_seconds(),
            successful_entries: inner.successful_entries,
            failed_entries: inner.failed_entries,
            wins: inner.wins,
            losses: inner.losses,
            win_rate: if closes > 0 {
                inner.wins as f64 / closes as f64 * 100.0
            } else {
                0.0
            },
            realized_pnl: inner.realized_pnl,
            stream_states: inner.stream_states.clone(),
            recent_errors: inner.recent_errors.iter().cloned().collect(),
            rate_limits,
        }
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}
