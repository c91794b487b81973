// =============================================================================
// Rate-Limit Tracker — monitors Binance futures API usage
// =============================================================================
//
// Binance USDⓈ-M futures enforces:
//   - Request weight: 2400 per minute.
//   - Order rate:     1200 per minute.
//
// The tracker reads `X-MBX-USED-WEIGHT-1M` and `X-MBX-ORDER-COUNT-1M` after
// every request and keeps atomic counters that any thread may query
// lock-free.  It only observes; throttling is the gateway's job.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Exchange-side request weight budget per minute.
const WEIGHT_LIMIT_1M: u32 = 2400;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1800;

/// Exchange-side order budget per minute.
const ORDER_LIMIT_1M: u32 = 1200;
const ORDER_WARN_THRESHOLD: u32 = 900;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_1m: AtomicU32,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_1m: u32,
}

impl RateLimitSnapshot {
    /// Fraction of the per-minute weight budget in use.
    pub fn weight_utilisation(&self) -> f64 {
        self.used_weight_1m as f64 / WEIGHT_LIMIT_1M as f64
    }
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_1m: AtomicU32::new(0),
        }
    }

    /// Update counters from the HTTP response headers returned by Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    limit = WEIGHT_LIMIT_1M,
                    "rate-limit weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1M") {
            let prev = self.order_count_1m.swap(c, Ordering::Relaxed);
            if c >= ORDER_WARN_THRESHOLD && prev < ORDER_WARN_THRESHOLD {
                warn!(order_count = c, limit = ORDER_LIMIT_1M, "order count crossed warning threshold");
            }
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_1m: self.order_count_1m.load(Ordering::Relaxed),
        }
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_1m", &self.order_count_1m.load(Ordering::Relaxed))
            .finish()
    }
}
