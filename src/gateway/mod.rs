// =============================================================================
// Exchange Gateway — throttled, time-bounded, cached access to the exchange
// =============================================================================
//
// `ExchangeApi` is the raw remote surface (implemented by the Binance futures
// client and by the in-memory mock used in tests).  `ExchangeGateway` wraps it
// with:
//   - one process-wide minimum inter-call delay
//   - a bounded timeout on every call
//   - short-TTL caches for balance and positions (bypassable per call)
//   - a permanent cache of symbol filters
//
// Failures come back as typed `GatewayError`s.  Nothing here retries.
// =============================================================================

pub mod cache;
pub mod throttle;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::binance::rate_limit::RateLimitSnapshot;
use crate::error::{GatewayError, GatewayResult, CODE_UNKNOWN_ORDER};
use crate::market_data::Candle;
use crate::precision::SymbolFilters;
use crate::runtime_config::GatewayParams;
use crate::types::{Balance, MarginMode, OpenOrder, OrderAck, OrderRequest, OrderType, Position, Side, TimeInForce};

use cache::TtlCache;
use throttle::CallThrottle;

/// Raw exchange operations.  Implementations do no throttling or caching.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn submit_order(&self, req: &OrderRequest) -> GatewayResult<OrderAck>;
    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()>;
    async fn open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>>;
    async fn balance(&self, asset: &str) -> GatewayResult<Balance>;
    /// Every non-zero position on the account.
    async fn positions(&self) -> GatewayResult<Vec<Position>>;
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> GatewayResult<Vec<Candle>>;
    async fn last_price(&self, symbol: &str) -> GatewayResult<f64>;
    async fn symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()>;
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GatewayResult<()>;

    /// Latest request-weight usage, when the implementation tracks it.
    fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        None
    }
}

/// Whether a read may be served from the TTL cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Bypass,
}

pub struct ExchangeGateway {
    api: Arc<dyn ExchangeApi>,
    throttle: CallThrottle,
    call_timeout: Duration,
    margin_asset: String,
    balance_cache: TtlCache<Balance>,
    position_cache: TtlCache<Vec<Position>>,
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl ExchangeGateway {
    pub fn new(api: Arc<dyn ExchangeApi>, params: &GatewayParams, margin_asset: &str) -> Self {
        Self {
            api,
            throttle: CallThrottle::new(Duration::from_millis(params.min_call_interval_ms)),
            call_timeout: Duration::from_millis(params.call_timeout_ms),
            margin_asset: margin_asset.to_string(),
            balance_cache: TtlCache::new(Duration::from_secs(params.balance_ttl_secs)),
            position_cache: TtlCache::new(Duration::from_secs(params.position_ttl_secs)),
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Throttle, then run `fut` under the call timeout.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        self.throttle.acquire().await;
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                debug!(op, error = %e, retryable = e.is_retryable(), "gateway call failed");
                Err(e)
            }
            Err(_) => {
                let ms = self.call_timeout.as_millis() as u64;
                warn!(op, timeout_ms = ms, "gateway call timed out");
                Err(GatewayError::Timeout(ms))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Submit any order.  Invalidates the position cache whatever the outcome.
    pub async fn submit(&self, req: OrderRequest) -> GatewayResult<OrderAck> {
        let result = self.call("submit_order", self.api.submit_order(&req)).await;
        self.position_cache.invalidate();
        if let Ok(ack) = &result {
            debug!(
                symbol = %req.symbol,
                side = %req.side,
                order_type = %req.order_type,
                quantity = %req.quantity,
                order_id = ack.order_id,
                "order accepted"
            );
        }
        result
    }

    pub async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: String,
        reduce_only: bool,
        tag: &str,
    ) -> GatewayResult<OrderAck> {
        let mut req = OrderRequest::market(symbol, side, quantity).with_client_id(tag);
        if reduce_only {
            req = req.reduce_only();
        }
        self.submit(req).await
    }

    /// Reduce-only stop order.  `limit_price` is required for plain `STOP`
    /// and `TAKE_PROFIT` and ignored for the `*_MARKET` variants.
    pub async fn submit_stop_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: String,
        stop_price: String,
        limit_price: Option<String>,
        tag: &str,
    ) -> GatewayResult<OrderAck> {
        let needs_limit = matches!(order_type, OrderType::Stop | OrderType::TakeProfit);
        let req = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            price: if needs_limit { limit_price } else { None },
            stop_price: Some(stop_price),
            time_in_force: Some(if needs_limit { TimeInForce::Gtc } else { TimeInForce::GteGtc }),
            reduce_only: true,
            client_order_id: None,
        }
        .with_client_id(tag);
        self.submit(req).await
    }

    pub async fn submit_reduce_only_limit(
        &self,
        symbol: &str,
        side: Side,
        quantity: String,
        price: String,
        tag: &str,
    ) -> GatewayResult<OrderAck> {
        let req = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            time_in_force: Some(TimeInForce::Gtc),
            reduce_only: true,
            client_order_id: None,
        }
        .with_client_id(tag);
        self.submit(req).await
    }

    /// Cancel every open order on `symbol`.  "Unknown order" (nothing to
    /// cancel) counts as success.
    pub async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        let result = self.call("cancel_all_orders", self.api.cancel_all_orders(symbol)).await;
        self.position_cache.invalidate();
        match result {
            Err(e) if e.code() == Some(CODE_UNKNOWN_ORDER) => {
                debug!(symbol, "no open orders to cancel");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        self.call("open_orders", self.api.open_orders(symbol)).await
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    pub async fn balance(&self, mode: CacheMode) -> GatewayResult<Balance> {
        if mode == CacheMode::Cached {
            if let Some(b) = self.balance_cache.get() {
                return Ok(b);
            }
        }
        let balance = self.call("balance", self.api.balance(&self.margin_asset)).await?;
        self.balance_cache.put(balance.clone());
        Ok(balance)
    }

    pub async fn positions(&self, mode: CacheMode) -> GatewayResult<Vec<Position>> {
        if mode == CacheMode::Cached {
            if let Some(p) = self.position_cache.get() {
                return Ok(p);
            }
        }
        let generation = self.position_cache.generation();
        let positions = self.call("positions", self.api.positions()).await?;
        if !self.position_cache.put_if_current(generation, positions.clone()) {
            debug!("position snapshot predates an order write, not cached");
        }
        Ok(positions)
    }

    pub async fn position(&self, symbol: &str, mode: CacheMode) -> GatewayResult<Option<Position>> {
        Ok(self
            .positions(mode)
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol && p.quantity > 0.0))
    }

    // -------------------------------------------------------------------------
    // Market data and metadata
    // -------------------------------------------------------------------------

    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        self.call("klines", self.api.klines(symbol, interval, limit)).await
    }

    pub async fn last_price(&self, symbol: &str) -> GatewayResult<f64> {
        self.call("last_price", self.api.last_price(symbol)).await
    }

    /// Symbol filters, fetched once and kept for the life of the process.
    pub async fn symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        if let Some(f) = self.cached_filters(symbol) {
            return Ok(f);
        }
        let filters = self.call("symbol_filters", self.api.symbol_filters(symbol)).await?;
        self.filters.write().insert(symbol.to_string(), filters.clone());
        Ok(filters)
    }

    /// Filters already loaded for `symbol`, without touching the network.
    pub fn cached_filters(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters.read().get(symbol).cloned()
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        self.call("set_leverage", self.api.set_leverage(symbol, leverage)).await
    }

    pub async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GatewayResult<()> {
        self.call("set_margin_mode", self.api.set_margin_mode(symbol, mode)).await
    }

    pub fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        self.api.rate_limits()
    }

    pub fn margin_asset(&self) -> &str {
        &self.margin_asset
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{long_position, MockExchange};
    use tokio::time::Instant;

    fn params() -> GatewayParams {
        GatewayParams {
            min_call_interval_ms: 200,
            call_timeout_ms: 1_000,
            balance_ttl_secs: 30,
            position_ttl_secs: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calls_are_spaced_by_min_interval() {
        let mock = Arc::new(MockExchange::new());
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");

        let start = Instant::now();
        gw.last_price("BTCUSDT").await.unwrap();
        gw.last_price("ETHUSDT").await.unwrap();
        gw.open_orders("BTCUSDT").await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(400));
        let stamps = mock.call_times();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn position_reads_are_cached_until_bypassed() {
        let mock = Arc::new(MockExchange::new());
        mock.set_position(long_position("BTCUSDT", 1.0, 100.0));
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");

        assert_eq!(gw.positions(CacheMode::Cached).await.unwrap().len(), 1);
        mock.clear_position("BTCUSDT");

        // Still served from cache.
        assert_eq!(gw.positions(CacheMode::Cached).await.unwrap().len(), 1);
        // Bypass sees the exchange.
        assert!(gw.position("BTCUSDT", CacheMode::Bypass).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_invalidate_position_cache() {
        let mock = Arc::new(MockExchange::new());
        mock.set_position(long_position("BTCUSDT", 1.0, 100.0));
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");

        gw.positions(CacheMode::Cached).await.unwrap();
        mock.clear_position("BTCUSDT");
        gw.cancel_all_orders("BTCUSDT").await.unwrap();

        assert!(gw.positions(CacheMode::Cached).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn balance_cache_expires() {
        let mock = Arc::new(MockExchange::new());
        mock.set_balance(1_000.0);
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");

        assert_eq!(gw.balance(CacheMode::Cached).await.unwrap().wallet, 1_000.0);
        mock.set_balance(500.0);
        assert_eq!(gw.balance(CacheMode::Cached).await.unwrap().wallet, 1_000.0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(gw.balance(CacheMode::Cached).await.unwrap().wallet, 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_retryable() {
        let mock = Arc::new(MockExchange::new());
        mock.set_latency(Duration::from_secs(5));
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");

        let err = gw.last_price("BTCUSDT").await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout(1_000));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_order_on_cancel_is_success() {
        let mock = Arc::new(MockExchange::new());
        mock.fail_next_cancel(GatewayError::Rejected {
            code: CODE_UNKNOWN_ORDER,
            message: "Unknown order sent.".into(),
        });
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");
        assert!(gw.cancel_all_orders("BTCUSDT").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_returned_not_retried() {
        let mock = Arc::new(MockExchange::new());
        mock.fail_next_order(
            OrderType::Market,
            GatewayError::Rejected { code: -2019, message: "Margin is insufficient.".into() },
        );
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");

        let err = gw
            .submit_market_order("BTCUSDT", Side::Buy, "0.010".into(), false, "entry")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(-2019));
        assert_eq!(mock.submitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn filters_are_fetched_once() {
        let mock = Arc::new(MockExchange::new());
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");
        assert!(gw.cached_filters("BTCUSDT").is_none());
        gw.symbol_filters("BTCUSDT").await.unwrap();
        gw.symbol_filters("BTCUSDT").await.unwrap();
        assert_eq!(mock.call_times().len(), 1);
        assert!(gw.cached_filters("BTCUSDT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_market_carries_no_limit_price() {
        let mock = Arc::new(MockExchange::new());
        let gw = ExchangeGateway::new(mock.clone(), &params(), "USDT");
        gw.submit_stop_order(
            "BTCUSDT",
            Side::Sell,
            OrderType::StopMarket,
            "1.000".into(),
            "95.0".into(),
            Some("94.9".into()),
            "sl",
        )
        .await
        .unwrap();
        let sent = &mock.submitted()[0];
        assert!(sent.reduce_only);
        assert!(sent.price.is_none());
        assert_eq!(sent.stop_price.as_deref(), Some("95.0"));
    }
}
