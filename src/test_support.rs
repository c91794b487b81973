// =============================================================================
// In-memory exchange used by the unit tests
// =============================================================================
//
// Behaves like a small futures venue: market orders fill instantly at the
// symbol's price and open / grow / shrink positions, conditional and limit
// orders rest in the open-order book, and cancels clear it.  Failures are
// scripted per order type.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{ExchangeApi, ExchangeGateway};
use crate::market_data::Candle;
use crate::precision::SymbolFilters;
use crate::runtime_config::GatewayParams;
use crate::types::{Balance, MarginMode, OpenOrder, OrderAck, OrderRequest, OrderType, Position, Side};

pub const DEFAULT_PRICE: f64 = 100.0;

#[derive(Default)]
struct MockState {
    positions: HashMap<String, Position>,
    open_orders: Vec<OpenOrder>,
    submitted: Vec<OrderRequest>,
    cancels: Vec<String>,
    balance: f64,
    prices: HashMap<String, f64>,
    filters: HashMap<String, SymbolFilters>,
    klines: HashMap<String, Vec<Candle>>,
    order_failures: Vec<(OrderType, GatewayError)>,
    rejected_types: HashSet<OrderType>,
    cancel_failures: VecDeque<GatewayError>,
    open_order_failures: VecDeque<GatewayError>,
    position_failures: VecDeque<GatewayError>,
    skip_fills: bool,
    latency: Duration,
    call_times: Vec<Instant>,
    leverage_calls: Vec<(String, u32)>,
    margin_calls: Vec<(String, MarginMode)>,
    next_order_id: i64,
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

pub fn long_position(symbol: &str, quantity: f64, entry: f64) -> Position {
    position(symbol, Side::Buy, quantity, entry)
}

pub fn short_position(symbol: &str, quantity: f64, entry: f64) -> Position {
    position(symbol, Side::Sell, quantity, entry)
}

fn position(symbol: &str, side: Side, quantity: f64, entry: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        side,
        quantity,
        entry_price: entry,
        mark_price: entry,
        unrealized_pnl: 0.0,
        leverage: 10,
        opened_at: Utc::now(),
    }
}

/// Gateway over `mock` with a short throttle and generous timeout.
pub fn gateway_over(mock: &Arc<MockExchange>) -> Arc<ExchangeGateway> {
    let params = GatewayParams {
        min_call_interval_ms: 200,
        call_timeout_ms: 10_000,
        balance_ttl_secs: 30,
        position_ttl_secs: 5,
    };
    Arc::new(ExchangeGateway::new(mock.clone(), &params, "USDT"))
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: 1_000.0,
                next_order_id: 1,
                ..MockState::default()
            }),
        }
    }

    async fn enter(&self) {
        let latency = {
            let mut s = self.state.lock();
            s.call_times.push(Instant::now());
            s.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    pub fn set_position(&self, pos: Position) {
        self.state.lock().positions.insert(pos.symbol.clone(), pos);
    }

    pub fn clear_position(&self, symbol: &str) {
        self.state.lock().positions.remove(symbol);
    }

    pub fn set_unrealized_pnl(&self, symbol: &str, pnl: f64) {
        if let Some(p) = self.state.lock().positions.get_mut(symbol) {
            p.unrealized_pnl = pnl;
        }
    }

    pub fn set_balance(&self, wallet: f64) {
        self.state.lock().balance = wallet;
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_klines(&self, symbol: &str, candles: Vec<Candle>) {
        self.state.lock().klines.insert(symbol.to_string(), candles);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Market orders are acknowledged but never fill.
    pub fn skip_fills(&self) {
        self.state.lock().skip_fills = true;
    }

    pub fn fail_next_order(&self, order_type: OrderType, err: GatewayError) {
        self.state.lock().order_failures.push((order_type, err));
    }

    /// Reject every order of `order_type` with "would immediately trigger".
    pub fn reject_always(&self, order_type: OrderType) {
        self.state.lock().rejected_types.insert(order_type);
    }

    pub fn fail_next_cancel(&self, err: GatewayError) {
        self.state.lock().cancel_failures.push_back(err);
    }

    pub fn fail_next_open_orders(&self, err: GatewayError) {
        self.state.lock().open_order_failures.push_back(err);
    }

    pub fn fail_next_positions(&self, err: GatewayError) {
        self.state.lock().position_failures.push_back(err);
    }

    pub fn add_open_order(&self, symbol: &str, side: Side, order_type: OrderType, quantity: f64, reduce_only: bool) {
        let mut s = self.state.lock();
        let order_id = s.next_order_id;
        s.next_order_id += 1;
        s.open_orders.push(OpenOrder {
            order_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            price: 0.0,
            stop_price: 0.0,
            reduce_only,
            close_position: false,
        });
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.state.lock().submitted.clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().cancels.clone()
    }

    pub fn resting_orders(&self, symbol: &str) -> Vec<OpenOrder> {
        self.state.lock().open_orders.iter().filter(|o| o.symbol == symbol).cloned().collect()
    }

    pub fn current_position(&self, symbol: &str) -> Option<Position> {
        self.state.lock().positions.get(symbol).cloned()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.state.lock().call_times.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().leverage_calls.clone()
    }

    pub fn margin_calls(&self) -> Vec<(String, MarginMode)> {
        self.state.lock().margin_calls.clone()
    }
}

fn price_of(s: &MockState, symbol: &str) -> f64 {
    s.prices.get(symbol).copied().unwrap_or(DEFAULT_PRICE)
}

fn apply_fill(s: &mut MockState, req: &OrderRequest, qty: f64) {
    let price = price_of(s, &req.symbol);
    match s.positions.get_mut(&req.symbol) {
        Some(pos) if pos.side == req.side => {
            let total = pos.quantity + qty;
            pos.entry_price = (pos.entry_price * pos.quantity + price * qty) / total;
            pos.quantity = total;
        }
        Some(pos) => {
            pos.quantity -= qty;
            if pos.quantity <= 1e-12 {
                s.positions.remove(&req.symbol);
            }
        }
        None if !req.reduce_only => {
            s.positions.insert(req.symbol.clone(), position(&req.symbol, req.side, qty, price));
        }
        None => {}
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn submit_order(&self, req: &OrderRequest) -> GatewayResult<OrderAck> {
        self.enter().await;
        let mut s = self.state.lock();
        s.submitted.push(req.clone());

        if let Some(idx) = s.order_failures.iter().position(|(t, _)| *t == req.order_type) {
            return Err(s.order_failures.remove(idx).1);
        }
        if s.rejected_types.contains(&req.order_type) {
            return Err(GatewayError::Rejected {
                code: crate::error::CODE_WOULD_TRIGGER,
                message: "Order would immediately trigger.".into(),
            });
        }

        let order_id = s.next_order_id;
        s.next_order_id += 1;
        let qty: f64 = req.quantity.parse().unwrap_or(0.0);

        if req.order_type == OrderType::Market {
            if !s.skip_fills {
                apply_fill(&mut s, req, qty);
            }
            return Ok(OrderAck { order_id, status: "FILLED".into() });
        }

        s.open_orders.push(OpenOrder {
            order_id,
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            quantity: qty,
            price: req.price.as_deref().and_then(|p| p.parse().ok()).unwrap_or(0.0),
            stop_price: req.stop_price.as_deref().and_then(|p| p.parse().ok()).unwrap_or(0.0),
            reduce_only: req.reduce_only,
            close_position: false,
        });
        Ok(OrderAck { order_id, status: "NEW".into() })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        self.enter().await;
        let mut s = self.state.lock();
        s.cancels.push(symbol.to_string());
        if let Some(err) = s.cancel_failures.pop_front() {
            return Err(err);
        }
        s.open_orders.retain(|o| o.symbol != symbol);
        Ok(())
    }

    async fn open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        self.enter().await;
        let mut s = self.state.lock();
        if let Some(err) = s.open_order_failures.pop_front() {
            return Err(err);
        }
        Ok(s.open_orders.iter().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn balance(&self, asset: &str) -> GatewayResult<Balance> {
        self.enter().await;
        let s = self.state.lock();
        Ok(Balance { asset: asset.to_string(), wallet: s.balance, available: s.balance })
    }

    async fn positions(&self) -> GatewayResult<Vec<Position>> {
        self.enter().await;
        let mut s = self.state.lock();
        if let Some(err) = s.position_failures.pop_front() {
            return Err(err);
        }
        let mut out: Vec<Position> = s.positions.values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn klines(&self, symbol: &str, _interval: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        self.enter().await;
        let s = self.state.lock();
        let all = s.klines.get(symbol).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit as usize);
        Ok(all[start..].to_vec())
    }

    async fn last_price(&self, symbol: &str) -> GatewayResult<f64> {
        self.enter().await;
        Ok(price_of(&self.state.lock(), symbol))
    }

    async fn symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        self.enter().await;
        let s = self.state.lock();
        Ok(s.filters.get(symbol).cloned().unwrap_or_else(|| {
            let mut f = SymbolFilters::new(symbol, "0.001", "0.01");
            f.min_qty = 0.001;
            f.min_notional = 5.0;
            f
        }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        self.enter().await;
        self.state.lock().leverage_calls.push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GatewayResult<()> {
        self.enter().await;
        self.state.lock().margin_calls.push((symbol.to_string(), mode));
        Ok(())
    }
}
