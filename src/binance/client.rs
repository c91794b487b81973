// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Every response goes through `request()`, which records the rate-limit
// headers and converts non-2xx bodies into a classified `GatewayError`.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::error::{GatewayError, GatewayResult, CODE_MARGIN_TYPE_UNCHANGED};
use crate::gateway::ExchangeApi;
use crate::market_data::candle_buffer::parse_rest_kline;
use crate::market_data::Candle;
use crate::precision::SymbolFilters;
use crate::types::{Balance, MarginMode, OpenOrder, OrderAck, OrderRequest, OrderType, Position, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limits: Arc<RateLimitTracker>,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client against `base_url` (mainnet or testnet).
    ///
    /// The HTTP timeout is a backstop only; the gateway applies its own
    /// per-call timeout on top.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        let key_header = HeaderValue::from_str(&api_key).context("API key is not a valid header value")?;
        default_headers.insert("X-MBX-APIKEY", key_header);

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceFuturesClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            client,
            rate_limits: Arc::new(RateLimitTracker::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request(&self, method: Method, path: &str, params: &str, signed: bool) -> GatewayResult<Value> {
        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self.client.request(method.clone(), &url).send().await?;
        self.rate_limits.update_from_headers(resp.headers());

        let status = resp.status();
        let text = resp.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            let err = GatewayError::from_api_body(status.as_u16(), &body);
            warn!(%method, path, status = status.as_u16(), error = %err, "Binance request failed");
            return Err(err);
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Response decoding
    // -------------------------------------------------------------------------

    fn decode_open_order(v: &Value) -> GatewayResult<OpenOrder> {
        let side = v["side"]
            .as_str()
            .and_then(Side::parse)
            .ok_or_else(|| GatewayError::Decode(format!("open order without side: {v}")))?;
        Ok(OpenOrder {
            order_id: v["orderId"].as_i64().unwrap_or_default(),
            symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
            side,
            order_type: OrderType::parse(v["type"].as_str().unwrap_or_default()),
            quantity: parse_f64(&v["origQty"]),
            price: parse_f64(&v["price"]),
            stop_price: parse_f64(&v["stopPrice"]),
            reduce_only: v["reduceOnly"].as_bool().unwrap_or(false),
            close_position: v["closePosition"].as_bool().unwrap_or(false),
        })
    }

    fn decode_position(v: &Value) -> Option<Position> {
        let amount = parse_f64(&v["positionAmt"]);
        if amount == 0.0 {
            return None;
        }
        let opened_at = v["updateTime"]
            .as_i64()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now);
        Some(Position {
            symbol: v["symbol"].as_str()?.to_string(),
            side: if amount > 0.0 { Side::Buy } else { Side::Sell },
            quantity: amount.abs(),
            entry_price: parse_f64(&v["entryPrice"]),
            mark_price: parse_f64(&v["markPrice"]),
            unrealized_pnl: parse_f64(&v["unRealizedProfit"]),
            leverage: parse_f64(&v["leverage"]) as u32,
            opened_at,
        })
    }

    fn decode_filters(symbol: &str, info: &Value) -> GatewayResult<SymbolFilters> {
        let entry = info["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;

        let filters = entry["filters"].as_array().cloned().unwrap_or_default();
        let find = |kind: &str| filters.iter().find(|f| f["filterType"].as_str() == Some(kind));

        let lot = find("LOT_SIZE").ok_or_else(|| GatewayError::Decode(format!("{symbol} has no LOT_SIZE filter")))?;
        let price = find("PRICE_FILTER")
            .ok_or_else(|| GatewayError::Decode(format!("{symbol} has no PRICE_FILTER filter")))?;

        let mut out = SymbolFilters::new(
            symbol,
            lot["stepSize"].as_str().unwrap_or("1"),
            price["tickSize"].as_str().unwrap_or("1"),
        );
        out.min_qty = parse_f64(&lot["minQty"]);
        if let Some(notional) = find("MIN_NOTIONAL") {
            out.min_notional = parse_f64(&notional["notional"]);
        }
        Ok(out)
    }
}

#[async_trait]
impl ExchangeApi for BinanceFuturesClient {
    /// POST /fapi/v1/order (signed).
    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side, order_type = %req.order_type), name = "binance::submit_order")]
    async fn submit_order(&self, req: &OrderRequest) -> GatewayResult<OrderAck> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            req.symbol, req.side, req.order_type, req.quantity
        );
        if let Some(p) = &req.price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(sp) = &req.stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if let Some(tif) = req.time_in_force {
            params.push_str(&format!("&timeInForce={}", tif.as_str()));
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if let Some(coid) = &req.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        let body = self.request(Method::POST, "/fapi/v1/order", &params, true).await?;
        let order_id = body["orderId"]
            .as_i64()
            .ok_or_else(|| GatewayError::Decode(format!("order response without orderId: {body}")))?;
        Ok(OrderAck {
            order_id,
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
        })
    }

    /// DELETE /fapi/v1/allOpenOrders (signed).
    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<()> {
        self.request(Method::DELETE, "/fapi/v1/allOpenOrders", &format!("symbol={symbol}"), true)
            .await?;
        Ok(())
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "binance::open_orders")]
    async fn open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        let body = self
            .request(Method::GET, "/fapi/v1/openOrders", &format!("symbol={symbol}"), true)
            .await?;
        body.as_array()
            .ok_or_else(|| GatewayError::Decode("openOrders response is not an array".into()))?
            .iter()
            .map(Self::decode_open_order)
            .collect()
    }

    /// GET /fapi/v2/balance (signed).
    #[instrument(skip(self), name = "binance::balance")]
    async fn balance(&self, asset: &str) -> GatewayResult<Balance> {
        let body = self.request(Method::GET, "/fapi/v2/balance", "", true).await?;
        let entry = body
            .as_array()
            .and_then(|arr| arr.iter().find(|b| b["asset"].as_str() == Some(asset)));

        match entry {
            Some(b) => Ok(Balance {
                asset: asset.to_string(),
                wallet: parse_f64(&b["balance"]),
                available: parse_f64(&b["availableBalance"]),
            }),
            None => {
                warn!(asset, "asset not found in futures balances, reporting 0");
                Ok(Balance { asset: asset.to_string(), wallet: 0.0, available: 0.0 })
            }
        }
    }

    /// GET /fapi/v2/positionRisk (signed).  Zero-size rows are dropped.
    #[instrument(skip(self), name = "binance::positions")]
    async fn positions(&self) -> GatewayResult<Vec<Position>> {
        let body = self.request(Method::GET, "/fapi/v2/positionRisk", "", true).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| GatewayError::Decode("positionRisk response is not an array".into()))?;
        Ok(rows.iter().filter_map(Self::decode_position).collect())
    }

    /// GET /fapi/v1/klines (public).
    #[instrument(skip(self), name = "binance::klines")]
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> GatewayResult<Vec<Candle>> {
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self.request(Method::GET, "/fapi/v1/klines", &params, false).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| GatewayError::Decode("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_rest_kline(entry) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(symbol, error = %e, "skipping malformed kline entry"),
            }
        }
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /fapi/v1/ticker/price (public).
    #[instrument(skip(self), name = "binance::last_price")]
    async fn last_price(&self, symbol: &str) -> GatewayResult<f64> {
        let body = self
            .request(Method::GET, "/fapi/v1/ticker/price", &format!("symbol={symbol}"), false)
            .await?;
        let price = parse_f64(&body["price"]);
        if price > 0.0 {
            Ok(price)
        } else {
            Err(GatewayError::Decode(format!("ticker without price: {body}")))
        }
    }

    /// GET /fapi/v1/exchangeInfo (public).
    #[instrument(skip(self), name = "binance::symbol_filters")]
    async fn symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        let body = self.request(Method::GET, "/fapi/v1/exchangeInfo", "", false).await?;
        Self::decode_filters(symbol, &body)
    }

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.request(Method::POST, "/fapi/v1/leverage", &params, true).await?;
        Ok(())
    }

    /// POST /fapi/v1/marginType (signed).  "No need to change margin type"
    /// counts as success.
    #[instrument(skip(self), name = "binance::set_margin_mode")]
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> GatewayResult<()> {
        let params = format!("symbol={symbol}&marginType={}", mode.as_str());
        match self.request(Method::POST, "/fapi/v1/marginType", &params, true).await {
            Err(e) if e.code() == Some(CODE_MARGIN_TYPE_UNCHANGED) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        Some(self.rate_limits.snapshot())
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
/// Missing or malformed values read as 0.
fn parse_f64(val: &Value) -> f64 {
    match val {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
