// =============================================================================
// Shared types used across the Bastion futures engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that reduces a position opened on `self`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for long, -1.0 for short.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Parse the exchange's "BUY" / "SELL" (also accepts LONG / SHORT).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Some(Self::Buy),
            "SELL" | "SHORT" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Futures order types used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    /// Stop-limit: `price` + `stopPrice`.
    Stop,
    StopMarket,
    /// Take-profit limit: `price` + `stopPrice`.
    TakeProfit,
    TakeProfitMarket,
    #[serde(other)]
    Other,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "MARKET" => Self::Market,
            "LIMIT" => Self::Limit,
            "STOP" => Self::Stop,
            "STOP_MARKET" => Self::StopMarket,
            "TAKE_PROFIT" => Self::TakeProfit,
            "TAKE_PROFIT_MARKET" => Self::TakeProfitMarket,
            _ => Self::Other,
        }
    }

    /// Stop-loss style orders.
    pub fn is_stop(self) -> bool {
        matches!(self, Self::Stop | Self::StopMarket)
    }

    /// Orders that can act as a take-profit when reduce-only.
    pub fn is_take_profit(self) -> bool {
        matches!(self, Self::TakeProfit | Self::TakeProfitMarket | Self::Limit)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    /// Good-till-expire for conditional orders.
    #[serde(rename = "GTE_GTC")]
    GteGtc,
}

impl TimeInForce {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
            Self::GteGtc => "GTE_GTC",
        }
    }
}

/// Margin mode for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Crossed,
    Isolated,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Crossed
    }
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crossed => "CROSSED",
            Self::Isolated => "ISOLATED",
        }
    }
}

/// A single order request. Quantities and prices are already formatted to the
/// symbol's step / tick size.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: String,
    pub price: Option<String>,
    pub stop_price: Option<String>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn with_client_id(mut self, tag: &str) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        self.client_order_id = Some(format!("bst-{tag}-{}", &short[..12]));
        self
    }
}

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub status: String,
}

/// An order resting on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub stop_price: f64,
    pub reduce_only: bool,
    /// `closePosition=true` orders carry no quantity but close everything.
    #[serde(default)]
    pub close_position: bool,
}

/// Wallet balance for the margin asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    #[serde(default)]
    pub wallet: f64,
    #[serde(default)]
    pub available: f64,
}

/// An open futures position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Absolute position size.
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub mark_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Unrealised pnl as a fraction of the position's entry notional.
    pub fn pnl_ratio(&self) -> f64 {
        let notional = self.notional();
        if notional > 0.0 {
            self.unrealized_pnl / notional
        } else {
            0.0
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity.abs() * self.entry_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_direction() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.direction(), 1.0);
        assert_eq!(Side::parse("long"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("flat"), None);
    }

    #[test]
    fn order_type_classification() {
        assert!(OrderType::StopMarket.is_stop());
        assert!(OrderType::Stop.is_stop());
        assert!(!OrderType::Limit.is_stop());
        assert!(OrderType::Limit.is_take_profit());
        assert!(OrderType::TakeProfitMarket.is_take_profit());
        assert!(!OrderType::Market.is_take_profit());
        assert_eq!(OrderType::parse("TRAILING_STOP_MARKET"), OrderType::Other);
    }

    #[test]
    fn pnl_ratio_uses_entry_notional() {
        let pos = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: 0.5,
            entry_price: 100.0,
            mark_price: 104.0,
            unrealized_pnl: 2.0,
            leverage: 10,
            opened_at: Utc::now(),
        };
        assert!((pos.pnl_ratio() - 0.04).abs() < 1e-12);
        assert!((pos.notional() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn client_id_is_tagged_and_short() {
        let req = OrderRequest::market("BTCUSDT", Side::Buy, "1".into()).with_client_id("sl");
        let id = req.client_order_id.unwrap();
        assert!(id.starts_with("bst-sl-"));
        assert!(id.len() <= 36);
    }
}
