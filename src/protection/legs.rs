// =============================================================================
// Protective leg placement with order-type fallback
// =============================================================================
//
// Used by the repair sweep and by SL tightening.  The preferred conditional
// type is tried first; if the exchange rejects it outright the alternate
// type is tried once.  Retryable failures (timeouts, rate limits) are
// returned as-is, because the first order may have landed.
// =============================================================================

use tracing::warn;

use crate::error::GatewayResult;
use crate::gateway::ExchangeGateway;
use crate::precision::SymbolFilters;
use crate::types::{OrderAck, OrderType, Side};

/// Reduce-only stop: STOP_MARKET, falling back to STOP with a limit at the
/// trigger price.
pub async fn place_stop_with_fallback(
    gateway: &ExchangeGateway,
    filters: &SymbolFilters,
    closing_side: Side,
    quantity: f64,
    stop_price: f64,
) -> GatewayResult<OrderAck> {
    let symbol = filters.symbol.as_str();
    let qty = filters.format_quantity(quantity);
    let price = filters.format_price(stop_price);

    match gateway
        .submit_stop_order(symbol, closing_side, OrderType::StopMarket, qty.clone(), price.clone(), None, "sl")
        .await
    {
        Err(e) if !e.is_retryable() => {
            warn!(symbol, error = %e, "STOP_MARKET rejected, falling back to STOP");
            gateway
                .submit_stop_order(symbol, closing_side, OrderType::Stop, qty, price.clone(), Some(price), "sl")
                .await
        }
        other => other,
    }
}

/// Reduce-only take-profit: TAKE_PROFIT_MARKET, falling back to a
/// reduce-only LIMIT at the target.
pub async fn place_take_profit_with_fallback(
    gateway: &ExchangeGateway,
    filters: &SymbolFilters,
    closing_side: Side,
    quantity: f64,
    target_price: f64,
) -> GatewayResult<OrderAck> {
    let symbol = filters.symbol.as_str();
    let qty = filters.format_quantity(quantity);
    let price = filters.format_price(target_price);

    match gateway
        .submit_stop_order(symbol, closing_side, OrderType::TakeProfitMarket, qty.clone(), price.clone(), None, "tp")
        .await
    {
        Err(e) if !e.is_retryable() => {
            warn!(symbol, error = %e, "TAKE_PROFIT_MARKET rejected, falling back to LIMIT");
            gateway.submit_reduce_only_limit(symbol, closing_side, qty, price, "tp").await
        }
        other => other,
    }
}
