// =============================================================================
// Exchange precision — step size / tick size truncation
// =============================================================================
//
// Binance declares increments as decimal strings ("0.00100000").  The number of
// significant decimals is counted on that string and every quantity and price
// is truncated (never rounded up) to it before it leaves the engine.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Guards `floor` against binary representation error (1.005 * 1000 =
/// 1004.9999…).
const FLOOR_EPSILON: f64 = 1e-9;

/// Per-symbol trading filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    /// Decimals allowed in quantities (from `LOT_SIZE.stepSize`).
    pub quantity_decimals: u32,
    /// Decimals allowed in prices (from `PRICE_FILTER.tickSize`).
    pub price_decimals: u32,
    #[serde(default)]
    pub min_qty: f64,
    #[serde(default)]
    pub min_notional: f64,
}

impl SymbolFilters {
    pub fn new(symbol: &str, step_size: &str, tick_size: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity_decimals: decimals_from_size(step_size),
            price_decimals: decimals_from_size(tick_size),
            min_qty: 0.0,
            min_notional: 0.0,
        }
    }

    pub fn truncate_quantity(&self, qty: f64) -> f64 {
        truncate(qty, self.quantity_decimals)
    }

    pub fn format_quantity(&self, qty: f64) -> String {
        format_truncated(qty, self.quantity_decimals)
    }

    pub fn format_price(&self, price: f64) -> String {
        format_truncated(price, self.price_decimals)
    }

    /// Quantity expressed in whole exchange steps.
    pub fn to_lots(&self, qty: f64) -> u64 {
        let factor = 10f64.powi(self.quantity_decimals as i32);
        (qty.max(0.0) * factor + FLOOR_EPSILON).floor() as u64
    }

    pub fn from_lots(&self, lots: u64) -> f64 {
        let factor = 10f64.powi(self.quantity_decimals as i32);
        lots as f64 / factor
    }
}

/// Count significant decimals in an exchange size string.
///
/// `"0.00100000"` → 3, `"0.1"` → 1, `"1"` → 0, `"10.000"` → 0.
pub fn decimals_from_size(size: &str) -> u32 {
    match size.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

/// Truncate `value` toward zero to `decimals` places.
pub fn truncate(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals as i32);
    let scaled = value.abs() * factor + FLOOR_EPSILON;
    value.signum() * scaled.floor() / factor
}

/// Truncate and render with exactly `decimals` places.
pub fn format_truncated(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, truncate(value, decimals))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_significant_decimals() {
        assert_eq!(decimals_from_size("0.00100000"), 3);
        assert_eq!(decimals_from_size("0.1"), 1);
        assert_eq!(decimals_from_size("1"), 0);
        assert_eq!(decimals_from_size("10.000"), 0);
        assert_eq!(decimals_from_size("0.00001000"), 5);
    }

    #[test]
    fn truncates_never_rounds_up() {
        assert_eq!(truncate(1.23456, 3), 1.234);
        assert_eq!(truncate(1.9999, 0), 1.0);
        assert_eq!(truncate(1.005, 3), 1.005);
        assert_eq!(format_truncated(37020.987, 1), "37020.9");
        assert_eq!(format_truncated(0.5, 3), "0.500");
    }

    #[test]
    fn formatting_respects_filters() {
        let f = SymbolFilters::new("BTCUSDT", "0.001", "0.10");
        assert_eq!(f.format_quantity(0.012345), "0.012");
        assert_eq!(f.format_price(64123.456), "64123.4");
    }

    #[test]
    fn lots_round_trip_exactly() {
        let f = SymbolFilters::new("ETHUSDT", "0.001", "0.01");
        assert_eq!(f.to_lots(0.7), 700);
        assert_eq!(f.from_lots(700), 0.7);
        assert_eq!(f.to_lots(0.0019), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn lots_survive_conversion(lots in 0u64..1_000_000, step_decimals in 0usize..7) {
                let step = if step_decimals == 0 { "1".to_string() } else { format!("0.{}1", "0".repeat(step_decimals - 1)) };
                let f = SymbolFilters::new("BTCUSDT", &step, "0.01");
                prop_assert_eq!(f.to_lots(f.from_lots(lots)), lots);
            }

            #[test]
            fn truncation_never_rounds_up(value in 0.0..1_000_000.0_f64, decimals in 0u32..8) {
                let t = truncate(value, decimals);
                prop_assert!(t <= value + 1e-9);
                prop_assert!(value - t < 10f64.powi(-(decimals as i32)) + 1e-9);
            }
        }
    }
}
