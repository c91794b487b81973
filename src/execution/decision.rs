// =============================================================================
// Decision records and sizing
// =============================================================================
//
// A decision arrives from an external signal source as JSON:
//
//   {"symbol":"BTCUSDT","side":"BUY","stop_loss":{"percent":0.01},
//    "take_profits":[{"price":101500.0}],"tiered":false,"strategy":"breakout"}
//
// Protective prices are either absolute or a fraction of the entry price.
// Anything the decision leaves out falls back to the configured defaults.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::runtime_config::{ExecutionParams, SizingConfig};
use crate::types::Side;

/// A protective price, absolute or relative to entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceTarget {
    Price(f64),
    /// Fraction of entry, e.g. 0.01 for 1 %.
    Percent(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub symbol: String,
    pub side: Side,
    /// Reference price used for sizing.  Filled from the last close when absent.
    #[serde(default)]
    pub entry_price: Option<f64>,
    /// Explicit quantity; overrides the sizing policy.
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<PriceTarget>,
    #[serde(default)]
    pub take_profits: Vec<PriceTarget>,
    /// Split the take-profit across the configured tier ratios.
    #[serde(default)]
    pub tiered: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "external".to_string()
}

impl DecisionRecord {
    pub fn new(symbol: &str, side: Side) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            entry_price: None,
            quantity: None,
            stop_loss: None,
            take_profits: Vec::new(),
            tiered: false,
            strategy: default_strategy(),
        }
    }
}

// ---------------------------------------------------------------------------
// Protective prices
// ---------------------------------------------------------------------------

/// Side-aware stop and target prices derived from a fill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionPlan {
    pub stop_loss: f64,
    /// One target per take-profit leg.
    pub take_profits: Vec<f64>,
}

impl ProtectionPlan {
    /// Every price finite and positive.
    pub fn is_valid(&self) -> bool {
        std::iter::once(self.stop_loss)
            .chain(self.take_profits.iter().copied())
            .all(|p| p.is_finite() && p > 0.0)
    }
}

/// Stop below / target above entry for longs, mirrored for shorts.
pub fn stop_price(side: Side, entry: f64, target: PriceTarget) -> f64 {
    match target {
        PriceTarget::Price(p) => p,
        PriceTarget::Percent(pct) => entry * (1.0 - side.direction() * pct),
    }
}

pub fn target_price(side: Side, entry: f64, target: PriceTarget) -> f64 {
    match target {
        PriceTarget::Price(p) => p,
        PriceTarget::Percent(pct) => entry * (1.0 + side.direction() * pct),
    }
}

/// Resolve the stop and `legs` targets for a fill at `entry`.  Legs the
/// decision does not name step out by the default take-profit distance
/// (leg k at k × take_profit_pct).
pub fn plan_protection(decision: &DecisionRecord, entry: f64, legs: usize, params: &ExecutionParams) -> ProtectionPlan {
    let side = decision.side;
    let stop_loss = stop_price(
        side,
        entry,
        decision.stop_loss.unwrap_or(PriceTarget::Percent(params.stop_loss_pct)),
    );
    let take_profits = (0..legs.max(1))
        .map(|k| {
            let t = decision
                .take_profits
                .get(k)
                .copied()
                .unwrap_or(PriceTarget::Percent(params.take_profit_pct * (k + 1) as f64));
            target_price(side, entry, t)
        })
        .collect();
    ProtectionPlan { stop_loss, take_profits }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub wallet_balance: f64,
    pub leverage: u32,
    pub price: f64,
}

/// Turns account state into an untruncated order quantity.
pub trait SizingPolicy: Send + Sync {
    fn quantity(&self, inputs: &SizingInputs) -> f64;
}

pub struct FixedMargin {
    pub margin: f64,
}

impl SizingPolicy for FixedMargin {
    fn quantity(&self, inputs: &SizingInputs) -> f64 {
        if inputs.price <= 0.0 {
            return 0.0;
        }
        self.margin * inputs.leverage as f64 / inputs.price
    }
}

pub struct BalanceFraction {
    pub fraction: f64,
    pub min_margin: f64,
    pub max_margin: f64,
}

impl SizingPolicy for BalanceFraction {
    fn quantity(&self, inputs: &SizingInputs) -> f64 {
        if inputs.price <= 0.0 || inputs.wallet_balance <= 0.0 {
            return 0.0;
        }
        let margin = (inputs.wallet_balance * self.fraction)
            .max(self.min_margin)
            .min(self.max_margin)
            .min(inputs.wallet_balance);
        margin * inputs.leverage as f64 / inputs.price
    }
}

pub fn sizing_policy(config: &SizingConfig) -> Box<dyn SizingPolicy> {
    match *config {
        SizingConfig::FixedMargin { margin } => Box::new(FixedMargin { margin }),
        SizingConfig::BalanceFraction { fraction, min_margin, max_margin } => Box::new(BalanceFraction {
            fraction,
            min_margin,
            max_margin,
        }),
    }
}
