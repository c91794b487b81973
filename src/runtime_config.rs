// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable of the execution and protection engine lives here.  All
// fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.  Percentages are fractions (0.01 = 1 %).
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::MarginMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_margin_asset() -> String {
    "USDT".to_string()
}

fn default_leverage() -> u32 {
    10
}

fn default_stop_loss_pct() -> f64 {
    0.01
}

fn default_take_profit_pct() -> f64 {
    0.02
}

fn default_tier_ratios() -> Vec<f64> {
    vec![0.5, 1.0]
}

fn default_min_protective_legs() -> usize {
    2
}

fn default_cleanup_settle_ms() -> u64 {
    500
}

fn default_entry_settle_ms() -> u64 {
    2000
}

fn default_leg_settle_ms() -> u64 {
    500
}

fn default_min_call_interval_ms() -> u64 {
    200
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_balance_ttl_secs() -> u64 {
    30
}

fn default_position_ttl_secs() -> u64 {
    5
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_candle_capacity() -> usize {
    100
}

fn default_min_history() -> usize {
    30
}

fn default_watchdog_secs() -> u64 {
    65
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_backoff_step_secs() -> u64 {
    5
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_scan_interval_secs() -> u64 {
    30
}

fn default_scan_min_elapsed_secs() -> u64 {
    25
}

fn default_tighten_threshold() -> f64 {
    0.005
}

fn default_tighten_ratio() -> f64 {
    0.5
}

fn default_trade_cooldown_secs() -> u64 {
    30
}

fn default_status_interval_secs() -> u64 {
    30
}

// =============================================================================
// Environment
// =============================================================================

/// Which Binance futures cluster to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Live,
    Test,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Test
    }
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LIVE" => Some(Self::Live),
            "TEST" | "TESTNET" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn rest_base_url(self) -> &'static str {
        match self {
            Self::Live => "https://fapi.binance.com",
            Self::Test => "https://testnet.binancefuture.com",
        }
    }

    pub fn ws_base_url(self) -> &'static str {
        match self {
            Self::Live => "wss://fstream.binance.com",
            Self::Test => "wss://stream.binancefuture.com",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Test => write!(f, "TEST"),
        }
    }
}

// =============================================================================
// Sizing
// =============================================================================

/// How a decision without an explicit quantity is sized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingConfig {
    /// Fixed margin per trade, multiplied by leverage.
    FixedMargin { margin: f64 },
    /// Fraction of wallet balance, clamped, multiplied by leverage.
    BalanceFraction {
        fraction: f64,
        min_margin: f64,
        max_margin: f64,
    },
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self::BalanceFraction {
            fraction: 0.9,
            min_margin: 15.0,
            max_margin: 500.0,
        }
    }
}

// =============================================================================
// Section structs
// =============================================================================

/// Order execution protocol parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Default stop distance from entry when a decision carries none.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Default take-profit distance from entry when a decision carries none.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Cumulative fractions of total quantity for tiered exits. Must be
    /// non-decreasing and end at or below 1.0.
    #[serde(default = "default_tier_ratios")]
    pub tier_ratios: Vec<f64>,

    /// How many of {SL, TP1, TP2} must be placed to call an entry protected.
    #[serde(default = "default_min_protective_legs")]
    pub min_protective_legs: usize,

    /// Market-close a position when no protective leg could be placed.
    #[serde(default = "default_true")]
    pub close_unprotected: bool,

    #[serde(default = "default_cleanup_settle_ms")]
    pub cleanup_settle_ms: u64,

    #[serde(default = "default_entry_settle_ms")]
    pub entry_settle_ms: u64,

    #[serde(default = "default_leg_settle_ms")]
    pub leg_settle_ms: u64,

    /// Minimum seconds between two entries on the same symbol.
    #[serde(default = "default_trade_cooldown_secs")]
    pub trade_cooldown_secs: u64,

    #[serde(default)]
    pub sizing: SizingConfig,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            tier_ratios: default_tier_ratios(),
            min_protective_legs: default_min_protective_legs(),
            close_unprotected: true,
            cleanup_settle_ms: default_cleanup_settle_ms(),
            entry_settle_ms: default_entry_settle_ms(),
            leg_settle_ms: default_leg_settle_ms(),
            trade_cooldown_secs: default_trade_cooldown_secs(),
            sizing: SizingConfig::default(),
        }
    }
}

/// Exchange gateway parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayParams {
    /// Process-wide minimum gap between two remote calls.
    #[serde(default = "default_min_call_interval_ms")]
    pub min_call_interval_ms: u64,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_balance_ttl_secs")]
    pub balance_ttl_secs: u64,

    #[serde(default = "default_position_ttl_secs")]
    pub position_ttl_secs: u64,
}

impl Default for GatewayParams {
    fn default() -> Self {
        Self {
            min_call_interval_ms: default_min_call_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            balance_ttl_secs: default_balance_ttl_secs(),
            position_ttl_secs: default_position_ttl_secs(),
        }
    }
}

/// Market data stream parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Closed candles retained per symbol.
    #[serde(default = "default_candle_capacity")]
    pub candle_capacity: usize,

    /// Closed candles required before a symbol may trade.
    #[serde(default = "default_min_history")]
    pub min_history: usize,

    /// Receive watchdog: silence longer than this triggers a keepalive ping.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    /// Proactive ping cadence while the stream is healthy.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Upper bound on one connect attempt (TCP + TLS + upgrade).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            candle_capacity: default_candle_capacity(),
            min_history: default_min_history(),
            watchdog_secs: default_watchdog_secs(),
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_step_secs: default_backoff_step_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Protection scanner and SL-tightening parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionParams {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// A sweep is skipped if the previous one finished less than this ago.
    #[serde(default = "default_scan_min_elapsed_secs")]
    pub scan_min_elapsed_secs: u64,

    #[serde(default = "default_true")]
    pub enable_sl_tightening: bool,

    /// Profit ratio (pnl / entry notional) that triggers tightening.
    #[serde(default = "default_tighten_threshold")]
    pub tighten_threshold: f64,

    /// Fraction of the original stop distance kept after tightening.
    #[serde(default = "default_tighten_ratio")]
    pub tighten_ratio: f64,
}

impl Default for ProtectionParams {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            scan_min_elapsed_secs: default_scan_min_elapsed_secs(),
            enable_sl_tightening: true,
            tighten_threshold: default_tighten_threshold(),
            tighten_ratio: default_tighten_ratio(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Bastion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub environment: Environment,

    /// Symbols the engine is watching and trading.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_margin_asset")]
    pub margin_asset: String,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default)]
    pub margin_mode: MarginMode,

    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    #[serde(default)]
    pub execution: ExecutionParams,

    #[serde(default)]
    pub gateway: GatewayParams,

    #[serde(default)]
    pub stream: StreamParams,

    #[serde(default)]
    pub protection: ProtectionParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            symbols: default_symbols(),
            margin_asset: default_margin_asset(),
            leverage: default_leverage(),
            margin_mode: MarginMode::default(),
            status_interval_secs: default_status_interval_secs(),
            execution: ExecutionParams::default(),
            gateway: GatewayParams::default(),
            stream: StreamParams::default(),
            protection: ProtectionParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            environment = %config.environment,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Check every parameter and report all problems at once.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let exec = &self.execution;

        if self.symbols.is_empty() {
            errors.push("no symbols configured".to_string());
        }
        if self.leverage == 0 || self.leverage > 125 {
            errors.push(format!("leverage {} outside 1..=125", self.leverage));
        }
        for (name, pct) in [
            ("stop_loss_pct", exec.stop_loss_pct),
            ("take_profit_pct", exec.take_profit_pct),
        ] {
            if !(pct > 0.0 && pct < 1.0) {
                errors.push(format!("{name} {pct} must be in (0, 1)"));
            }
        }
        if exec.tier_ratios.iter().any(|r| !(*r > 0.0 && *r <= 1.0)) {
            errors.push("tier_ratios must be in (0, 1]".to_string());
        }
        if exec.tier_ratios.windows(2).any(|w| w[1] < w[0]) {
            errors.push("tier_ratios must be non-decreasing".to_string());
        }
        if exec.min_protective_legs == 0 {
            errors.push("min_protective_legs must be at least 1".to_string());
        }
        match exec.sizing {
            SizingConfig::FixedMargin { margin } if margin <= 0.0 => {
                errors.push("fixed sizing margin must be positive".to_string());
            }
            SizingConfig::BalanceFraction { fraction, min_margin, max_margin }
                if !(fraction > 0.0 && fraction <= 1.0) || min_margin > max_margin =>
            {
                errors.push("balance sizing needs fraction in (0, 1] and min <= max".to_string());
            }
            _ => {}
        }
        if self.stream.candle_capacity < self.stream.min_history {
            errors.push("candle_capacity must be >= min_history".to_string());
        }
        if self.stream.watchdog_secs <= self.stream.keepalive_secs {
            errors.push("watchdog_secs must exceed keepalive_secs".to_string());
        }
        if self.stream.connect_timeout_secs == 0 {
            errors.push("connect_timeout_secs must be positive".to_string());
        }
        if self.protection.scan_interval_secs == 0 {
            errors.push("scan_interval_secs must be positive".to_string());
        }
        if !(self.protection.tighten_ratio > 0.0 && self.protection.tighten_ratio < 1.0) {
            errors.push("tighten_ratio must be in (0, 1)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
