// =============================================================================
// Error taxonomy — typed outcomes for every exchange interaction
// =============================================================================
//
// `GatewayError` is what a single remote call returns.  It is classified as
// retryable or terminal; the gateway never retries on its own.
//
// `EngineError` is the engine-level taxonomy the protocol, scanner and stream
// loops report through the status surface.
// =============================================================================

use thiserror::Error;

/// Whether a caller may reasonably try the same call again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Failure of a single gateway call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("rate limited by exchange (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    #[error("symbol {0} is unknown to the exchange")]
    UnknownSymbol(String),
}

/// Binance error codes that indicate a transient server-side condition.
const RETRYABLE_CODES: &[i64] = &[
    -1000, // unknown error while processing
    -1001, // internal disconnect
    -1003, // too many requests
    -1007, // backend timeout, execution status unknown
    -1008, // server overloaded
    -1015, // too many new orders
];

/// "Unknown order sent" — returned by cancel calls when there is nothing to
/// cancel.
pub const CODE_UNKNOWN_ORDER: i64 = -2011;
/// "No need to change margin type."
pub const CODE_MARGIN_TYPE_UNCHANGED: i64 = -4046;
/// "Order would immediately trigger."
pub const CODE_WOULD_TRIGGER: i64 = -2021;

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => ErrorClass::Retryable,
            Self::Rejected { code, .. } if RETRYABLE_CODES.contains(code) => ErrorClass::Retryable,
            Self::Rejected { .. } | Self::Decode(_) | Self::UnknownSymbol(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Exchange error code, if this was an API-level rejection.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Build from a Binance `{"code": -2019, "msg": "..."}` body.
    pub fn from_api_body(status: u16, body: &serde_json::Value) -> Self {
        if status == 429 || status == 418 {
            return Self::RateLimited { status };
        }
        match (body["code"].as_i64(), body["msg"].as_str()) {
            (Some(code), Some(msg)) => Self::Rejected {
                code,
                message: msg.to_string(),
            },
            _ if status >= 500 => Self::Network(format!("HTTP {status}: {body}")),
            _ => Self::Decode(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(0)
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Which protective leg an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum LegKind {
    StopLoss,
    TakeProfit(usize),
}

impl std::fmt::Display for LegKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::TakeProfit(i) => write!(f, "TP{}", i + 1),
        }
    }
}

/// Engine-level error taxonomy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Network-level failure; nothing was corrupted, the caller may retry.
    #[error("transient failure on {symbol}: {source}")]
    TransientNetworkFailure {
        symbol: String,
        #[source]
        source: GatewayError,
    },

    /// The exchange refused the order; terminal for that order only.
    #[error("exchange rejected {symbol}: {source}")]
    ExchangeRejection {
        symbol: String,
        #[source]
        source: GatewayError,
    },

    /// Entry filled but some protective legs are missing; queued for repair.
    #[error("{symbol} partially protected, missing {}", format_legs(.missing))]
    PartialProtectionFailure { symbol: String, missing: Vec<LegKind> },

    /// Not enough history to trade the symbol.
    #[error("{symbol} has {have} candles, needs {need}")]
    StaleDataFailure { symbol: String, have: usize, need: usize },

    /// The market-data stream gave up after exhausting its reconnect budget.
    #[error("{symbol} stream lost after {attempts} reconnect attempts")]
    ConnectionLost { symbol: String, attempts: u32 },

    /// Internal inconsistency detected mid-sequence (bad filters, bad price).
    #[error("{symbol}: {reason}")]
    Unexpected { symbol: String, reason: String },
}

fn format_legs(legs: &[LegKind]) -> String {
    legs.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

impl EngineError {
    /// Convert a gateway failure into the engine taxonomy for `symbol`.
    pub fn from_gateway(symbol: &str, err: GatewayError) -> Self {
        let symbol = symbol.to_string();
        match err.class() {
            ErrorClass::Retryable => Self::TransientNetworkFailure { symbol, source: err },
            ErrorClass::Terminal => Self::ExchangeRejection { symbol, source: err },
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::TransientNetworkFailure { symbol, .. }
            | Self::ExchangeRejection { symbol, .. }
            | Self::PartialProtectionFailure { symbol, .. }
            | Self::StaleDataFailure { symbol, .. }
            | Self::ConnectionLost { symbol, .. }
            | Self::Unexpected { symbol, .. } => symbol,
        }
    }

    /// Only `ConnectionLost` stops the bot.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}
