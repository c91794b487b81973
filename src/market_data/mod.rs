pub mod backoff;
pub mod candle_buffer;
pub mod stream;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{Candle, CandleBuffer};
pub use stream::{ClosedCandleHandler, KlineStream, StopFlag, StreamState, WsKlineConnector};
