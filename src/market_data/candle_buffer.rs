use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle from the Binance futures kline feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer of closed candles per symbol
// ---------------------------------------------------------------------------

/// Bounded ring of the most recent closed candles for every symbol.  When a
/// ring is full the oldest candle is evicted, so its length never exceeds
/// `capacity`.
pub struct CandleBuffer {
    rings: RwLock<HashMap<String, VecDeque<Candle>>>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a closed candle and return the ring's new length.
    ///
    /// Unclosed candles are ignored.  A candle with the same `open_time` as
    /// the newest stored one replaces it (replayed after a reconnect).
    pub fn push_closed(&self, symbol: &str, candle: Candle) -> usize {
        if !candle.is_closed {
            return self.len(symbol);
        }
        let mut map = self.rings.write();
        let ring = map
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity + 1));

        if ring.back().map(|last| last.open_time) == Some(candle.open_time) {
            ring.pop_back();
        }
        ring.push_back(candle);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        ring.len()
    }

    /// Replace a symbol's history with REST-seeded candles, dropping any whose
    /// bucket has not closed by `now_ms`.
    pub fn seed(&self, symbol: &str, candles: Vec<Candle>, now_ms: i64) -> usize {
        let mut ring: VecDeque<Candle> = candles
            .into_iter()
            .filter(|c| c.close_time < now_ms)
            .map(|mut c| {
                c.is_closed = true;
                c
            })
            .collect();
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        let len = ring.len();
        self.rings.write().insert(symbol.to_string(), ring);
        len
    }

    /// The most recent `count` closed candles, oldest first.
    pub fn closed(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let map = self.rings.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.rings.read().get(symbol).map_or(0, VecDeque::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a kline stream message.  Accepts both the single-stream payload
/// `{ "e": "kline", "s": "BTCUSDT", "k": {...} }` and the combined-stream
/// envelope `{ "stream": ..., "data": {...} }`.
///
/// Returns `Ok(None)` for well-formed messages that are not klines.
pub fn parse_stream_kline(text: &str) -> Result<Option<(String, Candle)>> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() { &root["data"] } else { &root };
    if data.get("k").is_none() {
        return Ok(None);
    }

    let symbol = data["s"].as_str().context("missing field s")?.to_uppercase();
    let k = &data["k"];

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok(Some((symbol, candle)))
}

/// Parse one row of the REST `/klines` array-of-arrays response.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
pub fn parse_rest_kline(row: &serde_json::Value) -> Result<Candle> {
    let arr = row.as_array().context("kline entry is not an array")?;
    if arr.len() < 7 {
        anyhow::bail!("kline entry has {} elements, expected at least 7", arr.len());
    }
    Ok(Candle {
        open_time: arr[0].as_i64().context("kline openTime")?,
        open: parse_string_f64(&arr[1], "open")?,
        high: parse_string_f64(&arr[2], "high")?,
        low: parse_string_f64(&arr[3], "low")?,
        close: parse_string_f64(&arr[4], "close")?,
        volume: parse_string_f64(&arr[5], "volume")?,
        close_time: arr[6].as_i64().context("kline closeTime")?,
        is_closed: true,
    })
}

/// Helper: Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed,
        }
    }

    #[test]
    fn full_ring_evicts_oldest_and_keeps_length() {
        let buf = CandleBuffer::new(3);
        for i in 0..3 {
            buf.push_closed("BTCUSDT", sample_candle(i * 60_000, 100.0 + i as f64, true));
        }
        assert_eq!(buf.len("BTCUSDT"), 3);

        let len = buf.push_closed("BTCUSDT", sample_candle(3 * 60_000, 103.0, true));
        assert_eq!(len, 3);
        let closes: Vec<f64> = buf.closed("BTCUSDT", 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![101.0, 102.0, 103.0]);
    }

    #[test]
    fn unclosed_candles_are_not_stored() {
        let buf = CandleBuffer::new(10);
        buf.push_closed("ETHUSDT", sample_candle(0, 50.0, false));
        assert_eq!(buf.len("ETHUSDT"), 0);
        assert!(buf.closed("ETHUSDT", 1).is_empty());
    }

    #[test]
    fn replayed_candle_replaces_newest() {
        let buf = CandleBuffer::new(10);
        buf.push_closed("ETHUSDT", sample_candle(0, 50.0, true));
        buf.push_closed("ETHUSDT", sample_candle(0, 51.0, true));
        assert_eq!(buf.len("ETHUSDT"), 1);
        assert_eq!(buf.closed("ETHUSDT", 1)[0].close, 51.0);
    }

    #[test]
    fn seed_drops_open_bucket_and_trims() {
        let buf = CandleBuffer::new(2);
        let candles: Vec<Candle> = (0..4).map(|i| sample_candle(i * 60_000, i as f64, true)).collect();
        // Bucket 3 closes at 239_999; "now" is inside it.
        let len = buf.seed("SOLUSDT", candles, 200_000);
        assert_eq!(len, 2);
        let closes: Vec<f64> = buf.closed("SOLUSDT", 5).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![1.0, 2.0]);
    }

    #[test]
    fn parse_stream_kline_ok() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "s": "BTCUSDT", "i": "1m",
                "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
                "v": "123.456", "n": 1500, "x": true
            }
        }"#;
        let (symbol, candle) = parse_stream_kline(json).unwrap().unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(candle.is_closed);
    }

    #[test]
    fn non_kline_message_is_skipped() {
        assert!(parse_stream_kline(r#"{"result": null, "id": 1}"#).unwrap().is_none());
        assert!(parse_stream_kline("not json").is_err());
    }

    #[test]
    fn parse_rest_row() {
        let row = serde_json::json!([
            1700000000000i64, "10.0", "11.0", "9.5", "10.5", "1000", 1700000059999i64, "10500", 12, "500", "5250", "0"
        ]);
        let c = parse_rest_kline(&row).unwrap();
        assert_eq!(c.close, 10.5);
        assert_eq!(c.close_time, 1700000059999);
        assert!(parse_rest_kline(&serde_json::json!([1, "2"])).is_err());
    }
}
