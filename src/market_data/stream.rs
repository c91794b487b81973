// =============================================================================
// Kline Stream Consumer — one reconnecting connection per symbol
// =============================================================================
//
// States:
//   Connecting → Connected → {Receiving | IdlePing} → Disconnected
//              → Backoff → Connecting … → GivingUp
//
// Each connect attempt is bounded by `connect_timeout_secs`; a stalled
// handshake counts as a failed connect.  Reconnects back off linearly
// (step × attempt, capped) and the counter resets after every successful
// connect.  After `max_reconnect_attempts`
// consecutive failed connects the consumer gives up with `ConnectionLost`.
//
// A receive watchdog (default 65 s of silence) sends a ping; a failed ping or
// a second silent window forces a reconnect.  Independently of the watchdog
// the consumer pings every `keepalive` interval.
//
// Closed candles are appended to the shared `CandleBuffer` and the handler is
// awaited inline, so one symbol's events are processed strictly in order.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::market_data::backoff::LinearBackoff;
use crate::market_data::candle_buffer::{parse_stream_kline, Candle, CandleBuffer};
use crate::runtime_config::StreamParams;
use crate::status::EngineStatus;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Connecting,
    Connected,
    Receiving,
    IdlePing,
    Disconnected,
    Backoff,
    GivingUp,
    Stopped,
}

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives every closed candle for a symbol, in arrival order.
#[async_trait]
pub trait ClosedCandleHandler: Send + Sync {
    async fn on_closed_candle(&self, symbol: &str, candle: Candle);
}

/// One frame off the wire, reduced to what the consumer cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    /// Ping / pong / binary traffic: proves the link is alive.
    Keepalive,
    Close,
}

#[async_trait]
pub trait FeedConnection: Send {
    /// `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
    async fn send_ping(&mut self) -> Result<()>;
}

#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self, symbol: &str) -> Result<Box<dyn FeedConnection>>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite transport
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `<base>/ws/<symbol>@kline_<interval>`.
pub struct WsKlineConnector {
    base_url: String,
    interval: String,
}

impl WsKlineConnector {
    pub fn new(base_url: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            interval: interval.into(),
        }
    }

    pub fn url_for(&self, symbol: &str) -> String {
        format!("{}/ws/{}@kline_{}", self.base_url, symbol.to_lowercase(), self.interval)
    }
}

struct WsConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FeedConnector for WsKlineConnector {
    async fn connect(&self, symbol: &str) -> Result<Box<dyn FeedConnection>> {
        let url = self.url_for(symbol);
        debug!(url = %url, "connecting to kline WebSocket");
        let (ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        let (write, read) = ws.split();
        Ok(Box::new(WsConnection { write, read }))
    }
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        let msg = self.read.next().await?;
        Some(match msg {
            Ok(Message::Text(text)) => Ok(Frame::Text(text)),
            Ok(Message::Close(_)) => Ok(Frame::Close),
            // tungstenite queues pong replies to server pings automatically.
            Ok(_) => Ok(Frame::Keepalive),
            Err(e) => Err(e.into()),
        })
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.write
            .send(Message::Ping(Vec::new()))
            .await
            .context("failed to send keepalive ping")
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Why a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    Disconnected,
}

pub struct KlineStream {
    symbol: String,
    params: StreamParams,
    connector: Arc<dyn FeedConnector>,
    buffer: Arc<CandleBuffer>,
    status: Arc<EngineStatus>,
    stop: StopFlag,
}

impl KlineStream {
    pub fn new(
        symbol: &str,
        params: StreamParams,
        connector: Arc<dyn FeedConnector>,
        buffer: Arc<CandleBuffer>,
        status: Arc<EngineStatus>,
        stop: StopFlag,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            params,
            connector,
            buffer,
            status,
            stop,
        }
    }

    fn set_state(&self, state: StreamState) {
        if self.status.stream_state(&self.symbol) != Some(state) {
            debug!(symbol = %self.symbol, ?state, "stream state");
            self.status.set_stream_state(&self.symbol, state);
        }
    }

    /// Run until stopped (`Ok`) or the reconnect budget is exhausted
    /// (`ConnectionLost`).
    pub async fn run(&self, handler: &dyn ClosedCandleHandler) -> Result<(), EngineError> {
        let mut backoff = LinearBackoff::new(
            Duration::from_secs(self.params.backoff_step_secs),
            Duration::from_secs(self.params.backoff_cap_secs),
        );
        let mut failed_connects: u32 = 0;
        let connect_timeout = Duration::from_secs(self.params.connect_timeout_secs);

        loop {
            if self.stop.is_stopped() {
                self.set_state(StreamState::Stopped);
                return Ok(());
            }

            self.set_state(StreamState::Connecting);
            let attempt = match tokio::time::timeout(connect_timeout, self.connector.connect(&self.symbol)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("connect timed out after {}s", connect_timeout.as_secs())),
            };
            match attempt {
                Ok(conn) => {
                    failed_connects = 0;
                    backoff.reset();
                    self.set_state(StreamState::Connected);
                    info!(symbol = %self.symbol, "kline stream connected");

                    if self.consume(conn, handler).await == SessionEnd::Stopped {
                        self.set_state(StreamState::Stopped);
                        return Ok(());
                    }
                    self.set_state(StreamState::Disconnected);
                }
                Err(e) => {
                    failed_connects += 1;
                    warn!(
                        symbol = %self.symbol,
                        attempt = failed_connects,
                        max = self.params.max_reconnect_attempts,
                        error = %e,
                        "kline stream connect failed"
                    );
                    if failed_connects >= self.params.max_reconnect_attempts {
                        self.set_state(StreamState::GivingUp);
                        error!(symbol = %self.symbol, attempts = failed_connects, "giving up on kline stream");
                        return Err(EngineError::ConnectionLost {
                            symbol: self.symbol.clone(),
                            attempts: failed_connects,
                        });
                    }
                }
            }

            let delay = backoff.next_delay();
            self.set_state(StreamState::Backoff);
            info!(
                symbol = %self.symbol,
                attempt = backoff.attempt(),
                delay_secs = delay.as_secs(),
                "reconnecting after backoff"
            );
            self.sleep_unless_stopped(delay).await;
        }
    }

    /// Sleep in one-second slices so a stop request is honoured promptly.
    async fn sleep_unless_stopped(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_secs(1))).await;
        }
    }

    async fn consume(&self, mut conn: Box<dyn FeedConnection>, handler: &dyn ClosedCandleHandler) -> SessionEnd {
        let watchdog = Duration::from_secs(self.params.watchdog_secs);
        let keepalive_every = Duration::from_secs(self.params.keepalive_secs);

        let mut watchdog_deadline = Instant::now() + watchdog;
        let mut idle_windows = 0u32;
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_every, keepalive_every);

        loop {
            if self.stop.is_stopped() {
                return SessionEnd::Stopped;
            }

            tokio::select! {
                frame = conn.next_frame() => {
                    match frame {
                        None => {
                            warn!(symbol = %self.symbol, "kline stream ended");
                            return SessionEnd::Disconnected;
                        }
                        Some(Err(e)) => {
                            warn!(symbol = %self.symbol, error = %e, "kline stream read error");
                            return SessionEnd::Disconnected;
                        }
                        Some(Ok(Frame::Close)) => {
                            info!(symbol = %self.symbol, "kline stream closed by server");
                            return SessionEnd::Disconnected;
                        }
                        Some(Ok(Frame::Keepalive)) => {}
                        Some(Ok(Frame::Text(text))) => {
                            self.set_state(StreamState::Receiving);
                            self.handle_text(&text, handler).await;
                        }
                    }
                    idle_windows = 0;
                    watchdog_deadline = Instant::now() + watchdog;
                }
                _ = tokio::time::sleep_until(watchdog_deadline) => {
                    idle_windows += 1;
                    if idle_windows >= 2 {
                        warn!(symbol = %self.symbol, "no traffic for two watchdog windows, reconnecting");
                        return SessionEnd::Disconnected;
                    }
                    self.set_state(StreamState::IdlePing);
                    warn!(symbol = %self.symbol, silent_secs = watchdog.as_secs(), "receive watchdog fired, probing with ping");
                    if let Err(e) = conn.send_ping().await {
                        warn!(symbol = %self.symbol, error = %e, "watchdog ping failed, reconnecting");
                        return SessionEnd::Disconnected;
                    }
                    watchdog_deadline = Instant::now() + watchdog;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = conn.send_ping().await {
                        warn!(symbol = %self.symbol, error = %e, "keepalive ping failed, reconnecting");
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, handler: &dyn ClosedCandleHandler) {
        match parse_stream_kline(text) {
            Ok(Some((symbol, candle))) if candle.is_closed => {
                if symbol != self.symbol {
                    warn!(expected = %self.symbol, got = %symbol, "kline for unexpected symbol ignored");
                    return;
                }
                let len = self.buffer.push_closed(&self.symbol, candle.clone());
                debug!(symbol = %self.symbol, close = candle.close, buffered = len, "candle closed");
                handler.on_closed_candle(&self.symbol, candle).await;
            }
            Ok(_) => {}
            Err(e) => warn!(symbol = %self.symbol, error = %e, "failed to parse kline message"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn params() -> StreamParams {
        StreamParams {
            interval: "1m".into(),
            candle_capacity: 100,
            min_history: 30,
            watchdog_secs: 65,
            keepalive_secs: 30,
            connect_timeout_secs: 10,
            max_reconnect_attempts: 10,
            backoff_step_secs: 5,
            backoff_cap_secs: 30,
        }
    }

    fn kline_json(open_time: i64, close: f64, closed: bool) -> String {
        serde_json::json!({
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": open_time, "T": open_time + 59_999, "i": "1m",
                "o": "1", "h": "1", "l": "1", "c": close.to_string(), "v": "1", "x": closed
            }
        })
        .to_string()
    }

    /// What a scripted connection does once its frames run out.
    #[derive(Clone, Copy)]
    enum Tail {
        /// Go silent forever.
        Silent,
        /// End the stream.
        End,
    }

    struct ScriptedConnection {
        frames: VecDeque<Frame>,
        tail: Tail,
        pings: Arc<Mutex<u32>>,
        stop_after_frames: Option<StopFlag>,
    }

    #[async_trait]
    impl FeedConnection for ScriptedConnection {
        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            if let Some(f) = self.frames.pop_front() {
                return Some(Ok(f));
            }
            if let Some(stop) = &self.stop_after_frames {
                stop.stop();
            }
            match self.tail {
                Tail::Silent => std::future::pending().await,
                Tail::End => None,
            }
        }

        async fn send_ping(&mut self) -> Result<()> {
            *self.pings.lock() += 1;
            Ok(())
        }
    }

    /// Each `connect` pops the next scripted outcome; once exhausted every
    /// connect fails.
    struct ScriptedConnector {
        sessions: Mutex<VecDeque<ScriptedConnection>>,
        connects: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn new(sessions: Vec<ScriptedConnection>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                connects: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn connect(&self, _symbol: &str) -> Result<Box<dyn FeedConnection>> {
            self.connects.lock().push(Instant::now());
            match self.sessions.lock().pop_front() {
                Some(s) => Ok(Box::new(s)),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    /// Accepts the TCP connection but never finishes the handshake.
    struct StalledConnector {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl FeedConnector for StalledConnector {
        async fn connect(&self, _symbol: &str) -> Result<Box<dyn FeedConnection>> {
            *self.attempts.lock() += 1;
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl ClosedCandleHandler for Recorder {
        async fn on_closed_candle(&self, _symbol: &str, candle: Candle) {
            // Yield so a concurrent handler would interleave.
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.seen.lock().push(candle.close);
        }
    }

    fn stream(connector: Arc<dyn FeedConnector>, stop: StopFlag) -> (KlineStream, Arc<CandleBuffer>, Arc<EngineStatus>) {
        let buffer = Arc::new(CandleBuffer::new(100));
        let status = Arc::new(EngineStatus::new());
        let s = KlineStream::new("BTCUSDT", params(), connector, buffer.clone(), status.clone(), stop);
        (s, buffer, status)
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ten_failed_connects() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let (s, _, status) = stream(connector.clone(), StopFlag::new());

        let start = Instant::now();
        let err = s.run(&Recorder::default()).await.unwrap_err();

        assert_eq!(err, EngineError::ConnectionLost { symbol: "BTCUSDT".into(), attempts: 10 });
        assert_eq!(connector.connects.lock().len(), 10);
        // 5 + 10 + 15 + 20 + 25 + 30 × 4 between the ten attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(195));
        assert_eq!(status.stream_state("BTCUSDT"), Some(StreamState::GivingUp));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_counts_as_failed_connect() {
        let connector = Arc::new(StalledConnector { attempts: Mutex::new(0) });
        let mut p = params();
        p.max_reconnect_attempts = 2;
        let s = KlineStream::new(
            "BTCUSDT",
            p,
            connector.clone(),
            Arc::new(CandleBuffer::new(10)),
            Arc::new(EngineStatus::new()),
            StopFlag::new(),
        );

        let start = Instant::now();
        let err = s.run(&Recorder::default()).await.unwrap_err();
        assert_eq!(err, EngineError::ConnectionLost { symbol: "BTCUSDT".into(), attempts: 2 });
        assert_eq!(*connector.attempts.lock(), 2);
        // 10 s timeout, 5 s backoff, 10 s timeout.
        assert_eq!(start.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_candles_are_buffered_and_handled_in_order() {
        let stop = StopFlag::new();
        let session = ScriptedConnection {
            frames: vec![
                Frame::Text(kline_json(0, 1.0, true)),
                Frame::Text(kline_json(60_000, 2.0, false)),
                Frame::Keepalive,
                Frame::Text(kline_json(60_000, 2.5, true)),
                Frame::Text("garbage".into()),
                Frame::Text(kline_json(120_000, 3.0, true)),
            ]
            .into(),
            tail: Tail::Silent,
            pings: Arc::default(),
            stop_after_frames: Some(stop.clone()),
        };
        let connector = Arc::new(ScriptedConnector::new(vec![session]));
        let (s, buffer, status) = stream(connector, stop.clone());

        let recorder = Recorder::default();
        let run = s.run(&recorder);
        // The stop flag is observed on the next loop turn; the keepalive tick
        // wakes the select.
        assert!(run.await.is_ok());

        assert_eq!(*recorder.seen.lock(), vec![1.0, 2.5, 3.0]);
        assert_eq!(buffer.len("BTCUSDT"), 3);
        assert_eq!(status.stream_state("BTCUSDT"), Some(StreamState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_pinged_then_dropped() {
        let pings = Arc::new(Mutex::new(0));
        let session = ScriptedConnection {
            frames: VecDeque::new(),
            tail: Tail::Silent,
            pings: pings.clone(),
            stop_after_frames: None,
        };
        let mut p = params();
        p.max_reconnect_attempts = 1;
        p.keepalive_secs = 1_000;
        let connector = Arc::new(ScriptedConnector::new(vec![session]));
        let buffer = Arc::new(CandleBuffer::new(100));
        let status = Arc::new(EngineStatus::new());
        let s = KlineStream::new("BTCUSDT", p, connector.clone(), buffer, status, StopFlag::new());

        let start = Instant::now();
        let err = s.run(&Recorder::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectionLost { .. }));

        let connects = connector.connects.lock().clone();
        assert_eq!(connects.len(), 2);
        // Ping at 65 s, drop at 130 s, then a 5 s backoff before reconnecting.
        assert_eq!(*pings.lock(), 1);
        assert_eq!(connects[1] - start, Duration::from_secs(135));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resets_after_successful_connect() {
        let ended = || ScriptedConnection {
            frames: VecDeque::new(),
            tail: Tail::End,
            pings: Arc::default(),
            stop_after_frames: None,
        };
        let connector = Arc::new(ScriptedConnector::new(vec![ended(), ended()]));
        let mut p = params();
        p.max_reconnect_attempts = 1;
        let s = KlineStream::new(
            "BTCUSDT",
            p,
            connector.clone(),
            Arc::new(CandleBuffer::new(10)),
            Arc::new(EngineStatus::new()),
            StopFlag::new(),
        );
        let start = Instant::now();
        s.run(&Recorder::default()).await.unwrap_err();

        let offsets: Vec<u64> = connector.connects.lock().iter().map(|t| (*t - start).as_secs()).collect();
        // Each successful session resets the backoff, so both gaps are 5 s.
        assert_eq!(offsets, vec![0, 5, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_ends_loop_before_connecting() {
        let stop = StopFlag::new();
        stop.stop();
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let (s, _, status) = stream(connector.clone(), stop);
        assert!(s.run(&Recorder::default()).await.is_ok());
        assert!(connector.connects.lock().is_empty());
        assert_eq!(status.stream_state("BTCUSDT"), Some(StreamState::Stopped));
    }

    #[test]
    fn ws_url_is_lowercase_single_stream() {
        let c = WsKlineConnector::new("wss://fstream.binance.com", "1m");
        assert_eq!(c.url_for("BTCUSDT"), "wss://fstream.binance.com/ws/btcusdt@kline_1m");
    }
}
