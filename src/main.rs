// =============================================================================
// Bastion — Main Entry Point
// =============================================================================
//
// Wires the exchange gateway, per-symbol kline streams and traders, the
// protection scanner, the trade-event logger and the stdin decision feed,
// then runs until Ctrl+C or a fatal stream failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod bot;
mod error;
mod execution;
mod exit;
mod gateway;
mod market_data;
mod position_tracker;
mod precision;
mod protection;
mod runtime_config;
mod signal;
mod status;
mod trade_events;
mod types;

#[cfg(test)]
mod test_support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceFuturesClient;
use crate::bot::{prepare_symbol, SymbolTrader};
use crate::exit::{SlTighteningBook, TieredExitBook};
use crate::execution::OrderExecutionProtocol;
use crate::gateway::{CacheMode, ExchangeGateway};
use crate::market_data::stream::FeedConnector;
use crate::market_data::{CandleBuffer, KlineStream, StopFlag, WsKlineConnector};
use crate::position_tracker::PositionTracker;
use crate::protection::{ProtectionLedger, ProtectionScanner};
use crate::runtime_config::{Environment, RuntimeConfig};
use crate::signal::{run_decision_feed, QueuedSignalSource};
use crate::status::{BotPhase, EngineStatus};
use crate::trade_events::{run_trade_event_logger, TradeEventSink};

const DEFAULT_CONFIG_PATH: &str = "bastion_config.json";
const TRADE_EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Bastion Futures Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::var("BASTION_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut config)?;

    if let Err(problems) = config.validate() {
        for p in &problems {
            error!(problem = %p, "invalid configuration");
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }

    info!(
        environment = %config.environment,
        symbols = ?config.symbols,
        leverage = config.leverage,
        "Configured trading pairs"
    );

    // ── 2. Exchange gateway ──────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
    let api_secret = std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is not set")?;
    let client = Arc::new(BinanceFuturesClient::new(
        api_key,
        api_secret,
        config.environment.rest_base_url(),
    )?);
    let gateway = Arc::new(ExchangeGateway::new(client, &config.gateway, &config.margin_asset));

    // ── 3. Shared state ──────────────────────────────────────────────────
    let status = Arc::new(EngineStatus::new());
    status.set_phase(BotPhase::Starting, "preparing symbols");

    let buffer = Arc::new(CandleBuffer::new(config.stream.candle_capacity));
    let ledger = Arc::new(ProtectionLedger::new());

    let (events, events_rx) = TradeEventSink::channel(TRADE_EVENT_CAPACITY);
    tokio::spawn(run_trade_event_logger(events_rx));

    let tracker = Arc::new(PositionTracker::new(
        gateway.clone(),
        Arc::new(TieredExitBook::new()),
        Arc::new(SlTighteningBook::new()),
        events.clone(),
        status.clone(),
    ));
    let protocol = Arc::new(OrderExecutionProtocol::new(
        gateway.clone(),
        tracker.clone(),
        ledger.clone(),
        events,
        status.clone(),
        config.execution.clone(),
        config.leverage,
    ));

    // ── 4. Per-symbol preparation ────────────────────────────────────────
    let mut active = Vec::new();
    for symbol in &config.symbols {
        match prepare_symbol(&gateway, &buffer, symbol, &config).await {
            Ok(_) => active.push(symbol.clone()),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "symbol preparation failed, dropping it");
                status.push_error(&e);
            }
        }
    }
    if active.is_empty() {
        status.set_phase(BotPhase::Error, "no symbol could be prepared");
        anyhow::bail!("no symbol could be prepared");
    }

    let stop = StopFlag::new();

    // ── 5. Decision feed (JSON lines on stdin) ───────────────────────────
    let signals = Arc::new(QueuedSignalSource::new());
    let active_set: HashSet<String> = active.iter().cloned().collect();
    tokio::spawn(run_decision_feed(
        BufReader::new(tokio::io::stdin()),
        signals.clone(),
        active_set,
        stop.clone(),
    ));

    // ── 6. Market data streams + traders ─────────────────────────────────
    let connector: Arc<dyn FeedConnector> = Arc::new(WsKlineConnector::new(
        config.environment.ws_base_url(),
        config.stream.interval.clone(),
    ));

    let mut stream_tasks = Vec::with_capacity(active.len());
    for symbol in &active {
        let trader = SymbolTrader::new(
            symbol,
            tracker.clone(),
            protocol.clone(),
            signals.clone(),
            buffer.clone(),
            status.clone(),
            &config,
        );
        let stream = KlineStream::new(
            symbol,
            config.stream.clone(),
            connector.clone(),
            buffer.clone(),
            status.clone(),
            stop.clone(),
        );
        let task_status = status.clone();
        let task_stop = stop.clone();
        stream_tasks.push(tokio::spawn(async move {
            if let Err(e) = stream.run(&trader).await {
                error!(symbol = %trader.symbol(), error = %e, "stream terminated");
                task_status.push_error(&e);
                if e.is_fatal() {
                    task_status.set_phase(BotPhase::Error, e.to_string());
                    task_stop.stop();
                }
            }
        }));
    }
    info!(count = active.len(), "Market data streams launched");

    // ── 7. Protection scanner ────────────────────────────────────────────
    let scanner = ProtectionScanner::new(
        gateway.clone(),
        tracker.clone(),
        ledger.clone(),
        status.clone(),
        &config.protection,
        &config.execution,
    );
    let scanner_stop = stop.clone();
    let scanner_task = tokio::spawn(async move { scanner.run(scanner_stop).await });

    // ── 8. Periodic status log ───────────────────────────────────────────
    let status_log = status.clone();
    let status_gateway = gateway.clone();
    let status_tracker = tracker.clone();
    let status_stop = stop.clone();
    let status_every = Duration::from_secs(config.status_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(status_every);
        loop {
            interval.tick().await;
            if status_stop.is_stopped() {
                break;
            }
            let snap = status_log.snapshot(status_gateway.rate_limits());
            let open_positions = status_tracker
                .open_positions(CacheMode::Cached)
                .await
                .map(|p| p.len())
                .ok();
            info!(
                phase = ?snap.phase,
                open_positions,
                entries = snap.successful_entries,
                failed_entries = snap.failed_entries,
                win_rate = snap.win_rate,
                realized_pnl = snap.realized_pnl,
                streams = ?snap.stream_states,
                weight_1m = snap.rate_limits.map(|r| r.used_weight_1m),
                weight_used = snap.rate_limits.map(|r| r.weight_utilisation()),
                "status"
            );
        }
    });

    status.set_phase(BotPhase::Running, format!("trading {} symbol(s)", active.len()));
    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            warn!("Shutdown signal received — stopping gracefully");
        }
        _ = wait_for_stop(&stop) => {
            error!("Engine stopped after a fatal stream failure");
        }
    }
    stop.stop();
    if status.phase() != BotPhase::Error {
        status.set_phase(BotPhase::Stopped, "shut down");
    }

    info!(tasks = stream_tasks.len(), "waiting for streams and in-flight executions");
    join_all_tasks(stream_tasks, "stream").await;
    join_all_tasks(vec![scanner_task], "protection scanner").await;

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Bastion shut down complete.");
    Ok(())
}

/// `BASTION_ENVIRONMENT` and `BASTION_SYMBOLS` override the config file.
fn apply_env_overrides(config: &mut RuntimeConfig) -> anyhow::Result<()> {
    if let Ok(env) = std::env::var("BASTION_ENVIRONMENT") {
        config.environment = Environment::parse(&env)
            .with_context(|| format!("BASTION_ENVIRONMENT={env} is not LIVE or TEST"))?;
    }
    if let Ok(syms) = std::env::var("BASTION_SYMBOLS") {
        let symbols: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !symbols.is_empty() {
            config.symbols = symbols;
        }
    }
    Ok(())
}

/// Await every task to completion.  No timeout: a protocol run in progress
/// must finish before main returns.
async fn join_all_tasks(tasks: Vec<JoinHandle<()>>, what: &str) {
    for task in tasks {
        if let Err(e) = task.await {
            warn!(task = what, error = %e, "task ended abnormally");
        }
    }
}

async fn wait_for_stop(stop: &StopFlag) {
    while !stop.is_stopped() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_slow_tasks() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = tokio::spawn(async move {
            // Entry settle plus several throttled protective calls.
            tokio::time::sleep(Duration::from_secs(40)).await;
            flag.store(true, Ordering::SeqCst);
        });

        join_all_tasks(vec![task], "stream").await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn env_symbols_override_config() {
        std::env::set_var("BASTION_SYMBOLS", " btcusdt, ,ethusdt ");
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config).unwrap();
        std::env::remove_var("BASTION_SYMBOLS");
        assert_eq!(config.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }
}
