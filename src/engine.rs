//! Engine — the central owner.
//!
//! Every subsystem is constructed here once and handed capability handles
//! (`Arc`s) to exactly the collaborators it consumes; nothing holds a
//! back-pointer. The engine also owns the task tree: balance sync, UDS
//! main/audit + keepalive, mirror sync, planning, TTL expiry, TWAP,
//! breaker/metrics tick, persistence, telemetry. Shutdown cancels in
//! reverse dependency order and flushes state to disk.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::awg::{ApiWeightGovernor, Channel, CircuitState};
use crate::breaker::RiskBreaker;
use crate::clock::Clock;
use crate::config::Config;
use crate::dle::ttl::{Expiry, TtlWheel};
use crate::dle::{LiquidityEngine, PlanContext};
use crate::exchange::Exchange;
use crate::hedge::DeltaBus;
use crate::ledger::EventLedger;
use crate::metrics::Metrics;
use crate::mirror::OrderMirror;
use crate::rebalancer::TwapRebalancer;
use crate::shadow::ShadowBalance;
use crate::telemetry::{self, TelemetryState};
use crate::types::{MarketView, SymbolRules};
use crate::uds::UserDataStream;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub struct Engine {
    pub cfg: Config,
    pub clock: Arc<Clock>,
    pub awg: Arc<ApiWeightGovernor>,
    pub ledger: Arc<EventLedger>,
    pub shadow: Arc<ShadowBalance>,
    pub mirror: Arc<OrderMirror>,
    pub dle: Arc<LiquidityEngine>,
    pub uds: Arc<UserDataStream>,
    pub twap: Arc<TwapRebalancer>,
    pub hedge: Arc<DeltaBus>,
    pub metrics: Arc<Metrics>,
    pub breaker: Arc<RiskBreaker>,
    pub exchange: Arc<dyn Exchange>,

    rules: Mutex<SymbolRules>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<Expiry>>>,
}

impl Engine {
    pub fn new(cfg: Config, exchange: Arc<dyn Exchange>, clock: Arc<Clock>) -> Arc<Self> {
        let base = cfg.exchange.base_asset.clone();
        let quote = cfg.exchange.quote_asset.clone();
        let symbol = cfg.exchange.symbol.clone();

        let metrics = Arc::new(Metrics::new());
        let awg = Arc::new(ApiWeightGovernor::new(&cfg.awg, clock.clone()));
        let ledger = Arc::new(EventLedger::new(&cfg.ssot, &base, &quote, clock.clone()));
        let shadow = Arc::new(ShadowBalance::new(
            &cfg.ssot,
            &base,
            &quote,
            ledger.clone(),
            clock.clone(),
        ));
        let mirror = Arc::new(OrderMirror::new(&cfg.mirror, clock.clone()));
        let breaker = Arc::new(RiskBreaker::new(cfg.breaker.clone(), clock.clone()));
        let hedge = Arc::new(DeltaBus::new(1_024));
        let (wheel, expired_rx) = TtlWheel::spawn();

        let dle = Arc::new(LiquidityEngine::new(
            cfg.dle.clone(),
            &symbol,
            &base,
            &quote,
            clock.clone(),
            awg.clone(),
            shadow.clone(),
            ledger.clone(),
            exchange.clone(),
            metrics.clone(),
            breaker.clone(),
            wheel,
        ));

        let uds = Arc::new(UserDataStream::new(
            cfg.uds.clone(),
            &symbol,
            &cfg.exchange.ws_url,
            clock.clone(),
            exchange.clone(),
            awg.clone(),
            shadow.clone(),
            mirror.clone(),
            dle.clone(),
            hedge.clone(),
            metrics.clone(),
        ));

        let twap = Arc::new(TwapRebalancer::new(
            cfg.twap.clone(),
            &cfg.dle,
            &base,
            &quote,
            clock.clone(),
            ledger.clone(),
            dle.clone(),
        ));

        Arc::new(Self {
            cfg,
            clock,
            awg,
            ledger,
            shadow,
            mirror,
            dle,
            uds,
            twap,
            hedge,
            metrics,
            breaker,
            exchange,
            rules: Mutex::new(SymbolRules {
                tick: dec!(0.00001),
                step: Decimal::ONE,
                min_notional: dec!(5),
            }),
            expired_rx: Mutex::new(None),
        })
        .init_expired(expired_rx)
    }

    fn init_expired(self: Arc<Self>, rx: mpsc::UnboundedReceiver<Expiry>) -> Arc<Self> {
        *self.expired_rx.lock().unwrap() = Some(rx);
        self
    }

    // ─────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────

    /// Restore persisted state, fetch symbol rules, spawn every loop.
    /// Returned handles are consumed by `shutdown`.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        // Cold start from disk, revalidated on the next snapshot sync.
        let ledger_path = PathBuf::from(&self.cfg.ssot.ledger_persist_path);
        if ledger_path.exists() {
            match self.ledger.load(&ledger_path) {
                Ok(n) => info!("[engine] ledger restored ({n} events)"),
                Err(e) => warn!("[engine] ledger restore failed: {e}"),
            }
        }
        if let Err(e) = self.mirror.load() {
            debug!("[engine] no mirror state restored: {e}");
        }

        if self.awg.acquire("exchangeInfo", Channel::System, None, Decimal::ZERO) {
            match self.exchange.get_exchange_info(&self.cfg.exchange.symbol).await {
                Ok(rules) => {
                    info!(
                        "[engine] symbol rules: tick={} step={} min_notional={}",
                        rules.tick, rules.step, rules.min_notional
                    );
                    *self.rules.lock().unwrap() = rules;
                }
                Err(e) => warn!("[engine] exchangeInfo failed, keeping defaults: {e}"),
            }
        }

        // First balance snapshot before anything trades.
        self.sync_balances_once().await;

        let mut handles = Vec::new();

        // UDS pair + keepalive.
        handles.push(tokio::spawn(self.uds.clone().run()));
        handles.push(tokio::spawn(self.uds.clone().run_keepalive()));

        // TTL expiry consumer.
        let expired_rx = self
            .expired_rx
            .lock()
            .unwrap()
            .take()
            .expect("engine started twice");
        handles.push(tokio::spawn(self.dle.clone().run_expiry_loop(expired_rx)));

        // Periodic loops.
        handles.push(tokio::spawn(self.clone().balance_sync_loop()));
        handles.push(tokio::spawn(self.clone().mirror_loop()));
        handles.push(tokio::spawn(self.clone().planning_loop()));
        handles.push(tokio::spawn(self.clone().supervision_loop()));
        handles.push(tokio::spawn(self.clone().persistence_loop()));

        // Telemetry server.
        let state = TelemetryState {
            metrics: self.metrics.clone(),
            awg: self.awg.clone(),
            ledger: self.ledger.clone(),
            shadow: self.shadow.clone(),
            mirror: self.mirror.clone(),
            uds: self.uds.clone(),
            breaker: self.breaker.clone(),
        };
        let addr = self.cfg.telemetry.addr.clone();
        handles.push(tokio::spawn(telemetry::serve(state, addr)));

        info!("[engine] all tasks spawned");
        handles
    }

    /// Cancel tasks in reverse dependency order, then flush state.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        info!("[engine] shutting down");
        for h in handles {
            h.abort();
            let _ = h.await;
        }
        self.uds.shutdown().await;
        if let Err(e) = self.ledger.save(&PathBuf::from(&self.cfg.ssot.ledger_persist_path)) {
            warn!("[engine] ledger flush failed: {e}");
        }
        if let Err(e) = self.mirror.save() {
            warn!("[engine] mirror flush failed: {e}");
        }
        info!("[engine] shutdown complete");
    }

    // ─────────────────────────────────────────────────
    // Loops
    // ─────────────────────────────────────────────────

    async fn sync_balances_once(&self) {
        if !self.awg.acquire("account", Channel::System, None, Decimal::ZERO) {
            debug!("[engine] account snapshot denied by governor");
            return;
        }
        match self.exchange.get_account().await {
            Ok(snapshot) => {
                let clean = self.shadow.sync_actual_balance(&snapshot.balances);
                debug!("[engine] balance sync clean={clean} | {}", self.ledger.summary());
            }
            Err(e) => {
                if let Some(code) = e.code() {
                    self.awg.track_api_error(code, "account");
                }
                warn!("[engine] account snapshot failed: {e}");
            }
        }
    }

    async fn balance_sync_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.ssot.sync_interval_sec);
        let audit_every = Duration::from_secs(self.cfg.ssot.audit_interval_sec);
        let mut next_audit = tokio::time::Instant::now() + audit_every;
        loop {
            tokio::time::sleep(interval.min(audit_every)).await;
            if tokio::time::Instant::now() >= next_audit {
                self.shadow.three_way_audit();
                next_audit += audit_every;
            } else {
                self.sync_balances_once().await;
            }
        }
    }

    async fn mirror_loop(self: Arc<Self>) {
        let interval = self.mirror.sync_interval();
        loop {
            tokio::time::sleep(interval).await;
            if !self.awg.acquire("openOrders", Channel::System, None, Decimal::ZERO) {
                debug!("[engine] mirror sync denied by governor");
                continue;
            }
            match self.exchange.get_open_orders(&self.cfg.exchange.symbol).await {
                Ok(remote) => {
                    let report = self.mirror.reconcile(&remote);
                    self.metrics.mirror_syncs.inc();
                    for (order_id, _price) in report.closed {
                        self.dle.close_and_release(&order_id, "mirror_removed").await;
                    }
                }
                Err(e) => {
                    if let Some(code) = e.code() {
                        self.awg.track_api_error(code, "openOrders");
                    }
                    warn!("[engine] mirror fetch failed: {e}");
                }
            }
        }
    }

    async fn planning_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.cfg.dle.plan_interval_ms);
        loop {
            tokio::time::sleep(interval).await;
            let Some(ctx) = self.build_plan_context().await else {
                continue;
            };
            self.dle.plan_cycle(&ctx).await;
            self.twap.tick(&ctx).await;
        }
    }

    async fn build_plan_context(&self) -> Option<PlanContext> {
        if !self.awg.acquire("bookTicker", Channel::System, None, Decimal::ZERO) {
            return None;
        }
        let book = match self
            .exchange
            .get_orderbook(&self.cfg.exchange.symbol, 1)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                if let Some(code) = e.code() {
                    self.awg.track_api_error(code, "bookTicker");
                }
                debug!("[engine] book fetch failed: {e}");
                return None;
            }
        };
        let mirror_age_sec = self
            .mirror
            .staleness()
            .map(|d| d.as_secs())
            .unwrap_or(u64::MAX);
        let uds_age_sec = self.uds.staleness_sec();
        Some(PlanContext {
            market: MarketView {
                bid: book.bid,
                ask: book.ask,
                ts: std::time::Instant::now(),
            },
            rules: *self.rules.lock().unwrap(),
            mirror_age_sec,
            uds_age_sec,
        })
    }

    /// Breaker evaluation plus the slow-moving gauges.
    async fn supervision_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.breaker.tick_interval_sec);
        loop {
            tokio::time::sleep(interval).await;
            self.breaker.evaluate(self.awg.errors_60s());

            let status = self.breaker.status();
            self.metrics.breaker_open.set(status.open as i64);
            self.metrics.drawdown_1h_pct.set(status.drawdown_1h_pct);
            self.metrics.awg_state.set(match self.awg.state() {
                CircuitState::Normal => 0,
                CircuitState::Throttled => 1,
                CircuitState::Degraded => 2,
                CircuitState::CircuitOpen => 3,
                CircuitState::Recovering => 4,
            });
            for asset in [&self.cfg.exchange.quote_asset, &self.cfg.exchange.base_asset] {
                self.metrics
                    .shadow_available
                    .with_label_values(&[asset])
                    .set(self.shadow.free_available(asset).to_f64().unwrap_or(0.0));
            }
        }
    }

    async fn persistence_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(30);
        let path = PathBuf::from(&self.cfg.ssot.ledger_persist_path);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.ledger.save(&path) {
                warn!("[engine] ledger persist failed: {e}");
            }
            if let Err(e) = self.mirror.save() {
                warn!("[engine] mirror persist failed: {e}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use std::time::Instant;

    fn test_config(tag: &str) -> Config {
        let tmp = std::env::temp_dir();
        let mut cfg = Config::default();
        cfg.ssot.sync_interval_sec = 1;
        cfg.ssot.audit_interval_sec = 2;
        cfg.dle.plan_interval_ms = 100;
        cfg.mirror.sync_interval_sec = 1;
        cfg.uds.keepalive_sec = 1;
        cfg.ssot.ledger_persist_path = tmp
            .join(format!("engine-ledger-{tag}-{}.json", std::process::id()))
            .to_string_lossy()
            .into_owned();
        cfg.mirror.persist_path = tmp
            .join(format!("engine-mirror-{tag}-{}.json", std::process::id()))
            .to_string_lossy()
            .into_owned();
        // Port 0 → the OS picks; telemetry must not collide across tests.
        cfg.telemetry.addr = "127.0.0.1:0".into();
        cfg
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_engine_reaches_ready_and_quotes() {
        let cfg = test_config("quote");
        let mock = Arc::new(MockExchange::new("DOGEUSDT", "DOGE", "USDT"));
        let engine = Engine::new(cfg, mock.clone(), Arc::new(Clock::system()));
        let handles = engine.start().await;

        // Three clean balance syncs finish cold start…
        let ledger = engine.ledger.clone();
        assert!(
            wait_until(|| ledger.ready_for_trading(), Duration::from_secs(10)).await,
            "ledger never became ready"
        );
        // …after which the warm-start ramp lets one order per side out.
        let mock2 = mock.clone();
        assert!(
            wait_until(|| mock2.open_order_count() >= 2, Duration::from_secs(10)).await,
            "no quotes reached the venue"
        );

        engine.shutdown(handles).await;
        let _ = std::fs::remove_file(&engine.cfg.ssot.ledger_persist_path);
        let _ = std::fs::remove_file(&engine.cfg.mirror.persist_path);
    }

    #[tokio::test]
    async fn test_engine_fill_flows_to_ledger_and_hedge() {
        let cfg = test_config("fill");
        let mock = Arc::new(MockExchange::new("DOGEUSDT", "DOGE", "USDT"));
        let engine = Engine::new(cfg, mock.clone(), Arc::new(Clock::system()));
        let mut hedge_rx = engine.hedge.subscribe();
        let handles = engine.start().await;

        let ledger = engine.ledger.clone();
        assert!(wait_until(|| ledger.ready_for_trading(), Duration::from_secs(10)).await);
        let mock2 = mock.clone();
        assert!(wait_until(|| mock2.open_order_count() >= 1, Duration::from_secs(10)).await);

        // Fill whatever is resting; the user stream must carry it through.
        let open = mock.get_open_orders("DOGEUSDT").await.unwrap();
        let victim = open[0].order_id.clone();
        mock.fill_order(&victim, open[0].orig_qty, 1_000);

        let fill = tokio::time::timeout(Duration::from_secs(5), hedge_rx.recv())
            .await
            .expect("hedge fill timed out")
            .unwrap();
        assert_eq!(fill.qty, open[0].orig_qty);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut closed = false;
        while Instant::now() < deadline {
            if engine.dle.live_order(&victim).await.is_none() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(closed, "filled order never closed locally");

        engine.shutdown(handles).await;
        let _ = std::fs::remove_file(&engine.cfg.ssot.ledger_persist_path);
        let _ = std::fs::remove_file(&engine.cfg.mirror.persist_path);
    }

    #[tokio::test]
    async fn test_engine_shutdown_flushes_state() {
        let cfg = test_config("flush");
        let ledger_path = cfg.ssot.ledger_persist_path.clone();
        let mock = Arc::new(MockExchange::new("DOGEUSDT", "DOGE", "USDT"));
        let engine = Engine::new(cfg, mock, Arc::new(Clock::system()));
        let handles = engine.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.shutdown(handles).await;
        assert!(std::path::Path::new(&ledger_path).exists());
        let _ = std::fs::remove_file(&ledger_path);
        let _ = std::fs::remove_file(&engine.cfg.mirror.persist_path);
    }
}
