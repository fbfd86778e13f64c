//! User Data Stream ingester — dual-WS main/audit pair on one listen key.
//!
//! The main connection applies effects: execution reports flow into Shadow,
//! the Mirror, DLE live state, and the hedge bus. The audit connection only
//! folds the same event tuples into a rolling hash; a sustained hash split
//! or timestamp gap between the two is treated as lost events and triggers
//! exactly one REST seed of the open-order set, suppressed for a window so
//! a flapping audit cannot burn openOrders weight.
//!
//! Idempotency: every applied event is remembered by
//! `(order_id, event_time, trade_id)` for five minutes; replays after a
//! reconnect are dropped before they reach any consumer.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::awg::{ApiWeightGovernor, Channel};
use crate::clock::Clock;
use crate::config::UdsConfig;
use crate::dle::LiquidityEngine;
use crate::exchange::Exchange;
use crate::hedge::DeltaBus;
use crate::metrics::Metrics;
use crate::mirror::OrderMirror;
use crate::shadow::ShadowBalance;
use crate::types::{ExecutionReport, OrderStatus, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRole {
    Main,
    Audit,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UdsHealth {
    pub connected: bool,
    pub reconnects: u64,
    pub last_msg_age_main_sec: Option<u64>,
    pub last_msg_age_audit_sec: Option<u64>,
    pub hash_match: bool,
    pub events_applied: u64,
    pub seeds: u64,
}

#[derive(Debug)]
struct UdsState {
    listen_key: Option<String>,
    connected: bool,
    last_msg_main: Option<Instant>,
    last_msg_audit: Option<Instant>,
    main_hash: u64,
    audit_hash: u64,
    diverged_at: Option<Instant>,
    seed_suppress_until: Option<Instant>,
    reconnects: u64,
    events_applied: u64,
    seeds: u64,
    /// (order_id, event_time, trade_id) → first-seen instant.
    processed: HashMap<(String, u64, i64), Instant>,
    last_cache_sweep: Instant,
}

pub struct UserDataStream {
    cfg: UdsConfig,
    symbol: String,
    clock: Arc<Clock>,
    exchange: Arc<dyn Exchange>,
    awg: Arc<ApiWeightGovernor>,
    shadow: Arc<ShadowBalance>,
    mirror: Arc<OrderMirror>,
    dle: Arc<LiquidityEngine>,
    hedge: Arc<DeltaBus>,
    metrics: Arc<Metrics>,
    ws_base_url: String,
    state: Mutex<UdsState>,
    seeding: AtomicBool,
    reconnect_notify: Notify,
}

impl UserDataStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: UdsConfig,
        symbol: &str,
        ws_base_url: &str,
        clock: Arc<Clock>,
        exchange: Arc<dyn Exchange>,
        awg: Arc<ApiWeightGovernor>,
        shadow: Arc<ShadowBalance>,
        mirror: Arc<OrderMirror>,
        dle: Arc<LiquidityEngine>,
        hedge: Arc<DeltaBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let now = clock.now();
        Self {
            cfg,
            symbol: symbol.to_string(),
            clock,
            exchange,
            awg,
            shadow,
            mirror,
            dle,
            hedge,
            metrics,
            ws_base_url: ws_base_url.to_string(),
            state: Mutex::new(UdsState {
                listen_key: None,
                connected: false,
                last_msg_main: None,
                last_msg_audit: None,
                main_hash: 0,
                audit_hash: 0,
                diverged_at: None,
                seed_suppress_until: None,
                reconnects: 0,
                events_applied: 0,
                seeds: 0,
                processed: HashMap::new(),
                last_cache_sweep: now,
            }),
            seeding: AtomicBool::new(false),
            reconnect_notify: Notify::new(),
        }
    }

    // ─────────────────────────────────────────────────
    // Run loops
    // ─────────────────────────────────────────────────

    /// Connect-and-listen loop: create the listen key, open the main/audit
    /// pair, seed once, then pump both until either side drops. Reconnects
    /// with exponential backoff, one attempt in flight at a time.
    pub async fn run(self: Arc<Self>) {
        let mut backoff_ms = self.cfg.reconnect_base_ms;
        loop {
            match self.connect_and_listen().await {
                Ok(()) => {
                    info!("[uds] session ended, reconnecting");
                    backoff_ms = self.cfg.reconnect_base_ms;
                }
                Err(e) => {
                    warn!("[uds] session error: {e}");
                    backoff_ms = (backoff_ms * 2).min(self.cfg.reconnect_max_ms);
                }
            }
            {
                let mut g = self.state.lock().unwrap();
                g.connected = false;
                g.reconnects += 1;
            }
            self.metrics.ws_reconnects.inc();
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    async fn connect_and_listen(&self) -> anyhow::Result<()> {
        let listen_key = self.ensure_listen_key().await?;
        let url = format!("{}/{}", self.ws_base_url, listen_key);

        let mut main = self
            .exchange
            .open_ws(&url)
            .await
            .map_err(|e| anyhow::anyhow!("main ws: {e}"))?;
        let mut audit = self
            .exchange
            .open_ws(&url)
            .await
            .map_err(|e| anyhow::anyhow!("audit ws: {e}"))?;
        info!("[uds] main+audit connected");
        self.state.lock().unwrap().connected = true;

        // One snapshot after every (re)connect: the stream has no replay.
        self.seed_once("connect").await;

        loop {
            tokio::select! {
                ev = main.events.recv() => {
                    match ev {
                        Some(ev) => self.handle_event(&ev, WsRole::Main).await,
                        None => anyhow::bail!("main ws closed"),
                    }
                }
                ev = audit.events.recv() => {
                    match ev {
                        Some(ev) => self.handle_event(&ev, WsRole::Audit).await,
                        None => anyhow::bail!("audit ws closed"),
                    }
                }
                _ = self.reconnect_notify.notified() => {
                    anyhow::bail!("listen key refresh requested reconnect");
                }
            }
        }
    }

    async fn ensure_listen_key(&self) -> anyhow::Result<String> {
        if let Some(k) = self.state.lock().unwrap().listen_key.clone() {
            return Ok(k);
        }
        if !self
            .awg
            .acquire("userDataStream.create", Channel::UserDataStream, None, Decimal::ZERO)
        {
            anyhow::bail!("listen key creation denied by governor");
        }
        let key = self
            .exchange
            .create_listen_key()
            .await
            .map_err(|e| anyhow::anyhow!("create listen key: {e}"))?;
        info!("[uds] listen key created: {}…", &key[..8.min(key.len())]);
        self.state.lock().unwrap().listen_key = Some(key.clone());
        Ok(key)
    }

    /// Keepalive task: refresh at half the server TTL; a failed refresh
    /// drops the key and kicks the run loop into a reconnect.
    pub async fn run_keepalive(self: Arc<Self>) {
        let interval = Duration::from_secs((self.cfg.keepalive_sec / 2).max(1));
        loop {
            tokio::time::sleep(interval).await;
            let key = match self.state.lock().unwrap().listen_key.clone() {
                Some(k) => k,
                None => continue,
            };
            if !self
                .awg
                .acquire("userDataStream.keepalive", Channel::UserDataStream, None, Decimal::ZERO)
            {
                warn!("[uds] keepalive denied by governor");
                continue;
            }
            match self.exchange.keepalive_listen_key(&key).await {
                Ok(()) => debug!("[uds] keepalive ok"),
                Err(e) => {
                    warn!("[uds] keepalive failed ({e}), recreating listen key");
                    self.state.lock().unwrap().listen_key = None;
                    self.reconnect_notify.notify_one();
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(key) = self.state.lock().unwrap().listen_key.clone() {
            if self
                .awg
                .acquire("userDataStream.close", Channel::UserDataStream, None, Decimal::ZERO)
            {
                let _ = self.exchange.close_listen_key(&key).await;
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Event handling
    // ─────────────────────────────────────────────────

    pub async fn handle_event(&self, ev: &Value, role: WsRole) {
        let now = self.clock.now();
        {
            let mut g = self.state.lock().unwrap();
            match role {
                WsRole::Main => g.last_msg_main = Some(now),
                WsRole::Audit => g.last_msg_audit = Some(now),
            }
        }

        match ev.get("e").and_then(|v| v.as_str()) {
            Some("executionReport") => self.handle_execution_report(ev, role).await,
            Some("outboundAccountPosition") => self.handle_account_position(ev, role),
            Some("balanceUpdate") => {
                debug!(
                    "[uds] balanceUpdate {} delta={}",
                    ev.get("a").and_then(|v| v.as_str()).unwrap_or("?"),
                    ev.get("d").and_then(|v| v.as_str()).unwrap_or("?")
                );
            }
            other => debug!("[uds] ignoring event type {other:?}"),
        }
    }

    async fn handle_execution_report(&self, ev: &Value, role: WsRole) {
        let report = match normalize_execution_report(ev) {
            Some(r) => r,
            None => {
                warn!("[uds] unparseable executionReport: {ev}");
                return;
            }
        };

        let tuple = (
            report.order_id.clone(),
            report.status.as_str(),
            report.ts_ms,
            report.trade_id,
        );

        if role == WsRole::Audit {
            {
                let mut g = self.state.lock().unwrap();
                g.audit_hash = bump_hash(g.audit_hash, &tuple);
            }
            self.audit_check().await;
            return;
        }

        // Main path: idempotency first.
        {
            let now = self.clock.now();
            let mut g = self.state.lock().unwrap();
            let key = (report.order_id.clone(), report.ts_ms, report.trade_id);
            Self::sweep_event_cache(&mut g, now, self.cfg.event_cache_ttl_sec);
            if g.processed.contains_key(&key) {
                debug!("[uds] duplicate event dropped: {key:?}");
                return;
            }
            g.processed.insert(key, now);
            g.main_hash = bump_hash(g.main_hash, &tuple);
            g.events_applied += 1;
        }

        debug!(
            "[uds] executionReport id={} status={} cum={}",
            report.order_id,
            report.status.as_str(),
            report.cum_qty
        );

        // Balances first (delta-driven, self-deduplicating), then order state.
        self.shadow.on_execution_report(&report);

        match report.status {
            OrderStatus::New => {
                self.mirror.upsert_from_event(&report);
                self.dle
                    .register_order_from_uds(
                        &report.order_id,
                        &report.client_order_id,
                        report.side,
                        report.price,
                        report.orig_qty,
                    )
                    .await;
            }
            OrderStatus::PartiallyFilled => {
                self.mirror.upsert_from_event(&report);
                self.dle
                    .update_filled_from_uds(&report.order_id, report.cum_qty)
                    .await;
            }
            OrderStatus::Filled
            | OrderStatus::Canceled
            | OrderStatus::Expired
            | OrderStatus::Rejected => {
                self.mirror.close_from_event(&report.order_id);
                self.dle
                    .close_and_release(&report.order_id, report.status.as_str())
                    .await;
                if report.status == OrderStatus::Filled {
                    self.metrics.orders_filled.inc();
                }
            }
        }

        // Spot fill delta onto the hedge bus.
        if report.last_qty > Decimal::ZERO {
            self.hedge.publish_spot_fill(
                report.side,
                report.last_qty,
                report.last_price,
                report.ts_ms,
            );
        }
    }

    fn handle_account_position(&self, ev: &Value, role: WsRole) {
        let tuple = (
            "outboundAccountPosition".to_string(),
            "",
            ev.get("E").and_then(|v| v.as_u64()).unwrap_or(0),
            0i64,
        );
        let mut g = self.state.lock().unwrap();
        match role {
            WsRole::Audit => {
                g.audit_hash = bump_hash(g.audit_hash, &tuple);
                return;
            }
            WsRole::Main => {
                g.main_hash = bump_hash(g.main_hash, &tuple);
            }
        }
        drop(g);

        let mut snapshot = HashMap::new();
        if let Some(balances) = ev.get("B").and_then(|b| b.as_array()) {
            for b in balances {
                let asset = b.get("a").and_then(|v| v.as_str()).unwrap_or_default();
                if asset.is_empty() {
                    continue;
                }
                let free = dec_str(b, "f");
                let locked = dec_str(b, "l");
                snapshot.insert(asset.to_string(), (free, locked));
            }
        }
        if !snapshot.is_empty() {
            self.shadow.sync_actual_balance(&snapshot);
        }
    }

    fn sweep_event_cache(g: &mut UdsState, now: Instant, ttl_sec: u64) {
        if now.duration_since(g.last_cache_sweep) < Duration::from_secs(60) {
            return;
        }
        g.last_cache_sweep = now;
        let ttl = Duration::from_secs(ttl_sec);
        g.processed.retain(|_, seen| now.duration_since(*seen) < ttl);
    }

    // ─────────────────────────────────────────────────
    // Audit / seed
    // ─────────────────────────────────────────────────

    async fn audit_check(&self) {
        let now = self.clock.now();
        let trigger = {
            let mut g = self.state.lock().unwrap();

            let age_gap = match (g.last_msg_main, g.last_msg_audit) {
                (Some(m), Some(a)) => {
                    if m > a {
                        m.duration_since(a)
                    } else {
                        a.duration_since(m)
                    }
                }
                _ => Duration::ZERO,
            };
            if age_gap > Duration::from_secs(3) {
                Some("audit_age_gap")
            } else if g.main_hash != g.audit_hash {
                match g.diverged_at {
                    None => {
                        g.diverged_at = Some(now);
                        None
                    }
                    Some(since) if now.duration_since(since) > Duration::from_secs(1) => {
                        Some("audit_hash_diverged")
                    }
                    Some(_) => None,
                }
            } else {
                g.diverged_at = None;
                None
            }
        };

        if let Some(reason) = trigger {
            self.maybe_seed(reason).await;
        }
    }

    /// Seed, unless a recent seed already ran (suppression window).
    async fn maybe_seed(&self, reason: &str) {
        let now = self.clock.now();
        {
            let mut g = self.state.lock().unwrap();
            if let Some(until) = g.seed_suppress_until {
                if now < until {
                    debug!("[uds] seed suppressed ({reason})");
                    return;
                }
            }
            g.seed_suppress_until =
                Some(now + Duration::from_secs(self.cfg.audit_seed_suppress_sec));
        }
        self.seed_once(reason).await;
    }

    /// One REST snapshot of open orders re-applied to the mirror and DLE.
    /// Singleflighted: a seed already in flight absorbs this request.
    pub async fn seed_once(&self, reason: &str) {
        if self
            .seeding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[uds] seed already in flight ({reason})");
            return;
        }

        warn!("[uds] seeding openOrders: {reason}");
        let result = async {
            if !self
                .awg
                .acquire("openOrders", Channel::UserDataStream, None, Decimal::ZERO)
            {
                warn!("[uds] seed denied by governor");
                return Ok::<bool, crate::exchange::ExchangeError>(false);
            }
            let orders = self.exchange.get_open_orders(&self.symbol).await?;
            for o in &orders {
                self.mirror.upsert_from_rest(o);
                self.dle
                    .register_order_from_uds(
                        &o.order_id,
                        &o.client_order_id,
                        o.side,
                        o.price,
                        o.orig_qty,
                    )
                    .await;
                self.dle
                    .update_filled_from_uds(&o.order_id, o.executed_qty)
                    .await;
            }
            info!("[uds] seeded {} open order(s)", orders.len());
            Ok(true)
        }
        .await;

        self.seeding.store(false, Ordering::Release);
        match result {
            Ok(true) => {
                self.metrics.uds_seeds.inc();
                let mut g = self.state.lock().unwrap();
                g.seeds += 1;
                // Both sides restart from a common point after a seed.
                g.main_hash = 0;
                g.audit_hash = 0;
                g.diverged_at = None;
            }
            Ok(false) => {}
            Err(e) => warn!("[uds] seed failed: {e}"),
        }
    }

    // ─────────────────────────────────────────────────
    // Health
    // ─────────────────────────────────────────────────

    pub fn health(&self) -> UdsHealth {
        let now = self.clock.now();
        let g = self.state.lock().unwrap();
        UdsHealth {
            connected: g.connected,
            reconnects: g.reconnects,
            last_msg_age_main_sec: g.last_msg_main.map(|t| now.duration_since(t).as_secs()),
            last_msg_age_audit_sec: g.last_msg_audit.map(|t| now.duration_since(t).as_secs()),
            hash_match: g.main_hash == g.audit_hash,
            events_applied: g.events_applied,
            seeds: g.seeds,
        }
    }

    /// Seconds since the last applied main-stream message; saturates high
    /// when nothing arrived yet.
    pub fn staleness_sec(&self) -> u64 {
        let now = self.clock.now();
        let g = self.state.lock().unwrap();
        g.last_msg_main
            .map(|t| now.duration_since(t).as_secs())
            .unwrap_or(u64::MAX)
    }
}

// ─────────────────────────────────────────────────────────
// Normalization
// ─────────────────────────────────────────────────────────

fn dec_str(v: &Value, field: &str) -> Decimal {
    v.get(field)
        .and_then(|x| x.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn bump_hash<T: Hash>(h: u64, tuple: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tuple.hash(&mut hasher);
    h.wrapping_mul(1315423911).wrapping_add(hasher.finish())
}

/// Decode the venue's single-letter executionReport payload.
pub fn normalize_execution_report(ev: &Value) -> Option<ExecutionReport> {
    let order_id = ev.get("i").map(|v| v.to_string().trim_matches('"').to_string())?;
    let side = Side::from_str_loose(ev.get("S")?.as_str()?)?;
    let status = OrderStatus::from_exchange(ev.get("X")?.as_str()?)?;
    // Cancels carry the original client id in "C"; "c" then names the
    // cancel request itself.
    let client_order_id = ev
        .get("C")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| ev.get("c").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string();
    Some(ExecutionReport {
        order_id,
        client_order_id,
        update_id: ev
            .get("I")
            .and_then(|v| v.as_u64())
            .or_else(|| ev.get("E").and_then(|v| v.as_u64()))
            .unwrap_or(0),
        side,
        status,
        price: dec_str(ev, "p"),
        orig_qty: dec_str(ev, "q"),
        cum_qty: dec_str(ev, "z"),
        cum_quote: dec_str(ev, "Z"),
        last_qty: dec_str(ev, "l"),
        last_price: dec_str(ev, "L"),
        fee: {
            let f = dec_str(ev, "n");
            if f > Decimal::ZERO {
                Some(f)
            } else {
                None
            }
        },
        fee_asset: ev
            .get("N")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        trade_id: ev.get("t").and_then(|v| v.as_i64()).unwrap_or(-1),
        ts_ms: ev.get("E").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awg::ApiWeightGovernor;
    use crate::breaker::RiskBreaker;
    use crate::config::{AwgConfig, BreakerConfig, DleConfig, MirrorConfig, SsotConfig};
    use crate::dle::ttl::TtlWheel;
    use crate::exchange::mock::MockExchange;
    use crate::ledger::EventLedger;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Rig {
        clock: Arc<Clock>,
        mock: Arc<MockExchange>,
        shadow: Arc<ShadowBalance>,
        ledger: Arc<EventLedger>,
        mirror: Arc<OrderMirror>,
        dle: Arc<LiquidityEngine>,
        hedge: Arc<DeltaBus>,
        uds: Arc<UserDataStream>,
    }

    fn rig() -> Rig {
        let clock = Arc::new(Clock::manual());
        let ssot = SsotConfig::default();
        let awg = Arc::new(ApiWeightGovernor::new(&AwgConfig::default(), clock.clone()));
        let ledger = Arc::new(EventLedger::new(&ssot, "DOGE", "USDT", clock.clone()));
        let shadow = Arc::new(ShadowBalance::new(
            &ssot,
            "DOGE",
            "USDT",
            ledger.clone(),
            clock.clone(),
        ));
        let mirror = Arc::new(OrderMirror::new(&MirrorConfig::default(), clock.clone()));
        let mock = Arc::new(MockExchange::new("DOGEUSDT", "DOGE", "USDT"));
        let metrics = Arc::new(Metrics::new());
        let breaker = Arc::new(RiskBreaker::new(BreakerConfig::default(), clock.clone()));
        let hedge = Arc::new(DeltaBus::new(64));
        let (wheel, _expired_rx) = TtlWheel::spawn();

        let snap = std::collections::HashMap::from([
            ("USDT".to_string(), (dec!(300), Decimal::ZERO)),
            ("DOGE".to_string(), (dec!(1200), Decimal::ZERO)),
        ]);
        shadow.sync_actual_balance(&snap);
        for _ in 0..3 {
            shadow.sync_actual_balance(&snap);
        }

        let dle = Arc::new(LiquidityEngine::new(
            DleConfig::default(),
            "DOGEUSDT",
            "DOGE",
            "USDT",
            clock.clone(),
            awg.clone(),
            shadow.clone(),
            ledger.clone(),
            mock.clone(),
            metrics.clone(),
            breaker,
            wheel,
        ));
        let uds = Arc::new(UserDataStream::new(
            UdsConfig::default(),
            "DOGEUSDT",
            "wss://mock/ws",
            clock.clone(),
            mock.clone(),
            awg,
            shadow.clone(),
            mirror.clone(),
            dle.clone(),
            hedge.clone(),
            metrics,
        ));

        Rig {
            clock,
            mock,
            shadow,
            ledger,
            mirror,
            dle,
            hedge,
            uds,
        }
    }

    fn exec_report(
        order_id: u64,
        status: &str,
        side: &str,
        cum: &str,
        cum_quote: &str,
        last: &str,
        ts: u64,
        update_id: u64,
    ) -> Value {
        json!({
            "e": "executionReport",
            "E": ts,
            "s": "DOGEUSDT",
            "c": format!("cid-{order_id}"),
            "S": side,
            "x": "TRADE",
            "X": status,
            "i": order_id,
            "p": "0.24000",
            "q": "100",
            "z": cum,
            "Z": cum_quote,
            "l": last,
            "L": "0.24000",
            "t": update_id as i64,
            "I": update_id,
        })
    }

    #[test]
    fn test_normalize_execution_report() {
        let ev = exec_report(777, "PARTIALLY_FILLED", "BUY", "40", "9.6", "40", 1_000, 3);
        let r = normalize_execution_report(&ev).unwrap();
        assert_eq!(r.order_id, "777");
        assert_eq!(r.side, Side::Buy);
        assert_eq!(r.status, OrderStatus::PartiallyFilled);
        assert_eq!(r.cum_qty, dec!(40));
        assert_eq!(r.cum_quote, dec!(9.6));
        assert_eq!(r.update_id, 3);
    }

    #[tokio::test]
    async fn test_main_event_updates_ledger_and_hedge() {
        let rig = rig();
        let mut hedge_rx = rig.hedge.subscribe();

        let ev = exec_report(1, "PARTIALLY_FILLED", "BUY", "40", "9.6", "40", 1_000, 1);
        rig.uds.handle_event(&ev, WsRole::Main).await;

        // Ledger saw the 40-unit buy delta.
        assert_eq!(rig.ledger.balance("DOGE").free, dec!(1240));
        // Mirror tracks the order.
        assert!(rig.mirror.order("1").is_some());
        // Hedge bus got the fill.
        let fill = hedge_rx.recv().await.unwrap();
        assert_eq!(fill.qty, dec!(40));
    }

    #[tokio::test]
    async fn test_duplicate_event_dropped_by_idempotency_set() {
        let rig = rig();
        let ev = exec_report(2, "PARTIALLY_FILLED", "BUY", "40", "9.6", "40", 2_000, 1);
        rig.uds.handle_event(&ev, WsRole::Main).await;
        rig.uds.handle_event(&ev, WsRole::Main).await;
        assert_eq!(rig.ledger.balance("DOGE").free, dec!(1240));
        assert_eq!(rig.uds.health().events_applied, 1);
    }

    #[tokio::test]
    async fn test_terminal_event_closes_everywhere() {
        let rig = rig();
        let new_ev = exec_report(3, "NEW", "SELL", "0", "0", "0", 3_000, 1);
        rig.uds.handle_event(&new_ev, WsRole::Main).await;
        assert!(rig.dle.live_order("3").await.is_some());
        assert!(rig.mirror.order("3").is_some());

        let done = exec_report(3, "CANCELED", "SELL", "0", "0", "0", 3_500, 2);
        rig.uds.handle_event(&done, WsRole::Main).await;
        assert!(rig.dle.live_order("3").await.is_none());
        assert!(rig.mirror.order("3").is_none());
    }

    #[tokio::test]
    async fn test_account_position_syncs_shadow() {
        let rig = rig();
        let ev = json!({
            "e": "outboundAccountPosition",
            "E": 5_000,
            "B": [
                {"a": "USDT", "f": "250.00000000", "l": "50.00000000"},
                {"a": "DOGE", "f": "1100", "l": "100"},
            ]
        });
        rig.uds.handle_event(&ev, WsRole::Main).await;
        // Totals still match the ledger, so the sync is clean; the new
        // free/locked split lands on the audit baseline and the next audit
        // repairs the ledger's stale breakdown.
        rig.shadow.three_way_audit();
        assert_eq!(rig.shadow.free_available("USDT"), dec!(250));
        assert_eq!(rig.ledger.balance("USDT").locked, dec!(50));
    }

    #[tokio::test]
    async fn test_divergence_triggers_exactly_one_seed() {
        let rig = rig();

        // Main sees an event the audit stream never gets.
        let ev = exec_report(10, "NEW", "BUY", "0", "0", "0", 10_000, 1);
        rig.uds.handle_event(&ev, WsRole::Main).await;

        // Audit stream sees a different event → hashes split.
        let other = exec_report(11, "NEW", "BUY", "0", "0", "0", 10_001, 1);
        rig.uds.handle_event(&other, WsRole::Audit).await;
        let calls_before = rig.mock.open_orders_calls();

        // Divergence must persist over a second before seeding.
        rig.clock.advance(Duration::from_millis(1_500));
        rig.uds.handle_event(&other, WsRole::Audit).await;
        assert_eq!(rig.mock.open_orders_calls(), calls_before + 1);
        assert_eq!(rig.uds.health().seeds, 1);

        // Further triggers inside the suppression window change nothing.
        rig.uds.handle_event(&ev, WsRole::Main).await;
        rig.clock.advance(Duration::from_millis(1_500));
        rig.uds.handle_event(&other, WsRole::Audit).await;
        assert_eq!(rig.mock.open_orders_calls(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_seed_applies_snapshot_to_mirror_and_dle() {
        let rig = rig();
        // A resting order on the venue the locals know nothing about.
        let ack = rig
            .mock
            .create_order(&crate::exchange::NewOrderRequest {
                symbol: "DOGEUSDT".into(),
                side: Side::Buy,
                order_type: "LIMIT_MAKER".into(),
                qty: dec!(100),
                price: dec!(0.23990),
                client_order_id: "ghost".into(),
                time_in_force: None,
            })
            .await
            .unwrap();

        rig.uds.seed_once("test").await;
        assert!(rig.mirror.order(&ack.order_id).is_some());
        assert!(rig.dle.live_order(&ack.order_id).await.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        let rig = rig();
        let uds = rig.uds.clone();
        let task = tokio::spawn(uds.run());

        // Both the main and audit sockets come up, plus the connect seed.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rig.mock.ws_subscriber_count() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rig.mock.ws_subscriber_count(), 2);
        assert!(rig.mock.open_orders_calls() >= 1);
        assert!(rig.uds.health().connected);

        // Server-side drop: both channels close, the loop backs off and
        // reconnects with a fresh pair.
        rig.mock.close_ws_connections();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rig.mock.ws_subscriber_count() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rig.mock.ws_subscriber_count(), 2);
        assert!(rig.uds.health().reconnects >= 1);

        task.abort();
    }

    #[tokio::test]
    async fn test_matched_hashes_do_not_seed() {
        let rig = rig();
        let ev = exec_report(20, "NEW", "BUY", "0", "0", "0", 20_000, 1);
        rig.uds.handle_event(&ev, WsRole::Main).await;
        rig.uds.handle_event(&ev, WsRole::Audit).await;
        rig.clock.advance(Duration::from_secs(2));
        rig.uds.handle_event(&ev, WsRole::Audit).await;
        assert_eq!(rig.uds.health().seeds, 0);
    }
}
