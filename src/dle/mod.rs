//! Dynamic Liquidity Engine — plan, reserve, place, expire, close.
//!
//! One planning cycle turns the current market and inventory target into a
//! batch of post-only orders, then walks the batch in layer priority:
//! reserve funding in Shadow, ask AWG for admission, submit, register the
//! live order and arm its TTL. Every local termination path funnels through
//! `close_and_release`, which is the only legal way to retire an order:
//! timer off, live map out, reservation back, price-level count down.

pub mod plan;
pub mod ttl;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::awg::{ApiWeightGovernor, Channel, CircuitState};
use crate::breaker::RiskBreaker;
use crate::clock::Clock;
use crate::config::DleConfig;
use crate::exchange::{Exchange, ExchangeError, NewOrderRequest, RejectKind};
use crate::ledger::{EventKind, EventLedger, OrderEvent};
use crate::metrics::Metrics;
use crate::shadow::ShadowBalance;
use crate::types::{price_key, Layer, MarketView, Side, SymbolRules};

use self::plan::{AdaptiveFactors, OrderPlan, PlanInputs, RiskSignals};
use self::ttl::{Expiry, TtlWheel};

/// Locally-live order state, keyed by exchange order id.
#[derive(Debug, Clone)]
pub struct LiveOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub filled_qty: Decimal,
    pub layer: Layer,
    pub reserve_asset: String,
    pub rebalance: bool,
    pub created: Instant,
}

impl LiveOrder {
    pub fn remaining(&self) -> Decimal {
        (self.orig_qty - self.filled_qty).max(Decimal::ZERO)
    }
}

/// Everything a planning cycle needs from the outside world. The engine
/// owner assembles this so the DLE holds no references to mirror or UDS.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext {
    pub market: MarketView,
    pub rules: SymbolRules,
    pub mirror_age_sec: u64,
    pub uds_age_sec: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub planned: usize,
    pub placed: usize,
    pub skipped: Option<&'static str>,
    pub rejected_shadow: usize,
    pub rejected_awg: usize,
    pub rejected_exchange: usize,
}

#[derive(Debug, Default)]
struct DleStats {
    cycles: u64,
    stress_entries: u64,
}

#[derive(Debug)]
struct AdaptiveState {
    stress: bool,
}

/// Orders untouched for this long are presumed leaked and closed locally;
/// matches the reservation TTL so the two clean up together.
const STALE_ORDER_MAX: Duration = Duration::from_secs(300);

/// L0 orders this many ticks off the current guarded top rung get repriced
/// in place via cancelReplace instead of waiting out their TTL.
const REPRICE_DRIFT_TICKS: u32 = 5;

pub struct LiquidityEngine {
    cfg: DleConfig,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    clock: Arc<Clock>,
    awg: Arc<ApiWeightGovernor>,
    shadow: Arc<ShadowBalance>,
    ledger: Arc<EventLedger>,
    exchange: Arc<dyn Exchange>,
    metrics: Arc<Metrics>,
    breaker: Arc<RiskBreaker>,
    wheel: TtlWheel,

    live: tokio::sync::Mutex<HashMap<String, LiveOrder>>,
    /// Client ids of submissions whose ack hasn't registered yet; a stream
    /// NEW racing the REST response must not double-register.
    pending_submits: Mutex<std::collections::HashSet<String>>,
    price_levels: Mutex<HashMap<String, u32>>,
    adaptive: Mutex<AdaptiveState>,
    /// Rolling window of recent placement decisions, true = maker reject.
    recent_maker_rejects: Mutex<VecDeque<bool>>,
    started_at: Mutex<Instant>,
    stats: Mutex<DleStats>,
}

#[allow(clippy::too_many_arguments)]
impl LiquidityEngine {
    pub fn new(
        cfg: DleConfig,
        symbol: &str,
        base_asset: &str,
        quote_asset: &str,
        clock: Arc<Clock>,
        awg: Arc<ApiWeightGovernor>,
        shadow: Arc<ShadowBalance>,
        ledger: Arc<EventLedger>,
        exchange: Arc<dyn Exchange>,
        metrics: Arc<Metrics>,
        breaker: Arc<RiskBreaker>,
        wheel: TtlWheel,
    ) -> Self {
        let now = clock.now();
        Self {
            cfg,
            symbol: symbol.to_string(),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            clock,
            awg,
            shadow,
            ledger,
            exchange,
            metrics,
            breaker,
            wheel,
            live: tokio::sync::Mutex::new(HashMap::new()),
            pending_submits: Mutex::new(std::collections::HashSet::new()),
            price_levels: Mutex::new(HashMap::new()),
            adaptive: Mutex::new(AdaptiveState { stress: false }),
            recent_maker_rejects: Mutex::new(VecDeque::new()),
            started_at: Mutex::new(now),
            stats: Mutex::new(DleStats::default()),
        }
    }

    // ─────────────────────────────────────────────────
    // Planning cycle
    // ─────────────────────────────────────────────────

    pub async fn plan_cycle(&self, ctx: &PlanContext) -> CycleSummary {
        let mut summary = CycleSummary::default();
        self.stats.lock().unwrap().cycles += 1;

        if self.breaker.is_open() {
            summary.skipped = Some("breaker_open");
            return summary;
        }
        if !self.ledger.ready_for_trading() {
            summary.skipped = Some("ledger_not_ready");
            return summary;
        }
        if ctx.mirror_age_sec > self.cfg.mirror_stale_sec {
            summary.skipped = Some("mirror_stale");
            debug!("[dle] mirror stale ({}s), holding quotes", ctx.mirror_age_sec);
            return summary;
        }
        if !ctx.market.is_ready() {
            summary.skipped = Some("no_market");
            return summary;
        }

        self.close_stale_orders().await;
        self.update_stress_mode();

        let mid = ctx.market.mid();
        let base_bal = self.ledger.balance(&self.base_asset);
        let quote_bal = self.ledger.balance(&self.quote_asset);
        let base_value = base_bal.total() * mid;
        let equity = base_value + quote_bal.total();
        if equity <= Decimal::ZERO {
            summary.skipped = Some("no_equity");
            return summary;
        }

        let usable_quote =
            (self.shadow.free_available(&self.quote_asset) - self.cfg.cushion_usdt).max(Decimal::ZERO);
        let usable_base_value = (self.shadow.free_available(&self.base_asset)
            - self.cfg.cushion_doge)
            .max(Decimal::ZERO)
            * mid;

        let (onbook_buy, onbook_sell) = self.onbook_by_side().await;
        let e = plan::skew_error(base_value, equity, self.cfg.target_ratio);
        let risk = RiskSignals {
            awg_state: self.awg.state(),
            mirror_age_sec: ctx.mirror_age_sec,
            uds_age_sec: ctx.uds_age_sec,
        };
        let budgets = plan::derive_budgets(
            &self.cfg,
            equity,
            usable_quote,
            usable_base_value,
            onbook_buy,
            onbook_sell,
            e,
            &risk,
        );

        let plans = plan::build_plan(&PlanInputs {
            cfg: &self.cfg,
            rules: &ctx.rules,
            mid,
            bid: ctx.market.bid,
            ask: ctx.market.ask,
            budgets: &budgets,
            adaptive: self.adaptive_factors(),
        });
        summary.planned = plans.len();

        use rust_decimal::prelude::ToPrimitive;
        self.metrics.equity_usd.set(equity.to_f64().unwrap_or(0.0));
        let onbook = self.onbook_notional().await;
        let util_actual = (onbook / equity).to_f64().unwrap_or(0.0);
        self.metrics.util_onbook.set(util_actual);
        self.breaker
            .record_equity(equity.to_f64().unwrap_or(0.0));
        self.breaker
            .record_util(util_actual, self.ledger.ready_for_trading());

        // Refresh at most one badly drifted L0 order in place.
        self.reprice_drifted(ctx).await;

        // Warm-start ramp bounds how many new orders each side may add
        // per cycle.
        let per_side_limit = self.ramp_limit();
        let mut placed_per_side: HashMap<Side, u32> = HashMap::new();

        for p in &plans {
            let placed_count = placed_per_side.entry(p.side).or_insert(0);
            if *placed_count >= per_side_limit {
                continue;
            }
            match self.place_planned(p, false).await {
                PlaceOutcome::Placed => {
                    *placed_count += 1;
                    summary.placed += 1;
                }
                PlaceOutcome::NoReserve => summary.rejected_shadow += 1,
                PlaceOutcome::AwgDenied => summary.rejected_awg += 1,
                PlaceOutcome::Rejected => summary.rejected_exchange += 1,
                PlaceOutcome::PriceCapped => {}
            }
        }

        self.metrics.live_orders.set(self.live_count().await as i64);
        let (cycles, stress_entries) = {
            let s = self.stats.lock().unwrap();
            (s.cycles, s.stress_entries)
        };
        info!(
            "[dle] cycle#{cycles} planned={} placed={} util={:.1}% stress={}({stress_entries}) {}",
            summary.planned,
            summary.placed,
            budgets.util_eff * 100.0,
            self.adaptive.lock().unwrap().stress,
            self.awg.summary()
        );
        summary
    }

    // ─────────────────────────────────────────────────
    // Placement
    // ─────────────────────────────────────────────────

    /// Place one planned order. `rebalance` routes through the `rb_*`
    /// channels and counts its notional against the POV window.
    pub async fn place_planned(&self, p: &OrderPlan, rebalance: bool) -> PlaceOutcome {
        // Per-price cap.
        let key = price_key(p.price);
        {
            let levels = self.price_levels.lock().unwrap();
            if levels.get(&key).copied().unwrap_or(0) >= self.cfg.per_price_limit {
                debug!("[dle] price level {key} at cap, dropping plan");
                return PlaceOutcome::PriceCapped;
            }
        }

        let (reserve_asset, reserve_amount) = match p.side {
            Side::Buy => (self.quote_asset.clone(), p.notional()),
            Side::Sell => (self.base_asset.clone(), p.qty),
        };

        let client_order_id = self.make_client_id(p.side, rebalance);

        if !self
            .shadow
            .reserve(&client_order_id, &reserve_asset, reserve_amount, None)
        {
            self.breaker.record_decision(true);
            return PlaceOutcome::NoReserve;
        }

        let channel = if rebalance { Channel::RbNew } else { Channel::MmNew };
        let notional = if rebalance { p.notional() } else { Decimal::ZERO };
        if !self.awg.acquire("new_order", channel, None, notional) {
            self.shadow.release(&client_order_id, "awg_denied");
            self.metrics.awg_denied.inc();
            self.breaker.record_decision(true);
            return PlaceOutcome::AwgDenied;
        }

        self.ledger.add_event(OrderEvent {
            event_id: OrderEvent::new_id(EventKind::New, &client_order_id),
            kind: EventKind::New,
            ts_ms: self.clock.ts_ms(),
            order_id: client_order_id.clone(),
            side: Some(p.side),
            asset: reserve_asset.clone(),
            amount: p.qty,
            price: Some(p.price),
            fee: None,
            fee_asset: None,
            locked: None,
        });

        let req = NewOrderRequest {
            symbol: self.symbol.clone(),
            side: p.side,
            order_type: "LIMIT_MAKER".to_string(),
            qty: p.qty,
            price: p.price,
            client_order_id: client_order_id.clone(),
            time_in_force: None,
        };

        self.pending_submits
            .lock()
            .unwrap()
            .insert(client_order_id.clone());
        let started = Instant::now();
        let result = self.exchange.create_order(&req).await;
        self.metrics
            .order_place_latency_ms
            .observe(started.elapsed().as_millis() as f64);

        match result {
            Ok(ack) => {
                self.ledger.add_event(OrderEvent {
                    event_id: OrderEvent::new_id(EventKind::Ack, &ack.order_id),
                    kind: EventKind::Ack,
                    ts_ms: self.clock.ts_ms(),
                    order_id: ack.order_id.clone(),
                    side: Some(p.side),
                    asset: reserve_asset.clone(),
                    amount: p.qty,
                    price: Some(p.price),
                    fee: None,
                    fee_asset: None,
                    locked: None,
                });

                let order = LiveOrder {
                    order_id: ack.order_id.clone(),
                    client_order_id: client_order_id.clone(),
                    side: p.side,
                    price: p.price,
                    orig_qty: p.qty,
                    filled_qty: Decimal::ZERO,
                    layer: p.layer,
                    reserve_asset,
                    rebalance,
                    created: self.clock.now(),
                };
                self.live.lock().await.insert(ack.order_id.clone(), order);
                self.pending_submits.lock().unwrap().remove(&client_order_id);
                self.price_levels
                    .lock()
                    .unwrap()
                    .entry(key)
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                self.wheel
                    .schedule(&ack.order_id, Duration::from_millis(p.ttl_ms));

                self.metrics.orders_placed.inc();
                self.breaker.record_decision(false);
                self.record_maker_decision(false);
                debug!(
                    "[dle] placed {} {} {}@{} ({}, ttl={}ms)",
                    ack.order_id,
                    p.side.as_str(),
                    p.qty,
                    p.price,
                    p.layer.as_str(),
                    p.ttl_ms
                );
                PlaceOutcome::Placed
            }
            Err(err) => {
                self.pending_submits.lock().unwrap().remove(&client_order_id);
                self.handle_place_error(&client_order_id, p, &reserve_asset, &err);
                PlaceOutcome::Rejected
            }
        }
    }

    fn handle_place_error(
        &self,
        client_order_id: &str,
        p: &OrderPlan,
        reserve_asset: &str,
        err: &ExchangeError,
    ) {
        if let Some(code) = err.code() {
            self.metrics
                .api_errors
                .with_label_values(&[&code.to_string()])
                .inc();
            self.awg.track_api_error(code, "new_order");
        } else if matches!(err, ExchangeError::Timeout) {
            self.metrics.api_errors.with_label_values(&["timeout"]).inc();
        }

        let kind = RejectKind::classify(err);
        self.metrics
            .orders_rejected
            .with_label_values(&[kind.as_str()])
            .inc();
        self.record_maker_decision(kind == RejectKind::MakerViolation);
        self.breaker.record_decision(true);

        self.ledger.add_event(OrderEvent {
            event_id: OrderEvent::new_id(EventKind::Reject, client_order_id),
            kind: EventKind::Reject,
            ts_ms: self.clock.ts_ms(),
            order_id: client_order_id.to_string(),
            side: Some(p.side),
            asset: reserve_asset.to_string(),
            amount: p.qty,
            price: Some(p.price),
            fee: None,
            fee_asset: None,
            locked: None,
        });
        self.shadow
            .release(client_order_id, &format!("rejected_{}", kind.as_str()));
        warn!("[dle] place rejected ({}): {err}", kind.as_str());
    }

    fn make_client_id(&self, side: Side, rebalance: bool) -> String {
        let prefix = if rebalance { "RB" } else { "DLE" };
        let s = match side {
            Side::Buy => "B",
            Side::Sell => "S",
        };
        format!(
            "{prefix}-{s}-{}-{}",
            self.clock.ts_ms(),
            rand::thread_rng().gen_range(1000..9999)
        )
    }

    // ─────────────────────────────────────────────────
    // Reprice
    // ─────────────────────────────────────────────────

    /// Cancel-replace the worst-drifted L0 order onto the current guarded
    /// top rung. One per cycle; the replace rides the `mm_replace` budget.
    async fn reprice_drifted(&self, ctx: &PlanContext) {
        let factors = self.adaptive_factors();
        let mid = ctx.market.mid();
        let tick = ctx.rules.tick;

        let d_min = self.cfg.ticks_l0.iter().copied().min().unwrap_or(1);
        let candidate = {
            let live = self.live.lock().await;
            let mut worst: Option<(LiveOrder, Decimal)> = None;
            for o in live.values().filter(|o| o.layer == Layer::L0 && !o.rebalance) {
                let target = plan::guard_price(
                    o.side,
                    match o.side {
                        Side::Buy => mid - Decimal::from(d_min) * tick,
                        Side::Sell => mid + Decimal::from(d_min) * tick,
                    },
                    ctx.market.bid,
                    ctx.market.ask,
                    factors.guard_ticks,
                    tick,
                );
                let drift = (o.price - target).abs();
                if drift > Decimal::from(REPRICE_DRIFT_TICKS) * tick {
                    match &worst {
                        Some((_, worst_drift)) if *worst_drift >= drift => {}
                        _ => worst = Some((o.clone(), drift)),
                    }
                }
            }
            worst.map(|(o, _)| o)
        };

        let Some(old) = candidate else { return };
        let desired = match old.side {
            Side::Buy => mid - Decimal::from(d_min) * tick,
            Side::Sell => mid + Decimal::from(d_min) * tick,
        };
        let new_price = plan::guard_price(
            old.side,
            desired,
            ctx.market.bid,
            ctx.market.ask,
            factors.guard_ticks,
            tick,
        );
        if new_price <= Decimal::ZERO || new_price == old.price {
            return;
        }

        let qty = old.remaining();
        if qty * new_price < ctx.rules.min_notional {
            return;
        }
        let (reserve_asset, reserve_amount) = match old.side {
            Side::Buy => (self.quote_asset.clone(), qty * new_price),
            Side::Sell => (self.base_asset.clone(), qty),
        };
        let client_order_id = self.make_client_id(old.side, false);
        if !self
            .shadow
            .reserve(&client_order_id, &reserve_asset, reserve_amount, None)
        {
            return;
        }
        if !self
            .awg
            .acquire("cancelReplace", Channel::MmReplace, None, Decimal::ZERO)
        {
            self.shadow.release(&client_order_id, "awg_denied");
            return;
        }

        let req = NewOrderRequest {
            symbol: self.symbol.clone(),
            side: old.side,
            order_type: "LIMIT_MAKER".to_string(),
            qty,
            price: new_price,
            client_order_id: client_order_id.clone(),
            time_in_force: None,
        };
        self.pending_submits
            .lock()
            .unwrap()
            .insert(client_order_id.clone());
        let result = self
            .exchange
            .cancel_replace(&self.symbol, &old.order_id, &req)
            .await;
        match result {
            Ok(ack) => {
                self.close_and_release(&old.order_id, "repriced").await;
                let order = LiveOrder {
                    order_id: ack.order_id.clone(),
                    client_order_id: client_order_id.clone(),
                    side: old.side,
                    price: new_price,
                    orig_qty: qty,
                    filled_qty: Decimal::ZERO,
                    layer: Layer::L0,
                    reserve_asset,
                    rebalance: false,
                    created: self.clock.now(),
                };
                self.live.lock().await.insert(ack.order_id.clone(), order);
                self.pending_submits.lock().unwrap().remove(&client_order_id);
                self.price_levels
                    .lock()
                    .unwrap()
                    .entry(price_key(new_price))
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                self.wheel
                    .schedule(&ack.order_id, Duration::from_millis(self.cfg.layer_ttl_ms[0]));
                info!(
                    "[dle] repriced {} → {} {}@{}",
                    old.order_id,
                    ack.order_id,
                    old.side.as_str(),
                    new_price
                );
            }
            Err(e) => {
                self.pending_submits.lock().unwrap().remove(&client_order_id);
                self.shadow.release(&client_order_id, "reprice_failed");
                if let Some(code) = e.code() {
                    self.awg.track_api_error(code, "cancelReplace");
                }
                // -2022 with the inner cancel already gone: the old order is
                // dead either way, reflect that locally.
                if e.code() == Some(-2022) || e.is_idempotent_cancel() {
                    self.close_and_release(&old.order_id, "reprice_gone").await;
                }
                warn!("[dle] reprice of {} failed: {e}", old.order_id);
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Closure — the only legal local termination path
    // ─────────────────────────────────────────────────

    /// Idempotent: cancel the TTL timer, drop the live entry, release the
    /// reservation, decrement the price-level counter.
    pub async fn close_and_release(&self, order_id: &str, reason: &str) {
        self.wheel.cancel(order_id);

        let removed = self.live.lock().await.remove(order_id);
        let Some(order) = removed else {
            return;
        };

        self.shadow.release(&order.client_order_id, reason);

        let key = price_key(order.price);
        let mut levels = self.price_levels.lock().unwrap();
        if let Some(count) = levels.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                levels.remove(&key);
            }
        }
        debug!("[dle] closed {order_id} ({reason})");
    }

    /// Planning-time cleanup: anything live long past its reservation TTL
    /// is leaked state, not a working order.
    async fn close_stale_orders(&self) {
        let now = self.clock.now();
        let stale: Vec<String> = {
            let live = self.live.lock().await;
            live.values()
                .filter(|o| now.duration_since(o.created) > STALE_ORDER_MAX)
                .map(|o| o.order_id.clone())
                .collect()
        };
        for id in stale {
            warn!("[dle] closing stale order {id}");
            self.close_and_release(&id, "stale").await;
        }
    }

    // ─────────────────────────────────────────────────
    // Stream-driven updates
    // ─────────────────────────────────────────────────

    /// Adopt an order first seen on the user stream (missed local ack or
    /// externally placed).
    pub async fn register_order_from_uds(
        &self,
        order_id: &str,
        client_order_id: &str,
        side: Side,
        price: Decimal,
        orig_qty: Decimal,
    ) {
        if self
            .pending_submits
            .lock()
            .unwrap()
            .contains(client_order_id)
        {
            // The local placement path owns this one; its ack registers it.
            return;
        }
        let mut live = self.live.lock().await;
        if live.contains_key(order_id) {
            return;
        }
        let reserve_asset = match side {
            Side::Buy => self.quote_asset.clone(),
            Side::Sell => self.base_asset.clone(),
        };
        live.insert(
            order_id.to_string(),
            LiveOrder {
                order_id: order_id.to_string(),
                client_order_id: client_order_id.to_string(),
                side,
                price,
                orig_qty,
                filled_qty: Decimal::ZERO,
                layer: Layer::L0,
                reserve_asset,
                rebalance: false,
                created: self.clock.now(),
            },
        );
        drop(live);
        self.price_levels
            .lock()
            .unwrap()
            .entry(price_key(price))
            .and_modify(|c| *c += 1)
            .or_insert(1);
        debug!("[dle] adopted order {order_id} from stream");
    }

    /// Reflect a cumulative fill from the stream; a fully-filled order runs
    /// the closure routine.
    pub async fn update_filled_from_uds(&self, order_id: &str, filled_qty: Decimal) {
        let fully_filled = {
            let mut live = self.live.lock().await;
            match live.get_mut(order_id) {
                Some(o) => {
                    o.filled_qty = filled_qty.min(o.orig_qty);
                    o.remaining() <= Decimal::ZERO
                }
                None => false,
            }
        };
        if fully_filled {
            self.metrics.orders_filled.inc();
            self.close_and_release(order_id, "filled").await;
        }
    }

    // ─────────────────────────────────────────────────
    // TTL expiry consumer
    // ─────────────────────────────────────────────────

    /// Drain wheel expirations: cancel the order (AWG-gated on the right
    /// channel) and run closure. Runs until the wheel shuts down.
    pub async fn run_expiry_loop(self: Arc<Self>, mut expired: mpsc::UnboundedReceiver<Expiry>) {
        while let Some(Expiry { key: order_id }) = expired.recv().await {
            self.handle_expiry(&order_id).await;
        }
    }

    async fn handle_expiry(&self, order_id: &str) {
        let order = match self.live.lock().await.get(order_id) {
            Some(o) => o.clone(),
            None => return, // already closed; expiry raced the stream
        };

        let channel = if order.rebalance {
            Channel::RbCancel
        } else {
            Channel::TtlCancel
        };
        if !self.awg.acquire("cancel", channel, None, Decimal::ZERO) {
            // No cancel budget right now; re-arm shortly instead of dropping
            // the expiry on the floor.
            self.metrics.awg_denied.inc();
            self.wheel.schedule(order_id, Duration::from_millis(1_000));
            return;
        }

        let started = Instant::now();
        let result = self.exchange.cancel_order(&self.symbol, order_id).await;
        self.metrics
            .cancel_latency_ms
            .observe(started.elapsed().as_millis() as f64);

        match result {
            Ok(_) => {
                self.metrics.orders_canceled.inc();
                self.close_and_release(order_id, "ttl_expired").await;
            }
            Err(e) if e.is_idempotent_cancel() => {
                // Already gone upstream; local closure still applies.
                self.close_and_release(order_id, "ttl_gone").await;
            }
            Err(e) => {
                if let Some(code) = e.code() {
                    self.awg.track_api_error(code, "cancel");
                    self.metrics
                        .api_errors
                        .with_label_values(&[&code.to_string()])
                        .inc();
                }
                warn!("[dle] ttl cancel failed for {order_id}: {e}");
                self.wheel.schedule(order_id, Duration::from_millis(2_000));
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Stress mode
    // ─────────────────────────────────────────────────

    fn record_maker_decision(&self, maker_reject: bool) {
        let mut window = self.recent_maker_rejects.lock().unwrap();
        window.push_back(maker_reject);
        while window.len() > 10 {
            window.pop_front();
        }
    }

    fn update_stress_mode(&self) {
        let awg_stressed = matches!(
            self.awg.state(),
            CircuitState::Degraded | CircuitState::CircuitOpen
        );
        let reject_stressed = {
            let window = self.recent_maker_rejects.lock().unwrap();
            window.len() >= 10 && window.iter().filter(|&&r| r).count() as f64 / window.len() as f64 > 0.3
        };

        let mut adaptive = self.adaptive.lock().unwrap();
        let next = awg_stressed || reject_stressed;
        if next && !adaptive.stress {
            adaptive.stress = true;
            self.stats.lock().unwrap().stress_entries += 1;
            warn!("[dle] entering stress mode");
        } else if !next && adaptive.stress {
            adaptive.stress = false;
            info!("[dle] leaving stress mode");
        }
    }

    pub fn adaptive_factors(&self) -> AdaptiveFactors {
        let stress = self.adaptive.lock().unwrap().stress;
        if stress {
            AdaptiveFactors {
                spread_factor: 1.5,
                size_factor: 0.8,
                guard_ticks: self.cfg.maker_guard_stress,
            }
        } else {
            AdaptiveFactors {
                spread_factor: 1.0,
                size_factor: 1.0,
                guard_ticks: self.cfg.maker_guard_base,
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Ramp / introspection
    // ─────────────────────────────────────────────────

    /// Warm-start ramp: 1 per side for the first minute, 2 for the second,
    /// then the configured cap (never above 4).
    fn ramp_limit(&self) -> u32 {
        let elapsed = self
            .clock
            .now()
            .duration_since(*self.started_at.lock().unwrap());
        if elapsed < Duration::from_secs(60) {
            1
        } else if elapsed < Duration::from_secs(120) {
            2
        } else {
            self.cfg.soft_cap_new.min(4)
        }
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn live_order(&self, order_id: &str) -> Option<LiveOrder> {
        self.live.lock().await.get(order_id).cloned()
    }

    pub async fn onbook_notional(&self) -> Decimal {
        self.live
            .lock()
            .await
            .values()
            .map(|o| o.price * o.remaining())
            .sum()
    }

    /// Resting notional split by side, the replenishment baseline.
    pub async fn onbook_by_side(&self) -> (Decimal, Decimal) {
        let live = self.live.lock().await;
        let mut buy = Decimal::ZERO;
        let mut sell = Decimal::ZERO;
        for o in live.values() {
            match o.side {
                Side::Buy => buy += o.price * o.remaining(),
                Side::Sell => sell += o.price * o.remaining(),
            }
        }
        (buy, sell)
    }

    pub fn price_level_count(&self, px: Decimal) -> u32 {
        self.price_levels
            .lock()
            .unwrap()
            .get(&price_key(px))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn backdate_warm_start(&self, ago: Duration) {
        let mut started = self.started_at.lock().unwrap();
        *started = self.clock.now() - ago;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Placed,
    NoReserve,
    AwgDenied,
    Rejected,
    PriceCapped,
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AwgConfig, BreakerConfig, SsotConfig};
    use crate::exchange::mock::MockExchange;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;

    struct Rig {
        clock: Arc<Clock>,
        awg: Arc<ApiWeightGovernor>,
        shadow: Arc<ShadowBalance>,
        ledger: Arc<EventLedger>,
        mock: Arc<MockExchange>,
        dle: Arc<LiquidityEngine>,
        expired_rx: Option<mpsc::UnboundedReceiver<Expiry>>,
    }

    fn rig_with(cfg: DleConfig) -> Rig {
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
        let mock = Arc::new(MockExchange::new("DOGEUSDT", "DOGE", "USDT"));
        let metrics = Arc::new(Metrics::new());
        let breaker = Arc::new(RiskBreaker::new(BreakerConfig::default(), clock.clone()));
        let (wheel, expired_rx) = TtlWheel::spawn();

        // Seed balances and finish cold start.
        let snap = StdHashMap::from([
            ("USDT".to_string(), (dec!(300), Decimal::ZERO)),
            ("DOGE".to_string(), (dec!(1200), Decimal::ZERO)),
        ]);
        shadow.sync_actual_balance(&snap);
        for _ in 0..3 {
            shadow.sync_actual_balance(&snap);
        }

        let dle = Arc::new(LiquidityEngine::new(
            cfg,
            "DOGEUSDT",
            "DOGE",
            "USDT",
            clock.clone(),
            awg.clone(),
            shadow.clone(),
            ledger.clone(),
            mock.clone(),
            metrics,
            breaker,
            wheel,
        ));

        Rig {
            clock,
            awg,
            shadow,
            ledger,
            mock,
            dle,
            expired_rx: Some(expired_rx),
        }
    }

    fn l0_only_cfg() -> DleConfig {
        DleConfig {
            ticks_l0: vec![1, 2, 3],
            ticks_l1: vec![],
            ticks_l2: vec![],
            ..DleConfig::default()
        }
    }

    fn ctx() -> PlanContext {
        PlanContext {
            market: MarketView {
                bid: dec!(0.23999),
                ask: dec!(0.24001),
                ts: std::time::Instant::now(),
            },
            rules: SymbolRules {
                tick: dec!(0.00001),
                step: dec!(1),
                min_notional: dec!(5),
            },
            mirror_age_sec: 0,
            uds_age_sec: 0,
        }
    }

    #[tokio::test]
    async fn test_normal_quote_cycle() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));

        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.planned, 6);
        assert_eq!(summary.placed, 6);

        // Three distinct guarded bids and asks on the mock book.
        let open = rig.mock.get_open_orders("DOGEUSDT").await.unwrap();
        let mut bids: Vec<Decimal> = open
            .iter()
            .filter(|o| o.side == Side::Buy)
            .map(|o| o.price)
            .collect();
        let mut asks: Vec<Decimal> = open
            .iter()
            .filter(|o| o.side == Side::Sell)
            .map(|o| o.price)
            .collect();
        bids.sort();
        asks.sort();
        assert_eq!(bids, vec![dec!(0.23996), dec!(0.23997), dec!(0.23998)]);
        assert_eq!(asks, vec![dec!(0.24002), dec!(0.24003), dec!(0.24004)]);

        // Integer quantities at or above the min-notional floor.
        for o in &open {
            assert_eq!(o.orig_qty % dec!(1), dec!(0));
            assert!(o.orig_qty * o.price >= dec!(5));
        }

        // One reservation per live order, and six mm_new admissions.
        assert_eq!(rig.shadow.reservation_count(), 6);
        assert_eq!(rig.awg.status().channel_used_10s["mm_new"], 6);
        assert_eq!(rig.dle.live_count().await, 6);
    }

    #[tokio::test]
    async fn test_warm_start_ramp_limits_first_minute() {
        let rig = rig_with(l0_only_cfg());
        let summary = rig.dle.plan_cycle(&ctx()).await;
        // One per side while the ramp is in its first minute.
        assert_eq!(summary.placed, 2);

        rig.clock.advance(Duration::from_secs(61));
        let snap = StdHashMap::from([
            ("USDT".to_string(), (dec!(300), Decimal::ZERO)),
            ("DOGE".to_string(), (dec!(1200), Decimal::ZERO)),
        ]);
        rig.shadow.sync_actual_balance(&snap);
        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert!(summary.placed <= 4);
    }

    #[tokio::test]
    async fn test_maker_reject_releases_reservation() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        rig.mock.script_reject(ExchangeError::Api {
            code: -2010,
            msg: "Order would immediately match and take.".into(),
        });

        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.rejected_exchange, 1);
        // The rejected order's reservation is gone; the rest stand.
        assert_eq!(rig.shadow.reservation_count(), summary.placed);
    }

    #[tokio::test]
    async fn test_awg_denial_releases_reservation() {
        let cfg = l0_only_cfg();
        let rig = rig_with(cfg);
        rig.dle.backdate_warm_start(Duration::from_secs(300));

        // Exhaust the mm_new channel before the cycle.
        while rig
            .awg
            .acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO)
        {}
        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.placed, 0);
        assert!(summary.rejected_awg > 0);
        assert_eq!(rig.shadow.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_close_and_release_full_teardown() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        rig.dle.plan_cycle(&ctx()).await;

        let open = rig.mock.get_open_orders("DOGEUSDT").await.unwrap();
        let victim = &open[0];
        let px = victim.price;
        assert_eq!(rig.dle.price_level_count(px), 1);

        rig.dle.close_and_release(&victim.order_id, "test").await;
        assert!(rig.dle.live_order(&victim.order_id).await.is_none());
        assert_eq!(rig.dle.price_level_count(px), 0);
        assert_eq!(rig.shadow.reservation_count(), 5);

        // Idempotent second close.
        rig.dle.close_and_release(&victim.order_id, "test").await;
        assert_eq!(rig.shadow.reservation_count(), 5);
    }

    #[tokio::test]
    async fn test_ttl_expiry_cancels_and_closes() {
        let mut cfg = l0_only_cfg();
        cfg.layer_ttl_ms = [50, 50, 50];
        let mut rig = rig_with(cfg);
        rig.dle.backdate_warm_start(Duration::from_secs(300));

        let expiry_rx = rig.expired_rx.take().unwrap();
        tokio::spawn(rig.dle.clone().run_expiry_loop(expiry_rx));

        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.placed, 6);

        // All TTLs expire; cancels land on the mock and locals close.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.mock.open_order_count(), 0);
        assert_eq!(rig.dle.live_count().await, 0);
        assert_eq!(rig.shadow.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_fill_from_uds_closes_at_terminal() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        rig.dle.plan_cycle(&ctx()).await;
        let open = rig.mock.get_open_orders("DOGEUSDT").await.unwrap();
        let target = open
            .iter()
            .find(|o| o.side == Side::Buy)
            .unwrap()
            .order_id
            .clone();
        let orig = rig.dle.live_order(&target).await.unwrap().orig_qty;

        rig.dle.update_filled_from_uds(&target, orig / dec!(2)).await;
        assert!(rig.dle.live_order(&target).await.is_some());

        rig.dle.update_filled_from_uds(&target, orig).await;
        assert!(rig.dle.live_order(&target).await.is_none());
    }

    #[tokio::test]
    async fn test_drifted_order_is_cancel_replaced() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));

        // Deep pockets so the replacement reservation clears.
        let snap = StdHashMap::from([
            ("USDT".to_string(), (dec!(5000), Decimal::ZERO)),
            ("DOGE".to_string(), (dec!(20000), Decimal::ZERO)),
        ]);
        rig.mock.set_balance("USDT", dec!(5000), Decimal::ZERO);
        rig.mock.set_balance("DOGE", dec!(20000), Decimal::ZERO);
        rig.shadow.sync_actual_balance(&snap);
        for _ in 0..3 {
            rig.shadow.sync_actual_balance(&snap);
        }

        rig.dle.plan_cycle(&ctx()).await;
        let open = rig.mock.get_open_orders("DOGEUSDT").await.unwrap();
        let worst_bid = open
            .iter()
            .filter(|o| o.side == Side::Buy)
            .min_by_key(|o| o.price)
            .unwrap()
            .order_id
            .clone();

        // The market gaps up ~100 ticks; the deepest bid is now badly off.
        rig.mock.set_book(dec!(0.24100), dec!(0.24102));
        let mut moved = ctx();
        moved.market.bid = dec!(0.24100);
        moved.market.ask = dec!(0.24102);
        rig.dle.plan_cycle(&moved).await;

        assert!(rig.dle.live_order(&worst_bid).await.is_none());
        let open = rig.mock.get_open_orders("DOGEUSDT").await.unwrap();
        assert!(open.iter().all(|o| o.order_id != worst_bid));
        // Its replacement sits on the new guarded top rung.
        assert!(open.iter().any(|o| o.price == dec!(0.24099)));
        assert_eq!(rig.awg.status().channel_used_10s["mm_replace"], 1);
    }

    #[tokio::test]
    async fn test_stress_mode_from_awg_state() {
        let rig = rig_with(l0_only_cfg());
        assert_eq!(rig.dle.adaptive_factors().guard_ticks, 1);
        rig.awg.force_state(CircuitState::Degraded);
        rig.dle.update_stress_mode();
        let f = rig.dle.adaptive_factors();
        assert_eq!(f.guard_ticks, DleConfig::default().maker_guard_stress);
        assert!(f.spread_factor > 1.0);

        rig.awg.force_state(CircuitState::Normal);
        rig.dle.update_stress_mode();
        assert_eq!(rig.dle.adaptive_factors().guard_ticks, 1);
    }

    #[tokio::test]
    async fn test_per_price_cap_drops_plan() {
        let mut cfg = l0_only_cfg();
        cfg.per_price_limit = 1;
        let rig = rig_with(cfg);
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        rig.dle.plan_cycle(&ctx()).await;
        // Same market, second cycle: every level is already taken.
        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.placed, 0);
    }

    #[tokio::test]
    async fn test_breaker_open_skips_cycle() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        // Trip the process circuit via the API-error rule.
        rig.dle.breaker.evaluate(100);
        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.skipped, Some("breaker_open"));
        assert_eq!(summary.placed, 0);
    }

    #[tokio::test]
    async fn test_ledger_not_ready_skips_cycle() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        rig.clock.advance(Duration::from_secs(120));
        // Sync is now stale → ledger reports not ready.
        let summary = rig.dle.plan_cycle(&ctx()).await;
        assert_eq!(summary.skipped, Some("ledger_not_ready"));
    }

    #[tokio::test]
    async fn test_mirror_stale_skips_cycle() {
        let rig = rig_with(l0_only_cfg());
        rig.dle.backdate_warm_start(Duration::from_secs(300));
        let mut c = ctx();
        c.mirror_age_sec = 30;
        let summary = rig.dle.plan_cycle(&c).await;
        assert_eq!(summary.skipped, Some("mirror_stale"));
    }
}
