//! Event Ledger — replayable order-event log and per-asset balance state.
//!
//! The ledger is the bottom half of the single source of truth: an
//! append-only, bounded event deque whose deterministic state deltas produce
//! the per-asset `{free, locked, pending_new}` view that Shadow Balance
//! builds on. Exchange snapshots are only ever compared against it; on
//! divergence beyond the threshold the ledger force-reconciles to exchange
//! truth and re-enters a cold-start window.
//!
//! Replaying the full event log from an empty ledger reproduces the current
//! balance map — force reconciles are themselves recorded as BALANCE_SYNC
//! events so the log stays self-contained.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SsotConfig;
use crate::types::Side;

// ─────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    New,
    Ack,
    Trade,
    Canceled,
    Reject,
    BalanceSync,
    /// Forward-compat: kinds added by newer builds are preserved on disk
    /// and skipped on apply.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::New => "NEW",
            EventKind::Ack => "ACK",
            EventKind::Trade => "TRADE",
            EventKind::Canceled => "CANCELED",
            EventKind::Reject => "REJECT",
            EventKind::BalanceSync => "BALANCE_SYNC",
            EventKind::Unknown => "UNKNOWN",
        }
    }
}

/// One immutable ledger entry. `amount` is a base-asset quantity for order
/// events and a free balance for BALANCE_SYNC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub ts_ms: u64,
    pub order_id: String,
    pub side: Option<Side>,
    pub asset: String,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_asset: Option<String>,
    /// BALANCE_SYNC only: the locked part of the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<Decimal>,
}

impl OrderEvent {
    pub fn new_id(kind: EventKind, order_id: &str) -> String {
        format!("{}-{}-{}", kind.as_str(), order_id, Uuid::new_v4().simple())
    }
}

// ─────────────────────────────────────────────────────────
// Balances
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub free: Decimal,
    pub locked: Decimal,
    pub pending_new: Decimal,
    pub pending_cancel: Decimal,
}

impl LedgerBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    /// Free balance net of not-yet-acked outbound orders.
    pub fn available(&self) -> Decimal {
        (self.free - self.pending_new).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy)]
struct OrderLock {
    side: Side,
    locked_amount: Decimal,
    open: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub total_events: u64,
    pub duplicates: u64,
    pub divergences: u64,
    pub reconciliations: u64,
    pub replays: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub cold_start: bool,
    pub ready_for_trading: bool,
    pub consistency_checks_passed: u32,
    pub sync_age_sec: Option<u64>,
    pub event_count: usize,
    pub balances: HashMap<String, LedgerBalance>,
    pub stats: LedgerStats,
}

// ─────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct LedgerInner {
    events: VecDeque<OrderEvent>,
    event_index: HashSet<String>,
    balances: HashMap<String, LedgerBalance>,
    orders: HashMap<String, OrderLock>,
    last_sync: Option<Instant>,
    cold_start: bool,
    checks_passed: u32,
    stats: LedgerStats,
}

#[derive(Debug)]
pub struct EventLedger {
    clock: Arc<Clock>,
    base_asset: String,
    quote_asset: String,
    max_events: usize,
    divergence_threshold: f64,
    min_consistency_checks: u32,
    sync_interval: Duration,
    inner: Mutex<LedgerInner>,
}

impl EventLedger {
    pub fn new(cfg: &SsotConfig, base: &str, quote: &str, clock: Arc<Clock>) -> Self {
        Self {
            clock,
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            max_events: cfg.ledger_max_events,
            divergence_threshold: cfg.divergence_threshold,
            min_consistency_checks: cfg.min_consistency_checks,
            sync_interval: Duration::from_secs(cfg.sync_interval_sec),
            inner: Mutex::new(LedgerInner {
                events: VecDeque::new(),
                event_index: HashSet::new(),
                balances: HashMap::new(),
                orders: HashMap::new(),
                last_sync: None,
                cold_start: true,
                checks_passed: 0,
                stats: LedgerStats::default(),
            }),
        }
    }

    /// Append one event. Idempotent on `event_id`; a duplicate changes
    /// nothing and returns false.
    pub fn add_event(&self, ev: OrderEvent) -> bool {
        let mut g = self.inner.lock().unwrap();
        if g.event_index.contains(&ev.event_id) {
            g.stats.duplicates += 1;
            debug!("[ledger] duplicate event {}", ev.event_id);
            return false;
        }
        g.event_index.insert(ev.event_id.clone());
        if g.events.len() >= self.max_events {
            if let Some(old) = g.events.pop_front() {
                g.event_index.remove(&old.event_id);
            }
        }
        g.stats.total_events += 1;
        Self::apply(&mut g, &self.base_asset, &self.quote_asset, &ev);
        g.events.push_back(ev);
        true
    }

    fn apply(g: &mut LedgerInner, base: &str, quote: &str, ev: &OrderEvent) {
        let locked_amount = |side: Side, amount: Decimal, price: Option<Decimal>| match side {
            Side::Buy => amount * price.unwrap_or(Decimal::ZERO),
            Side::Sell => amount,
        };

        match ev.kind {
            EventKind::New => {
                let side = match ev.side {
                    Some(s) => s,
                    None => return,
                };
                let la = locked_amount(side, ev.amount, ev.price);
                let bal = g.balances.entry(ev.asset.clone()).or_default();
                bal.pending_new += la;
            }
            EventKind::Ack => {
                let side = match ev.side {
                    Some(s) => s,
                    None => return,
                };
                let la = locked_amount(side, ev.amount, ev.price);
                let bal = g.balances.entry(ev.asset.clone()).or_default();
                bal.pending_new = (bal.pending_new - la).max(Decimal::ZERO);
                bal.free = (bal.free - la).max(Decimal::ZERO);
                bal.locked += la;
                g.orders.insert(
                    ev.order_id.clone(),
                    OrderLock {
                        side,
                        locked_amount: la,
                        open: true,
                    },
                );
            }
            EventKind::Trade => {
                let side = match ev.side {
                    Some(s) => s,
                    None => return,
                };
                let qty = ev.amount;
                let quote_value = qty * ev.price.unwrap_or(Decimal::ZERO);
                match side {
                    Side::Buy => {
                        let qb = g.balances.entry(quote.to_string()).or_default();
                        qb.locked = (qb.locked - quote_value).max(Decimal::ZERO);
                        let bb = g.balances.entry(base.to_string()).or_default();
                        bb.free += qty;
                    }
                    Side::Sell => {
                        let bb = g.balances.entry(base.to_string()).or_default();
                        bb.locked = (bb.locked - qty).max(Decimal::ZERO);
                        let qb = g.balances.entry(quote.to_string()).or_default();
                        qb.free += quote_value;
                    }
                }
                if let (Some(fee), Some(fee_asset)) = (ev.fee, ev.fee_asset.as_ref()) {
                    let fb = g.balances.entry(fee_asset.clone()).or_default();
                    fb.free = (fb.free - fee).max(Decimal::ZERO);
                }
                // Shrink the remaining lock on the resting order.
                if let Some(ol) = g.orders.get_mut(&ev.order_id) {
                    let consumed = match ol.side {
                        Side::Buy => quote_value,
                        Side::Sell => qty,
                    };
                    ol.locked_amount = (ol.locked_amount - consumed).max(Decimal::ZERO);
                }
            }
            EventKind::Canceled => {
                if let Some(ol) = g.orders.get_mut(&ev.order_id) {
                    if ol.open {
                        ol.open = false;
                        let asset = match ol.side {
                            Side::Buy => quote,
                            Side::Sell => base,
                        };
                        let la = ol.locked_amount;
                        let bal = g.balances.entry(asset.to_string()).or_default();
                        bal.locked = (bal.locked - la).max(Decimal::ZERO);
                        bal.free += la;
                    }
                }
            }
            EventKind::Reject => {
                let side = match ev.side {
                    Some(s) => s,
                    None => return,
                };
                let la = locked_amount(side, ev.amount, ev.price);
                let bal = g.balances.entry(ev.asset.clone()).or_default();
                bal.pending_new = (bal.pending_new - la).max(Decimal::ZERO);
            }
            EventKind::BalanceSync => {
                let bal = g.balances.entry(ev.asset.clone()).or_default();
                bal.free = ev.amount;
                bal.locked = ev.locked.unwrap_or(Decimal::ZERO);
                bal.pending_new = Decimal::ZERO;
                bal.pending_cancel = Decimal::ZERO;
            }
            EventKind::Unknown => {}
        }
    }

    /// Compare an exchange balance snapshot against the ledger. A relative
    /// total deviation beyond the threshold on any asset forces a single
    /// reconcile (exchange wins) and restarts the cold-start window.
    /// Returns true when the snapshot was clean.
    pub fn sync_exchange_balances(&self, snapshot: &HashMap<String, (Decimal, Decimal)>) -> bool {
        let now = self.clock.now();
        let ts_ms = self.clock.ts_ms();
        let mut g = self.inner.lock().unwrap();
        g.last_sync = Some(now);

        let mut diverged = false;
        for (asset, (free, locked)) in snapshot {
            let exchange_total = *free + *locked;
            let ledger_total = g.balances.get(asset).map(|b| b.total()).unwrap_or_default();
            let deviation = if exchange_total > Decimal::ZERO {
                use rust_decimal::prelude::ToPrimitive;
                ((ledger_total - exchange_total) / exchange_total)
                    .abs()
                    .to_f64()
                    .unwrap_or(f64::INFINITY)
            } else if ledger_total == Decimal::ZERO {
                0.0
            } else {
                f64::INFINITY
            };
            if deviation > self.divergence_threshold {
                warn!(
                    "[ledger] divergence {asset}: ledger={ledger_total} exchange={exchange_total}"
                );
                diverged = true;
            }
        }

        if diverged {
            g.stats.divergences += 1;
            Self::force_reconcile(&mut g, snapshot, ts_ms);
            return false;
        }

        g.checks_passed += 1;
        if g.cold_start && g.checks_passed >= self.min_consistency_checks {
            g.cold_start = false;
            info!("[ledger] cold start complete, ledger consistent with exchange");
        }
        true
    }

    /// Unconditional reset to exchange truth, used by the SSOT repair path
    /// when the free/locked split drifts without moving the totals.
    pub fn force_reconcile_to(&self, snapshot: &HashMap<String, (Decimal, Decimal)>) {
        let ts_ms = self.clock.ts_ms();
        let mut g = self.inner.lock().unwrap();
        g.last_sync = Some(self.clock.now());
        g.stats.divergences += 1;
        Self::force_reconcile(&mut g, snapshot, ts_ms);
    }

    /// Reset to exchange truth. Recorded as BALANCE_SYNC events so a replay
    /// of the log reproduces the post-reconcile state.
    fn force_reconcile(g: &mut LedgerInner, snapshot: &HashMap<String, (Decimal, Decimal)>, ts_ms: u64) {
        info!("[ledger] force reconcile to exchange snapshot");
        for (asset, (free, locked)) in snapshot {
            let ev = OrderEvent {
                event_id: OrderEvent::new_id(EventKind::BalanceSync, asset),
                kind: EventKind::BalanceSync,
                ts_ms,
                order_id: String::new(),
                side: None,
                asset: asset.clone(),
                amount: *free,
                price: None,
                fee: None,
                fee_asset: None,
                locked: Some(*locked),
            };
            g.event_index.insert(ev.event_id.clone());
            g.stats.total_events += 1;
            let bal = g.balances.entry(asset.clone()).or_default();
            bal.free = *free;
            bal.locked = *locked;
            bal.pending_new = Decimal::ZERO;
            bal.pending_cancel = Decimal::ZERO;
            g.events.push_back(ev);
        }
        g.orders.clear();
        g.checks_passed = 0;
        g.cold_start = true;
        g.stats.reconciliations += 1;
    }

    /// Rebuild balances by replaying every retained event over an empty
    /// state. Returns the number of events replayed.
    pub fn replay(&self) -> usize {
        let mut g = self.inner.lock().unwrap();
        g.balances.clear();
        g.orders.clear();
        let events: Vec<OrderEvent> = g.events.iter().cloned().collect();
        for ev in &events {
            Self::apply(&mut g, &self.base_asset, &self.quote_asset, ev);
        }
        g.stats.replays += 1;
        events.len()
    }

    pub fn balance(&self, asset: &str) -> LedgerBalance {
        self.inner
            .lock()
            .unwrap()
            .balances
            .get(asset)
            .cloned()
            .unwrap_or_default()
    }

    pub fn available(&self, asset: &str) -> Decimal {
        self.balance(asset).available()
    }

    /// Cold start finished and the last snapshot sync is fresh.
    pub fn ready_for_trading(&self) -> bool {
        let now = self.clock.now();
        let g = self.inner.lock().unwrap();
        if g.cold_start {
            return false;
        }
        match g.last_sync {
            Some(t) => now.duration_since(t) <= self.sync_interval * 2,
            None => false,
        }
    }

    pub fn status(&self) -> LedgerStatus {
        let now = self.clock.now();
        let g = self.inner.lock().unwrap();
        let sync_age = g.last_sync.map(|t| now.duration_since(t).as_secs());
        let ready = !g.cold_start
            && g.last_sync
                .map(|t| now.duration_since(t) <= self.sync_interval * 2)
                .unwrap_or(false);
        LedgerStatus {
            cold_start: g.cold_start,
            ready_for_trading: ready,
            consistency_checks_passed: g.checks_passed,
            sync_age_sec: sync_age,
            event_count: g.events.len(),
            balances: g.balances.clone(),
            stats: g.stats.clone(),
        }
    }

    pub fn summary(&self) -> String {
        let s = self.status();
        let mut parts: Vec<String> = s
            .balances
            .iter()
            .map(|(a, b)| format!("{}({:.0})", a, b.available()))
            .collect();
        parts.sort();
        format!(
            "ledger=[{}] events={} mode={} sync_age={}s",
            parts.join(","),
            s.event_count,
            if s.cold_start { "COLD" } else { "READY" },
            s.sync_age_sec.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
        )
    }

    // ── Persistence ──

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let g = self.inner.lock().unwrap();
        let doc = PersistedLedger {
            timestamp: chrono::Utc::now().to_rfc3339(),
            events: g.events.iter().cloned().collect(),
            balances: g.balances.clone(),
            meta: PersistedMeta {
                cold_start: g.cold_start,
                checks_passed: g.checks_passed,
                total_events: g.stats.total_events,
            },
        };
        drop(g);
        crate::persist::write_atomic(path, &doc)
    }

    /// Load a persisted ledger. Balances are taken as-is and revalidated on
    /// the next snapshot sync; the cold-start window restarts.
    pub fn load(&self, path: &Path) -> anyhow::Result<usize> {
        let doc: PersistedLedger = crate::persist::read_json(path)?;
        let mut g = self.inner.lock().unwrap();
        g.events = doc.events.into_iter().collect();
        g.event_index = g.events.iter().map(|e| e.event_id.clone()).collect();
        g.balances = doc.balances;
        g.orders.clear();
        g.cold_start = true;
        g.checks_passed = 0;
        info!("[ledger] restored {} events from disk", g.events.len());
        Ok(g.events.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMeta {
    cold_start: bool,
    checks_passed: u32,
    total_events: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedLedger {
    timestamp: String,
    events: Vec<OrderEvent>,
    balances: HashMap<String, LedgerBalance>,
    meta: PersistedMeta,
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
