//! Shadow Balance — pre-allocation layer over the event ledger.
//!
//! Placement never races over the same funds: before an order goes out, the
//! caller reserves the funding asset here, and the reservation is released on
//! every terminal path. Availability is always derived, never cached:
//!
//!   free_available(asset) = max(0, ledger.available(asset) − live reserves)
//!
//! Execution reports are applied purely delta-driven: cumulative quantities
//! from the exchange minus the last-seen cumulative quantities, deduplicated
//! by `(order_id, update_id)`. Status strings never drive balance math.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SsotConfig;
use crate::ledger::{EventKind, EventLedger, OrderEvent};
use crate::types::{ExecutionReport, Side};

// ─────────────────────────────────────────────────────────
// Reservations
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Reservation {
    pub order_key: String,
    pub asset: String,
    pub amount: Decimal,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl Reservation {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ExecRecord {
    cum_qty: Decimal,
    cum_quote: Decimal,
    update_id: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShadowStats {
    pub reserves_ok: u64,
    pub reserves_failed: u64,
    pub releases: u64,
    pub expired: u64,
    pub exec_applied: u64,
    pub exec_duplicates: u64,
    pub exec_negative_delta: u64,
    pub audits: u64,
    pub repairs: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AssetAudit {
    pub asset: String,
    pub exchange_free: Decimal,
    pub reserved: Decimal,
    pub shadow_available: Decimal,
    pub diff: Decimal,
    pub consistent: bool,
}

#[derive(Debug)]
struct ShadowInner {
    /// Last exchange snapshot, `(free, locked)` per asset.
    actual: HashMap<String, (Decimal, Decimal)>,
    reservations: HashMap<String, Reservation>,
    exec_records: HashMap<String, ExecRecord>,
    last_sync: Option<Instant>,
    stats: ShadowStats,
}

#[derive(Debug)]
pub struct ShadowBalance {
    clock: Arc<Clock>,
    ledger: Arc<EventLedger>,
    base_asset: String,
    quote_asset: String,
    reserve_factor: Decimal,
    default_ttl: Duration,
    sync_interval: Duration,
    inner: Mutex<ShadowInner>,
}

impl ShadowBalance {
    pub fn new(cfg: &SsotConfig, base: &str, quote: &str, ledger: Arc<EventLedger>, clock: Arc<Clock>) -> Self {
        Self {
            clock,
            ledger,
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            reserve_factor: cfg.reserve_factor,
            default_ttl: Duration::from_secs(cfg.reservation_ttl_sec),
            sync_interval: Duration::from_secs(cfg.sync_interval_sec),
            inner: Mutex::new(ShadowInner {
                actual: HashMap::new(),
                reservations: HashMap::new(),
                exec_records: HashMap::new(),
                last_sync: None,
                stats: ShadowStats::default(),
            }),
        }
    }

    // ── Snapshot sync ──

    /// Feed an exchange balance snapshot through to the ledger and remember
    /// it as the repair baseline. Returns true when the ledger was clean.
    pub fn sync_actual_balance(&self, snapshot: &HashMap<String, (Decimal, Decimal)>) -> bool {
        let clean = self.ledger.sync_exchange_balances(snapshot);
        let mut g = self.inner.lock().unwrap();
        for (asset, v) in snapshot {
            g.actual.insert(asset.clone(), *v);
        }
        g.last_sync = Some(self.clock.now());
        clean
    }

    // ── Availability ──

    /// Ledger availability minus live reservations. Returns zero when the
    /// last snapshot sync is too old to trust (safe mode).
    pub fn free_available(&self, asset: &str) -> Decimal {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        Self::sweep_expired(&mut g, now);

        match g.last_sync {
            Some(t) if now.duration_since(t) <= self.sync_interval * 2 => {}
            _ => {
                debug!("[shadow] stale balance sync, reporting zero for {asset}");
                return Decimal::ZERO;
            }
        }

        let reserved: Decimal = g
            .reservations
            .values()
            .filter(|r| r.asset == asset)
            .map(|r| r.amount)
            .sum();
        (self.ledger.available(asset) - reserved).max(Decimal::ZERO)
    }

    pub fn reserved(&self, asset: &str) -> Decimal {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        Self::sweep_expired(&mut g, now);
        g.reservations
            .values()
            .filter(|r| r.asset == asset)
            .map(|r| r.amount)
            .sum()
    }

    // ── Reserve / release ──

    /// Reserve funding for one outbound order. The recorded amount is
    /// over-provisioned by the reserve factor. Fails without side effects
    /// when availability is short.
    pub fn reserve(&self, order_key: &str, asset: &str, amount: Decimal, ttl: Option<Duration>) -> bool {
        if amount <= Decimal::ZERO {
            return false;
        }
        let now = self.clock.now();
        let required = amount * self.reserve_factor;
        let available = self.free_available(asset);

        let mut g = self.inner.lock().unwrap();
        if available < required {
            g.stats.reserves_failed += 1;
            debug!(
                "[shadow] reserve failed {order_key}: need {required} {asset}, available {available}"
            );
            return false;
        }
        // Re-reserving the same key replaces the old reservation.
        g.reservations.insert(
            order_key.to_string(),
            Reservation {
                order_key: order_key.to_string(),
                asset: asset.to_string(),
                amount: required,
                created_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
        g.stats.reserves_ok += 1;
        true
    }

    /// Idempotent release. Returns true only when a live reservation was
    /// actually removed.
    pub fn release(&self, order_key: &str, reason: &str) -> bool {
        let mut g = self.inner.lock().unwrap();
        match g.reservations.remove(order_key) {
            Some(r) => {
                g.stats.releases += 1;
                debug!("[shadow] released {} {} for {order_key} ({reason})", r.amount, r.asset);
                true
            }
            None => false,
        }
    }

    fn sweep_expired(g: &mut ShadowInner, now: Instant) {
        let expired: Vec<String> = g
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.order_key.clone())
            .collect();
        for key in expired {
            g.reservations.remove(&key);
            g.stats.expired += 1;
            debug!("[shadow] reservation expired: {key}");
        }
    }

    // ── Execution reports ──

    /// Apply one normalized execution report. Returns true when it changed
    /// state; duplicates and out-of-order reports are no-ops.
    pub fn on_execution_report(&self, report: &ExecutionReport) -> bool {
        let (qty_delta, quote_delta) = {
            let mut g = self.inner.lock().unwrap();
            let last = g.exec_records.get(&report.order_id).copied().unwrap_or_default();
            if last.update_id >= report.update_id && last.update_id != 0 {
                g.stats.exec_duplicates += 1;
                debug!(
                    "[shadow] duplicate report order={} update_id={}",
                    report.order_id, report.update_id
                );
                return false;
            }

            let qty_delta = report.cum_qty - last.cum_qty;
            let quote_delta = report.cum_quote - last.cum_quote;
            if qty_delta < Decimal::ZERO || quote_delta < Decimal::ZERO {
                g.stats.exec_negative_delta += 1;
                warn!(
                    "[shadow] negative delta rejected order={} dq={qty_delta} dquote={quote_delta}",
                    report.order_id
                );
                return false;
            }

            g.exec_records.insert(
                report.order_id.clone(),
                ExecRecord {
                    cum_qty: report.cum_qty,
                    cum_quote: report.cum_quote,
                    update_id: report.update_id,
                },
            );
            g.stats.exec_applied += 1;
            (qty_delta, quote_delta)
        };

        if qty_delta > Decimal::ZERO {
            // Record the fill in the ledger; the event id is derived from the
            // update id so a ledger-level replay stays deduplicated too.
            let price = quote_delta / qty_delta;
            let ev = OrderEvent {
                event_id: format!("TRADE-{}-{}", report.order_id, report.update_id),
                kind: EventKind::Trade,
                ts_ms: report.ts_ms,
                order_id: report.order_id.clone(),
                side: Some(report.side),
                asset: match report.side {
                    Side::Buy => self.base_asset.clone(),
                    Side::Sell => self.quote_asset.clone(),
                },
                amount: qty_delta,
                price: Some(price),
                fee: report.fee,
                fee_asset: report.fee_asset.clone(),
                locked: None,
            };
            self.ledger.add_event(ev);

            // Mirror the delta onto the snapshot baseline so audits between
            // syncs compare against a current picture.
            let mut g = self.inner.lock().unwrap();
            match report.side {
                Side::Buy => {
                    let q = g.actual.entry(self.quote_asset.clone()).or_default();
                    q.0 = (q.0 - quote_delta).max(Decimal::ZERO);
                    let b = g.actual.entry(self.base_asset.clone()).or_default();
                    b.0 += qty_delta;
                }
                Side::Sell => {
                    let b = g.actual.entry(self.base_asset.clone()).or_default();
                    b.0 = (b.0 - qty_delta).max(Decimal::ZERO);
                    let q = g.actual.entry(self.quote_asset.clone()).or_default();
                    q.0 += quote_delta;
                }
            }
            if let (Some(fee), Some(fee_asset)) = (report.fee, report.fee_asset.as_ref()) {
                let f = g.actual.entry(fee_asset.clone()).or_default();
                f.0 = (f.0 - fee).max(Decimal::ZERO);
            }
        }

        if report.status.is_terminal() {
            self.finalize_order(report);
        }
        true
    }

    /// Terminal-status cleanup: release any residual ledger lock, drop the
    /// cumulative record, release the reservation keyed by client order id.
    fn finalize_order(&self, report: &ExecutionReport) {
        use crate::types::OrderStatus::*;
        if matches!(report.status, Canceled | Expired | Rejected) {
            let ev = OrderEvent {
                event_id: format!("CANCELED-{}-{}", report.order_id, report.update_id),
                kind: EventKind::Canceled,
                ts_ms: report.ts_ms,
                order_id: report.order_id.clone(),
                side: Some(report.side),
                asset: match report.side {
                    Side::Buy => self.quote_asset.clone(),
                    Side::Sell => self.base_asset.clone(),
                },
                amount: Decimal::ZERO,
                price: None,
                fee: None,
                fee_asset: None,
                locked: None,
            };
            self.ledger.add_event(ev);
        }

        let mut g = self.inner.lock().unwrap();
        g.exec_records.remove(&report.order_id);
        drop(g);

        if !report.client_order_id.is_empty() {
            self.release(&report.client_order_id, report.status.as_str());
        }
        info!(
            "[shadow] finalized order={} status={} cum_qty={}",
            report.order_id,
            report.status.as_str(),
            report.cum_qty
        );
    }

    // ── Three-way audit ──

    /// Compare exchange free, live reservations, and derived availability
    /// per asset. Any absolute inconsistency above 0.01 triggers a repair:
    /// the ledger is reset to the exchange baseline and shadow recomputes.
    pub fn three_way_audit(&self) -> Vec<AssetAudit> {
        let tolerance = dec!(0.01);
        let mut out = Vec::new();
        let assets = [self.quote_asset.clone(), self.base_asset.clone()];

        let baseline = {
            let mut g = self.inner.lock().unwrap();
            g.stats.audits += 1;
            g.actual.clone()
        };

        let mut repair_needed = false;
        for asset in &assets {
            let (exchange_free, _locked) = baseline.get(asset).copied().unwrap_or_default();
            let reserved = self.reserved(asset);
            let shadow_available = self.free_available(asset);
            let theoretical = (exchange_free - reserved).max(Decimal::ZERO);
            let diff = (shadow_available - theoretical).abs();
            let consistent = diff <= tolerance;
            if !consistent {
                repair_needed = true;
                warn!(
                    "[shadow] audit mismatch {asset}: shadow={shadow_available} theoretical={theoretical}"
                );
            }
            out.push(AssetAudit {
                asset: asset.clone(),
                exchange_free,
                reserved,
                shadow_available,
                diff,
                consistent,
            });
        }

        if repair_needed {
            self.ssot_repair(&baseline);
        }
        out
    }

    /// Exchange wins: reset the ledger to the last exchange baseline. The
    /// derived availability self-corrects after that.
    fn ssot_repair(&self, baseline: &HashMap<String, (Decimal, Decimal)>) {
        warn!("[shadow] SSOT-REPAIR: resetting ledger to exchange baseline");
        self.ledger.force_reconcile_to(baseline);
        let mut g = self.inner.lock().unwrap();
        g.stats.repairs += 1;
    }

    // ── Introspection ──

    pub fn stats(&self) -> ShadowStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn reservation_count(&self) -> usize {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        Self::sweep_expired(&mut g, now);
        g.reservations.len()
    }

    pub fn summary(&self) -> String {
        let quote = self.quote_asset.clone();
        let base = self.base_asset.clone();
        format!(
            "shadow=[{}({:.0}+{:.0}),{}({:.0}+{:.0})] reserves={}",
            quote,
            self.free_available(&quote),
            self.reserved(&quote),
            base,
            self.free_available(&base),
            self.reserved(&base),
            self.reservation_count()
        )
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
