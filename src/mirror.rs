//! Order Mirror — hash-gated differential reconciliation of the open-order
//! set against exchange REST snapshots.
//!
//! The user stream is the fast path; the mirror is the safety net that
//! catches anything the stream missed. A stable hash over
//! `(order_id, status, filled_qty)` gates the work: an unchanged remote set
//! reconciles to a no-op. The mirror never opens orders — full syncs can
//! only add missing locals, remove vanished ones (reported to the caller so
//! DLE can run its closure routine), and update the rest.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::MirrorConfig;
use crate::exchange::OpenOrder;
use crate::types::{ExecutionReport, OrderStatus, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub filled_qty: Decimal,
    pub status: OrderStatus,
    pub update_ts_ms: u64,
}

impl MirrorOrder {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Skipped,
    Incremental,
    Full,
}

/// Outcome of one reconciliation pass. `closed` lists orders that vanished
/// remotely or turned terminal — the engine feeds them to DLE closure.
#[derive(Debug)]
pub struct SyncReport {
    pub kind: SyncKind,
    pub changes: usize,
    pub closed: Vec<(String, Decimal)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorStats {
    pub syncs: u64,
    pub full_syncs: u64,
    pub incremental_syncs: u64,
    pub skipped: u64,
    pub orders_added: u64,
    pub orders_removed: u64,
    pub orders_updated: u64,
}

#[derive(Debug)]
struct Inner {
    orders: HashMap<String, MirrorOrder>,
    client_id_map: HashMap<String, String>,
    last_sync: Option<Instant>,
    last_hash: Option<u64>,
    force_full: bool,
    stats: MirrorStats,
}

pub struct OrderMirror {
    clock: Arc<Clock>,
    sync_interval: Duration,
    persist_path: PathBuf,
    inner: Mutex<Inner>,
}

impl OrderMirror {
    pub fn new(cfg: &MirrorConfig, clock: Arc<Clock>) -> Self {
        Self {
            clock,
            sync_interval: Duration::from_secs(cfg.sync_interval_sec),
            persist_path: PathBuf::from(&cfg.persist_path),
            inner: Mutex::new(Inner {
                orders: HashMap::new(),
                client_id_map: HashMap::new(),
                last_sync: None,
                last_hash: None,
                force_full: false,
                stats: MirrorStats::default(),
            }),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    /// Age of the last completed reconciliation.
    pub fn staleness(&self) -> Option<Duration> {
        let g = self.inner.lock().unwrap();
        g.last_sync.map(|t| self.clock.now().duration_since(t))
    }

    pub fn force_next_full(&self) {
        self.inner.lock().unwrap().force_full = true;
    }

    // ── Stream-driven entry points ──

    /// Upsert from a user-stream execution report.
    pub fn upsert_from_event(&self, report: &ExecutionReport) {
        let mut guard = self.inner.lock().unwrap();
        let g = &mut *guard;
        match g.orders.get_mut(&report.order_id) {
            Some(order) => {
                // Terminal states are sticky against late stream replays.
                if order.status.is_terminal() {
                    return;
                }
                order.status = report.status;
                order.filled_qty = report.cum_qty;
                order.update_ts_ms = report.ts_ms;
                g.stats.orders_updated += 1;
            }
            None => {
                let order = MirrorOrder {
                    order_id: report.order_id.clone(),
                    client_order_id: report.client_order_id.clone(),
                    side: report.side,
                    price: report.price,
                    orig_qty: report.orig_qty,
                    filled_qty: report.cum_qty,
                    status: report.status,
                    update_ts_ms: report.ts_ms,
                };
                g.client_id_map
                    .insert(order.client_order_id.clone(), order.order_id.clone());
                g.orders.insert(order.order_id.clone(), order);
                g.stats.orders_added += 1;
            }
        }
    }

    /// Drop a terminal order observed on the stream.
    pub fn close_from_event(&self, order_id: &str) {
        let mut g = self.inner.lock().unwrap();
        if let Some(order) = g.orders.remove(order_id) {
            g.client_id_map.remove(&order.client_order_id);
            g.stats.orders_removed += 1;
            debug!("[mirror] closed from event: {order_id}");
        }
    }

    /// Upsert from a REST snapshot row (seed path).
    pub fn upsert_from_rest(&self, order: &OpenOrder) {
        let mut g = self.inner.lock().unwrap();
        let entry = MirrorOrder {
            order_id: order.order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            price: order.price,
            orig_qty: order.orig_qty,
            filled_qty: order.executed_qty,
            status: order.status,
            update_ts_ms: order.update_time_ms,
        };
        if g.orders.insert(order.order_id.clone(), entry).is_none() {
            g.stats.orders_added += 1;
        } else {
            g.stats.orders_updated += 1;
        }
        g.client_id_map
            .insert(order.client_order_id.clone(), order.order_id.clone());
    }

    pub fn active_order_ids(&self) -> Vec<String> {
        let g = self.inner.lock().unwrap();
        g.orders
            .values()
            .filter(|o| o.is_active())
            .map(|o| o.order_id.clone())
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<MirrorOrder> {
        self.inner.lock().unwrap().orders.get(order_id).cloned()
    }

    // ── Reconciliation ──

    fn state_hash(remote: &[OpenOrder]) -> u64 {
        let mut rows: Vec<(&str, &str, String)> = remote
            .iter()
            .map(|o| (o.order_id.as_str(), o.status.as_str(), o.executed_qty.normalize().to_string()))
            .collect();
        rows.sort();
        let mut h = DefaultHasher::new();
        rows.hash(&mut h);
        h.finish()
    }

    /// Reconcile against a fetched snapshot. The caller owns the REST call
    /// (and its AWG admission); this is pure state-machine work.
    pub fn reconcile(&self, remote: &[OpenOrder]) -> SyncReport {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();

        let remote_hash = Self::state_hash(remote);
        let force = std::mem::take(&mut g.force_full);

        if !force && g.last_hash == Some(remote_hash) {
            g.stats.skipped += 1;
            g.last_sync = Some(now);
            return SyncReport {
                kind: SyncKind::Skipped,
                changes: 0,
                closed: Vec::new(),
            };
        }

        let stale = match g.last_sync {
            Some(t) => now.duration_since(t) > self.sync_interval * 10,
            None => true,
        };
        let full = force || stale || g.last_hash.is_none();

        let report = if full {
            g.stats.full_syncs += 1;
            Self::full_sync(&mut g, remote)
        } else {
            g.stats.incremental_syncs += 1;
            Self::incremental_sync(&mut g, remote)
        };

        g.last_sync = Some(now);
        g.last_hash = Some(remote_hash);
        g.stats.syncs += 1;
        debug!(
            "[mirror] sync kind={:?} changes={} closed={}",
            report.kind,
            report.changes,
            report.closed.len()
        );
        report
    }

    fn full_sync(g: &mut Inner, remote: &[OpenOrder]) -> SyncReport {
        let remote_map: HashMap<&str, &OpenOrder> =
            remote.iter().map(|o| (o.order_id.as_str(), o)).collect();
        let mut changes = 0usize;
        let mut closed = Vec::new();

        // Locals that vanished remotely are closed.
        let gone: Vec<String> = g
            .orders
            .keys()
            .filter(|id| !remote_map.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(order) = g.orders.remove(&id) {
                g.client_id_map.remove(&order.client_order_id);
                g.stats.orders_removed += 1;
                closed.push((id, order.price));
                changes += 1;
            }
        }

        // Remote rows update or add.
        for (id, ro) in remote_map {
            match g.orders.get_mut(id) {
                Some(local) => {
                    if local.status != ro.status || local.filled_qty != ro.executed_qty {
                        let was_active = local.is_active();
                        local.status = ro.status;
                        local.filled_qty = ro.executed_qty;
                        local.update_ts_ms = ro.update_time_ms;
                        g.stats.orders_updated += 1;
                        changes += 1;
                        if was_active && !ro.status.is_active() {
                            closed.push((id.to_string(), ro.price));
                        }
                    }
                }
                None => {
                    // An order the stream never showed us (manual or missed).
                    warn!("[mirror] adopting unknown remote order {id}");
                    g.orders.insert(
                        id.to_string(),
                        MirrorOrder {
                            order_id: ro.order_id.clone(),
                            client_order_id: ro.client_order_id.clone(),
                            side: ro.side,
                            price: ro.price,
                            orig_qty: ro.orig_qty,
                            filled_qty: ro.executed_qty,
                            status: ro.status,
                            update_ts_ms: ro.update_time_ms,
                        },
                    );
                    g.client_id_map
                        .insert(ro.client_order_id.clone(), ro.order_id.clone());
                    g.stats.orders_added += 1;
                    changes += 1;
                }
            }
        }

        SyncReport {
            kind: SyncKind::Full,
            changes,
            closed,
        }
    }

    fn incremental_sync(g: &mut Inner, remote: &[OpenOrder]) -> SyncReport {
        let remote_map: HashMap<&str, &OpenOrder> =
            remote.iter().map(|o| (o.order_id.as_str(), o)).collect();
        let mut changes = 0usize;
        let mut closed = Vec::new();

        let ids: Vec<String> = g.orders.keys().cloned().collect();
        for id in ids {
            if let Some(ro) = remote_map.get(id.as_str()) {
                let local = g.orders.get_mut(&id).unwrap();
                if local.status != ro.status || local.filled_qty != ro.executed_qty {
                    let was_active = local.is_active();
                    local.status = ro.status;
                    local.filled_qty = ro.executed_qty;
                    local.update_ts_ms = ro.update_time_ms;
                    g.stats.orders_updated += 1;
                    changes += 1;
                    if was_active && !ro.status.is_active() {
                        closed.push((id.clone(), ro.price));
                    }
                }
            }
        }

        SyncReport {
            kind: SyncKind::Incremental,
            changes,
            closed,
        }
    }

    // ── Persistence ──

    pub fn save(&self) -> anyhow::Result<()> {
        let g = self.inner.lock().unwrap();
        let doc = PersistedMirror {
            timestamp: chrono::Utc::now().to_rfc3339(),
            last_sync_hash: g.last_hash,
            orders: g.orders.values().cloned().collect(),
        };
        drop(g);
        crate::persist::write_atomic(&self.persist_path, &doc)
    }

    pub fn load(&self) -> anyhow::Result<usize> {
        let doc: PersistedMirror = crate::persist::read_json(&self.persist_path)?;
        let mut g = self.inner.lock().unwrap();
        g.orders = doc
            .orders
            .into_iter()
            .map(|o| (o.order_id.clone(), o))
            .collect();
        g.client_id_map = g
            .orders
            .values()
            .map(|o| (o.client_order_id.clone(), o.order_id.clone()))
            .collect();
        // Restored state is unverified: next pass reconciles in full.
        g.last_hash = None;
        g.force_full = true;
        info!("[mirror] restored {} orders from disk", g.orders.len());
        Ok(g.orders.len())
    }

    pub fn stats(&self) -> MirrorStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn summary(&self) -> String {
        let g = self.inner.lock().unwrap();
        let active = g.orders.values().filter(|o| o.is_active()).count();
        format!(
            "mirror(orders={}/{} skipped={})",
            active,
            g.orders.len(),
            g.stats.skipped
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMirror {
    timestamp: String,
    last_sync_hash: Option<u64>,
    orders: Vec<MirrorOrder>,
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make() -> (Arc<Clock>, OrderMirror) {
        let clock = Arc::new(Clock::manual());
        let mirror = OrderMirror::new(&MirrorConfig::default(), clock.clone());
        (clock, mirror)
    }

    fn remote(id: &str, status: OrderStatus, filled: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            client_order_id: format!("c-{id}"),
            side: Side::Buy,
            price: dec!(0.24),
            orig_qty: dec!(100),
            executed_qty: filled,
            status,
            update_time_ms: 0,
        }
    }

    #[test]
    fn test_first_sync_is_full_and_adopts_remote() {
        let (_c, mirror) = make();
        let report = mirror.reconcile(&[remote("1", OrderStatus::New, dec!(0))]);
        assert_eq!(report.kind, SyncKind::Full);
        assert_eq!(report.changes, 1);
        assert!(mirror.order("1").is_some());
    }

    #[test]
    fn test_unchanged_hash_skips() {
        let (_c, mirror) = make();
        let snapshot = vec![remote("1", OrderStatus::New, dec!(0))];
        mirror.reconcile(&snapshot);
        let report = mirror.reconcile(&snapshot);
        assert_eq!(report.kind, SyncKind::Skipped);
        assert_eq!(mirror.stats().skipped, 1);
    }

    #[test]
    fn test_incremental_reflects_fill_delta() {
        let (_c, mirror) = make();
        mirror.reconcile(&[remote("1", OrderStatus::New, dec!(0))]);
        let report = mirror.reconcile(&[remote("1", OrderStatus::PartiallyFilled, dec!(40))]);
        assert_eq!(report.kind, SyncKind::Incremental);
        assert_eq!(mirror.order("1").unwrap().filled_qty, dec!(40));
    }

    #[test]
    fn test_full_sync_reports_vanished_orders() {
        let (clock, mirror) = make();
        mirror.reconcile(&[remote("1", OrderStatus::New, dec!(0)), remote("2", OrderStatus::New, dec!(0))]);
        // Past 10× the interval, the next pass is a full sync.
        clock.advance(Duration::from_secs(601));
        let report = mirror.reconcile(&[remote("2", OrderStatus::New, dec!(0))]);
        assert_eq!(report.kind, SyncKind::Full);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].0, "1");
        assert!(mirror.order("1").is_none());
    }

    #[test]
    fn test_stream_terminal_is_sticky() {
        let (_c, mirror) = make();
        let report = ExecutionReport {
            order_id: "9".into(),
            client_order_id: "c-9".into(),
            update_id: 3,
            side: Side::Sell,
            status: OrderStatus::Filled,
            price: dec!(0.24),
            orig_qty: dec!(100),
            cum_qty: dec!(100),
            cum_quote: dec!(24),
            last_qty: dec!(100),
            last_price: dec!(0.24),
            fee: None,
            fee_asset: None,
            trade_id: 1,
            ts_ms: 5,
        };
        mirror.upsert_from_event(&report);
        let mut late = report.clone();
        late.status = OrderStatus::PartiallyFilled;
        late.cum_qty = dec!(40);
        mirror.upsert_from_event(&late);
        assert_eq!(mirror.order("9").unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_staleness_tracks_clock() {
        let (clock, mirror) = make();
        assert!(mirror.staleness().is_none());
        mirror.reconcile(&[]);
        clock.advance(Duration::from_secs(12));
        assert_eq!(mirror.staleness().unwrap(), Duration::from_secs(12));
    }

    #[test]
    fn test_persistence_round_trip_forces_full() {
        let (_c, mirror) = make();
        mirror.reconcile(&[remote("1", OrderStatus::New, dec!(0))]);
        let path = std::env::temp_dir().join(format!("mirror-test-{}.json", std::process::id()));
        let cfg = MirrorConfig {
            persist_path: path.to_string_lossy().to_string(),
            ..MirrorConfig::default()
        };
        let mirror = OrderMirror::new(&cfg, Arc::new(Clock::manual()));
        mirror.reconcile(&[remote("1", OrderStatus::New, dec!(0))]);
        mirror.save().unwrap();

        let restored = OrderMirror::new(&cfg, Arc::new(Clock::manual()));
        assert_eq!(restored.load().unwrap(), 1);
        let report = restored.reconcile(&[remote("1", OrderStatus::New, dec!(0))]);
        assert_eq!(report.kind, SyncKind::Full);
        let _ = std::fs::remove_file(path);
    }
}
