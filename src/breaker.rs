//! Risk breaker — rule-based process-level circuit.
//!
//! Reads rolling observations (equity, placement decisions, utilization)
//! plus the AWG error log and trips a process-wide circuit on any rule:
//! placements are denied while open, cancels stay allowed. Reset is manual —
//! an automatic re-open after a real drawdown is exactly the failure mode
//! this exists to prevent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStatus {
    pub open: bool,
    pub reason: Option<String>,
    pub drawdown_1h_pct: f64,
    pub reject_rate: f64,
    pub trips: u64,
}

#[derive(Debug)]
struct Inner {
    open: bool,
    reason: Option<String>,
    trips: u64,
    /// (ts, equity) samples over the last hour.
    equity: VecDeque<(Instant, f64)>,
    /// (ts, rejected) placement decisions over the last 60s.
    decisions: VecDeque<(Instant, bool)>,
    under_util_since: Option<Instant>,
}

#[derive(Debug)]
pub struct RiskBreaker {
    clock: Arc<Clock>,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl RiskBreaker {
    pub fn new(cfg: BreakerConfig, clock: Arc<Clock>) -> Self {
        Self {
            clock,
            cfg,
            inner: Mutex::new(Inner {
                open: false,
                reason: None,
                trips: 0,
                equity: VecDeque::new(),
                decisions: VecDeque::new(),
                under_util_since: None,
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    /// Manual reset, the only way back to closed.
    pub fn reset(&self) {
        let mut g = self.inner.lock().unwrap();
        if g.open {
            info!("[breaker] manual reset");
        }
        g.open = false;
        g.reason = None;
        g.under_util_since = None;
    }

    pub fn record_equity(&self, equity: f64) {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        g.equity.push_back((now, equity));
        while let Some(&(ts, _)) = g.equity.front() {
            if now.duration_since(ts) > Duration::from_secs(3600) {
                g.equity.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_decision(&self, rejected: bool) {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        g.decisions.push_back((now, rejected));
        while let Some(&(ts, _)) = g.decisions.front() {
            if now.duration_since(ts) > Duration::from_secs(60) {
                g.decisions.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_util(&self, util: f64, trading_ready: bool) {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        if trading_ready && util < self.cfg.under_util {
            if g.under_util_since.is_none() {
                g.under_util_since = Some(now);
            }
        } else {
            g.under_util_since = None;
        }
    }

    fn drawdown_pct(g: &Inner) -> f64 {
        let peak = g.equity.iter().map(|&(_, e)| e).fold(f64::MIN, f64::max);
        let last = g.equity.back().map(|&(_, e)| e);
        match last {
            Some(last) if peak > 0.0 => ((peak - last) / peak * 100.0).max(0.0),
            _ => 0.0,
        }
    }

    fn reject_rate(g: &Inner) -> f64 {
        if g.decisions.is_empty() {
            return 0.0;
        }
        let rejected = g.decisions.iter().filter(|&&(_, r)| r).count();
        rejected as f64 / g.decisions.len() as f64
    }

    /// Evaluate every rule. `api_errors_60s` comes from the AWG error log.
    /// Returns the trip reason when a rule fired this call.
    pub fn evaluate(&self, api_errors_60s: u64) -> Option<String> {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        if g.open {
            return None;
        }

        let drawdown = Self::drawdown_pct(&g);
        let reject_rate = Self::reject_rate(&g);

        let reason = if drawdown > self.cfg.drawdown_pct {
            Some(format!("drawdown_1h {drawdown:.2}% > {:.2}%", self.cfg.drawdown_pct))
        } else if api_errors_60s > self.cfg.errors_60s {
            Some(format!("api_errors_60s {api_errors_60s} > {}", self.cfg.errors_60s))
        } else if g.decisions.len() >= 10 && reject_rate > self.cfg.reject_rate {
            Some(format!(
                "reject_rate {:.0}% > {:.0}%",
                reject_rate * 100.0,
                self.cfg.reject_rate * 100.0
            ))
        } else if let Some(since) = g.under_util_since {
            if now.duration_since(since) > Duration::from_secs(self.cfg.under_util_sec) {
                Some(format!(
                    "under-utilization below {:.0}% for {}s",
                    self.cfg.under_util * 100.0,
                    self.cfg.under_util_sec
                ))
            } else {
                None
            }
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!("[breaker] circuit OPEN: {reason}");
            g.open = true;
            g.trips += 1;
            g.reason = Some(reason.clone());
            return Some(reason);
        }
        None
    }

    pub fn status(&self) -> BreakerStatus {
        let g = self.inner.lock().unwrap();
        BreakerStatus {
            open: g.open,
            reason: g.reason.clone(),
            drawdown_1h_pct: Self::drawdown_pct(&g),
            reject_rate: Self::reject_rate(&g),
            trips: g.trips,
        }
    }
}
