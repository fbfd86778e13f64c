//! API Weight Governor — admission control for every outbound exchange call.
//!
//! Three rolling windows (1 s / 10 s / 60 s) of weight usage, per-channel
//! 10-second sub-budgets, a rolling 60-second taker-notional (POV) window,
//! and a circuit-breaker state machine driven by upstream rate-limit errors.
//!
//! The governor is a synchronous state machine behind one lock: no awaits,
//! callable from any task. Denied admission is a normal outcome — callers
//! skip or back off, they never retry in a loop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AwgConfig;

/// Error codes that feed the circuit breaker (IP ban, request-rate,
/// order-rate, timestamp drift).
const CRITICAL_ERRORS: [i64; 5] = [-1003, 429, 418, -1021, -1015];

/// Endpoints denied outright while the circuit is open.
const EXPENSIVE_ENDPOINTS: [&str; 3] = ["openOrders", "account", "exchangeInfo"];

// ─────────────────────────────────────────────────────────
// Circuit state machine
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Normal,
    Throttled,
    Degraded,
    CircuitOpen,
    Recovering,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Normal => "NORMAL",
            CircuitState::Throttled => "THROTTLED",
            CircuitState::Degraded => "DEGRADED",
            CircuitState::CircuitOpen => "CIRCUIT_OPEN",
            CircuitState::Recovering => "RECOVERING",
        }
    }

    /// Legal transitions. Skipping states is rejected.
    fn can_transition_to(&self, next: CircuitState) -> bool {
        use CircuitState::*;
        match self {
            Normal => matches!(next, Throttled),
            Throttled => matches!(next, Degraded | Normal),
            Degraded => matches!(next, CircuitOpen | Throttled),
            CircuitOpen => matches!(next, Recovering),
            Recovering => matches!(next, Normal | Throttled),
        }
    }

    /// One demotion step under sustained errors.
    fn demoted(&self) -> Option<CircuitState> {
        use CircuitState::*;
        match self {
            Normal => Some(Throttled),
            Throttled => Some(Degraded),
            Degraded => Some(CircuitOpen),
            Recovering => Some(Throttled),
            CircuitOpen => None,
        }
    }

    /// One promotion step toward NORMAL after clean traffic.
    fn promoted(&self) -> Option<CircuitState> {
        use CircuitState::*;
        match self {
            Throttled => Some(Normal),
            Degraded => Some(Throttled),
            Recovering => Some(Normal),
            Normal | CircuitOpen => None,
        }
    }
}

/// Call channels with independent 10-second sub-budgets. The `mm_*` channels
/// carry regular quoting flow, the `rb_*` channels carry rebalancer flow on a
/// guaranteed separate allowance, `ttl_cancel` covers expiry cancels and
/// `userDataStream` covers listen-key upkeep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    MmNew,
    MmCancel,
    MmReplace,
    RbNew,
    RbCancel,
    RbReplace,
    TtlCancel,
    UserDataStream,
    /// Book polls, account snapshots, mirror reconciliation.
    System,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::MmNew => "mm_new",
            Channel::MmCancel => "mm_cancel",
            Channel::MmReplace => "mm_replace",
            Channel::RbNew => "rb_new",
            Channel::RbCancel => "rb_cancel",
            Channel::RbReplace => "rb_replace",
            Channel::TtlCancel => "ttl_cancel",
            Channel::UserDataStream => "userDataStream",
            Channel::System => "system",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Buckets
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct WindowBucket {
    window: Duration,
    cap: u32,
    used: VecDeque<(Instant, u32)>,
}

impl WindowBucket {
    fn new(window: Duration, cap: u32) -> Self {
        Self {
            window,
            cap,
            used: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, _)) = self.used.front() {
            if now.duration_since(ts) > self.window {
                self.used.pop_front();
            } else {
                break;
            }
        }
    }

    fn used_total(&mut self, now: Instant) -> u32 {
        self.evict(now);
        self.used.iter().map(|&(_, c)| c).sum()
    }
}

#[derive(Debug)]
struct ChannelBucket {
    budget: u32,
    burst: u32,
    used: VecDeque<(Instant, u32)>,
}

impl ChannelBucket {
    fn used_total(&mut self, now: Instant) -> u32 {
        while let Some(&(ts, _)) = self.used.front() {
            if now.duration_since(ts) > Duration::from_secs(10) {
                self.used.pop_front();
            } else {
                break;
            }
        }
        self.used.iter().map(|&(_, c)| c).sum()
    }
}

// ─────────────────────────────────────────────────────────
// Status snapshot
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct AwgStatus {
    pub state: String,
    pub consecutive_errors: u32,
    pub time_in_state_sec: u64,
    pub usage_pct_1s: f64,
    pub usage_pct_10s: f64,
    pub usage_pct_1m: f64,
    pub channel_used_10s: HashMap<String, u32>,
    pub errors_60s: u64,
    pub pov_used: Decimal,
    pub approved: u64,
    pub denied: u64,
}

// ─────────────────────────────────────────────────────────
// Governor
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Inner {
    windows: [WindowBucket; 3],
    channels: HashMap<Channel, ChannelBucket>,
    costs: HashMap<&'static str, u32>,
    state: CircuitState,
    consecutive_errors: u32,
    last_state_change: Instant,
    error_threshold: u32,
    recovery_period: Duration,
    throttle_factor: f64,
    degrade_factor: f64,
    pov_max: Decimal,
    pov_used: VecDeque<(Instant, Decimal)>,
    api_errors: VecDeque<(Instant, i64)>,
    approved: u64,
    denied: u64,
    circuit_trips: u64,
}

#[derive(Debug)]
pub struct ApiWeightGovernor {
    clock: Arc<Clock>,
    inner: Mutex<Inner>,
}

impl ApiWeightGovernor {
    pub fn new(cfg: &AwgConfig, clock: Arc<Clock>) -> Self {
        let now = clock.now();

        let mut channels = HashMap::new();
        let mut add = |ch: Channel, (budget, burst): (u32, u32)| {
            channels.insert(
                ch,
                ChannelBucket {
                    budget,
                    burst: burst.max(budget),
                    used: VecDeque::new(),
                },
            );
        };
        add(Channel::MmNew, cfg.fill_budget_10s);
        add(Channel::MmCancel, cfg.cancel_budget_10s);
        add(Channel::MmReplace, cfg.reprice_budget_10s);
        add(Channel::TtlCancel, cfg.ttl_cancel_budget_10s);
        add(Channel::RbNew, cfg.rb_new_budget_10s);
        add(Channel::RbCancel, cfg.rb_cancel_budget_10s);
        add(Channel::RbReplace, cfg.rb_replace_budget_10s);
        // Covers listen-key upkeep (cost 1) and seed snapshots (cost 10).
        add(Channel::UserDataStream, (12, 15));
        add(Channel::System, (64, 80));

        let costs = HashMap::from([
            ("new_order", 1),
            ("cancel", 1),
            ("cancelReplace", 1),
            ("openOrders", 10),
            ("account", 10),
            ("depth", 2),
            ("bookTicker", 2),
            ("exchangeInfo", 20),
            ("userDataStream.create", 1),
            ("userDataStream.keepalive", 1),
            ("userDataStream.close", 1),
        ]);

        Self {
            clock,
            inner: Mutex::new(Inner {
                windows: [
                    WindowBucket::new(Duration::from_secs(1), cfg.cap_1s),
                    WindowBucket::new(Duration::from_secs(10), cfg.cap_10s),
                    WindowBucket::new(Duration::from_secs(60), cfg.cap_1m),
                ],
                channels,
                costs,
                state: CircuitState::Normal,
                consecutive_errors: 0,
                last_state_change: now,
                error_threshold: cfg.error_threshold,
                recovery_period: Duration::from_secs(cfg.recovery_period_sec),
                throttle_factor: cfg.throttle_factor,
                degrade_factor: cfg.degrade_factor,
                pov_max: cfg.pov_notional_max,
                pov_used: VecDeque::new(),
                api_errors: VecDeque::new(),
                approved: 0,
                denied: 0,
                circuit_trips: 0,
            }),
        }
    }

    /// Admit or deny one outbound call. On admission the cost is recorded in
    /// every window bucket and in the channel bucket (and the notional in the
    /// POV window); on denial nothing is recorded.
    pub fn acquire(&self, endpoint: &str, channel: Channel, cost: Option<u32>, notional: Decimal) -> bool {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        let cost = cost.unwrap_or_else(|| *g.costs.get(endpoint).unwrap_or(&1));

        g.maybe_decay(now);

        if g.state == CircuitState::CircuitOpen {
            g.try_recover(now);
            if g.state == CircuitState::CircuitOpen {
                // Only cheap heartbeat endpoints pass while the circuit is
                // open; anything weighty is denied outright.
                if cost >= 5 || EXPENSIVE_ENDPOINTS.contains(&endpoint) {
                    g.denied += 1;
                    debug!("[AWG] CIRCUIT_OPEN deny {endpoint} (cost={cost})");
                    return false;
                }
            }
        }

        // 1. Global windows against state-scaled caps.
        let factor = g.state_factor();
        let window_blocked = g
            .windows
            .iter_mut()
            .any(|w| w.used_total(now) + cost > (w.cap as f64 * factor) as u32);
        if window_blocked {
            g.denied += 1;
            return false;
        }

        // 2. Channel sub-budget: the burst ceiling is hard, the steady
        // budget only marks short exceedances.
        let (over_burst, into_burst) = g
            .channels
            .get_mut(&channel)
            .map(|cb| {
                let used = cb.used_total(now);
                (used + cost > cb.burst, used + cost > cb.budget)
            })
            .unwrap_or((false, false));
        if over_burst {
            g.denied += 1;
            debug!("[AWG] channel {} over budget", channel.as_str());
            return false;
        }
        if into_burst {
            debug!("[AWG] channel {} dipping into burst headroom", channel.as_str());
        }

        // 3. POV notional ceiling.
        if notional > Decimal::ZERO {
            let used = g.pov_used_total(now);
            if used + notional > g.pov_max {
                g.denied += 1;
                debug!("[AWG] POV deny: {used}+{notional} > {}", g.pov_max);
                return false;
            }
        }

        // 4. Record.
        for w in g.windows.iter_mut() {
            w.used.push_back((now, cost));
        }
        if let Some(cb) = g.channels.get_mut(&channel) {
            cb.used.push_back((now, cost));
        }
        if notional > Decimal::ZERO {
            g.pov_used.push_back((now, notional));
        }
        g.approved += 1;

        // Clean traffic after errors steps one level back toward NORMAL.
        if g.consecutive_errors > 0 {
            g.consecutive_errors = 0;
            g.promote(now);
        }

        true
    }

    /// Record an upstream API error. Rate-limit class codes count toward the
    /// circuit breaker; everything lands in the 60-second error log.
    pub fn track_api_error(&self, code: i64, endpoint: &str) {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();

        g.api_errors.push_back((now, code));
        while let Some(&(ts, _)) = g.api_errors.front() {
            if now.duration_since(ts) > Duration::from_secs(60) {
                g.api_errors.pop_front();
            } else {
                break;
            }
        }

        if !CRITICAL_ERRORS.contains(&code) {
            return;
        }

        g.consecutive_errors += 1;
        warn!(
            "[AWG] api error {code} on {endpoint}, consecutive={}",
            g.consecutive_errors
        );
        if g.consecutive_errors >= g.error_threshold {
            if let Some(next) = g.state.demoted() {
                g.transition(next, now);
            }
        }
    }

    /// Count of errors recorded in the last 60 seconds (breaker input).
    pub fn errors_60s(&self) -> u64 {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        while let Some(&(ts, _)) = g.api_errors.front() {
            if now.duration_since(ts) > Duration::from_secs(60) {
                g.api_errors.pop_front();
            } else {
                break;
            }
        }
        g.api_errors.len() as u64
    }

    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        g.try_recover(now);
        g.state
    }

    pub fn status(&self) -> AwgStatus {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        let factor = g.state_factor();

        let mut pct = [0.0f64; 3];
        for (i, w) in g.windows.iter_mut().enumerate() {
            let cap = (w.cap as f64 * factor).max(1.0);
            pct[i] = w.used_total(now) as f64 / cap * 100.0;
        }

        let channel_used_10s = {
            let mut m = HashMap::new();
            for (ch, cb) in g.channels.iter_mut() {
                m.insert(ch.as_str().to_string(), cb.used_total(now));
            }
            m
        };

        let errors_60s = g
            .api_errors
            .iter()
            .filter(|(ts, _)| now.duration_since(*ts) <= Duration::from_secs(60))
            .count() as u64;

        AwgStatus {
            state: g.state.as_str().to_string(),
            consecutive_errors: g.consecutive_errors,
            time_in_state_sec: now.duration_since(g.last_state_change).as_secs(),
            usage_pct_1s: pct[0],
            usage_pct_10s: pct[1],
            usage_pct_1m: pct[2],
            channel_used_10s,
            errors_60s,
            pov_used: g.pov_used_total(now),
            approved: g.approved,
            denied: g.denied,
        }
    }

    /// One-line state summary for the periodic status log.
    pub fn summary(&self) -> String {
        let s = self.status();
        format!(
            "awg[{} 1s={:.0}% 10s={:.0}% 1m={:.0}% errs={} pov={}]",
            s.state, s.usage_pct_1s, s.usage_pct_10s, s.usage_pct_1m, s.errors_60s, s.pov_used
        )
    }

    #[cfg(test)]
    pub fn force_state(&self, state: CircuitState) {
        let now = self.clock.now();
        let mut g = self.inner.lock().unwrap();
        g.state = state;
        g.last_state_change = now;
    }
}

impl Inner {
    fn state_factor(&self) -> f64 {
        match self.state {
            CircuitState::Normal => 1.0,
            CircuitState::Recovering => 0.85,
            CircuitState::Throttled => self.throttle_factor,
            CircuitState::Degraded => self.degrade_factor,
            // Cheap heartbeats that survive the allowlist are checked
            // against unscaled caps.
            CircuitState::CircuitOpen => 1.0,
        }
    }

    fn transition(&mut self, next: CircuitState, now: Instant) {
        if !self.state.can_transition_to(next) {
            warn!(
                "[AWG] illegal transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            );
            return;
        }
        let old = self.state;
        self.state = next;
        self.last_state_change = now;
        if next == CircuitState::CircuitOpen {
            self.circuit_trips += 1;
        }
        info!("[AWG] state {} -> {}", old.as_str(), next.as_str());
    }

    fn try_recover(&mut self, now: Instant) {
        if self.state == CircuitState::CircuitOpen
            && now.duration_since(self.last_state_change) >= self.recovery_period
        {
            self.transition(CircuitState::Recovering, now);
            self.consecutive_errors = 0;
        }
    }

    fn promote(&mut self, now: Instant) {
        if let Some(next) = self.state.promoted() {
            self.transition(next, now);
        }
    }

    /// A full recovery period with no errors steps one level toward NORMAL
    /// even without an explicit error-then-success cycle.
    fn maybe_decay(&mut self, now: Instant) {
        if self.state == CircuitState::Normal || self.state == CircuitState::CircuitOpen {
            return;
        }
        let clean = self
            .api_errors
            .back()
            .map(|&(ts, _)| ts <= self.last_state_change)
            .unwrap_or(true);
        if clean && now.duration_since(self.last_state_change) >= self.recovery_period {
            self.consecutive_errors = 0;
            self.promote(now);
        }
    }

    fn pov_used_total(&mut self, now: Instant) -> Decimal {
        while let Some(&(ts, _)) = self.pov_used.front() {
            if now.duration_since(ts) > Duration::from_secs(60) {
                self.pov_used.pop_front();
            } else {
                break;
            }
        }
        self.pov_used.iter().map(|&(_, n)| n).sum()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make() -> (Arc<Clock>, ApiWeightGovernor) {
        let clock = Arc::new(Clock::manual());
        let cfg = AwgConfig {
            cap_1s: 10,
            cap_10s: 50,
            cap_1m: 200,
            // Keep the quoting channel out of the way for window-level tests.
            fill_budget_10s: (100, 100),
            ..AwgConfig::default()
        };
        let awg = ApiWeightGovernor::new(&cfg, clock.clone());
        (clock, awg)
    }

    #[test]
    fn test_window_cap_enforced_and_evicted() {
        let (clock, awg) = make();
        // cap_1s=10: ten cost-1 calls pass, the eleventh is denied.
        for _ in 0..10 {
            assert!(awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        }
        assert!(!awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        // After the 1s window rolls, the 10s window still binds at 50.
        clock.advance(Duration::from_millis(1_100));
        assert!(awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
    }

    #[test]
    fn test_channel_budget_independent_of_global() {
        let clock = Arc::new(Clock::manual());
        let cfg = AwgConfig {
            fill_budget_10s: (3, 3),
            ..AwgConfig::default()
        };
        let awg = ApiWeightGovernor::new(&cfg, clock);
        // mm_new burst is 3; global windows are far from full.
        for _ in 0..3 {
            assert!(awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        }
        assert!(!awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        // A different channel still has room.
        assert!(awg.acquire("cancel", Channel::TtlCancel, Some(1), Decimal::ZERO));
    }

    #[test]
    fn test_denied_acquire_leaves_state_untouched() {
        let (_clock, awg) = make();
        for _ in 0..10 {
            awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO);
        }
        let before = awg.status();
        assert!(!awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        let after = awg.status();
        assert_eq!(before.channel_used_10s["mm_new"], after.channel_used_10s["mm_new"]);
        assert_eq!(after.denied, before.denied + 1);
    }

    #[test]
    fn test_pov_cap() {
        let (clock, awg) = make();
        assert!(awg.acquire("new_order", Channel::RbNew, Some(1), dec!(15)));
        // 15 + 10 > 20 → denied.
        assert!(!awg.acquire("new_order", Channel::RbCancel, Some(1), dec!(10)));
        // Zero-notional calls are unaffected by POV.
        assert!(awg.acquire("new_order", Channel::RbCancel, Some(1), Decimal::ZERO));
        // The notional window rolls off after 60s.
        clock.advance(Duration::from_secs(61));
        assert!(awg.acquire("new_order", Channel::RbNew, Some(1), dec!(10)));
    }

    #[test]
    fn test_rate_limit_cascade_normal_to_degraded() {
        let (_clock, awg) = make();
        // error_threshold=3: the third error trips THROTTLED, the fourth DEGRADED.
        awg.track_api_error(-1003, "new_order");
        awg.track_api_error(-1003, "new_order");
        assert_eq!(awg.state(), CircuitState::Normal);
        awg.track_api_error(-1003, "new_order");
        assert_eq!(awg.state(), CircuitState::Throttled);
        awg.track_api_error(-1003, "new_order");
        assert_eq!(awg.state(), CircuitState::Degraded);
    }

    #[test]
    fn test_degraded_scales_effective_cap() {
        let (_clock, awg) = make();
        awg.force_state(CircuitState::Degraded);
        // cap_1s=10, degrade_factor=0.7 → effective 7.
        for _ in 0..7 {
            assert!(awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        }
        assert!(!awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
    }

    #[test]
    fn test_clean_minute_returns_to_normal() {
        let (clock, awg) = make();
        for _ in 0..4 {
            awg.track_api_error(-1003, "new_order");
        }
        assert_eq!(awg.state(), CircuitState::Degraded);
        // First clean admission resets the error counter and promotes a level.
        assert!(awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        assert_eq!(awg.state(), CircuitState::Throttled);
        // A full error-free recovery period promotes the rest of the way.
        clock.advance(Duration::from_secs(61));
        assert!(awg.acquire("new_order", Channel::MmNew, Some(1), Decimal::ZERO));
        assert_eq!(awg.state(), CircuitState::Normal);
    }

    #[test]
    fn test_circuit_open_allowlist_and_recovery() {
        let (clock, awg) = make();
        awg.force_state(CircuitState::CircuitOpen);
        // Expensive endpoint denied, cheap heartbeat admitted.
        assert!(!awg.acquire("openOrders", Channel::MmNew, None, Decimal::ZERO));
        assert!(!awg.acquire("new_order", Channel::MmNew, Some(5), Decimal::ZERO));
        assert!(awg.acquire("userDataStream.keepalive", Channel::UserDataStream, None, Decimal::ZERO));
        // recovery_period elapses → RECOVERING.
        clock.advance(Duration::from_secs(61));
        assert_eq!(awg.state(), CircuitState::Recovering);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let (clock, awg) = make();
        awg.force_state(CircuitState::CircuitOpen);
        // Errors cannot demote CIRCUIT_OPEN, and recovery only reaches
        // RECOVERING — never NORMAL in one hop.
        awg.track_api_error(-1003, "x");
        awg.track_api_error(-1003, "x");
        awg.track_api_error(-1003, "x");
        assert_eq!(awg.state(), CircuitState::CircuitOpen);
        clock.advance(Duration::from_secs(61));
        assert_eq!(awg.state(), CircuitState::Recovering);
        assert_ne!(awg.state(), CircuitState::Normal);
    }

    #[test]
    fn test_error_log_window() {
        let (clock, awg) = make();
        awg.track_api_error(429, "new_order");
        awg.track_api_error(-2010, "new_order"); // non-critical still logged
        assert_eq!(awg.errors_60s(), 2);
        clock.advance(Duration::from_secs(61));
        assert_eq!(awg.errors_60s(), 0);
    }
}
