//! Typed configuration, read once at startup.
//!
//! Every section has compiled-in defaults and environment overrides, loaded
//! by `Config::from_env()`. Values are never re-read after startup.

use std::env;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn env_parse<T: std::str::FromStr>(key: &str, out: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *out = parsed;
        }
    }
}

fn env_ticks(key: &str, out: &mut Vec<u32>) {
    if let Ok(v) = env::var(key) {
        let parsed: Vec<u32> = v.split(',').filter_map(|t| t.trim().parse().ok()).collect();
        if !parsed.is_empty() {
            *out = parsed;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Exchange / symbol
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Hard timeout for every REST call.
    pub rest_timeout_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            symbol: "DOGEUSDT".into(),
            base_asset: "DOGE".into(),
            quote_asset: "USDT".into(),
            rest_url: "https://api.binance.com".into(),
            ws_url: "wss://stream.binance.com:9443/ws".into(),
            api_key: String::new(),
            api_secret: String::new(),
            rest_timeout_ms: 5_000,
        }
    }
}

impl ExchangeConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = env::var("SYMBOL")              { c.symbol = v; }
        if let Ok(v) = env::var("BASE_ASSET")          { c.base_asset = v; }
        if let Ok(v) = env::var("QUOTE_ASSET")         { c.quote_asset = v; }
        if let Ok(v) = env::var("BINANCE_REST_URL")    { c.rest_url = v; }
        if let Ok(v) = env::var("BINANCE_WS_URL")      { c.ws_url = v; }
        if let Ok(v) = env::var("BINANCE_API_KEY")     { c.api_key = v; }
        if let Ok(v) = env::var("BINANCE_API_SECRET")  { c.api_secret = v; }
        env_parse("REST_TIMEOUT_MS", &mut c.rest_timeout_ms);
        c
    }
}

// ─────────────────────────────────────────────────────────
// AWG
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AwgConfig {
    /// Global weight caps per window.
    pub cap_1s: u32,
    pub cap_10s: u32,
    pub cap_1m: u32,
    pub error_threshold: u32,
    /// Seconds spent in CIRCUIT_OPEN before moving to RECOVERING.
    pub recovery_period_sec: u64,
    pub throttle_factor: f64,
    pub degrade_factor: f64,
    /// 10-second channel sub-budgets (budget, burst).
    pub fill_budget_10s: (u32, u32),
    pub cancel_budget_10s: (u32, u32),
    pub reprice_budget_10s: (u32, u32),
    pub ttl_cancel_budget_10s: (u32, u32),
    pub rb_new_budget_10s: (u32, u32),
    pub rb_cancel_budget_10s: (u32, u32),
    pub rb_replace_budget_10s: (u32, u32),
    /// Rolling 60-second taker notional ceiling (USD).
    pub pov_notional_max: Decimal,
}

impl Default for AwgConfig {
    fn default() -> Self {
        Self {
            cap_1s: 100,
            cap_10s: 500,
            cap_1m: 2_500,
            error_threshold: 3,
            recovery_period_sec: 60,
            throttle_factor: 0.8,
            degrade_factor: 0.7,
            fill_budget_10s: (8, 10),
            cancel_budget_10s: (8, 10),
            reprice_budget_10s: (3, 4),
            ttl_cancel_budget_10s: (8, 10),
            rb_new_budget_10s: (2, 3),
            rb_cancel_budget_10s: (2, 3),
            rb_replace_budget_10s: (2, 3),
            pov_notional_max: dec!(20),
        }
    }
}

impl AwgConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_parse("AWG_CAP_1S", &mut c.cap_1s);
        env_parse("AWG_CAP_10S", &mut c.cap_10s);
        env_parse("AWG_CAP_1M", &mut c.cap_1m);
        env_parse("AWG_ERROR_THRESHOLD", &mut c.error_threshold);
        env_parse("AWG_RECOVERY_PERIOD", &mut c.recovery_period_sec);
        env_parse("AWG_THROTTLE_FACTOR", &mut c.throttle_factor);
        env_parse("AWG_DEGRADE_FACTOR", &mut c.degrade_factor);
        env_parse("FILL_BUDGET_10S", &mut c.fill_budget_10s.0);
        env_parse("FILL_BURST_10S", &mut c.fill_budget_10s.1);
        env_parse("CANCEL_BUDGET_10S", &mut c.cancel_budget_10s.0);
        env_parse("CANCEL_BURST_10S", &mut c.cancel_budget_10s.1);
        env_parse("REPRICE_BUDGET_10S", &mut c.reprice_budget_10s.0);
        env_parse("REPRICE_BURST_10S", &mut c.reprice_budget_10s.1);
        env_parse("TTL_CANCEL_BUDGET_10S", &mut c.ttl_cancel_budget_10s.0);
        env_parse("TTL_CANCEL_BURST_10S", &mut c.ttl_cancel_budget_10s.1);
        env_parse("RB_NEW_BUDGET_10S", &mut c.rb_new_budget_10s.0);
        env_parse("RB_CANCEL_BUDGET_10S", &mut c.rb_cancel_budget_10s.0);
        env_parse("RB_REPLACE_BUDGET_10S", &mut c.rb_replace_budget_10s.0);
        env_parse("POV_NOTIONAL_MAX", &mut c.pov_notional_max);
        c
    }
}

// ─────────────────────────────────────────────────────────
// SSOT (ledger + shadow)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SsotConfig {
    pub ledger_persist_path: String,
    pub ledger_max_events: usize,
    /// Relative total-balance deviation that forces a reconcile (0.001 = 0.1%).
    pub divergence_threshold: f64,
    /// Clean snapshot syncs required to leave cold start.
    pub min_consistency_checks: u32,
    /// Reservation over-provision factor.
    pub reserve_factor: Decimal,
    /// Default reservation TTL.
    pub reservation_ttl_sec: u64,
    /// Expected snapshot sync cadence; shadow goes safe past 2x this.
    pub sync_interval_sec: u64,
    /// Three-way audit cadence.
    pub audit_interval_sec: u64,
}

impl Default for SsotConfig {
    fn default() -> Self {
        Self {
            ledger_persist_path: "state/event_ledger.json".into(),
            ledger_max_events: 10_000,
            divergence_threshold: 0.001,
            min_consistency_checks: 3,
            reserve_factor: dec!(1.1),
            reservation_ttl_sec: 300,
            sync_interval_sec: 30,
            audit_interval_sec: 7,
        }
    }
}

impl SsotConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = env::var("LEDGER_PERSIST_PATH") { c.ledger_persist_path = v; }
        env_parse("LEDGER_MAX_EVENTS", &mut c.ledger_max_events);
        env_parse("LEDGER_DIVERGENCE_THRESHOLD", &mut c.divergence_threshold);
        env_parse("LEDGER_MIN_CONSISTENCY_CHECKS", &mut c.min_consistency_checks);
        env_parse("RESERVE_FACTOR", &mut c.reserve_factor);
        env_parse("RESERVATION_TTL_SEC", &mut c.reservation_ttl_sec);
        env_parse("BALANCE_SYNC_INTERVAL_SEC", &mut c.sync_interval_sec);
        env_parse("SSOT_AUDIT_INTERVAL_SEC", &mut c.audit_interval_sec);
        c
    }
}

// ─────────────────────────────────────────────────────────
// DLE
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DleConfig {
    /// Target on-book fraction of equity at zero skew.
    pub target_util: f64,
    /// Extra utilization per unit of |target_ratio - current_ratio|.
    pub skew_gain: f64,
    pub util_min: f64,
    pub util_max: f64,
    pub target_ratio: f64,
    pub ticks_l0: Vec<u32>,
    pub ticks_l1: Vec<u32>,
    pub ticks_l2: Vec<u32>,
    /// Per-layer budget weights (L0, L1, L2).
    pub layer_weights: [f64; 3],
    /// Per-layer TTLs in milliseconds (L0, L1, L2).
    pub layer_ttl_ms: [u64; 3],
    pub maker_guard_base: u32,
    pub maker_guard_stress: u32,
    pub per_price_limit: u32,
    pub soft_cap_new: u32,
    pub hard_cap_new: u32,
    pub order_usd_min: Decimal,
    pub order_usd_max: Decimal,
    pub cushion_usdt: Decimal,
    pub cushion_doge: Decimal,
    pub plan_interval_ms: u64,
    /// Planning pauses when the mirror is staler than this.
    pub mirror_stale_sec: u64,
    pub uds_stale_sec: u64,
}

impl Default for DleConfig {
    fn default() -> Self {
        Self {
            target_util: 0.93,
            skew_gain: 0.10,
            util_min: 0.0,
            util_max: 0.98,
            target_ratio: 0.50,
            ticks_l0: vec![1, 2, 3],
            ticks_l1: vec![3, 5, 8],
            ticks_l2: vec![8, 13, 21],
            layer_weights: [0.5, 0.3, 0.2],
            layer_ttl_ms: [5_000, 10_000, 20_000],
            maker_guard_base: 1,
            maker_guard_stress: 5,
            per_price_limit: 5,
            soft_cap_new: 4,
            hard_cap_new: 8,
            order_usd_min: dec!(6),
            order_usd_max: dec!(50),
            cushion_usdt: dec!(10),
            cushion_doge: dec!(30),
            plan_interval_ms: 1_000,
            mirror_stale_sec: 10,
            uds_stale_sec: 3,
        }
    }
}

impl DleConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_parse("DLE_TARGET_UTIL", &mut c.target_util);
        env_parse("DLE_SKEW_GAIN", &mut c.skew_gain);
        env_parse("DOGE_TARGET_RATIO", &mut c.target_ratio);
        env_ticks("DLE_TICKS_L0", &mut c.ticks_l0);
        env_ticks("DLE_TICKS_L1", &mut c.ticks_l1);
        env_ticks("DLE_TICKS_L2", &mut c.ticks_l2);
        env_parse("MAKER_GUARD_BASE", &mut c.maker_guard_base);
        env_parse("MAKER_GUARD_STRESS", &mut c.maker_guard_stress);
        env_parse("DLE_PER_PRICE_LIMIT", &mut c.per_price_limit);
        env_parse("DLE_SOFT_CAP_NEW", &mut c.soft_cap_new);
        env_parse("DLE_HARD_CAP_NEW", &mut c.hard_cap_new);
        env_parse("DLE_ORDER_USD_MIN", &mut c.order_usd_min);
        env_parse("DLE_ORDER_USD_MAX", &mut c.order_usd_max);
        env_parse("CUSHION_USDT", &mut c.cushion_usdt);
        env_parse("CUSHION_DOGE", &mut c.cushion_doge);
        env_parse("DLE_PLAN_INTERVAL_MS", &mut c.plan_interval_ms);
        env_parse("MIRROR_STALE_SEC", &mut c.mirror_stale_sec);
        env_parse("UDS_STALE_SEC", &mut c.uds_stale_sec);
        c
    }
}

// ─────────────────────────────────────────────────────────
// UDS / Mirror / TWAP / Breaker / Telemetry
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UdsConfig {
    /// listenKey keepalive cadence; refresh runs at half of this.
    pub keepalive_sec: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub audit_seed_suppress_sec: u64,
    /// Idempotency-set entry TTL.
    pub event_cache_ttl_sec: u64,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            keepalive_sec: 1_800,
            reconnect_base_ms: 500,
            reconnect_max_ms: 8_000,
            audit_seed_suppress_sec: 90,
            event_cache_ttl_sec: 300,
        }
    }
}

impl UdsConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_parse("UDS_KEEPALIVE_SEC", &mut c.keepalive_sec);
        env_parse("UDS_RECONNECT_BASE_MS", &mut c.reconnect_base_ms);
        env_parse("UDS_RECONNECT_MAX_MS", &mut c.reconnect_max_ms);
        env_parse("UDS_AUDIT_SEED_SUPPRESS_SEC", &mut c.audit_seed_suppress_sec);
        c
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub sync_interval_sec: u64,
    pub persist_path: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sync_interval_sec: 60,
            persist_path: "state/order_mirror.json".into(),
        }
    }
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_parse("MIRROR_SYNC_INTERVAL", &mut c.sync_interval_sec);
        if let Ok(v) = env::var("MIRROR_PERSIST_PATH") { c.persist_path = v; }
        c
    }
}

#[derive(Debug, Clone)]
pub struct TwapConfig {
    /// Inventory-ratio band around target that needs no rebalancing.
    pub soft_band: f64,
    /// Seconds the drift must persist before slicing begins.
    pub persist_sec: u64,
    pub slice_interval_sec: u64,
    pub max_slice_usd: Decimal,
}

impl Default for TwapConfig {
    fn default() -> Self {
        Self {
            soft_band: 0.08,
            persist_sec: 30,
            slice_interval_sec: 10,
            max_slice_usd: dec!(15),
        }
    }
}

impl TwapConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_parse("TWAP_SOFT_BAND", &mut c.soft_band);
        env_parse("TWAP_PERSIST_SEC", &mut c.persist_sec);
        env_parse("TWAP_SLICE_INTERVAL", &mut c.slice_interval_sec);
        env_parse("TWAP_MAX_SLICE_USD", &mut c.max_slice_usd);
        c
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// 1-hour drawdown trip level, in percent of peak equity.
    pub drawdown_pct: f64,
    /// 60-second API error count trip level.
    pub errors_60s: u64,
    /// Reject-rate trip level over the rolling decision window.
    pub reject_rate: f64,
    /// Under-utilization trip: util below this for `under_util_sec`.
    pub under_util: f64,
    pub under_util_sec: u64,
    pub tick_interval_sec: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            drawdown_pct: 2.0,
            errors_60s: 10,
            reject_rate: 0.5,
            under_util: 0.10,
            under_util_sec: 600,
            tick_interval_sec: 5,
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        env_parse("BREAKER_DRAWDOWN_PCT", &mut c.drawdown_pct);
        env_parse("BREAKER_ERRORS_60S", &mut c.errors_60s);
        env_parse("BREAKER_REJECT_RATE", &mut c.reject_rate);
        env_parse("BREAKER_UNDER_UTIL", &mut c.under_util);
        env_parse("BREAKER_UNDER_UTIL_SEC", &mut c.under_util_sec);
        c
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub addr: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9464".into(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = env::var("TELEMETRY_ADDR") { c.addr = v; }
        c
    }
}

// ─────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub awg: AwgConfig,
    pub ssot: SsotConfig,
    pub dle: DleConfig,
    pub uds: UdsConfig,
    pub mirror: MirrorConfig,
    pub twap: TwapConfig,
    pub breaker: BreakerConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            awg: AwgConfig::default(),
            ssot: SsotConfig::default(),
            dle: DleConfig::default(),
            uds: UdsConfig::default(),
            mirror: MirrorConfig::default(),
            twap: TwapConfig::default(),
            breaker: BreakerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            exchange: ExchangeConfig::from_env(),
            awg: AwgConfig::from_env(),
            ssot: SsotConfig::from_env(),
            dle: DleConfig::from_env(),
            uds: UdsConfig::from_env(),
            mirror: MirrorConfig::from_env(),
            twap: TwapConfig::from_env(),
            breaker: BreakerConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let c = Config::default();
        assert_eq!(c.exchange.symbol, "DOGEUSDT");
        assert_eq!(c.awg.error_threshold, 3);
        assert_eq!(c.dle.ticks_l0, vec![1, 2, 3]);
        assert!((c.dle.layer_weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(c.awg.fill_budget_10s.1 >= c.awg.fill_budget_10s.0);
    }

    #[test]
    fn test_env_override_ticks() {
        std::env::set_var("DLE_TICKS_L0", "2,4,6");
        let c = DleConfig::from_env();
        assert_eq!(c.ticks_l0, vec![2, 4, 6]);
        std::env::remove_var("DLE_TICKS_L0");
    }
}
