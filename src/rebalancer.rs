//! TWAP rebalancer — slice-and-drip inventory correction.
//!
//! When the inventory ratio drifts past the soft band and stays there, the
//! rebalancer drips post-only L0 slices into the regular placement path on
//! the dedicated `rb_*` channels. Slices ride the same Shadow reservation
//! and AWG admission as quoting flow — their notional counts against the
//! POV window, so a big drift still cannot become market-impacting flow.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{DleConfig, TwapConfig};
use crate::dle::plan::{align_qty, guard_price, OrderPlan};
use crate::dle::{LiquidityEngine, PlaceOutcome, PlanContext};
use crate::ledger::EventLedger;
use crate::types::{Layer, Side};

#[derive(Debug, Default)]
struct RebalanceStats {
    slices_placed: u64,
    slices_denied: u64,
}

#[derive(Debug)]
struct Inner {
    drift_since: Option<Instant>,
    last_slice: Option<Instant>,
    stats: RebalanceStats,
}

pub struct TwapRebalancer {
    cfg: TwapConfig,
    target_ratio: f64,
    layer_ttl_ms: u64,
    base_asset: String,
    quote_asset: String,
    clock: Arc<Clock>,
    ledger: Arc<EventLedger>,
    dle: Arc<LiquidityEngine>,
    inner: Mutex<Inner>,
}

impl TwapRebalancer {
    pub fn new(
        cfg: TwapConfig,
        dle_cfg: &DleConfig,
        base_asset: &str,
        quote_asset: &str,
        clock: Arc<Clock>,
        ledger: Arc<EventLedger>,
        dle: Arc<LiquidityEngine>,
    ) -> Self {
        Self {
            cfg,
            target_ratio: dle_cfg.target_ratio,
            layer_ttl_ms: dle_cfg.layer_ttl_ms[0],
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            clock,
            ledger,
            dle,
            inner: Mutex::new(Inner {
                drift_since: None,
                last_slice: None,
                stats: RebalanceStats::default(),
            }),
        }
    }

    /// One rebalancing decision. Returns true when a slice was placed.
    pub async fn tick(&self, ctx: &PlanContext) -> bool {
        if !ctx.market.is_ready() {
            return false;
        }
        let mid = ctx.market.mid();
        let base_value = self.ledger.balance(&self.base_asset).total() * mid;
        let equity = base_value + self.ledger.balance(&self.quote_asset).total();
        if equity <= Decimal::ZERO {
            return false;
        }

        let ratio = (base_value / equity).to_f64().unwrap_or(0.0);
        let drift = self.target_ratio - ratio;
        let now = self.clock.now();

        // Inside the band: nothing to do, forget any pending drift.
        if drift.abs() <= self.cfg.soft_band {
            self.inner.lock().unwrap().drift_since = None;
            return false;
        }

        {
            let mut g = self.inner.lock().unwrap();
            let since = *g.drift_since.get_or_insert(now);
            if now.duration_since(since) < Duration::from_secs(self.cfg.persist_sec) {
                debug!("[twap] drift {drift:+.3} pending persistence");
                return false;
            }
            if let Some(last) = g.last_slice {
                if now.duration_since(last) < Duration::from_secs(self.cfg.slice_interval_sec) {
                    return false;
                }
            }
        }

        // Short of base → buy base; long of base → sell base.
        let side = if drift > 0.0 { Side::Buy } else { Side::Sell };
        let deficit_usd = equity * Decimal::from_f64_retain(drift.abs()).unwrap_or_default();
        let slice_usd = deficit_usd.min(self.cfg.max_slice_usd);

        // Join the touch, still strictly post-only.
        let factors = self.dle.adaptive_factors();
        let desired = match side {
            Side::Buy => ctx.market.bid,
            Side::Sell => ctx.market.ask,
        };
        let price = guard_price(
            side,
            desired,
            ctx.market.bid,
            ctx.market.ask,
            factors.guard_ticks,
            ctx.rules.tick,
        );
        let qty = align_qty(slice_usd, price, &ctx.rules);
        if qty <= Decimal::ZERO {
            return false;
        }

        let plan = OrderPlan {
            side,
            price,
            qty,
            layer: Layer::L0,
            ttl_ms: self.layer_ttl_ms,
        };
        let outcome = self.dle.place_planned(&plan, true).await;

        let mut g = self.inner.lock().unwrap();
        match outcome {
            PlaceOutcome::Placed => {
                g.last_slice = Some(now);
                g.stats.slices_placed += 1;
                info!(
                    "[twap] slice {} {}@{} (drift {drift:+.3})",
                    side.as_str(),
                    qty,
                    price
                );
                true
            }
            _ => {
                g.stats.slices_denied += 1;
                debug!("[twap] slice not placed: {outcome:?}");
                false
            }
        }
    }

    pub fn slices_placed(&self) -> u64 {
        self.inner.lock().unwrap().stats.slices_placed
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awg::{ApiWeightGovernor, Channel};
    use crate::breaker::RiskBreaker;
    use crate::exchange::Exchange;
    use crate::config::{AwgConfig, BreakerConfig, SsotConfig};
    use crate::dle::ttl::TtlWheel;
    use crate::exchange::mock::MockExchange;
    use crate::metrics::Metrics;
    use crate::shadow::ShadowBalance;
    use crate::types::{MarketView, SymbolRules};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct Rig {
        clock: Arc<Clock>,
        awg: Arc<ApiWeightGovernor>,
        mock: Arc<MockExchange>,
        dle: Arc<LiquidityEngine>,
        twap: TwapRebalancer,
    }

    fn rig() -> Rig {
        rig_with(TwapConfig::default())
    }

    /// Heavily quote-skewed book: 500 USDT vs 100 DOGE keeps the ratio far
    /// below the 0.5 target.
    fn rig_with(twap_cfg: TwapConfig) -> Rig {
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
        mock.set_balance("USDT", dec!(500), Decimal::ZERO);
        mock.set_balance("DOGE", dec!(100), Decimal::ZERO);

        let snap = HashMap::from([
            ("USDT".to_string(), (dec!(500), Decimal::ZERO)),
            ("DOGE".to_string(), (dec!(100), Decimal::ZERO)),
        ]);
        shadow.sync_actual_balance(&snap);
        for _ in 0..3 {
            shadow.sync_actual_balance(&snap);
        }

        let metrics = Arc::new(Metrics::new());
        let breaker = Arc::new(RiskBreaker::new(BreakerConfig::default(), clock.clone()));
        let (wheel, _rx) = TtlWheel::spawn();
        let dle_cfg = crate::config::DleConfig::default();
        let dle = Arc::new(LiquidityEngine::new(
            dle_cfg.clone(),
            "DOGEUSDT",
            "DOGE",
            "USDT",
            clock.clone(),
            awg.clone(),
            shadow,
            ledger.clone(),
            mock.clone(),
            metrics,
            breaker,
            wheel,
        ));
        let twap = TwapRebalancer::new(
            twap_cfg,
            &dle_cfg,
            "DOGE",
            "USDT",
            clock.clone(),
            ledger,
            dle.clone(),
        );
        Rig {
            clock,
            awg,
            mock,
            dle,
            twap,
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
    async fn test_drift_must_persist_before_slicing() {
        let rig = rig();
        assert!(!rig.twap.tick(&ctx()).await);
        // Still inside the persistence window.
        rig.clock.advance(Duration::from_secs(10));
        assert!(!rig.twap.tick(&ctx()).await);
        // Past it: one buy slice lands through rb_new.
        rig.clock.advance(Duration::from_secs(25));
        assert!(rig.twap.tick(&ctx()).await);
        assert_eq!(rig.awg.status().channel_used_10s["rb_new"], 1);
        assert_eq!(rig.mock.open_order_count(), 1);
        let open = rig.mock.get_open_orders("DOGEUSDT").await.unwrap();
        assert_eq!(open[0].side, Side::Buy);
        // Post-only: strictly inside the book.
        assert!(open[0].price < dec!(0.24001));
    }

    #[tokio::test]
    async fn test_slice_interval_paces_flow() {
        // Small slices so two fit inside the POV window.
        let rig = rig_with(TwapConfig {
            max_slice_usd: dec!(8),
            ..TwapConfig::default()
        });
        rig.clock.advance(Duration::from_secs(35));
        assert!(rig.twap.tick(&ctx()).await);
        // Immediately after, the interval gate holds.
        assert!(!rig.twap.tick(&ctx()).await);
        rig.clock.advance(Duration::from_secs(11));
        assert!(rig.twap.tick(&ctx()).await);
        assert_eq!(rig.twap.slices_placed(), 2);
    }

    #[tokio::test]
    async fn test_pov_window_caps_slices() {
        let rig = rig();
        rig.clock.advance(Duration::from_secs(35));
        // Drain the POV window with admitted taker notional.
        assert!(rig
            .awg
            .acquire("new_order", Channel::RbNew, Some(0), dec!(19)));
        assert!(!rig.twap.tick(&ctx()).await);
        assert_eq!(rig.mock.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_balanced_inventory_is_left_alone() {
        let rig = rig();
        // Move the book so DOGE value ≈ USDT value (ratio ≈ target).
        // 100 DOGE at 5.0 = 500 = USDT side.
        let c = PlanContext {
            market: MarketView {
                bid: dec!(4.99999),
                ask: dec!(5.00001),
                ts: std::time::Instant::now(),
            },
            ..ctx()
        };
        rig.clock.advance(Duration::from_secs(60));
        assert!(!rig.twap.tick(&c).await);
        assert_eq!(rig.dle.live_count().await, 0);
    }
}
