//! Quote planning: utilization-driven budgets, layered ladders, maker guard.
//!
//! Planning is pure — market view, balances and risk signals in, a sorted
//! batch of `OrderPlan`s out. Placement (reservations, admission, REST) is
//! the engine's job in `dle::mod`.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::awg::CircuitState;
use crate::config::DleConfig;
use crate::types::{Layer, Side, SymbolRules};

// ─────────────────────────────────────────────────────────
// Plan types
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderPlan {
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub layer: Layer,
    pub ttl_ms: u64,
}

impl OrderPlan {
    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }
}

/// Risk signals that shrink the utilization target.
#[derive(Debug, Clone, Copy)]
pub struct RiskSignals {
    pub awg_state: CircuitState,
    pub mirror_age_sec: u64,
    pub uds_age_sec: u64,
}

/// Adaptive factors owned by the stress-mode controller.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveFactors {
    pub spread_factor: f64,
    pub size_factor: f64,
    pub guard_ticks: u32,
}

#[derive(Debug, Clone)]
pub struct PlanBudgets {
    pub util_eff: f64,
    pub target_onbook: Decimal,
    pub buy_budget: Decimal,
    pub sell_budget: Decimal,
}

// ─────────────────────────────────────────────────────────
// Budget derivation
// ─────────────────────────────────────────────────────────

/// Skew error `e = target_ratio − current_ratio`; positive means the book
/// is short of base.
pub fn skew_error(base_value: Decimal, equity: Decimal, target_ratio: f64) -> f64 {
    if equity <= Decimal::ZERO {
        return 0.0;
    }
    let ratio = (base_value / equity).to_f64().unwrap_or(0.0);
    target_ratio - ratio
}

#[allow(clippy::too_many_arguments)]
pub fn derive_budgets(
    cfg: &DleConfig,
    equity: Decimal,
    usable_quote: Decimal,
    usable_base_value: Decimal,
    onbook_buy: Decimal,
    onbook_sell: Decimal,
    e: f64,
    risk: &RiskSignals,
) -> PlanBudgets {
    // α = clamp(α_base + k·|e|, α_min, α_max), then risk reductions.
    let mut util = (cfg.target_util + cfg.skew_gain * e.abs()).clamp(cfg.util_min, cfg.util_max);
    match risk.awg_state {
        CircuitState::Recovering => util = util.min(0.85),
        CircuitState::CircuitOpen => util = 0.0,
        _ => {}
    }
    if risk.mirror_age_sec > cfg.mirror_stale_sec {
        util = util.min(0.70);
    }
    if risk.uds_age_sec > cfg.uds_stale_sec {
        util = util.min(0.75);
    }

    let target_onbook = equity * Decimal::from_f64_retain(util).unwrap_or_default();

    // Side shares skew toward the deficit, capped at 65/35.
    let buy_share = (0.5 + 1.5 * e).clamp(0.35, 0.65);
    let sell_share = 1.0 - buy_share;

    // Budgets replenish the gap between the side's target and what is
    // already resting, never the whole target again.
    let buy_budget = (target_onbook * Decimal::from_f64_retain(buy_share).unwrap_or_default()
        - onbook_buy)
        .min(usable_quote)
        .max(Decimal::ZERO);
    let sell_budget = (target_onbook * Decimal::from_f64_retain(sell_share).unwrap_or_default()
        - onbook_sell)
        .min(usable_base_value)
        .max(Decimal::ZERO);

    PlanBudgets {
        util_eff: util,
        target_onbook,
        buy_budget,
        sell_budget,
    }
}

// ─────────────────────────────────────────────────────────
// Maker guard
// ─────────────────────────────────────────────────────────

fn floor_to_tick(px: Decimal, tick: Decimal) -> Decimal {
    (px / tick).floor() * tick
}

fn ceil_to_tick(px: Decimal, tick: Decimal) -> Decimal {
    (px / tick).ceil() * tick
}

/// Snap one desired price strictly inside the best price on the order's own
/// side, with directional tick alignment. Guarantees a BUY lands below the
/// ask and a SELL above the bid, so no post-only order can cross.
pub fn guard_price(
    side: Side,
    desired: Decimal,
    bid: Decimal,
    ask: Decimal,
    guard_ticks: u32,
    tick: Decimal,
) -> Decimal {
    let g = Decimal::from(guard_ticks) * tick;
    match side {
        Side::Buy => floor_to_tick(desired.min(bid - g).min(ask - tick), tick),
        Side::Sell => ceil_to_tick(desired.max(ask + g).max(bid + tick), tick),
    }
}

/// Build a guarded ladder for one layer: rung `i` at offset `d_i` from mid,
/// pushed at least `guard_ticks + rank` ticks inside the touch so a tight
/// market still yields distinct levels instead of a pile-up at the cap.
pub fn guarded_ladder(
    side: Side,
    mid: Decimal,
    bid: Decimal,
    ask: Decimal,
    offsets: &[u32],
    guard_ticks: u32,
    tick: Decimal,
) -> Vec<Decimal> {
    let d_min = offsets.iter().copied().min().unwrap_or(1);
    offsets
        .iter()
        .map(|&d| {
            let rank = d - d_min;
            let inset = Decimal::from(guard_ticks + rank) * tick;
            match side {
                Side::Buy => {
                    let raw = mid - Decimal::from(d) * tick;
                    floor_to_tick(raw.min(bid - inset), tick)
                }
                Side::Sell => {
                    let raw = mid + Decimal::from(d) * tick;
                    ceil_to_tick(raw.max(ask + inset), tick)
                }
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────
// Quantity alignment
// ─────────────────────────────────────────────────────────

/// Align a quantity to the step and lift it to min-notional. Returns zero
/// when no compliant quantity exists within the budget's reach.
pub fn align_qty(budget_usd: Decimal, px: Decimal, rules: &SymbolRules) -> Decimal {
    if px <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let mut qty = ((budget_usd / px) / rules.step).floor() * rules.step;
    if qty * px < rules.min_notional {
        qty = ((rules.min_notional / px) / rules.step).ceil() * rules.step;
    }
    if qty <= Decimal::ZERO || qty * px < rules.min_notional {
        return Decimal::ZERO;
    }
    qty
}

// ─────────────────────────────────────────────────────────
// Layered generation
// ─────────────────────────────────────────────────────────

pub struct PlanInputs<'a> {
    pub cfg: &'a DleConfig,
    pub rules: &'a SymbolRules,
    pub mid: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub budgets: &'a PlanBudgets,
    pub adaptive: AdaptiveFactors,
}

fn layer_offsets(cfg: &DleConfig, layer: Layer) -> &[u32] {
    match layer {
        Layer::L0 => &cfg.ticks_l0,
        Layer::L1 => &cfg.ticks_l1,
        Layer::L2 => &cfg.ticks_l2,
    }
}

fn layer_weight(cfg: &DleConfig, layer: Layer) -> f64 {
    match layer {
        Layer::L0 => cfg.layer_weights[0],
        Layer::L1 => cfg.layer_weights[1],
        Layer::L2 => cfg.layer_weights[2],
    }
}

fn layer_ttl(cfg: &DleConfig, layer: Layer) -> u64 {
    match layer {
        Layer::L0 => cfg.layer_ttl_ms[0],
        Layer::L1 => cfg.layer_ttl_ms[1],
        Layer::L2 => cfg.layer_ttl_ms[2],
    }
}

/// Generate the full two-sided batch, sorted L0 first.
pub fn build_plan(inp: &PlanInputs) -> Vec<OrderPlan> {
    let mut plans = Vec::new();

    for layer in Layer::all() {
        for side in [Side::Buy, Side::Sell] {
            let side_budget = match side {
                Side::Buy => inp.budgets.buy_budget,
                Side::Sell => inp.budgets.sell_budget,
            };
            if side_budget < inp.cfg.order_usd_min {
                continue;
            }

            let base_offsets = layer_offsets(inp.cfg, layer);
            if base_offsets.is_empty() {
                continue;
            }
            // Stress widens the fan.
            let offsets: Vec<u32> = base_offsets
                .iter()
                .map(|&d| ((d as f64 * inp.adaptive.spread_factor).round() as u32).max(1))
                .collect();

            let layer_budget = side_budget
                * Decimal::from_f64_retain(layer_weight(inp.cfg, layer)).unwrap_or_default();
            let per_order = (layer_budget / Decimal::from(offsets.len()))
                .clamp(inp.cfg.order_usd_min, inp.cfg.order_usd_max)
                * Decimal::from_f64_retain(inp.adaptive.size_factor).unwrap_or(Decimal::ONE);

            let ladder = guarded_ladder(
                side,
                inp.mid,
                inp.bid,
                inp.ask,
                &offsets,
                inp.adaptive.guard_ticks,
                inp.rules.tick,
            );
            for px in ladder {
                if px <= Decimal::ZERO {
                    continue;
                }
                let qty = align_qty(per_order, px, inp.rules);
                if qty > Decimal::ZERO {
                    plans.push(OrderPlan {
                        side,
                        price: px,
                        qty,
                        layer,
                        ttl_ms: layer_ttl(inp.cfg, layer),
                    });
                }
            }
        }
    }

    plans.sort_by(|a, b| b.layer.priority().cmp(&a.layer.priority()));
    plans
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> SymbolRules {
        SymbolRules {
            tick: dec!(0.00001),
            step: dec!(1),
            min_notional: dec!(5),
        }
    }

    fn factors() -> AdaptiveFactors {
        AdaptiveFactors {
            spread_factor: 1.0,
            size_factor: 1.0,
            guard_ticks: 1,
        }
    }

    #[test]
    fn test_guarded_ladder_narrow_market() {
        // bid=0.23999 ask=0.24001 mid=0.24, offsets [1,2,3], guard 1:
        // rungs land one, two, three ticks inside the bid.
        let prices = guarded_ladder(
            Side::Buy,
            dec!(0.24000),
            dec!(0.23999),
            dec!(0.24001),
            &[1, 2, 3],
            1,
            dec!(0.00001),
        );
        assert_eq!(prices, vec![dec!(0.23998), dec!(0.23997), dec!(0.23996)]);

        let asks = guarded_ladder(
            Side::Sell,
            dec!(0.24000),
            dec!(0.23999),
            dec!(0.24001),
            &[1, 2, 3],
            1,
            dec!(0.00001),
        );
        assert_eq!(asks, vec![dec!(0.24002), dec!(0.24003), dec!(0.24004)]);
    }

    #[test]
    fn test_guarded_ladder_wide_market_uses_mid_offsets() {
        // With a wide spread the mid-based rungs already sit inside.
        let prices = guarded_ladder(
            Side::Buy,
            dec!(0.24000),
            dec!(0.23900),
            dec!(0.24100),
            &[1, 2, 3],
            1,
            dec!(0.00001),
        );
        assert_eq!(prices, vec![dec!(0.23999), dec!(0.23998), dec!(0.23997)]);
    }

    #[test]
    fn test_guard_price_crossed_quote() {
        // Planner asks for a bid through the ask on a locked book; the guard
        // floors it two ticks inside.
        let px = guard_price(
            Side::Buy,
            dec!(0.24002),
            dec!(0.24001),
            dec!(0.24001),
            2,
            dec!(0.00001),
        );
        assert_eq!(px, dec!(0.23999));
    }

    #[test]
    fn test_guard_price_never_crosses() {
        let tick = dec!(0.00001);
        let (bid, ask) = (dec!(0.23999), dec!(0.24001));
        for desired in [dec!(0.25), dec!(0.24001), dec!(0.23)] {
            let buy = guard_price(Side::Buy, desired, bid, ask, 1, tick);
            assert!(buy < ask, "buy {buy} must stay below ask");
            let sell = guard_price(Side::Sell, desired, bid, ask, 1, tick);
            assert!(sell > bid, "sell {sell} must stay above bid");
        }
    }

    #[test]
    fn test_align_qty_lifts_to_min_notional() {
        let q = align_qty(dec!(3), dec!(0.24), &rules());
        // 3 USD at 0.24 is under min notional 5 → lifted to ceil(5/0.24)=21.
        assert_eq!(q, dec!(21));
        assert!(q * dec!(0.24) >= dec!(5));
    }

    #[test]
    fn test_align_qty_floor_to_step() {
        let q = align_qty(dec!(12), dec!(0.24), &rules());
        assert_eq!(q, dec!(50));
        assert_eq!(q % dec!(1), dec!(0));
    }

    #[test]
    fn test_budgets_skew_shares() {
        let cfg = DleConfig::default();
        let risk = RiskSignals {
            awg_state: CircuitState::Normal,
            mirror_age_sec: 0,
            uds_age_sec: 0,
        };
        // Strong base deficit → buy share capped at 65%.
        let b = derive_budgets(&cfg, dec!(1000), dec!(1000), dec!(1000), Decimal::ZERO, Decimal::ZERO, 0.3, &risk);
        let buy = b.buy_budget.to_f64().unwrap();
        let sell = b.sell_budget.to_f64().unwrap();
        assert!(buy / (buy + sell) > 0.64 && buy / (buy + sell) < 0.66);
    }

    #[test]
    fn test_budgets_risk_reductions() {
        let cfg = DleConfig::default();
        let base = RiskSignals {
            awg_state: CircuitState::Normal,
            mirror_age_sec: 0,
            uds_age_sec: 0,
        };
        let normal = derive_budgets(&cfg, dec!(1000), dec!(1000), dec!(1000), Decimal::ZERO, Decimal::ZERO, 0.0, &base);
        assert!(normal.util_eff > 0.9);

        let stale_mirror = RiskSignals {
            mirror_age_sec: 30,
            ..base
        };
        let b = derive_budgets(&cfg, dec!(1000), dec!(1000), dec!(1000), Decimal::ZERO, Decimal::ZERO, 0.0, &stale_mirror);
        assert!((b.util_eff - 0.70).abs() < 1e-9);

        let open = RiskSignals {
            awg_state: CircuitState::CircuitOpen,
            ..base
        };
        let b = derive_budgets(&cfg, dec!(1000), dec!(1000), dec!(1000), Decimal::ZERO, Decimal::ZERO, 0.0, &open);
        assert_eq!(b.util_eff, 0.0);
        assert_eq!(b.buy_budget, Decimal::ZERO);
    }

    #[test]
    fn test_build_plan_two_sided_sorted_l0_first() {
        let cfg = DleConfig::default();
        let budgets = PlanBudgets {
            util_eff: 0.9,
            target_onbook: dec!(500),
            buy_budget: dec!(250),
            sell_budget: dec!(250),
        };
        let r = rules();
        let plans = build_plan(&PlanInputs {
            cfg: &cfg,
            rules: &r,
            mid: dec!(0.24000),
            bid: dec!(0.23999),
            ask: dec!(0.24001),
            budgets: &budgets,
            adaptive: factors(),
        });
        assert!(!plans.is_empty());
        // L0 leads the batch.
        assert_eq!(plans[0].layer, Layer::L0);
        // Priorities never increase along the batch.
        for pair in plans.windows(2) {
            assert!(pair[0].layer.priority() >= pair[1].layer.priority());
        }
        // Nothing crosses.
        for p in &plans {
            match p.side {
                Side::Buy => assert!(p.price < dec!(0.24001)),
                Side::Sell => assert!(p.price > dec!(0.23999)),
            }
            assert!(p.notional() >= dec!(5));
        }
    }

    #[test]
    fn test_stress_factors_widen_and_shrink() {
        let cfg = DleConfig::default();
        let budgets = PlanBudgets {
            util_eff: 0.9,
            target_onbook: dec!(500),
            buy_budget: dec!(250),
            sell_budget: dec!(250),
        };
        let r = rules();
        let calm = build_plan(&PlanInputs {
            cfg: &cfg,
            rules: &r,
            mid: dec!(0.24000),
            bid: dec!(0.23900),
            ask: dec!(0.24100),
            budgets: &budgets,
            adaptive: factors(),
        });
        let stressed = build_plan(&PlanInputs {
            cfg: &cfg,
            rules: &r,
            mid: dec!(0.24000),
            bid: dec!(0.23900),
            ask: dec!(0.24100),
            budgets: &budgets,
            adaptive: AdaptiveFactors {
                spread_factor: 1.5,
                size_factor: 0.8,
                guard_ticks: 5,
            },
        });
        let calm_l0_buy = calm
            .iter()
            .find(|p| p.layer == Layer::L0 && p.side == Side::Buy)
            .unwrap();
        let stressed_l0_buy = stressed
            .iter()
            .find(|p| p.layer == Layer::L0 && p.side == Side::Buy)
            .unwrap();
        // Wider fan → deeper first rung; smaller size factor → fewer units.
        assert!(stressed_l0_buy.price <= calm_l0_buy.price);
        assert!(stressed_l0_buy.qty <= calm_l0_buy.qty);
    }
}
