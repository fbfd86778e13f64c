//! Metrics registry — stable-named gauges, counters, and histograms.
//!
//! Handles are created once and cheap to update from any task. The registry
//! renders in Prometheus text format for the telemetry endpoint.

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    // Execution quality
    pub orders_placed: IntCounter,
    pub orders_filled: IntCounter,
    pub orders_canceled: IntCounter,
    pub orders_rejected: IntCounterVec,

    // System health
    pub api_errors: IntCounterVec,
    pub ws_reconnects: IntCounter,
    pub uds_seeds: IntCounter,
    pub mirror_syncs: IntCounter,
    pub awg_denied: IntCounter,

    // Gauges
    pub equity_usd: Gauge,
    pub util_onbook: Gauge,
    pub live_orders: IntGauge,
    pub awg_state: IntGauge,
    pub drawdown_1h_pct: Gauge,
    pub breaker_open: IntGauge,
    pub shadow_available: GaugeVec,

    // Latency
    pub order_place_latency_ms: Histogram,
    pub cancel_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_placed =
            IntCounter::with_opts(Opts::new("orders_placed_total", "orders submitted")).unwrap();
        let orders_filled =
            IntCounter::with_opts(Opts::new("orders_filled_total", "orders fully filled")).unwrap();
        let orders_canceled =
            IntCounter::with_opts(Opts::new("orders_canceled_total", "orders canceled")).unwrap();
        let orders_rejected = IntCounterVec::new(
            Opts::new("orders_rejected_total", "placement rejections"),
            &["reason"],
        )
        .unwrap();
        let api_errors = IntCounterVec::new(
            Opts::new("api_errors_total", "exchange error responses"),
            &["code"],
        )
        .unwrap();
        let ws_reconnects =
            IntCounter::with_opts(Opts::new("ws_reconnects_total", "websocket reconnects")).unwrap();
        let uds_seeds =
            IntCounter::with_opts(Opts::new("uds_seeds_total", "openOrders seed snapshots")).unwrap();
        let mirror_syncs =
            IntCounter::with_opts(Opts::new("mirror_syncs_total", "mirror reconciliations")).unwrap();
        let awg_denied =
            IntCounter::with_opts(Opts::new("awg_denied_total", "admissions denied")).unwrap();

        let equity_usd = Gauge::with_opts(Opts::new("equity_usd", "total equity in quote")).unwrap();
        let util_onbook =
            Gauge::with_opts(Opts::new("util_onbook", "on-book fraction of equity")).unwrap();
        let live_orders = IntGauge::with_opts(Opts::new("live_orders", "locally live orders")).unwrap();
        let awg_state =
            IntGauge::with_opts(Opts::new("awg_state", "circuit state, 0=NORMAL..4=RECOVERING"))
                .unwrap();
        let drawdown_1h_pct =
            Gauge::with_opts(Opts::new("drawdown_1h_pct", "1-hour equity drawdown")).unwrap();
        let breaker_open =
            IntGauge::with_opts(Opts::new("breaker_open", "process circuit open")).unwrap();
        let shadow_available = GaugeVec::new(
            Opts::new("shadow_available", "shadow availability per asset"),
            &["asset"],
        )
        .unwrap();

        let order_place_latency_ms = Histogram::with_opts(
            HistogramOpts::new("order_place_latency_ms", "REST place latency")
                .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )
        .unwrap();
        let cancel_latency_ms = Histogram::with_opts(
            HistogramOpts::new("cancel_latency_ms", "REST cancel latency")
                .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )
        .unwrap();

        for c in [
            Box::new(orders_placed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(orders_filled.clone()),
            Box::new(orders_canceled.clone()),
            Box::new(orders_rejected.clone()),
            Box::new(api_errors.clone()),
            Box::new(ws_reconnects.clone()),
            Box::new(uds_seeds.clone()),
            Box::new(mirror_syncs.clone()),
            Box::new(awg_denied.clone()),
            Box::new(equity_usd.clone()),
            Box::new(util_onbook.clone()),
            Box::new(live_orders.clone()),
            Box::new(awg_state.clone()),
            Box::new(drawdown_1h_pct.clone()),
            Box::new(breaker_open.clone()),
            Box::new(shadow_available.clone()),
            Box::new(order_place_latency_ms.clone()),
            Box::new(cancel_latency_ms.clone()),
        ] {
            registry.register(c).unwrap();
        }

        Self {
            registry,
            orders_placed,
            orders_filled,
            orders_canceled,
            orders_rejected,
            api_errors,
            ws_reconnects,
            uds_seeds,
            mirror_syncs,
            awg_denied,
            equity_usd,
            util_onbook,
            live_orders,
            awg_state,
            drawdown_1h_pct,
            breaker_open,
            shadow_available,
            order_place_latency_ms,
            cancel_latency_ms,
        }
    }

    /// Prometheus text exposition for the /metrics endpoint.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
