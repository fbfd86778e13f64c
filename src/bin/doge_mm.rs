//! doge-mm — engine runner.
//!
//! Live mode signs against the real venue with the configured API keys.
//! Without keys (or with MOCK_EXCHANGE=1) the engine runs against the
//! in-process mock so the full task tree can be exercised offline.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use doge_mm::clock::Clock;
use doge_mm::config::Config;
use doge_mm::engine::Engine;
use doge_mm::exchange::binance::BinanceConnector;
use doge_mm::exchange::mock::MockExchange;
use doge_mm::exchange::Exchange;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily("logs", "doge-mm.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  doge-mm — spot market-making execution core");
    info!("═══════════════════════════════════════════════════");

    let cfg = Config::from_env();
    let mock_mode = std::env::var("MOCK_EXCHANGE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
        || cfg.exchange.api_key.is_empty();

    let exchange: Arc<dyn Exchange> = if mock_mode {
        info!("📝 MOCK mode — no credentials, running against the in-process venue");
        Arc::new(MockExchange::new(
            &cfg.exchange.symbol,
            &cfg.exchange.base_asset,
            &cfg.exchange.quote_asset,
        ))
    } else {
        info!("🔑 LIVE mode — {} via {}", cfg.exchange.symbol, cfg.exchange.rest_url);
        Arc::new(BinanceConnector::new(cfg.exchange.clone())?)
    };

    info!(
        "📊 symbol={} target_ratio={:.2} target_util={:.2} telemetry={}",
        cfg.exchange.symbol, cfg.dle.target_ratio, cfg.dle.target_util, cfg.telemetry.addr
    );

    let engine = Engine::new(cfg, exchange, Arc::new(Clock::system()));
    let handles = engine.start().await;

    tokio::signal::ctrl_c().await?;
    info!("🛑 interrupt received");
    engine.shutdown(handles).await;
    Ok(())
}
