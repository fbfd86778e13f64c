//! Hedge bridge — broadcast bus of spot fill deltas.
//!
//! The perp-side hedger lives in another process tree; our side of the
//! contract is just publishing every spot fill as a `FillEvent` on a
//! broadcast channel. Slow or absent subscribers never block the trading
//! path — lagging receivers drop the oldest events.

use std::sync::atomic::{AtomicU64, Ordering};

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{FillEvent, Side};

pub struct DeltaBus {
    tx: broadcast::Sender<FillEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl DeltaBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FillEvent> {
        self.tx.subscribe()
    }

    pub fn publish_spot_fill(&self, side: Side, qty: Decimal, price: Decimal, ts_ms: u64) {
        if qty <= Decimal::ZERO {
            return;
        }
        let event = FillEvent {
            side,
            qty,
            price,
            ts_ms,
        };
        match self.tx.send(event) {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!("[hedge] spot fill {} {}@{} → {} subscriber(s)", side.as_str(), qty, price, receivers);
            }
            Err(_) => {
                // No subscribers; the hedger may simply not be attached.
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fill_reaches_subscriber() {
        let bus = DeltaBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish_spot_fill(Side::Buy, dec!(40), dec!(0.24), 1);
        let fill = rx.recv().await.unwrap();
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.qty, dec!(40));
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = DeltaBus::new(16);
        bus.publish_spot_fill(Side::Sell, dec!(10), dec!(0.24), 1);
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn test_zero_qty_is_skipped() {
        let bus = DeltaBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish_spot_fill(Side::Buy, Decimal::ZERO, dec!(0.24), 1);
        bus.publish_spot_fill(Side::Buy, dec!(1), dec!(0.24), 2);
        let fill = rx.recv().await.unwrap();
        assert_eq!(fill.ts_ms, 2);
    }
}
