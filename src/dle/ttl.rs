//! Keyed TTL timer wheel.
//!
//! One task owns a deadline heap for every live order instead of one sleeper
//! task per order. Scheduling the same key again supersedes the previous
//! deadline, and cancellation is a generation bump — a popped entry whose
//! generation is stale is simply discarded, so cancelling a completed timer
//! is a no-op.
//!
//! Expired keys are delivered on a channel; the consumer (the DLE expiry
//! loop) owns the actual cancel call and closure routine.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
enum WheelCmd {
    Schedule { key: String, deadline: Instant },
    Cancel { key: String },
}

/// An order id whose TTL elapsed without the order closing first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct TtlWheel {
    tx: mpsc::UnboundedSender<WheelCmd>,
}

impl TtlWheel {
    /// Spawn the wheel task. Expired keys arrive on the returned receiver.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_wheel(rx, expired_tx));
        (Self { tx }, expired_rx)
    }

    pub fn schedule(&self, key: &str, ttl: Duration) {
        let _ = self.tx.send(WheelCmd::Schedule {
            key: key.to_string(),
            deadline: Instant::now() + ttl,
        });
    }

    /// Idempotent: cancelling an unknown or already-fired key is a no-op.
    pub fn cancel(&self, key: &str) {
        let _ = self.tx.send(WheelCmd::Cancel {
            key: key.to_string(),
        });
    }
}

async fn run_wheel(
    mut rx: mpsc::UnboundedReceiver<WheelCmd>,
    expired_tx: mpsc::UnboundedSender<Expiry>,
) {
    // Heap of (deadline, generation, key); `live` maps key → current
    // generation. A mismatch means the entry was cancelled or superseded.
    let mut heap: BinaryHeap<Reverse<(Instant, u64, String)>> = BinaryHeap::new();
    let mut live: HashMap<String, u64> = HashMap::new();
    let mut generation: u64 = 0;

    loop {
        // Drop stale heads so the sleep below targets a real deadline.
        while let Some(Reverse((_, gen, key))) = heap.peek() {
            if live.get(key) == Some(gen) {
                break;
            }
            heap.pop();
        }

        let next_deadline = heap.peek().map(|Reverse((d, _, _))| *d);

        select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(WheelCmd::Schedule { key, deadline }) => {
                        generation += 1;
                        live.insert(key.clone(), generation);
                        heap.push(Reverse((deadline, generation, key)));
                    }
                    Some(WheelCmd::Cancel { key }) => {
                        if live.remove(&key).is_some() {
                            debug!("[ttl] cancelled timer for {key}");
                        }
                    }
                    None => break,
                }
            }
            _ = async {
                match next_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                while let Some(Reverse((deadline, gen, key))) = heap.peek().cloned() {
                    if deadline > now {
                        break;
                    }
                    heap.pop();
                    if live.get(&key) == Some(&gen) {
                        live.remove(&key);
                        if expired_tx.send(Expiry { key }).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_expiry_fires_in_deadline_order() {
        let (wheel, mut expired) = TtlWheel::spawn();
        wheel.schedule("late", Duration::from_millis(80));
        wheel.schedule("early", Duration::from_millis(20));
        assert_eq!(expired.recv().await.unwrap().key, "early");
        assert_eq!(expired.recv().await.unwrap().key, "late");
    }

    #[tokio::test]
    async fn test_cancel_suppresses_expiry() {
        let (wheel, mut expired) = TtlWheel::spawn();
        wheel.schedule("a", Duration::from_millis(30));
        wheel.schedule("b", Duration::from_millis(30));
        wheel.cancel("a");
        assert_eq!(expired.recv().await.unwrap().key, "b");
        let extra = tokio::time::timeout(Duration::from_millis(60), expired.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_cancel_after_fire_is_noop() {
        let (wheel, mut expired) = TtlWheel::spawn();
        wheel.schedule("a", Duration::from_millis(10));
        assert_eq!(expired.recv().await.unwrap().key, "a");
        wheel.cancel("a");
        wheel.schedule("b", Duration::from_millis(10));
        assert_eq!(expired.recv().await.unwrap().key, "b");
    }

    #[tokio::test]
    async fn test_reschedule_supersedes() {
        let (wheel, mut expired) = TtlWheel::spawn();
        wheel.schedule("a", Duration::from_millis(20));
        wheel.schedule("a", Duration::from_millis(80));
        let start = std::time::Instant::now();
        assert_eq!(expired.recv().await.unwrap().key, "a");
        assert!(start.elapsed() >= Duration::from_millis(60));
        // Only one expiry arrives for the superseded key.
        let extra = tokio::time::timeout(Duration::from_millis(60), expired.recv()).await;
        assert!(extra.is_err());
    }
}
