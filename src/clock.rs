//! Monotonic clock handle.
//!
//! Every window/TTL computation in the core reads time through a shared
//! `Clock` so that state machines (AWG buckets, reservation expiry, audit
//! divergence timers) can be driven deterministically in tests. Production
//! code uses the system clock; tests create a manual clock and advance it.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
enum Source {
    System,
    /// Frozen instant advanced explicitly by tests.
    Manual(Mutex<Instant>),
}

#[derive(Debug)]
pub struct Clock {
    source: Source,
}

impl Clock {
    pub fn system() -> Self {
        Self {
            source: Source::System,
        }
    }

    /// Manual clock for tests. Starts at an arbitrary origin.
    pub fn manual() -> Self {
        Self {
            source: Source::Manual(Mutex::new(Instant::now())),
        }
    }

    pub fn now(&self) -> Instant {
        match &self.source {
            Source::System => Instant::now(),
            Source::Manual(t) => *t.lock().unwrap(),
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance(&self, d: Duration) {
        if let Source::Manual(t) = &self.source {
            let mut guard = t.lock().unwrap();
            *guard += d;
        }
    }

    /// Wall-clock milliseconds since the epoch, for persisted files and
    /// exchange-facing timestamps. Not monotonic; never used for windows.
    pub fn ts_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = Clock::manual();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - t0, Duration::from_secs(5));
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = Clock::system();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
