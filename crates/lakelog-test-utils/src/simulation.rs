//! Deterministic time and randomness for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use lakelog_core::Clock;
use lakelog_core::retry::JitterFn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Clock that only moves when told to.
///
/// Cheap to share behind an `Arc`; every state store, collector and cache in a
/// test can observe the same simulated time.
#[derive(Debug)]
pub struct SimulatedClock {
    /// Base time (start of simulation).
    base: DateTime<Utc>,
    /// Elapsed milliseconds since base.
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a new simulated clock starting at the given time.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Creates a clock anchored at a fixed, round instant (2024-01-01T00:00:00Z).
    #[must_use]
    pub fn deterministic() -> Self {
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid base timestamp");
        Self::new(base)
    }

    /// Returns the current simulated time.
    #[must_use]
    pub fn current(&self) -> DateTime<Utc> {
        let elapsed = self.elapsed_ms.load(Ordering::Relaxed);
        self.base + chrono::Duration::milliseconds(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms.fetch_add(
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Advances the clock to a specific point in time.
    ///
    /// # Panics
    ///
    /// Panics if the target time is before the current simulated time.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        let target_ms: u64 = (target - self.base)
            .num_milliseconds()
            .try_into()
            .expect("target after base");
        let current = self.elapsed_ms.load(Ordering::Relaxed);
        assert!(
            target_ms >= current,
            "Cannot move clock backwards: current={current}ms, target={target_ms}ms"
        );
        self.elapsed_ms.store(target_ms, Ordering::Relaxed);
    }

    /// Returns elapsed time since simulation start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::deterministic()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        self.current()
    }
}

/// Returns a jitter source drawing from a seeded RNG.
///
/// The same seed yields the same sequence of backoff delays.
#[must_use]
pub fn seeded_jitter(seed: u64) -> JitterFn {
    let rng = Mutex::new(StdRng::seed_from_u64(seed));
    std::sync::Arc::new(move || rng.lock().unwrap().random::<f64>())
}
