//! Injizierbare monotone Uhr
//!
//! Alle Zeitentscheidungen der Pipeline (Cipher-Ablauf, Ratchet-Ablauf,
//! Passthrough-Fenster, Statistik-Kadenz) laufen ueber diese
//! Schnittstelle, damit Tests die Zeit von Hand vorruecken koennen.
//!
//! Ein `TimePoint` ist die seit dem Uhr-Start vergangene Dauer;
//! `TIME_MAX` dient als "nie"-Sentinel.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotoner Zeitpunkt: Dauer seit dem Start der Uhr
pub type TimePoint = Duration;

/// Sentinel fuer "laeuft nie ab"
pub const TIME_MAX: TimePoint = Duration::MAX;

/// Monotone Zeitquelle
pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> TimePoint;
}

/// Produktionsuhr auf Basis von `Instant`
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> TimePoint {
        self.start.elapsed()
    }
}

/// Von Hand vorgerueckte Uhr fuer Tests
#[derive(Debug, Default)]
pub struct ManualClock {
    current: Mutex<TimePoint>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rueckt die Uhr um `delta` vor
    pub fn advance(&self, delta: Duration) {
        let mut current = self.current.lock();
        *current = current.saturating_add(delta);
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> TimePoint {
        *self.current.lock()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_ist_monoton() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_startet_bei_null() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn manual_clock_vorruecken() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(5));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(5500));
    }
}
