//! Memory-reclamation pause counters.
//!
//! Rust has no tracing collector of its own, but an application may run an
//! embedded runtime, arena compactor or cache sweeper that stops the world.
//! Such an application reports its pauses through a `GcProbe`; without one
//! the wrapper records zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Source of a cumulative, monotonically non-decreasing pause total.
pub trait GcProbe: Send + Sync {
    /// Total pause time since process start, or `None` when unavailable.
    fn total_pause(&self) -> Option<Duration>;
}

/// Probe for applications with nothing to report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGcProbe;

impl GcProbe for NoGcProbe {
    fn total_pause(&self) -> Option<Duration> {
        None
    }
}

/// Lock-free counter an application bumps after each pause.
#[derive(Debug, Default)]
pub struct PauseCounter {
    nanos: AtomicU64,
}

impl PauseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pause(&self, pause: Duration) {
        let nanos = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

impl GcProbe for PauseCounter {
    fn total_pause(&self) -> Option<Duration> {
        Some(Duration::from_nanos(self.nanos.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_counter_accumulates() {
        let counter = PauseCounter::new();
        assert_eq!(counter.total_pause(), Some(Duration::ZERO));
        counter.record_pause(Duration::from_micros(150));
        counter.record_pause(Duration::from_micros(50));
        assert_eq!(counter.total_pause(), Some(Duration::from_micros(200)));
    }

    #[test]
    fn no_probe_reports_nothing() {
        assert_eq!(NoGcProbe.total_pause(), None);
    }
}
