// src/harvest/monitor.rs
// =============================================================================
// Request statistics and the block-rate circuit breaker.
//
// Workers bump counters after every fetch. The monitor wakes up every
// `interval`, takes the counters of the last window (resetting them), logs
// them, and ends the run if too many requests were blocked.
// =============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::HarvestError;

/// Counters for a span of requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub fetched: u64,
    pub not_found: u64,
    pub errors: u64,
    pub blocked: u64,
}

impl Stats {
    /// Requests that produced a record.
    pub fn found(&self) -> u64 {
        self.fetched
            .saturating_sub(self.not_found)
            .saturating_sub(self.errors)
            .saturating_sub(self.blocked)
    }

    pub fn fill_rate(&self) -> f64 {
        self.rate(self.found())
    }

    pub fn error_rate(&self) -> f64 {
        self.rate(self.errors)
    }

    pub fn block_rate(&self) -> f64 {
        self.rate(self.blocked)
    }

    /// Requests per second over a window of the given length.
    pub fn request_rate(&self, window: Duration) -> f64 {
        let secs = window.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.fetched as f64 / secs
        }
    }

    fn rate(&self, count: u64) -> f64 {
        if self.fetched == 0 {
            0.0
        } else {
            count as f64 / self.fetched as f64
        }
    }

    fn add(&mut self, other: &Stats) {
        self.fetched += other.fetched;
        self.not_found += other.not_found;
        self.errors += other.errors;
        self.blocked += other.blocked;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Requests: {}, fill rate: {:.1}%, error rate: {:.1}%, block rate: {:.1}%",
            self.fetched,
            self.fill_rate() * 100.0,
            self.error_rate() * 100.0,
            self.block_rate() * 100.0
        )
    }
}

/// Which counter a worker bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Fetched,
    NotFound,
    Error,
    Blocked,
}

#[derive(Debug, Default)]
struct Counters {
    window: Stats,
    total: Stats,
}

/// Stats shared between workers and the monitor.
#[derive(Debug, Clone, Default)]
pub struct SharedStats {
    inner: Arc<Mutex<Counters>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, counter: Counter) {
        let mut counters = self.inner.lock().await;
        let window = &mut counters.window;
        match counter {
            Counter::Fetched => window.fetched += 1,
            Counter::NotFound => window.not_found += 1,
            Counter::Error => window.errors += 1,
            Counter::Blocked => window.blocked += 1,
        }
    }

    /// Returns the current window and starts a new one.
    pub async fn take_window(&self) -> Stats {
        let mut counters = self.inner.lock().await;
        let window = std::mem::take(&mut counters.window);
        counters.total.add(&window);
        window
    }

    /// Everything counted since the run started.
    pub async fn totals(&self) -> Stats {
        let counters = self.inner.lock().await;
        let mut total = counters.total;
        total.add(&counters.window);
        total
    }
}

/// Periodically reports stats and trips when the block rate is too high.
#[derive(Debug)]
pub struct Monitor {
    stats: SharedStats,
    interval: Duration,
    threshold: f64,
}

impl Monitor {
    pub fn new(stats: SharedStats, interval: Duration, threshold: f64) -> Self {
        Self {
            stats,
            interval,
            threshold,
        }
    }

    /// Runs until the block rate of a window reaches the threshold.
    ///
    /// This never returns on its own otherwise; the harvester drops it
    /// once the pipeline is done.
    pub async fn run(self) -> HarvestError {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let window = self.stats.take_window().await;
            info!("{}s average stats: {}", self.interval.as_secs(), window);
            info!("Request rate: {:.2} req/s", window.request_rate(self.interval));
            if let Err(e) = self.check(&window) {
                return e;
            }
        }
    }

    /// Judges one window of stats.
    pub fn check(&self, window: &Stats) -> Result<(), HarvestError> {
        if window.fetched > 0 && window.block_rate() >= self.threshold {
            return Err(HarvestError::CircuitOpen {
                block_rate: window.block_rate(),
                window_secs: self.interval.as_secs(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(fetched: u64, not_found: u64, errors: u64, blocked: u64) -> Stats {
        Stats {
            fetched,
            not_found,
            errors,
            blocked,
        }
    }

    #[test]
    fn test_rates() {
        let s = stats(10, 5, 2, 1);
        assert_eq!(s.found(), 2);
        assert!((s.fill_rate() - 0.2).abs() < 1e-9);
        assert!((s.error_rate() - 0.2).abs() < 1e-9);
        assert!((s.block_rate() - 0.1).abs() < 1e-9);
        assert_eq!(Stats::default().block_rate(), 0.0);
    }

    #[test]
    fn test_request_rate() {
        assert_eq!(stats(240, 0, 0, 0).request_rate(Duration::from_secs(120)), 2.0);
        assert_eq!(stats(5, 0, 0, 0).request_rate(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            stats(4, 2, 1, 0).to_string(),
            "Requests: 4, fill rate: 25.0%, error rate: 25.0%, block rate: 0.0%"
        );
    }

    #[test]
    fn test_check_threshold() {
        let monitor = Monitor::new(SharedStats::new(), Duration::from_secs(120), 0.1);
        assert!(monitor.check(&stats(0, 0, 0, 0)).is_ok());
        assert!(monitor.check(&stats(100, 0, 0, 9)).is_ok());
        assert!(matches!(
            monitor.check(&stats(100, 0, 0, 10)),
            Err(HarvestError::CircuitOpen { window_secs: 120, .. })
        ));
    }

    #[tokio::test]
    async fn test_window_resets_but_totals_accumulate() {
        let shared = SharedStats::new();
        shared.record(Counter::Fetched).await;
        shared.record(Counter::Fetched).await;
        shared.record(Counter::Blocked).await;

        assert_eq!(shared.take_window().await, stats(2, 0, 0, 1));
        assert_eq!(shared.take_window().await, Stats::default());

        shared.record(Counter::Fetched).await;
        shared.record(Counter::NotFound).await;
        assert_eq!(shared.totals().await, stats(3, 1, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_trips_after_a_bad_window() {
        let shared = SharedStats::new();
        for _ in 0..10 {
            shared.record(Counter::Fetched).await;
        }
        shared.record(Counter::Blocked).await;
        shared.record(Counter::Blocked).await;

        let monitor = Monitor::new(shared.clone(), Duration::from_secs(120), 0.1);
        let error = monitor.run().await;
        assert!(matches!(error, HarvestError::CircuitOpen { .. }));
        assert_eq!(shared.totals().await.blocked, 2);
    }
}
