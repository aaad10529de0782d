use std::time::{Duration, Instant};

/// A wall-clock stopwatch. Used to measure how long we spend executing guest
/// code natively so the cost can be charged against the simulated clock.
pub struct PerfTimer {
    start_time: Option<Instant>,
    elapsed: Duration,
}

impl PerfTimer {
    /// Create the timer, which starts running.
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            elapsed: Duration::ZERO,
        }
    }

    /// Start the timer, which must not already be running.
    pub fn start(&mut self) {
        debug_assert!(self.start_time.is_none());
        self.start_time = Some(Instant::now());
    }

    /// Stop the timer, which must already be running.
    pub fn stop(&mut self) {
        debug_assert!(self.start_time.is_some());
        if let Some(t) = self.start_time.take() {
            self.elapsed += Instant::now().duration_since(t)
        }
    }

    /// Total time elapsed while the timer has been running.
    pub fn elapsed(&self) -> Duration {
        let mut e = self.elapsed;
        if let Some(t) = self.start_time.as_ref() {
            e += Instant::now().duration_since(*t)
        }
        e
    }
}

impl Default for PerfTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_across_restarts() {
        let mut timer = PerfTimer::new();
        timer.stop();
        let first = timer.elapsed();
        timer.start();
        timer.stop();
        assert!(timer.elapsed() >= first);
    }
}
