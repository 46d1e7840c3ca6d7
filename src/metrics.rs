//! Compiler Metrics
//!
//! Per-stage wall-clock timers and counters recorded during compilation.
//! The compiler populates one record per run; callers read it back through
//! a metrics sink or by inspecting the finished compiler.

use std::collections::BTreeMap;
use std::time::Duration;

/// Timing and counter record for a single compilation.
#[derive(Debug, Clone, Default)]
pub struct CompilerMetrics {
    timers: BTreeMap<String, Duration>,
    counters: BTreeMap<String, u64>,
}

impl CompilerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add elapsed time to the named timer.
    pub fn add_timer(&mut self, name: &str, elapsed: Duration) {
        *self.timers.entry(name.to_string()).or_default() += elapsed;
    }

    /// Increment the named counter.
    pub fn incr(&mut self, name: &str) {
        *self.counters.entry(name.to_string()).or_default() += 1;
    }

    /// Elapsed time of a timer, if recorded.
    pub fn timer(&self, name: &str) -> Option<Duration> {
        self.timers.get(name).copied()
    }

    /// Value of a counter, if recorded.
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    /// All timers, in sorted name order, as nanoseconds.
    pub fn timers_ns(&self) -> BTreeMap<String, u128> {
        self.timers
            .iter()
            .map(|(k, v)| (k.clone(), v.as_nanos()))
            .collect()
    }

    /// Reset all recorded values.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_accumulates() {
        let mut m = CompilerMetrics::new();
        m.add_timer("stage_x", Duration::from_millis(2));
        m.add_timer("stage_x", Duration::from_millis(3));
        assert_eq!(m.timer("stage_x"), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_counter_increments() {
        let mut m = CompilerMetrics::new();
        m.incr("modules_loaded");
        m.incr("modules_loaded");
        assert_eq!(m.counter("modules_loaded"), Some(2));
    }

    #[test]
    fn test_clear() {
        let mut m = CompilerMetrics::new();
        m.incr("c");
        m.clear();
        assert_eq!(m.counter("c"), None);
    }
}
