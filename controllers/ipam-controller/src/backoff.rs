//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciliations. The delay grows along the
//! Fibonacci sequence (slower than exponential) and is tracked per object,
//! so one request stuck on a flaky API call does not slow down the others.
//!
//! Default sequence: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 34s, 55s, 60s (max).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, capped at `max_secs`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a new backoff starting at `min_secs` and capped at `max_secs`.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current_secs;
        let next = self.prev_secs.saturating_add(self.current_secs);
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        Duration::from_secs(result)
    }
}

/// Per-object backoff state, keyed by object name
#[derive(Debug)]
pub struct RequeueBackoff {
    min_secs: u64,
    max_secs: u64,
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new(1, 60)
    }
}

impl RequeueBackoff {
    /// Create per-object backoff whose sequences start at `min_secs` and cap at `max_secs`.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            max_secs,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the next attempt for `key`; each call counts one more failure.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min_secs, self.max_secs))
            .next_delay()
    }

    /// Forget the failure history of `key` after a successful reconciliation.
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(backoff: &mut FibonacciBackoff) -> u64 {
        backoff.next_delay().as_secs()
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 60);
        let seq: Vec<u64> = (0..12).map(|_| secs(&mut backoff)).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 60, 60]);
    }

    #[test]
    fn test_fibonacci_backoff_custom_floor() {
        let mut backoff = FibonacciBackoff::new(2, 30);
        let seq: Vec<u64> = (0..7).map(|_| secs(&mut backoff)).collect();
        assert_eq!(seq, vec![2, 2, 4, 6, 10, 16, 26]);
        assert_eq!(secs(&mut backoff), 30);
    }

    #[test]
    fn test_requeue_backoff_is_per_key() {
        let backoff = RequeueBackoff::new(1, 10);
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(2));
        assert_eq!(backoff.next_delay("b"), Duration::from_secs(1));
        
        backoff.reset("a");
        assert_eq!(backoff.next_delay("a"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("b"), Duration::from_secs(1));
        assert_eq!(backoff.next_delay("b"), Duration::from_secs(2));
    }
}
