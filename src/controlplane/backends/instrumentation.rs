//! Driver instrumentation
//!
//! Failure injection and call accounting shared by the in-memory drivers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Failure to raise from an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Generic backend failure
    Error,
    /// Backend object missing
    NotFound,
    /// Object busy (snapshots with dependents)
    Busy,
}

/// Per-driver call accounting and injected failures
#[derive(Default)]
pub struct Instrumentation {
    failures: Mutex<HashMap<&'static str, Failure>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

/// Marks one call in flight until dropped
pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Instrumentation {
    /// Make every call to `operation` fail until cleared
    pub fn fail_on(&self, operation: &'static str, failure: Failure) {
        self.failures.lock().insert(operation, failure);
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.failures.lock().remove(operation);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Record a call; returns the in-flight marker and any injected failure
    pub async fn enter(&self, operation: &'static str) -> (InFlight, Option<Failure>) {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let marker = InFlight {
            counter: self.in_flight.clone(),
        };

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().get(operation).copied();
        (marker, failure)
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Highest number of calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_and_failures() {
        let inst = Instrumentation::default();
        inst.fail_on("delete_volume", Failure::NotFound);

        let (_m, failure) = inst.enter("delete_volume").await;
        assert_eq!(failure, Some(Failure::NotFound));
        let (_n, failure) = inst.enter("create_volume").await;
        assert!(failure.is_none());

        assert_eq!(inst.calls("delete_volume"), 1);
        assert_eq!(inst.total_calls(), 2);
        assert_eq!(inst.max_in_flight(), 2);

        inst.clear_failure("delete_volume");
        let (_o, failure) = inst.enter("delete_volume").await;
        assert!(failure.is_none());
    }
}
