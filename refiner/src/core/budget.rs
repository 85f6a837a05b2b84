//! Global limits on a search run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Run-wide limits. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    /// Candidates that may be requested from the generator across the run.
    pub max_attempts: Option<usize>,
    /// Wall-clock limit for the whole run.
    pub max_duration: Option<Duration>,
    /// Deepest node depth the scheduler will create.
    pub max_depth: Option<u32>,
}

/// Shared counter of candidate attempts still available.
#[derive(Debug)]
pub struct AttemptBudget {
    remaining: Option<AtomicUsize>,
    exhausted: AtomicBool,
}

impl AttemptBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            remaining: limit.map(AtomicUsize::new),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Reserve up to `wanted` attempts and return how many were granted.
    ///
    /// A short grant marks the budget exhausted.
    pub fn reserve(&self, wanted: usize) -> usize {
        let Some(remaining) = &self.remaining else {
            return wanted;
        };
        let previous = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current - wanted.min(current))
            })
            .unwrap_or_else(|current| current);
        let granted = wanted.min(previous);
        if granted < wanted {
            self.exhausted.store(true, Ordering::SeqCst);
        }
        granted
    }

    /// True once a reservation could not be granted in full.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }
}
