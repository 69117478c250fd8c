//! Thread-safe progress and ETA tracking.
//!
//! Workers call [`ProgressTracker::record`] as each task finishes and get a
//! consistent [`ProgressSnapshot`] back. The tracker only observes; it never
//! influences scheduling.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    completed: usize,
    succeeded: usize,
    failed: usize,
}

/// Counts finished tasks against a known total.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    started: Instant,
    counters: Mutex<Counters>,
}

/// Progress as of one recorded completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed: Duration,
    /// Mean time per completed task.
    pub average: Duration,
    /// `remaining × elapsed / completed`; zero once everything is done.
    pub eta: Duration,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Record one finished task.
    pub fn record(&self, success: bool) -> ProgressSnapshot {
        self.record_at(self.started.elapsed(), success)
    }

    /// Record one finished task as if `elapsed` had passed since the start.
    pub fn record_at(&self, elapsed: Duration, success: bool) -> ProgressSnapshot {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.completed += 1;
        if success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
        }
        self.snapshot_of(&counters, elapsed)
    }

    /// Current progress without recording anything.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshot_of(&counters, self.started.elapsed())
    }

    fn snapshot_of(&self, counters: &Counters, elapsed: Duration) -> ProgressSnapshot {
        let (average, eta) = if counters.completed == 0 {
            (Duration::ZERO, Duration::ZERO)
        } else {
            let average = elapsed / counters.completed as u32;
            let remaining = self.total.saturating_sub(counters.completed);
            (average, average * remaining as u32)
        };
        ProgressSnapshot {
            completed: counters.completed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            total: self.total,
            elapsed,
            average,
            eta,
        }
    }
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({:.0}%) ok {} failed {}, elapsed {}, eta {}",
            self.completed,
            self.total,
            self.percent(),
            self.succeeded,
            self.failed,
            format_duration(self.elapsed),
            format_duration(self.eta)
        )
    }
}

/// `1m05s`, `42s`, `1h02m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
