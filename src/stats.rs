//! Per-thread scheduling counters.
//!
//! Counters are updated with relaxed atomics; they are diagnostics, not
//! synchronization. All counters except `num_given_jobs` are written by the
//! owning thread; `num_given_jobs` is bumped on the victim's behalf by the
//! thief that took the job.

use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "profile")]
use std::time::{Duration, Instant};

/// A snapshot of one worker thread's scheduling counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadStats {
    /// Jobs pushed onto this worker's deque.
    pub num_enqueued_jobs: u64,
    /// Jobs this worker ran to completion.
    pub num_executed_jobs: u64,
    /// Jobs this worker took from other workers' deques.
    pub num_stolen_jobs: u64,
    /// Steal attempts made by this worker, successful or not.
    pub num_attempted_stealings: u64,
    /// Jobs taken from this worker's deque by other workers.
    pub num_given_jobs: u64,
    /// Wall-clock time since the worker's queue was initialized.
    #[cfg(feature = "profile")]
    pub total_time: Duration,
    /// Time this worker spent inside job bodies.
    #[cfg(feature = "profile")]
    pub running_time: Duration,
}

pub(crate) struct Counters {
    enqueued: AtomicU64,
    executed: AtomicU64,
    stolen: AtomicU64,
    attempted_stealings: AtomicU64,
    given: AtomicU64,
    #[cfg(feature = "profile")]
    started_at: Instant,
    #[cfg(feature = "profile")]
    running_micros: AtomicU64,
}

impl Counters {
    pub(crate) fn new() -> Counters {
        Counters {
            enqueued: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
            attempted_stealings: AtomicU64::new(0),
            given: AtomicU64::new(0),
            #[cfg(feature = "profile")]
            started_at: Instant::now(),
            #[cfg(feature = "profile")]
            running_micros: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn count_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn count_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn count_stolen(&self) {
        self.stolen.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn count_attempted_stealing(&self) {
        self.attempted_stealings.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn count_given(&self) {
        self.given.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(feature = "profile")]
    #[inline(always)]
    pub(crate) fn add_running_time(&self, elapsed: Duration) {
        self.running_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ThreadStats {
        ThreadStats {
            num_enqueued_jobs: self.enqueued.load(Ordering::Relaxed),
            num_executed_jobs: self.executed.load(Ordering::Relaxed),
            num_stolen_jobs: self.stolen.load(Ordering::Relaxed),
            num_attempted_stealings: self.attempted_stealings.load(Ordering::Relaxed),
            num_given_jobs: self.given.load(Ordering::Relaxed),
            #[cfg(feature = "profile")]
            total_time: self.started_at.elapsed(),
            #[cfg(feature = "profile")]
            running_time: Duration::from_micros(self.running_micros.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let counters = Counters::new();
        counters.count_enqueued();
        counters.count_enqueued();
        counters.count_executed();
        counters.count_attempted_stealing();
        counters.count_stolen();
        counters.count_given();

        let stats = counters.snapshot();
        assert_eq!(stats.num_enqueued_jobs, 2);
        assert_eq!(stats.num_executed_jobs, 1);
        assert_eq!(stats.num_attempted_stealings, 1);
        assert_eq!(stats.num_stolen_jobs, 1);
        assert_eq!(stats.num_given_jobs, 1);
    }

    #[cfg(feature = "profile")]
    #[test]
    fn running_time_accumulates() {
        let counters = Counters::new();
        counters.add_running_time(Duration::from_micros(250));
        counters.add_running_time(Duration::from_micros(250));
        assert_eq!(counters.snapshot().running_time, Duration::from_micros(500));
    }
}
