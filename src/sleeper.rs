//! The wait between capacity checks while the engine is full.
//!
//! [`DeadLetterConsumer`](crate::DeadLetterConsumer) sleeps through a [`Sleeper`] so tests can
//! observe each poll. [`TokioSleeper`] is the default; [`TrackingSleeper`] records the
//! requested waits and returns after a single yield.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Boxed future returned by [`Sleeper::sleep`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Waits out a capacity poll interval.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, interval: Duration) -> SleepFuture;
}

/// Sleeps on the tokio timer, so paused-clock tests advance it deterministically.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, interval: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(interval))
    }
}

/// Records each poll interval it is asked to wait.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    intervals: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity polls waited so far.
    pub fn calls(&self) -> usize {
        self.intervals.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.intervals.lock().unwrap_or_else(PoisonError::into_inner).get(index).copied()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, interval: Duration) -> SleepFuture {
        self.intervals.lock().unwrap_or_else(PoisonError::into_inner).push(interval);
        Box::pin(tokio::task::yield_now())
    }
}
