//! Per-backend call gate
//!
//! Bounds how many external calls run against one backend at a time and
//! spaces out its status polls.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Semaphore plus poll rate limiter guarding one backend
#[derive(Debug)]
pub struct CallGate {
    semaphore: Semaphore,
    min_poll_interval: Duration,
    next_poll_at: Mutex<Option<Instant>>,
}

impl CallGate {
    /// Creates a gate admitting `max_concurrent_calls` calls at once
    pub fn new(max_concurrent_calls: usize, min_poll_interval: Duration) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent_calls.max(1)),
            min_poll_interval,
            next_poll_at: Mutex::new(None),
        }
    }

    /// Runs an external call once a concurrency slot is free
    pub async fn run<F>(&self, call: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so acquiring only fails in theory
        let _permit = self.semaphore.acquire().await.ok();
        call.await
    }

    /// Runs a status poll, waiting for the rate limiter first
    pub async fn run_poll<F>(&self, call: F) -> F::Output
    where
        F: Future,
    {
        self.wait_for_poll_slot().await;
        self.run(call).await
    }

    /// Reserves the next poll slot and sleeps until it arrives
    async fn wait_for_poll_slot(&self) {
        let slot = {
            let mut next = self.next_poll_at.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_poll_interval);
            slot
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!("Poll rate limit reached, waiting {:?}", wait);
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Calls that could start right now
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
