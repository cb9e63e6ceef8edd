//! Global command dispatch limits.
//!
//! Two limits apply to every command regardless of session: a cap on
//! concurrently executing commands and a rolling rate limit on command
//! starts. Acquisition suspends; nothing busy-waits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Default cap on in-flight commands.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
/// Default command starts per second.
pub const DEFAULT_MAX_PER_SECOND: usize = 3;

/// Enforces the global concurrency and rate limits.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    semaphore:      Arc<Semaphore>,
    starts:         Arc<Mutex<VecDeque<Instant>>>,
    max_per_second: usize,
}

/// Held for the duration of one command execution.
#[derive(Debug)]
pub struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
}

impl CommandDispatcher {
    /// Create a dispatcher with explicit limits.
    #[must_use]
    pub fn new(max_concurrent: usize, max_per_second: usize) -> Self {
        Self {
            semaphore:      Arc::new(Semaphore::new(max_concurrent.max(1))),
            starts:         Arc::new(Mutex::new(VecDeque::new())),
            max_per_second: max_per_second.max(1),
        }
    }

    /// Wait for a concurrency slot and a rate-limit slot.
    pub async fn acquire(&self) -> DispatchPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("dispatcher semaphore never closes");

        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let window_start = Instant::now() - Duration::from_secs(1);
                while starts.front().is_some_and(|t| *t < window_start) {
                    starts.pop_front();
                }
                if starts.len() < self.max_per_second {
                    starts.push_back(Instant::now());
                    None
                } else {
                    // Sleep until the oldest start leaves the window.
                    starts
                        .front()
                        .map(|oldest| (*oldest + Duration::from_secs(1)).duration_since(Instant::now()))
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    debug!(?delay, "rate limited, deferring command start");
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }

        DispatchPermit { _permit: permit }
    }

    /// Currently available concurrency slots.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_cap() {
        let dispatcher = CommandDispatcher::new(2, 100);
        let p1 = dispatcher.acquire().await;
        let _p2 = dispatcher.acquire().await;
        assert_eq!(dispatcher.available_slots(), 0);

        drop(p1);
        let _p3 = dispatcher.acquire().await;
        assert_eq!(dispatcher.available_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_defers_fourth_start() {
        let dispatcher = CommandDispatcher::new(10, 3);
        let start = Instant::now();

        let _a = dispatcher.acquire().await;
        let _b = dispatcher.acquire().await;
        let _c = dispatcher.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        // Fourth start must wait for the window to roll.
        let _d = dispatcher.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }
}
