//! Per-action rate limiting
//!
//! Each remote action gets one [`RateLimiter`] enforcing a minimum spacing
//! between consecutive permitted calls. The limiter is shared by every worker
//! and every query of one manager: the log service quota is per account, not
//! per query.
//!
//! The last-permit instant lives behind an async mutex, so waiters queue on
//! the lock and the one holding it sleeps out the remaining delay before
//! stamping the new permit. A zero delay disables limiting entirely.
//!
//! [`RateLimiter::acquire`] gives up when its cancellation token fires;
//! [`RateLimiter::wait`] always ends in a permit.
//!
//! # Example
//!
//! ```rust
//! use logquery::rate_limit::RateLimiter;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(Duration::from_millis(10));
//! let cancel = CancellationToken::new();
//! limiter.acquire(&cancel).await.unwrap();
//! limiter.acquire(&cancel).await.unwrap(); // waits ~10ms
//! # }
//! ```

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::Action;

/// Returned when a wait for a permit is cancelled
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

/// Minimum-spacing gate for one action
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    /// Instant of the last permitted call
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the given minimum spacing
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last: Mutex::new(None),
        }
    }

    /// Minimum spacing between permits
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Wait for a permit
    ///
    /// Returns once at least `min_delay` has passed since the previous
    /// permit, or `Err(Cancelled)` as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = self.wait() => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }

    /// Wait for a permit with no way to give up
    ///
    /// Dropping the future before it completes leaves the limiter unchanged.
    pub async fn wait(&self) {
        if self.min_delay.is_zero() {
            return;
        }

        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.min_delay).await;
        }
        *last = Some(Instant::now());
    }
}

/// One limiter per action, owned by a manager
#[derive(Debug)]
pub struct RateLimiters {
    limiters: [RateLimiter; 3],
}

impl RateLimiters {
    /// Create limiters from a per-action minimum delay function
    pub fn new(min_delay: impl Fn(Action) -> Duration) -> Self {
        Self {
            limiters: Action::ALL.map(|a| RateLimiter::new(min_delay(a))),
        }
    }

    /// Limiter for one action
    pub fn get(&self, action: Action) -> &RateLimiter {
        &self.limiters[action.index()]
    }

    /// Wait for a permit for one action
    pub async fn acquire(&self, action: Action, cancel: &CancellationToken) -> Result<(), Cancelled> {
        self.get(action).acquire(cancel).await
    }

    /// Wait for a permit for one action, without cancellation
    pub async fn wait(&self, action: Action) {
        self.get(action).wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_zero_delay_never_waits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        for _ in 0..100 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_spacing_enforced() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire(&cancel).await.unwrap();
        }
        // First permit is immediate, the next four wait 50ms each
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_spacing_enforced_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(40)));
        let start = std::time::Instant::now();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                limiter.acquire(&cancel).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled wait returns promptly")
            .unwrap();
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_wait_spacing_and_dropped_wait() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = std::time::Instant::now();
        limiter.wait().await;

        // A wait abandoned part way does not take a permit
        let abandoned = tokio::time::timeout(Duration::from_millis(10), limiter.wait()).await;
        assert!(abandoned.is_err());

        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(limiter.acquire(&cancel).await, Err(Cancelled));
    }

    #[test]
    fn test_limiters_per_action() {
        let limiters = RateLimiters::new(|a| match a {
            Action::StartQuery => Duration::from_secs(1),
            _ => Duration::ZERO,
        });
        assert_eq!(limiters.get(Action::StartQuery).min_delay(), Duration::from_secs(1));
        assert_eq!(limiters.get(Action::StopQuery).min_delay(), Duration::ZERO);
    }
}
