//! Token-bucket rate limiting for IAM reads
//!
//! The IAM `keys.list` quota is per minute, so ground-truth lookups wait for a
//! token here before calling the API. The bucket holds a single token (no
//! burst): each caller reserves the next free slot under the lock and then
//! sleeps until it arrives, so waiters are served in reservation order.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default IAM read quota, per minute
pub const DEFAULT_IAM_READS_PER_MINUTE: u32 = 5500;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

#[derive(Debug)]
pub struct RateLimiter {
    /// Time between two tokens
    interval: Duration,
    /// Earliest instant the next token can be handed out
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    /// A limiter releasing `per_minute` tokens per minute, evenly spaced.
    ///
    /// A rate of zero is treated as one per minute.
    pub fn per_minute(per_minute: u32) -> Self {
        let interval = Duration::from_secs(60) / per_minute.max(1);
        Self::with_interval(interval)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_free: Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for a token, or until `cancel` fires.
    ///
    /// A reservation abandoned through cancellation is not returned to the
    /// bucket.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let slot = self.reserve();
        if slot <= Instant::now() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep_until(slot) => Ok(()),
        }
    }

    fn reserve(&self) -> Instant {
        let mut next_free = self.next_free.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = (*next_free).max(Instant::now());
        *next_free = slot + self.interval;
        slot
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_minute(DEFAULT_IAM_READS_PER_MINUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(RateLimiter::per_minute(60).interval(), Duration::from_secs(1));
        assert_eq!(
            RateLimiter::per_minute(5500).interval(),
            Duration::from_secs(60) / 5500
        );
        assert_eq!(RateLimiter::per_minute(0).interval(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_token_is_immediate() {
        let limiter = RateLimiter::per_minute(60);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_spaced_by_interval() {
        let limiter = RateLimiter::per_minute(60);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_the_rate() {
        let limiter = Arc::new(RateLimiter::per_minute(120));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    limiter.wait(&cancel).await.unwrap();
                    start.elapsed()
                })
            })
            .collect();

        let mut elapsed: Vec<Duration> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        elapsed.sort();

        assert_eq!(elapsed[0], Duration::ZERO);
        assert_eq!(elapsed[9], Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_does_not_accumulate_burst() {
        let limiter = RateLimiter::per_minute(60);
        let cancel = CancellationToken::new();

        limiter.wait(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let limiter = Arc::new(RateLimiter::per_minute(1));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let limiter = RateLimiter::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(limiter.wait(&cancel).await, Err(Cancelled));
    }
}
