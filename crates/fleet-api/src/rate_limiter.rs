//! Calls-per-window limiting for the detail endpoint.
//!
//! A sliding-window log: the issue instants of the last `max_calls` calls are
//! kept, and a new call is admitted only if fewer than `max_calls` of them
//! fall inside the trailing window. This bounds every rolling window, not just
//! aligned ones.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct WindowRateLimiter {
    max_calls: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl WindowRateLimiter {
    /// `max_calls` of zero is clamped to one so the limiter can make progress.
    pub fn new(max_calls: usize, window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            window,
            issued: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a call now if the window has room, else return how long until it will.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut issued = self.issued.lock();
        Self::evict(&mut issued, now, self.window);

        if issued.len() < self.max_calls {
            issued.push_back(now);
            return Ok(());
        }

        // Oldest entry is still inside the window; it leaves at oldest + window.
        let wait = issued
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        Err(wait.max(Duration::from_millis(1)))
    }

    /// Wait until a call may be issued and record it.
    ///
    /// # Cancel Safety
    ///
    /// The lock is only held inside the synchronous `try_acquire`; dropping
    /// the future while sleeping records nothing.
    pub async fn acquire(&self) -> Duration {
        let mut total_wait = Duration::ZERO;
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return total_wait,
                Err(wait) => wait,
            };
            trace!(wait = ?wait, "window full");
            tokio::time::sleep(wait).await;
            total_wait += wait;
        }
    }

    /// Calls recorded inside the trailing window.
    pub fn in_window(&self) -> usize {
        let mut issued = self.issued.lock();
        Self::evict(&mut issued, Instant::now(), self.window);
        issued.len()
    }

    fn evict(issued: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = issued.front() {
            if now.saturating_duration_since(*oldest) >= window {
                issued.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_until_full() {
        let limiter = WindowRateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());

        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(60));
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = WindowRateLimiter::new(2, Duration::from_secs(60));
        limiter.try_acquire().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.try_acquire().unwrap();

        assert_eq!(limiter.try_acquire().unwrap_err(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_slot() {
        let limiter = WindowRateLimiter::new(1, Duration::from_secs(10));
        assert_eq!(limiter.acquire().await, Duration::ZERO);

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancel_safe() {
        let limiter = Arc::new(WindowRateLimiter::new(1, Duration::from_secs(10)));
        limiter.try_acquire().unwrap();

        let waiter = limiter.clone();
        let handle = tokio::spawn(async move { waiter.acquire().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.abort();
        let _ = handle.await;

        // The aborted waiter recorded nothing.
        assert_eq!(limiter.in_window(), 1);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_respects_ceiling() {
        let limiter = Arc::new(WindowRateLimiter::new(5, Duration::from_secs(60)));
        let start = Instant::now();

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        for (i, at) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*at) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5);
        }
        assert!(admitted[11].duration_since(start) >= Duration::from_secs(120));
    }
}
