use std::time::Duration;

use tokio::time::Instant;

use maestro_core::config::{BackoffConfig, RateLimitConfig};

/// Fixed-window request counter. The window resets lazily on the first
/// acquire after it has elapsed; nothing runs in the background.
#[derive(Debug)]
pub struct FixedWindow {
    max_requests: u32,
    window: Duration,
    count: u32,
    reset_at: Instant,
}

impl FixedWindow {
    pub fn new(config: &RateLimitConfig) -> Self {
        let window = Duration::from_millis(config.window_ms);
        Self {
            max_requests: config.max_requests,
            window,
            count: 0,
            reset_at: Instant::now() + window,
        }
    }

    /// Take one slot, or return the milliseconds until the window resets.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), u64> {
        if self.is_elapsed(now) {
            self.count = 0;
            self.reset_at = now + self.window;
        }
        if self.count >= self.max_requests {
            return Err(self.retry_after_ms(now));
        }
        self.count += 1;
        Ok(())
    }

    pub fn is_elapsed(&self, now: Instant) -> bool {
        now >= self.reset_at
    }

    pub fn retry_after_ms(&self, now: Instant) -> u64 {
        self.reset_at.saturating_duration_since(now).as_millis() as u64
    }

    pub fn used(&self) -> u32 {
        self.count
    }
}

/// Advisory delay after the `failures`-th consecutive failure (1-based):
/// `min(base * 2^(failures-1), max)`.
pub fn backoff_delay_ms(config: &BackoffConfig, failures: u32) -> u64 {
    let exp = failures.saturating_sub(1).min(63);
    config
        .base_delay_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max_requests: u32, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_exhausts_and_resets() {
        let mut window = FixedWindow::new(&limit(2, 1000));
        let now = Instant::now();
        assert!(window.try_acquire(now).is_ok());
        assert!(window.try_acquire(now).is_ok());
        assert_eq!(window.try_acquire(now), Err(1000));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(window.try_acquire(Instant::now()), Err(600));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(window.try_acquire(Instant::now()).is_ok());
        assert_eq!(window.used(), 1);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let config = BackoffConfig {
            base_delay_ms: 500,
            max_delay_ms: 3000,
            max_retries: 5,
        };
        assert_eq!(backoff_delay_ms(&config, 1), 500);
        assert_eq!(backoff_delay_ms(&config, 2), 1000);
        assert_eq!(backoff_delay_ms(&config, 3), 2000);
        assert_eq!(backoff_delay_ms(&config, 4), 3000);
        assert_eq!(backoff_delay_ms(&config, 100), 3000);
    }
}
