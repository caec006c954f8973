//! 以令牌桶限制對行情來源的呼叫頻率。
//!
//! 桶內最多 capacity 個令牌，在 window 期間內等速補滿。
//! 多個輪詢流程可同時共用同一個限流器。

use std::time::Duration;

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

use crate::error::ConfigError;

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = capacity.min(self.tokens + elapsed * refill_per_sec);
        self.last_refill = now;
    }
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT",
                reason: "capacity must be greater than zero".to_string(),
            });
        }

        if window.is_zero() {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_WINDOW",
                reason: "window must be greater than zero".to_string(),
            });
        }

        let capacity = f64::from(capacity);

        Ok(RateLimiter {
            capacity,
            refill_per_sec: capacity / window.as_secs_f64(),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// 取得 weight 個令牌，不足時等待補充。weight 超過桶子容量時以容量計。
    pub async fn acquire(&self, weight: u32) {
        let weight = f64::from(weight.max(1)).min(self.capacity);

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(self.capacity, self.refill_per_sec);

                if bucket.tokens >= weight {
                    bucket.tokens -= weight;
                    return;
                }

                Duration::from_secs_f64((weight - bucket.tokens) / self.refill_per_sec)
            };

            sleep(wait).await;
        }
    }

    /// 嘗試立即取得令牌，不等待。
    pub async fn try_acquire(&self, weight: u32) -> bool {
        let weight = f64::from(weight.max(1)).min(self.capacity);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(self.capacity, self.refill_per_sec);

        if bucket.tokens >= weight {
            bucket.tokens -= weight;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_is_a_config_error() {
        let why = RateLimiter::new(0, Duration::from_secs(1)).unwrap_err();
        assert!(why.to_string().contains("RATE_LIMIT"));

        assert!(RateLimiter::new(3, Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_never_exceeds_capacity_within_a_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1)).unwrap();

        for _ in 0..3 {
            assert!(limiter.try_acquire(1).await);
        }
        assert!(!limiter.try_acquire(1).await);

        // 一個 window 過後令牌補滿
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..3 {
            assert!(limiter.try_acquire(1).await);
        }
        assert!(!limiter.try_acquire(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100)).unwrap();
        let started = Instant::now();

        limiter.acquire(1).await;
        limiter.acquire(1).await;

        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_safe_for_concurrent_callers() {
        let limiter = std::sync::Arc::new(RateLimiter::new(2, Duration::from_millis(100)).unwrap());
        let started = Instant::now();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let limiter = std::sync::Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire(1).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        // 四個呼叫、容量二，至少要等一輪補充
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_weight_is_clamped_to_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100)).unwrap();

        // 若不封頂這裡會永遠等不到
        limiter.acquire(10).await;
    }
}
