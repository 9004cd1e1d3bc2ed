//! Per-key token bucket rate limiting
//!
//! Each key (typically the caller's IP) owns one bucket holding up to `limit`
//! tokens. Tokens refill continuously at `limit / window`. A request consumes one
//! token; with less than one token available the request is denied.
//!
//! State is owned by a `RequestGate` value that lives in application state and is
//! cloned into handlers. It is single-process: running several replicas multiplies
//! the effective limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Token bucket for a single key
#[derive(Debug, Clone)]
struct RateBucket {
    /// Always within `[0, limit]`
    tokens: f64,
    last_refill_at: Instant,
    /// Window of the most recent check, used to decide when an idle bucket is full again
    window: Duration,
}

impl RateBucket {
    fn full(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            tokens: f64::from(limit),
            last_refill_at: now,
            window,
        }
    }

    fn refill(&mut self, limit: u32, window: Duration, now: Instant) {
        let cap = f64::from(limit);

        if window.is_zero() {
            self.tokens = cap;
        } else {
            let elapsed = now.saturating_duration_since(self.last_refill_at);
            let rate = cap / window.as_secs_f64();
            self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(cap);
        }

        // Limits can shrink between calls
        self.tokens = self.tokens.clamp(0.0, cap);

        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
        self.window = window;
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining: u32,
    /// Time until the next token is available, when denied
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    /// Seconds for a `Retry-After` header, rounded up
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs_f64().ceil().max(1.0) as u64)
    }
}

/// In-memory per-key token bucket limiter
#[derive(Debug, Clone, Default)]
pub struct RequestGate {
    buckets: Arc<Mutex<HashMap<String, RateBucket>>>,
}

impl RequestGate {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// Consume a token for `key` if one is available
    pub async fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        self.check(key, limit, window).await.allowed
    }

    /// Like `allow`, but reports remaining tokens and retry delay
    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitResult {
        self.check_at(key, limit, window, Instant::now()).await
    }

    /// Check against an explicit clock reading
    pub async fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateLimitResult {
        if limit == 0 {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after: Some(window),
            };
        }

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateBucket::full(limit, window, now));

        bucket.refill(limit, window, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitResult {
                allowed: true,
                remaining: bucket.tokens.floor() as u32,
                retry_after: None,
            }
        } else {
            let rate = f64::from(limit) / window.as_secs_f64();
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / rate);
            tracing::debug!(key = %key, retry_after_ms = wait.as_millis() as u64, "Rate limit exceeded");
            RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after: Some(wait),
            }
        }
    }

    /// Current token count for a key, if it has a bucket
    pub async fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.lock().await.get(key).map(|b| b.tokens)
    }

    /// Number of tracked keys
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    /// Drop buckets that have been idle for a full window.
    ///
    /// Such a bucket would have refilled to capacity, so forgetting it is
    /// indistinguishable from keeping it.
    pub async fn cleanup(&self) {
        self.cleanup_at(Instant::now()).await;
    }

    pub async fn cleanup_at(&self, now: Instant) {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill_at) < bucket.window);
        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = buckets.len(), "Evicted idle rate limit buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_first_request_allowed() {
        let gate = RequestGate::new_in_memory();
        let result = gate.check("10.0.0.1", 60, MINUTE).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 59);
        assert!(result.retry_after.is_none());
    }

    #[tokio::test]
    async fn test_61st_request_in_a_minute_denied_then_allowed_after_window() {
        let gate = RequestGate::new_in_memory();
        let start = Instant::now();

        for i in 0..60 {
            let result = gate.check_at("10.0.0.1", 60, MINUTE, start).await;
            assert!(result.allowed, "request {} should be allowed", i + 1);
        }

        let result = gate.check_at("10.0.0.1", 60, MINUTE, start).await;
        assert!(!result.allowed, "61st request should be denied");
        assert_eq!(result.retry_after_seconds(), Some(1));

        let later = start + MINUTE;
        assert!(gate.check_at("10.0.0.1", 60, MINUTE, later).await.allowed);
    }

    #[tokio::test]
    async fn test_refill_is_proportional_to_elapsed_time() {
        let gate = RequestGate::new_in_memory();
        let start = Instant::now();

        for _ in 0..10 {
            gate.check_at("k", 10, Duration::from_secs(10), start).await;
        }
        assert!(!gate.check_at("k", 10, Duration::from_secs(10), start).await.allowed);

        // 3 seconds at 1 token/s refills 3 tokens
        let later = start + Duration::from_secs(3);
        for _ in 0..3 {
            assert!(gate.check_at("k", 10, Duration::from_secs(10), later).await.allowed);
        }
        assert!(!gate.check_at("k", 10, Duration::from_secs(10), later).await.allowed);
    }

    #[tokio::test]
    async fn test_tokens_stay_within_bounds() {
        let gate = RequestGate::new_in_memory();
        let start = Instant::now();

        for step in 0..200u64 {
            let now = start + Duration::from_millis(step * 137);
            gate.check_at("k", 5, Duration::from_secs(2), now).await;
            let tokens = gate.tokens("k").await.unwrap();
            assert!((0.0..=5.0).contains(&tokens), "tokens out of range: {}", tokens);
        }

        // A long idle period never overfills
        gate.check_at("k", 5, Duration::from_secs(2), start + Duration::from_secs(3600))
            .await;
        assert!(gate.tokens("k").await.unwrap() <= 5.0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let gate = RequestGate::new_in_memory();
        let start = Instant::now();

        for _ in 0..3 {
            gate.check_at("a", 3, MINUTE, start).await;
        }
        assert!(!gate.check_at("a", 3, MINUTE, start).await.allowed);
        assert!(gate.check_at("b", 3, MINUTE, start).await.allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_always_denies() {
        let gate = RequestGate::new_in_memory();
        assert!(!gate.allow("k", 0, MINUTE).await);
        assert!(gate.is_empty().await);
    }

    #[tokio::test]
    async fn test_clock_going_backwards_does_not_refill() {
        let gate = RequestGate::new_in_memory();
        let start = Instant::now() + Duration::from_secs(10);

        gate.check_at("k", 1, MINUTE, start).await;
        let earlier = start - Duration::from_secs(5);
        assert!(!gate.check_at("k", 1, MINUTE, earlier).await.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_limit() {
        let gate = RequestGate::new_in_memory();
        let mut handles = Vec::new();

        for _ in 0..50 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.allow("shared", 20, Duration::from_secs(3600)).await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test]
    async fn test_cleanup_only_evicts_refilled_buckets() {
        let gate = RequestGate::new_in_memory();
        let start = Instant::now();

        gate.check_at("idle", 10, MINUTE, start).await;
        gate.check_at("busy", 10, MINUTE, start + Duration::from_secs(50)).await;

        gate.cleanup_at(start + Duration::from_secs(70)).await;

        assert!(gate.tokens("idle").await.is_none());
        assert!(gate.tokens("busy").await.is_some());
        assert_eq!(gate.len().await, 1);
    }
}
