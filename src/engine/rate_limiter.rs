//! Per-model API rate limiting.
//!
//! Token bucket limiter keyed by model name, shared by every Claude node in
//! a run so concurrent workflows stay inside the account's request budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Request budget for one model.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per time window
    pub requests_per_window: u32,
    /// Time window duration
    pub window: Duration,
    /// Burst size (tokens available immediately)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            burst_size: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(60),
            burst_size: requests.min(10),
        }
    }

    pub fn per_second(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(1),
            burst_size: requests.min(5),
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst_size = burst;
        self
    }
}

/// Token bucket for a single model.
struct TokenBucket {
    /// Available tokens (scaled by 1000 for precision)
    tokens: AtomicU64,
    /// Maximum tokens (burst size * 1000)
    max_tokens: u64,
    /// Token refill rate per millisecond (scaled by 1000)
    refill_rate: u64,
    /// Last refill timestamp (unix millis)
    last_refill: AtomicU64,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let max_tokens = (config.burst_size as u64) * 1000;
        let window_millis = config.window.as_millis() as u64;
        let refill_rate = if window_millis > 0 {
            ((config.requests_per_window as u64) * 1000) / window_millis
        } else {
            config.requests_per_window as u64 * 1000
        };

        Self {
            tokens: AtomicU64::new(max_tokens),
            max_tokens,
            refill_rate,
            last_refill: AtomicU64::new(now_millis()),
        }
    }

    fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            if current < 1000 {
                return false;
            }

            let new_tokens = current - 1000;
            if self
                .tokens
                .compare_exchange(current, new_tokens, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            // CAS failed, retry
        }
    }

    fn available(&self) -> u32 {
        self.refill();
        (self.tokens.load(Ordering::SeqCst) / 1000) as u32
    }

    /// How long until one full token accrues, assuming none are available.
    fn time_to_token(&self) -> Duration {
        if self.refill_rate == 0 {
            return Duration::from_millis(100);
        }
        let current = self.tokens.load(Ordering::SeqCst);
        let deficit = 1000u64.saturating_sub(current);
        Duration::from_millis((deficit / self.refill_rate).max(1))
    }

    fn refill(&self) {
        let now = now_millis();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last);

        if elapsed == 0 {
            return;
        }

        let tokens_to_add = elapsed * self.refill_rate;
        if tokens_to_add > 0 {
            loop {
                let current = self.tokens.load(Ordering::SeqCst);
                let new_tokens = (current + tokens_to_add).min(self.max_tokens);

                if self
                    .tokens
                    .compare_exchange(current, new_tokens, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.last_refill.store(now, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
}

/// Rate limiters for all models, created on first use.
pub struct ModelLimits {
    buckets: RwLock<HashMap<String, TokenBucket>>,
    default_config: RateLimitConfig,
}

impl ModelLimits {
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_config: config,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TokenBucket>> {
        match self.buckets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TokenBucket>> {
        match self.buckets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take one token for a model, or report how long to wait.
    pub fn try_acquire(&self, model: &str) -> std::result::Result<(), Duration> {
        {
            let buckets = self.read();
            if let Some(bucket) = buckets.get(model) {
                return if bucket.try_acquire() {
                    Ok(())
                } else {
                    Err(bucket.time_to_token())
                };
            }
        }

        let mut buckets = self.write();
        let bucket = buckets
            .entry(model.to_string())
            .or_insert_with(|| TokenBucket::new(&self.default_config));
        if bucket.try_acquire() {
            Ok(())
        } else {
            Err(bucket.time_to_token())
        }
    }

    /// Wait until a token is available for a model.
    pub async fn acquire(&self, model: &str) {
        loop {
            match self.try_acquire(model) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    pub fn available(&self, model: &str) -> u32 {
        let buckets = self.read();
        match buckets.get(model) {
            Some(bucket) => bucket.available(),
            None => self.default_config.burst_size,
        }
    }

    /// Pin a model to a custom budget.
    pub fn register(&self, model: &str, config: RateLimitConfig) {
        self.write().insert(model.to_string(), TokenBucket::new(&config));
    }
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self::new()
    }
}
