//! Configuration for the sync engine.

use lunara_sync_model::MergePolicy;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// This device's id, used for change attribution and tie-breaking.
    pub device_id: Uuid,
    /// Maximum number of records per push batch. Each batch is an atomic
    /// unit on the remote side.
    pub push_batch_size: usize,
    /// Maximum number of entities per pull page.
    pub pull_page_size: usize,
    /// Retry configuration for gateway calls.
    pub retry: RetryConfig,
    /// Per-kind merge policy.
    pub merge_policy: MergePolicy,
}

impl SyncConfig {
    /// Creates a configuration with the default batch and retry profile.
    pub fn new(device_id: Uuid) -> Self {
        Self {
            device_id,
            push_batch_size: 20,
            pull_page_size: 100,
            retry: RetryConfig::default(),
            merge_policy: MergePolicy::new(),
        }
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-kind merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the default delay profile.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay before the given attempt (0 = first attempt).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = capped * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
