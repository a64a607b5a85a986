//! Retry policy with configurable backoff
//!
//! Wraps a single chunk-processing call with bounded attempts and increasing
//! delays. Retryable failures never leave this module; the caller only sees
//! the final value or a [`RetryExhausted`] carrying the last error, the
//! attempt count, and a per-attempt history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Retry configuration with backoff strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per chunk, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Cap applied to every computed delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Add jitter to delays
    #[serde(default)]
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Only retry errors matching one of these; empty retries everything
    #[serde(default)]
    pub retry_on: Vec<ErrorMatcher>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: false,
            jitter_factor: default_jitter_factor(),
            retry_on: Vec::new(),
        }
    }
}

/// Backoff strategies for retry delays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear increase in delay
    Linear {
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential increase in delay
    Exponential {
        #[serde(default = "default_exponential_base")]
        base: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: default_exponential_base(),
        }
    }
}

/// Error patterns to match for retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMatcher {
    /// Network-related errors
    Network,
    /// Timeout errors
    Timeout,
    /// HTTP 5xx errors
    ServerError,
    /// Rate limiting errors
    RateLimit,
    /// Custom regex pattern
    Pattern(String),
}

impl ErrorMatcher {
    /// Check if an error message matches this matcher
    pub fn matches(&self, error_msg: &str) -> bool {
        let error_lower = error_msg.to_lowercase();
        match self {
            ErrorMatcher::Network => {
                error_lower.contains("network")
                    || error_lower.contains("connection")
                    || error_lower.contains("refused")
                    || error_lower.contains("unreachable")
            }
            ErrorMatcher::Timeout => {
                error_lower.contains("timeout") || error_lower.contains("timed out")
            }
            ErrorMatcher::ServerError => {
                error_lower.contains("500")
                    || error_lower.contains("502")
                    || error_lower.contains("503")
                    || error_lower.contains("504")
                    || error_lower.contains("server error")
            }
            ErrorMatcher::RateLimit => {
                error_lower.contains("rate limit")
                    || error_lower.contains("429")
                    || error_lower.contains("too many requests")
            }
            ErrorMatcher::Pattern(pattern) => {
                if let Ok(re) = regex::Regex::new(pattern) {
                    re.is_match(error_msg)
                } else {
                    false
                }
            }
        }
    }
}

/// One processor invocation that failed, kept for the failure audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// All attempts for one chunk failed
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    pub error: anyhow::Error,
}

/// Arbitrary caller-supplied retry decision over `(error, attempt)`
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error, u32) -> bool + Send + Sync>;

/// Executes operations under a [`RetryConfig`], with an optional predicate
/// overriding the declarative matchers.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
        }
    }

    /// Replace the declarative matchers with an arbitrary decision function.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error, u32) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation, retrying failed attempts until one succeeds or
    /// the policy gives up. Returns the value together with the number of
    /// attempts it took.
    pub async fn run<F, Fut, T>(&self, operation: F, context: &str) -> Result<(T, u32), RetryExhausted>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut history = Vec::new();

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => {
                    history.push(AttemptRecord {
                        attempt_number: attempt,
                        timestamp: Utc::now(),
                        error: err.to_string(),
                    });

                    if !self.should_retry(&err, attempt) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            history,
                            error: err,
                        });
                    }

                    let delay = self.apply_jitter(self.calculate_delay(attempt));
                    debug!(
                        "Retrying {} (attempt {}/{}) after {:?}",
                        context, attempt, self.config.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Check if another attempt is allowed after a failure on `attempt`.
    fn should_retry(&self, error: &anyhow::Error, attempt: u32) -> bool {
        if attempt >= self.config.max_attempts {
            return false;
        }

        if let Some(predicate) = &self.predicate {
            return predicate(error, attempt);
        }

        if self.config.retry_on.is_empty() {
            return true;
        }

        let message = error.to_string();
        self.config.retry_on.iter().any(|m| m.matches(&message))
    }

    /// Calculate the delay after the given (1-based) failed attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        let base_delay = match &self.config.backoff {
            BackoffStrategy::Fixed => self.config.initial_delay,
            BackoffStrategy::Linear { increment } => self.config.initial_delay + *increment * step,
            BackoffStrategy::Exponential { base } => {
                let multiplier = base.powi(step as i32);
                Duration::from_secs_f64(self.config.initial_delay.as_secs_f64() * multiplier)
            }
        };

        base_delay.min(self.config.max_delay)
    }

    /// Apply jitter to a computed delay.
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.config.jitter {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.config.jitter_factor;
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(5000)
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_exponential_base() -> f64 {
    2.0
}
