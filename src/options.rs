//! Configuration surface for batch execution
//!
//! One flat options struct covering splitting, scheduling, retry, and
//! merging. Declarative fields deserialize with per-field defaults; the
//! merge function is code and lives outside serialization.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::SplitOptions;
use crate::error::MergeError;
use crate::merge::MergeFn;
use crate::retry::RetryConfig;
use crate::scheduler::ScheduleConfig;

/// Options accepted by the driver and the lower-level scheduler entry points
#[derive(Serialize, Deserialize)]
pub struct BatchOptions<R> {
    /// Max unit size: characters for text, elements for arrays, bytes for
    /// byte input
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// How the text splitter picks boundaries
    #[serde(default)]
    pub split: SplitOptions,

    /// Bounded-parallel scheduling instead of sequential
    #[serde(default)]
    pub parallel: bool,

    /// Concurrency bound in parallel mode
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Delay between consecutive chunks in sequential mode
    #[serde(default, with = "humantime_serde")]
    pub chunk_delay: Duration,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Keep scheduling after a chunk exhausts its retries
    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    /// Custom result merge; the type-based default applies when absent
    #[serde(skip)]
    pub merge: Option<MergeFn<R>>,

    /// Start the driver as soon as a non-empty input is supplied
    #[serde(default)]
    pub auto_start: bool,
}

impl<R> Default for BatchOptions<R> {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            split: SplitOptions::default(),
            parallel: false,
            max_concurrent: default_max_concurrent(),
            chunk_delay: Duration::ZERO,
            retry: RetryConfig::default(),
            continue_on_error: true,
            merge: None,
            auto_start: false,
        }
    }
}

impl<R> Clone for BatchOptions<R> {
    fn clone(&self) -> Self {
        Self {
            max_chunk_size: self.max_chunk_size,
            split: self.split.clone(),
            parallel: self.parallel,
            max_concurrent: self.max_concurrent,
            chunk_delay: self.chunk_delay,
            retry: self.retry.clone(),
            continue_on_error: self.continue_on_error,
            merge: self.merge.clone(),
            auto_start: self.auto_start,
        }
    }
}

impl<R> fmt::Debug for BatchOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("max_chunk_size", &self.max_chunk_size)
            .field("split", &self.split)
            .field("parallel", &self.parallel)
            .field("max_concurrent", &self.max_concurrent)
            .field("chunk_delay", &self.chunk_delay)
            .field("retry", &self.retry)
            .field("continue_on_error", &self.continue_on_error)
            .field("merge", &self.merge.as_ref().map(|_| "<fn>"))
            .field("auto_start", &self.auto_start)
            .finish()
    }
}

impl<R> BatchOptions<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_parallel(mut self, max_concurrent: usize) -> Self {
        self.parallel = true;
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(Vec<R>) -> Result<R, MergeError> + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// The scheduling slice of these options.
    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            parallel: self.parallel,
            max_concurrent: self.max_concurrent,
            chunk_delay: self.chunk_delay,
            continue_on_error: self.continue_on_error,
        }
    }
}

fn default_max_chunk_size() -> usize {
    5000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_true() -> bool {
    true
}
