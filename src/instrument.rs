//! Timing and memoization services for chunk processors
//!
//! [`PerfMonitor`] aggregates wall-clock durations per label: start a
//! [`PerfTimer`] guard (it records when stopped or dropped) or wrap a future
//! in [`PerfMonitor::measure`]. [`MemoCache`] is a bounded LRU keyed by
//! content digest, so identical payloads are processed once.
//!
//! Both services are plain values constructed by the caller and injected
//! where needed; nothing here is global. The [`timed`] and [`memoize`]
//! wrappers layer either service onto an existing [`Processor`] without the
//! processor knowing.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::scheduler::Processor;

/// Aggregated durations recorded under one label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl LabelStats {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        self.min = if self.count == 1 {
            elapsed
        } else {
            self.min.min(elapsed)
        };
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count as u32
    }
}

type SharedStats = Arc<Mutex<HashMap<String, LabelStats>>>;

/// Collects per-label timing statistics.
///
/// Clones share the same statistics map, so one monitor can be handed to
/// every component whose durations belong in the same report.
#[derive(Debug, Clone, Default)]
pub struct PerfMonitor {
    stats: SharedStats,
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a timer guard for `label`. The elapsed time is recorded when
    /// the guard is stopped, or on drop if it never was.
    pub fn start(&self, label: impl Into<String>) -> PerfTimer {
        PerfTimer {
            label: label.into(),
            started: Instant::now(),
            stats: self.stats.clone(),
            recorded: false,
        }
    }

    /// Time one future under `label` and pass its output through.
    pub async fn measure<F: Future>(&self, label: &str, future: F) -> F::Output {
        let timer = self.start(label);
        let output = future.await;
        timer.stop();
        output
    }

    /// Statistics recorded under `label`, if any.
    pub fn stats(&self, label: &str) -> Option<LabelStats> {
        lock_stats(&self.stats).get(label).copied()
    }

    /// Snapshot of every label's statistics.
    pub fn report(&self) -> HashMap<String, LabelStats> {
        lock_stats(&self.stats).clone()
    }

    /// Discard everything recorded so far.
    pub fn reset(&self) {
        lock_stats(&self.stats).clear();
    }
}

/// Guard returned by [`PerfMonitor::start`]. Records exactly once.
#[derive(Debug)]
pub struct PerfTimer {
    label: String,
    started: Instant,
    stats: SharedStats,
    recorded: bool,
}

impl PerfTimer {
    /// Record the elapsed time now and return it.
    pub fn stop(mut self) -> Duration {
        let elapsed = self.started.elapsed();
        self.record(elapsed);
        elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn record(&mut self, elapsed: Duration) {
        self.recorded = true;
        debug!("{} took {:?}", self.label, elapsed);
        lock_stats(&self.stats)
            .entry(self.label.clone())
            .or_default()
            .record(elapsed);
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !self.recorded {
            let elapsed = self.started.elapsed();
            self.record(elapsed);
        }
    }
}

// The guard records from a synchronous drop, so the map sits behind a std
// mutex; a poisoned lock still yields the map.
fn lock_stats(stats: &SharedStats) -> std::sync::MutexGuard<'_, HashMap<String, LabelStats>> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wrap a processor so every invocation is timed under `label`.
pub fn timed<C, R>(monitor: &PerfMonitor, label: &str, process: Processor<C, R>) -> Processor<C, R>
where
    C: Send + 'static,
    R: Send + 'static,
{
    let monitor = monitor.clone();
    let label = label.to_string();
    Arc::new(move |payload, index| {
        let monitor = monitor.clone();
        let label = label.clone();
        let process = process.clone();
        Box::pin(async move { monitor.measure(&label, process(payload, index)).await })
    })
}

// ============================================================================
// Memoization
// ============================================================================

/// Payload types that can be reduced to a stable cache key.
///
/// Digests are SHA-256 over the content, so equal content always maps to the
/// same key regardless of how the value was produced.
pub trait ContentKey {
    fn digest(&self) -> String;
}

impl ContentKey for str {
    fn digest(&self) -> String {
        sha256_hex(self.as_bytes())
    }
}

impl ContentKey for String {
    fn digest(&self) -> String {
        sha256_hex(self.as_bytes())
    }
}

impl ContentKey for [u8] {
    fn digest(&self) -> String {
        sha256_hex(self)
    }
}

impl ContentKey for Vec<u8> {
    fn digest(&self) -> String {
        sha256_hex(self)
    }
}

impl ContentKey for Value {
    fn digest(&self) -> String {
        sha256_hex(self.to_string().as_bytes())
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Bounded LRU of processor results keyed by content digest.
///
/// Clones share the same entries and counters.
pub struct MemoCache<R> {
    entries: Arc<AsyncMutex<LruCache<String, R>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl<R> Clone for MemoCache<R> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            hits: self.hits.clone(),
            misses: self.misses.clone(),
        }
    }
}

impl<R> fmt::Debug for MemoCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

impl<R> MemoCache<R> {
    /// A cache holding at most `capacity` results; a zero capacity is
    /// raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(AsyncMutex::new(LruCache::new(capacity))),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Look up a cached result, counting the probe as a hit or miss.
    pub async fn get(&self, key: &str) -> Option<R>
    where
        R: Clone,
    {
        let found = self.entries.lock().await.get(key).cloned();
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub async fn put(&self, key: String, value: R) {
        self.entries.lock().await.put(key, value);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop every entry and zero the counters.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Wrap a processor so results are cached by payload digest.
///
/// Only successful results are cached; a failed chunk runs again on its next
/// appearance. Cached hits bypass the inner processor entirely, which also
/// skips any retry the scheduler would have applied around it.
pub fn memoize<C, R>(cache: MemoCache<R>, process: Processor<C, R>) -> Processor<C, R>
where
    C: ContentKey + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    Arc::new(move |payload: C, index| {
        let cache = cache.clone();
        let process = process.clone();
        Box::pin(async move {
            let key = payload.digest();
            if let Some(value) = cache.get(&key).await {
                debug!("chunk {} served from cache", index);
                return Ok(value);
            }
            let value = process(payload, index).await?;
            cache.put(key, value.clone()).await;
            Ok(value)
        })
    })
}
