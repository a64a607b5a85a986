//! Stateful facade over splitting, scheduling, and merging
//!
//! [`BatchDriver`] is the orchestration wrapper UI and service layers hold on
//! to: it owns the input chunks, the job state, and the progress channel, and
//! exposes `start`/`cancel`/`reset` plus a consolidated [`DriverSnapshot`].
//! Each `start` runs one job to a terminal phase on a spawned task; the
//! driver alone writes the job, so snapshots are always consistent.

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, IntoChunks};
use crate::error::BatchError;
use crate::job::{BatchJob, FailedEntry, Phase};
use crate::merge::{merge_with, DefaultMerge};
use crate::options::BatchOptions;
use crate::progress::{ProgressSender, ProgressSnapshot, ProgressWatch, SharedProgress};
use crate::retry::RetryPolicy;
use crate::scheduler::{CancelSignal, Processor, Scheduler};

/// Consolidated read-only view of the driver's state
#[derive(Debug, Clone)]
pub struct DriverSnapshot<R> {
    pub phase: Phase,
    pub progress: ProgressSnapshot,
    /// Partial per-chunk results, keyed by original index
    pub results: Vec<Option<R>>,
    pub failures: Vec<FailedEntry>,
    /// Merged result, present once a run completed and merging succeeded
    pub final_result: Option<R>,
    /// Terminal error, if the run was cancelled, aborted, or failed to merge
    pub error: Option<Arc<BatchError>>,
}

impl<R> DriverSnapshot<R> {
    pub fn is_processing(&self) -> bool {
        self.phase.is_active()
    }

    /// Every chunk settled and none of them failed.
    pub fn completed_clean(&self) -> bool {
        self.phase == Phase::Completed && self.failures.is_empty()
    }

    /// Every chunk was attempted, but some exhausted their retries.
    pub fn completed_with_failures(&self) -> bool {
        self.phase == Phase::Completed && !self.failures.is_empty()
    }
}

/// What one finished run left behind
struct RunRecord<R> {
    final_result: Option<R>,
    error: Option<Arc<BatchError>>,
}

impl<R> Default for RunRecord<R> {
    fn default() -> Self {
        Self {
            final_result: None,
            error: None,
        }
    }
}

/// Stateful orchestration wrapper around one batch at a time.
///
/// The driver owns its [`BatchJob`] exclusively; starting a new job or
/// resetting discards the previous one after stopping further scheduling.
pub struct BatchDriver<C, R> {
    options: BatchOptions<R>,
    process: Processor<C, R>,
    input: Option<Vec<Chunk<C>>>,
    job: Arc<RwLock<BatchJob<R>>>,
    outcome: Arc<RwLock<RunRecord<R>>>,
    progress: SharedProgress,
    cancel: CancelSignal,
    handle: Option<JoinHandle<()>>,
    started_once: bool,
}

impl<C, R> BatchDriver<C, R>
where
    C: Clone + Send + Sync + 'static,
    R: DefaultMerge + Clone + Send + Sync + 'static,
{
    pub fn new(options: BatchOptions<R>, process: Processor<C, R>) -> Self {
        Self {
            options,
            process,
            input: None,
            job: Arc::new(RwLock::new(BatchJob::idle())),
            outcome: Arc::new(RwLock::new(RunRecord::default())),
            progress: Arc::new(ProgressSender::new()),
            cancel: CancelSignal::new(),
            handle: None,
            started_once: false,
        }
    }

    /// Split an input and make it the driver's pending batch.
    ///
    /// With `auto_start` set, the first non-empty input to arrive starts the
    /// job; later inputs only replace the stored chunks. Returns whether a
    /// run was started.
    pub async fn supply<I>(&mut self, input: I) -> bool
    where
        I: IntoChunks<Unit = C>,
    {
        let chunks = input.into_chunks(self.options.max_chunk_size, &self.options.split);
        self.supply_chunks(chunks).await
    }

    /// Hand the driver an already-split batch.
    pub async fn supply_chunks(&mut self, chunks: Vec<Chunk<C>>) -> bool {
        let non_empty = !chunks.is_empty();
        self.input = Some(chunks);
        if self.options.auto_start && !self.started_once && non_empty {
            return self.start().await;
        }
        false
    }

    /// Start processing the supplied input.
    ///
    /// A no-op while a job is `Processing` and when no input has been
    /// supplied. Starting over a finished job discards its state first.
    /// Returns whether a new run began.
    pub async fn start(&mut self) -> bool {
        if self.job.read().await.phase.is_active() {
            debug!("start ignored, job already processing");
            return false;
        }
        let Some(chunks) = self.input.clone() else {
            debug!("start ignored, no input supplied");
            return false;
        };

        // Previous run (if any) is terminal; settle its task fully before
        // discarding state so no late write lands in the fresh run.
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        *self.job.write().await = BatchJob::idle();
        *self.outcome.write().await = RunRecord::default();
        self.cancel = CancelSignal::new();
        self.started_once = true;

        let scheduler = Scheduler::new(
            self.options.schedule(),
            RetryPolicy::new(self.options.retry.clone()),
        )
        .with_job(self.job.clone())
        .with_cancel(self.cancel.clone())
        .with_progress(self.progress.clone());

        let process = self.process.clone();
        let merge = self.options.merge.clone();
        let job = self.job.clone();
        let outcome = self.outcome.clone();

        info!("starting batch job over {} chunk(s)", chunks.len());
        self.handle = Some(tokio::spawn(async move {
            let run = scheduler.run(chunks, process).await;
            let mut record = outcome.write().await;
            match run {
                Ok(_) => {
                    let parts = job.read().await.cloned_successes();
                    if parts.is_empty() {
                        // Nothing succeeded (all failed, or empty input):
                        // there is no result to merge
                        return;
                    }
                    match merge_with(merge.as_ref(), parts) {
                        Ok(merged) => record.final_result = Some(merged),
                        Err(err) => {
                            warn!("merging results failed: {}", err);
                            record.error = Some(Arc::new(BatchError::Merge(err)));
                        }
                    }
                }
                Err(err) => record.error = Some(Arc::new(err)),
            }
        }));
        true
    }

    /// Request cooperative cancellation of the running job.
    ///
    /// Chunks not yet started will not be dispatched; in-flight work finishes
    /// and is discarded. The job settles as `Cancelled`.
    pub fn cancel(&self) {
        debug!("cancellation requested");
        self.cancel.cancel();
    }

    /// Cancel any in-flight job, discard all state, and return to `Idle`.
    ///
    /// Safe to call at any time. A still-running task drains against the
    /// discarded state and is never observed again.
    pub async fn reset(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
        self.job = Arc::new(RwLock::new(BatchJob::idle()));
        self.outcome = Arc::new(RwLock::new(RunRecord::default()));
        self.input = None;
        self.started_once = false;
        self.progress.publish(ProgressSnapshot::default());
        info!("driver reset to idle");
    }

    /// Wait for the running job to reach a terminal phase.
    pub async fn join(&mut self) -> DriverSnapshot<R> {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!("batch task failed to join: {}", err);
            }
        }
        self.snapshot().await
    }

    /// Consolidated view of phase, progress, partial results, failures, and
    /// the final merged result or terminal error.
    pub async fn snapshot(&self) -> DriverSnapshot<R> {
        let job = self.job.read().await;
        let record = self.outcome.read().await;
        DriverSnapshot {
            phase: job.phase,
            progress: self.progress.current(),
            results: job.results.clone(),
            failures: job.failures.clone(),
            final_result: record.final_result.clone(),
            error: record.error.clone(),
        }
    }

    pub fn watch_progress(&self) -> ProgressWatch {
        self.progress.subscribe()
    }

    pub fn progress_stream(&self) -> WatchStream<ProgressSnapshot> {
        self.progress.subscribe().into_stream()
    }
}

impl<C, R> Drop for BatchDriver<C, R> {
    fn drop(&mut self) {
        // Stop dispatching for any run that outlives its driver
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::scheduler::processor;
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    fn fast_options<R>() -> BatchOptions<R> {
        BatchOptions::new().with_retry(RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        })
    }

    fn uppercase() -> Processor<String, String> {
        processor(|payload: String, _| async move { Ok(payload.to_uppercase()) })
    }

    #[tokio::test]
    async fn full_lifecycle_produces_a_merged_result() {
        let options = fast_options().with_max_chunk_size(4);
        let mut driver = BatchDriver::new(options, uppercase());

        let snapshot = driver.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Idle);
        assert!(snapshot.final_result.is_none());

        driver.supply("abcdefghij").await;
        assert!(driver.start().await);

        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Completed);
        assert!(snapshot.completed_clean());
        assert_eq!(snapshot.final_result, Some("ABCDEFGHIJ".to_string()));
        assert_eq!(snapshot.progress.percent, 100);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn start_without_input_is_a_noop() {
        let mut driver: BatchDriver<String, String> =
            BatchDriver::new(fast_options(), uppercase());
        assert!(!driver.start().await);
        assert_eq!(driver.snapshot().await.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn start_is_a_noop_while_processing() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let mut driver = BatchDriver::new(
            fast_options::<String>().with_max_chunk_size(2),
            processor(move |payload: String, _| {
                let mut gate = gate_rx.clone();
                async move {
                    gate.wait_for(|open| *open).await.ok();
                    Ok(payload)
                }
            }),
        );

        driver.supply("abcdef").await;
        assert!(driver.start().await);
        assert!(!driver.start().await);
        assert!(driver.snapshot().await.is_processing());

        gate_tx.send(true).expect("gate has subscribers");
        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn failures_are_visible_but_do_not_block_completion() {
        let mut driver = BatchDriver::new(
            fast_options::<Value>().with_max_chunk_size(1),
            processor(|payload: Vec<u32>, index| async move {
                if index == 1 {
                    Err(anyhow!("chunk 1 always fails"))
                } else {
                    Ok(json!(payload))
                }
            }),
        );

        driver.supply(vec![10u32, 20, 30]).await;
        driver.start().await;

        let snapshot = driver.join().await;
        assert!(snapshot.completed_with_failures());
        assert!(!snapshot.completed_clean());
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(snapshot.failures[0].index, 1);
        assert_eq!(snapshot.failures[0].attempts, 2);
        // Failed slot is skipped; the successes still merge in order
        assert_eq!(snapshot.final_result, Some(json!([10, 30])));
    }

    #[tokio::test]
    async fn fail_fast_surfaces_the_abort_and_failed_phase() {
        let options = fast_options::<String>()
            .with_max_chunk_size(1)
            .with_continue_on_error(false);
        let mut driver = BatchDriver::new(
            options,
            processor(|payload: Vec<u32>, index| async move {
                if index == 2 {
                    Err(anyhow!("terminal"))
                } else {
                    Ok(format!("{payload:?}"))
                }
            }),
        );

        driver.supply(vec![1u32, 2, 3, 4, 5]).await;
        driver.start().await;

        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Failed);
        let error = snapshot.error.expect("abort error recorded");
        assert!(matches!(*error, BatchError::Aborted { index: 2, .. }));
        assert!(snapshot.final_result.is_none());
        assert_eq!(snapshot.failures.len(), 1);
    }

    #[tokio::test]
    async fn cancel_mid_run_settles_as_cancelled() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let mut driver = BatchDriver::new(
            fast_options::<String>().with_max_chunk_size(1),
            processor(move |payload: Vec<u32>, _| {
                let mut gate = gate_rx.clone();
                async move {
                    gate.wait_for(|open| *open).await.ok();
                    Ok(format!("{payload:?}"))
                }
            }),
        );

        driver.supply(vec![1u32, 2, 3, 4]).await;
        driver.start().await;
        driver.cancel();
        gate_tx.send(true).expect("gate has subscribers");

        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Cancelled);
        let error = snapshot.error.expect("cancellation recorded");
        assert!(error.is_cancelled());
        assert!(snapshot.final_result.is_none());
    }

    #[tokio::test]
    async fn reset_discards_state_and_allows_a_fresh_run() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let mut driver = BatchDriver::new(
            fast_options::<String>().with_max_chunk_size(2),
            processor(move |payload: String, _| {
                let mut gate = gate_rx.clone();
                async move {
                    gate.wait_for(|open| *open).await.ok();
                    Ok(payload)
                }
            }),
        );

        driver.supply("abcdef").await;
        driver.start().await;
        driver.reset().await;

        let snapshot = driver.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Idle);
        assert!(snapshot.results.is_empty());
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.progress, ProgressSnapshot::default());

        // The discarded run's workers drain without touching the new state
        gate_tx.send(true).ok();

        driver.supply("xy").await;
        assert!(driver.start().await);
        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Completed);
        assert_eq!(snapshot.final_result, Some("xy".to_string()));
    }

    #[tokio::test]
    async fn auto_start_fires_once_per_lifecycle() {
        let started = Arc::new(AtomicU32::new(0));
        let seen = started.clone();
        let options = fast_options::<String>()
            .with_max_chunk_size(100)
            .with_auto_start(true);
        let mut driver = BatchDriver::new(
            options,
            processor(move |payload: String, _| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(payload)
                }
            }),
        );

        // Empty input never auto-starts
        assert!(!driver.supply("").await);
        assert_eq!(driver.snapshot().await.phase, Phase::Idle);

        assert!(driver.supply("first").await);
        driver.join().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // A later input only replaces the pending chunks
        assert!(!driver.supply("second").await);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // Reset begins a new lifecycle, so auto-start may fire again
        driver.reset().await;
        assert!(driver.supply("third").await);
        let snapshot = driver.join().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot.final_result, Some("third".to_string()));
    }

    #[tokio::test]
    async fn empty_input_completes_without_a_result() {
        let mut driver: BatchDriver<String, String> =
            BatchDriver::new(fast_options(), uppercase());
        driver.supply("").await;
        assert!(driver.start().await);

        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Completed);
        assert!(snapshot.completed_clean());
        assert!(snapshot.final_result.is_none());
        assert_eq!(snapshot.progress.percent, 100);
    }

    #[tokio::test]
    async fn merge_failure_is_recorded_as_the_terminal_error() {
        // Numbers have no default merge strategy
        let mut driver = BatchDriver::new(
            fast_options::<Value>().with_max_chunk_size(1),
            processor(|payload: Vec<u32>, _| async move { Ok(json!(payload[0])) }),
        );

        driver.supply(vec![1u32, 2]).await;
        driver.start().await;

        let snapshot = driver.join().await;
        assert_eq!(snapshot.phase, Phase::Completed);
        assert!(snapshot.final_result.is_none());
        let error = snapshot.error.expect("merge error recorded");
        assert!(matches!(*error, BatchError::Merge(_)));
    }

    #[tokio::test]
    async fn custom_merge_reaches_the_final_result() {
        let options = fast_options::<String>()
            .with_max_chunk_size(2)
            .with_merge(|parts: Vec<String>| Ok(parts.join("+")));
        let mut driver = BatchDriver::new(options, uppercase());

        driver.supply("abcd").await;
        driver.start().await;
        let snapshot = driver.join().await;
        assert_eq!(snapshot.final_result, Some("AB+CD".to_string()));
    }

    #[tokio::test]
    async fn progress_stream_tracks_the_run() {
        let mut driver = BatchDriver::new(fast_options::<String>().with_max_chunk_size(1), {
            processor(|payload: Vec<u32>, _| async move { Ok(format!("{payload:?}")) })
        });
        let mut watch = driver.watch_progress();

        driver.supply(vec![1u32, 2, 3]).await;
        driver.start().await;
        driver.join().await;

        let final_seen = watch.changed().await.expect("progress published");
        assert_eq!(final_seen.total, 3);
        assert_eq!(final_seen.percent, 100);
    }
}
