//! Batch scheduling over chunks
//!
//! Drives every chunk through the caller's processor, either strictly
//! sequentially or through a bounded worker pool. Workers pull chunks from a
//! work queue in index order and send `(index, outcome)` back over a
//! collection channel, so completion order never affects where a result
//! lands. Only the collecting side writes the [`BatchJob`]; chunk handlers
//! never touch shared state.
//!
//! Progress is published when a chunk settles (success or final failure),
//! never on intermediate retry attempts.

use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::error::{BatchError, BatchResult};
use crate::job::{BatchJob, FailedEntry, PhaseEvent};
use crate::progress::{ProgressSender, ProgressSnapshot, ProgressWatch, SharedProgress};
use crate::retry::{RetryExhausted, RetryPolicy};

/// Caller-supplied chunk processor. Must be idempotent-safe under retry;
/// the engine makes no at-most-once guarantee per chunk.
pub type Processor<C, R> =
    Arc<dyn Fn(C, usize) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Wrap an async closure as a [`Processor`].
pub fn processor<C, R, F, Fut>(f: F) -> Processor<C, R>
where
    F: Fn(C, usize) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Arc::new(move |chunk, index| Box::pin(f(chunk, index)))
}

/// Cooperative cancellation flag shared by the scheduler and its workers
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Chunks not yet started will not be dispatched;
    /// in-flight work finishes but its result is discarded.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Scheduling slice of the configuration surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Bounded-parallel scheduling instead of sequential
    #[serde(default)]
    pub parallel: bool,

    /// Concurrency bound in parallel mode
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Delay between consecutive chunks in sequential mode
    #[serde(default, with = "humantime_serde")]
    pub chunk_delay: Duration,

    /// Keep scheduling after a chunk exhausts its retries
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_concurrent: default_max_concurrent(),
            chunk_delay: Duration::ZERO,
            continue_on_error: true,
        }
    }
}

/// Counters for one finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Chunks never dispatched because the run halted early
    pub skipped: usize,
}

impl RunStats {
    fn from_job<R>(job: &BatchJob<R>) -> Self {
        Self {
            total: job.total,
            succeeded: job.succeeded,
            failed: job.failed,
            skipped: job.total.saturating_sub(job.processed),
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} succeeded, {} failed, {} skipped",
            self.total, self.succeeded, self.failed, self.skipped
        )
    }
}

/// How a run over the chunk sequence ended
enum RunOutcome {
    /// Every chunk settled, possibly with recorded failures
    Finished,
    /// Cancellation stopped dispatch before every chunk settled
    Cancelled,
    /// Fail-fast mode halted scheduling after a terminal failure
    Aborted(BatchError),
}

/// Drives chunks through a processor under one [`ScheduleConfig`].
///
/// The job handle, cancellation signal, and progress channel can be shared
/// with an owning facade through the `with_*` builders.
pub struct Scheduler<R> {
    config: ScheduleConfig,
    retry: RetryPolicy,
    job: Arc<RwLock<BatchJob<R>>>,
    cancel: CancelSignal,
    progress: SharedProgress,
}

impl<R> fmt::Debug for Scheduler<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<R: Send + Sync + 'static> Scheduler<R> {
    pub fn new(config: ScheduleConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            retry,
            job: Arc::new(RwLock::new(BatchJob::idle())),
            cancel: CancelSignal::new(),
            progress: Arc::new(ProgressSender::new()),
        }
    }

    pub fn with_job(mut self, job: Arc<RwLock<BatchJob<R>>>) -> Self {
        self.job = job;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn job(&self) -> Arc<RwLock<BatchJob<R>>> {
        self.job.clone()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn watch_progress(&self) -> ProgressWatch {
        self.progress.subscribe()
    }

    /// Run every chunk through the processor and settle the job.
    ///
    /// Takes the job from `Idle` to `Processing` and on to a terminal phase.
    /// Per-chunk results, counters, and failure records accumulate in the
    /// shared [`BatchJob`] as chunks settle; the returned stats summarize
    /// the finished run. Cancellation surfaces as [`BatchError::Cancelled`],
    /// a fail-fast halt as [`BatchError::Aborted`].
    pub async fn run<C>(&self, chunks: Vec<Chunk<C>>, process: Processor<C, R>) -> BatchResult<RunStats>
    where
        C: Clone + Send + Sync + 'static,
    {
        let total = chunks.len();
        {
            let mut job = self.job.write().await;
            job.prepare(total);
            job.transition(PhaseEvent::Start)?;
        }
        if !self.cancel.is_cancelled() {
            self.progress.publish(ProgressSnapshot::new(0, total));
        }
        debug!(
            "starting batch of {} chunk(s), parallel={}",
            total, self.config.parallel
        );

        let outcome = if total == 0 {
            RunOutcome::Finished
        } else if self.config.parallel {
            self.run_parallel(chunks, process).await
        } else {
            self.run_sequential(chunks, process).await
        };

        let stats = {
            let mut job = self.job.write().await;
            match &outcome {
                RunOutcome::Finished => job.transition(PhaseEvent::Complete)?,
                RunOutcome::Cancelled => job.transition(PhaseEvent::Cancel)?,
                RunOutcome::Aborted(_) => job.transition(PhaseEvent::Fail)?,
            }
            RunStats::from_job(&job)
        };
        info!("batch settled: {}", stats);

        match outcome {
            RunOutcome::Finished => Ok(stats),
            RunOutcome::Cancelled => Err(BatchError::Cancelled),
            RunOutcome::Aborted(err) => Err(err),
        }
    }

    async fn run_sequential<C>(&self, chunks: Vec<Chunk<C>>, process: Processor<C, R>) -> RunOutcome
    where
        C: Clone + Send + Sync + 'static,
    {
        let delay = self.config.chunk_delay;

        for (position, chunk) in chunks.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                debug!("cancellation observed before chunk {}", chunk.index);
                return RunOutcome::Cancelled;
            }
            if position > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let index = chunk.index;
            let payload = chunk.payload;
            let context = format!("chunk {index}");
            match self.retry.run(|| process(payload.clone(), index), &context).await {
                Ok((value, attempts)) => self.settle_success(index, value, attempts).await,
                Err(exhausted) => {
                    if let Some(terminal) = self.settle_failure(index, exhausted).await {
                        if !self.config.continue_on_error {
                            return RunOutcome::Aborted(BatchError::Aborted {
                                index,
                                source: Box::new(terminal),
                            });
                        }
                    }
                }
            }
        }

        // A requested cancellation wins even when every chunk settled before
        // the flag was observed; recorded results stay readable.
        if self.cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        RunOutcome::Finished
    }

    async fn run_parallel<C>(&self, chunks: Vec<Chunk<C>>, process: Processor<C, R>) -> RunOutcome
    where
        C: Clone + Send + Sync + 'static,
    {
        let total = chunks.len();
        let workers = self.config.max_concurrent.min(total).max(1);

        // Queue every chunk up front; workers pull in index order.
        let (work_tx, work_rx) = mpsc::channel::<Chunk<C>>(total.max(1));
        for chunk in chunks {
            if work_tx.send(chunk).await.is_err() {
                break;
            }
        }
        drop(work_tx);
        let work_rx = Arc::new(RwLock::new(work_rx));

        let (done_tx, mut done_rx) =
            mpsc::channel::<(usize, Result<(R, u32), RetryExhausted>)>(total.max(1));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let process = process.clone();
            let retry = self.retry.clone();
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!("worker {} stopping, halt requested", worker);
                        break;
                    }
                    let chunk = { work_rx.write().await.recv().await };
                    let Some(chunk) = chunk else { break };

                    let index = chunk.index;
                    let payload = chunk.payload;
                    let context = format!("chunk {index}");
                    let outcome = retry.run(|| process(payload.clone(), index), &context).await;
                    if done_tx.send((index, outcome)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(done_tx);

        let mut abort: Option<BatchError> = None;
        while let Some((index, outcome)) = done_rx.recv().await {
            match outcome {
                Ok((value, attempts)) => self.settle_success(index, value, attempts).await,
                Err(exhausted) => {
                    if let Some(terminal) = self.settle_failure(index, exhausted).await {
                        if !self.config.continue_on_error && abort.is_none() {
                            warn!("halting batch after terminal failure of chunk {}", index);
                            abort = Some(BatchError::Aborted {
                                index,
                                source: Box::new(terminal),
                            });
                            self.cancel.cancel();
                        }
                    }
                }
            }
        }

        for joined in join_all(handles).await {
            if let Err(err) = joined {
                warn!("worker task failed to join: {}", err);
            }
        }

        if let Some(err) = abort {
            return RunOutcome::Aborted(err);
        }
        if self.cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        RunOutcome::Finished
    }

    /// Record a settled success and publish progress. Results arriving after
    /// a halt are discarded.
    async fn settle_success(&self, index: usize, value: R, attempts: u32) {
        if self.cancel.is_cancelled() {
            debug!("discarding result of chunk {} after halt", index);
            return;
        }
        let mut job = self.job.write().await;
        job.record_success(index, value, attempts);
        self.progress.publish(job.progress());
    }

    /// Record a terminal failure and publish progress. Returns the typed
    /// chunk error, or `None` when the settle was discarded after a halt.
    async fn settle_failure(&self, index: usize, exhausted: RetryExhausted) -> Option<BatchError> {
        if self.cancel.is_cancelled() {
            debug!("discarding failure of chunk {} after halt", index);
            return None;
        }
        warn!(
            "chunk {} failed after {} attempt(s): {}",
            index, exhausted.attempts, exhausted.error
        );
        let entry = FailedEntry::from_exhausted(index, &exhausted);
        let mut job = self.job.write().await;
        job.record_failure(entry);
        self.progress.publish(job.progress());
        Some(BatchError::chunk(index, exhausted.attempts, exhausted.error))
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_true() -> bool {
    true
}
