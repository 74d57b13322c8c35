//! In-process job queue with retries, backoff and retention.
//!
//! Jobs are admitted with `add`, picked up by worker threads registered with
//! `process`, and awaited through the returned `JobHandle`. A failed attempt
//! is re-queued as `Delayed` until its backoff elapses so other jobs keep
//! flowing; permanent failures and exhausted jobs end in `Failed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::metrics::{self, PipelineCounters};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Completed jobs are kept one hour.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(60 * 60);
/// Failed jobs are kept a week for diagnosis.
pub const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound on how long an idle worker sleeps before re-checking shutdown.
const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Job {id} failed after {attempts} attempt(s): {reason}")]
    Failed { id: u64, attempts: u32, reason: String },

    #[error("Job {id} did not finish within {waited_ms}ms")]
    WaitTimeout { id: u64, waited_ms: u128 },

    #[error("Job queue dropped before job {0} finished")]
    Closed(u64),
}

/// Outcome of one failed attempt, as reported by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    /// Worth another attempt after backoff.
    Retryable(String),
    /// Fails the job immediately, remaining attempts are skipped.
    Permanent(String),
}

impl JobFailure {
    pub fn reason(&self) -> &str {
        match self {
            JobFailure::Retryable(r) | JobFailure::Permanent(r) => r,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * 2^(n-1)` before attempt `n + 1`.
    Exponential(Duration),
}

impl Backoff {
    /// Delay after `attempts_made` failed attempts (1-based).
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential(initial) => {
                let exp = attempts_made.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << exp)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    /// Attempts running longer than this count as retryable failures and
    /// their result is discarded. There is no mid-flight cancellation.
    pub timeout: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::Exponential(DEFAULT_BACKOFF),
            timeout: Some(DEFAULT_JOB_TIMEOUT),
        }
    }
}

impl JobOptions {
    /// Longest a job can take from admission to its final outcome, assuming
    /// a free worker. `None` without a per-attempt timeout.
    pub fn worst_case_duration(&self) -> Option<Duration> {
        let timeout = self.timeout?;
        let attempts = self.attempts.max(1);
        let mut total = timeout.saturating_mul(attempts);
        for n in 1..attempts {
            total = total.saturating_add(self.backoff.delay(n));
        }
        Some(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: COMPLETED_RETENTION,
            failed: FAILED_RETENTION,
        }
    }
}

/// Per-state job totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Read-only view of one job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: u64,
    pub name: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════

/// Work run for one job attempt.
pub trait JobHandler: Send + Sync {
    fn execute(&self, ctx: &JobContext) -> Result<Value, JobFailure>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext) -> Result<Value, JobFailure> + Send + Sync,
{
    fn execute(&self, ctx: &JobContext) -> Result<Value, JobFailure> {
        self(ctx)
    }
}

/// What a handler sees of the job it runs.
pub struct JobContext {
    pub job_id: u64,
    pub name: String,
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: Value,
    inner: Arc<QueueInner>,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn report_progress(&self, percent: u8, message: &str) {
        let percent = percent.min(100);
        tracing::debug!(job_id = self.job_id, percent, message, "Job progress");
        let mut state = self.inner.state();
        if let Some(record) = state.records.get_mut(&self.job_id) {
            record.progress = percent;
            record.progress_message = Some(message.to_string());
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════

struct JobRecord {
    name: String,
    payload: Value,
    options: JobOptions,
    state: JobState,
    attempts_made: u32,
    progress: u8,
    progress_message: Option<String>,
    failure: Option<String>,
    ready_at: Instant,
    finished_at: Option<Instant>,
}

type Waiter = mpsc::Sender<Result<Value, JobError>>;

#[derive(Default)]
struct QueueState {
    next_id: u64,
    records: HashMap<u64, JobRecord>,
    waiters: HashMap<u64, Waiter>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    retention: RetentionPolicy,
    counters: Option<Arc<PipelineCounters>>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count(&self, name: &str) {
        if let Some(counters) = &self.counters {
            counters.increment(name);
        }
    }
}

/// Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::build(RetentionPolicy::default(), None)
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self::build(retention, None)
    }

    /// Queue that reports completed, failed and retried jobs.
    pub fn with_counters(retention: RetentionPolicy, counters: Arc<PipelineCounters>) -> Self {
        Self::build(retention, Some(counters))
    }

    fn build(retention: RetentionPolicy, counters: Option<Arc<PipelineCounters>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                wakeup: Condvar::new(),
                retention,
                counters,
            }),
        }
    }

    /// Admit a job. It runs once a worker for `name` is free.
    pub fn add(&self, name: &str, payload: Value, options: JobOptions) -> JobHandle {
        let (sender, receiver) = mpsc::channel();
        let id = {
            let mut state = self.inner.state();
            state.next_id += 1;
            let id = state.next_id;
            state.records.insert(
                id,
                JobRecord {
                    name: name.to_string(),
                    payload,
                    options,
                    state: JobState::Waiting,
                    attempts_made: 0,
                    progress: 0,
                    progress_message: None,
                    failure: None,
                    ready_at: Instant::now(),
                    finished_at: None,
                },
            );
            state.waiters.insert(id, sender);
            id
        };
        self.inner.wakeup.notify_all();
        tracing::debug!(job_id = id, name, "Job admitted");
        JobHandle { id, receiver }
    }

    /// Start `concurrency` worker threads for jobs named `name`.
    pub fn process(
        &self,
        name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let threads = (0..concurrency.max(1))
            .map(|n| {
                let inner = self.inner.clone();
                let handler = handler.clone();
                let flag = shutdown.clone();
                let name = name.to_string();
                std::thread::spawn(move || {
                    tracing::info!(name = %name, worker = n, "Job worker started");
                    worker_loop(&inner, &name, handler.as_ref(), &flag);
                    tracing::info!(name = %name, worker = n, "Job worker stopped");
                })
            })
            .collect();

        WorkerHandle {
            shutdown,
            inner: self.inner.clone(),
            threads,
        }
    }

    pub fn counts(&self) -> QueueCounts {
        let mut state = self.inner.state();
        purge(&mut state, &self.inner.retention, Instant::now());
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            match record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn job(&self, id: u64) -> Option<JobSnapshot> {
        let state = self.inner.state();
        state.records.get(&id).map(|r| JobSnapshot {
            id,
            name: r.name.clone(),
            state: r.state,
            attempts_made: r.attempts_made,
            progress: r.progress,
            progress_message: r.progress_message.clone(),
            failure: r.failure.clone(),
        })
    }

    /// Drop finished jobs past their retention window.
    pub fn purge_finished(&self) -> usize {
        let mut state = self.inner.state();
        purge(&mut state, &self.inner.retention, Instant::now())
    }
}

fn purge(state: &mut QueueState, retention: &RetentionPolicy, now: Instant) -> usize {
    let before = state.records.len();
    state.records.retain(|_, r| {
        let keep_for = match r.state {
            JobState::Completed => retention.completed,
            JobState::Failed => retention.failed,
            _ => return true,
        };
        r.finished_at
            .map_or(true, |at| now.saturating_duration_since(at) < keep_for)
    });
    before - state.records.len()
}

/// Awaitable outcome of one admitted job.
pub struct JobHandle {
    id: u64,
    receiver: mpsc::Receiver<Result<Value, JobError>>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the job completes or fails for good.
    pub fn finished(&self) -> Result<Value, JobError> {
        self.receiver
            .recv()
            .unwrap_or(Err(JobError::Closed(self.id)))
    }

    pub fn finished_timeout(&self, wait: Duration) -> Result<Value, JobError> {
        match self.receiver.recv_timeout(wait) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(JobError::WaitTimeout {
                id: self.id,
                waited_ms: wait.as_millis(),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(JobError::Closed(self.id)),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════

/// Stops the worker threads on `shutdown()` or drop. An attempt already
/// running completes first.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    inner: Arc<QueueInner>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.inner.wakeup.notify_all();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Claimed {
    id: u64,
    attempt: u32,
    options: JobOptions,
    payload: Value,
}

fn worker_loop(inner: &Arc<QueueInner>, name: &str, handler: &dyn JobHandler, shutdown: &AtomicBool) {
    while let Some(job) = next_job(inner, name, shutdown) {
        let ctx = JobContext {
            job_id: job.id,
            name: name.to_string(),
            attempt: job.attempt,
            max_attempts: job.options.attempts.max(1),
            payload: job.payload,
            inner: inner.clone(),
        };

        let span = tracing::info_span!("job", id = job.id, name, attempt = job.attempt);
        let _enter = span.enter();

        let started = Instant::now();
        let mut outcome = handler.execute(&ctx);
        let elapsed = started.elapsed();

        if let Some(timeout) = job.options.timeout {
            if elapsed > timeout && outcome.is_ok() {
                outcome = Err(JobFailure::Retryable(format!(
                    "attempt exceeded its {}ms timeout",
                    timeout.as_millis()
                )));
            }
        }

        finish(inner, job.id, outcome, elapsed);
    }
}

/// Wait for the next ready job for `name`. `None` on shutdown.
fn next_job(inner: &QueueInner, name: &str, shutdown: &AtomicBool) -> Option<Claimed> {
    let mut state = inner.state();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return None;
        }
        let now = Instant::now();
        purge(&mut state, &inner.retention, now);

        let pending = state
            .records
            .iter()
            .filter(|(_, r)| {
                r.name == name && matches!(r.state, JobState::Waiting | JobState::Delayed)
            })
            .map(|(id, r)| (r.ready_at, *id))
            .min();

        let sleep = match pending {
            Some((ready_at, id)) if ready_at <= now => {
                if let Some(record) = state.records.get_mut(&id) {
                    record.state = JobState::Active;
                    record.attempts_made += 1;
                    return Some(Claimed {
                        id,
                        attempt: record.attempts_made,
                        options: record.options,
                        payload: record.payload.clone(),
                    });
                }
                Duration::ZERO
            }
            Some((ready_at, _)) => (ready_at - now).min(IDLE_POLL),
            None => IDLE_POLL,
        };

        state = inner
            .wakeup
            .wait_timeout(state, sleep)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner().0);
    }
}

fn finish(inner: &QueueInner, id: u64, outcome: Result<Value, JobFailure>, elapsed: Duration) {
    let mut state = inner.state();
    let Some(record) = state.records.get_mut(&id) else {
        return;
    };
    let now = Instant::now();

    let delivery = match outcome {
        Ok(value) => {
            record.state = JobState::Completed;
            record.progress = 100;
            record.finished_at = Some(now);
            tracing::info!(job_id = id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
            inner.count(metrics::JOB_COMPLETED);
            Some(Ok(value))
        }
        Err(failure) => {
            let exhausted = record.attempts_made >= record.options.attempts.max(1);
            let permanent = matches!(failure, JobFailure::Permanent(_));
            record.failure = Some(failure.reason().to_string());

            if permanent || exhausted {
                record.state = JobState::Failed;
                record.finished_at = Some(now);
                tracing::warn!(
                    job_id = id,
                    attempts = record.attempts_made,
                    permanent,
                    reason = failure.reason(),
                    "Job failed"
                );
                inner.count(metrics::JOB_FAILED);
                Some(Err(JobError::Failed {
                    id,
                    attempts: record.attempts_made,
                    reason: failure.reason().to_string(),
                }))
            } else {
                let delay = record.options.backoff.delay(record.attempts_made);
                record.state = JobState::Delayed;
                record.ready_at = now + delay;
                tracing::info!(
                    job_id = id,
                    attempt = record.attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    reason = failure.reason(),
                    "Job attempt failed, retrying after backoff"
                );
                inner.count(metrics::JOB_RETRIED);
                None
            }
        }
    };

    if let Some(result) = delivery {
        if let Some(waiter) = state.waiters.remove(&id) {
            // Receiver gone means nobody is waiting; the record keeps the outcome.
            let _ = waiter.send(result);
        }
    }
    drop(state);
    inner.wakeup.notify_all();
}
