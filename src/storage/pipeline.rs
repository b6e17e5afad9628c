//! Write pipeline: one writer thread, one connection, one bounded queue.
//!
//! All mutation goes through [`WritePipeline`]. A dedicated thread owns the
//! writable `duckdb::Connection` and executes jobs strictly in arrival order.
//! The queue is bounded with drop-oldest overflow: a new job always gets in,
//! the oldest pending job is evicted and its waiter told so.
//!
//! Two entry points:
//! - [`WritePipeline::enqueue`]: fire-and-forget, failures are logged
//! - [`WritePipeline::submit`]: returns a [`JobHandle`] resolving to the job's result

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use duckdb::Connection;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::storage::StorageError;

// =============================================================================
// Constants
// =============================================================================

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Default drain grace period on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Extra wait for the in-flight job after cancellation before abandoning the thread.
const ABANDON_GRACE: Duration = Duration::from_secs(1);

/// Queue wait when no checkpoint is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(1);

// =============================================================================
// Jobs
// =============================================================================

/// What happened to a job the writer picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    Skipped,
}

/// A unit of serialized mutation work.
trait WriteJob: Send {
    fn run(self: Box<Self>, conn: &mut Connection) -> JobOutcome;

    /// Resolve the job without running it.
    fn abort(self: Box<Self>, reason: StorageError);

    /// Telemetry records carried, for the dropped-records counter.
    fn record_count(&self) -> usize;

    /// The waiter is gone; running the job would be wasted work.
    fn is_abandoned(&self) -> bool;

    fn label(&self) -> &'static str;
}

/// Job whose result is delivered to a waiter.
struct TaskJob<T, F> {
    label: &'static str,
    work: F,
    reply: oneshot::Sender<Result<T, StorageError>>,
}

impl<T, F> WriteJob for TaskJob<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
{
    fn run(self: Box<Self>, conn: &mut Connection) -> JobOutcome {
        let TaskJob { label, work, reply } = *self;
        if reply.is_closed() {
            return JobOutcome::Skipped;
        }
        let result = work(conn);
        let outcome = match &result {
            Ok(_) => JobOutcome::Completed,
            Err(e) => {
                tracing::debug!(job = label, error = %e, "Write job failed");
                JobOutcome::Failed
            }
        };
        let _ = reply.send(result);
        outcome
    }

    fn abort(self: Box<Self>, reason: StorageError) {
        let _ = self.reply.send(Err(reason));
    }

    fn record_count(&self) -> usize {
        0
    }

    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn label(&self) -> &'static str {
        self.label
    }
}

/// Job nobody waits for. Failures only reach the log.
struct DetachedJob<F> {
    label: &'static str,
    records: usize,
    work: F,
}

impl<F> WriteJob for DetachedJob<F>
where
    F: FnOnce(&mut Connection) -> Result<(), StorageError> + Send + 'static,
{
    fn run(self: Box<Self>, conn: &mut Connection) -> JobOutcome {
        let DetachedJob {
            label,
            records,
            work,
        } = *self;
        match work(conn) {
            Ok(()) => JobOutcome::Completed,
            Err(e) => {
                tracing::error!(job = label, records, error = %e, "Write job failed");
                JobOutcome::Failed
            }
        }
    }

    fn abort(self: Box<Self>, reason: StorageError) {
        tracing::debug!(
            job = self.label,
            records = self.records,
            reason = %reason,
            "Write job discarded"
        );
    }

    fn record_count(&self) -> usize {
        self.records
    }

    fn is_abandoned(&self) -> bool {
        false
    }

    fn label(&self) -> &'static str {
        self.label
    }
}

/// Completion handle returned by [`WritePipeline::submit`].
///
/// The job is queued when the handle is created. Dropping the handle before
/// the writer reaches the job makes the writer skip it.
#[must_use = "dropping a JobHandle cancels the job if it has not started"]
pub struct JobHandle<T> {
    state: HandleState<T>,
}

enum HandleState<T> {
    Waiting(oneshot::Receiver<Result<T, StorageError>>),
    Failed(Option<StorageError>),
}

impl<T> JobHandle<T> {
    fn failed(e: StorageError) -> Self {
        Self {
            state: HandleState::Failed(Some(e)),
        }
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, StorageError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(StorageError::Internal(
                        "writer released job without a result".to_string(),
                    ))
                })
            }),
            HandleState::Failed(e) => {
                Poll::Ready(Err(e.take().unwrap_or(StorageError::Disposed)))
            }
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

type BoxedJob = Box<dyn WriteJob>;

struct QueueState {
    jobs: VecDeque<BoxedJob>,
    closed: bool,
}

enum Pop {
    Job(BoxedJob),
    Idle,
    Closed,
}

/// Bounded FIFO with drop-oldest overflow.
struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push a job. Returns the evicted job when full, or the job itself when closed.
    fn push(&self, job: BoxedJob) -> Result<Option<BoxedJob>, BoxedJob> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(job);
        }
        let evicted = if state.jobs.len() >= self.capacity {
            state.jobs.pop_front()
        } else {
            None
        };
        state.jobs.push_back(job);
        drop(state);
        self.available.notify_one();
        Ok(evicted)
    }

    /// Next job, waiting up to `timeout`. Remaining jobs are still handed out after close.
    fn pop(&self, timeout: Duration) -> Pop {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Pop::Job(job);
            }
            if state.closed {
                return Pop::Closed;
            }
            let (next, wait) = self
                .available
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if wait.timed_out() && state.jobs.is_empty() {
                return if state.closed { Pop::Closed } else { Pop::Idle };
            }
        }
    }

    fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.available.notify_all();
    }

    fn drain(&self) -> Vec<BoxedJob> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.jobs.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .len()
    }

    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

// =============================================================================
// Counters
// =============================================================================

#[derive(Default)]
struct Counters {
    dropped_jobs: AtomicU64,
    dropped_records: AtomicU64,
    completed_jobs: AtomicU64,
    failed_jobs: AtomicU64,
    cancelled_jobs: AtomicU64,
}

/// Point-in-time view of the pipeline's monotonic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    /// Jobs currently waiting in the queue.
    pub queued: usize,
    /// Jobs evicted by drop-oldest overflow.
    pub dropped_jobs: u64,
    /// Telemetry records carried by evicted jobs.
    pub dropped_records: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Jobs skipped or resolved as cancelled (waiter gone, shutdown timeout).
    pub cancelled_jobs: u64,
}

// =============================================================================
// Writer
// =============================================================================

/// Writer thread configuration.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub queue_capacity: usize,
    /// Periodic `CHECKPOINT` while idle; `None` for memory-resident databases.
    pub checkpoint_interval: Option<Duration>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            checkpoint_interval: None,
        }
    }
}

struct Writer {
    conn: Connection,
    queue: Arc<JobQueue>,
    counters: Arc<Counters>,
    cancel: Arc<AtomicBool>,
    checkpoint_interval: Option<Duration>,
    last_checkpoint: Instant,
    dirty: bool,
}

impl Writer {
    fn run(mut self, done: oneshot::Sender<()>) {
        tracing::info!("Writer started");
        let poll = self.checkpoint_interval.unwrap_or(IDLE_POLL);

        loop {
            if self.cancel.load(Ordering::Acquire) {
                break;
            }
            match self.queue.pop(poll) {
                Pop::Job(job) => self.execute(job),
                Pop::Idle => {}
                Pop::Closed => break,
            }
            self.maybe_checkpoint();
        }

        let cancelled = self.cancel.load(Ordering::Acquire);
        for job in self.queue.drain() {
            self.counters.cancelled_jobs.fetch_add(1, Ordering::Relaxed);
            job.abort(StorageError::Cancelled);
        }
        if !cancelled && self.checkpoint_interval.is_some() {
            if let Err(e) = self.conn.execute_batch("CHECKPOINT") {
                tracing::warn!(error = %e, "Final checkpoint failed");
            }
        }

        tracing::info!("Writer stopped");
        let _ = done.send(());
    }

    fn execute(&mut self, job: BoxedJob) {
        if job.is_abandoned() {
            self.counters.cancelled_jobs.fetch_add(1, Ordering::Relaxed);
            job.abort(StorageError::Cancelled);
            return;
        }

        let label = job.label();
        let conn = &mut self.conn;
        let outcome = catch_unwind(AssertUnwindSafe(move || job.run(conn)));
        match outcome {
            Ok(JobOutcome::Completed) => {
                self.dirty = true;
                self.counters.completed_jobs.fetch_add(1, Ordering::Relaxed);
            }
            Ok(JobOutcome::Failed) => {
                self.counters.failed_jobs.fetch_add(1, Ordering::Relaxed);
            }
            Ok(JobOutcome::Skipped) => {
                self.counters.cancelled_jobs.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::error!(job = label, "Write job panicked");
                self.counters.failed_jobs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn maybe_checkpoint(&mut self) {
        let Some(interval) = self.checkpoint_interval else {
            return;
        };
        if !self.dirty || self.last_checkpoint.elapsed() < interval {
            return;
        }
        if let Err(e) = self.conn.execute_batch("CHECKPOINT") {
            tracing::error!(error = %e, "Periodic checkpoint failed");
        }
        self.dirty = false;
        self.last_checkpoint = Instant::now();
    }
}

// =============================================================================
// Pipeline handle
// =============================================================================

/// Handle to the writer thread.
pub struct WritePipeline {
    queue: Arc<JobQueue>,
    counters: Arc<Counters>,
    cancel: Arc<AtomicBool>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WritePipeline {
    /// Start the writer thread, moving `conn` into it.
    pub fn spawn(conn: Connection, options: WriterOptions) -> Result<Self, StorageError> {
        let queue = Arc::new(JobQueue::new(options.queue_capacity));
        let counters = Arc::new(Counters::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();

        let writer = Writer {
            conn,
            queue: Arc::clone(&queue),
            counters: Arc::clone(&counters),
            cancel: Arc::clone(&cancel),
            checkpoint_interval: options.checkpoint_interval,
            last_checkpoint: Instant::now(),
            dirty: false,
        };
        let handle = thread::Builder::new()
            .name("spanvault-writer".to_string())
            .spawn(move || writer.run(done_tx))?;

        Ok(Self {
            queue,
            counters,
            cancel,
            done: Mutex::new(Some(done_rx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Queue a fire-and-forget job.
    ///
    /// Never blocks. On saturation the oldest pending job is evicted.
    /// Fails only once the pipeline is closed.
    pub fn enqueue<F>(
        &self,
        label: &'static str,
        records: usize,
        work: F,
    ) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<(), StorageError> + Send + 'static,
    {
        self.push(Box::new(DetachedJob {
            label,
            records,
            work,
        }))
        .map_err(|_| StorageError::Disposed)
    }

    /// Queue a job and return a handle resolving to its result.
    pub fn submit<T, F>(&self, label: &'static str, work: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        match self.push(Box::new(TaskJob { label, work, reply })) {
            Ok(()) => JobHandle {
                state: HandleState::Waiting(rx),
            },
            Err(_) => JobHandle::failed(StorageError::Disposed),
        }
    }

    fn push(&self, job: BoxedJob) -> Result<(), BoxedJob> {
        let evicted = self.queue.push(job)?;
        if let Some(old) = evicted {
            let records = old.record_count() as u64;
            let dropped = self.counters.dropped_jobs.fetch_add(1, Ordering::Relaxed) + 1;
            self.counters
                .dropped_records
                .fetch_add(records, Ordering::Relaxed);
            tracing::warn!(
                job = old.label(),
                records,
                dropped,
                "Write queue full, dropping oldest job"
            );
            old.abort(StorageError::Dropped);
        }
        Ok(())
    }

    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            queued: self.queue.len(),
            dropped_jobs: self.counters.dropped_jobs.load(Ordering::Relaxed),
            dropped_records: self.counters.dropped_records.load(Ordering::Relaxed),
            completed_jobs: self.counters.completed_jobs.load(Ordering::Relaxed),
            failed_jobs: self.counters.failed_jobs.load(Ordering::Relaxed),
            cancelled_jobs: self.counters.cancelled_jobs.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Stop accepting jobs without waiting for the writer.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Close the queue, let the writer drain for `grace`, then cancel.
    ///
    /// Jobs still queued after the grace period resolve as
    /// [`StorageError::Cancelled`]. A job already running is given a short
    /// extra window, after which the thread is abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.queue.close();
        let done = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut done) = done else {
            return;
        };

        if tokio::time::timeout(grace, &mut done).await.is_err() {
            self.cancel.store(true, Ordering::Release);
            let leftovers = self.queue.drain();
            tracing::warn!(
                remaining = leftovers.len(),
                "Writer did not drain within grace period, cancelling"
            );
            for job in leftovers {
                self.counters.cancelled_jobs.fetch_add(1, Ordering::Relaxed);
                job.abort(StorageError::Cancelled);
            }
            if tokio::time::timeout(ABANDON_GRACE, &mut done).await.is_err() {
                tracing::error!("Writer still busy after cancellation, abandoning thread");
                return;
            }
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl std::fmt::Debug for WritePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePipeline")
            .field("capacity", &self.queue.capacity)
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

impl Drop for WritePipeline {
    fn drop(&mut self) {
        // Best-effort: the writer drains what is queued and exits on its own.
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pipeline(capacity: usize) -> WritePipeline {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE kv (k VARCHAR PRIMARY KEY, v INTEGER)")
            .unwrap();
        WritePipeline::spawn(
            conn,
            WriterOptions {
                queue_capacity: capacity,
                checkpoint_interval: None,
            },
        )
        .unwrap()
    }

    /// Occupy the writer until the returned sender fires.
    fn block_writer(p: &WritePipeline) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        p.enqueue("gate", 0, move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    fn set(p: &WritePipeline, v: i32) -> JobHandle<()> {
        p.submit("set", move |conn| {
            conn.execute(
                "INSERT INTO kv VALUES ('x', ?) ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v",
                [v],
            )?;
            Ok(())
        })
    }

    fn get(p: &WritePipeline) -> JobHandle<i32> {
        p.submit("get", |conn| {
            Ok(conn.query_row("SELECT v FROM kv WHERE k = 'x'", [], |r| r.get(0))?)
        })
    }

    #[tokio::test]
    async fn test_submit_returns_result() {
        let p = pipeline(16);
        let n: i64 = p
            .submit("probe", |conn| Ok(conn.query_row("SELECT 41 + 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 42);
        assert_eq!(p.counters().completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_writes_apply_in_enqueue_order() {
        let p = pipeline(16);
        let a = set(&p, 1);
        let b = set(&p, 2);
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(get(&p).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_writer() {
        let p = pipeline(16);
        let err = p
            .submit("bad", |conn| {
                conn.execute_batch("INSERT INTO missing_table VALUES (1)")?;
                Ok(())
            })
            .await;
        assert!(matches!(err, Err(StorageError::Database(_))));

        set(&p, 7).await.unwrap();
        assert_eq!(get(&p).await.unwrap(), 7);
        assert_eq!(p.counters().failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_writer() {
        let p = pipeline(16);
        let result: Result<(), _> = p.submit("boom", |_| panic!("boom")).await;
        assert!(matches!(result, Err(StorageError::Internal(_))));
        set(&p, 3).await.unwrap();
        assert_eq!(get(&p).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let p = pipeline(4);
        let release = block_writer(&p);

        let mut handles: Vec<_> = (0..4).map(|i| set(&p, i)).collect();
        assert_eq!(p.counters().queued, 4);

        p.enqueue("extra", 25, |_| Ok(())).unwrap();

        let counters = p.counters();
        assert_eq!(counters.queued, 4);
        assert_eq!(counters.dropped_jobs, 1);
        assert_eq!(counters.dropped_records, 0);

        release.send(()).unwrap();
        let first = handles.remove(0);
        assert!(matches!(first.await, Err(StorageError::Dropped)));
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(get(&p).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dropped_records_counted_for_detached_jobs() {
        let p = pipeline(2);
        let release = block_writer(&p);
        p.enqueue("spans", 10, |_| Ok(())).unwrap();
        p.enqueue("spans", 20, |_| Ok(())).unwrap();
        p.enqueue("spans", 30, |_| Ok(())).unwrap();

        let counters = p.counters();
        assert_eq!(counters.dropped_jobs, 1);
        assert_eq!(counters.dropped_records, 10);
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_job_is_skipped() {
        let p = pipeline(16);
        let release = block_writer(&p);

        let handle = set(&p, 99);
        drop(handle);
        release.send(()).unwrap();

        let v: Result<i32, _> = get(&p).await;
        assert!(matches!(
            v,
            Err(StorageError::Database(duckdb::Error::QueryReturnedNoRows))
        ));
        assert_eq!(p.counters().cancelled_jobs, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let p = pipeline(16);
        let handles: Vec<_> = (0..5).map(|i| set(&p, i)).collect();
        p.shutdown(Duration::from_secs(3)).await;
        for h in handles {
            h.await.unwrap();
        }
        assert!(p.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_timeout_cancels_remaining_jobs() {
        let p = pipeline(16);
        let release = block_writer(&p);
        let pending: Vec<_> = (0..3).map(|i| set(&p, i)).collect();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            let _ = release.send(());
        });
        p.shutdown(Duration::from_millis(50)).await;

        for h in pending {
            assert!(matches!(h.await, Err(StorageError::Cancelled)));
        }
        assert_eq!(p.counters().cancelled_jobs, 3);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_disposed() {
        let p = pipeline(4);
        p.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(set(&p, 1).await, Err(StorageError::Disposed)));
        assert!(matches!(
            p.enqueue("late", 1, |_| Ok(())),
            Err(StorageError::Disposed)
        ));
    }
}
