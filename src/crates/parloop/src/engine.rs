//! Bounded-parallelism loop engine
//!
//! [`ParallelEngine`] drives up to `max_degree_of_parallelism` workers over a
//! [`Partitioner`]. Each worker claims a batch, runs its items in ascending
//! index order, and claims the next one. Batches on different workers
//! interleave freely: item 500 may finish before item 10.
//!
//! # Loop semantics
//!
//! - **Break**: `LoopHandle::request_break` lowers the shared break index.
//!   From then on no worker starts an item above it; items at or below it that
//!   are already claimed still run. This is best effort: items below the break
//!   index that no worker had reached are not guaranteed to run.
//! - **Stop**: `LoopHandle::stop` prevents any new item from starting.
//! - **Cancellation**: the run's [`CancellationToken`] is polled before every
//!   item; once fired nothing new starts and the run reports `Cancelled`.
//! - **Failures**: an error or panic from a body is captured, recorded against
//!   its index, and halts the start of new items. In-flight items finish.
//!
//! # Example
//!
//! ```rust
//! use parloop::{CancellationToken, EngineConfig, LoopStatus, ParallelEngine};
//!
//! # fn example() -> parloop::Result<()> {
//! let engine = ParallelEngine::new(EngineConfig::new().with_max_degree_of_parallelism(1))?;
//!
//! let result = engine.for_range(1..100, &CancellationToken::none(), |i, state| {
//!     if i == 42 {
//!         state.request_break();
//!     }
//!     Ok(())
//! });
//!
//! assert_eq!(result.status(), LoopStatus::Broken { lowest_break_index: 42 });
//! assert_eq!(result.executed(), 42);
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::{format_error_chain, panic_message, ParallelError, Result};
use crate::logging::{format_duration, LogGuard};
use crate::partition::{Partitioner, RangePartitioner, SequencePartitioner, WorkItem};
use crate::state::{LoopHandle, LoopState};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a loop run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopStatus {
    /// Every claimed item ran; no break, stop or cancellation
    Completed,
    /// A break was requested; carries the lowest requested index
    Broken { lowest_break_index: i64 },
    /// The body requested a stop
    Stopped,
    /// The cancellation signal fired
    Cancelled,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::Completed => write!(f, "completed"),
            LoopStatus::Broken { lowest_break_index } => {
                write!(f, "broken at {}", lowest_break_index)
            }
            LoopStatus::Stopped => write!(f, "stopped"),
            LoopStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one engine run
///
/// The status and the captured failures are independent: a broken, stopped or
/// cancelled run can also carry failures.
#[derive(Debug)]
pub struct LoopResult {
    status: LoopStatus,
    executed: u64,
    skipped: u64,
    failures: Vec<ParallelError>,
    workers: usize,
    elapsed: Duration,
}

impl LoopResult {
    pub fn status(&self) -> LoopStatus {
        self.status
    }

    /// True only when the loop ran to the end without break, stop,
    /// cancellation or failure
    pub fn is_completed(&self) -> bool {
        self.status == LoopStatus::Completed && self.failures.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == LoopStatus::Cancelled
    }

    pub fn lowest_break_index(&self) -> Option<i64> {
        match self.status {
            LoopStatus::Broken { lowest_break_index } => Some(lowest_break_index),
            _ => None,
        }
    }

    /// Number of body invocations that started
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Items that were claimed by a worker but never started
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn failures(&self) -> &[ParallelError] {
        &self.failures
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Number of workers the run used
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Serializable digest for logging and telemetry
    pub fn summary(&self) -> LoopSummary {
        LoopSummary {
            status: self.status,
            executed: self.executed,
            skipped: self.skipped,
            failures: self.failures.iter().map(|e| e.to_string()).collect(),
            workers: self.workers,
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }

    /// Turn failures and cancellation into an error
    ///
    /// Failures win over cancellation; when both occurred the aggregate also
    /// carries a `Cancelled` entry. Broken and stopped runs without failures
    /// are `Ok`.
    pub fn into_result(self) -> Result<LoopResult> {
        if self.failures.is_empty() {
            return if self.is_cancelled() {
                Err(ParallelError::Cancelled)
            } else {
                Ok(self)
            };
        }

        let mut failures = self.failures;
        if self.status == LoopStatus::Cancelled {
            failures.push(ParallelError::Cancelled);
        }
        Err(ParallelError::from_failures(failures).unwrap_or(ParallelError::Cancelled))
    }
}

impl std::fmt::Display for LoopResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} executed, {} skipped, {} failed in {}",
            self.status,
            self.executed,
            self.skipped,
            self.failures.len(),
            format_duration(self.elapsed)
        )
    }
}

/// Serializable digest of a [`LoopResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub status: LoopStatus,
    pub executed: u64,
    pub skipped: u64,
    pub failures: Vec<String>,
    pub workers: usize,
    pub elapsed_ms: u64,
}

impl LoopSummary {
    /// Encode as a single-line JSON document
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Runs caller-supplied bodies over ranges and sequences with bounded parallelism
///
/// Each engine owns a `rayon` thread pool sized to its degree of parallelism
/// and reuses it for every run. An engine with a single worker has no pool and
/// runs loops on the calling thread.
#[derive(Debug, Clone)]
pub struct ParallelEngine {
    config: EngineConfig,
    workers: usize,
    pool: Option<Arc<ThreadPool>>,
}

impl ParallelEngine {
    /// Create an engine; fails if the configuration is invalid or the worker
    /// pool cannot be started
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let workers = config.effective_parallelism();
        let pool = if workers > 1 {
            Some(Arc::new(build_worker_pool(workers, &config.worker_name_prefix)?))
        } else {
            None
        };
        debug!("Engine ready with {} workers", workers);

        Ok(Self {
            config,
            workers,
            pool,
        })
    }

    /// Create an engine from `PARLOOP_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env(EngineConfig::ENV_PREFIX)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Degree of parallelism every run uses
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `body` for every index in `range`
    pub fn for_range<F>(&self, range: Range<i64>, cancellation: &CancellationToken, body: F) -> LoopResult
    where
        F: Fn(i64, &LoopHandle<'_>) -> anyhow::Result<()> + Sync,
    {
        let workers = self.workers;
        let partitioner = match self.config.chunk_size {
            Some(chunk) => RangePartitioner::new(range, chunk),
            None => RangePartitioner::with_parallelism(range, workers, self.config.chunks_per_worker),
        };
        debug!("Range loop chunk size: {}", partitioner.chunk_size());

        self.run(&partitioner, cancellation, |item: WorkItem<()>, state| body(item.index, state))
    }

    /// Run `body` for every element of `source`
    ///
    /// The source is pulled under a lock, one batch at a time, so it does not
    /// need to be thread-safe. Elements are indexed from 0 in source order;
    /// the index is available from the handle.
    pub fn for_each<'a, I, T, F>(&self, source: I, cancellation: &CancellationToken, body: F) -> LoopResult
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'a,
        T: Send + 'a,
        F: Fn(T, &LoopHandle<'_>) -> anyhow::Result<()> + Sync,
    {
        let partitioner = SequencePartitioner::new(source, self.config.max_sequence_chunk);
        self.run(&partitioner, cancellation, |item: WorkItem<T>, state| body(item.value, state))
    }

    /// Like [`for_each`](Self::for_each) for sources whose elements may fail
    ///
    /// A failing element is recorded as `PartitionExhausted` and ends the
    /// consumption of the source.
    pub fn try_for_each<'a, I, T, F>(&self, source: I, cancellation: &CancellationToken, body: F) -> LoopResult
    where
        I: IntoIterator<Item = anyhow::Result<T>>,
        I::IntoIter: Send + 'a,
        T: Send + 'a,
        F: Fn(T, &LoopHandle<'_>) -> anyhow::Result<()> + Sync,
    {
        let partitioner = SequencePartitioner::fallible(source, self.config.max_sequence_chunk);
        self.run(&partitioner, cancellation, |item: WorkItem<T>, state| body(item.value, state))
    }

    /// Run `body` over every item handed out by `partitioner`.
    ///
    /// Blocks the calling thread until every worker has finished. With a
    /// degree of parallelism of 1 the loop runs on the calling thread.
    ///
    /// # Arguments
    ///
    /// * `partitioner` - Source of batches, shared by all workers
    /// * `cancellation` - Token polled before every item starts
    /// * `body` - Called once per started item with the item and its loop handle
    ///
    /// # Returns
    ///
    /// A [`LoopResult`] carrying the final status, the executed and skipped
    /// counts, and every captured failure. Failures never escape as panics.
    pub fn run<T, P, F>(&self, partitioner: &P, cancellation: &CancellationToken, body: F) -> LoopResult
    where
        T: Send,
        P: Partitioner<T> + ?Sized,
        F: Fn(WorkItem<T>, &LoopHandle<'_>) -> anyhow::Result<()> + Sync,
    {
        let _guard = LogGuard::new("parallel loop");
        let started = Instant::now();

        let workers = self.workers;
        let state = LoopState::new(cancellation.clone());
        let run = RunContext {
            partitioner,
            state: &state,
            body: &body,
            failures: parking_lot::Mutex::new(Vec::new()),
            _item: PhantomData,
        };

        debug!(
            "Starting loop with {} workers (items: {:?})",
            workers,
            partitioner.len_hint()
        );

        let tallies = match &self.pool {
            Some(pool) => run_on_pool(pool, &run, workers),
            None => vec![run.work()],
        };

        let mut executed = 0;
        let mut skipped = 0;
        for tally in tallies {
            executed += tally.executed;
            skipped += tally.skipped;
        }

        let status = if state.is_cancelled() {
            LoopStatus::Cancelled
        } else if state.is_stop_requested() {
            LoopStatus::Stopped
        } else if let Some(lowest_break_index) = state.lowest_break_index() {
            LoopStatus::Broken { lowest_break_index }
        } else {
            LoopStatus::Completed
        };

        let mut failures = run.failures.into_inner();
        failures.sort_by_key(|f| f.index().unwrap_or(i64::MAX));

        let result = LoopResult {
            status,
            executed,
            skipped,
            failures,
            workers,
            elapsed: started.elapsed(),
        };
        debug!("Loop finished: {}", result);
        result
    }
}

fn build_worker_pool(workers: usize, prefix: &str) -> Result<ThreadPool> {
    let prefix = prefix.to_string();
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(move |i| format!("{}-{}", prefix, i))
        .build()
        .map_err(|e| ParallelError::Runtime(format!("Failed to create worker pool: {}", e)))
}

/// Start one worker per pool thread and wait for all of them
fn run_on_pool<T, P, F>(pool: &ThreadPool, run: &RunContext<'_, T, P, F>, workers: usize) -> Vec<WorkerTally>
where
    T: Send,
    P: Partitioner<T> + ?Sized,
    F: Fn(WorkItem<T>, &LoopHandle<'_>) -> anyhow::Result<()> + Sync,
{
    let tallies = parking_lot::Mutex::new(Vec::with_capacity(workers));

    pool.scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| {
                // Bodies unwind inside `invoke`; a panic here came from the partitioner.
                let tally = catch_unwind(AssertUnwindSafe(|| run.work())).unwrap_or_else(|payload| {
                    run.fail(ParallelError::Runtime(format!(
                        "worker panicked while pulling work: {}",
                        panic_message(payload.as_ref())
                    )));
                    WorkerTally::default()
                });
                tallies.lock().push(tally);
            });
        }
    });

    tallies.into_inner()
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    executed: u64,
    skipped: u64,
}

struct RunContext<'r, T, P: ?Sized, F> {
    partitioner: &'r P,
    state: &'r LoopState,
    body: &'r F,
    failures: parking_lot::Mutex<Vec<ParallelError>>,
    _item: PhantomData<fn(T)>,
}

impl<'r, T, P, F> RunContext<'r, T, P, F>
where
    T: Send,
    P: Partitioner<T> + ?Sized,
    F: Fn(WorkItem<T>, &LoopHandle<'_>) -> anyhow::Result<()> + Sync,
{
    fn work(&self) -> WorkerTally {
        let mut tally = WorkerTally::default();

        while !self.state.should_halt() {
            let batch = match self.partitioner.next_batch() {
                None => break,
                Some(Ok(batch)) => batch,
                Some(Err(error)) => {
                    self.fail(error);
                    break;
                }
            };

            // Indices only grow from here on, so a batch starting past the
            // break point means there is nothing left for this worker.
            if !self.state.may_start(batch.start()) {
                tally.skipped += batch.len() as u64;
                break;
            }

            let mut items = batch.into_items();
            while let Some(item) = items.next() {
                if !self.state.may_start(item.index) {
                    tally.skipped += 1 + items.by_ref().count() as u64;
                    break;
                }
                tally.executed += 1;
                self.invoke(item);
            }
        }

        tally
    }

    fn invoke(&self, item: WorkItem<T>) {
        let index = item.index;
        let handle = self.state.handle(index);

        match catch_unwind(AssertUnwindSafe(|| (self.body)(item, &handle))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => self.fail(ParallelError::item(index, error)),
            Err(payload) => self.fail(ParallelError::ItemPanicked {
                index,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    fn fail(&self, error: ParallelError) {
        warn!("{}", format_error_chain(&error));
        self.failures.lock().push(error);
        self.state.halt_on_failure();
    }
}
