//! Joined execution of a fixed set of independent actions
//!
//! Every action gets its own thread in a `rayon` pool sized to the group; the
//! call returns once all of them have finished. A failing action never abandons its siblings: the
//! group still waits for every action and reports each outcome in the order
//! the actions were added.
//!
//! Actions may borrow from the caller's stack, since the group joins them
//! before returning:
//!
//! ```rust
//! use parloop::InvokeGroup;
//!
//! let mut data = vec![0i32; 10];
//! let (front, back) = data.split_at_mut(5);
//!
//! InvokeGroup::new()
//!     .action("increment", || {
//!         front.iter_mut().for_each(|x| *x += 1);
//!         Ok(())
//!     })
//!     .action("decrement", || {
//!         back.iter_mut().for_each(|x| *x -= 2);
//!         Ok(())
//!     })
//!     .invoke()
//!     .into_result()
//!     .unwrap();
//!
//! assert_eq!(data, [1, 1, 1, 1, 1, -2, -2, -2, -2, -2]);
//! ```

use crate::cancel::CancellationToken;
use crate::error::{format_error_chain, panic_message, ParallelError, Result};
use crate::logging::LogGuard;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Action<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'a>;

/// Builder for a group of independent actions joined together
pub struct InvokeGroup<'a> {
    actions: Vec<(String, Action<'a>)>,
    cancellation: CancellationToken,
    thread_prefix: String,
    pool: Option<Arc<ThreadPool>>,
}

impl Default for InvokeGroup<'_> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            cancellation: CancellationToken::none(),
            thread_prefix: "parloop-invoke".to_string(),
            pool: None,
        }
    }
}

impl<'a> InvokeGroup<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a labelled action; the label shows up in logs and outcomes
    pub fn action<F>(mut self, label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'a,
    {
        self.actions.push((label.into(), Box::new(action)));
        self
    }

    /// Actions that have not started when `token` fires are reported as cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    /// Run actions on an existing pool instead of one sized to the group
    ///
    /// Actions only all run at once if the pool has a thread for each of them.
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action concurrently and wait for all of them.
    ///
    /// A failing or panicking action is recorded in its outcome; the group
    /// still waits for every sibling. Actions that have not started when the
    /// cancellation token fires report `ParallelError::Cancelled`.
    ///
    /// # Returns
    ///
    /// An [`InvokeResult`] with one outcome per action, in the order the
    /// actions were added. If the worker pool cannot be created every outcome
    /// carries a `Runtime` error and no action runs.
    pub fn invoke(self) -> InvokeResult {
        let _guard = LogGuard::new("invoke group");
        let started = Instant::now();
        let count = self.actions.len();
        debug!("Invoking {} actions", count);

        let (labels, actions): (Vec<String>, Vec<Action<'a>>) = self.actions.into_iter().unzip();
        let results: Vec<Result<()>> = if count == 0 {
            Vec::new()
        } else {
            let pool = match self.pool {
                Some(pool) => Ok(pool),
                None => build_action_pool(count, &self.thread_prefix).map(Arc::new),
            };
            match pool {
                Ok(pool) => run_on_pool(&pool, actions, &self.cancellation),
                Err(message) => (0..count)
                    .map(|_| Err(ParallelError::Runtime(message.clone())))
                    .collect(),
            }
        };

        let outcomes = labels
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(index, (label, result))| {
                if let Err(error) = &result {
                    warn!("Action '{}' failed: {}", label, format_error_chain(error));
                }
                ActionOutcome { index, label, result }
            })
            .collect();

        InvokeResult {
            outcomes,
            elapsed: started.elapsed(),
        }
    }
}

fn build_action_pool(count: usize, prefix: &str) -> std::result::Result<ThreadPool, String> {
    let prefix = prefix.to_string();
    ThreadPoolBuilder::new()
        .num_threads(count)
        .thread_name(move |i| format!("{}-{}", prefix, i))
        .build()
        .map_err(|e| format!("Failed to create invoke pool: {}", e))
}

fn run_on_pool(pool: &ThreadPool, actions: Vec<Action<'_>>, cancellation: &CancellationToken) -> Vec<Result<()>> {
    let slots: Vec<Mutex<Option<Result<()>>>> = actions.iter().map(|_| Mutex::new(None)).collect();

    pool.scope(|scope| {
        for ((index, action), slot) in actions.into_iter().enumerate().zip(&slots) {
            scope.spawn(move |_| {
                *slot.lock() = Some(run_action(index, action, cancellation));
            });
        }
    });

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.into_inner().unwrap_or_else(|| {
                Err(ParallelError::Runtime(format!("action {} did not report an outcome", index)))
            })
        })
        .collect()
}

fn run_action(index: usize, action: Action<'_>, cancellation: &CancellationToken) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(ParallelError::Cancelled);
    }

    let index = index as i64;
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(ParallelError::item(index, error)),
        Err(payload) => Err(ParallelError::ItemPanicked {
            index,
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Run unlabelled actions of one type concurrently and wait for all of them
pub fn invoke_all<'a, I, F>(actions: I) -> InvokeResult
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> anyhow::Result<()> + Send + 'a,
{
    actions
        .into_iter()
        .enumerate()
        .fold(InvokeGroup::new(), |group, (index, action)| {
            group.action(format!("action-{}", index), action)
        })
        .invoke()
}

/// Outcome of a single action, paired with the action that produced it
#[derive(Debug)]
pub struct ActionOutcome {
    /// Position of the action in the group
    pub index: usize,
    pub label: String,
    pub result: Result<()>,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Ordered outcomes of an invoke group
#[derive(Debug)]
pub struct InvokeResult {
    outcomes: Vec<ActionOutcome>,
    elapsed: Duration,
}

impl InvokeResult {
    /// One outcome per action, in the order the actions were added
    pub fn outcomes(&self) -> &[ActionOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<ActionOutcome> {
        self.outcomes
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(ActionOutcome::is_success)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// `Ok` when every action succeeded, otherwise every failure aggregated
    pub fn into_result(self) -> Result<()> {
        let failures = self
            .outcomes
            .into_iter()
            .filter_map(|o| o.result.err())
            .collect();
        match ParallelError::from_failures(failures) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
