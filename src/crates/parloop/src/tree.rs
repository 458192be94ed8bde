//! Attached task trees
//!
//! A [`TaskTree`] spawns units of work that may attach children of their own.
//! A node becomes terminal only once its own body has finished **and** every
//! attached child has become terminal; the last of those events promotes the
//! node, and the promotion walks up the parent chain.
//!
//! Status precedence on a node is Failed > Cancelled > Succeeded: one failed
//! child fails every ancestor, a cancelled child cancels its parent unless the
//! parent already has a failure.
//!
//! Bodies are synchronous and run on the tokio blocking pool. Waiting is
//! available both as a future ([`TaskNode::wait`]) and as a blocking call
//! ([`TaskNode::wait_blocking`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use parloop::{TaskStatus, TaskTree};
//!
//! # async fn example() -> parloop::Result<()> {
//! let tree = TaskTree::try_current()?;
//! let root = tree.spawn(None, |ctx| {
//!     for part in 0..4 {
//!         ctx.spawn_child(move |_| {
//!             println!("part {part}");
//!             Ok(())
//!         })?;
//!     }
//!     Ok(())
//! })?;
//!
//! let outcome = root.wait().await;
//! assert_eq!(outcome.status, TaskStatus::Succeeded);
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancellationToken;
use crate::error::{format_error_chain, panic_message, OperationCancelled, ParallelError, Result, TaskError};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier of a task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Spawned, body not started yet
    Pending,
    /// Body running, or body done with children still pending
    Running,
    /// Body and every child succeeded
    Succeeded,
    /// The body or some descendant failed
    Failed,
    /// The body or some descendant was cancelled, and nothing failed
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Running => write!(f, "Running"),
            TaskStatus::Succeeded => write!(f, "Succeeded"),
            TaskStatus::Failed => write!(f, "Failed"),
            TaskStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Terminal outcome of a node and its whole subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub status: TaskStatus,
    /// The node's own failure (if any) followed by one entry per failed child
    pub errors: Vec<TaskError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    /// Convert into a `Result`, aggregating every recorded failure
    pub fn into_result(self) -> Result<()> {
        match self.status {
            TaskStatus::Succeeded => Ok(()),
            TaskStatus::Cancelled => Err(TaskError::Cancelled { task: self.id }.into()),
            TaskStatus::Failed => {
                let failures = self.errors.into_iter().map(ParallelError::Task).collect();
                Err(ParallelError::from_failures(failures).unwrap_or_else(|| {
                    ParallelError::Runtime(format!("task {} failed without an error", self.id))
                }))
            }
            TaskStatus::Pending | TaskStatus::Running => Err(ParallelError::Runtime(format!(
                "task {} has not completed",
                self.id
            ))),
        }
    }
}

enum BodyOutcome {
    Succeeded,
    Failed(TaskError),
    Cancelled,
}

struct NodeState {
    status: TaskStatus,
    body_finished: bool,
    pending_children: usize,
    cancelled: bool,
    errors: Vec<TaskError>,
    children: Vec<TaskNode>,
}

struct NodeInner {
    id: TaskId,
    parent: Option<Weak<NodeInner>>,
    state: Mutex<NodeState>,
    status_tx: watch::Sender<TaskStatus>,
}

impl NodeInner {
    fn set_status(&self, state: &mut NodeState, status: TaskStatus) {
        state.status = status;
        // Sent under the lock so observers never see statuses out of order.
        self.status_tx.send_replace(status);
    }

    fn finish_body(&self, outcome: BodyOutcome) {
        let mut state = self.state.lock();
        state.body_finished = true;
        match outcome {
            BodyOutcome::Succeeded => {}
            BodyOutcome::Cancelled => state.cancelled = true,
            BodyOutcome::Failed(error) => {
                warn!("{}", format_error_chain(&error));
                state.errors.insert(0, error);
            }
        }
        self.complete_if_settled(state);
    }

    fn child_finished(&self, child: TaskId, status: TaskStatus, error: Option<TaskError>) {
        let mut state = self.state.lock();
        state.pending_children = state.pending_children.saturating_sub(1);
        match status {
            TaskStatus::Failed => {
                if let Some(source) = error {
                    state.errors.push(TaskError::Child {
                        parent: self.id,
                        child,
                        source: Box::new(source),
                    });
                }
            }
            TaskStatus::Cancelled => state.cancelled = true,
            _ => {}
        }
        self.complete_if_settled(state);
    }

    /// Promote to terminal once the body is done and no child is pending,
    /// then report to the parent
    fn complete_if_settled(&self, mut state: MutexGuard<'_, NodeState>) {
        if !state.body_finished || state.pending_children > 0 || state.status.is_terminal() {
            return;
        }

        let status = if !state.errors.is_empty() {
            TaskStatus::Failed
        } else if state.cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Succeeded
        };
        self.set_status(&mut state, status);
        let first_error = state.errors.first().cloned();
        drop(state);

        debug!("Task {} completed: {}", self.id, status);

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.child_finished(self.id, status, first_error);
        }
    }
}

/// Handle to a node of a task tree
///
/// Cheap to clone; every clone refers to the same node.
#[derive(Clone)]
pub struct TaskNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskNode")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("pending_children", &state.pending_children)
            .finish()
    }
}

impl TaskNode {
    fn new(parent: Option<&TaskNode>) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        Self {
            inner: Arc::new(NodeInner {
                id: TaskId::new(),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                state: Mutex::new(NodeState {
                    status: TaskStatus::Pending,
                    body_finished: false,
                    pending_children: 0,
                    cancelled: false,
                    errors: Vec::new(),
                    children: Vec::new(),
                }),
                status_tx,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// The parent node, while it is still alive
    pub fn parent(&self) -> Option<TaskNode> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| TaskNode { inner })
    }

    pub fn children(&self) -> Vec<TaskNode> {
        self.inner.state.lock().children.clone()
    }

    /// Attached children that have not reached a terminal status yet
    pub fn pending_children(&self) -> usize {
        self.inner.state.lock().pending_children
    }

    /// Wait until this node and its whole subtree are terminal
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.inner.status_tx.subscribe();
        // The sender lives in `self.inner`, so the channel cannot close here.
        let _ = rx.wait_for(TaskStatus::is_terminal).await;
        self.outcome()
    }

    /// Blocking variant of [`wait`](Self::wait)
    ///
    /// Parks the calling thread; do not call from inside an async task.
    pub fn wait_blocking(&self) -> TaskOutcome {
        futures::executor::block_on(self.wait())
    }

    fn outcome(&self) -> TaskOutcome {
        let state = self.inner.state.lock();
        TaskOutcome {
            id: self.inner.id,
            status: state.status,
            errors: state.errors.clone(),
        }
    }

    fn attach(&self, child: &TaskNode) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return Err(ParallelError::TaskCompleted(self.inner.id));
        }
        state.pending_children += 1;
        state.children.push(child.clone());
        Ok(())
    }

    fn mark_running(&self) {
        let mut state = self.inner.state.lock();
        if state.status == TaskStatus::Pending {
            self.inner.set_status(&mut state, TaskStatus::Running);
        }
    }
}

/// Context handed to every task body
#[derive(Clone)]
pub struct TaskContext {
    node: TaskNode,
    tree: TaskTree,
}

impl TaskContext {
    /// The node this body belongs to
    pub fn node(&self) -> &TaskNode {
        &self.node
    }

    pub fn id(&self) -> TaskId {
        self.node.id()
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Spawn a child attached to this task
    pub fn spawn_child<F>(&self, work: F) -> Result<TaskNode>
    where
        F: FnOnce(TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.tree.spawn(Some(&self.node), work)
    }

    pub fn is_cancelled(&self) -> bool {
        self.tree.cancellation.is_cancelled()
    }

    /// Return `Err(OperationCancelled)` once the tree's token has fired
    ///
    /// Propagating it out of the body with `?` ends the task as Cancelled.
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(OperationCancelled.into());
        }
        Ok(())
    }
}

/// Spawner for attached task trees
#[derive(Debug, Clone)]
pub struct TaskTree {
    handle: Handle,
    cancellation: CancellationToken,
}

impl TaskTree {
    /// Tree scheduling on the current tokio runtime
    pub fn try_current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| ParallelError::Runtime(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::with_handle(handle))
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            cancellation: CancellationToken::none(),
        }
    }

    /// Tasks whose body has not started when `token` fires end as Cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Spawn `work`, attached to `parent` when one is given.
    ///
    /// The child is counted on the parent before it is scheduled.
    ///
    /// # Arguments
    ///
    /// * `parent` - Node to attach to, or `None` for a root task
    /// * `work` - Body run on the blocking pool; it receives a [`TaskContext`]
    ///   for spawning its own children
    ///
    /// # Returns
    ///
    /// The new [`TaskNode`], or `ParallelError::TaskCompleted` if `parent` is
    /// already terminal.
    pub fn spawn<F>(&self, parent: Option<&TaskNode>, work: F) -> Result<TaskNode>
    where
        F: FnOnce(TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        let node = TaskNode::new(parent);
        if let Some(parent) = parent {
            parent.attach(&node)?;
            debug!("Spawning task {} under {}", node.id(), parent.id());
        } else {
            debug!("Spawning root task {}", node.id());
        }

        let context = TaskContext {
            node: node.clone(),
            tree: self.clone(),
        };
        self.handle.spawn_blocking(move || run_body(context, work));

        Ok(node)
    }
}

fn run_body<F>(context: TaskContext, work: F)
where
    F: FnOnce(TaskContext) -> anyhow::Result<()>,
{
    let node = context.node.clone();
    let task = node.id();

    if context.is_cancelled() {
        debug!("Task {} cancelled before start", task);
        node.inner.finish_body(BodyOutcome::Cancelled);
        return;
    }

    node.mark_running();

    let outcome = match catch_unwind(AssertUnwindSafe(|| work(context))) {
        Ok(Ok(())) => BodyOutcome::Succeeded,
        Ok(Err(error)) if error.chain().any(|cause| cause.is::<OperationCancelled>()) => {
            BodyOutcome::Cancelled
        }
        Ok(Err(error)) => BodyOutcome::Failed(TaskError::Failed {
            task,
            message: format!("{:#}", error),
        }),
        Err(payload) => BodyOutcome::Failed(TaskError::Panicked {
            task,
            message: panic_message(payload.as_ref()),
        }),
    };

    node.inner.finish_body(outcome);
}
