//! Error types for parallel loops, task trees and invoke groups
//!
//! Failures raised by caller-supplied work are captured where they happen and
//! surfaced once, at the top-level `run`/`wait`/`invoke` return. Nothing here is
//! thrown across a worker boundary.
//!
//! # Error Hierarchy
//!
//! ```text
//! ParallelError
//! ├── Item               - a body returned an error for one item
//! ├── ItemPanicked       - a body panicked for one item
//! ├── PartitionExhausted - the input sequence failed while being pulled
//! ├── Cancelled          - the cancellation signal fired
//! ├── Task               - task tree failures (including child failures)
//! ├── Aggregate          - several failures collected from one run
//! ├── Configuration      - invalid engine configuration
//! ├── Runtime            - no async runtime to schedule tasks on
//! ├── Serialization      - result telemetry could not be encoded
//! └── TaskCompleted      - attach attempted under a finished task
//! ```

use crate::tree::TaskId;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error used as the source of captured failures
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for parloop operations
pub type Result<T> = std::result::Result<T, ParallelError>;

/// Main error type for parloop operations
#[derive(Debug, Error)]
pub enum ParallelError {
    /// A body invocation failed for a specific item
    #[error("item {index} failed: {source}")]
    Item {
        index: i64,
        #[source]
        source: BoxError,
    },

    /// A body invocation panicked for a specific item
    #[error("item {index} panicked: {message}")]
    ItemPanicked { index: i64, message: String },

    /// The input sequence failed while a batch was being pulled
    #[error("source sequence failed at item {index}: {source}")]
    PartitionExhausted {
        index: i64,
        #[source]
        source: BoxError,
    },

    /// The cancellation signal fired before the work finished
    #[error("operation was cancelled")]
    Cancelled,

    /// A task in a task tree failed
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Several failures collected from a single run
    #[error("{} failures occurred; first: {}", .0.len(), first_message(.0))]
    Aggregate(Vec<ParallelError>),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No runtime available to schedule tasks on
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Result telemetry could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A child was attached to a task that already reached a terminal status
    #[error("task {0} has already completed")]
    TaskCompleted(TaskId),
}

impl ParallelError {
    /// Build an item failure from a body error
    pub fn item(index: i64, error: anyhow::Error) -> Self {
        Self::Item {
            index,
            source: error.into(),
        }
    }

    /// Index of the item (or action) this failure belongs to, if any
    pub fn index(&self) -> Option<i64> {
        match self {
            Self::Item { index, .. }
            | Self::ItemPanicked { index, .. }
            | Self::PartitionExhausted { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether this error (or any aggregated error) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Task(TaskError::Cancelled { .. }) => true,
            Self::Aggregate(errors) => errors.iter().any(ParallelError::is_cancelled),
            _ => false,
        }
    }

    /// Collapse a list of failures: none, one as-is, or an aggregate
    pub fn from_failures(mut failures: Vec<ParallelError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(Self::Aggregate(failures)),
        }
    }
}

fn first_message(errors: &[ParallelError]) -> String {
    errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_default()
}

/// Terminal failure of a task node
///
/// Cloneable so that every waiter on the same node observes the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The task's own body returned an error
    #[error("task {task} failed: {message}")]
    Failed { task: TaskId, message: String },

    /// The task's own body panicked
    #[error("task {task} panicked: {message}")]
    Panicked { task: TaskId, message: String },

    /// The task was cancelled before or during its body
    #[error("task {task} was cancelled")]
    Cancelled { task: TaskId },

    /// An attached child failed, failing the parent
    #[error("child task {child} of task {parent} failed")]
    Child {
        parent: TaskId,
        child: TaskId,
        #[source]
        source: Box<TaskError>,
    },
}

impl TaskError {
    /// Id of the task that originally failed, following child links down
    pub fn origin(&self) -> TaskId {
        match self {
            Self::Failed { task, .. } | Self::Panicked { task, .. } | Self::Cancelled { task } => {
                *task
            }
            Self::Child { source, .. } => source.origin(),
        }
    }
}

/// Marker error returned by cooperative cancellation checks
///
/// A task body that returns this error (directly or wrapped in `anyhow`) ends
/// as Cancelled rather than Failed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct OperationCancelled;

/// Render a panic payload captured by `catch_unwind`
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Format an error chain as a multi-line string
///
/// Walks the chain via `source()` and prints each cause on its own,
/// progressively indented line.
pub fn format_error_chain(error: &dyn StdError) -> String {
    let mut result = format!("Error: {}", error);
    let mut current = error.source();
    let mut level = 1;

    while let Some(source) = current {
        result.push_str(&format!(
            "\n{:indent$}Caused by: {}",
            "",
            source,
            indent = level * 2
        ));
        current = source.source();
        level += 1;
    }

    result
}

/// Get the root cause of an error chain
pub fn root_cause(error: &dyn StdError) -> &dyn StdError {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current
}
