//! Bounded-parallelism iteration, attached task trees and invoke groups
//!
//! This crate runs caller-supplied work across a bounded number of workers
//! with cooperative break, stop and cancellation, and with every failure
//! captured and surfaced once at the top-level call.
//!
//! # Modules
//!
//! - `partition` - Splitting ranges and sequences into claimable batches
//! - `state` - Shared break/stop/cancellation state of a loop run
//! - `engine` - The parallel loop engine and its results
//! - `tree` - Task trees whose nodes complete only after their children
//! - `invoke` - Joined execution of a fixed set of actions
//! - `cancel` - One-shot cancellation sources and tokens
//! - `config` - Engine configuration from code, YAML or environment
//! - `error` - Error taxonomy and chain formatting
//! - `logging` - Scoped timing guard and duration formatting
//!
//! # Example
//!
//! ```rust
//! use parloop::{CancellationToken, EngineConfig, ParallelEngine};
//! use std::sync::atomic::{AtomicI64, Ordering};
//!
//! # fn main() -> parloop::Result<()> {
//! let engine = ParallelEngine::new(EngineConfig::new().with_max_degree_of_parallelism(4))?;
//! let sum = AtomicI64::new(0);
//!
//! engine
//!     .for_range(0..1_000, &CancellationToken::none(), |i, _| {
//!         sum.fetch_add(i, Ordering::Relaxed);
//!         Ok(())
//!     })
//!     .into_result()?;
//!
//! assert_eq!(sum.load(Ordering::Relaxed), 499_500);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod logging;
pub mod partition;
pub mod state;
pub mod tree;

pub use cancel::{CancellationSource, CancellationToken};
pub use config::EngineConfig;
pub use engine::{LoopResult, LoopStatus, LoopSummary, ParallelEngine};
pub use error::{OperationCancelled, ParallelError, Result, TaskError};
pub use invoke::{invoke_all, ActionOutcome, InvokeGroup, InvokeResult};
pub use partition::{Batch, Partitioner, RangePartitioner, SequencePartitioner, WorkItem};
pub use state::{LoopHandle, LoopState};
pub use tree::{TaskContext, TaskId, TaskNode, TaskOutcome, TaskStatus, TaskTree};

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
