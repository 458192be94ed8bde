//! Shared loop state
//!
//! One [`LoopState`] exists per engine run. It records whether a break, a stop
//! or a cancellation has been requested, and holds the lowest index at which a
//! break was requested. All fields are atomics; the lowest break index is a
//! monotonic-minimum register updated with `fetch_min`, so concurrent break
//! requests reduce to the smallest index regardless of arrival order.

use crate::cancel::CancellationToken;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::info;

// Starting value of the register. Every index compares at or below it, and it
// is only reported once `break_requested` is set, so a break at `i64::MAX`
// itself still counts as a break.
const NO_BREAK: i64 = i64::MAX;

/// Break / stop / cancellation status shared by every worker of one run
#[derive(Debug)]
pub struct LoopState {
    lowest_break: AtomicI64,
    break_requested: AtomicBool,
    stop_requested: AtomicBool,
    failed: AtomicBool,
    cancellation: CancellationToken,
}

impl LoopState {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            lowest_break: AtomicI64::new(NO_BREAK),
            break_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            cancellation,
        }
    }

    /// Record a break at `index`; the lowest requested index wins
    pub fn request_break(&self, index: i64) {
        let previous = self.lowest_break.fetch_min(index, Ordering::SeqCst);
        // Set after the index so a reader that sees the flag also sees an index.
        self.break_requested.store(true, Ordering::SeqCst);
        if index < previous {
            info!("Break requested at index {}", index);
        }
    }

    /// Request that no new item starts, regardless of index
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("Stop requested");
        }
    }

    /// Record that an item failed; like a stop, but kept apart from a
    /// stop requested by the body so the final status stays accurate
    pub fn halt_on_failure(&self) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            info!("Item failure observed, no new items will start");
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_break_requested(&self) -> bool {
        self.break_requested.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Lowest index at which a break has been requested so far
    pub fn lowest_break_index(&self) -> Option<i64> {
        // The flag is stored after `fetch_min`, so the register already holds the index.
        self.is_break_requested()
            .then(|| self.lowest_break.load(Ordering::SeqCst))
    }

    /// True when nothing at all may start any more (stop, failure or cancellation)
    pub fn should_halt(&self) -> bool {
        self.is_stop_requested() || self.has_failed() || self.is_cancelled()
    }

    /// Whether a worker may start the item at `index` right now
    ///
    /// Items at or below the lowest break index may still run; anything above
    /// it, or anything at all after a stop or cancellation, may not.
    pub fn may_start(&self, index: i64) -> bool {
        !self.should_halt() && index <= self.lowest_break.load(Ordering::SeqCst)
    }

    /// Handle given to the body for the item at `index`
    pub fn handle(&self, index: i64) -> LoopHandle<'_> {
        LoopHandle { state: self, index }
    }
}

/// Per-item view of the loop state passed to every body invocation
#[derive(Debug, Clone, Copy)]
pub struct LoopHandle<'a> {
    state: &'a LoopState,
    index: i64,
}

impl<'a> LoopHandle<'a> {
    /// Index of the item being processed
    pub fn index(&self) -> i64 {
        self.index
    }

    /// Request a break at the current item
    pub fn request_break(&self) {
        self.state.request_break(self.index);
    }

    /// Request a break at an explicit index
    pub fn request_break_at(&self, index: i64) {
        self.state.request_break(index);
    }

    /// Request that no further items start, regardless of index
    pub fn stop(&self) {
        self.state.request_stop();
    }

    /// True once a break at an index at or below this item's index has been
    /// requested, or the loop was stopped or cancelled
    pub fn should_skip(&self) -> bool {
        self.state.should_halt()
            || self
                .state
                .lowest_break_index()
                .is_some_and(|lowest| lowest <= self.index)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stop_requested()
    }

    pub fn lowest_break_index(&self) -> Option<i64> {
        self.state.lowest_break_index()
    }
}
