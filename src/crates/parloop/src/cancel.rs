//! Cooperative cancellation
//!
//! A [`CancellationSource`] owns a one-shot, monotonic signal; the
//! [`CancellationToken`]s it hands out observe it. Workers poll the token
//! before starting each new unit of work. Nothing is ever force-terminated.
//!
//! Timeouts are just timers that fire the same signal
//! (see [`CancellationSource::cancel_after`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Default)]
struct Signal {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Owner of a cancellation signal
#[derive(Clone, Default)]
pub struct CancellationSource {
    signal: Arc<Signal>,
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationSource {
    /// Create a new, unfired cancellation source
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observing this source
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            signal: Some(Arc::clone(&self.signal)),
        }
    }

    /// Fire the signal. Firing more than once has no further effect.
    pub fn cancel(&self) {
        if !self.signal.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancellation requested");
            self.signal.notify.notify_waiters();
        }
    }

    /// Check whether the signal has fired
    pub fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::SeqCst)
    }

    /// Fire the signal once `delay` has elapsed
    ///
    /// Spawns a timer on the current tokio runtime; must be called from within
    /// a runtime context. The returned handle may be aborted to disarm the timer.
    pub fn cancel_after(&self, delay: Duration) -> tokio::task::JoinHandle<()> {
        let source = self.clone();
        debug!("Cancellation timer armed for {:?}", delay);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Cancellation timer elapsed after {:?}", delay);
            source.cancel();
        })
    }
}

/// Read-only view of a cancellation signal
///
/// `CancellationToken::none()` (also the `Default`) never fires.
#[derive(Clone, Default)]
pub struct CancellationToken {
    signal: Option<Arc<Signal>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("can_be_cancelled", &self.can_be_cancelled())
            .finish()
    }
}

impl CancellationToken {
    /// A token that is never cancelled
    pub fn none() -> Self {
        Self { signal: None }
    }

    /// Check whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.signal
            .as_ref()
            .map(|s| s.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Whether this token is attached to a source at all
    pub fn can_be_cancelled(&self) -> bool {
        self.signal.is_some()
    }

    /// Wait until cancellation is requested
    ///
    /// Never resolves for a token without a source.
    pub async fn cancelled(&self) {
        let Some(signal) = self.signal.as_ref() else {
            return std::future::pending().await;
        };

        let notified = signal.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel() is not missed.
        notified.as_mut().enable();

        if signal.cancelled.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}
