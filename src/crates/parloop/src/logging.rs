//! Logging helpers built on `tracing`
//!
//! The library never installs a subscriber; hosts pick their own.

use std::time::{Duration, Instant};
use tracing::debug;

/// RAII guard logging entry and exit of a named scope
///
/// # Example
///
/// ```rust
/// use parloop::logging::LogGuard;
///
/// fn crunch() {
///     let _guard = LogGuard::new("crunch");
///     // exit (with elapsed time) is logged when the guard drops
/// }
/// ```
pub struct LogGuard {
    name: String,
    start: Instant,
}

impl LogGuard {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!("Entering: {}", name);

        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Time since the guard was created
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        debug!(
            "Exiting: {} (elapsed: {})",
            self.name,
            format_duration(self.start.elapsed())
        );
    }
}

/// Format a duration in human-readable form
///
/// ```rust
/// use parloop::logging::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
/// assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
/// assert_eq!(format_duration(Duration::from_micros(500)), "500μs");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros < 1000 {
        format!("{}μs", micros)
    } else if micros < 1_000_000 {
        format!("{}ms", micros / 1000)
    } else if micros < 60_000_000 {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    } else {
        let seconds = micros / 1_000_000;
        format!("{}m{}s", seconds / 60, seconds % 60)
    }
}
