// src/progress.rs

//! Transfer progress listeners and rate limiting
//!
//! Transports report every buffer they copy, but listeners only hear about
//! it through a [`ProgressReporter`], which forwards at most one update per
//! [`PROGRESS_INTERVAL`] plus a final update when the stream ends.
//!
//! Listener implementations:
//! - `SilentProgress`: no-op for scripted/quiet modes
//! - `LogProgress`: logs roughly every 10% to tracing
//! - `CallbackProgress`: forwards to a closure (the coordinator uses this)
//! - `CliProgress`: indicatif byte bar for the command line
//!
//! # Example
//!
//! ```ignore
//! use fdroid_net::progress::{LogProgress, ProgressReporter};
//!
//! let listener = LogProgress::new("index-v1.jar");
//! let mut reporter = ProgressReporter::new(&listener, "https://f-droid.org/repo/index-v1.jar");
//! reporter.report(4096, Some(1_000_000));
//! reporter.finish(1_000_000, Some(1_000_000));
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Minimum wall-clock spacing between two progress updates
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Receives byte counts for one transfer
///
/// Implementations must be thread-safe: updates arrive on whichever worker
/// thread runs the transfer.
pub trait ProgressListener: Send + Sync {
    /// `total_bytes` is `None` until the transport learns the size
    fn on_progress(&self, source: &str, bytes_read: u64, total_bytes: Option<u64>);
}

/// Decides whether an update is due
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// True for the first call and then once per interval
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

/// Throttled bridge between a transport and its listener
pub struct ProgressReporter<'a> {
    listener: &'a dyn ProgressListener,
    source: String,
    throttle: ProgressThrottle,
    last_reported: Option<u64>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(listener: &'a dyn ProgressListener, source: impl Into<String>) -> Self {
        Self {
            listener,
            source: source.into(),
            throttle: ProgressThrottle::default(),
            last_reported: None,
        }
    }

    /// Forward the counters if the interval has elapsed
    pub fn report(&mut self, bytes_read: u64, total_bytes: Option<u64>) {
        if self.throttle.ready(Instant::now()) {
            self.emit(bytes_read, total_bytes);
        }
    }

    /// Forward the final counters unless they were just reported
    pub fn finish(&mut self, bytes_read: u64, total_bytes: Option<u64>) {
        if self.last_reported != Some(bytes_read) {
            self.emit(bytes_read, total_bytes);
        }
    }

    fn emit(&mut self, bytes_read: u64, total_bytes: Option<u64>) {
        self.last_reported = Some(bytes_read);
        self.listener.on_progress(&self.source, bytes_read, total_bytes);
    }
}

/// Silent progress listener (no-op)
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressListener for SilentProgress {
    fn on_progress(&self, _source: &str, _bytes_read: u64, _total_bytes: Option<u64>) {}
}

/// Logging progress listener
///
/// Logs at info level each time another 10% of a known total arrives.
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    logged_decile: AtomicU64,
}

impl LogProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logged_decile: AtomicU64::new(0),
        }
    }
}

impl ProgressListener for LogProgress {
    fn on_progress(&self, _source: &str, bytes_read: u64, total_bytes: Option<u64>) {
        let Some(total) = total_bytes.filter(|t| *t > 0) else {
            return;
        };
        let decile = (bytes_read.min(total) * 10) / total;
        let previous = self.logged_decile.fetch_max(decile, Ordering::Relaxed);
        if decile > previous {
            info!("{}: {}% ({}/{})", self.name, decile * 10, bytes_read, total);
        }
    }
}

/// Callback-based progress listener
pub struct CallbackProgress<F>
where
    F: Fn(&str, u64, Option<u64>) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackProgress<F>
where
    F: Fn(&str, u64, Option<u64>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressListener for CallbackProgress<F>
where
    F: Fn(&str, u64, Option<u64>) + Send + Sync,
{
    fn on_progress(&self, source: &str, bytes_read: u64, total_bytes: Option<u64>) {
        (self.callback)(source, bytes_read, total_bytes);
    }
}

/// Visual byte-transfer bar using indicatif
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar.set_message(message.into());
        Self { bar }
    }

    pub fn finish_with_message(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }

    pub fn abandon_with_message(&self, message: impl Into<String>) {
        self.bar.abandon_with_message(message.into());
    }
}

impl ProgressListener for CliProgress {
    fn on_progress(&self, _source: &str, bytes_read: u64, total_bytes: Option<u64>) {
        if let Some(total) = total_bytes {
            self.bar.set_length(total);
        }
        self.bar.set_position(bytes_read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_throttle_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(50)));
        assert!(throttle.ready(start + Duration::from_millis(100)));
        assert!(!throttle.ready(start + Duration::from_millis(199)));
    }

    #[test]
    fn test_reporter_rate_limits_and_finishes() {
        let seen = Mutex::new(Vec::new());
        let listener = CallbackProgress::new(|_src: &str, read, total| {
            seen.lock().unwrap().push((read, total));
        });

        let mut reporter = ProgressReporter::new(&listener, "file:///tmp/a");
        for read in (0..=1000).step_by(10) {
            reporter.report(read, Some(1000));
        }
        reporter.finish(1000, Some(1000));

        let seen = seen.lock().unwrap();
        // A tight loop fits in one interval: first update plus the final one
        assert!(seen.len() <= 3);
        assert_eq!(seen.first(), Some(&(0, Some(1000))));
        assert_eq!(seen.last(), Some(&(1000, Some(1000))));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_finish_does_not_duplicate() {
        let count = AtomicU64::new(0);
        let listener = CallbackProgress::new(|_: &str, _, _| {
            count.fetch_add(1, Ordering::Relaxed);
        });

        let mut reporter = ProgressReporter::new(&listener, "x");
        reporter.report(0, None);
        reporter.finish(0, None);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_log_progress_ignores_unknown_total() {
        let listener = LogProgress::new("index");
        listener.on_progress("x", 100, None);
        listener.on_progress("x", 500, Some(1000));
        assert_eq!(listener.logged_decile.load(Ordering::Relaxed), 5);
    }
}
