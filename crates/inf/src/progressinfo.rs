use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Default interval between two progress log messages.
pub const DEFAULT_LOG_PERIOD: Duration = Duration::from_secs(5);

/// Progress reporting for long running operations.
/// Implementations are shared between threads, so all methods take `&self`.
pub trait ProgressNotification: Send + Sync {
    /// Restart the progress reporting with a new amount of expected ticks.
    fn reset(&self, total: u64);

    /// Advance the progress with one unit of work.
    /// Returns `Error::Cancelled` when the operation should be aborted.
    fn tick(&self) -> Result<()> {
        self.tick_n(1)
    }

    fn tick_n(&self, count: u64) -> Result<()>;
}

/// Progress implementation that ignores all updates.
#[derive(Clone, Copy, Default)]
pub struct DummyProgress;

impl ProgressNotification for DummyProgress {
    fn reset(&self, _total: u64) {}

    fn tick_n(&self, _count: u64) -> Result<()> {
        Ok(())
    }
}

/// Progress reporting through the log facade.
/// At most one message is emitted per configured period.
pub struct LogProgress {
    name: String,
    period: Duration,
    total: AtomicU64,
    current: AtomicU64,
    last_report: Mutex<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl LogProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_period(name, DEFAULT_LOG_PERIOD)
    }

    pub fn with_period(name: impl Into<String>, period: Duration) -> Self {
        LogProgress {
            name: name.into(),
            period,
            total: AtomicU64::new(0),
            current: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
            cancel: None,
        }
    }

    /// The operation is reported as cancelled once the flag becomes `true`.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn percentage(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }

        100.0 * self.current() as f64 / total as f64
    }
}

impl ProgressNotification for LogProgress {
    fn reset(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_report.lock() {
            *last = Instant::now();
        }
    }

    fn tick_n(&self, count: u64) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(Error::Cancelled);
        }

        self.current.fetch_add(count, Ordering::Relaxed);

        if let Ok(mut last) = self.last_report.try_lock() {
            if last.elapsed() >= self.period {
                log::info!("{} approx. {:.2}% complete", self.name, self.percentage());
                *last = Instant::now();
            }
        }

        Ok(())
    }
}

/// Invokes a callback when a certain amount of time has passed since the previous invocation.
pub struct TimedCallback {
    period: Duration,
    last: Instant,
}

impl TimedCallback {
    pub fn new(period: Duration) -> Self {
        TimedCallback {
            period,
            last: Instant::now(),
        }
    }

    pub fn invoke(&mut self, cb: impl FnOnce()) {
        if self.last.elapsed() > self.period {
            cb();
            self.last = Instant::now();
        }
    }
}

impl Default for TimedCallback {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn log_progress_percentage() {
        let progress = LogProgress::with_period("test", Duration::ZERO);
        progress.reset(4);
        assert!(progress.tick().is_ok());
        assert!(progress.tick_n(2).is_ok());
        assert_eq!(progress.current(), 3);
        assert_eq!(progress.percentage(), 75.0);
    }

    #[test]
    fn log_progress_cancel() {
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = LogProgress::new("test").with_cancel_flag(cancel.clone());
        progress.reset(10);
        assert!(progress.tick().is_ok());
        cancel.store(true, Ordering::Relaxed);
        assert!(matches!(progress.tick(), Err(Error::Cancelled)));
    }

    #[test]
    fn timed_callback() {
        let mut cb = TimedCallback::new(Duration::from_secs(3600));
        let mut invoked = false;
        cb.invoke(|| invoked = true);
        assert!(!invoked);

        let mut cb = TimedCallback::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        cb.invoke(|| invoked = true);
        assert!(invoked);
    }
}
