//! Transfer progress accounting.
//!
//! Both transfers report `(transferred, total)` after every chunk. The
//! default observer turns that into log lines at 10% steps so a multi
//! gigabyte transfer does not flood the log.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Receives progress updates from a running transfer.
pub trait ProgressObserver: Send + Sync {
    /// Called after each chunk. `total` is 0 when the size is unknown.
    fn on_progress(&self, transferred: u64, total: u64);
}

/// Logs progress through `tracing` every 10 percent.
#[derive(Debug)]
pub struct LogProgress {
    label: &'static str,
    last_step: AtomicU64,
}

impl LogProgress {
    /// Creates an observer whose log lines are prefixed with `label`.
    #[must_use]
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            last_step: AtomicU64::new(0),
        }
    }
}

impl ProgressObserver for LogProgress {
    fn on_progress(&self, transferred: u64, total: u64) {
        if total == 0 {
            return;
        }
        let step = transferred.saturating_mul(10) / total;
        if step > self.last_step.fetch_max(step, Ordering::Relaxed) {
            info!(
                transferred,
                total,
                "{}: {}%",
                self.label,
                step.min(10) * 10
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every update, for assertions in transfer tests.
    #[derive(Default)]
    pub(crate) struct RecordingProgress {
        pub(crate) updates: Mutex<Vec<(u64, u64)>>,
    }

    impl ProgressObserver for RecordingProgress {
        fn on_progress(&self, transferred: u64, total: u64) {
            if let Ok(mut updates) = self.updates.lock() {
                updates.push((transferred, total));
            }
        }
    }

    #[test]
    fn test_steps_only_move_forward() {
        let progress = LogProgress::new("Downloading");
        progress.on_progress(50, 100);
        assert_eq!(progress.last_step.load(Ordering::Relaxed), 5);
        progress.on_progress(20, 100);
        assert_eq!(progress.last_step.load(Ordering::Relaxed), 5);
        progress.on_progress(100, 100);
        assert_eq!(progress.last_step.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_unknown_total_is_ignored() {
        let progress = LogProgress::new("Uploading");
        progress.on_progress(12_345, 0);
        assert_eq!(progress.last_step.load(Ordering::Relaxed), 0);
    }
}
