//! Rate-limited error logging
//!
//! A peer or file that keeps producing corrupted records would flood the logs
//! with one line per bad chunk. [`RateLimitedLogger`] logs the first error,
//! then at most one summary per interval carrying the number of errors that
//! were suppressed in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default interval between two logged errors
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Logs at most once per interval, counting what it swallowed
pub struct RateLimitedLogger {
    min_interval: Duration,
    last_log_time: Mutex<Option<Instant>>,
    /// Errors since the last logged line
    error_count: AtomicU64,
    total_errors: AtomicU64,
}

impl RateLimitedLogger {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_log_time: Mutex::new(None),
            error_count: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Record an error about `subject` and log it if the interval elapsed
    ///
    /// Returns true if a line was emitted.
    pub fn error(&self, subject: &str, error: &dyn std::fmt::Display) -> bool {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let total = self.total_errors.fetch_add(1, Ordering::Relaxed) + 1;

        let should_log = {
            let mut last = self.last_log_time.lock();
            let now = Instant::now();
            match *last {
                Some(at) if now.duration_since(at) < self.min_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };

        if !should_log {
            return false;
        }

        let count = self.error_count.swap(0, Ordering::Relaxed);
        if count > 1 {
            tracing::error!(
                subject = %subject,
                error = %error,
                suppressed = count - 1,
                total_errors = total,
                "Repeated errors (rate-limited)"
            );
        } else {
            tracing::error!(
                subject = %subject,
                error = %error,
                total_errors = total,
                "Error"
            );
        }
        true
    }

    /// Errors recorded since the last emitted line
    pub fn pending_error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn total_error_count(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }
}

impl Default for RateLimitedLogger {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_logs() {
        let logger = RateLimitedLogger::default();
        assert!(logger.error("queue file", &"bad magic"));
        assert_eq!(logger.total_error_count(), 1);
        assert_eq!(logger.pending_error_count(), 0);
    }

    #[test]
    fn test_rapid_errors_suppressed() {
        let logger = RateLimitedLogger::new(Duration::from_secs(10));
        assert!(logger.error("peer", &"bad magic"));

        for _ in 0..5 {
            assert!(!logger.error("peer", &"bad magic"));
        }

        assert_eq!(logger.total_error_count(), 6);
        assert_eq!(logger.pending_error_count(), 5);
    }

    #[test]
    fn test_logs_again_after_interval() {
        let logger = RateLimitedLogger::new(Duration::from_millis(10));
        assert!(logger.error("peer", &"x"));
        assert!(!logger.error("peer", &"x"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(logger.error("peer", &"x"));
        assert_eq!(logger.pending_error_count(), 0);
    }
}
