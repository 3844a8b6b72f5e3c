//! Deadlines for blocking reads

use std::time::{Duration, Instant};

/// How long a read may wait for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Return at once if nothing is ready
    Immediate,
    /// Wait until data arrives or the reader is woken up
    Never,
    /// Wait until the given instant
    At(Instant),
}

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Deadline::At(Instant::now() + timeout)
    }

    /// Whether the deadline has already passed
    ///
    /// `Immediate` is always expired, `Never` never is.
    pub fn is_expired(&self) -> bool {
        match self {
            Deadline::Immediate => true,
            Deadline::Never => false,
            Deadline::At(at) => Instant::now() >= *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(Deadline::Immediate.is_expired());
        assert!(!Deadline::Never.is_expired());
    }

    #[test]
    fn test_after() {
        assert!(!Deadline::after(Duration::from_secs(60)).is_expired());
        assert!(Deadline::At(Instant::now() - Duration::from_millis(1)).is_expired());
    }
}
