//! Engine configuration

use std::path::{Path, PathBuf};

/// Default maximum size of one queue file part (100 MB)
pub const DEFAULT_QUEUE_FILE_MAX_SIZE: u64 = 100_000_000;

/// Multiplexing engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path prefix of every cache file. Muxer `N` stores its queue file in
    /// `<prefix>.queue.N` and its memory snapshot in `<prefix>.memory.N`.
    pub cache_prefix: PathBuf,

    /// Maximum number of events a muxer keeps in memory (0 = unbounded)
    pub event_queue_max_size: usize,

    /// Maximum size of one queue file part in bytes (0 = unlimited)
    pub queue_file_max_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_prefix: PathBuf::from("/var/lib/cbmux/broker"),
            event_queue_max_size: 0,
            queue_file_max_size: DEFAULT_QUEUE_FILE_MAX_SIZE,
        }
    }
}

impl EngineConfig {
    /// Create a config storing its cache files under `cache_prefix`
    pub fn with_cache_prefix(cache_prefix: impl Into<PathBuf>) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            ..Default::default()
        }
    }

    /// Set the in-memory queue limit of every muxer
    pub fn event_queue_max_size(mut self, max: usize) -> Self {
        self.event_queue_max_size = max;
        self
    }

    /// Set the maximum size of one queue file part
    pub fn queue_file_max_size(mut self, max: u64) -> Self {
        self.queue_file_max_size = max;
        self
    }

    /// Effective in-memory queue limit
    pub fn max_queue_size(&self) -> usize {
        if self.event_queue_max_size == 0 {
            usize::MAX
        } else {
            self.event_queue_max_size
        }
    }

    /// Queue file of muxer `name`
    pub fn queue_file_path(&self, name: &str) -> PathBuf {
        suffixed(&self.cache_prefix, &format!(".queue.{}", name))
    }

    /// Memory snapshot file of muxer `name`
    pub fn memory_file_path(&self, name: &str) -> PathBuf {
        suffixed(&self.cache_prefix, &format!(".memory.{}", name))
    }

    /// File receiving events published while the engine is stopped
    pub fn unprocessed_file_path(&self) -> PathBuf {
        suffixed(&self.cache_prefix, ".unprocessed")
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.event_queue_max_size, 0);
        assert_eq!(config.max_queue_size(), usize::MAX);
        assert_eq!(config.queue_file_max_size, DEFAULT_QUEUE_FILE_MAX_SIZE);
    }

    #[test]
    fn test_file_paths() {
        let config = EngineConfig::with_cache_prefix("/var/lib/broker/central");
        assert_eq!(
            config.queue_file_path("sql"),
            PathBuf::from("/var/lib/broker/central.queue.sql")
        );
        assert_eq!(
            config.memory_file_path("sql"),
            PathBuf::from("/var/lib/broker/central.memory.sql")
        );
        assert_eq!(
            config.unprocessed_file_path(),
            PathBuf::from("/var/lib/broker/central.unprocessed")
        );
    }

    #[test]
    fn test_builder_chaining() {
        let config = EngineConfig::with_cache_prefix("/tmp/x")
            .event_queue_max_size(500)
            .queue_file_max_size(20_000);
        assert_eq!(config.max_queue_size(), 500);
        assert_eq!(config.queue_file_max_size, 20_000);
    }
}
