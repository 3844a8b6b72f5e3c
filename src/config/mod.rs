//! Broker configuration
//!
//! Loaded by the embedding application (JSON through `serde_json`, or any
//! other serde format) and turned into running components by the
//! [`Applier`].
//!
//! # Example
//!
//! ```json
//! {
//!   "cache_prefix": "/var/lib/cbmux/central",
//!   "event_queue_max_size": 100000,
//!   "endpoints": [
//!     { "name": "sql", "failovers": ["sql-retention"], "write_filters": ["3:*"] },
//!     { "name": "sql-retention", "cache_enabled": true }
//!   ]
//! }
//! ```

pub mod applier;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::multiplexing::config::DEFAULT_QUEUE_FILE_MAX_SIZE;
use crate::multiplexing::{EngineConfig, MuxerFilter};

pub use applier::{Applier, EndpointFactory};

/// Whole broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Path prefix of the cache files
    pub cache_prefix: PathBuf,

    /// Maximum events per muxer kept in memory
    /// Default: 0 (unbounded)
    pub event_queue_max_size: usize,

    /// Maximum size of one queue file part in bytes
    /// Default: 100 MB
    pub queue_file_max_size: u64,

    /// Configured endpoints, inputs and outputs
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            cache_prefix: engine.cache_prefix,
            event_queue_max_size: engine.event_queue_max_size,
            queue_file_max_size: DEFAULT_QUEUE_FILE_MAX_SIZE,
            endpoints: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BrokerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::with_cache_prefix(self.cache_prefix.clone())
            .event_queue_max_size(self.event_queue_max_size)
            .queue_file_max_size(self.queue_file_max_size)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Names of the endpoints only instantiated as failovers or secondaries
    pub fn failover_names(&self) -> HashSet<&str> {
        self.endpoints
            .iter()
            .flat_map(|e| e.failovers.iter().map(String::as_str))
            .collect()
    }

    /// Check names, references and filters
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(Error::Config("endpoint with an empty name".into()));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(Error::Config(format!(
                    "endpoint '{}' defined twice",
                    endpoint.name
                )));
            }
        }
        for endpoint in &self.endpoints {
            for failover in &endpoint.failovers {
                if !names.contains(failover.as_str()) {
                    return Err(Error::UnknownEndpoint(failover.clone()));
                }
                if failover == &endpoint.name {
                    return Err(Error::Config(format!(
                        "endpoint '{}' is its own failover",
                        endpoint.name
                    )));
                }
            }
            endpoint.read_filter()?;
            endpoint.write_filter()?;
        }
        Ok(())
    }
}

/// One input or output endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Unique name, also the name of the endpoint's muxer
    pub name: String,

    /// Failover chain: the first entry runs while this endpoint is down, the
    /// others are mirrors of that failover
    pub failovers: Vec<String>,

    /// Types this endpoint may publish to the engine
    /// Default: all
    pub read_filters: Vec<String>,

    /// Types this endpoint receives from the engine
    /// Default: all
    pub write_filters: Vec<String>,

    /// Seconds between reconnection attempts
    /// Default: 15
    pub retry_interval: u64,

    /// Seconds to wait after connecting before sending events
    /// Default: 0
    pub buffering_timeout: u64,

    /// Keep the muxer's in-memory queue across restarts
    /// Default: false
    pub cache_enabled: bool,

    /// Backend specific parameters, interpreted by the endpoint factory
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failovers: Vec::new(),
            read_filters: Vec::new(),
            write_filters: Vec::new(),
            retry_interval: 15,
            buffering_timeout: 0,
            cache_enabled: false,
            params: serde_json::Map::new(),
        }
    }
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn read_filter(&self) -> Result<MuxerFilter> {
        MuxerFilter::parse(&self.read_filters)
    }

    pub fn write_filter(&self) -> Result<MuxerFilter> {
        MuxerFilter::parse(&self.write_filters)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    pub fn buffering_timeout(&self) -> Duration {
        Duration::from_secs(self.buffering_timeout)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn test_defaults() {
        let config = assert_ok!(BrokerConfig::from_json(r#"{"endpoints": [{"name": "rrd"}]}"#));
        let rrd = config.endpoint("rrd").unwrap();
        assert_eq!(rrd.retry_interval(), Duration::from_secs(15));
        assert_eq!(rrd.buffering_timeout(), Duration::ZERO);
        assert!(!rrd.cache_enabled);
        assert!(rrd.write_filter().unwrap().is_all());
        assert_eq!(config.queue_file_max_size, DEFAULT_QUEUE_FILE_MAX_SIZE);
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "cache_prefix": "/tmp/cbmux/central",
            "event_queue_max_size": 500,
            "endpoints": [
                {
                    "name": "sql",
                    "failovers": ["sql-retention", "sql-mirror"],
                    "write_filters": ["3:*", "0x1000e"],
                    "retry_interval": 5,
                    "buffering_timeout": 2,
                    "params": {"host": "db"}
                },
                {"name": "sql-retention", "cache_enabled": true},
                {"name": "sql-mirror"}
            ]
        }"#;
        let config = assert_ok!(BrokerConfig::from_json(json));

        let engine = config.engine_config();
        assert_eq!(engine.max_queue_size(), 500);
        assert_eq!(engine.queue_file_path("sql"), PathBuf::from("/tmp/cbmux/central.queue.sql"));

        let sql = config.endpoint("sql").unwrap();
        assert!(sql.write_filter().unwrap().allows(0x30001));
        assert!(sql.write_filter().unwrap().allows(0x1000e));
        assert!(!sql.write_filter().unwrap().allows(0x1000f));
        assert_eq!(sql.params["host"], "db");

        let failovers = config.failover_names();
        assert!(failovers.contains("sql-retention"));
        assert!(failovers.contains("sql-mirror"));
        assert!(!failovers.contains("sql"));
    }

    #[test]
    fn test_validation_errors() {
        let unknown = r#"{"endpoints": [{"name": "a", "failovers": ["b"]}]}"#;
        assert!(matches!(
            BrokerConfig::from_json(unknown),
            Err(Error::UnknownEndpoint(name)) if name == "b"
        ));

        let twice = r#"{"endpoints": [{"name": "a"}, {"name": "a"}]}"#;
        assert!(matches!(assert_err!(BrokerConfig::from_json(twice)), Error::Config(_)));

        let bad_filter = r#"{"endpoints": [{"name": "a", "read_filters": ["neb"]}]}"#;
        assert!(matches!(
            BrokerConfig::from_json(bad_filter),
            Err(Error::InvalidFilter(_))
        ));

        assert!(matches!(BrokerConfig::from_json("{"), Err(Error::Config(_))));
    }
}
