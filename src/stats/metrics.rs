//! Statistics snapshots for muxers, queue files, endpoints and the engine

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};

/// Queue file statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueFileStats {
    /// Base path of the file family
    pub file_path: String,
    /// Maximum size of one part
    pub max_file_size: u64,
    /// Part currently read
    pub read_file_id: u32,
    /// Offset inside the part currently read
    pub read_offset: u64,
    /// Part currently written
    pub write_file_id: u32,
    /// Bytes stored in all parts
    pub total_size: u64,
    /// Events appended since the file was opened
    pub events_written: u64,
    /// Events read back since the file was opened
    pub events_read: u64,
    /// Corrupted chunks skipped while reading
    pub corrupted_records: u64,
    /// Share of the stored bytes already read
    pub percent_processed: f64,
}

/// Muxer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MuxerStats {
    /// Muxer name
    pub name: String,
    /// Events held in memory
    pub total_events: usize,
    /// Events delivered but not acknowledged yet
    pub unacknowledged_events: usize,
    /// Queue file path, empty when no queue file is open
    pub queue_file: String,
    /// Unix time of the snapshot
    pub updated_at: u64,
}

/// Connection state of a feeder or failover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Feeder or failover statistics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    /// Endpoint name
    pub name: String,
    pub state: ConnectionState,
    /// What the component is currently doing, empty when idle
    pub status: String,
    /// Unix time of the last connection attempt
    pub last_connection_attempt: Option<u64>,
    /// Unix time of the last successful connection
    pub last_connection_success: Option<u64>,
    /// Events waiting in the muxer
    pub queued_events: usize,
    /// Message of the last error, empty if the last failure was a clean close
    pub last_error: String,
}

impl EndpointStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ConnectionState::Connecting,
            status: String::new(),
            last_connection_attempt: None,
            last_connection_success: None,
            queued_events: 0,
            last_error: String::new(),
        }
    }

    pub fn set_last_connection_attempt(&mut self) {
        self.last_connection_attempt = Some(unix_now());
    }

    pub fn set_last_connection_success(&mut self) {
        self.last_connection_success = Some(unix_now());
    }

    /// Merge into a statistics tree
    pub fn merge_into(&self, tree: &mut Map<String, Value>) {
        merge(self, tree);
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Engine state name
    pub mode: String,
    /// Events handed to muxers
    pub processed_events: u64,
    /// Events written to the unprocessed cache while stopped
    pub unprocessed_events: u64,
    /// Events waiting to be handed to muxers
    pub pending_events: usize,
    /// Subscribed muxers
    pub muxers: usize,
}

/// Serialize `value` and merge its fields into `tree`
pub fn merge<T: Serialize>(value: &T, tree: &mut Map<String, Value>) {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => tree.extend(fields),
        Ok(other) => tracing::warn!(value = %other, "Statistics are not an object"),
        Err(e) => tracing::warn!(error = %e, "Cannot serialize statistics"),
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
