//! Statistics exposed for external monitoring
//!
//! Components keep snapshots of these types and merge them into a generic
//! `serde_json` tree on request. Statistics are best effort: collecting them
//! never blocks an event pump for long.

pub mod metrics;

pub use metrics::{
    merge, unix_now, ConnectionState, EndpointStats, EngineStats, MuxerStats, QueueFileStats,
};
