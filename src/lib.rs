//! Monitoring event broker core
//!
//! `cbmux` routes monitoring events (metrics, statuses, logs, configuration)
//! from producers to consumers with at-least-once delivery, bounded memory and
//! disk overflow.
//!
//! # Architecture
//!
//! ```text
//!                           Arc<Engine>
//!                   ┌──────────────────────────┐
//!                   │ subscribers: [Weak<Muxer>]│
//!                   │ pending: VecDeque<Event> │
//!                   └────────────┬─────────────┘
//!                                │ publish()
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//!      [Muxer]                [Muxer]                [Muxer]
//!   queue + queue file     queue + queue file     queue + queue file
//!         │                      │                      │
//!      [Feeder]              [Failover]             [Failover]
//!   tokio timer tasks    dedicated thread       nested failover
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!    dyn Stream             dyn Stream            dyn Stream
//! ```
//!
//! Events are cheap to clone: the payload is a `bytes::Bytes`, so every muxer
//! that accepted an event shares the same allocation.

pub mod config;
pub mod error;
pub mod file;
pub mod io;
pub mod misc;
pub mod multiplexing;
pub mod processing;
pub mod stats;

pub use config::{BrokerConfig, EndpointConfig};
pub use error::{Error, Result};
pub use io::{Deadline, Endpoint, Event, EventType, ReadOutcome, Stream, StreamError};
pub use multiplexing::{Engine, EngineConfig, Muxer, MuxerFilter};
pub use processing::{Acceptor, Failover, Feeder};
