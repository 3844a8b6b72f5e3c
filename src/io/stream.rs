//! Stream and endpoint contracts
//!
//! Every transport or backend adapter (TLS peer, SQL writer, graphing backend,
//! compression layer, ...) plugs into the core by implementing [`Stream`].
//! Expected conditions such as a clean end of stream are variants of
//! [`StreamError`], so callers must handle them explicitly.

use serde_json::{Map, Value};

use super::deadline::Deadline;
use super::event::Event;
use crate::multiplexing::MuxerFilter;

/// Error type for stream operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream or file reached a clean end. Expected, not fatal.
    #[error("shutdown: no more data")]
    Shutdown,

    /// The peer terminated the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed serialized data was encountered
    #[error("corrupted data: {0}")]
    Corruption(String),

    /// Transient I/O failure (disk full, socket error)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure reported by an adapter
    #[error("{0}")]
    Failed(String),
}

impl StreamError {
    /// Create a generic failure from a message
    pub fn failed(msg: impl Into<String>) -> Self {
        StreamError::Failed(msg.into())
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, StreamError::Shutdown)
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, StreamError::ConnectionClosed)
    }
}

/// Outcome of a successful read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// An event was read
    Event(Event),
    /// The call completed without timing out but produced no event
    Empty,
    /// The deadline passed before an event became available
    TimedOut,
}

impl ReadOutcome {
    /// The event, if any
    pub fn into_event(self) -> Option<Event> {
        match self {
            ReadOutcome::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, ReadOutcome::TimedOut)
    }
}

/// Bidirectional event stream toward an external peer or backend
///
/// Counts returned by [`write`](Stream::write), [`flush`](Stream::flush) and
/// [`stop`](Stream::stop) are acknowledgements: the number of previously
/// written events the backend now confirms. Backends that confirm on write
/// return 1 from `write`.
pub trait Stream: Send {
    /// Read the next event without waiting past `deadline`
    ///
    /// Returns `Err(StreamError::Shutdown)` once the peer or backing
    /// resource is permanently gone.
    fn read(&mut self, deadline: Deadline) -> Result<ReadOutcome, StreamError>;

    /// Write one event, returning the number of events now acknowledged
    fn write(&mut self, event: &Event) -> Result<usize, StreamError>;

    /// Force buffered work out, returning the number of events acknowledged
    fn flush(&mut self) -> Result<usize, StreamError> {
        Ok(0)
    }

    /// Flush and mark the stream unusable, returning remaining acknowledgements
    fn stop(&mut self) -> Result<usize, StreamError> {
        self.flush()
    }

    /// Merge introspection data into `tree` (best effort)
    fn statistics(&self, _tree: &mut Map<String, Value>) {}

    /// Configuration update request
    fn update(&mut self) {}
}

/// Factory of streams toward one configured peer or backend
pub trait Endpoint: Send + Sync {
    /// Open a new stream
    ///
    /// `Ok(None)` means the peer could not be reached this time. For
    /// listening endpoints this returns the next accepted client.
    fn open(&self) -> Result<Option<Box<dyn Stream>>, StreamError>;

    /// Whether the endpoint can be opened right now, letting a failover skip
    /// the rest of its retry sleep
    fn is_ready(&self) -> bool {
        false
    }

    /// Whether this endpoint accepts incoming connections instead of
    /// connecting out
    fn is_acceptor(&self) -> bool {
        false
    }

    /// Event types the opened streams always need to receive
    fn stream_mandatory_filter(&self) -> MuxerFilter {
        MuxerFilter::none()
    }

    /// Event types the opened streams must never receive
    fn stream_forbidden_filter(&self) -> MuxerFilter {
        MuxerFilter::none()
    }
}
