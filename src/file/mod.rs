//! On-disk storage of events
//!
//! - [`codec`]: record framing of a single event
//! - [`splitter`]: a byte log split into size-bounded parts
//! - [`persistent`]: the event FIFO built on both

pub mod codec;
pub mod persistent;
pub mod splitter;

pub use persistent::PersistentFile;
pub use splitter::Splitter;
