//! Event and transport contracts
//!
//! Everything the multiplexing core exchanges with the outside world goes
//! through the types of this module: [`Event`] is the unit of data,
//! [`Stream`] is what a transport adapter implements and [`Endpoint`] is the
//! factory that opens streams.

pub mod deadline;
pub mod event;
pub mod stream;

pub use deadline::Deadline;
pub use event::{Event, EventType};
pub use stream::{Endpoint, ReadOutcome, Stream, StreamError};
