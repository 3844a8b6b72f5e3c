//! Event processing
//!
//! Components moving events between muxers and external streams:
//!
//! - [`Feeder`]: one accepted client, pumped on the tokio runtime
//! - [`Failover`]: one output endpoint, supervised on a dedicated thread
//! - [`Acceptor`]: accept loop creating a feeder per client

pub mod acceptor;
pub mod failover;
pub mod feeder;

pub use acceptor::Acceptor;
pub use failover::{Failover, FailoverState};
pub use feeder::{Feeder, FeederState};
