//! Event multiplexing
//!
//! - [`Engine`]: broadcast hub every muxer subscribes to
//! - [`Muxer`]: per-subscriber queue with acknowledgements and disk overflow
//! - [`MuxerFilter`]: event type filters applied by muxers

pub mod config;
pub mod engine;
pub mod filter;
pub mod muxer;

pub use config::EngineConfig;
pub use engine::{Engine, EngineState};
pub use filter::MuxerFilter;
pub use muxer::{Muxer, ReadHandler};
