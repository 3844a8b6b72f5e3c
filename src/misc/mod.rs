//! Small utilities shared by the core components

pub mod rate_limited_logger;

pub use rate_limited_logger::RateLimitedLogger;
