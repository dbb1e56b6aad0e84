//! Tandem Coordinator - library surface
//!
//! Exposed as a library so integration tests can spin the real server.

pub mod dashboard;
pub mod metrics;
pub mod registry;
pub mod server;
