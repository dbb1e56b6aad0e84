//! Tandem - Core Library
//!
//! This library provides the client-side functionality for syncing music
//! playback across multiple player instances through a coordination server:
//! the wire protocol, clock synchronization, drift reconciliation, the local
//! player API client and the session orchestrator.

pub mod drift;
pub mod player;
pub mod protocol;
pub mod session;
pub mod timesync;

// Re-exports for convenience
pub use player::{PlayerClient, PlayerError};
pub use protocol::{ClientMessage, Participant, PlaybackSnapshot, ServerMessage, Song};
pub use session::{Session, SessionConfig, SessionError, SessionEvents};
pub use timesync::ClockEstimate;
