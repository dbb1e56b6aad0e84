//! Local media player control API
//!
//! HTTP client for the player instance running next to this process. The
//! coordinator never talks to a player; only the local client does.

mod client;
mod types;

pub use client::{PlayerClient, PlayerError, DEFAULT_PORT};
pub use types::{Artwork, NowPlaying, PlayParams, QueueItem};
