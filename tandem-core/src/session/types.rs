//! Public session types and the event callback interface

use thiserror::Error;

use crate::player::PlayerError;
use crate::protocol::{Participant, PlaybackSnapshot, Song};

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to a coordinator")]
    NotConnected,

    #[error("not in a room")]
    NotInRoom,

    #[error("already in a room")]
    AlreadyInRoom,

    #[error("not the master")]
    NotMaster,

    #[error("player error: {0}")]
    Player(#[from] PlayerError),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Snapshot of the room as this client sees it
#[derive(Debug, Clone)]
pub struct RoomView {
    pub room_id: String,
    /// Our own coordinator-assigned connection id
    pub connection_id: String,
    pub master_id: Option<String>,
    pub master_epoch: u64,
    pub users: Vec<Participant>,
    pub queue: Vec<Song>,
    pub history: Vec<Song>,
    pub playback: PlaybackSnapshot,
    pub is_master: bool,
}

/// Reconciliation diagnostics, reported after each processed snapshot
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Signed drift in milliseconds (positive = ahead of the master)
    pub drift_ms: i64,
    /// Current clock offset estimate
    pub offset_ms: i64,
    /// Current round-trip estimate to the coordinator
    pub rtt_ms: u64,
    /// Whether this snapshot triggered a corrective seek
    pub corrected: bool,
}

/// Callback interface for session events
pub trait SessionEvents: Send + Sync {
    /// The coordinator assigned us a connection id
    fn on_connected(&self, connection_id: String);
    fn on_room_state_changed(&self, state: RoomView);
    fn on_master_changed(&self, master_id: Option<String>, master_epoch: u64);
    fn on_users_changed(&self, users: Vec<Participant>);
    fn on_playback_changed(&self, playback: PlaybackSnapshot);
    /// Grace period expired without the master returning
    fn on_master_paused(&self);
    /// Called after each processed snapshot (followers only)
    fn on_sync_status(&self, status: SyncStatus);
    fn on_error(&self, message: String);
    fn on_disconnected(&self);
}
