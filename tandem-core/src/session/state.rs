//! Client-side room state

use crate::protocol::{Participant, PlaybackSnapshot, Song};

use super::types::RoomView;

/// What this client knows about the room it is in
#[derive(Debug, Clone)]
pub struct ClientRoomState {
    pub room_id: String,
    pub display_name: String,
    pub master_id: Option<String>,
    pub master_epoch: u64,
    pub users: Vec<Participant>,
    pub queue: Vec<Song>,
    pub history: Vec<Song>,
    pub playback: PlaybackSnapshot,
}

impl ClientRoomState {
    pub fn new(room_id: String, display_name: String) -> Self {
        Self {
            room_id,
            display_name,
            master_id: None,
            master_epoch: 0,
            users: Vec::new(),
            queue: Vec::new(),
            history: Vec::new(),
            playback: PlaybackSnapshot::default(),
        }
    }

    /// Whether the given connection currently holds the master role
    pub fn is_master(&self, connection_id: &str) -> bool {
        self.master_id.as_deref() == Some(connection_id)
    }

    pub fn view(&self, connection_id: &str) -> RoomView {
        RoomView {
            room_id: self.room_id.clone(),
            connection_id: connection_id.to_string(),
            master_id: self.master_id.clone(),
            master_epoch: self.master_epoch,
            users: self.users.clone(),
            queue: self.queue.clone(),
            history: self.history.clone(),
            playback: self.playback.clone(),
            is_master: self.is_master(connection_id),
        }
    }
}
