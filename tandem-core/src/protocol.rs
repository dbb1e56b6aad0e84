//! Wire protocol shared between clients and the coordinator
//!
//! Messages travel as JSON text frames over the WebSocket. Every message
//! carries a snake_case `type` tag; payload fields are camelCase.

use serde::{Deserialize, Serialize};

/// A song as carried in queues, history and playback snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    /// Player-local identifier (library ids are user-specific)
    pub id: String,
    /// Stable cross-user catalog identifier, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    /// Song name
    pub name: String,
    /// Artist name
    pub artist_name: String,
    /// Album name
    pub album_name: String,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Artwork URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
}

impl Song {
    /// Identity used when comparing songs across clients.
    ///
    /// Prefers the catalog id (shared between users), falling back to the
    /// player-local id and finally the name.
    pub fn identity(&self) -> &str {
        if let Some(catalog_id) = &self.catalog_id {
            return catalog_id;
        }
        if !self.id.is_empty() {
            return &self.id;
        }
        &self.name
    }
}

/// Participant in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Unique per live connection, assigned by the coordinator
    pub connection_id: String,
    /// Display name chosen by the user
    pub display_name: String,
}

/// Who produced a playback snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Master,
    Follower,
}

/// Authoritative playback state for a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    /// Whether music is playing
    pub is_playing: bool,
    /// Currently playing song
    #[serde(default)]
    pub current_song: Option<Song>,
    /// Position in seconds, authoritative at `last_update_server_time`
    pub position: f64,
    /// Who produced this snapshot
    pub source: SnapshotSource,
    /// Per-epoch sequence number, stamped by the coordinator on relay
    #[serde(default)]
    pub sequence: u64,
    /// Client-local time (ms) of the most recent manual seek. An identity
    /// token for seek detection, never compared against other clocks.
    #[serde(default)]
    pub last_seek_timestamp: u64,
    /// Coordinator-observed wall time (epoch ms) at broadcast
    #[serde(default)]
    pub last_update_server_time: u64,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_song: None,
            position: 0.0,
            source: SnapshotSource::Master,
            sequence: 0,
            last_seek_timestamp: 0,
            last_update_server_time: 0,
        }
    }
}

/// Queue, history and playback as published by the master each cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedState {
    #[serde(default)]
    pub queue: Vec<Song>,
    #[serde(default)]
    pub history: Vec<Song>,
    pub playback: PlaybackSnapshot,
}

/// Control requests relayed from followers to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum RemoteAction {
    Play,
    Pause,
    Next,
    Previous,
    Seek { position: f64 },
    Add { song: Song },
    PlayNext { song: Song },
    Remove { index: usize },
    Move { from_index: usize, to_index: usize },
    PlaySong { song: Song },
}

/// Messages sent from clients to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a room; re-joining replaces any prior entry for this connection
    JoinRoom {
        room_id: String,
        display_name: String,
    },

    /// Reclaim a master role within its grace period
    RejoinRoom {
        room_id: String,
        display_name: String,
        previous_connection_id: String,
    },

    /// Hand the master role to another participant (master only)
    TransferMaster {
        room_id: String,
        target_connection_id: String,
    },

    /// Publish the authoritative room state (master only)
    MasterStateUpdate {
        room_id: String,
        /// Fences publishes in flight across an election when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<u64>,
        state: PublishedState,
    },

    /// Ask the master to perform a control action
    RemoteAction {
        room_id: String,
        #[serde(flatten)]
        action: RemoteAction,
    },

    LeaveRoom {
        room_id: String,
    },

    /// Clock probe; echoed back verbatim together with the server time
    TimeSyncRequest {
        client_time: u64,
        sample_index: u32,
    },

    /// Resulting clock estimate, stored for diagnostics only
    TimeSyncReport {
        offset: i64,
        rtt: u64,
    },
}

/// Messages sent from the coordinator to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Connection bootstrap: the coordinator-assigned connection id
    Welcome {
        connection_id: String,
        server_time: u64,
    },

    /// Full or relayed room state
    SyncState {
        queue: Vec<Song>,
        history: Vec<Song>,
        playback: PlaybackSnapshot,
        users: Vec<Participant>,
        #[serde(default)]
        master_id: Option<String>,
        master_epoch: u64,
        server_time: u64,
    },

    MasterUpdate {
        #[serde(default)]
        master_id: Option<String>,
        master_epoch: u64,
    },

    UsersUpdate {
        users: Vec<Participant>,
    },

    /// Sent only when a grace period expires with reassignment
    MasterPaused,

    TimeSyncResponse {
        client_time: u64,
        server_time: u64,
        sample_index: u32,
    },

    /// Forwarded control request, sent only to the current master
    RemoteActionRequest {
        #[serde(flatten)]
        action: RemoteAction,
        requester_id: String,
    },
}

/// Get current wall time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: &str) -> Song {
        Song {
            id: id.to_string(),
            catalog_id: None,
            name: format!("Song {}", id),
            artist_name: "Artist".to_string(),
            album_name: "Album".to_string(),
            duration_ms: 180_000,
            artwork_url: None,
        }
    }

    #[test]
    fn song_identity_prefers_catalog_id() {
        let mut s = song("lib-1");
        assert_eq!(s.identity(), "lib-1");

        s.catalog_id = Some("cat-9".to_string());
        assert_eq!(s.identity(), "cat-9");

        let nameless = Song {
            id: String::new(),
            catalog_id: None,
            name: "Fallback".to_string(),
            artist_name: String::new(),
            album_name: String::new(),
            duration_ms: 0,
            artwork_url: None,
        };
        assert_eq!(nameless.identity(), "Fallback");
    }

    #[test]
    fn client_message_wire_format() {
        let msg = ClientMessage::JoinRoom {
            room_id: "abc".to_string(),
            display_name: "Ada".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "join_room");
        assert_eq!(json["roomId"], "abc");
        assert_eq!(json["displayName"], "Ada");
    }

    #[test]
    fn remote_action_carries_action_and_payload() {
        let msg = ClientMessage::RemoteAction {
            room_id: "abc".to_string(),
            action: RemoteAction::Seek { position: 42.5 },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "remote_action");
        assert_eq!(json["action"], "seek");
        assert_eq!(json["payload"]["position"], 42.5);

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unit_action_has_no_payload() {
        let msg = ClientMessage::RemoteAction {
            room_id: "abc".to_string(),
            action: RemoteAction::Pause,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["action"], "pause");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn server_message_round_trip() {
        let msg = ServerMessage::SyncState {
            queue: vec![song("1"), song("2")],
            history: vec![],
            playback: PlaybackSnapshot {
                is_playing: true,
                current_song: Some(song("0")),
                position: 12.75,
                source: SnapshotSource::Master,
                sequence: 7,
                last_seek_timestamp: 1234,
                last_update_server_time: 5678,
            },
            users: vec![Participant {
                connection_id: "c1".to_string(),
                display_name: "Ada".to_string(),
            }],
            master_id: Some("c1".to_string()),
            master_epoch: 3,
            server_time: 999,
        };

        let text = serde_json::to_string(&msg).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "sync_state");
        assert_eq!(json["masterEpoch"], 3);
        assert_eq!(json["playback"]["sequence"], 7);
        assert_eq!(json["playback"]["source"], "master");

        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn master_paused_is_tag_only() {
        let text = serde_json::to_string(&ServerMessage::MasterPaused).unwrap();
        assert_eq!(text, r#"{"type":"master_paused"}"#);
    }

    #[test]
    fn forwarded_action_keeps_requester() {
        let msg = ServerMessage::RemoteActionRequest {
            action: RemoteAction::Move {
                from_index: 2,
                to_index: 0,
            },
            requester_id: "c9".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "remote_action_request");
        assert_eq!(json["action"], "move");
        assert_eq!(json["payload"]["fromIndex"], 2);
        assert_eq!(json["requesterId"], "c9");
    }
}
