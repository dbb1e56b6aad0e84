//! Types for player API responses

use serde::{Deserialize, Serialize};

use crate::protocol::Song;

/// Response wrapper for most player API endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    #[allow(dead_code)]
    pub status: String,
    #[serde(flatten)]
    pub data: T,
}

/// Artwork information for a track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artwork {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    pub url: String,
}

impl Artwork {
    /// Resolve the templated artwork URL to a concrete size
    pub fn url_at(&self, size: u32) -> String {
        self.url
            .replace("{w}", &size.to_string())
            .replace("{h}", &size.to_string())
    }
}

/// Play parameters identifying a track to the player
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayParams {
    pub id: String,
    #[serde(default)]
    pub kind: Option<String>,
    /// Stable catalog id; library ids are user-specific
    #[serde(default)]
    pub catalog_id: Option<String>,
}

/// Currently playing track information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    #[serde(default)]
    pub play_params: Option<PlayParams>,

    pub name: String,

    pub artist_name: String,

    #[serde(default)]
    pub album_name: String,

    #[serde(default)]
    pub artwork: Option<Artwork>,

    /// Total duration in milliseconds
    #[serde(default)]
    pub duration_in_millis: u64,

    /// Current playback position in seconds
    #[serde(default)]
    pub current_playback_time: f64,
}

impl NowPlaying {
    /// Player-local id of the song, when known
    pub fn song_id(&self) -> Option<&str> {
        self.play_params.as_ref().map(|p| p.id.as_str())
    }

    pub fn to_song(&self) -> Song {
        Song {
            id: self.song_id().unwrap_or("").to_string(),
            catalog_id: self
                .play_params
                .as_ref()
                .and_then(|p| p.catalog_id.clone()),
            name: self.name.clone(),
            artist_name: self.artist_name.clone(),
            album_name: self.album_name.clone(),
            duration_ms: self.duration_in_millis,
            artwork_url: self.artwork.as_ref().map(|a| a.url_at(600)),
        }
    }
}

/// One entry of the player queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub play_params: Option<PlayParams>,
    pub name: String,
    #[serde(default)]
    pub artist_name: String,
    #[serde(default)]
    pub album_name: String,
    #[serde(default)]
    pub artwork: Option<Artwork>,
    #[serde(default)]
    pub duration_in_millis: u64,
}

impl QueueItem {
    pub fn to_song(&self) -> Song {
        let id = self
            .play_params
            .as_ref()
            .map(|p| p.id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.id.clone());
        Song {
            id,
            catalog_id: self
                .play_params
                .as_ref()
                .and_then(|p| p.catalog_id.clone()),
            name: self.name.clone(),
            artist_name: self.artist_name.clone(),
            album_name: self.album_name.clone(),
            duration_ms: self.duration_in_millis,
            artwork_url: self.artwork.as_ref().map(|a| a.url_at(600)),
        }
    }
}

/// Response for is-playing endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsPlayingResponse {
    pub is_playing: bool,
}

/// Response for now-playing endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct NowPlayingResponse {
    pub info: NowPlaying,
}

/// Response for the queue endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub items: Vec<QueueItem>,
}

/// Request body for play-item / play-next / play-later endpoints
#[derive(Debug, Clone, Serialize)]
pub struct PlayItemRequest {
    #[serde(rename = "type")]
    pub item_type: String,
    pub id: String,
}

/// Request body for seek endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SeekRequest {
    pub position: f64,
}

/// Request body for queue/remove-by-index (1-based)
#[derive(Debug, Clone, Serialize)]
pub struct RemoveByIndexRequest {
    pub index: usize,
}

/// Request body for queue/move-to-position (1-based)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToPositionRequest {
    pub from_index: usize,
    pub to_index: usize,
}
