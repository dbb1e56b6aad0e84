//! Player HTTP API client

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::*;
use crate::protocol::Song;

/// Default player API port
pub const DEFAULT_PORT: u16 = 10767;

/// Default connection timeout (short since it's localhost)
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Default request timeout (short since it's localhost)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur when communicating with the player
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("player is not running or not reachable")]
    NotReachable,

    #[error("invalid API token")]
    Unauthorized,

    #[error("API error: {0}")]
    Api(String),
}

/// Client for the local player's REST API
#[derive(Debug, Clone)]
pub struct PlayerClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl PlayerClient {
    /// Create a client against the default local port
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    /// Create a client against a custom port
    pub fn with_port(port: u16) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            // Limit connection pool to avoid stale connections
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            // Use 127.0.0.1 explicitly to avoid IPv6 issues
            base_url: format!("http://127.0.0.1:{}", port),
            api_token: None,
        }
    }

    /// Set the API token for authentication
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Build a request with optional authentication
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v1/playback{}", self.base_url, path);
        let mut req = self.http.request(method, &url);

        if let Some(token) = &self.api_token {
            req = req.header("apitoken", token);
        }

        req
    }

    /// Check if the player is active and reachable
    pub async fn is_active(&self) -> Result<(), PlayerError> {
        debug!("Checking player connection");

        let resp = self
            .request(reqwest::Method::GET, "/active")
            .send()
            .await
            .map_err(|e| {
                warn!("Connection error: {:?}", e);
                if e.is_connect() || e.is_timeout() {
                    PlayerError::NotReachable
                } else {
                    PlayerError::Api(format!("Network error ({})", e))
                }
            })?;

        match resp.status().as_u16() {
            200 | 204 => Ok(()),
            401 | 403 => Err(PlayerError::Unauthorized),
            s => Err(PlayerError::Api(format!("Unexpected response (HTTP {})", s))),
        }
    }

    /// Check if music is currently playing
    pub async fn is_playing(&self) -> Result<bool, PlayerError> {
        let resp: ApiResponse<IsPlayingResponse> = self
            .request(reqwest::Method::GET, "/is-playing")
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.data.is_playing)
    }

    /// Get the currently playing track (None if nothing is playing)
    pub async fn now_playing(&self) -> Result<Option<NowPlaying>, PlayerError> {
        let resp = self
            .request(reqwest::Method::GET, "/now-playing")
            .send()
            .await?;

        if resp.status() == 404 || resp.status() == 204 {
            return Ok(None);
        }

        // An unparsable body means nothing is playing
        match resp.json::<ApiResponse<NowPlayingResponse>>().await {
            Ok(data) => Ok(Some(data.data.info)),
            Err(_) => Ok(None),
        }
    }

    /// Get the full play queue in play order
    pub async fn queue(&self) -> Result<Vec<Song>, PlayerError> {
        let resp = self.request(reqwest::Method::GET, "/queue").send().await?;

        if resp.status() == 404 || resp.status() == 204 {
            return Ok(Vec::new());
        }

        // The queue endpoint answers either a bare array or {items: [...]}
        let body = resp.text().await?;
        let items: Vec<QueueItem> = match serde_json::from_str::<Vec<QueueItem>>(&body) {
            Ok(items) => items,
            Err(_) => serde_json::from_str::<QueueResponse>(&body)
                .map(|r| r.items)
                .unwrap_or_default(),
        };

        Ok(items.iter().map(QueueItem::to_song).collect())
    }

    /// Resume playback
    pub async fn play(&self) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/play")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Pause playback
    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/pause")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Skip to next track
    pub async fn next(&self) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/next")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Go to previous track
    pub async fn previous(&self) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/previous")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Seek to a position in the current track, in seconds
    pub async fn seek(&self, position_secs: f64) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/seek")
            .json(&SeekRequest {
                position: position_secs,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Seek to a position in milliseconds
    pub async fn seek_ms(&self, position_ms: u64) -> Result<(), PlayerError> {
        self.seek(position_ms as f64 / 1000.0).await
    }

    /// Start playing a track by id, replacing the current one
    pub async fn play_song(&self, id: &str) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/play-item")
            .json(&PlayItemRequest {
                item_type: "songs".to_string(),
                id: id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Insert a track right after the current one
    pub async fn insert_next(&self, id: &str) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/play-next")
            .json(&PlayItemRequest {
                item_type: "songs".to_string(),
                id: id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Append a track to the end of the queue
    pub async fn enqueue(&self, id: &str) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/play-later")
            .json(&PlayItemRequest {
                item_type: "songs".to_string(),
                id: id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Remove the queue entry at `index` (0-based; the player API is 1-based,
    /// translated here)
    pub async fn remove_at(&self, index: usize) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/queue/remove-by-index")
            .json(&RemoveByIndexRequest { index: index + 1 })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Move a queue entry (0-based; translated to the player's 1-based API)
    pub async fn move_index(&self, from: usize, to: usize) -> Result<(), PlayerError> {
        self.request(reqwest::Method::POST, "/queue/move-to-position")
            .json(&MoveToPositionRequest {
                from_index: from + 1,
                to_index: to + 1,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for PlayerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_creation() {
        let client = PlayerClient::new();
        assert_eq!(client.base_url, "http://127.0.0.1:10767");

        let client_with_token = PlayerClient::new().with_token("test-token");
        assert_eq!(client_with_token.api_token, Some("test-token".to_string()));
    }

    #[test]
    fn index_requests_are_one_based() {
        let remove = serde_json::to_value(RemoveByIndexRequest { index: 3 }).unwrap();
        assert_eq!(remove["index"], 3);

        let mv = serde_json::to_value(MoveToPositionRequest {
            from_index: 1,
            to_index: 5,
        })
        .unwrap();
        assert_eq!(mv["fromIndex"], 1);
        assert_eq!(mv["toIndex"], 5);
    }
}
