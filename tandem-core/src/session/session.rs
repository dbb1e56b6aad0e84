//! Session implementation

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::drift::DriftReconciler;
use crate::player::PlayerClient;
use crate::protocol::{current_time_ms, ClientMessage, RemoteAction, ServerMessage, Song};
use crate::timesync::{
    ClockEstimate, ClockSampler, CYCLE_TIMEOUT, PROBE_COUNT, PROBE_SPACING, RESYNC_INTERVAL,
};

use super::handlers::handle_server_message;
use super::publisher;
use super::state::ClientRoomState;
use super::types::{RoomView, SessionError, SessionEvents};

/// Delay between reconnect attempts after the transport drops
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// How many reconnect attempts fit inside the coordinator's grace period
const RECONNECT_ATTEMPTS: u32 = 6;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Coordinator WebSocket URL, e.g. `ws://localhost:3001/ws`
    pub server_url: String,
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) player: PlayerClient,
    pub(crate) events: Arc<dyn SessionEvents>,
    /// Sender feeding the writer task; None while disconnected
    pub(crate) outbox: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    /// Coordinator-assigned id for the live connection
    pub(crate) connection_id: RwLock<Option<String>>,
    pub(crate) room: Mutex<Option<ClientRoomState>>,
    pub(crate) reconciler: Mutex<DriftReconciler>,
    pub(crate) clock: Mutex<ClockEstimate>,
    pub(crate) sampler: Mutex<ClockSampler>,
    /// Token identifying our most recent manual seek (published when master)
    pub(crate) last_seek_timestamp: AtomicU64,
    pub(crate) publisher_cancel: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) timesync_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

/// Main session interface
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connect to a coordinator. The returned session is ready for
    /// `join_room` once the transport is up.
    pub async fn connect(
        config: SessionConfig,
        player: PlayerClient,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Self, SessionError> {
        let inner = Arc::new(SessionInner {
            config,
            player,
            events,
            outbox: Mutex::new(None),
            connection_id: RwLock::new(None),
            room: Mutex::new(None),
            reconciler: Mutex::new(DriftReconciler::new()),
            clock: Mutex::new(ClockEstimate::default()),
            sampler: Mutex::new(ClockSampler::new()),
            last_seek_timestamp: AtomicU64::new(0),
            publisher_cancel: Mutex::new(None),
            timesync_cancel: Mutex::new(None),
        });

        open_transport(&inner).await?;
        info!("Connected to coordinator at {}", inner.config.server_url);
        Ok(Self { inner })
    }

    /// Join a room. Re-runs clock synchronization and starts the periodic
    /// resync cadence.
    pub fn join_room(
        &self,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<(), SessionError> {
        let room_id = room_id.into();
        let display_name = display_name.into();

        {
            let mut room = self.inner.room.lock();
            if room.is_some() {
                return Err(SessionError::AlreadyInRoom);
            }
            *room = Some(ClientRoomState::new(room_id.clone(), display_name.clone()));
        }

        if let Err(e) = send(&self.inner, ClientMessage::JoinRoom {
            room_id: room_id.clone(),
            display_name,
        }) {
            *self.inner.room.lock() = None;
            return Err(e);
        }

        start_timesync_loop(&self.inner);
        info!("Joining room {}", room_id);
        Ok(())
    }

    /// Leave the current room and reset all per-room state
    pub fn leave_room(&self) -> Result<(), SessionError> {
        let room_id = {
            let room = self.inner.room.lock();
            room.as_ref()
                .map(|r| r.room_id.clone())
                .ok_or(SessionError::NotInRoom)?
        };

        let _ = send(&self.inner, ClientMessage::LeaveRoom {
            room_id: room_id.clone(),
        });

        reset_room_state(&self.inner);
        info!("Left room {}", room_id);
        Ok(())
    }

    /// Hand the master role to another participant (master only)
    pub fn transfer_master(&self, target_connection_id: impl Into<String>) -> Result<(), SessionError> {
        let room_id = self.require_master()?;
        send(&self.inner, ClientMessage::TransferMaster {
            room_id,
            target_connection_id: target_connection_id.into(),
        })
    }

    /// Resume playback, locally when master, via the relay otherwise
    pub async fn play(&self) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.play().await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Play)
        }
    }

    /// Pause playback
    pub async fn pause(&self) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.pause().await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Pause)
        }
    }

    /// Skip to the next song
    pub async fn next(&self) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.next().await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Next)
        }
    }

    /// Go back to the previous song
    pub async fn previous(&self) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.previous().await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Previous)
        }
    }

    /// Seek to a position in seconds.
    ///
    /// Followers seek optimistically and open the suppression window so the
    /// next stale snapshot does not immediately undo the seek; the request
    /// still goes to the master, whose next publish confirms it.
    pub async fn seek(&self, position: f64) -> Result<(), SessionError> {
        self.inner.player.seek(position).await?;

        if self.is_master() {
            self.inner
                .last_seek_timestamp
                .store(current_time_ms(), Ordering::Relaxed);
            Ok(())
        } else {
            self.inner.reconciler.lock().note_local_seek(std::time::Instant::now());
            self.send_action(RemoteAction::Seek { position })
        }
    }

    /// Append a song to the end of the shared queue
    pub async fn add_to_queue(&self, song: Song) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.enqueue(song.identity()).await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Add { song })
        }
    }

    /// Insert a song right after the current one
    pub async fn play_next(&self, song: Song) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.insert_next(song.identity()).await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::PlayNext { song })
        }
    }

    /// Remove a queue entry (0-based)
    pub async fn remove_from_queue(&self, index: usize) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.remove_at(index).await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Remove { index })
        }
    }

    /// Move a queue entry (0-based)
    pub async fn move_in_queue(&self, from_index: usize, to_index: usize) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.move_index(from_index, to_index).await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::Move {
                from_index,
                to_index,
            })
        }
    }

    /// Start playing a specific song
    pub async fn play_song(&self, song: Song) -> Result<(), SessionError> {
        if self.is_master() {
            self.inner.player.play_song(song.identity()).await?;
            Ok(())
        } else {
            self.send_action(RemoteAction::PlaySong { song })
        }
    }

    /// Whether this client currently holds the master role
    pub fn is_master(&self) -> bool {
        let connection_id = self.inner.connection_id.read();
        let room = self.inner.room.lock();
        match (connection_id.as_deref(), room.as_ref()) {
            (Some(id), Some(state)) => state.is_master(id),
            _ => false,
        }
    }

    /// Whether this client is in a room
    pub fn is_in_room(&self) -> bool {
        self.inner.room.lock().is_some()
    }

    /// Current room state, if in a room
    pub fn room_state(&self) -> Option<RoomView> {
        let connection_id = self.inner.connection_id.read().clone()?;
        let room = self.inner.room.lock();
        room.as_ref().map(|r| r.view(&connection_id))
    }

    /// Current clock estimate against the coordinator
    pub fn clock_estimate(&self) -> ClockEstimate {
        *self.inner.clock.lock()
    }

    fn require_master(&self) -> Result<String, SessionError> {
        let connection_id = self.inner.connection_id.read().clone();
        let room = self.inner.room.lock();
        let state = room.as_ref().ok_or(SessionError::NotInRoom)?;
        match connection_id {
            Some(id) if state.is_master(&id) => Ok(state.room_id.clone()),
            _ => Err(SessionError::NotMaster),
        }
    }

    fn send_action(&self, action: RemoteAction) -> Result<(), SessionError> {
        let room_id = {
            let room = self.inner.room.lock();
            room.as_ref()
                .map(|r| r.room_id.clone())
                .ok_or(SessionError::NotInRoom)?
        };
        send(&self.inner, ClientMessage::RemoteAction { room_id, action })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        publisher::stop(&self.inner);
        stop_timesync_loop(&self.inner);
    }
}

/// Queue a message for the writer task
pub(crate) fn send(inner: &Arc<SessionInner>, msg: ClientMessage) -> Result<(), SessionError> {
    let outbox = inner.outbox.lock();
    let tx = outbox.as_ref().ok_or(SessionError::NotConnected)?;
    tx.send(msg)
        .map_err(|_| SessionError::Transport("connection closed".to_string()))
}

/// Clear all per-room state so a later join starts clean
pub(crate) fn reset_room_state(inner: &Arc<SessionInner>) {
    publisher::stop(inner);
    stop_timesync_loop(inner);
    *inner.room.lock() = None;
    inner.reconciler.lock().reset();
    *inner.clock.lock() = ClockEstimate::default();
    inner.sampler.lock().begin_cycle();
    inner.last_seek_timestamp.store(0, Ordering::Relaxed);
}

/// Dial the coordinator and spawn the writer and reader tasks
async fn open_transport(inner: &Arc<SessionInner>) -> Result<(), SessionError> {
    let (stream, _) = tokio_tungstenite::connect_async(inner.config.server_url.as_str())
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let (mut sink, mut source) = stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
    *inner.outbox.lock() = Some(tx);

    // Writer: serialize and push outgoing messages
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Reader: dispatch inbound messages until the connection drops
    let inner_clone = Arc::clone(inner);
    tokio::spawn(async move {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => handle_server_message(&inner_clone, msg).await,
                    Err(e) => debug!("Ignoring unparsable message: {}", e),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        on_transport_closed(inner_clone).await;
    });

    Ok(())
}

/// Handle transport loss: notify, then try to reconnect and reclaim our
/// room (and master role, within the grace period) via `rejoin_room`.
async fn on_transport_closed(inner: Arc<SessionInner>) {
    warn!("Connection to coordinator lost");
    *inner.outbox.lock() = None;
    publisher::stop(&inner);
    stop_timesync_loop(&inner);
    inner.events.on_disconnected();

    let rejoin = {
        let room = inner.room.lock();
        room.as_ref()
            .map(|r| (r.room_id.clone(), r.display_name.clone()))
    };
    let Some((room_id, display_name)) = rejoin else {
        return;
    };

    let previous_connection_id = inner.connection_id.write().take();

    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::time::sleep(RECONNECT_DELAY).await;
        debug!("Reconnect attempt {}/{}", attempt, RECONNECT_ATTEMPTS);

        if reopen_transport(&inner).await.is_err() {
            continue;
        }

        // Baselines no longer apply to the new connection
        inner.reconciler.lock().reset();

        let msg = match &previous_connection_id {
            Some(prev) => ClientMessage::RejoinRoom {
                room_id: room_id.clone(),
                display_name: display_name.clone(),
                previous_connection_id: prev.clone(),
            },
            None => ClientMessage::JoinRoom {
                room_id: room_id.clone(),
                display_name: display_name.clone(),
            },
        };
        if send(&inner, msg).is_ok() {
            info!("Reconnected, rejoining room {}", room_id);
            start_timesync_loop(&inner);
            return;
        }
    }

    warn!("Could not reconnect to coordinator, leaving room");
    reset_room_state(&inner);
    inner.events.on_error("connection to coordinator lost".to_string());
}

/// Type-erased re-dial. The reader task ends in `on_transport_closed`,
/// which dials again; the indirection keeps the future type finite.
fn reopen_transport<'a>(
    inner: &'a Arc<SessionInner>,
) -> Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send + 'a>> {
    Box::pin(open_transport(inner))
}

/// Start the clock synchronization loop: one cycle now, then every 30s
pub(crate) fn start_timesync_loop(inner: &Arc<SessionInner>) {
    stop_timesync_loop(inner);

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    *inner.timesync_cancel.lock() = Some(cancel_tx);

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        debug!("Time sync loop started");
        loop {
            run_timesync_cycle(&inner).await;

            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("Time sync loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(RESYNC_INTERVAL) => {}
            }

            if inner.room.lock().is_none() {
                break;
            }
        }
        debug!("Time sync loop ended");
    });
}

pub(crate) fn stop_timesync_loop(inner: &Arc<SessionInner>) {
    if let Some(tx) = inner.timesync_cancel.lock().take() {
        let _ = tx.send(());
    }
}

/// One probe burst: send PROBE_COUNT spaced probes, wait for stragglers,
/// take the median, and report it for diagnostics.
async fn run_timesync_cycle(inner: &Arc<SessionInner>) {
    inner.sampler.lock().begin_cycle();

    for _ in 0..PROBE_COUNT {
        let client_time = current_time_ms();
        let sample_index = inner.sampler.lock().next_probe(client_time);
        if send(inner, ClientMessage::TimeSyncRequest {
            client_time,
            sample_index,
        })
        .is_err()
        {
            return;
        }
        tokio::time::sleep(PROBE_SPACING).await;
    }

    tokio::time::sleep(CYCLE_TIMEOUT).await;

    let estimate = inner.sampler.lock().finalize();
    if let Some(estimate) = estimate {
        *inner.clock.lock() = estimate;
        let _ = send(inner, ClientMessage::TimeSyncReport {
            offset: estimate.offset_ms,
            rtt: estimate.rtt_ms,
        });
    } else {
        warn!("Clock sync cycle lost all probes");
    }
}
