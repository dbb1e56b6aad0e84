//! Master publisher: polls the local player and pushes authoritative state

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::protocol::{
    current_time_ms, ClientMessage, PlaybackSnapshot, PublishedState, RemoteAction,
    SnapshotSource, Song,
};

use super::session::{send, SessionInner};

/// Poll-and-broadcast period. The loop is strictly sequential: a new cycle
/// only starts after the previous sampling round completed.
pub(crate) const PUBLISH_INTERVAL: Duration = Duration::from_millis(1500);

/// Start the publish loop. Any previous loop is cancelled first.
pub(crate) fn start(inner: &Arc<SessionInner>) {
    stop(inner);

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    *inner.publisher_cancel.lock() = Some(cancel_tx);

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        info!("Publisher loop started");
        let mut last_track_identity: Option<String> = None;

        loop {
            if cancel_rx.try_recv().is_ok() {
                info!("Publisher loop cancelled");
                break;
            }

            let context = {
                let connection_id = inner.connection_id.read().clone();
                let room = inner.room.lock();
                match (connection_id.as_deref(), room.as_ref()) {
                    (Some(id), Some(state)) if state.is_master(id) => {
                        Some((state.room_id.clone(), state.master_epoch, id.to_string()))
                    }
                    _ => None,
                }
            };
            let Some((room_id, epoch, connection_id)) = context else {
                debug!("No longer master, stopping publisher loop");
                break;
            };

            publish_once(
                &inner,
                &room_id,
                epoch,
                &connection_id,
                &mut last_track_identity,
            )
            .await;

            tokio::time::sleep(PUBLISH_INTERVAL).await;
        }

        info!("Publisher loop ended");
    });
}

/// Stop the publish loop
pub(crate) fn stop(inner: &Arc<SessionInner>) {
    if let Some(tx) = inner.publisher_cancel.lock().take() {
        let _ = tx.send(());
    }
}

/// One sampling + publish cycle
async fn publish_once(
    inner: &Arc<SessionInner>,
    room_id: &str,
    epoch: u64,
    connection_id: &str,
    last_track_identity: &mut Option<String>,
) {
    let (now_playing, is_playing, queue) = tokio::join!(
        inner.player.now_playing(),
        inner.player.is_playing(),
        inner.player.queue()
    );

    // A sick player is an ordinary interruption; the next cycle retries
    let now_playing = match now_playing {
        Ok(np) => np,
        Err(e) => {
            warn!("Player poll failed: {}", e);
            return;
        }
    };
    let is_playing = is_playing.unwrap_or(false);
    let full_queue = queue.unwrap_or_default();

    let current_song = now_playing.as_ref().map(|np| np.to_song());
    let current_identity = current_song.as_ref().map(|s| s.identity().to_string());
    let position = now_playing
        .as_ref()
        .map(|np| np.current_playback_time)
        .unwrap_or(0.0);

    let (history, up_next) = split_queue(&full_queue, current_identity.as_deref());

    let playback = PlaybackSnapshot {
        is_playing,
        current_song: current_song.clone(),
        position,
        source: SnapshotSource::Master,
        // The coordinator stamps sequence and server time on relay
        sequence: 0,
        last_seek_timestamp: inner.last_seek_timestamp.load(Ordering::Relaxed),
        last_update_server_time: 0,
    };

    let state = PublishedState {
        queue: up_next.clone(),
        history: history.clone(),
        playback: playback.clone(),
    };

    if send(inner, ClientMessage::MasterStateUpdate {
        room_id: room_id.to_string(),
        epoch: Some(epoch),
        state,
    })
    .is_err()
    {
        return;
    }

    let track_changed = *last_track_identity != current_identity;
    let view = {
        let mut room = inner.room.lock();
        let Some(room_state) = room.as_mut() else {
            return;
        };
        room_state.queue = up_next;
        room_state.history = history;
        room_state.playback = playback;
        track_changed.then(|| room_state.view(connection_id))
    };

    if let Some(view) = view {
        if let Some(song) = &current_song {
            debug!("Broadcasting track change: {} - {}", song.name, song.artist_name);
        }
        *last_track_identity = current_identity;
        inner.events.on_room_state_changed(view);
    }
}

/// Execute a control request forwarded from a follower. Results propagate
/// through the next publish cycle; there is no ack path.
pub(crate) async fn execute_remote_action(inner: &Arc<SessionInner>, action: RemoteAction) {
    let player = &inner.player;
    let result = match &action {
        RemoteAction::Play => player.play().await,
        RemoteAction::Pause => player.pause().await,
        RemoteAction::Next => player.next().await,
        RemoteAction::Previous => player.previous().await,
        RemoteAction::Seek { position } => {
            let result = player.seek(*position).await;
            if result.is_ok() {
                // A relayed seek is a manual seek: stamp the token so
                // followers treat the next snapshot as a confirmed new seek
                inner
                    .last_seek_timestamp
                    .store(current_time_ms(), Ordering::Relaxed);
            }
            result
        }
        RemoteAction::Add { song } => player.enqueue(song.identity()).await,
        RemoteAction::PlayNext { song } => player.insert_next(song.identity()).await,
        RemoteAction::Remove { index } => player.remove_at(*index).await,
        RemoteAction::Move {
            from_index,
            to_index,
        } => player.move_index(*from_index, *to_index).await,
        RemoteAction::PlaySong { song } => player.play_song(song.identity()).await,
    };

    if let Err(e) = result {
        warn!("Failed to execute remote action {:?}: {}", action, e);
    }
}

/// Split the player's full queue around the current song: everything before
/// it already played, everything after is up next.
pub(crate) fn split_queue(
    full_queue: &[Song],
    current_identity: Option<&str>,
) -> (Vec<Song>, Vec<Song>) {
    let Some(identity) = current_identity else {
        return (Vec::new(), full_queue.to_vec());
    };

    match full_queue.iter().position(|s| s.identity() == identity) {
        Some(index) => (
            full_queue[..index].to_vec(),
            full_queue[index + 1..].to_vec(),
        ),
        // Current song not in the queue view: treat everything as up next
        None => (Vec::new(), full_queue.to_vec()),
    }
}
