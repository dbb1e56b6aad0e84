//! Inbound coordinator message handling

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::drift::{LocalPlayback, Reconciliation};
use crate::protocol::{
    current_time_ms, Participant, PlaybackSnapshot, ServerMessage, Song,
};

use super::publisher;
use super::session::SessionInner;
use super::types::SyncStatus;

/// Dispatch one message from the coordinator
pub(crate) async fn handle_server_message(inner: &Arc<SessionInner>, msg: ServerMessage) {
    match msg {
        ServerMessage::Welcome {
            connection_id,
            server_time: _,
        } => handle_welcome(inner, connection_id),

        ServerMessage::SyncState {
            queue,
            history,
            playback,
            users,
            master_id,
            master_epoch,
            server_time: _,
        } => {
            handle_sync_state(inner, queue, history, playback, users, master_id, master_epoch)
                .await
        }

        ServerMessage::MasterUpdate {
            master_id,
            master_epoch,
        } => handle_master_update(inner, master_id, master_epoch),

        ServerMessage::UsersUpdate { users } => handle_users_update(inner, users),

        ServerMessage::MasterPaused => handle_master_paused(inner).await,

        ServerMessage::TimeSyncResponse {
            client_time,
            server_time,
            sample_index,
        } => {
            let receive_time = current_time_ms();
            inner
                .sampler
                .lock()
                .record_response(client_time, server_time, sample_index, receive_time);
        }

        ServerMessage::RemoteActionRequest {
            action,
            requester_id,
        } => {
            if is_master(inner) {
                debug!("Executing remote action from {}: {:?}", requester_id, action);
                publisher::execute_remote_action(inner, action).await;
            } else {
                warn!("Ignoring remote action request while not master");
            }
        }
    }
}

fn is_master(inner: &Arc<SessionInner>) -> bool {
    let connection_id = inner.connection_id.read();
    let room = inner.room.lock();
    match (connection_id.as_deref(), room.as_ref()) {
        (Some(id), Some(state)) => state.is_master(id),
        _ => false,
    }
}

fn handle_welcome(inner: &Arc<SessionInner>, connection_id: String) {
    info!("Coordinator assigned connection id {}", connection_id);
    *inner.connection_id.write() = Some(connection_id.clone());
    inner.events.on_connected(connection_id);
}

async fn handle_sync_state(
    inner: &Arc<SessionInner>,
    queue: Vec<Song>,
    history: Vec<Song>,
    playback: PlaybackSnapshot,
    users: Vec<Participant>,
    master_id: Option<String>,
    master_epoch: u64,
) {
    let connection_id = inner.connection_id.read().clone();

    let (was_master, now_master, view) = {
        let mut room = inner.room.lock();
        let Some(state) = room.as_mut() else {
            debug!("Ignoring sync_state while not in a room");
            return;
        };

        let was_master = connection_id
            .as_deref()
            .map(|id| state.is_master(id))
            .unwrap_or(false);

        state.queue = queue;
        state.history = history;
        state.playback = playback.clone();
        state.users = users;
        state.master_id = master_id;
        state.master_epoch = master_epoch;

        let now_master = connection_id
            .as_deref()
            .map(|id| state.is_master(id))
            .unwrap_or(false);

        (
            was_master,
            now_master,
            connection_id.as_deref().map(|id| state.view(id)),
        )
    };

    if let Some(view) = view {
        inner.events.on_room_state_changed(view);
    }

    apply_role_change(inner, was_master, now_master);

    if !now_master {
        reconcile(inner, master_epoch, &playback).await;
    }
}

fn handle_master_update(inner: &Arc<SessionInner>, master_id: Option<String>, master_epoch: u64) {
    let connection_id = inner.connection_id.read().clone();

    let roles = {
        let mut room = inner.room.lock();
        let Some(state) = room.as_mut() else {
            return;
        };
        let was_master = connection_id
            .as_deref()
            .map(|id| state.is_master(id))
            .unwrap_or(false);

        state.master_id = master_id.clone();
        state.master_epoch = master_epoch;

        let now_master = connection_id
            .as_deref()
            .map(|id| state.is_master(id))
            .unwrap_or(false);
        Some((was_master, now_master))
    };

    info!("Master is now {:?} (epoch {})", master_id, master_epoch);
    inner.events.on_master_changed(master_id, master_epoch);

    if let Some((was_master, now_master)) = roles {
        apply_role_change(inner, was_master, now_master);
    }
}

fn handle_users_update(inner: &Arc<SessionInner>, users: Vec<Participant>) {
    {
        let mut room = inner.room.lock();
        let Some(state) = room.as_mut() else {
            return;
        };
        state.users = users.clone();
    }
    inner.events.on_users_changed(users);
}

/// Grace period expired without the master returning; nobody was executing
/// commands, so the room is considered paused until the new master publishes.
async fn handle_master_paused(inner: &Arc<SessionInner>) {
    info!("Master did not return within the grace period, pausing");
    {
        let mut room = inner.room.lock();
        if let Some(state) = room.as_mut() {
            state.playback.is_playing = false;
        }
    }
    if let Err(e) = inner.player.pause().await {
        warn!("Failed to pause player: {}", e);
    }
    inner.events.on_master_paused();
}

/// Start or stop the publisher loop when mastership changed hands
fn apply_role_change(inner: &Arc<SessionInner>, was_master: bool, now_master: bool) {
    if !was_master && now_master {
        info!("Promoted to master");
        publisher::start(inner);
    } else if was_master && !now_master {
        info!("No longer master");
        publisher::stop(inner);
    }
}

/// Follower reconciliation: sample the local player, evaluate the snapshot,
/// and apply whatever correction the reconciler decided on.
async fn reconcile(inner: &Arc<SessionInner>, epoch: u64, snapshot: &PlaybackSnapshot) {
    let (now_playing, is_playing) =
        tokio::join!(inner.player.now_playing(), inner.player.is_playing());

    let now_playing = match now_playing {
        Ok(np) => np,
        Err(e) => {
            warn!("Player unreachable during reconciliation: {}", e);
            return;
        }
    };
    let is_playing = is_playing.unwrap_or(false);

    let local = LocalPlayback {
        song_identity: now_playing
            .as_ref()
            .map(|np| np.to_song().identity().to_string()),
        position: now_playing
            .as_ref()
            .map(|np| np.current_playback_time)
            .unwrap_or(0.0),
        is_playing,
    };

    let clock = *inner.clock.lock();
    let decision = inner.reconciler.lock().evaluate(
        epoch,
        snapshot,
        &local,
        &clock,
        current_time_ms(),
        Instant::now(),
    );

    let plan = match decision {
        Reconciliation::Stale => {
            debug!("Discarding stale snapshot (epoch {}, seq {})", epoch, snapshot.sequence);
            return;
        }
        Reconciliation::Suppressed => {
            debug!("Snapshot suppressed after local seek");
            return;
        }
        Reconciliation::Apply(plan) => plan,
    };

    if let Some(song) = &plan.load_song {
        info!("Loading master's song: {} - {}", song.name, song.artist_name);
        if let Err(e) = inner.player.play_song(song.identity()).await {
            warn!("Failed to load song: {}", e);
        }
    }

    if let Some(playing) = plan.set_playing {
        let result = if playing {
            inner.player.play().await
        } else {
            inner.player.pause().await
        };
        if let Err(e) = result {
            warn!("Failed to sync transport state: {}", e);
        }
    }

    let corrected = plan.seek_to.is_some();
    if let Some(target) = plan.seek_to {
        debug!(
            "Corrective seek to {:.3}s (drift {:+.0}ms)",
            target,
            plan.drift.unwrap_or(0.0) * 1000.0
        );
        if let Err(e) = inner.player.seek(target.max(0.0)).await {
            warn!("Corrective seek failed: {}", e);
        }
    }

    if let Some(drift) = plan.drift {
        inner.events.on_sync_status(SyncStatus {
            drift_ms: (drift * 1000.0).round() as i64,
            offset_ms: clock.offset_ms,
            rtt_ms: clock.rtt_ms,
            corrected,
        });
    }

    inner.events.on_playback_changed(snapshot.clone());
}
