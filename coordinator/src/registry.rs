//! Room registry, master election and relays
//!
//! All room state lives in one in-memory map behind a single mutex: join,
//! leave, disconnect, publish and action events are check-then-act sequences
//! that must be linearized per room. The only suspend point is the grace
//! timer, a one-shot task that re-validates the room's state machine under
//! the lock when it fires, so a late fire after cancellation is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use tandem_core::protocol::{
    current_time_ms, Participant, PlaybackSnapshot, PublishedState, RemoteAction, ServerMessage,
    SnapshotSource, Song,
};

use crate::metrics::{LogLevel, SharedMetrics};

/// How long a disconnected master may reclaim its role
pub const GRACE_PERIOD: Duration = Duration::from_secs(15);

/// Per-connection channel feeding that connection's writer task
pub type Outbox = UnboundedSender<ServerMessage>;

pub type SharedRegistry = Arc<Mutex<Registry>>;

struct RoomParticipant {
    info: Participant,
    outbox: Outbox,
}

/// Master role state machine for one room
enum MasterState {
    NoMaster,
    HasMaster {
        connection_id: String,
    },
    /// The master's connection dropped; its prior identity may reclaim the
    /// role until the timer fires
    GracePeriod {
        disconnected_id: String,
        timer: AbortHandle,
    },
}

struct Room {
    queue: Vec<Song>,
    history: Vec<Song>,
    playback: PlaybackSnapshot,
    /// Insertion order = join order; the earliest-joined participant is the
    /// deterministic fallback master
    participants: Vec<RoomParticipant>,
    master: MasterState,
    epoch: u64,
    sequence: u64,
}

impl Room {
    fn new() -> Self {
        Self {
            queue: Vec::new(),
            history: Vec::new(),
            playback: PlaybackSnapshot::default(),
            participants: Vec::new(),
            master: MasterState::NoMaster,
            epoch: 0,
            sequence: 0,
        }
    }

    fn master_id(&self) -> Option<&str> {
        match &self.master {
            MasterState::HasMaster { connection_id } => Some(connection_id),
            _ => None,
        }
    }

    fn grace_pending(&self) -> bool {
        matches!(self.master, MasterState::GracePeriod { .. })
    }

    fn contains(&self, connection_id: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.info.connection_id == connection_id)
    }

    fn participant_list(&self) -> Vec<Participant> {
        self.participants.iter().map(|p| p.info.clone()).collect()
    }

    /// New master, new epoch. Every epoch change resets the sequence
    /// baseline for subsequent broadcasts.
    fn assign_master(&mut self, connection_id: String) {
        self.epoch += 1;
        self.sequence = 0;
        self.master = MasterState::HasMaster { connection_id };
    }

    fn send_to(&self, connection_id: &str, msg: ServerMessage) {
        if let Some(p) = self
            .participants
            .iter()
            .find(|p| p.info.connection_id == connection_id)
        {
            let _ = p.outbox.send(msg);
        }
    }

    fn broadcast(&self, msg: &ServerMessage) {
        for p in &self.participants {
            let _ = p.outbox.send(msg.clone());
        }
    }

    fn broadcast_except(&self, excluded: &str, msg: &ServerMessage) {
        for p in &self.participants {
            if p.info.connection_id != excluded {
                let _ = p.outbox.send(msg.clone());
            }
        }
    }

    /// Full state push, also used as the out-of-band baseline for joiners
    fn sync_state(&self) -> ServerMessage {
        ServerMessage::SyncState {
            queue: self.queue.clone(),
            history: self.history.clone(),
            playback: self.playback.clone(),
            users: self.participant_list(),
            master_id: self.master_id().map(String::from),
            master_epoch: self.epoch,
            server_time: current_time_ms(),
        }
    }

    fn master_update(&self) -> ServerMessage {
        ServerMessage::MasterUpdate {
            master_id: self.master_id().map(String::from),
            master_epoch: self.epoch,
        }
    }

    fn users_update(&self) -> ServerMessage {
        ServerMessage::UsersUpdate {
            users: self.participant_list(),
        }
    }
}

/// In-memory directory of rooms. Lives behind a single mutex; see module docs.
pub struct Registry {
    rooms: HashMap<String, Room>,
    metrics: SharedMetrics,
}

impl Registry {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            rooms: HashMap::new(),
            metrics,
        }
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Join a room, creating it on first reference. Re-joining replaces any
    /// prior entry for the same connection. The first participant of a
    /// masterless room becomes master.
    pub fn join(
        &mut self,
        room_id: &str,
        connection_id: &str,
        display_name: &str,
        outbox: Outbox,
    ) {
        if !self.rooms.contains_key(room_id) {
            self.rooms.insert(room_id.to_string(), Room::new());
            info!("Room created: {}", room_id);
            self.metrics
                .lock()
                .room_created(room_id, self.rooms.len());
        }
        let room = self.rooms.get_mut(room_id).expect("room just ensured");

        room.participants
            .retain(|p| p.info.connection_id != connection_id);
        room.participants.push(RoomParticipant {
            info: Participant {
                connection_id: connection_id.to_string(),
                display_name: display_name.to_string(),
            },
            outbox,
        });

        if matches!(room.master, MasterState::NoMaster) {
            room.assign_master(connection_id.to_string());
            info!(
                "Room {}: master assigned to {} (epoch {})",
                room_id, connection_id, room.epoch
            );
        }

        // Baseline push for the joiner, roster and master for everyone
        room.send_to(connection_id, room.sync_state());
        room.broadcast(&room.users_update());
        room.broadcast(&room.master_update());

        info!("{} ({}) joined room {}", connection_id, display_name, room_id);
        self.metrics.lock().log(
            LogLevel::Room,
            format!("{} joined room {}", display_name, room_id),
        );
    }

    /// Reclaim the master role after a disconnect. Honored only while the
    /// presented previous connection id is inside its grace period; anything
    /// else is an ordinary join.
    pub fn rejoin(
        &mut self,
        room_id: &str,
        connection_id: &str,
        display_name: &str,
        previous_connection_id: &str,
        outbox: Outbox,
    ) {
        let honored = self
            .rooms
            .get(room_id)
            .map(|room| {
                matches!(&room.master, MasterState::GracePeriod { disconnected_id, .. }
                    if disconnected_id == previous_connection_id)
            })
            .unwrap_or(false);

        if !honored {
            debug!(
                "Rejoin from {} not inside a grace period for {}, treating as join",
                connection_id, previous_connection_id
            );
            self.join(room_id, connection_id, display_name, outbox);
            return;
        }

        let room = self.rooms.get_mut(room_id).expect("room checked above");
        if let MasterState::GracePeriod { timer, .. } = &room.master {
            timer.abort();
        }

        // Same tenure continues under the new connection id: no epoch change
        room.master = MasterState::HasMaster {
            connection_id: connection_id.to_string(),
        };

        room.participants
            .retain(|p| p.info.connection_id != connection_id);
        room.participants.push(RoomParticipant {
            info: Participant {
                connection_id: connection_id.to_string(),
                display_name: display_name.to_string(),
            },
            outbox,
        });

        room.send_to(connection_id, room.sync_state());
        room.broadcast(&room.users_update());
        room.broadcast(&room.master_update());

        info!(
            "Room {}: master reclaimed by {} (was {}, epoch {})",
            room_id, connection_id, previous_connection_id, room.epoch
        );
        self.metrics.lock().log(
            LogLevel::Room,
            format!("Master reclaimed in room {}", room_id),
        );
    }

    /// Hand the master role to another participant. Only the current master
    /// may transfer, and only to a connected participant.
    pub fn transfer(&mut self, room_id: &str, connection_id: &str, target_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            warn!("Transfer for unknown room {}", room_id);
            return;
        };

        if room.master_id() != Some(connection_id) {
            warn!(
                "Blocked transfer from non-master {} in room {}",
                connection_id, room_id
            );
            return;
        }
        if !room.contains(target_id) {
            warn!(
                "Blocked transfer to non-participant {} in room {}",
                target_id, room_id
            );
            return;
        }

        room.assign_master(target_id.to_string());
        room.broadcast(&room.master_update());

        info!(
            "Room {}: master transferred to {} (epoch {})",
            room_id, target_id, room.epoch
        );
        self.metrics.lock().log(
            LogLevel::Room,
            format!("Master transferred in room {}", room_id),
        );
    }

    /// Accept a state publish from the room's master, stamp it and relay it
    /// to everyone else. Unauthorized and epoch-stale publishes are dropped
    /// silently (logged); the sender learns nothing.
    pub fn publish(
        &mut self,
        room_id: &str,
        connection_id: &str,
        epoch: Option<u64>,
        state: PublishedState,
    ) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            warn!("Publish for unknown room {}", room_id);
            return;
        };

        if room.master_id() != Some(connection_id) {
            warn!(
                "Blocked spoofed master update from {} in room {} (master is {:?})",
                connection_id,
                room_id,
                room.master_id()
            );
            self.metrics.lock().publish_rejected();
            return;
        }

        if let Some(claimed) = epoch {
            if claimed != room.epoch {
                debug!(
                    "Dropping stale publish in room {} (claimed epoch {}, current {})",
                    room_id, claimed, room.epoch
                );
                self.metrics.lock().publish_rejected();
                return;
            }
        }

        room.sequence += 1;

        let mut playback = state.playback;
        playback.sequence = room.sequence;
        playback.last_update_server_time = current_time_ms();
        playback.source = SnapshotSource::Master;

        // Full replace, not a diff
        room.queue = state.queue;
        room.history = state.history;
        room.playback = playback;

        room.broadcast_except(connection_id, &room.sync_state());

        let receivers = room.participants.len().saturating_sub(1);
        self.metrics.lock().snapshot_relayed(receivers);
    }

    /// Forward a control request to the room's master, fire-and-forget.
    /// With no live master (including during a grace period) the request is
    /// dropped: a masterless room is a valid steady state, not an error.
    pub fn action(
        &mut self,
        room_id: &str,
        connection_id: &str,
        action: RemoteAction,
    ) {
        let Some(room) = self.rooms.get(room_id) else {
            debug!("Action for unknown room {}", room_id);
            return;
        };

        match room.master_id() {
            Some(master) => {
                room.send_to(
                    master,
                    ServerMessage::RemoteActionRequest {
                        action,
                        requester_id: connection_id.to_string(),
                    },
                );
                self.metrics.lock().action_relayed();
            }
            None => {
                debug!("Room {}: action ignored (no master)", room_id);
            }
        }
    }

    /// Explicit leave. A departing master hands off immediately: this is a
    /// deliberate exit, not a transport loss, so no grace period applies.
    pub fn leave(&mut self, room_id: &str, connection_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };

        let before = room.participants.len();
        room.participants
            .retain(|p| p.info.connection_id != connection_id);
        if room.participants.len() == before {
            return;
        }

        info!("{} left room {}", connection_id, room_id);
        self.metrics
            .lock()
            .log(LogLevel::Room, format!("Leave in room {}", room_id));

        let was_master = room.master_id() == Some(connection_id);
        if was_master {
            if let Some(next) = room.participants.first() {
                let next_id = next.info.connection_id.clone();
                room.assign_master(next_id.clone());
                info!(
                    "Room {}: master reassigned to {} (epoch {})",
                    room_id, next_id, room.epoch
                );
            } else {
                self.destroy_room(room_id);
                return;
            }
        } else if room.participants.is_empty() && !room.grace_pending() {
            self.destroy_room(room_id);
            return;
        }

        let room = self.rooms.get(room_id).expect("room still present");
        room.broadcast(&room.users_update());
        if was_master {
            room.broadcast(&room.master_update());
        }
    }

    /// Transport-level disconnect. A disconnecting master opens the grace
    /// period instead of triggering an election; only the roster change is
    /// announced until the timer resolves it one way or the other.
    pub fn disconnect(&mut self, shared: &SharedRegistry, connection_id: &str) {
        let room_id = self
            .rooms
            .iter()
            .find(|(_, room)| room.contains(connection_id))
            .map(|(id, _)| id.clone());
        let Some(room_id) = room_id else {
            return;
        };

        let room = self.rooms.get_mut(&room_id).expect("room found above");
        let was_master = room.master_id() == Some(connection_id);
        room.participants
            .retain(|p| p.info.connection_id != connection_id);

        info!("{} disconnected from room {}", connection_id, room_id);

        if was_master {
            if room.participants.is_empty() {
                self.destroy_room(&room_id);
                return;
            }

            let timer = spawn_grace_timer(shared, &room_id, connection_id);
            room.master = MasterState::GracePeriod {
                disconnected_id: connection_id.to_string(),
                timer,
            };
            room.broadcast(&room.users_update());

            info!(
                "Room {}: master {} disconnected, grace period started",
                room_id, connection_id
            );
            self.metrics.lock().log(
                LogLevel::Room,
                format!("Grace period started in room {}", room_id),
            );
        } else if room.participants.is_empty() && !room.grace_pending() {
            self.destroy_room(&room_id);
        } else {
            room.broadcast(&room.users_update());
        }
    }

    /// Grace timer fired. Validated against the state machine: the room must
    /// still be in the grace period for exactly this connection id,
    /// otherwise a rejoin or teardown already won the race.
    pub fn grace_expired(&mut self, room_id: &str, disconnected_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let still_pending = matches!(&room.master, MasterState::GracePeriod { disconnected_id: id, .. }
            if id == disconnected_id);
        if !still_pending {
            debug!("Grace timer for room {} superseded", room_id);
            return;
        }

        if room.participants.is_empty() {
            self.destroy_room(room_id);
            return;
        }

        let next_id = room.participants[0].info.connection_id.clone();
        room.assign_master(next_id.clone());
        // No authoritative source executed commands during the gap
        room.playback.is_playing = false;

        room.broadcast(&ServerMessage::MasterPaused);
        room.broadcast(&room.master_update());

        info!(
            "Room {}: grace period expired, master reassigned to {} (epoch {})",
            room_id, next_id, room.epoch
        );
        self.metrics.lock().log(
            LogLevel::Room,
            format!("Grace period expired in room {}", room_id),
        );
    }

    fn destroy_room(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.remove(room_id) {
            if let MasterState::GracePeriod { timer, .. } = &room.master {
                timer.abort();
            }
            info!("Room destroyed: {}", room_id);
            self.metrics
                .lock()
                .room_destroyed(room_id, self.rooms.len());
        }
    }
}

fn spawn_grace_timer(
    shared: &SharedRegistry,
    room_id: &str,
    disconnected_id: &str,
) -> AbortHandle {
    let shared = Arc::clone(shared);
    let room_id = room_id.to_string();
    let disconnected_id = disconnected_id.to_string();

    tokio::spawn(async move {
        tokio::time::sleep(GRACE_PERIOD).await;
        shared.lock().grace_expired(&room_id, &disconnected_id);
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn new_registry() -> SharedRegistry {
        let metrics = Arc::new(Mutex::new(Metrics::new()));
        Arc::new(Mutex::new(Registry::new(metrics)))
    }

    fn join(reg: &SharedRegistry, room: &str, id: &str) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.lock().join(room, id, id, tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn published(position: f64) -> PublishedState {
        PublishedState {
            queue: Vec::new(),
            history: Vec::new(),
            playback: PlaybackSnapshot {
                is_playing: true,
                current_song: None,
                position,
                source: SnapshotSource::Master,
                sequence: 0,
                last_seek_timestamp: 0,
                last_update_server_time: 0,
            },
        }
    }

    fn current_epoch(reg: &SharedRegistry, room: &str) -> u64 {
        reg.lock().rooms[room].epoch
    }

    fn current_master(reg: &SharedRegistry, room: &str) -> Option<String> {
        reg.lock().rooms[room].master_id().map(String::from)
    }

    #[tokio::test]
    async fn first_joiner_becomes_master() {
        let reg = new_registry();
        let mut rx = join(&reg, "r", "c1");

        let msgs = drain(&mut rx);
        assert!(matches!(
            &msgs[0],
            ServerMessage::SyncState { master_id: Some(id), master_epoch: 1, .. } if id == "c1"
        ));
        assert_eq!(current_master(&reg, "r").as_deref(), Some("c1"));
        assert_eq!(current_epoch(&reg, "r"), 1);
    }

    #[tokio::test]
    async fn second_joiner_stays_follower() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");

        let msgs = drain(&mut rx2);
        assert!(matches!(
            &msgs[0],
            ServerMessage::SyncState { master_id: Some(id), master_epoch: 1, .. } if id == "c1"
        ));
        assert_eq!(current_epoch(&reg, "r"), 1);
    }

    #[tokio::test]
    async fn epoch_strictly_increases_across_elections() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1"); // epoch 1
        let _rx2 = join(&reg, "r", "c2");

        let mut seen = vec![current_epoch(&reg, "r")];

        reg.lock().transfer("r", "c1", "c2"); // epoch 2
        seen.push(current_epoch(&reg, "r"));

        reg.lock().transfer("r", "c2", "c1"); // epoch 3
        seen.push(current_epoch(&reg, "r"));

        reg.lock().leave("r", "c1"); // master left -> epoch 4
        seen.push(current_epoch(&reg, "r"));

        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn non_master_publish_is_rejected() {
        let reg = new_registry();
        let mut rx1 = join(&reg, "r", "c1");
        let _rx2 = join(&reg, "r", "c2");
        drain(&mut rx1);

        reg.lock().publish("r", "c2", None, published(5.0));

        // No relay reached the master, no state was mutated
        assert!(drain(&mut rx1).is_empty());
        assert_eq!(reg.lock().rooms["r"].sequence, 0);
        assert_eq!(reg.lock().rooms["r"].playback.position, 0.0);
    }

    #[tokio::test]
    async fn stale_epoch_publish_is_rejected() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        reg.lock().transfer("r", "c1", "c2"); // epoch 2
        drain(&mut rx2);

        // A publish stamped with the pre-transfer epoch is fenced off
        reg.lock().publish("r", "c2", Some(1), published(5.0));
        assert_eq!(reg.lock().rooms["r"].sequence, 0);

        // The current epoch is accepted
        reg.lock().publish("r", "c2", Some(2), published(5.0));
        assert_eq!(reg.lock().rooms["r"].sequence, 1);
    }

    #[tokio::test]
    async fn relayed_sequences_increase_and_skip_publisher() {
        let reg = new_registry();
        let mut rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        drain(&mut rx1);
        drain(&mut rx2);

        reg.lock().publish("r", "c1", Some(1), published(1.0));
        reg.lock().publish("r", "c1", Some(1), published(2.0));

        let sequences: Vec<u64> = drain(&mut rx2)
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::SyncState { playback, .. } => Some(playback.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![1, 2]);

        // The publisher is not sent its own echo
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn joiner_baseline_carries_current_sequence() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        reg.lock().publish("r", "c1", Some(1), published(1.0));
        reg.lock().publish("r", "c1", Some(1), published(2.0));

        let mut rx2 = join(&reg, "r", "c2");
        let msgs = drain(&mut rx2);
        assert!(matches!(
            &msgs[0],
            ServerMessage::SyncState { playback, .. } if playback.sequence == 2
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn master_rejoin_within_grace_keeps_epoch() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        drain(&mut rx2);

        reg.lock().disconnect(&reg, "c1");

        // Roster change only; no election yet
        let msgs = drain(&mut rx2);
        assert!(msgs
            .iter()
            .all(|m| matches!(m, ServerMessage::UsersUpdate { .. })));
        assert_eq!(current_master(&reg, "r"), None);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        reg.lock().rejoin("r", "c1-new", "c1", "c1", tx);

        assert_eq!(current_master(&reg, "r").as_deref(), Some("c1-new"));
        assert_eq!(current_epoch(&reg, "r"), 1, "reclaim must not bump the epoch");

        // The timer must not fire later and re-elect
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(current_master(&reg, "r").as_deref(), Some("c1-new"));
        assert!(!drain(&mut rx2)
            .iter()
            .any(|m| matches!(m, ServerMessage::MasterPaused)));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_elects_earliest_joiner_and_pauses() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        let mut rx3 = join(&reg, "r", "c3");
        drain(&mut rx2);
        drain(&mut rx3);

        reg.lock().disconnect(&reg, "c1");
        tokio::time::sleep(GRACE_PERIOD + Duration::from_secs(1)).await;

        assert_eq!(current_master(&reg, "r").as_deref(), Some("c2"));
        assert_eq!(current_epoch(&reg, "r"), 2, "expiry elects with exactly +1");
        assert!(!reg.lock().rooms["r"].playback.is_playing);

        for rx in [&mut rx2, &mut rx3] {
            let msgs = drain(rx);
            assert!(
                msgs.iter().any(|m| matches!(m, ServerMessage::MasterPaused)),
                "all participants must learn playback paused"
            );
            assert!(msgs.iter().any(|m| matches!(
                m,
                ServerMessage::MasterUpdate { master_id: Some(id), master_epoch: 2 } if id == "c2"
            )));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_after_expiry_is_an_ordinary_join() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let _rx2 = join(&reg, "r", "c2");

        reg.lock().disconnect(&reg, "c1");
        tokio::time::sleep(GRACE_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(current_master(&reg, "r").as_deref(), Some("c2"));

        let (tx, _rx) = mpsc::unbounded_channel();
        reg.lock().rejoin("r", "c1-new", "c1", "c1", tx);

        // Too late: c2 keeps the role, the returning client is a follower
        assert_eq!(current_master(&reg, "r").as_deref(), Some("c2"));
        assert_eq!(current_epoch(&reg, "r"), 2);
        assert!(reg.lock().rooms["r"].contains("c1-new"));
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_previous_id_is_not_honored() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let _rx2 = join(&reg, "r", "c2");
        reg.lock().disconnect(&reg, "c1");

        let (tx, _rx) = mpsc::unbounded_channel();
        reg.lock().rejoin("r", "impostor", "x", "not-c1", tx);

        // Ordinary join: grace still pending, no master restored
        assert_eq!(current_master(&reg, "r"), None);
        assert!(reg.lock().rooms["r"].grace_pending());
    }

    #[tokio::test]
    async fn transfer_requests_are_validated() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let _rx2 = join(&reg, "r", "c2");

        // Not the master
        reg.lock().transfer("r", "c2", "c2");
        assert_eq!(current_master(&reg, "r").as_deref(), Some("c1"));

        // Unknown target
        reg.lock().transfer("r", "c1", "ghost");
        assert_eq!(current_master(&reg, "r").as_deref(), Some("c1"));
        assert_eq!(current_epoch(&reg, "r"), 1);
    }

    #[tokio::test]
    async fn actions_are_forwarded_to_master_only() {
        let reg = new_registry();
        let mut rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        drain(&mut rx1);
        drain(&mut rx2);

        reg.lock().action("r", "c2", RemoteAction::Pause);

        let msgs = drain(&mut rx1);
        assert!(matches!(
            &msgs[0],
            ServerMessage::RemoteActionRequest { action: RemoteAction::Pause, requester_id } if requester_id == "c2"
        ));
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn actions_are_dropped_without_a_live_master() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        reg.lock().disconnect(&reg, "c1");
        drain(&mut rx2);

        // During the grace period there is no live master to forward to
        reg.lock().action("r", "c2", RemoteAction::Next);
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn room_is_destroyed_on_last_leave() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        reg.lock().leave("r", "c1");
        assert_eq!(reg.lock().active_rooms(), 0);

        // A later join gets a brand-new, empty room
        let mut rx = join(&reg, "r", "c2");
        let msgs = drain(&mut rx);
        assert!(matches!(
            &msgs[0],
            ServerMessage::SyncState { queue, master_epoch: 1, .. } if queue.is_empty()
        ));
    }

    #[tokio::test]
    async fn room_is_destroyed_when_lone_master_disconnects() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        reg.lock().disconnect(&reg, "c1");
        assert_eq!(reg.lock().active_rooms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_with_empty_roster_destroys_room() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let _rx2 = join(&reg, "r", "c2");

        reg.lock().disconnect(&reg, "c1");
        // The room must survive an empty roster while grace is pending
        reg.lock().leave("r", "c2");
        assert_eq!(reg.lock().active_rooms(), 1);

        tokio::time::sleep(GRACE_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(reg.lock().active_rooms(), 0);
    }

    #[tokio::test]
    async fn master_leave_elects_immediately_without_pause() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        drain(&mut rx2);

        reg.lock().leave("r", "c1");

        assert_eq!(current_master(&reg, "r").as_deref(), Some("c2"));
        assert_eq!(current_epoch(&reg, "r"), 2);
        let msgs = drain(&mut rx2);
        assert!(!msgs.iter().any(|m| matches!(m, ServerMessage::MasterPaused)));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::MasterUpdate { master_epoch: 2, .. })));
    }

    #[tokio::test]
    async fn epoch_change_resets_sequence() {
        let reg = new_registry();
        let _rx1 = join(&reg, "r", "c1");
        let mut rx2 = join(&reg, "r", "c2");
        reg.lock().publish("r", "c1", Some(1), published(1.0));
        reg.lock().publish("r", "c1", Some(1), published(2.0));
        assert_eq!(reg.lock().rooms["r"].sequence, 2);

        reg.lock().transfer("r", "c1", "c2");
        assert_eq!(reg.lock().rooms["r"].sequence, 0);
        drain(&mut rx2);

        reg.lock().publish("r", "c2", Some(2), published(3.0));
        assert_eq!(reg.lock().rooms["r"].sequence, 1);
    }
}
