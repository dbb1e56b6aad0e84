//! Drift reconciliation for followers
//!
//! Consumes master snapshots plus the clock estimate, computes the position
//! the local player should be at, and decides whether to issue a corrective
//! seek. Corrections go through hysteresis: small drift is jitter and is left
//! alone, medium drift is corrected at a throttled rate, large drift and
//! confirmed new master seeks are corrected immediately. The follower's own
//! manual seek opens a suppression window so the next few stale snapshots
//! cannot immediately undo it.

use std::time::{Duration, Instant};

use crate::protocol::{PlaybackSnapshot, Song};
use crate::timesync::ClockEstimate;

/// Drift at or below this is normal jitter and never corrected
pub const IGNORE_DRIFT_SECS: f64 = 0.150;

/// Drift above this is corrected immediately, bypassing the throttle
pub const HARD_DRIFT_SECS: f64 = 0.500;

/// Minimum spacing between throttled corrective seeks
pub const SEEK_THROTTLE: Duration = Duration::from_millis(1500);

/// How long a local manual seek suppresses inbound corrections
pub const LOCAL_SEEK_SUPPRESSION: Duration = Duration::from_millis(8500);

/// Per-song debounce while the player loads a newly requested song
pub const SONG_LOAD_DEBOUNCE: Duration = Duration::from_secs(5);

/// Locally observed playback, sampled from the player just before evaluating
#[derive(Debug, Clone, Default)]
pub struct LocalPlayback {
    /// Identity of the song the local player has loaded, if any
    pub song_identity: Option<String>,
    /// Local position in seconds
    pub position: f64,
    pub is_playing: bool,
}

/// What a follower should do in response to one snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Snapshot is not newer than the last accepted (epoch, sequence)
    Stale,
    /// Inside the local-seek suppression window, no confirmed new master seek
    Suppressed,
    /// Apply the contained corrections (possibly none)
    Apply(ReconcilePlan),
}

/// Corrections to apply against the local player
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Start or stop local playback to match the master
    pub set_playing: Option<bool>,
    /// Load this song on the local player (position will settle on a later
    /// snapshot once the load completes)
    pub load_song: Option<Song>,
    /// Corrective seek target in seconds
    pub seek_to: Option<f64>,
    /// Signed drift in seconds (local - expected), when it was computed
    pub drift: Option<f64>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.set_playing.is_none() && self.load_song.is_none() && self.seek_to.is_none()
    }
}

/// Per-room reconciliation state for one follower connection
#[derive(Debug, Default)]
pub struct DriftReconciler {
    /// Last accepted (epoch, sequence); None until the first snapshot after
    /// a join/rejoin re-baselines us
    last_accepted: Option<(u64, u64)>,
    /// Last master seek token we have reacted to
    last_seek_token: u64,
    /// When we last issued a throttled corrective seek
    last_correction: Option<Instant>,
    /// When the user last sought the local player by hand
    last_local_seek: Option<Instant>,
    /// Most recent song load we requested: (identity, when)
    last_song_load: Option<(String, Instant)>,
}

impl DriftReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all state; the next snapshot re-baselines from scratch
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a manual seek made against the local player
    pub fn note_local_seek(&mut self, now: Instant) {
        self.last_local_seek = Some(now);
    }

    /// Coordinator time implied by the snapshot, continued to "now"
    pub fn expected_position(
        snapshot: &PlaybackSnapshot,
        clock: &ClockEstimate,
        local_now_ms: u64,
    ) -> f64 {
        if !snapshot.is_playing {
            return snapshot.position;
        }
        let now_adjusted = clock.adjusted_now_ms(local_now_ms);
        let elapsed_ms = now_adjusted - snapshot.last_update_server_time as i64;
        // One-way latency of the corrective command we are about to issue
        let latency_comp = clock.rtt_ms as f64 / 2000.0;
        snapshot.position + elapsed_ms as f64 / 1000.0 + latency_comp
    }

    /// Evaluate one snapshot against the local player state.
    ///
    /// `epoch` is the room's master epoch the snapshot arrived under,
    /// `local_now_ms` the local wall clock, `now` a monotonic reference for
    /// throttle and suppression windows.
    pub fn evaluate(
        &mut self,
        epoch: u64,
        snapshot: &PlaybackSnapshot,
        local: &LocalPlayback,
        clock: &ClockEstimate,
        local_now_ms: u64,
        now: Instant,
    ) -> Reconciliation {
        if !self.accept(epoch, snapshot.sequence) {
            return Reconciliation::Stale;
        }

        let new_master_seek = self.observe_seek_token(snapshot.last_seek_timestamp);

        if self.local_seek_suppressed(now) && !new_master_seek {
            return Reconciliation::Suppressed;
        }

        let mut plan = ReconcilePlan::default();
        let loading = self.load_settling(now);

        // Transport state first; held back while a requested load settles
        if !loading && local.is_playing != snapshot.is_playing {
            plan.set_playing = Some(snapshot.is_playing);
        }

        let Some(song) = &snapshot.current_song else {
            return Reconciliation::Apply(plan);
        };

        let songs_match = local
            .song_identity
            .as_deref()
            .map(|id| id == song.identity())
            .unwrap_or(false);

        if !songs_match {
            if self.should_load_song(song.identity(), now) {
                plan.load_song = Some(song.clone());
            }
            // Position corrections wait until the right song is playing
            return Reconciliation::Apply(plan);
        }

        let expected = Self::expected_position(snapshot, clock, local_now_ms);
        let drift = local.position - expected;
        plan.drift = Some(drift);

        let correct = if new_master_seek || drift.abs() > HARD_DRIFT_SECS {
            true
        } else if drift.abs() > IGNORE_DRIFT_SECS {
            self.throttle_allows(now)
        } else {
            false
        };

        if correct {
            self.last_correction = Some(now);
            plan.seek_to = Some(expected);
        }

        Reconciliation::Apply(plan)
    }

    /// Staleness gate on the (epoch, sequence) pair. Accepting updates the
    /// baseline; epoch changes re-baseline the sequence.
    fn accept(&mut self, epoch: u64, sequence: u64) -> bool {
        let newer = match self.last_accepted {
            None => true,
            Some((last_epoch, last_seq)) => {
                epoch > last_epoch || (epoch == last_epoch && sequence > last_seq)
            }
        };
        if newer {
            self.last_accepted = Some((epoch, sequence));
        }
        newer
    }

    /// Returns true when the snapshot carries a seek token we have not seen,
    /// i.e. a confirmed new manual seek by the master.
    fn observe_seek_token(&mut self, token: u64) -> bool {
        if token == 0 || token == self.last_seek_token {
            return false;
        }
        self.last_seek_token = token;
        true
    }

    fn local_seek_suppressed(&self, now: Instant) -> bool {
        self.last_local_seek
            .map(|at| now.duration_since(at) < LOCAL_SEEK_SUPPRESSION)
            .unwrap_or(false)
    }

    fn throttle_allows(&self, now: Instant) -> bool {
        self.last_correction
            .map(|at| now.duration_since(at) >= SEEK_THROTTLE)
            .unwrap_or(true)
    }

    /// True while a recently requested song load may still be settling
    fn load_settling(&self, now: Instant) -> bool {
        self.last_song_load
            .as_ref()
            .map(|(_, at)| now.duration_since(*at) < SONG_LOAD_DEBOUNCE)
            .unwrap_or(false)
    }

    /// Debounced per song identity: a second load request for the same song
    /// inside the window is dropped while the player catches up.
    fn should_load_song(&mut self, identity: &str, now: Instant) -> bool {
        if let Some((last_identity, at)) = &self.last_song_load {
            if last_identity == identity && now.duration_since(*at) < SONG_LOAD_DEBOUNCE {
                return false;
            }
        }
        self.last_song_load = Some((identity.to_string(), now));
        true
    }
}
