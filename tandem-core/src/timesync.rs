//! Clock synchronization with the coordinator
//!
//! Estimates the offset between the local clock and the coordinator's clock,
//! plus round-trip time, without assuming synchronized clocks. The client
//! sends a short burst of probes carrying its local send time; the
//! coordinator echoes each back together with its own time. Per probe:
//!
//!   roundTrip = receiveTime - sendTime
//!   offset    = serverTime - sendTime - roundTrip / 2
//!
//! The estimate is the median across the batch so a single delayed probe
//! cannot skew it. Lost probes are simply excluded.

use std::collections::HashMap;
use std::time::Duration;

/// Number of probes per synchronization cycle
pub const PROBE_COUNT: usize = 5;

/// Spacing between probes within a cycle
pub const PROBE_SPACING: Duration = Duration::from_millis(50);

/// Extra time to wait for stragglers after the last probe is sent
pub const CYCLE_TIMEOUT: Duration = Duration::from_secs(2);

/// How often to re-run the cycle while in a room
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Estimated relation between the coordinator clock and the local clock
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockEstimate {
    /// serviceTime - clientTime, in milliseconds
    pub offset_ms: i64,
    /// Round-trip latency to the coordinator, in milliseconds
    pub rtt_ms: u64,
}

impl ClockEstimate {
    /// Approximate current coordinator time given a local wall time (ms)
    pub fn adjusted_now_ms(&self, local_now_ms: u64) -> i64 {
        local_now_ms as i64 + self.offset_ms
    }
}

/// Collects probe responses for one synchronization cycle
#[derive(Debug, Default)]
pub struct ClockSampler {
    /// Outstanding probes keyed by sample index, holding the send time
    pending: HashMap<u32, u64>,
    offsets: Vec<i64>,
    rtts: Vec<u64>,
    next_index: u32,
}

impl ClockSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh cycle, dropping any unanswered probes from the last one
    pub fn begin_cycle(&mut self) {
        self.pending.clear();
        self.offsets.clear();
        self.rtts.clear();
    }

    /// Register an outgoing probe. Returns the sample index to send with it.
    pub fn next_probe(&mut self, client_time_ms: u64) -> u32 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.pending.insert(index, client_time_ms);
        index
    }

    /// Record an echoed probe. Returns false for unknown or mismatched
    /// responses, which are ignored.
    pub fn record_response(
        &mut self,
        client_time_ms: u64,
        server_time_ms: u64,
        sample_index: u32,
        receive_time_ms: u64,
    ) -> bool {
        match self.pending.remove(&sample_index) {
            Some(sent) if sent == client_time_ms => {}
            _ => return false,
        }

        let round_trip = receive_time_ms.saturating_sub(client_time_ms);
        let offset = server_time_ms as i64 - client_time_ms as i64 - (round_trip / 2) as i64;

        self.offsets.push(offset);
        self.rtts.push(round_trip);

        tracing::debug!(
            "Clock probe {}: rtt={}ms offset={}ms ({} samples)",
            sample_index,
            round_trip,
            offset,
            self.offsets.len()
        );
        true
    }

    /// Number of responses collected so far in this cycle
    pub fn sample_count(&self) -> usize {
        self.offsets.len()
    }

    /// Close the cycle and produce the median estimate, if any probe made it
    /// back. Clears collected samples either way.
    pub fn finalize(&mut self) -> Option<ClockEstimate> {
        self.pending.clear();
        if self.offsets.is_empty() {
            self.rtts.clear();
            return None;
        }

        let estimate = ClockEstimate {
            offset_ms: median_i64(&mut self.offsets),
            rtt_ms: median_u64(&mut self.rtts),
        };
        self.offsets.clear();
        self.rtts.clear();

        tracing::debug!(
            "Clock estimate: offset={}ms rtt={}ms",
            estimate.offset_ms,
            estimate.rtt_ms
        );
        Some(estimate)
    }
}

fn median_i64(samples: &mut [i64]) -> i64 {
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2
    } else {
        samples[mid]
    }
}

fn median_u64(samples: &mut [u64]) -> u64 {
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2
    } else {
        samples[mid]
    }
}
