//! Metrics tracking for the coordinator

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

pub type SharedMetrics = Arc<Mutex<Metrics>>;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq)]
#[allow(dead_code)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Relay,
    Room,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Relay => "RELAY",
            LogLevel::Room => "ROOM",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Listen port
    pub port: u16,

    /// Current number of connected clients
    pub connected_clients: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Currently active rooms
    pub active_rooms: usize,

    /// Total rooms created since start
    pub total_rooms: u64,

    /// State snapshots relayed to followers
    pub snapshots_relayed: u64,

    /// Remote actions forwarded to masters
    pub actions_relayed: u64,

    /// Publishes rejected (unauthorized or stale epoch)
    pub publishes_rejected: u64,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone, Copy, PartialEq)]
#[allow(dead_code)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            port: 3001,
            connected_clients: 0,
            total_connections: 0,
            peak_connections: 0,
            active_rooms: 0,
            total_rooms: 0,
            snapshots_relayed: 0,
            actions_relayed: 0,
            publishes_rejected: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a new client connection
    pub fn connection_established(&mut self, connection_id: &str) {
        self.connected_clients += 1;
        self.total_connections += 1;
        if self.connected_clients > self.peak_connections {
            self.peak_connections = self.connected_clients;
        }

        let short_id = truncate_id(connection_id);
        self.log(LogLevel::Connection, format!("Connected: {}", short_id));
    }

    /// Record a client disconnection
    pub fn connection_closed(&mut self, connection_id: &str) {
        self.connected_clients = self.connected_clients.saturating_sub(1);

        let short_id = truncate_id(connection_id);
        self.log(LogLevel::Connection, format!("Disconnected: {}", short_id));
    }

    pub fn room_created(&mut self, room_id: &str, active_rooms: usize) {
        self.total_rooms += 1;
        self.active_rooms = active_rooms;
        self.log(LogLevel::Room, format!("Room created: {}", room_id));
    }

    pub fn room_destroyed(&mut self, room_id: &str, active_rooms: usize) {
        self.active_rooms = active_rooms;
        self.log(LogLevel::Room, format!("Room destroyed: {}", room_id));
    }

    /// Record a snapshot relayed to `receivers` followers
    pub fn snapshot_relayed(&mut self, receivers: usize) {
        self.snapshots_relayed += receivers as u64;
    }

    pub fn action_relayed(&mut self) {
        self.actions_relayed += 1;
    }

    pub fn publish_rejected(&mut self) {
        self.publishes_rejected += 1;
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }

    /// Uptime in whole seconds, for the health endpoint
    pub fn uptime_secs(&self) -> i64 {
        Local::now()
            .signed_duration_since(self.start_time)
            .num_seconds()
    }
}

/// Truncate a connection id for display (show first and last few chars)
pub fn truncate_id(id: &str) -> String {
    if id.len() > 16 {
        format!("{}...{}", &id[..8], &id[id.len() - 4..])
    } else {
        id.to_string()
    }
}
