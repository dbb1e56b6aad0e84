//! WebSocket endpoint and connection handling
//!
//! One axum route upgrades to WebSocket; each connection gets a writer task
//! fed by an unbounded outbox channel, and its reader dispatches messages
//! into the registry. Clock probes are answered directly on the connection,
//! everything room-scoped goes through the registry lock.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_core::protocol::{current_time_ms, ClientMessage, ServerMessage};

use crate::metrics::{LogLevel, ServerStatus, SharedMetrics};
use crate::registry::{Outbox, Registry, SharedRegistry};

/// Default listen port
pub const DEFAULT_PORT: u16 = 3001;

/// Shared handles for the request handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub metrics: SharedMetrics,
}

/// Events sent from the server to the dashboard
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServerEvent {
    Ready { addr: SocketAddr },
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Process liveness plus the active-room count
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active_rooms = state.registry.lock().active_rooms();
    let uptime_secs = state.metrics.lock().uptime_secs();

    Json(json!({
        "status": "healthy",
        "uptimeSecs": uptime_secs,
        "activeRooms": active_rooms,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    state.metrics.lock().connection_established(&connection_id);
    info!("Client connected: {}", connection_id);

    let (mut sink, mut source) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Writer task: drains this connection's outbox
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
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

    let _ = outbox.send(ServerMessage::Welcome {
        connection_id: connection_id.clone(),
        server_time: current_time_ms(),
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => dispatch(&state, &connection_id, &outbox, msg),
                Err(e) => {
                    debug!("Ignoring unparsable message from {}: {}", connection_id, e)
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Transport gone: the registry decides whether a grace period opens
    state
        .registry
        .lock()
        .disconnect(&state.registry, &connection_id);
    state.metrics.lock().connection_closed(&connection_id);
    writer.abort();
    info!("Client disconnected: {}", connection_id);
}

/// Route one client message. Room-scoped events serialize on the registry
/// lock; clock probes are answered straight from the connection.
fn dispatch(state: &AppState, connection_id: &str, outbox: &Outbox, msg: ClientMessage) {
    match msg {
        ClientMessage::JoinRoom {
            room_id,
            display_name,
        } => {
            state
                .registry
                .lock()
                .join(&room_id, connection_id, &display_name, outbox.clone());
        }

        ClientMessage::RejoinRoom {
            room_id,
            display_name,
            previous_connection_id,
        } => {
            state.registry.lock().rejoin(
                &room_id,
                connection_id,
                &display_name,
                &previous_connection_id,
                outbox.clone(),
            );
        }

        ClientMessage::TransferMaster {
            room_id,
            target_connection_id,
        } => {
            state
                .registry
                .lock()
                .transfer(&room_id, connection_id, &target_connection_id);
        }

        ClientMessage::MasterStateUpdate {
            room_id,
            epoch,
            state: published,
        } => {
            state
                .registry
                .lock()
                .publish(&room_id, connection_id, epoch, published);
        }

        ClientMessage::RemoteAction { room_id, action } => {
            state
                .registry
                .lock()
                .action(&room_id, connection_id, action);
        }

        ClientMessage::LeaveRoom { room_id } => {
            state.registry.lock().leave(&room_id, connection_id);
        }

        ClientMessage::TimeSyncRequest {
            client_time,
            sample_index,
        } => {
            let _ = outbox.send(ServerMessage::TimeSyncResponse {
                client_time,
                server_time: current_time_ms(),
                sample_index,
            });
        }

        ClientMessage::TimeSyncReport { offset, rtt } => {
            // Informational only, kept for diagnostics
            debug!(
                "Clock report from {}: offset {}ms, rtt {}ms",
                connection_id, offset, rtt
            );
            state.metrics.lock().log(
                LogLevel::Info,
                format!(
                    "Clock report: offset {}ms rtt {}ms ({})",
                    offset,
                    rtt,
                    crate::metrics::truncate_id(connection_id)
                ),
            );
        }
    }
}

/// Resolve the listen port from the environment
pub fn listen_port() -> u16 {
    std::env::var("TANDEM_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Run the server with dashboard integration
pub async fn run_with_dashboard(
    metrics: SharedMetrics,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let port = listen_port();
    metrics.lock().port = port;

    let registry = Arc::new(Mutex::new(Registry::new(Arc::clone(&metrics))));
    let state = AppState {
        registry,
        metrics: Arc::clone(&metrics),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;

    {
        let mut m = metrics.lock();
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on {}", addr));
    }
    let _ = event_tx.send(ServerEvent::Ready { addr });
    info!("Coordinator listening on {}", addr);

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(
    metrics: SharedMetrics,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tandem_coordinator=info".parse()?)
                .add_directive("tandem_core=info".parse()?),
        )
        .init();

    let (tx, _rx) = mpsc::unbounded_channel();
    run_with_dashboard(metrics, tx).await
}
