//! End-to-end tests driving the real server over WebSocket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tandem_coordinator::metrics::Metrics;
use tandem_coordinator::registry::Registry;
use tandem_coordinator::server::{build_router, AppState};
use tandem_core::protocol::{
    ClientMessage, PlaybackSnapshot, PublishedState, RemoteAction, ServerMessage, SnapshotSource,
    Song,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_coordinator() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let metrics = Arc::new(Mutex::new(Metrics::new()));
    let registry = Arc::new(Mutex::new(Registry::new(Arc::clone(&metrics))));
    let app = build_router(AppState { registry, metrics });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, server)
}

/// Connect and consume the welcome message
async fn connect(addr: SocketAddr) -> (WsClient, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Welcome { connection_id, .. } => (ws, connection_id),
        other => panic!("expected welcome, got {:?}", other),
    }
}

async fn recv(ws: &mut WsClient) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("unparsable server message");
        }
    }
}

/// Receive, skipping messages until the predicate matches
async fn recv_until<F>(ws: &mut WsClient, pred: F) -> ServerMessage
where
    F: Fn(&ServerMessage) -> bool,
{
    for _ in 0..20 {
        let msg = recv(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
    panic!("expected message never arrived");
}

async fn send(ws: &mut WsClient, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

fn join(room_id: &str, display_name: &str) -> ClientMessage {
    ClientMessage::JoinRoom {
        room_id: room_id.to_string(),
        display_name: display_name.to_string(),
    }
}

fn published(position: f64, song_name: &str) -> PublishedState {
    let song = Song {
        id: "song-1".to_string(),
        catalog_id: None,
        name: song_name.to_string(),
        artist_name: "Artist".to_string(),
        album_name: "Album".to_string(),
        duration_ms: 180_000,
        artwork_url: None,
    };
    PublishedState {
        queue: vec![song.clone()],
        history: Vec::new(),
        playback: PlaybackSnapshot {
            is_playing: true,
            current_song: Some(song),
            position,
            source: SnapshotSource::Master,
            sequence: 0,
            last_seek_timestamp: 0,
            last_update_server_time: 0,
        },
    }
}

#[tokio::test]
async fn health_reports_active_rooms() {
    let (addr, server) = spawn_coordinator().await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    let body: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["activeRooms"], 0);

    let (mut ws, _) = connect(addr).await;
    send(&mut ws, &join("lobby", "Ada")).await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    let body: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["activeRooms"], 1);

    send(&mut ws, &ClientMessage::LeaveRoom {
        room_id: "lobby".to_string(),
    })
    .await;
    // The leave processes before the response to the next request we make
    send(&mut ws, &ClientMessage::TimeSyncRequest {
        client_time: 1,
        sample_index: 0,
    })
    .await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::TimeSyncResponse { .. })).await;

    let body: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["activeRooms"], 0, "empty room must be destroyed");

    server.abort();
}

#[tokio::test]
async fn join_elects_master_and_pushes_state() {
    let (addr, server) = spawn_coordinator().await;

    let (mut master, master_id) = connect(addr).await;
    send(&mut master, &join("r", "Ada")).await;

    let state = recv_until(&mut master, |m| matches!(m, ServerMessage::SyncState { .. })).await;
    let ServerMessage::SyncState {
        master_id: room_master,
        master_epoch,
        users,
        ..
    } = state
    else {
        unreachable!()
    };
    assert_eq!(room_master.as_deref(), Some(master_id.as_str()));
    assert_eq!(master_epoch, 1);
    assert_eq!(users.len(), 1);

    let (mut follower, follower_id) = connect(addr).await;
    send(&mut follower, &join("r", "Grace")).await;

    let state = recv_until(&mut follower, |m| matches!(m, ServerMessage::SyncState { .. })).await;
    let ServerMessage::SyncState {
        master_id: room_master,
        users,
        ..
    } = state
    else {
        unreachable!()
    };
    assert_eq!(
        room_master.as_deref(),
        Some(master_id.as_str()),
        "joining an owned room must not steal the master role"
    );
    assert_ne!(master_id, follower_id);
    assert_eq!(users.len(), 2);

    server.abort();
}

#[tokio::test]
async fn publishes_are_stamped_relayed_and_fenced() {
    let (addr, server) = spawn_coordinator().await;

    let (mut master, _) = connect(addr).await;
    send(&mut master, &join("r", "Ada")).await;
    recv_until(&mut master, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    let (mut follower, _) = connect(addr).await;
    send(&mut follower, &join("r", "Grace")).await;
    recv_until(&mut follower, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    // Master publish reaches the follower, stamped with sequence 1
    send(&mut master, &ClientMessage::MasterStateUpdate {
        room_id: "r".to_string(),
        epoch: Some(1),
        state: published(12.5, "First"),
    })
    .await;

    let relayed = recv_until(&mut follower, |m| {
        matches!(m, ServerMessage::SyncState { playback, .. } if playback.sequence > 0)
    })
    .await;
    let ServerMessage::SyncState { playback, .. } = relayed else {
        unreachable!()
    };
    assert_eq!(playback.sequence, 1);
    assert_eq!(playback.position, 12.5);
    assert!(playback.last_update_server_time > 0, "server time must be stamped");

    // A follower publish is silently dropped and does not advance anything
    send(&mut follower, &ClientMessage::MasterStateUpdate {
        room_id: "r".to_string(),
        epoch: Some(1),
        state: published(99.0, "Spoofed"),
    })
    .await;

    // A stale-epoch publish from the master is fenced off too
    send(&mut master, &ClientMessage::MasterStateUpdate {
        room_id: "r".to_string(),
        epoch: Some(0),
        state: published(50.0, "Stale"),
    })
    .await;

    // The next accepted publish carries sequence 2: nothing in between landed
    send(&mut master, &ClientMessage::MasterStateUpdate {
        room_id: "r".to_string(),
        epoch: Some(1),
        state: published(14.0, "Second"),
    })
    .await;

    let relayed = recv_until(&mut follower, |m| {
        matches!(m, ServerMessage::SyncState { playback, .. } if playback.sequence > 1)
    })
    .await;
    let ServerMessage::SyncState { playback, .. } = relayed else {
        unreachable!()
    };
    assert_eq!(playback.sequence, 2);
    assert_eq!(playback.position, 14.0);

    // The publisher never hears its own echo: everything queued for it up to
    // the probe response may be roster noise, but never a sync_state
    send(&mut master, &ClientMessage::TimeSyncRequest {
        client_time: 42,
        sample_index: 0,
    })
    .await;
    loop {
        match recv(&mut master).await {
            ServerMessage::TimeSyncResponse { client_time: 42, .. } => break,
            ServerMessage::SyncState { .. } => panic!("publisher received its own echo"),
            _ => continue,
        }
    }

    server.abort();
}

#[tokio::test]
async fn remote_actions_reach_the_master_only() {
    let (addr, server) = spawn_coordinator().await;

    let (mut master, _) = connect(addr).await;
    send(&mut master, &join("r", "Ada")).await;
    recv_until(&mut master, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    let (mut follower, follower_id) = connect(addr).await;
    send(&mut follower, &join("r", "Grace")).await;
    recv_until(&mut follower, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    send(&mut follower, &ClientMessage::RemoteAction {
        room_id: "r".to_string(),
        action: RemoteAction::Seek { position: 33.0 },
    })
    .await;

    let forwarded = recv_until(&mut master, |m| {
        matches!(m, ServerMessage::RemoteActionRequest { .. })
    })
    .await;
    let ServerMessage::RemoteActionRequest {
        action,
        requester_id,
    } = forwarded
    else {
        unreachable!()
    };
    assert_eq!(action, RemoteAction::Seek { position: 33.0 });
    assert_eq!(requester_id, follower_id);

    server.abort();
}

#[tokio::test]
async fn clock_probes_are_echoed_with_server_time() {
    let (addr, server) = spawn_coordinator().await;
    let (mut ws, _) = connect(addr).await;

    send(&mut ws, &ClientMessage::TimeSyncRequest {
        client_time: 123_456,
        sample_index: 3,
    })
    .await;

    let response = recv(&mut ws).await;
    let ServerMessage::TimeSyncResponse {
        client_time,
        server_time,
        sample_index,
    } = response
    else {
        panic!("expected time sync response, got {:?}", response);
    };
    assert_eq!(client_time, 123_456);
    assert_eq!(sample_index, 3);
    assert!(server_time > 0);

    server.abort();
}

#[tokio::test]
async fn master_transfer_bumps_epoch_for_everyone() {
    let (addr, server) = spawn_coordinator().await;

    let (mut master, _) = connect(addr).await;
    send(&mut master, &join("r", "Ada")).await;
    recv_until(&mut master, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    let (mut follower, follower_id) = connect(addr).await;
    send(&mut follower, &join("r", "Grace")).await;
    recv_until(&mut follower, |m| matches!(m, ServerMessage::SyncState { .. })).await;

    send(&mut master, &ClientMessage::TransferMaster {
        room_id: "r".to_string(),
        target_connection_id: follower_id.clone(),
    })
    .await;

    for ws in [&mut master, &mut follower] {
        let update = recv_until(ws, |m| {
            matches!(m, ServerMessage::MasterUpdate { master_epoch: 2, .. })
        })
        .await;
        let ServerMessage::MasterUpdate { master_id, .. } = update else {
            unreachable!()
        };
        assert_eq!(master_id.as_deref(), Some(follower_id.as_str()));
    }

    server.abort();
}
