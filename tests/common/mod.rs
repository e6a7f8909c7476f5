// Common test utilities: logging setup, cache isolation, a fast client
// configuration, and an in-process mock websocket server that speaks the
// same frame protocol as a real chat server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use wavechat::auth::{NullAttachmentStore, StaticTokenProvider};
use wavechat::sync::ReconnectPolicy;
use wavechat::{ChatClient, SyncConfig};

pub fn setup_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static CACHE_GUARD: OnceCell<tempfile::TempDir> = OnceCell::new();

/// Point the session cache at a temp directory so tests never touch the
/// real user cache. First caller wins for the whole test binary.
pub fn isolate_cache() {
    let dir = CACHE_GUARD.get_or_init(|| tempfile::tempdir().expect("tempdir"));
    wavechat::cache::set_cache_path_override(dir.path().join("conversations.json"));
}

/// Engine configuration tuned for fast tests: short backoff, long periodic
/// timers so they stay out of the way.
pub fn test_config(server_url: &str) -> SyncConfig {
    let mut config = SyncConfig::new(server_url);
    config.connect_timeout = Duration::from_secs(2);
    config.heartbeat_interval = Duration::from_secs(60);
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        growth: 2,
        max_delay: Duration::from_secs(1),
        max_attempts: 3,
    };
    config.send_grace = Duration::from_secs(2);
    config.ping_timeout = Duration::from_secs(1);
    config.presence_min_interval = Duration::from_millis(10);
    config.health_check_interval = Duration::from_secs(60);
    config
}

pub fn make_client(server_url: &str) -> ChatClient {
    make_client_as("me", server_url)
}

pub fn make_client_as(user: &str, server_url: &str) -> ChatClient {
    isolate_cache();
    ChatClient::new(
        user,
        test_config(server_url),
        Arc::new(StaticTokenProvider::new("test-token")),
        Arc::new(NullAttachmentStore),
    )
}

enum ServerCmd {
    Send(String),
    Close(u16),
}

/// In-process websocket server. Accepts any number of sequential client
/// connections, answers "ping" keepalives with "pong", records every other
/// text frame, and follows push/close commands from the test body.
pub struct MockServer {
    pub url: String,
    frames_rx: mpsc::Receiver<String>,
    cmd_tx: mpsc::Sender<ServerCmd>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Frames the server has received, next one within `timeout`.
    pub async fn recv_frame(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.frames_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next frame of the given wire type, skipping others.
    pub async fn recv_frame_of_type(
        &mut self,
        kind: &str,
        timeout: Duration,
    ) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())?;
            let raw = self.recv_frame(remaining).await?;
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                if value.get("type").and_then(|v| v.as_str()) == Some(kind) {
                    return Some(value);
                }
            }
        }
    }

    /// Push a frame to the currently connected client.
    pub async fn push(&self, frame: impl Into<String>) {
        let _ = self.cmd_tx.send(ServerCmd::Send(frame.into())).await;
    }

    /// Close the current connection with the given close code.
    pub async fn close_with(&self, code: u16) {
        let _ = self.cmd_tx.send(ServerCmd::Close(code)).await;
    }

    /// How many connections the server has accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub async fn spawn_mock_server() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    // The client opens "{server_url}?token={token}" (see SPEC_FULL), so the
    // advertised URL must carry a path or the request-target ends up as a
    // bare "?token=..." that no HTTP parser will accept. Real servers expose
    // a path; give the mock one too.
    let url = format!("ws://{}/ws", addr);

    let (frames_tx, frames_rx) = mpsc::channel::<String>(100);
    let (cmd_tx, cmd_rx) = mpsc::channel::<ServerCmd>(100);
    let cmd_rx = Arc::new(TokioMutex::new(cmd_rx));
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = connections.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            let (mut write, mut read) = ws.split();

            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if text == "ping" {
                                let _ = write.send(WsMessage::Text("pong".to_string())).await;
                                continue;
                            }
                            if frames_tx.send(text).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = write.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    },
                    cmd = async { cmd_rx.lock().await.recv().await } => match cmd {
                        Some(ServerCmd::Send(text)) => {
                            let _ = write.send(WsMessage::Text(text)).await;
                        }
                        Some(ServerCmd::Close(code)) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            };
                            let _ = write.send(WsMessage::Close(Some(frame))).await;
                            break;
                        }
                        None => return,
                    }
                }
            }
        }
    });

    MockServer {
        url,
        frames_rx,
        cmd_tx,
        connections,
    }
}
