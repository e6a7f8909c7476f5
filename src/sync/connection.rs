// Websocket connection management: the single socket, its lifecycle, and
// the reconnection policy. Only this component opens or closes the socket;
// everything else requests sends or queries state.

use anyhow::{anyhow, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::codec::{KEEPALIVE_PING, KEEPALIVE_PONG};
use super::error::SyncError;
use super::SubscriberHub;
use crate::auth::TokenProvider;
use crate::config::SyncConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Close codes with dedicated handling.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ABNORMAL: u16 = 1006;
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Synchronous snapshot of the connection for UI/diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub socket_ready: bool,
    pub attempts: u32,
}

/// Exponential backoff schedule: `base_delay * growth^(attempt-1)`, delay
/// capped, attempt count capped.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub growth: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = (self.growth.max(1) as u64).saturating_pow(exp);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as u64))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            growth: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

/// Owns the realtime socket. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ConnectionManager {
    server_url: String,
    tokens: Arc<dyn TokenProvider>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    send_grace: Duration,
    ping_timeout: Duration,
    state: Arc<StdMutex<ConnectionState>>,
    attempts: Arc<AtomicU32>,
    /// Distinguishes an intentional close from an abnormal one; suppresses
    /// every automatic-reconnect path while set.
    intentional: Arc<AtomicBool>,
    /// Bumped on every successful open so a stale reader cannot run the
    /// close path against a newer socket.
    generation: Arc<AtomicU64>,
    outbound: Arc<StdMutex<Option<mpsc::Sender<WsMessage>>>>,
    /// Frames queued while disconnected, best effort within the grace
    /// period. No durable outbound queue.
    pending: Arc<StdMutex<Vec<(String, Instant)>>>,
    inbound_tx: mpsc::Sender<String>,
    errors: SubscriberHub<SyncError>,
    heartbeat: Arc<StdMutex<Option<JoinHandle<()>>>>,
    reconnect_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
    io_tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    pong_waiters: Arc<StdMutex<Vec<oneshot::Sender<()>>>>,
}

impl ConnectionManager {
    pub fn new(
        config: &SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        inbound_tx: mpsc::Sender<String>,
        errors: SubscriberHub<SyncError>,
    ) -> Self {
        ConnectionManager {
            server_url: config.server_url.clone(),
            tokens,
            policy: config.reconnect,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            send_grace: config.send_grace,
            ping_timeout: config.ping_timeout,
            state: Arc::new(StdMutex::new(ConnectionState::Disconnected)),
            attempts: Arc::new(AtomicU32::new(0)),
            intentional: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            outbound: Arc::new(StdMutex::new(None)),
            pending: Arc::new(StdMutex::new(Vec::new())),
            inbound_tx,
            errors,
            heartbeat: Arc::new(StdMutex::new(None)),
            reconnect_task: Arc::new(StdMutex::new(None)),
            io_tasks: Arc::new(StdMutex::new(Vec::new())),
            pong_waiters: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Synchronous connection-state query.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: *self.state.lock().unwrap(),
            socket_ready: self.outbound.lock().unwrap().is_some(),
            attempts: self.attempts.load(Ordering::SeqCst),
        }
    }

    /// Open the socket. No-op when already connected or connecting.
    ///
    /// A missing token is fatal to the session: state returns to
    /// Disconnected, an Auth error is surfaced, and no retry is scheduled.
    /// Network failures and handshake timeouts go through the same
    /// close-handling path as a dropped connection.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }
        self.intentional.store(false, Ordering::SeqCst);

        let token = match self.tokens.token(true).await {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => {
                self.set_state(ConnectionState::Disconnected);
                let err = SyncError::Auth("no authenticated user".to_string());
                error!("{}", err);
                self.errors.notify(err.clone());
                return Err(err.into());
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                let err = SyncError::Auth(format!("token refresh failed: {}", e));
                error!("{}", err);
                self.errors.notify(err.clone());
                return Err(err.into());
            }
        };

        let uri = format!("{}?token={}", self.server_url, token);
        info!("Connecting to {}", self.server_url);

        match tokio::time::timeout(self.connect_timeout, connect_async(uri)).await {
            Ok(Ok((stream, _response))) => {
                self.on_open(stream).await;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Connection handshake failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect(format!("handshake failed: {}", e));
                Err(anyhow!("failed to connect: {}", e))
            }
            Err(_) => {
                warn!("Connection timed out after {:?}", self.connect_timeout);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect("connect timed out".to_string());
                Err(anyhow!(
                    "connection timed out after {:?}",
                    self.connect_timeout
                ))
            }
        }
    }

    async fn on_open(&self, stream: WsStream) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempts.store(0, Ordering::SeqCst);

        let (sink, read) = stream.split();
        let (out_tx, out_rx) = mpsc::channel::<WsMessage>(64);
        *self.outbound.lock().unwrap() = Some(out_tx);
        self.set_state(ConnectionState::Connected);
        info!("Connected to server");

        let writer = tokio::spawn(Self::write_loop(sink, out_rx));
        let this = self.clone();
        let reader = tokio::spawn(async move {
            this.read_loop(read, generation).await;
        });
        {
            let mut tasks = self.io_tasks.lock().unwrap();
            tasks.retain(|t| !t.is_finished());
            tasks.push(writer);
            tasks.push(reader);
        }

        self.start_heartbeat();
        self.flush_pending().await;
    }

    async fn write_loop(
        mut sink: SplitSink<WsStream, WsMessage>,
        mut out_rx: mpsc::Receiver<WsMessage>,
    ) {
        while let Some(msg) = out_rx.recv().await {
            let is_close = matches!(msg, WsMessage::Close(_));
            if let Err(e) = sink.send(msg).await {
                error!("Websocket send failed: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = sink.close().await;
        debug!("Writer task ended");
    }

    async fn read_loop(&self, mut read: SplitStream<WsStream>, generation: u64) {
        let (code, reason) = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if text == KEEPALIVE_PONG {
                        self.resolve_pong();
                        continue;
                    }
                    if text == KEEPALIVE_PING {
                        // Symmetric keepalive: answer the server in kind.
                        self.send_raw(WsMessage::Text(KEEPALIVE_PONG.to_string()))
                            .await;
                        continue;
                    }
                    if self.inbound_tx.send(text).await.is_err() {
                        debug!("Inbound channel closed; stopping reader");
                        break (CLOSE_ABNORMAL, "dispatch gone".to_string());
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    self.send_raw(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => self.resolve_pong(),
                Some(Ok(WsMessage::Binary(data))) => {
                    debug!("Ignoring {}-byte binary frame", data.len());
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame
                        .as_ref()
                        .map(|f| u16::from(f.code))
                        .unwrap_or(CLOSE_ABNORMAL);
                    let reason = frame
                        .map(|f| f.reason.into_owned())
                        .unwrap_or_else(|| "connection closed".to_string());
                    break (code, reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    // Socket errors are reported to observers; the close
                    // handling below drives any reconnect.
                    warn!("Websocket read error: {}", e);
                    break (CLOSE_ABNORMAL, format!("read error: {}", e));
                }
                None => break (CLOSE_ABNORMAL, "stream ended".to_string()),
            }
        };
        self.handle_close(generation, code, reason).await;
    }

    async fn send_raw(&self, msg: WsMessage) {
        let tx = self.outbound.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }

    /// Shared close path for server closes, read errors, and handshake
    /// timeouts. Classifies the close code and schedules reconnection for
    /// anything that is neither a normal closure nor an auth rejection.
    async fn handle_close(&self, generation: u64, code: u16, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring close from a stale connection");
            return;
        }
        self.stop_heartbeat();
        *self.outbound.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected);

        if self.intentional.load(Ordering::SeqCst) {
            info!("Connection closed intentionally");
            return;
        }

        match code {
            CLOSE_NORMAL => info!("Server closed normally; not reconnecting"),
            CLOSE_POLICY_VIOLATION => {
                let err = SyncError::Auth(format!("connection rejected by server: {}", reason));
                error!("{}", err);
                self.errors.notify(err);
            }
            other => {
                warn!("Abnormal close (code {}): {}", other, reason);
                self.schedule_reconnect(reason);
            }
        }
    }

    fn schedule_reconnect(&self, reason: String) {
        if self.intentional.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.policy.max_attempts {
            let err = SyncError::Connectivity {
                attempts: attempt - 1,
                reason,
            };
            error!("{}; giving up until an explicit connect", err);
            self.errors.notify(err);
            return;
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        let delay = self.policy.delay_for_attempt(attempt) + jitter;
        info!(
            "Scheduling reconnect attempt {}/{} in {:?}",
            attempt, self.policy.max_attempts, delay
        );

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.intentional.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = this.connect().await {
                warn!("Reconnect attempt failed: {}", e);
            }
        });
        if let Some(old) = self.reconnect_task.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Transmit a frame, or queue it for a short grace period while a
    /// connection is brought up. Queued frames are dropped on expiry,
    /// best effort.
    pub async fn send(&self, frame: String) -> Result<()> {
        let tx = self.outbound.lock().unwrap().clone();
        if let Some(tx) = tx {
            if tx.send(WsMessage::Text(frame)).await.is_ok() {
                return Ok(());
            }
            // Writer went away under us; fall through to the queue.
            return Err(anyhow!("connection lost while sending"));
        }

        debug!("Not connected; queueing frame and triggering connect");
        self.pending.lock().unwrap().push((frame, Instant::now()));
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.connect().await;
        });
        Ok(())
    }

    async fn flush_pending(&self) {
        let grace = self.send_grace;
        let (fresh, expired): (Vec<_>, Vec<_>) = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .drain(..)
                .partition(|(_, queued_at)| queued_at.elapsed() < grace)
        };
        if !expired.is_empty() {
            warn!("Dropping {} frames queued past the grace period", expired.len());
        }
        for (frame, _) in fresh {
            self.send_raw(WsMessage::Text(frame)).await;
        }
    }

    fn start_heartbeat(&self) {
        let interval = self.heartbeat_interval;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the open itself proves
            // liveness, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let tx = this.outbound.lock().unwrap().clone();
                match tx {
                    Some(tx) => {
                        if tx
                            .send(WsMessage::Text(KEEPALIVE_PING.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
            debug!("Heartbeat task ended");
        });
        if let Some(old) = self.heartbeat.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn resolve_pong(&self) {
        let waiters: Vec<_> = self.pong_waiters.lock().unwrap().drain(..).collect();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Round-trip a keepalive; true iff the pong arrives within the bounded
    /// timeout. Used by health checks and forced-repair flows.
    pub async fn test_connection(&self) -> bool {
        let tx = self.outbound.lock().unwrap().clone();
        let tx = match tx {
            Some(tx) => tx,
            None => return false,
        };

        let (pong_tx, pong_rx) = oneshot::channel();
        self.pong_waiters.lock().unwrap().push(pong_tx);

        if tx
            .send(WsMessage::Text(KEEPALIVE_PING.to_string()))
            .await
            .is_err()
        {
            return false;
        }

        matches!(
            tokio::time::timeout(self.ping_timeout, pong_rx).await,
            Ok(Ok(()))
        )
    }

    /// Repair path for a socket that still claims to be open but fails the
    /// keepalive round-trip: drop it and dial again without marking the
    /// close intentional.
    pub async fn force_repair(&self) -> Result<()> {
        warn!("Connection unresponsive; forcing repair");
        self.stop_heartbeat();
        let tx = self.outbound.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(WsMessage::Close(None)).await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.connect().await
    }

    /// Intentional close: suppresses every automatic-reconnect path and
    /// shuts the socket down cleanly.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from server");
        self.intentional.store(true, Ordering::SeqCst);

        if let Some(handle) = self.reconnect_task.lock().unwrap().take() {
            handle.abort();
        }
        self.stop_heartbeat();

        let tx = self.outbound.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(WsMessage::Close(None)).await;
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Abort every task this manager spawned. Called on session teardown.
    pub fn shutdown_tasks(&self) {
        if let Some(handle) = self.reconnect_task.lock().unwrap().take() {
            handle.abort();
        }
        self.stop_heartbeat();
        for task in self.io_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
