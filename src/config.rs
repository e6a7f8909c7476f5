// Engine configuration. Everything tunable lives here and is injected once
// at construction; components hold no module-level state.

use std::time::Duration;

use crate::sync::connection::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Websocket endpoint, e.g. `ws://chat.example.com/ws`. The bearer token
    /// is appended as a query parameter at connect time.
    pub server_url: String,
    /// How long to wait for the socket handshake before treating the attempt
    /// as a network failure.
    pub connect_timeout: Duration,
    /// Interval between keepalive frames while connected.
    pub heartbeat_interval: Duration,
    /// Backoff schedule for automatic reconnects.
    pub reconnect: ReconnectPolicy,
    /// How long a frame queued while disconnected stays eligible for
    /// transmission. Older frames are dropped, best effort.
    pub send_grace: Duration,
    /// Bound on the ping round-trip in `test_connection`.
    pub ping_timeout: Duration,
    /// Inactivity threshold before the local presence flips to Away.
    pub idle_threshold: Duration,
    /// Floor between two presence broadcasts, regardless of triggers.
    pub presence_min_interval: Duration,
    /// Forced presence refresh cadence even without a state change.
    pub presence_refresh_interval: Duration,
    /// Cadence of the connection-health probe that couples presence to the
    /// socket.
    pub health_check_interval: Duration,
    /// How long a remote typing indicator stays lit without a follow-up.
    pub typing_expiry: Duration,
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        SyncConfig {
            server_url: server_url.into(),
            ..SyncConfig::default()
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            server_url: "ws://localhost:8080/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            send_grace: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(3),
            idle_threshold: Duration::from_secs(5 * 60),
            presence_min_interval: Duration::from_secs(5),
            presence_refresh_interval: Duration::from_secs(45),
            health_check_interval: Duration::from_secs(30),
            typing_expiry: Duration::from_secs(10),
        }
    }
}
