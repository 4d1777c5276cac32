//! Connection lifecycle: transport seam, retry with backoff, and the
//! bounded outbound queue.
//!
//! Connection flow:
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │ err               │ stream ends
//!      │                        ▼                   ▼
//!      └──disconnect──────── Failed ◀──limit── Reconnecting
//! ```
//!
//! The session task owns the `ConnectionManager`; nothing here spawns
//! a retry loop of its own. `connect_with_retry` is a plain future so
//! the caller can race it against shutdown and cancel it mid-backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::protocol::{CollabError, WireMessage};

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

// ─── Backoff ────────────────────────────────────────────────────────────────

/// Exponential backoff parameters for reconnection attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Stateful delay generator. `reset` after a successful connect so the
/// next outage starts from the initial delay again.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay to wait before the next attempt, with jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .config
            .initial_delay_ms
            .saturating_mul(self.config.multiplier.powi(self.attempt as i32) as u64)
            .min(self.config.max_delay_ms);
        self.attempt += 1;

        let jitter_range = (exp as f64 * self.config.jitter_factor) as i64;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(exp.saturating_add_signed(jitter))
    }
}

// ─── Outbound queue ─────────────────────────────────────────────────────────

/// Default buffered-message bound while disconnected.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Messages buffered while the transport is down, drained on reconnect.
///
/// When the bound is hit, the oldest coalescable (cursor) entry is
/// evicted to make room. Presence and leave frames are never dropped:
/// if no cursor entry exists and the incoming frame is itself a cursor,
/// the incoming frame is dropped instead; a non-coalescable frame is
/// always accepted, even past the bound.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: Vec<WireMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Buffer a message. Returns `false` if the message was dropped.
    pub fn push(&mut self, msg: WireMessage) -> bool {
        if self.messages.len() >= self.capacity {
            if let Some(idx) = self.messages.iter().position(WireMessage::is_coalescable) {
                self.messages.remove(idx);
            } else if msg.is_coalescable() {
                return false;
            }
            // No cursor entries to evict: a presence or leave frame is
            // still accepted past the bound rather than lost.
        }
        self.messages.push(msg);
        true
    }

    /// Remove all buffered messages, in insertion order.
    pub fn drain(&mut self) -> Vec<WireMessage> {
        std::mem::take(&mut self.messages)
    }
}

// ─── Transport seam ─────────────────────────────────────────────────────────

/// Channel pair handed back by a successful connect. The transport owns
/// the socket tasks; the session only sees framed bytes.
pub struct TransportConn {
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// Connection factory. Implemented by the WebSocket transport in
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> Result<TransportConn, CollabError>;
}

/// Connect with retry. Makes up to `retry_limit + 1` attempts, sleeping
/// the backoff delay between failures, and invokes `on_attempt_error`
/// once per failed attempt.
pub async fn connect_with_retry<F>(
    transport: Arc<dyn Transport>,
    workspace_id: Uuid,
    user_id: Uuid,
    config: ConnectionConfig,
    mut on_attempt_error: F,
) -> Result<TransportConn, CollabError>
where
    F: FnMut(&CollabError) + Send,
{
    let mut backoff = ExponentialBackoff::new(config.backoff.clone());

    loop {
        match transport.connect(workspace_id, user_id).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                log::warn!(
                    "connect attempt {} to workspace {workspace_id} failed: {e}",
                    backoff.attempt() + 1
                );
                on_attempt_error(&e);

                if backoff.attempt() >= config.retry_limit {
                    return Err(e);
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

// ─── Connection manager ─────────────────────────────────────────────────────

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Retries after the first failed attempt. The default of 1 means
    /// two attempts total before giving up.
    pub retry_limit: u32,
    pub backoff: BackoffConfig,
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_limit: 1,
            backoff: BackoffConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Owns the transport handle, connection state, and the offline queue.
///
/// Single-owner by construction: lives inside the session task, so state
/// transitions never race.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    workspace_id: Uuid,
    user_id: Uuid,
    config: ConnectionConfig,
    state: ConnectionState,
    queue: OutboundQueue,
    conn: Option<mpsc::Sender<Vec<u8>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        workspace_id: Uuid,
        user_id: Uuid,
        config: ConnectionConfig,
    ) -> Self {
        let queue = OutboundQueue::new(config.queue_capacity);
        Self {
            transport,
            workspace_id,
            user_id,
            config,
            state: ConnectionState::Disconnected,
            queue,
            conn: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start a connect-with-retry future. The caller races it against
    /// other session events; dropping it cancels any in-flight backoff.
    pub fn begin_connect(
        &mut self,
        on_attempt_error: Arc<dyn Fn(&CollabError) + Send + Sync>,
    ) -> Pin<Box<dyn Future<Output = Result<TransportConn, CollabError>> + Send>> {
        if self.state != ConnectionState::Reconnecting {
            self.state = ConnectionState::Connecting;
        }
        let transport = Arc::clone(&self.transport);
        let workspace_id = self.workspace_id;
        let user_id = self.user_id;
        let config = self.config.clone();
        Box::pin(connect_with_retry(
            transport,
            workspace_id,
            user_id,
            config,
            move |e| on_attempt_error(e),
        ))
    }

    /// Adopt the outbound half of a fresh connection.
    pub fn attach(&mut self, outbound: mpsc::Sender<Vec<u8>>) {
        self.conn = Some(outbound);
        self.state = ConnectionState::Connected;
    }

    /// The transport stream ended; hold messages until reconnect.
    pub fn detach(&mut self) {
        self.conn = None;
        self.state = ConnectionState::Reconnecting;
    }

    /// Retry budget exhausted.
    pub fn fail(&mut self) {
        self.conn = None;
        self.state = ConnectionState::Failed;
    }

    /// Clean shutdown. Idempotent.
    pub fn disconnect(&mut self) {
        self.conn = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Send a message, buffering it if the transport is down or full.
    pub fn send(&mut self, msg: &WireMessage) -> Result<(), CollabError> {
        if self.state == ConnectionState::Connected {
            if let Some(conn) = self.conn.clone() {
                let bytes = msg.encode()?;
                match conn.try_send(bytes) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!("transport channel full, buffering {msg:?}");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.detach();
                    }
                }
            }
        }
        if !self.queue.push(msg.clone()) {
            log::trace!("dropped coalescable frame for user {}", msg.user_id());
        }
        Ok(())
    }

    /// Drain the offline queue onto a live connection, in order.
    pub fn flush(&mut self) -> Result<(), CollabError> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }
        let buffered = self.queue.drain();
        if !buffered.is_empty() {
            log::debug!("flushing {} buffered messages", buffered.len());
        }
        for msg in buffered {
            self.send(&msg)?;
        }
        Ok(())
    }
}

// ─── WebSocket transport ────────────────────────────────────────────────────

/// Default heartbeat interval on a live connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Production transport: one WebSocket per workspace connection.
///
/// The writer task doubles as the heartbeat: periodic pings keep the
/// socket exercised so a half-open connection fails fast instead of
/// sitting in `Connected` forever.
pub struct WsTransport {
    url: String,
    ping_interval: Duration,
}

impl WsTransport {
    /// `url` is the hub base, e.g. `ws://127.0.0.1:9000`; the workspace
    /// id becomes the path.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        workspace_id: Uuid,
        _user_id: Uuid,
    ) -> Result<TransportConn, CollabError> {
        let url = format!("{}/{workspace_id}", self.url);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| CollabError::Connection(format!("websocket connect to {url}: {e}")))?;

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);

        // Writer: framed bytes out of the session become binary frames,
        // with a heartbeat ping between them.
        let ping_interval = self.ping_interval;
        tokio::spawn(async move {
            // First tick lands a full interval out, keeping the join
            // frame first on the wire.
            let mut ping = tokio::time::interval_at(
                tokio::time::Instant::now() + ping_interval,
                ping_interval,
            );
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        match data {
                            Some(data) => {
                                if sink.send(Message::Binary(data.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader: binary frames in; dropping in_tx signals stream end.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(TransportConn {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;

    fn cursor(ts: u64) -> WireMessage {
        WireMessage::Cursor {
            user_id: Uuid::nil(),
            x: ts as f32,
            y: 0.0,
            timestamp: ts,
        }
    }

    fn presence() -> WireMessage {
        WireMessage::Presence {
            user_id: Uuid::nil(),
            status: PresenceStatus::Online,
            last_active: 1,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = ExponentialBackoff::new(BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        });

        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(800));
        assert_eq!(b.next_delay(), Duration::from_millis(1_000));
        assert_eq!(b.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = ExponentialBackoff::new(BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        });

        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_within_bounds() {
        let mut b = ExponentialBackoff::new(BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        });

        for _ in 0..50 {
            b.reset();
            let d = b.next_delay().as_millis() as i64;
            assert!((900..=1_100).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_queue_evicts_oldest_cursor_at_capacity() {
        let mut q = OutboundQueue::new(3);
        assert!(q.push(cursor(1)));
        assert!(q.push(presence()));
        assert!(q.push(cursor(2)));
        assert!(q.push(cursor(3)));

        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        // cursor(1) was evicted.
        assert_eq!(drained[0], presence());
        assert_eq!(drained[1], cursor(2));
        assert_eq!(drained[2], cursor(3));
    }

    #[test]
    fn test_queue_never_drops_presence() {
        let mut q = OutboundQueue::new(2);
        assert!(q.push(presence()));
        assert!(q.push(presence()));
        // Full of non-coalescable entries: still accepted.
        assert!(q.push(presence()));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_queue_drops_incoming_cursor_when_only_presence_buffered() {
        let mut q = OutboundQueue::new(2);
        assert!(q.push(presence()));
        assert!(q.push(presence()));
        assert!(!q.push(cursor(1)));
        assert_eq!(q.len(), 2);
    }

    struct NoConnectTransport;

    #[async_trait]
    impl Transport for NoConnectTransport {
        async fn connect(
            &self,
            _workspace_id: Uuid,
            _user_id: Uuid,
        ) -> Result<TransportConn, CollabError> {
            Err(CollabError::Connection("not used".into()))
        }
    }

    #[tokio::test]
    async fn test_frame_buffered_while_connected_flushes_later() {
        let mut mgr = ConnectionManager::new(
            Arc::new(NoConnectTransport),
            Uuid::new_v4(),
            Uuid::new_v4(),
            ConnectionConfig::default(),
        );

        // Capacity-1 transport channel: the second send hits back-pressure
        // and lands in the queue even though we are connected.
        let (tx, mut rx) = mpsc::channel(1);
        mgr.attach(tx);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        mgr.send(&presence()).unwrap();
        mgr.send(&presence()).unwrap();
        assert_eq!(mgr.queued(), 1);

        // Once the channel drains, a flush must deliver the held frame.
        rx.recv().await.unwrap();
        mgr.flush().unwrap();
        assert_eq!(mgr.queued(), 0);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_queue_drains_in_order() {
        let mut q = OutboundQueue::new(8);
        q.push(cursor(1));
        q.push(presence());
        q.push(cursor(2));

        let drained = q.drain();
        assert_eq!(drained, vec![cursor(1), presence(), cursor(2)]);
        assert!(q.is_empty());
    }
}
