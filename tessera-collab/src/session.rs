//! The collaboration session: one task owning replica, tracker, throttle
//! and connection for a single (workspace, user) pair.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!  update_cursor ──▶ │                              │ ◀── inbound frames
//!  update_presence ─▶│        session task          │ ◀── sweep tick
//!  subscribe ──────▶ │   (single-writer select!)    │ ◀── throttle tick
//!  disconnect ─────▶ │                              │ ◀── connect future
//!                    └──────────────┬───────────────┘
//!                                   ▼
//!                     users snapshot + listeners
//! ```
//!
//! All replica mutation happens on this task, so merges, sweeps and
//! sends never race. The facade talks to it over a command channel and
//! reads published snapshots from a shared map.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState, Transport, TransportConn};
use crate::metrics::{LatencyRecorder, MetricsSummary, OperationKind};
use crate::presence::{PresenceConfig, PresenceTracker};
use crate::protocol::{now_millis, CollabError, PresenceStatus, WireMessage};
use crate::store::{CursorPos, SharedStateStore, UserSnapshot};
use crate::throttle::{CursorThrottler, DEFAULT_THROTTLE_INTERVAL};

/// Snapshot consumer registered through `subscribe_users`.
pub type UsersListener = Box<dyn Fn(&HashMap<Uuid, UserSnapshot>) + Send + Sync>;
/// Invoked with `true` on connect and `false` on every loss.
pub type ConnectionListener = Box<dyn Fn(bool) + Send + Sync>;
pub type ErrorListener = Box<dyn Fn(&CollabError) + Send + Sync>;

/// Session tuning and callbacks.
pub struct SessionConfig {
    /// Display name announced in the join frame.
    pub user_name: String,
    pub on_connection_change: Option<ConnectionListener>,
    pub on_error: Option<ErrorListener>,
    /// Enables latency sampling for sends, merges and sweeps.
    pub performance_mode: bool,
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
    pub throttle_interval: Duration,
    /// Known workspace members to pre-populate the replica with.
    pub seed_users: Vec<(Uuid, String)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_name: "anonymous".into(),
            on_connection_change: None,
            on_error: None,
            performance_mode: false,
            connection: ConnectionConfig::default(),
            presence: PresenceConfig::default(),
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            seed_users: Vec::new(),
        }
    }
}

enum SessionCmd {
    Cursor(CursorPos),
    Presence(PresenceStatus),
    Subscribe(UsersListener),
    Shutdown,
}

// ─── Active-session registry ────────────────────────────────────────────────

// One live session per (workspace, user) process-wide. A second
// initialize for the same pair is rejected until the first disconnects.
static ACTIVE: OnceLock<Mutex<HashSet<(Uuid, Uuid)>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashSet<(Uuid, Uuid)>> {
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register(workspace_id: Uuid, user_id: Uuid) -> bool {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert((workspace_id, user_id))
}

fn deregister(workspace_id: Uuid, user_id: Uuid) {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&(workspace_id, user_id));
}

// ─── Facade ─────────────────────────────────────────────────────────────────

/// Handle to a running collaboration session.
///
/// Cheap to move, single-owner. Dropping the handle tears the session
/// down; `disconnect` does the same but waits for the task to finish
/// and announces a clean leave.
pub struct CollabSession {
    workspace_id: Uuid,
    user_id: Uuid,
    cmd_tx: mpsc::Sender<SessionCmd>,
    status: Arc<RwLock<ConnectionState>>,
    users: Arc<RwLock<HashMap<Uuid, UserSnapshot>>>,
    metrics: Arc<RwLock<LatencyRecorder>>,
    task: Option<JoinHandle<()>>,
}

impl CollabSession {
    /// Start a session for `user_id` in `workspace_id` and begin
    /// connecting in the background. Connection results surface through
    /// `status()` and the configured callbacks.
    pub async fn initialize(
        workspace_id: Uuid,
        user_id: Uuid,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Result<CollabSession, CollabError> {
        if !register(workspace_id, user_id) {
            return Err(CollabError::Validation(format!(
                "user {user_id} already has an active session in workspace {workspace_id}"
            )));
        }

        let status = Arc::new(RwLock::new(ConnectionState::Connecting));
        let users = Arc::new(RwLock::new(HashMap::new()));
        let metrics = Arc::new(RwLock::new(LatencyRecorder::new(config.performance_mode)));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let task = tokio::spawn(session_task(SessionContext {
            workspace_id,
            user_id,
            transport,
            config,
            cmd_rx,
            status: Arc::clone(&status),
            users: Arc::clone(&users),
            metrics: Arc::clone(&metrics),
        }));

        Ok(CollabSession {
            workspace_id,
            user_id,
            cmd_tx,
            status,
            users,
            metrics,
            task: Some(task),
        })
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current users snapshot with effective (staleness-adjusted) status.
    pub fn users(&self) -> HashMap<Uuid, UserSnapshot> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latency summary. All zeros unless performance mode is on.
    pub fn metrics(&self) -> MetricsSummary {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }

    /// Report a local cursor move. Applied to the replica immediately;
    /// the outbound send is throttled.
    pub async fn update_cursor_position(&self, x: f32, y: f32) -> Result<(), CollabError> {
        self.send_cmd(SessionCmd::Cursor(CursorPos::new(x, y))).await
    }

    /// Set the local presence status. Sent immediately, never throttled.
    pub async fn update_presence(&self, status: PresenceStatus) -> Result<(), CollabError> {
        self.send_cmd(SessionCmd::Presence(status)).await
    }

    /// Register a listener invoked on every snapshot change. The listener
    /// is called once with the current snapshot on registration.
    pub async fn subscribe_users(&self, listener: UsersListener) -> Result<(), CollabError> {
        self.send_cmd(SessionCmd::Subscribe(listener)).await
    }

    /// Shut the session down, announcing a leave if connected. Idempotent.
    pub async fn disconnect(&mut self) -> Result<(), CollabError> {
        let _ = self.cmd_tx.send(SessionCmd::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        deregister(self.workspace_id, self.user_id);
        Ok(())
    }

    async fn send_cmd(&self, cmd: SessionCmd) -> Result<(), CollabError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CollabError::Connection("session task has ended".into()))
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        deregister(self.workspace_id, self.user_id);
    }
}

// ─── Session task ───────────────────────────────────────────────────────────

struct SessionContext {
    workspace_id: Uuid,
    user_id: Uuid,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    cmd_rx: mpsc::Receiver<SessionCmd>,
    status: Arc<RwLock<ConnectionState>>,
    users: Arc<RwLock<HashMap<Uuid, UserSnapshot>>>,
    metrics: Arc<RwLock<LatencyRecorder>>,
}

struct Callbacks {
    connection: Option<ConnectionListener>,
    error: Option<ErrorListener>,
}

impl Callbacks {
    fn connection(&self, up: bool) {
        if let Some(cb) = &self.connection {
            cb(up);
        }
    }

    fn error(&self, e: &CollabError) {
        if let Some(cb) = &self.error {
            cb(e);
        }
    }
}

type ConnectFut = Pin<Box<dyn Future<Output = Result<TransportConn, CollabError>> + Send>>;

async fn session_task(mut ctx: SessionContext) {
    let workspace_id = ctx.workspace_id;
    let user_id = ctx.user_id;
    let user_name = ctx.config.user_name.clone();

    let callbacks = Arc::new(Callbacks {
        connection: ctx.config.on_connection_change.take(),
        error: ctx.config.on_error.take(),
    });
    let attempt_cb: Arc<dyn Fn(&CollabError) + Send + Sync> = {
        let cbs = Arc::clone(&callbacks);
        Arc::new(move |e| {
            cbs.error(e);
            cbs.connection(false);
        })
    };

    let perf = ctx.config.performance_mode;
    let mut last_stamp: u64 = 0;
    let mut manager = ConnectionManager::new(
        Arc::clone(&ctx.transport),
        workspace_id,
        user_id,
        ctx.config.connection.clone(),
    );
    let mut store = SharedStateStore::new(workspace_id);
    let mut tracker = PresenceTracker::new(ctx.config.presence.clone());
    let mut throttler = CursorThrottler::new(ctx.config.throttle_interval);
    let mut listeners: Vec<UsersListener> = Vec::new();

    // Seed the replica: ourselves plus any known members.
    store.apply_local(&WireMessage::Join {
        workspace_id,
        user_id,
        name: user_name.clone(),
    });
    tracker.touch(user_id);
    for (id, name) in &ctx.config.seed_users {
        store.apply_remote(&WireMessage::Join {
            workspace_id,
            user_id: *id,
            name: name.clone(),
        });
    }
    publish(&store, &tracker, &ctx.users, &listeners);

    let mut inbound: Option<mpsc::Receiver<Vec<u8>>> = None;
    let mut connect_fut: Option<ConnectFut> =
        Some(manager.begin_connect(Arc::clone(&attempt_cb)));

    let mut sweep = tokio::time::interval(tracker.config().sweep_interval);
    let mut flush_tick = tokio::time::interval(throttler.interval());
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            res = async {
                match connect_fut.as_mut() {
                    Some(f) => f.await,
                    None => std::future::pending().await,
                }
            } => {
                connect_fut = None;
                match res {
                    Ok(conn) => {
                        log::info!("connected to workspace {workspace_id} as {user_id}");
                        manager.attach(conn.outbound);
                        inbound = Some(conn.inbound);

                        let join = WireMessage::Join {
                            workspace_id,
                            user_id,
                            name: user_name.clone(),
                        };
                        if let Err(e) = manager.send(&join).and_then(|_| manager.flush()) {
                            callbacks.error(&e);
                        }
                        set_status(&ctx.status, ConnectionState::Connected);
                        callbacks.connection(true);
                    }
                    Err(e) => {
                        log::error!("giving up on workspace {workspace_id}: {e}");
                        manager.fail();
                        set_status(&ctx.status, ConnectionState::Failed);
                    }
                }
            }

            frame = async {
                match inbound.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Some(bytes) => {
                        let started = Instant::now();
                        match WireMessage::decode(&bytes) {
                            Ok(msg) if msg.user_id() != user_id => {
                                if let WireMessage::Leave { user_id: who } = msg {
                                    tracker.mark_left(who);
                                } else {
                                    tracker.touch(msg.user_id());
                                }
                                store.apply_remote(&msg);
                                publish(&store, &tracker, &ctx.users, &listeners);
                                record(&ctx.metrics, perf, OperationKind::Merge, started);
                            }
                            Ok(_) => {} // our own frame echoed back
                            Err(e) => {
                                log::warn!("discarding malformed frame: {e}");
                                callbacks.error(&e);
                            }
                        }
                    }
                    None => {
                        log::warn!("connection to workspace {workspace_id} lost, reconnecting");
                        manager.detach();
                        inbound = None;
                        set_status(&ctx.status, ConnectionState::Reconnecting);
                        callbacks.connection(false);
                        connect_fut = Some(manager.begin_connect(Arc::clone(&attempt_cb)));
                    }
                }
            }

            cmd = ctx.cmd_rx.recv() => {
                match cmd {
                    Some(SessionCmd::Cursor(pos)) => {
                        let msg = WireMessage::Cursor {
                            user_id,
                            x: pos.x,
                            y: pos.y,
                            timestamp: next_stamp(&mut last_stamp),
                        };
                        store.apply_local(&msg);
                        tracker.touch(user_id);
                        publish(&store, &tracker, &ctx.users, &listeners);

                        if let Some(send_pos) = throttler.offer(pos, Instant::now()) {
                            let started = Instant::now();
                            let out = WireMessage::Cursor {
                                user_id,
                                x: send_pos.x,
                                y: send_pos.y,
                                timestamp: next_stamp(&mut last_stamp),
                            };
                            if let Err(e) = manager.send(&out) {
                                callbacks.error(&e);
                            }
                            record(&ctx.metrics, perf, OperationKind::Send, started);
                        }
                    }
                    Some(SessionCmd::Presence(status)) => {
                        let msg = WireMessage::Presence {
                            user_id,
                            status,
                            last_active: next_stamp(&mut last_stamp),
                        };
                        store.apply_local(&msg);
                        tracker.touch(user_id);
                        publish(&store, &tracker, &ctx.users, &listeners);

                        let started = Instant::now();
                        if let Err(e) = manager.send(&msg) {
                            callbacks.error(&e);
                        }
                        record(&ctx.metrics, perf, OperationKind::Send, started);
                    }
                    Some(SessionCmd::Subscribe(listener)) => {
                        let current = ctx
                            .users
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        listener(&current);
                        listeners.push(listener);
                    }
                    Some(SessionCmd::Shutdown) | None => break,
                }
            }

            _ = sweep.tick() => {
                let started = Instant::now();
                let evicted = tracker.sweep(&mut store, Instant::now());
                if !evicted.is_empty() {
                    publish(&store, &tracker, &ctx.users, &listeners);
                }
                record(&ctx.metrics, perf, OperationKind::Sweep, started);
            }

            _ = flush_tick.tick() => {
                // Drain anything buffered by transport back-pressure so a
                // frame queued while connected is not stranded.
                if let Err(e) = manager.flush() {
                    callbacks.error(&e);
                }
                if let Some(pos) = throttler.flush(Instant::now()) {
                    let started = Instant::now();
                    let out = WireMessage::Cursor {
                        user_id,
                        x: pos.x,
                        y: pos.y,
                        timestamp: next_stamp(&mut last_stamp),
                    };
                    if let Err(e) = manager.send(&out) {
                        callbacks.error(&e);
                    }
                    record(&ctx.metrics, perf, OperationKind::Send, started);
                }
            }
        }
    }

    // Best-effort clean leave; silently queued if the transport is gone.
    let _ = manager.send(&WireMessage::Leave { user_id });
    manager.disconnect();
    set_status(&ctx.status, ConnectionState::Disconnected);
    log::info!("session for {user_id} in workspace {workspace_id} shut down");
}

fn set_status(status: &Arc<RwLock<ConnectionState>>, next: ConnectionState) {
    *status.write().unwrap_or_else(PoisonError::into_inner) = next;
}

fn publish(
    store: &SharedStateStore,
    tracker: &PresenceTracker,
    users: &Arc<RwLock<HashMap<Uuid, UserSnapshot>>>,
    listeners: &[UsersListener],
) {
    let now = Instant::now();
    let snapshot =
        store.snapshot_with(|u| u.status().worst(tracker.staleness(&u.user_id, now)));
    *users.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
    for listener in listeners {
        listener(&snapshot);
    }
}

/// Wall-clock stamp bumped to stay strictly increasing, so two local
/// updates landing in the same millisecond still order correctly in the
/// registers.
fn next_stamp(last: &mut u64) -> u64 {
    let stamp = now_millis().max(*last + 1);
    *last = stamp;
    stamp
}

fn record(
    metrics: &Arc<RwLock<LatencyRecorder>>,
    enabled: bool,
    kind: OperationKind,
    started: Instant,
) {
    // No lock taken with performance mode off.
    if !enabled {
        return;
    }
    metrics
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .record(kind, started.elapsed().as_secs_f64() * 1_000.0);
}
