//! In-process collaboration hub: one room actor per workspace, fronted
//! by a WebSocket accept loop.
//!
//! ```text
//!  ws conn ──▶ handle_connection ──RoomCmd──▶ room actor ──▶ MemberQueue
//!                    ▲                                            │
//!                    └──────────────── pop ◀──────────────────────┘
//! ```
//!
//! Each room actor owns its member table, so fan-out never locks across
//! rooms. Per-member queues apply the same back-pressure policy as the
//! client side: when full, the oldest cursor frame is evicted first and
//! presence or leave frames are never dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::protocol::{CollabError, WireMessage};

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: String,
    /// Per-member outbound queue bound.
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9870".into(),
            channel_capacity: 64,
        }
    }
}

// ─── Member queue ───────────────────────────────────────────────────────────

/// Bounded per-member outbound queue with cursor coalescing.
pub struct MemberQueue {
    inner: Mutex<VecDeque<(Arc<Vec<u8>>, bool)>>,
    notify: Notify,
    capacity: usize,
}

impl MemberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a frame. Returns `false` if it was dropped.
    pub fn push(&self, frame: Arc<Vec<u8>>, coalescable: bool) -> bool {
        let mut q = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if q.len() >= self.capacity {
            if let Some(idx) = q.iter().position(|(_, c)| *c) {
                let _ = q.remove(idx);
            } else if coalescable {
                return false;
            }
        }
        q.push_back((frame, coalescable));
        drop(q);
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame.
    pub async fn pop(&self) -> Arc<Vec<u8>> {
        loop {
            if let Some((frame, _)) = self
                .inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return frame;
            }
            // Notify holds a permit, so a push between the check and
            // this await is not lost.
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Room actor ─────────────────────────────────────────────────────────────

enum RoomCmd {
    Join {
        user_id: Uuid,
        queue: Arc<MemberQueue>,
        join_frame: Arc<Vec<u8>>,
    },
    Frame {
        from: Uuid,
        frame: Arc<Vec<u8>>,
        msg: WireMessage,
    },
    Leave {
        user_id: Uuid,
    },
}

struct Member {
    queue: Arc<MemberQueue>,
    join_frame: Arc<Vec<u8>>,
    last_presence: Option<Arc<Vec<u8>>>,
    last_cursor: Option<Arc<Vec<u8>>>,
}

/// One task per workspace. Owns the member table; every frame for this
/// workspace flows through here.
async fn room_task(workspace_id: Uuid, mut rx: mpsc::Receiver<RoomCmd>) {
    let mut members: HashMap<Uuid, Member> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCmd::Join { user_id, queue, join_frame } => {
                log::info!("user {user_id} joined workspace {workspace_id}");

                // Replay current room state to the newcomer.
                for (id, member) in &members {
                    if *id == user_id {
                        continue;
                    }
                    queue.push(Arc::clone(&member.join_frame), false);
                    if let Some(p) = &member.last_presence {
                        queue.push(Arc::clone(p), false);
                    }
                    if let Some(c) = &member.last_cursor {
                        queue.push(Arc::clone(c), true);
                    }
                }

                fan_out(&members, user_id, &join_frame, false);
                members.insert(
                    user_id,
                    Member {
                        queue,
                        join_frame,
                        last_presence: None,
                        last_cursor: None,
                    },
                );
            }

            RoomCmd::Frame { from, frame, msg } => {
                if let Some(member) = members.get_mut(&from) {
                    match &msg {
                        WireMessage::Presence { .. } => {
                            member.last_presence = Some(Arc::clone(&frame));
                        }
                        WireMessage::Cursor { .. } => {
                            member.last_cursor = Some(Arc::clone(&frame));
                        }
                        WireMessage::Join { .. } => {
                            member.join_frame = Arc::clone(&frame);
                        }
                        WireMessage::Leave { .. } => {}
                    }
                }
                fan_out(&members, from, &frame, msg.is_coalescable());
            }

            RoomCmd::Leave { user_id } => {
                if members.remove(&user_id).is_some() {
                    log::info!("user {user_id} left workspace {workspace_id}");
                    if let Ok(frame) = (WireMessage::Leave { user_id }).encode() {
                        fan_out(&members, user_id, &Arc::new(frame), false);
                    }
                }
            }
        }
    }
}

fn fan_out(members: &HashMap<Uuid, Member>, sender: Uuid, frame: &Arc<Vec<u8>>, coalescable: bool) {
    for (id, member) in members {
        if *id == sender {
            continue;
        }
        if !member.queue.push(Arc::clone(frame), coalescable) {
            log::trace!("dropped coalescable frame for slow member {id}");
        }
    }
}

// ─── Hub ────────────────────────────────────────────────────────────────────

/// WebSocket front for the room actors. Clone-cheap handle.
#[derive(Clone)]
pub struct CollabHub {
    config: HubConfig,
    rooms: Arc<RwLock<HashMap<Uuid, mpsc::Sender<RoomCmd>>>>,
}

impl CollabHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| CollabError::Connection(format!("bind {}: {e}", self.config.bind_addr)))?;
        self.run_on(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), CollabError> {
        log::info!(
            "collaboration hub listening on {}",
            listener
                .local_addr()
                .map_err(|e| CollabError::Connection(e.to_string()))?
        );

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| CollabError::Connection(format!("accept: {e}")))?;
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream).await {
                    log::debug!("connection from {peer} ended: {e}");
                }
            });
        }
    }

    async fn get_or_create_room(&self, workspace_id: Uuid) -> mpsc::Sender<RoomCmd> {
        if let Some(tx) = self.rooms.read().await.get(&workspace_id) {
            return tx.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Double-checked: another connection may have won the race.
        if let Some(tx) = rooms.get(&workspace_id) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        tokio::spawn(room_task(workspace_id, rx));
        rooms.insert(workspace_id, tx.clone());
        tx
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), CollabError> {
        let mut ws = accept_async(stream)
            .await
            .map_err(|e| CollabError::Connection(format!("handshake: {e}")))?;

        // The first data frame must be a join; it names the workspace and
        // user. Control frames (ping/pong) may precede it.
        let first = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => break WireMessage::decode(&data)?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(CollabError::Connection("closed before join".into()))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(CollabError::Connection(format!("read: {e}"))),
            }
        };
        let (workspace_id, user_id) = match &first {
            WireMessage::Join { workspace_id, user_id, .. } => (*workspace_id, *user_id),
            other => {
                return Err(CollabError::Validation(format!(
                    "expected a join frame, got {other:?}"
                )))
            }
        };

        let room = self.get_or_create_room(workspace_id).await;
        let queue = Arc::new(MemberQueue::new(self.config.channel_capacity));
        let join_frame = Arc::new(first.encode()?);
        room.send(RoomCmd::Join { user_id, queue: Arc::clone(&queue), join_frame })
            .await
            .map_err(|_| CollabError::Connection("room task gone".into()))?;

        let result = loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            match WireMessage::decode(&data) {
                                Ok(msg) => {
                                    let explicit_leave = matches!(msg, WireMessage::Leave { .. });
                                    let cmd = RoomCmd::Frame {
                                        from: user_id,
                                        frame: Arc::new(data.into()),
                                        msg,
                                    };
                                    if room.send(cmd).await.is_err() {
                                        break Err(CollabError::Connection("room task gone".into()));
                                    }
                                    if explicit_leave {
                                        break Ok(());
                                    }
                                }
                                Err(e) => {
                                    log::warn!("malformed frame from {user_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Err(CollabError::Connection(format!("read: {e}")))
                        }
                    }
                }

                out = queue.pop() => {
                    if let Err(e) = ws.send(Message::Binary(out.as_ref().clone().into())).await {
                        break Err(CollabError::Connection(format!("write: {e}")));
                    }
                }
            }
        };

        let _ = room.send(RoomCmd::Leave { user_id }).await;
        result
    }
}
