//! Tessera Collab — real-time presence and cursor collaboration.
//!
//! A session connects a user to a workspace, replicates presence and
//! cursor state through per-field last-writer-wins registers, throttles
//! outbound cursor traffic, and survives connection loss with jittered
//! exponential backoff. An in-process hub fans frames out between
//! sessions over WebSockets.
//!
//! ```text
//! ┌───────────────────────────── client ─────────────────────────────┐
//! │  CollabSession (facade)                                          │
//! │        │ commands                                                │
//! │        ▼                                                         │
//! │  session task ──▶ SharedStateStore (LWW replica)                 │
//! │    │   │   └────▶ PresenceTracker (staleness + sweep)            │
//! │    │   └──▶ CursorThrottler (10 sends/s)                         │
//! │    └──▶ ConnectionManager ──▶ Transport (WebSocket)              │
//! └──────────────────────────────│────────────────────────────────────┘
//!                                ▼
//!                      CollabHub ──▶ room actor per workspace
//! ```
//!
//! Module map:
//! - [`protocol`]   — wire messages, binary codec, error taxonomy
//! - [`store`]      — convergent per-user presence/cursor replica
//! - [`presence`]   — activity tracking, staleness, eviction sweep
//! - [`throttle`]   — fixed-interval cursor send limiter
//! - [`connection`] — transport seam, retry/backoff, offline queue
//! - [`session`]    — the owning task and the public facade
//! - [`hub`]        — WebSocket fan-out server, one actor per room
//! - [`metrics`]    — latency sampling for performance mode

pub mod connection;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod store;
pub mod throttle;

pub use connection::{
    BackoffConfig, ConnectionConfig, ConnectionManager, ConnectionState, ExponentialBackoff,
    OutboundQueue, Transport, TransportConn, WsTransport, DEFAULT_PING_INTERVAL,
};
pub use hub::{CollabHub, HubConfig, MemberQueue};
pub use metrics::{LatencyRecorder, MetricsSummary, OperationKind};
pub use presence::{PresenceConfig, PresenceTracker};
pub use protocol::{now_millis, CollabError, PresenceStatus, WireMessage};
pub use session::{CollabSession, SessionConfig, UsersListener};
pub use store::{CursorPos, LwwRegister, SharedStateStore, UserPresence, UserSnapshot};
pub use throttle::{CursorThrottler, DEFAULT_THROTTLE_INTERVAL};
