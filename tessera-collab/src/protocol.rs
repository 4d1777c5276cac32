//! Binary wire protocol for presence and cursor collaboration.
//!
//! Wire format (bincode-encoded enum):
//! ```text
//! ┌──────────┬───────────────────────────────────────────┐
//! │ variant  │ payload                                   │
//! │ tag      │ Join / Presence / Cursor / Leave fields   │
//! └──────────┴───────────────────────────────────────────┘
//! ```
//!
//! Cursor frames are the high-frequency hot path and must stay compact;
//! a typical cursor frame is ~33 bytes on the wire.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// A user's replicated presence level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    fn rank(self) -> u8 {
        match self {
            PresenceStatus::Online => 2,
            PresenceStatus::Away => 1,
            PresenceStatus::Offline => 0,
        }
    }

    /// The lower of two presence levels.
    ///
    /// Used to overlay local staleness on top of the replicated status:
    /// a user who claims `Online` but has been silent past the idle
    /// window is shown as `Away`.
    pub fn worst(self, other: PresenceStatus) -> PresenceStatus {
        if self.rank() <= other.rank() {
            self
        } else {
            other
        }
    }
}

/// Messages exchanged between session and hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Announce membership in a workspace. Always the first frame sent
    /// on a fresh connection.
    Join {
        workspace_id: Uuid,
        user_id: Uuid,
        name: String,
    },

    /// Explicit presence update (unthrottled).
    Presence {
        user_id: Uuid,
        status: PresenceStatus,
        last_active: u64,
    },

    /// Cursor position update (high frequency, throttled by the sender).
    Cursor {
        user_id: Uuid,
        x: f32,
        y: f32,
        /// Milliseconds since the Unix epoch, used for LWW ordering.
        timestamp: u64,
    },

    /// Clean departure from the workspace.
    Leave { user_id: Uuid },
}

impl WireMessage {
    /// The user this message is about, for any variant.
    pub fn user_id(&self) -> Uuid {
        match self {
            WireMessage::Join { user_id, .. } => *user_id,
            WireMessage::Presence { user_id, .. } => *user_id,
            WireMessage::Cursor { user_id, .. } => *user_id,
            WireMessage::Leave { user_id } => *user_id,
        }
    }

    /// Whether a newer message of the same kind supersedes this one.
    ///
    /// Only cursor frames coalesce; presence and leave frames must
    /// never be dropped by queue back-pressure.
    pub fn is_coalescable(&self) -> bool {
        matches!(self, WireMessage::Cursor { .. })
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Validation(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Validation(e.to_string()))?;
        Ok(msg)
    }
}

/// Collaboration error taxonomy.
///
/// `Connection` failures are retried with backoff and eventually surfaced
/// through the session's error callback. `Validation` failures mark a
/// malformed inbound frame — the frame is discarded and logged, never
/// fatal, and never corrupts the replica.
#[derive(Debug, Clone)]
pub enum CollabError {
    Connection(String),
    Validation(String),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Connection error: {e}"),
            Self::Validation(e) => write!(f, "Validation error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
