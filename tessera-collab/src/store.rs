//! Convergent shared-state replica for per-user presence and cursors.
//!
//! Each user's presence status and cursor position are independent
//! last-writer-wins registers: the update with the greater timestamp wins,
//! ties break on the writer's id bytes. That makes the merge commutative,
//! associative, and idempotent, so every replica converges to the same
//! state regardless of delivery order or duplication.
//!
//! ```text
//! WireMessage (remote)            WireMessage (local)
//!        │                              │
//!        ▼                              ▼
//!  apply_remote() ──────┬────── apply_local()
//!                       ▼
//!            LwwRegister::merge()   (pure, per field)
//!                       │
//!                       ▼
//!              WorkspaceState.users
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{PresenceStatus, WireMessage};

/// Soft admission cap on registered users per workspace. Exceeding it
/// logs a warning but never rejects the update.
pub const DEFAULT_USER_SOFT_CAP: usize = 25;

/// 2D cursor position in workspace coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CursorPos {
    pub x: f32,
    pub y: f32,
}

impl CursorPos {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A timestamped last-writer-wins register.
///
/// The merge is a pure function of (current, incoming) → winner, so
/// convergence is testable in isolation from transport and timers.
#[derive(Debug, Clone, PartialEq)]
pub struct LwwRegister<T> {
    value: T,
    timestamp: u64,
    writer: Uuid,
}

impl<T: Clone + Serialize> LwwRegister<T> {
    pub fn new(value: T, timestamp: u64, writer: Uuid) -> Self {
        Self { value, timestamp, writer }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Greater timestamp wins; ties break on writer id bytes, then on
    /// the encoded value. The ordering is total, so the merge stays
    /// commutative even when one writer stamps two different values
    /// with the same timestamp.
    fn wins_over(&self, other: &LwwRegister<T>) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.writer.as_bytes().cmp(other.writer.as_bytes()) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => encoded(&self.value) > encoded(&other.value),
            },
        }
    }

    /// Deterministic merge of two register states.
    pub fn merge(current: &LwwRegister<T>, incoming: &LwwRegister<T>) -> LwwRegister<T> {
        if incoming.wins_over(current) {
            incoming.clone()
        } else {
            current.clone()
        }
    }

    /// Merge an incoming state in place. Returns true if the value changed owner.
    fn merge_in(&mut self, incoming: &LwwRegister<T>) -> bool {
        if incoming.wins_over(self) {
            *self = incoming.clone();
            true
        } else {
            false
        }
    }

    /// Replace the value without touching the timestamp.
    ///
    /// Used only for local staleness/leave overlays: any wire update for
    /// this user with a newer timestamp still wins the register.
    fn set_value(&mut self, value: T) {
        self.value = value;
    }
}

/// Stable byte form of a register value, used only for timestamp ties
/// from the same writer.
fn encoded<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

/// A single user's replicated presence entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub name: String,
    status: LwwRegister<PresenceStatus>,
    cursor: LwwRegister<Option<CursorPos>>,
    /// Greatest wire timestamp seen for this user. Non-decreasing.
    pub last_active: u64,
}

impl UserPresence {
    /// Entry created before any explicit announcement was seen
    /// (e.g. a cursor frame arrived ahead of the join).
    fn placeholder(user_id: Uuid) -> Self {
        let name = format!("user-{}", &user_id.to_string()[..8]);
        Self::announced(user_id, name)
    }

    fn announced(user_id: Uuid, name: String) -> Self {
        Self {
            user_id,
            name,
            status: LwwRegister::new(PresenceStatus::Online, 0, user_id),
            cursor: LwwRegister::new(None, 0, user_id),
            last_active: 0,
        }
    }

    pub fn status(&self) -> PresenceStatus {
        *self.status.value()
    }

    pub fn cursor(&self) -> Option<CursorPos> {
        *self.cursor.value()
    }
}

/// Plain-value snapshot of one user, handed to facade consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSnapshot {
    pub user_id: Uuid,
    pub name: String,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPos>,
    pub last_active: u64,
}

/// The workspace aggregate plus merge entry points.
///
/// All mutation happens through `apply_local` / `apply_remote` from a
/// single owning task; the store itself is not synchronized.
#[derive(Debug)]
pub struct SharedStateStore {
    workspace_id: Uuid,
    users: HashMap<Uuid, UserPresence>,
    soft_cap: usize,
}

impl SharedStateStore {
    pub fn new(workspace_id: Uuid) -> Self {
        Self::with_soft_cap(workspace_id, DEFAULT_USER_SOFT_CAP)
    }

    pub fn with_soft_cap(workspace_id: Uuid, soft_cap: usize) -> Self {
        Self {
            workspace_id,
            users: HashMap::new(),
            soft_cap,
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    /// Apply a locally originated update, optimistically before any
    /// network acknowledgment.
    pub fn apply_local(&mut self, msg: &WireMessage) -> bool {
        self.apply(msg)
    }

    /// Apply a remote update. An unknown user creates a new entry.
    pub fn apply_remote(&mut self, msg: &WireMessage) -> bool {
        self.apply(msg)
    }

    fn apply(&mut self, msg: &WireMessage) -> bool {
        match msg {
            WireMessage::Join { user_id, name, .. } => {
                let entry = self.entry(*user_id);
                if entry.name != *name {
                    entry.name = name.clone();
                    true
                } else {
                    false
                }
            }

            WireMessage::Presence { user_id, status, last_active } => {
                let incoming = LwwRegister::new(*status, *last_active, *user_id);
                let entry = self.entry(*user_id);
                let changed = entry.status.merge_in(&incoming);
                entry.last_active = entry.last_active.max(*last_active);
                changed
            }

            WireMessage::Cursor { user_id, x, y, timestamp } => {
                let incoming =
                    LwwRegister::new(Some(CursorPos::new(*x, *y)), *timestamp, *user_id);
                let entry = self.entry(*user_id);
                let changed = entry.cursor.merge_in(&incoming);
                entry.last_active = entry.last_active.max(*timestamp);
                changed
            }

            WireMessage::Leave { user_id } => {
                // A leave carries no timestamp: overlay Offline locally.
                // Removal is left to the presence sweep, the only path
                // allowed to evict entries. Replicas that interleave the
                // leave differently against a same-stamp presence update
                // may disagree on this overlay until the sweep evicts the
                // entry; the register itself stays convergent.
                match self.users.get_mut(user_id) {
                    Some(entry) if entry.status() != PresenceStatus::Offline => {
                        entry.status.set_value(PresenceStatus::Offline);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn entry(&mut self, user_id: Uuid) -> &mut UserPresence {
        if !self.users.contains_key(&user_id) && self.users.len() >= self.soft_cap {
            log::warn!(
                "workspace {} exceeds the {}-user admission hint ({} registered)",
                self.workspace_id,
                self.soft_cap,
                self.users.len() + 1
            );
        }
        self.users
            .entry(user_id)
            .or_insert_with(|| UserPresence::placeholder(user_id))
    }

    /// Number of registered users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user(&self, user_id: &Uuid) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &UserPresence> {
        self.users.values()
    }

    /// Remove a user entry. Called only by the presence sweep.
    pub(crate) fn remove_user(&mut self, user_id: &Uuid) -> Option<UserPresence> {
        self.users.remove(user_id)
    }

    /// Plain-value snapshot of the presence map, with an effective status
    /// computed by the caller (typically a staleness overlay).
    pub fn snapshot_with<F>(&self, effective_status: F) -> HashMap<Uuid, UserSnapshot>
    where
        F: Fn(&UserPresence) -> PresenceStatus,
    {
        self.users
            .values()
            .map(|u| {
                (
                    u.user_id,
                    UserSnapshot {
                        user_id: u.user_id,
                        name: u.name.clone(),
                        status: effective_status(u),
                        cursor: u.cursor(),
                        last_active: u.last_active,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(user: Uuid, x: f32, y: f32, ts: u64) -> WireMessage {
        WireMessage::Cursor { user_id: user, x, y, timestamp: ts }
    }

    fn presence(user: Uuid, status: PresenceStatus, ts: u64) -> WireMessage {
        WireMessage::Presence { user_id: user, status, last_active: ts }
    }

    fn join(workspace: Uuid, user: Uuid, name: &str) -> WireMessage {
        WireMessage::Join { workspace_id: workspace, user_id: user, name: name.into() }
    }

    // ── LwwRegister ──────────────────────────────────────────────

    #[test]
    fn test_register_greater_timestamp_wins() {
        let writer = Uuid::new_v4();
        let old = LwwRegister::new(1u32, 5, writer);
        let new = LwwRegister::new(2u32, 7, writer);

        assert_eq!(*LwwRegister::merge(&old, &new).value(), 2);
        assert_eq!(*LwwRegister::merge(&new, &old).value(), 2);
    }

    #[test]
    fn test_register_tie_breaks_on_writer() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let ra = LwwRegister::new("a", 5, a);
        let rb = LwwRegister::new("b", 5, b);

        // Deterministic regardless of argument order.
        assert_eq!(*LwwRegister::merge(&ra, &rb).value(), "b");
        assert_eq!(*LwwRegister::merge(&rb, &ra).value(), "b");
    }

    #[test]
    fn test_register_same_writer_tie_breaks_on_value() {
        let writer = Uuid::from_u128(7);
        let a = LwwRegister::new(PresenceStatus::Online, 3, writer);
        let b = LwwRegister::new(PresenceStatus::Away, 3, writer);

        // One writer, one timestamp, two values: the winner must not
        // depend on argument order.
        let merged = LwwRegister::merge(&a, &b);
        assert_eq!(LwwRegister::merge(&b, &a), merged);
    }

    #[test]
    fn test_register_merge_idempotent() {
        let writer = Uuid::new_v4();
        let r = LwwRegister::new(9u32, 3, writer);
        assert_eq!(LwwRegister::merge(&r, &r), r);
    }

    // ── Store merge semantics ────────────────────────────────────

    #[test]
    fn test_unknown_user_creates_entry() {
        let mut store = SharedStateStore::new(Uuid::new_v4());
        let user = Uuid::new_v4();

        store.apply_remote(&cursor(user, 10.0, 20.0, 1));

        let entry = store.user(&user).unwrap();
        assert_eq!(entry.cursor(), Some(CursorPos::new(10.0, 20.0)));
        assert!(entry.name.starts_with("user-"));
    }

    #[test]
    fn test_join_names_placeholder_entry() {
        let ws = Uuid::new_v4();
        let mut store = SharedStateStore::new(ws);
        let user = Uuid::new_v4();

        store.apply_remote(&cursor(user, 1.0, 2.0, 1));
        store.apply_remote(&join(ws, user, "Bob"));

        assert_eq!(store.user(&user).unwrap().name, "Bob");
    }

    #[test]
    fn test_stale_cursor_rejected() {
        let mut store = SharedStateStore::new(Uuid::new_v4());
        let user = Uuid::new_v4();

        store.apply_remote(&cursor(user, 100.0, 200.0, 5));
        store.apply_remote(&cursor(user, 0.0, 0.0, 3));

        assert_eq!(
            store.user(&user).unwrap().cursor(),
            Some(CursorPos::new(100.0, 200.0))
        );
    }

    #[test]
    fn test_last_active_non_decreasing() {
        let mut store = SharedStateStore::new(Uuid::new_v4());
        let user = Uuid::new_v4();

        store.apply_remote(&cursor(user, 1.0, 1.0, 10));
        store.apply_remote(&presence(user, PresenceStatus::Away, 4));

        assert_eq!(store.user(&user).unwrap().last_active, 10);
    }

    #[test]
    fn test_merge_convergence_under_permutation() {
        let ws = Uuid::new_v4();
        let alice = Uuid::from_u128(10);
        let bob = Uuid::from_u128(20);

        let updates = vec![
            join(ws, alice, "Alice"),
            cursor(alice, 5.0, 5.0, 1),
            presence(alice, PresenceStatus::Away, 3),
            cursor(alice, 9.0, 9.0, 2),
            join(ws, bob, "Bob"),
            cursor(bob, 7.0, 7.0, 2),
            presence(bob, PresenceStatus::Online, 2),
            presence(alice, PresenceStatus::Online, 3), // ts tie with Away
        ];

        // Apply the reference order once.
        let mut reference = SharedStateStore::new(ws);
        for u in &updates {
            reference.apply_remote(u);
        }
        let reference_alice = reference.user(&alice).unwrap().clone();
        let reference_bob = reference.user(&bob).unwrap().clone();

        // Rotations and a reversal stand in for full permutation cover.
        for shift in 0..updates.len() {
            let mut store = SharedStateStore::new(ws);
            for i in 0..updates.len() {
                store.apply_remote(&updates[(i + shift) % updates.len()]);
            }
            assert_eq!(store.user(&alice).unwrap(), &reference_alice, "shift {shift}");
            assert_eq!(store.user(&bob).unwrap(), &reference_bob, "shift {shift}");
        }

        let mut reversed = SharedStateStore::new(ws);
        for u in updates.iter().rev() {
            reversed.apply_remote(u);
        }
        assert_eq!(reversed.user(&alice).unwrap(), &reference_alice);
        assert_eq!(reversed.user(&bob).unwrap(), &reference_bob);
    }

    #[test]
    fn test_same_writer_timestamp_tie_converges() {
        let ws = Uuid::new_v4();
        let user = Uuid::new_v4();
        let away = presence(user, PresenceStatus::Away, 3);
        let online = presence(user, PresenceStatus::Online, 3);

        let mut forward = SharedStateStore::new(ws);
        forward.apply_remote(&away);
        forward.apply_remote(&online);

        let mut backward = SharedStateStore::new(ws);
        backward.apply_remote(&online);
        backward.apply_remote(&away);

        assert_eq!(
            forward.user(&user).unwrap().status(),
            backward.user(&user).unwrap().status()
        );
    }

    #[test]
    fn test_duplicate_application_idempotent() {
        let mut store = SharedStateStore::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let update = cursor(user, 42.0, 43.0, 7);

        store.apply_remote(&update);
        let once = store.user(&user).unwrap().clone();

        store.apply_remote(&update);
        assert_eq!(store.user(&user).unwrap(), &once);
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_leave_overlays_offline_without_removal() {
        let ws = Uuid::new_v4();
        let mut store = SharedStateStore::new(ws);
        let user = Uuid::new_v4();

        store.apply_remote(&presence(user, PresenceStatus::Online, 1));
        store.apply_remote(&WireMessage::Leave { user_id: user });

        let entry = store.user(&user).unwrap();
        assert_eq!(entry.status(), PresenceStatus::Offline);
        assert_eq!(store.user_count(), 1);

        // A newer presence update still wins the register.
        store.apply_remote(&presence(user, PresenceStatus::Online, 2));
        assert_eq!(store.user(&user).unwrap().status(), PresenceStatus::Online);
    }

    #[test]
    fn test_soft_cap_admits_beyond_limit() {
        let mut store = SharedStateStore::with_soft_cap(Uuid::new_v4(), 2);
        for i in 0..4u128 {
            store.apply_remote(&cursor(Uuid::from_u128(i + 1), 0.0, 0.0, 1));
        }
        // Admission hint only, never a rejection.
        assert_eq!(store.user_count(), 4);
    }

    #[test]
    fn test_snapshot_applies_effective_status() {
        let mut store = SharedStateStore::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        store.apply_remote(&presence(user, PresenceStatus::Online, 1));

        let snap = store.snapshot_with(|u| u.status().worst(PresenceStatus::Away));
        assert_eq!(snap[&user].status, PresenceStatus::Away);
    }

    #[test]
    fn test_local_then_remote_echo_is_stable() {
        let mut store = SharedStateStore::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let update = cursor(user, 3.0, 4.0, 9);

        store.apply_local(&update);
        let optimistic = store.user(&user).unwrap().clone();

        // The hub echoing our own frame back must not change anything.
        store.apply_remote(&update);
        assert_eq!(store.user(&user).unwrap(), &optimistic);
    }
}
