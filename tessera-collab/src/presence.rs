//! Presence staleness tracking.
//!
//! Tracks local arrival times per user and drives the
//! `Online → Away → Offline → evicted` machine from a periodic sweep.
//! The sweep is the only code path that removes entries from the
//! replica, so evictions never race with concurrent merges.
//!
//! Staleness is an overlay: the replicated status register is left
//! untouched, and the effective status shown to consumers is the worse
//! of the replicated value and the staleness level.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::PresenceStatus;
use crate::store::SharedStateStore;

/// Presence window configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Activity within this window keeps a user `Online`.
    pub idle_window: Duration,
    /// No activity for this long shows the user `Offline`.
    pub offline_window: Duration,
    /// No activity for this long removes the user entirely.
    pub eviction_window: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(15),
            offline_window: Duration::from_secs(45),
            eviction_window: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(2),
        }
    }
}

/// Per-user activity clock plus the sweep that drives transitions.
#[derive(Debug)]
pub struct PresenceTracker {
    config: PresenceConfig,
    last_activity: HashMap<Uuid, Instant>,
    /// Users who announced a clean leave; evicted on the next sweep.
    left: HashSet<Uuid>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            last_activity: HashMap::new(),
            left: HashSet::new(),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Record activity (cursor move or presence update) for a user.
    pub fn touch(&mut self, user_id: Uuid) {
        self.touch_at(user_id, Instant::now());
    }

    pub fn touch_at(&mut self, user_id: Uuid, at: Instant) {
        self.left.remove(&user_id);
        self.last_activity.insert(user_id, at);
    }

    /// Record a clean leave; the entry goes on the next sweep.
    pub fn mark_left(&mut self, user_id: Uuid) {
        self.left.insert(user_id);
    }

    /// Staleness level for a user at `now`, from local arrival times.
    pub fn staleness(&self, user_id: &Uuid, now: Instant) -> PresenceStatus {
        match self.last_activity.get(user_id) {
            None => PresenceStatus::Offline,
            Some(at) => {
                let elapsed = now.saturating_duration_since(*at);
                if elapsed < self.config.idle_window {
                    PresenceStatus::Online
                } else if elapsed < self.config.offline_window {
                    PresenceStatus::Away
                } else {
                    PresenceStatus::Offline
                }
            }
        }
    }

    /// Run one sweep pass: evict users past the eviction window or marked
    /// as left. Returns the evicted user ids.
    pub fn sweep(&mut self, store: &mut SharedStateStore, now: Instant) -> Vec<Uuid> {
        let mut evicted: Vec<Uuid> = self.left.drain().collect();

        let stale: Vec<Uuid> = self
            .last_activity
            .iter()
            .filter(|(id, at)| {
                !evicted.contains(id)
                    && now.saturating_duration_since(**at) >= self.config.eviction_window
            })
            .map(|(id, _)| *id)
            .collect();
        evicted.extend(stale);

        for id in &evicted {
            self.last_activity.remove(id);
            if store.remove_user(id).is_some() {
                log::debug!("evicted stale user {id} from workspace {}", store.workspace_id());
            }
        }

        evicted
    }
}
