//! Ephemeral presence: who is connected, their color, and what they have
//! selected. Never stored in the tree and never resynced.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::events::{SubscriptionId, Subscribers};
use crate::ids::{NodeId, ReplicaId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const COLOR_PALETTE: [&str; 6] = [
    "#ff6b6b", "#4ecdc4", "#45b7d1", "#96ceb4", "#feca57", "#ff9ff3",
];

fn fold_bytes(replica: &ReplicaId) -> usize {
    replica
        .as_bytes()
        .iter()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as usize))
}

/// Palette color for a replica. Stable for a given id.
pub fn color_for(replica: &ReplicaId) -> &'static str {
    COLOR_PALETTE[fold_bytes(replica) % COLOR_PALETTE.len()]
}

pub fn default_display_name(replica: &ReplicaId) -> String {
    format!("user_{}", fold_bytes(replica) % 1000)
}

/// What a user is pointing at in the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Selection {
    pub node: NodeId,
    /// Attribute being edited, if any.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub field: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AwarenessState {
    pub replica: ReplicaId,
    pub display_name: String,
    pub color: String,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub selection: Option<Selection>,
    pub last_seen: DateTime<Utc>,
}

impl AwarenessState {
    /// Default identity for `replica`: `user_<n>` and a palette color.
    pub fn new(replica: ReplicaId, now: DateTime<Utc>) -> Self {
        Self {
            display_name: default_display_name(&replica),
            color: color_for(&replica).to_string(),
            replica,
            selection: None,
            last_seen: now,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_selection(mut self, selection: Option<Selection>) -> Self {
        self.selection = selection;
        self
    }
    /// Equal apart from `last_seen`, i.e. nothing a user would notice.
    pub fn same_presence(&self, other: &AwarenessState) -> bool {
        self.replica == other.replica
            && self.display_name == other.display_name
            && self.color == other.color
            && self.selection == other.selection
    }
}

/// Presence message payload. `state: None` announces departure.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AwarenessUpdate {
    pub replica: ReplicaId,
    pub state: Option<AwarenessState>,
}

/// Remote presence changes observed by one call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone, Debug)]
struct Peer {
    state: AwarenessState,
    /// Local receive time; liveness never depends on the peer's wall clock.
    heard_at: DateTime<Utc>,
}

/// Tracks local and remote presence and evicts peers that went silent.
///
/// Callers pass `now` explicitly so eviction is testable without sleeping.
#[derive(Debug)]
pub struct AwarenessManager {
    local: AwarenessState,
    peers: BTreeMap<ReplicaId, Peer>,
    liveness: Duration,
    subscribers: Subscribers<AwarenessChange>,
}

impl AwarenessManager {
    /// `liveness` is heartbeat interval × missed heartbeats.
    pub fn new(local: AwarenessState, liveness: Duration) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
            liveness,
            subscribers: Subscribers::default(),
        }
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            replica: self.local.replica.clone(),
            state: Some(self.local.clone()),
        }
    }

    /// Replace the local state and return the update to broadcast. The
    /// replica id cannot be changed this way, and `last_seen` is restamped
    /// so peers never treat the change as older than a prior heartbeat.
    pub fn set_local_state(
        &mut self,
        mut state: AwarenessState,
        now: DateTime<Utc>,
    ) -> AwarenessUpdate {
        state.replica = self.local.replica.clone();
        state.last_seen = now.max(self.local.last_seen);
        self.local = state;
        self.local_update()
    }

    /// Refresh `last_seen` for a heartbeat broadcast. Never moves backwards.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> AwarenessUpdate {
        self.local.last_seen = now.max(self.local.last_seen);
        self.local_update()
    }

    /// Update announcing that this replica is leaving.
    pub fn removal_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            replica: self.local.replica.clone(),
            state: None,
        }
    }

    /// Merge a remote update. Older states (by `last_seen`) are ignored.
    pub fn apply_remote(&mut self, update: AwarenessUpdate, now: DateTime<Utc>) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        if update.replica == self.local.replica {
            return change;
        }
        match update.state {
            None => {
                if self.peers.remove(&update.replica).is_some() {
                    change.removed.push(update.replica);
                }
            }
            Some(state) => {
                if state.replica != update.replica {
                    tracing::warn!(
                        "ignoring awareness for {} sent as {}",
                        state.replica,
                        update.replica
                    );
                    return change;
                }
                match self.peers.get_mut(&update.replica) {
                    Some(peer) if peer.state.last_seen > state.last_seen => {}
                    Some(peer) => {
                        peer.heard_at = now;
                        let changed = !peer.state.same_presence(&state);
                        peer.state = state;
                        if changed {
                            change.updated.push(update.replica);
                        }
                    }
                    None => {
                        self.peers.insert(
                            update.replica.clone(),
                            Peer {
                                state,
                                heard_at: now,
                            },
                        );
                        change.added.push(update.replica);
                    }
                }
            }
        }
        self.publish(&change);
        change
    }

    /// Drop peers not heard from within the liveness window.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> AwarenessChange {
        let liveness = self.liveness;
        let stale: Vec<ReplicaId> = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                (now - peer.heard_at)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed > liveness)
            })
            .map(|(replica, _)| replica.clone())
            .collect();
        for replica in &stale {
            self.peers.remove(replica);
        }
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "evicted silent peers");
        }
        let change = AwarenessChange {
            removed: stale,
            ..AwarenessChange::default()
        };
        self.publish(&change);
        change
    }

    /// Forget every remote peer, e.g. when the session closes.
    pub fn clear_remote(&mut self) -> AwarenessChange {
        let removed: Vec<ReplicaId> = std::mem::take(&mut self.peers).into_keys().collect();
        let change = AwarenessChange {
            removed,
            ..AwarenessChange::default()
        };
        self.publish(&change);
        change
    }

    pub fn peer(&self, replica: &ReplicaId) -> Option<&AwarenessState> {
        self.peers.get(replica).map(|p| &p.state)
    }

    /// Remote states ordered by replica id.
    pub fn peers(&self) -> Vec<&AwarenessState> {
        self.peers.values().map(|p| &p.state).collect()
    }

    pub fn subscribe(
        &mut self,
        callback: impl Fn(&AwarenessChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn publish(&self, change: &AwarenessChange) {
        if !change.is_empty() {
            self.subscribers.publish(change);
        }
    }
}
