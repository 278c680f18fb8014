//! Typed change batches and a small publish/subscribe registry.

use std::collections::BTreeMap;

use crate::ids::NodeId;
use crate::ops::NodeKind;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChangeKind {
    Created { kind: NodeKind, parent: NodeId },
    Updated { keys: Vec<String> },
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeChange {
    pub node: NodeId,
    pub kind: ChangeKind,
}

/// Everything one local mutation or one applied remote batch changed.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeBatch {
    pub origin: ChangeOrigin,
    pub changes: Vec<NodeChange>,
}

impl ChangeBatch {
    pub fn new(origin: ChangeOrigin) -> Self {
        Self {
            origin,
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Record a change, folding repeated attribute updates of the same node
    /// into a single entry.
    pub fn push(&mut self, change: NodeChange) {
        if let ChangeKind::Updated { keys } = &change.kind {
            if let Some(existing) = self.changes.iter_mut().find(|c| {
                c.node == change.node && matches!(c.kind, ChangeKind::Updated { .. })
            }) {
                if let ChangeKind::Updated { keys: existing_keys } = &mut existing.kind {
                    for key in keys {
                        if !existing_keys.contains(key) {
                            existing_keys.push(key.clone());
                        }
                    }
                }
                return;
            }
        }
        self.changes.push(change);
    }

    pub fn extend(&mut self, changes: impl IntoIterator<Item = NodeChange>) {
        for change in changes {
            self.push(change);
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Callback registry. Callbacks run synchronously on the publishing thread in
/// subscription order.
pub struct Subscribers<E> {
    next_id: u64,
    callbacks: BTreeMap<SubscriptionId, Callback<E>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            callbacks: BTreeMap::new(),
        }
    }
}

impl<E> Subscribers<E> {
    pub fn subscribe(&mut self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.callbacks.insert(id, Box::new(callback));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    pub fn publish(&self, event: &E) {
        for callback in self.callbacks.values() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> std::fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn updates_to_same_node_fold() {
        let node = NodeId::ROOT;
        let mut batch = ChangeBatch::new(ChangeOrigin::Local);
        batch.push(NodeChange {
            node: node.clone(),
            kind: ChangeKind::Updated {
                keys: vec!["name".into()],
            },
        });
        batch.push(NodeChange {
            node: node.clone(),
            kind: ChangeKind::Updated {
                keys: vec!["name".into(), "proto".into()],
            },
        });
        assert_eq!(
            batch.changes,
            vec![NodeChange {
                node,
                kind: ChangeKind::Updated {
                    keys: vec!["name".into(), "proto".into()]
                },
            }]
        );
    }

    #[test]
    fn unsubscribed_callbacks_stop_firing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut subs: Subscribers<u32> = Subscribers::default();
        let counter = hits.clone();
        let id = subs.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subs.publish(&1);
        assert!(subs.unsubscribe(id));
        subs.publish(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(subs.is_empty());
    }
}
