//! Domain facade over the tree store: Applications and Topics by name, typed
//! change notifications, and an outbox of operations awaiting broadcast.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::events::{ChangeBatch, ChangeOrigin, SubscriptionId, Subscribers};
use crate::ids::{NodeId, ReplicaId};
use crate::ops::{NodeKind, Operation};
use crate::resync::{ResyncOutcome, ResyncRequest, ResyncResponse};
use crate::snapshot::{ApplicationSnapshot, TopicSnapshot, TreeSnapshot};
use crate::traits::{Clock, LamportClock, MemoryStorage, Storage};
use crate::tree::{ApplyDelta, Commit, TreeStore};
use crate::version_vector::VersionVector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    Publish,
    Subscribe,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Publish => "publish",
            Direction::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "publish" => Ok(Direction::Publish),
            "subscribe" => Ok(Direction::Subscribe),
            other => Err(Error::InvalidOperation(format!(
                "direction must be publish or subscribe, got `{other}`"
            ))),
        }
    }
}

/// What removing an Application does to its Topics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeletePolicy {
    /// Tombstone every live Topic along with the Application.
    #[default]
    Cascade,
    /// Leave Topics alive; they show up in `orphans()`.
    Orphan,
}

/// The mutation and query surface the UI layer talks to.
///
/// Implemented by the offline [`Document`] and by the networked shared
/// document; a host picks one at startup.
pub trait TopicStore {
    fn create_application(&mut self, name: &str, description: &str) -> Result<NodeId>;

    fn create_topic(
        &mut self,
        application: &NodeId,
        name: &str,
        proto: &str,
        direction: Direction,
        description: &str,
    ) -> Result<NodeId>;

    /// Write attributes. `name` must stay non-empty and unique among live
    /// siblings; `direction` must parse.
    fn update(&mut self, node: &NodeId, attributes: Vec<(String, String)>) -> Result<()>;

    fn remove(&mut self, node: &NodeId) -> Result<()>;

    fn snapshot(&self) -> TreeSnapshot;

    fn subscribe(&mut self, callback: Box<dyn Fn(&ChangeBatch) + Send + Sync>) -> SubscriptionId;

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;

    fn rename(&mut self, node: &NodeId, name: &str) -> Result<()> {
        self.update(node, vec![("name".to_string(), name.to_string())])
    }

    fn find_application(&self, name: &str) -> Option<ApplicationSnapshot> {
        self.snapshot().application(name).cloned()
    }

    fn find_topic(&self, application: &str, topic: &str) -> Option<TopicSnapshot> {
        self.snapshot()
            .application(application)
            .and_then(|app| app.topic(topic))
            .cloned()
    }

    fn remove_application(&mut self, name: &str) -> Result<()> {
        let app = self
            .find_application(name)
            .ok_or_else(|| Error::NodeNotFound(format!("application `{name}`")))?;
        self.remove(&app.id)
    }

    fn remove_topic(&mut self, application: &str, topic: &str) -> Result<()> {
        let found = self
            .find_topic(application, topic)
            .ok_or_else(|| Error::NodeNotFound(format!("topic `{application}/{topic}`")))?;
        self.remove(&found.id)
    }
}

/// Offline document: a tree store plus subscribers and an outbox.
pub struct Document<S = MemoryStorage, C = LamportClock>
where
    S: Storage,
    C: Clock,
{
    store: TreeStore<S, C>,
    policy: DeletePolicy,
    subscribers: Subscribers<ChangeBatch>,
    outbox: Vec<Operation>,
}

impl Document {
    /// In-memory document for `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        Self::with_store(
            TreeStore::new(replica, MemoryStorage::default(), LamportClock::default()),
            DeletePolicy::default(),
        )
    }
}

impl<S, C> Document<S, C>
where
    S: Storage,
    C: Clock,
{
    pub fn with_store(store: TreeStore<S, C>, policy: DeletePolicy) -> Self {
        Self {
            store,
            policy,
            subscribers: Subscribers::default(),
            outbox: Vec::new(),
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        self.store.replica_id()
    }

    pub fn store(&self) -> &TreeStore<S, C> {
        &self.store
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.policy
    }

    pub fn set_delete_policy(&mut self, policy: DeletePolicy) {
        self.policy = policy;
    }

    /// Live Topics whose Application was removed.
    pub fn orphans(&self) -> Vec<TopicSnapshot> {
        self.store.orphans()
    }

    pub fn state_vector(&self) -> &VersionVector {
        self.store.state_vector()
    }

    /// Local operations produced since the last call, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Merge remote operations and notify subscribers once for the batch.
    pub fn apply_remote(&mut self, ops: Vec<Operation>) -> ApplyDelta {
        let delta = self.store.apply_remote_batch(ops);
        self.publish(ChangeOrigin::Remote, &delta.changes);
        delta
    }

    pub fn resync_request(&self) -> ResyncRequest {
        self.store.resync_request()
    }

    pub fn answer_resync(&self, request: &ResyncRequest) -> Result<ResyncResponse> {
        self.store.answer_resync(request)
    }

    pub fn apply_resync(&mut self, response: ResyncResponse) -> Result<ResyncOutcome> {
        let outcome = self.store.apply_resync(response)?;
        self.publish(ChangeOrigin::Remote, &outcome.delta.changes);
        Ok(outcome)
    }

    fn publish(&self, origin: ChangeOrigin, changes: &[crate::events::NodeChange]) {
        let mut batch = ChangeBatch::new(origin);
        batch.extend(changes.iter().cloned());
        if !batch.is_empty() {
            self.subscribers.publish(&batch);
        }
    }

    fn commit(&mut self, commits: Vec<Commit>) {
        let mut batch = ChangeBatch::new(ChangeOrigin::Local);
        for commit in commits {
            batch.extend(commit.changes);
            self.outbox.extend(commit.ops);
        }
        if !batch.is_empty() {
            self.subscribers.publish(&batch);
        }
    }

    fn live_children_named(&self, parent: &NodeId, name: &str, except: Option<&NodeId>) -> bool {
        self.store
            .children(parent)
            .unwrap_or_default()
            .iter()
            .filter(|child| Some(*child) != except)
            .filter(|child| !self.store.is_tombstoned(child))
            .any(|child| self.store.attribute(child, "name").as_deref() == Some(name))
    }

    fn check_update(&self, node: &NodeId, attributes: &[(String, String)]) -> Result<()> {
        for (key, value) in attributes {
            match key.as_str() {
                "name" => {
                    let name = required_name(value)?;
                    if let Some(parent) = self.store.parent(node) {
                        if self.live_children_named(&parent, name, Some(node)) {
                            return Err(Error::InvalidOperation(format!(
                                "`{name}` is already used by a sibling"
                            )));
                        }
                    }
                }
                "direction" => {
                    Direction::from_str(value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn required_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidOperation("name must not be empty".into()));
    }
    Ok(trimmed)
}

impl<S, C> TopicStore for Document<S, C>
where
    S: Storage,
    C: Clock,
{
    fn create_application(&mut self, name: &str, description: &str) -> Result<NodeId> {
        let name = required_name(name)?;
        if self.live_children_named(&NodeId::ROOT, name, None) {
            return Err(Error::InvalidOperation(format!(
                "application `{name}` already exists"
            )));
        }
        let commit = self.store.create_node(
            &NodeId::ROOT,
            NodeKind::Application,
            vec![
                ("name".to_string(), name.to_string()),
                ("description".to_string(), description.to_string()),
            ],
        )?;
        let id = created_id(&commit)?;
        self.commit(vec![commit]);
        Ok(id)
    }

    fn create_topic(
        &mut self,
        application: &NodeId,
        name: &str,
        proto: &str,
        direction: Direction,
        description: &str,
    ) -> Result<NodeId> {
        let name = required_name(name)?;
        if self.live_children_named(application, name, None) {
            return Err(Error::InvalidOperation(format!(
                "topic `{name}` already exists in {application}"
            )));
        }
        let commit = self.store.create_node(
            application,
            NodeKind::Topic,
            vec![
                ("name".to_string(), name.to_string()),
                ("proto".to_string(), proto.to_string()),
                ("direction".to_string(), direction.as_str().to_string()),
                ("description".to_string(), description.to_string()),
            ],
        )?;
        let id = created_id(&commit)?;
        self.commit(vec![commit]);
        Ok(id)
    }

    fn update(&mut self, node: &NodeId, attributes: Vec<(String, String)>) -> Result<()> {
        if !self.store.is_known(node) {
            return Err(Error::NodeNotFound(node.to_string()));
        }
        self.check_update(node, &attributes)?;
        let attributes = attributes.into_iter().map(|(key, value)| {
            let value = if key == "name" {
                value.trim().to_string()
            } else {
                value
            };
            (key, value)
        });
        let commit = self.store.set_attributes(node, attributes)?;
        self.commit(vec![commit]);
        Ok(())
    }

    fn remove(&mut self, node: &NodeId) -> Result<()> {
        let mut commits = vec![self.store.delete_node(node)?];
        if self.policy == DeletePolicy::Cascade
            && self.store.kind(node) == Some(NodeKind::Application)
        {
            for topic in self.store.children(node).unwrap_or_default() {
                if !self.store.is_tombstoned(&topic) {
                    commits.push(self.store.delete_node(&topic)?);
                }
            }
        }
        self.commit(commits);
        Ok(())
    }

    fn snapshot(&self) -> TreeSnapshot {
        self.store.snapshot()
    }

    fn subscribe(&mut self, callback: Box<dyn Fn(&ChangeBatch) + Send + Sync>) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }
}

fn created_id(commit: &Commit) -> Result<NodeId> {
    commit
        .created()
        .cloned()
        .ok_or_else(|| Error::InvalidOperation("create produced no node".into()))
}
