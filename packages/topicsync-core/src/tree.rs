use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::attrs::{AttributeMap, Attributes};
use crate::error::{Error, Result};
use crate::events::{ChangeKind, NodeChange};
use crate::ids::{IdGenerator, Lamport, NodeId, OperationId, ReplicaId};
use crate::ops::{cmp_ops, NodeKind, Operation, OperationKind, Stamp};
use crate::snapshot::{ApplicationSnapshot, TopicSnapshot, TreeSnapshot, ROOT_VERSION, ROOT_XMLNS};
use crate::traits::{Clock, Storage};
use crate::version_vector::VersionVector;

#[derive(Clone, Debug)]
struct NodeState {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: BTreeSet<NodeId>,
    attributes: AttributeMap,
    deleted: bool,
    deleted_at: Option<Lamport>,
}

impl NodeState {
    fn new_root() -> Self {
        let stamp = Stamp::default();
        let mut attributes = AttributeMap::new();
        attributes.write("xmlns", ROOT_XMLNS, &stamp, 0);
        attributes.write("version", ROOT_VERSION, &stamp, 1);
        Self {
            kind: NodeKind::Root,
            parent: None,
            children: BTreeSet::new(),
            attributes,
            deleted: false,
            deleted_at: None,
        }
    }
}

/// Result of merging one or more operations into the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyDelta {
    /// Visible changes, in application order.
    pub changes: Vec<NodeChange>,
    /// Operations integrated, including ones released from the orphan buffer.
    pub applied: usize,
    /// Operations parked until the node they reference arrives.
    pub buffered: usize,
    /// Already-seen operations that were ignored.
    pub duplicates: usize,
    /// Released operations that turned out to be malformed and were dropped.
    pub rejected: usize,
}

impl ApplyDelta {
    pub fn merge(&mut self, other: ApplyDelta) {
        self.changes.extend(other.changes);
        self.applied += other.applied;
        self.buffered += other.buffered;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
    }
}

/// Operations produced by a local mutation together with what they changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Commit {
    pub ops: Vec<Operation>,
    pub changes: Vec<NodeChange>,
}

impl Commit {
    /// The node a create commit produced.
    pub fn created(&self) -> Option<&NodeId> {
        self.ops.iter().find_map(|op| match &op.kind {
            OperationKind::Create { node, .. } => Some(node),
            _ => None,
        })
    }
}

enum Integration {
    Applied {
        changes: Vec<NodeChange>,
        created: Option<NodeId>,
    },
    Parked,
    Duplicate,
}

/// Replicated Application/Topic tree.
///
/// Every operation's effect depends only on its target, its own stamp, and
/// the merged state, so any delivery order converges. Operations that
/// reference a node this replica has not seen yet are parked and released
/// once the node's create arrives.
pub struct TreeStore<S, C>
where
    S: Storage,
    C: Clock,
{
    ids: IdGenerator,
    storage: S,
    clock: C,
    applied: VersionVector,
    nodes: HashMap<NodeId, NodeState>,
    /// Parked operations keyed by the node they are waiting for.
    pending: HashMap<NodeId, Vec<Operation>>,
    pending_ids: HashSet<OperationId>,
}

impl<S, C> TreeStore<S, C>
where
    S: Storage,
    C: Clock,
{
    pub fn new(replica_id: ReplicaId, storage: S, clock: C) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, NodeState::new_root());
        Self {
            ids: IdGenerator::new(replica_id),
            storage,
            clock,
            applied: VersionVector::new(),
            nodes,
            pending: HashMap::new(),
            pending_ids: HashSet::new(),
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        self.ids.replica()
    }

    /// Create a node under `parent` and record the create operation.
    pub fn create_node(
        &mut self,
        parent: &NodeId,
        kind: NodeKind,
        attributes: Vec<(String, String)>,
    ) -> Result<Commit> {
        let Some(required) = kind.required_parent() else {
            return Err(Error::InvalidOperation("the root cannot be created".into()));
        };
        let Some(parent_state) = self.nodes.get(parent) else {
            return Err(Error::InvalidParent(format!("{parent} does not exist")));
        };
        if parent_state.deleted {
            return Err(Error::InvalidParent(format!("{parent} is deleted")));
        }
        if parent_state.kind != required {
            return Err(Error::InvalidParent(format!(
                "{} cannot be placed under {}",
                kind.as_str(),
                parent_state.kind.as_str()
            )));
        }
        check_unique_keys(&attributes).map_err(Error::InvalidOperation)?;

        let id = self.ids.next_operation_id();
        let lamport = self.clock.tick();
        let op = Operation::create(&id.replica, id.counter, lamport, kind, parent.clone(), attributes);
        self.commit_local(vec![op])
    }

    /// Write attributes, one `SetAttr` per key. Tombstoned nodes still record
    /// the writes so replicas that have not seen the delete replay identically.
    pub fn set_attributes<K, V>(
        &mut self,
        node: &NodeId,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Commit>
    where
        K: Into<String>,
        V: Into<String>,
    {
        if node.is_root() {
            return Err(Error::InvalidOperation("root attributes are fixed".into()));
        }
        if !self.nodes.contains_key(node) {
            return Err(Error::NodeNotFound(node.to_string()));
        }
        let ops = attributes
            .into_iter()
            .map(|(key, value)| {
                let id = self.ids.next_operation_id();
                let lamport = self.clock.tick();
                Operation::set_attr(&id.replica, id.counter, lamport, node.clone(), key, value)
            })
            .collect();
        self.commit_local(ops)
    }

    /// Tombstone a node. Children are left alone; cascading is the caller's
    /// policy.
    pub fn delete_node(&mut self, node: &NodeId) -> Result<Commit> {
        if node.is_root() {
            return Err(Error::InvalidOperation("the root cannot be deleted".into()));
        }
        if !self.nodes.contains_key(node) {
            return Err(Error::NodeNotFound(node.to_string()));
        }
        let id = self.ids.next_operation_id();
        let lamport = self.clock.tick();
        let op = Operation::delete(&id.replica, id.counter, lamport, node.clone());
        self.commit_local(vec![op])
    }

    /// Apply an operation received from a remote peer. Idempotent.
    ///
    /// Malformed operations are rejected with [`Error::MalformedOperation`]
    /// and leave the store untouched.
    pub fn apply_remote(&mut self, op: Operation) -> Result<ApplyDelta> {
        validate_shape(&op)?;
        self.clock.observe(op.meta.lamport);
        self.ingest(op, true)
    }

    /// Apply a batch, dropping (and logging) malformed operations instead of
    /// failing the whole batch.
    pub fn apply_remote_batch(&mut self, ops: impl IntoIterator<Item = Operation>) -> ApplyDelta {
        let mut delta = ApplyDelta::default();
        for op in ops {
            match self.apply_remote(op) {
                Ok(d) => delta.merge(d),
                Err(err) => {
                    tracing::warn!("dropping remote operation: {err}");
                    delta.rejected += 1;
                }
            }
        }
        delta
    }

    /// Rebuild materialized state from storage, e.g. after a restart.
    pub fn replay_from_storage(&mut self) -> Result<()> {
        let mut ops = self.storage.load_all()?;
        ops.sort_by(cmp_ops);
        self.nodes.clear();
        self.nodes.insert(NodeId::ROOT, NodeState::new_root());
        self.applied = VersionVector::new();
        self.pending.clear();
        self.pending_ids.clear();
        for op in ops {
            self.clock.observe(op.meta.lamport);
            if op.replica() == self.ids.replica() {
                self.ids.resume_from(op.meta.id.counter);
            }
            self.ingest(op, false)?;
        }
        let absorbed = self.storage.absorbed()?;
        self.applied.merge(&absorbed);
        Ok(())
    }

    /// Deterministic projection: Root → Applications → Topics, tombstones and
    /// Topics of deleted Applications excluded.
    pub fn snapshot(&self) -> TreeSnapshot {
        let Some(root) = self.nodes.get(&NodeId::ROOT) else {
            return TreeSnapshot::default();
        };
        let applications = root
            .children
            .iter()
            .filter_map(|app_id| {
                let app = self.nodes.get(app_id)?;
                if app.deleted {
                    return None;
                }
                let topics = app
                    .children
                    .iter()
                    .filter_map(|topic_id| {
                        let topic = self.nodes.get(topic_id)?;
                        (!topic.deleted).then(|| TopicSnapshot {
                            id: topic_id.clone(),
                            attributes: topic.attributes.to_pairs(),
                        })
                    })
                    .collect();
                Some(ApplicationSnapshot {
                    id: app_id.clone(),
                    attributes: app.attributes.to_pairs(),
                    topics,
                })
            })
            .collect();
        TreeSnapshot {
            xmlns: root.attributes.get("xmlns").unwrap_or(ROOT_XMLNS).to_string(),
            version: root.attributes.get("version").unwrap_or(ROOT_VERSION).to_string(),
            applications,
        }
    }

    /// Live Topics whose Application has been deleted.
    pub fn orphans(&self) -> Vec<TopicSnapshot> {
        let mut orphans: Vec<TopicSnapshot> = self
            .nodes
            .iter()
            .filter(|(_, state)| state.kind == NodeKind::Topic && !state.deleted)
            .filter(|(_, state)| {
                state
                    .parent
                    .as_ref()
                    .and_then(|p| self.nodes.get(p))
                    .map_or(true, |parent| parent.deleted)
            })
            .map(|(id, state)| TopicSnapshot {
                id: id.clone(),
                attributes: state.attributes.to_pairs(),
            })
            .collect();
        orphans.sort_by(|a, b| a.id.cmp(&b.id));
        orphans
    }

    /// Children of a node in sibling order, tombstones included.
    pub fn children(&self, parent: &NodeId) -> Option<Vec<NodeId>> {
        self.nodes
            .get(parent)
            .map(|n| n.children.iter().cloned().collect())
    }

    pub fn parent(&self, node: &NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.parent.clone())
    }

    pub fn kind(&self, node: &NodeId) -> Option<NodeKind> {
        self.nodes.get(node).map(|n| n.kind)
    }

    pub fn attributes(&self, node: &NodeId) -> Option<Attributes> {
        self.nodes.get(node).map(|n| n.attributes.to_pairs())
    }

    pub fn attribute(&self, node: &NodeId, key: &str) -> Option<String> {
        self.nodes
            .get(node)
            .and_then(|n| n.attributes.get(key))
            .map(str::to_string)
    }

    pub fn is_tombstoned(&self, node: &NodeId) -> bool {
        self.nodes.get(node).is_some_and(|n| n.deleted)
    }

    pub fn deleted_at(&self, node: &NodeId) -> Option<Lamport> {
        self.nodes.get(node).and_then(|n| n.deleted_at)
    }

    /// Whether the node's create has been applied (tombstones count).
    pub fn is_known(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Operations parked in the orphan buffer.
    pub fn pending_len(&self) -> usize {
        self.pending_ids.len()
    }

    /// Current Lamport time as observed by this replica.
    pub fn lamport(&self) -> Lamport {
        self.clock.now()
    }

    /// Ids of every applied operation.
    pub fn state_vector(&self) -> &VersionVector {
        &self.applied
    }

    pub fn operations(&self) -> Result<Vec<Operation>> {
        let mut ops = self.storage.load_all()?;
        ops.sort_by(cmp_ops);
        Ok(ops)
    }

    /// Applied operations not covered by `known`, in causal order.
    pub fn missing_operations(&self, known: &VersionVector) -> Result<Vec<Operation>> {
        let mut ops = self.storage.load_missing(known)?;
        ops.sort_by(cmp_ops);
        Ok(ops)
    }

    /// Compacted history with the same merged effect as the full log.
    /// Superseded attribute writes are skipped unless they introduced the key
    /// (key order depends on it). Only the latest delete per node is kept.
    pub fn bootstrap_operations(&self) -> Result<Vec<Operation>> {
        let mut ops: Vec<Operation> = self
            .storage
            .load_all()?
            .into_iter()
            .filter(|op| match &op.kind {
                OperationKind::Create { .. } => true,
                OperationKind::SetAttr { node, key, .. } => {
                    self.nodes.get(node).is_some_and(|n| {
                        let stamp = op.stamp();
                        n.attributes.stamp(key) == Some(&stamp)
                            || n.attributes.origin(key) == Some(&stamp)
                    })
                }
                OperationKind::Delete { node } => {
                    self.nodes.get(node).and_then(|n| n.deleted_at) == Some(op.meta.lamport)
                }
            })
            .collect();
        ops.sort_by(cmp_ops);
        ops.dedup_by(|a, b| match (&a.kind, &b.kind) {
            (OperationKind::Delete { node: x }, OperationKind::Delete { node: y }) => {
                x == y && a.meta.lamport == b.meta.lamport
            }
            _ => false,
        });
        Ok(ops)
    }

    /// Record that the effects of `known` are present locally even though the
    /// individual operations were not all received (bootstrap compaction).
    pub fn absorb_state_vector(&mut self, known: &VersionVector) -> Result<()> {
        self.storage.absorb(known)?;
        self.applied.merge(known);
        Ok(())
    }

    /// Validate invariants: parent links agree with child sets, the kind
    /// hierarchy holds, and the root is alive. Intended for tests and debugging.
    pub fn validate_invariants(&self) -> Result<()> {
        let root = self
            .nodes
            .get(&NodeId::ROOT)
            .ok_or_else(|| Error::InvalidOperation("root missing".into()))?;
        if root.deleted || root.parent.is_some() {
            return Err(Error::InvalidOperation("root must be live and parentless".into()));
        }
        for (id, state) in &self.nodes {
            if id.is_root() {
                continue;
            }
            let parent_id = state
                .parent
                .as_ref()
                .ok_or_else(|| Error::InvalidOperation(format!("{id} has no parent")))?;
            let parent = self
                .nodes
                .get(parent_id)
                .ok_or_else(|| Error::InvalidOperation(format!("{id} parent missing")))?;
            if Some(parent.kind) != state.kind.required_parent() {
                return Err(Error::InvalidOperation(format!("{id} violates kind hierarchy")));
            }
            if !parent.children.contains(id) {
                return Err(Error::InvalidOperation(format!("{id} not listed by parent")));
            }
            for child in &state.children {
                if self.nodes.get(child).and_then(|c| c.parent.as_ref()) != Some(id) {
                    return Err(Error::InvalidOperation("child parent mismatch".into()));
                }
            }
        }
        Ok(())
    }

    fn commit_local(&mut self, ops: Vec<Operation>) -> Result<Commit> {
        let mut commit = Commit::default();
        for op in ops {
            let delta = self.ingest(op.clone(), true)?;
            commit.changes.extend(delta.changes);
            commit.ops.push(op);
        }
        Ok(commit)
    }
}

impl<S, C> TreeStore<S, C>
where
    S: Storage,
    C: Clock,
{
    fn ingest(&mut self, op: Operation, persist: bool) -> Result<ApplyDelta> {
        let mut delta = ApplyDelta::default();
        let mut queue = VecDeque::from([op]);
        let mut head = true;
        while let Some(op) = queue.pop_front() {
            let outcome = match self.integrate(&op, persist) {
                Ok(outcome) => outcome,
                Err(err) if head => return Err(err),
                Err(err) => {
                    tracing::warn!("dropping released operation {:?}: {err}", op.meta.id);
                    delta.rejected += 1;
                    continue;
                }
            };
            head = false;
            match outcome {
                Integration::Applied { changes, created } => {
                    delta.applied += 1;
                    delta.changes.extend(changes);
                    if let Some(node) = created {
                        if let Some(waiting) = self.pending.remove(&node) {
                            for parked in waiting {
                                self.pending_ids.remove(&parked.meta.id);
                                queue.push_back(parked);
                            }
                        }
                    }
                }
                Integration::Parked => delta.buffered += 1,
                Integration::Duplicate => delta.duplicates += 1,
            }
        }
        Ok(delta)
    }

    fn integrate(&mut self, op: &Operation, persist: bool) -> Result<Integration> {
        let id = &op.meta.id;
        if self.applied.contains(&id.replica, id.counter) || self.pending_ids.contains(id) {
            return Ok(Integration::Duplicate);
        }

        let waiting_on = match &op.kind {
            OperationKind::Create { node, kind, parent, .. } => {
                if self.nodes.contains_key(node) {
                    return Err(Error::MalformedOperation(format!(
                        "{node} already created by another operation"
                    )));
                }
                match self.nodes.get(parent) {
                    Some(parent_state) if Some(parent_state.kind) != kind.required_parent() => {
                        return Err(Error::MalformedOperation(format!(
                            "{} cannot be placed under {}",
                            kind.as_str(),
                            parent_state.kind.as_str()
                        )));
                    }
                    Some(_) => None,
                    None => Some(parent.clone()),
                }
            }
            OperationKind::SetAttr { node, .. } | OperationKind::Delete { node } => {
                (!self.nodes.contains_key(node)).then(|| node.clone())
            }
        };

        if let Some(missing) = waiting_on {
            tracing::debug!("parking {:?} until {missing} arrives", op.meta.id);
            self.pending_ids.insert(id.clone());
            self.pending.entry(missing).or_default().push(op.clone());
            return Ok(Integration::Parked);
        }

        if persist {
            self.storage.append(op.clone())?;
        }
        self.applied.observe(&id.replica, id.counter);
        Ok(self.apply_effect(op))
    }

    fn apply_effect(&mut self, op: &Operation) -> Integration {
        let stamp = op.stamp();
        match &op.kind {
            OperationKind::Create {
                node,
                kind,
                parent,
                attributes,
            } => {
                let mut attrs = AttributeMap::new();
                for (slot, (key, value)) in attributes.iter().enumerate() {
                    attrs.write(key, value, &stamp, slot as u32);
                }
                self.nodes.insert(
                    node.clone(),
                    NodeState {
                        kind: *kind,
                        parent: Some(parent.clone()),
                        children: BTreeSet::new(),
                        attributes: attrs,
                        deleted: false,
                        deleted_at: None,
                    },
                );
                if let Some(parent_state) = self.nodes.get_mut(parent) {
                    parent_state.children.insert(node.clone());
                }
                Integration::Applied {
                    changes: vec![NodeChange {
                        node: node.clone(),
                        kind: ChangeKind::Created {
                            kind: *kind,
                            parent: parent.clone(),
                        },
                    }],
                    created: Some(node.clone()),
                }
            }
            OperationKind::SetAttr { node, key, value } => {
                let mut changes = Vec::new();
                if let Some(state) = self.nodes.get_mut(node) {
                    if state.attributes.write(key, value, &stamp, 0) && !state.deleted {
                        changes.push(NodeChange {
                            node: node.clone(),
                            kind: ChangeKind::Updated {
                                keys: vec![key.clone()],
                            },
                        });
                    }
                }
                Integration::Applied {
                    changes,
                    created: None,
                }
            }
            OperationKind::Delete { node } => {
                let mut changes = Vec::new();
                if let Some(state) = self.nodes.get_mut(node) {
                    state.deleted_at = Some(state.deleted_at.map_or(op.meta.lamport, |at| {
                        at.max(op.meta.lamport)
                    }));
                    if !state.deleted {
                        state.deleted = true;
                        changes.push(NodeChange {
                            node: node.clone(),
                            kind: ChangeKind::Deleted,
                        });
                    }
                }
                Integration::Applied {
                    changes,
                    created: None,
                }
            }
        }
    }
}

fn check_unique_keys(attributes: &[(String, String)]) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for (key, _) in attributes {
        if !seen.insert(key.as_str()) {
            return Err(format!("duplicate attribute key `{key}`"));
        }
    }
    Ok(())
}

/// Largest counter or clock accepted from a peer. Leaves headroom so local
/// ticks after observing it cannot overflow.
const STAMP_LIMIT: u64 = u64::MAX >> 1;

/// Checks that need nothing but the operation itself.
fn validate_shape(op: &Operation) -> Result<()> {
    if op.meta.id.counter == 0 || op.meta.lamport == 0 {
        return Err(Error::MalformedOperation("zero counter or clock".into()));
    }
    if op.meta.id.counter > STAMP_LIMIT || op.meta.lamport > STAMP_LIMIT {
        return Err(Error::MalformedOperation(format!(
            "counter {} or clock {} out of range",
            op.meta.id.counter, op.meta.lamport
        )));
    }
    match &op.kind {
        OperationKind::Create {
            node,
            kind,
            parent,
            attributes,
        } => {
            if *kind == NodeKind::Root {
                return Err(Error::MalformedOperation("root cannot be created".into()));
            }
            if node.clock != op.meta.lamport || &node.replica != op.replica() {
                return Err(Error::MalformedOperation(format!(
                    "{node} does not match the operation stamp"
                )));
            }
            if parent == node {
                return Err(Error::MalformedOperation(format!("{node} is its own parent")));
            }
            check_unique_keys(attributes).map_err(Error::MalformedOperation)
        }
        OperationKind::SetAttr { node, .. } | OperationKind::Delete { node } if node.is_root() => {
            Err(Error::MalformedOperation(format!(
                "{} cannot target the root",
                op.kind.name()
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{LamportClock, MemoryStorage};

    fn store(replica: &[u8]) -> TreeStore<MemoryStorage, LamportClock> {
        TreeStore::new(
            ReplicaId::new(replica),
            MemoryStorage::default(),
            LamportClock::default(),
        )
    }

    fn name(value: &str) -> Vec<(String, String)> {
        vec![("name".to_string(), value.to_string())]
    }

    #[test]
    fn creates_applications_and_topics() {
        let mut tree = store(b"a");
        let app = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("Nav"))
            .unwrap();
        let app_id = app.created().unwrap().clone();
        let topic = tree
            .create_node(&app_id, NodeKind::Topic, name("pose"))
            .unwrap();
        let topic_id = topic.created().unwrap().clone();

        assert_eq!(tree.parent(&topic_id), Some(app_id.clone()));
        assert_eq!(tree.children(&NodeId::ROOT).unwrap(), vec![app_id.clone()]);
        assert_eq!(tree.kind(&topic_id), Some(NodeKind::Topic));
        assert_eq!(app_id.clock, 1);
        assert_eq!(topic_id.clock, 2);
        tree.validate_invariants().unwrap();
    }

    #[test]
    fn rejects_invalid_parents_without_mutating() {
        let mut tree = store(b"a");
        let err = tree
            .create_node(&NodeId::ROOT, NodeKind::Topic, name("t"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent(_)));

        let missing = NodeId::new(&ReplicaId::new(b"x"), 9);
        let err = tree
            .create_node(&missing, NodeKind::Topic, name("t"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent(_)));

        let app = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("a"))
            .unwrap();
        let app_id = app.created().unwrap().clone();
        let err = tree
            .create_node(&app_id, NodeKind::Application, name("nested"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent(_)));

        tree.delete_node(&app_id).unwrap();
        let err = tree
            .create_node(&app_id, NodeKind::Topic, name("late"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParent(_)));

        // one create + one delete recorded, nothing from the failures
        assert_eq!(tree.operations().unwrap().len(), 2);
        assert_eq!(tree.lamport(), 2);
    }

    #[test]
    fn unknown_nodes_are_reported() {
        let mut tree = store(b"a");
        let missing = NodeId::new(&ReplicaId::new(b"x"), 9);
        assert_eq!(
            tree.set_attributes(&missing, [("name", "x")]).unwrap_err(),
            Error::NodeNotFound(missing.to_string())
        );
        assert_eq!(
            tree.delete_node(&missing).unwrap_err(),
            Error::NodeNotFound(missing.to_string())
        );
        assert!(matches!(
            tree.delete_node(&NodeId::ROOT).unwrap_err(),
            Error::InvalidOperation(_)
        ));
    }

    #[test]
    fn set_attributes_on_tombstone_still_emits() {
        let mut tree = store(b"a");
        let app = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("a"))
            .unwrap();
        let app_id = app.created().unwrap().clone();
        tree.delete_node(&app_id).unwrap();

        let commit = tree
            .set_attributes(&app_id, [("description", "gone")])
            .unwrap();
        assert_eq!(commit.ops.len(), 1);
        assert!(commit.changes.is_empty());
        assert!(tree.is_tombstoned(&app_id));
        assert!(tree.snapshot().applications.is_empty());
    }

    #[test]
    fn released_operations_apply_in_dependency_order() {
        let mut tree = store(b"local");
        let r = ReplicaId::new(b"r");
        let app = Operation::create(&r, 1, 1, NodeKind::Application, NodeId::ROOT, name("a"));
        let app_id = app.kind.node().clone();
        let topic = Operation::create(&r, 2, 2, NodeKind::Topic, app_id.clone(), name("t"));
        let topic_id = topic.kind.node().clone();
        let rename = Operation::set_attr(&r, 3, 3, topic_id.clone(), "name", "t2");

        let delta = tree.apply_remote(rename).unwrap();
        assert_eq!(delta.buffered, 1);
        let delta = tree.apply_remote(topic).unwrap();
        assert_eq!(delta.buffered, 1);
        assert_eq!(tree.pending_len(), 2);

        let delta = tree.apply_remote(app).unwrap();
        assert_eq!(delta.applied, 3);
        assert_eq!(tree.pending_len(), 0);
        assert_eq!(tree.attribute(&topic_id, "name").as_deref(), Some("t2"));
        tree.validate_invariants().unwrap();
    }

    #[test]
    fn parked_duplicates_are_ignored() {
        let mut tree = store(b"local");
        let r = ReplicaId::new(b"r");
        let app_id = NodeId::new(&r, 1);
        let rename = Operation::set_attr(&r, 2, 2, app_id, "name", "x");
        tree.apply_remote(rename.clone()).unwrap();
        let delta = tree.apply_remote(rename).unwrap();
        assert_eq!(delta.duplicates, 1);
        assert_eq!(tree.pending_len(), 1);
    }

    #[test]
    fn malformed_remote_operations_are_rejected() {
        let mut tree = store(b"local");
        let r = ReplicaId::new(b"r");

        let wrong_stamp = Operation {
            meta: crate::ops::OperationMetadata {
                id: OperationId::new(&r, 1),
                lamport: 4,
            },
            kind: OperationKind::Create {
                node: NodeId::new(&r, 3),
                kind: NodeKind::Application,
                parent: NodeId::ROOT,
                attributes: vec![],
            },
        };
        assert!(matches!(
            tree.apply_remote(wrong_stamp),
            Err(Error::MalformedOperation(_))
        ));

        let topic_under_root = Operation::create(&r, 2, 2, NodeKind::Topic, NodeId::ROOT, vec![]);
        assert!(matches!(
            tree.apply_remote(topic_under_root),
            Err(Error::MalformedOperation(_))
        ));

        let delete_root = Operation::delete(&r, 3, 3, NodeId::ROOT);
        assert!(matches!(
            tree.apply_remote(delete_root),
            Err(Error::MalformedOperation(_))
        ));

        let dup_keys = Operation::create(
            &r,
            4,
            4,
            NodeKind::Application,
            NodeId::ROOT,
            vec![("name".into(), "a".into()), ("name".into(), "b".into())],
        );
        assert!(matches!(
            tree.apply_remote(dup_keys),
            Err(Error::MalformedOperation(_))
        ));

        assert_eq!(tree.node_count(), 1);
        assert!(tree.state_vector().is_empty());
    }

    #[test]
    fn batch_drops_only_the_bad_operation() {
        let mut tree = store(b"local");
        let r = ReplicaId::new(b"r");
        let good = Operation::create(&r, 1, 1, NodeKind::Application, NodeId::ROOT, name("a"));
        let bad = Operation::delete(&r, 2, 2, NodeId::ROOT);
        let also_good = Operation::set_attr(&r, 3, 3, good.kind.node().clone(), "name", "b");

        let delta = tree.apply_remote_batch(vec![good, bad, also_good]);
        assert_eq!(delta.applied, 2);
        assert_eq!(delta.rejected, 1);
        assert_eq!(tree.snapshot().applications[0].attributes.get("name"), Some("b"));
    }

    #[test]
    fn remote_clock_advances_local_ids() {
        let mut tree = store(b"a");
        let r = ReplicaId::new(b"r");
        tree.apply_remote(Operation::create(
            &r,
            1,
            40,
            NodeKind::Application,
            NodeId::ROOT,
            name("remote"),
        ))
        .unwrap();
        let local = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("local"))
            .unwrap();
        assert_eq!(local.created().unwrap().clock, 41);
        assert_eq!(local.ops[0].meta.id.counter, 1);
    }

    #[test]
    fn out_of_range_stamps_are_rejected() {
        let mut tree = store(b"local");
        let r = ReplicaId::new(b"r");

        let huge_clock = Operation::create(
            &r,
            1,
            u64::MAX,
            NodeKind::Application,
            NodeId::ROOT,
            name("far future"),
        );
        assert!(matches!(
            tree.apply_remote(huge_clock),
            Err(Error::MalformedOperation(_))
        ));
        let huge_counter = Operation::set_attr(&r, u64::MAX, 1, NodeId::new(&r, 5), "name", "x");
        assert!(matches!(
            tree.apply_remote(huge_counter),
            Err(Error::MalformedOperation(_))
        ));
        let app = Operation::create(&r, 2, 2, NodeKind::Application, NodeId::ROOT, name("a"));
        let app_id = app.kind.node().clone();
        let near_max = Operation::set_attr(&r, u64::MAX - 1, 3, app_id, "name", "b");
        let delta = tree.apply_remote_batch(vec![app, near_max]);
        assert_eq!((delta.applied, delta.rejected), (1, 1));

        assert!(tree.operations().unwrap().iter().all(|op| op.meta.id.counter == 2));
        let local = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("local"))
            .unwrap();
        assert_eq!(local.created().unwrap().clock, 3);
        tree.validate_invariants().unwrap();
    }

    #[test]
    fn bootstrap_keeps_only_effective_writes() {
        let mut tree = store(b"a");
        let app = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("v1"))
            .unwrap();
        let app_id = app.created().unwrap().clone();
        tree.set_attributes(&app_id, [("name", "v2")]).unwrap();
        tree.set_attributes(&app_id, [("name", "v3")]).unwrap();
        tree.delete_node(&app_id).unwrap();
        tree.delete_node(&app_id).unwrap();

        let ops = tree.bootstrap_operations().unwrap();
        let kinds: Vec<&str> = ops.iter().map(|op| op.kind.name()).collect();
        assert_eq!(kinds, vec!["create", "set_attr", "delete"]);
        assert_eq!(tree.deleted_at(&app_id), Some(5));

        let mut fresh = store(b"b");
        fresh.apply_remote_batch(ops);
        fresh.absorb_state_vector(tree.state_vector()).unwrap();
        assert_eq!(fresh.snapshot(), tree.snapshot());
        assert_eq!(fresh.attribute(&app_id, "name").as_deref(), Some("v3"));
        assert!(fresh.state_vector().is_aware_of(tree.state_vector()));
    }

    #[test]
    fn replay_restores_state_and_counters() {
        let mut tree = store(b"a");
        let app = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("a"))
            .unwrap();
        let app_id = app.created().unwrap().clone();
        tree.create_node(&app_id, NodeKind::Topic, name("t"))
            .unwrap();
        let before = tree.snapshot();

        tree.replay_from_storage().unwrap();
        assert_eq!(tree.snapshot(), before);
        let next = tree
            .create_node(&NodeId::ROOT, NodeKind::Application, name("b"))
            .unwrap();
        assert_eq!(next.ops[0].meta.id.counter, 3);
        assert_eq!(next.created().unwrap().clock, 3);
    }

    #[test]
    fn replay_keeps_bootstrap_coverage() {
        let mut source = store(b"a");
        let app = source
            .create_node(&NodeId::ROOT, NodeKind::Application, name("v1"))
            .unwrap();
        let app_id = app.created().unwrap().clone();
        source.set_attributes(&app_id, [("name", "v2")]).unwrap();

        let mut fresh = store(b"b");
        fresh.apply_remote_batch(source.bootstrap_operations().unwrap());
        fresh.absorb_state_vector(source.state_vector()).unwrap();
        let before = fresh.state_vector().clone();

        fresh.replay_from_storage().unwrap();
        assert_eq!(fresh.state_vector(), &before);
        assert!(fresh.state_vector().is_aware_of(source.state_vector()));
    }
}
