use std::cmp::Ordering;

use crate::ids::{Lamport, NodeId, OperationId, ReplicaId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Node kinds allowed in the document tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum NodeKind {
    Root,
    Application,
    Topic,
}

impl NodeKind {
    /// The only kind a node of this kind may hang under.
    pub fn required_parent(self) -> Option<NodeKind> {
        match self {
            NodeKind::Root => None,
            NodeKind::Application => Some(NodeKind::Root),
            NodeKind::Topic => Some(NodeKind::Application),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Application => "application",
            NodeKind::Topic => "topic",
        }
    }
}

/// Metadata that accompanies every operation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OperationMetadata {
    pub id: OperationId,
    pub lamport: Lamport,
}

/// The tree mutations exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "op", rename_all = "snake_case"))]
pub enum OperationKind {
    /// Create a node. `node.clock` equals the operation's Lamport stamp.
    ///
    /// Initial attributes are treated like `SetAttr` writes stamped with the
    /// create's `(lamport, replica)`, in the listed order.
    Create {
        node: NodeId,
        kind: NodeKind,
        parent: NodeId,
        attributes: Vec<(String, String)>,
    },
    /// Last-writer-wins write of a single attribute, ordered by
    /// `(lamport, replica)` per `(node, key)`.
    SetAttr {
        node: NodeId,
        key: String,
        value: String,
    },
    /// Tombstone the node. Never physically removes it.
    Delete { node: NodeId },
}

/// Full operation envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Operation {
    pub meta: OperationMetadata,
    pub kind: OperationKind,
}

impl Operation {
    pub fn create(
        replica: &ReplicaId,
        counter: u64,
        lamport: Lamport,
        kind: NodeKind,
        parent: NodeId,
        attributes: Vec<(String, String)>,
    ) -> Self {
        Self {
            meta: OperationMetadata {
                id: OperationId::new(replica, counter),
                lamport,
            },
            kind: OperationKind::Create {
                node: NodeId::new(replica, lamport),
                kind,
                parent,
                attributes,
            },
        }
    }

    pub fn set_attr(
        replica: &ReplicaId,
        counter: u64,
        lamport: Lamport,
        node: NodeId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            meta: OperationMetadata {
                id: OperationId::new(replica, counter),
                lamport,
            },
            kind: OperationKind::SetAttr {
                node,
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn delete(replica: &ReplicaId, counter: u64, lamport: Lamport, node: NodeId) -> Self {
        Self {
            meta: OperationMetadata {
                id: OperationId::new(replica, counter),
                lamport,
            },
            kind: OperationKind::Delete { node },
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.meta.id.replica
    }

    /// `(lamport, replica)` stamp used for last-writer-wins decisions.
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.meta.lamport, self.replica())
    }
}

impl OperationKind {
    pub fn node(&self) -> &NodeId {
        match self {
            OperationKind::Create { node, .. }
            | OperationKind::SetAttr { node, .. }
            | OperationKind::Delete { node } => node,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Create { .. } => "create",
            OperationKind::SetAttr { .. } => "set_attr",
            OperationKind::Delete { .. } => "delete",
        }
    }
}

/// Total order over writes: higher clock wins, equal clocks fall back to the
/// higher replica id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stamp {
    pub lamport: Lamport,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(lamport: Lamport, replica: &ReplicaId) -> Self {
        Self {
            lamport,
            replica: replica.clone(),
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.lamport, &self.replica).cmp(&(other.lamport, &other.replica))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical ordering for operation ids used throughout the core.
pub fn cmp_op_key(
    a_lamport: Lamport,
    a_replica: &[u8],
    a_counter: u64,
    b_lamport: Lamport,
    b_replica: &[u8],
    b_counter: u64,
) -> Ordering {
    (a_lamport, a_replica, a_counter).cmp(&(b_lamport, b_replica, b_counter))
}

/// Canonical ordering for full operations.
pub fn cmp_ops(a: &Operation, b: &Operation) -> Ordering {
    cmp_op_key(
        a.meta.lamport,
        a.meta.id.replica.as_bytes(),
        a.meta.id.counter,
        b.meta.lamport,
        b.meta.id.replica.as_bytes(),
        b.meta.id.counter,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_derives_node_id_from_stamp() {
        let replica = ReplicaId::new(b"a");
        let op = Operation::create(&replica, 1, 7, NodeKind::Application, NodeId::ROOT, vec![]);
        assert_eq!(op.kind.node(), &NodeId::new(&replica, 7));
        assert_eq!(op.kind.name(), "create");
    }

    #[test]
    fn stamps_break_ties_by_replica() {
        let low = Stamp::new(5, &ReplicaId::new(b"a"));
        let high = Stamp::new(5, &ReplicaId::new(b"b"));
        let later = Stamp::new(6, &ReplicaId::new(b"a"));
        assert!(low < high);
        assert!(high < later);
    }

    #[test]
    fn ops_sort_by_lamport_then_id() {
        let a = Operation::delete(&ReplicaId::new(b"a"), 2, 3, NodeId::ROOT);
        let b = Operation::delete(&ReplicaId::new(b"b"), 1, 3, NodeId::ROOT);
        let c = Operation::delete(&ReplicaId::new(b"a"), 1, 1, NodeId::ROOT);
        let mut ops = vec![a.clone(), b.clone(), c.clone()];
        ops.sort_by(cmp_ops);
        assert_eq!(ops, vec![c, a, b]);
    }

    #[test]
    fn kind_hierarchy() {
        assert_eq!(NodeKind::Topic.required_parent(), Some(NodeKind::Application));
        assert_eq!(NodeKind::Application.required_parent(), Some(NodeKind::Root));
        assert_eq!(NodeKind::Root.required_parent(), None);
    }
}
