use std::cmp::Ordering;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Lamport timestamp used for causal ordering of operations and node identity.
pub type Lamport = u64;

/// Unique identifier for a live client session. Backed by raw bytes so hosts can
/// bring their own identity format; compared bytewise.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct ReplicaId(pub Vec<u8>);

impl ReplicaId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Fresh random replica id (UUID v4 bytes) for a new session.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for b in &self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() % 2 != 0 {
            return None;
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.to_hex())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl Serialize for ReplicaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for ReplicaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ReplicaId::from_hex(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid replica id `{raw}`")))
    }
}

/// Identity of a tree node: the creating replica plus the Lamport clock of the
/// create operation. Immutable for the node's whole life, tombstones included.
///
/// Ordered by clock first, then replica, which is also the sibling order under
/// a shared parent.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId {
    pub clock: Lamport,
    pub replica: ReplicaId,
}

impl NodeId {
    /// The document root. Exists on every replica from initialization.
    pub const ROOT: NodeId = NodeId {
        clock: 0,
        replica: ReplicaId(Vec::new()),
    };

    pub fn new(replica: &ReplicaId, clock: Lamport) -> Self {
        Self {
            clock,
            replica: replica.clone(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.clock == 0 && self.replica.is_empty()
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.clock, &self.replica).cmp(&(other.clock, &other.replica))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "{}@{}", self.clock, self.replica)
        }
    }
}

/// Globally unique identifier for an operation: the issuing replica and its
/// contiguous per-replica sequence number.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OperationId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OperationId {
    pub fn new(replica: &ReplicaId, counter: u64) -> Self {
        Self {
            replica: replica.clone(),
            counter,
        }
    }
}

/// Hands out node identities and operation ids for one replica.
///
/// The counter is contiguous per replica so state vectors never see false
/// holes. Lamport stamps come from the store's clock, not from here.
#[derive(Clone, Debug)]
pub struct IdGenerator {
    replica: ReplicaId,
    counter: u64,
}

impl IdGenerator {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            counter: 0,
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn next_operation_id(&mut self) -> OperationId {
        self.counter += 1;
        OperationId::new(&self.replica, self.counter)
    }

    /// Resume after replaying persisted history issued by this same replica.
    pub fn resume_from(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_order_by_clock_then_replica() {
        let a1 = NodeId::new(&ReplicaId::new(b"a"), 1);
        let b1 = NodeId::new(&ReplicaId::new(b"b"), 1);
        let a2 = NodeId::new(&ReplicaId::new(b"a"), 2);

        let mut ids = vec![a2.clone(), b1.clone(), a1.clone()];
        ids.sort();
        assert_eq!(ids, vec![a1, b1, a2]);
        assert!(NodeId::ROOT < NodeId::new(&ReplicaId::new(b"a"), 1));
    }

    #[test]
    fn replica_hex_roundtrips() {
        let replica = ReplicaId::new(vec![0x00, 0xab, 0x10]);
        assert_eq!(replica.to_hex(), "00ab10");
        assert_eq!(ReplicaId::from_hex("00ab10"), Some(replica));
        assert_eq!(ReplicaId::from_hex("abc"), None);
        assert_eq!(ReplicaId::from_hex("zz"), None);
    }

    #[test]
    fn random_replicas_are_distinct() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();
        assert_eq!(a.as_bytes().len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn generator_counts_contiguously() {
        let mut ids = IdGenerator::new(ReplicaId::new(b"r"));
        assert_eq!(ids.next_operation_id().counter, 1);
        assert_eq!(ids.next_operation_id().counter, 2);
        ids.resume_from(10);
        assert_eq!(ids.next_operation_id().counter, 11);
        ids.resume_from(3);
        assert_eq!(ids.counter(), 11);
    }
}
