use crate::error::Result;
use crate::ids::Lamport;
use crate::ops::Operation;
use crate::version_vector::VersionVector;

/// Pluggable clock so hosts can swap in a hybrid logical clock.
pub trait Clock {
    fn tick(&mut self) -> Lamport;
    fn observe(&mut self, external: Lamport);
    fn now(&self) -> Lamport;
}

/// Append-only history of every applied operation. Safe to read while the
/// single writer appends; entries are never rewritten or removed.
pub trait Storage {
    fn append(&mut self, op: Operation) -> Result<()>;
    fn load_all(&self) -> Result<Vec<Operation>>;
    /// Operations whose id is not covered by `known`.
    fn load_missing(&self, known: &VersionVector) -> Result<Vec<Operation>>;
    fn len(&self) -> usize;
    /// Persist coverage learned from a compacted bootstrap, so a replay still
    /// knows about writes it never received individually.
    fn absorb(&mut self, known: &VersionVector) -> Result<()>;
    fn absorbed(&self) -> Result<VersionVector>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Basic Lamport clock implementation useful for tests and default flows.
#[derive(Clone, Debug, Default)]
pub struct LamportClock {
    counter: Lamport,
}

impl Clock for LamportClock {
    fn tick(&mut self) -> Lamport {
        self.counter = self.counter.saturating_add(1);
        self.counter
    }

    fn observe(&mut self, external: Lamport) {
        self.counter = self.counter.max(external);
    }

    fn now(&self) -> Lamport {
        self.counter
    }
}

/// In-memory vector-backed history.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    ops: Vec<Operation>,
    absorbed: VersionVector,
}

impl Storage for MemoryStorage {
    fn append(&mut self, op: Operation) -> Result<()> {
        self.ops.push(op);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Operation>> {
        Ok(self.ops.clone())
    }

    fn load_missing(&self, known: &VersionVector) -> Result<Vec<Operation>> {
        Ok(self
            .ops
            .iter()
            .filter(|op| !known.contains(&op.meta.id.replica, op.meta.id.counter))
            .cloned()
            .collect())
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn absorb(&mut self, known: &VersionVector) -> Result<()> {
        self.absorbed.merge(known);
        Ok(())
    }

    fn absorbed(&self) -> Result<VersionVector> {
        Ok(self.absorbed.clone())
    }
}
