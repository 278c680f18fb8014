//! State-vector exchange run on every (re)connection.
//!
//! The requester sends the ids it has applied. The responder answers with the
//! operations the requester lacks plus its own vector, so the requester can
//! push back whatever the responder lacks. An empty request vector asks for a
//! bootstrap: the compacted history instead of the raw log.

use crate::error::Result;
use crate::ops::Operation;
use crate::traits::{Clock, Storage};
use crate::tree::{ApplyDelta, TreeStore};
use crate::version_vector::VersionVector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResyncRequest {
    pub state_vector: VersionVector,
}

impl ResyncRequest {
    /// Request the full compacted history.
    pub fn bootstrap() -> Self {
        Self::default()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.state_vector.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResyncResponse {
    pub operations: Vec<Operation>,
    pub state_vector: VersionVector,
    #[cfg_attr(feature = "serde", serde(default))]
    pub bootstrap: bool,
}

/// What applying a response did locally, and what the peer still needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResyncOutcome {
    pub delta: ApplyDelta,
    pub push_back: Vec<Operation>,
}

impl<S, C> TreeStore<S, C>
where
    S: Storage,
    C: Clock,
{
    pub fn resync_request(&self) -> ResyncRequest {
        ResyncRequest {
            state_vector: self.state_vector().clone(),
        }
    }

    /// Operations the requester is missing. Cost is bounded by the divergence
    /// unless a bootstrap was requested.
    pub fn answer_resync(&self, request: &ResyncRequest) -> Result<ResyncResponse> {
        let bootstrap = request.is_bootstrap();
        let operations = if bootstrap {
            self.bootstrap_operations()?
        } else {
            self.missing_operations(&request.state_vector)?
        };
        tracing::debug!(
            bootstrap,
            count = operations.len(),
            "answering resync request"
        );
        Ok(ResyncResponse {
            operations,
            state_vector: self.state_vector().clone(),
            bootstrap,
        })
    }

    /// Merge a response. Malformed operations are dropped individually.
    pub fn apply_resync(&mut self, response: ResyncResponse) -> Result<ResyncOutcome> {
        let push_back = self.missing_operations(&response.state_vector)?;
        let delta = self.apply_remote_batch(response.operations);
        if response.bootstrap {
            // Compaction skipped superseded writes; their effects are present.
            self.absorb_state_vector(&response.state_vector)?;
        }
        Ok(ResyncOutcome { delta, push_back })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{NodeId, ReplicaId};
    use crate::ops::NodeKind;
    use crate::traits::{LamportClock, MemoryStorage};

    type Store = TreeStore<MemoryStorage, LamportClock>;

    fn store(replica: &[u8]) -> Store {
        TreeStore::new(
            ReplicaId::new(replica),
            MemoryStorage::default(),
            LamportClock::default(),
        )
    }

    fn app(store: &mut Store, name: &str) -> NodeId {
        store
            .create_node(
                &NodeId::ROOT,
                NodeKind::Application,
                vec![("name".into(), name.into())],
            )
            .unwrap()
            .created()
            .unwrap()
            .clone()
    }

    #[test]
    fn both_sides_exchange_what_the_other_lacks() {
        let mut a = store(b"a");
        let mut b = store(b"b");
        app(&mut a, "Nav");
        app(&mut b, "Radar");

        let response = b.answer_resync(&a.resync_request()).unwrap();
        assert!(!response.bootstrap);
        assert_eq!(response.operations.len(), 1);

        let outcome = a.apply_resync(response).unwrap();
        assert_eq!(outcome.delta.applied, 1);
        assert_eq!(outcome.push_back.len(), 1);

        b.apply_remote_batch(outcome.push_back);
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot().applications.len(), 2);
    }

    #[test]
    fn bootstrap_marks_compacted_ids_as_seen() {
        let mut a = store(b"a");
        let nav = app(&mut a, "Nav");
        a.set_attributes(&nav, [("name", "Nav2")]).unwrap();

        let mut fresh = store(b"c");
        let response = a.answer_resync(&ResyncRequest::bootstrap()).unwrap();
        assert!(response.bootstrap);
        assert_eq!(response.operations.len(), 2);
        fresh.apply_resync(response).unwrap();

        assert!(fresh.state_vector().is_aware_of(a.state_vector()));
        let again = a.answer_resync(&fresh.resync_request()).unwrap();
        assert!(again.operations.is_empty());
    }
}
