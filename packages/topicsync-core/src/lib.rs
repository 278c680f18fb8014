#![forbid(unsafe_code)]
//! Replicated Application/Topic document for collaborative topic editing.
//!
//! The tree converges under concurrent, duplicated and out-of-order delivery.
//! Presence and the resync handshake ride alongside it. Nothing here does I/O;
//! transports and the relay live in `topicsync-net`.

pub mod attrs;
pub mod awareness;
#[cfg(feature = "serde")]
pub mod codec;
pub mod document;
pub mod error;
pub mod events;
pub mod ids;
pub mod ops;
pub mod resync;
pub mod snapshot;
pub mod traits;
pub mod tree;
pub mod version_vector;

pub use attrs::{AttributeMap, Attributes};
pub use awareness::{
    color_for, default_display_name, AwarenessChange, AwarenessManager, AwarenessState,
    AwarenessUpdate, Selection, COLOR_PALETTE,
};
#[cfg(feature = "serde")]
pub use codec::{decode_operations, DecodedBatch, Envelope, MessageKind};
pub use document::{DeletePolicy, Direction, Document, TopicStore};
pub use error::{Error, Result};
pub use events::{ChangeBatch, ChangeKind, ChangeOrigin, NodeChange, SubscriptionId, Subscribers};
pub use ids::{IdGenerator, Lamport, NodeId, OperationId, ReplicaId};
pub use ops::{cmp_op_key, cmp_ops, NodeKind, Operation, OperationKind, OperationMetadata, Stamp};
pub use resync::{ResyncOutcome, ResyncRequest, ResyncResponse};
pub use snapshot::{ApplicationSnapshot, TopicSnapshot, TreeSnapshot, ROOT_VERSION, ROOT_XMLNS};
pub use traits::{Clock, LamportClock, MemoryStorage, Storage};
pub use tree::{ApplyDelta, Commit, TreeStore};
pub use version_vector::VersionVector;
