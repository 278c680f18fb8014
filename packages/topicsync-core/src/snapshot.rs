//! Materialized, deterministic view of the document tree.

use crate::attrs::Attributes;
use crate::ids::NodeId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const ROOT_XMLNS: &str = "http://zeromq-topic-manager/schema";
pub const ROOT_VERSION: &str = "1.0";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TopicSnapshot {
    pub id: NodeId,
    pub attributes: Attributes,
}

impl TopicSnapshot {
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApplicationSnapshot {
    pub id: NodeId,
    pub attributes: Attributes,
    pub topics: Vec<TopicSnapshot>,
}

impl ApplicationSnapshot {
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name")
    }

    pub fn topic(&self, name: &str) -> Option<&TopicSnapshot> {
        self.topics.iter().find(|t| t.name() == Some(name))
    }
}

/// Root → Applications → Topics, live nodes only, siblings in `NodeId` order.
///
/// Two replicas that applied the same operations produce equal snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeSnapshot {
    pub xmlns: String,
    pub version: String,
    pub applications: Vec<ApplicationSnapshot>,
}

impl Default for TreeSnapshot {
    fn default() -> Self {
        Self {
            xmlns: ROOT_XMLNS.to_string(),
            version: ROOT_VERSION.to_string(),
            applications: Vec::new(),
        }
    }
}

impl TreeSnapshot {
    /// First live application carrying `name`.
    pub fn application(&self, name: &str) -> Option<&ApplicationSnapshot> {
        self.applications.iter().find(|a| a.name() == Some(name))
    }

    pub fn application_names(&self) -> Vec<&str> {
        self.applications.iter().filter_map(|a| a.name()).collect()
    }

    pub fn topic_count(&self) -> usize {
        self.applications.iter().map(|a| a.topics.len()).sum()
    }
}
