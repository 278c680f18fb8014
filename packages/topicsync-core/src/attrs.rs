//! Per-key last-writer-wins attribute registers.

use std::collections::HashMap;

use crate::ops::Stamp;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
struct Register {
    value: String,
    stamp: Stamp,
    /// Smallest `(stamp, slot)` that ever wrote this key. Fixes the key's
    /// position independently of delivery order.
    origin: (Stamp, u32),
}

/// Attribute map of a node: unique string keys, each an LWW register.
///
/// Iteration order is insertion order as seen by the whole system, i.e. keys
/// sort by the first write that introduced them. Two replicas holding the same
/// writes iterate identically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeMap {
    registers: HashMap<String, Register>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one write. `slot` orders keys introduced by the same operation
    /// (create attributes keep their listed order). Returns `true` when the
    /// visible value changed.
    pub fn write(&mut self, key: &str, value: &str, stamp: &Stamp, slot: u32) -> bool {
        match self.registers.get_mut(key) {
            Some(register) => {
                let origin = (stamp.clone(), slot);
                if origin < register.origin {
                    register.origin = origin;
                }
                if *stamp <= register.stamp {
                    return false;
                }
                let changed = register.value != value;
                register.value = value.to_string();
                register.stamp = stamp.clone();
                changed
            }
            None => {
                self.registers.insert(
                    key.to_string(),
                    Register {
                        value: value.to_string(),
                        stamp: stamp.clone(),
                        origin: (stamp.clone(), slot),
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.registers.get(key).map(|r| r.value.as_str())
    }

    /// Stamp of the write currently holding `key`.
    pub fn stamp(&self, key: &str) -> Option<&Stamp> {
        self.registers.get(key).map(|r| &r.stamp)
    }

    /// Stamp of the write that first introduced `key`; fixes its position.
    pub fn origin(&self, key: &str) -> Option<&Stamp> {
        self.registers.get(key).map(|r| &r.origin.0)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Keys and values in their converged order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut entries: Vec<(&String, &Register)> = self.registers.iter().collect();
        entries.sort_by(|a, b| (&a.1.origin, a.0).cmp(&(&b.1.origin, b.0)));
        entries
            .into_iter()
            .map(|(k, r)| (k.as_str(), r.value.as_str()))
    }

    pub fn to_pairs(&self) -> Attributes {
        Attributes(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Materialized, ordered attribute list as exposed in snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Attributes(pub Vec<(String, String)>);

impl Attributes {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
