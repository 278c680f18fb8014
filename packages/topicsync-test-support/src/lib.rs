//! Helpers shared by the convergence suites.

use topicsync_core::{
    LamportClock, MemoryStorage, NodeId, NodeKind, Operation, ReplicaId, TreeStore,
};

pub type MemoryTree = TreeStore<MemoryStorage, LamportClock>;

pub fn replica(name: &str) -> ReplicaId {
    ReplicaId::new(name.as_bytes())
}

pub fn tree(name: &str) -> MemoryTree {
    TreeStore::new(
        replica(name),
        MemoryStorage::default(),
        LamportClock::default(),
    )
}

pub fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Create an application named `name` and return its id with the operation.
pub fn create_app(tree: &mut MemoryTree, name: &str) -> (NodeId, Operation) {
    let commit = tree
        .create_node(&NodeId::ROOT, NodeKind::Application, attrs(&[("name", name)]))
        .expect("create application");
    let id = commit.created().expect("created id").clone();
    (id, commit.ops[0].clone())
}

pub fn create_topic(tree: &mut MemoryTree, app: &NodeId, name: &str) -> (NodeId, Operation) {
    let commit = tree
        .create_node(app, NodeKind::Topic, attrs(&[("name", name)]))
        .expect("create topic");
    let id = commit.created().expect("created id").clone();
    (id, commit.ops[0].clone())
}

/// All orderings of `items` (Heap's algorithm).
pub fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    fn heap_permute<T: Clone>(k: usize, items: &mut [T], out: &mut Vec<Vec<T>>) {
        if k <= 1 {
            out.push(items.to_vec());
            return;
        }
        heap_permute(k - 1, items, out);
        for i in 0..(k - 1) {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            heap_permute(k - 1, items, out);
        }
    }
    let mut out = Vec::new();
    let mut scratch = items.to_vec();
    heap_permute(scratch.len(), &mut scratch, &mut out);
    out
}

/// Apply `ops` to a fresh replica in the given order and return it.
pub fn replay(name: &str, ops: &[Operation]) -> MemoryTree {
    let mut fresh = tree(name);
    for op in ops {
        fresh.apply_remote(op.clone()).expect("apply remote");
    }
    fresh
}

/// Every replica pulls what it is missing from every other replica.
pub fn exchange_all(trees: &mut [MemoryTree]) {
    for i in 0..trees.len() {
        for j in 0..trees.len() {
            if i == j {
                continue;
            }
            let missing = trees[j]
                .missing_operations(trees[i].state_vector())
                .expect("missing operations");
            trees[i].apply_remote_batch(missing);
        }
    }
}
