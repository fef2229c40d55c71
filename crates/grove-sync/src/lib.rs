// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Graph synchronization engine.
//!
//! Pure algorithms over the store contracts: reachability-closed pulls,
//! validated atomic pushes, and the tag-change deltas that back watch
//! streams. Nothing here touches a channel — the service and client crates
//! move the resulting [`Graph`] messages.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use grove_proto::{Graph, TagBundle};
use grove_store::{Key, KeyStore, StoreError, Tag, TagStore};

/// Errors raised while validating a push. A failed push is rejected
/// atomically: the stores are untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// An edge endpoint is neither in the pushed graph nor already stored.
    #[error("[BROKEN_CLOSURE] edge endpoint {0} is neither in the pushed graph nor on this node")]
    BrokenClosure(Key),

    /// The pushed edges contain a cycle among the new nodes.
    #[error("[PUSH_CYCLE] pushed graph contains a cycle")]
    PushCycle,

    /// A store-contract violation (inconsistent preds, dangling tag, ...).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Every key reachable from `seeds` through predecessor edges, the seeds
/// themselves included. Seeds absent from the store are skipped.
pub fn ancestors<KS: KeyStore>(keys: &KS, seeds: BTreeSet<Key>) -> BTreeSet<Key> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<Key> = seeds.into_iter().filter(|k| keys.contains(k)).collect();
    while let Some(k) = stack.pop() {
        if !seen.insert(k) {
            continue;
        }
        for p in keys.preds(&k) {
            if !seen.contains(&p) {
                stack.push(p);
            }
        }
    }
    seen
}

/// Breadth-first slice of the DAG under `roots`, stopping descent at any key
/// in `covered`.
///
/// Covered keys that are direct predecessors of an emitted node are kept in
/// `nodes` (with their incoming edges) so the graph message stays closed and
/// a receiver can re-add every node with its full predecessor set. Edges are
/// emitted in discovery order.
fn reachable_slice<KS: KeyStore>(
    keys: &KS,
    roots: &BTreeSet<Key>,
    covered: &BTreeSet<Key>,
) -> Graph {
    let mut visited: BTreeSet<Key> = BTreeSet::new();
    let mut boundary: BTreeSet<Key> = BTreeSet::new();
    let mut edges: Vec<(Key, Key)> = Vec::new();
    let mut queue: VecDeque<Key> = VecDeque::new();

    for root in roots {
        // Unknown roots are omitted, not an error.
        if keys.contains(root) && !covered.contains(root) && visited.insert(*root) {
            queue.push_back(*root);
        }
    }
    while let Some(k) = queue.pop_front() {
        for p in keys.preds(&k) {
            edges.push((k, p));
            if covered.contains(&p) {
                boundary.insert(p);
            } else if visited.insert(p) {
                queue.push_back(p);
            }
        }
    }

    let mut nodes = visited;
    nodes.extend(boundary);
    Graph { nodes, edges }
}

/// Compute the subgraph reachable from `roots` excluding everything already
/// reachable from the keys currently bound to any tag in `have`.
pub fn pull_keys<KS: KeyStore, TS: TagStore>(
    keys: &KS,
    tags: &TS,
    roots: &BTreeSet<Key>,
    have: &BTreeSet<Tag>,
) -> Graph {
    let mut have_heads = BTreeSet::new();
    for tag in have {
        have_heads.extend(tags.read(tag));
    }
    let covered = ancestors(keys, have_heads);
    reachable_slice(keys, roots, &covered)
}

/// Snapshot of every tag binding, in ascending tag order.
pub fn pull_tags<TS: TagStore>(tags: &TS) -> TagBundle {
    tags.list()
        .into_iter()
        .map(|tag| {
            let heads = tags.read(&tag);
            (tag, heads)
        })
        .collect()
}

/// Apply a pushed graph plus proposed tag bindings.
///
/// Validation runs to completion before any store mutation, which is what
/// makes rejection atomic:
/// 1. closure — every edge endpoint is in `graph.nodes` or already stored;
/// 2. consistency — a pushed node that already exists must restate its
///    stored predecessor set or push none at all;
/// 3. acyclicity — the new nodes admit a topological order;
/// 4. tag integrity — every proposed binding references a key that exists
///    now or arrives in this push.
///
/// New nodes are then inserted predecessors-first, and the tag bindings
/// applied last.
pub fn push_keys<KS: KeyStore, TS: TagStore>(
    keys: &mut KS,
    tags: &mut TS,
    graph: &Graph,
    updates: &TagBundle,
) -> Result<(), SyncError> {
    let mut pushed_preds: BTreeMap<Key, BTreeSet<Key>> =
        graph.nodes.iter().map(|k| (*k, BTreeSet::new())).collect();

    for (from, to) in &graph.edges {
        if !graph.nodes.contains(from) && !keys.contains(from) {
            return Err(SyncError::BrokenClosure(*from));
        }
        if !graph.nodes.contains(to) && !keys.contains(to) {
            return Err(SyncError::BrokenClosure(*to));
        }
        if let Some(preds) = pushed_preds.get_mut(from) {
            preds.insert(*to);
        } else if !keys.preds(from).contains(to) {
            // An edge out of an existing node may only restate what is stored.
            return Err(SyncError::Store(StoreError::InconsistentPredecessors {
                key: *from,
            }));
        }
    }

    let mut pending: BTreeSet<Key> = BTreeSet::new();
    for (k, preds) in &pushed_preds {
        if keys.contains(k) {
            if !preds.is_empty() && *preds != keys.preds(k) {
                return Err(SyncError::Store(StoreError::InconsistentPredecessors {
                    key: *k,
                }));
            }
        } else {
            pending.insert(*k);
        }
    }

    // Kahn's algorithm over the new nodes, taking ready keys in key order so
    // the insertion order is deterministic.
    let mut remaining: BTreeMap<Key, BTreeSet<Key>> = pending
        .iter()
        .map(|k| {
            let deps = pushed_preds
                .get(k)
                .map(|preds| preds.intersection(&pending).copied().collect())
                .unwrap_or_default();
            (*k, deps)
        })
        .collect();
    let mut order: Vec<Key> = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready: Vec<Key> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(k, _)| *k)
            .collect();
        if ready.is_empty() {
            return Err(SyncError::PushCycle);
        }
        for k in &ready {
            remaining.remove(k);
        }
        for deps in remaining.values_mut() {
            for k in &ready {
                deps.remove(k);
            }
        }
        order.extend(ready);
    }

    for (tag, heads) in updates {
        for k in heads {
            if !keys.contains(k) && !pending.contains(k) {
                return Err(SyncError::Store(StoreError::DanglingReference {
                    tag: tag.clone(),
                    key: *k,
                }));
            }
        }
    }

    // Validation is complete; nothing below can fail.
    for k in &order {
        let preds = pushed_preds.get(k).cloned().unwrap_or_default();
        keys.add(*k, &preds)?;
    }
    for (tag, heads) in updates {
        tags.update(tag.clone(), heads.clone());
    }
    Ok(())
}

/// Apply a bundle of tag bindings in one critical section, validating every
/// referenced key first.
pub fn push_tags<KS: KeyStore, TS: TagStore>(
    keys: &KS,
    tags: &mut TS,
    updates: &TagBundle,
) -> Result<(), SyncError> {
    for (tag, heads) in updates {
        for k in heads {
            if !keys.contains(k) {
                return Err(SyncError::Store(StoreError::DanglingReference {
                    tag: tag.clone(),
                    key: *k,
                }));
            }
        }
    }
    for (tag, heads) in updates {
        tags.update(tag.clone(), heads.clone());
    }
    Ok(())
}

/// Compute one watch frame: the subset of `watched` whose bindings differ
/// from `announced`, plus the subgraph newly reachable relative to the
/// announced heads. `None` when nothing changed.
pub fn watch_delta<KS: KeyStore, TS: TagStore>(
    keys: &KS,
    tags: &TS,
    watched: &BTreeSet<Tag>,
    announced: &BTreeMap<Tag, BTreeSet<Key>>,
) -> Option<(BTreeSet<Tag>, Graph)> {
    let mut changed = BTreeSet::new();
    let mut new_heads = BTreeSet::new();
    let mut old_heads = BTreeSet::new();
    for tag in watched {
        let current = tags.read(tag);
        let before = announced.get(tag).cloned().unwrap_or_default();
        old_heads.extend(before.iter().copied());
        if current != before {
            changed.insert(tag.clone());
            new_heads.extend(current);
        }
    }
    if changed.is_empty() {
        return None;
    }
    let covered = ancestors(keys, old_heads);
    Some((changed, reachable_slice(keys, &new_heads, &covered)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use grove_store::{key_of, KeyStore, MemoryKeyStore, MemoryTagStore, TagStore, ValueStore};

    fn k(n: u8) -> Key {
        key_of(&[n])
    }

    fn tag(name: &str) -> Tag {
        Tag::new(name).unwrap()
    }

    /// k1 ← k2 ← k3, plus k4 off k1 on a side branch.
    fn diamond() -> MemoryKeyStore {
        let mut keys = MemoryKeyStore::new();
        keys.add(k(1), &BTreeSet::new()).unwrap();
        keys.add(k(2), &BTreeSet::from([k(1)])).unwrap();
        keys.add(k(3), &BTreeSet::from([k(2)])).unwrap();
        keys.add(k(4), &BTreeSet::from([k(1)])).unwrap();
        keys
    }

    // ── 1. ancestors walks the closure, seeds included ──────────────────

    #[test]
    fn ancestors_includes_seeds_and_closure() {
        let keys = diamond();
        assert_eq!(
            ancestors(&keys, BTreeSet::from([k(3)])),
            BTreeSet::from([k(1), k(2), k(3)])
        );
        // Unknown seeds are skipped.
        assert!(ancestors(&keys, BTreeSet::from([k(9)])).is_empty());
    }

    // ── 2. pull with no have returns the full closure ───────────────────

    #[test]
    fn pull_full_closure() {
        let keys = diamond();
        let tags = MemoryTagStore::new();
        let graph = pull_keys(&keys, &tags, &BTreeSet::from([k(3)]), &BTreeSet::new());
        assert_eq!(graph.nodes, BTreeSet::from([k(1), k(2), k(3)]));
        assert_eq!(graph.edges, vec![(k(3), k(2)), (k(2), k(1))]);
        assert!(graph.is_closed());
    }

    // ── 3. pull excludes everything covered by have ─────────────────────

    #[test]
    fn pull_stops_at_have_frontier() {
        let keys = diamond();
        let mut tags = MemoryTagStore::new();
        tags.update(tag("main"), BTreeSet::from([k(2)]));

        let graph = pull_keys(
            &keys,
            &tags,
            &BTreeSet::from([k(3)]),
            &BTreeSet::from([tag("main")]),
        );
        // k3 is new; the boundary edge into the have head k2 is kept so the
        // message stays closed, but descent stops there.
        assert_eq!(graph.nodes, BTreeSet::from([k(2), k(3)]));
        assert_eq!(graph.edges, vec![(k(3), k(2))]);
        assert!(!graph.nodes.contains(&k(1)));
    }

    // ── 4. pull minimality: have-only history never appears ─────────────

    #[test]
    fn pull_omits_have_only_history() {
        let keys = diamond();
        let mut tags = MemoryTagStore::new();
        tags.update(tag("side"), BTreeSet::from([k(4)]));

        // Pulling k3 while holding the side branch must not ship k4.
        let graph = pull_keys(
            &keys,
            &tags,
            &BTreeSet::from([k(3)]),
            &BTreeSet::from([tag("side")]),
        );
        assert!(!graph.nodes.contains(&k(4)));
        // k1 is covered (ancestor of the side head) so it appears only as a
        // boundary node, never descended past.
        assert_eq!(graph.nodes, BTreeSet::from([k(1), k(2), k(3)]));
        assert_eq!(graph.edges, vec![(k(3), k(2)), (k(2), k(1))]);
    }

    // ── 5. unknown roots are omitted ────────────────────────────────────

    #[test]
    fn pull_omits_unknown_roots() {
        let keys = diamond();
        let tags = MemoryTagStore::new();
        let graph = pull_keys(
            &keys,
            &tags,
            &BTreeSet::from([k(3), k(42)]),
            &BTreeSet::new(),
        );
        assert!(!graph.nodes.contains(&k(42)));
        assert!(graph.nodes.contains(&k(3)));
    }

    // ── 6. push then pull round-trip onto an empty node ─────────────────

    #[test]
    fn push_populates_empty_node() {
        let mut keys = MemoryKeyStore::new();
        let mut tags = MemoryTagStore::new();
        let graph = Graph {
            nodes: BTreeSet::from([k(1), k(2)]),
            edges: vec![(k(2), k(1))],
        };
        let updates = vec![(tag("main"), BTreeSet::from([k(2)]))];
        push_keys(&mut keys, &mut tags, &graph, &updates).unwrap();

        assert_eq!(keys.preds(&k(2)), BTreeSet::from([k(1)]));
        assert_eq!(keys.preds(&k(1)), BTreeSet::new());
        assert_eq!(tags.read(&tag("main")), BTreeSet::from([k(2)]));

        let pulled = pull_keys(&keys, &tags, &BTreeSet::from([k(2)]), &BTreeSet::new());
        assert_eq!(pulled.nodes, BTreeSet::from([k(1), k(2)]));
        assert_eq!(pulled.edges, vec![(k(2), k(1))]);
    }

    // ── 7. push closure violation is rejected with nothing applied ──────

    #[test]
    fn push_rejects_broken_closure() {
        let mut keys = MemoryKeyStore::new();
        let mut tags = MemoryTagStore::new();
        let graph = Graph {
            nodes: BTreeSet::from([k(2)]),
            edges: vec![(k(2), k(1))], // k1 nowhere to be found
        };
        let err = push_keys(&mut keys, &mut tags, &graph, &Vec::new()).unwrap_err();
        assert_eq!(err, SyncError::BrokenClosure(k(1)));
        assert!(keys.is_empty());
    }

    // ── 8. push cycle is rejected atomically ────────────────────────────

    #[test]
    fn push_rejects_cycle() {
        let mut keys = MemoryKeyStore::new();
        let mut tags = MemoryTagStore::new();
        let graph = Graph {
            nodes: BTreeSet::from([k(1), k(2)]),
            edges: vec![(k(2), k(1)), (k(1), k(2))],
        };
        let updates = vec![(tag("main"), BTreeSet::from([k(2)]))];
        let err = push_keys(&mut keys, &mut tags, &graph, &updates).unwrap_err();
        assert_eq!(err, SyncError::PushCycle);
        assert!(keys.is_empty());
        assert!(tags.read(&tag("main")).is_empty());
    }

    // ── 9. push dangling tag binding is rejected atomically ─────────────

    #[test]
    fn push_rejects_dangling_tag() {
        let mut keys = MemoryKeyStore::new();
        let mut tags = MemoryTagStore::new();
        let graph = Graph {
            nodes: BTreeSet::from([k(1)]),
            edges: vec![],
        };
        let updates = vec![(tag("main"), BTreeSet::from([k(7)]))];
        let err = push_keys(&mut keys, &mut tags, &graph, &updates).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(StoreError::DanglingReference { .. })
        ));
        // Rejection is atomic: the graph nodes were not inserted either.
        assert!(keys.is_empty());
    }

    // ── 10. re-push of known nodes is idempotent ────────────────────────

    #[test]
    fn push_is_idempotent_for_known_nodes() {
        let mut keys = diamond();
        let mut tags = MemoryTagStore::new();
        let graph = Graph {
            nodes: BTreeSet::from([k(1), k(2)]),
            edges: vec![(k(2), k(1))],
        };
        push_keys(&mut keys, &mut tags, &graph, &Vec::new()).unwrap();
        assert_eq!(keys.preds(&k(2)), BTreeSet::from([k(1)]));

        // Boundary-style push: node present, no edges shipped.
        let bare = Graph {
            nodes: BTreeSet::from([k(2)]),
            edges: vec![],
        };
        push_keys(&mut keys, &mut tags, &bare, &Vec::new()).unwrap();
        assert_eq!(keys.preds(&k(2)), BTreeSet::from([k(1)]));
    }

    // ── 11. re-push with conflicting preds is rejected ──────────────────

    #[test]
    fn push_rejects_conflicting_preds() {
        let mut keys = diamond();
        let mut tags = MemoryTagStore::new();
        let graph = Graph {
            nodes: BTreeSet::from([k(3), k(4)]),
            edges: vec![(k(3), k(4))], // server has preds(k3) = {k2}
        };
        let err = push_keys(&mut keys, &mut tags, &graph, &Vec::new()).unwrap_err();
        assert_eq!(
            err,
            SyncError::Store(StoreError::InconsistentPredecessors { key: k(3) })
        );
    }

    // ── 12. push_tags validates then applies in bulk ────────────────────

    #[test]
    fn push_tags_bulk_update() {
        let keys = diamond();
        let mut tags = MemoryTagStore::new();
        let updates = vec![
            (tag("main"), BTreeSet::from([k(3)])),
            (tag("side"), BTreeSet::from([k(4)])),
        ];
        push_tags(&keys, &mut tags, &updates).unwrap();
        assert_eq!(tags.read(&tag("main")), BTreeSet::from([k(3)]));
        assert_eq!(tags.read(&tag("side")), BTreeSet::from([k(4)]));

        let bad = vec![
            (tag("main"), BTreeSet::from([k(1)])),
            (tag("oops"), BTreeSet::from([k(9)])),
        ];
        assert!(push_tags(&keys, &mut tags, &bad).is_err());
        // First binding of the rejected bundle must not have landed.
        assert_eq!(tags.read(&tag("main")), BTreeSet::from([k(3)]));
    }

    // ── 13. pull_tags snapshots in tag order ────────────────────────────

    #[test]
    fn pull_tags_snapshot() {
        let mut tags = MemoryTagStore::new();
        tags.update(tag("zeta"), BTreeSet::from([k(1)]));
        tags.update(tag("alpha"), BTreeSet::from([k(2)]));
        let bundle = pull_tags(&tags);
        let names: Vec<&str> = bundle.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    // ── 14. watch delta reports changed tags and the new slice ──────────

    #[test]
    fn watch_delta_reports_new_reachability() {
        let mut keys = diamond();
        let mut tags = MemoryTagStore::new();
        tags.update(tag("main"), BTreeSet::from([k(2)]));

        let watched = BTreeSet::from([tag("main"), tag("other")]);
        let mut announced = BTreeMap::new();
        announced.insert(tag("main"), BTreeSet::from([k(2)]));

        // No change yet.
        assert!(watch_delta(&keys, &tags, &watched, &announced).is_none());

        // Advance main to a new commit k5 on top of k3.
        keys.add(k(5), &BTreeSet::from([k(3)])).unwrap();
        tags.update(tag("main"), BTreeSet::from([k(5)]));

        let (changed, graph) = watch_delta(&keys, &tags, &watched, &announced).unwrap();
        assert_eq!(changed, BTreeSet::from([tag("main")]));
        // Relative to the announced head k2: new nodes are k5, k3, with the
        // boundary at k2.
        assert!(graph.nodes.contains(&k(5)));
        assert!(graph.nodes.contains(&k(3)));
        assert!(!graph.nodes.contains(&k(1)));
        assert_eq!(graph.edges, vec![(k(5), k(3)), (k(3), k(2))]);
    }

    // ── 15. DAG property: any valid add sequence stays acyclic ──────────

    #[test]
    fn valid_adds_never_cycle() {
        // Build a randomish layered DAG; every add draws preds from earlier
        // layers only, so each must succeed, and a later back-edge must fail.
        let mut keys = MemoryKeyStore::new();
        let mut values = grove_store::MemoryValueStore::new();
        let mut layers: Vec<Vec<Key>> = Vec::new();
        for layer in 0..4u8 {
            let mut this_layer = Vec::new();
            for n in 0..3u8 {
                let key = values.write(&[layer, n]);
                let preds: BTreeSet<Key> = layers
                    .last()
                    .map(|prev| prev.iter().copied().collect())
                    .unwrap_or_default();
                keys.add(key, &preds).unwrap();
                this_layer.push(key);
            }
            layers.push(this_layer);
        }
        let bottom = layers[0][0];
        let top = layers[3][0];
        let err = keys.add(bottom, &BTreeSet::from([top]));
        assert!(matches!(err, Err(StoreError::CycleDetected { .. })));
    }
}
