// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Branch and snapshot surface over the Grove stores.
//!
//! A [`Database`] binds one default branch (a tag) over an in-memory node
//! and exposes the user-facing history operations: commit, snapshot,
//! revert, three-way merge of another branch, and per-path watch streams.
//! Change notification is local to the handle — remote watches go through
//! the sync protocol instead.

use std::collections::BTreeSet;
use std::sync::Arc;

use grove_merge::{merge, MergeError, Resolvers};
use grove_store::{Clock, Key, KeyStore, MemoryNode, StoreError, Tag, TagStore, ValueStore};
use tokio::sync::mpsc;

struct Watcher {
    path: String,
    tx: mpsc::UnboundedSender<(String, Key)>,
}

/// A lazy stream of `(path, new head key)` change events.
///
/// Cancel by dropping the stream; the database prunes the subscription on
/// its next notification.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<(String, Key)>,
}

impl WatchStream {
    /// Next change event, or `None` once the database is gone.
    pub async fn next(&mut self) -> Option<(String, Key)> {
        self.rx.recv().await
    }
}

/// A database handle: one node, one current branch.
pub struct Database {
    node: MemoryNode,
    branch: Tag,
    resolvers: Resolvers,
    clock: Clock,
    watchers: Vec<Watcher>,
}

impl Database {
    /// An empty database on `branch`.
    pub fn new(branch: Tag) -> Self {
        Self {
            node: MemoryNode::in_memory(),
            branch,
            resolvers: Resolvers::new(),
            clock: Clock::new(),
            watchers: Vec::new(),
        }
    }

    /// The current branch tag.
    pub fn branch(&self) -> &Tag {
        &self.branch
    }

    /// Switch the handle to another branch. The tag need not exist yet; the
    /// first commit on a fresh branch is a root commit.
    pub fn checkout(&mut self, branch: Tag) {
        self.branch = branch;
    }

    /// Bind `tag` to the current branch head, creating a second branch that
    /// shares history from this point.
    pub fn fork(&mut self, tag: Tag) -> Result<(), StoreError> {
        let heads = self.node.tags.read(&self.branch);
        self.node.tag_update(tag, heads)
    }

    /// The resolver table consulted by [`merge_branch`](Self::merge_branch).
    pub fn resolvers_mut(&mut self) -> &mut Resolvers {
        &mut self.resolvers
    }

    /// The handle's monotonic clock, for timestamping user-level entries.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Read access to the underlying stores.
    pub fn node(&self) -> &MemoryNode {
        &self.node
    }

    /// Write `bytes` as a new commit on the current branch and advance the
    /// branch head to it.
    ///
    /// Re-committing the value already at the head is a no-op.
    pub fn commit(&mut self, bytes: &[u8]) -> Result<Key, StoreError> {
        let key = self.node.values.write(bytes);
        let heads = self.node.tags.read(&self.branch);
        if heads.contains(&key) {
            return Ok(key);
        }
        self.node.keys.add(key, &heads)?;
        self.node
            .tag_update(self.branch.clone(), BTreeSet::from([key]))?;
        self.notify(key);
        Ok(key)
    }

    /// Snapshot the current branch: its head key, or `None` on an empty
    /// branch. If the branch holds several heads the least key is the
    /// deterministic representative.
    pub fn snapshot(&self) -> Option<Key> {
        self.node.tags.read(&self.branch).into_iter().next()
    }

    /// Read a value by key.
    pub fn read(&self, key: &Key) -> Option<Arc<[u8]>> {
        self.node.values.read(key)
    }

    /// Rebind the current branch to an earlier (or any known) key.
    pub fn revert(&mut self, key: Key) -> Result<(), StoreError> {
        if !self.node.keys.contains(&key) {
            return Err(StoreError::UnknownKey(key));
        }
        self.node
            .tag_update(self.branch.clone(), BTreeSet::from([key]))?;
        self.notify(key);
        Ok(())
    }

    /// Three-way merge of `other`'s head into the current branch, advancing
    /// the branch tag on success. The branch name is the resolver path.
    ///
    /// Merging an empty branch is a no-op; merging into an empty branch
    /// fast-forwards.
    pub fn merge_branch(&mut self, other: &Tag) -> Result<(), MergeError> {
        let Some(theirs) = self.node.tags.read(other).into_iter().next() else {
            return Ok(());
        };
        let merged = match self.snapshot() {
            None => theirs,
            Some(ours) => {
                let path = self.branch.as_str().to_owned();
                merge(
                    &mut self.node.keys,
                    &mut self.node.values,
                    &self.resolvers,
                    &path,
                    ours,
                    theirs,
                )?
            }
        };
        if self.snapshot() != Some(merged) {
            self.node
                .tag_update(self.branch.clone(), BTreeSet::from([merged]))?;
            self.notify(merged);
        }
        Ok(())
    }

    /// Subscribe to changes under `path`: every head change whose branch
    /// name starts with `path` emits `(branch, new head)`.
    pub fn watch(&mut self, path: impl Into<String>) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.push(Watcher {
            path: path.into(),
            tx,
        });
        WatchStream { rx }
    }

    fn notify(&mut self, key: Key) {
        let changed = self.branch.as_str().to_owned();
        self.watchers.retain(|w| {
            if changed.starts_with(&w.path) {
                w.tx.send((changed.clone(), key)).is_ok()
            } else {
                true
            }
        });
    }
}
