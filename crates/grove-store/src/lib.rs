// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed key/value/tag stores for Grove.
//!
//! `grove-store` defines the three store contracts at the heart of the data
//! plane — [`KeyStore`] (the predecessor DAG), [`ValueStore`] (content-addressed
//! blobs keyed by BLAKE3 hash), and [`TagStore`] (mutable branch heads) — plus
//! in-memory backends for each. Disk tiers plug in behind the same traits.
//!
//! # Hash Domain Policy
//!
//! A [`Key`] is content-only: `BLAKE3(bytes)` with no domain prefix. Two values
//! with identical bytes are the same value regardless of who wrote them —
//! deduplication is a feature, not a bug.
//!
//! # Determinism Invariant
//!
//! Every listing API (`KeyStore::list`, `TagStore::list`, predecessor sets)
//! returns a `BTreeSet`, so iteration order is the key/tag order and never the
//! backing map's. Store determinism is collection-level here, unlike the blob
//! tier where it is content-level.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod memory;
pub use memory::{MemoryKeyStore, MemoryTagStore, MemoryValueStore};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A 32-byte BLAKE3 content hash identifying one immutable value.
///
/// Thin newtype over `[u8; 32]`. The inner bytes are public for zero-cost
/// access; the `Display` impl renders lowercase hex for logging and error
/// messages. Keys order byte-wise, which is the canonical order used
/// everywhere sets of keys are serialized or listed.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// Length of a key in bytes.
    pub const LEN: usize = 32;

    /// View the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct a key from raw bytes (e.g. read off the wire).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Compute the content key of `bytes`.
///
/// No domain prefix — the content IS the identity. See module-level docs for
/// hash domain policy.
pub fn key_of(bytes: &[u8]) -> Key {
    let hash = blake3::hash(bytes);
    Key(*hash.as_bytes())
}

/// A human-readable name bound to a set of branch-head keys.
///
/// Tags are printable UTF-8, non-empty, and carry no embedded NUL or other
/// control characters. Validation happens at construction; a `Tag` in hand is
/// always well-formed, including ones decoded off the wire.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Tag(String);

impl Tag {
    /// Validate and construct a tag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTag`] if the name is empty or contains a
    /// control character (NUL included).
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StoreError::InvalidTag {
                reason: "tag name is empty",
            });
        }
        if name.chars().any(char::is_control) {
            return Err(StoreError::InvalidTag {
                reason: "tag name contains a control character",
            });
        }
        Ok(Self(name))
    }

    /// The tag name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors surfaced by the store contracts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// `add` named a predecessor that is not in the key store.
    #[error("[MISSING_PREDECESSOR] {missing} is not in the key store (adding {key})")]
    MissingPredecessor {
        /// The key being added.
        key: Key,
        /// The absent predecessor.
        missing: Key,
    },

    /// `add` would close a cycle in the predecessor graph.
    #[error("[CYCLE_DETECTED] adding {key} with predecessor {pred} would close a cycle")]
    CycleDetected {
        /// The key being added.
        key: Key,
        /// The predecessor the offending path runs through.
        pred: Key,
    },

    /// Re-`add` of a known key with a different predecessor set.
    #[error("[INCONSISTENT_PREDECESSORS] {key} is already present with a different predecessor set")]
    InconsistentPredecessors {
        /// The key being re-added.
        key: Key,
    },

    /// A tag binding referenced a key absent from the key store.
    #[error("[DANGLING_REFERENCE] tag {tag} references unknown key {key}")]
    DanglingReference {
        /// The tag being bound.
        tag: Tag,
        /// The unknown key.
        key: Key,
    },

    /// A key a caller expected to be present is absent.
    #[error("[UNKNOWN_KEY] {0} is not in the store")]
    UnknownKey(Key),

    /// A tag name failed validation.
    #[error("[INVALID_TAG] {reason}")]
    InvalidTag {
        /// Why the name was rejected.
        reason: &'static str,
    },
}

/// The predecessor DAG: each key maps to the set of its parent keys.
///
/// Keys are append-only — there is no removal in the contract. Absence is not
/// an error for reads ([`preds`](KeyStore::preds) of an unknown key is the
/// empty set), which keeps sync traversals robust against partial graphs.
pub trait KeyStore {
    /// Insert `key` with predecessor set `preds`.
    ///
    /// Idempotent: re-adding with an identical predecessor set is a no-op.
    ///
    /// # Errors
    ///
    /// In this order of precedence:
    /// - [`StoreError::MissingPredecessor`] if any predecessor is absent,
    /// - [`StoreError::CycleDetected`] if `key` equals or is an ancestor of
    ///   any predecessor,
    /// - [`StoreError::InconsistentPredecessors`] if `key` is present with a
    ///   different predecessor set.
    fn add(&mut self, key: Key, preds: &BTreeSet<Key>) -> Result<(), StoreError>;

    /// All known keys, in key order.
    fn list(&self) -> BTreeSet<Key>;

    /// The predecessor set of `key`, empty if `key` is absent.
    fn preds(&self, key: &Key) -> BTreeSet<Key>;

    /// Check presence without materializing the predecessor set.
    fn contains(&self, key: &Key) -> bool;
}

/// Content-addressed blob store: key → immutable value bytes.
pub trait ValueStore {
    /// Store `bytes` and return its content key.
    ///
    /// Writing an already-stored value is a no-op that returns the existing
    /// key.
    fn write(&mut self, bytes: &[u8]) -> Key;

    /// Retrieve a value by key. `None` if not stored — absence is not an
    /// error.
    fn read(&self, key: &Key) -> Option<Arc<[u8]>>;

    /// Check existence without retrieving.
    fn contains(&self, key: &Key) -> bool;
}

/// Mutable tag bindings: name → set of branch-head keys.
///
/// The trait itself is infallible; referential integrity against the key
/// store is enforced where the stores meet (see [`Node::tag_update`]).
pub trait TagStore {
    /// Atomically set the value of `tag` to `keys`.
    fn update(&mut self, tag: Tag, keys: BTreeSet<Key>);

    /// Delete the tag. No-op if absent.
    fn remove(&mut self, tag: &Tag);

    /// The keys bound to `tag`, empty if absent.
    fn read(&self, tag: &Tag) -> BTreeSet<Key>;

    /// All defined tags, in tag order.
    fn list(&self) -> BTreeSet<Tag>;
}

/// One logical store node: the three stores that move together.
///
/// `Node` is where cross-store integrity lives — the individual traits stay
/// primitive, and operations that need to see more than one store (tag
/// bindings referencing keys) go through here.
#[derive(Debug, Default)]
pub struct Node<K, V, T> {
    /// The predecessor DAG.
    pub keys: K,
    /// The content-addressed blob store.
    pub values: V,
    /// The tag bindings.
    pub tags: T,
}

impl<K: KeyStore, V: ValueStore, T: TagStore> Node<K, V, T> {
    /// Assemble a node from its three stores.
    pub fn from_parts(keys: K, values: V, tags: T) -> Self {
        Self { keys, values, tags }
    }

    /// Bind `tag` to `keys`, validating every key against the key store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DanglingReference`] naming the first absent key;
    /// the tag store is untouched on failure.
    pub fn tag_update(&mut self, tag: Tag, keys: BTreeSet<Key>) -> Result<(), StoreError> {
        if let Some(missing) = keys.iter().find(|k| !self.keys.contains(k)) {
            return Err(StoreError::DanglingReference {
                tag,
                key: *missing,
            });
        }
        self.tags.update(tag, keys);
        Ok(())
    }
}

/// A node backed entirely by the in-memory stores.
pub type MemoryNode = Node<MemoryKeyStore, MemoryValueStore, MemoryTagStore>;

impl MemoryNode {
    /// An empty in-memory node.
    pub fn in_memory() -> Self {
        Self::default()
    }
}

/// Monotonic logical clock for ordering user-level events.
///
/// A plain atomic counter; `tick` hands out strictly increasing values across
/// threads. Not a wall clock — callers that need real time bring their own.
#[derive(Debug, Default)]
pub struct Clock(AtomicU64);

impl Clock {
    /// A clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next timestamp.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
